use crate::config::MqttConf;
use crate::engine::EngineHandle;
use crate::models::StatusCounts;
use parking_lot::Mutex;
use rumqttc::{AsyncClient, MqttOptions, QoS};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task;
use tracing::{debug, warn};

pub const HEALTH_TOPIC: &str = "fleetwatch/kernel/health@v1";
const PUBLISH_EVERY: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FleetHealth {
    pub uptime_seconds: u64,
    pub terminals_tracked: u32,
    pub counts: StatusCounts,
    pub initial_fetch_done: bool,
    pub mqtt_status: String,
    pub mqtt_reconnects: u32,
}

#[derive(Clone)]
pub struct HealthTracker {
    start_time: Instant,
    mqtt_reconnects: Arc<AtomicU32>,
    mqtt_status: Arc<Mutex<String>>,
}

impl Default for HealthTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthTracker {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            mqtt_reconnects: Arc::new(AtomicU32::new(0)),
            mqtt_status: Arc::new(Mutex::new("connecting".to_string())),
        }
    }

    pub fn mark_mqtt_connected(&self) {
        *self.mqtt_status.lock() = "connected".to_string();
    }

    pub fn mark_mqtt_disconnected(&self) {
        *self.mqtt_status.lock() = "disconnected".to_string();
    }

    pub fn increment_reconnects(&self) {
        self.mqtt_reconnects.fetch_add(1, Ordering::Relaxed);
        *self.mqtt_status.lock() = "reconnecting".to_string();
    }

    pub fn get_health(&self, engine: &EngineHandle) -> FleetHealth {
        let snapshot = engine.snapshot();
        FleetHealth {
            uptime_seconds: self.start_time.elapsed().as_secs(),
            terminals_tracked: snapshot.counts.total(),
            counts: snapshot.counts,
            initial_fetch_done: snapshot.initial_fetch_done,
            mqtt_status: self.mqtt_status.lock().clone(),
            mqtt_reconnects: self.mqtt_reconnects.load(Ordering::Relaxed),
        }
    }

    /// Démarre la publication auto du health kernel
    pub fn spawn_health_publisher(&self, mqtt: MqttConf, engine: EngineHandle) {
        let health_tracker = self.clone();

        task::spawn(async move {
            let mut opts = MqttOptions::new("fleetwatch-kernel-health", &mqtt.host, mqtt.port);
            opts.set_keep_alive(Duration::from_secs(15));
            let (client, mut eventloop) = AsyncClient::new(opts, 10);

            let mut interval = tokio::time::interval(PUBLISH_EVERY);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let health = health_tracker.get_health(&engine);
                        let Ok(payload) = serde_json::to_string(&health) else { continue };
                        match client.publish(HEALTH_TOPIC, QoS::AtLeastOnce, false, payload).await {
                            Ok(()) => debug!(
                                uptime_seconds = health.uptime_seconds,
                                terminals = health.terminals_tracked,
                                "kernel health published"
                            ),
                            Err(e) => warn!(error = ?e, "failed to publish kernel health"),
                        }
                    },
                    event = eventloop.poll() => {
                        if let Err(e) = event {
                            warn!(error = ?e, "health publisher MQTT error");
                            tokio::time::sleep(Duration::from_secs(2)).await;
                        }
                    }
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LivenessConf;
    use crate::engine::FleetEngine;
    use crate::store::JsonStore;
    use crate::timeline::TIMELINE_LIMIT;

    #[tokio::test]
    async fn tracks_mqtt_state_transitions() {
        let store = Arc::new(JsonStore::in_memory());
        let (_engine, handle) = FleetEngine::new(store, &LivenessConf::default(), TIMELINE_LIMIT);
        let tracker = HealthTracker::new();

        assert_eq!(tracker.get_health(&handle).mqtt_status, "connecting");
        tracker.mark_mqtt_connected();
        tracker.increment_reconnects();
        tracker.increment_reconnects();

        let health = tracker.get_health(&handle);
        assert_eq!(health.mqtt_status, "reconnecting");
        assert_eq!(health.mqtt_reconnects, 2);
        assert_eq!(health.terminals_tracked, 0);
        assert!(!health.initial_fetch_done);
    }

    #[test]
    fn published_payload_parses_back() {
        let mut counts = StatusCounts::default();
        counts.record(crate::models::TerminalStatus::Online);
        counts.record(crate::models::TerminalStatus::Offline);
        let health = FleetHealth {
            uptime_seconds: 90,
            terminals_tracked: counts.total(),
            counts,
            initial_fetch_done: true,
            mqtt_status: "connected".into(),
            mqtt_reconnects: 1,
        };

        let payload = serde_json::to_string(&health).unwrap();
        let parsed: FleetHealth = serde_json::from_str(&payload).unwrap();
        assert_eq!(parsed, health);
        assert_eq!(parsed.counts.online, 1);
    }
}
