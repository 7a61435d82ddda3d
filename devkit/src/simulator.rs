/*!
Simulateur de terminaux FleetWatch

Reproduit ce qu'un agent de poste publie vers le kernel :
- heartbeat toutes les 10s (statut, IP, métriques, uptime de session)
- ONLINE tant que le poste est utilisé, IDLE après 90s sans entrée
- événement ONLINE au démarrage, à chaque changement de statut, OFFLINE à l'arrêt
- un poste "silencieux" cesse de publier pour exercer le sweeper du kernel
- commande "snapshot" reçue => screenshot_url au heartbeat suivant
*/

use crate::mqtt_stub::MessageSink;
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const HEARTBEAT_TOPIC: &str = "fleetwatch/terminals/heartbeat@v1";
pub const EVENT_TOPIC: &str = "fleetwatch/terminals/event@v1";
pub const COMMAND_TOPIC: &str = "fleetwatch/terminals/command@v1";
pub const IDLE_THRESHOLD_SECS: i64 = 90;
pub const SYNC_INTERVAL_SECS: u64 = 10;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimMetrics {
    pub cpu: f32,
    pub ram: f32,
    pub is_active: bool,
    pub uptime: u64,
    pub idle_seconds: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatPayload {
    pub terminal_id: u32,
    pub status: String,
    pub ip_address: String,
    pub metrics: SimMetrics,
    pub last_seen: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub screenshot_url: Option<String>,
}

/// Commande relayée par le kernel, seuls les champs utiles au poste.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AgentCommandIn {
    pub terminal_id: u32,
    pub command_type: String,
    pub refresh_trigger: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventPayload {
    pub terminal_id: u32,
    pub event: String,
}

/// Comportement d'un poste simulé
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimProfile {
    /// Client présent : activité à chaque tick
    Active,
    /// Personne au poste : passe IDLE après le seuil
    Unattended,
    /// Cesse de publier après N heartbeats (crash, câble débranché)
    Silent { after: u32 },
}

pub struct TerminalSimulator {
    terminal_id: u32,
    ip_address: String,
    profile: SimProfile,
    started_at: DateTime<Utc>,
    last_activity: DateTime<Utc>,
    last_status: Option<&'static str>,
    beats: u32,
    last_trigger: Option<u64>,
    pending_capture: Option<u64>,
}

impl TerminalSimulator {
    pub fn new(terminal_id: u32, profile: SimProfile, started_at: DateTime<Utc>) -> Self {
        Self {
            terminal_id,
            ip_address: format!("192.168.10.{}", 100 + terminal_id % 150),
            profile,
            started_at,
            last_activity: started_at,
            last_status: None,
            beats: 0,
            last_trigger: None,
            pending_capture: None,
        }
    }

    pub fn terminal_id(&self) -> u32 {
        self.terminal_id
    }

    pub fn profile(&self) -> SimProfile {
        self.profile
    }

    /// Vrai une fois que le poste a cessé de publier
    pub fn is_silent(&self) -> bool {
        matches!(self.profile, SimProfile::Silent { after } if self.beats >= after)
    }

    pub fn record_activity(&mut self, at: DateTime<Utc>) {
        self.last_activity = at;
    }

    /// Programme une capture pour ce trigger. Un trigger déjà servi est ignoré.
    pub fn apply_command(&mut self, refresh_trigger: u64) -> bool {
        if self.last_trigger == Some(refresh_trigger) || self.is_silent() {
            return false;
        }
        self.last_trigger = Some(refresh_trigger);
        self.pending_capture = Some(refresh_trigger);
        true
    }

    pub fn start(&mut self) -> EventPayload {
        self.last_status = Some("ONLINE");
        self.event("ONLINE")
    }

    pub fn stop(&mut self) -> EventPayload {
        self.last_status = None;
        self.event("OFFLINE")
    }

    /// Heartbeat à l'instant `now`, plus l'événement de transition s'il y en a une.
    pub fn heartbeat(&mut self, now: DateTime<Utc>) -> (HeartbeatPayload, Option<EventPayload>) {
        if self.profile == SimProfile::Active {
            self.last_activity = now;
        }
        let idle_seconds = (now - self.last_activity).num_seconds().max(0);
        let is_active = idle_seconds < IDLE_THRESHOLD_SECS;
        let status = if is_active { "ONLINE" } else { "IDLE" };

        let transition = (self.last_status != Some(status)).then(|| {
            self.last_status = Some(status);
            self.event(status)
        });

        self.beats += 1;
        let jitter = ((self.terminal_id * 7 + self.beats * 13) % 40) as f32;
        let heartbeat = HeartbeatPayload {
            terminal_id: self.terminal_id,
            status: status.to_string(),
            ip_address: self.ip_address.clone(),
            metrics: SimMetrics {
                cpu: if is_active { 20.0 + jitter } else { 2.0 + jitter / 10.0 },
                ram: 35.0 + jitter / 2.0,
                is_active,
                uptime: (now - self.started_at).num_seconds().max(0) as u64,
                idle_seconds: idle_seconds as u64,
            },
            last_seen: now.to_rfc3339(),
            screenshot_url: self.pending_capture.take().map(|trigger| {
                format!("https://sim.fleetwatch.local/screens/{}/{}.jpg", self.terminal_id, trigger)
            }),
        };
        (heartbeat, transition)
    }

    fn event(&self, kind: &str) -> EventPayload {
        EventPayload { terminal_id: self.terminal_id, event: kind.to_string() }
    }
}

/// Ensemble de postes simulés publiant sur un même sink.
pub struct SimulatedFleet {
    terminals: Vec<TerminalSimulator>,
}

impl SimulatedFleet {
    pub fn new(terminals: Vec<TerminalSimulator>) -> Self {
        Self { terminals }
    }

    pub fn terminals(&self) -> &[TerminalSimulator] {
        &self.terminals
    }

    pub async fn start<S: MessageSink>(&mut self, sink: &S) -> Result<()> {
        for sim in &mut self.terminals {
            let event = sim.start();
            sink.publish(EVENT_TOPIC, serde_json::to_vec(&event)?).await?;
            log::info!("terminal {} started ({:?})", sim.terminal_id(), sim.profile());
        }
        Ok(())
    }

    /// Un tick de synchro : un heartbeat par poste encore vivant.
    pub async fn tick<S: MessageSink>(&mut self, sink: &S, now: DateTime<Utc>) -> Result<usize> {
        let mut published = 0;
        for sim in &mut self.terminals {
            if sim.is_silent() {
                continue;
            }
            let (heartbeat, transition) = sim.heartbeat(now);
            if let Some(event) = transition {
                log::info!("terminal {} -> {}", sim.terminal_id(), event.event);
                sink.publish(EVENT_TOPIC, serde_json::to_vec(&event)?).await?;
            }
            sink.publish(HEARTBEAT_TOPIC, serde_json::to_vec(&heartbeat)?).await?;
            published += 1;
            if sim.is_silent() {
                log::warn!("terminal {} goes silent", sim.terminal_id());
            }
        }
        Ok(published)
    }

    /// Route une commande vers le poste visé. Faux si inconnu ou déjà servi.
    pub fn apply_command(&mut self, command: &AgentCommandIn) -> bool {
        if command.command_type != "snapshot" {
            log::debug!("ignoring command {} for terminal {}", command.command_type, command.terminal_id);
            return false;
        }
        match self.terminals.iter_mut().find(|sim| sim.terminal_id() == command.terminal_id) {
            Some(sim) => sim.apply_command(command.refresh_trigger),
            None => false,
        }
    }

    /// Arrêt propre : OFFLINE pour les postes qui publiaient encore.
    pub async fn stop<S: MessageSink>(&mut self, sink: &S) -> Result<()> {
        for sim in &mut self.terminals {
            if sim.is_silent() {
                continue;
            }
            let event = sim.stop();
            sink.publish(EVENT_TOPIC, serde_json::to_vec(&event)?).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mqtt_stub::MockMqttClient;
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 19, 14, 0, 0).unwrap()
    }

    #[test]
    fn unattended_terminal_goes_idle_after_threshold() {
        let mut sim = TerminalSimulator::new(3, SimProfile::Unattended, t0());
        assert_eq!(sim.start().event, "ONLINE");

        let (hb, transition) = sim.heartbeat(t0() + Duration::seconds(80));
        assert_eq!(hb.status, "ONLINE");
        assert!(transition.is_none());

        let (hb, transition) = sim.heartbeat(t0() + Duration::seconds(90));
        assert_eq!(hb.status, "IDLE");
        assert!(!hb.metrics.is_active);
        assert_eq!(hb.metrics.idle_seconds, 90);
        assert_eq!(hb.metrics.uptime, 90);
        assert_eq!(transition.unwrap().event, "IDLE");

        sim.record_activity(t0() + Duration::seconds(95));
        let (hb, transition) = sim.heartbeat(t0() + Duration::seconds(100));
        assert_eq!(hb.status, "ONLINE");
        assert_eq!(transition.unwrap().event, "ONLINE");
    }

    #[test]
    fn active_terminal_stays_online() {
        let mut sim = TerminalSimulator::new(1, SimProfile::Active, t0());
        sim.start();
        for step in 1..=20 {
            let (hb, transition) = sim.heartbeat(t0() + Duration::seconds(step * 10));
            assert_eq!(hb.status, "ONLINE");
            assert_eq!(hb.metrics.idle_seconds, 0);
            assert!(transition.is_none());
        }
    }

    #[test]
    fn heartbeat_payload_matches_kernel_contract() {
        let mut sim = TerminalSimulator::new(2, SimProfile::Active, t0());
        let (hb, _) = sim.heartbeat(t0() + Duration::seconds(10));
        let json = serde_json::to_value(&hb).unwrap();
        assert_eq!(json["terminal_id"], 2);
        assert_eq!(json["status"], "ONLINE");
        assert_eq!(json["metrics"]["uptime"], 10);
        assert!(json["last_seen"].as_str().unwrap().starts_with("2026-10-19T14:00:10"));
    }

    #[test]
    fn snapshot_command_is_answered_once() {
        let mut sim = TerminalSimulator::new(5, SimProfile::Active, t0());
        assert!(sim.apply_command(3));
        assert!(!sim.apply_command(3));

        let (hb, _) = sim.heartbeat(t0() + Duration::seconds(10));
        assert_eq!(hb.screenshot_url.as_deref(), Some("https://sim.fleetwatch.local/screens/5/3.jpg"));

        let (hb, _) = sim.heartbeat(t0() + Duration::seconds(20));
        assert!(hb.screenshot_url.is_none());
        assert!(!serde_json::to_value(&hb).unwrap().as_object().unwrap().contains_key("screenshot_url"));
    }

    #[tokio::test]
    async fn relayed_command_reaches_the_right_terminal() {
        let sink = MockMqttClient::new();
        let mut fleet = SimulatedFleet::new(vec![
            TerminalSimulator::new(1, SimProfile::Active, t0()),
            TerminalSimulator::new(2, SimProfile::Active, t0()),
        ]);
        let raw = r#"{"command_id":"c-1","terminal_id":2,"command_type":"snapshot","refresh_trigger":7,"timestamp":"2026-10-19T14:00:05Z"}"#;
        let command: AgentCommandIn = serde_json::from_str(raw).unwrap();
        assert!(fleet.apply_command(&command));

        let unknown = AgentCommandIn { terminal_id: 9, ..command.clone() };
        assert!(!fleet.apply_command(&unknown));

        fleet.tick(&sink, t0() + Duration::seconds(10)).await.unwrap();
        let beats: Vec<HeartbeatPayload> = sink.json_messages(HEARTBEAT_TOPIC).unwrap();
        let urls: Vec<(u32, Option<String>)> = beats.into_iter().map(|hb| (hb.terminal_id, hb.screenshot_url)).collect();
        assert_eq!(
            urls,
            vec![(1, None), (2, Some("https://sim.fleetwatch.local/screens/2/7.jpg".to_string()))]
        );
    }

    #[tokio::test]
    async fn silent_terminal_stops_publishing() {
        let sink = MockMqttClient::new();
        let mut fleet = SimulatedFleet::new(vec![
            TerminalSimulator::new(1, SimProfile::Active, t0()),
            TerminalSimulator::new(2, SimProfile::Silent { after: 2 }, t0()),
        ]);
        fleet.start(&sink).await.unwrap();

        let mut counts = Vec::new();
        for step in 1..=4 {
            counts.push(fleet.tick(&sink, t0() + Duration::seconds(step * 10)).await.unwrap());
        }
        assert_eq!(counts, vec![2, 2, 1, 1]);

        fleet.stop(&sink).await.unwrap();
        let events: Vec<EventPayload> = sink.json_messages(EVENT_TOPIC).unwrap();
        let offline: Vec<u32> = events.iter().filter(|e| e.event == "OFFLINE").map(|e| e.terminal_id).collect();
        assert_eq!(offline, vec![1]);
        assert_eq!(sink.find_messages_by_topic(HEARTBEAT_TOPIC).len(), 6);
    }
}
