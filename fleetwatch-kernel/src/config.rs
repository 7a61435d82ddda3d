use serde::{Deserialize, Serialize};
use std::path::Path;
use tokio::fs;
use tracing::warn;

use crate::timeline::TIMELINE_LIMIT;

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
#[serde(default)]
pub struct FleetConfig {
    pub mqtt: MqttConf,
    pub liveness: LivenessConf,
    pub store: StoreConf,
    pub http: HttpConf,
    pub timeline: TimelineConf,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct MqttConf {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct LivenessConf {
    pub sweep_interval_secs: u64,
    /// Silence au-delà duquel un terminal est considéré OFFLINE
    pub stale_threshold_secs: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct StoreConf {
    pub path: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct HttpConf {
    pub bind: String, // ex: "0.0.0.0:8080"
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct TimelineConf {
    pub limit: usize,
}

impl Default for MqttConf {
    fn default() -> Self {
        Self { host: "localhost".into(), port: 1883 }
    }
}

impl Default for LivenessConf {
    fn default() -> Self {
        Self { sweep_interval_secs: 5, stale_threshold_secs: 25 }
    }
}

impl Default for StoreConf {
    fn default() -> Self {
        Self { path: "./data/fleet.json".into() }
    }
}

impl Default for HttpConf {
    fn default() -> Self {
        Self { bind: "0.0.0.0:8080".into() }
    }
}

impl Default for TimelineConf {
    fn default() -> Self {
        Self { limit: TIMELINE_LIMIT }
    }
}

/// Contenu vide ou invalide => config par défaut.
pub fn parse_config(txt: &str) -> FleetConfig {
    if txt.trim().is_empty() {
        return FleetConfig::default();
    }
    serde_yaml::from_str(txt).unwrap_or_else(|e| {
        warn!(error = %e, "invalid kernel config, using defaults");
        FleetConfig::default()
    })
}

pub async fn load_config() -> FleetConfig {
    let path = std::env::var("FLEETWATCH_CONFIG").unwrap_or_else(|_| "kernel.yaml".into());
    if Path::new(&path).exists() {
        let txt = fs::read_to_string(&path).await.unwrap_or_default();
        parse_config(&txt)
    } else {
        warn!(%path, "no kernel config found, using defaults");
        FleetConfig::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_keeps_other_defaults() {
        let cfg = parse_config(
            "mqtt:\n  host: broker.lan\nliveness:\n  stale_threshold_secs: 40\n",
        );
        assert_eq!(cfg.mqtt.host, "broker.lan");
        assert_eq!(cfg.mqtt.port, 1883);
        assert_eq!(cfg.liveness.stale_threshold_secs, 40);
        assert_eq!(cfg.liveness.sweep_interval_secs, 5);
        assert_eq!(cfg.timeline.limit, 20);
        assert_eq!(cfg.store.path, "./data/fleet.json");
    }

    #[test]
    fn empty_or_broken_file_falls_back() {
        assert_eq!(parse_config("   \n"), FleetConfig::default());
        assert_eq!(parse_config("liveness: [not, a, map"), FleetConfig::default());
    }
}
