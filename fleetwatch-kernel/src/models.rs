/**
 * MODÈLES FLEETWATCH - Terminaux, événements et notifications du store
 *
 * RÔLE :
 * Types partagés par tous les modules du kernel : l'état d'un terminal tel que
 * le registre le voit, la ligne durable du store canonique, les patches
 * (côté registre et côté store) et les notifications poussées par le store.
 *
 * FONCTIONNEMENT :
 * - TerminalRecord = ligne brute du store, tolérante aux champs manquants
 * - Terminal = snapshot normalisé (valeurs par défaut appliquées)
 * - TerminalPatch = fusion champ par champ dans le registre
 * - RecordPatch = écriture partielle envoyée au store
 */

use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::str::FromStr;
use time::OffsetDateTime;

pub type TerminalId = u32;

/// Adresse utilisée quand un producteur n'a pas rapporté d'IP.
pub const LOOPBACK_PLACEHOLDER: &str = "127.0.0.1";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TerminalStatus {
    Online,
    #[default]
    Offline,
    Idle,
    Maintenance,
}

impl TerminalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TerminalStatus::Online => "ONLINE",
            TerminalStatus::Offline => "OFFLINE",
            TerminalStatus::Idle => "IDLE",
            TerminalStatus::Maintenance => "MAINTENANCE",
        }
    }
}

impl fmt::Display for TerminalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TerminalStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "ONLINE" => Ok(TerminalStatus::Online),
            "OFFLINE" => Ok(TerminalStatus::Offline),
            "IDLE" => Ok(TerminalStatus::Idle),
            "MAINTENANCE" => Ok(TerminalStatus::Maintenance),
            other => Err(format!("unknown terminal status '{other}'")),
        }
    }
}

/// Statut inconnu ou absent => None, jamais une erreur de parsing.
pub(crate) fn lenient_status<'de, D>(deserializer: D) -> Result<Option<TerminalStatus>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<String>::deserialize(deserializer)?;
    Ok(raw.and_then(|s| s.parse().ok()))
}

/// Métriques rapportées par l'agent à chaque heartbeat.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Metrics {
    pub cpu: f32,
    pub ram: f32,
    pub ping: f32,
    pub is_active: bool,
    /// Secondes écoulées depuis le début de la session courante
    pub uptime: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idle_seconds: Option<u64>,
}

/// Ligne durable de la table `terminals` du store canonique.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TerminalRecord {
    pub id: TerminalId,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default, deserialize_with = "lenient_status")]
    pub status: Option<TerminalStatus>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub last_seen: Option<OffsetDateTime>,
    #[serde(default)]
    pub ip_address: Option<String>,
    #[serde(default)]
    pub daily_uptime: u64,
    #[serde(default)]
    pub screenshot_url: Option<String>,
    #[serde(default)]
    pub metrics: Option<Metrics>,
    #[serde(default)]
    pub refresh_trigger: Option<u64>,
}

/// Snapshot d'un terminal tel que le registre le détient.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Terminal {
    pub id: TerminalId,
    pub name: String,
    pub status: TerminalStatus,
    #[serde(with = "time::serde::rfc3339")]
    pub last_heartbeat: OffsetDateTime,
    pub ip_address: String,
    pub daily_uptime: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub screenshot_url: Option<String>,
    pub metrics: Metrics,
    /// Dernier nonce de capture écrit par un opérateur, lu par les agents
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_trigger: Option<u64>,
}

/// Nom synthétisé pour un terminal sans nom : `TERMINAL-03`.
pub fn default_name(id: TerminalId) -> String {
    format!("TERMINAL-{id:02}")
}

fn non_empty(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

impl Terminal {
    /// Construit un snapshot complet depuis une ligne du store, en comblant les
    /// champs manquants plutôt que de rejeter la ligne.
    pub fn from_record(record: &TerminalRecord) -> Self {
        Self {
            id: record.id,
            name: non_empty(&record.name).unwrap_or_else(|| default_name(record.id)),
            status: record.status.unwrap_or_default(),
            last_heartbeat: record.last_seen.unwrap_or(OffsetDateTime::UNIX_EPOCH),
            ip_address: non_empty(&record.ip_address)
                .unwrap_or_else(|| LOOPBACK_PLACEHOLDER.to_string()),
            daily_uptime: record.daily_uptime,
            screenshot_url: non_empty(&record.screenshot_url),
            metrics: record.metrics.clone().unwrap_or_default(),
            refresh_trigger: record.refresh_trigger,
        }
    }
}

/// Fusion champ par champ appliquée au registre et à la vue détail.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TerminalPatch {
    pub name: Option<String>,
    pub status: Option<TerminalStatus>,
    pub last_heartbeat: Option<OffsetDateTime>,
    pub ip_address: Option<String>,
    pub daily_uptime: Option<u64>,
    pub screenshot_url: Option<String>,
    pub metrics: Option<Metrics>,
    pub refresh_trigger: Option<u64>,
}

impl TerminalPatch {
    /// Patch dérivé d'une ligne complète reçue par notification UPDATE.
    pub fn from_record(record: &TerminalRecord) -> Self {
        Self {
            name: Some(non_empty(&record.name).unwrap_or_else(|| default_name(record.id))),
            status: record.status,
            last_heartbeat: record.last_seen,
            ip_address: non_empty(&record.ip_address),
            daily_uptime: Some(record.daily_uptime),
            screenshot_url: non_empty(&record.screenshot_url),
            metrics: record.metrics.clone(),
            refresh_trigger: record.refresh_trigger,
        }
    }

    /// Applique le patch. Une capture absente ne remplace jamais une capture
    /// déjà vue. Retourne true si le terminal a changé.
    pub fn apply_to(&self, terminal: &mut Terminal) -> bool {
        let before = terminal.clone();
        if let Some(name) = &self.name {
            terminal.name = name.clone();
        }
        if let Some(status) = self.status {
            terminal.status = status;
        }
        if let Some(ts) = self.last_heartbeat {
            terminal.last_heartbeat = ts;
        }
        if let Some(ip) = &self.ip_address {
            terminal.ip_address = ip.clone();
        }
        if let Some(daily) = self.daily_uptime {
            terminal.daily_uptime = daily;
        }
        if let Some(url) = self.screenshot_url.as_deref().filter(|u| !u.is_empty()) {
            terminal.screenshot_url = Some(url.to_string());
        }
        if let Some(metrics) = &self.metrics {
            terminal.metrics = metrics.clone();
        }
        if let Some(trigger) = self.refresh_trigger {
            terminal.refresh_trigger = Some(trigger);
        }
        *terminal != before
    }
}

/// Écriture partielle vers la table `terminals`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecordPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<TerminalStatus>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "time::serde::rfc3339::option"
    )]
    pub last_seen: Option<OffsetDateTime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub daily_uptime: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub screenshot_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<Metrics>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_trigger: Option<u64>,
}

impl RecordPatch {
    pub fn apply_to(&self, record: &mut TerminalRecord) {
        if let Some(name) = &self.name {
            record.name = Some(name.clone());
        }
        if let Some(status) = self.status {
            record.status = Some(status);
        }
        if let Some(ts) = self.last_seen {
            record.last_seen = Some(ts);
        }
        if let Some(ip) = &self.ip_address {
            record.ip_address = Some(ip.clone());
        }
        if let Some(daily) = self.daily_uptime {
            record.daily_uptime = daily;
        }
        if let Some(url) = &self.screenshot_url {
            record.screenshot_url = Some(url.clone());
        }
        if let Some(metrics) = &self.metrics {
            record.metrics = Some(metrics.clone());
        }
        if let Some(trigger) = self.refresh_trigger {
            record.refresh_trigger = Some(trigger);
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == RecordPatch::default()
    }
}

/// Nouvelle ligne créée par un opérateur ; le store attribue l'id.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewTerminal {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub ip_address: Option<String>,
}

/// Événement de statut, immuable une fois inséré.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalEvent {
    pub id: u64,
    pub terminal_id: TerminalId,
    #[serde(rename = "event")]
    pub kind: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeType {
    Insert,
    Update,
    Delete,
}

/// Ligne post-changement portée par une notification, selon la table.
#[derive(Debug, Clone, PartialEq)]
pub enum ChangeRecord {
    Terminals(TerminalRecord),
    Events(TerminalEvent),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChangeNotification {
    pub change_type: ChangeType,
    pub record: ChangeRecord,
}

impl ChangeNotification {
    pub fn terminal(change_type: ChangeType, record: TerminalRecord) -> Self {
        Self { change_type, record: ChangeRecord::Terminals(record) }
    }

    pub fn event(event: TerminalEvent) -> Self {
        Self { change_type: ChangeType::Insert, record: ChangeRecord::Events(event) }
    }
}

/// Totaux par statut, exposés par le health.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub online: u32,
    pub idle: u32,
    pub offline: u32,
    pub maintenance: u32,
}

impl StatusCounts {
    pub fn record(&mut self, status: TerminalStatus) {
        match status {
            TerminalStatus::Online => self.online += 1,
            TerminalStatus::Idle => self.idle += 1,
            TerminalStatus::Offline => self.offline += 1,
            TerminalStatus::Maintenance => self.maintenance += 1,
        }
    }

    pub fn total(&self) -> u32 {
        self.online + self.idle + self.offline + self.maintenance
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn malformed_record_gets_defaults() {
        let record: TerminalRecord =
            serde_json::from_str(r#"{"id": 3, "status": "REBOOTING", "name": "  "}"#).unwrap();
        let terminal = Terminal::from_record(&record);

        assert_eq!(terminal.name, "TERMINAL-03");
        assert_eq!(terminal.ip_address, LOOPBACK_PLACEHOLDER);
        assert_eq!(terminal.status, TerminalStatus::Offline);
        assert_eq!(terminal.last_heartbeat, OffsetDateTime::UNIX_EPOCH);
        assert_eq!(terminal.metrics, Metrics::default());
    }

    #[test]
    fn record_parses_store_row() {
        let record: TerminalRecord = serde_json::from_str(
            r#"{
                "id": 7,
                "name": "PC-7",
                "status": "idle",
                "last_seen": "2026-10-19T08:00:00Z",
                "ip_address": "10.0.0.7",
                "daily_uptime": 42,
                "metrics": {"cpu": 12.5, "ram": 40.0, "is_active": false, "uptime": 300, "idle_seconds": 95}
            }"#,
        )
        .unwrap();

        assert_eq!(record.status, Some(TerminalStatus::Idle));
        assert_eq!(record.last_seen, Some(datetime!(2026-10-19 08:00 UTC)));
        let metrics = record.metrics.unwrap();
        assert_eq!(metrics.uptime, 300);
        assert_eq!(metrics.ping, 0.0);
        assert_eq!(metrics.idle_seconds, Some(95));
    }

    #[test]
    fn patch_keeps_last_known_screenshot() {
        let mut terminal = Terminal::from_record(&TerminalRecord {
            id: 1,
            screenshot_url: Some("data:image/jpeg;base64,AAA".into()),
            ..Default::default()
        });
        let patch = TerminalPatch {
            status: Some(TerminalStatus::Online),
            screenshot_url: Some(String::new()),
            ..Default::default()
        };

        assert!(patch.apply_to(&mut terminal));
        assert_eq!(terminal.status, TerminalStatus::Online);
        assert_eq!(terminal.screenshot_url.as_deref(), Some("data:image/jpeg;base64,AAA"));
    }

    #[test]
    fn refresh_trigger_reaches_the_snapshot() {
        let mut terminal =
            Terminal::from_record(&TerminalRecord { id: 2, refresh_trigger: Some(41), ..Default::default() });
        assert_eq!(serde_json::to_value(&terminal).unwrap()["refresh_trigger"], 41);

        let update = TerminalRecord { id: 2, refresh_trigger: Some(77), ..Default::default() };
        assert!(TerminalPatch::from_record(&update).apply_to(&mut terminal));
        assert_eq!(terminal.refresh_trigger, Some(77));
    }

    #[test]
    fn status_parsing_is_case_insensitive() {
        assert_eq!("maintenance".parse::<TerminalStatus>(), Ok(TerminalStatus::Maintenance));
        assert!("asleep".parse::<TerminalStatus>().is_err());
        assert_eq!(TerminalStatus::Idle.to_string(), "IDLE");
    }

    #[test]
    fn record_patch_serializes_only_present_fields() {
        let patch = RecordPatch { refresh_trigger: Some(9), ..Default::default() };
        assert_eq!(serde_json::to_value(&patch).unwrap(), serde_json::json!({"refresh_trigger": 9}));
        assert!(RecordPatch::default().is_empty());
    }
}
