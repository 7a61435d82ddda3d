/**
 * HEARTBEAT INGRESS - Payloads agents vers le store canonique
 *
 * RÔLE :
 * Décode les heartbeats et les événements publiés par les agents terminaux
 * (MQTT ou HTTP) et les écrit dans le store. Le kernel ne mute jamais le
 * registre ici : la mise à jour revient par le canal push comme les autres.
 *
 * FONCTIONNEMENT :
 * - heartbeat => update_terminal (last_seen horodaté à la réception si absent)
 * - statut absent ou inconnu => déduit de metrics.is_active, le heartbeat
 *   reste un signal de vie
 * - event => insert_event
 * - payload illisible ou terminal inconnu => log + drop
 */

use crate::models::{lenient_status, Metrics, RecordPatch, TerminalEvent, TerminalId, TerminalStatus};
use crate::store::{CanonicalStore, StoreError};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::{debug, warn};

pub const HEARTBEAT_TOPIC: &str = "fleetwatch/terminals/heartbeat@v1";
pub const EVENT_TOPIC: &str = "fleetwatch/terminals/event@v1";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatIn {
    pub terminal_id: TerminalId,
    #[serde(default, deserialize_with = "lenient_status")]
    pub status: Option<TerminalStatus>,
    #[serde(default)]
    pub ip_address: Option<String>,
    #[serde(default)]
    pub metrics: Metrics,
    #[serde(default)]
    pub screenshot_url: Option<String>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub last_seen: Option<OffsetDateTime>,
}

impl HeartbeatIn {
    /// Statut rapporté, ou ONLINE/IDLE selon l'activité quand il manque.
    pub fn effective_status(&self) -> TerminalStatus {
        match self.status {
            Some(status) => status,
            None if self.metrics.is_active => TerminalStatus::Online,
            None => TerminalStatus::Idle,
        }
    }

    pub fn to_patch(&self, received_at: OffsetDateTime) -> RecordPatch {
        RecordPatch {
            status: Some(self.effective_status()),
            last_seen: Some(self.last_seen.unwrap_or(received_at)),
            ip_address: self.ip_address.clone().filter(|ip| !ip.is_empty()),
            screenshot_url: self.screenshot_url.clone().filter(|url| !url.is_empty()),
            metrics: Some(self.metrics.clone()),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventIn {
    pub terminal_id: TerminalId,
    pub event: String,
}

#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("invalid payload: {0}")]
    Payload(#[from] serde_json::Error),
    #[error("empty event kind")]
    EmptyEvent,
    #[error(transparent)]
    Store(#[from] StoreError),
}

pub async fn ingest_heartbeat(
    store: &dyn CanonicalStore,
    heartbeat: &HeartbeatIn,
    received_at: OffsetDateTime,
) -> Result<(), StoreError> {
    store.update_terminal(heartbeat.terminal_id, heartbeat.to_patch(received_at)).await?;
    if heartbeat.status.is_none() {
        debug!(terminal_id = heartbeat.terminal_id, "heartbeat without a known status, inferred from activity");
    }
    debug!(terminal_id = heartbeat.terminal_id, status = %heartbeat.effective_status(), "heartbeat stored");
    Ok(())
}

pub async fn ingest_event(store: &dyn CanonicalStore, event: &EventIn) -> Result<TerminalEvent, IngestError> {
    let kind = event.event.trim();
    if kind.is_empty() {
        return Err(IngestError::EmptyEvent);
    }
    Ok(store.insert_event(event.terminal_id, kind).await?)
}

/// Route une publication MQTT entrante. Les topics inconnus sont ignorés.
pub async fn handle_publish(store: &dyn CanonicalStore, topic: &str, payload: &[u8]) {
    let outcome = match topic {
        HEARTBEAT_TOPIC => match serde_json::from_slice::<HeartbeatIn>(payload) {
            Ok(hb) => ingest_heartbeat(store, &hb, OffsetDateTime::now_utc()).await.map_err(IngestError::from),
            Err(e) => Err(e.into()),
        },
        EVENT_TOPIC => match serde_json::from_slice::<EventIn>(payload) {
            Ok(ev) => ingest_event(store, &ev).await.map(|_| ()),
            Err(e) => Err(e.into()),
        },
        _ => return,
    };
    if let Err(e) = outcome {
        warn!(topic, error = %e, payload = %String::from_utf8_lossy(payload), "agent message dropped");
    }
}
