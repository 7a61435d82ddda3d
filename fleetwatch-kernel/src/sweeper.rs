/**
 * LIVENESS SWEEPER - Détection des terminaux silencieux
 *
 * RÔLE :
 * À chaque tick, repère les terminaux non OFFLINE dont le dernier heartbeat
 * dépasse le seuil, les démote localement (optimiste) et produit les écritures
 * durables : statut OFFLINE + cumul journalier replié + événement OFFLINE.
 *
 * FONCTIONNEMENT :
 * - sweep() est pur : registre + horloge => liste de démotions
 * - persist_demotion() porte l'écriture store, lancée hors de la boucle
 * - un heartbeat tardif ressuscite le terminal via la réconciliation normale
 */

use crate::models::{Metrics, RecordPatch, Terminal, TerminalId, TerminalStatus};
use crate::registry::{Demotion, Registry};
use crate::store::{CanonicalStore, StoreError};
use time::{Duration, OffsetDateTime};
use tracing::{debug, info};

pub const OFFLINE_EVENT: &str = "OFFLINE";

/// Écriture durable due pour un terminal replié.
#[derive(Debug, Clone, PartialEq)]
pub struct FoldWrite {
    pub terminal_id: TerminalId,
    pub daily_uptime: u64,
    pub metrics: Metrics,
}

impl FoldWrite {
    pub fn from_demotion(terminal_id: TerminalId, demotion: Demotion) -> Self {
        let (Demotion::Folded { daily_uptime, metrics } | Demotion::AlreadyFolded { daily_uptime, metrics }) =
            demotion;
        Self { terminal_id, daily_uptime, metrics }
    }

    pub fn to_patch(&self) -> RecordPatch {
        RecordPatch {
            status: Some(TerminalStatus::Offline),
            daily_uptime: Some(self.daily_uptime),
            metrics: Some(self.metrics.clone()),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Sweeper {
    stale_threshold: Duration,
}

impl Sweeper {
    pub fn new(stale_threshold: Duration) -> Self {
        Self { stale_threshold }
    }

    pub fn stale_threshold(&self) -> Duration {
        self.stale_threshold
    }

    pub fn is_stale(&self, terminal: &Terminal, now: OffsetDateTime) -> bool {
        now - terminal.last_heartbeat > self.stale_threshold
    }

    /// Démote les terminaux silencieux et retourne les écritures à persister.
    pub fn sweep(&self, registry: &mut Registry, now: OffsetDateTime) -> Vec<FoldWrite> {
        let stale: Vec<TerminalId> = registry
            .iter()
            .filter(|t| t.status != TerminalStatus::Offline && self.is_stale(t, now))
            .map(|t| t.id)
            .collect();

        let mut writes = Vec::with_capacity(stale.len());
        for id in stale {
            let Some(demotion) = registry.demote_offline(id) else { continue };
            match &demotion {
                Demotion::Folded { daily_uptime, .. } => {
                    info!(terminal_id = id, daily_uptime, "heartbeat silence, terminal demoted offline");
                }
                Demotion::AlreadyFolded { daily_uptime, .. } => {
                    debug!(terminal_id = id, daily_uptime, "session already folded, offline status rewritten");
                }
            }
            writes.push(FoldWrite::from_demotion(id, demotion));
        }
        writes
    }
}

/// Statut + cumul puis événement OFFLINE. Pas de retry : le prochain heartbeat
/// ou la prochaine réconciliation corrige.
pub async fn persist_demotion(store: &dyn CanonicalStore, write: &FoldWrite) -> Result<(), StoreError> {
    store.update_terminal(write.terminal_id, write.to_patch()).await?;
    store.insert_event(write.terminal_id, OFFLINE_EVENT).await?;
    Ok(())
}
