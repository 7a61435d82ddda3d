/**
 * COMMAND DISPATCHER - Commandes opérateur vers le store canonique
 *
 * RÔLE :
 * Écrit les intentions opérateur (power, renommage, capture forcée, ajout et
 * suppression de terminal) dans le store. L'agent du terminal est l'effecteur :
 * le dispatcher ne touche jamais le registre, la conformité s'observe au
 * heartbeat suivant.
 *
 * FONCTIONNEMENT :
 * - retour après acquittement du store, aucune mise à jour optimiste
 * - échec => erreur à l'appelant, pas de retry automatique
 * - capture forcée => nonce aléatoire, toujours différent du précédent
 */

use crate::models::{NewTerminal, RecordPatch, TerminalId, TerminalRecord, TerminalStatus};
use crate::store::{CanonicalStore, StoreError};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

/// Le nonce tient dans un nombre JSON sans perte de précision.
const NONCE_MASK: u64 = (1 << 53) - 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PowerAction {
    Reboot,
    Shutdown,
    Maintenance,
}

impl PowerAction {
    /// Statut écrit pour l'action ; l'agent l'interprète.
    pub fn target_status(self) -> TerminalStatus {
        match self {
            PowerAction::Reboot => TerminalStatus::Online,
            PowerAction::Shutdown => TerminalStatus::Offline,
            PowerAction::Maintenance => TerminalStatus::Maintenance,
        }
    }
}

impl fmt::Display for PowerAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PowerAction::Reboot => "reboot",
            PowerAction::Shutdown => "shutdown",
            PowerAction::Maintenance => "maintenance",
        })
    }
}

impl FromStr for PowerAction {
    type Err = CommandError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "reboot" => Ok(PowerAction::Reboot),
            "shutdown" => Ok(PowerAction::Shutdown),
            "maintenance" => Ok(PowerAction::Maintenance),
            other => Err(CommandError::Validation(format!("unknown action '{other}'"))),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("terminal {0} not found")]
    UnknownTerminal(TerminalId),
    #[error("invalid command: {0}")]
    Validation(String),
    #[error("store write failed: {0}")]
    Store(StoreError),
}

impl From<StoreError> for CommandError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(id) => CommandError::UnknownTerminal(id),
            other => CommandError::Store(other),
        }
    }
}

pub struct CommandDispatcher {
    store: Arc<dyn CanonicalStore>,
    /// Dernier nonce acquitté par terminal
    last_nonce: Mutex<HashMap<TerminalId, u64>>,
}

impl CommandDispatcher {
    pub fn new(store: Arc<dyn CanonicalStore>) -> Self {
        Self { store, last_nonce: Mutex::new(HashMap::new()) }
    }

    async fn write(&self, id: TerminalId, patch: RecordPatch, what: &str) -> Result<(), CommandError> {
        match self.store.update_terminal(id, patch).await {
            Ok(()) => Ok(()),
            Err(e) => {
                let err = CommandError::from(e);
                warn!(terminal_id = id, command = what, error = %err, "command not applied");
                Err(err)
            }
        }
    }

    pub async fn send_action(&self, id: TerminalId, action: PowerAction) -> Result<(), CommandError> {
        let patch = RecordPatch { status: Some(action.target_status()), ..Default::default() };
        self.write(id, patch, "power").await?;
        info!(terminal_id = id, %action, "power action written");
        Ok(())
    }

    /// Écrit un nouveau trigger de capture et le retourne.
    pub async fn force_snapshot(&self, id: TerminalId) -> Result<u64, CommandError> {
        let previous = self.last_nonce.lock().get(&id).copied();
        let nonce = fresh_nonce(previous);
        let patch = RecordPatch { refresh_trigger: Some(nonce), ..Default::default() };
        self.write(id, patch, "snapshot").await?;
        self.last_nonce.lock().insert(id, nonce);
        info!(terminal_id = id, nonce, "snapshot trigger written");
        Ok(nonce)
    }

    /// Dernière écriture gagnante, sans détection de conflit.
    pub async fn rename(&self, id: TerminalId, new_name: &str) -> Result<(), CommandError> {
        let name = new_name.trim();
        if name.is_empty() {
            return Err(CommandError::Validation("name must not be empty".into()));
        }
        let patch = RecordPatch { name: Some(name.to_string()), ..Default::default() };
        self.write(id, patch, "rename").await?;
        info!(terminal_id = id, name, "terminal renamed");
        Ok(())
    }

    pub async fn add_terminal(&self, new: NewTerminal) -> Result<TerminalRecord, CommandError> {
        let record = self.store.insert_terminal(new).await?;
        info!(terminal_id = record.id, "terminal added");
        Ok(record)
    }

    /// Supprime le terminal puis son historique.
    pub async fn delete_terminal(&self, id: TerminalId) -> Result<(), CommandError> {
        self.store.delete_terminal(id).await?;
        let removed = self.store.delete_events_for(id).await?;
        self.last_nonce.lock().remove(&id);
        info!(terminal_id = id, events_removed = removed, "terminal deleted");
        Ok(())
    }
}

fn fresh_nonce(previous: Option<u64>) -> u64 {
    loop {
        let nonce = Uuid::new_v4().as_u64_pair().0 & NONCE_MASK;
        if nonce != 0 && Some(nonce) != previous {
            return nonce;
        }
    }
}
