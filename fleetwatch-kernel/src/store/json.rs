/**
 * JSON STORE - Store canonique embarqué, persisté en fichier JSON
 *
 * RÔLE :
 * Implémentation de CanonicalStore utilisée par le kernel en production
 * légère et par les tests : tables terminals + terminal_logs en mémoire,
 * sauvegardées sur disque après chaque écriture.
 *
 * FONCTIONNEMENT :
 * - Tables sous parking_lot::Mutex, écriture disque sous le même verrou
 *   (l'ordre des fichiers suit l'ordre des commits)
 * - Une écriture s'applique sur une copie des tables, remplacée seulement si
 *   la sauvegarde disque réussit : un échec ne laisse aucune trace en mémoire
 * - Chaque commit publie une ChangeNotification sur un canal broadcast
 * - Ids attribués par des compteurs persistés, jamais réutilisés après suppression
 */

use super::{CanonicalStore, StoreError, Subscription, SubscriptionFilter};
use crate::models::{
    ChangeNotification, ChangeType, NewTerminal, RecordPatch, TerminalEvent, TerminalId,
    TerminalRecord, TerminalStatus,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use time::OffsetDateTime;
use tokio::sync::broadcast;
use tracing::{debug, info};

const NOTIFY_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Tables {
    terminals: BTreeMap<TerminalId, TerminalRecord>,
    #[serde(default)]
    terminal_logs: Vec<TerminalEvent>,
    /// Dernier id de terminal attribué
    #[serde(default)]
    next_terminal_id: TerminalId,
    /// Dernier id d'événement attribué
    #[serde(default)]
    next_event_id: u64,
}

pub struct JsonStore {
    /// None => store purement mémoire (tests, kernel sans disque)
    storage_path: Option<PathBuf>,
    tables: Mutex<Tables>,
    notify: broadcast::Sender<ChangeNotification>,
}

impl JsonStore {
    #[cfg(test)]
    pub fn in_memory() -> Self {
        let (notify, _) = broadcast::channel(NOTIFY_CAPACITY);
        Self { storage_path: None, tables: Mutex::new(Tables::default()), notify }
    }

    /// Ouvre (ou crée) le fichier de stockage.
    pub fn open<P: Into<PathBuf>>(storage_path: P) -> Result<Self, StoreError> {
        let path = storage_path.into();
        let tables = Self::load_from_disk(&path)?;
        info!(
            path = %path.display(),
            terminals = tables.terminals.len(),
            events = tables.terminal_logs.len(),
            "store opened"
        );
        let (notify, _) = broadcast::channel(NOTIFY_CAPACITY);
        Ok(Self { storage_path: Some(path), tables: Mutex::new(tables), notify })
    }

    fn load_from_disk(path: &Path) -> Result<Tables, StoreError> {
        if !path.exists() {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            return Ok(Tables::default());
        }
        let content = fs::read_to_string(path)?;
        if content.trim().is_empty() {
            return Ok(Tables::default());
        }
        let mut tables: Tables = serde_json::from_str(&content)?;
        let max_terminal = tables.terminals.keys().next_back().copied().unwrap_or(0);
        tables.next_terminal_id = tables.next_terminal_id.max(max_terminal);
        let max_event = tables.terminal_logs.iter().map(|e| e.id).max().unwrap_or(0);
        tables.next_event_id = tables.next_event_id.max(max_event);
        Ok(tables)
    }

    fn save_to_disk(&self, tables: &Tables) -> Result<(), StoreError> {
        if let Some(path) = &self.storage_path {
            let json = serde_json::to_string_pretty(tables)?;
            fs::write(path, json)?;
        }
        Ok(())
    }

    /// Applique `change` sur une copie des tables et ne la garde que si la
    /// sauvegarde réussit. La notification part sous le verrou : l'ordre de
    /// livraison suit l'ordre des commits.
    fn commit<T>(
        &self,
        change: impl FnOnce(&mut Tables) -> Result<(T, Option<ChangeNotification>), StoreError>,
    ) -> Result<T, StoreError> {
        let mut tables = self.tables.lock();
        let mut next = tables.clone();
        let (out, notification) = change(&mut next)?;
        self.save_to_disk(&next)?;
        *tables = next;
        if let Some(notification) = notification {
            self.publish(notification);
        }
        Ok(out)
    }

    fn publish(&self, notification: ChangeNotification) {
        // Err => aucun abonné, rien à livrer
        let _ = self.notify.send(notification);
    }
}

#[async_trait]
impl CanonicalStore for JsonStore {
    async fn list_terminals(&self) -> Result<Vec<TerminalRecord>, StoreError> {
        Ok(self.tables.lock().terminals.values().cloned().collect())
    }

    async fn list_recent_events(
        &self,
        terminal_id: TerminalId,
        limit: usize,
    ) -> Result<Vec<TerminalEvent>, StoreError> {
        let tables = self.tables.lock();
        let mut events: Vec<TerminalEvent> = tables
            .terminal_logs
            .iter()
            .filter(|e| e.terminal_id == terminal_id)
            .cloned()
            .collect();
        events.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        events.truncate(limit);
        Ok(events)
    }

    async fn update_terminal(&self, id: TerminalId, patch: RecordPatch) -> Result<(), StoreError> {
        if patch.is_empty() {
            if !self.tables.lock().terminals.contains_key(&id) {
                return Err(StoreError::NotFound(id));
            }
            return Ok(());
        }
        self.commit(|tables| {
            let record = tables.terminals.get_mut(&id).ok_or(StoreError::NotFound(id))?;
            patch.apply_to(record);
            Ok(((), Some(ChangeNotification::terminal(ChangeType::Update, record.clone()))))
        })?;
        debug!(terminal_id = id, "terminal updated");
        Ok(())
    }

    async fn insert_terminal(&self, new: NewTerminal) -> Result<TerminalRecord, StoreError> {
        let record = self.commit(|tables| {
            tables.next_terminal_id += 1;
            let record = TerminalRecord {
                id: tables.next_terminal_id,
                name: new.name,
                status: Some(TerminalStatus::Offline),
                ip_address: new.ip_address,
                ..Default::default()
            };
            tables.terminals.insert(record.id, record.clone());
            let notification = ChangeNotification::terminal(ChangeType::Insert, record.clone());
            Ok((record, Some(notification)))
        })?;
        info!(terminal_id = record.id, "terminal inserted");
        Ok(record)
    }

    async fn delete_terminal(&self, id: TerminalId) -> Result<(), StoreError> {
        self.commit(|tables| {
            let record = tables.terminals.remove(&id).ok_or(StoreError::NotFound(id))?;
            Ok(((), Some(ChangeNotification::terminal(ChangeType::Delete, record))))
        })?;
        info!(terminal_id = id, "terminal deleted");
        Ok(())
    }

    async fn insert_event(&self, terminal_id: TerminalId, kind: &str) -> Result<TerminalEvent, StoreError> {
        let event = self.commit(|tables| {
            if !tables.terminals.contains_key(&terminal_id) {
                return Err(StoreError::NotFound(terminal_id));
            }
            tables.next_event_id += 1;
            let event = TerminalEvent {
                id: tables.next_event_id,
                terminal_id,
                kind: kind.to_string(),
                created_at: OffsetDateTime::now_utc(),
            };
            tables.terminal_logs.push(event.clone());
            Ok((event.clone(), Some(ChangeNotification::event(event))))
        })?;
        debug!(terminal_id, kind, event_id = event.id, "event inserted");
        Ok(event)
    }

    async fn delete_events_for(&self, terminal_id: TerminalId) -> Result<usize, StoreError> {
        let owned = |e: &TerminalEvent| e.terminal_id == terminal_id;
        if !self.tables.lock().terminal_logs.iter().any(owned) {
            return Ok(0);
        }
        self.commit(|tables| {
            let before = tables.terminal_logs.len();
            tables.terminal_logs.retain(|e| !owned(e));
            Ok((before - tables.terminal_logs.len(), None))
        })
    }

    fn subscribe(&self, filter: SubscriptionFilter) -> Subscription {
        Subscription::new(self.notify.subscribe(), filter)
    }
}
