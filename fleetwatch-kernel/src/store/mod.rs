/**
 * STORE CANONIQUE - Frontière vers le stockage durable de la flotte
 *
 * RÔLE :
 * Définit l'interface que le moteur consomme : lectures (liste des terminaux,
 * derniers événements), écritures partielles, et canal push des changements.
 * Le moteur ne suppose rien du moteur de stockage derrière.
 *
 * FONCTIONNEMENT :
 * - CanonicalStore = trait async requête/réponse + subscribe()
 * - Subscription = récepteur broadcast filtré par table ou par terminal
 * - notifications perdues (lag) => SubscriptionError::Lagged, l'abonné resynchronise
 * - JsonStore (json.rs) = implémentation fichier JSON embarquée dans le kernel
 */

pub mod json;

pub use json::JsonStore;

use crate::models::{
    ChangeNotification, ChangeRecord, NewTerminal, RecordPatch, TerminalEvent, TerminalId,
    TerminalRecord,
};
use async_trait::async_trait;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::warn;

/// Nombre d'événements récents chargés à l'ouverture d'une vue détail.
pub const RECENT_EVENTS_LIMIT: usize = 20;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("terminal {0} not found")]
    NotFound(TerminalId),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Opérations exposées par le store canonique.
#[async_trait]
pub trait CanonicalStore: Send + Sync {
    /// Tous les terminaux, triés par id.
    async fn list_terminals(&self) -> Result<Vec<TerminalRecord>, StoreError>;

    /// Les `limit` derniers événements d'un terminal, du plus récent au plus ancien.
    async fn list_recent_events(
        &self,
        terminal_id: TerminalId,
        limit: usize,
    ) -> Result<Vec<TerminalEvent>, StoreError>;

    async fn update_terminal(&self, id: TerminalId, patch: RecordPatch) -> Result<(), StoreError>;

    async fn insert_terminal(&self, new: NewTerminal) -> Result<TerminalRecord, StoreError>;

    async fn delete_terminal(&self, id: TerminalId) -> Result<(), StoreError>;

    async fn insert_event(&self, terminal_id: TerminalId, kind: &str) -> Result<TerminalEvent, StoreError>;

    /// Supprime l'historique d'un terminal, retourne le nombre d'événements effacés.
    async fn delete_events_for(&self, terminal_id: TerminalId) -> Result<usize, StoreError>;

    fn subscribe(&self, filter: SubscriptionFilter) -> Subscription;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionFilter {
    Terminals,
    EventsFor(TerminalId),
}

impl SubscriptionFilter {
    pub fn matches(&self, notification: &ChangeNotification) -> bool {
        match (self, &notification.record) {
            (SubscriptionFilter::Terminals, ChangeRecord::Terminals(_)) => true,
            (SubscriptionFilter::EventsFor(id), ChangeRecord::Events(event)) => event.terminal_id == *id,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SubscriptionError {
    /// Le récepteur a pris du retard : `0` notifications sont perdues.
    #[error("{0} notifications dropped")]
    Lagged(u64),
    #[error("store closed")]
    Closed,
}

/// Canal push filtré. Dropper la subscription la désabonne.
pub struct Subscription {
    rx: broadcast::Receiver<ChangeNotification>,
    filter: SubscriptionFilter,
}

impl Subscription {
    pub fn new(rx: broadcast::Receiver<ChangeNotification>, filter: SubscriptionFilter) -> Self {
        Self { rx, filter }
    }

    #[cfg(test)]
    pub fn filter(&self) -> SubscriptionFilter {
        self.filter
    }

    /// Prochaine notification correspondant au filtre.
    /// Annulable sans perte : utilisable dans un `select!`. Après `Lagged`, la
    /// subscription reste utilisable et reprend aux notifications suivantes.
    pub async fn recv(&mut self) -> Result<ChangeNotification, SubscriptionError> {
        loop {
            match self.rx.recv().await {
                Ok(notification) if self.filter.matches(&notification) => return Ok(notification),
                Ok(_) => continue,
                Err(RecvError::Lagged(skipped)) => {
                    warn!(filter = ?self.filter, skipped, "subscription lagged, notifications dropped");
                    return Err(SubscriptionError::Lagged(skipped));
                }
                Err(RecvError::Closed) => return Err(SubscriptionError::Closed),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ChangeType;
    use time::OffsetDateTime;

    fn event_for(terminal_id: TerminalId) -> ChangeNotification {
        ChangeNotification::event(TerminalEvent {
            id: 1,
            terminal_id,
            kind: "ONLINE".into(),
            created_at: OffsetDateTime::UNIX_EPOCH,
        })
    }

    #[test]
    fn filters_route_by_table_and_terminal() {
        let update = ChangeNotification::terminal(ChangeType::Update, TerminalRecord::default());

        assert!(SubscriptionFilter::Terminals.matches(&update));
        assert!(!SubscriptionFilter::Terminals.matches(&event_for(4)));
        assert!(SubscriptionFilter::EventsFor(4).matches(&event_for(4)));
        assert!(!SubscriptionFilter::EventsFor(3).matches(&event_for(4)));
        assert!(!SubscriptionFilter::EventsFor(4).matches(&update));
    }

    #[tokio::test]
    async fn subscription_skips_foreign_notifications() {
        let (tx, rx) = broadcast::channel(8);
        let mut sub = Subscription::new(rx, SubscriptionFilter::EventsFor(3));

        tx.send(event_for(5)).unwrap();
        tx.send(event_for(3)).unwrap();
        drop(tx);

        let got = sub.recv().await.unwrap();
        assert!(matches!(got.record, ChangeRecord::Events(ref e) if e.terminal_id == 3));
        assert_eq!(sub.recv().await.unwrap_err(), SubscriptionError::Closed);
    }

    #[tokio::test]
    async fn overflow_is_reported_then_delivery_resumes() {
        let (tx, rx) = broadcast::channel(2);
        let mut sub = Subscription::new(rx, SubscriptionFilter::EventsFor(3));
        for _ in 0..5 {
            tx.send(event_for(3)).unwrap();
        }

        assert_eq!(sub.recv().await.unwrap_err(), SubscriptionError::Lagged(3));
        assert!(sub.recv().await.is_ok());
        assert!(sub.recv().await.is_ok());
    }
}
