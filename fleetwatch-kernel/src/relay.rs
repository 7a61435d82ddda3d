/**
 * AGENT COMMAND RELAY - Commandes du store vers les agents terminaux
 *
 * RÔLE :
 * Les commandes opérateur sont écrites dans le store, que les agents ne lisent
 * pas. Le relay observe le canal push et publie sur MQTT chaque nouveau trigger
 * de capture : l'agent y répond par un screenshot_url au heartbeat suivant.
 *
 * FONCTIONNEMENT :
 * - trigger différent du dernier vu pour ce terminal => commande "snapshot"
 * - premier passage d'un terminal après démarrage => trigger courant republié,
 *   l'agent ignore un trigger qu'il a déjà servi
 * - notifications perdues => rattrapé au heartbeat suivant (la ligne complète
 *   porte toujours le trigger)
 */

use crate::models::{ChangeNotification, ChangeRecord, ChangeType, TerminalId};
use crate::store::{CanonicalStore, SubscriptionError, SubscriptionFilter};
use rumqttc::{AsyncClient, QoS};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use time::OffsetDateTime;
use tokio::task::{self, JoinHandle};
use tracing::{error, info, warn};
use uuid::Uuid;

pub const COMMAND_TOPIC: &str = "fleetwatch/terminals/command@v1";
pub const SNAPSHOT_COMMAND: &str = "snapshot";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentCommand {
    pub command_id: String,
    pub terminal_id: TerminalId,
    pub command_type: String,
    pub refresh_trigger: u64,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

impl AgentCommand {
    pub fn snapshot(terminal_id: TerminalId, refresh_trigger: u64) -> Self {
        Self {
            command_id: Uuid::new_v4().to_string(),
            terminal_id,
            command_type: SNAPSHOT_COMMAND.to_string(),
            refresh_trigger,
            timestamp: OffsetDateTime::now_utc(),
        }
    }
}

/// Dernier trigger relayé par terminal.
#[derive(Debug, Default)]
pub struct CommandRelay {
    relayed: HashMap<TerminalId, u64>,
}

impl CommandRelay {
    /// Commande à publier pour cette notification, s'il y en a une.
    pub fn observe(&mut self, notification: &ChangeNotification) -> Option<AgentCommand> {
        let ChangeRecord::Terminals(record) = &notification.record else {
            return None;
        };
        if notification.change_type == ChangeType::Delete {
            self.relayed.remove(&record.id);
            return None;
        }
        let trigger = record.refresh_trigger?;
        if self.relayed.insert(record.id, trigger) == Some(trigger) {
            return None;
        }
        Some(AgentCommand::snapshot(record.id, trigger))
    }
}

pub fn spawn_command_relay(client: AsyncClient, store: Arc<dyn CanonicalStore>) -> JoinHandle<()> {
    let mut sub = store.subscribe(SubscriptionFilter::Terminals);

    task::spawn(async move {
        let mut relay = CommandRelay::default();
        loop {
            let notification = match sub.recv().await {
                Ok(notification) => notification,
                Err(SubscriptionError::Lagged(skipped)) => {
                    warn!(skipped, "command relay lagged, triggers resent on next heartbeat");
                    continue;
                }
                Err(SubscriptionError::Closed) => {
                    error!("store push channel closed, command relay stopped");
                    break;
                }
            };
            let Some(command) = relay.observe(&notification) else { continue };
            let payload = match serde_json::to_vec(&command) {
                Ok(payload) => payload,
                Err(e) => {
                    warn!(error = %e, "agent command not serializable");
                    continue;
                }
            };
            match client.publish(COMMAND_TOPIC, QoS::AtLeastOnce, false, payload).await {
                Ok(()) => info!(
                    terminal_id = command.terminal_id,
                    trigger = command.refresh_trigger,
                    "snapshot command relayed to agent"
                ),
                Err(e) => warn!(terminal_id = command.terminal_id, error = ?e, "failed to relay agent command"),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TerminalRecord;

    fn update(id: TerminalId, trigger: Option<u64>) -> ChangeNotification {
        ChangeNotification::terminal(
            ChangeType::Update,
            TerminalRecord { id, refresh_trigger: trigger, ..Default::default() },
        )
    }

    #[test]
    fn only_new_triggers_are_relayed() {
        let mut relay = CommandRelay::default();

        assert!(relay.observe(&update(1, None)).is_none());
        let command = relay.observe(&update(1, Some(4242))).unwrap();
        assert_eq!(command.terminal_id, 1);
        assert_eq!(command.command_type, SNAPSHOT_COMMAND);
        assert_eq!(command.refresh_trigger, 4242);

        // heartbeats suivants : même ligne, même trigger
        assert!(relay.observe(&update(1, Some(4242))).is_none());
        assert!(relay.observe(&update(1, Some(4243))).is_some());
    }

    #[test]
    fn deleted_terminal_is_forgotten() {
        let mut relay = CommandRelay::default();
        relay.observe(&update(2, Some(9)));

        let deleted = ChangeNotification::terminal(
            ChangeType::Delete,
            TerminalRecord { id: 2, refresh_trigger: Some(9), ..Default::default() },
        );
        assert!(relay.observe(&deleted).is_none());
        assert!(relay.observe(&update(2, Some(9))).is_some());
    }

    #[test]
    fn command_payload_shape() {
        let json = serde_json::to_value(AgentCommand::snapshot(3, 77)).unwrap();
        assert_eq!(json["terminal_id"], 3);
        assert_eq!(json["command_type"], "snapshot");
        assert_eq!(json["refresh_trigger"], 77);
        assert!(json["timestamp"].is_string());
    }
}
