/**
 * TIMELINE - Historique borné des événements d'un terminal
 *
 * RÔLE :
 * Liste d'événements affichée par la vue détail, alimentée par deux sources :
 * le fetch historique ponctuel et le flux live des insertions.
 *
 * FONCTIONNEMENT :
 * - l'une ou l'autre source peut arriver en premier
 * - fusion par id d'événement : jamais de doublon
 * - toujours du plus récent au plus ancien, tronquée à la limite
 */

use crate::models::{TerminalEvent, TerminalId};
use std::cmp::Ordering;
use std::collections::HashSet;
use tracing::warn;

pub const TIMELINE_LIMIT: usize = crate::store::RECENT_EVENTS_LIMIT;

#[derive(Debug, Clone)]
pub struct Timeline {
    terminal_id: TerminalId,
    limit: usize,
    events: Vec<TerminalEvent>,
    history_loaded: bool,
}

/// Plus récent d'abord ; à horodatage égal, l'id le plus haut.
fn newest_first(a: &TerminalEvent, b: &TerminalEvent) -> Ordering {
    b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id))
}

impl Timeline {
    pub fn new(terminal_id: TerminalId, limit: usize) -> Self {
        Self {
            terminal_id,
            limit: limit.max(1),
            events: Vec::with_capacity(limit + 1),
            history_loaded: false,
        }
    }

    pub fn events(&self) -> &[TerminalEvent] {
        &self.events
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.events.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn history_loaded(&self) -> bool {
        self.history_loaded
    }

    /// Fusionne une insertion live. false pour un doublon ou un événement
    /// d'un autre terminal.
    pub fn push_live(&mut self, event: TerminalEvent) -> bool {
        if event.terminal_id != self.terminal_id {
            warn!(
                expected = self.terminal_id,
                got = event.terminal_id,
                "event delivered to the wrong timeline, dropped"
            );
            return false;
        }
        if self.events.iter().any(|e| e.id == event.id) {
            return false;
        }
        let at = self
            .events
            .binary_search_by(|held| newest_first(held, &event))
            .unwrap_or_else(|i| i);
        self.events.insert(at, event);
        self.events.truncate(self.limit);
        true
    }

    /// Fusionne le fetch historique, retourne le nombre d'événements ajoutés.
    pub fn merge_history(&mut self, history: Vec<TerminalEvent>) -> usize {
        self.history_loaded = true;
        let mut seen: HashSet<u64> = self.events.iter().map(|e| e.id).collect();
        let before = self.events.len();
        for event in history {
            if event.terminal_id == self.terminal_id && seen.insert(event.id) {
                self.events.push(event);
            }
        }
        let added = self.events.len() - before;
        self.events.sort_by(newest_first);
        self.events.truncate(self.limit);
        added
    }
}
