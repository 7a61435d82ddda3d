/**
 * VUE DÉTAIL - Terminal inspecté par l'opérateur
 *
 * RÔLE :
 * Copie du terminal ouvert et sa timeline live, limitées à la session de
 * consultation. Une seule vue à la fois, possédée par le moteur.
 *
 * FONCTIONNEMENT :
 * - generation incrémentée à chaque ouverture : un fetch d'une génération
 *   antérieure est périmé
 * - DetailSnapshot = forme sérialisée exposée par l'API
 */

use crate::models::{Terminal, TerminalEvent, TerminalId};
use crate::timeline::Timeline;
use serde::Serialize;

#[derive(Debug, Clone)]
pub struct DetailView {
    pub generation: u64,
    pub terminal: Terminal,
    pub timeline: Timeline,
}

impl DetailView {
    pub fn open(generation: u64, terminal: Terminal, timeline_limit: usize) -> Self {
        let timeline = Timeline::new(terminal.id, timeline_limit);
        Self { generation, terminal, timeline }
    }

    pub fn terminal_id(&self) -> TerminalId {
        self.terminal.id
    }

    pub fn snapshot(&self) -> DetailSnapshot {
        DetailSnapshot {
            terminal: self.terminal.clone(),
            timeline: self.timeline.events().to_vec(),
            history_loaded: self.timeline.history_loaded(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DetailSnapshot {
    pub terminal: Terminal,
    pub timeline: Vec<TerminalEvent>,
    pub history_loaded: bool,
}
