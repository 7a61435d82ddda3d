/**
 * TERMINAL REGISTRY - État en mémoire de la flotte
 *
 * RÔLE :
 * Source de vérité locale pour tous les consommateurs (API, health, vue détail).
 * Possédé exclusivement par la boucle du moteur : aucun verrou, aucune global.
 *
 * RÈGLES DE FUSION :
 * - upsert_from_heartbeat_source : insère seulement si l'id est absent
 *   (un fetch initial tardif n'écrase jamais un état plus frais)
 * - apply_patch : fusion champ par champ, capture d'écran jamais régressée
 * - patch sur id inconnu : no-op journalisé (course normale avec le fetch)
 */

use crate::models::{
    Metrics, StatusCounts, Terminal, TerminalId, TerminalPatch, TerminalRecord, TerminalStatus,
};
use std::collections::BTreeMap;
use time::OffsetDateTime;
use tracing::debug;

/// Dernier fold effectué : le heartbeat consommé et le cumul qui en a résulté.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FoldMark {
    heartbeat: OffsetDateTime,
    daily_uptime: u64,
}

#[derive(Debug, Clone)]
struct Entry {
    terminal: Terminal,
    last_fold: Option<FoldMark>,
}

/// Résultat d'une démotion OFFLINE. Les deux cas s'écrivent dans le store.
#[derive(Debug, Clone, PartialEq)]
pub enum Demotion {
    /// Session repliée dans le cumul journalier.
    Folded { daily_uptime: u64, metrics: Metrics },
    /// Ce heartbeat avait déjà été replié : le cumul marqué est repris tel quel.
    AlreadyFolded { daily_uptime: u64, metrics: Metrics },
}

#[derive(Debug, Default)]
pub struct Registry {
    entries: BTreeMap<TerminalId, Entry>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: TerminalId) -> Option<&Terminal> {
        self.entries.get(&id).map(|e| &e.terminal)
    }

    pub fn contains(&self, id: TerminalId) -> bool {
        self.entries.contains_key(&id)
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Snapshots triés par id.
    pub fn list(&self) -> Vec<Terminal> {
        self.entries.values().map(|e| e.terminal.clone()).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Terminal> {
        self.entries.values().map(|e| &e.terminal)
    }

    /// Insère le terminal s'il est inconnu. Retourne false si déjà présent.
    pub fn upsert_from_heartbeat_source(&mut self, record: &TerminalRecord) -> bool {
        if self.entries.contains_key(&record.id) {
            debug!(terminal_id = record.id, "terminal already known, insert skipped");
            return false;
        }
        self.entries.insert(
            record.id,
            Entry { terminal: Terminal::from_record(record), last_fold: None },
        );
        true
    }

    /// Fusionne un patch. Retourne true si l'état a changé.
    pub fn apply_patch(&mut self, id: TerminalId, patch: &TerminalPatch) -> bool {
        match self.entries.get_mut(&id) {
            Some(entry) => patch.apply_to(&mut entry.terminal),
            None => {
                debug!(terminal_id = id, "patch for unknown terminal ignored");
                false
            }
        }
    }

    pub fn remove(&mut self, id: TerminalId) -> Option<Terminal> {
        self.entries.remove(&id).map(|e| e.terminal)
    }

    /// Passe le terminal OFFLINE et replie la session courante dans le cumul
    /// journalier, une seule fois par heartbeat. None si le terminal est inconnu
    /// ou déjà OFFLINE.
    pub fn demote_offline(&mut self, id: TerminalId) -> Option<Demotion> {
        let entry = self.entries.get_mut(&id)?;
        let terminal = &mut entry.terminal;
        if terminal.status == TerminalStatus::Offline {
            return None;
        }
        let session_uptime = terminal.metrics.uptime;
        terminal.status = TerminalStatus::Offline;
        terminal.metrics.uptime = 0;
        terminal.metrics.is_active = false;

        if let Some(mark) = entry.last_fold.filter(|m| m.heartbeat == terminal.last_heartbeat) {
            terminal.daily_uptime = mark.daily_uptime;
            return Some(Demotion::AlreadyFolded {
                daily_uptime: mark.daily_uptime,
                metrics: terminal.metrics.clone(),
            });
        }

        terminal.daily_uptime = terminal.daily_uptime.saturating_add(session_uptime);
        entry.last_fold = Some(FoldMark {
            heartbeat: terminal.last_heartbeat,
            daily_uptime: terminal.daily_uptime,
        });
        Some(Demotion::Folded {
            daily_uptime: terminal.daily_uptime,
            metrics: terminal.metrics.clone(),
        })
    }

    pub fn counts(&self) -> StatusCounts {
        let mut counts = StatusCounts::default();
        for terminal in self.iter() {
            counts.record(terminal.status);
        }
        counts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    fn record(id: TerminalId) -> TerminalRecord {
        TerminalRecord {
            id,
            status: Some(TerminalStatus::Online),
            last_seen: Some(datetime!(2026-10-19 10:00 UTC)),
            daily_uptime: 600,
            metrics: Some(Metrics { uptime: 120, is_active: true, ..Default::default() }),
            ..Default::default()
        }
    }

    fn heartbeat_patch(at: OffsetDateTime, uptime: u64) -> TerminalPatch {
        TerminalPatch {
            status: Some(TerminalStatus::Online),
            last_heartbeat: Some(at),
            metrics: Some(Metrics { uptime, is_active: true, ..Default::default() }),
            ..Default::default()
        }
    }

    #[test]
    fn list_is_ordered_by_id() {
        let mut registry = Registry::new();
        for id in [5, 1, 3] {
            registry.upsert_from_heartbeat_source(&record(id));
        }
        let ids: Vec<_> = registry.list().iter().map(|t| t.id).collect();
        assert_eq!(ids, vec![1, 3, 5]);
    }

    #[test]
    fn insert_never_clobbers_existing_entry() {
        let mut registry = Registry::new();
        registry.upsert_from_heartbeat_source(&record(3));
        registry.apply_patch(3, &heartbeat_patch(datetime!(2026-10-19 10:05 UTC), 420));

        let stale = record(3);
        assert!(!registry.upsert_from_heartbeat_source(&stale));
        assert_eq!(registry.get(3).unwrap().metrics.uptime, 420);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn patch_twice_equals_patch_once() {
        let mut once = Registry::new();
        once.upsert_from_heartbeat_source(&record(2));
        let mut twice = Registry::new();
        twice.upsert_from_heartbeat_source(&record(2));

        let patch = TerminalPatch {
            name: Some("Corner PC".into()),
            ip_address: Some("192.168.1.22".into()),
            ..heartbeat_patch(datetime!(2026-10-19 10:01 UTC), 180)
        };
        assert!(once.apply_patch(2, &patch));
        twice.apply_patch(2, &patch);
        assert!(!twice.apply_patch(2, &patch));

        assert_eq!(once.get(2), twice.get(2));
    }

    #[test]
    fn patch_for_unknown_id_is_a_noop() {
        let mut registry = Registry::new();
        assert!(!registry.apply_patch(42, &TerminalPatch::default()));
        assert!(registry.is_empty());
    }

    #[test]
    fn demotion_folds_session_exactly_once() {
        let mut registry = Registry::new();
        registry.upsert_from_heartbeat_source(&record(3));

        let demotion = registry.demote_offline(3).unwrap();
        assert!(matches!(demotion, Demotion::Folded { daily_uptime: 720, .. }));
        let terminal = registry.get(3).unwrap();
        assert_eq!(terminal.status, TerminalStatus::Offline);
        assert_eq!(terminal.metrics.uptime, 0);
        assert!(!terminal.metrics.is_active);

        assert_eq!(registry.demote_offline(3), None);
        assert_eq!(registry.get(3).unwrap().daily_uptime, 720);
    }

    #[test]
    fn redelivered_heartbeat_is_not_folded_again() {
        let mut registry = Registry::new();
        registry.upsert_from_heartbeat_source(&record(3));
        registry.demote_offline(3);

        // replay of the pre-demotion row revives the terminal with the old cumul
        let replay = TerminalPatch {
            daily_uptime: Some(600),
            ..heartbeat_patch(datetime!(2026-10-19 10:00 UTC), 120)
        };
        registry.apply_patch(3, &replay);
        assert_eq!(registry.get(3).unwrap().status, TerminalStatus::Online);

        let demotion = registry.demote_offline(3).unwrap();
        assert!(matches!(demotion, Demotion::AlreadyFolded { daily_uptime: 720, .. }));
        assert_eq!(registry.get(3).unwrap().daily_uptime, 720);
    }

    #[test]
    fn new_session_after_revival_folds_again() {
        let mut registry = Registry::new();
        registry.upsert_from_heartbeat_source(&record(3));
        registry.demote_offline(3);

        registry.apply_patch(3, &heartbeat_patch(datetime!(2026-10-19 11:00 UTC), 60));
        let demotion = registry.demote_offline(3).unwrap();
        assert!(matches!(demotion, Demotion::Folded { daily_uptime: 780, .. }));
    }

    #[test]
    fn counts_by_status() {
        let mut registry = Registry::new();
        registry.upsert_from_heartbeat_source(&record(1));
        registry.upsert_from_heartbeat_source(&record(2));
        registry.upsert_from_heartbeat_source(&TerminalRecord { id: 3, ..Default::default() });
        registry.demote_offline(2);

        let counts = registry.counts();
        assert_eq!((counts.online, counts.offline, counts.total()), (1, 2, 3));
        assert!(registry.remove(3).is_some());
        assert!(!registry.contains(3));
    }
}
