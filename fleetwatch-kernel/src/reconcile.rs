/**
 * RECONCILIATION - Application des notifications push du store
 *
 * RÔLE :
 * Traduit chaque notification de la table terminals en mutation du registre,
 * et garde la copie de la vue détail alignée sur la liste.
 *
 * RÈGLES :
 * - INSERT : ajout seulement si l'id est absent (doublon du fetch initial)
 * - UPDATE : patch champ par champ, même patch sur la vue détail ouverte
 * - UPDATE vers OFFLINE d'un terminal vivant avec une session en cours
 *   (shutdown, agent qui s'arrête) : la session est repliée comme au sweep
 * - DELETE : retrait du registre, fermeture de la vue détail concernée
 * - redélivrance : idempotente, réappliquer les mêmes valeurs ne change rien
 * - resync (après perte de notifications) : la liste du store fait foi, sauf
 *   pour les ids déjà touchés par une notification plus récente
 */

use crate::detail::DetailView;
use crate::models::{
    ChangeNotification, ChangeRecord, ChangeType, TerminalId, TerminalPatch, TerminalRecord, TerminalStatus,
};
use crate::registry::Registry;
use crate::sweeper::FoldWrite;
use std::collections::HashSet;
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq)]
pub enum Reconciled {
    Inserted(TerminalId),
    DuplicateInsert(TerminalId),
    Patched { id: TerminalId, changed: bool },
    /// Passage OFFLINE hors sweep : session repliée, écriture durable due.
    Folded(FoldWrite),
    UnknownTerminal(TerminalId),
    Removed { id: TerminalId, detail_closed: bool },
    /// Notification d'une autre table, rien à faire ici.
    NotApplicable,
}

pub fn apply_terminal_change(
    registry: &mut Registry,
    detail: &mut Option<DetailView>,
    notification: &ChangeNotification,
) -> Reconciled {
    let ChangeRecord::Terminals(record) = &notification.record else {
        return Reconciled::NotApplicable;
    };
    let id = record.id;

    match notification.change_type {
        ChangeType::Insert => {
            if registry.upsert_from_heartbeat_source(record) {
                debug!(terminal_id = id, "terminal added from push channel");
                Reconciled::Inserted(id)
            } else {
                Reconciled::DuplicateInsert(id)
            }
        }
        ChangeType::Update => {
            if !registry.contains(id) {
                debug!(terminal_id = id, "update for terminal not yet fetched, ignored");
                return Reconciled::UnknownTerminal(id);
            }
            let mut patch = TerminalPatch::from_record(record);
            let going_offline = patch.status == Some(TerminalStatus::Offline)
                && registry.get(id).is_some_and(|t| {
                    let uptime = patch.metrics.as_ref().map_or(t.metrics.uptime, |m| m.uptime);
                    t.status != TerminalStatus::Offline && uptime > 0
                });
            if going_offline {
                // le statut passe par la démotion, qui replie la session
                patch.status = None;
            }
            let changed = registry.apply_patch(id, &patch);
            let fold = going_offline.then(|| registry.demote_offline(id)).flatten();
            if let Some(view) = detail.as_mut().filter(|v| v.terminal_id() == id) {
                if let Some(terminal) = registry.get(id) {
                    view.terminal = terminal.clone();
                }
            }
            match fold {
                Some(demotion) => {
                    info!(terminal_id = id, "terminal went offline, session folded");
                    Reconciled::Folded(FoldWrite::from_demotion(id, demotion))
                }
                None => Reconciled::Patched { id, changed },
            }
        }
        ChangeType::Delete => {
            registry.remove(id);
            let detail_closed = detail.as_ref().is_some_and(|v| v.terminal_id() == id);
            if detail_closed {
                *detail = None;
            }
            Reconciled::Removed { id, detail_closed }
        }
    }
}

/// Bilan d'une resynchronisation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Resynced {
    pub inserted: usize,
    pub patched: usize,
    pub removed: usize,
    pub detail_closed: bool,
}

/// Aligne le registre sur la liste complète du store. Les ids de `fresher`
/// ont reçu une notification depuis le début du resync : leur état local est
/// plus récent que la liste et n'est pas touché.
pub fn resync(
    registry: &mut Registry,
    detail: &mut Option<DetailView>,
    records: &[TerminalRecord],
    fresher: &HashSet<TerminalId>,
) -> Resynced {
    let mut outcome = Resynced::default();
    let listed: HashSet<TerminalId> = records.iter().map(|r| r.id).collect();

    for record in records.iter().filter(|r| !fresher.contains(&r.id)) {
        if registry.upsert_from_heartbeat_source(record) {
            outcome.inserted += 1;
        } else if registry.apply_patch(record.id, &TerminalPatch::from_record(record)) {
            outcome.patched += 1;
        }
    }

    let vanished: Vec<TerminalId> = registry
        .iter()
        .map(|t| t.id)
        .filter(|id| !listed.contains(id) && !fresher.contains(id))
        .collect();
    for id in vanished {
        registry.remove(id);
        outcome.removed += 1;
    }

    match detail.as_ref().map(DetailView::terminal_id) {
        Some(id) if registry.get(id).is_none() => {
            *detail = None;
            outcome.detail_closed = true;
        }
        Some(id) => {
            if let (Some(view), Some(terminal)) = (detail.as_mut(), registry.get(id)) {
                view.terminal = terminal.clone();
            }
        }
        None => {}
    }
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Metrics, Terminal, TerminalRecord, TerminalStatus};
    use crate::timeline::TIMELINE_LIMIT;
    use time::macros::datetime;

    fn row(id: TerminalId, status: TerminalStatus, uptime: u64) -> TerminalRecord {
        TerminalRecord {
            id,
            name: Some(format!("PC-{id}")),
            status: Some(status),
            last_seen: Some(datetime!(2026-10-19 14:00 UTC)),
            ip_address: Some(format!("10.0.0.{id}")),
            metrics: Some(Metrics { uptime, ..Default::default() }),
            ..Default::default()
        }
    }

    fn insert(record: TerminalRecord) -> ChangeNotification {
        ChangeNotification::terminal(ChangeType::Insert, record)
    }

    fn update(record: TerminalRecord) -> ChangeNotification {
        ChangeNotification::terminal(ChangeType::Update, record)
    }

    #[test]
    fn duplicate_insert_is_a_noop() {
        let mut registry = Registry::new();
        let mut detail = None;
        let first = insert(row(3, TerminalStatus::Online, 10));
        assert_eq!(apply_terminal_change(&mut registry, &mut detail, &first), Reconciled::Inserted(3));

        let again = insert(row(3, TerminalStatus::Offline, 0));
        assert_eq!(
            apply_terminal_change(&mut registry, &mut detail, &again),
            Reconciled::DuplicateInsert(3)
        );
        assert_eq!(registry.get(3).unwrap().status, TerminalStatus::Online);
    }

    #[test]
    fn late_heartbeat_revives_demoted_terminal() {
        let mut registry = Registry::new();
        let mut detail = None;
        apply_terminal_change(&mut registry, &mut detail, &insert(row(2, TerminalStatus::Online, 50)));
        registry.demote_offline(2);

        let heartbeat = update(TerminalRecord {
            last_seen: Some(datetime!(2026-10-19 14:01 UTC)),
            ..row(2, TerminalStatus::Online, 60)
        });
        let outcome = apply_terminal_change(&mut registry, &mut detail, &heartbeat);

        assert_eq!(outcome, Reconciled::Patched { id: 2, changed: true });
        assert_eq!(registry.get(2).unwrap().status, TerminalStatus::Online);
    }

    #[test]
    fn redelivered_update_is_idempotent() {
        let mut registry = Registry::new();
        let mut detail = None;
        apply_terminal_change(&mut registry, &mut detail, &insert(row(1, TerminalStatus::Idle, 5)));

        let note = update(row(1, TerminalStatus::Online, 15));
        apply_terminal_change(&mut registry, &mut detail, &note);
        let once = registry.get(1).cloned();
        let outcome = apply_terminal_change(&mut registry, &mut detail, &note);

        assert_eq!(outcome, Reconciled::Patched { id: 1, changed: false });
        assert_eq!(registry.get(1).cloned(), once);
    }

    #[test]
    fn update_mirrors_into_open_detail_view() {
        let mut registry = Registry::new();
        let mut detail = None;
        apply_terminal_change(&mut registry, &mut detail, &insert(TerminalRecord {
            screenshot_url: Some("https://cdn.example/pc4.jpg".into()),
            ..row(4, TerminalStatus::Online, 5)
        }));
        let copy: Terminal = registry.get(4).unwrap().clone();
        detail = Some(DetailView::open(1, copy, TIMELINE_LIMIT));

        apply_terminal_change(&mut registry, &mut detail, &update(TerminalRecord {
            name: None,
            ..row(4, TerminalStatus::Maintenance, 9)
        }));

        let view = detail.as_ref().unwrap();
        assert_eq!(view.terminal.status, TerminalStatus::Maintenance);
        assert_eq!(view.terminal.name, "TERMINAL-04");
        assert_eq!(view.terminal.screenshot_url.as_deref(), Some("https://cdn.example/pc4.jpg"));
        assert_eq!(Some(&view.terminal), registry.get(4));
    }

    #[test]
    fn update_for_other_terminal_leaves_detail_alone() {
        let mut registry = Registry::new();
        let mut detail = None;
        apply_terminal_change(&mut registry, &mut detail, &insert(row(1, TerminalStatus::Online, 5)));
        apply_terminal_change(&mut registry, &mut detail, &insert(row(2, TerminalStatus::Online, 5)));
        detail = Some(DetailView::open(1, registry.get(1).unwrap().clone(), TIMELINE_LIMIT));

        apply_terminal_change(&mut registry, &mut detail, &update(row(2, TerminalStatus::Idle, 7)));
        assert_eq!(detail.unwrap().terminal.status, TerminalStatus::Online);
    }

    #[test]
    fn update_racing_ahead_of_fetch_is_ignored() {
        let mut registry = Registry::new();
        let mut detail = None;
        let outcome = apply_terminal_change(&mut registry, &mut detail, &update(row(8, TerminalStatus::Online, 1)));
        assert_eq!(outcome, Reconciled::UnknownTerminal(8));
        assert!(registry.is_empty());
    }

    #[test]
    fn shutdown_of_live_terminal_folds_its_session() {
        let mut registry = Registry::new();
        let mut detail = None;
        apply_terminal_change(&mut registry, &mut detail, &insert(TerminalRecord {
            daily_uptime: 600,
            ..row(6, TerminalStatus::Online, 120)
        }));
        detail = Some(DetailView::open(1, registry.get(6).unwrap().clone(), TIMELINE_LIMIT));

        // ligne après la commande shutdown : métriques du dernier heartbeat
        let shutdown = update(TerminalRecord { daily_uptime: 600, ..row(6, TerminalStatus::Offline, 120) });
        let Reconciled::Folded(write) = apply_terminal_change(&mut registry, &mut detail, &shutdown) else {
            panic!("expected a fold");
        };
        assert_eq!(write.terminal_id, 6);
        assert_eq!(write.daily_uptime, 720);
        assert_eq!(write.metrics.uptime, 0);

        let terminal = registry.get(6).unwrap();
        assert_eq!(terminal.status, TerminalStatus::Offline);
        assert_eq!(terminal.daily_uptime, 720);
        assert_eq!(Some(&detail.unwrap().terminal), registry.get(6));

        // l'écriture du fold revient par le push : plus rien à replier
        let echoed = update(TerminalRecord { daily_uptime: 720, ..row(6, TerminalStatus::Offline, 0) });
        assert_eq!(
            apply_terminal_change(&mut registry, &mut None, &echoed),
            Reconciled::Patched { id: 6, changed: false }
        );
        assert_eq!(registry.get(6).unwrap().daily_uptime, 720);
    }

    #[test]
    fn offline_update_without_session_is_a_plain_patch() {
        let mut registry = Registry::new();
        let mut detail = None;
        apply_terminal_change(&mut registry, &mut detail, &insert(row(7, TerminalStatus::Maintenance, 0)));

        let outcome = apply_terminal_change(&mut registry, &mut detail, &update(row(7, TerminalStatus::Offline, 0)));
        assert_eq!(outcome, Reconciled::Patched { id: 7, changed: true });
        assert_eq!(registry.get(7).unwrap().status, TerminalStatus::Offline);
    }

    #[test]
    fn resync_restores_missed_inserts_updates_and_deletes() {
        let mut registry = Registry::new();
        let mut detail = None;
        for id in [1, 2, 3] {
            apply_terminal_change(&mut registry, &mut detail, &insert(row(id, TerminalStatus::Online, 5)));
        }
        detail = Some(DetailView::open(1, registry.get(3).unwrap().clone(), TIMELINE_LIMIT));

        // store : 1 mis à jour, 2 touché par une notification récente, 3 supprimé, 4 ajouté
        let listed = vec![
            row(1, TerminalStatus::Idle, 40),
            row(2, TerminalStatus::Offline, 0),
            row(4, TerminalStatus::Online, 1),
        ];
        let fresher = HashSet::from([2]);
        let outcome = resync(&mut registry, &mut detail, &listed, &fresher);

        assert_eq!(outcome, Resynced { inserted: 1, patched: 1, removed: 1, detail_closed: true });
        assert_eq!(registry.get(1).unwrap().status, TerminalStatus::Idle);
        assert_eq!(registry.get(2).unwrap().status, TerminalStatus::Online);
        assert!(registry.get(3).is_none());
        assert!(registry.get(4).is_some());
        assert!(detail.is_none());
    }

    #[test]
    fn delete_closes_matching_detail_view() {
        let mut registry = Registry::new();
        let mut detail = None;
        apply_terminal_change(&mut registry, &mut detail, &insert(row(5, TerminalStatus::Online, 5)));
        detail = Some(DetailView::open(1, registry.get(5).unwrap().clone(), TIMELINE_LIMIT));

        let outcome = apply_terminal_change(
            &mut registry,
            &mut detail,
            &ChangeNotification::terminal(ChangeType::Delete, row(5, TerminalStatus::Online, 5)),
        );
        assert_eq!(outcome, Reconciled::Removed { id: 5, detail_closed: true });
        assert!(detail.is_none());
        assert!(registry.is_empty());
    }
}
