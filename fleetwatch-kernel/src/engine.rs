/**
 * FLEET ENGINE - Boucle de consolidation unique
 *
 * RÔLE :
 * Seul propriétaire du registre et de la vue détail. Tous les points de
 * mutation (tick du sweeper, notifications push, ouverture/fermeture de la vue
 * détail, résultats de fetch) sont des messages traités jusqu'au bout, un à la
 * fois : aucun verrou sur le registre.
 *
 * FONCTIONNEMENT :
 * - abonnement terminals AVANT le fetch initial (pas de trou entre les deux)
 * - les I/O store sont lancées hors boucle et reviennent par message
 * - la vue détail a sa propre subscription, droppée avant d'en ouvrir une autre
 * - notifications perdues => resync complet (terminaux) ou refetch de l'historique (détail)
 * - les consommateurs lisent des snapshots immuables via un canal watch
 */

use crate::config::LivenessConf;
use crate::detail::{DetailSnapshot, DetailView};
use crate::models::{ChangeNotification, ChangeRecord, StatusCounts, Terminal, TerminalEvent, TerminalId, TerminalRecord};
use crate::reconcile::{self, Reconciled};
use crate::registry::Registry;
use crate::store::{CanonicalStore, StoreError, Subscription, SubscriptionError, SubscriptionFilter};
use crate::sweeper::{self, FoldWrite, Sweeper};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum EngineError {
    #[error("terminal {0} not found")]
    UnknownTerminal(TerminalId),
    #[error("engine stopped")]
    Stopped,
}

/// Vue immuable publiée après chaque message traité.
#[derive(Debug, Clone, Serialize)]
pub struct FleetSnapshot {
    pub terminals: Vec<Terminal>,
    pub counts: StatusCounts,
    pub detail: Option<DetailSnapshot>,
    pub initial_fetch_done: bool,
}

impl FleetSnapshot {
    fn empty() -> Self {
        Self { terminals: Vec::new(), counts: StatusCounts::default(), detail: None, initial_fetch_done: false }
    }

    pub fn terminal(&self, id: TerminalId) -> Option<&Terminal> {
        self.terminals.iter().find(|t| t.id == id)
    }
}

pub enum EngineRequest {
    OpenDetail { id: TerminalId, reply: oneshot::Sender<Result<(), EngineError>> },
    CloseDetail { reply: oneshot::Sender<()> },
}

enum Internal {
    InitialFetch(Result<Vec<TerminalRecord>, StoreError>),
    Resync { round: u64, result: Result<Vec<TerminalRecord>, StoreError> },
    History { generation: u64, result: Result<Vec<TerminalEvent>, StoreError> },
}

#[derive(Clone)]
pub struct EngineHandle {
    requests: mpsc::Sender<EngineRequest>,
    snapshots: watch::Receiver<Arc<FleetSnapshot>>,
}

impl EngineHandle {
    pub fn snapshot(&self) -> Arc<FleetSnapshot> {
        self.snapshots.borrow().clone()
    }

    #[cfg(test)]
    pub fn watch(&self) -> watch::Receiver<Arc<FleetSnapshot>> {
        self.snapshots.clone()
    }

    pub async fn open_detail(&self, id: TerminalId) -> Result<(), EngineError> {
        let (reply, rx) = oneshot::channel();
        self.requests
            .send(EngineRequest::OpenDetail { id, reply })
            .await
            .map_err(|_| EngineError::Stopped)?;
        rx.await.map_err(|_| EngineError::Stopped)?
    }

    pub async fn close_detail(&self) -> Result<(), EngineError> {
        let (reply, rx) = oneshot::channel();
        self.requests
            .send(EngineRequest::CloseDetail { reply })
            .await
            .map_err(|_| EngineError::Stopped)?;
        rx.await.map_err(|_| EngineError::Stopped)
    }
}

pub struct FleetEngine {
    store: Arc<dyn CanonicalStore>,
    registry: Registry,
    sweeper: Sweeper,
    sweep_interval: Duration,
    timeline_limit: usize,
    detail: Option<DetailView>,
    detail_sub: Option<Subscription>,
    generation: u64,
    initial_fetch_done: bool,
    terminals_sub: Subscription,
    resync_round: u64,
    /// Resync en vol : ids notifiés depuis son lancement
    resync_fresher: Option<HashSet<TerminalId>>,
    requests: mpsc::Receiver<EngineRequest>,
    internal_tx: mpsc::UnboundedSender<Internal>,
    internal_rx: mpsc::UnboundedReceiver<Internal>,
    snapshots: watch::Sender<Arc<FleetSnapshot>>,
}

impl FleetEngine {
    pub fn new(
        store: Arc<dyn CanonicalStore>,
        liveness: &LivenessConf,
        timeline_limit: usize,
    ) -> (Self, EngineHandle) {
        let (requests_tx, requests) = mpsc::channel(32);
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let (snapshots, snapshots_rx) = watch::channel(Arc::new(FleetSnapshot::empty()));
        let terminals_sub = store.subscribe(SubscriptionFilter::Terminals);

        let engine = Self {
            store,
            registry: Registry::new(),
            sweeper: Sweeper::new(time::Duration::seconds(liveness.stale_threshold_secs as i64)),
            sweep_interval: Duration::from_secs(liveness.sweep_interval_secs.max(1)),
            timeline_limit,
            detail: None,
            detail_sub: None,
            generation: 0,
            initial_fetch_done: false,
            terminals_sub,
            resync_round: 0,
            resync_fresher: None,
            requests,
            internal_tx,
            internal_rx,
            snapshots,
        };
        (engine, EngineHandle { requests: requests_tx, snapshots: snapshots_rx })
    }

    /// Lance la boucle dans une tâche tokio.
    pub fn spawn(
        store: Arc<dyn CanonicalStore>,
        liveness: &LivenessConf,
        timeline_limit: usize,
    ) -> (EngineHandle, JoinHandle<()>) {
        let (engine, handle) = Self::new(store, liveness, timeline_limit);
        (handle, tokio::spawn(engine.run()))
    }

    pub async fn run(mut self) {
        info!(
            sweep_interval_secs = self.sweep_interval.as_secs(),
            stale_threshold_secs = self.sweeper.stale_threshold().whole_seconds(),
            "fleet engine started"
        );
        self.start_initial_fetch();

        let mut sweep = tokio::time::interval(self.sweep_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                request = self.requests.recv() => match request {
                    Some(request) => self.handle_request(request),
                    None => {
                        info!("all engine handles dropped, stopping");
                        break;
                    }
                },
                Some(internal) = self.internal_rx.recv() => self.handle_internal(internal),
                change = self.terminals_sub.recv() => match change {
                    Ok(notification) => self.handle_terminal_change(&notification),
                    Err(SubscriptionError::Lagged(skipped)) => self.start_resync(skipped),
                    Err(SubscriptionError::Closed) => {
                        error!("store push channel closed, stopping engine");
                        break;
                    }
                },
                event = next_detail_event(&mut self.detail_sub) => self.handle_detail_event(event),
                _ = sweep.tick() => self.run_sweep(OffsetDateTime::now_utc()),
            }
            self.publish();
        }
    }

    fn start_initial_fetch(&self) {
        let store = self.store.clone();
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            let result = store.list_terminals().await;
            let _ = tx.send(Internal::InitialFetch(result));
        });
    }

    /// Des notifications terminals ont été perdues : la liste du store fait foi.
    pub(crate) fn start_resync(&mut self, skipped: u64) {
        self.resync_round += 1;
        let round = self.resync_round;
        self.resync_fresher = Some(HashSet::new());
        warn!(skipped, round, "terminal notifications lost, resyncing from store");

        let store = self.store.clone();
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            let result = store.list_terminals().await;
            let _ = tx.send(Internal::Resync { round, result });
        });
    }

    fn handle_request(&mut self, request: EngineRequest) {
        match request {
            EngineRequest::OpenDetail { id, reply } => {
                let _ = reply.send(self.open_detail(id));
            }
            EngineRequest::CloseDetail { reply } => {
                self.close_detail();
                let _ = reply.send(());
            }
        }
    }

    fn handle_internal(&mut self, internal: Internal) {
        match internal {
            Internal::InitialFetch(Ok(records)) => {
                let inserted = records
                    .iter()
                    .filter(|record| self.registry.upsert_from_heartbeat_source(record))
                    .count();
                self.initial_fetch_done = true;
                info!(fetched = records.len(), inserted, "initial terminal fetch applied");
            }
            Internal::InitialFetch(Err(e)) => {
                // pas de retry : la flotte se remplira au fil des INSERT
                error!(error = %e, "initial terminal fetch failed");
                self.initial_fetch_done = true;
            }
            Internal::Resync { round, .. } if round != self.resync_round => {
                debug!(round, "superseded resync result discarded");
            }
            Internal::Resync { round, result: Ok(records) } => {
                let fresher = self.resync_fresher.take().unwrap_or_default();
                let outcome = reconcile::resync(&mut self.registry, &mut self.detail, &records, &fresher);
                if outcome.detail_closed {
                    self.detail_sub = None;
                }
                info!(
                    round,
                    inserted = outcome.inserted,
                    patched = outcome.patched,
                    removed = outcome.removed,
                    "registry resynced from store"
                );
            }
            Internal::Resync { round, result: Err(e) } => {
                // pas de retry : le prochain lag relancera un resync
                self.resync_fresher = None;
                error!(round, error = %e, "resync fetch failed");
            }
            Internal::History { generation, result } => {
                let Some(view) = self.detail.as_mut().filter(|v| v.generation == generation) else {
                    debug!(generation, "history for a closed detail view discarded");
                    return;
                };
                match result {
                    Ok(events) => {
                        let added = view.timeline.merge_history(events);
                        debug!(terminal_id = view.terminal_id(), added, "timeline history merged");
                    }
                    Err(e) => warn!(terminal_id = view.terminal_id(), error = %e, "timeline history fetch failed"),
                }
            }
        }
    }

    pub(crate) fn handle_terminal_change(&mut self, notification: &ChangeNotification) {
        if let (Some(fresher), ChangeRecord::Terminals(record)) = (self.resync_fresher.as_mut(), &notification.record) {
            fresher.insert(record.id);
        }
        match reconcile::apply_terminal_change(&mut self.registry, &mut self.detail, notification) {
            Reconciled::Removed { id, detail_closed: true } => {
                self.detail_sub = None;
                info!(terminal_id = id, "terminal deleted, detail view closed");
            }
            Reconciled::Inserted(id) => debug!(terminal_id = id, "terminal inserted"),
            Reconciled::Folded(write) => self.persist_fold(write),
            _ => {}
        }
    }

    fn handle_detail_event(&mut self, event: Result<ChangeNotification, SubscriptionError>) {
        let notification = match event {
            Ok(notification) => notification,
            Err(SubscriptionError::Lagged(skipped)) => {
                // l'historique rattrape les événements perdus, la fusion dédoublonne
                if let Some(view) = &self.detail {
                    warn!(terminal_id = view.terminal_id(), skipped, "detail events lost, refetching history");
                    self.fetch_history(view.terminal_id(), view.generation);
                }
                return;
            }
            Err(SubscriptionError::Closed) => {
                warn!("detail subscription closed");
                self.detail_sub = None;
                return;
            }
        };
        let (Some(view), ChangeRecord::Events(event)) = (self.detail.as_mut(), notification.record) else {
            return;
        };
        view.timeline.push_live(event);
    }

    pub(crate) fn open_detail(&mut self, id: TerminalId) -> Result<(), EngineError> {
        let terminal = self.registry.get(id).cloned().ok_or(EngineError::UnknownTerminal(id))?;
        // la subscription précédente est droppée avant que la nouvelle existe
        self.close_detail();

        self.generation += 1;
        let generation = self.generation;
        self.detail_sub = Some(self.store.subscribe(SubscriptionFilter::EventsFor(id)));
        self.detail = Some(DetailView::open(generation, terminal, self.timeline_limit));
        self.fetch_history(id, generation);
        info!(terminal_id = id, generation, "detail view opened");
        Ok(())
    }

    fn fetch_history(&self, id: TerminalId, generation: u64) {
        let store = self.store.clone();
        let tx = self.internal_tx.clone();
        let limit = self.timeline_limit;
        tokio::spawn(async move {
            let result = store.list_recent_events(id, limit).await;
            let _ = tx.send(Internal::History { generation, result });
        });
    }

    pub(crate) fn close_detail(&mut self) {
        self.detail_sub = None;
        if let Some(view) = self.detail.take() {
            debug!(terminal_id = view.terminal_id(), "detail view closed");
        }
    }

    /// Démotion locale immédiate, écritures durables en tâche de fond.
    pub(crate) fn run_sweep(&mut self, now: OffsetDateTime) {
        let writes = self.sweeper.sweep(&mut self.registry, now);
        for write in writes {
            if let Some(view) = self.detail.as_mut().filter(|v| v.terminal_id() == write.terminal_id) {
                if let Some(terminal) = self.registry.get(write.terminal_id) {
                    view.terminal = terminal.clone();
                }
            }
            self.persist_fold(write);
        }
    }

    fn persist_fold(&self, write: FoldWrite) {
        let store = self.store.clone();
        tokio::spawn(async move {
            if let Err(e) = sweeper::persist_demotion(store.as_ref(), &write).await {
                warn!(terminal_id = write.terminal_id, error = %e, "offline fold not persisted");
            }
        });
    }

    fn snapshot(&self) -> FleetSnapshot {
        FleetSnapshot {
            terminals: self.registry.list(),
            counts: self.registry.counts(),
            detail: self.detail.as_ref().map(DetailView::snapshot),
            initial_fetch_done: self.initial_fetch_done,
        }
    }

    fn publish(&self) {
        self.snapshots.send_replace(Arc::new(self.snapshot()));
    }
}

async fn next_detail_event(sub: &mut Option<Subscription>) -> Result<ChangeNotification, SubscriptionError> {
    match sub {
        Some(sub) => sub.recv().await,
        None => std::future::pending().await,
    }
}
