//! One reviewer's working session over the queue: the loaded snapshot, the
//! query, the selection and the background tasks that keep them fresh.
//!
//! A session must be created inside a Tokio runtime. All mutation goes
//! through the session's methods; readers get owned [`SessionView`]s.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use mrq_client::{RecordQuery, ReviewBackend};
use mrq_core::pipeline::{self, PageView, QuerySpec, SortKey};
use mrq_core::{
    ActionKind, BatchResult, ConfidenceTier, ProductRef, Record, RecordId, RecordStatus,
    ReviewAction,
};
use serde::Serialize;
use tokio::sync::{broadcast, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::batch::{resolve_target, BatchOrchestrator};
use crate::config::ControllerConfig;
use crate::debounce::SearchDebouncer;
use crate::error::{ControllerError, ResolutionError};
use crate::events::{EventBus, ReviewEvent};
use crate::generation::{Applied, Generations, RequestKind};
use crate::navigation;
use crate::poll::{PollLoop, PollSnapshot, SnapshotDiff, StuckTracker};
use crate::selection::{SelectionManager, SelectionScope};

pub type SessionId = Uuid;

type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshTrigger {
    Initial,
    Manual,
    Query,
    Search,
    Poll,
    Reconcile,
    AfterAction,
    AfterBatch,
}

impl RefreshTrigger {
    fn is_background(&self) -> bool {
        matches!(
            self,
            RefreshTrigger::Poll
                | RefreshTrigger::Reconcile
                | RefreshTrigger::AfterAction
                | RefreshTrigger::AfterBatch
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RefreshOutcome {
    Updated { changed: usize, removed: usize },
    Unchanged,
    /// A newer request or a teardown superseded this one.
    Stale,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LoadingFlags {
    pub page_load: bool,
    pub search: bool,
    pub selection: bool,
    pub batch: bool,
}

/// A partial query update. `None` leaves a field alone; `Some(None)` clears
/// an optional filter. A page move is honored only when nothing else changes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryChange {
    pub search: Option<String>,
    pub status: Option<Option<RecordStatus>>,
    pub confidence_tier: Option<Option<ConfidenceTier>>,
    pub source: Option<Option<String>>,
    pub sort: Option<SortKey>,
    pub page: Option<usize>,
    pub page_size: Option<usize>,
}

impl QueryChange {
    pub fn search(term: impl Into<String>) -> Self {
        Self {
            search: Some(term.into()),
            ..Default::default()
        }
    }

    pub fn status(status: Option<RecordStatus>) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn sort(sort: SortKey) -> Self {
        Self {
            sort: Some(sort),
            ..Default::default()
        }
    }

    pub fn page(page: usize) -> Self {
        Self {
            page: Some(page),
            ..Default::default()
        }
    }

    fn touches_filter(&self) -> bool {
        self.search.is_some()
            || self.status.is_some()
            || self.confidence_tier.is_some()
            || self.source.is_some()
    }
}

/// Where the reviewer lands after resolving a record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "next", rename_all = "snake_case")]
pub enum Presentation {
    Record { record_id: RecordId, page: usize },
    Exhausted,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionView {
    pub session_id: SessionId,
    pub query: QuerySpec,
    pub page: PageView,
    pub selected_on_page: Vec<RecordId>,
    pub selection_count: usize,
    pub selection_scope: SelectionScope,
    pub presented: Option<RecordId>,
    pub loading: LoadingFlags,
    pub polling: bool,
    pub captured_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct SessionState {
    query: QuerySpec,
    snapshot: Option<PollSnapshot>,
    stuck: StuckTracker,
    presented: Option<RecordId>,
    loading: LoadingFlags,
}

pub struct ReviewSession {
    id: SessionId,
    config: ControllerConfig,
    backend: Arc<dyn ReviewBackend>,
    generations: Arc<Generations>,
    events: EventBus,
    selection: SelectionManager,
    batches: BatchOrchestrator,
    debouncer: SearchDebouncer,
    cancel: CancellationToken,
    state: Mutex<SessionState>,
    poll: Mutex<PollLoop>,
}

impl ReviewSession {
    pub fn new(backend: Arc<dyn ReviewBackend>, config: ControllerConfig) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<Self>| {
            let cancel = CancellationToken::new();
            let generations = Arc::new(Generations::new());
            let events = EventBus::new(config.event_capacity);

            let settled = weak.clone();
            let debouncer = SearchDebouncer::spawn(config.search_debounce(), cancel.child_token(), move |term| {
                let session = settled.upgrade();
                async move {
                    if let Some(session) = session {
                        if let Err(err) = session.update_query(QueryChange::search(term)).await {
                            debug!(error = %err, "debounced search not applied");
                        }
                    }
                }
            });

            Self {
                id: Uuid::new_v4(),
                state: Mutex::new(SessionState {
                    query: QuerySpec::new(config.page_size),
                    ..Default::default()
                }),
                selection: SelectionManager::new(backend.clone(), generations.clone(), events.clone()),
                batches: BatchOrchestrator::new(backend.clone()),
                poll: Mutex::new(PollLoop::default()),
                backend,
                generations,
                events,
                debouncer,
                cancel,
                config,
            }
        })
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ReviewEvent> {
        self.events.subscribe()
    }

    pub fn is_closed(&self) -> bool {
        self.generations.is_closed()
    }

    fn ensure_open(&self) -> Result<(), ControllerError> {
        if self.is_closed() {
            Err(ControllerError::SessionClosed)
        } else {
            Ok(())
        }
    }

    /// First load. Polling starts afterwards if anything needs watching.
    pub async fn open(self: &Arc<Self>) -> Result<RefreshOutcome, ControllerError> {
        info!(session = %self.id, "opening review session");
        self.refresh(RefreshTrigger::Initial).await
    }

    /// Fetches every record matching the current filter and applies it if
    /// it differs from the snapshot. Failures keep the previous data.
    pub async fn refresh(self: &Arc<Self>, trigger: RefreshTrigger) -> Result<RefreshOutcome, ControllerError> {
        let (generation, query) = {
            let mut state = self.state.lock().await;
            self.ensure_open()?;
            match trigger {
                RefreshTrigger::Search => state.loading.search = true,
                RefreshTrigger::Initial | RefreshTrigger::Manual | RefreshTrigger::Query => {
                    state.loading.page_load = true
                }
                _ => {}
            }
            let query = RecordQuery::all(state.query.filter().clone(), state.query.sort());
            (self.generations.issue(RequestKind::Records), query)
        };

        let fetched = self.backend.records(&query).await;

        let (outcome, in_progress) = {
            let mut state = self.state.lock().await;
            if !self.generations.is_current(RequestKind::Records, generation) {
                debug!(generation = generation.value(), ?trigger, "discarding stale records response");
                return Ok(RefreshOutcome::Stale);
            }
            state.loading.page_load = false;
            state.loading.search = false;

            let page = match fetched {
                Ok(page) => page,
                Err(err) => {
                    warn!(session = %self.id, ?trigger, error = %err, "record fetch failed; keeping previous data");
                    if !trigger.is_background() {
                        self.events.emit(ReviewEvent::Notification {
                            message: format!("Could not load records: {err}"),
                        });
                    }
                    return Err(ControllerError::fetch(err));
                }
            };
            let outcome = self.apply_records(&mut state, page.records);
            let in_progress = state
                .snapshot
                .as_ref()
                .map(|s| s.records().iter().any(Record::is_in_progress))
                .unwrap_or(false);
            (outcome, in_progress)
        };

        self.sync_polling(in_progress).await;
        Ok(outcome)
    }

    fn background_refresh(self: Arc<Self>, trigger: RefreshTrigger) -> BoxFuture<()> {
        Box::pin(async move {
            if let Err(err) = self.refresh(trigger).await {
                debug!(?trigger, error = %err, "background refresh failed");
            }
        })
    }

    fn apply_records(self: &Arc<Self>, state: &mut SessionState, records: Vec<Record>) -> RefreshOutcome {
        let diff = match &state.snapshot {
            Some(snapshot) => snapshot.diff(&records),
            None => SnapshotDiff::initial(&records),
        };
        if state.snapshot.is_some() && diff.is_empty() {
            debug!(session = %self.id, "fetch matches snapshot");
            return RefreshOutcome::Unchanged;
        }

        let snapshot = PollSnapshot::capture(records);
        let newly_stuck = state.stuck.scan(snapshot.records());
        let visible = pipeline::filtered_order(snapshot.records(), &state.query).len();
        let total_pages = pipeline::total_pages(visible, state.query.page_size());
        state.query.clamp_page(total_pages);
        state.snapshot = Some(snapshot);

        let outcome = RefreshOutcome::Updated {
            changed: diff.changed.len(),
            removed: diff.removed.len(),
        };
        self.events.emit(ReviewEvent::RecordsUpdated {
            changed: diff.changed,
            removed: diff.removed,
        });
        if !newly_stuck.is_empty() {
            self.schedule_reconciliation(newly_stuck);
        }
        outcome
    }

    /// Asks the backend once about each task whose items are done but whose
    /// status never moved on. Calls are staggered to spread the load.
    fn schedule_reconciliation(self: &Arc<Self>, task_ids: Vec<RecordId>) {
        let stagger = self.config.stuck_stagger();
        for (index, task_id) in task_ids.into_iter().enumerate() {
            let delay = stagger.saturating_mul(index as u32);
            let backend = self.backend.clone();
            let cancel = self.cancel.clone();
            let session = Arc::downgrade(self);
            info!(%task_id, delay_ms = delay.as_millis() as u64, "reconciling stuck task");

            tokio::spawn(async move {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(delay) => {}
                }
                match backend.task_progress(&task_id).await {
                    Ok(progress) if progress.status != RecordStatus::Processing => {
                        debug!(%task_id, status = %progress.status, "stuck task moved on");
                        if let Some(session) = session.upgrade() {
                            session.background_refresh(RefreshTrigger::Reconcile).await;
                        }
                    }
                    Ok(_) => debug!(%task_id, "task still processing"),
                    Err(err) => debug!(%task_id, error = %err, "reconciliation call failed"),
                }
            });
        }
    }

    async fn sync_polling(self: &Arc<Self>, in_progress: bool) {
        if in_progress || !self.config.poll_only_while_in_progress {
            self.start_polling().await;
        } else {
            self.stop_polling().await;
        }
    }

    pub async fn start_polling(self: &Arc<Self>) {
        if self.cancel.is_cancelled() {
            return;
        }
        let mut poll = self.poll.lock().await;
        if poll.is_polling() {
            return;
        }
        info!(session = %self.id, interval_ms = self.config.poll_interval_ms, "polling started");
        let session = Arc::downgrade(self);
        poll.start(self.config.poll_interval(), &self.cancel, move || {
            let session = session.upgrade();
            async move {
                if let Some(session) = session {
                    session.background_refresh(RefreshTrigger::Poll).await;
                }
            }
        });
    }

    pub async fn stop_polling(&self) {
        let mut poll = self.poll.lock().await;
        if poll.is_polling() {
            poll.stop();
            info!(session = %self.id, "polling stopped");
        }
    }

    pub async fn is_polling(&self) -> bool {
        self.poll.lock().await.is_polling()
    }

    /// Applies a query change. Filter changes reset to page 1, refetch and
    /// re-enumerate a global selection; sort and page moves are local.
    pub async fn update_query(self: &Arc<Self>, change: QueryChange) -> Result<QuerySpec, ControllerError> {
        let (filter_changed, search_changed, query) = {
            let mut state = self.state.lock().await;
            self.ensure_open()?;
            let (filter_changed, search_changed) = self.mutate_query(&mut state, &change);
            (filter_changed, search_changed, state.query.clone())
        };

        self.events.emit(ReviewEvent::QueryChanged { page: query.page() });
        if !filter_changed {
            return Ok(query);
        }

        debug!(session = %self.id, filter = ?query.filter(), "filter changed");
        let trigger = if search_changed {
            RefreshTrigger::Search
        } else {
            RefreshTrigger::Query
        };
        let (refreshed, reselected) = tokio::join!(
            self.refresh(trigger),
            self.selection.on_filter_changed(query.filter())
        );
        if let Err(err) = reselected {
            warn!(session = %self.id, error = %err, "re-enumerating selection failed; selection cleared");
        }
        refreshed?;
        Ok(self.state.lock().await.query.clone())
    }

    /// Returns `(filter_changed, search_changed)`. A filter change also
    /// supersedes every records fetch issued under the previous filter.
    fn mutate_query(&self, state: &mut SessionState, change: &QueryChange) -> (bool, bool) {
        let query = &mut state.query;
        let mut search_changed = false;
        let mut filter_changed = false;

        if let Some(term) = change.search.clone() {
            search_changed = query.set_search_term(term);
            filter_changed |= search_changed;
        }
        if let Some(status) = change.status {
            filter_changed |= query.set_status_filter(status);
        }
        if let Some(tier) = change.confidence_tier {
            filter_changed |= query.set_confidence_tier(tier);
        }
        if let Some(source) = change.source.clone() {
            filter_changed |= query.set_source_filter(source);
        }
        if let Some(sort) = change.sort {
            query.set_sort(sort);
        }
        if let Some(page_size) = change.page_size {
            query.set_page_size(page_size);
        }
        if let Some(page) = change.page {
            if !change.touches_filter() && change.sort.is_none() && change.page_size.is_none() {
                let visible = state
                    .snapshot
                    .as_ref()
                    .map(|s| pipeline::filtered_order(s.records(), &state.query).len())
                    .unwrap_or(0);
                let total_pages = pipeline::total_pages(visible, state.query.page_size());
                state.query.set_page(page);
                state.query.clamp_page(total_pages);
            }
        }
        if filter_changed {
            self.generations.issue(RequestKind::Records);
        }
        (filter_changed, search_changed)
    }

    /// Queues a keystroke-level search term; it applies after the quiet period.
    pub fn search_input(&self, term: impl Into<String>) -> Result<(), ControllerError> {
        self.ensure_open()?;
        if self.debouncer.push(term) {
            Ok(())
        } else {
            Err(ControllerError::SessionClosed)
        }
    }

    /// Opens `id` for review and moves to the page that holds it.
    pub async fn present(&self, id: &RecordId) -> Result<usize, ControllerError> {
        let page = {
            let mut state = self.state.lock().await;
            self.ensure_open()?;
            let page = state
                .snapshot
                .as_ref()
                .and_then(|s| {
                    let ordered = pipeline::filtered_order(s.records(), &state.query);
                    navigation::locate(id, &ordered, state.query.page_size())
                })
                .ok_or_else(|| ControllerError::UnknownRecord(id.clone()))?;
            state.query.set_page(page);
            state.presented = Some(id.clone());
            page
        };
        self.events.emit(ReviewEvent::Presenting {
            record_id: id.clone(),
            page,
        });
        Ok(page)
    }

    /// Resolves one record and moves on to the next one awaiting review.
    /// The status flips locally before the call and is rolled back if the
    /// backend refuses.
    pub async fn resolve(
        self: &Arc<Self>,
        id: &RecordId,
        kind: ActionKind,
        product_id: Option<String>,
    ) -> Result<Presentation, ControllerError> {
        let optimistic = kind.resulting_status();
        let (action, next, previous) = {
            let mut state = self.state.lock().await;
            self.ensure_open()?;
            let SessionState { query, snapshot, .. } = &mut *state;
            let snapshot = snapshot
                .as_mut()
                .ok_or_else(|| ControllerError::UnknownRecord(id.clone()))?;
            let record = snapshot
                .get(id)
                .ok_or_else(|| ControllerError::UnknownRecord(id.clone()))?;

            let product_id = match product_id {
                Some(product_id) => Some(product_id),
                None if kind.requires_product() => record.target_product().map(|p| p.id.clone()),
                None => None,
            };
            let action = ReviewAction::from_kind(kind, product_id).ok_or_else(|| {
                ResolutionError::new(id.clone(), format!("no candidate product to {kind}"))
            })?;
            let previous = (record.status, record.selected_match.clone());

            let next = {
                let visible = pipeline::filtered_order(snapshot.records(), query);
                navigation::next_after_resolving(id, &visible).map(|r| r.id.clone())
            };
            snapshot.update_local(id, |r| {
                r.status = optimistic;
                if kind == ActionKind::Clear {
                    r.selected_match = None;
                }
            });
            (action, next, previous)
        };

        if let Err(err) = self.backend.record_action(id, &action).await {
            self.rollback(id, optimistic, previous).await;
            let reason = err.to_string();
            warn!(record_id = %id, action = %kind, %reason, "action rejected");
            self.events.emit(ReviewEvent::ActionFailed {
                record_id: id.clone(),
                reason: reason.clone(),
            });
            return Err(ControllerError::ActionRejected {
                record_id: id.clone(),
                reason,
            });
        }
        info!(record_id = %id, action = %kind, "record resolved");

        let presentation = {
            let mut state = self.state.lock().await;
            match next {
                Some(next_id) => {
                    let located = state.snapshot.as_ref().and_then(|s| {
                        let ordered = pipeline::filtered_order(s.records(), &state.query);
                        navigation::locate(&next_id, &ordered, state.query.page_size())
                    });
                    let page = located.unwrap_or_else(|| state.query.page());
                    state.query.set_page(page);
                    state.presented = Some(next_id.clone());
                    Presentation::Record {
                        record_id: next_id,
                        page,
                    }
                }
                None => {
                    state.presented = None;
                    Presentation::Exhausted
                }
            }
        };
        match &presentation {
            Presentation::Record { record_id, page } => self.events.emit(ReviewEvent::Presenting {
                record_id: record_id.clone(),
                page: *page,
            }),
            Presentation::Exhausted => self.events.emit(ReviewEvent::QueueExhausted),
        };

        if let Err(err) = self.refresh(RefreshTrigger::AfterAction).await {
            debug!(error = %err, "refresh after action failed");
        }
        Ok(presentation)
    }

    async fn rollback(&self, id: &RecordId, optimistic: RecordStatus, previous: (RecordStatus, Option<ProductRef>)) {
        let mut state = self.state.lock().await;
        if let Some(snapshot) = state.snapshot.as_mut() {
            snapshot.update_local(id, |r| {
                // a newer fetch already replaced the optimistic value
                if r.status == optimistic {
                    r.status = previous.0;
                    r.selected_match = previous.1;
                }
            });
        }
    }

    pub async fn toggle_selection(&self, id: &RecordId) -> Result<bool, ControllerError> {
        self.ensure_open()?;
        Ok(self.selection.toggle(id).await)
    }

    /// Selects the visible page, or clears everything if it was already selected.
    pub async fn select_page(&self) -> Result<usize, ControllerError> {
        let page_ids = {
            let state = self.state.lock().await;
            self.ensure_open()?;
            match &state.snapshot {
                Some(snapshot) => pipeline::apply(snapshot.records(), &state.query).row_ids(),
                None => Vec::new(),
            }
        };
        Ok(self.selection.select_page(&page_ids).await)
    }

    pub async fn select_all_filtered(&self) -> Result<Applied<usize>, ControllerError> {
        let filter = {
            let state = self.state.lock().await;
            self.ensure_open()?;
            state.query.filter().clone()
        };
        self.selection.select_all_filtered(&filter).await
    }

    pub async fn clear_selection(&self) -> Result<(), ControllerError> {
        self.ensure_open()?;
        self.selection.clear().await;
        Ok(())
    }

    /// Applies `kind` to every selected record, then clears the selection
    /// and refreshes once.
    pub async fn run_batch(self: &Arc<Self>, kind: ActionKind) -> Result<BatchResult, ControllerError> {
        self.ensure_open()?;
        let selection = self.selection.snapshot().await;
        if selection.is_empty() {
            return Ok(BatchResult::default());
        }

        let targets = {
            let mut state = self.state.lock().await;
            state.loading.batch = true;
            let loaded = state
                .snapshot
                .as_ref()
                .map(|s| s.records().iter().map(|r| (&r.id, r)).collect::<HashMap<_, _>>())
                .unwrap_or_default();
            selection
                .ids()
                .iter()
                .filter_map(|id| loaded.get(id).map(|r| (id.clone(), (*r).clone())))
                .collect::<HashMap<_, _>>()
        };

        info!(session = %self.id, action = %kind, count = selection.len(), "running batch");
        let result = self
            .batches
            .run(selection.ids(), kind, |id| resolve_target(id, targets.get(id), kind))
            .await;

        self.selection.clear().await;
        self.state.lock().await.loading.batch = false;
        self.events.emit(ReviewEvent::BatchCompleted {
            succeeded: result.succeeded.len(),
            failed: result.failed.len(),
        });
        if let Err(err) = self.refresh(RefreshTrigger::AfterBatch).await {
            debug!(error = %err, "refresh after batch failed");
        }
        Ok(result)
    }

    pub async fn view(&self) -> SessionView {
        let selection = self.selection.snapshot().await;
        let enumerating = self.selection.is_enumerating().await;
        let polling = self.is_polling().await;
        let state = self.state.lock().await;

        let page = match &state.snapshot {
            Some(snapshot) => pipeline::apply(snapshot.records(), &state.query),
            None => pipeline::apply(&[], &state.query),
        };
        let selected_on_page = page
            .rows
            .iter()
            .filter(|r| selection.contains(&r.id))
            .map(|r| r.id.clone())
            .collect();

        SessionView {
            session_id: self.id,
            query: state.query.clone(),
            selected_on_page,
            selection_count: selection.len(),
            selection_scope: selection.scope().clone(),
            presented: state.presented.clone(),
            loading: LoadingFlags {
                selection: enumerating,
                ..state.loading
            },
            polling,
            captured_at: state.snapshot.as_ref().map(|s| s.captured_at()),
            page,
        }
    }

    /// Stops every background task and drops the loaded data. Responses still
    /// in flight are discarded when they arrive.
    pub async fn close(&self) {
        if self.is_closed() {
            return;
        }
        self.generations.invalidate_all();
        self.cancel.cancel();
        self.poll.lock().await.stop();
        {
            let mut state = self.state.lock().await;
            state.snapshot = None;
            state.presented = None;
            state.stuck.clear();
            state.loading = LoadingFlags::default();
        }
        self.selection.clear().await;
        info!(session = %self.id, "review session closed");
    }
}
