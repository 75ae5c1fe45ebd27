//! Multi-record selection. Page scope holds explicit ids; global scope is
//! "everything matching this filter" minus the ids toggled off since.

use std::collections::HashSet;
use std::sync::Arc;

use mrq_client::ReviewBackend;
use mrq_core::{RecordFilter, RecordId};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::ControllerError;
use crate::events::{EventBus, ReviewEvent};
use crate::generation::{Applied, Generations, RequestKind};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SelectionScope {
    #[default]
    Page,
    Global {
        filter: RecordFilter,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SelectionSet {
    ids: Vec<RecordId>,
    members: HashSet<RecordId>,
    scope: SelectionScope,
    excluded: HashSet<RecordId>,
}

impl SelectionSet {
    pub fn ids(&self) -> &[RecordId] {
        &self.ids
    }

    pub fn scope(&self) -> &SelectionScope {
        &self.scope
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn contains(&self, id: &RecordId) -> bool {
        self.members.contains(id)
    }

    fn insert(&mut self, id: RecordId) {
        if self.members.insert(id.clone()) {
            self.ids.push(id);
        }
    }

    fn remove(&mut self, id: &RecordId) {
        if self.members.remove(id) {
            self.ids.retain(|existing| existing != id);
        }
    }

    /// Selects every id of the visible page. A page that is already fully
    /// selected clears the whole selection instead.
    pub fn select_page(&mut self, page_ids: &[RecordId]) -> usize {
        if !page_ids.is_empty() && page_ids.iter().all(|id| self.contains(id)) {
            self.clear();
            return 0;
        }
        if matches!(self.scope, SelectionScope::Global { .. }) {
            self.clear();
        }
        for id in page_ids {
            self.insert(id.clone());
        }
        self.len()
    }

    /// Replaces the selection with an enumeration of `filter`. Exclusions
    /// survive only when re-enumerating for the same global selection.
    pub fn select_global(&mut self, filter: RecordFilter, ids: Vec<RecordId>, keep_exclusions: bool) -> usize {
        let excluded = if keep_exclusions {
            std::mem::take(&mut self.excluded)
        } else {
            HashSet::new()
        };
        self.ids.clear();
        self.members.clear();
        for id in ids {
            if !excluded.contains(&id) {
                self.insert(id);
            }
        }
        self.excluded = excluded;
        self.scope = SelectionScope::Global { filter };
        self.len()
    }

    /// Flips one id and returns whether it is now selected.
    pub fn toggle(&mut self, id: &RecordId) -> bool {
        let selected = !self.contains(id);
        self.set_member(id, selected);
        selected
    }

    /// Puts `id` in or out of the selection. Under global scope an id taken
    /// out is remembered so re-enumerations leave it out.
    pub fn set_member(&mut self, id: &RecordId, selected: bool) {
        if selected {
            self.excluded.remove(id);
            self.insert(id.clone());
        } else {
            self.remove(id);
            if matches!(self.scope, SelectionScope::Global { .. }) {
                self.excluded.insert(id.clone());
            }
        }
    }

    pub fn clear(&mut self) {
        *self = SelectionSet::default();
    }
}

#[derive(Debug, Default)]
struct SelectionState {
    set: SelectionSet,
    enumerating: bool,
    // Toggles made while an enumeration is in flight, replayed onto its result.
    toggled_meanwhile: Vec<(RecordId, bool)>,
}

/// Owns the session's [`SelectionSet`]. Other components read it by value.
pub struct SelectionManager {
    backend: Arc<dyn ReviewBackend>,
    generations: Arc<Generations>,
    events: EventBus,
    state: Mutex<SelectionState>,
}

impl SelectionManager {
    pub fn new(backend: Arc<dyn ReviewBackend>, generations: Arc<Generations>, events: EventBus) -> Self {
        Self {
            backend,
            generations,
            events,
            state: Mutex::new(SelectionState::default()),
        }
    }

    pub async fn snapshot(&self) -> SelectionSet {
        self.state.lock().await.set.clone()
    }

    pub async fn count(&self) -> usize {
        self.state.lock().await.set.len()
    }

    pub async fn is_selected(&self, id: &RecordId) -> bool {
        self.state.lock().await.set.contains(id)
    }

    pub async fn is_enumerating(&self) -> bool {
        self.state.lock().await.enumerating
    }

    pub async fn select_page(&self, page_ids: &[RecordId]) -> usize {
        let count = self.state.lock().await.set.select_page(page_ids);
        self.notify(count);
        count
    }

    pub async fn toggle(&self, id: &RecordId) -> bool {
        let (selected, count) = {
            let mut state = self.state.lock().await;
            let selected = state.set.toggle(id);
            if state.enumerating {
                state.toggled_meanwhile.push((id.clone(), selected));
            }
            (selected, state.set.len())
        };
        self.notify(count);
        selected
    }

    /// Empties the selection and abandons any enumeration still in flight.
    pub async fn clear(&self) {
        {
            let mut state = self.state.lock().await;
            self.generations.issue(RequestKind::RecordIds);
            *state = SelectionState::default();
        }
        self.notify(0);
    }

    /// Selects every record matching `filter` across all pages via the
    /// id-only enumeration. On failure the previous selection is kept.
    pub async fn select_all_filtered(&self, filter: &RecordFilter) -> Result<Applied<usize>, ControllerError> {
        self.enumerate(filter, false).await
    }

    /// Re-enumerates a global selection for a new filter, keeping the ids
    /// toggled off. Page-scope selections keep their explicit ids. A global
    /// selection whose re-enumeration fails is cleared: it no longer matches
    /// the visible filter.
    pub async fn on_filter_changed(&self, filter: &RecordFilter) -> Result<Applied<usize>, ControllerError> {
        let (is_global, count) = {
            let state = self.state.lock().await;
            (
                matches!(state.set.scope(), SelectionScope::Global { .. }),
                state.set.len(),
            )
        };
        if !is_global {
            return Ok(Applied::Fresh(count));
        }
        self.enumerate(filter, true).await
    }

    async fn enumerate(&self, filter: &RecordFilter, reenumerate: bool) -> Result<Applied<usize>, ControllerError> {
        let generation = {
            let mut state = self.state.lock().await;
            if !state.enumerating {
                state.toggled_meanwhile.clear();
            }
            state.enumerating = true;
            self.generations.issue(RequestKind::RecordIds)
        };

        let result = self.backend.record_ids(filter).await;

        let mut state = self.state.lock().await;
        if !self.generations.is_current(RequestKind::RecordIds, generation) {
            debug!(generation = generation.value(), "discarding stale id enumeration");
            return Ok(Applied::Stale);
        }
        state.enumerating = false;
        let toggled = std::mem::take(&mut state.toggled_meanwhile);

        let ids = match result {
            Ok(ids) => ids,
            Err(err) if reenumerate => {
                warn!(error = %err, "id enumeration failed; dropping global selection");
                state.set.clear();
                drop(state);
                self.notify(0);
                self.events.emit(ReviewEvent::Notification {
                    message: format!("Selection cleared, matching records could not be listed: {err}"),
                });
                return Err(ControllerError::fetch(err));
            }
            Err(err) => {
                warn!(error = %err, "id enumeration failed; keeping previous selection");
                return Err(ControllerError::fetch(err));
            }
        };
        state.set.select_global(filter.clone(), ids, reenumerate);
        for (id, selected) in &toggled {
            state.set.set_member(id, *selected);
        }
        let count = state.set.len();
        drop(state);

        self.notify(count);
        Ok(Applied::Fresh(count))
    }

    fn notify(&self, count: usize) {
        self.events.emit(ReviewEvent::SelectionChanged { count });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mrq_client::InMemoryBackend;
    use mrq_core::{Record, RecordStatus};

    fn ids(values: &[&str]) -> Vec<RecordId> {
        values.iter().map(|v| RecordId::from(*v)).collect()
    }

    fn backend(count: usize) -> Arc<InMemoryBackend> {
        let records = (1..=count)
            .map(|i| {
                let status = if i % 2 == 0 { RecordStatus::Exception } else { RecordStatus::Pending };
                Record::new(format!("r{i}"), format!("Item {i}"), status)
            })
            .collect();
        Arc::new(InMemoryBackend::new(records))
    }

    fn manager(backend: Arc<InMemoryBackend>) -> SelectionManager {
        SelectionManager::new(backend, Arc::new(Generations::new()), EventBus::new(16))
    }

    #[test]
    fn select_page_twice_clears() {
        let mut set = SelectionSet::default();
        assert_eq!(set.select_page(&ids(&["a", "b"])), 2);
        assert_eq!(set.select_page(&ids(&["a", "b"])), 0);
        assert!(set.is_empty());
    }

    #[test]
    fn partially_selected_page_fills_up() {
        let mut set = SelectionSet::default();
        set.toggle(&RecordId::from("a"));
        assert_eq!(set.select_page(&ids(&["a", "b", "c"])), 3);
        assert_eq!(set.ids(), ids(&["a", "b", "c"]).as_slice());
    }

    #[test]
    fn toggle_flips_membership() {
        let mut set = SelectionSet::default();
        let id = RecordId::from("x");
        assert!(set.toggle(&id));
        assert!(set.contains(&id));
        assert!(!set.toggle(&id));
        assert!(!set.contains(&id));
    }

    #[test]
    fn global_exclusions_survive_reenumeration_only_when_asked() {
        let mut set = SelectionSet::default();
        set.select_global(RecordFilter::default(), ids(&["a", "b", "c"]), false);
        set.toggle(&RecordId::from("b"));

        assert_eq!(set.select_global(RecordFilter::default(), ids(&["a", "b", "c", "d"]), true), 3);
        assert!(!set.contains(&RecordId::from("b")));

        assert_eq!(set.select_global(RecordFilter::default(), ids(&["a", "b", "c", "d"]), false), 4);
    }

    #[tokio::test]
    async fn select_all_spans_pages_without_loading_records() {
        let backend = backend(120);
        let selection = manager(backend.clone());

        let applied = selection.select_all_filtered(&RecordFilter::default()).await.unwrap();
        assert_eq!(applied, Applied::Fresh(120));

        let calls = backend.calls().await;
        assert_eq!(calls.record_ids, 1);
        assert_eq!(calls.records, 0);
    }

    #[tokio::test]
    async fn select_all_then_toggle_leaves_the_rest_selected() {
        let selection = manager(backend(120));
        selection.select_all_filtered(&RecordFilter::default()).await.unwrap();

        let r7 = RecordId::from("r7");
        assert!(!selection.toggle(&r7).await);
        assert_eq!(selection.count().await, 119);
        assert!(!selection.is_selected(&r7).await);
        assert!(selection.is_selected(&RecordId::from("r8")).await);
    }

    #[tokio::test]
    async fn filter_change_reenumerates_global_selection() {
        let selection = manager(backend(10));
        selection.select_all_filtered(&RecordFilter::default()).await.unwrap();
        selection.toggle(&RecordId::from("r2")).await;

        let exceptions = RecordFilter {
            status: Some(RecordStatus::Exception),
            ..Default::default()
        };
        let applied = selection.on_filter_changed(&exceptions).await.unwrap();
        assert_eq!(applied, Applied::Fresh(4));
        assert!(!selection.is_selected(&RecordId::from("r2")).await);
        assert!(!selection.is_selected(&RecordId::from("r1")).await);
    }

    #[tokio::test]
    async fn filter_change_keeps_page_selection() {
        let backend = backend(10);
        let selection = manager(backend.clone());
        selection.select_page(&ids(&["r1", "r3"])).await;

        let exceptions = RecordFilter {
            status: Some(RecordStatus::Exception),
            ..Default::default()
        };
        assert_eq!(selection.on_filter_changed(&exceptions).await.unwrap(), Applied::Fresh(2));
        assert_eq!(backend.calls().await.record_ids, 0);
    }

    #[tokio::test]
    async fn enumeration_failure_keeps_previous_selection() {
        let selection = SelectionManager::new(
            Arc::new(FailingIds),
            Arc::new(Generations::new()),
            EventBus::new(4),
        );
        selection.select_page(&ids(&["a"])).await;
        let err = selection.select_all_filtered(&RecordFilter::default()).await.unwrap_err();
        assert!(matches!(err, ControllerError::TransientFetch { .. }));
        assert_eq!(selection.count().await, 1);
        assert!(!selection.is_enumerating().await);
    }

    #[tokio::test]
    async fn superseded_enumeration_is_dropped() {
        let generations = Arc::new(Generations::new());
        let selection = SelectionManager::new(backend(5), generations.clone(), EventBus::new(4));
        generations.invalidate_all();
        let applied = selection.select_all_filtered(&RecordFilter::default()).await.unwrap();
        assert!(applied.is_stale());
        assert_eq!(selection.count().await, 0);
    }

    #[tokio::test]
    async fn failed_reenumeration_drops_global_selection() {
        let backend = backend(10);
        let events = EventBus::new(16);
        let selection = SelectionManager::new(backend.clone(), Arc::new(Generations::new()), events.clone());
        selection.select_all_filtered(&RecordFilter::default()).await.unwrap();
        let mut rx = events.subscribe();

        backend.fail_next_enumerations(1).await;
        let exceptions = RecordFilter {
            status: Some(RecordStatus::Exception),
            ..Default::default()
        };
        let err = selection.on_filter_changed(&exceptions).await.unwrap_err();
        assert!(matches!(err, ControllerError::TransientFetch { .. }));

        let set = selection.snapshot().await;
        assert!(set.is_empty());
        assert_eq!(set.scope(), &SelectionScope::Page);
        assert_eq!(rx.recv().await.unwrap(), ReviewEvent::SelectionChanged { count: 0 });
        assert!(matches!(rx.recv().await.unwrap(), ReviewEvent::Notification { .. }));
    }

    #[tokio::test]
    async fn toggle_during_enumeration_survives_its_result() {
        let backend = Arc::new(GatedIds::new(&["a", "b", "c"]));
        let selection = Arc::new(SelectionManager::new(
            backend.clone(),
            Arc::new(Generations::new()),
            EventBus::new(16),
        ));
        selection.select_page(&ids(&["b"])).await;

        let pending = tokio::spawn({
            let selection = selection.clone();
            async move { selection.select_all_filtered(&RecordFilter::default()).await }
        });
        while !selection.is_enumerating().await {
            tokio::task::yield_now().await;
        }
        assert!(!selection.toggle(&RecordId::from("b")).await);
        backend.release.notify_one();

        assert_eq!(pending.await.unwrap().unwrap(), Applied::Fresh(2));
        assert!(!selection.is_selected(&RecordId::from("b")).await);
        assert!(selection.is_selected(&RecordId::from("a")).await);

        // The exclusion also holds on the next filter change.
        backend.release.notify_one();
        assert_eq!(selection.on_filter_changed(&RecordFilter::default()).await.unwrap(), Applied::Fresh(2));
    }

    #[tokio::test]
    async fn clear_abandons_enumeration_in_flight() {
        let backend = Arc::new(GatedIds::new(&["a", "b"]));
        let selection = Arc::new(SelectionManager::new(
            backend.clone(),
            Arc::new(Generations::new()),
            EventBus::new(16),
        ));

        let pending = tokio::spawn({
            let selection = selection.clone();
            async move { selection.select_all_filtered(&RecordFilter::default()).await }
        });
        while !selection.is_enumerating().await {
            tokio::task::yield_now().await;
        }
        selection.clear().await;
        backend.release.notify_one();

        assert!(pending.await.unwrap().unwrap().is_stale());
        assert_eq!(selection.count().await, 0);
        assert!(!selection.is_enumerating().await);
    }

    struct GatedIds {
        ids: Vec<RecordId>,
        release: tokio::sync::Notify,
    }

    impl GatedIds {
        fn new(values: &[&str]) -> Self {
            Self {
                ids: ids(values),
                release: tokio::sync::Notify::new(),
            }
        }
    }

    #[async_trait::async_trait]
    impl ReviewBackend for GatedIds {
        async fn records(&self, _query: &mrq_client::RecordQuery) -> Result<mrq_client::RecordPage, mrq_client::BackendError> {
            Err(mrq_client::BackendError::Unavailable("ids only".into()))
        }

        async fn record_ids(&self, _filter: &RecordFilter) -> Result<Vec<RecordId>, mrq_client::BackendError> {
            self.release.notified().await;
            Ok(self.ids.clone())
        }

        async fn record_action(
            &self,
            _id: &RecordId,
            _action: &mrq_core::ReviewAction,
        ) -> Result<(), mrq_client::BackendError> {
            Err(mrq_client::BackendError::Unavailable("ids only".into()))
        }

        async fn batch_action(
            &self,
            _kind: mrq_core::ActionKind,
            _items: &[mrq_client::BatchItem],
        ) -> Result<mrq_client::BatchResponse, mrq_client::BackendError> {
            Err(mrq_client::BackendError::Unavailable("ids only".into()))
        }

        async fn task_progress(&self, _id: &RecordId) -> Result<mrq_client::TaskProgress, mrq_client::BackendError> {
            Err(mrq_client::BackendError::Unavailable("ids only".into()))
        }
    }

    struct FailingIds;

    #[async_trait::async_trait]
    impl ReviewBackend for FailingIds {
        async fn records(&self, _query: &mrq_client::RecordQuery) -> Result<mrq_client::RecordPage, mrq_client::BackendError> {
            Err(mrq_client::BackendError::Unavailable("down".into()))
        }

        async fn record_ids(&self, _filter: &RecordFilter) -> Result<Vec<RecordId>, mrq_client::BackendError> {
            Err(mrq_client::BackendError::Unavailable("down".into()))
        }

        async fn record_action(
            &self,
            _id: &RecordId,
            _action: &mrq_core::ReviewAction,
        ) -> Result<(), mrq_client::BackendError> {
            Err(mrq_client::BackendError::Unavailable("down".into()))
        }

        async fn batch_action(
            &self,
            _kind: mrq_core::ActionKind,
            _items: &[mrq_client::BatchItem],
        ) -> Result<mrq_client::BatchResponse, mrq_client::BackendError> {
            Err(mrq_client::BackendError::Unavailable("down".into()))
        }

        async fn task_progress(&self, _id: &RecordId) -> Result<mrq_client::TaskProgress, mrq_client::BackendError> {
            Err(mrq_client::BackendError::Unavailable("down".into()))
        }
    }
}
