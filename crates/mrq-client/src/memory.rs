//! In-process backend over a record vector. Backs the demo CLI and the
//! controller tests; failures can be injected per call type.

use std::collections::{HashSet, VecDeque};
use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use mrq_core::pipeline::{self, QuerySpec};
use mrq_core::{
    ActionKind, BatchFailure, Record, RecordFilter, RecordId, RecordStatus, ReviewAction,
};
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::debug;

use crate::{
    BackendError, BatchItem, BatchResponse, RecordPage, RecordQuery, ReviewBackend, TaskProgress,
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallCounts {
    pub records: usize,
    pub record_ids: usize,
    pub record_action: usize,
    pub batch_action: usize,
    pub task_progress: usize,
}

#[derive(Debug, Default)]
struct MemoryState {
    records: Vec<Record>,
    calls: CallCounts,
    failing_fetches: usize,
    failing_enumerations: usize,
    fetch_delays: VecDeque<Duration>,
    rejected_ids: HashSet<RecordId>,
    batch_rejection: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum FixtureFile {
    Bare(Vec<Record>),
    Wrapped { records: Vec<Record> },
}

#[derive(Debug)]
pub struct InMemoryBackend {
    state: Mutex<MemoryState>,
    batch_support: bool,
}

impl InMemoryBackend {
    pub fn new(records: Vec<Record>) -> Self {
        let mut records = records;
        for record in &mut records {
            record.rank_candidates();
        }
        Self {
            state: Mutex::new(MemoryState {
                records,
                ..Default::default()
            }),
            batch_support: true,
        }
    }

    /// Loads either a bare JSON array of records or `{"records": [...]}`.
    pub fn from_fixture_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading fixture {}", path.display()))?;
        let fixture: FixtureFile = serde_json::from_str(&text)
            .with_context(|| format!("parsing fixture {}", path.display()))?;
        let records = match fixture {
            FixtureFile::Bare(records) | FixtureFile::Wrapped { records } => records,
        };
        Ok(Self::new(records))
    }

    /// Forces batches through the single-action fallback.
    pub fn without_batch_support(mut self) -> Self {
        self.batch_support = false;
        self
    }

    pub async fn calls(&self) -> CallCounts {
        self.state.lock().await.calls
    }

    pub async fn records_snapshot(&self) -> Vec<Record> {
        self.state.lock().await.records.clone()
    }

    pub async fn replace_records(&self, records: Vec<Record>) {
        self.state.lock().await.records = records;
    }

    /// Simulates an upstream change to one record.
    pub async fn update_record(&self, id: &RecordId, update: impl FnOnce(&mut Record)) -> bool {
        let mut state = self.state.lock().await;
        match state.records.iter_mut().find(|r| &r.id == id) {
            Some(record) => {
                update(record);
                true
            }
            None => false,
        }
    }

    pub async fn fail_next_fetches(&self, count: usize) {
        self.state.lock().await.failing_fetches = count;
    }

    pub async fn fail_next_enumerations(&self, count: usize) {
        self.state.lock().await.failing_enumerations = count;
    }

    /// Each queued delay is consumed by one `records` call, in order.
    pub async fn delay_next_fetches(&self, delays: impl IntoIterator<Item = Duration>) {
        self.state.lock().await.fetch_delays.extend(delays);
    }

    pub async fn reject_actions_for(&self, id: impl Into<RecordId>) {
        self.state.lock().await.rejected_ids.insert(id.into());
    }

    pub async fn reject_batches(&self, reason: impl Into<String>) {
        self.state.lock().await.batch_rejection = Some(reason.into());
    }
}

fn apply_action(state: &mut MemoryState, id: &RecordId, action: &ReviewAction) -> Result<(), BackendError> {
    if state.rejected_ids.contains(id) {
        return Err(BackendError::Rejected(format!(
            "{} refused for record {id}",
            action.kind()
        )));
    }
    let record = state
        .records
        .iter_mut()
        .find(|r| &r.id == id)
        .ok_or_else(|| BackendError::NotFound(id.clone()))?;

    if let Some(product_id) = action.product_id() {
        let product = record
            .candidates
            .iter()
            .find(|c| c.product.id == product_id)
            .map(|c| c.product.clone())
            .or_else(|| record.selected_match.clone().filter(|p| p.id == product_id));
        match product {
            Some(product) => record.selected_match = Some(product),
            None => {
                return Err(BackendError::Rejected(format!(
                    "product {product_id} is not a candidate of record {id}"
                )))
            }
        }
    }
    if action.kind() == ActionKind::Clear {
        record.selected_match = None;
    }
    record.status = action.kind().resulting_status();
    Ok(())
}

#[async_trait]
impl ReviewBackend for InMemoryBackend {
    async fn records(&self, query: &RecordQuery) -> Result<RecordPage, BackendError> {
        let delay = {
            let mut state = self.state.lock().await;
            state.calls.records += 1;
            if state.failing_fetches > 0 {
                state.failing_fetches -= 1;
                return Err(BackendError::Unavailable("injected fetch failure".to_string()));
            }
            state.fetch_delays.pop_front()
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let state = self.state.lock().await;
        let mut spec = QuerySpec::new(query.page.map(|p| p.page_size).unwrap_or(1));
        spec.set_filter(query.filter.clone());
        spec.set_sort(query.sort);

        let page = match query.page {
            Some(page) => {
                spec.set_page(page.page);
                let view = pipeline::apply(&state.records, &spec);
                RecordPage {
                    records: view.rows,
                    total_count: view.total_count,
                }
            }
            None => {
                let records = pipeline::filtered_order(&state.records, &spec)
                    .into_iter()
                    .cloned()
                    .collect::<Vec<_>>();
                RecordPage {
                    total_count: records.len(),
                    records,
                }
            }
        };
        debug!(rows = page.records.len(), total = page.total_count, "served records");
        Ok(page)
    }

    async fn record_ids(&self, filter: &RecordFilter) -> Result<Vec<RecordId>, BackendError> {
        let mut state = self.state.lock().await;
        state.calls.record_ids += 1;
        if state.failing_enumerations > 0 {
            state.failing_enumerations -= 1;
            return Err(BackendError::Unavailable("injected enumeration failure".to_string()));
        }
        Ok(state
            .records
            .iter()
            .filter(|r| filter.matches(r))
            .map(|r| r.id.clone())
            .collect())
    }

    async fn record_action(&self, id: &RecordId, action: &ReviewAction) -> Result<(), BackendError> {
        let mut state = self.state.lock().await;
        state.calls.record_action += 1;
        apply_action(&mut state, id, action)
    }

    fn supports_batch(&self) -> bool {
        self.batch_support
    }

    async fn batch_action(
        &self,
        kind: ActionKind,
        items: &[BatchItem],
    ) -> Result<BatchResponse, BackendError> {
        let mut state = self.state.lock().await;
        state.calls.batch_action += 1;
        if !self.batch_support {
            return Err(BackendError::Rejected("batch endpoint not available".to_string()));
        }
        if let Some(reason) = &state.batch_rejection {
            return Err(BackendError::Rejected(reason.clone()));
        }

        let mut response = BatchResponse::default();
        for item in items {
            let outcome = match item.action(kind) {
                Some(action) => apply_action(&mut state, &item.id, &action),
                None => Err(BackendError::Rejected(format!("{kind} needs a product id"))),
            };
            match outcome {
                Ok(()) => response.succeeded.push(item.id.clone()),
                Err(err) => response.failed.push(BatchFailure {
                    id: item.id.clone(),
                    reason: err.to_string(),
                }),
            }
        }
        Ok(response)
    }

    /// Reading a task finalizes it when its items are all processed.
    async fn task_progress(&self, id: &RecordId) -> Result<TaskProgress, BackendError> {
        let mut state = self.state.lock().await;
        state.calls.task_progress += 1;
        let record = state
            .records
            .iter_mut()
            .find(|r| &r.id == id)
            .ok_or_else(|| BackendError::NotFound(id.clone()))?;
        if record.is_stuck() {
            record.status = RecordStatus::Completed;
        }
        let progress = record.progress.unwrap_or_else(|| mrq_core::ProgressCounters::new(0, 0));
        Ok(TaskProgress {
            status: record.status,
            processed_items: progress.processed_items(),
            total_items: progress.total_items(),
        })
    }
}
