//! Batch actions over a selection. Every submitted id ends up in exactly
//! one of `succeeded` or `failed`.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use mrq_client::{BatchItem, BatchResponse, ReviewBackend};
use mrq_core::{ActionKind, BatchResult, Record, RecordId};
use tracing::{info, warn};

use crate::error::ResolutionError;

/// Builds the batch item for a record from its loaded data: product actions
/// target the reviewer's pick, else the top candidate.
pub fn resolve_target(id: &RecordId, record: Option<&Record>, kind: ActionKind) -> Result<BatchItem, ResolutionError> {
    if !kind.requires_product() {
        return Ok(BatchItem {
            id: id.clone(),
            product_id: None,
        });
    }
    let record = record.ok_or_else(|| ResolutionError::new(id.clone(), "record is not loaded"))?;
    let product = record
        .target_product()
        .ok_or_else(|| ResolutionError::new(id.clone(), format!("no candidate product to {kind}")))?;
    Ok(BatchItem {
        id: id.clone(),
        product_id: Some(product.id.clone()),
    })
}

pub struct BatchOrchestrator {
    backend: Arc<dyn ReviewBackend>,
}

impl BatchOrchestrator {
    pub fn new(backend: Arc<dyn ReviewBackend>) -> Self {
        Self { backend }
    }

    /// Resolves each id, then dispatches the resolvable ones in one batch
    /// call, or one call per id when the backend has no batch endpoint.
    pub async fn run<R>(&self, ids: &[RecordId], kind: ActionKind, resolver: R) -> BatchResult
    where
        R: Fn(&RecordId) -> Result<BatchItem, ResolutionError>,
    {
        let mut result = BatchResult::default();
        let mut seen = HashSet::new();
        let mut items = Vec::new();
        for id in ids {
            if !seen.insert(id) {
                continue;
            }
            match resolver(id) {
                Ok(item) => items.push(item),
                Err(err) => result.fail(id.clone(), err.reason),
            }
        }

        if !items.is_empty() {
            if self.backend.supports_batch() {
                self.dispatch_batch(kind, items, &mut result).await;
            } else {
                self.dispatch_each(kind, items, &mut result).await;
            }
        }

        info!(
            action = %kind,
            succeeded = result.succeeded.len(),
            failed = result.failed.len(),
            "batch finished"
        );
        result
    }

    async fn dispatch_batch(&self, kind: ActionKind, items: Vec<BatchItem>, result: &mut BatchResult) {
        match self.backend.batch_action(kind, &items).await {
            Ok(response) => merge_response(items, response, result),
            Err(err) => {
                warn!(action = %kind, items = items.len(), error = %err, "batch call rejected");
                let reason = format!("batch rejected: {err}");
                for item in items {
                    result.fail(item.id, reason.clone());
                }
            }
        }
    }

    async fn dispatch_each(&self, kind: ActionKind, items: Vec<BatchItem>, result: &mut BatchResult) {
        for item in items {
            let Some(action) = item.action(kind) else {
                result.fail(item.id, format!("{kind} needs a product id"));
                continue;
            };
            match self.backend.record_action(&item.id, &action).await {
                Ok(()) => result.succeeded.push(item.id),
                Err(err) => result.fail(item.id, err.to_string()),
            }
        }
    }
}

/// Folds the backend's per-id report into `result` in submission order.
/// Ids reported as failed win over a success report; unreported ids fail.
fn merge_response(items: Vec<BatchItem>, response: BatchResponse, result: &mut BatchResult) {
    let succeeded = response.succeeded.into_iter().collect::<HashSet<_>>();
    let mut failed = response
        .failed
        .into_iter()
        .map(|f| (f.id, f.reason))
        .collect::<HashMap<_, _>>();

    for item in items {
        if let Some(reason) = failed.remove(&item.id) {
            result.fail(item.id, reason);
        } else if succeeded.contains(&item.id) {
            result.succeeded.push(item.id);
        } else {
            result.fail(item.id, "no result reported by backend");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mrq_client::InMemoryBackend;
    use mrq_core::{BatchFailure, Candidate, ProductRef, RecordStatus, Score};

    fn record(id: &str) -> Record {
        Record::new(id, format!("Item {id}"), RecordStatus::Pending).with_candidates(vec![Candidate::new(
            ProductRef::new(format!("p-{id}"), "Product"),
            Some(Score::Numeric(91.0)),
        )])
    }

    fn ids(n: usize) -> Vec<RecordId> {
        (1..=n).map(|i| RecordId::new(format!("r{i}"))).collect()
    }

    fn records(n: usize) -> Vec<Record> {
        (1..=n).map(|i| record(&format!("r{i}"))).collect()
    }

    fn resolver(records: Vec<Record>, kind: ActionKind) -> impl Fn(&RecordId) -> Result<BatchItem, ResolutionError> {
        move |id| resolve_target(id, records.iter().find(|r| &r.id == id), kind)
    }

    #[tokio::test]
    async fn resolution_failures_do_not_abort_the_batch() {
        let mut loaded = records(5);
        loaded[2].candidates.clear();
        let backend = Arc::new(InMemoryBackend::new(loaded.clone()));
        let orchestrator = BatchOrchestrator::new(backend.clone());

        let result = orchestrator
            .run(&ids(5), ActionKind::Confirm, resolver(loaded, ActionKind::Confirm))
            .await;

        assert_eq!(result.succeeded.len(), 4);
        assert_eq!(result.failed.len(), 1);
        assert_eq!(result.failed[0].id, RecordId::from("r3"));
        assert_eq!(backend.calls().await.batch_action, 1);
    }

    #[tokio::test]
    async fn rejected_batch_fails_every_dispatched_id() {
        let loaded = records(3);
        let backend = Arc::new(InMemoryBackend::new(loaded.clone()));
        backend.reject_batches("queue locked").await;
        let orchestrator = BatchOrchestrator::new(backend);

        let result = orchestrator
            .run(&ids(3), ActionKind::Learn, resolver(loaded, ActionKind::Learn))
            .await;

        assert!(result.succeeded.is_empty());
        assert_eq!(result.failed.len(), 3);
        assert!(result.failed.iter().all(|f| f.reason.contains("queue locked")));
    }

    #[tokio::test]
    async fn falls_back_to_single_actions_without_batch_endpoint() {
        let loaded = records(3);
        let backend = Arc::new(InMemoryBackend::new(loaded.clone()).without_batch_support());
        backend.reject_actions_for("r2").await;
        let orchestrator = BatchOrchestrator::new(backend.clone());

        let result = orchestrator
            .run(&ids(3), ActionKind::Reject, resolver(loaded, ActionKind::Reject))
            .await;

        assert_eq!(result.succeeded, vec![RecordId::from("r1"), RecordId::from("r3")]);
        assert_eq!(result.failed.len(), 1);
        let calls = backend.calls().await;
        assert_eq!(calls.batch_action, 0);
        assert_eq!(calls.record_action, 3);
    }

    #[tokio::test]
    async fn duplicate_ids_are_submitted_once() {
        let loaded = records(2);
        let backend = Arc::new(InMemoryBackend::new(loaded.clone()));
        let orchestrator = BatchOrchestrator::new(backend);
        let mut submitted = ids(2);
        submitted.push(RecordId::from("r1"));

        let result = orchestrator
            .run(&submitted, ActionKind::Clear, resolver(loaded, ActionKind::Clear))
            .await;
        assert_eq!(result.total(), 2);
    }

    #[test]
    fn unreported_and_double_reported_ids_count_as_failed() {
        let items = ids(3)
            .into_iter()
            .map(|id| BatchItem { id, product_id: None })
            .collect::<Vec<_>>();
        let response = BatchResponse {
            succeeded: vec![RecordId::from("r1"), RecordId::from("r2")],
            failed: vec![BatchFailure {
                id: RecordId::from("r2"),
                reason: "conflict".into(),
            }],
        };
        let mut result = BatchResult::default();
        merge_response(items, response, &mut result);

        assert_eq!(result.succeeded, vec![RecordId::from("r1")]);
        assert_eq!(result.failed[0], BatchFailure { id: RecordId::from("r2"), reason: "conflict".into() });
        assert_eq!(result.failed[1].id, RecordId::from("r3"));
        assert_eq!(result.total(), 3);
    }

    #[test]
    fn reject_needs_no_loaded_record() {
        let item = resolve_target(&RecordId::from("x"), None, ActionKind::Reject).unwrap();
        assert_eq!(item.product_id, None);
        let err = resolve_target(&RecordId::from("x"), None, ActionKind::Confirm).unwrap_err();
        assert_eq!(err.reason, "record is not loaded");
    }
}
