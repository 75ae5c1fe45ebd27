//! Backend contracts consumed by the review queue controller, plus the HTTP
//! and in-memory implementations.

use async_trait::async_trait;
use mrq_core::{
    ActionKind, BatchFailure, QuerySpec, Record, RecordFilter, RecordId, RecordStatus,
    ReviewAction, SortKey,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod http;
pub mod memory;

pub use http::{BackoffPolicy, HttpBackendConfig, HttpReviewBackend};
pub use memory::{CallCounts, InMemoryBackend};

pub const CRATE_NAME: &str = "mrq-client";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRequest {
    pub page: usize,
    pub page_size: usize,
}

/// Arguments of the record fetch. `page: None` asks for every matching row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordQuery {
    pub filter: RecordFilter,
    pub sort: SortKey,
    pub page: Option<PageRequest>,
}

impl RecordQuery {
    pub fn all(filter: RecordFilter, sort: SortKey) -> Self {
        Self {
            filter,
            sort,
            page: None,
        }
    }

    pub fn paged(spec: &QuerySpec) -> Self {
        Self {
            filter: spec.filter().clone(),
            sort: spec.sort(),
            page: Some(PageRequest {
                page: spec.page(),
                page_size: spec.page_size(),
            }),
        }
    }

    /// Query-string form shared by the record and id endpoints.
    pub fn to_params(&self) -> Vec<(&'static str, String)> {
        let mut params = filter_params(&self.filter);
        params.push(("sort", self.sort.as_str().to_string()));
        if let Some(page) = self.page {
            params.push(("page", page.page.to_string()));
            params.push(("page_size", page.page_size.to_string()));
        }
        params
    }
}

pub fn filter_params(filter: &RecordFilter) -> Vec<(&'static str, String)> {
    let mut params = Vec::new();
    let term = filter.search_term.trim();
    if !term.is_empty() {
        params.push(("search", term.to_string()));
    }
    if let Some(status) = filter.status {
        params.push(("status", status.as_str().to_string()));
    }
    if let Some(tier) = filter.confidence_tier {
        params.push(("tier", tier.as_str().to_string()));
    }
    if let Some(source) = &filter.source {
        params.push(("source", source.clone()));
    }
    params
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordPage {
    pub records: Vec<Record>,
    pub total_count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordIdList {
    pub ids: Vec<RecordId>,
}

/// One entry of a batch call: the record and the argument its action needs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchItem {
    pub id: RecordId,
    #[serde(default)]
    pub product_id: Option<String>,
}

impl BatchItem {
    pub fn action(&self, kind: ActionKind) -> Option<ReviewAction> {
        ReviewAction::from_kind(kind, self.product_id.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchActionRequest {
    pub action: ActionKind,
    pub items: Vec<BatchItem>,
}

/// Per-id outcome reported by the batch endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchResponse {
    #[serde(default)]
    pub succeeded: Vec<RecordId>,
    #[serde(default)]
    pub failed: Vec<BatchFailure>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskProgress {
    pub status: RecordStatus,
    pub processed_items: u32,
    pub total_items: u32,
}

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("backend unavailable: {0}")]
    Unavailable(String),
    #[error("rejected: {0}")]
    Rejected(String),
    #[error("record {0} not found")]
    NotFound(RecordId),
    #[error("decoding response from {url}: {message}")]
    Decode { url: String, message: String },
}

impl BackendError {
    /// Worth retrying on the next poll tick.
    pub fn is_transient(&self) -> bool {
        match self {
            BackendError::Request(_) | BackendError::Unavailable(_) => true,
            BackendError::HttpStatus { status, .. } => *status >= 500 || *status == 429,
            BackendError::Rejected(_) | BackendError::NotFound(_) | BackendError::Decode { .. } => {
                false
            }
        }
    }
}

/// The five operations the review queue needs from the record backend.
#[async_trait]
pub trait ReviewBackend: Send + Sync {
    async fn records(&self, query: &RecordQuery) -> Result<RecordPage, BackendError>;

    /// Lightweight enumeration for select-all; never loads full records.
    async fn record_ids(&self, filter: &RecordFilter) -> Result<Vec<RecordId>, BackendError>;

    async fn record_action(&self, id: &RecordId, action: &ReviewAction) -> Result<(), BackendError>;

    fn supports_batch(&self) -> bool {
        true
    }

    async fn batch_action(
        &self,
        kind: ActionKind,
        items: &[BatchItem],
    ) -> Result<BatchResponse, BackendError>;

    async fn task_progress(&self, id: &RecordId) -> Result<TaskProgress, BackendError>;
}
