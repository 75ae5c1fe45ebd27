//! Core domain model for the match review queue.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod confidence;
pub mod pipeline;

pub use confidence::{normalize, ConfidenceTier};
pub use pipeline::{PageView, QuerySpec, RecordFilter, SortKey};

pub const CRATE_NAME: &str = "mrq-core";

/// Opaque, stable record identifier handed out by the backend.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(String);

impl RecordId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RecordId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for RecordId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown {kind} `{value}`")]
pub struct ParseLabelError {
    pub kind: &'static str,
    pub value: String,
}

/// Review lifecycle of a record. Container tasks additionally move through
/// `Processing` and `Completed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    Pending,
    Reviewing,
    Confirmed,
    Rejected,
    Exception,
    Processing,
    Completed,
}

impl RecordStatus {
    pub const ALL: [RecordStatus; 7] = [
        RecordStatus::Pending,
        RecordStatus::Reviewing,
        RecordStatus::Confirmed,
        RecordStatus::Rejected,
        RecordStatus::Exception,
        RecordStatus::Processing,
        RecordStatus::Completed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RecordStatus::Pending => "pending",
            RecordStatus::Reviewing => "reviewing",
            RecordStatus::Confirmed => "confirmed",
            RecordStatus::Rejected => "rejected",
            RecordStatus::Exception => "exception",
            RecordStatus::Processing => "processing",
            RecordStatus::Completed => "completed",
        }
    }

    /// Still waiting on a reviewer decision.
    pub fn awaits_review(&self) -> bool {
        matches!(self, RecordStatus::Pending | RecordStatus::Exception)
    }
}

impl fmt::Display for RecordStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecordStatus {
    type Err = ParseLabelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let needle = s.trim();
        RecordStatus::ALL
            .into_iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(needle))
            .ok_or_else(|| ParseLabelError {
                kind: "status",
                value: s.to_string(),
            })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Urgent,
}

/// Item-level progress of a container task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "RawProgress")]
pub struct ProgressCounters {
    total_items: u32,
    processed_items: u32,
}

#[derive(Deserialize)]
struct RawProgress {
    total_items: u32,
    processed_items: u32,
}

impl From<RawProgress> for ProgressCounters {
    fn from(raw: RawProgress) -> Self {
        ProgressCounters::new(raw.total_items, raw.processed_items)
    }
}

impl ProgressCounters {
    /// `processed_items` is clamped to `total_items`.
    pub fn new(total_items: u32, processed_items: u32) -> Self {
        Self {
            total_items,
            processed_items: processed_items.min(total_items),
        }
    }

    pub fn total_items(&self) -> u32 {
        self.total_items
    }

    pub fn processed_items(&self) -> u32 {
        self.processed_items
    }

    pub fn completion_percentage(&self) -> u32 {
        if self.total_items == 0 {
            return 0;
        }
        ((u64::from(self.processed_items) * 100) / u64::from(self.total_items)) as u32
    }

    pub fn is_complete(&self) -> bool {
        self.total_items > 0 && self.processed_items == self.total_items
    }
}

/// Cheap per-fetch fingerprint used to decide whether a record changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct UpdatedSignature {
    pub status: RecordStatus,
    pub processed_items: u32,
    pub completion_percentage: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductRef {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub brand: Option<String>,
    #[serde(default)]
    pub company: Option<String>,
    #[serde(default)]
    pub code: Option<String>,
}

impl ProductRef {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            brand: None,
            company: None,
            code: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScoreTier {
    High,
    Medium,
    Low,
}

/// Raw score as produced by the matching engine. Only ever read through
/// [`confidence::normalize`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Score {
    Numeric(f64),
    Tier(ScoreTier),
    Breakdown { total: f64 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub product: ProductRef,
    #[serde(default)]
    pub score: Option<Score>,
    #[serde(default)]
    pub rank: usize,
}

impl Candidate {
    pub fn new(product: ProductRef, score: Option<Score>) -> Self {
        Self {
            product,
            score,
            rank: 0,
        }
    }

    pub fn normalized_score(&self) -> f64 {
        normalize(self.score.as_ref())
    }
}

/// One matchable line item under review.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub id: RecordId,
    pub original_name: String,
    pub status: RecordStatus,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub price: Option<f64>,
    #[serde(default)]
    pub candidates: Vec<Candidate>,
    #[serde(default)]
    pub selected_match: Option<ProductRef>,
    #[serde(default)]
    pub progress: Option<ProgressCounters>,
}

impl Record {
    pub fn new(id: impl Into<RecordId>, original_name: impl Into<String>, status: RecordStatus) -> Self {
        Self {
            id: id.into(),
            original_name: original_name.into(),
            status,
            priority: Priority::default(),
            source: None,
            price: None,
            candidates: Vec::new(),
            selected_match: None,
            progress: None,
        }
    }

    pub fn with_candidates(mut self, candidates: Vec<Candidate>) -> Self {
        self.candidates = candidates;
        self.rank_candidates();
        self
    }

    pub fn with_progress(mut self, total_items: u32, processed_items: u32) -> Self {
        self.progress = Some(ProgressCounters::new(total_items, processed_items));
        self
    }

    pub fn with_price(mut self, price: f64) -> Self {
        self.price = Some(price);
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// Stable descending sort on the normalized score; ranks become 0..n.
    pub fn rank_candidates(&mut self) {
        self.candidates
            .sort_by(|a, b| b.normalized_score().total_cmp(&a.normalized_score()));
        for (rank, candidate) in self.candidates.iter_mut().enumerate() {
            candidate.rank = rank;
        }
    }

    pub fn best_candidate(&self) -> Option<&Candidate> {
        self.candidates.iter().min_by_key(|c| c.rank)
    }

    pub fn best_candidate_score(&self) -> Option<f64> {
        self.best_candidate()
            .map(|c| confidence::round_one_decimal(c.normalized_score()))
    }

    /// Normalized best score, 0 when the record has no candidate.
    pub fn confidence(&self) -> f64 {
        self.best_candidate_score().unwrap_or(0.0)
    }

    /// Product an action should target: the reviewer's pick, else the top candidate.
    pub fn target_product(&self) -> Option<&ProductRef> {
        self.selected_match
            .as_ref()
            .or_else(|| self.best_candidate().map(|c| &c.product))
    }

    pub fn signature(&self) -> UpdatedSignature {
        let (processed_items, completion_percentage) = self
            .progress
            .map(|p| (p.processed_items(), p.completion_percentage()))
            .unwrap_or((0, 0));
        UpdatedSignature {
            status: self.status,
            processed_items,
            completion_percentage,
        }
    }

    /// Background work is still running for this record.
    pub fn is_in_progress(&self) -> bool {
        match self.status {
            RecordStatus::Processing => true,
            RecordStatus::Pending => self.progress.is_some(),
            _ => false,
        }
    }

    /// Item progress is complete but the aggregate status never moved on.
    pub fn is_stuck(&self) -> bool {
        self.status == RecordStatus::Processing
            && self.progress.map(|p| p.is_complete()).unwrap_or(false)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Confirm,
    Reject,
    Clear,
    Learn,
}

impl ActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::Confirm => "confirm",
            ActionKind::Reject => "reject",
            ActionKind::Clear => "clear",
            ActionKind::Learn => "learn",
        }
    }

    pub fn requires_product(&self) -> bool {
        matches!(self, ActionKind::Confirm | ActionKind::Learn)
    }

    /// Status a record lands in once the backend accepts the action.
    pub fn resulting_status(&self) -> RecordStatus {
        match self {
            ActionKind::Confirm | ActionKind::Learn => RecordStatus::Confirmed,
            ActionKind::Reject => RecordStatus::Rejected,
            ActionKind::Clear => RecordStatus::Pending,
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActionKind {
    type Err = ParseLabelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "confirm" => Ok(ActionKind::Confirm),
            "reject" => Ok(ActionKind::Reject),
            "clear" => Ok(ActionKind::Clear),
            "learn" => Ok(ActionKind::Learn),
            _ => Err(ParseLabelError {
                kind: "action",
                value: s.to_string(),
            }),
        }
    }
}

/// Fully-resolved action with its argument.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ReviewAction {
    Confirm { product_id: String },
    Reject,
    Clear,
    Learn { product_id: String },
}

impl ReviewAction {
    pub fn kind(&self) -> ActionKind {
        match self {
            ReviewAction::Confirm { .. } => ActionKind::Confirm,
            ReviewAction::Reject => ActionKind::Reject,
            ReviewAction::Clear => ActionKind::Clear,
            ReviewAction::Learn { .. } => ActionKind::Learn,
        }
    }

    pub fn product_id(&self) -> Option<&str> {
        match self {
            ReviewAction::Confirm { product_id } | ReviewAction::Learn { product_id } => {
                Some(product_id)
            }
            ReviewAction::Reject | ReviewAction::Clear => None,
        }
    }

    /// Builds the action for `kind`; product-bearing kinds need `product_id`.
    pub fn from_kind(kind: ActionKind, product_id: Option<String>) -> Option<Self> {
        match (kind, product_id) {
            (ActionKind::Confirm, Some(product_id)) => Some(ReviewAction::Confirm { product_id }),
            (ActionKind::Learn, Some(product_id)) => Some(ReviewAction::Learn { product_id }),
            (ActionKind::Reject, _) => Some(ReviewAction::Reject),
            (ActionKind::Clear, _) => Some(ReviewAction::Clear),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchFailure {
    pub id: RecordId,
    pub reason: String,
}

/// Outcome of a batch. Every submitted id lands in exactly one list.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchResult {
    pub succeeded: Vec<RecordId>,
    pub failed: Vec<BatchFailure>,
}

impl BatchResult {
    pub fn fail(&mut self, id: RecordId, reason: impl Into<String>) {
        self.failed.push(BatchFailure {
            id,
            reason: reason.into(),
        });
    }

    pub fn total(&self) -> usize {
        self.succeeded.len() + self.failed.len()
    }

    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}
