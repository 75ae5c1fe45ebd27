//! JSON-over-HTTP backend with bounded concurrency and retrying reads.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use mrq_core::{ActionKind, RecordFilter, RecordId, ReviewAction};
use reqwest::{StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tracing::{debug, info_span, Instrument};

use crate::{
    filter_params, BackendError, BatchActionRequest, BatchItem, BatchResponse, RecordIdList,
    RecordPage, RecordQuery, ReviewBackend, TaskProgress,
};

/// Whether a failed read deserves another attempt. Actions never retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadRetry {
    Again,
    GiveUp,
}

impl ReadRetry {
    /// Server trouble and throttling clear up on their own; other statuses
    /// mean the request itself is wrong.
    pub fn after_status(status: StatusCode) -> Self {
        match status.as_u16() {
            429 | 500..=599 => ReadRetry::Again,
            _ => ReadRetry::GiveUp,
        }
    }

    pub fn after_error(err: &reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() {
            ReadRetry::Again
        } else {
            ReadRetry::GiveUp
        }
    }
}

/// Pause before each read retry: doubles from `base_delay` up to `max_delay`.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(2),
        }
    }
}

impl BackoffPolicy {
    /// Delay before retry number `retry` (0-based).
    pub fn pause_before(&self, retry: usize) -> Duration {
        let doublings = u32::try_from(retry).unwrap_or(u32::MAX).min(16);
        self.base_delay
            .saturating_mul(2u32.saturating_pow(doublings))
            .min(self.max_delay)
    }

    fn allows(&self, retry: usize) -> bool {
        retry < self.max_retries
    }
}

#[derive(Debug, Clone)]
pub struct HttpBackendConfig {
    pub base_url: String,
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub max_in_flight: usize,
    pub backoff: BackoffPolicy,
}

impl Default for HttpBackendConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080/api".to_string(),
            timeout: Duration::from_secs(20),
            user_agent: None,
            max_in_flight: 8,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ActionResponse {
    #[serde(default)]
    ok: bool,
    #[serde(default)]
    error: Option<String>,
}

/// Talks to the record backend. Reads retry with backoff on transient
/// failures; actions are sent exactly once.
#[derive(Debug)]
pub struct HttpReviewBackend {
    client: reqwest::Client,
    base_url: Url,
    in_flight: Arc<Semaphore>,
    backoff: BackoffPolicy,
}

impl HttpReviewBackend {
    pub fn new(config: HttpBackendConfig) -> anyhow::Result<Self> {
        let base_url = Url::parse(&config.base_url)
            .with_context(|| format!("parsing backend url {}", config.base_url))?;
        if base_url.cannot_be_a_base() {
            anyhow::bail!("backend url {} cannot carry a path", config.base_url);
        }

        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;

        Ok(Self {
            client,
            base_url,
            in_flight: Arc::new(Semaphore::new(config.max_in_flight.max(1))),
            backoff: config.backoff,
        })
    }

    pub fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    async fn acquire_slot(&self) -> Result<tokio::sync::SemaphorePermit<'_>, BackendError> {
        self.in_flight
            .acquire()
            .await
            .map_err(|_| BackendError::Unavailable("client is shutting down".to_string()))
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        url: Url,
        params: &[(&'static str, String)],
    ) -> Result<T, BackendError> {
        let _permit = self.acquire_slot().await?;

        let mut retry = 0;
        loop {
            let failure = match self.client.get(url.clone()).query(params).send().await {
                Ok(resp) if resp.status().is_success() => return decode(resp).await,
                Ok(resp) => {
                    let status = resp.status();
                    let failure = BackendError::HttpStatus {
                        status: status.as_u16(),
                        url: url.to_string(),
                    };
                    (ReadRetry::after_status(status), failure)
                }
                Err(err) => (ReadRetry::after_error(&err), BackendError::Request(err)),
            };
            match failure {
                (ReadRetry::Again, err) if self.backoff.allows(retry) => {
                    debug!(%url, retry, error = %err, "retrying read");
                    tokio::time::sleep(self.backoff.pause_before(retry)).await;
                    retry += 1;
                }
                (_, err) => return Err(err),
            }
        }
    }

    async fn post_json<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        url: Url,
        body: &B,
    ) -> Result<T, BackendError> {
        let _permit = self.acquire_slot().await?;
        let resp = self.client.post(url.clone()).json(body).send().await?;
        let status = resp.status();
        if status.is_success() {
            return decode(resp).await;
        }
        if status.is_client_error() && status != StatusCode::TOO_MANY_REQUESTS {
            let reason = resp
                .json::<ActionResponse>()
                .await
                .ok()
                .and_then(|r| r.error)
                .unwrap_or_else(|| format!("http status {}", status.as_u16()));
            return Err(BackendError::Rejected(reason));
        }
        Err(BackendError::HttpStatus {
            status: status.as_u16(),
            url: url.to_string(),
        })
    }
}

async fn decode<T: DeserializeOwned>(resp: reqwest::Response) -> Result<T, BackendError> {
    let url = resp.url().to_string();
    let bytes = resp.bytes().await?;
    serde_json::from_slice(&bytes).map_err(|err| BackendError::Decode {
        url,
        message: err.to_string(),
    })
}

#[async_trait]
impl ReviewBackend for HttpReviewBackend {
    async fn records(&self, query: &RecordQuery) -> Result<RecordPage, BackendError> {
        let url = self.endpoint(&["records"]);
        let span = info_span!("backend_records", %url, paged = query.page.is_some());
        let mut page: RecordPage = self.get_json(url, &query.to_params()).instrument(span).await?;
        for record in &mut page.records {
            record.rank_candidates();
        }
        Ok(page)
    }

    async fn record_ids(&self, filter: &RecordFilter) -> Result<Vec<RecordId>, BackendError> {
        let url = self.endpoint(&["records", "ids"]);
        let span = info_span!("backend_record_ids", %url);
        let list: RecordIdList = self.get_json(url, &filter_params(filter)).instrument(span).await?;
        Ok(list.ids)
    }

    async fn record_action(&self, id: &RecordId, action: &ReviewAction) -> Result<(), BackendError> {
        let url = self.endpoint(&["records", id.as_str(), "actions"]);
        let span = info_span!("backend_record_action", record_id = %id, action = %action.kind());
        let resp: ActionResponse = self
            .post_json(url, action)
            .instrument(span)
            .await?;
        match (resp.ok, resp.error) {
            (true, _) => Ok(()),
            (false, Some(reason)) => Err(BackendError::Rejected(reason)),
            (false, None) => Err(BackendError::Rejected("action not acknowledged".to_string())),
        }
    }

    async fn batch_action(
        &self,
        kind: ActionKind,
        items: &[BatchItem],
    ) -> Result<BatchResponse, BackendError> {
        let url = self.endpoint(&["records", "batch-actions"]);
        let span = info_span!("backend_batch_action", action = %kind, items = items.len());
        let request = BatchActionRequest {
            action: kind,
            items: items.to_vec(),
        };
        self.post_json(url, &request).instrument(span).await
    }

    async fn task_progress(&self, id: &RecordId) -> Result<TaskProgress, BackendError> {
        let url = self.endpoint(&["tasks", id.as_str(), "progress"]);
        let span = info_span!("backend_task_progress", task_id = %id);
        self.get_json::<TaskProgress>(url, &[]).instrument(span).await
    }
}
