use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use mrq_client::{BackoffPolicy, HttpBackendConfig};
use mrq_core::pipeline::DEFAULT_PAGE_SIZE;
use serde::Deserialize;

use crate::events::DEFAULT_EVENT_CAPACITY;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    pub backend_url: String,
    pub poll_interval_ms: u64,
    pub search_debounce_ms: u64,
    pub stuck_stagger_ms: u64,
    pub page_size: usize,
    pub poll_only_while_in_progress: bool,
    pub http_timeout_secs: u64,
    pub user_agent: String,
    pub event_capacity: usize,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            backend_url: "http://localhost:8080/api".to_string(),
            poll_interval_ms: 3_000,
            search_debounce_ms: 800,
            stuck_stagger_ms: 500,
            page_size: DEFAULT_PAGE_SIZE,
            poll_only_while_in_progress: true,
            http_timeout_secs: 20,
            user_agent: "mrq/0.1".to_string(),
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

impl ControllerConfig {
    pub fn from_env() -> Self {
        Self::default().with_env_overrides(|key| std::env::var(key).ok())
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    /// Applies `MRQ_*` variables on top of `self`. Unparseable values are
    /// ignored and keep the current setting.
    pub fn with_env_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(url) = lookup("MRQ_BACKEND_URL") {
            self.backend_url = url;
        }
        if let Some(ua) = lookup("MRQ_USER_AGENT") {
            self.user_agent = ua;
        }
        override_parsed(&lookup, "MRQ_POLL_INTERVAL_MS", &mut self.poll_interval_ms);
        override_parsed(&lookup, "MRQ_SEARCH_DEBOUNCE_MS", &mut self.search_debounce_ms);
        override_parsed(&lookup, "MRQ_STUCK_STAGGER_MS", &mut self.stuck_stagger_ms);
        override_parsed(&lookup, "MRQ_PAGE_SIZE", &mut self.page_size);
        override_parsed(&lookup, "MRQ_POLL_ONLY_IN_PROGRESS", &mut self.poll_only_while_in_progress);
        override_parsed(&lookup, "MRQ_HTTP_TIMEOUT_SECS", &mut self.http_timeout_secs);
        self
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn search_debounce(&self) -> Duration {
        Duration::from_millis(self.search_debounce_ms)
    }

    pub fn stuck_stagger(&self) -> Duration {
        Duration::from_millis(self.stuck_stagger_ms)
    }

    pub fn http_backend_config(&self) -> HttpBackendConfig {
        HttpBackendConfig {
            base_url: self.backend_url.clone(),
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            max_in_flight: 8,
            backoff: BackoffPolicy::default(),
        }
    }
}

fn override_parsed<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    slot: &mut T,
) {
    if let Some(value) = lookup(key).and_then(|v| v.trim().parse().ok()) {
        *slot = value;
    }
}
