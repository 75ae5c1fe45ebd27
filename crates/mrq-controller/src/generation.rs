//! Request generation tokens. Every outgoing request of a kind takes a new
//! token; a response is applied only while its token is still the newest of
//! that kind and the session has not been torn down.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestKind {
    Records,
    RecordIds,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Generation(u64);

impl Generation {
    pub fn value(&self) -> u64 {
        self.0
    }
}

/// Result of a request that may have been superseded while in flight.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Applied<T> {
    Fresh(T),
    Stale,
}

impl<T> Applied<T> {
    pub fn is_stale(&self) -> bool {
        matches!(self, Applied::Stale)
    }

    pub fn fresh(self) -> Option<T> {
        match self {
            Applied::Fresh(value) => Some(value),
            Applied::Stale => None,
        }
    }
}

#[derive(Debug, Default)]
pub struct Generations {
    records: AtomicU64,
    record_ids: AtomicU64,
    closed: AtomicBool,
}

impl Generations {
    pub fn new() -> Self {
        Self::default()
    }

    fn counter(&self, kind: RequestKind) -> &AtomicU64 {
        match kind {
            RequestKind::Records => &self.records,
            RequestKind::RecordIds => &self.record_ids,
        }
    }

    pub fn issue(&self, kind: RequestKind) -> Generation {
        Generation(self.counter(kind).fetch_add(1, Ordering::SeqCst) + 1)
    }

    pub fn is_current(&self, kind: RequestKind, generation: Generation) -> bool {
        !self.closed.load(Ordering::SeqCst)
            && self.counter(kind).load(Ordering::SeqCst) == generation.0
    }

    /// Makes every outstanding token stale, permanently.
    pub fn invalidate_all(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.records.fetch_add(1, Ordering::SeqCst);
        self.record_ids.fetch_add(1, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn newer_token_supersedes_older() {
        let generations = Generations::new();
        let first = generations.issue(RequestKind::Records);
        let second = generations.issue(RequestKind::Records);
        assert!(!generations.is_current(RequestKind::Records, first));
        assert!(generations.is_current(RequestKind::Records, second));
        assert!(second > first);
    }

    #[test]
    fn kinds_are_independent() {
        let generations = Generations::new();
        let records = generations.issue(RequestKind::Records);
        generations.issue(RequestKind::RecordIds);
        assert!(generations.is_current(RequestKind::Records, records));
    }

    #[test]
    fn invalidation_is_permanent() {
        let generations = Generations::new();
        generations.invalidate_all();
        let after = generations.issue(RequestKind::Records);
        assert!(!generations.is_current(RequestKind::Records, after));
        assert!(generations.is_closed());
    }
}
