//! Change detection between fetches and the periodic refresh task.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use mrq_core::{Record, RecordId, UpdatedSignature};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// The last applied fetch: full records plus their change signatures.
#[derive(Debug, Clone)]
pub struct PollSnapshot {
    records: Vec<Record>,
    signatures: HashMap<RecordId, UpdatedSignature>,
    captured_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SnapshotDiff {
    /// New ids and ids whose signature moved, in incoming order.
    pub changed: Vec<RecordId>,
    pub removed: Vec<RecordId>,
}

impl SnapshotDiff {
    pub fn is_empty(&self) -> bool {
        self.changed.is_empty() && self.removed.is_empty()
    }

    /// Diff of a first fetch: everything is new.
    pub fn initial(records: &[Record]) -> Self {
        Self {
            changed: records.iter().map(|r| r.id.clone()).collect(),
            removed: Vec::new(),
        }
    }
}

impl PollSnapshot {
    pub fn capture(records: Vec<Record>) -> Self {
        let signatures = records
            .iter()
            .map(|r| (r.id.clone(), r.signature()))
            .collect();
        Self {
            records,
            signatures,
            captured_at: Utc::now(),
        }
    }

    pub fn records(&self) -> &[Record] {
        &self.records
    }

    pub fn captured_at(&self) -> DateTime<Utc> {
        self.captured_at
    }

    pub fn get(&self, id: &RecordId) -> Option<&Record> {
        self.records.iter().find(|r| &r.id == id)
    }

    /// Local edit ahead of the backend (optimistic status). Signatures keep
    /// the last fetched values so the next fetch still registers as a change.
    pub fn update_local(&mut self, id: &RecordId, update: impl FnOnce(&mut Record)) -> bool {
        match self.records.iter_mut().find(|r| &r.id == id) {
            Some(record) => {
                update(record);
                true
            }
            None => false,
        }
    }

    /// Compares an incoming fetch against this snapshot by signature and id
    /// membership only.
    pub fn diff(&self, incoming: &[Record]) -> SnapshotDiff {
        let changed = incoming
            .iter()
            .filter(|r| self.signatures.get(&r.id) != Some(&r.signature()))
            .map(|r| r.id.clone())
            .collect();
        let incoming_ids = incoming.iter().map(|r| &r.id).collect::<HashSet<_>>();
        let removed = self
            .records
            .iter()
            .filter(|r| !incoming_ids.contains(&r.id))
            .map(|r| r.id.clone())
            .collect();
        SnapshotDiff { changed, removed }
    }
}

/// Remembers which stuck tasks were already reconciled so each stuck
/// interval triggers one call. An id re-arms once it leaves the stuck state.
#[derive(Debug, Default)]
pub struct StuckTracker {
    reconciled: HashSet<RecordId>,
}

impl StuckTracker {
    /// Returns the ids that just became stuck, in record order.
    pub fn scan(&mut self, records: &[Record]) -> Vec<RecordId> {
        let stuck = records
            .iter()
            .filter(|r| r.is_stuck())
            .map(|r| &r.id)
            .collect::<HashSet<_>>();
        self.reconciled.retain(|id| stuck.contains(id));

        let mut fresh = Vec::new();
        for record in records.iter().filter(|r| r.is_stuck()) {
            if self.reconciled.insert(record.id.clone()) {
                fresh.push(record.id.clone());
            }
        }
        fresh
    }

    pub fn clear(&mut self) {
        self.reconciled.clear();
    }
}

/// Fixed-interval refresh task. Idle until started; stopping cancels the
/// in-flight tick.
#[derive(Debug, Default)]
pub struct PollLoop {
    running: Option<(CancellationToken, JoinHandle<()>)>,
}

impl PollLoop {
    pub fn is_polling(&self) -> bool {
        self.running
            .as_ref()
            .map(|(token, _)| !token.is_cancelled())
            .unwrap_or(false)
    }

    /// Starts ticking every `interval`, first tick one interval from now.
    /// No-op while already polling.
    pub fn start<F, Fut>(&mut self, interval: Duration, parent: &CancellationToken, tick: F)
    where
        F: Fn() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        if self.is_polling() || parent.is_cancelled() {
            return;
        }
        let token = parent.child_token();
        let task_token = token.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = task_token.cancelled() => break,
                    _ = ticker.tick() => {
                        tokio::select! {
                            _ = task_token.cancelled() => break,
                            _ = tick() => {}
                        }
                    }
                }
            }
            debug!("poll loop stopped");
        });
        self.running = Some((token, handle));
    }

    pub fn stop(&mut self) {
        if let Some((token, _handle)) = self.running.take() {
            token.cancel();
        }
    }
}

impl Drop for PollLoop {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mrq_core::RecordStatus;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn task(id: &str, total: u32, processed: u32) -> Record {
        Record::new(id, format!("Task {id}"), RecordStatus::Processing).with_progress(total, processed)
    }

    #[test]
    fn identical_fetch_produces_empty_diff() {
        let records = vec![task("a", 10, 3), task("b", 10, 5)];
        let snapshot = PollSnapshot::capture(records.clone());
        assert!(snapshot.diff(&records).is_empty());
    }

    #[test]
    fn progress_change_is_reported_for_that_id_only() {
        let snapshot = PollSnapshot::capture(vec![task("a", 10, 3), task("b", 10, 5)]);
        let diff = snapshot.diff(&[task("a", 10, 3), task("b", 10, 6)]);
        assert_eq!(diff.changed, vec![RecordId::from("b")]);
        assert!(diff.removed.is_empty());
    }

    #[test]
    fn membership_changes_are_reported() {
        let snapshot = PollSnapshot::capture(vec![task("a", 10, 3), task("b", 10, 5)]);
        let diff = snapshot.diff(&[task("b", 10, 5), task("c", 4, 0)]);
        assert_eq!(diff.changed, vec![RecordId::from("c")]);
        assert_eq!(diff.removed, vec![RecordId::from("a")]);
    }

    #[test]
    fn non_signature_fields_are_ignored() {
        let snapshot = PollSnapshot::capture(vec![task("a", 10, 3)]);
        let mut renamed = task("a", 10, 3);
        renamed.original_name = "Renamed".into();
        assert!(snapshot.diff(&[renamed]).is_empty());
    }

    #[test]
    fn local_updates_keep_fetched_signature() {
        let mut snapshot = PollSnapshot::capture(vec![task("a", 10, 3)]);
        assert!(snapshot.update_local(&RecordId::from("a"), |r| r.status = RecordStatus::Confirmed));
        assert_eq!(snapshot.get(&RecordId::from("a")).unwrap().status, RecordStatus::Confirmed);
        assert!(snapshot.diff(&[task("a", 10, 3)]).is_empty());
    }

    #[test]
    fn stuck_task_fires_once_per_stuck_interval() {
        let mut tracker = StuckTracker::default();
        let stuck = vec![task("t", 4, 4)];

        assert_eq!(tracker.scan(&stuck), vec![RecordId::from("t")]);
        assert!(tracker.scan(&stuck).is_empty());
        assert!(tracker.scan(&stuck).is_empty());

        let mut done = task("t", 4, 4);
        done.status = RecordStatus::Completed;
        assert!(tracker.scan(&[done]).is_empty());
        assert_eq!(tracker.scan(&stuck), vec![RecordId::from("t")]);
    }

    #[test]
    fn incomplete_tasks_are_not_stuck() {
        let mut tracker = StuckTracker::default();
        assert!(tracker.scan(&[task("t", 4, 3), task("u", 0, 0)]).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn poll_loop_ticks_on_interval_until_stopped() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let parent = CancellationToken::new();
        let mut poll = PollLoop::default();

        let counter = ticks.clone();
        poll.start(Duration::from_secs(3), &parent, move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });
        assert!(poll.is_polling());

        tokio::time::sleep(Duration::from_millis(9_500)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 3);

        poll.stop();
        assert!(!poll.is_polling());
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn parent_cancellation_stops_the_loop() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let parent = CancellationToken::new();
        let mut poll = PollLoop::default();

        let counter = ticks.clone();
        poll.start(Duration::from_secs(1), &parent, move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });
        parent.cancel();
        assert!(!poll.is_polling());
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 0);
    }
}
