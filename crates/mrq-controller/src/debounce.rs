//! Quiet-period debounce for search input.

use std::future::Future;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Forwards the latest pushed term once no new term arrived for `delay`.
/// Every push restarts the quiet period.
#[derive(Debug, Clone)]
pub struct SearchDebouncer {
    tx: mpsc::UnboundedSender<String>,
}

impl SearchDebouncer {
    pub fn spawn<F, Fut>(delay: Duration, cancel: CancellationToken, on_settled: F) -> Self
    where
        F: Fn(String) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        tokio::spawn(async move {
            loop {
                let mut pending = tokio::select! {
                    _ = cancel.cancelled() => break,
                    term = rx.recv() => match term {
                        Some(term) => term,
                        None => break,
                    },
                };
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        next = rx.recv() => match next {
                            Some(term) => pending = term,
                            None => return,
                        },
                        _ = tokio::time::sleep(delay) => {
                            debug!(term = %pending, "search settled");
                            on_settled(pending).await;
                            break;
                        }
                    }
                }
            }
        });
        Self { tx }
    }

    /// Returns false once the debouncer has shut down.
    pub fn push(&self, term: impl Into<String>) -> bool {
        self.tx.send(term.into()).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn recorder() -> (Arc<Mutex<Vec<String>>>, impl Fn(String) -> std::future::Ready<()> + Send + 'static) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        (seen, move |term| {
            sink.lock().unwrap().push(term);
            std::future::ready(())
        })
    }

    #[tokio::test(start_paused = true)]
    async fn burst_of_keystrokes_settles_once() {
        let (seen, sink) = recorder();
        let debouncer = SearchDebouncer::spawn(Duration::from_millis(800), CancellationToken::new(), sink);

        for term in ["c", "co", "col", "cola"] {
            debouncer.push(term);
            tokio::time::sleep(Duration::from_millis(300)).await;
        }
        assert!(seen.lock().unwrap().is_empty());

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(*seen.lock().unwrap(), vec!["cola".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn separate_pauses_settle_separately() {
        let (seen, sink) = recorder();
        let debouncer = SearchDebouncer::spawn(Duration::from_millis(800), CancellationToken::new(), sink);

        debouncer.push("tea");
        tokio::time::sleep(Duration::from_secs(1)).await;
        debouncer.push("coffee");
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert_eq!(*seen.lock().unwrap(), vec!["tea".to_string(), "coffee".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_drops_pending_term() {
        let (seen, sink) = recorder();
        let cancel = CancellationToken::new();
        let debouncer = SearchDebouncer::spawn(Duration::from_millis(800), cancel.clone(), sink);

        debouncer.push("milk");
        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();
        tokio::time::sleep(Duration::from_secs(2)).await;

        assert!(seen.lock().unwrap().is_empty());
        assert!(!debouncer.push("late"));
    }
}
