use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

type AbortListener = Box<dyn FnOnce() + Send>;

/// Per-task cancellation handle shared between the pipeline, the task
/// handler, retry sleepers and deadline timers.
///
/// Cancellation fires at most once; every registered listener is
/// invoked exactly once, and listeners registered after the fact run
/// immediately. Waiters use [`CancelSignal::cancelled`] to park until
/// the signal fires.
#[derive(Clone)]
pub struct CancelSignal {
    token: CancellationToken,
    listeners: Arc<Mutex<Vec<AbortListener>>>,
}

impl Default for CancelSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelSignal {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            listeners: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn is_aborted(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Abort the task. Listeners are drained under the lock, so each
    /// runs exactly once even when two abort sources race.
    pub fn abort(&self) {
        let drained = {
            let mut listeners = self.listeners.lock().unwrap();
            if self.token.is_cancelled() {
                return;
            }
            self.token.cancel();
            std::mem::take(&mut *listeners)
        };
        for listener in drained {
            listener();
        }
    }

    /// Register a listener invoked on abort. If the signal already
    /// fired the listener runs immediately on the caller's thread.
    pub fn on_abort<F: FnOnce() + Send + 'static>(&self, listener: F) {
        {
            let mut listeners = self.listeners.lock().unwrap();
            if !self.token.is_cancelled() {
                listeners.push(Box::new(listener));
                return;
            }
        }
        listener();
    }

    /// Resolve once the signal is aborted.
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    /// Underlying token, for `tokio::select!` arms that want a future
    /// without holding the signal itself.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

impl std::fmt::Debug for CancelSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelSignal")
            .field("aborted", &self.is_aborted())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_listeners_fire_exactly_once() {
        let signal = CancelSignal::new();
        let fired = Arc::new(AtomicU32::new(0));

        let fired_ = fired.clone();
        signal.on_abort(move || {
            fired_.fetch_add(1, Ordering::SeqCst);
        });

        signal.abort();
        signal.abort();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(signal.is_aborted());
    }

    #[test]
    fn test_late_listener_fires_immediately() {
        let signal = CancelSignal::new();
        signal.abort();

        let fired = Arc::new(AtomicU32::new(0));
        let fired_ = fired.clone();
        signal.on_abort(move || {
            fired_.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancelled_future_wakes() {
        let signal = CancelSignal::new();
        let signal_ = signal.clone();
        let waiter = tokio::spawn(async move {
            signal_.cancelled().await;
        });
        signal.abort();
        waiter.await.unwrap();
    }
}
