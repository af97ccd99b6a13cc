use chrono::{DateTime, Utc};
use drover_lib::{OnChainTask, TaskAddress};
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Where a discovery came from.
#[derive(PartialEq, Debug, Clone, Copy, Deserialize, Serialize, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DiscoveryOrigin {
    Poll,
    Event,
    Manual,
}

/// One claimable task surfaced by the feed.
#[derive(Debug, Clone)]
pub struct Discovered {
    pub task_address: TaskAddress,
    pub task: OnChainTask,
    pub discovered_at: DateTime<Utc>,
    pub origin: DiscoveryOrigin,
}

pub type SubscriptionId = u64;

type Listener = Arc<dyn Fn(&Discovered) + Send + Sync>;

#[derive(Default)]
struct FeedInner {
    listeners: Vec<(SubscriptionId, Listener)>,
    next_id: SubscriptionId,
    seen: HashSet<TaskAddress>,
    buffered: VecDeque<Discovered>,
    running: bool,
    paused: bool,
    discovered: u64,
}

/// Discovery source feeding the pipeline. Producers push via
/// [`DiscoveryFeed::publish`] (or the polling adapter); consumers
/// subscribe with a callback.
///
/// Each task address is delivered at most once per lifetime (until
/// `clear_seen`). While paused, deliveries buffer without loss and
/// drain on resume.
#[derive(Default)]
pub struct DiscoveryFeed {
    inner: Mutex<FeedInner>,
}

impl DiscoveryFeed {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F: Fn(&Discovered) + Send + Sync + 'static>(
        &self,
        listener: F,
    ) -> SubscriptionId {
        let mut inner = self.inner.lock().unwrap();
        let id = inner.next_id;
        inner.next_id += 1;
        inner.listeners.push((id, Arc::new(listener)));
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let before = inner.listeners.len();
        inner.listeners.retain(|(lid, _)| *lid != id);
        inner.listeners.len() != before
    }

    pub fn start(&self) {
        self.inner.lock().unwrap().running = true;
    }

    pub fn stop(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.running = false;
        inner.paused = false;
        inner.buffered.clear();
    }

    pub fn is_running(&self) -> bool {
        self.inner.lock().unwrap().running
    }

    /// Stop invoking listeners until [`DiscoveryFeed::resume`]; events
    /// published meanwhile are buffered, not lost.
    pub fn pause(&self) {
        self.inner.lock().unwrap().paused = true;
    }

    pub fn resume(&self) {
        self.inner.lock().unwrap().paused = false;
        // drain one event per lock round: a listener may pause again
        loop {
            let (event, listeners) = {
                let mut inner = self.inner.lock().unwrap();
                if inner.paused || !inner.running {
                    return;
                }
                match inner.buffered.pop_front() {
                    Some(event) => (event, inner.listeners.clone()),
                    None => return,
                }
            };
            for (_, listener) in &listeners {
                listener(&event);
            }
        }
    }

    pub fn is_paused(&self) -> bool {
        self.inner.lock().unwrap().paused
    }

    pub fn discovered_count(&self) -> u64 {
        self.inner.lock().unwrap().discovered
    }

    pub fn clear_seen(&self) {
        self.inner.lock().unwrap().seen.clear();
    }

    /// Push one task into the feed. Returns false when the feed is
    /// stopped or the address was already seen.
    pub fn publish(
        &self,
        task_address: TaskAddress,
        task: OnChainTask,
        origin: DiscoveryOrigin,
    ) -> bool {
        let (event, listeners) = {
            let mut inner = self.inner.lock().unwrap();
            if !inner.running {
                return false;
            }
            if !inner.seen.insert(task_address) {
                tracing::trace!("DiscoveryFeed.publish: duplicate {task_address}, suppressed");
                return false;
            }
            inner.discovered += 1;
            let event = Discovered {
                task_address,
                task,
                discovered_at: Utc::now(),
                origin,
            };
            if inner.paused {
                inner.buffered.push_back(event);
                return true;
            }
            (event, inner.listeners.clone())
        };
        for (_, listener) in &listeners {
            listener(&event);
        }
        true
    }

    /// Periodic polling adapter: publishes whatever the fetch closure
    /// yields, as `Poll`-origin events, until cancelled.
    pub fn spawn_poll_loop<F, Fut>(
        self: &Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
        fetch: F,
    ) -> tokio::task::JoinHandle<()>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Vec<(TaskAddress, OnChainTask)>> + Send,
    {
        let feed = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
                for (task_address, task) in fetch().await {
                    feed.publish(task_address, task, DiscoveryOrigin::Poll);
                }
            }
        })
    }
}

impl std::fmt::Debug for DiscoveryFeed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock().unwrap();
        f.debug_struct("DiscoveryFeed")
            .field("running", &inner.running)
            .field("paused", &inner.paused)
            .field("discovered", &inner.discovered)
            .field("buffered", &inner.buffered.len())
            .finish()
    }
}
