//! Deduplicating work queue of group keys.
//!
//! Semantics follow the usual controller work queue:
//! - a key waiting in the queue is held once, however often it is added
//! - a key is never handed to two workers at the same time; adding it while
//!   it is processed marks it dirty and it is queued again on [`WorkQueue::done`]
//! - failed keys are re-added after an exponential delay until forgotten

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use keepalived_api::GroupKey;
use tokio::sync::{Mutex, Notify};
use tracing::debug;

/// Backoff policy for failed keys.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    /// Delay after the first failure.
    pub base: Duration,

    /// Maximum delay.
    pub max: Duration,

    /// Jitter factor (0.0 to 1.0).
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(100),
            max: Duration::from_secs(300),
            jitter: 0.1,
        }
    }
}

impl BackoffPolicy {
    /// Delay before retrying after `attempt` previous failures.
    pub fn delay(&self, attempt: u32) -> Duration {
        let delay = self.base.as_millis() as f64 * 2.0_f64.powi(attempt.min(64) as i32);
        let delay = delay.min(self.max.as_millis() as f64);

        let jitter = delay * self.jitter * (rand::random::<f64>() * 2.0 - 1.0);
        Duration::from_millis((delay + jitter).max(0.0) as u64)
    }
}

#[derive(Default)]
struct QueueState {
    pending: VecDeque<GroupKey>,
    dirty: HashSet<GroupKey>,
    processing: HashSet<GroupKey>,
    failures: HashMap<GroupKey, u32>,
    shutting_down: bool,
}

struct Inner {
    state: Mutex<QueueState>,
    notify: Notify,
    backoff: BackoffPolicy,
}

/// Cloneable handle to a shared queue.
#[derive(Clone)]
pub struct WorkQueue {
    inner: Arc<Inner>,
}

impl Default for WorkQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkQueue {
    pub fn new() -> Self {
        Self::with_backoff(BackoffPolicy::default())
    }

    pub fn with_backoff(backoff: BackoffPolicy) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(QueueState::default()),
                notify: Notify::new(),
                backoff,
            }),
        }
    }

    /// Queue a key unless it is already waiting.
    pub async fn add(&self, key: GroupKey) {
        let mut state = self.inner.state.lock().await;
        if state.shutting_down || !state.dirty.insert(key.clone()) {
            return;
        }
        if state.processing.contains(&key) {
            return;
        }
        state.pending.push_back(key);
        drop(state);
        self.inner.notify.notify_one();
    }

    /// Wait for the next key. `None` once the queue is shut down.
    pub async fn next(&self) -> Option<GroupKey> {
        loop {
            let notified = self.inner.notify.notified();
            {
                let mut state = self.inner.state.lock().await;
                if state.shutting_down {
                    return None;
                }
                if let Some(key) = state.pending.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    return Some(key);
                }
            }
            notified.await;
        }
    }

    /// Mark a key returned by [`WorkQueue::next`] as finished.
    pub async fn done(&self, key: &GroupKey) {
        let mut state = self.inner.state.lock().await;
        state.processing.remove(key);
        if state.dirty.contains(key) && !state.shutting_down {
            state.pending.push_back(key.clone());
            drop(state);
            self.inner.notify.notify_one();
        }
    }

    /// Re-add a key after a delay that grows with each consecutive failure.
    pub async fn add_rate_limited(&self, key: GroupKey) {
        let delay = {
            let mut state = self.inner.state.lock().await;
            let failures = state.failures.entry(key.clone()).or_insert(0);
            let delay = self.inner.backoff.delay(*failures);
            *failures += 1;
            delay
        };

        debug!(group = %key, delay_ms = delay.as_millis() as u64, "Requeueing with backoff");
        let queue = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(key).await;
        });
    }

    /// Reset the failure count of a key.
    pub async fn forget(&self, key: &GroupKey) {
        self.inner.state.lock().await.failures.remove(key);
    }

    /// Consecutive failures recorded for a key.
    pub async fn failures(&self, key: &GroupKey) -> u32 {
        self.inner
            .state
            .lock()
            .await
            .failures
            .get(key)
            .copied()
            .unwrap_or(0)
    }

    /// Keys waiting to be processed.
    pub async fn len(&self) -> usize {
        self.inner.state.lock().await.pending.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Stop handing out keys and wake every waiting worker.
    pub async fn shutdown(&self) {
        self.inner.state.lock().await.shutting_down = true;
        self.inner.notify.notify_waiters();
    }
}
