//! Rate-limited, deduplicating work queue.
//!
//! Keys are `namespace/name` strings. A key added while it is already queued
//! coalesces; a key added while it is being processed is re-queued once the
//! in-flight sync finishes, so at most one worker reconciles a given key at a
//! time. Failed syncs are re-added after exponential backoff with jitter and
//! the per-key attempt counter is handed to the sync function on the next
//! try.

use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::Result;

/// Initial retry delay
const BASE_DELAY: Duration = Duration::from_secs(1);
/// Retry delay ceiling
const MAX_DELAY: Duration = Duration::from_secs(300);

/// A deduplicating work queue with per-key retry accounting.
pub struct TaskQueue {
    name: &'static str,
    state: Mutex<State>,
    notify: Notify,
}

#[derive(Default)]
struct State {
    queue: VecDeque<String>,
    queued: HashSet<String>,
    processing: HashSet<String>,
    redo: HashSet<String>,
    retries: HashMap<String, u32>,
    shut: bool,
}

impl TaskQueue {
    /// Create a new queue. The name shows up in logs only.
    pub fn new(name: &'static str) -> Arc<Self> {
        Arc::new(Self {
            name,
            state: Mutex::new(State::default()),
            notify: Notify::new(),
        })
    }

    /// Enqueue a key. Duplicates coalesce while the key is pending; a key
    /// currently being processed is marked for one re-run instead.
    pub fn add(&self, key: impl Into<String>) {
        let key = key.into();
        {
            let mut state = self.state.lock();
            if state.shut || state.queued.contains(&key) {
                return;
            }
            if state.processing.contains(&key) {
                state.redo.insert(key);
                return;
            }
            state.queued.insert(key.clone());
            state.queue.push_back(key);
        }
        self.notify.notify_one();
    }

    /// Enqueue a key after a delay, unless the token fires first.
    pub fn add_after(self: &Arc<Self>, key: impl Into<String>, delay: Duration, stop: CancellationToken) {
        let queue = Arc::clone(self);
        let key = key.into();
        tokio::spawn(async move {
            tokio::select! {
                _ = stop.cancelled() => {}
                _ = tokio::time::sleep(delay) => queue.add(key),
            }
        });
    }

    /// Number of times the key has failed since it last succeeded.
    pub fn num_requeues(&self, key: &str) -> u32 {
        self.state.lock().retries.get(key).copied().unwrap_or(0)
    }

    /// Number of keys waiting to be processed.
    pub fn len(&self) -> usize {
        self.state.lock().queue.len()
    }

    /// True when no keys are waiting.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drain and unblock every worker loop.
    pub fn shutdown(&self) {
        self.state.lock().shut = true;
        self.notify.notify_waiters();
    }

    /// Block draining items, calling `sync(key, num_requeues)` for each.
    ///
    /// On error (or a panicking sync, which is isolated in its own task) the
    /// key is re-added with backoff. On success the retry accounting for the
    /// key is dropped. Returns once `shutdown` is called or the stop token
    /// fires. `per_item_delay` paces this worker between items.
    pub async fn run<F, Fut>(
        self: Arc<Self>,
        per_item_delay: Duration,
        sync: F,
        stop: CancellationToken,
    ) where
        F: Fn(String, u32) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        loop {
            let Some(key) = self.pop(&stop).await else {
                debug!(queue = self.name, "worker stopping");
                return;
            };
            let attempts = self.num_requeues(&key);

            // A panic inside sync must not take the worker down with it;
            // spawning gives us a JoinError to inspect instead.
            let outcome = tokio::spawn(sync(key.clone(), attempts)).await;
            match outcome {
                Ok(Ok(())) => {
                    self.forget(&key);
                }
                Ok(Err(err)) => {
                    warn!(queue = self.name, key = %key, error = %err, "sync failed, requeueing");
                    self.schedule_retry(key.clone(), &stop);
                }
                Err(join_err) if join_err.is_panic() => {
                    error!(queue = self.name, key = %key, "sync panicked, requeueing");
                    self.schedule_retry(key.clone(), &stop);
                }
                Err(_) => {}
            }
            self.done(&key);

            if !per_item_delay.is_zero() {
                tokio::select! {
                    _ = stop.cancelled() => return,
                    _ = tokio::time::sleep(per_item_delay) => {}
                }
            }
        }
    }

    async fn pop(&self, stop: &CancellationToken) -> Option<String> {
        loop {
            let notified = self.notify.notified();
            {
                let mut state = self.state.lock();
                if state.shut {
                    return None;
                }
                if let Some(key) = state.queue.pop_front() {
                    state.queued.remove(&key);
                    state.processing.insert(key.clone());
                    if !state.queue.is_empty() {
                        // Wake the next idle worker for the remaining items.
                        self.notify.notify_one();
                    }
                    return Some(key);
                }
            }
            tokio::select! {
                _ = stop.cancelled() => return None,
                _ = notified => {}
            }
        }
    }

    fn done(&self, key: &str) {
        let requeue = {
            let mut state = self.state.lock();
            state.processing.remove(key);
            if state.redo.remove(key) && !state.shut {
                state.queued.insert(key.to_string());
                state.queue.push_back(key.to_string());
                true
            } else {
                false
            }
        };
        if requeue {
            self.notify.notify_one();
        }
    }

    fn forget(&self, key: &str) {
        self.state.lock().retries.remove(key);
    }

    fn schedule_retry(self: &Arc<Self>, key: String, stop: &CancellationToken) {
        let attempts = {
            let mut state = self.state.lock();
            let counter = state.retries.entry(key.clone()).or_insert(0);
            *counter += 1;
            *counter
        };
        self.add_after(key, backoff_delay(attempts), stop.clone());
    }
}

/// Exponential backoff capped at [`MAX_DELAY`], with 0.5x-1.5x jitter.
fn backoff_delay(attempts: u32) -> Duration {
    let exp = attempts.saturating_sub(1).min(16);
    let base = BASE_DELAY.as_secs_f64() * 2f64.powi(exp as i32);
    let capped = base.min(MAX_DELAY.as_secs_f64());
    let jitter = rand::thread_rng().gen_range(0.5..1.5);
    Duration::from_secs_f64(capped * jitter)
}
