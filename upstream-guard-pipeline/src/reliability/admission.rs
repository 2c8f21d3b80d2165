//! Priority admission queue ahead of the upstream.
//!
//! A request is admitted once it holds a rate-limit token for its key and a
//! process-wide concurrency permit, taken in that order. Waiters are ordered
//! by `(priority, arrival)`; lower priority values go first and equal
//! priorities are FIFO.
//!
//! Token waits are per key: only the first waiter of a key may take that
//! key's token, and a key with an empty bucket never holds up other keys.
//! Permit waits are global: only the head of the permit line may take a
//! permit, so later arrivals never overtake it.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tokio::time::{sleep_until, Instant};
use tracing::debug;
use upstream_guard_core::{PipelineError, QueueConfig, QueueSnapshot, TimeoutStage};

use crate::rate_limit::Acquire;

type WaiterId = (u8, u64);

/// Concurrency slot held for the duration of one upstream dispatch.
/// Releasing it wakes queued requests.
#[derive(Debug)]
pub struct AdmissionPermit {
    permit: Option<OwnedSemaphorePermit>,
    notify: Arc<Notify>,
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        self.permit.take();
        self.notify.notify_waiters();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Token,
    Permit,
}

#[derive(Debug, Default)]
struct Waiters {
    /// Waiting for a token, per key.
    tokens: HashMap<String, BTreeSet<WaiterId>>,
    /// Holding a token, waiting for a permit.
    permits: BTreeSet<WaiterId>,
    len: usize,
}

impl Waiters {
    fn key_is_idle(&self, key: &str) -> bool {
        self.tokens.get(key).map_or(true, BTreeSet::is_empty)
    }

    fn is_key_head(&self, key: &str, id: &WaiterId) -> bool {
        self.tokens.get(key).and_then(|line| line.first()) == Some(id)
    }

    fn insert(&mut self, key: &str, id: WaiterId, stage: Stage) {
        match stage {
            Stage::Token => {
                self.tokens.entry(key.to_string()).or_default().insert(id);
            }
            Stage::Permit => {
                self.permits.insert(id);
            }
        }
        self.len += 1;
    }

    fn remove(&mut self, key: &str, id: &WaiterId, stage: Stage) -> bool {
        let removed = match stage {
            Stage::Token => match self.tokens.get_mut(key) {
                Some(line) => {
                    let removed = line.remove(id);
                    if line.is_empty() {
                        self.tokens.remove(key);
                    }
                    removed
                }
                None => false,
            },
            Stage::Permit => self.permits.remove(id),
        };
        if removed {
            self.len -= 1;
        }
        removed
    }
}

/// Queue position; leaving the queue for any reason (admission, timeout,
/// caller cancellation) removes it.
struct Ticket<'a> {
    queue: &'a AdmissionQueue,
    key: &'a str,
    id: WaiterId,
    stage: Stage,
}

impl Drop for Ticket<'_> {
    fn drop(&mut self) {
        self.queue.waiters().remove(self.key, &self.id, self.stage);
        self.queue.notify.notify_waiters();
    }
}

pub struct AdmissionQueue {
    config: QueueConfig,
    semaphore: Arc<Semaphore>,
    waiters: Mutex<Waiters>,
    next_seq: AtomicU64,
    notify: Arc<Notify>,
}

impl AdmissionQueue {
    pub fn new(config: QueueConfig) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.max_concurrent));
        Self {
            config,
            semaphore,
            waiters: Mutex::new(Waiters::default()),
            next_seq: AtomicU64::new(0),
            notify: Arc::new(Notify::new()),
        }
    }

    fn waiters(&self) -> MutexGuard<'_, Waiters> {
        self.waiters.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn try_permit(&self) -> Option<AdmissionPermit> {
        let permit = self.semaphore.clone().try_acquire_owned().ok()?;
        Some(AdmissionPermit {
            permit: Some(permit),
            notify: self.notify.clone(),
        })
    }

    /// Wait for admission at `priority`, taking `key`'s tokens through
    /// `try_token`.
    ///
    /// Fails with `RateLimitExceeded` when the queue is full or the wait ends
    /// blocked on a token, and with a queue `Timeout` when it ends blocked on
    /// concurrency. A token taken before a failed permit wait is not returned.
    pub async fn admit<T>(
        &self,
        key: &str,
        priority: u8,
        try_token: T,
    ) -> Result<AdmissionPermit, PipelineError>
    where
        T: Fn() -> Acquire,
    {
        let id = (priority, self.next_seq.fetch_add(1, Ordering::Relaxed));
        let (stage, mut retry_after_ms) = {
            let mut waiters = self.waiters();
            let mut stage = Stage::Token;
            let mut retry_after_ms = 0;
            if waiters.key_is_idle(key) {
                let token = try_token();
                if token.granted {
                    if waiters.permits.is_empty() {
                        if let Some(permit) = self.try_permit() {
                            return Ok(permit);
                        }
                    }
                    stage = Stage::Permit;
                } else {
                    retry_after_ms = token.retry_after_ms;
                }
            }

            if waiters.len >= self.config.max_queue_size {
                debug!("Admission queue full, rejecting {}", key);
                return Err(PipelineError::RateLimitExceeded {
                    key: key.to_string(),
                    retry_after_ms,
                });
            }

            waiters.insert(key, id, stage);
            (stage, retry_after_ms)
        };

        let mut ticket = Ticket {
            queue: self,
            key,
            id,
            stage,
        };
        let deadline = Instant::now() + Duration::from_millis(self.config.queue_timeout_ms);
        debug!("Queued {} at priority {} for {:?}", key, priority, stage);

        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let mut blocked_on_token = false;
            {
                let mut waiters = self.waiters();
                match ticket.stage {
                    Stage::Token if waiters.is_key_head(key, &ticket.id) => {
                        let token = try_token();
                        if token.granted {
                            waiters.remove(key, &ticket.id, Stage::Token);
                            waiters.insert(key, ticket.id, Stage::Permit);
                            ticket.stage = Stage::Permit;
                            // The key's next waiter may now take a token.
                            self.notify.notify_waiters();
                        } else {
                            blocked_on_token = true;
                            retry_after_ms = token.retry_after_ms;
                        }
                    }
                    _ => {}
                }

                if ticket.stage == Stage::Permit && waiters.permits.first() == Some(&ticket.id) {
                    if let Some(permit) = self.try_permit() {
                        drop(waiters);
                        drop(ticket);
                        return Ok(permit);
                    }
                }
            }

            let now = Instant::now();
            if now >= deadline {
                debug!("Admission wait for {} expired in {:?} stage", key, ticket.stage);
                return Err(match ticket.stage {
                    Stage::Token => PipelineError::RateLimitExceeded {
                        key: key.to_string(),
                        retry_after_ms,
                    },
                    Stage::Permit => PipelineError::Timeout {
                        stage: TimeoutStage::Queue,
                        elapsed_ms: self.config.queue_timeout_ms,
                    },
                });
            }

            let wake_at = if blocked_on_token {
                (now + Duration::from_millis(retry_after_ms)).min(deadline)
            } else {
                deadline
            };

            tokio::select! {
                _ = &mut notified => {}
                _ = sleep_until(wake_at) => {}
            }
        }
    }

    /// Requests currently waiting.
    pub fn queued(&self) -> usize {
        self.waiters().len
    }

    /// Admitted requests still holding a permit.
    pub fn in_flight(&self) -> usize {
        self.config
            .max_concurrent
            .saturating_sub(self.semaphore.available_permits())
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        QueueSnapshot {
            queued: self.queued(),
            in_flight: self.in_flight(),
            max_concurrent: self.config.max_concurrent,
        }
    }
}
