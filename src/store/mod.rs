pub mod backup;

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};

use crate::message::{MessageEnvelope, PRIORITY_LEVELS};

pub const SYSTEM_USER: &str = "system";

#[derive(Debug, PartialEq, Eq)]
pub enum StoreError {
    NegativeTimeout { provided: i64 },
    NonPositivePollInterval { provided: i64 },
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NegativeTimeout { provided } => {
                write!(f, "timeout must be zero or positive, got {provided}ms")
            }
            Self::NonPositivePollInterval { provided } => {
                write!(f, "poll interval must be positive, got {provided}ms")
            }
        }
    }
}

impl std::error::Error for StoreError {}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AccessOperation {
    Put,
    Get,
    Expire,
}

impl AccessOperation {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Put => "put",
            Self::Get => "get",
            Self::Expire => "expire",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LastAccess {
    pub user: String,
    pub timestamp: DateTime<Utc>,
    pub operation: AccessOperation,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueueStats {
    pub name: String,
    pub threshold: usize,
    pub size: usize,
    pub depths: [usize; PRIORITY_LEVELS],
    pub last_access: Option<LastAccess>,
}

struct StoreState {
    buckets: [VecDeque<MessageEnvelope>; PRIORITY_LEVELS],
    size: usize,
    last_access: Option<LastAccess>,
}

impl StoreState {
    fn touch(&mut self, user: &str, operation: AccessOperation) {
        self.last_access = Some(LastAccess {
            user: user.to_owned(),
            timestamp: Utc::now(),
            operation,
        });
    }

    fn pop_highest(&mut self) -> Option<MessageEnvelope> {
        let message = self
            .buckets
            .iter_mut()
            .rev()
            .find_map(|bucket| bucket.pop_front())?;
        self.size -= 1;
        Some(message)
    }
}

/// A named queue holding one FIFO bucket per priority level.
///
/// Retrieval is strictly by priority: the head of the highest non-empty bucket wins, so a
/// steady stream of priority 9 traffic starves priority 0. `threshold` bounds the total
/// number of held messages across all buckets, with 0 meaning unbounded.
pub struct PriorityQueueStore {
    name: String,
    threshold: usize,
    state: Mutex<StoreState>,
    available: Condvar,
}

impl PriorityQueueStore {
    pub fn new(name: impl Into<String>, threshold: usize) -> Self {
        Self {
            name: name.into(),
            threshold,
            state: Mutex::new(StoreState {
                buckets: std::array::from_fn(|_| VecDeque::new()),
                size: 0,
                last_access: None,
            }),
            available: Condvar::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    /// Appends `message` to its priority bucket. Returns false when the threshold is reached.
    pub fn put(&self, message: MessageEnvelope, user: &str) -> bool {
        let mut state = self.lock_state();
        if self.threshold > 0 && state.size >= self.threshold {
            return false;
        }

        let index = message.priority().index();
        state.buckets[index].push_back(message);
        state.size += 1;
        state.touch(user, AccessOperation::Put);
        drop(state);

        self.available.notify_one();
        true
    }

    /// Waits up to `timeout_ms` (0 waits forever) for the highest-priority message.
    pub fn get(
        &self,
        user: &str,
        timeout_ms: i64,
        poll_interval_ms: i64,
    ) -> Result<Option<MessageEnvelope>, StoreError> {
        self.get_cancellable(user, timeout_ms, poll_interval_ms, || false)
    }

    /// Like [`get`](Self::get), but gives up as soon as `cancelled` returns true.
    /// The probe runs once per wait slice of `poll_interval_ms`.
    pub fn get_cancellable<F>(
        &self,
        user: &str,
        timeout_ms: i64,
        poll_interval_ms: i64,
        cancelled: F,
    ) -> Result<Option<MessageEnvelope>, StoreError>
    where
        F: Fn() -> bool,
    {
        if timeout_ms < 0 {
            return Err(StoreError::NegativeTimeout {
                provided: timeout_ms,
            });
        }
        if poll_interval_ms <= 0 {
            return Err(StoreError::NonPositivePollInterval {
                provided: poll_interval_ms,
            });
        }

        let deadline = (timeout_ms > 0)
            .then(|| Instant::now() + Duration::from_millis(timeout_ms as u64));
        let slice = Duration::from_millis(poll_interval_ms as u64);

        let mut state = self.lock_state();
        loop {
            if let Some(message) = state.pop_highest() {
                state.touch(user, AccessOperation::Get);
                return Ok(Some(message));
            }

            if cancelled() {
                return Ok(None);
            }

            let wait = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(None);
                    }
                    slice.min(deadline - now)
                }
                None => slice,
            };

            state = self
                .available
                .wait_timeout(state, wait)
                .expect("queue store lock poisoned")
                .0;
        }
    }

    /// Removes every expired message in one pass and returns how many were dropped.
    pub fn expire(&self) -> usize {
        self.expire_at(Utc::now().timestamp_millis())
    }

    pub fn expire_at(&self, now_ms: i64) -> usize {
        let mut state = self.lock_state();
        let mut removed = 0;
        for bucket in state.buckets.iter_mut() {
            let before = bucket.len();
            bucket.retain(|message| !message.is_expired_at(now_ms));
            removed += before - bucket.len();
        }
        state.size -= removed;
        state.touch(SYSTEM_USER, AccessOperation::Expire);
        removed
    }

    pub fn size(&self) -> usize {
        self.lock_state().size
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    pub fn depths(&self) -> [usize; PRIORITY_LEVELS] {
        let state = self.lock_state();
        std::array::from_fn(|index| state.buckets[index].len())
    }

    pub fn last_access(&self) -> Option<LastAccess> {
        self.lock_state().last_access.clone()
    }

    pub fn stats(&self) -> QueueStats {
        let state = self.lock_state();
        QueueStats {
            name: self.name.clone(),
            threshold: self.threshold,
            size: state.size,
            depths: std::array::from_fn(|index| state.buckets[index].len()),
            last_access: state.last_access.clone(),
        }
    }

    /// Empties the store, highest priority first and FIFO within a bucket.
    pub fn drain(&self) -> Vec<MessageEnvelope> {
        let mut state = self.lock_state();
        let mut drained = Vec::with_capacity(state.size);
        for bucket in state.buckets.iter_mut().rev() {
            drained.extend(bucket.drain(..));
        }
        state.size = 0;
        drained
    }

    fn lock_state(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().expect("queue store lock poisoned")
    }
}

impl fmt::Debug for PriorityQueueStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PriorityQueueStore")
            .field("name", &self.name)
            .field("threshold", &self.threshold)
            .field("size", &self.size())
            .finish()
    }
}
