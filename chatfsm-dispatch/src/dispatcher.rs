//! Per-key exclusive message dispatcher.
//!
//! Messages are queued in arrival order. A worker claims the oldest message
//! whose key is not already claimed, so messages of one conversation are
//! handled strictly one at a time and in order, while different
//! conversations proceed in parallel. A claimed message stays queued until
//! it is committed; a rollback makes it eligible again, optionally only
//! after a delay.

use crate::config::DispatchConfig;
use crate::error::DispatchError;
use crate::stats::DispatchStats;
use chatfsm_core::{InboundMessage, Key, KeyBy};
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// When [`Dispatcher::feed`] blocks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backpressure {
    /// Wait while the queue or the running set is at capacity.
    #[default]
    Bounded,
    /// Wait until the queue is empty and a slot is free.
    Drain,
}

/// A queued message with its dispatch identity.
#[derive(Debug, Clone)]
pub struct Envelope {
    seq: u64,
    key: Key,
    message: Arc<InboundMessage>,
    not_before: Option<Instant>,
}

impl Envelope {
    /// Sequence number assigned by `feed`, unique per dispatcher.
    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn key(&self) -> &Key {
        &self.key
    }

    pub fn message(&self) -> &InboundMessage {
        &self.message
    }

    fn is_ready(&self, now: Instant) -> bool {
        self.not_before.map_or(true, |at| at <= now)
    }
}

#[derive(Debug, Default)]
struct Inner {
    queue: VecDeque<Envelope>,
    running: HashSet<Key>,
    next_seq: u64,
    closed: bool,
}

impl Inner {
    /// Claims the oldest ready message of a free key. A delayed message
    /// holds back the later messages of its key.
    fn claim(&mut self, now: Instant) -> Option<Envelope> {
        let pos = {
            let mut held: HashSet<&Key> = HashSet::new();
            self.queue.iter().position(|e| {
                if self.running.contains(&e.key) || held.contains(&e.key) {
                    return false;
                }
                if !e.is_ready(now) {
                    held.insert(&e.key);
                    return false;
                }
                true
            })?
        };

        let queued = &mut self.queue[pos];
        queued.not_before = None;
        let env = queued.clone();
        self.running.insert(env.key.clone());
        Some(env)
    }

    /// Earliest future instant a delayed message becomes ready.
    fn next_ready(&self, now: Instant) -> Option<Instant> {
        self.queue
            .iter()
            .filter_map(|e| e.not_before)
            .filter(|at| *at > now)
            .min()
    }

    /// A message is claimed when it is the first queued one of a running key.
    fn is_claimed(&self, pos: usize) -> bool {
        let key = &self.queue[pos].key;
        self.running.contains(key) && !self.queue.iter().take(pos).any(|e| &e.key == key)
    }
}

/// Shared queue with a running set, guarded by one monitor.
#[derive(Debug)]
pub struct Dispatcher {
    inner: Mutex<Inner>,
    cond: Condvar,
    capacity: usize,
    key_by: KeyBy,
    backpressure: Backpressure,
    stats: Arc<DispatchStats>,
}

impl Dispatcher {
    /// Creates a dispatcher with the default key and backpressure policies.
    pub fn new(capacity: usize) -> Self {
        Self::with_options(capacity, KeyBy::default(), Backpressure::default())
    }

    /// Creates a dispatcher. A capacity of 0 is raised to 1.
    pub fn with_options(capacity: usize, key_by: KeyBy, backpressure: Backpressure) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            cond: Condvar::new(),
            capacity: capacity.max(1),
            key_by,
            backpressure,
            stats: Arc::new(DispatchStats::default()),
        }
    }

    pub fn from_config(config: &DispatchConfig) -> Self {
        Self::with_options(config.capacity, config.key_by, config.backpressure)
    }

    /// Queues a batch and blocks per the backpressure policy.
    ///
    /// Returns the sequence numbers assigned to the batch, in order. The
    /// whole batch is queued before waiting, so a batch larger than the
    /// capacity is accepted.
    pub fn feed<I>(&self, messages: I) -> Result<Vec<u64>, DispatchError>
    where
        I: IntoIterator<Item = InboundMessage>,
    {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(DispatchError::Closed);
        }

        let mut seqs = Vec::new();
        for message in messages {
            let seq = inner.next_seq;
            inner.next_seq += 1;
            let key = self.key_by.key(&message);
            tracing::trace!("Queued message {} for key {}", seq, key);
            inner.queue.push_back(Envelope {
                seq,
                key,
                message: Arc::new(message),
                not_before: None,
            });
            seqs.push(seq);
        }
        DispatchStats::incr(&self.stats.fed, seqs.len() as u64);
        self.cond.notify_all();

        while !inner.closed && self.must_wait(&inner) {
            self.cond.wait(&mut inner);
        }
        Ok(seqs)
    }

    /// Queues a single message.
    pub fn feed_one(&self, message: InboundMessage) -> Result<u64, DispatchError> {
        let seqs = self.feed(std::iter::once(message))?;
        Ok(seqs[0])
    }

    fn must_wait(&self, inner: &Inner) -> bool {
        let running_full = inner.running.len() >= self.capacity;
        match self.backpressure {
            Backpressure::Bounded => inner.queue.len() >= self.capacity || running_full,
            Backpressure::Drain => !inner.queue.is_empty() || running_full,
        }
    }

    /// Blocks until a message is eligible and claims it.
    ///
    /// Returns `None` once the dispatcher is closed.
    pub fn begin(&self) -> Option<Envelope> {
        let mut inner = self.inner.lock();
        loop {
            if inner.closed {
                return None;
            }
            let now = Instant::now();
            if let Some(env) = inner.claim(now) {
                return Some(env);
            }
            match inner.next_ready(now) {
                Some(at) => {
                    self.cond.wait_until(&mut inner, at);
                }
                None => self.cond.wait(&mut inner),
            }
        }
    }

    /// Claims an eligible message without blocking.
    pub fn try_begin(&self) -> Option<Envelope> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return None;
        }
        inner.claim(Instant::now())
    }

    /// Like [`begin`](Self::begin), giving up after `timeout`.
    pub fn begin_timeout(&self, timeout: Duration) -> Option<Envelope> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock();
        loop {
            if inner.closed {
                return None;
            }
            let now = Instant::now();
            if let Some(env) = inner.claim(now) {
                return Some(env);
            }
            if now >= deadline {
                return None;
            }
            let wake = inner.next_ready(now).map_or(deadline, |at| at.min(deadline));
            self.cond.wait_until(&mut inner, wake);
        }
    }

    /// Removes a processed message and releases its key.
    pub fn commit(&self, env: &Envelope) -> Result<(), DispatchError> {
        let mut inner = self.inner.lock();
        let pos = match inner.queue.iter().position(|e| e.seq == env.seq) {
            Some(pos) => pos,
            None => {
                tracing::error!(
                    "Commit of message {} (key {}) which is not queued",
                    env.seq,
                    env.key
                );
                return Err(DispatchError::NotQueued { seq: env.seq });
            }
        };

        inner.queue.remove(pos);
        inner.running.remove(&env.key);
        DispatchStats::incr(&self.stats.committed, 1);
        self.cond.notify_all();
        Ok(())
    }

    /// Releases the key of a message, leaving the message queued and
    /// immediately eligible again.
    ///
    /// Only the message currently claimed for its key can be rolled back;
    /// anything else is logged and ignored.
    pub fn rollback(&self, env: &Envelope) {
        self.release(env, None);
    }

    /// Like [`rollback`](Self::rollback), but the message and the later
    /// messages of its key are not claimed again before `delay` has passed.
    /// Other keys are unaffected.
    pub fn rollback_after(&self, env: &Envelope, delay: Duration) {
        let not_before = (!delay.is_zero()).then(|| Instant::now() + delay);
        self.release(env, not_before);
    }

    fn release(&self, env: &Envelope, not_before: Option<Instant>) {
        let mut inner = self.inner.lock();
        let pos = match inner.queue.iter().position(|e| e.seq == env.seq) {
            Some(pos) if inner.is_claimed(pos) => pos,
            _ => {
                tracing::warn!(
                    "Ignoring rollback of message {} (key {}) which is not claimed",
                    env.seq,
                    env.key
                );
                return;
            }
        };

        inner.queue[pos].not_before = not_before;
        inner.running.remove(&env.key);
        DispatchStats::incr(&self.stats.rolled_back, 1);
        self.cond.notify_all();
    }

    /// Drops a queued message that is not currently claimed.
    pub fn discard(&self, seq: u64) -> Option<Envelope> {
        let mut inner = self.inner.lock();
        let pos = inner.queue.iter().position(|e| e.seq == seq)?;
        if inner.is_claimed(pos) {
            tracing::warn!("Refusing to discard claimed message {}", seq);
            return None;
        }

        let env = inner.queue.remove(pos)?;
        tracing::info!("Discarded message {} (key {})", seq, env.key);
        DispatchStats::incr(&self.stats.discarded, 1);
        self.cond.notify_all();
        Some(env)
    }

    /// Wakes every waiter. Afterwards `begin` returns `None` and `feed`
    /// fails with [`DispatchError::Closed`].
    pub fn close(&self) {
        let mut inner = self.inner.lock();
        if !inner.closed {
            inner.closed = true;
            tracing::info!(
                "Dispatcher closed ({} queued, {} running)",
                inner.queue.len(),
                inner.running.len()
            );
        }
        self.cond.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    /// Messages not yet committed, claimed ones included.
    pub fn pending_len(&self) -> usize {
        self.inner.lock().queue.len()
    }

    /// Keys currently claimed.
    pub fn running_len(&self) -> usize {
        self.inner.lock().running.len()
    }

    pub fn is_running(&self, key: &Key) -> bool {
        self.inner.lock().running.contains(key)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn key_by(&self) -> KeyBy {
        self.key_by
    }

    pub fn stats(&self) -> &Arc<DispatchStats> {
        &self.stats
    }
}
