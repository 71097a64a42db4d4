//! Fixed-capacity chunk queue decoupling producer and consumer rates.
//!
//! Capacity is measured in resident payload bytes and is never exceeded.
//! The overflow policy is fixed at construction: `Backpressure` suspends
//! the producer until the consumer drains (sequences stay gap-free),
//! `DropOldest` evicts the oldest chunk and reports the gap so it is
//! never skipped silently.

use std::collections::VecDeque;
use std::sync::Mutex;

use tokio::sync::Notify;
use tracing::{debug, warn};

use super::chunk::AudioChunk;
use crate::error::{Error, Result};

/// What `push` does when the ring is full. Chosen once, never mixed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Producer waits for space. Correctness-preferred default.
    Backpressure,
    /// Oldest chunk is evicted and the drop is reported.
    DropOldest,
}

/// Result of a completed push.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushOutcome {
    Stored,
    /// Chunks were evicted to make room; their sequences identify the gap.
    DroppedOldest { evicted_sequences: Vec<u64> },
}

/// Counters accumulated over the ring's lifetime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RingStats {
    pub chunks_pushed: u64,
    pub chunks_popped: u64,
    pub chunks_dropped: u64,
    pub peak_resident_bytes: usize,
}

struct RingInner {
    queue: VecDeque<AudioChunk>,
    resident_bytes: usize,
    stats: RingStats,
    closed: bool,
}

/// Single-producer / single-consumer chunk ring.
pub struct RingBuffer {
    capacity_bytes: usize,
    policy: OverflowPolicy,
    inner: Mutex<RingInner>,
    space_available: Notify,
    data_available: Notify,
}

impl RingBuffer {
    pub fn new(capacity_bytes: usize, policy: OverflowPolicy) -> Self {
        Self {
            capacity_bytes,
            policy,
            inner: Mutex::new(RingInner {
                queue: VecDeque::new(),
                resident_bytes: 0,
                stats: RingStats::default(),
                closed: false,
            }),
            space_available: Notify::new(),
            data_available: Notify::new(),
        }
    }

    pub fn capacity_bytes(&self) -> usize {
        self.capacity_bytes
    }

    pub fn policy(&self) -> OverflowPolicy {
        self.policy
    }

    /// Enqueue a chunk according to the overflow policy.
    ///
    /// Under `Backpressure` this suspends until the chunk fits; under
    /// `DropOldest` it completes immediately, evicting as needed.
    pub async fn push(&self, chunk: AudioChunk) -> Result<PushOutcome> {
        if chunk.size_bytes() > self.capacity_bytes {
            return Err(Error::Buffer(format!(
                "chunk of {} bytes exceeds ring capacity of {} bytes",
                chunk.size_bytes(),
                self.capacity_bytes
            )));
        }

        match self.policy {
            OverflowPolicy::Backpressure => loop {
                let notified = self.space_available.notified();
                {
                    let mut inner = self.inner.lock().expect("ring lock poisoned");
                    if inner.closed {
                        return Err(Error::Buffer("ring buffer closed".into()));
                    }
                    if inner.resident_bytes + chunk.size_bytes() <= self.capacity_bytes {
                        self.enqueue(&mut inner, chunk);
                        self.data_available.notify_one();
                        return Ok(PushOutcome::Stored);
                    }
                }
                notified.await;
            },
            OverflowPolicy::DropOldest => self.try_push(chunk),
        }
    }

    /// Enqueue without waiting. A full ring under `Backpressure` is an
    /// error here instead of a suspension; `DropOldest` evicts as usual.
    pub fn try_push(&self, chunk: AudioChunk) -> Result<PushOutcome> {
        if chunk.size_bytes() > self.capacity_bytes {
            return Err(Error::Buffer(format!(
                "chunk of {} bytes exceeds ring capacity of {} bytes",
                chunk.size_bytes(),
                self.capacity_bytes
            )));
        }
        let mut inner = self.inner.lock().expect("ring lock poisoned");
        if inner.closed {
            return Err(Error::Buffer("ring buffer closed".into()));
        }
        if inner.resident_bytes + chunk.size_bytes() <= self.capacity_bytes {
            self.enqueue(&mut inner, chunk);
            self.data_available.notify_one();
            return Ok(PushOutcome::Stored);
        }
        match self.policy {
            OverflowPolicy::Backpressure => Err(Error::Buffer("ring buffer full".into())),
            OverflowPolicy::DropOldest => {
                let mut evicted = Vec::new();
                while inner.resident_bytes + chunk.size_bytes() > self.capacity_bytes {
                    match inner.queue.pop_front() {
                        Some(old) => {
                            inner.resident_bytes -= old.size_bytes();
                            inner.stats.chunks_dropped += 1;
                            evicted.push(old.sequence);
                        }
                        None => break,
                    }
                }
                self.enqueue(&mut inner, chunk);
                self.data_available.notify_one();
                warn!(dropped = evicted.len(), "ring full, evicted oldest chunks");
                Ok(PushOutcome::DroppedOldest {
                    evicted_sequences: evicted,
                })
            }
        }
    }

    fn enqueue(&self, inner: &mut RingInner, chunk: AudioChunk) {
        inner.resident_bytes += chunk.size_bytes();
        inner.stats.chunks_pushed += 1;
        inner.stats.peak_resident_bytes = inner.stats.peak_resident_bytes.max(inner.resident_bytes);
        debug_assert!(inner.resident_bytes <= self.capacity_bytes);
        inner.queue.push_back(chunk);
    }

    /// Dequeue without waiting.
    pub fn try_pop(&self) -> Option<AudioChunk> {
        let mut inner = self.inner.lock().expect("ring lock poisoned");
        let chunk = inner.queue.pop_front()?;
        inner.resident_bytes -= chunk.size_bytes();
        inner.stats.chunks_popped += 1;
        self.space_available.notify_one();
        Some(chunk)
    }

    /// Dequeue, suspending while the ring is empty. Returns `None` once
    /// the ring is closed and drained.
    pub async fn pop(&self) -> Option<AudioChunk> {
        loop {
            let notified = self.data_available.notified();
            if let Some(chunk) = self.try_pop() {
                return Some(chunk);
            }
            {
                let inner = self.inner.lock().expect("ring lock poisoned");
                if inner.closed && inner.queue.is_empty() {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Close the ring: pending and future pushes fail, pops drain what
    /// remains and then return `None`.
    pub fn close(&self) {
        let mut inner = self.inner.lock().expect("ring lock poisoned");
        if !inner.closed {
            inner.closed = true;
            debug!(remaining = inner.queue.len(), "ring buffer closed");
        }
        drop(inner);
        self.space_available.notify_waiters();
        self.data_available.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().expect("ring lock poisoned").closed
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("ring lock poisoned").queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn resident_bytes(&self) -> usize {
        self.inner.lock().expect("ring lock poisoned").resident_bytes
    }

    /// Fill level in [0, 1].
    pub fn utilization(&self) -> f64 {
        if self.capacity_bytes == 0 {
            return 0.0;
        }
        self.resident_bytes() as f64 / self.capacity_bytes as f64
    }

    pub fn stats(&self) -> RingStats {
        self.inner.lock().expect("ring lock poisoned").stats
    }
}
