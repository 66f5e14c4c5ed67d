//! Pending-job storage for the queue manager
//!
//! The queue manager only talks to the `JobStore` trait. The in-memory
//! implementation keeps two structures, mirroring a sorted-set + list
//! backend:
//!
//! - **delayed**: min-heap ordered by due time
//! - **ready**: max-heap ordered by priority, then due time, then insertion
//!
//! `promote_due` moves every delayed job whose due time has passed into the
//! ready heap, so jobs with coinciding delays are dequeued by priority.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;

use super::{Backoff, JobId};

/// A job as held by the queue while waiting or retrying.
#[derive(Debug, Clone)]
pub struct QueuedJob<P> {
    pub id: JobId,
    pub name: String,
    pub payload: P,
    pub priority: u32,
    pub due_at: Instant,
    pub enqueued_at: Instant,
    pub attempts_made: u32,
    pub max_attempts: u32,
    pub backoff: Backoff,
    /// Monotonic insertion sequence, used as the final tie-break
    pub seq: u64,
}

struct Delayed<P>(QueuedJob<P>);

impl<P> PartialEq for Delayed<P> {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl<P> Eq for Delayed<P> {}

impl<P> PartialOrd for Delayed<P> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<P> Ord for Delayed<P> {
    // Reversed: BinaryHeap is a max-heap, we want the earliest due time on top
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .0
            .due_at
            .cmp(&self.0.due_at)
            .then_with(|| self.0.priority.cmp(&other.0.priority))
            .then_with(|| other.0.seq.cmp(&self.0.seq))
    }
}

struct Ready<P>(QueuedJob<P>);

impl<P> PartialEq for Ready<P> {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl<P> Eq for Ready<P> {}

impl<P> PartialOrd for Ready<P> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<P> Ord for Ready<P> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0
            .priority
            .cmp(&other.0.priority)
            .then_with(|| other.0.due_at.cmp(&self.0.due_at))
            .then_with(|| other.0.seq.cmp(&self.0.seq))
    }
}

/// Storage backend for jobs that have not started yet.
#[async_trait]
pub trait JobStore<P>: Send + Sync
where
    P: Send + 'static,
{
    /// Store a batch of jobs. All or nothing.
    async fn push_all(&self, jobs: Vec<QueuedJob<P>>);

    /// Move delayed jobs due at or before `now` into the ready set.
    async fn promote_due(&self, now: Instant) -> usize;

    /// Take the highest-priority ready job.
    async fn pop_ready(&self) -> Option<QueuedJob<P>>;

    /// Due time of the next delayed job.
    async fn next_due(&self) -> Option<Instant>;

    /// (waiting, delayed) counts.
    async fn counts(&self) -> (usize, usize);

    /// Remove every waiting and delayed job, returning how many were removed.
    async fn drain(&self) -> usize;
}

struct Heaps<P> {
    delayed: BinaryHeap<Delayed<P>>,
    ready: BinaryHeap<Ready<P>>,
}

pub struct MemoryJobStore<P> {
    heaps: Mutex<Heaps<P>>,
}

impl<P> MemoryJobStore<P> {
    pub fn new() -> Self {
        Self {
            heaps: Mutex::new(Heaps {
                delayed: BinaryHeap::new(),
                ready: BinaryHeap::new(),
            }),
        }
    }
}

impl<P> Default for MemoryJobStore<P> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<P> JobStore<P> for MemoryJobStore<P>
where
    P: Send + 'static,
{
    async fn push_all(&self, jobs: Vec<QueuedJob<P>>) {
        let now = Instant::now();
        let mut heaps = self.heaps.lock();
        for job in jobs {
            if job.due_at <= now {
                heaps.ready.push(Ready(job));
            } else {
                heaps.delayed.push(Delayed(job));
            }
        }
    }

    async fn promote_due(&self, now: Instant) -> usize {
        let mut heaps = self.heaps.lock();
        let mut promoted = 0;
        while heaps
            .delayed
            .peek()
            .is_some_and(|Delayed(job)| job.due_at <= now)
        {
            if let Some(Delayed(job)) = heaps.delayed.pop() {
                heaps.ready.push(Ready(job));
                promoted += 1;
            }
        }
        promoted
    }

    async fn pop_ready(&self) -> Option<QueuedJob<P>> {
        self.heaps.lock().ready.pop().map(|Ready(job)| job)
    }

    async fn next_due(&self) -> Option<Instant> {
        self.heaps.lock().delayed.peek().map(|Delayed(job)| job.due_at)
    }

    async fn counts(&self) -> (usize, usize) {
        let heaps = self.heaps.lock();
        (heaps.ready.len(), heaps.delayed.len())
    }

    async fn drain(&self) -> usize {
        let mut heaps = self.heaps.lock();
        let removed = heaps.ready.len() + heaps.delayed.len();
        heaps.ready.clear();
        heaps.delayed.clear();
        removed
    }
}
