/// Scheduler - Slot Accounting and Wait Queue Ordering
///
/// **Ordering:**
/// - Two FIFO queues, `high` and `normal`, ordered by submission sequence.
/// - High is always served first.
/// - A normal job that has waited `aging_threshold` is promoted into the
///   high queue at the position matching its submission sequence, so it
///   cannot starve behind a steady stream of high priority work.
///
/// **Slots:**
/// - `running` never exceeds `max_concurrency`.
/// - A finishing job hands its slot straight to the next selected job.
///
/// Pure data structure: no clocks, no locks, no async. Callers pass `now`.

use proctor_common::types::Priority;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

#[derive(Debug)]
struct Waiting<T> {
    item: T,
    seq: u64,
    enqueued_at: Instant,
}

/// Two-class wait queue with age-based promotion
#[derive(Debug)]
pub struct WaitQueue<T> {
    high: VecDeque<Waiting<T>>,
    normal: VecDeque<Waiting<T>>,
    aging_threshold: Duration,
    next_seq: u64,
    promoted_total: u64,
}

impl<T> WaitQueue<T> {
    pub fn new(aging_threshold: Duration) -> Self {
        Self {
            high: VecDeque::new(),
            normal: VecDeque::new(),
            aging_threshold,
            next_seq: 0,
            promoted_total: 0,
        }
    }

    pub fn push(&mut self, item: T, priority: Priority, now: Instant) {
        let waiting = Waiting {
            item,
            seq: self.next_seq,
            enqueued_at: now,
        };
        self.next_seq += 1;

        match priority {
            Priority::High => self.high.push_back(waiting),
            Priority::Normal => self.normal.push_back(waiting),
        }
    }

    /// Move every normal job that waited at least the aging threshold into
    /// the high queue. Returns how many were promoted.
    pub fn promote_aged(&mut self, now: Instant) -> usize {
        let mut promoted = 0;

        // normal is FIFO, so aged jobs form a prefix
        while let Some(front) = self.normal.front() {
            if now.saturating_duration_since(front.enqueued_at) < self.aging_threshold {
                break;
            }
            let Some(aged) = self.normal.pop_front() else {
                break;
            };
            let pos = self.high.partition_point(|w| w.seq < aged.seq);
            self.high.insert(pos, aged);
            promoted += 1;
        }

        self.promoted_total += promoted as u64;
        promoted
    }

    /// Next job to run along with how long it waited
    pub fn pop_next(&mut self, now: Instant) -> Option<(T, Duration)> {
        self.promote_aged(now);

        let waiting = self.high.pop_front().or_else(|| self.normal.pop_front())?;
        let waited = now.saturating_duration_since(waiting.enqueued_at);
        Some((waiting.item, waited))
    }

    pub fn len(&self) -> usize {
        self.high.len() + self.normal.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn high_len(&self) -> usize {
        self.high.len()
    }

    pub fn normal_len(&self) -> usize {
        self.normal.len()
    }

    pub fn promoted_total(&self) -> u64 {
        self.promoted_total
    }
}

/// Decision taken for a newly admitted job
#[derive(Debug)]
pub enum Admission<T> {
    /// A slot was free; the caller must start the job now.
    RunNow(T),
    /// Waiting for a slot; `depth` is the queue length including this job.
    Queued { depth: usize },
    /// Queue is at capacity; the job is handed back.
    Full(T),
}

/// Concurrency cap plus wait queue
#[derive(Debug)]
pub struct Scheduler<T> {
    queue: WaitQueue<T>,
    running: usize,
    max_concurrency: usize,
    max_queue_depth: usize,
}

impl<T> Scheduler<T> {
    pub fn new(max_concurrency: usize, max_queue_depth: usize, aging_threshold: Duration) -> Self {
        Self {
            queue: WaitQueue::new(aging_threshold),
            running: 0,
            max_concurrency: max_concurrency.max(1),
            max_queue_depth,
        }
    }

    pub fn admit(&mut self, item: T, priority: Priority, now: Instant) -> Admission<T> {
        if self.running < self.max_concurrency && self.queue.is_empty() {
            self.running += 1;
            return Admission::RunNow(item);
        }

        if self.queue.len() >= self.max_queue_depth {
            return Admission::Full(item);
        }

        self.queue.push(item, priority, now);
        Admission::Queued {
            depth: self.queue.len(),
        }
    }

    /// Release the slot of a finished job and, if anything is waiting,
    /// hand the slot to the next job.
    pub fn complete(&mut self, now: Instant) -> Option<(T, Duration)> {
        debug_assert!(self.running > 0, "complete() without a running job");
        self.running = self.running.saturating_sub(1);

        if self.running >= self.max_concurrency {
            return None;
        }

        let next = self.queue.pop_next(now)?;
        self.running += 1;
        Some(next)
    }

    pub fn promote_aged(&mut self, now: Instant) -> usize {
        self.queue.promote_aged(now)
    }

    pub fn running(&self) -> usize {
        self.running
    }

    pub fn queue_depth(&self) -> usize {
        self.queue.len()
    }

    pub fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }

    pub fn wait_queue(&self) -> &WaitQueue<T> {
        &self.queue
    }
}
