//! Pending queue
//!
//! Queued jobs are ordered by effective priority, then by admission order.
//! Effective priority is the submitted priority plus one point for every
//! `aging_interval` the job has waited, so low-priority work cannot be
//! starved by a steady stream of higher-priority submissions. The dispatcher
//! never looks past the head: a large job at the head holds back smaller
//! ones until capacity frees up, which keeps large jobs from starving.

use std::time::{Duration, Instant};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct QueuedEntry {
    pub job_id: Uuid,
    pub priority: i32,
    pub slots: u32,
    pub enqueued_at: Instant,
    seq: u64,
}

#[derive(Debug)]
pub struct PendingQueue {
    entries: Vec<QueuedEntry>,
    next_seq: u64,
    aging_interval: Duration,
}

impl QueuedEntry {
    fn effective_priority(&self, now: Instant, aging_interval: Duration) -> i64 {
        let bonus = if aging_interval.is_zero() {
            0
        } else {
            let age = now.saturating_duration_since(self.enqueued_at);
            (age.as_nanos() / aging_interval.as_nanos()) as i64
        };
        self.priority as i64 + bonus
    }
}

impl PendingQueue {
    pub fn new(aging_interval: Duration) -> Self {
        Self {
            entries: Vec::new(),
            next_seq: 0,
            aging_interval,
        }
    }

    pub fn push(&mut self, job_id: Uuid, priority: i32, slots: u32) {
        self.push_at(job_id, priority, slots, Instant::now());
    }

    pub fn push_at(&mut self, job_id: Uuid, priority: i32, slots: u32, enqueued_at: Instant) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.entries.push(QueuedEntry {
            job_id,
            priority,
            slots,
            enqueued_at,
            seq,
        });
    }

    /// The entry the dispatcher must try next
    pub fn head(&self, now: Instant) -> Option<&QueuedEntry> {
        self.entries.iter().min_by(|a, b| {
            let pa = a.effective_priority(now, self.aging_interval);
            let pb = b.effective_priority(now, self.aging_interval);
            pb.cmp(&pa).then(a.seq.cmp(&b.seq))
        })
    }

    pub fn remove(&mut self, job_id: Uuid) -> Option<QueuedEntry> {
        let index = self.entries.iter().position(|e| e.job_id == job_id)?;
        Some(self.entries.remove(index))
    }

    pub fn contains(&self, job_id: Uuid) -> bool {
        self.entries.iter().any(|e| e.job_id == job_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fifo_for_equal_priority() {
        let mut queue = PendingQueue::new(Duration::from_secs(60));
        let now = Instant::now();
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();

        queue.push_at(first, 0, 1, now);
        queue.push_at(second, 0, 1, now);

        assert_eq!(queue.head(now).unwrap().job_id, first);
        queue.remove(first);
        assert_eq!(queue.head(now).unwrap().job_id, second);
    }

    #[test]
    fn test_priority_breaks_ties() {
        let mut queue = PendingQueue::new(Duration::from_secs(60));
        let now = Instant::now();
        let low = Uuid::new_v4();
        let high = Uuid::new_v4();

        queue.push_at(low, 0, 1, now);
        queue.push_at(high, 5, 1, now);

        assert_eq!(queue.head(now).unwrap().job_id, high);
    }

    #[test]
    fn test_aging_lifts_old_low_priority_job() {
        let mut queue = PendingQueue::new(Duration::from_secs(10));
        let start = Instant::now();
        let old_low = Uuid::new_v4();
        let fresh_high = Uuid::new_v4();

        queue.push_at(old_low, 0, 4, start);
        let later = start + Duration::from_secs(35);
        queue.push_at(fresh_high, 2, 1, later);

        // 35s of waiting is worth 3 points, beating priority 2
        assert_eq!(queue.head(later).unwrap().job_id, old_low);
    }

    #[test]
    fn test_zero_aging_interval_disables_aging() {
        let mut queue = PendingQueue::new(Duration::ZERO);
        let start = Instant::now();
        let old_low = Uuid::new_v4();
        let high = Uuid::new_v4();

        queue.push_at(old_low, 0, 1, start);
        queue.push_at(high, 1, 1, start);

        assert_eq!(queue.head(start + Duration::from_secs(3600)).unwrap().job_id, high);
    }

    #[test]
    fn test_remove_and_contains() {
        let mut queue = PendingQueue::new(Duration::from_secs(1));
        let id = Uuid::new_v4();
        queue.push(id, 0, 2);

        assert!(queue.contains(id));
        assert_eq!(queue.remove(id).unwrap().slots, 2);
        assert!(!queue.contains(id));
        assert!(queue.remove(id).is_none());
        assert!(queue.is_empty());
    }
}
