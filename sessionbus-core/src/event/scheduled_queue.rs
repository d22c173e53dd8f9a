//! Min-heap of scheduled events ordered by delivery time.
//!
//! Ties are broken by insertion order, so two events scheduled for the same
//! instant are released in the order they were offered.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use tracing::trace;

use super::message::Event;
use super::message_bus::{BusError, BusResult};

struct Entry {
    due: DateTime<Utc>,
    seq: u64,
    event: Arc<dyn Event>,
}

// Reversed so that `BinaryHeap` (a max-heap) pops the earliest entry first.
impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .due
            .cmp(&self.due)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl Eq for Entry {}

#[derive(Default)]
pub struct ScheduledDeliveryQueue {
    heap: Mutex<BinaryHeap<Entry>>,
    next_seq: AtomicU64,
}

impl ScheduledDeliveryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn heap(&self) -> MutexGuard<'_, BinaryHeap<Entry>> {
        self.heap.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Adds a scheduled event. Its delivery time is read once, here.
    pub fn offer(&self, event: Arc<dyn Event>) -> BusResult<DateTime<Utc>> {
        let due = event
            .as_scheduled()
            .map(|scheduled| scheduled.delivery_time())
            .ok_or(BusError::NotScheduled { event: event.name() })?;
        let seq = self.next_seq.fetch_add(1, AtomicOrdering::SeqCst);
        trace!("Scheduling {} ({}) for {}", event.name(), event.meta().id, due);
        self.heap().push(Entry { due, seq, event });
        Ok(due)
    }

    /// Removes and returns every event due at or before `now`, earliest first.
    pub fn drain_due(&self, now: DateTime<Utc>) -> Vec<Arc<dyn Event>> {
        let mut heap = self.heap();
        let mut due = Vec::new();
        while heap.peek().is_some_and(|entry| entry.due <= now) {
            if let Some(entry) = heap.pop() {
                due.push(entry.event);
            }
        }
        due
    }

    /// Every queued event, earliest first, without removing anything.
    pub fn peek_pending(&self) -> Vec<Arc<dyn Event>> {
        let heap = self.heap();
        let mut entries: Vec<(DateTime<Utc>, u64, Arc<dyn Event>)> = heap
            .iter()
            .map(|entry| (entry.due, entry.seq, Arc::clone(&entry.event)))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.cmp(&b.1)));
        entries.into_iter().map(|(_, _, event)| event).collect()
    }

    pub fn next_due(&self) -> Option<DateTime<Utc>> {
        self.heap().peek().map(|entry| entry.due)
    }

    pub fn len(&self) -> usize {
        self.heap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap().is_empty()
    }

    pub fn clear(&self) {
        self.heap().clear();
    }
}
