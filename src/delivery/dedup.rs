//! Bounded window of recently seen task ids.

use std::collections::{HashSet, VecDeque};
use std::time::Duration;

use tokio::time::Instant;

use crate::common::types::TaskId;

/// Remembers the most recent task ids so redelivered source events are not
/// forwarded twice.
///
/// Bounded by `capacity` (oldest ids are forgotten first) and, optionally,
/// by age.
#[derive(Debug)]
pub struct DedupWindow {
    capacity: usize,
    ttl: Option<Duration>,
    seen: HashSet<TaskId>,
    order: VecDeque<(TaskId, Instant)>,
}

impl DedupWindow {
    pub fn new(capacity: usize, ttl: Option<Duration>) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            ttl,
            seen: HashSet::with_capacity(capacity),
            order: VecDeque::with_capacity(capacity),
        }
    }

    /// Record `id` as seen at `now`.
    ///
    /// Returns `false` if the id was already inside the window.
    pub fn observe(&mut self, id: TaskId, now: Instant) -> bool {
        self.expire(now);
        if self.seen.contains(&id) {
            return false;
        }

        if self.order.len() >= self.capacity {
            if let Some((oldest, _)) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        self.seen.insert(id);
        self.order.push_back((id, now));
        true
    }

    /// Ids inside the window, oldest first.
    pub fn ids(&self) -> impl Iterator<Item = TaskId> + '_ {
        self.order.iter().map(|(id, _)| *id)
    }

    fn expire(&mut self, now: Instant) {
        let Some(ttl) = self.ttl else {
            return;
        };
        while let Some((id, seen_at)) = self.order.front() {
            if now.duration_since(*seen_at) < ttl {
                break;
            }
            self.seen.remove(id);
            self.order.pop_front();
        }
    }
}
