//! Per-recipient FIFO queues.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use tokio::time::Instant;

use crate::common::types::{ForwardTask, TaskId, TaskStatus};

/// Queue position: receipt time first, id as tie-break.
pub type QueueKey = (DateTime<Utc>, TaskId);

/// A task waiting in a recipient queue.
#[derive(Debug, Clone)]
pub struct QueuedTask {
    pub task: ForwardTask,
    /// Earliest instant the next attempt may start.
    pub not_before: Instant,
}

impl QueuedTask {
    pub fn key(&self) -> QueueKey {
        (self.task.created_at, self.task.id)
    }
}

/// Ordered tasks for one recipient.
///
/// Only the head is ever attempted, so a head waiting on backoff holds back
/// everything behind it. While an attempt is running no other task starts,
/// even one that sorts ahead of it.
#[derive(Debug, Default)]
pub struct RecipientQueue {
    tasks: BTreeMap<QueueKey, QueuedTask>,
    active: Option<QueueKey>,
}

impl RecipientQueue {
    pub fn push(&mut self, queued: QueuedTask) {
        self.tasks.insert(queued.key(), queued);
    }

    pub fn head(&self) -> Option<&QueuedTask> {
        self.tasks.values().next()
    }

    pub fn head_mut(&mut self) -> Option<&mut QueuedTask> {
        self.tasks.values_mut().next()
    }

    pub fn get_mut(&mut self, key: &QueueKey) -> Option<&mut QueuedTask> {
        self.tasks.get_mut(key)
    }

    pub fn remove(&mut self, key: &QueueKey) -> Option<QueuedTask> {
        self.end_attempt(key);
        self.tasks.remove(key)
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Whether an attempt for this recipient is running.
    pub fn is_busy(&self) -> bool {
        self.active.is_some()
    }

    pub fn begin_attempt(&mut self, key: QueueKey) {
        self.active = Some(key);
    }

    pub fn end_attempt(&mut self, key: &QueueKey) {
        if self.active.as_ref() == Some(key) {
            self.active = None;
        }
    }

    /// Head task if nothing is in flight and it may be attempted at `now`.
    pub fn ready_head(&mut self, now: Instant) -> Option<&mut QueuedTask> {
        if self.is_busy() {
            return None;
        }
        self.head_mut()
            .filter(|q| q.task.status == TaskStatus::Pending && q.not_before <= now)
    }

    pub fn iter(&self) -> impl Iterator<Item = &QueuedTask> {
        self.tasks.values()
    }
}

/// All recipient queues owned by the engine.
#[derive(Debug, Default)]
pub struct DeliveryQueue {
    recipients: HashMap<String, RecipientQueue>,
}

impl DeliveryQueue {
    pub fn push(&mut self, queued: QueuedTask) {
        self.recipients
            .entry(queued.task.recipient.clone())
            .or_default()
            .push(queued);
    }

    pub fn recipient_mut(&mut self, recipient: &str) -> Option<&mut RecipientQueue> {
        self.recipients.get_mut(recipient)
    }

    /// Remove a task, dropping the recipient entry once it is empty.
    pub fn remove(&mut self, recipient: &str, key: &QueueKey) -> Option<QueuedTask> {
        let queue = self.recipients.get_mut(recipient)?;
        let removed = queue.remove(key);
        if queue.is_empty() {
            self.recipients.remove(recipient);
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.recipients.values().map(RecipientQueue::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.recipients.is_empty()
    }

    pub fn recipients_mut(&mut self) -> impl Iterator<Item = &mut RecipientQueue> {
        self.recipients.values_mut()
    }

    pub fn tasks(&self) -> impl Iterator<Item = &QueuedTask> {
        self.recipients.values().flat_map(RecipientQueue::iter)
    }

    /// Earliest `not_before` among idle recipients' waiting heads.
    pub fn next_due(&self) -> Option<Instant> {
        self.recipients
            .values()
            .filter(|q| !q.is_busy())
            .filter_map(RecipientQueue::head)
            .filter(|q| q.task.status == TaskStatus::Pending)
            .map(|q| q.not_before)
            .min()
    }
}
