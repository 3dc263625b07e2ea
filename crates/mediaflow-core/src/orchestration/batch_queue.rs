use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::models::{InputSource, QueueItem, UserId};

/// Per-user staging of inputs for multi-file tasks.
///
/// Additive only: no dedup, no capacity limit, and items leave solely
/// through [`clear`](Self::clear) or [`drain`](Self::drain). A drained queue
/// can be handed back whole with [`restore`](Self::restore).
#[derive(Default)]
pub struct BatchQueue {
    queues: Mutex<HashMap<UserId, Vec<QueueItem>>>,
}

impl BatchQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `item` and returns the user's new queue length.
    pub fn add(&self, user_id: UserId, item: InputSource) -> usize {
        let mut queues = self.lock();
        let queue = queues.entry(user_id).or_default();
        queue.push(QueueItem::new(item));
        queue.len()
    }

    pub fn get(&self, user_id: UserId) -> Vec<QueueItem> {
        self.lock().get(&user_id).cloned().unwrap_or_default()
    }

    pub fn count(&self, user_id: UserId) -> usize {
        self.lock().get(&user_id).map_or(0, Vec::len)
    }

    pub fn has(&self, user_id: UserId) -> bool {
        self.count(user_id) > 0
    }

    /// Removes every queued item for the user; returns how many were dropped.
    pub fn clear(&self, user_id: UserId) -> usize {
        self.lock().remove(&user_id).map_or(0, |queue| queue.len())
    }

    /// Takes the whole queue in one step.
    pub fn drain(&self, user_id: UserId) -> Vec<QueueItem> {
        self.lock().remove(&user_id).unwrap_or_default()
    }

    /// Puts drained items back ahead of anything queued since the drain.
    pub fn restore(&self, user_id: UserId, mut items: Vec<QueueItem>) -> usize {
        if items.is_empty() {
            return self.count(user_id);
        }
        let mut queues = self.lock();
        let queue = queues.entry(user_id).or_default();
        items.append(queue);
        *queue = items;
        queue.len()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<UserId, Vec<QueueItem>>> {
        self.queues.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::BatchQueue;
    use crate::models::{InputSource, UserId};

    #[test]
    fn queues_are_isolated_per_user() {
        let queue = BatchQueue::new();
        queue.add(UserId(1), InputSource::Url("a".to_string()));
        queue.add(UserId(2), InputSource::Url("b".to_string()));
        queue.add(UserId(1), InputSource::Url("c".to_string()));

        assert_eq!(queue.count(UserId(1)), 2);
        assert_eq!(queue.count(UserId(2)), 1);
        assert_eq!(queue.drain(UserId(1)).len(), 2);
        assert!(!queue.has(UserId(1)));
        assert!(queue.has(UserId(2)));
    }

    #[test]
    fn restored_items_go_ahead_of_later_additions() {
        let queue = BatchQueue::new();
        queue.add(UserId(1), InputSource::Url("a".to_string()));
        queue.add(UserId(1), InputSource::Url("b".to_string()));

        let drained = queue.drain(UserId(1));
        queue.add(UserId(1), InputSource::Url("c".to_string()));
        assert_eq!(queue.restore(UserId(1), drained), 3);

        let order: Vec<String> = queue
            .get(UserId(1))
            .into_iter()
            .map(|item| item.descriptor.display_name())
            .collect();
        assert_eq!(order, vec!["a", "b", "c"]);
    }
}
