//! Bounded queue of frames that could not be emitted

use std::collections::VecDeque;

use helpline_shared::events::ClientEvent;

#[derive(Debug, Clone, PartialEq)]
pub struct RetryQueueItem {
    pub event: ClientEvent,
    /// Failed re-sends so far
    pub attempts: u32,
}

impl RetryQueueItem {
    pub fn name(&self) -> &'static str {
        self.event.name()
    }
}

#[derive(Debug)]
pub struct RetryQueue {
    items: VecDeque<RetryQueueItem>,
    capacity: usize,
    max_attempts: u32,
}

impl RetryQueue {
    pub fn new(capacity: usize, max_attempts: u32) -> Self {
        Self {
            items: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
            max_attempts,
        }
    }

    /// Queue a fresh event, shedding the oldest item when full
    pub fn push(&mut self, event: ClientEvent) -> Option<RetryQueueItem> {
        let shed = self.make_room();
        tracing::debug!(event = event.name(), queued = self.items.len() + 1, "Queued event for retry");
        self.items.push_back(RetryQueueItem { event, attempts: 0 });
        shed
    }

    /// Put back an item whose re-send failed.
    ///
    /// Returns false when the item used up its attempts and was dropped.
    pub fn requeue(&mut self, mut item: RetryQueueItem) -> bool {
        item.attempts += 1;
        if item.attempts >= self.max_attempts {
            tracing::warn!(
                event = item.name(),
                attempts = item.attempts,
                "Dropping event after repeated send failures"
            );
            return false;
        }
        self.make_room();
        self.items.push_back(item);
        true
    }

    /// Take everything for a drain pass
    pub fn drain(&mut self) -> Vec<RetryQueueItem> {
        self.items.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    fn make_room(&mut self) -> Option<RetryQueueItem> {
        if self.items.len() < self.capacity {
            return None;
        }
        let shed = self.items.pop_front();
        if let Some(item) = &shed {
            tracing::warn!(event = item.name(), capacity = self.capacity, "Retry queue full, shedding oldest event");
        }
        shed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use helpline_shared::{MessageId, UserId};

    fn receipt(id: i64) -> ClientEvent {
        ClientEvent::MessageRead {
            message_id: MessageId(id),
            user_id: UserId(1),
        }
    }

    #[test]
    fn test_sheds_oldest_at_capacity() {
        let mut queue = RetryQueue::new(3, 3);
        for id in 1..=3 {
            assert!(queue.push(receipt(id)).is_none());
        }

        let shed = queue.push(receipt(4)).unwrap();
        assert_eq!(shed.event, receipt(1));
        assert_eq!(queue.len(), 3);

        let remaining: Vec<_> = queue.drain().into_iter().map(|i| i.event).collect();
        assert_eq!(remaining, vec![receipt(2), receipt(3), receipt(4)]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_drops_after_max_attempts() {
        let mut queue = RetryQueue::new(10, 3);
        queue.push(receipt(1));

        for round in 1..=2 {
            let item = queue.drain().pop().unwrap();
            assert!(queue.requeue(item));
            assert_eq!(queue.items[0].attempts, round);
        }

        let item = queue.drain().pop().unwrap();
        assert_eq!(item.attempts, 2);
        assert!(!queue.requeue(item));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_requeue_respects_capacity() {
        let mut queue = RetryQueue::new(2, 3);
        queue.push(receipt(1));
        queue.push(receipt(2));

        let item = RetryQueueItem {
            event: receipt(3),
            attempts: 0,
        };
        assert!(queue.requeue(item));
        assert_eq!(queue.len(), 2);
    }
}
