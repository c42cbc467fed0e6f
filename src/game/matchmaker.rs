//! Matchmaking
//!
//! Decides when waiting sessions enter play. The listener hands sessions
//! in and promotes whatever comes back.

use std::collections::VecDeque;

use crate::network::session::SessionId;

/// Promotion policy for waiting sessions.
pub trait Matchmaker: Send {
    /// Accept a waiting session. Returns the sessions promoted by this call.
    fn enqueue(&mut self, session: SessionId) -> Vec<SessionId>;

    /// Withdraw a waiting session. Returns `false` if it was not queued.
    fn dequeue(&mut self, session: SessionId) -> bool;

    /// Sessions still waiting.
    fn queued(&self) -> usize;
}

/// FIFO queue promoting sessions in batches of `bulk_size`.
pub struct QueueMatchmaker {
    bulk_size: usize,
    queue: VecDeque<SessionId>,
}

impl QueueMatchmaker {
    /// Create a matchmaker; a bulk size of 0 behaves like 1.
    pub fn new(bulk_size: usize) -> Self {
        Self {
            bulk_size: bulk_size.max(1),
            queue: VecDeque::new(),
        }
    }
}

impl Matchmaker for QueueMatchmaker {
    fn enqueue(&mut self, session: SessionId) -> Vec<SessionId> {
        if self.queue.contains(&session) {
            return Vec::new();
        }
        self.queue.push_back(session);

        if self.queue.len() < self.bulk_size {
            return Vec::new();
        }
        self.queue.drain(..self.bulk_size).collect()
    }

    fn dequeue(&mut self, session: SessionId) -> bool {
        match self.queue.iter().position(|queued| *queued == session) {
            Some(index) => self.queue.remove(index).is_some(),
            None => false,
        }
    }

    fn queued(&self) -> usize {
        self.queue.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(raw: u64) -> SessionId {
        SessionId::new(raw)
    }

    #[test]
    fn test_single_bulk_promotes_immediately() {
        let mut matchmaker = QueueMatchmaker::new(1);
        assert_eq!(matchmaker.enqueue(id(1)), vec![id(1)]);
        assert_eq!(matchmaker.queued(), 0);
    }

    #[test]
    fn test_batches_in_fifo_order() {
        let mut matchmaker = QueueMatchmaker::new(3);
        assert!(matchmaker.enqueue(id(4)).is_empty());
        assert!(matchmaker.enqueue(id(2)).is_empty());
        assert!(matchmaker.enqueue(id(2)).is_empty());
        assert_eq!(matchmaker.queued(), 2);

        assert_eq!(matchmaker.enqueue(id(9)), vec![id(4), id(2), id(9)]);
        assert_eq!(matchmaker.queued(), 0);
    }

    #[test]
    fn test_dequeue_only_removes_member() {
        let mut matchmaker = QueueMatchmaker::new(4);
        matchmaker.enqueue(id(1));
        matchmaker.enqueue(id(2));

        assert!(!matchmaker.dequeue(id(3)));
        assert_eq!(matchmaker.queued(), 2);
        assert!(matchmaker.dequeue(id(1)));
        assert!(!matchmaker.dequeue(id(1)));
        assert_eq!(matchmaker.queued(), 1);
    }
}
