//! Bounded hand-off of matched document ids from matching to extraction.
//!
//! Matching a shard is usually much faster than reading stored fields, so the
//! matching side pushes ids into a bounded queue and blocks when it is full.
//! Both sides wait with a timeout so they can notice cancellation even when
//! the other side has stalled.

use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, SendTimeoutError, Sender, TrySendError};

use crate::cancel::CancellationToken;
use crate::error::{Result, ShardSearchError};

/// An item carried over the hand-off queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocIdToken {
    /// Shard-level ordinal of a matched document.
    Doc(u32),

    /// No more ids will follow.
    End,
}

/// Bounded queue between the matching and extraction stages of one shard.
#[derive(Debug)]
pub struct DocIdHandoffQueue {
    sender: Sender<DocIdToken>,
    receiver: Receiver<DocIdToken>,
    capacity: usize,
    poll_interval: Duration,
}

impl DocIdHandoffQueue {
    /// Create a queue holding at most `capacity` tokens.
    pub fn new(capacity: usize, poll_interval: Duration) -> Self {
        let capacity = capacity.max(1);
        let (sender, receiver) = crossbeam_channel::bounded(capacity);
        Self {
            sender,
            receiver,
            capacity,
            poll_interval,
        }
    }

    /// Maximum number of tokens the queue holds.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of tokens waiting to be taken.
    pub fn len(&self) -> usize {
        self.receiver.len()
    }

    /// Whether no tokens are waiting.
    pub fn is_empty(&self) -> bool {
        self.receiver.is_empty()
    }

    /// Push a token, blocking while the queue is full.
    ///
    /// Re-checks `cancel` every poll interval and gives up with
    /// [`ShardSearchError::Terminated`] once it is set. Returns how long the
    /// call was blocked.
    pub fn push(&self, token: DocIdToken, cancel: &CancellationToken) -> Result<Duration> {
        let mut token = match self.sender.try_send(token) {
            Ok(()) => return Ok(Duration::ZERO),
            Err(TrySendError::Full(token)) => token,
            Err(TrySendError::Disconnected(_)) => {
                return Err(ShardSearchError::internal("hand-off queue disconnected"));
            }
        };

        let blocked_since = Instant::now();
        loop {
            cancel.check()?;
            match self.sender.send_timeout(token, self.poll_interval) {
                Ok(()) => return Ok(blocked_since.elapsed()),
                Err(SendTimeoutError::Timeout(t)) => token = t,
                Err(SendTimeoutError::Disconnected(_)) => {
                    return Err(ShardSearchError::internal("hand-off queue disconnected"));
                }
            }
        }
    }

    /// Take the next token, waiting at most one poll interval.
    ///
    /// Returns `None` if nothing arrived in time.
    pub fn poll(&self) -> Option<DocIdToken> {
        match self.receiver.recv_timeout(self.poll_interval) {
            Ok(token) => Some(token),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_fifo_order() {
        let queue = DocIdHandoffQueue::new(4, Duration::from_millis(10));
        let cancel = CancellationToken::new();

        queue.push(DocIdToken::Doc(3), &cancel).unwrap();
        queue.push(DocIdToken::Doc(1), &cancel).unwrap();
        queue.push(DocIdToken::End, &cancel).unwrap();
        assert_eq!(queue.len(), 3);

        assert_eq!(queue.poll(), Some(DocIdToken::Doc(3)));
        assert_eq!(queue.poll(), Some(DocIdToken::Doc(1)));
        assert_eq!(queue.poll(), Some(DocIdToken::End));
        assert_eq!(queue.poll(), None);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_full_queue_blocks_until_consumed() {
        let queue = Arc::new(DocIdHandoffQueue::new(2, Duration::from_millis(10)));
        let cancel = CancellationToken::new();

        queue.push(DocIdToken::Doc(0), &cancel).unwrap();
        queue.push(DocIdToken::Doc(1), &cancel).unwrap();

        let producer = {
            let queue = Arc::clone(&queue);
            let cancel = cancel.clone();
            thread::spawn(move || queue.push(DocIdToken::Doc(2), &cancel))
        };

        thread::sleep(Duration::from_millis(50));
        // The producer cannot get past the bound.
        assert_eq!(queue.len(), 2);

        assert_eq!(queue.poll(), Some(DocIdToken::Doc(0)));
        let blocked = producer.join().unwrap().unwrap();
        assert!(blocked >= Duration::from_millis(40));
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_cancel_releases_blocked_producer() {
        let queue = Arc::new(DocIdHandoffQueue::new(1, Duration::from_millis(10)));
        let cancel = CancellationToken::new();
        queue.push(DocIdToken::Doc(0), &cancel).unwrap();

        let producer = {
            let queue = Arc::clone(&queue);
            let cancel = cancel.clone();
            thread::spawn(move || queue.push(DocIdToken::Doc(1), &cancel))
        };

        thread::sleep(Duration::from_millis(30));
        cancel.cancel();

        let result = producer.join().unwrap();
        assert!(matches!(result, Err(ShardSearchError::Terminated)));
        assert_eq!(queue.len(), 1);
    }
}
