//! Completion and hit-count tracking for one search.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::cancel::CancellationToken;

/// Shared counters for one search.
///
/// `completed_shards` only ever grows and never exceeds `shard_count`. The hit
/// count may be read at any time for progress reporting but is only final once
/// completion has been signalled.
#[derive(Debug)]
pub struct ProgressTracker {
    shard_count: usize,
    completed_shards: AtomicUsize,
    hit_count: AtomicU64,
    paused_nanos: AtomicU64,
    completion_signalled: AtomicBool,
    // Orders cancellation against the completion claim.
    transition: Mutex<()>,
    cancel: CancellationToken,
    started: Instant,
}

impl ProgressTracker {
    /// Create a tracker for `shard_count` shards.
    pub fn new(shard_count: usize, cancel: CancellationToken) -> Self {
        Self {
            shard_count,
            completed_shards: AtomicUsize::new(0),
            hit_count: AtomicU64::new(0),
            paused_nanos: AtomicU64::new(0),
            completion_signalled: AtomicBool::new(false),
            transition: Mutex::new(()),
            cancel,
            started: Instant::now(),
        }
    }

    /// Total number of shards in the search.
    pub fn shard_count(&self) -> usize {
        self.shard_count
    }

    /// Number of shards whose task has finished, successfully or not.
    pub fn completed_shards(&self) -> usize {
        self.completed_shards.load(Ordering::SeqCst)
    }

    /// Hits counted so far.
    pub fn hit_count(&self) -> u64 {
        self.hit_count.load(Ordering::SeqCst)
    }

    /// The cancellation token of this search.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Whether the search was cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// True once cancelled or once every shard has completed.
    pub fn is_complete(&self) -> bool {
        self.is_cancelled() || self.completed_shards() >= self.shard_count
    }

    /// Add matched documents to the hit count.
    pub fn add_hits(&self, hits: u64) {
        self.hit_count.fetch_add(hits, Ordering::SeqCst);
    }

    /// Record that one shard finished. Returns the new completed count.
    ///
    /// Calls beyond `shard_count` are ignored.
    pub fn complete_shard(&self) -> usize {
        let shard_count = self.shard_count;
        match self
            .completed_shards
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n < shard_count).then_some(n + 1)
            }) {
            Ok(previous) => previous + 1,
            Err(current) => current,
        }
    }

    /// Add time that matching spent blocked on a full handoff queue.
    pub fn record_pause(&self, paused: Duration) {
        self.paused_nanos
            .fetch_add(paused.as_nanos() as u64, Ordering::Relaxed);
    }

    /// Total time matching spent blocked on full handoff queues.
    pub fn paused(&self) -> Duration {
        Duration::from_nanos(self.paused_nanos.load(Ordering::Relaxed))
    }

    /// Claim the right to signal completion.
    ///
    /// Returns `true` exactly once, and only after the search is complete.
    pub fn try_signal_completion(&self) -> bool {
        let _transition = self.transition.lock();
        self.is_complete()
            && self
                .completion_signalled
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
    }

    /// Cancel the search unless every shard already finished.
    ///
    /// Returns `true` if this call set the token. Once all shards completed
    /// or completion was claimed the token is left alone, so a finished
    /// search is never reported as cancelled.
    pub fn cancel(&self) -> bool {
        let _transition = self.transition.lock();
        if self.completion_signalled() || self.completed_shards() >= self.shard_count {
            return false;
        }
        self.cancel.cancel()
    }

    /// Whether completion has been signalled.
    pub fn completion_signalled(&self) -> bool {
        self.completion_signalled.load(Ordering::SeqCst)
    }

    /// Point-in-time copy of the counters.
    pub fn snapshot(&self) -> SearchProgress {
        SearchProgress {
            shard_count: self.shard_count,
            completed_shards: self.completed_shards(),
            hit_count: self.hit_count(),
            cancelled: self.is_cancelled(),
            paused: self.paused(),
            elapsed: self.started.elapsed(),
        }
    }
}

/// Snapshot of a search's progress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchProgress {
    pub shard_count: usize,
    pub completed_shards: usize,
    pub hit_count: u64,
    pub cancelled: bool,
    pub paused: Duration,
    pub elapsed: Duration,
}

impl SearchProgress {
    /// Human readable one-line status.
    pub fn info(&self) -> String {
        let mut info = format!(
            "Searching... {}/{} shards complete, {} hits",
            self.completed_shards, self.shard_count, self.hit_count
        );
        if !self.paused.is_zero() {
            info.push_str(&format!(
                " (matching paused for {} ms)",
                self.paused.as_millis()
            ));
        }
        if self.cancelled {
            info.push_str(" [cancelled]");
        }
        info
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_completion_counts() {
        let tracker = ProgressTracker::new(2, CancellationToken::new());
        assert!(!tracker.is_complete());
        assert!(!tracker.try_signal_completion());

        assert_eq!(tracker.complete_shard(), 1);
        assert_eq!(tracker.complete_shard(), 2);
        // Never exceeds the shard count.
        assert_eq!(tracker.complete_shard(), 2);
        assert_eq!(tracker.completed_shards(), 2);

        assert!(tracker.is_complete());
        assert!(tracker.try_signal_completion());
        assert!(!tracker.try_signal_completion());
    }

    #[test]
    fn test_empty_search_is_complete() {
        let tracker = ProgressTracker::new(0, CancellationToken::new());
        assert!(tracker.is_complete());
        assert!(tracker.try_signal_completion());
    }

    #[test]
    fn test_cancel_completes() {
        let cancel = CancellationToken::new();
        let tracker = ProgressTracker::new(5, cancel.clone());
        tracker.complete_shard();
        cancel.cancel();

        assert!(tracker.is_complete());
        assert_eq!(tracker.completed_shards(), 1);
        assert!(tracker.snapshot().cancelled);
    }

    #[test]
    fn test_cancel_after_last_shard_is_refused() {
        let tracker = ProgressTracker::new(2, CancellationToken::new());
        assert!(tracker.cancel());
        assert!(tracker.is_cancelled());

        let tracker = ProgressTracker::new(2, CancellationToken::new());
        tracker.complete_shard();
        tracker.complete_shard();
        // Every shard finished but completion is not yet claimed.
        assert!(!tracker.cancel());
        assert!(!tracker.is_cancelled());
        assert!(tracker.try_signal_completion());
        assert!(!tracker.cancel());
        assert!(!tracker.snapshot().cancelled);
    }

    #[test]
    fn test_cancel_races_with_completion() {
        for _ in 0..200 {
            let tracker = std::sync::Arc::new(ProgressTracker::new(1, CancellationToken::new()));
            let finisher = {
                let tracker = std::sync::Arc::clone(&tracker);
                std::thread::spawn(move || {
                    tracker.complete_shard();
                    tracker.try_signal_completion()
                })
            };
            let cancelled = tracker.cancel();
            let signalled_by_finisher = finisher.join().unwrap();

            // Exactly one side claims the terminal transition.
            let signalled = signalled_by_finisher || tracker.try_signal_completion();
            assert!(signalled);
            assert_eq!(tracker.is_cancelled(), cancelled);
            if signalled_by_finisher && !cancelled {
                assert!(!tracker.snapshot().cancelled);
            }
        }
    }

    #[test]
    fn test_progress_info() {
        let tracker = ProgressTracker::new(5, CancellationToken::new());
        tracker.complete_shard();
        tracker.add_hits(30);

        let info = tracker.snapshot().info();
        assert_eq!(info, "Searching... 1/5 shards complete, 30 hits");

        tracker.record_pause(Duration::from_millis(250));
        assert!(
            tracker
                .snapshot()
                .info()
                .ends_with("(matching paused for 250 ms)")
        );
    }
}
