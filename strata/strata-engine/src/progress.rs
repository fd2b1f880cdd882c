//! Progress Tracking
//!
//! Counters live behind a single lock. Every update produces a
//! [`ProgressSnapshot`] that is fanned out to subscribers through bounded
//! channels, so a slow observer can never stall a worker:
//! - a full channel drops that snapshot for that subscriber
//! - a disconnected subscriber is pruned on the next update
//!
//! # Examples
//!
//! ```
//! use strata_engine::progress::{ProgressEvent, ProgressTracker};
//!
//! let tracker = ProgressTracker::new(10);
//! let subscription = tracker.subscribe(16);
//! tracker.update(1, 0, None);
//!
//! match subscription.try_recv() {
//!     Some(ProgressEvent::Progress(snapshot)) => assert_eq!(snapshot.completed, 1),
//!     other => panic!("unexpected event: {:?}", other),
//! }
//! ```

use crossbeam::channel::{self, Receiver, Sender, TrySendError};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;
use strata_core::{Result, StrataError};
use tracing::debug;

/// Point-in-time view of the run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub current_file: Option<PathBuf>,
    pub percentage: f64,
}

/// Events delivered to subscribers
#[derive(Debug, Clone, PartialEq)]
pub enum ProgressEvent {
    Progress(ProgressSnapshot),
    StageStarted { stage: String },
    StageCompleted { stage: String, duration: Duration },
}

/// Receives events on a listener thread
pub trait ProgressObserver: Send + Sync {
    fn on_event(&self, event: &ProgressEvent);
}

impl<F> ProgressObserver for F
where
    F: Fn(&ProgressEvent) + Send + Sync,
{
    fn on_event(&self, event: &ProgressEvent) {
        self(event)
    }
}

struct Subscriber {
    id: u64,
    sender: Sender<ProgressEvent>,
}

#[derive(Default)]
struct ProgressState {
    total: usize,
    completed: usize,
    failed: usize,
    current_file: Option<PathBuf>,
    subscribers: Vec<Subscriber>,
}

impl ProgressState {
    fn snapshot(&self) -> ProgressSnapshot {
        let percentage = if self.total == 0 {
            100.0
        } else {
            ((self.completed + self.failed) as f64 / self.total as f64) * 100.0
        };

        ProgressSnapshot {
            total: self.total,
            completed: self.completed,
            failed: self.failed,
            current_file: self.current_file.clone(),
            percentage,
        }
    }
}

/// Thread-safe progress tracker
pub struct ProgressTracker {
    state: Mutex<ProgressState>,
    next_id: AtomicU64,
    dropped: AtomicU64,
}

impl ProgressTracker {
    /// Create a new tracker expecting `total` items
    pub fn new(total: usize) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(ProgressState {
                total,
                ..Default::default()
            }),
            next_id: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        })
    }

    /// Reset the expected total
    pub fn set_total(&self, total: usize) {
        let mut state = self.state.lock();
        state.total = total;
        let snapshot = state.snapshot();
        self.broadcast(&mut state, ProgressEvent::Progress(snapshot));
    }

    /// Start a new run of `total` items with zeroed counters
    pub fn reset(&self, total: usize) {
        let mut state = self.state.lock();
        state.total = total;
        state.completed = 0;
        state.failed = 0;
        state.current_file = None;
        let snapshot = state.snapshot();
        self.broadcast(&mut state, ProgressEvent::Progress(snapshot));
    }

    /// Apply counter deltas and notify subscribers.
    ///
    /// `current_file` replaces the reported current file when given.
    pub fn update(&self, completed_delta: usize, failed_delta: usize, current_file: Option<&Path>) {
        let mut state = self.state.lock();
        state.completed += completed_delta;
        state.failed += failed_delta;
        if let Some(path) = current_file {
            state.current_file = Some(path.to_path_buf());
        }

        let snapshot = state.snapshot();
        self.broadcast(&mut state, ProgressEvent::Progress(snapshot));
    }

    /// Report the file currently being processed without moving counters
    pub fn set_current_file(&self, path: &Path) {
        self.update(0, 0, Some(path));
    }

    /// Current counters
    pub fn snapshot(&self) -> ProgressSnapshot {
        self.state.lock().snapshot()
    }

    pub fn begin_stage(&self, stage: &str) {
        let mut state = self.state.lock();
        self.broadcast(
            &mut state,
            ProgressEvent::StageStarted {
                stage: stage.to_string(),
            },
        );
    }

    pub fn end_stage(&self, stage: &str, duration: Duration) {
        let mut state = self.state.lock();
        self.broadcast(
            &mut state,
            ProgressEvent::StageCompleted {
                stage: stage.to_string(),
                duration,
            },
        );
    }

    /// Subscribe with a channel of `capacity` events
    pub fn subscribe(self: &Arc<Self>, capacity: usize) -> ProgressSubscription {
        let (sender, receiver) = channel::bounded(capacity.max(1));
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.state.lock().subscribers.push(Subscriber { id, sender });

        ProgressSubscription {
            id,
            receiver,
            tracker: Arc::downgrade(self),
        }
    }

    /// Run `observer` on a dedicated thread for every event.
    ///
    /// The thread exits when the returned listener is finished or dropped.
    pub fn spawn_listener(
        self: &Arc<Self>,
        observer: Arc<dyn ProgressObserver>,
        capacity: usize,
    ) -> Result<ProgressListener> {
        let subscription = self.subscribe(capacity);
        let id = subscription.id;

        let handle = thread::Builder::new()
            .name("strata-progress".to_string())
            .spawn(move || {
                for event in subscription.receiver.iter() {
                    observer.on_event(&event);
                }
            })
            .map_err(|e| StrataError::scheduler(format!("Failed to spawn progress listener: {}", e)))?;

        Ok(ProgressListener {
            id,
            tracker: Arc::downgrade(self),
            handle: Some(handle),
        })
    }

    /// Number of live subscribers
    pub fn subscriber_count(&self) -> usize {
        self.state.lock().subscribers.len()
    }

    /// Snapshots dropped because a subscriber's channel was full
    pub fn dropped_events(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn unsubscribe(&self, id: u64) {
        self.state.lock().subscribers.retain(|s| s.id != id);
    }

    fn broadcast(&self, state: &mut ProgressState, event: ProgressEvent) {
        state.subscribers.retain(|subscriber| {
            match subscriber.sender.try_send(event.clone()) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    true
                }
                Err(TrySendError::Disconnected(_)) => {
                    debug!("Pruning disconnected progress subscriber {}", subscriber.id);
                    false
                }
            }
        });
    }
}

impl std::fmt::Debug for ProgressTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressTracker")
            .field("snapshot", &self.snapshot())
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

/// Receiving end of a subscription; dropping it unsubscribes
pub struct ProgressSubscription {
    id: u64,
    receiver: Receiver<ProgressEvent>,
    tracker: Weak<ProgressTracker>,
}

impl ProgressSubscription {
    pub fn try_recv(&self) -> Option<ProgressEvent> {
        self.receiver.try_recv().ok()
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Option<ProgressEvent> {
        self.receiver.recv_timeout(timeout).ok()
    }

    /// Take every buffered event
    pub fn drain(&self) -> Vec<ProgressEvent> {
        self.receiver.try_iter().collect()
    }
}

impl Drop for ProgressSubscription {
    fn drop(&mut self) {
        if let Some(tracker) = self.tracker.upgrade() {
            tracker.unsubscribe(self.id);
        }
    }
}

/// Handle to a listener thread started by [`ProgressTracker::spawn_listener`]
pub struct ProgressListener {
    id: u64,
    tracker: Weak<ProgressTracker>,
    handle: Option<thread::JoinHandle<()>>,
}

impl ProgressListener {
    /// Deliver the buffered events and stop the thread
    pub fn finish(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        if let Some(tracker) = self.tracker.upgrade() {
            tracker.unsubscribe(self.id);
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for ProgressListener {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_percentage() {
        let tracker = ProgressTracker::new(4);
        tracker.update(1, 1, Some(Path::new("a.py")));

        let snapshot = tracker.snapshot();
        assert_eq!(snapshot.completed, 1);
        assert_eq!(snapshot.failed, 1);
        assert_eq!(snapshot.percentage, 50.0);
        assert_eq!(snapshot.current_file, Some(PathBuf::from("a.py")));
    }

    #[test]
    fn test_empty_run_is_complete() {
        let tracker = ProgressTracker::new(0);
        assert_eq!(tracker.snapshot().percentage, 100.0);
    }

    #[test]
    fn test_reset_zeroes_counters() {
        let tracker = ProgressTracker::new(2);
        tracker.update(1, 1, Some(Path::new("a.py")));
        let subscription = tracker.subscribe(4);

        tracker.reset(3);

        let snapshot = tracker.snapshot();
        assert_eq!(snapshot.total, 3);
        assert_eq!(snapshot.completed, 0);
        assert_eq!(snapshot.failed, 0);
        assert_eq!(snapshot.current_file, None);
        assert_eq!(snapshot.percentage, 0.0);
        assert_eq!(
            subscription.drain(),
            vec![ProgressEvent::Progress(snapshot)]
        );
    }

    #[test]
    fn test_concurrent_updates() {
        let tracker = ProgressTracker::new(100);
        let mut handles = Vec::new();

        for _ in 0..5 {
            let tracker = Arc::clone(&tracker);
            handles.push(thread::spawn(move || {
                for _ in 0..20 {
                    tracker.update(1, 0, None);
                }
            }));
        }

        for handle in handles {
            handle.join().unwrap();
        }

        let snapshot = tracker.snapshot();
        assert_eq!(snapshot.completed, 100);
        assert_eq!(snapshot.percentage, 100.0);
    }

    #[test]
    fn test_full_channel_drops_snapshots() {
        let tracker = ProgressTracker::new(10);
        let subscription = tracker.subscribe(1);

        tracker.update(1, 0, None);
        tracker.update(1, 0, None);
        tracker.update(1, 0, None);

        assert_eq!(subscription.drain().len(), 1);
        assert_eq!(tracker.dropped_events(), 2);
        assert_eq!(tracker.snapshot().completed, 3);
    }

    #[test]
    fn test_dropped_subscription_unsubscribes() {
        let tracker = ProgressTracker::new(1);
        let subscription = tracker.subscribe(4);
        assert_eq!(tracker.subscriber_count(), 1);

        drop(subscription);
        assert_eq!(tracker.subscriber_count(), 0);
        tracker.update(1, 0, None);
    }

    #[test]
    fn test_stage_events_in_order() {
        let tracker = ProgressTracker::new(0);
        let subscription = tracker.subscribe(8);

        tracker.begin_stage("discover");
        tracker.end_stage("discover", Duration::from_millis(3));

        let events = subscription.drain();
        assert_eq!(
            events,
            vec![
                ProgressEvent::StageStarted {
                    stage: "discover".to_string()
                },
                ProgressEvent::StageCompleted {
                    stage: "discover".to_string(),
                    duration: Duration::from_millis(3)
                },
            ]
        );
    }

    #[test]
    fn test_listener_receives_events() {
        let tracker = ProgressTracker::new(3);
        let seen = Arc::new(AtomicUsize::new(0));
        let seen_clone = Arc::clone(&seen);

        let listener = tracker
            .spawn_listener(
                Arc::new(move |event: &ProgressEvent| {
                    if matches!(event, ProgressEvent::Progress(_)) {
                        seen_clone.fetch_add(1, Ordering::Relaxed);
                    }
                }),
                16,
            )
            .unwrap();

        for _ in 0..3 {
            tracker.update(1, 0, None);
        }
        listener.finish();

        assert_eq!(seen.load(Ordering::Relaxed), 3);
        assert_eq!(tracker.subscriber_count(), 0);
    }
}
