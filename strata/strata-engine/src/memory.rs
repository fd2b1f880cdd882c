//! Memory Admission Control and Monitoring
//!
//! Provides two independent pieces:
//! - [`MemoryBudget`]: an advisory ledger that gates task admission. Tasks
//!   reserve an estimate of their memory need before they start and release it
//!   when they finish.
//! - [`MemoryMonitor`]: samples the resident set size of the process and runs
//!   cleanup hooks when it crosses a threshold.
//!
//! The budget is bookkeeping, not a hard limiter: it never inspects real
//! allocations.
//!
//! # Examples
//!
//! ```
//! use strata_engine::memory::MemoryBudget;
//!
//! let budget = MemoryBudget::new(100.0);
//! let reservation = budget.try_reserve(60.0).expect("fits");
//! assert!(!budget.can_allocate(50.0));
//! drop(reservation);
//! assert!(budget.can_allocate(50.0));
//! ```

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use sysinfo::{Pid, ProcessesToUpdate, System};
use tracing::{debug, warn};

const BYTES_PER_MB: f64 = 1_048_576.0;

/// Multiplier applied to a file's size to estimate its parse footprint
pub const TASK_MEMORY_FACTOR: f64 = 3.0;

/// Smallest reservation a task makes
pub const MIN_TASK_MEMORY_MB: f64 = 1.0;

/// Estimate the memory (MB) needed to parse a file of `size_bytes`.
pub fn estimate_task_mb(size_bytes: u64) -> f64 {
    ((size_bytes as f64 * TASK_MEMORY_FACTOR) / BYTES_PER_MB).max(MIN_TASK_MEMORY_MB)
}

#[derive(Debug, Default)]
struct BudgetState {
    allocated_mb: f64,
    peak_mb: f64,
}

/// Advisory memory ledger shared by all workers.
///
/// Every mutation goes through a single lock. [`MemoryBudget::try_reserve`]
/// checks and reserves in one critical section.
#[derive(Debug)]
pub struct MemoryBudget {
    max_mb: f64,
    state: Mutex<BudgetState>,
}

impl MemoryBudget {
    /// Create a new budget of `max_mb` megabytes
    pub fn new(max_mb: f64) -> Arc<Self> {
        Arc::new(Self {
            max_mb,
            state: Mutex::new(BudgetState::default()),
        })
    }

    /// Maximum budget in MB
    pub fn max_mb(&self) -> f64 {
        self.max_mb
    }

    /// Currently allocated MB
    pub fn allocated_mb(&self) -> f64 {
        self.state.lock().allocated_mb
    }

    /// Highest allocation observed since creation or the last peak reset
    pub fn peak_mb(&self) -> f64 {
        self.state.lock().peak_mb
    }

    /// Restart peak tracking from the current allocation
    pub fn reset_peak(&self) {
        let mut state = self.state.lock();
        state.peak_mb = state.allocated_mb;
    }

    /// Whether `mb` more would fit right now.
    ///
    /// The answer can be stale by the time the caller acts on it; use
    /// [`try_reserve`](Self::try_reserve) to admit work.
    pub fn can_allocate(&self, mb: f64) -> bool {
        self.state.lock().allocated_mb + mb <= self.max_mb
    }

    /// Reserve `mb` if it fits. Returns whether the reservation was made.
    pub fn allocate(&self, mb: f64) -> bool {
        let mut state = self.state.lock();
        if state.allocated_mb + mb > self.max_mb {
            return false;
        }
        state.allocated_mb += mb;
        state.peak_mb = state.peak_mb.max(state.allocated_mb);
        true
    }

    /// Release `mb`. The ledger never goes below zero.
    pub fn deallocate(&self, mb: f64) {
        let mut state = self.state.lock();
        state.allocated_mb = (state.allocated_mb - mb).max(0.0);
    }

    /// Allocated share of the budget, in percent
    pub fn utilization(&self) -> f64 {
        if self.max_mb <= 0.0 {
            return 100.0;
        }
        (self.state.lock().allocated_mb / self.max_mb) * 100.0
    }

    /// Atomically check and reserve `mb`, returning a guard that releases it.
    pub fn try_reserve(self: &Arc<Self>, mb: f64) -> Option<MemoryReservation> {
        if self.allocate(mb) {
            Some(MemoryReservation {
                budget: Arc::clone(self),
                mb,
            })
        } else {
            None
        }
    }

    /// Reserve `mb` even if it exceeds the budget.
    ///
    /// Used to admit a single oversized task when nothing else is running.
    pub fn reserve_unchecked(self: &Arc<Self>, mb: f64) -> MemoryReservation {
        let mut state = self.state.lock();
        state.allocated_mb += mb;
        state.peak_mb = state.peak_mb.max(state.allocated_mb);
        drop(state);

        MemoryReservation {
            budget: Arc::clone(self),
            mb,
        }
    }
}

/// A held slice of the memory budget, released on drop.
#[derive(Debug)]
pub struct MemoryReservation {
    budget: Arc<MemoryBudget>,
    mb: f64,
}

impl MemoryReservation {
    /// Reserved amount in MB
    pub fn mb(&self) -> f64 {
        self.mb
    }
}

impl Drop for MemoryReservation {
    fn drop(&mut self) {
        self.budget.deallocate(self.mb);
    }
}

/// A point-in-time memory observation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryUsageSample {
    pub current_mb: f64,
    pub peak_mb: f64,
    /// Number of cleanups performed so far
    pub collections: u64,
    pub captured_at: DateTime<Utc>,
}

/// Callback run when memory usage crosses the cleanup threshold
pub type CleanupHook = Arc<dyn Fn() + Send + Sync>;

/// Source of the current memory usage in MB
pub type MemoryProbe = Box<dyn Fn() -> f64 + Send + Sync>;

/// Process memory monitor with threshold-triggered cleanup
pub struct MemoryMonitor {
    probe: MemoryProbe,
    threshold_mb: f64,
    peak_mb: Mutex<f64>,
    collections: AtomicU64,
    hooks: RwLock<Vec<CleanupHook>>,
}

impl MemoryMonitor {
    /// Monitor the process RSS, cleaning up above `threshold_mb`
    pub fn new(threshold_mb: f64) -> Self {
        let pid = sysinfo::get_current_pid().ok();
        let system = Mutex::new(System::new());
        let probe: MemoryProbe = Box::new(move || process_rss_mb(&system, pid));
        Self::with_probe(threshold_mb, probe)
    }

    /// Monitor an arbitrary usage source
    pub fn with_probe(threshold_mb: f64, probe: MemoryProbe) -> Self {
        Self {
            probe,
            threshold_mb,
            peak_mb: Mutex::new(0.0),
            collections: AtomicU64::new(0),
            hooks: RwLock::new(Vec::new()),
        }
    }

    pub fn threshold_mb(&self) -> f64 {
        self.threshold_mb
    }

    /// Register a hook run on every cleanup
    pub fn register_cleanup(&self, hook: CleanupHook) {
        self.hooks.write().push(hook);
    }

    /// Capture the current usage
    pub fn sample(&self) -> MemoryUsageSample {
        let current_mb = (self.probe)();
        let peak_mb = {
            let mut peak = self.peak_mb.lock();
            *peak = peak.max(current_mb);
            *peak
        };

        MemoryUsageSample {
            current_mb,
            peak_mb,
            collections: self.collections.load(Ordering::Relaxed),
            captured_at: Utc::now(),
        }
    }

    /// Run every registered cleanup hook
    pub fn cleanup(&self) {
        let hooks = self.hooks.read().clone();
        for hook in hooks {
            hook();
        }
        self.collections.fetch_add(1, Ordering::Relaxed);
    }

    /// Number of cleanups performed
    pub fn collections(&self) -> u64 {
        self.collections.load(Ordering::Relaxed)
    }

    /// Run `f` between two samples, cleaning up afterwards if usage exceeds
    /// the threshold.
    pub fn scope<T>(&self, label: &str, f: impl FnOnce() -> T) -> T {
        let before = self.sample();
        let result = f();
        let after = self.sample();

        debug!(
            "{}: memory {:.1} MB -> {:.1} MB (peak {:.1} MB)",
            label, before.current_mb, after.current_mb, after.peak_mb
        );

        if after.current_mb > self.threshold_mb {
            warn!(
                "{}: memory usage {:.1} MB exceeds {:.1} MB, running cleanup",
                label, after.current_mb, self.threshold_mb
            );
            self.cleanup();
        }

        result
    }
}

impl std::fmt::Debug for MemoryMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryMonitor")
            .field("threshold_mb", &self.threshold_mb)
            .field("collections", &self.collections())
            .finish()
    }
}

fn process_rss_mb(system: &Mutex<System>, pid: Option<Pid>) -> f64 {
    let Some(pid) = pid else {
        return 0.0;
    };

    let mut system = system.lock();
    system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
    system
        .process(pid)
        .map(|process| process.memory() as f64 / BYTES_PER_MB)
        .unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_budget_admission() {
        let budget = MemoryBudget::new(100.0);

        assert!(budget.allocate(60.0));
        assert!(!budget.can_allocate(50.0));

        budget.deallocate(60.0);
        assert!(budget.allocate(50.0));
        assert_eq!(budget.allocated_mb(), 50.0);
    }

    #[test]
    fn test_budget_never_negative() {
        let budget = MemoryBudget::new(100.0);
        budget.allocate(10.0);
        budget.deallocate(40.0);
        assert_eq!(budget.allocated_mb(), 0.0);
        assert_eq!(budget.utilization(), 0.0);
    }

    #[test]
    fn test_reservation_released_on_drop() {
        let budget = MemoryBudget::new(100.0);
        {
            let reservation = budget.try_reserve(80.0).unwrap();
            assert_eq!(reservation.mb(), 80.0);
            assert!(budget.try_reserve(30.0).is_none());
            assert_eq!(budget.utilization(), 80.0);
        }
        assert_eq!(budget.allocated_mb(), 0.0);
        assert_eq!(budget.peak_mb(), 80.0);
    }

    #[test]
    fn test_reset_peak_starts_from_current_allocation() {
        let budget = MemoryBudget::new(100.0);
        let held = budget.try_reserve(20.0).unwrap();
        drop(budget.try_reserve(60.0).unwrap());
        assert_eq!(budget.peak_mb(), 80.0);

        budget.reset_peak();
        assert_eq!(budget.peak_mb(), 20.0);
        drop(held);
        assert_eq!(budget.peak_mb(), 20.0);
    }

    #[test]
    fn test_unchecked_reservation() {
        let budget = MemoryBudget::new(10.0);
        let reservation = budget.reserve_unchecked(25.0);
        assert!(budget.utilization() > 100.0);
        drop(reservation);
        assert_eq!(budget.allocated_mb(), 0.0);
    }

    #[test]
    fn test_estimate_task_mb() {
        assert_eq!(estimate_task_mb(10), MIN_TASK_MEMORY_MB);
        assert_eq!(estimate_task_mb(2 * 1_048_576), 6.0);
    }

    #[test]
    fn test_monitor_cleanup_above_threshold() {
        let monitor = MemoryMonitor::with_probe(100.0, Box::new(|| 150.0));
        let cleaned = Arc::new(AtomicUsize::new(0));
        let cleaned_clone = Arc::clone(&cleaned);
        monitor.register_cleanup(Arc::new(move || {
            cleaned_clone.fetch_add(1, Ordering::Relaxed);
        }));

        let value = monitor.scope("test", || 7);

        assert_eq!(value, 7);
        assert_eq!(cleaned.load(Ordering::Relaxed), 1);
        assert_eq!(monitor.collections(), 1);
        assert_eq!(monitor.sample().peak_mb, 150.0);
    }

    #[test]
    fn test_monitor_no_cleanup_below_threshold() {
        let monitor = MemoryMonitor::with_probe(100.0, Box::new(|| 20.0));
        monitor.scope("test", || ());
        assert_eq!(monitor.collections(), 0);
    }
}
