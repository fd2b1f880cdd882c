//! Error recovery decisions for failed tasks.
//!
//! Every failure is recorded against its task id. Whether a task is retried
//! depends on its error kind and its remaining retry budget.

use crate::task::ParsingTask;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use strata_core::{ErrorKind, StrataError, TaskId};
use tracing::debug;

/// One recorded failure
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub kind: ErrorKind,
    pub message: String,
    pub at: DateTime<Utc>,
}

/// Tracks failures and decides on retries
#[derive(Debug, Default)]
pub struct ErrorRecoveryManager {
    history: Mutex<HashMap<TaskId, Vec<ErrorRecord>>>,
    recoveries: AtomicU64,
}

impl ErrorRecoveryManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `error` for `task` and decide whether to retry it.
    ///
    /// On a retry decision the task's retry counter is incremented; a
    /// memory exhaustion additionally routes the next attempt through the
    /// chunked parser.
    pub fn handle_error(&self, task: &mut ParsingTask, error: &StrataError) -> bool {
        let kind = error.kind();
        self.history
            .lock()
            .entry(task.id)
            .or_default()
            .push(ErrorRecord {
                kind,
                message: error.to_string(),
                at: Utc::now(),
            });

        if task.retries >= task.max_retries {
            debug!(
                "{}: retry budget exhausted after {} attempts",
                task.path.display(),
                task.attempts()
            );
            return false;
        }

        let retry = match kind {
            ErrorKind::Syntax | ErrorKind::PermissionDenied => false,
            ErrorKind::FileNotFound => task.path.exists(),
            ErrorKind::MemoryExhaustion => {
                task.prefer_chunked = true;
                true
            }
            ErrorKind::Timeout | ErrorKind::CacheCorruption | ErrorKind::Unknown => true,
        };

        if retry {
            task.retries += 1;
            self.recoveries.fetch_add(1, Ordering::Relaxed);
            debug!(
                "{}: retrying after {} error (retry {}/{})",
                task.path.display(),
                kind,
                task.retries,
                task.max_retries
            );
        }

        retry
    }

    /// Forget recorded errors before a new run.
    ///
    /// The retry counter keeps counting; callers diff it per run.
    pub fn clear_history(&self) {
        self.history.lock().clear();
    }

    /// Errors recorded for a task, oldest first
    pub fn history(&self, id: &TaskId) -> Vec<ErrorRecord> {
        self.history.lock().get(id).cloned().unwrap_or_default()
    }

    /// Number of retries granted so far
    pub fn recovery_count(&self) -> u64 {
        self.recoveries.load(Ordering::Relaxed)
    }

    /// Count of recorded errors per kind
    pub fn failure_summary(&self) -> BTreeMap<String, usize> {
        let mut summary = BTreeMap::new();
        for records in self.history.lock().values() {
            for record in records {
                *summary.entry(record.kind.to_string()).or_insert(0) += 1;
            }
        }
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_retry_budget() {
        let manager = ErrorRecoveryManager::new();
        let mut task = ParsingTask::new("a.py", 10, 3);
        let error = StrataError::internal("flaky");

        let decisions: Vec<bool> = (0..4).map(|_| manager.handle_error(&mut task, &error)).collect();

        assert_eq!(decisions, vec![true, true, true, false]);
        assert_eq!(task.retries, 3);
        assert_eq!(manager.recovery_count(), 3);
        assert_eq!(manager.history(&task.id).len(), 4);
    }

    #[test]
    fn test_syntax_and_permission_not_retried() {
        let manager = ErrorRecoveryManager::new();
        let mut task = ParsingTask::new("a.py", 10, 3);

        assert!(!manager.handle_error(&mut task, &StrataError::syntax("a.py", 1, "bad")));
        assert!(!manager.handle_error(&mut task, &StrataError::PermissionDenied("a.py".into())));
        assert_eq!(task.retries, 0);
        assert_eq!(manager.recovery_count(), 0);
    }

    #[test]
    fn test_memory_exhaustion_prefers_chunking() {
        let manager = ErrorRecoveryManager::new();
        let mut task = ParsingTask::new("big.py", 10, 3);

        assert!(manager.handle_error(&mut task, &StrataError::memory("too big")));
        assert!(task.prefer_chunked);
    }

    #[test]
    fn test_not_found_retried_only_if_present() {
        let temp = TempDir::new().unwrap();
        let manager = ErrorRecoveryManager::new();
        let missing = temp.path().join("missing.py");
        let error = StrataError::not_found("file", &missing);

        let mut task = ParsingTask::new(&missing, 10, 3);
        assert!(!manager.handle_error(&mut task, &error));

        std::fs::write(&missing, "x = 1\n").unwrap();
        assert!(manager.handle_error(&mut task, &error));
    }

    #[test]
    fn test_failure_summary() {
        let manager = ErrorRecoveryManager::new();
        let mut a = ParsingTask::new("a.py", 10, 0);
        let mut b = ParsingTask::new("b.py", 10, 0);

        manager.handle_error(&mut a, &StrataError::timeout("slow"));
        manager.handle_error(&mut b, &StrataError::timeout("slow"));
        manager.handle_error(&mut b, &StrataError::syntax("b.py", 2, "bad"));

        let summary = manager.failure_summary();
        assert_eq!(summary.get("timeout"), Some(&2));
        assert_eq!(summary.get("syntax"), Some(&1));
    }

    #[test]
    fn test_clear_history() {
        let manager = ErrorRecoveryManager::new();
        let mut task = ParsingTask::new("a.py", 10, 3);
        manager.handle_error(&mut task, &StrataError::timeout("slow"));

        manager.clear_history();
        assert!(manager.history(&task.id).is_empty());
        assert!(manager.failure_summary().is_empty());
        assert_eq!(manager.recovery_count(), 1);
    }
}
