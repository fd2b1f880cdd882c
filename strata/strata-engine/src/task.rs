//! Scheduled units of work.

use crate::memory::estimate_task_mb;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use strata_core::TaskId;

/// Files recognized as package or program entry points
const ENTRY_POINTS: [&str; 6] = [
    "__init__.py",
    "__main__.py",
    "main.py",
    "app.py",
    "setup.py",
    "manage.py",
];

/// Files that usually configure the rest of the tree
const CONFIG_FILES: [&str; 3] = ["settings.py", "config.py", "conftest.py"];

/// One file's unit of scheduled work
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsingTask {
    pub id: TaskId,
    pub path: PathBuf,
    pub size: u64,
    pub priority: i32,
    pub dependencies: BTreeSet<PathBuf>,
    pub retries: u32,
    pub max_retries: u32,
    /// Route through the chunked parser on the next attempt
    pub prefer_chunked: bool,
}

impl ParsingTask {
    pub fn new(path: impl Into<PathBuf>, size: u64, max_retries: u32) -> Self {
        let path = path.into();
        Self {
            id: TaskId::for_path(&path),
            priority: compute_priority(&path, size),
            path,
            size,
            dependencies: BTreeSet::new(),
            retries: 0,
            max_retries,
            prefer_chunked: false,
        }
    }

    /// Build a task, reading the size from the filesystem (0 if unavailable).
    pub fn from_path(path: impl Into<PathBuf>, max_retries: u32) -> Self {
        let path = path.into();
        let size = std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
        Self::new(path, size, max_retries)
    }

    pub fn with_dependencies(mut self, dependencies: impl IntoIterator<Item = PathBuf>) -> Self {
        self.dependencies.extend(dependencies);
        self
    }

    pub fn can_retry(&self) -> bool {
        self.retries < self.max_retries
    }

    /// Attempts made so far, including the first
    pub fn attempts(&self) -> u32 {
        self.retries + 1
    }

    /// Memory (MB) to reserve before running this task
    pub fn memory_estimate_mb(&self) -> f64 {
        estimate_task_mb(self.size)
    }
}

/// Scheduling priority of a file; higher runs first.
pub fn compute_priority(path: &Path, size: u64) -> i32 {
    let mut priority = 0;

    priority += match size {
        s if s < 1024 => 30,
        s if s < 10 * 1024 => 20,
        s if s < 100 * 1024 => 10,
        _ => 0,
    };

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    if ENTRY_POINTS.contains(&file_name.as_str()) {
        priority += 50;
    } else if CONFIG_FILES.contains(&file_name.as_str()) {
        priority += 40;
    }

    if is_test_file(path) {
        priority -= 25;
    }

    priority
}

fn is_test_file(path: &Path) -> bool {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();

    if stem.starts_with("test_") || stem.ends_with("_test") {
        return true;
    }

    path.parent()
        .map(|parent| {
            parent
                .components()
                .any(|c| matches!(c.as_os_str().to_str(), Some("tests" | "test")))
        })
        .unwrap_or(false)
}

/// Order tasks by descending priority, breaking ties by path.
pub fn sort_by_priority(tasks: &mut [ParsingTask]) {
    tasks.sort_by(|a, b| b.priority.cmp(&a.priority).then_with(|| a.path.cmp(&b.path)));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_rules() {
        assert_eq!(compute_priority(Path::new("pkg/util.py"), 500), 30);
        assert_eq!(compute_priority(Path::new("pkg/util.py"), 5_000), 20);
        assert_eq!(compute_priority(Path::new("pkg/util.py"), 50_000), 10);
        assert_eq!(compute_priority(Path::new("pkg/util.py"), 500_000), 0);

        assert_eq!(compute_priority(Path::new("pkg/__init__.py"), 500), 80);
        assert_eq!(compute_priority(Path::new("pkg/settings.py"), 500), 70);
        assert_eq!(compute_priority(Path::new("pkg/test_util.py"), 500), 5);
        assert_eq!(compute_priority(Path::new("tests/helpers.py"), 500_000), -25);
    }

    #[test]
    fn test_sort_order() {
        let mut tasks = vec![
            ParsingTask::new("b.py", 500, 3),
            ParsingTask::new("big.py", 500_000, 3),
            ParsingTask::new("main.py", 500, 3),
            ParsingTask::new("a.py", 500, 3),
        ];
        sort_by_priority(&mut tasks);

        let order: Vec<_> = tasks.iter().map(|t| t.path.to_str().unwrap()).collect();
        assert_eq!(order, vec!["main.py", "a.py", "b.py", "big.py"]);
    }

    #[test]
    fn test_retry_bookkeeping() {
        let mut task = ParsingTask::new("a.py", 10, 1);
        assert!(task.can_retry());
        assert_eq!(task.attempts(), 1);

        task.retries += 1;
        assert!(!task.can_retry());
        assert_eq!(task.attempts(), 2);
    }

    #[test]
    fn test_id_matches_path() {
        let task = ParsingTask::new("/repo/a.py", 10, 3)
            .with_dependencies([PathBuf::from("/repo/b.py")]);
        assert_eq!(task.id, TaskId::for_path(Path::new("/repo/a.py")));
        assert!(task.dependencies.contains(Path::new("/repo/b.py")));
    }
}
