//! Parallel Task Scheduling
//!
//! Turns a set of files into prioritized [`ParsingTask`]s and runs them on a
//! bounded set of workers:
//! - pooled: named OS threads draining a bounded job channel
//! - cpu-bound: a rayon thread pool
//! - hybrid: large files on the rayon pool, the rest on the thread pool
//! - inline: on the calling thread when parallelism is disabled
//!
//! A single coordinator owns the queue. It admits tasks while the worker cap
//! and the memory budget allow, blocks on the completion channel, and feeds
//! failures through the [`ErrorRecoveryManager`]. Retried tasks go to the back
//! of the queue.
//!
//! # Examples
//!
//! ```no_run
//! use strata_engine::chunked::ChunkedParser;
//! use strata_engine::memory::MemoryMonitor;
//! use strata_engine::progress::ProgressTracker;
//! use strata_engine::scheduler::ParallelProcessor;
//! use strata_engine::shallow::ShallowExtractor;
//! use strata_core::StrataConfig;
//! use std::path::PathBuf;
//! use std::sync::Arc;
//!
//! let config = StrataConfig::default();
//! let monitor = Arc::new(MemoryMonitor::new(1536.0));
//! let chunked = Arc::new(ChunkedParser::from_config(&config, monitor));
//! let processor = ParallelProcessor::new(&config, chunked, ProgressTracker::new(0));
//!
//! let outcome = processor.process_files(
//!     &[PathBuf::from("src/app.py")],
//!     ShallowExtractor::parse_fn(),
//! )?;
//! println!("parsed {} files", outcome.modules.len());
//! # Ok::<(), strata_core::StrataError>(())
//! ```

use crate::chunked::ChunkedParser;
use crate::memory::{MemoryBudget, MemoryReservation};
use crate::metrics::ProcessingMetrics;
use crate::progress::ProgressTracker;
use crate::recovery::ErrorRecoveryManager;
use crate::task::{sort_by_priority, ParsingTask};
use crossbeam::channel::{self, Receiver, Sender};
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use strata_core::config::SchedulerConfig;
use strata_core::{ErrorKind, ParsedModule, Result, StrataConfig, StrataError, Strategy};
use tracing::{debug, info, warn};

/// Parser callback supplied by the caller
pub type ParseFn = Arc<dyn Fn(&Path) -> Result<ParsedModule> + Send + Sync>;

/// Files at or above this size count as large for strategy selection and
/// hybrid routing
pub const LARGE_TASK_BYTES: u64 = 100 * 1024;

/// Below this many files the adaptive strategy always pools
const SMALL_RUN_FILES: usize = 10;

/// Above this many files the adaptive strategy goes hybrid
const LARGE_RUN_FILES: usize = 100;

/// Tasks sampled to estimate the average file size
const SIZE_SAMPLE: usize = 10;

/// Executor actually used for a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExecutionStrategy {
    Pooled,
    CpuBound,
    Hybrid,
    Inline,
}

impl fmt::Display for ExecutionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Pooled => "pooled",
            Self::CpuBound => "cpu-bound",
            Self::Hybrid => "hybrid",
            Self::Inline => "inline",
        })
    }
}

/// Resolve the requested strategy against the workload.
///
/// `tasks` should be in discovery order; the size sample is taken from the
/// front.
pub fn select_strategy(tasks: &[ParsingTask], requested: Strategy) -> ExecutionStrategy {
    match requested {
        Strategy::Pooled => ExecutionStrategy::Pooled,
        Strategy::CpuBound => ExecutionStrategy::CpuBound,
        Strategy::Hybrid => ExecutionStrategy::Hybrid,
        Strategy::Adaptive => {
            if tasks.len() < SMALL_RUN_FILES {
                return ExecutionStrategy::Pooled;
            }

            let sample = &tasks[..SIZE_SAMPLE];
            let average = sample.iter().map(|t| t.size).sum::<u64>() / sample.len() as u64;

            if average > LARGE_TASK_BYTES {
                ExecutionStrategy::CpuBound
            } else if tasks.len() > LARGE_RUN_FILES {
                ExecutionStrategy::Hybrid
            } else {
                ExecutionStrategy::Pooled
            }
        }
    }
}

/// A task that failed permanently
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub path: PathBuf,
    pub kind: ErrorKind,
    pub message: String,
    pub attempts: u32,
}

/// Result of a processing run
#[derive(Debug, Clone)]
pub struct ProcessingOutcome {
    pub modules: HashMap<PathBuf, ParsedModule>,
    pub failures: Vec<FailureRecord>,
    /// Parse time of the successful attempt per file
    pub durations: HashMap<PathBuf, Duration>,
    pub metrics: ProcessingMetrics,
    pub strategy: ExecutionStrategy,
}

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Fixed set of named worker threads fed through a bounded channel
struct WorkerPool {
    sender: Option<Sender<Job>>,
    handles: Vec<thread::JoinHandle<()>>,
}

impl WorkerPool {
    fn new(size: usize) -> Result<Self> {
        let (sender, receiver): (Sender<Job>, Receiver<Job>) = channel::bounded(size * 2);
        let mut handles = Vec::with_capacity(size);

        for i in 0..size {
            let receiver = receiver.clone();
            let handle = thread::Builder::new()
                .name(format!("strata-worker-{}", i))
                .spawn(move || {
                    while let Ok(job) = receiver.recv() {
                        job();
                    }
                })
                .map_err(|e| StrataError::scheduler(format!("Failed to spawn worker {}: {}", i, e)))?;
            handles.push(handle);
        }

        Ok(Self {
            sender: Some(sender),
            handles,
        })
    }

    fn submit(&self, job: Job) -> Result<()> {
        self.sender
            .as_ref()
            .ok_or_else(|| StrataError::scheduler("worker pool is shut down"))?
            .send(job)
            .map_err(|_| StrataError::scheduler("worker pool disconnected"))
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        // Closing the channel stops the workers
        self.sender.take();
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

enum Executor {
    Inline,
    Pooled(WorkerPool),
    CpuBound(rayon::ThreadPool),
    Hybrid {
        threads: WorkerPool,
        cpu: rayon::ThreadPool,
    },
}

impl Executor {
    fn build(strategy: ExecutionStrategy, workers: usize) -> Result<Self> {
        Ok(match strategy {
            ExecutionStrategy::Inline => Self::Inline,
            ExecutionStrategy::Pooled => Self::Pooled(WorkerPool::new(workers)?),
            ExecutionStrategy::CpuBound => Self::CpuBound(build_rayon_pool(workers)?),
            ExecutionStrategy::Hybrid => Self::Hybrid {
                threads: WorkerPool::new(workers)?,
                cpu: build_rayon_pool(workers)?,
            },
        })
    }

    fn submit(&self, size: u64, job: Job) -> Result<()> {
        match self {
            Self::Inline => {
                job();
                Ok(())
            }
            Self::Pooled(pool) => pool.submit(job),
            Self::CpuBound(pool) => {
                pool.spawn(job);
                Ok(())
            }
            Self::Hybrid { threads, cpu } => {
                if size >= LARGE_TASK_BYTES {
                    cpu.spawn(job);
                    Ok(())
                } else {
                    threads.submit(job)
                }
            }
        }
    }
}

fn build_rayon_pool(workers: usize) -> Result<rayon::ThreadPool> {
    rayon::ThreadPoolBuilder::new()
        .num_threads(workers)
        .thread_name(|i| format!("strata-cpu-{}", i))
        .build()
        .map_err(|e| StrataError::scheduler(format!("Failed to build thread pool: {}", e)))
}

/// Shared state handed to every job
struct TaskContext {
    parse_fn: ParseFn,
    chunked: Arc<ChunkedParser>,
    progress: Arc<ProgressTracker>,
}

struct Completion {
    task: ParsingTask,
    result: Result<ParsedModule>,
    duration: Duration,
}

fn execute(task: &ParsingTask, ctx: &TaskContext) -> Result<ParsedModule> {
    ctx.progress.set_current_file(&task.path);

    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        if task.prefer_chunked {
            ctx.chunked.parse_chunked(&task.path, None)
        } else {
            ctx.chunked.parse_large(&task.path, &ctx.parse_fn, None)
        }
    }));

    match outcome {
        Ok(result) => result,
        Err(payload) => Err(StrataError::internal(format!(
            "parser panicked on {}: {}",
            task.path.display(),
            panic_message(payload.as_ref())
        ))),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn make_job(
    task: ParsingTask,
    reservation: MemoryReservation,
    ctx: Arc<TaskContext>,
    completions: Sender<Completion>,
) -> Job {
    Box::new(move || {
        let start = Instant::now();
        let result = execute(&task, &ctx);
        let duration = start.elapsed();

        // Release before reporting so the coordinator can admit the next task
        drop(reservation);

        let _ = completions.send(Completion {
            task,
            result,
            duration,
        });
    })
}

/// Memory-aware parallel file processor
pub struct ParallelProcessor {
    settings: SchedulerConfig,
    budget: Arc<MemoryBudget>,
    recovery: Arc<ErrorRecoveryManager>,
    progress: Arc<ProgressTracker>,
    chunked: Arc<ChunkedParser>,
}

impl ParallelProcessor {
    pub fn new(
        config: &StrataConfig,
        chunked: Arc<ChunkedParser>,
        progress: Arc<ProgressTracker>,
    ) -> Self {
        Self {
            settings: config.scheduler().clone(),
            budget: MemoryBudget::new(config.memory().max_memory_mb as f64),
            recovery: Arc::new(ErrorRecoveryManager::new()),
            progress,
            chunked,
        }
    }

    /// Replace the memory budget
    pub fn with_budget(mut self, budget: Arc<MemoryBudget>) -> Self {
        self.budget = budget;
        self
    }

    pub fn budget(&self) -> &Arc<MemoryBudget> {
        &self.budget
    }

    pub fn recovery(&self) -> &Arc<ErrorRecoveryManager> {
        &self.recovery
    }

    pub fn progress(&self) -> &Arc<ProgressTracker> {
        &self.progress
    }

    /// Number of workers used for `tasks` tasks
    pub fn worker_cap(&self, tasks: usize) -> usize {
        if !self.settings.parallel_enabled {
            return 1;
        }
        num_cpus::get()
            .min(tasks)
            .min(self.settings.max_workers)
            .max(1)
    }

    /// One task per path, in discovery order
    pub fn build_tasks(&self, paths: &[PathBuf]) -> Vec<ParsingTask> {
        paths
            .iter()
            .map(|path| ParsingTask::from_path(path, self.settings.max_retries))
            .collect()
    }

    /// Parse every file in `paths`
    pub fn process_files(&self, paths: &[PathBuf], parse_fn: ParseFn) -> Result<ProcessingOutcome> {
        let tasks = self.build_tasks(paths);
        self.process_tasks(tasks, parse_fn)
    }

    /// Run prepared tasks to completion.
    ///
    /// Per-file failures are reported in the outcome. Only failures of the
    /// scheduling machinery itself are returned as errors.
    pub fn process_tasks(&self, mut tasks: Vec<ParsingTask>, parse_fn: ParseFn) -> Result<ProcessingOutcome> {
        let total = tasks.len();
        let mut metrics = ProcessingMetrics::new(total);
        let strategy = if self.settings.parallel_enabled {
            select_strategy(&tasks, self.settings.strategy)
        } else {
            ExecutionStrategy::Inline
        };
        let cap = self.worker_cap(total);

        sort_by_priority(&mut tasks);
        let mut queue: VecDeque<ParsingTask> = tasks.into();

        info!(
            "Processing {} files with {} strategy on {} workers",
            total, strategy, cap
        );
        self.progress.reset(total);
        self.budget.reset_peak();
        self.recovery.clear_history();
        let recoveries_before = self.recovery.recovery_count();

        let mut modules = HashMap::with_capacity(total);
        let mut durations = HashMap::with_capacity(total);
        let mut failures = Vec::new();

        if total > 0 {
            let executor = Executor::build(strategy, cap)?;
            let ctx = Arc::new(TaskContext {
                parse_fn,
                chunked: Arc::clone(&self.chunked),
                progress: Arc::clone(&self.progress),
            });
            let (completion_tx, completion_rx) = channel::unbounded::<Completion>();
            let mut in_flight = 0usize;

            loop {
                while in_flight < cap {
                    let Some(next) = queue.front() else {
                        break;
                    };

                    let need = next.memory_estimate_mb();
                    let reservation = match self.budget.try_reserve(need) {
                        Some(reservation) => reservation,
                        None if in_flight == 0 => {
                            warn!(
                                "{} needs {:.1} MB, over the remaining budget; admitting alone",
                                next.path.display(),
                                need
                            );
                            self.budget.reserve_unchecked(need)
                        }
                        None => {
                            debug!(
                                "Deferring {} until memory is released",
                                next.path.display()
                            );
                            break;
                        }
                    };

                    let Some(task) = queue.pop_front() else {
                        break;
                    };
                    let size = task.size;
                    let job = make_job(task, reservation, Arc::clone(&ctx), completion_tx.clone());
                    in_flight += 1;
                    executor.submit(size, job)?;
                }

                if in_flight == 0 {
                    break;
                }

                let completion = completion_rx
                    .recv()
                    .map_err(|_| StrataError::scheduler("completion channel disconnected"))?;
                in_flight -= 1;
                metrics.peak_memory_mb = metrics.peak_memory_mb.max(self.budget.peak_mb());

                let Completion {
                    mut task,
                    result,
                    duration,
                } = completion;

                match result {
                    Ok(module) => {
                        debug!("Parsed {} in {:?}", task.path.display(), duration);
                        durations.insert(task.path.clone(), duration);
                        modules.insert(task.path, module);
                        metrics.processed_files += 1;
                        self.progress.update(1, 0, None);
                    }
                    Err(error) => {
                        if self.recovery.handle_error(&mut task, &error) {
                            queue.push_back(task);
                            continue;
                        }

                        warn!(
                            "Failed to parse {} after {} attempts: {}",
                            task.path.display(),
                            task.attempts(),
                            error
                        );
                        failures.push(FailureRecord {
                            path: task.path.clone(),
                            kind: error.kind(),
                            message: error.to_string(),
                            attempts: task.attempts(),
                        });
                        metrics.failed_files += 1;
                        self.progress.update(0, 1, None);
                    }
                }
            }
        }

        metrics.recovery_count = self.recovery.recovery_count() - recoveries_before;
        metrics.peak_memory_mb = metrics.peak_memory_mb.max(self.budget.peak_mb());
        metrics.finish();

        info!(
            "Processed {} files ({} failed) in {:?}",
            metrics.processed_files,
            metrics.failed_files,
            metrics.duration()
        );

        Ok(ProcessingOutcome {
            modules,
            failures,
            durations,
            metrics,
            strategy,
        })
    }
}

impl fmt::Debug for ParallelProcessor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ParallelProcessor")
            .field("settings", &self.settings)
            .field("budget", &self.budget)
            .finish()
    }
}
