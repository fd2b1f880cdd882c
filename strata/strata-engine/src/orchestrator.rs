//! Staged incremental pipeline.
//!
//! A run goes through discover, diff, parse, merge, extract, persist and
//! export in that order. Each stage is announced on the [`ProgressTracker`]
//! with `StageStarted`/`StageCompleted` events and timed in the report.

use crate::cache::{CacheStats, ContentHashCache};
use crate::chunked::ChunkedParser;
use crate::discovery::FileDiscovery;
use crate::export::{ExportSummary, Exporter, NullExporter};
use crate::extract::{ModuleRelationshipExtractor, RelationshipExtractor};
use crate::memory::MemoryMonitor;
use crate::metrics::ProcessingMetrics;
use crate::progress::ProgressTracker;
use crate::scheduler::{ExecutionStrategy, FailureRecord, ParallelProcessor, ParseFn};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use strata_core::{ParsedModule, Relationship, Result, StrataConfig};
use tracing::{debug, info, warn};

/// Pipeline stages, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Discover,
    Diff,
    Parse,
    Merge,
    Extract,
    Persist,
    Export,
}

impl Stage {
    pub const ALL: [Stage; 7] = [
        Stage::Discover,
        Stage::Diff,
        Stage::Parse,
        Stage::Merge,
        Stage::Extract,
        Stage::Persist,
        Stage::Export,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Discover => "discover",
            Self::Diff => "diff",
            Self::Parse => "parse",
            Self::Merge => "merge",
            Self::Extract => "extract",
            Self::Persist => "persist",
            Self::Export => "export",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StageTiming {
    pub stage: Stage,
    pub duration: Duration,
}

/// Everything a pipeline run produced
#[derive(Debug, Clone)]
pub struct PipelineReport {
    pub modules: BTreeMap<PathBuf, ParsedModule>,
    pub relationships: Vec<Relationship>,
    pub failures: Vec<FailureRecord>,
    pub metrics: ProcessingMetrics,
    pub cache_stats: Option<CacheStats>,
    pub stage_timings: Vec<StageTiming>,
    pub strategy: ExecutionStrategy,
    pub export: ExportSummary,
    /// Files that went through the parser this run
    pub parsed: Vec<PathBuf>,
}

impl PipelineReport {
    pub fn stage_duration(&self, stage: Stage) -> Option<Duration> {
        self.stage_timings
            .iter()
            .find(|timing| timing.stage == stage)
            .map(|timing| timing.duration)
    }
}

/// Runs the incremental pipeline over a set of roots
pub struct Orchestrator {
    cache: Option<Arc<ContentHashCache>>,
    processor: ParallelProcessor,
    discovery: FileDiscovery,
    extractor: Box<dyn RelationshipExtractor>,
    exporter: Box<dyn Exporter>,
    progress: Arc<ProgressTracker>,
    monitor: Arc<MemoryMonitor>,
}

impl Orchestrator {
    /// Build a pipeline from `config`, monitoring the process RSS
    pub fn new(config: &StrataConfig) -> Result<Self> {
        let monitor = Arc::new(MemoryMonitor::new(
            config.memory().cleanup_threshold_mb as f64,
        ));
        Self::with_monitor(config, monitor)
    }

    /// Build a pipeline around an existing memory monitor.
    ///
    /// When the cache is enabled its in-memory payloads are released on every
    /// monitor cleanup.
    pub fn with_monitor(config: &StrataConfig, monitor: Arc<MemoryMonitor>) -> Result<Self> {
        config.validate()?;

        let cache = if config.cache().enabled {
            let cache = Arc::new(ContentHashCache::from_config(config)?);
            let weak = Arc::downgrade(&cache);
            monitor.register_cleanup(Arc::new(move || {
                if let Some(cache) = weak.upgrade() {
                    cache.clear_memory();
                }
            }));
            Some(cache)
        } else {
            None
        };

        let progress = ProgressTracker::new(0);
        let chunked = Arc::new(ChunkedParser::from_config(config, Arc::clone(&monitor)));
        let processor = ParallelProcessor::new(config, chunked, Arc::clone(&progress));

        Ok(Self {
            cache,
            processor,
            discovery: FileDiscovery::new(config.discovery())?,
            extractor: Box::new(ModuleRelationshipExtractor::new()),
            exporter: Box::new(NullExporter),
            progress,
            monitor,
        })
    }

    pub fn with_extractor(mut self, extractor: Box<dyn RelationshipExtractor>) -> Self {
        self.extractor = extractor;
        self
    }

    pub fn with_exporter(mut self, exporter: Box<dyn Exporter>) -> Self {
        self.exporter = exporter;
        self
    }

    pub fn progress(&self) -> &Arc<ProgressTracker> {
        &self.progress
    }

    pub fn cache(&self) -> Option<&Arc<ContentHashCache>> {
        self.cache.as_ref()
    }

    pub fn monitor(&self) -> &Arc<MemoryMonitor> {
        &self.monitor
    }

    pub fn processor(&self) -> &ParallelProcessor {
        &self.processor
    }

    fn stage<T>(
        &self,
        stage: Stage,
        timings: &mut Vec<StageTiming>,
        f: impl FnOnce() -> Result<T>,
    ) -> Result<T> {
        self.progress.begin_stage(stage.as_str());
        let start = Instant::now();
        let result = f();
        let duration = start.elapsed();
        self.progress.end_stage(stage.as_str(), duration);
        timings.push(StageTiming { stage, duration });
        debug!("Stage {} finished in {:?}", stage, duration);
        result
    }

    /// Run every stage over `roots`, parsing changed files with `parse_fn`.
    ///
    /// Files that keep failing are reported in `failures` and left out of the
    /// merged set. Discovery, cache flush and export failures abort the run.
    pub fn run(&self, roots: &[PathBuf], parse_fn: ParseFn) -> Result<PipelineReport> {
        let started_at = Utc::now();
        let mut timings = Vec::with_capacity(Stage::ALL.len());

        let files = self.stage(Stage::Discover, &mut timings, || {
            self.discovery.discover(roots)
        })?;
        info!("Discovered {} source files", files.len());

        let (changed, cached) = self.stage(Stage::Diff, &mut timings, || {
            Ok(self.diff(&files))
        })?;
        info!(
            "{} files changed, {} served from cache",
            changed.len(),
            cached.len()
        );

        let outcome = self.stage(Stage::Parse, &mut timings, || {
            self.processor.process_files(&changed, parse_fn)
        })?;

        let parsed: Vec<PathBuf> = {
            let mut parsed: Vec<PathBuf> = outcome.modules.keys().cloned().collect();
            parsed.sort();
            parsed
        };
        let cached_count = cached.len();
        let modules = self.stage(Stage::Merge, &mut timings, || {
            let mut merged: BTreeMap<PathBuf, ParsedModule> = cached;
            merged.extend(outcome.modules.clone());
            Ok(merged)
        })?;

        let relationships = self.stage(Stage::Extract, &mut timings, || {
            Ok(self.extractor.extract(&modules))
        })?;
        info!("Extracted {} relationships", relationships.len());

        self.stage(Stage::Persist, &mut timings, || {
            self.persist(&parsed, &modules, &relationships, &outcome.durations)
        })?;

        let export = self.stage(Stage::Export, &mut timings, || {
            debug!("Exporting with {}", self.exporter.name());
            self.exporter.export(&modules, &relationships)
        })?;

        let mut metrics = outcome.metrics;
        metrics.started_at = started_at;
        metrics.total_files = files.len();
        metrics.skipped_files = cached_count;
        metrics.finish();

        info!(
            "Pipeline finished: {} modules ({} parsed, {} cached, {} failed) in {:?}",
            modules.len(),
            metrics.processed_files,
            metrics.skipped_files,
            metrics.failed_files,
            metrics.duration()
        );

        Ok(PipelineReport {
            modules,
            relationships,
            failures: outcome.failures,
            metrics,
            cache_stats: self.cache.as_ref().map(|cache| cache.get_cache_stats()),
            stage_timings: timings,
            strategy: outcome.strategy,
            export,
            parsed,
        })
    }

    /// Split `files` into those to parse and the modules loaded from cache
    fn diff(&self, files: &[PathBuf]) -> (Vec<PathBuf>, BTreeMap<PathBuf, ParsedModule>) {
        let Some(cache) = &self.cache else {
            return (files.to_vec(), BTreeMap::new());
        };

        let (mut changed, unchanged) = cache.get_changed_files(files);
        let mut loaded = cache.bulk_load_unchanged(&unchanged);

        let mut cached = BTreeMap::new();
        for path in unchanged {
            match loaded.remove(&path) {
                Some(entry) => {
                    cached.insert(path, entry.module);
                }
                None => changed.push(path),
            }
        }

        changed.sort();
        (changed, cached)
    }

    fn persist(
        &self,
        parsed: &[PathBuf],
        modules: &BTreeMap<PathBuf, ParsedModule>,
        relationships: &[Relationship],
        durations: &HashMap<PathBuf, Duration>,
    ) -> Result<()> {
        let Some(cache) = &self.cache else {
            debug!("Cache disabled, nothing to persist");
            return Ok(());
        };

        let mut by_source: HashMap<&Path, Vec<Relationship>> = HashMap::new();
        for relationship in relationships {
            by_source
                .entry(relationship.source_path.as_path())
                .or_default()
                .push(relationship.clone());
        }

        let mut stored = 0;
        for path in parsed {
            let Some(module) = modules.get(path) else {
                continue;
            };
            let edges = by_source
                .get(module.path.as_path())
                .map(Vec::as_slice)
                .unwrap_or_default();
            let duration = durations.get(path).copied().unwrap_or_default();

            match cache.store_result(path, module, edges, duration) {
                Ok(_) => stored += 1,
                Err(e) => warn!("Failed to cache {}: {}", path.display(), e),
            }
        }

        cache.flush()?;
        debug!("Persisted {} parse results", stored);
        Ok(())
    }
}
