//! Command implementations.

use crate::output::{self, OutputFormat};
use anyhow::{bail, Context, Result};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use strata_core::config::default_config_path;
use strata_core::{Strategy, StrataConfig};
use strata_engine::cache::{CacheStats, ContentHashCache};
use strata_engine::export::{ExportSummary, JsonLinesExporter};
use strata_engine::metrics::ProcessingMetrics;
use strata_engine::orchestrator::{Orchestrator, PipelineReport, StageTiming};
use strata_engine::progress::ProgressEvent;
use strata_engine::scheduler::{ExecutionStrategy, FailureRecord};
use strata_engine::ShallowExtractor;
use tracing::debug;

/// Command-line overrides applied on top of the loaded configuration
#[derive(Debug, Default)]
pub struct RunOptions {
    pub paths: Vec<PathBuf>,
    pub no_cache: bool,
    pub sequential: bool,
    pub workers: Option<usize>,
    pub strategy: Option<Strategy>,
    pub output: Option<PathBuf>,
}

impl RunOptions {
    fn apply(&self, config: &mut StrataConfig) -> Result<()> {
        if self.no_cache {
            config.cache_mut().enabled = false;
        }
        if self.sequential {
            config.scheduler_mut().parallel_enabled = false;
        }
        if let Some(workers) = self.workers {
            config.scheduler_mut().max_workers = workers;
        }
        if let Some(strategy) = self.strategy {
            config.scheduler_mut().strategy = strategy;
        }
        config.validate().context("Invalid command-line overrides")?;
        Ok(())
    }
}

#[derive(Serialize)]
struct RunSummary<'a> {
    modules: usize,
    relationships: usize,
    parsed: &'a [PathBuf],
    strategy: ExecutionStrategy,
    metrics: &'a ProcessingMetrics,
    cache: Option<&'a CacheStats>,
    failures: &'a [FailureRecord],
    stages: &'a [StageTiming],
    export: &'a ExportSummary,
}

impl<'a> From<&'a PipelineReport> for RunSummary<'a> {
    fn from(report: &'a PipelineReport) -> Self {
        Self {
            modules: report.modules.len(),
            relationships: report.relationships.len(),
            parsed: &report.parsed,
            strategy: report.strategy,
            metrics: &report.metrics,
            cache: report.cache_stats.as_ref(),
            failures: &report.failures,
            stages: &report.stage_timings,
            export: &report.export,
        }
    }
}

/// Analyze the given paths
pub fn run(mut config: StrataConfig, options: RunOptions, format: OutputFormat) -> Result<()> {
    options.apply(&mut config)?;

    let roots = if options.paths.is_empty() {
        vec![std::env::current_dir().context("Failed to resolve current directory")?]
    } else {
        options.paths.clone()
    };

    let mut orchestrator = Orchestrator::new(&config)?;
    if let Some(path) = &options.output {
        orchestrator = orchestrator.with_exporter(Box::new(JsonLinesExporter::new(path)));
    }

    let listener = if format == OutputFormat::Human {
        let pb = output::progress_bar()?;
        let bar = pb.clone();
        let listener = orchestrator.progress().spawn_listener(
            Arc::new(move |event: &ProgressEvent| match event {
                ProgressEvent::Progress(snapshot) => {
                    bar.set_length(snapshot.total as u64);
                    bar.set_position((snapshot.completed + snapshot.failed) as u64);
                }
                ProgressEvent::StageStarted { stage } => bar.set_message(stage.clone()),
                ProgressEvent::StageCompleted { .. } => {}
            }),
            1024,
        )?;
        Some((pb, listener))
    } else {
        None
    };

    let result = orchestrator.run(&roots, ShallowExtractor::parse_fn());

    if let Some((pb, listener)) = listener {
        listener.finish();
        pb.finish_and_clear();
    }
    let report = result?;

    match format {
        OutputFormat::Json => output::json(&RunSummary::from(&report)),
        OutputFormat::Human => {
            print_report(&report);
            Ok(())
        }
    }
}

fn print_report(report: &PipelineReport) {
    let metrics = &report.metrics;

    output::header("Run summary");
    output::kv("Files", metrics.total_files);
    output::kv("Parsed", metrics.processed_files);
    output::kv("From cache", metrics.skipped_files);
    output::kv("Failed", metrics.failed_files);
    output::kv("Strategy", report.strategy);
    output::kv("Relationships", report.relationships.len());
    output::kv("Success rate", format!("{:.1}%", metrics.success_rate()));
    output::kv("Duration", output::format_duration(metrics.duration()));
    output::kv("Throughput", format!("{:.1} files/s", metrics.throughput()));
    output::kv("Peak admitted memory", format!("{:.1} MB", metrics.peak_memory_mb));

    if let Some(stats) = &report.cache_stats {
        output::kv(
            "Cache",
            format!(
                "{} hits, {} misses ({:.1}%), {} saved",
                stats.hits,
                stats.misses,
                stats.hit_rate,
                output::format_duration(stats.time_saved)
            ),
        );
    }

    if let Some(destination) = &report.export.destination {
        output::kv(
            "Export",
            format!(
                "{} ({})",
                destination.display(),
                output::format_bytes(report.export.bytes_written)
            ),
        );
    }

    let mut stages = output::table(["Stage", "Duration"]);
    for timing in &report.stage_timings {
        stages.add_row(vec![
            timing.stage.to_string(),
            format!("{:.1} ms", timing.duration.as_secs_f64() * 1000.0),
        ]);
    }
    println!("{}", stages);

    if report.failures.is_empty() {
        output::success(format!("Analyzed {} modules", report.modules.len()));
        return;
    }

    output::warning(format!("{} files failed", report.failures.len()));
    let mut failures = output::table(["File", "Kind", "Attempts", "Error"]);
    for failure in &report.failures {
        failures.add_row(vec![
            failure.path.display().to_string(),
            failure.kind.as_str().to_string(),
            failure.attempts.to_string(),
            failure.message.clone(),
        ]);
    }
    println!("{}", failures);
}

fn open_cache(config: &StrataConfig) -> Result<ContentHashCache> {
    ContentHashCache::from_config(config).with_context(|| {
        format!(
            "Failed to open cache at {}",
            config.cache().directory.display()
        )
    })
}

#[derive(Serialize)]
struct CacheOverview<'a> {
    directory: &'a Path,
    entries: usize,
    disk_bytes: u64,
    config_digest: &'a str,
}

pub fn cache_stats(config: &StrataConfig, format: OutputFormat) -> Result<()> {
    let cache = open_cache(config)?;
    let stats = cache.get_cache_stats();
    let overview = CacheOverview {
        directory: cache.directory(),
        entries: stats.total_cached_files,
        disk_bytes: stats.disk_bytes,
        config_digest: cache.config_digest(),
    };

    match format {
        OutputFormat::Json => output::json(&overview),
        OutputFormat::Human => {
            output::header("Cache");
            output::kv("Directory", overview.directory.display());
            output::kv("Entries", overview.entries);
            output::kv("Size on disk", output::format_bytes(overview.disk_bytes));
            output::kv("Config digest", &overview.config_digest[..12.min(overview.config_digest.len())]);
            Ok(())
        }
    }
}

pub fn cache_clean(config: &StrataConfig, max_age_days: Option<u64>) -> Result<()> {
    let days = max_age_days.unwrap_or(config.cache().stale_max_age_days);
    let removed = open_cache(config)?.cleanup_stale_cache(days)?;
    output::success(format!(
        "Removed {} entries older than {} days",
        removed, days
    ));
    Ok(())
}

pub fn cache_invalidate(config: &StrataConfig, paths: &[PathBuf]) -> Result<()> {
    let cache = open_cache(config)?;
    for path in paths {
        if cache.invalidate_file(path) {
            output::success(format!("Invalidated {}", path.display()));
        } else {
            output::warning(format!("{} was not cached", path.display()));
        }
    }
    cache.flush()?;
    Ok(())
}

pub fn cache_clear(config: &StrataConfig, yes: bool) -> Result<()> {
    let cache = open_cache(config)?;
    if !yes
        && !output::confirm(format!(
            "Remove all {} cached entries from {}?",
            cache.len(),
            cache.directory().display()
        ))?
    {
        output::warning("Aborted");
        return Ok(());
    }

    cache.clear()?;
    output::success("Cache cleared");
    Ok(())
}

/// Write the default configuration to `path` (or the default location)
pub fn config_init(path: Option<PathBuf>, force: bool) -> Result<()> {
    let path = match path.or_else(default_config_path) {
        Some(path) => path,
        None => bail!("No configuration directory available, pass --path"),
    };

    if path.exists() && !force {
        bail!(
            "Configuration already exists at {} (use --force to overwrite)",
            path.display()
        );
    }

    StrataConfig::default().save_to_path(&path)?;
    output::success(format!("Wrote default configuration to {}", path.display()));
    Ok(())
}

pub fn config_show(config: &StrataConfig, format: OutputFormat) -> Result<()> {
    debug!("Showing effective configuration");
    match format {
        OutputFormat::Json => output::json(config),
        OutputFormat::Human => {
            print!("{}", config.export_toml()?);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_run_options_override_config() {
        let mut config = StrataConfig::default();
        let options = RunOptions {
            no_cache: true,
            sequential: true,
            workers: Some(2),
            strategy: Some(Strategy::Hybrid),
            ..Default::default()
        };

        options.apply(&mut config).unwrap();
        assert!(!config.cache().enabled);
        assert!(!config.scheduler().parallel_enabled);
        assert_eq!(config.scheduler().max_workers, 2);
        assert_eq!(config.scheduler().strategy, Strategy::Hybrid);
    }

    #[test]
    fn test_zero_workers_rejected() {
        let mut config = StrataConfig::default();
        let options = RunOptions {
            workers: Some(0),
            ..Default::default()
        };
        assert!(options.apply(&mut config).is_err());
    }

    #[test]
    fn test_config_init_refuses_overwrite() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("strata.toml");

        config_init(Some(path.clone()), false).unwrap();
        assert!(StrataConfig::load_from_path(&path).is_ok());
        assert!(config_init(Some(path.clone()), false).is_err());
        assert!(config_init(Some(path), true).is_ok());
    }

    #[test]
    fn test_run_writes_export() {
        let temp = TempDir::new().unwrap();
        let src = temp.path().join("src");
        std::fs::create_dir_all(&src).unwrap();
        std::fs::write(src.join("app.py"), "def main():\n    pass\n").unwrap();

        let mut config = StrataConfig::default();
        config.cache_mut().directory = temp.path().join("cache");
        let output = temp.path().join("graph.jsonl");

        let options = RunOptions {
            paths: vec![src],
            output: Some(output.clone()),
            ..Default::default()
        };
        run(config, options, OutputFormat::Json).unwrap();
        assert!(output.exists());
    }
}
