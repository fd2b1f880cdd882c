//! Strata Engine - incremental parallel parsing.
//!
//! This crate provides:
//! - Memory-aware parallel task scheduling with retry and recovery
//! - A content-hash cache that skips unchanged files across runs
//! - Chunked parsing for oversized files
//! - Relationship extraction and export over the merged module set
//! - A staged [`Orchestrator`] that ties the pieces together
//!
//! # Examples
//!
//! ```no_run
//! use strata_engine::prelude::*;
//! use std::path::PathBuf;
//!
//! let config = StrataConfig::default();
//! let orchestrator = Orchestrator::new(&config)?;
//! let report = orchestrator.run(&[PathBuf::from("src")], ShallowExtractor::parse_fn())?;
//! println!("{} modules, {} relationships", report.modules.len(), report.relationships.len());
//! # Ok::<(), strata_core::StrataError>(())
//! ```

pub mod cache;
pub mod chunked;
pub mod discovery;
pub mod export;
pub mod extract;
pub mod memory;
pub mod metrics;
pub mod orchestrator;
pub mod progress;
pub mod recovery;
pub mod scheduler;
pub mod shallow;
pub mod task;

pub use cache::{CacheEntry, CacheStats, ContentHashCache, FileHash};
pub use chunked::{ChunkedParser, ChunkingPlan};
pub use discovery::FileDiscovery;
pub use export::{ExportSummary, Exporter, JsonLinesExporter, NullExporter};
pub use extract::{ModuleRelationshipExtractor, RelationshipExtractor};
pub use memory::{MemoryBudget, MemoryMonitor};
pub use metrics::ProcessingMetrics;
pub use orchestrator::{Orchestrator, PipelineReport, Stage};
pub use progress::{ProgressEvent, ProgressSnapshot, ProgressTracker};
pub use recovery::ErrorRecoveryManager;
pub use scheduler::{ExecutionStrategy, ParallelProcessor, ParseFn};
pub use shallow::ShallowExtractor;
pub use task::ParsingTask;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::cache::{CacheStats, ContentHashCache};
    pub use crate::export::{Exporter, JsonLinesExporter, NullExporter};
    pub use crate::extract::{ModuleRelationshipExtractor, RelationshipExtractor};
    pub use crate::orchestrator::{Orchestrator, PipelineReport, Stage};
    pub use crate::progress::{ProgressEvent, ProgressTracker};
    pub use crate::scheduler::{ParallelProcessor, ParseFn};
    pub use crate::shallow::ShallowExtractor;
    pub use strata_core::prelude::*;
}
