//! Chunked Parsing for Oversized Files
//!
//! Large files are streamed line by line and split into overlapping windows:
//! - a window closes when it reaches the line or byte limit
//! - the split lands on the last line that starts a top-level construct
//!   outside any bracket or string, falling back to the midpoint of the new
//!   lines
//! - the next window starts with the trailing overlap lines of the previous
//!   one, used as context only
//!
//! Each window runs through the shallow extractor and the records are
//! concatenated. A construct split across a window boundary is not stitched.
//!
//! # Examples
//!
//! ```
//! use strata_engine::chunked::{ChunkGenerator, ChunkingPlan};
//!
//! let source: String = (0..30).map(|i| format!("v{} = {}\n", i, i)).collect();
//! let plan = ChunkingPlan { max_lines: 10, overlap_lines: 2, ..Default::default() };
//!
//! let chunks: Vec<_> = ChunkGenerator::new(source.as_bytes(), plan)
//!     .collect::<Result<_, _>>()
//!     .unwrap();
//! assert!(chunks.len() > 1);
//! ```

use crate::memory::MemoryMonitor;
use crate::scheduler::ParseFn;
use crate::shallow::{class_header_name, is_top_level_start, LexState, ShallowExtractor};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::sync::Arc;
use strata_core::config::ChunkingConfig;
use strata_core::{ParsedModule, Result, StrataConfig};
use tracing::debug;

/// Parameters for splitting a large file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkingPlan {
    pub max_bytes: usize,
    pub max_lines: usize,
    pub overlap_lines: usize,
    pub detect_boundaries: bool,
}

impl Default for ChunkingPlan {
    fn default() -> Self {
        Self::from_config(&ChunkingConfig::default())
    }
}

impl ChunkingPlan {
    pub fn from_config(config: &ChunkingConfig) -> Self {
        Self {
            max_bytes: config.chunk_max_bytes,
            max_lines: config.chunk_max_lines,
            overlap_lines: config.chunk_overlap_lines,
            detect_boundaries: config.detect_boundaries,
        }
    }
}

/// One window of a large file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub index: usize,
    /// 0-based index of the first line (inclusive)
    pub start_line: usize,
    /// 0-based index past the last line (exclusive)
    pub end_line: usize,
    pub lines: Vec<String>,
    /// Leading lines carried over from the previous chunk
    pub context_lines: usize,
    /// Top-level class still open at the first line
    pub enclosing_class: Option<String>,
}

impl Chunk {
    /// Bytes of the lines this chunk owns
    pub fn owned_bytes(&self) -> usize {
        self.lines[self.context_lines..]
            .iter()
            .map(|line| line.len() + 1)
            .sum()
    }
}

struct BufferedLine {
    text: String,
    /// Whether a chunk may start at this line
    boundary: bool,
    /// Top-level class open before this line
    open_class: Option<Arc<str>>,
}

/// Streams [`Chunk`]s out of a reader
pub struct ChunkGenerator<R> {
    reader: R,
    plan: ChunkingPlan,
    lex: LexState,
    current_class: Option<Arc<str>>,
    buffer: Vec<BufferedLine>,
    buffer_bytes: usize,
    buffer_start: usize,
    carried: usize,
    next_index: usize,
    finished: bool,
}

impl<R: BufRead> ChunkGenerator<R> {
    pub fn new(reader: R, plan: ChunkingPlan) -> Self {
        Self {
            reader,
            plan,
            lex: LexState::default(),
            current_class: None,
            buffer: Vec::new(),
            buffer_bytes: 0,
            buffer_start: 0,
            carried: 0,
            next_index: 0,
            finished: false,
        }
    }

    fn buffer_full(&self) -> bool {
        self.buffer.len() > self.carried
            && (self.buffer.len() >= self.plan.max_lines || self.buffer_bytes >= self.plan.max_bytes)
    }

    fn split_point(&self) -> usize {
        let len = self.buffer.len();
        if !self.plan.detect_boundaries {
            return len;
        }

        let first_candidate = self.carried + 1;
        if let Some(idx) = (first_candidate..len).rev().find(|&idx| self.buffer[idx].boundary) {
            return idx;
        }

        (self.carried + (len - self.carried) / 2).clamp(first_candidate.min(len), len)
    }

    fn emit(&mut self, split: usize) -> Chunk {
        let rest = self.buffer.split_off(split);
        let emitted = std::mem::replace(&mut self.buffer, rest);

        let start_line = self.buffer_start;
        let end_line = start_line + emitted.len();
        let overlap = self.plan.overlap_lines.min(emitted.len());

        let carried: Vec<BufferedLine> = emitted[emitted.len() - overlap..]
            .iter()
            .map(|line| BufferedLine {
                text: line.text.clone(),
                boundary: line.boundary,
                open_class: line.open_class.clone(),
            })
            .collect();

        let enclosing_class = emitted
            .first()
            .and_then(|line| line.open_class.as_deref())
            .map(str::to_string);

        let chunk = Chunk {
            index: self.next_index,
            start_line,
            end_line,
            lines: emitted.into_iter().map(|line| line.text).collect(),
            context_lines: self.carried,
            enclosing_class,
        };

        let mut buffer = carried;
        buffer.append(&mut self.buffer);
        self.buffer_bytes = buffer.iter().map(|line| line.text.len() + 1).sum();
        self.buffer = buffer;
        self.buffer_start = end_line - overlap;
        self.carried = overlap;
        self.next_index += 1;

        debug!(
            "Chunk {}: lines [{}, {}) with {} context lines",
            chunk.index, chunk.start_line, chunk.end_line, chunk.context_lines
        );
        chunk
    }
}

impl<R: BufRead> Iterator for ChunkGenerator<R> {
    type Item = Result<Chunk>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }

        loop {
            if self.buffer_full() {
                let split = self.split_point();
                return Some(Ok(self.emit(split)));
            }

            let mut line = String::new();
            match self.reader.read_line(&mut line) {
                Ok(0) => {
                    self.finished = true;
                    if self.buffer.len() > self.carried {
                        let len = self.buffer.len();
                        return Some(Ok(self.emit(len)));
                    }
                    return None;
                }
                Ok(_) => {
                    let text = line.trim_end_matches(['\n', '\r']).to_string();
                    let boundary = self.lex.at_statement_start() && is_top_level_start(&text);
                    self.lex.advance(&text);

                    let open_class = self.current_class.clone();
                    if boundary && !text.starts_with('#') {
                        self.current_class = class_header_name(&text).map(Arc::from);
                    }

                    self.buffer_bytes += text.len() + 1;
                    self.buffer.push(BufferedLine {
                        text,
                        boundary,
                        open_class,
                    });
                }
                Err(e) => {
                    self.finished = true;
                    return Some(Err(e.into()));
                }
            }
        }
    }
}

/// Progress of a chunked parse
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChunkProgress {
    pub chunk: usize,
    pub end_line: usize,
    /// Share of the file's bytes processed, 0.0..=1.0
    pub fraction: f64,
}

/// Parser that splits files above a size threshold into chunks
pub struct ChunkedParser {
    plan: ChunkingPlan,
    threshold_bytes: u64,
    extractor: ShallowExtractor,
    monitor: Arc<MemoryMonitor>,
}

impl ChunkedParser {
    pub fn new(plan: ChunkingPlan, threshold_bytes: u64, monitor: Arc<MemoryMonitor>) -> Self {
        Self {
            plan,
            threshold_bytes,
            extractor: ShallowExtractor::new(),
            monitor,
        }
    }

    pub fn from_config(config: &StrataConfig, monitor: Arc<MemoryMonitor>) -> Self {
        Self::new(
            ChunkingPlan::from_config(config.chunking()),
            config.chunking().large_file_threshold_bytes,
            monitor,
        )
    }

    pub fn plan(&self) -> &ChunkingPlan {
        &self.plan
    }

    pub fn should_chunk(&self, size: u64) -> bool {
        size > self.threshold_bytes
    }

    /// Parse `path`, chunking it when it is above the size threshold.
    pub fn parse_large(
        &self,
        path: &Path,
        parse_fn: &ParseFn,
        progress: Option<&dyn Fn(ChunkProgress)>,
    ) -> Result<ParsedModule> {
        let size = std::fs::metadata(path)?.len();
        if !self.should_chunk(size) {
            return parse_fn(path);
        }
        self.parse_chunked(path, progress)
    }

    /// Parse `path` in chunks regardless of its size.
    pub fn parse_chunked(
        &self,
        path: &Path,
        progress: Option<&dyn Fn(ChunkProgress)>,
    ) -> Result<ParsedModule> {
        let label = format!("chunked parse of {}", path.display());
        self.monitor.scope(&label, || self.merge_chunks(path, progress))
    }

    fn merge_chunks(
        &self,
        path: &Path,
        progress: Option<&dyn Fn(ChunkProgress)>,
    ) -> Result<ParsedModule> {
        let file = File::open(path)?;
        let total_bytes = file.metadata()?.len().max(1) as f64;
        let generator = ChunkGenerator::new(BufReader::new(file), self.plan);

        let mut merged = ParsedModule::new(path);
        let mut chunk_count = 0;
        let mut line_count = 0;
        let mut bytes_done = 0usize;

        for chunk in generator {
            let chunk = chunk?;
            let records = self.extractor.extract(
                path,
                &chunk.lines,
                chunk.start_line + 1,
                chunk.context_lines,
                chunk.enclosing_class.as_deref(),
            );

            for (class_name, method) in records.continued_methods {
                if let Some(class) = merged.classes.iter_mut().rev().find(|c| c.name == class_name) {
                    class.methods.push(method);
                }
            }
            merged.extend(records.module);

            chunk_count += 1;
            line_count = chunk.end_line;
            bytes_done += chunk.owned_bytes();

            if let Some(report) = progress {
                report(ChunkProgress {
                    chunk: chunk.index,
                    end_line: chunk.end_line,
                    fraction: (bytes_done as f64 / total_bytes).min(1.0),
                });
            }
        }

        merged.line_count = line_count;
        merged.chunk_count = chunk_count.max(1);

        debug!(
            "{}: merged {} chunks, {} definitions",
            path.display(),
            merged.chunk_count,
            merged.definition_count()
        );
        Ok(merged)
    }
}

impl std::fmt::Debug for ChunkedParser {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkedParser")
            .field("plan", &self.plan)
            .field("threshold_bytes", &self.threshold_bytes)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use tempfile::TempDir;

    fn flat_source(lines: usize) -> String {
        (0..lines).map(|i| format!("value_{} = {}\n", i, i)).collect()
    }

    fn plan(max_lines: usize, overlap_lines: usize) -> ChunkingPlan {
        ChunkingPlan {
            max_bytes: usize::MAX,
            max_lines,
            overlap_lines,
            detect_boundaries: true,
        }
    }

    fn chunks_of(source: &str, plan: ChunkingPlan) -> Vec<Chunk> {
        ChunkGenerator::new(source.as_bytes(), plan)
            .collect::<Result<Vec<_>>>()
            .unwrap()
    }

    #[test]
    fn test_three_chunks_with_overlap() {
        let chunks = chunks_of(&flat_source(2500), plan(1000, 10));

        assert_eq!(chunks.len(), 3);
        let ranges: Vec<_> = chunks.iter().map(|c| (c.start_line, c.end_line)).collect();
        assert_eq!(ranges, vec![(0, 999), (989, 1988), (1978, 2500)]);

        for pair in chunks.windows(2) {
            let previous = &pair[0].lines;
            let next = &pair[1].lines;
            assert_eq!(&next[..10], &previous[previous.len() - 10..]);
            assert_eq!(pair[1].context_lines, 10);
        }
    }

    #[test]
    fn test_split_avoids_open_brackets() {
        let mut source = String::new();
        for i in 0..6 {
            source.push_str(&format!("def f{}():\n    pass\n", i));
        }
        source.push_str("CONFIG = {\n'a': 1,\n'b': 2,\n}\n");

        // 16 lines; window of 15 lands inside the dict literal
        let chunks = chunks_of(&source, plan(15, 0));

        assert_eq!(chunks[0].end_line, 12);
        assert_eq!(chunks[0].lines.last().unwrap(), "    pass");
        assert_eq!(chunks[1].lines[0], "CONFIG = {");
    }

    #[test]
    fn test_midpoint_without_boundary() {
        let mut source = String::from("def big():\n");
        for i in 0..19 {
            source.push_str(&format!("    x{} = {}\n", i, i));
        }

        let chunks = chunks_of(&source, plan(10, 0));
        assert_eq!(chunks[0].end_line, 5);
        assert_eq!(chunks.last().unwrap().end_line, 20);
    }

    #[test]
    fn test_boundary_detection_disabled() {
        let mut plan = plan(10, 2);
        plan.detect_boundaries = false;
        let chunks = chunks_of(&flat_source(25), plan);

        let ranges: Vec<_> = chunks.iter().map(|c| (c.start_line, c.end_line)).collect();
        assert_eq!(ranges, vec![(0, 10), (8, 18), (16, 25)]);
    }

    #[test]
    fn test_byte_limit() {
        let plan = ChunkingPlan {
            max_bytes: 64,
            max_lines: 1000,
            overlap_lines: 0,
            detect_boundaries: false,
        };
        let chunks = chunks_of(&flat_source(40), plan);
        assert!(chunks.len() > 1);
        assert!(chunks.iter().all(|c| c.owned_bytes() <= 64 + 16));
    }

    #[test]
    fn test_parse_large_merges_chunks() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("big.py");

        let mut source = String::from("import os\n\nclass Big:\n");
        for i in 0..30 {
            source.push_str(&format!("    def m{}(self):\n        return {}\n", i, i));
        }
        for i in 0..10 {
            source.push_str(&format!("def top{}():\n    pass\n", i));
        }
        std::fs::write(&path, &source).unwrap();

        let monitor = Arc::new(MemoryMonitor::with_probe(f64::MAX, Box::new(|| 0.0)));
        let parser = ChunkedParser::new(plan(20, 3), 100, monitor);
        let parse_fn: ParseFn =
            Arc::new(|_: &Path| -> Result<ParsedModule> { panic!("small-file path used") });

        let seen = Mutex::new(Vec::new());
        let report: &dyn Fn(ChunkProgress) = &|p| seen.lock().push(p);
        let module = parser.parse_large(&path, &parse_fn, Some(report)).unwrap();

        assert!(module.chunk_count > 1);
        assert_eq!(module.line_count, 83);
        assert_eq!(module.imports.len(), 1);
        assert_eq!(module.classes.len(), 1);
        assert_eq!(module.classes[0].methods.len(), 30);
        assert_eq!(module.functions.len(), 10);
        assert_eq!(module.functions[0].line, 64);
        assert!(module.functions.iter().all(|f| f.name.starts_with("top")));

        let seen = seen.lock();
        assert_eq!(seen.len(), module.chunk_count);
        assert_eq!(seen.last().unwrap().fraction, 1.0);
    }

    #[test]
    fn test_small_file_delegates() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("small.py");
        std::fs::write(&path, "x = 1\n").unwrap();

        let monitor = Arc::new(MemoryMonitor::with_probe(f64::MAX, Box::new(|| 0.0)));
        let parser = ChunkedParser::new(ChunkingPlan::default(), 1024, monitor);
        let parse_fn: ParseFn = Arc::new(|path: &Path| -> Result<ParsedModule> {
            let mut module = ParsedModule::new(path);
            module.line_count = 42;
            Ok(module)
        });

        let module = parser.parse_large(&path, &parse_fn, None).unwrap();
        assert_eq!(module.line_count, 42);
        assert_eq!(module.chunk_count, 1);
    }
}
