//! Content-Hash Cache
//!
//! Persists parse results across runs so unchanged files are skipped:
//! - `index.json` maps each absolute path to its [`FileHash`] and the config
//!   digest it was produced under
//! - `entries/<blake3(path)>.json` holds the full [`CacheEntry`]
//! - recently used payloads are kept in an in-memory LRU
//!
//! An entry is served only while the digest recomputed from disk matches the
//! stored one and the config digest matches the active one. Unreadable
//! payloads are deleted and reported as misses.
//!
//! # Examples
//!
//! ```no_run
//! use strata_engine::cache::ContentHashCache;
//! use strata_core::ParsedModule;
//! use std::path::Path;
//! use std::time::Duration;
//!
//! let cache = ContentHashCache::open(Path::new(".strata/cache"), "digest", 128)?;
//! let path = Path::new("src/app.py");
//!
//! if cache.has_changed(path) {
//!     let module = ParsedModule::new(path);
//!     cache.store_result(path, &module, &[], Duration::from_millis(4))?;
//! }
//! cache.flush()?;
//! # Ok::<(), strata_core::StrataError>(())
//! ```

use chrono::{DateTime, Utc};
use lru::LruCache;
use parking_lot::{Mutex, RwLock};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use strata_core::config::CACHE_FORMAT_VERSION;
use strata_core::{ParsedModule, Relationship, Result, StrataConfig, StrataError};
use tracing::{debug, info, warn};

pub const INDEX_FILE: &str = "index.json";
pub const ENTRIES_DIR: &str = "entries";

const DEFAULT_PAYLOAD_ENTRIES: usize = 256;

/// Content fingerprint of one file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileHash {
    /// Absolute path
    pub path: PathBuf,
    /// blake3 digest of the file bytes (hex)
    pub digest: String,
    pub size: u64,
    pub mtime: Option<DateTime<Utc>>,
    pub parsed_at: DateTime<Utc>,
    pub parse_duration_micros: u64,
    pub relationship_count: usize,
}

impl FileHash {
    pub fn parse_duration(&self) -> Duration {
        Duration::from_micros(self.parse_duration_micros)
    }
}

/// Provenance of a stored entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheMetadata {
    pub cached_at: DateTime<Utc>,
    pub format_version: u32,
    pub config_digest: String,
}

/// A stored parse result
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub hash: FileHash,
    pub module: ParsedModule,
    #[serde(default)]
    pub relationships: Vec<Relationship>,
    pub metadata: CacheMetadata,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct IndexRecord {
    hash: FileHash,
    cached_at: DateTime<Utc>,
    config_digest: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct IndexFile {
    version: u32,
    entries: Vec<IndexRecord>,
}

/// Cache effectiveness counters
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub total_cached_files: usize,
    /// `hits / (hits + misses) * 100`, 0 when nothing was looked up
    pub hit_rate: f64,
    /// Sum of the recorded parse durations of every hit
    pub time_saved: Duration,
    pub disk_bytes: u64,
}

/// Hit rate in percent for the given counters
pub fn hit_rate(hits: u64, misses: u64) -> f64 {
    let total = hits + misses;
    if total == 0 {
        0.0
    } else {
        (hits as f64 / total as f64) * 100.0
    }
}

/// Persistent cache of parse results keyed by content hash
pub struct ContentHashCache {
    dir: PathBuf,
    config_digest: String,
    index: RwLock<HashMap<PathBuf, IndexRecord>>,
    payloads: Mutex<LruCache<PathBuf, CacheEntry>>,
    hits: AtomicU64,
    misses: AtomicU64,
    time_saved_micros: AtomicU64,
    temp_counter: AtomicU64,
    dirty: AtomicBool,
}

impl ContentHashCache {
    /// Open (or create) a cache rooted at `dir`.
    ///
    /// An index with a different format version or unreadable JSON is
    /// discarded with a warning.
    pub fn open(dir: &Path, config_digest: impl Into<String>, payload_entries: usize) -> Result<Self> {
        fs::create_dir_all(dir.join(ENTRIES_DIR))?;

        let index = load_index(&dir.join(INDEX_FILE));
        let capacity = NonZeroUsize::new(payload_entries)
            .or_else(|| NonZeroUsize::new(DEFAULT_PAYLOAD_ENTRIES))
            .ok_or_else(|| StrataError::internal("payload cache capacity is zero"))?;

        debug!(
            "Opened cache at {} with {} indexed files",
            dir.display(),
            index.len()
        );

        Ok(Self {
            dir: dir.to_path_buf(),
            config_digest: config_digest.into(),
            index: RwLock::new(index),
            payloads: Mutex::new(LruCache::new(capacity)),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            time_saved_micros: AtomicU64::new(0),
            temp_counter: AtomicU64::new(0),
            dirty: AtomicBool::new(false),
        })
    }

    /// Open the cache described by `config`
    pub fn from_config(config: &StrataConfig) -> Result<Self> {
        Self::open(
            &config.cache().directory,
            config.config_digest(),
            config.cache().payload_cache_entries,
        )
    }

    pub fn directory(&self) -> &Path {
        &self.dir
    }

    pub fn config_digest(&self) -> &str {
        &self.config_digest
    }

    /// Number of indexed files
    pub fn len(&self) -> usize {
        self.index.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.read().is_empty()
    }

    /// Indexed absolute paths, sorted
    pub fn cached_files(&self) -> Vec<PathBuf> {
        let mut files: Vec<_> = self.index.read().keys().cloned().collect();
        files.sort();
        files
    }

    /// Location of the payload file for `path`
    pub fn payload_path(&self, path: &Path) -> PathBuf {
        let key = absolute_path(path);
        let name = blake3::hash(key.to_string_lossy().as_bytes()).to_hex();
        self.dir.join(ENTRIES_DIR).join(format!("{}.json", name))
    }

    /// Fingerprint the current contents of `path`; `None` if unreadable
    pub fn calculate_file_hash(&self, path: &Path) -> Option<FileHash> {
        let key = absolute_path(path);
        let bytes = fs::read(&key).ok()?;
        let metadata = fs::metadata(&key).ok()?;

        Some(FileHash {
            digest: blake3::hash(&bytes).to_hex().to_string(),
            size: bytes.len() as u64,
            mtime: metadata.modified().ok().map(DateTime::<Utc>::from),
            parsed_at: Utc::now(),
            parse_duration_micros: 0,
            relationship_count: 0,
            path: key,
        })
    }

    /// Whether `path` needs to be parsed again
    pub fn has_changed(&self, path: &Path) -> bool {
        let key = absolute_path(path);
        let Some(record) = self.index.read().get(&key).cloned() else {
            return true;
        };

        if record.config_digest != self.config_digest {
            return true;
        }

        let Ok(metadata) = fs::metadata(&key) else {
            return true;
        };
        if metadata.len() != record.hash.size {
            return true;
        }
        if metadata.modified().ok().map(DateTime::<Utc>::from) != record.hash.mtime {
            return true;
        }

        match fs::read(&key) {
            Ok(bytes) => blake3::hash(&bytes).to_hex().as_str() != record.hash.digest,
            Err(_) => true,
        }
    }

    /// Split `paths` into (changed, cached), recording a miss per changed file
    pub fn get_changed_files(&self, paths: &[PathBuf]) -> (Vec<PathBuf>, Vec<PathBuf>) {
        let (changed, cached): (Vec<_>, Vec<_>) = paths
            .par_iter()
            .cloned()
            .partition(|path| self.has_changed(path));

        self.misses.fetch_add(changed.len() as u64, Ordering::Relaxed);
        debug!("{} changed, {} cached", changed.len(), cached.len());
        (changed, cached)
    }

    /// Store a fresh parse result for `path`
    pub fn store_result(
        &self,
        path: &Path,
        module: &ParsedModule,
        relationships: &[Relationship],
        parse_duration: Duration,
    ) -> Result<FileHash> {
        let mut hash = self
            .calculate_file_hash(path)
            .ok_or_else(|| StrataError::not_found("source file", path))?;
        hash.parse_duration_micros = parse_duration.as_micros() as u64;
        hash.relationship_count = relationships.len();

        let cached_at = Utc::now();
        let entry = CacheEntry {
            hash: hash.clone(),
            module: module.clone(),
            relationships: relationships.to_vec(),
            metadata: CacheMetadata {
                cached_at,
                format_version: CACHE_FORMAT_VERSION,
                config_digest: self.config_digest.clone(),
            },
        };

        let payload = serde_json::to_vec(&entry)?;
        self.write_atomic(&self.payload_path(path), &payload)?;

        let key = hash.path.clone();
        self.index.write().insert(
            key.clone(),
            IndexRecord {
                hash: hash.clone(),
                cached_at,
                config_digest: self.config_digest.clone(),
            },
        );
        self.payloads.lock().put(key, entry);
        self.dirty.store(true, Ordering::Release);

        Ok(hash)
    }

    /// Cached entry for `path` if it is still valid
    pub fn get_cached_result(&self, path: &Path) -> Option<CacheEntry> {
        if self.has_changed(path) {
            self.record_miss();
            return None;
        }
        self.load_entry(path)
    }

    /// Load every valid cached entry among `paths`
    pub fn bulk_load_cached_results(&self, paths: &[PathBuf]) -> HashMap<PathBuf, CacheEntry> {
        paths
            .par_iter()
            .filter_map(|path| {
                self.get_cached_result(path)
                    .map(|entry| (path.clone(), entry))
            })
            .collect()
    }

    /// Load entries for paths that [`get_changed_files`](Self::get_changed_files)
    /// just reported as cached, without hashing their contents again.
    ///
    /// Paths missing from the index or with unreadable payloads are left out
    /// and counted as misses.
    pub fn bulk_load_unchanged(&self, paths: &[PathBuf]) -> HashMap<PathBuf, CacheEntry> {
        paths
            .par_iter()
            .filter_map(|path| self.load_entry(path).map(|entry| (path.clone(), entry)))
            .collect()
    }

    fn load_entry(&self, path: &Path) -> Option<CacheEntry> {
        let key = absolute_path(path);
        let Some(record) = self.index.read().get(&key).cloned() else {
            self.record_miss();
            return None;
        };

        if let Some(entry) = self.payloads.lock().get(&key).cloned() {
            self.record_hit(&record);
            return Some(entry);
        }

        match self.load_payload(path, &record) {
            Ok(entry) => {
                self.payloads.lock().put(key, entry.clone());
                self.record_hit(&record);
                Some(entry)
            }
            Err(e) => {
                warn!("Discarding cache entry for {}: {}", path.display(), e);
                self.remove_entry(path);
                self.record_miss();
                None
            }
        }
    }

    /// Forget `path`; returns whether it was cached
    pub fn invalidate_file(&self, path: &Path) -> bool {
        let removed = self.remove_entry(path);
        if removed {
            debug!("Invalidated cache entry for {}", path.display());
        }
        removed
    }

    /// Remove entries cached at least `max_age_days` ago
    pub fn cleanup_stale_cache(&self, max_age_days: u64) -> Result<usize> {
        let max_age = chrono::Duration::days(max_age_days as i64);
        let now = Utc::now();

        let stale: Vec<PathBuf> = self
            .index
            .read()
            .iter()
            .filter(|(_, record)| now - record.cached_at >= max_age)
            .map(|(path, _)| path.clone())
            .collect();

        for path in &stale {
            self.remove_entry(path);
        }

        if !stale.is_empty() {
            info!("Removed {} stale cache entries", stale.len());
            self.flush()?;
        }

        Ok(stale.len())
    }

    pub fn get_cache_stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);

        CacheStats {
            hits,
            misses,
            total_cached_files: self.len(),
            hit_rate: hit_rate(hits, misses),
            time_saved: Duration::from_micros(self.time_saved_micros.load(Ordering::Relaxed)),
            disk_bytes: self.disk_bytes(),
        }
    }

    /// Write the index if it changed since the last flush
    pub fn flush(&self) -> Result<()> {
        if !self.dirty.swap(false, Ordering::AcqRel) {
            return Ok(());
        }

        let index = IndexFile {
            version: CACHE_FORMAT_VERSION,
            entries: self.index.read().values().cloned().collect(),
        };

        let content = serde_json::to_vec_pretty(&index)?;
        if let Err(e) = self.write_atomic(&self.dir.join(INDEX_FILE), &content) {
            self.dirty.store(true, Ordering::Release);
            return Err(e);
        }

        debug!("Flushed cache index with {} entries", index.entries.len());
        Ok(())
    }

    /// Remove every entry, on disk and in memory
    pub fn clear(&self) -> Result<()> {
        self.index.write().clear();
        self.payloads.lock().clear();

        let entries = self.dir.join(ENTRIES_DIR);
        if entries.exists() {
            fs::remove_dir_all(&entries)?;
        }
        fs::create_dir_all(&entries)?;

        let index = self.dir.join(INDEX_FILE);
        if index.exists() {
            fs::remove_file(&index)?;
        }

        self.dirty.store(false, Ordering::Release);
        info!("Cleared cache at {}", self.dir.display());
        Ok(())
    }

    /// Drop in-memory payloads; the index and disk entries stay
    pub fn clear_memory(&self) {
        let mut payloads = self.payloads.lock();
        debug!("Releasing {} in-memory cache payloads", payloads.len());
        payloads.clear();
    }

    fn load_payload(&self, path: &Path, record: &IndexRecord) -> Result<CacheEntry> {
        let bytes = fs::read(self.payload_path(path))?;
        let entry: CacheEntry = serde_json::from_slice(&bytes).map_err(|e| {
            StrataError::cache_corruption(format!("unreadable payload: {}", e))
        })?;

        if entry.metadata.format_version != CACHE_FORMAT_VERSION {
            return Err(StrataError::cache_corruption(format!(
                "payload format version {} differs from {}",
                entry.metadata.format_version, CACHE_FORMAT_VERSION
            )));
        }
        if entry.hash.digest != record.hash.digest {
            return Err(StrataError::cache_corruption(
                "payload digest does not match the index",
            ));
        }

        Ok(entry)
    }

    fn remove_entry(&self, path: &Path) -> bool {
        let key = absolute_path(path);
        let removed = self.index.write().remove(&key).is_some();
        self.payloads.lock().pop(&key);

        let payload = self.payload_path(path);
        if payload.exists() {
            if let Err(e) = fs::remove_file(&payload) {
                warn!("Failed to remove {}: {}", payload.display(), e);
            }
        }

        if removed {
            self.dirty.store(true, Ordering::Release);
        }
        removed
    }

    fn record_hit(&self, record: &IndexRecord) {
        self.hits.fetch_add(1, Ordering::Relaxed);
        self.time_saved_micros
            .fetch_add(record.hash.parse_duration_micros, Ordering::Relaxed);
    }

    fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    fn write_atomic(&self, target: &Path, bytes: &[u8]) -> Result<()> {
        let suffix = self.temp_counter.fetch_add(1, Ordering::Relaxed);
        let temp = target.with_extension(format!("tmp.{}", suffix));
        fs::write(&temp, bytes)?;
        fs::rename(&temp, target)?;
        Ok(())
    }

    fn disk_bytes(&self) -> u64 {
        let index = fs::metadata(self.dir.join(INDEX_FILE))
            .map(|m| m.len())
            .unwrap_or(0);

        let entries = fs::read_dir(self.dir.join(ENTRIES_DIR))
            .map(|dir| {
                dir.filter_map(|entry| entry.ok())
                    .filter_map(|entry| entry.metadata().ok())
                    .filter(|metadata| metadata.is_file())
                    .map(|metadata| metadata.len())
                    .sum()
            })
            .unwrap_or(0);

        index + entries
    }
}

impl Drop for ContentHashCache {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            warn!("Failed to flush cache index on drop: {}", e);
        }
    }
}

impl std::fmt::Debug for ContentHashCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContentHashCache")
            .field("dir", &self.dir)
            .field("entries", &self.len())
            .finish()
    }
}

fn load_index(path: &Path) -> HashMap<PathBuf, IndexRecord> {
    let Ok(bytes) = fs::read(path) else {
        return HashMap::new();
    };

    match serde_json::from_slice::<IndexFile>(&bytes) {
        Ok(index) if index.version == CACHE_FORMAT_VERSION => index
            .entries
            .into_iter()
            .map(|record| (record.hash.path.clone(), record))
            .collect(),
        Ok(index) => {
            warn!(
                "Discarding cache index with format version {} (expected {})",
                index.version, CACHE_FORMAT_VERSION
            );
            HashMap::new()
        }
        Err(e) => {
            warn!("Discarding unreadable cache index {}: {}", path.display(), e);
            HashMap::new()
        }
    }
}

/// Absolute form of `path`, resolving symlinks when the file exists
pub(crate) fn absolute_path(path: &Path) -> PathBuf {
    path.canonicalize()
        .or_else(|_| std::path::absolute(path))
        .unwrap_or_else(|_| path.to_path_buf())
}
