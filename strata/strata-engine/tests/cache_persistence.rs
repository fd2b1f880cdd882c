//! Cache persistence across instances.

use anyhow::Result;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use strata_core::{ParsedModule, StrataConfig};
use strata_engine::cache::{ContentHashCache, ENTRIES_DIR, INDEX_FILE};
use strata_engine::ShallowExtractor;
use tempfile::TempDir;

fn write_file(dir: &Path, name: &str, content: &str) -> Result<PathBuf> {
    let path = dir.join(name);
    fs::write(&path, content)?;
    Ok(path)
}

fn store(cache: &ContentHashCache, path: &Path) -> Result<()> {
    let module = ShallowExtractor::new().parse_file(path)?;
    cache.store_result(path, &module, &[], Duration::from_millis(3))?;
    Ok(())
}

#[test]
fn test_no_prior_cache_reports_everything_changed() -> Result<()> {
    let temp = TempDir::new()?;
    let cache = ContentHashCache::open(&temp.path().join("cache"), "d", 8)?;

    let paths: Vec<PathBuf> = (0..4)
        .map(|i| write_file(temp.path(), &format!("m{}.py", i), "x = 1\n"))
        .collect::<Result<_>>()?;

    let (changed, cached) = cache.get_changed_files(&paths);
    assert_eq!(changed.len(), paths.len());
    assert!(cached.is_empty());
    Ok(())
}

#[test]
fn test_reopened_cache_serves_unchanged_files() -> Result<()> {
    let temp = TempDir::new()?;
    let dir = temp.path().join("cache");
    let path = write_file(temp.path(), "app.py", "def main():\n    pass\n")?;

    {
        let cache = ContentHashCache::open(&dir, "d", 8)?;
        store(&cache, &path)?;
        cache.flush()?;
    }
    assert!(dir.join(INDEX_FILE).exists());

    let cache = ContentHashCache::open(&dir, "d", 8)?;
    let (changed, cached) = cache.get_changed_files(&[path.clone()]);
    assert!(changed.is_empty());
    assert_eq!(cached, vec![path.clone()]);

    let entry = cache.get_cached_result(&path).expect("entry should load from disk");
    assert_eq!(entry.module.functions[0].name, "main");
    assert_eq!(entry.hash.parse_duration(), Duration::from_millis(3));

    let stats = cache.get_cache_stats();
    assert_eq!(stats.hits, 1);
    assert_eq!(stats.total_cached_files, 1);
    assert!(stats.disk_bytes > 0);
    Ok(())
}

#[test]
fn test_edit_after_reopen_is_changed() -> Result<()> {
    let temp = TempDir::new()?;
    let dir = temp.path().join("cache");
    let path = write_file(temp.path(), "app.py", "x = 1\n")?;

    {
        let cache = ContentHashCache::open(&dir, "d", 8)?;
        store(&cache, &path)?;
    }

    fs::write(&path, "x = 2\n")?;
    let cache = ContentHashCache::open(&dir, "d", 8)?;
    assert!(cache.has_changed(&path));
    assert!(cache.get_cached_result(&path).is_none());
    Ok(())
}

#[test]
fn test_config_change_invalidates_entries() -> Result<()> {
    let temp = TempDir::new()?;
    let mut config = StrataConfig::default();
    config.cache_mut().directory = temp.path().join("cache");
    let path = write_file(temp.path(), "app.py", "x = 1\n")?;

    {
        let cache = ContentHashCache::from_config(&config)?;
        store(&cache, &path)?;
    }

    config.chunking_mut().chunk_max_lines = 250;
    let cache = ContentHashCache::from_config(&config)?;
    assert!(cache.has_changed(&path));
    Ok(())
}

#[test]
fn test_corrupt_payload_self_heals() -> Result<()> {
    let temp = TempDir::new()?;
    let dir = temp.path().join("cache");
    let path = write_file(temp.path(), "app.py", "x = 1\n")?;

    {
        let cache = ContentHashCache::open(&dir, "d", 8)?;
        store(&cache, &path)?;
    }

    let cache = ContentHashCache::open(&dir, "d", 8)?;
    let payload = cache.payload_path(&path);
    assert!(payload.starts_with(dir.join(ENTRIES_DIR)));
    fs::write(&payload, b"{ not json")?;

    assert!(cache.get_cached_result(&path).is_none());
    assert!(!payload.exists());
    assert!(cache.has_changed(&path));
    assert_eq!(cache.get_cache_stats().misses, 1);
    Ok(())
}

#[test]
fn test_stale_cleanup_keeps_recent_entries() -> Result<()> {
    let temp = TempDir::new()?;
    let cache = ContentHashCache::open(&temp.path().join("cache"), "d", 8)?;
    let path = write_file(temp.path(), "app.py", "x = 1\n")?;
    store(&cache, &path)?;

    assert_eq!(cache.cleanup_stale_cache(30)?, 0);
    assert_eq!(cache.len(), 1);
    assert_eq!(cache.cleanup_stale_cache(0)?, 1);
    assert!(cache.is_empty());
    Ok(())
}

#[test]
fn test_stale_cleanup_removes_old_entries() -> Result<()> {
    let temp = TempDir::new()?;
    let dir = temp.path().join("cache");
    let old = write_file(temp.path(), "old.py", "x = 1\n")?;
    let recent = write_file(temp.path(), "recent.py", "y = 1\n")?;
    {
        let cache = ContentHashCache::open(&dir, "d", 8)?;
        store(&cache, &old)?;
        store(&cache, &recent)?;
        cache.flush()?;
    }

    let index_path = dir.join(INDEX_FILE);
    let mut index: serde_json::Value = serde_json::from_slice(&fs::read(&index_path)?)?;
    let backdated = (chrono::Utc::now() - chrono::Duration::days(40)).to_rfc3339();
    for entry in index["entries"].as_array_mut().into_iter().flatten() {
        let is_old = entry["hash"]["path"]
            .as_str()
            .is_some_and(|p| p.ends_with("old.py"));
        if is_old {
            entry["cached_at"] = serde_json::Value::String(backdated.clone());
        }
    }
    fs::write(&index_path, serde_json::to_vec(&index)?)?;

    let cache = ContentHashCache::open(&dir, "d", 8)?;
    let old_payload = cache.payload_path(&old);
    assert!(old_payload.exists());

    assert_eq!(cache.cleanup_stale_cache(30)?, 1);
    assert_eq!(cache.len(), 1);
    assert!(!old_payload.exists());
    assert!(cache.has_changed(&old));
    assert!(!cache.has_changed(&recent));
    Ok(())
}

#[test]
fn test_invalidate_then_changed() -> Result<()> {
    let temp = TempDir::new()?;
    let cache = ContentHashCache::open(&temp.path().join("cache"), "d", 8)?;
    let path = write_file(temp.path(), "app.py", "x = 1\n")?;
    store(&cache, &path)?;

    assert!(cache.invalidate_file(&path));
    let (changed, _) = cache.get_changed_files(&[path.clone()]);
    assert_eq!(changed, vec![path]);
    Ok(())
}

#[test]
fn test_module_roundtrips_through_disk() -> Result<()> {
    let temp = TempDir::new()?;
    let dir = temp.path().join("cache");
    let path = write_file(
        temp.path(),
        "models.py",
        "import os\n\nclass User(Base):\n    async def load(self, key):\n        pass\n",
    )?;

    let original: ParsedModule = ShallowExtractor::new().parse_file(&path)?;
    {
        let cache = ContentHashCache::open(&dir, "d", 8)?;
        cache.store_result(&path, &original, &[], Duration::ZERO)?;
    }

    let cache = ContentHashCache::open(&dir, "d", 8)?;
    let loaded = cache.bulk_load_cached_results(&[path.clone()]);
    assert_eq!(loaded.get(&path).map(|entry| &entry.module), Some(&original));
    Ok(())
}
