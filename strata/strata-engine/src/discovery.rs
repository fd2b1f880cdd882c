//! Source file discovery.

use globset::{Glob, GlobSet, GlobSetBuilder};
use std::path::{Path, PathBuf};
use strata_core::config::DiscoveryConfig;
use strata_core::{Result, StrataError};
use tracing::{debug, warn};
use walkdir::{DirEntry, WalkDir};

/// Check if directory entry is hidden
fn is_hidden(entry: &DirEntry) -> bool {
    entry
        .file_name()
        .to_str()
        .map(|s| s.starts_with('.'))
        .unwrap_or(false)
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = Glob::new(pattern)
            .map_err(|e| StrataError::config(format!("Invalid glob '{}': {}", pattern, e)))?;
        builder.add(glob);
    }
    builder
        .build()
        .map_err(|e| StrataError::config(format!("Failed to build glob set: {}", e)))
}

/// Walks roots and collects files matching the include/exclude patterns
#[derive(Debug, Clone)]
pub struct FileDiscovery {
    include: GlobSet,
    exclude: GlobSet,
    skip_hidden: bool,
}

impl FileDiscovery {
    pub fn new(config: &DiscoveryConfig) -> Result<Self> {
        Ok(Self {
            include: build_globset(&config.include)?,
            exclude: build_globset(&config.exclude)?,
            skip_hidden: config.skip_hidden,
        })
    }

    fn accepts(&self, path: &Path) -> bool {
        (self.include.is_empty() || self.include.is_match(path))
            && (self.exclude.is_empty() || !self.exclude.is_match(path))
    }

    /// Matching files under `roots`, sorted and de-duplicated.
    ///
    /// Missing roots are skipped with a warning.
    pub fn discover(&self, roots: &[PathBuf]) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();

        for root in roots {
            if !root.exists() {
                warn!("Path doesn't exist: {}", root.display());
                continue;
            }

            if root.is_file() {
                if self.accepts(root) {
                    files.push(root.clone());
                }
                continue;
            }

            let walker = WalkDir::new(root)
                .into_iter()
                .filter_entry(|e| e.depth() == 0 || !self.skip_hidden || !is_hidden(e));

            for entry in walker {
                let entry = entry.map_err(|e| {
                    StrataError::Io(std::io::Error::other(format!(
                        "Failed to walk {}: {}",
                        root.display(),
                        e
                    )))
                })?;

                if entry.file_type().is_file() && self.accepts(entry.path()) {
                    files.push(entry.into_path());
                }
            }
        }

        files.sort();
        files.dedup();
        debug!("Discovered {} files under {} roots", files.len(), roots.len());
        Ok(files)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_discover_respects_patterns() {
        let temp = TempDir::new().unwrap();
        let root = temp.path();
        fs::create_dir_all(root.join("pkg/__pycache__")).unwrap();
        fs::create_dir_all(root.join(".hidden")).unwrap();
        fs::write(root.join("pkg/a.py"), "").unwrap();
        fs::write(root.join("pkg/b.txt"), "").unwrap();
        fs::write(root.join("pkg/__pycache__/a.py"), "").unwrap();
        fs::write(root.join(".hidden/c.py"), "").unwrap();
        fs::write(root.join("main.py"), "").unwrap();

        let discovery = FileDiscovery::new(&DiscoveryConfig::default()).unwrap();
        let files = discovery.discover(&[root.to_path_buf()]).unwrap();

        assert_eq!(files, vec![root.join("main.py"), root.join("pkg/a.py")]);
    }

    #[test]
    fn test_hidden_files_included_when_allowed() {
        let temp = TempDir::new().unwrap();
        fs::create_dir_all(temp.path().join(".hidden")).unwrap();
        fs::write(temp.path().join(".hidden/c.py"), "").unwrap();

        let config = DiscoveryConfig {
            skip_hidden: false,
            ..Default::default()
        };
        let files = FileDiscovery::new(&config)
            .unwrap()
            .discover(&[temp.path().to_path_buf()])
            .unwrap();
        assert_eq!(files.len(), 1);
    }

    #[test]
    fn test_single_file_and_missing_root() {
        let temp = TempDir::new().unwrap();
        let file = temp.path().join("solo.py");
        fs::write(&file, "").unwrap();

        let discovery = FileDiscovery::new(&DiscoveryConfig::default()).unwrap();
        let files = discovery
            .discover(&[file.clone(), file.clone(), temp.path().join("missing")])
            .unwrap();
        assert_eq!(files, vec![file]);
    }

    #[test]
    fn test_invalid_glob() {
        let config = DiscoveryConfig {
            include: vec!["[".to_string()],
            ..Default::default()
        };
        assert!(FileDiscovery::new(&config).is_err());
    }
}
