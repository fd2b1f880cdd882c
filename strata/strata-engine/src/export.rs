//! Exporters for the merged module set and its relationships.

use serde::Serialize;
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use strata_core::{ParsedModule, Relationship, Result, StrataError};
use tracing::{debug, info};

/// What an exporter wrote
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ExportSummary {
    pub modules: usize,
    pub relationships: usize,
    pub destination: Option<PathBuf>,
    pub bytes_written: u64,
}

/// Sink for the results of a pipeline run
pub trait Exporter: Send + Sync {
    fn name(&self) -> &str;

    fn export(
        &self,
        modules: &BTreeMap<PathBuf, ParsedModule>,
        relationships: &[Relationship],
    ) -> Result<ExportSummary>;
}

/// One JSON object per line
#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Record<'a> {
    Module(&'a ParsedModule),
    Relationship(&'a Relationship),
}

/// Writes modules then relationships as JSON lines.
///
/// The file is written beside the destination and renamed into place, so a
/// failed export never leaves a truncated file behind.
#[derive(Debug, Clone)]
pub struct JsonLinesExporter {
    path: PathBuf,
}

impl JsonLinesExporter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_records(
        &self,
        target: &Path,
        modules: &BTreeMap<PathBuf, ParsedModule>,
        relationships: &[Relationship],
    ) -> Result<u64> {
        let file = File::create(target)?;
        let mut writer = BufWriter::new(file);

        for module in modules.values() {
            serde_json::to_writer(&mut writer, &Record::Module(module))?;
            writer.write_all(b"\n")?;
        }
        for relationship in relationships {
            serde_json::to_writer(&mut writer, &Record::Relationship(relationship))?;
            writer.write_all(b"\n")?;
        }

        let file = writer
            .into_inner()
            .map_err(|e| StrataError::Io(e.into_error()))?;
        file.sync_all()?;
        Ok(file.metadata()?.len())
    }
}

impl Exporter for JsonLinesExporter {
    fn name(&self) -> &str {
        "jsonl"
    }

    fn export(
        &self,
        modules: &BTreeMap<PathBuf, ParsedModule>,
        relationships: &[Relationship],
    ) -> Result<ExportSummary> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        let mut temp = self.path.clone().into_os_string();
        temp.push(".tmp");
        let temp = PathBuf::from(temp);

        let bytes_written = match self.write_records(&temp, modules, relationships) {
            Ok(bytes) => bytes,
            Err(e) => {
                let _ = fs::remove_file(&temp);
                return Err(e);
            }
        };
        fs::rename(&temp, &self.path)?;

        info!(
            "Exported {} modules and {} relationships to {}",
            modules.len(),
            relationships.len(),
            self.path.display()
        );

        Ok(ExportSummary {
            modules: modules.len(),
            relationships: relationships.len(),
            destination: Some(self.path.clone()),
            bytes_written,
        })
    }
}

/// Discards everything
#[derive(Debug, Clone, Copy, Default)]
pub struct NullExporter;

impl Exporter for NullExporter {
    fn name(&self) -> &str {
        "null"
    }

    fn export(
        &self,
        modules: &BTreeMap<PathBuf, ParsedModule>,
        relationships: &[Relationship],
    ) -> Result<ExportSummary> {
        debug!("Skipping export of {} modules", modules.len());
        Ok(ExportSummary {
            modules: modules.len(),
            relationships: relationships.len(),
            destination: None,
            bytes_written: 0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_core::RelationshipKind;
    use tempfile::TempDir;

    fn sample() -> (BTreeMap<PathBuf, ParsedModule>, Vec<Relationship>) {
        let mut modules = BTreeMap::new();
        for name in ["b.py", "a.py"] {
            modules.insert(PathBuf::from(name), ParsedModule::new(name));
        }
        let relationships = vec![Relationship {
            kind: RelationshipKind::Imports,
            source: "a".to_string(),
            target: "b".to_string(),
            source_path: PathBuf::from("a.py"),
            line: 1,
            resolved: true,
        }];
        (modules, relationships)
    }

    #[test]
    fn test_jsonl_export() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("out/graph.jsonl");
        let (modules, relationships) = sample();

        let summary = JsonLinesExporter::new(&path)
            .export(&modules, &relationships)
            .unwrap();
        assert_eq!(summary.modules, 2);
        assert_eq!(summary.relationships, 1);
        assert_eq!(summary.destination.as_deref(), Some(path.as_path()));

        let content = fs::read_to_string(&path).unwrap();
        assert_eq!(summary.bytes_written, content.len() as u64);

        let lines: Vec<serde_json::Value> = content
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0]["type"], "module");
        assert_eq!(lines[0]["module_name"], "a");
        assert_eq!(lines[1]["module_name"], "b");
        assert_eq!(lines[2]["type"], "relationship");
        assert_eq!(lines[2]["kind"], "imports");

        assert!(!temp.path().join("out/graph.jsonl.tmp").exists());
    }

    #[test]
    fn test_null_export() {
        let (modules, relationships) = sample();
        let summary = NullExporter.export(&modules, &relationships).unwrap();
        assert_eq!(summary.destination, None);
        assert_eq!(summary.modules, 2);
    }
}
