//! Structural records produced by parsing one source file.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// An `import x` or `from x import a, b` statement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportRecord {
    /// Imported module path (`os.path`, `.models`)
    pub module: String,
    /// Names pulled from the module; empty for plain imports
    #[serde(default)]
    pub names: Vec<String>,
    /// Alias given with `as`
    #[serde(default)]
    pub alias: Option<String>,
    pub line: usize,
}

/// A function or method definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionRecord {
    pub name: String,
    pub line: usize,
    #[serde(default)]
    pub parameters: Vec<String>,
    #[serde(default)]
    pub is_async: bool,
}

/// A class definition together with its directly nested methods.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassRecord {
    pub name: String,
    pub line: usize,
    #[serde(default)]
    pub bases: Vec<String>,
    #[serde(default)]
    pub methods: Vec<FunctionRecord>,
}

/// A module-level assignment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariableRecord {
    pub name: String,
    pub line: usize,
}

/// The structural record of one parsed source file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParsedModule {
    pub path: PathBuf,
    pub module_name: String,
    #[serde(default)]
    pub imports: Vec<ImportRecord>,
    #[serde(default)]
    pub classes: Vec<ClassRecord>,
    #[serde(default)]
    pub functions: Vec<FunctionRecord>,
    #[serde(default)]
    pub variables: Vec<VariableRecord>,
    pub line_count: usize,
    /// Number of chunks the file was split into (1 for single-shot parses)
    #[serde(default = "default_chunk_count")]
    pub chunk_count: usize,
}

fn default_chunk_count() -> usize {
    1
}

impl ParsedModule {
    /// Create an empty module record for `path`
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let module_name = module_name_for(&path);
        Self {
            path,
            module_name,
            imports: Vec::new(),
            classes: Vec::new(),
            functions: Vec::new(),
            variables: Vec::new(),
            line_count: 0,
            chunk_count: 1,
        }
    }

    /// Total number of definitions (classes, functions, methods, variables)
    pub fn definition_count(&self) -> usize {
        self.classes.len()
            + self.classes.iter().map(|c| c.methods.len()).sum::<usize>()
            + self.functions.len()
            + self.variables.len()
    }

    /// Append another module's records, keeping line numbers as they are.
    pub fn extend(&mut self, other: ParsedModule) {
        self.imports.extend(other.imports);
        self.classes.extend(other.classes);
        self.functions.extend(other.functions);
        self.variables.extend(other.variables);
    }
}

/// Derive a module name from a file path (`pkg/__init__.py` -> `pkg`).
pub fn module_name_for(path: &Path) -> String {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();

    if stem == "__init__" {
        if let Some(parent) = path.parent().and_then(|p| p.file_name()) {
            return parent.to_string_lossy().into_owned();
        }
    }

    stem
}

/// Kind of edge between two structural elements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationshipKind {
    /// Module contains class/function, class contains method
    Contains,
    /// Module imports another module
    Imports,
    /// Class derives from a base class
    Inherits,
}

/// A directed edge extracted from the parsed set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Relationship {
    pub kind: RelationshipKind,
    pub source: String,
    pub target: String,
    pub source_path: PathBuf,
    pub line: usize,
    /// Whether `target` names an element known inside the analyzed set
    #[serde(default)]
    pub resolved: bool,
}
