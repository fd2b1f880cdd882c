//! Shallow line-oriented extraction of structural records.
//!
//! Recognizes imports, classes, functions, methods and module-level
//! assignments without building a syntax tree. Lines inside open brackets or
//! triple-quoted strings are skipped, so multi-line signatures and docstrings
//! do not produce records.

use crate::scheduler::ParseFn;
use once_cell::sync::Lazy;
use regex::Regex;
use std::path::Path;
use std::sync::Arc;
use strata_core::{
    ClassRecord, FunctionRecord, ImportRecord, ParsedModule, Result, VariableRecord,
};

static IMPORT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^import\s+(.+)$").expect("invalid import pattern"));
static FROM_IMPORT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^from\s+(\S+)\s+import\s+(.+)$").expect("invalid from-import pattern")
});
static CLASS_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^class\s+([A-Za-z_]\w*)\s*(?:\(([^)]*)\))?\s*:").expect("invalid class pattern")
});
static DEF_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(async\s+)?def\s+([A-Za-z_]\w*)\s*\(([^)]*)").expect("invalid def pattern")
});
static VARIABLE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^([A-Za-z_]\w*)\s*(?::[^=]*)?=(?:[^=]|$)").expect("invalid variable pattern")
});

/// Keywords that continue a compound statement at the same indentation
const CONTINUATION_KEYWORDS: [&str; 4] = ["else", "elif", "except", "finally"];

/// Tracks bracket depth and open triple-quoted strings across lines.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct LexState {
    depth: i32,
    triple: Option<u8>,
}

impl LexState {
    /// Whether a line read in this state starts a new statement
    pub(crate) fn at_statement_start(&self) -> bool {
        self.depth == 0 && self.triple.is_none()
    }

    /// Consume one line
    pub(crate) fn advance(&mut self, line: &str) {
        let bytes = line.as_bytes();
        let mut quote: Option<u8> = None;
        let mut i = 0;

        while i < bytes.len() {
            let b = bytes[i];

            if let Some(q) = self.triple {
                if b == b'\\' {
                    i += 2;
                    continue;
                }
                if bytes[i..].starts_with(&[q, q, q]) {
                    self.triple = None;
                    i += 3;
                    continue;
                }
                i += 1;
                continue;
            }

            if let Some(q) = quote {
                if b == b'\\' {
                    i += 2;
                    continue;
                }
                if b == q {
                    quote = None;
                }
                i += 1;
                continue;
            }

            match b {
                b'#' => break,
                b'"' | b'\'' => {
                    if bytes[i..].starts_with(&[b, b, b]) {
                        self.triple = Some(b);
                        i += 3;
                        continue;
                    }
                    quote = Some(b);
                }
                b'(' | b'[' | b'{' => self.depth += 1,
                b')' | b']' | b'}' => self.depth = (self.depth - 1).max(0),
                _ => {}
            }
            i += 1;
        }
    }
}

/// Whether `line` can begin a new top-level construct
pub(crate) fn is_top_level_start(line: &str) -> bool {
    let Some(first) = line.chars().next() else {
        return false;
    };
    if first.is_whitespace() {
        return false;
    }

    let word: String = line
        .chars()
        .take_while(|c| c.is_alphanumeric() || *c == '_')
        .collect();
    !CONTINUATION_KEYWORDS.contains(&word.as_str())
}

/// Name of the class declared on `line`, if it is a class header
pub(crate) fn class_header_name(line: &str) -> Option<String> {
    CLASS_RE
        .captures(line.trim_start())
        .map(|caps| caps[1].to_string())
}

pub(crate) fn indentation(line: &str) -> usize {
    line.len() - line.trim_start().len()
}

/// Records extracted from a window of lines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShallowRecords {
    pub module: ParsedModule,
    /// Methods whose class header lies in the context lines, keyed by class name
    pub continued_methods: Vec<(String, FunctionRecord)>,
}

#[derive(Debug, Clone)]
enum Scope {
    Class { indent: usize, owner: ClassOwner },
    Function { indent: usize },
}

impl Scope {
    fn indent(&self) -> usize {
        match self {
            Self::Class { indent, .. } | Self::Function { indent } => *indent,
        }
    }
}

#[derive(Debug, Clone)]
enum ClassOwner {
    /// Index into the emitted classes
    Owned(usize),
    /// Header seen only as context
    Context(String),
}

/// Line-oriented extractor
#[derive(Debug, Default, Clone, Copy)]
pub struct ShallowExtractor;

impl ShallowExtractor {
    pub fn new() -> Self {
        Self
    }

    /// Extract records from `lines`.
    ///
    /// `first_line` is the 1-based line number of `lines[0]`. Lines before
    /// `owned_from` are context: they establish class membership but emit no
    /// records. `enclosing_class` names a top-level class still open at
    /// `lines[0]`.
    pub fn extract<S: AsRef<str>>(
        &self,
        path: &Path,
        lines: &[S],
        first_line: usize,
        owned_from: usize,
        enclosing_class: Option<&str>,
    ) -> ShallowRecords {
        let mut module = ParsedModule::new(path);
        let mut continued_methods = Vec::new();
        let mut scopes: Vec<Scope> = enclosing_class
            .map(|name| {
                vec![Scope::Class {
                    indent: 0,
                    owner: ClassOwner::Context(name.to_string()),
                }]
            })
            .unwrap_or_default();
        let mut lex = LexState::default();

        for (idx, raw) in lines.iter().enumerate() {
            let line = raw.as_ref();
            let starts_statement = lex.at_statement_start();
            lex.advance(line);

            let trimmed = line.trim();
            if !starts_statement || trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }

            let owned = idx >= owned_from;
            let line_no = first_line + idx;
            let indent = indentation(line);
            let code = line.trim_start();

            while scopes.last().is_some_and(|scope| scope.indent() >= indent) {
                scopes.pop();
            }

            if let Some(caps) = CLASS_RE.captures(code) {
                let name = caps[1].to_string();
                let owner = if owned {
                    module.classes.push(ClassRecord {
                        name,
                        line: line_no,
                        bases: caps.get(2).map(|m| split_bases(m.as_str())).unwrap_or_default(),
                        methods: Vec::new(),
                    });
                    ClassOwner::Owned(module.classes.len() - 1)
                } else {
                    ClassOwner::Context(name)
                };
                scopes.push(Scope::Class { indent, owner });
                continue;
            }

            if let Some(caps) = DEF_RE.captures(code) {
                let record = FunctionRecord {
                    name: caps[2].to_string(),
                    line: line_no,
                    parameters: split_parameters(&caps[3]),
                    is_async: caps.get(1).is_some(),
                };

                if owned {
                    match scopes.last() {
                        None => module.functions.push(record),
                        Some(Scope::Class {
                            owner: ClassOwner::Owned(index),
                            ..
                        }) => module.classes[*index].methods.push(record),
                        Some(Scope::Class {
                            owner: ClassOwner::Context(name),
                            ..
                        }) => continued_methods.push((name.clone(), record)),
                        // Nested functions are local to their parent
                        Some(Scope::Function { .. }) => {}
                    }
                }
                scopes.push(Scope::Function { indent });
                continue;
            }

            if !owned {
                continue;
            }

            if let Some(caps) = FROM_IMPORT_RE.captures(code) {
                module.imports.push(ImportRecord {
                    module: caps[1].to_string(),
                    names: split_imported_names(strip_comment(&caps[2])),
                    alias: None,
                    line: line_no,
                });
            } else if let Some(caps) = IMPORT_RE.captures(code) {
                for part in strip_comment(&caps[1]).split(',') {
                    let (name, alias) = split_alias(part);
                    if name.is_empty() {
                        continue;
                    }
                    module.imports.push(ImportRecord {
                        module: name,
                        names: Vec::new(),
                        alias,
                        line: line_no,
                    });
                }
            } else if indent == 0 && scopes.is_empty() {
                if let Some(caps) = VARIABLE_RE.captures(code) {
                    module.variables.push(VariableRecord {
                        name: caps[1].to_string(),
                        line: line_no,
                    });
                }
            }
        }

        module.line_count = lines.len().saturating_sub(owned_from);

        ShallowRecords {
            module,
            continued_methods,
        }
    }

    /// Parse a whole source text
    pub fn parse_source(&self, path: &Path, source: &str) -> ParsedModule {
        let lines: Vec<&str> = source.lines().collect();
        self.extract(path, &lines, 1, 0, None).module
    }

    /// Read and parse a file
    pub fn parse_file(&self, path: &Path) -> Result<ParsedModule> {
        let source = std::fs::read_to_string(path)?;
        Ok(self.parse_source(path, &source))
    }

    /// A [`ParseFn`] backed by this extractor
    pub fn parse_fn() -> ParseFn {
        let extractor = Self::new();
        Arc::new(move |path: &Path| extractor.parse_file(path))
    }
}

fn strip_comment(text: &str) -> &str {
    text.split('#').next().unwrap_or("").trim()
}

fn split_alias(part: &str) -> (String, Option<String>) {
    let part = part.trim();
    match part.split_once(" as ") {
        Some((name, alias)) => (name.trim().to_string(), Some(alias.trim().to_string())),
        None => (part.to_string(), None),
    }
}

fn split_imported_names(text: &str) -> Vec<String> {
    text.trim_matches(|c: char| c == '(' || c == ')' || c == '\\' || c.is_whitespace())
        .split(',')
        .map(|part| split_alias(part.trim_matches(|c| c == '(' || c == ')')).0)
        .filter(|name| !name.is_empty())
        .collect()
}

fn split_bases(text: &str) -> Vec<String> {
    text.split(',')
        .map(str::trim)
        .filter(|base| !base.is_empty() && !base.contains('='))
        .map(str::to_string)
        .collect()
}

fn split_parameters(text: &str) -> Vec<String> {
    text.split(',')
        .map(|param| {
            param
                .split(|c| c == ':' || c == '=')
                .next()
                .unwrap_or("")
                .trim()
                .to_string()
        })
        .filter(|param| !param.is_empty() && param != "*" && param != "/")
        .collect()
}
