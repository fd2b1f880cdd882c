//! Relationship extraction over a merged module set.

use rayon::prelude::*;
use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use strata_core::{ParsedModule, Relationship, RelationshipKind};

/// Derives edges from parsed modules
pub trait RelationshipExtractor: Send + Sync {
    fn extract(&self, modules: &BTreeMap<PathBuf, ParsedModule>) -> Vec<Relationship>;
}

/// Names defined anywhere in the analyzed set
#[derive(Debug, Default)]
struct KnownNames {
    modules: HashSet<String>,
    classes: HashSet<String>,
}

impl KnownNames {
    fn collect(modules: &BTreeMap<PathBuf, ParsedModule>) -> Self {
        let mut known = Self::default();
        for module in modules.values() {
            known.modules.insert(module.module_name.clone());
            known
                .classes
                .extend(module.classes.iter().map(|class| class.name.clone()));
        }
        known
    }

    fn has_module(&self, target: &str) -> bool {
        let name = target.trim_start_matches('.');
        let last = name.rsplit('.').next().unwrap_or(name);
        self.modules.contains(last)
    }

    fn has_class(&self, target: &str) -> bool {
        let last = target.rsplit('.').next().unwrap_or(target);
        self.classes.contains(last)
    }
}

/// Containment, import and inheritance edges
#[derive(Debug, Default, Clone, Copy)]
pub struct ModuleRelationshipExtractor;

impl ModuleRelationshipExtractor {
    pub fn new() -> Self {
        Self
    }

    fn extract_module(&self, module: &ParsedModule, known: &KnownNames) -> Vec<Relationship> {
        let mut edges = Vec::new();
        let scope = module.module_name.as_str();
        let edge = |kind, source: String, target: String, line, resolved| Relationship {
            kind,
            source,
            target,
            source_path: module.path.clone(),
            line,
            resolved,
        };

        for import in &module.imports {
            edges.push(edge(
                RelationshipKind::Imports,
                scope.to_string(),
                import.module.clone(),
                import.line,
                known.has_module(&import.module),
            ));
        }

        for class in &module.classes {
            let class_name = format!("{}.{}", scope, class.name);
            edges.push(edge(
                RelationshipKind::Contains,
                scope.to_string(),
                class_name.clone(),
                class.line,
                true,
            ));

            for base in &class.bases {
                edges.push(edge(
                    RelationshipKind::Inherits,
                    class_name.clone(),
                    base.clone(),
                    class.line,
                    known.has_class(base),
                ));
            }

            for method in &class.methods {
                edges.push(edge(
                    RelationshipKind::Contains,
                    class_name.clone(),
                    format!("{}.{}", class_name, method.name),
                    method.line,
                    true,
                ));
            }
        }

        for function in &module.functions {
            edges.push(edge(
                RelationshipKind::Contains,
                scope.to_string(),
                format!("{}.{}", scope, function.name),
                function.line,
                true,
            ));
        }

        edges
    }
}

impl RelationshipExtractor for ModuleRelationshipExtractor {
    fn extract(&self, modules: &BTreeMap<PathBuf, ParsedModule>) -> Vec<Relationship> {
        let known = KnownNames::collect(modules);
        modules
            .par_iter()
            .flat_map_iter(|(_, module)| self.extract_module(module, &known))
            .collect()
    }
}
