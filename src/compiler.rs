//! Binds catalog templates to a live connection.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, error, info};

use crate::catalog::{QueryCatalog, QueryKind};
use crate::driver::{count_placeholders, Connection, StatementMetadata};
use crate::error::ReaderError;

/// A template that prepared successfully, with the labels of its columns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledStatement {
    pub name: String,
    pub kind: QueryKind,
    pub sql: String,
    pub variables: Vec<String>,
    pub parameter_count: usize,
    pub metadata: StatementMetadata,
}

/// Every statement of a catalog that could be prepared.
#[derive(Debug, Default)]
pub struct CompiledCatalog {
    statements: Vec<Arc<CompiledStatement>>,
    by_variable: HashMap<String, usize>,
    failures: Vec<ReaderError>,
}

impl CompiledCatalog {
    pub fn statement_for(&self, variable: &str) -> Option<(usize, &Arc<CompiledStatement>)> {
        self.by_variable
            .get(variable)
            .map(|&i| (i, &self.statements[i]))
    }

    pub fn statements(&self) -> &[Arc<CompiledStatement>] {
        &self.statements
    }

    /// Templates that failed to prepare, as [`ReaderError::Preparation`].
    pub fn failures(&self) -> &[ReaderError] {
        &self.failures
    }

    pub fn variable_names(&self) -> impl Iterator<Item = &str> {
        self.by_variable.keys().map(String::as_str)
    }
}

/// Prepares every template of `catalog` on `conn`.
///
/// A template that fails to prepare is logged and left out; the others
/// still compile.
pub fn compile(conn: &mut dyn Connection, catalog: &QueryCatalog) -> CompiledCatalog {
    let mut compiled = CompiledCatalog::default();

    for template in catalog.templates() {
        match conn.prepare(&template.sql) {
            Ok(metadata) => {
                let parameter_count = metadata
                    .parameter_count
                    .unwrap_or_else(|| count_placeholders(&template.sql));
                debug!(
                    "Prepared query '{}' ({} parameters): {}",
                    template.name, parameter_count, template.sql
                );
                let index = compiled.statements.len();
                for var in &template.variables {
                    compiled.by_variable.insert(var.clone(), index);
                }
                compiled.statements.push(Arc::new(CompiledStatement {
                    name: template.name.clone(),
                    kind: template.kind,
                    sql: template.sql.clone(),
                    variables: template.variables.clone(),
                    parameter_count,
                    metadata,
                }));
            }
            Err(source) => {
                let err = ReaderError::Preparation {
                    query: template.name.clone(),
                    sql: template.sql.clone(),
                    source,
                };
                error!("{}", err);
                compiled.failures.push(err);
            }
        }
    }

    info!(
        "Compiled {} of {} queries",
        compiled.statements.len(),
        catalog.templates().len()
    );
    compiled
}
