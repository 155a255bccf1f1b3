//! Named SQL query templates.
//!
//! A catalog holds two families of templates: *single* queries returning at
//! most one row and *multi* queries returning any number of rows. Each
//! template declares the variables its select columns fill, in column order.
//! Static parameters are configuration constants substituted into templates
//! through `${name}` markers, and are also resolvable directly as variables.

use std::collections::HashMap;

use tracing::{debug, warn};

use crate::error::{ReaderError, Result};
use crate::xml::Element;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueryKind {
    Single,
    Multi,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryTemplate {
    pub name: String,
    pub kind: QueryKind,
    /// Output variables, one per select column.
    pub variables: Vec<String>,
    /// SQL with static parameters already substituted.
    pub sql: String,
}

#[derive(Debug, Clone, Default)]
pub struct QueryCatalog {
    templates: Vec<QueryTemplate>,
    static_parameters: HashMap<String, String>,
    owners: HashMap<String, usize>,
}

impl QueryCatalog {
    pub fn new(static_parameters: HashMap<String, String>) -> Self {
        Self {
            static_parameters,
            ..Self::default()
        }
    }

    /// Reads a `<queries>` element.
    pub fn from_element(queries: &Element) -> Result<Self> {
        let mut static_parameters = HashMap::new();
        if let Some(parameters) = queries.child("parameters") {
            for entry in parameters.children_named("entry") {
                let name = entry.attribute("name").ok_or_else(|| {
                    ReaderError::Configuration(
                        "Static parameter <entry> without a name attribute".to_string(),
                    )
                })?;
                let value = entry
                    .attribute("value")
                    .map(str::to_string)
                    .unwrap_or_else(|| entry.text.trim().to_string());
                static_parameters.insert(name.to_string(), value);
            }
        }

        let mut catalog = Self::new(static_parameters);

        for (section, kind) in [("single", QueryKind::Single), ("multiFixed", QueryKind::Multi)] {
            match queries.child(section) {
                Some(element) => {
                    for query in element.children_named("query") {
                        catalog.add_query_element(query, kind)?;
                    }
                }
                None => warn!("No <{}> queries in the catalog", section),
            }
        }

        debug!(
            "Loaded query catalog: {} templates, {} static parameters",
            catalog.templates.len(),
            catalog.static_parameters.len()
        );
        Ok(catalog)
    }

    fn add_query_element(&mut self, query: &Element, kind: QueryKind) -> Result<()> {
        let name = query
            .attribute("name")
            .ok_or_else(|| ReaderError::Configuration("<query> without a name attribute".to_string()))?;

        let select = query.child("select").ok_or_else(|| {
            ReaderError::Configuration(format!("Query '{}' has no <select>", name))
        })?;
        let mut variables = Vec::new();
        let mut columns = Vec::new();
        for col in select.children_named("col") {
            let var = col.attribute("var").ok_or_else(|| {
                ReaderError::Configuration(format!(
                    "Query '{}' has a <col> without a var attribute",
                    name
                ))
            })?;
            variables.push(var.to_string());
            columns.push(col.text.trim().to_string());
        }

        let from = query.child_text("from").ok_or_else(|| {
            ReaderError::Configuration(format!("Query '{}' has no <from>", name))
        })?;

        let mut sql = format!("SELECT {} FROM {}", columns.join(", "), from);
        if let Some(clause) = query.child_text("where") {
            sql.push_str(" WHERE ");
            sql.push_str(clause);
        }
        if let Some(clause) = query.child_text("groupBy") {
            sql.push_str(" GROUP BY ");
            sql.push_str(clause);
        }
        if let Some(clause) = query.child_text("orderBy") {
            sql.push_str(" ORDER BY ");
            sql.push_str(clause);
        }

        self.add_template(name, kind, &sql, variables)
    }

    /// Adds a template after substituting static parameters into `sql`.
    pub fn add_template(
        &mut self,
        name: &str,
        kind: QueryKind,
        sql: &str,
        variables: Vec<String>,
    ) -> Result<()> {
        if variables.is_empty() {
            return Err(ReaderError::Configuration(format!(
                "Query '{}' declares no variables",
                name
            )));
        }
        if self.templates.iter().any(|t| t.name == name) {
            return Err(ReaderError::Configuration(format!(
                "Duplicate query name '{}'",
                name
            )));
        }
        for (i, var) in variables.iter().enumerate() {
            if variables[..i].contains(var) {
                return Err(ReaderError::Configuration(format!(
                    "Variable '{}' appears twice in query '{}'",
                    var, name
                )));
            }
            if self.static_parameters.contains_key(var) {
                return Err(ReaderError::Configuration(format!(
                    "Variable '{}' of query '{}' shadows a static parameter",
                    var, name
                )));
            }
            if let Some(&owner) = self.owners.get(var) {
                return Err(ReaderError::Configuration(format!(
                    "Variable '{}' is declared by both '{}' and '{}'",
                    var, self.templates[owner].name, name
                )));
            }
        }

        let sql = substitute(sql, &self.static_parameters)
            .map_err(|e| ReaderError::Configuration(format!("Query '{}': {}", name, e)))?;

        let index = self.templates.len();
        for var in &variables {
            self.owners.insert(var.clone(), index);
        }
        self.templates.push(QueryTemplate {
            name: name.to_string(),
            kind,
            variables,
            sql,
        });
        Ok(())
    }

    pub fn templates(&self) -> &[QueryTemplate] {
        &self.templates
    }

    pub fn owner_of(&self, variable: &str) -> Option<&QueryTemplate> {
        self.owners.get(variable).map(|&i| &self.templates[i])
    }

    pub fn static_parameter(&self, name: &str) -> Option<&str> {
        self.static_parameters.get(name).map(String::as_str)
    }

    pub fn static_parameters(&self) -> &HashMap<String, String> {
        &self.static_parameters
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }
}

/// Replaces every `${name}` marker with its static parameter value.
pub fn substitute(template: &str, parameters: &HashMap<String, String>) -> std::result::Result<String, String> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after
            .find('}')
            .ok_or_else(|| format!("unterminated placeholder in '{}'", template))?;
        let key = &after[..end];
        let value = parameters
            .get(key)
            .ok_or_else(|| format!("unknown static parameter '{}'", key))?;
        out.push_str(value);
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    Ok(out)
}
