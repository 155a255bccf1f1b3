//! Database driver seam.
//!
//! The engine never talks to a concrete database library directly. A driver
//! hands out [`Connection`]s through a [`ConnectionFactory`], and factories are
//! resolved from the configured data-source tag (`<className>`) through a
//! [`DriverRegistry`].

#[cfg(feature = "sqlite")]
pub mod sqlite;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::config::DatabaseConfig;
use crate::error::{ReaderError, Result};

/// One result row, column values rendered as text. `None` is SQL NULL.
pub type Row = Vec<Option<String>>;

/// Error reported by a driver.
///
/// `code` is a SQLSTATE-style identifier when the driver can provide one; the
/// engine compares it against the configured connection-lost codes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverError {
    pub code: Option<String>,
    pub message: String,
}

impl DriverError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            code: None,
            message: message.into(),
        }
    }

    pub fn with_code(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: Some(code.into()),
            message: message.into(),
        }
    }
}

impl fmt::Display for DriverError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.code {
            Some(code) => write!(f, "[{}] {}", code, self.message),
            None => write!(f, "{}", self.message),
        }
    }
}

impl std::error::Error for DriverError {}

/// Declared SQL type of a placeholder, as far as the driver can tell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamType {
    Integer,
    Text,
    Unknown,
}

/// A value bound to a positional placeholder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SqlParam {
    Integer(i64),
    Text(String),
}

/// What a driver learned while preparing a statement.
///
/// `parameter_count` is `None` when the driver has no parameter metadata; the
/// compiler then falls back to counting `?` markers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatementMetadata {
    pub parameter_count: Option<usize>,
    pub parameter_types: Vec<ParamType>,
}

impl StatementMetadata {
    pub fn parameter_type(&self, index: usize) -> ParamType {
        self.parameter_types
            .get(index)
            .copied()
            .unwrap_or(ParamType::Unknown)
    }
}

/// A live database connection.
///
/// Connections are used by one worker at a time; they only need to be `Send`.
pub trait Connection: Send {
    /// Prepares `sql` and reports its placeholder metadata.
    fn prepare(&mut self, sql: &str) -> std::result::Result<StatementMetadata, DriverError>;

    /// Executes a previously prepared `sql` with positional parameters.
    fn query(
        &mut self,
        sql: &str,
        params: &[SqlParam],
    ) -> std::result::Result<Vec<Row>, DriverError>;

    fn close(self: Box<Self>) -> std::result::Result<(), DriverError> {
        Ok(())
    }
}

/// Opens connections from a fixed database descriptor.
pub trait ConnectionFactory: Send + Sync {
    fn connect(&self) -> std::result::Result<Box<dyn Connection>, DriverError>;
}

type Constructor = Box<
    dyn Fn(&DatabaseConfig) -> std::result::Result<Arc<dyn ConnectionFactory>, DriverError>
        + Send
        + Sync,
>;

/// Maps a data-source tag to the constructor of its connection factory.
#[derive(Default)]
pub struct DriverRegistry {
    constructors: HashMap<String, Constructor>,
}

impl DriverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the drivers compiled into this crate.
    pub fn with_builtin() -> Self {
        #[allow(unused_mut)]
        let mut registry = Self::new();
        #[cfg(feature = "sqlite")]
        registry.register("sqlite", |config| {
            let factory: Arc<dyn ConnectionFactory> =
                Arc::new(sqlite::SqliteFactory::from_config(config)?);
            Ok(factory)
        });
        registry
    }

    pub fn register<F>(&mut self, tag: &str, constructor: F)
    where
        F: Fn(&DatabaseConfig) -> std::result::Result<Arc<dyn ConnectionFactory>, DriverError>
            + Send
            + Sync
            + 'static,
    {
        self.constructors
            .insert(tag.to_lowercase(), Box::new(constructor));
    }

    pub fn contains(&self, tag: &str) -> bool {
        self.constructors.contains_key(&tag.to_lowercase())
    }

    /// Builds the connection factory for `config.driver`.
    pub fn resolve(&self, config: &DatabaseConfig) -> Result<Arc<dyn ConnectionFactory>> {
        let constructor = self
            .constructors
            .get(&config.driver.to_lowercase())
            .ok_or_else(|| {
                ReaderError::Configuration(format!(
                    "No driver registered for data source type '{}'",
                    config.driver
                ))
            })?;
        constructor(config).map_err(|e| {
            ReaderError::Configuration(format!(
                "Unable to build connection factory for '{}': {}",
                config.driver, e
            ))
        })
    }
}

/// Counts `?` placeholders that sit outside quoted literals.
pub fn count_placeholders(sql: &str) -> usize {
    let mut count = 0;
    let mut quote: Option<char> = None;
    for c in sql.chars() {
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => {}
            None => match c {
                '\'' | '"' => quote = Some(c),
                '?' => count += 1,
                _ => {}
            },
        }
    }
    count
}
