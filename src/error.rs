use thiserror::Error;

use crate::driver::DriverError;

#[derive(Error, Debug)]
pub enum ReaderError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Failed to prepare query '{query}': {source}\nSQL: {sql}")]
    Preparation {
        query: String,
        sql: String,
        #[source]
        source: DriverError,
    },

    #[error("Failed to execute query for variables [{}]: {source}\nSQL: {sql}", .variables.join(", "))]
    Execution {
        sql: String,
        variables: Vec<String>,
        #[source]
        source: DriverError,
    },

    #[error("The database connection was lost, please retry: {0}")]
    ConnectionLost(String),

    #[error("Parameter count mismatch for query '{query}': expected {expected}, got {actual}")]
    ParameterMismatch {
        query: String,
        expected: usize,
        actual: usize,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("XML parse error: {0}")]
    Xml(#[from] quick_xml::Error),
}

impl ReaderError {
    /// True for the error that asks the caller to retry after a reconnection.
    pub fn is_retry_recommended(&self) -> bool {
        matches!(self, ReaderError::ConnectionLost(_))
    }
}

pub type Result<T> = std::result::Result<T, ReaderError>;
