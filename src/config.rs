//! Reader configuration: database descriptor, engine options and query catalog,
//! all read from one XML document.

use std::fs;
use std::path::Path;
use std::time::Duration;

use tracing::info;

use crate::catalog::QueryCatalog;
use crate::error::{ReaderError, Result};
use crate::xml::{parse_document, Element};

pub const DEFAULT_MAX_THREADS: usize = 6;
pub const DEFAULT_WINDOW: usize = 5;
pub const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(30);

/// SQLSTATE codes treated as "connection no longer valid" unless configured otherwise.
pub const DEFAULT_CONNECTION_LOST_CODES: [&str; 2] = ["08003", "08006"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseConfig {
    /// Data-source tag resolved through the driver registry.
    pub driver: String,
    pub connect_url: String,
    pub user: Option<String>,
    pub password: Option<String>,
    pub acquire_timeout: Duration,
    pub connection_lost_codes: Vec<String>,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            driver: String::new(),
            connect_url: String::new(),
            user: None,
            password: None,
            acquire_timeout: DEFAULT_ACQUIRE_TIMEOUT,
            connection_lost_codes: DEFAULT_CONNECTION_LOST_CODES
                .iter()
                .map(|c| c.to_string())
                .collect(),
        }
    }
}

impl DatabaseConfig {
    fn from_element(bdd: &Element) -> Result<Self> {
        let driver = bdd.child_text("className").ok_or_else(|| {
            ReaderError::Configuration("Database descriptor has no <className>".to_string())
        })?;
        let connect_url = bdd.child_text("connectURL").ok_or_else(|| {
            ReaderError::Configuration("Database descriptor has no <connectURL>".to_string())
        })?;

        let mut config = Self {
            driver: driver.to_string(),
            connect_url: connect_url.to_string(),
            user: bdd.child_text("user").map(str::to_string),
            password: bdd.child_text("password").map(str::to_string),
            ..Self::default()
        };

        if let Some(timeout) = bdd.child_text("acquireTimeout") {
            let secs: u64 = timeout.parse().map_err(|_| {
                ReaderError::Configuration(format!("Invalid <acquireTimeout>: '{}'", timeout))
            })?;
            config.acquire_timeout = Duration::from_secs(secs);
        }

        let codes: Vec<String> = bdd
            .children_named("connectionLostCode")
            .map(|c| c.text.trim().to_string())
            .filter(|c| !c.is_empty())
            .collect();
        if !codes.is_empty() {
            config.connection_lost_codes = codes;
        }

        Ok(config)
    }

    pub fn is_connection_lost(&self, code: Option<&str>) -> bool {
        code.is_some_and(|code| self.connection_lost_codes.iter().any(|c| c == code))
    }
}

/// Engine-level switches fixed at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineOptions {
    pub parallel: bool,
    pub max_threads: usize,
    /// Maximum number of statement executions in flight at once.
    pub window: usize,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            parallel: false,
            max_threads: DEFAULT_MAX_THREADS,
            window: DEFAULT_WINDOW,
        }
    }
}

impl EngineOptions {
    fn from_root(root: &Element) -> Result<Self> {
        let mut options = Self::default();
        if let Some(parallel) = root.attribute("parallel") {
            options.parallel = parse_bool(parallel)?;
        }
        if let Some(threads) = root.attribute("maxThreads") {
            options.max_threads = parse_positive("maxThreads", threads)?;
        }
        if let Some(window) = root.attribute("window") {
            options.window = parse_positive("window", window)?;
        }
        Ok(options)
    }
}

#[derive(Debug, Clone)]
pub struct ReaderConfig {
    pub name: Option<String>,
    pub database: Option<DatabaseConfig>,
    pub options: EngineOptions,
    pub catalog: QueryCatalog,
}

impl ReaderConfig {
    pub fn from_path(path: &Path) -> Result<Self> {
        if !path.is_file() {
            return Err(ReaderError::Configuration(format!(
                "Configuration file not found: {}",
                path.display()
            )));
        }
        info!("Loading reader configuration: {:?}", path);
        let content = fs::read_to_string(path)?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let root = parse_document(content)?;

        let queries = root.child("queries").ok_or_else(|| {
            ReaderError::Configuration("The configuration has no <queries> section".to_string())
        })?;
        let catalog = QueryCatalog::from_element(queries)?;

        let database = root.child("bdd").map(DatabaseConfig::from_element).transpose()?;

        Ok(Self {
            name: root.attribute("name").map(str::to_string),
            database,
            options: EngineOptions::from_root(&root)?,
            catalog,
        })
    }

    /// Database descriptor, required by every engine that talks to a database.
    pub fn require_database(&self) -> Result<&DatabaseConfig> {
        self.database.as_ref().ok_or_else(|| {
            ReaderError::Configuration("The configuration has no <bdd> database descriptor".to_string())
        })
    }
}

fn parse_bool(value: &str) -> Result<bool> {
    match value.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        other => Err(ReaderError::Configuration(format!(
            "Invalid boolean value '{}'",
            other
        ))),
    }
}

fn parse_positive(name: &str, value: &str) -> Result<usize> {
    match value.trim().parse::<usize>() {
        Ok(n) if n > 0 => Ok(n),
        _ => Err(ReaderError::Configuration(format!(
            "{} must be a positive integer, got '{}'",
            name, value
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const CONFIG: &str = r#"
        <Automatic name="sos" parallel="true" maxThreads="4" window="3">
            <bdd>
                <className>sqlite</className>
                <connectURL>/data/observations.db</connectURL>
                <user>reader</user>
                <acquireTimeout>5</acquireTimeout>
                <connectionLostCode>57P01</connectionLostCode>
            </bdd>
            <queries>
                <single>
                    <query name="offering">
                        <select><col var="offeringName">name</col></select>
                        <from>offerings</from>
                        <where>id = ?</where>
                    </query>
                </single>
            </queries>
        </Automatic>"#;

    #[test]
    fn test_parse_full_configuration() {
        let config = ReaderConfig::parse(CONFIG).unwrap();
        assert_eq!(config.name.as_deref(), Some("sos"));
        assert_eq!(
            config.options,
            EngineOptions {
                parallel: true,
                max_threads: 4,
                window: 3
            }
        );

        let db = config.require_database().unwrap();
        assert_eq!(db.driver, "sqlite");
        assert_eq!(db.user.as_deref(), Some("reader"));
        assert_eq!(db.password, None);
        assert_eq!(db.acquire_timeout, Duration::from_secs(5));
        assert!(db.is_connection_lost(Some("57P01")));
        assert!(!db.is_connection_lost(Some("08006")));
        assert!(!db.is_connection_lost(None));
        assert!(config.catalog.owner_of("offeringName").is_some());
    }

    #[test]
    fn test_defaults_apply() {
        let config = ReaderConfig::parse("<Automatic><queries/></Automatic>").unwrap();
        assert_eq!(config.options, EngineOptions::default());
        assert!(config.database.is_none());
        assert!(matches!(
            config.require_database(),
            Err(ReaderError::Configuration(_))
        ));
        assert!(DatabaseConfig::default().is_connection_lost(Some("08006")));
    }

    #[test]
    fn test_missing_queries_section_is_fatal() {
        let err = ReaderConfig::parse("<Automatic><bdd/></Automatic>").unwrap_err();
        assert!(err.to_string().contains("<queries>"));
    }

    #[test]
    fn test_malformed_document_is_fatal() {
        assert!(ReaderConfig::parse("<Automatic><queries></Automatic>").is_err());
    }

    #[test]
    fn test_invalid_option_is_fatal() {
        let err = ReaderConfig::parse(r#"<Automatic window="0"><queries/></Automatic>"#).unwrap_err();
        assert!(matches!(err, ReaderError::Configuration(_)));
    }

    #[test]
    fn test_from_path() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("reader.xml");
        fs::write(&path, CONFIG).unwrap();
        assert!(ReaderConfig::from_path(&path).is_ok());
        assert!(ReaderConfig::from_path(&dir.path().join("absent.xml")).is_err());
    }
}
