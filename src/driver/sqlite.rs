//! SQLite driver backed by `rusqlite`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use rusqlite::types::{Value, ValueRef};
use rusqlite::{ErrorCode, OpenFlags};

use super::{Connection, ConnectionFactory, DriverError, ParamType, Row, SqlParam, StatementMetadata};
use crate::config::DatabaseConfig;

const BUSY_TIMEOUT_MS: u64 = 100;

/// SQLSTATE reported when the database file cannot be opened.
pub const SQLSTATE_UNABLE_TO_CONNECT: &str = "08001";
/// SQLSTATE reported when an open database stops answering.
pub const SQLSTATE_CONNECTION_FAILURE: &str = "08006";

pub struct SqliteConnection {
    conn: rusqlite::Connection,
}

impl SqliteConnection {
    pub fn open_read_only(path: &Path) -> Result<Self, DriverError> {
        let conn = rusqlite::Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(map_error)?;
        conn.busy_timeout(Duration::from_millis(BUSY_TIMEOUT_MS))
            .map_err(map_error)?;
        conn.pragma_update(None, "query_only", 1)
            .map_err(map_error)?;
        Ok(Self { conn })
    }
}

impl Connection for SqliteConnection {
    fn prepare(&mut self, sql: &str) -> Result<StatementMetadata, DriverError> {
        let stmt = self.conn.prepare_cached(sql).map_err(map_error)?;
        let parameter_count = stmt.parameter_count();
        // SQLite placeholders are untyped; binding relies on column affinity.
        Ok(StatementMetadata {
            parameter_count: Some(parameter_count),
            parameter_types: vec![ParamType::Unknown; parameter_count],
        })
    }

    fn query(&mut self, sql: &str, params: &[SqlParam]) -> Result<Vec<Row>, DriverError> {
        let mut stmt = self.conn.prepare_cached(sql).map_err(map_error)?;
        let column_count = stmt.column_count();
        let values: Vec<Value> = params
            .iter()
            .map(|p| match p {
                SqlParam::Integer(i) => Value::Integer(*i),
                SqlParam::Text(s) => Value::Text(s.clone()),
            })
            .collect();

        let mut rows = stmt
            .query(rusqlite::params_from_iter(values.iter()))
            .map_err(map_error)?;
        let mut result = Vec::new();
        while let Some(row) = rows.next().map_err(map_error)? {
            let mut columns = Vec::with_capacity(column_count);
            for i in 0..column_count {
                let value = match row.get_ref(i).map_err(map_error)? {
                    ValueRef::Null => None,
                    ValueRef::Integer(v) => Some(v.to_string()),
                    ValueRef::Real(v) => Some(v.to_string()),
                    ValueRef::Text(t) | ValueRef::Blob(t) => {
                        Some(String::from_utf8_lossy(t).into_owned())
                    }
                };
                columns.push(value);
            }
            result.push(columns);
        }
        Ok(result)
    }

    fn close(self: Box<Self>) -> Result<(), DriverError> {
        self.conn.close().map_err(|(_, e)| map_error(e))
    }
}

pub struct SqliteFactory {
    path: PathBuf,
}

impl SqliteFactory {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Accepts a bare path or a `jdbc:sqlite:` / `sqlite:` URL.
    pub fn from_config(config: &DatabaseConfig) -> Result<Self, DriverError> {
        let url = config.connect_url.trim();
        let path = url
            .strip_prefix("jdbc:sqlite:")
            .or_else(|| url.strip_prefix("sqlite:"))
            .unwrap_or(url);
        if path.is_empty() {
            return Err(DriverError::new("sqlite data source needs a connectURL"));
        }
        Ok(Self::new(path))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ConnectionFactory for SqliteFactory {
    fn connect(&self) -> Result<Box<dyn Connection>, DriverError> {
        let conn = SqliteConnection::open_read_only(&self.path)?;
        Ok(Box::new(conn))
    }
}

fn map_error(err: rusqlite::Error) -> DriverError {
    match &err {
        rusqlite::Error::SqliteFailure(failure, _) => match failure.code {
            ErrorCode::CannotOpen => {
                DriverError::with_code(SQLSTATE_UNABLE_TO_CONNECT, err.to_string())
            }
            ErrorCode::SystemIoFailure | ErrorCode::NotADatabase | ErrorCode::DatabaseCorrupt => {
                DriverError::with_code(SQLSTATE_CONNECTION_FAILURE, err.to_string())
            }
            _ => DriverError::new(err.to_string()),
        },
        _ => DriverError::new(err.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn create_db(dir: &TempDir) -> PathBuf {
        let path = dir.path().join("obs.db");
        let conn = rusqlite::Connection::open(&path).unwrap();
        conn.execute_batch(
            "CREATE TABLE phenomenon (id INTEGER PRIMARY KEY, name TEXT, depth REAL);
             INSERT INTO phenomenon VALUES (1, 'temperature', 1.5);
             INSERT INTO phenomenon VALUES (2, NULL, 3.0);",
        )
        .unwrap();
        path
    }

    #[test]
    fn test_prepare_reports_parameter_count() {
        let dir = TempDir::new().unwrap();
        let path = create_db(&dir);
        let mut conn = SqliteConnection::open_read_only(&path).unwrap();

        let meta = conn
            .prepare("SELECT name FROM phenomenon WHERE id = ? AND depth > ?")
            .unwrap();
        assert_eq!(meta.parameter_count, Some(2));
        assert_eq!(meta.parameter_type(0), ParamType::Unknown);
    }

    #[test]
    fn test_query_renders_columns_as_text() {
        let dir = TempDir::new().unwrap();
        let path = create_db(&dir);
        let mut conn = SqliteConnection::open_read_only(&path).unwrap();

        let rows = conn
            .query(
                "SELECT id, name, depth FROM phenomenon ORDER BY id",
                &[],
            )
            .unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(
            rows[0],
            vec![
                Some("1".to_string()),
                Some("temperature".to_string()),
                Some("1.5".to_string())
            ]
        );
        assert_eq!(rows[1][1], None);
    }

    #[test]
    fn test_syntax_error_has_no_connection_code() {
        let dir = TempDir::new().unwrap();
        let path = create_db(&dir);
        let mut conn = SqliteConnection::open_read_only(&path).unwrap();

        let err = conn.prepare("SELEC name FROM phenomenon").unwrap_err();
        assert_eq!(err.code, None);
    }

    #[test]
    fn test_missing_file_reports_unable_to_connect() {
        let dir = TempDir::new().unwrap();
        let factory = SqliteFactory::new(dir.path().join("missing.db"));
        let err = factory.connect().err().unwrap();
        assert_eq!(err.code.as_deref(), Some(SQLSTATE_UNABLE_TO_CONNECT));
    }

    #[test]
    fn test_factory_strips_url_prefix() {
        let config = DatabaseConfig {
            driver: "sqlite".to_string(),
            connect_url: "jdbc:sqlite:/data/sos.db".to_string(),
            ..DatabaseConfig::default()
        };
        let factory = SqliteFactory::from_config(&config).unwrap();
        assert_eq!(factory.path(), Path::new("/data/sos.db"));
    }
}
