//! Connection pooling on top of `r2d2`.
//!
//! Every in-flight statement execution checks out its own connection, so no
//! connection is ever shared between worker threads. Connections are closed
//! through the driver when r2d2 drops them, including the ones still checked
//! out of a pool that a reconnection has replaced.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use r2d2::{HandleError, ManageConnection, PooledConnection};
use tracing::{debug, warn};

use crate::driver::{Connection, ConnectionFactory, DriverError, Row, SqlParam};

/// r2d2 rejects a zero connection timeout.
const MIN_ACQUIRE_TIMEOUT: Duration = Duration::from_millis(1);

/// A driver connection owned by the pool.
pub struct ManagedConnection {
    inner: Option<Box<dyn Connection>>,
    broken: bool,
}

impl ManagedConnection {
    pub fn new(conn: Box<dyn Connection>) -> Self {
        Self {
            inner: Some(conn),
            broken: false,
        }
    }

    pub fn query(&mut self, sql: &str, params: &[SqlParam]) -> Result<Vec<Row>, DriverError> {
        match self.inner.as_mut() {
            Some(conn) => conn.query(sql, params),
            None => Err(DriverError::new("connection already closed")),
        }
    }

    /// Keeps the connection from going back to the pool.
    pub fn mark_broken(&mut self) {
        self.broken = true;
    }

    pub fn is_broken(&self) -> bool {
        self.broken
    }
}

impl Drop for ManagedConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.inner.take() {
            if let Err(e) = conn.close() {
                warn!("Failed to close database connection: {}", e);
            }
        }
    }
}

pub struct ConnectionManager {
    factory: Arc<dyn ConnectionFactory>,
}

impl ConnectionManager {
    pub fn new(factory: Arc<dyn ConnectionFactory>) -> Self {
        Self { factory }
    }
}

impl ManageConnection for ConnectionManager {
    type Connection = ManagedConnection;
    type Error = DriverError;

    fn connect(&self) -> Result<ManagedConnection, DriverError> {
        debug!("Opening pooled database connection");
        self.factory.connect().map(ManagedConnection::new)
    }

    fn is_valid(&self, conn: &mut ManagedConnection) -> Result<(), DriverError> {
        if conn.broken {
            Err(DriverError::new("connection marked as broken"))
        } else {
            Ok(())
        }
    }

    fn has_broken(&self, conn: &mut ManagedConnection) -> bool {
        conn.broken
    }
}

/// Keeps the latest connect failure so its code outlives r2d2's
/// message-only timeout error.
#[derive(Debug, Clone, Default)]
struct ConnectErrors(Arc<Mutex<Option<DriverError>>>);

impl ConnectErrors {
    fn take(&self) -> Option<DriverError> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).take()
    }
}

impl HandleError<DriverError> for ConnectErrors {
    fn handle_error(&self, error: DriverError) {
        warn!("Failed to open a pooled connection: {}", error);
        *self.0.lock().unwrap_or_else(PoisonError::into_inner) = Some(error);
    }
}

#[derive(Debug)]
pub enum AcquireError {
    /// No connection became available in time.
    Timeout(r2d2::Error),
    /// Opening a connection failed.
    Connect(DriverError),
}

impl std::fmt::Display for AcquireError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AcquireError::Timeout(e) => write!(f, "{}", e),
            AcquireError::Connect(e) => write!(f, "unable to open a connection: {}", e),
        }
    }
}

impl From<AcquireError> for DriverError {
    fn from(err: AcquireError) -> Self {
        match err {
            AcquireError::Connect(e) => e,
            AcquireError::Timeout(e) => DriverError::new(e.to_string()),
        }
    }
}

pub struct ConnectionPool {
    pool: r2d2::Pool<ConnectionManager>,
    connect_errors: ConnectErrors,
}

impl ConnectionPool {
    /// Builds a lazy pool of at most `size` connections. Nothing is opened
    /// until the first checkout.
    pub fn new(factory: Arc<dyn ConnectionFactory>, size: usize, timeout: Duration) -> Self {
        let connect_errors = ConnectErrors::default();
        let pool = r2d2::Pool::<ConnectionManager>::builder()
            .max_size(u32::try_from(size.max(1)).unwrap_or(u32::MAX))
            .min_idle(Some(0))
            .connection_timeout(timeout.max(MIN_ACQUIRE_TIMEOUT))
            .error_handler(Box::new(connect_errors.clone()))
            .build_unchecked(ConnectionManager::new(factory));
        Self {
            pool,
            connect_errors,
        }
    }

    /// Checks out a connection, waiting up to the configured timeout.
    pub fn acquire(&self) -> Result<PooledConnection<ConnectionManager>, AcquireError> {
        self.pool.get().map_err(|e| match self.connect_errors.take() {
            Some(connect) => AcquireError::Connect(connect),
            None => AcquireError::Timeout(e),
        })
    }

    pub fn idle_count(&self) -> u32 {
        self.pool.state().idle_connections
    }

    pub fn open_count(&self) -> u32 {
        self.pool.state().connections
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Default)]
    struct Counters {
        opened: AtomicUsize,
        closed: AtomicUsize,
        refuse: AtomicBool,
    }

    struct CountingConnection(Arc<Counters>);

    impl Connection for CountingConnection {
        fn prepare(&mut self, _sql: &str) -> Result<crate::driver::StatementMetadata, DriverError> {
            Ok(Default::default())
        }

        fn query(&mut self, _sql: &str, _params: &[SqlParam]) -> Result<Vec<Row>, DriverError> {
            Ok(vec![vec![Some("1".to_string())]])
        }

        fn close(self: Box<Self>) -> Result<(), DriverError> {
            self.0.closed.fetch_add(1, Ordering::SeqCst);
            Err(DriverError::new("close reported a failure"))
        }
    }

    struct CountingFactory(Arc<Counters>);

    impl ConnectionFactory for CountingFactory {
        fn connect(&self) -> Result<Box<dyn Connection>, DriverError> {
            if self.0.refuse.load(Ordering::SeqCst) {
                return Err(DriverError::with_code("08001", "connection refused"));
            }
            self.0.opened.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(CountingConnection(Arc::clone(&self.0))))
        }
    }

    fn pool(counters: &Arc<Counters>, size: usize) -> ConnectionPool {
        ConnectionPool::new(
            Arc::new(CountingFactory(Arc::clone(counters))),
            size,
            Duration::from_millis(100),
        )
    }

    #[test]
    fn pool_is_lazy_and_reuses_connections() {
        let counters = Arc::new(Counters::default());
        let pool = pool(&counters, 2);
        assert_eq!(pool.open_count(), 0);

        let mut conn = pool.acquire().unwrap();
        assert_eq!(conn.query("SELECT 1", &[]).unwrap().len(), 1);
        drop(conn);
        assert_eq!(pool.idle_count(), 1);

        let _again = pool.acquire().unwrap();
        assert_eq!(counters.opened.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn pool_timeout_when_exhausted() {
        let counters = Arc::new(Counters::default());
        let pool = pool(&counters, 1);
        let _held = pool.acquire().unwrap();
        assert!(matches!(pool.acquire(), Err(AcquireError::Timeout(_))));
    }

    #[test]
    fn pool_connect_failure_keeps_code() {
        let counters = Arc::new(Counters::default());
        counters.refuse.store(true, Ordering::SeqCst);
        let pool = pool(&counters, 1);

        match pool.acquire() {
            Err(AcquireError::Connect(e)) => assert_eq!(e.code.as_deref(), Some("08001")),
            Err(other) => panic!("unexpected error: {}", other),
            Ok(_) => panic!("connection should have been refused"),
        }
    }

    #[test]
    fn broken_connection_is_closed_not_reused() {
        let counters = Arc::new(Counters::default());
        let pool = pool(&counters, 1);

        let mut conn = pool.acquire().unwrap();
        conn.mark_broken();
        assert!(conn.is_broken());
        drop(conn);
        assert_eq!(pool.idle_count(), 0);
        assert_eq!(counters.closed.load(Ordering::SeqCst), 1);

        let _fresh = pool.acquire().unwrap();
        assert_eq!(counters.opened.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn dropping_the_pool_closes_idle_connections() {
        let counters = Arc::new(Counters::default());
        let pool = pool(&counters, 2);
        let first = pool.acquire().unwrap();
        let second = pool.acquire().unwrap();
        drop(first);
        drop(second);
        drop(pool);

        // r2d2's connector thread may hold the last pool handle for a moment
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while counters.closed.load(Ordering::SeqCst) < 2 && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(counters.closed.load(Ordering::SeqCst), 2);
    }
}
