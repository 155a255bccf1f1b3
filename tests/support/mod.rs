#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use ogc_generic_reader::driver::{
    count_placeholders, ParamType, Row, SqlParam, StatementMetadata,
};
use ogc_generic_reader::{Connection, ConnectionFactory, DriverError};

/// In-memory database answering exact SQL strings, recording every call.
#[derive(Default)]
pub struct MockDb {
    rows: Mutex<HashMap<String, Vec<Row>>>,
    failures: Mutex<HashMap<String, DriverError>>,
    integer_params: Mutex<bool>,
    delay: Mutex<Option<Duration>>,
    connect_gate: Mutex<Option<(Sender<()>, Receiver<()>)>>,
    connect_failure: Mutex<Option<DriverError>>,
    pub executed: Mutex<Vec<(String, Vec<SqlParam>)>>,
    pub queries: AtomicUsize,
    pub connects: AtomicUsize,
    pub closes: AtomicUsize,
    active: AtomicUsize,
    pub max_active: AtomicUsize,
}

impl MockDb {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_rows(&self, sql: &str, rows: Vec<Vec<&str>>) {
        let rows = rows
            .into_iter()
            .map(|r| r.into_iter().map(|c| Some(c.to_string())).collect())
            .collect();
        self.rows.lock().unwrap().insert(sql.to_string(), rows);
    }

    pub fn fail(&self, sql: &str, error: DriverError) {
        self.failures
            .lock()
            .unwrap()
            .insert(sql.to_string(), error);
    }

    pub fn clear_failures(&self) {
        self.failures.lock().unwrap().clear();
    }

    pub fn report_integer_params(&self) {
        *self.integer_params.lock().unwrap() = true;
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    /// The next `connect` signals `entered`, then blocks until `release` fires.
    pub fn hold_next_connect(&self, entered: Sender<()>, release: Receiver<()>) {
        *self.connect_gate.lock().unwrap() = Some((entered, release));
    }

    /// Every `connect` fails with `error` until [`MockDb::accept_connects`].
    pub fn refuse_connects(&self, error: DriverError) {
        *self.connect_failure.lock().unwrap() = Some(error);
    }

    pub fn accept_connects(&self) {
        *self.connect_failure.lock().unwrap() = None;
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn query_count(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }

    pub fn executed_sql(&self) -> Vec<String> {
        self.executed
            .lock()
            .unwrap()
            .iter()
            .map(|(sql, _)| sql.clone())
            .collect()
    }
}

pub struct MockConnection {
    db: Arc<MockDb>,
}

impl Connection for MockConnection {
    fn prepare(&mut self, sql: &str) -> Result<StatementMetadata, DriverError> {
        if sql.contains("missing_table") {
            return Err(DriverError::with_code("42P01", "relation missing_table does not exist"));
        }
        let count = count_placeholders(sql);
        let kind = if *self.db.integer_params.lock().unwrap() {
            ParamType::Integer
        } else {
            ParamType::Unknown
        };
        Ok(StatementMetadata {
            parameter_count: Some(count),
            parameter_types: vec![kind; count],
        })
    }

    fn query(&mut self, sql: &str, params: &[SqlParam]) -> Result<Vec<Row>, DriverError> {
        self.db.queries.fetch_add(1, Ordering::SeqCst);
        let active = self.db.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.db.max_active.fetch_max(active, Ordering::SeqCst);

        let delay = *self.db.delay.lock().unwrap();
        if let Some(delay) = delay {
            thread::sleep(delay);
        }
        self.db
            .executed
            .lock()
            .unwrap()
            .push((sql.to_string(), params.to_vec()));

        let failure = self.db.failures.lock().unwrap().get(sql).cloned();
        let result = match failure {
            Some(e) => Err(e),
            None => Ok(self
                .db
                .rows
                .lock()
                .unwrap()
                .get(sql)
                .cloned()
                .unwrap_or_default()),
        };
        self.db.active.fetch_sub(1, Ordering::SeqCst);
        result
    }

    fn close(self: Box<Self>) -> Result<(), DriverError> {
        self.db.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub struct MockFactory {
    pub db: Arc<MockDb>,
}

impl ConnectionFactory for MockFactory {
    fn connect(&self) -> Result<Box<dyn Connection>, DriverError> {
        if let Some(error) = self.db.connect_failure.lock().unwrap().clone() {
            return Err(error);
        }
        self.db.connects.fetch_add(1, Ordering::SeqCst);
        let gate = self.db.connect_gate.lock().unwrap().take();
        if let Some((entered, release)) = gate {
            entered.send(()).unwrap();
            release.recv().unwrap();
        }
        Ok(Box::new(MockConnection {
            db: Arc::clone(&self.db),
        }))
    }
}

pub fn factory(db: &Arc<MockDb>) -> Arc<dyn ConnectionFactory> {
    Arc::new(MockFactory { db: Arc::clone(db) })
}
