//! Query execution engine.
//!
//! [`GenericReader`] resolves requested variables to the compiled statements
//! owning them, runs each needed statement once and merges the rows into a
//! [`Values`] container. Statements run either one after the other or on a
//! fixed rayon pool with a bounded number of executions in flight.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, PoisonError, RwLock};

use rayon::{ThreadPool, ThreadPoolBuilder};
use tracing::{debug, error, info, warn};

use crate::catalog::{QueryCatalog, QueryKind};
use crate::compiler::{compile, CompiledCatalog, CompiledStatement};
use crate::config::{DatabaseConfig, EngineOptions, ReaderConfig};
use crate::driver::{ConnectionFactory, DriverError, DriverRegistry, ParamType, Row, SqlParam};
use crate::error::{ReaderError, Result};
use crate::pool::{AcquireError, ConnectionPool};
use crate::values::Values;

struct EngineState {
    compiled: CompiledCatalog,
    pool: ConnectionPool,
}

enum Backend {
    Database {
        database: DatabaseConfig,
        factory: Arc<dyn ConnectionFactory>,
        state: RwLock<Arc<EngineState>>,
    },
    /// Canned results keyed by the exact parameter list.
    Debug(HashMap<Vec<String>, Values>),
}

pub struct GenericReader {
    catalog: QueryCatalog,
    options: EngineOptions,
    backend: Backend,
    workers: Option<ThreadPool>,
    reloading: AtomicBool,
    reconnections: AtomicUsize,
}

impl GenericReader {
    /// Builds an engine from a configuration, resolving its driver through `registry`.
    pub fn new(config: &ReaderConfig, registry: &DriverRegistry) -> Result<Self> {
        let database = config.require_database()?;
        let factory = registry.resolve(database)?;
        Self::with_factory(
            config.catalog.clone(),
            database.clone(),
            config.options,
            factory,
        )
    }

    /// Builds an engine on an explicit connection factory.
    pub fn with_factory(
        catalog: QueryCatalog,
        database: DatabaseConfig,
        options: EngineOptions,
        factory: Arc<dyn ConnectionFactory>,
    ) -> Result<Self> {
        let workers = build_workers(&options)?;
        let state = connect_and_compile(&factory, &catalog, &database, &options)?;
        info!(
            "Generic reader ready: {} statements, {} mode",
            state.compiled.statements().len(),
            if options.parallel { "parallel" } else { "sequential" }
        );
        Ok(Self {
            catalog,
            options,
            backend: Backend::Database {
                database,
                factory,
                state: RwLock::new(Arc::new(state)),
            },
            workers,
            reloading: AtomicBool::new(false),
            reconnections: AtomicUsize::new(0),
        })
    }

    /// Builds an engine that never touches a database and serves `canned`
    /// values keyed by parameter list. Static parameters still resolve.
    pub fn debug(catalog: QueryCatalog, canned: HashMap<Vec<String>, Values>) -> Self {
        Self {
            catalog,
            options: EngineOptions::default(),
            backend: Backend::Debug(canned),
            workers: None,
            reloading: AtomicBool::new(false),
            reconnections: AtomicUsize::new(0),
        }
    }

    pub fn load_data<V: AsRef<str>>(&self, variables: &[V]) -> Result<Values> {
        self.load_data_with(variables, &[] as &[&str])
    }

    pub fn load_data_for<V: AsRef<str>>(&self, variables: &[V], parameter: &str) -> Result<Values> {
        self.load_data_with(variables, &[parameter])
    }

    /// Runs the statements owning `variables` with positional `parameters`.
    ///
    /// Unknown variables and per-statement SQL failures are logged and left
    /// out of the result. A parameter count that does not match a needed
    /// statement fails before anything runs. A lost connection triggers a
    /// reload and fails this call with [`ReaderError::ConnectionLost`].
    pub fn load_data_with<V: AsRef<str>, P: AsRef<str>>(
        &self,
        variables: &[V],
        parameters: &[P],
    ) -> Result<Values> {
        let parameters: Vec<String> = parameters.iter().map(|p| p.as_ref().to_string()).collect();

        // A static parameter answers the whole call on its own.
        for var in variables {
            let var = var.as_ref();
            if let Some(value) = self.catalog.static_parameter(var) {
                let mut values = Values::new();
                values.add_to_single_value(var, value);
                return Ok(values);
            }
        }

        let state = match &self.backend {
            Backend::Debug(_) => return Ok(self.debug_load(&parameters).unwrap_or_default()),
            Backend::Database { state, .. } => {
                Arc::clone(&state.read().unwrap_or_else(PoisonError::into_inner))
            }
        };

        let statements = select_statements(&state.compiled, variables);
        for stmt in &statements {
            if stmt.parameter_count != parameters.len() {
                return Err(ReaderError::ParameterMismatch {
                    query: stmt.name.clone(),
                    expected: stmt.parameter_count,
                    actual: parameters.len(),
                });
            }
        }

        let mut values = Values::new();
        for kind in [QueryKind::Single, QueryKind::Multi] {
            let phase: Vec<&Arc<CompiledStatement>> =
                statements.iter().filter(|s| s.kind == kind).collect();
            if phase.is_empty() {
                continue;
            }
            let results = match &self.workers {
                Some(workers) => self.run_parallel(workers, &state, &phase, &parameters),
                None => self.run_sequential(&state, &phase, &parameters),
            };
            if let Some(fatal) = absorb(results, &mut values) {
                warn!("Aborting request: {}", fatal);
                return Err(self.reload_connection());
            }
        }
        Ok(values)
    }

    /// Canned values registered for exactly `parameters`, in debug mode.
    pub fn debug_load(&self, parameters: &[String]) -> Option<Values> {
        match &self.backend {
            Backend::Debug(canned) => canned.get(parameters).cloned(),
            Backend::Database { .. } => None,
        }
    }

    /// Reopens the database connection and recompiles every statement.
    ///
    /// Always yields [`ReaderError::ConnectionLost`] for the triggering call;
    /// the fresh connection serves the next calls. Callers arriving while a
    /// reload is running get the error immediately.
    pub fn reload_connection(&self) -> ReaderError {
        if self
            .reloading
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            warn!("Reconnection already in progress, skipping");
            return ReaderError::ConnectionLost(
                "a reconnection is already in progress".to_string(),
            );
        }
        self.reconnections.fetch_add(1, Ordering::SeqCst);

        if let Backend::Database {
            database,
            factory,
            state,
        } = &self.backend
        {
            info!("Reloading database connection");
            match connect_and_compile(factory, &self.catalog, database, &self.options) {
                Ok(fresh) => {
                    // The superseded pool closes its connections once the
                    // calls still using it let go.
                    *state.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(fresh);
                    info!("Database connection reloaded");
                }
                Err(e) => error!("Reconnection failed: {}", e),
            }
        }

        self.reloading.store(false, Ordering::SeqCst);
        ReaderError::ConnectionLost("the database connection has been reloaded".to_string())
    }

    pub fn is_parallel(&self) -> bool {
        self.workers.is_some()
    }

    pub fn reconnection_count(&self) -> usize {
        self.reconnections.load(Ordering::SeqCst)
    }

    /// Messages of the templates that failed to prepare.
    pub fn compile_failures(&self) -> Vec<String> {
        match &self.backend {
            Backend::Database { state, .. } => state
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .compiled
                .failures()
                .iter()
                .map(|e| e.to_string())
                .collect(),
            Backend::Debug(_) => Vec::new(),
        }
    }

    /// Every variable this engine can resolve, sorted.
    pub fn variable_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.catalog.static_parameters().keys().cloned().collect();
        match &self.backend {
            Backend::Database { state, .. } => names.extend(
                state
                    .read()
                    .unwrap_or_else(PoisonError::into_inner)
                    .compiled
                    .variable_names()
                    .map(str::to_string),
            ),
            Backend::Debug(_) => names.extend(
                self.catalog
                    .templates()
                    .iter()
                    .flat_map(|t| t.variables.iter().cloned()),
            ),
        }
        names.sort();
        names
    }

    fn run_sequential(
        &self,
        state: &EngineState,
        statements: &[&Arc<CompiledStatement>],
        parameters: &[String],
    ) -> Vec<(Arc<CompiledStatement>, Result<Values>)> {
        let mut results = Vec::with_capacity(statements.len());
        for stmt in statements {
            let result = self.run_statement(state, stmt, parameters);
            let fatal = matches!(result, Err(ReaderError::ConnectionLost(_)));
            results.push((Arc::clone(stmt), result));
            if fatal {
                break;
            }
        }
        results
    }

    /// Submits each statement to the worker pool, keeping at most
    /// `options.window` executions in flight. Results come back in
    /// submission order.
    fn run_parallel(
        &self,
        workers: &ThreadPool,
        state: &EngineState,
        statements: &[&Arc<CompiledStatement>],
        parameters: &[String],
    ) -> Vec<(Arc<CompiledStatement>, Result<Values>)> {
        let window = self.options.window.max(1);
        let mut slots: Vec<Option<Result<Values>>> = statements.iter().map(|_| None).collect();

        workers.in_place_scope(|scope| {
            let (tx, rx) = mpsc::channel::<(usize, Result<Values>)>();
            let mut in_flight = 0;

            for (index, stmt) in statements.iter().enumerate() {
                if in_flight == window {
                    match rx.recv() {
                        Ok((done, result)) => {
                            slots[done] = Some(result);
                            in_flight -= 1;
                        }
                        Err(_) => break,
                    }
                }
                let tx = tx.clone();
                scope.spawn(move |_| {
                    let result = self.run_statement(state, stmt, parameters);
                    let _ = tx.send((index, result));
                });
                in_flight += 1;
            }

            drop(tx);
            while in_flight > 0 {
                match rx.recv() {
                    Ok((done, result)) => {
                        slots[done] = Some(result);
                        in_flight -= 1;
                    }
                    Err(_) => break,
                }
            }
        });

        statements
            .iter()
            .zip(slots)
            .map(|(stmt, slot)| {
                let result = slot.unwrap_or_else(|| {
                    Err(ReaderError::Execution {
                        sql: stmt.sql.clone(),
                        variables: stmt.variables.clone(),
                        source: DriverError::new("worker finished without a result"),
                    })
                });
                (Arc::clone(stmt), result)
            })
            .collect()
    }

    /// Binds, executes and labels one statement on a pooled connection.
    fn run_statement(
        &self,
        state: &EngineState,
        stmt: &CompiledStatement,
        parameters: &[String],
    ) -> Result<Values> {
        let database = match &self.backend {
            Backend::Database { database, .. } => database,
            Backend::Debug(_) => return Ok(Values::new()),
        };

        let mut conn = match state.pool.acquire() {
            Ok(conn) => conn,
            Err(AcquireError::Connect(e)) if database.is_connection_lost(e.code.as_deref()) => {
                return Err(ReaderError::ConnectionLost(e.to_string()));
            }
            Err(e) => {
                return Err(ReaderError::Execution {
                    sql: stmt.sql.clone(),
                    variables: stmt.variables.clone(),
                    source: e.into(),
                });
            }
        };

        let params = bind_parameters(stmt, parameters);
        debug!("Executing '{}' with {:?}", stmt.name, params);
        match conn.query(&stmt.sql, &params) {
            Ok(rows) => Ok(label_rows(stmt, rows)),
            Err(e) if database.is_connection_lost(e.code.as_deref()) => {
                conn.mark_broken();
                Err(ReaderError::ConnectionLost(e.to_string()))
            }
            Err(source) => Err(ReaderError::Execution {
                sql: stmt.sql.clone(),
                variables: stmt.variables.clone(),
                source,
            }),
        }
    }
}

fn build_workers(options: &EngineOptions) -> Result<Option<ThreadPool>> {
    if !options.parallel {
        return Ok(None);
    }
    ThreadPoolBuilder::new()
        .num_threads(options.max_threads)
        .thread_name(|i| format!("generic-reader-{}", i))
        .build()
        .map(Some)
        .map_err(|e| ReaderError::Configuration(format!("Failed to build thread pool: {}", e)))
}

fn connect_and_compile(
    factory: &Arc<dyn ConnectionFactory>,
    catalog: &QueryCatalog,
    database: &DatabaseConfig,
    options: &EngineOptions,
) -> Result<EngineState> {
    let mut conn = factory.connect().map_err(|e| {
        ReaderError::Configuration(format!(
            "Unable to connect to '{}': {}",
            database.connect_url, e
        ))
    })?;
    let compiled = compile(&mut *conn, catalog);
    if let Err(e) = conn.close() {
        warn!("Failed to close the compilation connection: {}", e);
    }
    let pool = ConnectionPool::new(
        Arc::clone(factory),
        options.max_threads,
        database.acquire_timeout,
    );
    Ok(EngineState { compiled, pool })
}

/// Owning statements of `variables`, each once, in request order.
fn select_statements<V: AsRef<str>>(
    compiled: &CompiledCatalog,
    variables: &[V],
) -> Vec<Arc<CompiledStatement>> {
    let mut seen = HashSet::new();
    let mut statements = Vec::new();
    for var in variables {
        let var = var.as_ref();
        match compiled.statement_for(var) {
            Some((index, stmt)) => {
                if seen.insert(index) {
                    statements.push(Arc::clone(stmt));
                }
            }
            None => error!("No query found for the variable '{}'", var),
        }
    }
    statements
}

/// Merges statement results in order. Ordinary failures are logged; the
/// first lost-connection error is returned.
fn absorb(
    results: Vec<(Arc<CompiledStatement>, Result<Values>)>,
    values: &mut Values,
) -> Option<ReaderError> {
    let mut fatal = None;
    for (stmt, result) in results {
        match result {
            Ok(partial) => values.merge(partial),
            Err(e @ ReaderError::ConnectionLost(_)) => {
                error!("Connection lost while running '{}': {}", stmt.name, e);
                if fatal.is_none() {
                    fatal = Some(e);
                }
            }
            Err(e) => error!("{}", e),
        }
    }
    fatal
}

/// Integer-typed placeholders get integers when the value parses, text otherwise.
fn bind_parameters(stmt: &CompiledStatement, parameters: &[String]) -> Vec<SqlParam> {
    parameters
        .iter()
        .enumerate()
        .map(|(i, value)| match stmt.metadata.parameter_type(i) {
            ParamType::Integer => match value.trim().parse::<i64>() {
                Ok(n) => SqlParam::Integer(n),
                Err(_) => {
                    warn!(
                        "Parameter {} of '{}' is not an integer: '{}', binding as text",
                        i + 1,
                        stmt.name,
                        value
                    );
                    SqlParam::Text(value.clone())
                }
            },
            ParamType::Text | ParamType::Unknown => SqlParam::Text(value.clone()),
        })
        .collect()
}

/// Labels result columns with the statement's declared variables.
fn label_rows(stmt: &CompiledStatement, rows: Vec<Row>) -> Values {
    let mut values = Values::new();
    match stmt.kind {
        QueryKind::Single => {
            if rows.len() > 1 {
                warn!(
                    "Single query '{}' returned {} rows, keeping the first",
                    stmt.name,
                    rows.len()
                );
            }
            if let Some(row) = rows.into_iter().next() {
                for (var, value) in stmt.variables.iter().zip(row) {
                    if let Some(value) = value {
                        values.add_to_single_value(var, value);
                    }
                }
            }
        }
        QueryKind::Multi => {
            for row in rows {
                let mut columns = row.into_iter();
                for var in &stmt.variables {
                    let value = columns.next().flatten().unwrap_or_default();
                    values.add_to_multiple_value(var, value);
                }
            }
        }
    }
    values
}
