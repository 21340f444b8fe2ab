//! In-memory backend for integration tests.
//!
//! Statements are applied to shared tables immediately; each session keeps
//! an undo log so ROLLBACK and ROLLBACK TO SAVEPOINT can revert its writes.
//! Every statement yields to the scheduler so concurrent callers interleave.
#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uorm_core::config::ConnectParams;
use uorm_core::udbc::connection::{Connection, QueryResult};
use uorm_core::udbc::driver::Driver;
use uorm_core::udbc::error::DriverError;
use uorm_core::{Client, ConnectionConfig, DbError, Executor, Row, Value};

pub const DATABASE: &str = "test";
pub const TOURNAMENT: &str = "tournament";
pub const UNIQUE_NAME: &str = "unique_name";

#[derive(Default)]
struct Table {
    next_id: i64,
    rows: BTreeMap<i64, Option<String>>,
    unique: bool,
}

enum Undo {
    Insert { table: String, id: i64 },
    Update { table: String, id: i64, old: Option<String> },
    Delete { table: String, id: i64, old: Option<String> },
    Savepoint(String),
}

struct State {
    databases: HashSet<String>,
    tables: BTreeMap<String, Table>,
}

#[derive(Clone)]
pub struct FakeServer {
    state: Arc<Mutex<State>>,
    reachable: Arc<AtomicBool>,
    pub connects: Arc<AtomicUsize>,
    pub closes: Arc<AtomicUsize>,
    /// Extra delay per statement.
    latency: Arc<Mutex<Duration>>,
    native_savepoints: Arc<AtomicBool>,
    /// Savepoint calls made through the native driver methods.
    pub native_calls: Arc<AtomicUsize>,
}

impl Default for FakeServer {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeServer {
    pub fn new() -> Self {
        let mut tables = BTreeMap::new();
        tables.insert(TOURNAMENT.to_string(), Table::default());
        tables.insert(
            UNIQUE_NAME.to_string(),
            Table {
                unique: true,
                ..Default::default()
            },
        );
        Self {
            state: Arc::new(Mutex::new(State {
                databases: HashSet::from([DATABASE.to_string()]),
                tables,
            })),
            reachable: Arc::new(AtomicBool::new(true)),
            connects: Arc::new(AtomicUsize::new(0)),
            closes: Arc::new(AtomicUsize::new(0)),
            latency: Arc::new(Mutex::new(Duration::ZERO)),
            native_savepoints: Arc::new(AtomicBool::new(false)),
            native_calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Sessions opened after this report native savepoint support.
    pub fn set_native_savepoints(&self, native: bool) {
        self.native_savepoints.store(native, Ordering::SeqCst);
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock().unwrap() = latency;
    }

    pub fn has_database(&self, name: &str) -> bool {
        self.state.lock().unwrap().databases.contains(name)
    }

    pub fn count(&self, table: &str) -> usize {
        self.state.lock().unwrap().tables[table].rows.len()
    }

    pub fn ids(&self, table: &str) -> Vec<i64> {
        self.state.lock().unwrap().tables[table].rows.keys().copied().collect()
    }

    pub fn driver(&self) -> Arc<FakeDriver> {
        Arc::new(FakeDriver {
            server: self.clone(),
        })
    }

    /// A client on the test database with the given pool bounds.
    pub fn client(&self, min_size: usize, max_size: usize) -> Client {
        let config = ConnectionConfig::new("fake")
            .database(DATABASE)
            .min_size(min_size)
            .max_size(max_size)
            .timeout(Duration::from_secs(5));
        Client::new("models", config, self.driver())
    }
}

pub struct FakeDriver {
    server: FakeServer,
}

#[async_trait]
impl Driver for FakeDriver {
    fn r#type(&self) -> &str {
        "fake"
    }

    async fn connect(&self, params: &ConnectParams) -> Result<Box<dyn Connection>, DriverError> {
        tokio::task::yield_now().await;
        if !self.server.reachable.load(Ordering::SeqCst) {
            return Err(DriverError::Io("connection refused".into()));
        }
        if let Some(db) = &params.database {
            if !self.server.has_database(db) {
                return Err(DriverError::server(
                    "3D000",
                    format!("database \"{}\" does not exist", db),
                ));
            }
        }
        self.server.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeConnection {
            server: self.server.clone(),
            undo: Vec::new(),
            in_tx: false,
            broken: false,
            native_savepoints: self.server.native_savepoints.load(Ordering::SeqCst),
        }))
    }
}

pub struct FakeConnection {
    server: FakeServer,
    undo: Vec<Undo>,
    in_tx: bool,
    broken: bool,
    native_savepoints: bool,
}

fn syntax_error(sql: &str) -> DriverError {
    DriverError::server("42601", format!("syntax error at or near \"{}\"", sql))
}

fn text_arg(args: &[Value], index: usize) -> Option<String> {
    match args.get(index) {
        Some(Value::Str(s)) => Some(s.clone()),
        _ => None,
    }
}

fn id_name(id: i64, name: &Option<String>) -> Row {
    Row::from_pairs([
        ("id", Value::I64(id)),
        ("name", Value::from(name.clone())),
    ])
}

fn unquote(ident: &str) -> String {
    ident.trim_matches('"').to_string()
}

impl FakeConnection {
    fn record(&mut self, undo: Undo) {
        if self.in_tx {
            self.undo.push(undo);
        }
    }

    fn revert(state: &mut State, undo: Undo) {
        match undo {
            Undo::Insert { table, id } => {
                if let Some(t) = state.tables.get_mut(&table) {
                    t.rows.remove(&id);
                }
            }
            Undo::Update { table, id, old } | Undo::Delete { table, id, old } => {
                if let Some(t) = state.tables.get_mut(&table) {
                    t.rows.insert(id, old);
                }
            }
            Undo::Savepoint(_) => {}
        }
    }

    fn savepoint_index(&self, name: &str) -> Result<usize, DriverError> {
        self.undo
            .iter()
            .rposition(|u| matches!(u, Undo::Savepoint(n) if n == name))
            .ok_or_else(|| {
                DriverError::server("3B001", format!("savepoint \"{}\" does not exist", name))
            })
    }

    fn require_tx(&self, what: &str) -> Result<(), DriverError> {
        if self.in_tx {
            Ok(())
        } else {
            Err(DriverError::server(
                "25P01",
                format!("{} can only be used in transaction blocks", what),
            ))
        }
    }

    fn insert(&mut self, table: &str, name: Option<String>) -> Result<i64, DriverError> {
        let id = {
            let mut state = self.server.state.lock().unwrap();
            let t = state
                .tables
                .get_mut(table)
                .ok_or_else(|| undefined_table(table))?;
            if t.unique && name.is_some() && t.rows.values().any(|n| *n == name) {
                return Err(DriverError::server(
                    "23505",
                    "duplicate key value violates unique constraint \"name_key\"",
                ));
            }
            t.next_id += 1;
            t.rows.insert(t.next_id, name);
            t.next_id
        };
        self.record(Undo::Insert {
            table: table.to_string(),
            id,
        });
        Ok(id)
    }

    fn run(&mut self, sql: &str, args: &[Value]) -> Result<QueryResult, DriverError> {
        let words: Vec<&str> = sql.split_whitespace().collect();
        let upper: Vec<String> = words.iter().map(|w| w.to_uppercase()).collect();
        let upper: Vec<&str> = upper.iter().map(String::as_str).collect();

        match upper.as_slice() {
            ["SELECT", "1"] => Ok(QueryResult::rows(vec![Row::from_pairs([(
                "?column?",
                Value::I32(1),
            )])])),
            ["BEGIN"] => {
                self.in_tx = true;
                self.undo.clear();
                Ok(QueryResult::affected(0))
            }
            ["COMMIT"] => {
                self.in_tx = false;
                self.undo.clear();
                Ok(QueryResult::affected(0))
            }
            ["ROLLBACK"] => {
                let mut state = self.server.state.lock().unwrap();
                while let Some(undo) = self.undo.pop() {
                    Self::revert(&mut state, undo);
                }
                self.in_tx = false;
                Ok(QueryResult::affected(0))
            }
            ["SAVEPOINT", _] => {
                self.require_tx("SAVEPOINT")?;
                self.undo.push(Undo::Savepoint(words[1].to_string()));
                Ok(QueryResult::affected(0))
            }
            ["RELEASE", "SAVEPOINT", _] => {
                self.require_tx("RELEASE SAVEPOINT")?;
                let at = self.savepoint_index(words[2])?;
                self.undo.remove(at);
                Ok(QueryResult::affected(0))
            }
            ["ROLLBACK", "TO", "SAVEPOINT", _] => {
                self.require_tx("ROLLBACK TO SAVEPOINT")?;
                let at = self.savepoint_index(words[3])?;
                let mut state = self.server.state.lock().unwrap();
                while self.undo.len() > at + 1 {
                    if let Some(undo) = self.undo.pop() {
                        Self::revert(&mut state, undo);
                    }
                }
                Ok(QueryResult::affected(0))
            }
            ["CREATE", "DATABASE", _] => {
                let name = unquote(words[2]);
                let mut state = self.server.state.lock().unwrap();
                if !state.databases.insert(name.clone()) {
                    return Err(DriverError::server(
                        "42P04",
                        format!("database \"{}\" already exists", name),
                    ));
                }
                Ok(QueryResult::affected(0))
            }
            ["DROP", "DATABASE", _] => {
                let name = unquote(words[2]);
                let mut state = self.server.state.lock().unwrap();
                if !state.databases.remove(&name) {
                    return Err(DriverError::server(
                        "3D000",
                        format!("database \"{}\" does not exist", name),
                    ));
                }
                Ok(QueryResult::affected(0))
            }
            ["INSERT", "INTO", _, "(NAME)", "VALUES", "($1)", "RETURNING", "ID,", "NAME"] => {
                let name = text_arg(args, 0);
                let id = self.insert(words[2], name.clone())?;
                Ok(QueryResult {
                    rows_affected: Some(1),
                    rows: Some(vec![id_name(id, &name)]),
                    last_insert_id: None,
                })
            }
            ["INSERT", "INTO", _, "(NAME)", "VALUES", "($1)"] => {
                let id = self.insert(words[2], text_arg(args, 0))?;
                Ok(QueryResult {
                    rows_affected: Some(1),
                    rows: Some(Vec::new()),
                    last_insert_id: Some(id as u64),
                })
            }
            ["SELECT", "ID,", "NAME", "FROM", _, "WHERE", "NAME", "=", "$1"] => {
                let name = text_arg(args, 0);
                let state = self.server.state.lock().unwrap();
                let t = state.tables.get(words[4]).ok_or_else(|| undefined_table(words[4]))?;
                Ok(QueryResult::rows(
                    t.rows
                        .iter()
                        .filter(|(_, n)| **n == name)
                        .map(|(id, n)| id_name(*id, n))
                        .collect(),
                ))
            }
            ["SELECT", "ID,", "NAME", "FROM", _, "ORDER", "BY", "ID", rest @ ..] => {
                let limit = match rest {
                    [] => usize::MAX,
                    ["LIMIT", n] => n.parse().map_err(|_| syntax_error(sql))?,
                    _ => return Err(syntax_error(sql)),
                };
                let state = self.server.state.lock().unwrap();
                let t = state.tables.get(words[4]).ok_or_else(|| undefined_table(words[4]))?;
                Ok(QueryResult::rows(
                    t.rows.iter().take(limit).map(|(id, n)| id_name(*id, n)).collect(),
                ))
            }
            ["SELECT", "COUNT(*)", "FROM", _] => {
                let state = self.server.state.lock().unwrap();
                let t = state.tables.get(words[3]).ok_or_else(|| undefined_table(words[3]))?;
                Ok(QueryResult::rows(vec![Row::from_pairs([(
                    "count",
                    Value::I64(t.rows.len() as i64),
                )])]))
            }
            ["UPDATE", _, "SET", "NAME", "=", "$1", "WHERE", "ID", "=", "$2"] => {
                let table = words[1].to_string();
                let name = text_arg(args, 0);
                let id = args.get(1).and_then(Value::as_i64).unwrap_or_default();
                let old = {
                    let mut state = self.server.state.lock().unwrap();
                    let t = state
                        .tables
                        .get_mut(&table)
                        .ok_or_else(|| undefined_table(&table))?;
                    match t.rows.get_mut(&id) {
                        Some(slot) => Some(std::mem::replace(slot, name)),
                        None => None,
                    }
                };
                let Some(old) = old else {
                    return Ok(QueryResult::affected(0));
                };
                self.record(Undo::Update { table, id, old });
                Ok(QueryResult::affected(1))
            }
            ["DELETE", "FROM", _] => {
                let table = words[2].to_string();
                let removed = {
                    let mut state = self.server.state.lock().unwrap();
                    let t = state
                        .tables
                        .get_mut(&table)
                        .ok_or_else(|| undefined_table(&table))?;
                    std::mem::take(&mut t.rows)
                };
                let count = removed.len() as u64;
                for (id, old) in removed {
                    self.record(Undo::Delete {
                        table: table.clone(),
                        id,
                        old,
                    });
                }
                Ok(QueryResult::affected(count))
            }
            ["BREAK"] => {
                self.broken = true;
                Err(DriverError::Io("server closed the connection unexpectedly".into()))
            }
            _ => Err(syntax_error(sql)),
        }
    }
}

fn undefined_table(table: &str) -> DriverError {
    DriverError::server("42P01", format!("relation \"{}\" does not exist", table))
}

#[async_trait]
impl Connection for FakeConnection {
    async fn query(&mut self, sql: &str, args: &[Value]) -> Result<QueryResult, DriverError> {
        if self.broken {
            return Err(DriverError::Io("connection already closed".into()));
        }
        tokio::task::yield_now().await;
        let latency = *self.server.latency.lock().unwrap();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        let result = self.run(sql, args);
        tokio::task::yield_now().await;
        result
    }

    async fn execute_many(
        &mut self,
        sql: &str,
        batches: &[Vec<Value>],
    ) -> Result<(), DriverError> {
        for args in batches {
            self.query(sql, args).await?;
        }
        Ok(())
    }

    fn supports_savepoints(&self) -> bool {
        self.native_savepoints
    }

    async fn savepoint(&mut self, name: &str) -> Result<(), DriverError> {
        self.server.native_calls.fetch_add(1, Ordering::SeqCst);
        self.query(&format!("SAVEPOINT {}", name), &[]).await.map(|_| ())
    }

    async fn release_savepoint(&mut self, name: &str) -> Result<(), DriverError> {
        self.server.native_calls.fetch_add(1, Ordering::SeqCst);
        self.query(&format!("RELEASE SAVEPOINT {}", name), &[])
            .await
            .map(|_| ())
    }

    async fn rollback_to_savepoint(&mut self, name: &str) -> Result<(), DriverError> {
        self.server.native_calls.fetch_add(1, Ordering::SeqCst);
        self.query(&format!("ROLLBACK TO SAVEPOINT {}", name), &[])
            .await?;
        self.query(&format!("RELEASE SAVEPOINT {}", name), &[])
            .await
            .map(|_| ())
    }

    fn is_broken(&self) -> bool {
        self.broken
    }

    async fn close(self: Box<Self>) -> Result<(), DriverError> {
        self.server.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub fn insert_sql(table: &str) -> String {
    format!("INSERT INTO {} (name) VALUES ($1) RETURNING id, name", table)
}

pub fn select_by_name_sql(table: &str) -> String {
    format!("SELECT id, name FROM {} WHERE name = $1", table)
}

pub fn first_sql(table: &str) -> String {
    format!("SELECT id, name FROM {} ORDER BY id LIMIT 1", table)
}

pub fn all_sql(table: &str) -> String {
    format!("SELECT id, name FROM {} ORDER BY id", table)
}

pub fn row_id(row: &Row) -> i64 {
    row.get("id").and_then(Value::as_i64).unwrap()
}

pub async fn create<E: Executor + ?Sized>(
    executor: &E,
    table: &str,
    name: Option<&str>,
) -> Result<Row, DbError> {
    let row = executor
        .execute_insert(&insert_sql(table), &[Value::from(name.map(str::to_string))])
        .await?;
    Ok(row.unwrap())
}

/// Select, else insert; losing an insert race to the unique constraint
/// resolves to the winner's row.
pub async fn get_or_create<E: Executor + ?Sized>(
    executor: &E,
    name: &str,
) -> Result<(Row, bool), DbError> {
    let select = select_by_name_sql(UNIQUE_NAME);
    let lookup = [Value::from(name)];
    if let Some(row) = executor.execute_query_dict(&select, &lookup).await?.pop() {
        return Ok((row, false));
    }
    match create(executor, UNIQUE_NAME, Some(name)).await {
        Ok(row) => Ok((row, true)),
        Err(e) if e.is_integrity() => {
            let row = executor.execute_query_dict(&select, &lookup).await?.pop();
            Ok((row.unwrap(), false))
        }
        Err(e) => Err(e),
    }
}
