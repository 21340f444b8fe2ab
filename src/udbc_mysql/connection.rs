use async_trait::async_trait;
use mysql_async::prelude::Queryable;
use mysql_async::{Conn, Params, Row as MyRow};
use std::sync::Arc;

use crate::udbc::connection::{Connection, QueryResult};
use crate::udbc::error::DriverError;
use crate::udbc::row::Row;
use crate::udbc::value::Value;
use crate::udbc_mysql::driver_error;
use crate::udbc_mysql::value_codec::{from_mysql_column, to_mysql_value};

pub struct MysqlConnection {
    conn: Conn,
    broken: bool,
}

impl MysqlConnection {
    pub fn new(conn: Conn) -> Self {
        Self {
            conn,
            broken: false,
        }
    }

    fn params(args: &[Value]) -> Result<Params, DriverError> {
        if args.is_empty() {
            return Ok(Params::Empty);
        }
        let values = args.iter().map(to_mysql_value).collect::<Result<Vec<_>, _>>()?;
        Ok(Params::Positional(values))
    }

    /// Converts and flags the session as broken on transport failures.
    fn fail(&mut self, e: mysql_async::Error) -> DriverError {
        let err = driver_error(e);
        if err.is_disconnect() {
            self.broken = true;
        }
        err
    }

    fn map_rows(rows: Vec<MyRow>) -> Result<Vec<Row>, DriverError> {
        let Some(first) = rows.first() else {
            return Ok(Vec::new());
        };
        let meta = first.columns();
        // 同一结果集共享列名
        let columns: Arc<[String]> = meta.iter().map(|c| c.name_str().to_string()).collect();
        rows.into_iter()
            .map(|row| {
                let values = meta
                    .iter()
                    .enumerate()
                    .map(|(i, column)| match row.as_ref(i) {
                        Some(v) => from_mysql_column(v, column),
                        None => Value::Null,
                    })
                    .collect();
                Row::new(columns.clone(), values)
                    .map_err(|e| DriverError::Protocol(e.to_string()))
            })
            .collect()
    }
}

/// Result of a statement that returned no rows. MySQL has no `RETURNING`;
/// inserts report the generated key instead.
fn write_result(affected: u64, last_insert_id: Option<u64>) -> QueryResult {
    QueryResult {
        rows_affected: Some(affected),
        rows: Some(Vec::new()),
        last_insert_id,
    }
}

#[async_trait]
impl Connection for MysqlConnection {
    async fn query(&mut self, sql: &str, args: &[Value]) -> Result<QueryResult, DriverError> {
        let params = Self::params(args)?;
        // Statements without arguments go over the text protocol; some of
        // them (SAVEPOINT, CREATE DATABASE) cannot be prepared.
        let rows: Result<Vec<MyRow>, _> = match params {
            Params::Empty => self.conn.query(sql).await,
            params => self.conn.exec(sql, params).await,
        };
        let rows = rows.map_err(|e| self.fail(e))?;
        if rows.is_empty() {
            return Ok(write_result(
                self.conn.affected_rows(),
                self.conn.last_insert_id(),
            ));
        }
        Ok(QueryResult::rows(Self::map_rows(rows)?))
    }

    async fn execute_many(
        &mut self,
        sql: &str,
        batches: &[Vec<Value>],
    ) -> Result<(), DriverError> {
        let params = batches
            .iter()
            .map(|b| Self::params(b))
            .collect::<Result<Vec<_>, _>>()?;
        self.conn
            .exec_batch(sql, params)
            .await
            .map_err(|e| self.fail(e))
    }

    async fn ping(&mut self) -> Result<(), DriverError> {
        self.conn.ping().await.map_err(|e| self.fail(e))
    }

    fn is_broken(&self) -> bool {
        self.broken
    }

    async fn close(self: Box<Self>) -> Result<(), DriverError> {
        let this = *self;
        this.conn.disconnect().await.map_err(driver_error)
    }
}
