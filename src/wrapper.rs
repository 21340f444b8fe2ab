//! Scoped connection acquisition.
//!
//! A [`ConnectionWrapper`] is either a pool checkout or the locked connection
//! of a transaction. Dropping it hands the connection back (or unlocks it)
//! exactly once, whether the body finished, failed or was cancelled.

use crate::error::DbError;
use crate::pool::PoolConnection;
use crate::translate::Translate;
use crate::udbc::connection::{Connection, QueryResult};
use crate::udbc::error::DriverError;
use crate::udbc::value::Value;
use std::sync::{Arc, PoisonError};
use std::time::Instant;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, warn};

/// The connection a transaction tree is bound to, shared by every wrapper of
/// the tree.
pub(crate) struct BoundConnection {
    /// `None` once the top-level transaction has finished and handed the
    /// connection back to the pool.
    slot: Arc<Mutex<Option<PoolConnection>>>,
    /// Savepoints whose wrapper went away while still active, with their
    /// sequence number. Rolled back by the next user of the connection.
    abandoned: std::sync::Mutex<Vec<(u64, String)>>,
}

impl BoundConnection {
    pub(crate) fn new(conn: PoolConnection) -> Arc<Self> {
        Arc::new(Self {
            slot: Arc::new(Mutex::new(Some(conn))),
            abandoned: std::sync::Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn abandon(&self, seq: u64, savepoint: String) {
        self.abandoned
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((seq, savepoint));
    }

    fn take_abandoned(&self) -> Vec<(u64, String)> {
        let mut pending =
            std::mem::take(&mut *self.abandoned.lock().unwrap_or_else(PoisonError::into_inner));
        // innermost first: rolling back an outer savepoint destroys inner ones
        pending.sort_by(|a, b| b.0.cmp(&a.0));
        pending
    }

    /// Locks the slot without any cleanup; used where the whole transaction
    /// is being rolled back anyway.
    pub(crate) fn try_lock_slot(&self) -> Option<tokio::sync::MutexGuard<'_, Option<PoolConnection>>> {
        self.slot.try_lock().ok()
    }

    pub(crate) async fn lock_slot(&self) -> OwnedMutexGuard<Option<PoolConnection>> {
        self.slot.clone().lock_owned().await
    }
}

/// Transaction control statements, emitted natively when the driver
/// supports savepoints and as SQL otherwise.
#[derive(Debug, Clone, Copy)]
pub(crate) enum TxCommand<'a> {
    Begin,
    Commit,
    Rollback,
    Savepoint(&'a str),
    Release(&'a str),
    RollbackTo(&'a str),
}

async fn apply(conn: &mut dyn Connection, command: TxCommand<'_>) -> Result<(), DriverError> {
    let native = conn.supports_savepoints();
    match command {
        TxCommand::Begin => conn.begin().await,
        TxCommand::Commit => conn.commit().await,
        TxCommand::Rollback => conn.rollback().await,
        TxCommand::Savepoint(name) if native => conn.savepoint(name).await,
        TxCommand::Savepoint(name) => conn
            .query(&format!("SAVEPOINT {}", name), &[])
            .await
            .map(|_| ()),
        TxCommand::Release(name) if native => conn.release_savepoint(name).await,
        TxCommand::Release(name) => conn
            .query(&format!("RELEASE SAVEPOINT {}", name), &[])
            .await
            .map(|_| ()),
        TxCommand::RollbackTo(name) if native => conn.rollback_to_savepoint(name).await,
        TxCommand::RollbackTo(name) => {
            conn.query(&format!("ROLLBACK TO SAVEPOINT {}", name), &[])
                .await?;
            conn.query(&format!("RELEASE SAVEPOINT {}", name), &[])
                .await
                .map(|_| ())
        }
    }
}

pub enum ConnectionWrapper {
    Pooled(PoolConnection),
    Bound(OwnedMutexGuard<Option<PoolConnection>>),
}

impl ConnectionWrapper {
    /// Waits for exclusive use of a transaction's connection, then rolls
    /// back any savepoint abandoned since the last use.
    ///
    /// If that cleanup fails the savepoints stay pending, so the transaction
    /// cannot commit over them, and the connection is not reused.
    pub(crate) async fn bound(bound: &BoundConnection) -> Result<Self, DbError> {
        let mut wrapper = Self::bound_unchecked(bound).await?;
        let mut pending = bound.take_abandoned().into_iter();
        while let Some((seq, savepoint)) = pending.next() {
            debug!(savepoint = %savepoint, "Rolling back abandoned savepoint");
            if let Err(e) = wrapper.run(TxCommand::RollbackTo(&savepoint)).await {
                warn!(savepoint = %savepoint, error = %e, "Rollback of abandoned savepoint failed");
                bound.abandon(seq, savepoint);
                for (seq, savepoint) in pending {
                    bound.abandon(seq, savepoint);
                }
                wrapper.pool_connection()?.discard();
                return Err(e);
            }
        }
        Ok(wrapper)
    }

    /// Like [`ConnectionWrapper::bound`], but forgets abandoned savepoints
    /// instead of rolling them back; for a top-level rollback, which undoes
    /// them anyway.
    pub(crate) async fn bound_for_rollback(bound: &BoundConnection) -> Result<Self, DbError> {
        let wrapper = Self::bound_unchecked(bound).await?;
        drop(bound.take_abandoned());
        Ok(wrapper)
    }

    async fn bound_unchecked(bound: &BoundConnection) -> Result<Self, DbError> {
        let guard = bound.lock_slot().await;
        if guard.is_none() {
            return Err(DbError::already_finalised());
        }
        Ok(ConnectionWrapper::Bound(guard))
    }

    fn pool_connection(&mut self) -> Result<&mut PoolConnection, DbError> {
        match self {
            ConnectionWrapper::Pooled(conn) => Ok(conn),
            ConnectionWrapper::Bound(guard) => {
                guard.as_mut().ok_or_else(DbError::already_finalised)
            }
        }
    }

    pub fn connection(&mut self) -> Result<&mut dyn Connection, DbError> {
        self.pool_connection().map(PoolConnection::connection)
    }

    /// Runs one transaction control statement.
    pub(crate) async fn run(&mut self, command: TxCommand<'_>) -> Result<(), DbError> {
        let pc = self.pool_connection()?;
        pc.set_in_flight(true);
        let result = apply(pc.connection(), command).await;
        pc.set_in_flight(false);
        result.translated()
    }

    /// Runs one statement and returns everything the driver reported.
    pub(crate) async fn execute(
        &mut self,
        name: &str,
        sql: &str,
        values: &[Value],
    ) -> Result<QueryResult, DbError> {
        let pc = self.pool_connection()?;
        let start = Instant::now();
        pc.set_in_flight(true);
        let result = pc.connection().query(sql, values).await;
        pc.set_in_flight(false);
        let elapsed_ms = start.elapsed().as_millis() as u64;
        match &result {
            Ok(r) => debug!(connection = name, sql, params = ?values, elapsed_ms, rows = r.row_count(), "execute_query"),
            Err(e) => debug!(connection = name, sql, params = ?values, elapsed_ms, error = %e, "execute_query"),
        }
        result.translated()
    }

    pub(crate) async fn execute_many(
        &mut self,
        name: &str,
        sql: &str,
        batches: &[Vec<Value>],
    ) -> Result<(), DbError> {
        let pc = self.pool_connection()?;
        let start = Instant::now();
        pc.set_in_flight(true);
        let result = pc.connection().execute_many(sql, batches).await;
        pc.set_in_flight(false);
        debug!(
            connection = name,
            sql,
            batches = batches.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            ok = result.is_ok(),
            "execute_many"
        );
        result.translated()
    }
}
