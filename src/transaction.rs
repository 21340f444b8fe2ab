use crate::client::Executor;
use crate::error::DbError;
use crate::pool::PoolConnection;
use crate::wrapper::{BoundConnection, ConnectionWrapper, TxCommand};
use async_trait::async_trait;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use tokio::task_local;
use tracing::{debug, warn};

task_local! {
    /// 当前任务的事务上下文
    static TX_CONTEXT: Transaction;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    NotStarted,
    Active,
    Finalized,
}

struct TxInner {
    name: String,
    bound: Arc<BoundConnection>,
    savepoints: Arc<AtomicU64>,
    state: Mutex<TransactionState>,
    /// Set for nested transactions, with the savepoint's sequence number.
    savepoint: Option<String>,
    seq: u64,
    /// Only consulted for the parent's state; never keeps it alive.
    parent: Option<Weak<TxInner>>,
}

/// One transaction, or one savepoint inside a transaction, bound to a single
/// connection. Clones share the same transaction.
///
/// All statements of a transaction tree go through the tree's connection
/// lock, so concurrent calls queue instead of interleaving on the wire.
#[derive(Clone)]
pub struct Transaction {
    inner: Arc<TxInner>,
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("connection", &self.inner.name)
            .field("savepoint", &self.inner.savepoint)
            .field("state", &self.state())
            .finish()
    }
}

impl Transaction {
    /// Binds a not-yet-started transaction to a checked-out connection.
    pub(crate) fn new(name: &str, conn: PoolConnection) -> Self {
        Self {
            inner: Arc::new(TxInner {
                name: name.to_string(),
                bound: BoundConnection::new(conn),
                savepoints: Arc::new(AtomicU64::new(0)),
                state: Mutex::new(TransactionState::NotStarted),
                savepoint: None,
                seq: 0,
                parent: None,
            }),
        }
    }

    /// A not-yet-started savepoint on this transaction's connection.
    pub fn new_nested(&self) -> Transaction {
        let seq = self.inner.savepoints.fetch_add(1, Ordering::Relaxed) + 1;
        Transaction {
            inner: Arc::new(TxInner {
                name: self.inner.name.clone(),
                bound: self.inner.bound.clone(),
                savepoints: self.inner.savepoints.clone(),
                state: Mutex::new(TransactionState::NotStarted),
                savepoint: Some(format!("uorm_sp_{}", seq)),
                seq,
                parent: Some(Arc::downgrade(&self.inner)),
            }),
        }
    }

    /// The transaction scoped on the current task by [`run_in_transaction`].
    pub fn current() -> Option<Transaction> {
        TX_CONTEXT.try_with(|tx| tx.clone()).ok()
    }

    pub fn state(&self) -> TransactionState {
        *self.inner.state()
    }

    pub fn is_nested(&self) -> bool {
        self.inner.savepoint.is_some()
    }

    pub fn savepoint_name(&self) -> Option<&str> {
        self.inner.savepoint.as_deref()
    }

    pub async fn begin(&self) -> Result<(), DbError> {
        let mut conn = ConnectionWrapper::bound(&self.inner.bound).await?;
        match self.state() {
            TransactionState::NotStarted => {}
            TransactionState::Active => {
                return Err(DbError::TransactionManagement(
                    "Transaction already started".into(),
                ));
            }
            TransactionState::Finalized => return Err(DbError::already_finalised()),
        }
        match &self.inner.savepoint {
            None => conn.run(TxCommand::Begin).await?,
            Some(name) => {
                if !self.parent_is_active() {
                    return Err(DbError::TransactionManagement(
                        "Parent transaction is not active".into(),
                    ));
                }
                conn.run(TxCommand::Savepoint(name)).await?;
            }
        }
        self.inner.set_state(TransactionState::Active);
        debug!(connection = %self.inner.name, savepoint = ?self.inner.savepoint, "begin");
        Ok(())
    }

    pub async fn savepoint(&self) -> Result<(), DbError> {
        self.begin().await
    }

    pub async fn commit(&self) -> Result<(), DbError> {
        let mut conn = self.finish_guard(false).await?;
        let command = match &self.inner.savepoint {
            None => TxCommand::Commit,
            Some(name) => TxCommand::Release(name),
        };
        conn.run(command).await?;
        self.finalize(conn);
        debug!(connection = %self.inner.name, savepoint = ?self.inner.savepoint, "commit");
        Ok(())
    }

    pub async fn release_savepoint(&self) -> Result<(), DbError> {
        self.commit().await
    }

    pub async fn rollback(&self) -> Result<(), DbError> {
        let mut conn = self.finish_guard(true).await?;
        let command = match &self.inner.savepoint {
            None => TxCommand::Rollback,
            Some(name) => TxCommand::RollbackTo(name),
        };
        conn.run(command).await?;
        self.finalize(conn);
        debug!(connection = %self.inner.name, savepoint = ?self.inner.savepoint, "rollback");
        Ok(())
    }

    pub async fn savepoint_rollback(&self) -> Result<(), DbError> {
        self.rollback().await
    }

    /// Locks the connection and checks that the transaction may finish.
    async fn finish_guard(&self, rollback: bool) -> Result<ConnectionWrapper, DbError> {
        match self.state() {
            TransactionState::NotStarted => return Err(DbError::invalid_state()),
            TransactionState::Finalized => return Err(DbError::already_finalised()),
            TransactionState::Active => {}
        }
        let conn = if rollback && self.inner.savepoint.is_none() {
            ConnectionWrapper::bound_for_rollback(&self.inner.bound).await?
        } else {
            ConnectionWrapper::bound(&self.inner.bound).await?
        };
        // Re-check: a concurrent commit may have won the lock first.
        match self.state() {
            TransactionState::Active => Ok(conn),
            TransactionState::NotStarted => Err(DbError::invalid_state()),
            TransactionState::Finalized => Err(DbError::already_finalised()),
        }
    }

    /// Marks the transaction finished; a top-level one gives its connection
    /// back to the pool while still holding the lock.
    fn finalize(&self, conn: ConnectionWrapper) {
        self.inner.set_state(TransactionState::Finalized);
        if self.inner.savepoint.is_none() {
            if let ConnectionWrapper::Bound(mut guard) = conn {
                drop(guard.take());
            }
        }
    }

    fn parent_is_active(&self) -> bool {
        self.inner
            .parent
            .as_ref()
            .and_then(Weak::upgrade)
            .is_some_and(|p| *p.state() == TransactionState::Active)
    }
}

impl TxInner {
    fn state(&self) -> std::sync::MutexGuard<'_, TransactionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: TransactionState) {
        *self.state() = state;
    }
}

impl Drop for TxInner {
    fn drop(&mut self) {
        if *self.state() != TransactionState::Active {
            return;
        }
        let name = std::mem::take(&mut self.name);
        // The next user of the connection rolls the savepoint back while it
        // holds the lock, before running anything else.
        if let Some(savepoint) = self.savepoint.take() {
            warn!(connection = %name, savepoint = %savepoint, "Savepoint dropped while active; rolling back");
            self.bound.abandon(self.seq, savepoint);
            return;
        }
        let bound = self.bound.clone();
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            // Nothing can roll back anymore; make sure the pool never reuses
            // a connection with an open transaction.
            if let Some(mut slot) = bound.try_lock_slot() {
                if let Some(mut conn) = slot.take() {
                    conn.discard();
                }
            }
            return;
        };
        warn!(connection = %name, "Transaction dropped while active; rolling back");
        handle.spawn(async move {
            let Ok(mut conn) = ConnectionWrapper::bound_for_rollback(&bound).await else {
                return;
            };
            if let Err(e) = conn.run(TxCommand::Rollback).await {
                warn!(connection = %name, error = %e, "Rollback of dropped transaction failed");
                if let ConnectionWrapper::Bound(guard) = &mut conn {
                    if let Some(pc) = guard.as_mut() {
                        pc.discard();
                    }
                }
            }
            if let ConnectionWrapper::Bound(mut guard) = conn {
                drop(guard.take());
            }
        });
    }
}

#[async_trait]
impl Executor for Transaction {
    fn connection_name(&self) -> &str {
        &self.inner.name
    }

    async fn acquire_connection(&self) -> Result<ConnectionWrapper, DbError> {
        if self.state() == TransactionState::Finalized {
            return Err(DbError::already_finalised());
        }
        ConnectionWrapper::bound(&self.inner.bound).await
    }

    async fn in_transaction(&self) -> Result<Transaction, DbError> {
        let nested = self.new_nested();
        nested.begin().await?;
        Ok(nested)
    }
}

/// Runs `f` inside a transaction opened on `executor`: commits when it
/// returns `Ok`, rolls back when it returns `Err`.
///
/// While `f` runs, the transaction is the task's current transaction, so a
/// [`crate::client::Client`] with the same connection name routes its
/// statements and nested transactions through it.
pub async fn run_in_transaction<E, F, Fut, T, Err>(executor: &E, f: F) -> Result<T, Err>
where
    E: Executor + ?Sized,
    F: FnOnce(Transaction) -> Fut,
    Fut: Future<Output = Result<T, Err>>,
    Err: From<DbError>,
{
    let tx = executor.in_transaction().await?;
    let result = TX_CONTEXT.scope(tx.clone(), f(tx.clone())).await;
    match result {
        Ok(value) => {
            tx.commit().await?;
            Ok(value)
        }
        Err(e) => {
            if let Err(rollback_err) = tx.rollback().await {
                warn!(connection = %tx.connection_name(), error = %rollback_err, "Rollback failed");
            }
            Err(e)
        }
    }
}
