use crate::udbc::error::DriverError;
use crate::udbc::row::Row;
use crate::udbc::value::Value;
use async_trait::async_trait;

/// What one statement produced on the wire.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryResult {
    /// Count reported by the backend, if it reported one.
    pub rows_affected: Option<u64>,
    /// `None` when the statement does not return tuples at all.
    pub rows: Option<Vec<Row>>,
    /// Key generated by an auto-increment insert, on backends that report one.
    pub last_insert_id: Option<u64>,
}

impl QueryResult {
    pub fn affected(count: u64) -> Self {
        Self {
            rows_affected: Some(count),
            ..Default::default()
        }
    }

    pub fn rows(rows: Vec<Row>) -> Self {
        Self {
            rows: Some(rows),
            ..Default::default()
        }
    }

    /// Driver-reported count, else the number of returned rows, else zero.
    pub fn row_count(&self) -> u64 {
        self.rows_affected
            .filter(|n| *n > 0)
            .or_else(|| self.rows.as_ref().map(|r| r.len() as u64))
            .or(self.rows_affected)
            .unwrap_or(0)
    }

    pub fn into_rows(self) -> Vec<Row> {
        self.rows.unwrap_or_default()
    }

    /// The first returned row, else a single `id` column with the generated
    /// key.
    pub fn inserted_row(self) -> Option<Row> {
        let last_insert_id = self.last_insert_id;
        if let Some(row) = self.rows.and_then(|rows| rows.into_iter().next()) {
            return Some(row);
        }
        last_insert_id.filter(|id| *id > 0).map(|id| {
            let id = i64::try_from(id).map(Value::I64).unwrap_or_else(|_| Value::Str(id.to_string()));
            Row::from_pairs([("id", id)])
        })
    }
}

/// One backend session. Calls are never issued concurrently on the same
/// connection; the pool and the transaction lock guarantee exclusivity.
#[async_trait]
pub trait Connection: Send + Sync {
    async fn query(&mut self, sql: &str, args: &[Value]) -> Result<QueryResult, DriverError>;

    /// Runs `sql` once per parameter set in a single driver call.
    async fn execute_many(&mut self, sql: &str, batches: &[Vec<Value>])
    -> Result<(), DriverError>;

    /// Cheap liveness probe.
    async fn ping(&mut self) -> Result<(), DriverError> {
        self.query("SELECT 1", &[]).await.map(|_| ())
    }

    // ---------- transaction ----------
    async fn begin(&mut self) -> Result<(), DriverError> {
        self.query("BEGIN", &[]).await.map(|_| ())
    }

    async fn commit(&mut self) -> Result<(), DriverError> {
        self.query("COMMIT", &[]).await.map(|_| ())
    }

    async fn rollback(&mut self) -> Result<(), DriverError> {
        self.query("ROLLBACK", &[]).await.map(|_| ())
    }

    // ---------- nested transactions ----------
    /// Whether the driver manages savepoints itself. When it does not, the
    /// transaction layer emits SAVEPOINT statements through `query`.
    fn supports_savepoints(&self) -> bool {
        false
    }

    async fn savepoint(&mut self, name: &str) -> Result<(), DriverError> {
        Err(DriverError::Unsupported(format!("native savepoint {}", name)))
    }

    async fn release_savepoint(&mut self, name: &str) -> Result<(), DriverError> {
        Err(DriverError::Unsupported(format!("native release of {}", name)))
    }

    async fn rollback_to_savepoint(&mut self, name: &str) -> Result<(), DriverError> {
        Err(DriverError::Unsupported(format!("native rollback to {}", name)))
    }

    /// Set once the session hit an unrecoverable error; the pool discards it.
    fn is_broken(&self) -> bool;

    async fn close(self: Box<Self>) -> Result<(), DriverError>;
}
