//! Migration history tracking (the per-tenant ledger).

use serde::{Deserialize, Serialize};

use crate::error::MigrateResult;

/// A record of an applied migration.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MigrationRecord {
    /// Migration file name.
    pub migration: String,
    /// Batch the migration was applied in.
    pub batch: i64,
}

impl MigrationRecord {
    /// Create a new record.
    pub fn new(migration: impl Into<String>, batch: i64) -> Self {
        Self {
            migration: migration.into(),
            batch,
        }
    }
}

/// Where a tenant's ledger lives: a table on the tenant's connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LedgerTable {
    /// Connection holding the ledger.
    pub connection: String,
    /// Ledger table name.
    pub table: String,
}

impl LedgerTable {
    /// Create a new ledger location.
    pub fn new(connection: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            connection: connection.into(),
            table: table.into(),
        }
    }

    /// Same table on another connection.
    pub fn on_connection(&self, connection: impl Into<String>) -> Self {
        Self {
            connection: connection.into(),
            table: self.table.clone(),
        }
    }
}

/// Migration ledger repository.
///
/// One logical ledger exists per tenant; every call names it explicitly.
#[async_trait::async_trait]
pub trait MigrationLedger: Send + Sync {
    /// Whether the ledger table exists.
    async fn repository_exists(&self, ledger: &LedgerTable) -> MigrateResult<bool>;

    /// Create the ledger table.
    async fn create_repository(&self, ledger: &LedgerTable) -> MigrateResult<()>;

    /// Names of all applied migrations, in the order they were applied.
    async fn get_ran(&self, ledger: &LedgerTable) -> MigrateResult<Vec<String>>;

    /// Records of the last batch, newest first.
    async fn get_last(&self, ledger: &LedgerTable) -> MigrateResult<Vec<MigrationRecord>>;

    /// All records, newest first.
    async fn get_all(&self, ledger: &LedgerTable) -> MigrateResult<Vec<MigrationRecord>>;

    /// Record a migration as applied in `batch`.
    async fn log(&self, ledger: &LedgerTable, migration: &str, batch: i64) -> MigrateResult<()>;

    /// Remove a migration record.
    async fn delete(&self, ledger: &LedgerTable, record: &MigrationRecord) -> MigrateResult<()>;

    /// Highest batch number recorded, `0` when empty.
    async fn last_batch_number(&self, ledger: &LedgerTable) -> MigrateResult<i64>;

    /// Next batch number to use.
    async fn next_batch_number(&self, ledger: &LedgerTable) -> MigrateResult<i64> {
        Ok(self.last_batch_number(ledger).await? + 1)
    }
}

/// SQL for creating a tenant ledger table. `{table}` is replaced with the
/// ledger table name.
pub const LEDGER_TABLE_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS "{table}" (
    id SERIAL PRIMARY KEY,
    migration VARCHAR(255) NOT NULL,
    batch INTEGER NOT NULL
);
"#;

/// Render [`LEDGER_TABLE_SQL`] for a ledger.
pub fn ledger_table_sql(ledger: &LedgerTable) -> String {
    LEDGER_TABLE_SQL.replace("{table}", &ledger.table)
}
