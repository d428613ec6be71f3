//! In-memory collaborators.
//!
//! These implement the engine's collaborator traits without a database:
//! useful for tests, for dry runs, and as reference implementations when
//! writing real adapters.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use indexmap::IndexMap;
use parking_lot::Mutex;
use serde_json::Value;

use crate::connection::{CapturedQuery, DatabaseConnection, DatabaseManager};
use crate::entity::{
    Attributes, BoxedEntity, EntityResolver, HasTenantConnection, Tenant, TenantId, TenantPayload,
};
use crate::error::{MigrateResult, MigrationError};
use crate::history::{LedgerTable, MigrationLedger, MigrationRecord};

/// A call observed by [`MemoryLedger`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LedgerEvent {
    /// `create_repository`.
    Created(LedgerTable),
    /// `log`.
    Logged(LedgerTable, MigrationRecord),
    /// `delete`.
    Deleted(LedgerTable, MigrationRecord),
}

#[derive(Debug, Default)]
struct LedgerState {
    tables: HashMap<LedgerTable, Vec<MigrationRecord>>,
    events: Vec<LedgerEvent>,
}

/// In-memory [`MigrationLedger`].
#[derive(Debug, Default)]
pub struct MemoryLedger {
    state: Mutex<LedgerState>,
}

impl MemoryLedger {
    /// Create an empty ledger.
    pub fn new() -> Self {
        Self::default()
    }

    /// Every mutating call, in order.
    pub fn events(&self) -> Vec<LedgerEvent> {
        self.state.lock().events.clone()
    }

    /// Records of one ledger, oldest first.
    pub fn records(&self, ledger: &LedgerTable) -> Vec<MigrationRecord> {
        self.state
            .lock()
            .tables
            .get(ledger)
            .cloned()
            .unwrap_or_default()
    }

    /// Number of `log` calls observed.
    pub fn log_count(&self) -> usize {
        self.count(|e| matches!(e, LedgerEvent::Logged(..)))
    }

    /// Number of `delete` calls observed.
    pub fn delete_count(&self) -> usize {
        self.count(|e| matches!(e, LedgerEvent::Deleted(..)))
    }

    fn count(&self, predicate: impl Fn(&LedgerEvent) -> bool) -> usize {
        self.state.lock().events.iter().filter(|e| predicate(e)).count()
    }
}

#[async_trait]
impl MigrationLedger for MemoryLedger {
    async fn repository_exists(&self, ledger: &LedgerTable) -> MigrateResult<bool> {
        Ok(self.state.lock().tables.contains_key(ledger))
    }

    async fn create_repository(&self, ledger: &LedgerTable) -> MigrateResult<()> {
        let mut state = self.state.lock();
        state.tables.entry(ledger.clone()).or_default();
        state.events.push(LedgerEvent::Created(ledger.clone()));
        Ok(())
    }

    async fn get_ran(&self, ledger: &LedgerTable) -> MigrateResult<Vec<String>> {
        Ok(self
            .records(ledger)
            .into_iter()
            .map(|record| record.migration)
            .collect())
    }

    async fn get_last(&self, ledger: &LedgerTable) -> MigrateResult<Vec<MigrationRecord>> {
        let records = self.records(ledger);
        let Some(last) = records.iter().map(|r| r.batch).max() else {
            return Ok(Vec::new());
        };
        Ok(records.into_iter().rev().filter(|r| r.batch == last).collect())
    }

    async fn get_all(&self, ledger: &LedgerTable) -> MigrateResult<Vec<MigrationRecord>> {
        Ok(self.records(ledger).into_iter().rev().collect())
    }

    async fn log(&self, ledger: &LedgerTable, migration: &str, batch: i64) -> MigrateResult<()> {
        let mut state = self.state.lock();
        let table = state.tables.get_mut(ledger).ok_or_else(|| {
            MigrationError::database(format!("Ledger table [{}] does not exist", ledger.table))
        })?;
        let record = MigrationRecord::new(migration, batch);
        table.push(record.clone());
        state.events.push(LedgerEvent::Logged(ledger.clone(), record));
        Ok(())
    }

    async fn delete(&self, ledger: &LedgerTable, record: &MigrationRecord) -> MigrateResult<()> {
        let mut state = self.state.lock();
        if let Some(table) = state.tables.get_mut(ledger) {
            table.retain(|r| r.migration != record.migration);
        }
        state.events.push(LedgerEvent::Deleted(ledger.clone(), record.clone()));
        Ok(())
    }

    async fn last_batch_number(&self, ledger: &LedgerTable) -> MigrateResult<i64> {
        Ok(self
            .records(ledger)
            .iter()
            .map(|r| r.batch)
            .max()
            .unwrap_or(0))
    }
}

/// A connection that records statements instead of running them.
#[derive(Debug)]
pub struct RecordingConnection {
    name: String,
    executed: Mutex<Vec<String>>,
    capture: Mutex<Option<Vec<CapturedQuery>>>,
    fail_on: Mutex<Option<String>>,
}

impl RecordingConnection {
    /// Create a recording connection.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            executed: Mutex::new(Vec::new()),
            capture: Mutex::new(None),
            fail_on: Mutex::new(None),
        }
    }

    /// Statements executed outside capture mode.
    pub fn executed(&self) -> Vec<String> {
        self.executed.lock().clone()
    }

    /// Whether capture mode is active.
    pub fn is_capturing(&self) -> bool {
        self.capture.lock().is_some()
    }

    /// Make every statement containing `needle` fail.
    pub fn fail_when(&self, needle: impl Into<String>) {
        *self.fail_on.lock() = Some(needle.into());
    }
}

#[async_trait]
impl DatabaseConnection for RecordingConnection {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, sql: &str) -> MigrateResult<u64> {
        if let Some(captured) = self.capture.lock().as_mut() {
            captured.push(CapturedQuery::new(sql));
            return Ok(0);
        }

        if let Some(needle) = self.fail_on.lock().as_deref() {
            if sql.contains(needle) {
                return Err(MigrationError::database(format!(
                    "statement rejected on [{}]: {}",
                    self.name, sql
                )));
            }
        }

        self.executed.lock().push(sql.to_string());
        Ok(1)
    }

    fn begin_capture(&self) {
        *self.capture.lock() = Some(Vec::new());
    }

    fn finish_capture(&self) -> Vec<CapturedQuery> {
        self.capture.lock().take().unwrap_or_default()
    }
}

/// [`DatabaseManager`] handing out [`RecordingConnection`]s, one per name.
#[derive(Debug, Default)]
pub struct MemoryDatabase {
    connections: Mutex<IndexMap<String, Arc<RecordingConnection>>>,
}

impl MemoryDatabase {
    /// Create an empty database manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// The recording connection for `name`, created on first use.
    pub fn recording(&self, name: &str) -> Arc<RecordingConnection> {
        self.connections
            .lock()
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(RecordingConnection::new(name)))
            .clone()
    }

    /// Names of the connections handed out so far.
    pub fn connection_names(&self) -> Vec<String> {
        self.connections.lock().keys().cloned().collect()
    }
}

#[async_trait]
impl DatabaseManager for MemoryDatabase {
    async fn connection(&self, name: &str) -> MigrateResult<Arc<dyn DatabaseConnection>> {
        Ok(self.recording(name))
    }
}

/// In-memory [`EntityResolver`] over [`Tenant`] records.
#[derive(Debug)]
pub struct MemoryEntities {
    table: String,
    rows: Mutex<IndexMap<TenantId, Tenant>>,
    next_id: AtomicU64,
}

impl MemoryEntities {
    /// Create an empty store for `table`.
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            rows: Mutex::new(IndexMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Insert a tenant with the given identity and return it.
    pub fn insert(&self, id: impl Into<TenantId>) -> Tenant {
        let tenant = Tenant::new(self.table.clone(), id);
        self.insert_tenant(tenant.clone());
        tenant
    }

    /// Insert a prepared tenant record.
    pub fn insert_tenant(&self, tenant: Tenant) {
        self.rows.lock().insert(tenant.identity(), tenant);
    }

    /// Remove a tenant.
    pub fn remove(&self, id: &TenantId) -> Option<Tenant> {
        self.rows.lock().shift_remove(id)
    }

    /// Number of stored tenants.
    pub fn len(&self) -> usize {
        self.rows.lock().len()
    }

    /// Check if empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl EntityResolver for MemoryEntities {
    async fn find(&self, payload: &TenantPayload) -> MigrateResult<Option<BoxedEntity>> {
        let Some(key) = payload.key() else {
            return Ok(None);
        };
        Ok(self
            .rows
            .lock()
            .get(&key)
            .cloned()
            .map(|tenant| Box::new(tenant) as BoxedEntity))
    }

    async fn create(&self, mut attributes: Attributes) -> MigrateResult<BoxedEntity> {
        if !attributes.contains_key("id") {
            let id = self.next_id.fetch_add(1, Ordering::SeqCst);
            attributes.insert("id".to_string(), Value::from(id));
        }
        let tenant = Tenant::from_attributes(self.table.clone(), attributes)?;
        self.insert_tenant(tenant.clone());
        Ok(Box::new(tenant))
    }

    async fn chunk(&self, offset: usize, limit: usize) -> MigrateResult<Vec<BoxedEntity>> {
        Ok(self
            .rows
            .lock()
            .values()
            .skip(offset)
            .take(limit)
            .cloned()
            .map(|tenant| Box::new(tenant) as BoxedEntity)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn ledger_table() -> LedgerTable {
        LedgerTable::new("tenant_1", "user_1_migrations")
    }

    #[tokio::test]
    async fn test_ledger_batches() {
        let ledger = MemoryLedger::new();
        let table = ledger_table();

        assert!(!ledger.repository_exists(&table).await.unwrap());
        assert!(ledger.log(&table, "a", 1).await.is_err());

        ledger.create_repository(&table).await.unwrap();
        ledger.log(&table, "a", 1).await.unwrap();
        ledger.log(&table, "b", 2).await.unwrap();
        ledger.log(&table, "c", 2).await.unwrap();

        assert_eq!(ledger.last_batch_number(&table).await.unwrap(), 2);
        assert_eq!(ledger.next_batch_number(&table).await.unwrap(), 3);
        assert_eq!(
            ledger.get_last(&table).await.unwrap(),
            vec![MigrationRecord::new("c", 2), MigrationRecord::new("b", 2)]
        );
        assert_eq!(ledger.get_ran(&table).await.unwrap(), vec!["a", "b", "c"]);

        ledger.delete(&table, &MigrationRecord::new("c", 2)).await.unwrap();
        assert_eq!(ledger.get_ran(&table).await.unwrap(), vec!["a", "b"]);
        assert_eq!(ledger.log_count(), 3);
        assert_eq!(ledger.delete_count(), 1);
    }

    #[tokio::test]
    async fn test_recording_connection_capture() {
        let conn = RecordingConnection::new("tenant_1");
        conn.execute("CREATE TABLE a ()").await.unwrap();

        conn.begin_capture();
        assert!(conn.is_capturing());
        conn.execute("CREATE TABLE b ()").await.unwrap();
        let captured = conn.finish_capture();

        assert!(!conn.is_capturing());
        assert_eq!(captured, vec![CapturedQuery::new("CREATE TABLE b ()")]);
        assert_eq!(conn.executed(), vec!["CREATE TABLE a ()".to_string()]);
    }

    #[tokio::test]
    async fn test_recording_connection_failure() {
        let conn = RecordingConnection::new("tenant_1");
        conn.fail_when("DROP");
        assert!(conn.execute("DROP TABLE a").await.is_err());
        assert!(conn.executed().is_empty());
    }

    #[tokio::test]
    async fn test_memory_database_reuses_connections() {
        let db = MemoryDatabase::new();
        let a = db.connection("tenant_1").await.unwrap();
        a.execute("SELECT 1").await.unwrap();
        assert_eq!(db.recording("tenant_1").executed(), vec!["SELECT 1".to_string()]);
        assert_eq!(db.connection_names(), vec!["tenant_1".to_string()]);
    }

    #[tokio::test]
    async fn test_entities_find_create_chunk() {
        let entities = MemoryEntities::new("users");
        entities.insert(1);
        entities.insert(2);

        let found = entities.find(&TenantPayload::for_id(2)).await.unwrap();
        assert_eq!(found.map(|e| e.identity()), Some(TenantId::from(2)));
        assert!(entities.find(&TenantPayload::for_id(9)).await.unwrap().is_none());
        assert!(entities.find(&TenantPayload::default()).await.unwrap().is_none());

        let mut attrs = Attributes::new();
        attrs.insert("id".into(), Value::from(3));
        let created = entities.create(attrs).await.unwrap();
        assert_eq!(created.table(), "users");

        let page = entities.chunk(1, 5).await.unwrap();
        let ids: Vec<_> = page.iter().map(|e| e.identity()).collect();
        assert_eq!(ids, vec![TenantId::from(2), TenantId::from(3)]);
    }
}
