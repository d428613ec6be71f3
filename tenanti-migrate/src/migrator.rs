//! The per-tenant migration step runner.
//!
//! A [`Migrator`] is bound to one tenant entity at a time. Binding resolves the
//! tenant's connection and ledger table; every step afterwards runs against
//! them:
//!
//! ```rust,ignore
//! let mut migrator = factory.migrator(Box::new(tenant))?;
//! migrator.run_install(None).await?;
//! let report = migrator.run(false).await?;
//! println!("{}", report.summary());
//! ```

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::connection::{
    CapturedQuery, ConnectionResolver, ConnectionStore, DatabaseConnection, DatabaseManager,
};
use crate::entity::{BoxedEntity, HasTenantConnection, TenantId, interpolate};
use crate::error::{MigrateResult, MigrationError};
use crate::factory::Driver;
use crate::file::{Direction, Migration, MigrationContext, MigrationLoader};
use crate::history::{LedgerTable, MigrationLedger, MigrationRecord};
use crate::tenantor::Tenantor;

/// Collaborators a migrator runs against.
#[derive(Clone)]
pub struct Services {
    /// Resolves and registers tenant connections.
    pub resolver: Arc<ConnectionResolver>,
    /// Per-tenant migration ledger.
    pub ledger: Arc<dyn MigrationLedger>,
    /// Migration discovery.
    pub loader: Arc<dyn MigrationLoader>,
    /// Live connections.
    pub databases: Arc<dyn DatabaseManager>,
}

impl Services {
    /// Create the service set.
    pub fn new(
        store: Arc<dyn ConnectionStore>,
        ledger: Arc<dyn MigrationLedger>,
        loader: Arc<dyn MigrationLoader>,
        databases: Arc<dyn DatabaseManager>,
    ) -> Self {
        Self {
            resolver: Arc::new(ConnectionResolver::new(store)),
            ledger,
            loader,
            databases,
        }
    }

    /// The connection store behind the resolver.
    pub fn store(&self) -> &Arc<dyn ConnectionStore> {
        self.resolver.store()
    }
}

impl fmt::Debug for Services {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Services")
            .field("resolver", &self.resolver)
            .finish_non_exhaustive()
    }
}

/// Result of a single step.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    /// The step ran and the ledger was updated.
    Applied,
    /// Pretend mode: the statements that would have run.
    Pretended(Vec<CapturedQuery>),
}

/// Result of a whole-tenant operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationReport {
    /// Tenant the operation ran for.
    pub tenant: TenantId,
    /// Connection the migrations ran on.
    pub connection: String,
    /// Batch used by `run`, absent for rollbacks or when nothing was pending.
    pub batch: Option<i64>,
    /// Migrations applied or rolled back, in execution order.
    pub migrations: Vec<String>,
    /// Captured statements in pretend mode.
    pub queries: Vec<CapturedQuery>,
    /// Whether this was a dry run.
    pub pretend: bool,
}

impl MigrationReport {
    fn new(binding: &TenantBinding, pretend: bool) -> Self {
        Self {
            tenant: binding.identity.clone(),
            connection: binding.connection.clone(),
            batch: None,
            migrations: Vec::new(),
            queries: Vec::new(),
            pretend,
        }
    }

    /// Check if any migration was processed.
    pub fn has_changes(&self) -> bool {
        !self.migrations.is_empty()
    }

    /// One-line summary of the report.
    pub fn summary(&self) -> String {
        if self.migrations.is_empty() {
            return format!("No migrations for tenant {}", self.tenant);
        }

        let verb = if self.pretend { "pretended" } else { "processed" };
        format!(
            "{} migration(s) {} for tenant {} on [{}]",
            self.migrations.len(),
            verb,
            self.tenant,
            self.connection
        )
    }
}

/// Ran and pending migrations of a tenant.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MigrationStatus {
    /// Applied migrations, in the order they were applied.
    pub ran: Vec<String>,
    /// Migrations not applied yet, ascending.
    pub pending: Vec<String>,
}

impl MigrationStatus {
    /// Check if the tenant is fully migrated.
    pub fn is_up_to_date(&self) -> bool {
        self.pending.is_empty()
    }
}

struct TenantBinding {
    entity: BoxedEntity,
    identity: TenantId,
    connection: String,
    ledger: LedgerTable,
    prefix: String,
}

/// Executes migrations for one bound tenant.
pub struct Migrator {
    driver: Arc<Driver>,
    services: Services,
    binding: Option<TenantBinding>,
    notes: Vec<String>,
}

impl fmt::Debug for Migrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Migrator")
            .field("driver", &self.driver.name)
            .field("tenant", &self.binding.as_ref().map(|b| &b.identity))
            .field("connection", &self.connection_name())
            .field("notes", &self.notes.len())
            .finish()
    }
}

impl Migrator {
    /// Create an unbound migrator.
    pub fn new(driver: Arc<Driver>, services: Services) -> Self {
        Self {
            driver,
            services,
            binding: None,
            notes: Vec::new(),
        }
    }

    /// Bind a tenant entity, resolving its connection and ledger table.
    pub fn bind(&mut self, mut entity: BoxedEntity) -> MigrateResult<&mut Self> {
        let driver = &self.driver;
        let identity = entity.identity();
        if identity.as_str().is_empty() {
            return Err(MigrationError::configuration(format!(
                "Tenant entity for driver [{}] has no identity",
                driver.name
            )));
        }

        let connection = match driver.connection_name.as_deref() {
            Some(pattern) => self.services.resolver.resolve(
                &driver.name,
                entity.as_mut(),
                pattern,
                driver.template.as_ref(),
            )?,
            None => self.own_connection(entity.as_ref())?,
        };

        let prefix = interpolate(&driver.prefix, entity.as_ref(), &[("driver", driver.name.as_str())]);
        let ledger = LedgerTable::new(connection.clone(), format!("{}_migrations", prefix));

        debug!(
            driver = %driver.name,
            tenant = %identity,
            connection = %connection,
            ledger = %ledger.table,
            "Bound tenant to migrator"
        );

        self.binding = Some(TenantBinding {
            entity,
            identity,
            connection,
            ledger,
            prefix,
        });
        Ok(self)
    }

    fn own_connection(&self, entity: &dyn HasTenantConnection) -> MigrateResult<String> {
        entity
            .connection()
            .map(str::to_string)
            .or_else(|| self.services.store().default_connection())
            .ok_or_else(|| {
                MigrationError::configuration(format!(
                    "No connection available for driver [{}]",
                    self.driver.name
                ))
            })
    }

    /// Release the bound entity.
    pub fn unbind(&mut self) -> Option<BoxedEntity> {
        self.binding.take().map(|binding| binding.entity)
    }

    /// Whether an entity is bound.
    pub fn is_bound(&self) -> bool {
        self.binding.is_some()
    }

    /// Name of the driver this migrator belongs to.
    pub fn driver(&self) -> &str {
        &self.driver.name
    }

    /// The bound entity.
    pub fn entity(&self) -> Option<&dyn HasTenantConnection> {
        self.binding.as_ref().map(|b| b.entity.as_ref())
    }

    /// Resolved connection of the bound entity.
    pub fn connection_name(&self) -> Option<&str> {
        self.binding.as_ref().map(|b| b.connection.as_str())
    }

    /// Ledger location of the bound entity.
    pub fn ledger_table(&self) -> Option<&LedgerTable> {
        self.binding.as_ref().map(|b| &b.ledger)
    }

    /// Resolved table prefix of the bound entity.
    pub fn table_prefix(&self) -> Option<&str> {
        self.binding.as_ref().map(|b| b.prefix.as_str())
    }

    /// Tenantor for the bound entity, for scoping tenant models.
    pub fn tenantor(&self) -> Option<Tenantor> {
        self.binding.as_ref().map(|b| {
            Tenantor::new(self.driver.name.clone(), b.identity.clone(), Some(b.connection.clone()))
        })
    }

    /// Progress lines produced so far.
    pub fn notes(&self) -> &[String] {
        &self.notes
    }

    /// Drain the progress lines.
    pub fn take_notes(&mut self) -> Vec<String> {
        std::mem::take(&mut self.notes)
    }

    fn bound(&self) -> MigrateResult<&TenantBinding> {
        self.binding.as_ref().ok_or(MigrationError::NotBound)
    }

    fn note(&mut self, line: String) {
        info!(driver = %self.driver.name, "{}", line);
        self.notes.push(line);
    }

    /// Create the tenant's ledger table unless it exists.
    ///
    /// With `connection`, the ledger moves to that connection for the rest of
    /// the binding.
    pub async fn run_install(&mut self, connection: Option<&str>) -> MigrateResult<()> {
        let binding = self.binding.as_mut().ok_or(MigrationError::NotBound)?;
        if let Some(connection) = connection {
            binding.ledger = binding.ledger.on_connection(connection);
        }
        let ledger = binding.ledger.clone();

        if self.services.ledger.repository_exists(&ledger).await? {
            return Ok(());
        }

        self.services.ledger.create_repository(&ledger).await?;
        debug!(connection = %ledger.connection, table = %ledger.table, "Created migration ledger");
        Ok(())
    }

    /// Apply one migration.
    pub async fn run_up(&mut self, file: &str, batch: i64, pretend: bool) -> MigrateResult<StepOutcome> {
        self.bound()?;
        let migration = self.services.loader.resolve(&self.driver.path, file).await?;

        if pretend {
            return self.pretend_to_run(file, migration.as_ref(), Direction::Up).await;
        }

        self.execute(migration.as_ref(), Direction::Up).await?;

        let Some(binding) = self.binding.as_ref() else {
            return Err(MigrationError::NotBound);
        };
        let line = format!(
            "Migrated [{}:{}]: {}",
            binding.entity.table(),
            binding.identity,
            file
        );
        let ledger = binding.ledger.clone();

        self.note(line);
        self.services.ledger.log(&ledger, file, batch).await?;
        Ok(StepOutcome::Applied)
    }

    /// Reverse one migration.
    pub async fn run_down(&mut self, record: &MigrationRecord, pretend: bool) -> MigrateResult<StepOutcome> {
        self.bound()?;
        let file = record.migration.as_str();
        let migration = self.services.loader.resolve(&self.driver.path, file).await?;

        if pretend {
            return self.pretend_to_run(file, migration.as_ref(), Direction::Down).await;
        }

        self.execute(migration.as_ref(), Direction::Down).await?;

        let Some(binding) = self.binding.as_ref() else {
            return Err(MigrationError::NotBound);
        };
        let line = format!(
            "Rolled back [{}:{}]: {}",
            binding.entity.table(),
            binding.identity,
            file
        );
        let ledger = binding.ledger.clone();

        self.note(line);
        self.services.ledger.delete(&ledger, record).await?;
        Ok(StepOutcome::Applied)
    }

    /// Statements a migration step would run, without running them.
    pub async fn get_queries(&self, file: &str, direction: Direction) -> MigrateResult<Vec<CapturedQuery>> {
        self.bound()?;
        let migration = self.services.loader.resolve(&self.driver.path, file).await?;
        self.capture(migration.as_ref(), direction).await
    }

    async fn pretend_to_run(
        &mut self,
        file: &str,
        migration: &dyn Migration,
        direction: Direction,
    ) -> MigrateResult<StepOutcome> {
        let queries = self.capture(migration, direction).await?;
        for query in &queries {
            self.note(format!("{}: {}", file, query.sql));
        }
        Ok(StepOutcome::Pretended(queries))
    }

    async fn open(&self, migration: &dyn Migration) -> MigrateResult<Arc<dyn DatabaseConnection>> {
        let binding = self.bound()?;
        let name = migration.connection().unwrap_or(binding.connection.as_str());
        self.services.databases.connection(name).await
    }

    async fn capture(&self, migration: &dyn Migration, direction: Direction) -> MigrateResult<Vec<CapturedQuery>> {
        let connection = self.open(migration).await?;

        connection.begin_capture();
        let result = self.step(migration, connection.as_ref(), direction).await;
        // Always leave capture mode, even when the body failed.
        let captured = connection.finish_capture();

        result.map(|()| captured)
    }

    async fn execute(&self, migration: &dyn Migration, direction: Direction) -> MigrateResult<()> {
        let connection = self.open(migration).await?;
        self.step(migration, connection.as_ref(), direction).await
    }

    async fn step(
        &self,
        migration: &dyn Migration,
        connection: &dyn DatabaseConnection,
        direction: Direction,
    ) -> MigrateResult<()> {
        let binding = self.bound()?;
        let cx = MigrationContext {
            identity: &binding.identity,
            entity: binding.entity.as_ref(),
            connection,
            prefix: &binding.prefix,
            driver: &self.driver.name,
        };

        match direction {
            Direction::Up => migration.up(&cx).await,
            Direction::Down => migration.down(&cx).await,
        }
    }

    /// Apply every pending migration in a new batch.
    pub async fn run(&mut self, pretend: bool) -> MigrateResult<MigrationReport> {
        let status = self.status().await?;
        let (mut report, ledger) = {
            let binding = self.bound()?;
            (MigrationReport::new(binding, pretend), binding.ledger.clone())
        };

        if status.pending.is_empty() {
            self.note("Nothing to migrate.".to_string());
            return Ok(report);
        }

        let batch = self.services.ledger.next_batch_number(&ledger).await?;
        report.batch = Some(batch);

        for file in status.pending {
            if let StepOutcome::Pretended(queries) = self.run_up(&file, batch, pretend).await? {
                report.queries.extend(queries);
            }
            report.migrations.push(file);
        }

        Ok(report)
    }

    /// Reverse the last batch, newest first.
    pub async fn rollback(&mut self, pretend: bool) -> MigrateResult<MigrationReport> {
        let ledger = self.bound()?.ledger.clone();
        let records = self.services.ledger.get_last(&ledger).await?;
        self.run_down_all(records, pretend, "Nothing to rollback.").await
    }

    /// Reverse every applied migration, newest first.
    pub async fn reset(&mut self, pretend: bool) -> MigrateResult<MigrationReport> {
        let ledger = self.bound()?.ledger.clone();
        let records = self.services.ledger.get_all(&ledger).await?;
        self.run_down_all(records, pretend, "Nothing to reset.").await
    }

    async fn run_down_all(
        &mut self,
        records: Vec<MigrationRecord>,
        pretend: bool,
        nothing: &str,
    ) -> MigrateResult<MigrationReport> {
        let mut report = MigrationReport::new(self.bound()?, pretend);

        if records.is_empty() {
            self.note(nothing.to_string());
            return Ok(report);
        }

        for record in records {
            if let StepOutcome::Pretended(queries) = self.run_down(&record, pretend).await? {
                report.queries.extend(queries);
            }
            report.migrations.push(record.migration);
        }

        Ok(report)
    }

    /// An empty report for the bound tenant.
    pub fn report(&self, pretend: bool) -> MigrateResult<MigrationReport> {
        Ok(MigrationReport::new(self.bound()?, pretend))
    }

    /// Ran and pending migrations of the bound tenant.
    ///
    /// A tenant without a ledger table has nothing ran yet.
    pub async fn status(&self) -> MigrateResult<MigrationStatus> {
        let binding = self.bound()?;
        let ran = if self.services.ledger.repository_exists(&binding.ledger).await? {
            self.services.ledger.get_ran(&binding.ledger).await?
        } else {
            Vec::new()
        };
        let applied: HashSet<&str> = ran.iter().map(String::as_str).collect();

        let pending = self
            .services
            .loader
            .list(&self.driver.path)
            .await?
            .into_iter()
            .filter(|file| !applied.contains(file.as_str()))
            .collect();

        Ok(MigrationStatus { ran, pending })
    }
}
