//! Per-driver migration factories.
//!
//! A [`Factory`] is what the manager hands out for a driver name. It owns the
//! driver's resolved settings and creates bound [`Migrator`]s, either for a
//! single tenant or for every tenant the driver's entity resolver knows about.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::connection::DatabaseTemplate;
use crate::entity::{BoxedEntity, EntityResolver};
use crate::error::MigrateResult;
use crate::migrator::{MigrationReport, Migrator, Services};

/// Default table prefix pattern.
pub const DEFAULT_PREFIX: &str = "{driver}_{id}";

/// Resolved settings of one driver.
#[derive(Clone)]
pub struct Driver {
    /// Driver name, e.g. `user`.
    pub name: String,
    /// Name of the model the entities were resolved from.
    pub model: String,
    /// Entity lookup for this driver's tenants.
    pub entities: Arc<dyn EntityResolver>,
    /// Migration directory.
    pub path: PathBuf,
    /// Connection name pattern; `None` keeps the entity's own connection.
    pub connection_name: Option<String>,
    /// Table prefix pattern.
    pub prefix: String,
    /// Template tenant connections are derived from.
    pub template: Option<DatabaseTemplate>,
    /// Page size for bulk operations.
    pub chunk: usize,
}

impl fmt::Debug for Driver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Driver")
            .field("name", &self.name)
            .field("model", &self.model)
            .field("path", &self.path)
            .field("connection_name", &self.connection_name)
            .field("prefix", &self.prefix)
            .field("template", &self.template)
            .field("chunk", &self.chunk)
            .finish_non_exhaustive()
    }
}

/// A whole-tenant operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    /// Create the ledger table.
    Install,
    /// Apply pending migrations.
    Run {
        /// Dry run.
        pretend: bool,
    },
    /// Reverse the last batch.
    Rollback {
        /// Dry run.
        pretend: bool,
    },
    /// Reverse every migration.
    Reset {
        /// Dry run.
        pretend: bool,
    },
}

/// Creates migrators for one driver.
#[derive(Debug)]
pub struct Factory {
    driver: Arc<Driver>,
    services: Services,
}

impl Factory {
    /// Create a factory.
    pub fn new(driver: Driver, services: Services) -> Self {
        Self {
            driver: Arc::new(driver),
            services,
        }
    }

    /// Driver name.
    pub fn name(&self) -> &str {
        &self.driver.name
    }

    /// Resolved driver settings.
    pub fn driver(&self) -> &Driver {
        &self.driver
    }

    /// Entity lookup for this driver.
    pub fn entities(&self) -> &Arc<dyn EntityResolver> {
        &self.driver.entities
    }

    /// A migrator bound to `entity`.
    pub fn migrator(&self, entity: BoxedEntity) -> MigrateResult<Migrator> {
        let mut migrator = Migrator::new(self.driver.clone(), self.services.clone());
        migrator.bind(entity)?;
        Ok(migrator)
    }

    /// Create the ledger table of one tenant.
    pub async fn install(&self, entity: BoxedEntity, database: Option<&str>) -> MigrateResult<()> {
        self.migrator(entity)?.run_install(database).await
    }

    /// Apply pending migrations of one tenant, installing the ledger first
    /// unless pretending.
    pub async fn run(&self, entity: BoxedEntity, pretend: bool) -> MigrateResult<MigrationReport> {
        let mut migrator = self.migrator(entity)?;
        if !pretend {
            migrator.run_install(None).await?;
        }
        migrator.run(pretend).await
    }

    /// Reverse the last batch of one tenant.
    pub async fn rollback(&self, entity: BoxedEntity, pretend: bool) -> MigrateResult<MigrationReport> {
        self.migrator(entity)?.rollback(pretend).await
    }

    /// Reverse every migration of one tenant.
    pub async fn reset(&self, entity: BoxedEntity, pretend: bool) -> MigrateResult<MigrationReport> {
        self.migrator(entity)?.reset(pretend).await
    }

    /// Apply an operation to one tenant.
    pub async fn apply(&self, entity: BoxedEntity, operation: Operation) -> MigrateResult<MigrationReport> {
        match operation {
            Operation::Install => {
                let mut migrator = self.migrator(entity)?;
                migrator.run_install(None).await?;
                migrator.report(false)
            }
            Operation::Run { pretend } => self.run(entity, pretend).await,
            Operation::Rollback { pretend } => self.rollback(entity, pretend).await,
            Operation::Reset { pretend } => self.reset(entity, pretend).await,
        }
    }

    /// Apply an operation to every tenant, one page of entities at a time.
    ///
    /// Stops at the first failing tenant.
    pub async fn each_tenant(&self, operation: Operation) -> MigrateResult<Vec<MigrationReport>> {
        let chunk = self.driver.chunk.max(1);
        let mut reports = Vec::new();
        let mut offset = 0;

        loop {
            let page = self.driver.entities.chunk(offset, chunk).await?;
            let count = page.len();
            debug!(driver = %self.driver.name, offset, count, "Processing tenant chunk");

            for entity in page {
                reports.push(self.apply(entity, operation).await?);
            }

            if count < chunk {
                break;
            }
            offset += count;
        }

        Ok(reports)
    }
}
