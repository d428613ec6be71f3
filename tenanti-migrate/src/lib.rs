//! # tenanti-migrate
//!
//! Tenant-aware migration engine for Tenanti.
//!
//! This crate provides functionality for:
//! - Deriving a connection per tenant from a template and registering it once
//! - Running ordered up/down migrations against a tenant's own connection
//! - Per-tenant migration ledgers with batch bookkeeping
//! - Dry runs that capture the SQL a migration would execute
//! - A driver registry mapping tenant types to models and migration paths
//! - Queued provisioning of new tenants with bounded retries
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────┐  driver()   ┌─────────┐  migrator(entity)  ┌──────────┐
//! │ TenantiManager │────────────▶│ Factory │───────────────────▶│ Migrator │
//! └────────────────┘             └─────────┘                    └──────────┘
//!         ▲                                                         │  │
//!         │ handle()                               resolve/register │  │ run_up / run_down
//! ┌────────────────┐                              ┌─────────────────┘  ▼
//! │  CreateTenant  │                              ▼             ┌──────────────┐
//! └────────────────┘                     ┌──────────────────┐   │ Ledger + SQL │
//!                                        │ ConnectionStore  │   └──────────────┘
//!                                        └──────────────────┘
//! ```
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use tenanti_migrate::{
//!     ConnectionConfig, ConnectionRegistry, DriverConfig, MigrationFileManager, ModelRegistry,
//!     Services, TenantiManager, Tenant,
//! };
//!
//! let store = Arc::new(
//!     ConnectionRegistry::new().with_connection("tenant", ConnectionConfig::new().with("database", "tenants")),
//! );
//! let services = Services::new(store, ledger, Arc::new(MigrationFileManager::new()), databases);
//! let manager = TenantiManager::new(services, ModelRegistry::new().with("User", users));
//!
//! manager.register_driver("user", DriverConfig::new("User").connection_name("tenant_{id}"));
//! manager.setup_multi_database(Some("tenant"), |entity, template| {
//!     template.clone().with("database", format!("tenants_{}", entity.identity()))
//! })?;
//!
//! let factory = manager.driver(Some("user"))?;
//! let report = factory.run(Box::new(Tenant::new("users", 5)), false).await?;
//! println!("{}", report.summary());
//! ```

pub mod config;
pub mod connection;
pub mod entity;
pub mod error;
pub mod factory;
pub mod file;
pub mod history;
pub mod job;
pub mod logging;
pub mod manager;
pub mod memory;
pub mod migrator;
pub mod queue;
pub mod tenantor;

// Re-exports
pub use config::{DatabaseSettings, DriverSettings, TenantiConfig, TenantiSettings};
pub use connection::{
    CapturedQuery, ConnectionConfig, ConnectionRegistry, ConnectionResolver, ConnectionStore,
    DatabaseConnection, DatabaseManager, DatabaseTemplate, Registration, TemplateResolver,
};
pub use entity::{
    Attributes, BoxedEntity, EntityResolver, HasTenantConnection, Tenant, TenantId, TenantPayload,
    interpolate, replace_tokens,
};
pub use error::{MigrateResult, MigrationError};
pub use factory::{Driver, Factory, Operation};
pub use file::{
    Direction, Migration, MigrationContext, MigrationFileManager, MigrationLoader, MigrationSet,
    SqlMigration,
};
pub use history::{LedgerTable, MigrationLedger, MigrationRecord};
pub use job::{CreateTenant, JobQueue, JobState, QueueJob, TenantProvisioner};
pub use manager::{DriverConfig, ModelRegistry, TenantiManager};
pub use memory::{MemoryDatabase, MemoryEntities, MemoryLedger, RecordingConnection};
pub use migrator::{MigrationReport, MigrationStatus, Migrator, Services, StepOutcome};
pub use queue::{DeliveryRecord, LocalQueue};
pub use tenantor::{TenantModel, Tenantee, Tenantor};
