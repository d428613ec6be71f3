//! # Tenanti
//!
//! Tenant-aware schema migrations for multi-tenant applications.
//!
//! Every tenant (a user, a team, an organisation) gets its own database
//! connection, derived from a template, and its own migration ledger. Tenanti
//! provides:
//! - A driver registry mapping tenant types to models and migration paths
//! - Per-tenant connection resolution that registers each connection once
//! - Ordered up/down migrations with batches and dry runs
//! - Queued provisioning of new tenants with bounded retries
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use tenanti::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> MigrateResult<()> {
//!     tenanti::logging::init();
//!
//!     let config = TenantiConfig::from_file("tenanti.toml")?;
//!     let store = Arc::new(ConnectionRegistry::from_config(&config));
//!     let services = Services::new(store, ledger, Arc::new(MigrationFileManager::new()), databases);
//!     let manager = TenantiManager::from_config(&config, services, ModelRegistry::new().with("User", users))?;
//!
//!     let reports = manager.driver(None)?.each_tenant(Operation::Run { pretend: false }).await?;
//!     for report in reports {
//!         println!("{}", report.summary());
//!     }
//!     Ok(())
//! }
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]
#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

/// The migration engine.
pub mod migrate {
    pub use tenanti_migrate::*;
}

pub use tenanti_migrate::{config, connection, entity, error, job, logging, memory, queue, tenantor};

/// Prelude module for convenient imports.
pub mod prelude {
    pub use tenanti_migrate::{
        ConnectionConfig, ConnectionRegistry, ConnectionStore, CreateTenant, DatabaseTemplate,
        Direction, DriverConfig, EntityResolver, Factory, HasTenantConnection, LocalQueue,
        MigrateResult, Migration, MigrationContext, MigrationError, MigrationFileManager,
        MigrationLedger, MigrationReport, Migrator, ModelRegistry, Operation, Services, Tenant,
        TenantId, TenantModel, TenantPayload, TenantProvisioner, Tenantee, TenantiConfig,
        TenantiManager, Tenantor,
    };
}

// Re-export key types at the crate root
pub use tenanti_migrate::{
    Factory, MigrateResult, MigrationError, Migrator, TenantProvisioner, TenantiConfig,
    TenantiManager,
};
