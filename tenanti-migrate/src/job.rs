//! Asynchronous tenant provisioning.
//!
//! [`CreateTenant`] is the unit of work queued when a tenant entity is
//! created. A worker handles it by installing the tenant's ledger and running
//! every pending migration. The entity may not be visible to the worker yet
//! (the creating transaction has not committed), in which case the job is
//! released back to the queue and tried again later.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::entity::{HasTenantConnection, TenantPayload};
use crate::error::MigrateResult;
use crate::manager::TenantiManager;

/// Deliveries beyond this count fail without doing any work.
pub const MAX_ATTEMPTS: u32 = 3;

/// Delay before a job whose tenant is not visible yet is retried.
pub const RELEASE_DELAY: Duration = Duration::from_secs(10);

/// Where a delivery of a job ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobState {
    /// Queued, waiting for a worker.
    Pending,
    /// Being handled.
    Running,
    /// Released back to the queue for the given delay.
    Delayed(Duration),
    /// Done and removed from the queue.
    Completed,
    /// Given up on.
    Failed,
}

impl JobState {
    /// Whether the job will not be delivered again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// The queue-side handle of one delivery.
#[async_trait]
pub trait QueueJob: Send + Sync {
    /// How many times the job has been delivered, this delivery included.
    fn attempts(&self) -> u32;

    /// Put the job back on the queue after `delay`.
    async fn release(&self, delay: Duration) -> MigrateResult<()>;

    /// Remove the job from the queue.
    async fn delete(&self) -> MigrateResult<()>;

    /// Mark the job as failed.
    async fn fail(&self) -> MigrateResult<()>;
}

/// Queue transport for provisioning jobs.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Enqueue a job.
    async fn dispatch(&self, job: CreateTenant) -> MigrateResult<()>;
}

/// Provision a new tenant: install its ledger and run its migrations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateTenant {
    /// Driver the tenant belongs to.
    pub driver: String,
    /// Raw tenant data used to look the entity up.
    pub payload: TenantPayload,
    /// Connection the ledger is installed on, if not the tenant's own.
    #[serde(default)]
    pub database: Option<String>,
}

impl CreateTenant {
    /// Create a job.
    pub fn new(driver: impl Into<String>, payload: TenantPayload) -> Self {
        Self {
            driver: driver.into(),
            payload,
            database: None,
        }
    }

    /// Install the ledger on `database`.
    pub fn with_database(mut self, database: impl Into<String>) -> Self {
        self.database = Some(database.into());
        self
    }

    /// Handle one delivery of this job.
    ///
    /// Errors are returned to the queue. Transports should retry only those
    /// that are [recoverable](crate::error::MigrationError::is_recoverable).
    pub async fn handle(&self, manager: &TenantiManager, delivery: &dyn QueueJob) -> MigrateResult<JobState> {
        let attempts = delivery.attempts();
        if attempts > MAX_ATTEMPTS {
            warn!(driver = %self.driver, attempts, "Tenant provisioning exceeded its attempts");
            delivery.fail().await?;
            return Ok(JobState::Failed);
        }

        let factory = manager.driver(Some(&self.driver))?;

        let Some(entity) = factory.entities().find(&self.payload).await? else {
            debug!(
                driver = %self.driver,
                tenant = ?self.payload.key(),
                attempts,
                "Tenant not visible yet, releasing job"
            );
            delivery.release(RELEASE_DELAY).await?;
            return Ok(JobState::Delayed(RELEASE_DELAY));
        };

        let mut migrator = factory.migrator(entity)?;
        migrator.run_install(self.database.as_deref()).await?;
        let report = migrator.run(false).await?;

        info!(driver = %self.driver, "{}", report.summary());
        delivery.delete().await?;
        Ok(JobState::Completed)
    }
}

/// Queues provisioning jobs for newly created tenants.
pub struct TenantProvisioner {
    queue: Arc<dyn JobQueue>,
    database: Option<String>,
}

impl std::fmt::Debug for TenantProvisioner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TenantProvisioner")
            .field("database", &self.database)
            .finish_non_exhaustive()
    }
}

impl TenantProvisioner {
    /// Create a provisioner over a queue.
    pub fn new(queue: Arc<dyn JobQueue>) -> Self {
        Self { queue, database: None }
    }

    /// Install ledgers on `database` instead of the tenant connection.
    pub fn with_database(mut self, database: impl Into<String>) -> Self {
        self.database = Some(database.into());
        self
    }

    /// Queue provisioning for a tenant described by `payload`.
    pub async fn enqueue_provisioning(&self, driver: &str, payload: TenantPayload) -> MigrateResult<()> {
        let mut job = CreateTenant::new(driver, payload);
        job.database = self.database.clone();

        debug!(driver, tenant = ?job.payload.key(), "Queueing tenant provisioning");
        self.queue.dispatch(job).await
    }

    /// Queue provisioning for a freshly created entity.
    pub async fn created(&self, driver: &str, entity: &dyn HasTenantConnection) -> MigrateResult<()> {
        self.enqueue_provisioning(driver, TenantPayload::from_entity(entity)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{ConnectionConfig, ConnectionRegistry, ConnectionStore, DatabaseTemplate};
    use crate::entity::Tenant;
    use crate::file::{MigrationSet, SqlMigration};
    use crate::history::{LedgerTable, MigrationRecord};
    use crate::manager::{DriverConfig, ModelRegistry};
    use crate::memory::{LedgerEvent, MemoryDatabase, MemoryEntities, MemoryLedger};
    use crate::migrator::Services;
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;

    const PATH: &str = "/migrations/users";

    #[derive(Debug, Clone, PartialEq)]
    enum Call {
        Release(Duration),
        Delete { ledger_events: usize },
        Fail,
    }

    struct Delivery {
        attempts: u32,
        ledger: Arc<MemoryLedger>,
        calls: Mutex<Vec<Call>>,
    }

    impl Delivery {
        fn new(attempts: u32, ledger: Arc<MemoryLedger>) -> Self {
            Self {
                attempts,
                ledger,
                calls: Mutex::new(Vec::new()),
            }
        }

        fn calls(&self) -> Vec<Call> {
            self.calls.lock().clone()
        }
    }

    #[async_trait]
    impl QueueJob for Delivery {
        fn attempts(&self) -> u32 {
            self.attempts
        }

        async fn release(&self, delay: Duration) -> MigrateResult<()> {
            self.calls.lock().push(Call::Release(delay));
            Ok(())
        }

        async fn delete(&self) -> MigrateResult<()> {
            let ledger_events = self.ledger.events().len();
            self.calls.lock().push(Call::Delete { ledger_events });
            Ok(())
        }

        async fn fail(&self) -> MigrateResult<()> {
            self.calls.lock().push(Call::Fail);
            Ok(())
        }
    }

    struct Fixture {
        manager: TenantiManager,
        entities: Arc<MemoryEntities>,
        ledger: Arc<MemoryLedger>,
        store: Arc<ConnectionRegistry>,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(ConnectionRegistry::new());
        let ledger = Arc::new(MemoryLedger::new());
        let entities = Arc::new(MemoryEntities::new("users"));
        let loader = MigrationSet::new().with(
            PATH,
            "2024_01_01_000000_create_posts",
            SqlMigration::new("posts", "CREATE TABLE posts (id INT)", "DROP TABLE posts"),
        );
        let services = Services::new(store.clone(), ledger.clone(), Arc::new(loader), Arc::new(MemoryDatabase::new()));
        let manager = TenantiManager::new(services, ModelRegistry::new().with("User", entities.clone()));

        let template = DatabaseTemplate::new(ConnectionConfig::new().with("database", "tenants"), |entity, t| {
            t.clone().with("database", format!("tenants_{}", entity.identity()))
        });
        manager.register_driver(
            "user",
            DriverConfig::new("User")
                .path(PATH)
                .connection_name("tenant_{id}")
                .template(template),
        );

        Fixture {
            manager,
            entities,
            ledger,
            store,
        }
    }

    #[tokio::test]
    async fn test_fourth_attempt_fails_without_work() {
        let fx = fixture();
        // An unknown driver proves the factory is never consulted.
        let job = CreateTenant::new("missing", TenantPayload::for_id(5));
        let delivery = Delivery::new(4, fx.ledger.clone());

        let state = job.handle(&fx.manager, &delivery).await.unwrap();

        assert_eq!(state, JobState::Failed);
        assert_eq!(delivery.calls(), vec![Call::Fail]);
        assert!(fx.ledger.events().is_empty());
    }

    #[tokio::test]
    async fn test_third_attempt_still_runs() {
        let fx = fixture();
        fx.entities.insert(5);
        let delivery = Delivery::new(3, fx.ledger.clone());

        let state = CreateTenant::new("user", TenantPayload::for_id(5))
            .handle(&fx.manager, &delivery)
            .await
            .unwrap();

        assert_eq!(state, JobState::Completed);
    }

    #[tokio::test]
    async fn test_unresolved_tenant_is_released() {
        let fx = fixture();
        let delivery = Delivery::new(1, fx.ledger.clone());

        let state = CreateTenant::new("user", TenantPayload::for_id(5))
            .handle(&fx.manager, &delivery)
            .await
            .unwrap();

        assert_eq!(state, JobState::Delayed(Duration::from_secs(10)));
        assert_eq!(delivery.calls(), vec![Call::Release(Duration::from_secs(10))]);
        assert!(fx.ledger.events().is_empty());
    }

    #[tokio::test]
    async fn test_install_then_up_then_delete() {
        let fx = fixture();
        fx.entities.insert(5);
        let delivery = Delivery::new(1, fx.ledger.clone());

        let state = CreateTenant::new("user", TenantPayload::for_id(5))
            .handle(&fx.manager, &delivery)
            .await
            .unwrap();

        let ledger = LedgerTable::new("tenant_5", "user_5_migrations");
        assert_eq!(state, JobState::Completed);
        assert_eq!(
            fx.ledger.events(),
            vec![
                LedgerEvent::Created(ledger.clone()),
                LedgerEvent::Logged(
                    ledger,
                    MigrationRecord::new("2024_01_01_000000_create_posts", 1)
                ),
            ]
        );
        assert_eq!(delivery.calls(), vec![Call::Delete { ledger_events: 2 }]);
        assert_eq!(
            fx.store.get("tenant_5"),
            Some(ConnectionConfig::new().with("database", "tenants_5"))
        );
    }

    #[tokio::test]
    async fn test_install_on_configured_database() {
        let fx = fixture();
        fx.entities.insert(6);
        let delivery = Delivery::new(1, fx.ledger.clone());

        CreateTenant::new("user", TenantPayload::for_id(6))
            .with_database("central")
            .handle(&fx.manager, &delivery)
            .await
            .unwrap();

        assert_eq!(
            fx.ledger.events().first(),
            Some(&LedgerEvent::Created(LedgerTable::new("central", "user_6_migrations")))
        );
    }

    #[tokio::test]
    async fn test_migration_errors_are_returned() {
        let fx = fixture();
        fx.entities.insert(5);
        let delivery = Delivery::new(1, fx.ledger.clone());

        let err = CreateTenant::new("nope", TenantPayload::for_id(5))
            .handle(&fx.manager, &delivery)
            .await
            .unwrap_err();

        assert!(err.is_configuration());
        assert!(delivery.calls().is_empty());
    }

    #[test]
    fn test_job_serializes() {
        let job = CreateTenant::new("user", TenantPayload::for_id(5)).with_database("central");
        let json = serde_json::to_value(&job).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"driver": "user", "payload": {"id": "5"}, "database": "central"})
        );

        let back: CreateTenant = serde_json::from_value(json).unwrap();
        assert_eq!(back, job);
    }

    struct RecordingQueue(Mutex<Vec<CreateTenant>>);

    #[async_trait]
    impl JobQueue for RecordingQueue {
        async fn dispatch(&self, job: CreateTenant) -> MigrateResult<()> {
            self.0.lock().push(job);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_provisioner_enqueues() {
        let queue = Arc::new(RecordingQueue(Mutex::new(Vec::new())));
        let provisioner = TenantProvisioner::new(queue.clone()).with_database("central");

        provisioner.created("user", &Tenant::new("users", 9)).await.unwrap();

        let jobs = queue.0.lock().clone();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].driver, "user");
        assert_eq!(jobs[0].payload.key().map(|k| k.to_string()), Some("9".to_string()));
        assert_eq!(jobs[0].database.as_deref(), Some("central"));
    }
}
