//! In-process queue transport for provisioning jobs.
//!
//! [`LocalQueue`] runs a single worker task that handles [`CreateTenant`]
//! jobs as they are dispatched. It gives jobs the delivery semantics a real
//! queue would: attempt counting, delayed release, retry after recoverable
//! errors and a terminal failed list. Useful for tests and single-process deployments.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{MigrateResult, MigrationError};
use crate::job::{CreateTenant, JobQueue, JobState, QueueJob};
use crate::manager::TenantiManager;

/// One handled delivery, as recorded by the queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryRecord {
    /// The job.
    pub job: CreateTenant,
    /// Attempt number of this delivery, starting at 1.
    pub attempt: u32,
    /// Resulting state, or the error the handler returned.
    pub outcome: Result<JobState, String>,
}

#[derive(Debug)]
struct Envelope {
    job: CreateTenant,
    attempts: u32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Ack {
    Released(Duration),
    Deleted,
    Failed,
}

struct LocalDelivery {
    attempts: u32,
    ack: Mutex<Option<Ack>>,
}

impl LocalDelivery {
    fn new(attempts: u32) -> Self {
        Self {
            attempts,
            ack: Mutex::new(None),
        }
    }

    fn acknowledge(&self, ack: Ack) -> MigrateResult<()> {
        let mut slot = self.ack.lock();
        if let Some(previous) = *slot {
            return Err(MigrationError::queue(format!(
                "Delivery already acknowledged with {:?}",
                previous
            )));
        }
        *slot = Some(ack);
        Ok(())
    }
}

#[async_trait]
impl QueueJob for LocalDelivery {
    fn attempts(&self) -> u32 {
        self.attempts
    }

    async fn release(&self, delay: Duration) -> MigrateResult<()> {
        self.acknowledge(Ack::Released(delay))
    }

    async fn delete(&self) -> MigrateResult<()> {
        self.acknowledge(Ack::Deleted)
    }

    async fn fail(&self) -> MigrateResult<()> {
        self.acknowledge(Ack::Failed)
    }
}

#[derive(Default)]
struct QueueState {
    in_flight: AtomicUsize,
    idle: Notify,
    history: Mutex<Vec<DeliveryRecord>>,
    completed: Mutex<Vec<CreateTenant>>,
    failed: Mutex<Vec<CreateTenant>>,
}

impl QueueState {
    fn settle(&self) {
        if self.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.idle.notify_waiters();
        }
    }
}

/// Single-worker in-process job queue.
pub struct LocalQueue {
    sender: mpsc::UnboundedSender<Envelope>,
    state: Arc<QueueState>,
    worker: JoinHandle<()>,
}

impl std::fmt::Debug for LocalQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalQueue")
            .field("in_flight", &self.in_flight())
            .finish_non_exhaustive()
    }
}

impl LocalQueue {
    /// Start the worker. Must be called within a tokio runtime.
    pub fn start(manager: Arc<TenantiManager>) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        let state = Arc::new(QueueState::default());
        let worker = tokio::spawn(work(manager, receiver, sender.clone(), state.clone()));

        Self { sender, state, worker }
    }

    /// Jobs dispatched but not yet completed or failed.
    pub fn in_flight(&self) -> usize {
        self.state.in_flight.load(Ordering::SeqCst)
    }

    /// Wait until every dispatched job is completed or failed.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.state.idle.notified();
            if self.in_flight() == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Every delivery handled so far.
    pub fn history(&self) -> Vec<DeliveryRecord> {
        self.state.history.lock().clone()
    }

    /// Jobs that completed.
    pub fn completed(&self) -> Vec<CreateTenant> {
        self.state.completed.lock().clone()
    }

    /// Jobs that were given up on.
    pub fn failed(&self) -> Vec<CreateTenant> {
        self.state.failed.lock().clone()
    }
}

impl Drop for LocalQueue {
    fn drop(&mut self) {
        self.worker.abort();
    }
}

#[async_trait]
impl JobQueue for LocalQueue {
    async fn dispatch(&self, job: CreateTenant) -> MigrateResult<()> {
        self.state.in_flight.fetch_add(1, Ordering::SeqCst);
        let envelope = Envelope { job, attempts: 0 };

        if self.sender.send(envelope).is_err() {
            self.state.settle();
            return Err(MigrationError::queue("Local queue worker has stopped"));
        }
        Ok(())
    }
}

async fn work(
    manager: Arc<TenantiManager>,
    mut receiver: mpsc::UnboundedReceiver<Envelope>,
    sender: mpsc::UnboundedSender<Envelope>,
    state: Arc<QueueState>,
) {
    while let Some(mut envelope) = receiver.recv().await {
        envelope.attempts += 1;
        let delivery = LocalDelivery::new(envelope.attempts);
        let result = envelope.job.handle(&manager, &delivery).await;
        let ack = *delivery.ack.lock();

        state.history.lock().push(DeliveryRecord {
            job: envelope.job.clone(),
            attempt: envelope.attempts,
            outcome: result.as_ref().copied().map_err(ToString::to_string),
        });

        match (result, ack) {
            (Ok(_), Some(Ack::Released(delay))) => {
                debug!(driver = %envelope.job.driver, ?delay, "Job released");
                let sender = sender.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = sender.send(envelope);
                });
            }
            (Ok(_), Some(Ack::Failed)) => {
                state.failed.lock().push(envelope.job);
                state.settle();
            }
            (Ok(_), Some(Ack::Deleted) | None) => {
                state.completed.lock().push(envelope.job);
                state.settle();
            }
            (Err(error), _) if !error.is_recoverable() => {
                warn!(
                    driver = %envelope.job.driver,
                    attempt = envelope.attempts,
                    error = %error,
                    "Job failed permanently"
                );
                state.failed.lock().push(envelope.job);
                state.settle();
            }
            (Err(error), _) => {
                warn!(
                    driver = %envelope.job.driver,
                    attempt = envelope.attempts,
                    error = %error,
                    "Job failed, retrying"
                );
                if sender.send(envelope).is_err() {
                    state.settle();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionRegistry;
    use crate::entity::TenantPayload;
    use crate::file::{MigrationSet, SqlMigration};
    use crate::job::TenantProvisioner;
    use crate::manager::{DriverConfig, ModelRegistry};
    use crate::memory::{MemoryDatabase, MemoryEntities, MemoryLedger};
    use crate::migrator::Services;
    use pretty_assertions::assert_eq;

    const PATH: &str = "/migrations/users";

    fn manager(entities: Arc<MemoryEntities>, up_sql: &str) -> (Arc<TenantiManager>, Arc<MemoryDatabase>) {
        let databases = Arc::new(MemoryDatabase::new());
        let loader = MigrationSet::new().with(
            PATH,
            "2024_01_01_000000_create_posts",
            SqlMigration::new("posts", up_sql, ""),
        );
        let services = Services::new(
            Arc::new(ConnectionRegistry::new()),
            Arc::new(MemoryLedger::new()),
            Arc::new(loader),
            databases.clone(),
        );
        let manager = TenantiManager::new(services, ModelRegistry::new().with("User", entities));
        manager.register_driver("user", DriverConfig::new("User").path(PATH).connection_name("tenant_{id}"));
        (Arc::new(manager), databases)
    }

    #[tokio::test]
    async fn test_job_completes() {
        let entities = Arc::new(MemoryEntities::new("users"));
        entities.insert(1);
        let (manager, databases) = manager(entities, "CREATE TABLE posts (id INT)");
        let queue = Arc::new(LocalQueue::start(manager));

        TenantProvisioner::new(queue.clone())
            .enqueue_provisioning("user", TenantPayload::for_id(1))
            .await
            .unwrap();
        queue.wait_idle().await;

        assert_eq!(queue.completed().len(), 1);
        assert_eq!(
            databases.recording("tenant_1").executed(),
            vec!["CREATE TABLE posts (id INT)".to_string()]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_released_job_runs_once_tenant_appears() {
        let entities = Arc::new(MemoryEntities::new("users"));
        let (manager, _) = manager(entities.clone(), "SELECT 1");
        let queue = LocalQueue::start(manager);

        queue
            .dispatch(CreateTenant::new("user", TenantPayload::for_id(2)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(queue.history()[0].outcome, Ok(JobState::Delayed(Duration::from_secs(10))));

        entities.insert(2);
        queue.wait_idle().await;

        let attempts: Vec<_> = queue.history().iter().map(|r| r.attempt).collect();
        assert_eq!(attempts, vec![1, 2]);
        assert_eq!(queue.history()[1].outcome, Ok(JobState::Completed));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unresolvable_tenant_eventually_fails() {
        let (manager, _) = manager(Arc::new(MemoryEntities::new("users")), "SELECT 1");
        let queue = LocalQueue::start(manager);

        queue
            .dispatch(CreateTenant::new("user", TenantPayload::for_id(3)))
            .await
            .unwrap();
        queue.wait_idle().await;

        let outcomes: Vec<_> = queue.history().into_iter().map(|r| r.outcome).collect();
        let delayed = Ok(JobState::Delayed(Duration::from_secs(10)));
        assert_eq!(
            outcomes,
            vec![delayed.clone(), delayed.clone(), delayed, Ok(JobState::Failed)]
        );
        assert_eq!(queue.failed().len(), 1);
    }

    #[tokio::test]
    async fn test_configuration_errors_are_not_retried() {
        let (manager, _) = manager(Arc::new(MemoryEntities::new("users")), "SELECT 1");
        let queue = LocalQueue::start(manager);

        queue
            .dispatch(CreateTenant::new("team", TenantPayload::for_id(1)))
            .await
            .unwrap();
        queue.wait_idle().await;

        let history = queue.history();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].attempt, 1);
        assert!(history[0].outcome.is_err());
        assert_eq!(queue.failed().len(), 1);
    }

    #[tokio::test]
    async fn test_errors_are_retried_until_failed() {
        let entities = Arc::new(MemoryEntities::new("users"));
        entities.insert(4);
        let (manager, databases) = manager(entities, "CREATE TABLE posts (id INT)");
        databases.recording("tenant_4").fail_when("CREATE");
        let queue = LocalQueue::start(manager);

        queue
            .dispatch(CreateTenant::new("user", TenantPayload::for_id(4)))
            .await
            .unwrap();
        queue.wait_idle().await;

        let history = queue.history();
        assert_eq!(history.len(), 4);
        assert!(history[..3].iter().all(|r| r.outcome.is_err()));
        assert_eq!(history[3].outcome, Ok(JobState::Failed));
        assert!(queue.completed().is_empty());
        assert_eq!(queue.failed().len(), 1);
    }
}
