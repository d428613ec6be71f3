//! Tenant connection configuration.
//!
//! The [`ConnectionStore`] is the process-wide table of named connection
//! configurations (`database.connections.*`). [`ConnectionResolver`] derives a
//! tenant's connection from a [`DatabaseTemplate`] and registers it there,
//! exactly once per tenant.
//!
//! ```rust,ignore
//! use tenanti_migrate::connection::{ConnectionConfig, ConnectionRegistry, DatabaseTemplate};
//!
//! let template = DatabaseTemplate::new(
//!     ConnectionConfig::new().with("database", "tenants"),
//!     |entity, template| template.clone().with("database", format!("tenants_{}", entity.identity())),
//! );
//! ```

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock, RwLockUpgradableReadGuard};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::config::TenantiConfig;
use crate::entity::{HasTenantConnection, interpolate};
use crate::error::{MigrateResult, MigrationError};

/// A materialized key/value connection configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionConfig(IndexMap<String, Value>);

impl ConnectionConfig {
    /// Create an empty configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a key, builder style.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    /// Set a key.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(key.into(), value.into());
    }

    /// Get a key.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// Get a string key.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }

    /// Iterate over the entries in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    /// Number of keys.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Check if empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for ConnectionConfig {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

/// Outcome of an insert-if-absent on the connection store.
#[derive(Debug, Clone, PartialEq)]
pub enum Registration {
    /// A configuration was already present and has been left untouched.
    Existing(ConnectionConfig),
    /// The configuration was materialized by this call.
    Created(ConnectionConfig),
}

impl Registration {
    /// Whether this call created the entry.
    pub fn is_created(&self) -> bool {
        matches!(self, Self::Created(_))
    }

    /// The stored configuration.
    pub fn config(&self) -> &ConnectionConfig {
        match self {
            Self::Existing(config) | Self::Created(config) => config,
        }
    }
}

/// Process-wide store of named connection configurations.
pub trait ConnectionStore: Send + Sync {
    /// Get a configuration by name.
    fn get(&self, name: &str) -> Option<ConnectionConfig>;

    /// Store a configuration, replacing any previous one.
    fn set(&self, name: &str, config: ConnectionConfig);

    /// Atomically return the configuration under `name`, materializing it with
    /// `make` when absent. `make` runs at most once per name across callers.
    fn get_or_register(&self, name: &str, make: &mut dyn FnMut() -> ConnectionConfig) -> Registration;

    /// Make `name` the default connection.
    fn set_default(&self, name: &str);

    /// Name of the default connection.
    fn default_connection(&self) -> Option<String>;

    /// Check whether a configuration exists.
    fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }
}

#[derive(Debug, Default)]
struct RegistryState {
    default: Option<String>,
    connections: IndexMap<String, ConnectionConfig>,
}

/// In-process [`ConnectionStore`].
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    state: RwLock<RegistryState>,
}

impl ConnectionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the registry from the `[database]` section of a configuration file.
    pub fn from_config(config: &TenantiConfig) -> Self {
        let state = RegistryState {
            default: config.database.default.clone(),
            connections: config.database.connections.clone(),
        };
        Self {
            state: RwLock::new(state),
        }
    }

    /// Add a connection, builder style.
    pub fn with_connection(self, name: impl Into<String>, config: ConnectionConfig) -> Self {
        self.state.write().connections.insert(name.into(), config);
        self
    }

    /// Set the default connection, builder style.
    pub fn with_default(self, name: impl Into<String>) -> Self {
        self.state.write().default = Some(name.into());
        self
    }

    /// Names of all registered connections.
    pub fn names(&self) -> Vec<String> {
        self.state.read().connections.keys().cloned().collect()
    }

    /// Number of registered connections.
    pub fn len(&self) -> usize {
        self.state.read().connections.len()
    }

    /// Check if empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ConnectionStore for ConnectionRegistry {
    fn get(&self, name: &str) -> Option<ConnectionConfig> {
        self.state.read().connections.get(name).cloned()
    }

    fn set(&self, name: &str, config: ConnectionConfig) {
        self.state.write().connections.insert(name.to_string(), config);
    }

    fn get_or_register(&self, name: &str, make: &mut dyn FnMut() -> ConnectionConfig) -> Registration {
        // Upgradable reads are exclusive with each other, so two racing
        // callers cannot both observe the entry as missing.
        let state = self.state.upgradable_read();
        if let Some(existing) = state.connections.get(name) {
            return Registration::Existing(existing.clone());
        }

        let config = make();
        let mut state = RwLockUpgradableReadGuard::upgrade(state);
        state.connections.insert(name.to_string(), config.clone());
        Registration::Created(config)
    }

    fn set_default(&self, name: &str) {
        self.state.write().default = Some(name.to_string());
    }

    fn default_connection(&self) -> Option<String> {
        self.state.read().default.clone()
    }
}

/// Transform from a template to a tenant's connection configuration.
pub type TemplateResolver =
    Arc<dyn Fn(&dyn HasTenantConnection, &ConnectionConfig) -> ConnectionConfig + Send + Sync>;

/// Base connection configuration plus the per-tenant transform applied to it.
#[derive(Clone)]
pub struct DatabaseTemplate {
    /// The base configuration.
    pub template: ConnectionConfig,
    /// The per-tenant transform.
    pub resolver: TemplateResolver,
}

impl fmt::Debug for DatabaseTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseTemplate")
            .field("template", &self.template)
            .finish_non_exhaustive()
    }
}

impl DatabaseTemplate {
    /// Create a template with a transform.
    pub fn new<F>(template: ConnectionConfig, resolver: F) -> Self
    where
        F: Fn(&dyn HasTenantConnection, &ConnectionConfig) -> ConnectionConfig + Send + Sync + 'static,
    {
        Self {
            template,
            resolver: Arc::new(resolver),
        }
    }

    /// Template whose string values are interpolated per tenant, e.g.
    /// `database = "tenants_{id}"`.
    pub fn with_pattern(template: ConnectionConfig) -> Self {
        Self::new(template, |entity, template| {
            template
                .iter()
                .map(|(key, value)| {
                    let value = match value {
                        Value::String(s) => Value::String(interpolate(s, entity, &[])),
                        other => other.clone(),
                    };
                    (key.clone(), value)
                })
                .collect()
        })
    }

    /// Look up a named connection to use as the template.
    pub fn from_connection<F>(store: &dyn ConnectionStore, name: &str, resolver: F) -> MigrateResult<Self>
    where
        F: Fn(&dyn HasTenantConnection, &ConnectionConfig) -> ConnectionConfig + Send + Sync + 'static,
    {
        let template = store
            .get(name)
            .ok_or_else(|| MigrationError::connection_unavailable(name))?;
        Ok(Self::new(template, resolver))
    }

    /// Apply the transform for one tenant.
    pub fn materialize(&self, entity: &dyn HasTenantConnection) -> ConnectionConfig {
        (self.resolver)(entity, &self.template)
    }
}

/// Derives and registers tenant connections.
pub struct ConnectionResolver {
    store: Arc<dyn ConnectionStore>,
    defaulted: Mutex<HashSet<String>>,
}

impl fmt::Debug for ConnectionResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionResolver")
            .field("defaulted", &*self.defaulted.lock())
            .finish_non_exhaustive()
    }
}

impl ConnectionResolver {
    /// Create a resolver over a store.
    pub fn new(store: Arc<dyn ConnectionStore>) -> Self {
        Self {
            store,
            defaulted: Mutex::new(HashSet::new()),
        }
    }

    /// The underlying store.
    pub fn store(&self) -> &Arc<dyn ConnectionStore> {
        &self.store
    }

    /// Resolve the connection for `entity` and point the entity at it.
    ///
    /// With a template the tenant configuration is materialized and stored
    /// unless one already exists under the synthesized name; the first tenant
    /// connection created for a driver also becomes the default connection.
    /// Without a template the entity is pointed at the pattern-derived name
    /// directly and pinned to its write connection.
    pub fn resolve(
        &self,
        driver: &str,
        entity: &mut dyn HasTenantConnection,
        pattern: &str,
        template: Option<&DatabaseTemplate>,
    ) -> MigrateResult<String> {
        if entity.identity().as_str().is_empty() {
            return Err(MigrationError::configuration(format!(
                "Tenant entity for driver [{}] has no identity",
                driver
            )));
        }

        let name = interpolate(pattern, &*entity, &[("driver", driver)]);
        if name.is_empty() {
            return Err(MigrationError::configuration(format!(
                "Connection name for driver [{}] resolved to an empty string",
                driver
            )));
        }

        match template {
            Some(template) => {
                let registration = {
                    let tenant: &dyn HasTenantConnection = &*entity;
                    self.store
                        .get_or_register(&name, &mut || template.materialize(tenant))
                };

                if registration.is_created() {
                    debug!(driver, connection = %name, "Registered tenant connection");
                    if self.defaulted.lock().insert(driver.to_string()) {
                        self.store.set_default(&name);
                        debug!(driver, connection = %name, "Tenant connection set as default");
                    }
                }
                entity.set_connection(Some(name.clone()));
            }
            None => {
                entity.set_connection(Some(name.clone()));
                entity.use_write_connection();
            }
        }

        Ok(name)
    }
}

/// A statement captured while pretending.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapturedQuery {
    /// SQL text.
    pub sql: String,
    /// Bound parameters.
    #[serde(default)]
    pub bindings: Vec<Value>,
}

impl CapturedQuery {
    /// Create a captured query without bindings.
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            bindings: Vec::new(),
        }
    }
}

/// A live connection to a tenant database (the SQL engine).
#[async_trait]
pub trait DatabaseConnection: Send + Sync {
    /// Name of this connection.
    fn name(&self) -> &str;

    /// Execute a statement. While capturing, the statement is recorded instead.
    async fn execute(&self, sql: &str) -> MigrateResult<u64>;

    /// Switch into capture mode.
    fn begin_capture(&self);

    /// Leave capture mode and return what was captured.
    fn finish_capture(&self) -> Vec<CapturedQuery>;
}

/// Hands out connections by name.
#[async_trait]
pub trait DatabaseManager: Send + Sync {
    /// Get the connection registered under `name`.
    async fn connection(&self, name: &str) -> MigrateResult<Arc<dyn DatabaseConnection>>;
}
