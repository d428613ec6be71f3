//! The driver registry.
//!
//! [`TenantiManager`] maps driver names (`user`, `team`, ...) to their
//! configuration and hands out one memoized [`Factory`] per driver:
//!
//! ```rust,ignore
//! let manager = TenantiManager::new(services, ModelRegistry::new().with("User", users));
//! manager.register_driver("user", DriverConfig::new("User").connection_name("tenant_{id}"));
//! manager.setup_multi_database(Some("tenant"), |entity, template| {
//!     template.clone().with("database", format!("tenants_{}", entity.identity()))
//! })?;
//!
//! let factory = manager.driver(Some("user"))?;
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};
use tracing::debug;

use crate::config::{DEFAULT_CHUNK, DEFAULT_PATH, DriverSettings, TenantiConfig};
use crate::connection::{ConnectionConfig, ConnectionStore, DatabaseTemplate};
use crate::entity::{EntityResolver, HasTenantConnection};
use crate::error::{MigrateResult, MigrationError};
use crate::factory::{DEFAULT_PREFIX, Driver, Factory};
use crate::migrator::Services;

/// Connection name pattern used when a driver has a template but no pattern.
pub const DEFAULT_CONNECTION_NAME: &str = "{driver}_{id}";

/// Registration-time configuration of a driver.
///
/// Every field is optional so partial registrations can be merged.
#[derive(Debug, Clone, Default)]
pub struct DriverConfig {
    /// Model name, looked up in the [`ModelRegistry`].
    pub model: Option<String>,
    /// Migration directory.
    pub path: Option<PathBuf>,
    /// Connection name pattern.
    pub connection_name: Option<String>,
    /// Table prefix pattern.
    pub prefix: Option<String>,
    /// Template for tenant connections.
    pub template: Option<DatabaseTemplate>,
    /// Page size for bulk operations.
    pub chunk: Option<usize>,
}

impl DriverConfig {
    /// Create a configuration for a model.
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: Some(model.into()),
            ..Self::default()
        }
    }

    /// Set the migration directory.
    pub fn path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    /// Set the connection name pattern.
    pub fn connection_name(mut self, pattern: impl Into<String>) -> Self {
        self.connection_name = Some(pattern.into());
        self
    }

    /// Set the table prefix pattern.
    pub fn prefix(mut self, pattern: impl Into<String>) -> Self {
        self.prefix = Some(pattern.into());
        self
    }

    /// Set the connection template.
    pub fn template(mut self, template: DatabaseTemplate) -> Self {
        self.template = Some(template);
        self
    }

    /// Set the page size.
    pub fn chunk(mut self, chunk: usize) -> Self {
        self.chunk = Some(chunk);
        self
    }

    /// Overlay `other` onto `self`; values set in `other` win.
    pub fn merge(self, other: DriverConfig) -> Self {
        Self {
            model: other.model.or(self.model),
            path: other.path.or(self.path),
            connection_name: other.connection_name.or(self.connection_name),
            prefix: other.prefix.or(self.prefix),
            template: other.template.or(self.template),
            chunk: other.chunk.or(self.chunk),
        }
    }
}

/// Entity resolvers by model name.
#[derive(Clone, Default)]
pub struct ModelRegistry {
    models: IndexMap<String, Arc<dyn EntityResolver>>,
}

impl std::fmt::Debug for ModelRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.models.keys()).finish()
    }
}

impl ModelRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a model, builder style.
    pub fn with(mut self, name: impl Into<String>, resolver: Arc<dyn EntityResolver>) -> Self {
        self.register(name, resolver);
        self
    }

    /// Register a model.
    pub fn register(&mut self, name: impl Into<String>, resolver: Arc<dyn EntityResolver>) {
        self.models.insert(name.into(), resolver);
    }

    /// Look a model up.
    pub fn get(&self, name: &str) -> Option<Arc<dyn EntityResolver>> {
        self.models.get(name).cloned()
    }

    /// Registered model names.
    pub fn names(&self) -> Vec<String> {
        self.models.keys().cloned().collect()
    }
}

#[derive(Debug)]
struct ManagerState {
    pending: IndexMap<String, DriverConfig>,
    factories: IndexMap<String, Arc<Factory>>,
    chunk: usize,
    path: PathBuf,
    default_driver: Option<String>,
    database: Option<DatabaseTemplate>,
}

impl Default for ManagerState {
    fn default() -> Self {
        Self {
            pending: IndexMap::new(),
            factories: IndexMap::new(),
            chunk: DEFAULT_CHUNK,
            path: PathBuf::from(DEFAULT_PATH),
            default_driver: None,
            database: None,
        }
    }
}

/// Registry of tenant drivers.
#[derive(Debug)]
pub struct TenantiManager {
    services: Services,
    models: RwLock<ModelRegistry>,
    state: Mutex<ManagerState>,
}

impl TenantiManager {
    /// Create a manager.
    pub fn new(services: Services, models: ModelRegistry) -> Self {
        Self {
            services,
            models: RwLock::new(models),
            state: Mutex::new(ManagerState::default()),
        }
    }

    /// Create a manager and register everything a configuration file declares.
    pub fn from_config(config: &TenantiConfig, services: Services, models: ModelRegistry) -> MigrateResult<Self> {
        let manager = Self::new(services, models);
        manager.configure(config)?;
        Ok(manager)
    }

    /// Collaborators handed to every factory.
    pub fn services(&self) -> &Services {
        &self.services
    }

    /// Register an entity resolver under a model name.
    pub fn register_model(&self, name: impl Into<String>, resolver: Arc<dyn EntityResolver>) {
        self.models.write().register(name, resolver);
    }

    /// Register a driver, merging into an earlier registration of the same name.
    pub fn register_driver(&self, name: impl Into<String>, config: DriverConfig) {
        let name = name.into();
        let mut state = self.state.lock();
        match state.pending.get_mut(&name) {
            Some(existing) => *existing = std::mem::take(existing).merge(config),
            None => {
                state.pending.insert(name, config);
            }
        }
    }

    /// Register the drivers and defaults of a configuration file.
    ///
    /// The configuration is validated first, so nothing is registered when
    /// it is inconsistent.
    pub fn configure(&self, config: &TenantiConfig) -> MigrateResult<()> {
        config.validate()?;
        {
            let mut state = self.state.lock();
            state.chunk = config.tenanti.chunk;
            state.path = config.tenanti.path.clone();
            if config.tenanti.default_driver.is_some() {
                state.default_driver = config.tenanti.default_driver.clone();
            }
        }

        for (name, settings) in &config.tenanti.drivers {
            let driver = Self::driver_config(config, settings)?;
            self.register_driver(name.clone(), driver);
        }

        debug!(drivers = config.tenanti.drivers.len(), "Configured tenant drivers");
        Ok(())
    }

    fn driver_config(config: &TenantiConfig, settings: &DriverSettings) -> MigrateResult<DriverConfig> {
        let template = match &settings.template {
            Some(name) => {
                let base = config
                    .database
                    .connections
                    .get(name)
                    .cloned()
                    .ok_or_else(|| MigrationError::connection_unavailable(name))?;
                Some(DatabaseTemplate::with_pattern(base))
            }
            None => None,
        };

        Ok(DriverConfig {
            model: Some(settings.model.clone()),
            path: settings.path.clone(),
            connection_name: settings.connection_name.clone(),
            prefix: settings.prefix.clone(),
            template,
            chunk: settings.chunk,
        })
    }

    /// Use `name` as the tenant template shared by every driver without a
    /// template of its own. `None` uses the default connection.
    pub fn setup_multi_database<F>(&self, name: Option<&str>, resolver: F) -> MigrateResult<()>
    where
        F: Fn(&dyn HasTenantConnection, &ConnectionConfig) -> ConnectionConfig + Send + Sync + 'static,
    {
        let store = self.services.store();
        let name = match name {
            Some(name) => name.to_string(),
            None => store
                .default_connection()
                .ok_or_else(|| MigrationError::configuration("No default database connection configured"))?,
        };

        let template = DatabaseTemplate::from_connection(store.as_ref(), &name, resolver)?;
        debug!(connection = %name, "Shared tenant database template configured");
        self.state.lock().database = Some(template);
        Ok(())
    }

    /// The shared tenant template, if one was set up.
    pub fn database_template(&self) -> Option<DatabaseTemplate> {
        self.state.lock().database.clone()
    }

    /// Get the factory for a driver, building it on first use.
    ///
    /// `None` selects the default driver.
    pub fn driver(&self, name: Option<&str>) -> MigrateResult<Arc<Factory>> {
        let mut state = self.state.lock();
        let name = match name {
            Some(name) => name.to_string(),
            None => state
                .default_driver
                .clone()
                .ok_or_else(MigrationError::default_driver_missing)?,
        };

        if let Some(factory) = state.factories.get(&name) {
            return Ok(factory.clone());
        }

        let config = state
            .pending
            .get(&name)
            .cloned()
            .ok_or_else(|| MigrationError::driver_not_supported(&name))?;
        let driver = self.build_driver(&name, config, &state)?;

        state.pending.shift_remove(&name);
        let factory = Arc::new(Factory::new(driver, self.services.clone()));
        state.factories.insert(name.clone(), factory.clone());

        debug!(driver = %name, "Created migration factory");
        Ok(factory)
    }

    fn build_driver(&self, name: &str, config: DriverConfig, state: &ManagerState) -> MigrateResult<Driver> {
        let model = config.model.ok_or_else(|| {
            MigrationError::configuration(format!("Driver [{}] has no model", name))
        })?;
        let entities = self.models.read().get(&model).ok_or_else(|| {
            MigrationError::configuration(format!("Model [{}] for driver [{}] is not registered", model, name))
        })?;

        let template = config.template.or_else(|| state.database.clone());
        let connection_name = match (config.connection_name, &template) {
            (Some(pattern), _) => Some(pattern),
            (None, Some(_)) => Some(DEFAULT_CONNECTION_NAME.to_string()),
            (None, None) => None,
        };

        Ok(Driver {
            name: name.to_string(),
            model,
            entities,
            path: config.path.unwrap_or_else(|| state.path.clone()),
            connection_name,
            prefix: config.prefix.unwrap_or_else(|| DEFAULT_PREFIX.to_string()),
            template,
            chunk: config.chunk.unwrap_or(state.chunk).max(1),
        })
    }

    /// Set the driver used when none is named.
    pub fn set_default_driver(&self, name: impl Into<String>) {
        self.state.lock().default_driver = Some(name.into());
    }

    /// The driver used when none is named.
    pub fn default_driver(&self) -> Option<String> {
        self.state.lock().default_driver.clone()
    }

    /// Names of all known drivers, registered or built.
    pub fn drivers(&self) -> Vec<String> {
        let state = self.state.lock();
        let mut names: Vec<String> = state.factories.keys().cloned().collect();
        names.extend(state.pending.keys().cloned());
        names
    }

    /// Registrations not yet turned into factories.
    pub fn pending_drivers(&self) -> Vec<String> {
        self.state.lock().pending.keys().cloned().collect()
    }

    /// Default page size.
    pub fn chunk_size(&self) -> usize {
        self.state.lock().chunk
    }

    /// Set the default page size.
    pub fn set_chunk_size(&self, chunk: usize) {
        self.state.lock().chunk = chunk.max(1);
    }

    /// Default migration directory.
    pub fn path(&self) -> PathBuf {
        self.state.lock().path.clone()
    }

    /// Set the default migration directory.
    pub fn set_path(&self, path: impl AsRef<Path>) {
        self.state.lock().path = path.as_ref().to_path_buf();
    }
}
