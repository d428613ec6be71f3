//! Configuration file parsing for `tenanti.toml`.
//!
//! ```toml
//! [database]
//! default = "mysql"
//!
//! [database.connections.tenant]
//! database = "tenants_{id}"
//! password = "${TENANT_DB_PASSWORD}"
//!
//! [tenanti]
//! chunk = 100
//! default_driver = "user"
//!
//! [tenanti.drivers.user]
//! model = "User"
//! connection_name = "tenant_{id}"
//! template = "tenant"
//! ```
//!
//! `${VAR}` references are expanded from the environment before parsing.
//! `{token}` placeholders are left for per-tenant interpolation.

use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use indexmap::IndexMap;
use regex_lite::Regex;
use serde::{Deserialize, Serialize};

use crate::connection::ConnectionConfig;
use crate::error::{MigrateResult, MigrationError};

/// Default page size for bulk tenant operations.
pub const DEFAULT_CHUNK: usize = 100;

/// Default root directory for tenant migrations.
pub const DEFAULT_PATH: &str = "database/tenant";

/// Main configuration structure for `tenanti.toml`.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct TenantiConfig {
    /// Global connection table.
    #[serde(default)]
    pub database: DatabaseSettings,

    /// Driver registry settings.
    #[serde(default)]
    pub tenanti: TenantiSettings,
}

/// The `[database]` section.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct DatabaseSettings {
    /// Name of the default connection.
    #[serde(default)]
    pub default: Option<String>,

    /// Named connection configurations.
    #[serde(default)]
    pub connections: IndexMap<String, ConnectionConfig>,
}

/// The `[tenanti]` section.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct TenantiSettings {
    /// Default page size for bulk operations.
    #[serde(default = "default_chunk")]
    pub chunk: usize,

    /// Default migration directory.
    #[serde(default = "default_path")]
    pub path: PathBuf,

    /// Driver used when none is named.
    #[serde(default)]
    pub default_driver: Option<String>,

    /// Driver definitions.
    #[serde(default)]
    pub drivers: IndexMap<String, DriverSettings>,
}

impl Default for TenantiSettings {
    fn default() -> Self {
        Self {
            chunk: DEFAULT_CHUNK,
            path: PathBuf::from(DEFAULT_PATH),
            default_driver: None,
            drivers: IndexMap::new(),
        }
    }
}

/// A `[tenanti.drivers.<name>]` table.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct DriverSettings {
    /// Model name, looked up in the model registry.
    pub model: String,

    /// Migration directory.
    #[serde(default)]
    pub path: Option<PathBuf>,

    /// Connection name pattern, e.g. `tenant_{id}`.
    #[serde(default)]
    pub connection_name: Option<String>,

    /// Table prefix pattern.
    #[serde(default)]
    pub prefix: Option<String>,

    /// Connection used as the tenant template.
    #[serde(default)]
    pub template: Option<String>,

    /// Page size override.
    #[serde(default)]
    pub chunk: Option<usize>,
}

fn default_chunk() -> usize {
    DEFAULT_CHUNK
}

fn default_path() -> PathBuf {
    PathBuf::from(DEFAULT_PATH)
}

impl TenantiConfig {
    /// Load configuration from a file path.
    pub fn from_file(path: impl AsRef<Path>) -> MigrateResult<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_str(&content)
    }

    /// Parse configuration from a TOML string.
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> MigrateResult<Self> {
        let expanded = expand_env_vars(content);
        let config: Self = toml::from_str(&expanded)?;
        config.validate()?;
        Ok(config)
    }

    /// Get a driver definition.
    pub fn driver(&self, name: &str) -> Option<&DriverSettings> {
        self.tenanti.drivers.get(name)
    }

    /// Check cross-references between sections.
    pub fn validate(&self) -> MigrateResult<()> {
        if self.tenanti.chunk == 0 {
            return Err(MigrationError::configuration("tenanti.chunk must be greater than zero"));
        }

        if let Some(default) = &self.tenanti.default_driver {
            if !self.tenanti.drivers.contains_key(default) {
                return Err(MigrationError::driver_not_supported(default));
            }
        }

        for (name, driver) in &self.tenanti.drivers {
            if driver.model.trim().is_empty() {
                return Err(MigrationError::configuration(format!(
                    "Driver [{}] has no model",
                    name
                )));
            }
            if driver.chunk == Some(0) {
                return Err(MigrationError::configuration(format!(
                    "Driver [{}] chunk must be greater than zero",
                    name
                )));
            }
            if let Some(template) = &driver.template {
                if !self.database.connections.contains_key(template) {
                    return Err(MigrationError::connection_unavailable(template));
                }
            }
        }

        Ok(())
    }
}

static ENV_VAR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{([^}]+)\}").expect("env var pattern is valid"));

/// Expand `${VAR}` references; unknown variables are left as written.
fn expand_env_vars(content: &str) -> String {
    let mut result = content.to_string();

    for cap in ENV_VAR.captures_iter(content) {
        if let Ok(value) = std::env::var(&cap[1]) {
            result = result.replace(&cap[0], &value);
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_default_config() {
        let config = TenantiConfig::default();
        assert_eq!(config.tenanti.chunk, 100);
        assert_eq!(config.tenanti.path, PathBuf::from("database/tenant"));
        assert!(config.database.connections.is_empty());
    }

    #[test]
    fn test_parse_full_config() {
        let toml = r#"
            [database]
            default = "mysql"

            [database.connections.mysql]
            database = "app"
            port = 3306

            [database.connections.tenant]
            database = "tenants_{id}"

            [tenanti]
            chunk = 50
            path = "database/tenant"
            default_driver = "user"

            [tenanti.drivers.user]
            model = "User"
            path = "database/tenant/users"
            connection_name = "tenant_{id}"
            template = "tenant"
        "#;

        let config = TenantiConfig::from_str(toml).unwrap();
        assert_eq!(config.database.default.as_deref(), Some("mysql"));
        assert_eq!(
            config.database.connections["tenant"].get_str("database"),
            Some("tenants_{id}")
        );
        assert_eq!(config.tenanti.chunk, 50);

        let user = config.driver("user").unwrap();
        assert_eq!(user.model, "User");
        assert_eq!(user.connection_name.as_deref(), Some("tenant_{id}"));
        assert_eq!(user.template.as_deref(), Some("tenant"));
        assert_eq!(user.prefix, None);
    }

    #[test]
    fn test_unknown_fields_rejected() {
        let err = TenantiConfig::from_str("[tenanti]\nchunks = 5\n").unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn test_missing_template_connection() {
        let toml = r#"
            [tenanti.drivers.user]
            model = "User"
            template = "foo"
        "#;
        let err = TenantiConfig::from_str(toml).unwrap_err();
        assert_eq!(err.to_string(), MigrationError::connection_unavailable("foo").to_string());
    }

    #[test]
    fn test_unknown_default_driver() {
        let err = TenantiConfig::from_str("[tenanti]\ndefault_driver = \"team\"\n").unwrap_err();
        assert!(err.to_string().contains("Driver [team] not supported"));
    }

    #[test]
    fn test_zero_chunk_rejected() {
        assert!(TenantiConfig::from_str("[tenanti]\nchunk = 0\n").is_err());
    }

    #[test]
    fn test_env_var_expansion() {
        // SAFETY: test-local variable name.
        unsafe { std::env::set_var("TENANTI_TEST_DB_HOST", "db.internal") };
        let toml = r#"
            [database.connections.tenant]
            host = "${TENANTI_TEST_DB_HOST}"
            database = "tenants_{id}"
            user = "${TENANTI_TEST_UNSET_VAR}"
        "#;

        let config = TenantiConfig::from_str(toml).unwrap();
        let tenant = &config.database.connections["tenant"];
        assert_eq!(tenant.get_str("host"), Some("db.internal"));
        assert_eq!(tenant.get_str("database"), Some("tenants_{id}"));
        assert_eq!(tenant.get_str("user"), Some("${TENANTI_TEST_UNSET_VAR}"));
    }
}
