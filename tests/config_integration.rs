//! Integration tests for `tenanti.toml` loading.
//!
//! These tests verify that a configuration file is enough to build the
//! connection store and the driver registry.

use std::sync::Arc;

use tenanti::prelude::*;

const CONFIG: &str = r#"
    [database]
    default = "mysql"

    [database.connections.mysql]
    driver = "mysql"
    database = "app"

    [database.connections.tenant]
    driver = "mysql"
    database = "tenants_{id}"

    [tenanti]
    chunk = 2
    path = "database/tenant"
    default_driver = "user"

    [tenanti.drivers.user]
    model = "User"
    path = "database/tenant/users"
    connection_name = "tenant_{id}"
    template = "tenant"

    [tenanti.drivers.team]
    model = "Team"
    prefix = "team_{id}"
"#;

fn manager(config: &TenantiConfig) -> TenantiManager {
    let services = Services::new(
        Arc::new(ConnectionRegistry::from_config(config)),
        Arc::new(tenanti::memory::MemoryLedger::new()),
        Arc::new(MigrationFileManager::new()),
        Arc::new(tenanti::memory::MemoryDatabase::new()),
    );
    let models = ModelRegistry::new()
        .with("User", Arc::new(tenanti::memory::MemoryEntities::new("users")))
        .with("Team", Arc::new(tenanti::memory::MemoryEntities::new("teams")));
    TenantiManager::from_config(config, services, models).expect("Failed to configure manager")
}

/// Test loading a configuration file from disk
#[test]
fn test_config_from_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("tenanti.toml");
    std::fs::write(&path, CONFIG).unwrap();

    let config = TenantiConfig::from_file(&path).expect("Failed to load config");

    assert_eq!(config.database.default.as_deref(), Some("mysql"));
    assert_eq!(config.database.connections.len(), 2);
    assert_eq!(config.tenanti.drivers.len(), 2);
}

/// Test a missing file is an I/O error
#[test]
fn test_config_missing_file() {
    let dir = tempfile::tempdir().unwrap();
    let err = TenantiConfig::from_file(dir.path().join("missing.toml")).unwrap_err();
    assert!(matches!(err, MigrationError::Io(_)));
}

/// Test the connection store is seeded from `[database]`
#[test]
fn test_registry_from_config() {
    let config = TenantiConfig::from_str(CONFIG).unwrap();
    let registry = ConnectionRegistry::from_config(&config);

    assert_eq!(registry.default_connection().as_deref(), Some("mysql"));
    assert_eq!(registry.names(), vec!["mysql".to_string(), "tenant".to_string()]);
}

/// Test every configured driver becomes available
#[test]
fn test_manager_from_config() {
    let config = TenantiConfig::from_str(CONFIG).unwrap();
    let manager = manager(&config);

    assert_eq!(manager.drivers(), vec!["user".to_string(), "team".to_string()]);
    assert_eq!(manager.chunk_size(), 2);

    let user = manager.driver(None).unwrap();
    assert_eq!(user.name(), "user");
    assert!(user.driver().template.is_some());

    let team = manager.driver(Some("team")).unwrap();
    assert_eq!(team.driver().path, std::path::PathBuf::from("database/tenant"));
    assert_eq!(team.driver().prefix, "team_{id}");
    assert_eq!(team.driver().connection_name, None);
}

/// Test a configured template materializes a tenant connection
#[test]
fn test_configured_template_materializes_connection() {
    let config = TenantiConfig::from_str(CONFIG).unwrap();
    let manager = manager(&config);

    let migrator = manager
        .driver(Some("user"))
        .unwrap()
        .migrator(Box::new(Tenant::new("users", 5)))
        .unwrap();

    let store = manager.services().store();
    let tenant = store.get("tenant_5").expect("tenant connection registered");
    assert_eq!(migrator.connection_name(), Some("tenant_5"));
    assert_eq!(tenant.get_str("database"), Some("tenants_5"));
    assert_eq!(tenant.get_str("driver"), Some("mysql"));
    assert_eq!(store.default_connection().as_deref(), Some("tenant_5"));
}

/// Test drivers without a connection pattern keep the default connection
#[test]
fn test_driver_without_pattern_uses_default_connection() {
    let config = TenantiConfig::from_str(CONFIG).unwrap();
    let manager = manager(&config);

    let migrator = manager
        .driver(Some("team"))
        .unwrap()
        .migrator(Box::new(Tenant::new("teams", 3)))
        .unwrap();

    assert_eq!(migrator.connection_name(), Some("mysql"));
    assert_eq!(migrator.table_prefix(), Some("team_3"));
}

/// Test invalid configuration is rejected up front
#[test]
fn test_config_errors() {
    let err = TenantiConfig::from_str("[tenanti.drivers.user]\nmodel = \"User\"\ntemplate = \"foo\"\n").unwrap_err();
    assert!(err.to_string().contains("Database connection [foo] is not available"));

    let err = TenantiConfig::from_str("[tenanti]\nunknown = true\n").unwrap_err();
    assert!(err.is_configuration());
}
