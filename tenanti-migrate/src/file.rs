//! Migrations and the loaders that find them.
//!
//! Two loaders are provided:
//!
//! - [`MigrationFileManager`] reads SQL migrations from a directory where each
//!   migration is a sub-directory holding `up.sql` and an optional `down.sql`:
//!
//! ```text
//! database/tenant/users/
//! ├── 2024_01_01_000000_create_posts/
//! │   ├── up.sql
//! │   └── down.sql
//! └── 2024_02_10_120000_add_post_slug/
//!     └── up.sql
//! ```
//!
//! - [`MigrationSet`] holds migrations implemented in Rust, registered under
//!   the same directory keys a driver is configured with.
//!
//! SQL files may use `{id}`, `{prefix}` and `{driver}` as placeholders; they
//! are filled in per tenant before execution. Tenant attributes are never
//! pasted into SQL.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::warn;

use crate::connection::DatabaseConnection;
use crate::entity::{HasTenantConnection, TenantId, replace_tokens};
use crate::error::{MigrateResult, MigrationError};

/// Direction of a migration step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Apply the migration.
    Up,
    /// Reverse the migration.
    Down,
}

impl Direction {
    /// Lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Up => "up",
            Self::Down => "down",
        }
    }
}

/// Everything a migration body gets to see.
pub struct MigrationContext<'a> {
    /// Tenant identity.
    pub identity: &'a TenantId,
    /// The bound tenant entity.
    pub entity: &'a dyn HasTenantConnection,
    /// Connection to run statements on.
    pub connection: &'a dyn DatabaseConnection,
    /// Resolved table prefix for this tenant.
    pub prefix: &'a str,
    /// Name of the driver running the migration.
    pub driver: &'a str,
}

impl MigrationContext<'_> {
    /// Fill `{id}`, `{prefix}` and `{driver}` into a statement.
    ///
    /// Other placeholders are left as written.
    pub fn render(&self, sql: &str) -> String {
        let id = self.identity.to_string();
        replace_tokens(sql, &[("id", &id), ("prefix", self.prefix), ("driver", self.driver)])
    }

    /// Render and execute a statement.
    pub async fn execute(&self, sql: &str) -> MigrateResult<u64> {
        self.connection.execute(&self.render(sql)).await
    }
}

/// A single migration.
#[async_trait]
pub trait Migration: Send + Sync {
    /// Connection this migration insists on, overriding the tenant's.
    fn connection(&self) -> Option<&str> {
        None
    }

    /// Apply the migration.
    async fn up(&self, cx: &MigrationContext<'_>) -> MigrateResult<()>;

    /// Reverse the migration.
    async fn down(&self, cx: &MigrationContext<'_>) -> MigrateResult<()>;
}

/// Finds migrations for a driver's migration path.
#[async_trait]
pub trait MigrationLoader: Send + Sync {
    /// Migration names under `path`, in ascending order.
    async fn list(&self, path: &Path) -> MigrateResult<Vec<String>>;

    /// Load one migration by name.
    async fn resolve(&self, path: &Path, name: &str) -> MigrateResult<Arc<dyn Migration>>;
}

/// A migration backed by SQL scripts.
#[derive(Debug, Clone)]
pub struct SqlMigration {
    /// Migration name.
    pub name: String,
    /// Up SQL content.
    pub up_sql: String,
    /// Down SQL content, empty when irreversible.
    pub down_sql: String,
}

impl SqlMigration {
    /// Create a new SQL migration.
    pub fn new(name: impl Into<String>, up_sql: impl Into<String>, down_sql: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            up_sql: up_sql.into(),
            down_sql: down_sql.into(),
        }
    }

    /// Check if this migration can be rolled back.
    pub fn is_reversible(&self) -> bool {
        !self.down_sql.trim().is_empty()
    }

    async fn run_script(&self, script: &str, cx: &MigrationContext<'_>) -> MigrateResult<()> {
        for statement in split_statements(script) {
            cx.execute(&statement).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Migration for SqlMigration {
    async fn up(&self, cx: &MigrationContext<'_>) -> MigrateResult<()> {
        self.run_script(&self.up_sql, cx).await
    }

    async fn down(&self, cx: &MigrationContext<'_>) -> MigrateResult<()> {
        if !self.is_reversible() {
            return Err(MigrationError::InvalidMigration(format!(
                "Migration '{}' has no down migration",
                self.name
            )));
        }
        self.run_script(&self.down_sql, cx).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Lexeme {
    Code,
    Quoted(char),
    LineComment,
    BlockComment,
}

/// Split a script into statements on `;`.
///
/// Semicolons inside quotes are kept. `--` and `/* */` comments are dropped,
/// so quotes inside them do not affect splitting.
pub fn split_statements(script: &str) -> Vec<String> {
    let mut statements = Vec::new();
    let mut current = String::new();
    let mut state = Lexeme::Code;
    let mut chars = script.chars().peekable();

    while let Some(ch) = chars.next() {
        match state {
            Lexeme::Quoted(quote) => {
                current.push(ch);
                if ch == quote {
                    state = Lexeme::Code;
                }
            }
            Lexeme::LineComment => {
                if ch == '\n' {
                    current.push(ch);
                    state = Lexeme::Code;
                }
            }
            Lexeme::BlockComment => {
                if ch == '*' && chars.peek() == Some(&'/') {
                    chars.next();
                    current.push(' ');
                    state = Lexeme::Code;
                }
            }
            Lexeme::Code => match ch {
                '\'' | '"' | '`' => {
                    state = Lexeme::Quoted(ch);
                    current.push(ch);
                }
                '-' if chars.peek() == Some(&'-') => {
                    chars.next();
                    state = Lexeme::LineComment;
                }
                '/' if chars.peek() == Some(&'*') => {
                    chars.next();
                    state = Lexeme::BlockComment;
                }
                ';' => {
                    push_statement(&mut statements, &current);
                    current.clear();
                }
                _ => current.push(ch),
            },
        }
    }

    push_statement(&mut statements, &current);
    statements
}

fn push_statement(statements: &mut Vec<String>, current: &str) {
    let statement = current.trim();
    if !statement.is_empty() {
        statements.push(statement.to_string());
    }
}

/// Migration file reader.
#[derive(Debug, Default)]
pub struct MigrationFileManager;

impl MigrationFileManager {
    /// Create a new file manager.
    pub fn new() -> Self {
        Self
    }

    async fn read_migration(&self, dir: &Path, name: &str) -> MigrateResult<SqlMigration> {
        let path = dir.join(name);
        let up_path = path.join("up.sql");
        let down_path = path.join("down.sql");

        if !up_path.exists() {
            return Err(MigrationError::NotFound(name.to_string()));
        }

        let up_sql = tokio::fs::read_to_string(&up_path)
            .await
            .map_err(MigrationError::Io)?;

        let down_sql = if down_path.exists() {
            tokio::fs::read_to_string(&down_path)
                .await
                .map_err(MigrationError::Io)?
        } else {
            String::new()
        };

        Ok(SqlMigration::new(name, up_sql, down_sql))
    }
}

#[async_trait]
impl MigrationLoader for MigrationFileManager {
    async fn list(&self, path: &Path) -> MigrateResult<Vec<String>> {
        let mut names = Vec::new();

        if !path.exists() {
            return Ok(names);
        }

        let mut entries = tokio::fs::read_dir(path).await.map_err(MigrationError::Io)?;
        while let Some(entry) = entries.next_entry().await.map_err(MigrationError::Io)? {
            let entry_path = entry.path();
            if !entry_path.is_dir() || !entry_path.join("up.sql").exists() {
                continue;
            }

            let Some(name) = entry_path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };

            if is_migration_name(name) {
                names.push(name.to_string());
            } else {
                warn!(path = %entry_path.display(), "Skipping migration without a timestamp prefix");
            }
        }

        // Timestamp prefixes make lexical order chronological.
        names.sort();
        Ok(names)
    }

    async fn resolve(&self, path: &Path, name: &str) -> MigrateResult<Arc<dyn Migration>> {
        let migration = self.read_migration(path, name).await?;
        Ok(Arc::new(migration))
    }
}

/// Check a migration name starts with a numeric timestamp followed by `_`.
fn is_migration_name(name: &str) -> bool {
    match name.split_once('_') {
        Some((stamp, rest)) => {
            !stamp.is_empty() && stamp.chars().all(|c| c.is_ascii_digit()) && !rest.is_empty()
        }
        None => false,
    }
}

/// Migrations implemented in code, keyed by migration path.
#[derive(Default)]
pub struct MigrationSet {
    migrations: RwLock<HashMap<PathBuf, BTreeMap<String, Arc<dyn Migration>>>>,
}

impl MigrationSet {
    /// Create an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a migration, builder style.
    pub fn with(self, path: impl Into<PathBuf>, name: impl Into<String>, migration: impl Migration + 'static) -> Self {
        self.add(path, name, migration);
        self
    }

    /// Register a migration.
    pub fn add(&self, path: impl Into<PathBuf>, name: impl Into<String>, migration: impl Migration + 'static) {
        self.migrations
            .write()
            .entry(path.into())
            .or_default()
            .insert(name.into(), Arc::new(migration));
    }

    /// Number of migrations registered under `path`.
    pub fn len_for(&self, path: &Path) -> usize {
        self.migrations.read().get(path).map_or(0, BTreeMap::len)
    }
}

#[async_trait]
impl MigrationLoader for MigrationSet {
    async fn list(&self, path: &Path) -> MigrateResult<Vec<String>> {
        Ok(self
            .migrations
            .read()
            .get(path)
            .map(|set| set.keys().cloned().collect())
            .unwrap_or_default())
    }

    async fn resolve(&self, path: &Path, name: &str) -> MigrateResult<Arc<dyn Migration>> {
        self.migrations
            .read()
            .get(path)
            .and_then(|set| set.get(name).cloned())
            .ok_or_else(|| MigrationError::NotFound(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_split_statements() {
        let script = "CREATE TABLE a (x TEXT DEFAULT ';');\n\nINSERT INTO a VALUES ('b;c');\nSELECT 1";
        assert_eq!(
            split_statements(script),
            vec![
                "CREATE TABLE a (x TEXT DEFAULT ';')".to_string(),
                "INSERT INTO a VALUES ('b;c')".to_string(),
                "SELECT 1".to_string(),
            ]
        );
    }

    #[test]
    fn test_split_statements_skips_comments() {
        let script = "-- don't forget the index\nCREATE TABLE a (id INT);\n/* b's table; */ CREATE TABLE b (id INT);";
        assert_eq!(
            split_statements(script),
            vec!["CREATE TABLE a (id INT)".to_string(), "CREATE TABLE b (id INT)".to_string()]
        );
    }

    #[test]
    fn test_split_statements_keeps_dashes_in_quotes() {
        assert_eq!(
            split_statements("INSERT INTO a VALUES ('--x'); SELECT 1 -- trailing"),
            vec!["INSERT INTO a VALUES ('--x')".to_string(), "SELECT 1".to_string()]
        );
    }

    #[test]
    fn test_split_statements_empty() {
        assert!(split_statements("  ;\n ; ").is_empty());
    }

    #[tokio::test]
    async fn test_render_ignores_tenant_attributes() {
        use crate::entity::Tenant;
        use crate::memory::RecordingConnection;

        let tenant = Tenant::new("users", 5).with_attribute("name", "x'); DROP TABLE users; --");
        let connection = RecordingConnection::new("tenant_5");
        let identity = tenant.identity();
        let cx = MigrationContext {
            identity: &identity,
            entity: &tenant,
            connection: &connection,
            prefix: "user_5",
            driver: "user",
        };

        assert_eq!(
            cx.render("INSERT INTO {prefix}_log VALUES ({id}, '{driver}', '{name}')"),
            "INSERT INTO user_5_log VALUES (5, 'user', '{name}')"
        );
        cx.execute("SELECT {id}").await.unwrap();
        assert_eq!(connection.executed(), vec!["SELECT 5".to_string()]);
    }

    #[test]
    fn test_is_migration_name() {
        assert!(is_migration_name("2024_01_01_000000_create_posts"));
        assert!(is_migration_name("20231215120000_create_users"));
        assert!(!is_migration_name("create_users"));
        assert!(!is_migration_name("2024"));
    }

    #[test]
    fn test_sql_migration_reversible() {
        assert!(SqlMigration::new("m", "CREATE TABLE x ()", "DROP TABLE x").is_reversible());
        assert!(!SqlMigration::new("m", "CREATE TABLE x ()", "  ").is_reversible());
    }

    #[tokio::test]
    async fn test_file_manager_lists_in_order() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["2024_02_01_000000_add_slug", "2024_01_01_000000_create_posts"] {
            let migration_dir = dir.path().join(name);
            std::fs::create_dir_all(&migration_dir).unwrap();
            std::fs::write(migration_dir.join("up.sql"), "SELECT 1;").unwrap();
        }
        std::fs::create_dir_all(dir.path().join("notes")).unwrap();
        std::fs::create_dir_all(dir.path().join("2024_03_01_000000_empty")).unwrap();

        let names = MigrationFileManager::new().list(dir.path()).await.unwrap();
        assert_eq!(
            names,
            vec![
                "2024_01_01_000000_create_posts".to_string(),
                "2024_02_01_000000_add_slug".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_file_manager_missing_dir_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let names = MigrationFileManager::new()
            .list(&dir.path().join("missing"))
            .await
            .unwrap();
        assert!(names.is_empty());
    }

    #[tokio::test]
    async fn test_file_manager_resolve_missing() {
        let dir = tempfile::tempdir().unwrap();
        let result = MigrationFileManager::new().resolve(dir.path(), "2024_nope").await;
        assert!(matches!(result, Err(MigrationError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_migration_set_orders_by_name() {
        let set = MigrationSet::new()
            .with("/m", "2024_02_01_000000_b", SqlMigration::new("b", "SELECT 2", ""))
            .with("/m", "2024_01_01_000000_a", SqlMigration::new("a", "SELECT 1", ""));

        let names = set.list(Path::new("/m")).await.unwrap();
        assert_eq!(names, vec!["2024_01_01_000000_a".to_string(), "2024_02_01_000000_b".to_string()]);
        assert_eq!(set.len_for(Path::new("/m")), 2);
        assert!(set.list(Path::new("/other")).await.unwrap().is_empty());
        assert!(set.resolve(Path::new("/m"), "missing").await.is_err());
    }
}
