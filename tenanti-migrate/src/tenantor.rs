//! Models scoped to a tenant.
//!
//! A [`Tenantor`] names the tenant that owns some data: the driver, the
//! tenant key and the connection the tenant lives on. A [`Tenantee`] is a
//! model whose rows live on that connection, usually in a per-tenant table
//! such as `user_5_posts`.
//!
//! ```rust,ignore
//! let mut migrator = manager.driver(Some("user"))?.migrator(Box::new(tenant))?;
//! let tenantor = migrator.tenantor().expect("bound");
//!
//! let posts = TenantModel::new("{driver}_{id}_posts").scoped(tenantor)?;
//! assert_eq!(posts.table(), "user_5_posts");
//! assert_eq!(posts.connection(), Some("tenant_5"));
//! ```

use serde::{Deserialize, Serialize};

use crate::entity::{HasTenantConnection, TenantId, replace_tokens};
use crate::error::{MigrateResult, MigrationError};

/// The tenant a model is scoped to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tenantor {
    driver: String,
    key: TenantId,
    #[serde(default)]
    connection: Option<String>,
}

impl Tenantor {
    /// Create a tenantor.
    pub fn new(driver: impl Into<String>, key: impl Into<TenantId>, connection: Option<String>) -> Self {
        Self {
            driver: driver.into(),
            key: key.into(),
            connection,
        }
    }

    /// Tenantor for an entity, using the connection the entity points at.
    pub fn from_entity(driver: impl Into<String>, entity: &dyn HasTenantConnection) -> Self {
        Self::new(driver, entity.identity(), entity.connection().map(str::to_string))
    }

    /// Driver name.
    pub fn driver(&self) -> &str {
        &self.driver
    }

    /// Tenant key.
    pub fn key(&self) -> &TenantId {
        &self.key
    }

    /// Connection the tenant's data lives on.
    pub fn connection_name(&self) -> Option<&str> {
        self.connection.as_deref()
    }
}

/// A model whose data belongs to a single tenant.
pub trait Tenantee {
    /// Table name for the current tenantor.
    fn tenant_table(&self) -> MigrateResult<String>;

    /// The tenantor the model is scoped to.
    fn tenantor(&self) -> Option<&Tenantor>;

    /// Store the tenantor.
    fn attach_tenantor(&mut self, tenantor: Tenantor);

    /// Point the model at a connection.
    fn set_connection(&mut self, connection: Option<String>);

    /// Set the table the model reads and writes.
    fn set_table(&mut self, table: String);

    /// Scope the model to `tenantor`: take over its connection and switch to
    /// the tenant table.
    fn set_tenantor(&mut self, tenantor: Tenantor) -> MigrateResult<&mut Self>
    where
        Self: Sized,
    {
        let connection = tenantor.connection_name().map(str::to_string);
        self.attach_tenantor(tenantor);
        self.set_connection(connection);

        let table = self.tenant_table()?;
        self.set_table(table);
        Ok(self)
    }

    /// A fresh model scoped to `tenantor`.
    fn tenant(tenantor: Tenantor) -> MigrateResult<Self>
    where
        Self: Default + Sized,
    {
        let mut model = Self::default();
        model.set_tenantor(tenantor)?;
        Ok(model)
    }
}

/// A [`Tenantee`] whose tenant table comes from a pattern.
///
/// The pattern may use `{driver}` and `{id}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantModel {
    pattern: String,
    table: String,
    connection: Option<String>,
    tenantor: Option<Tenantor>,
}

impl TenantModel {
    /// Create an unscoped model. Its table is the pattern itself.
    pub fn new(pattern: impl Into<String>) -> Self {
        let pattern = pattern.into();
        Self {
            table: pattern.clone(),
            pattern,
            connection: None,
            tenantor: None,
        }
    }

    /// Scope the model to `tenantor`, builder style.
    pub fn scoped(mut self, tenantor: Tenantor) -> MigrateResult<Self> {
        self.set_tenantor(tenantor)?;
        Ok(self)
    }

    /// Current table.
    pub fn table(&self) -> &str {
        &self.table
    }

    /// Current connection.
    pub fn connection(&self) -> Option<&str> {
        self.connection.as_deref()
    }
}

impl Tenantee for TenantModel {
    fn tenant_table(&self) -> MigrateResult<String> {
        let tenantor = self.tenantor.as_ref().ok_or_else(|| {
            MigrationError::configuration(format!("Model [{}] is not scoped to a tenant", self.pattern))
        })?;
        let key = tenantor.key().to_string();
        Ok(replace_tokens(
            &self.pattern,
            &[("driver", tenantor.driver()), ("id", &key)],
        ))
    }

    fn tenantor(&self) -> Option<&Tenantor> {
        self.tenantor.as_ref()
    }

    fn attach_tenantor(&mut self, tenantor: Tenantor) {
        self.tenantor = Some(tenantor);
    }

    fn set_connection(&mut self, connection: Option<String>) {
        self.connection = connection;
    }

    fn set_table(&mut self, table: String) {
        self.table = table;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::Tenant;
    use pretty_assertions::assert_eq;

    #[derive(Debug, Default)]
    struct Post {
        table: String,
        connection: Option<String>,
        tenantor: Option<Tenantor>,
    }

    impl Tenantee for Post {
        fn tenant_table(&self) -> MigrateResult<String> {
            match &self.tenantor {
                Some(tenantor) => Ok(format!("{}_{}_posts", tenantor.driver(), tenantor.key())),
                None => Err(MigrationError::configuration("Post has no tenantor")),
            }
        }

        fn tenantor(&self) -> Option<&Tenantor> {
            self.tenantor.as_ref()
        }

        fn attach_tenantor(&mut self, tenantor: Tenantor) {
            self.tenantor = Some(tenantor);
        }

        fn set_connection(&mut self, connection: Option<String>) {
            self.connection = connection;
        }

        fn set_table(&mut self, table: String) {
            self.table = table;
        }
    }

    #[test]
    fn test_tenant_scopes_connection_and_table() {
        let tenantor = Tenantor::new("user", 5, Some("tenant_5".into()));
        let post = Post::tenant(tenantor.clone()).unwrap();

        assert_eq!(post.connection.as_deref(), Some("tenant_5"));
        assert_eq!(post.table, "user_5_posts");
        assert_eq!(post.tenantor(), Some(&tenantor));
    }

    #[test]
    fn test_set_tenantor_rescopes_model() {
        let mut post = Post::tenant(Tenantor::new("user", 5, Some("tenant_5".into()))).unwrap();
        post.set_tenantor(Tenantor::new("team", 2, None)).unwrap();

        assert_eq!(post.connection, None);
        assert_eq!(post.table, "team_2_posts");
    }

    #[test]
    fn test_tenantor_from_bound_entity() {
        let tenant = Tenant::new("users", 9).with_connection("tenant_9");
        let tenantor = Tenantor::from_entity("user", &tenant);

        assert_eq!(tenantor.driver(), "user");
        assert_eq!(tenantor.key(), &TenantId::from(9));
        assert_eq!(tenantor.connection_name(), Some("tenant_9"));
    }

    #[test]
    fn test_tenant_model_pattern() {
        let model = TenantModel::new("{driver}_{id}_posts");
        assert_eq!(model.table(), "{driver}_{id}_posts");
        assert!(model.tenant_table().unwrap_err().is_configuration());

        let model = model.scoped(Tenantor::new("user", 5, Some("tenant_5".into()))).unwrap();
        assert_eq!(model.table(), "user_5_posts");
        assert_eq!(model.connection(), Some("tenant_5"));
    }
}
