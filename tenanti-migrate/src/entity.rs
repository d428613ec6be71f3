//! Tenant entities and the resolver used to look them up.
//!
//! A tenant is any persisted record that owns its own schema: a user, an
//! organisation, a team. The engine never loads entities itself; it talks to
//! an [`EntityResolver`] and works with anything implementing
//! [`HasTenantConnection`].

use std::fmt;
use std::sync::LazyLock;

use async_trait::async_trait;
use regex_lite::{Captures, Regex};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{MigrateResult, MigrationError};

/// Raw attribute projection of an entity.
pub type Attributes = serde_json::Map<String, Value>;

/// A boxed tenant entity.
pub type BoxedEntity = Box<dyn HasTenantConnection>;

/// The identity (primary key) of a tenant entity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantId(String);

impl TenantId {
    /// Create a new tenant ID.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the tenant ID as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Convert to the inner string.
    pub fn into_inner(self) -> String {
        self.0
    }

    /// Read an identity out of a JSON value, accepting strings and integers.
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::String(s) if !s.is_empty() => Some(Self::new(s.clone())),
            Value::Number(n) => Some(Self::new(n.to_string())),
            _ => None,
        }
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for TenantId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for TenantId {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

impl From<i64> for TenantId {
    fn from(i: i64) -> Self {
        Self::new(i.to_string())
    }
}

impl From<i32> for TenantId {
    fn from(i: i32) -> Self {
        Self::new(i.to_string())
    }
}

impl From<u64> for TenantId {
    fn from(i: u64) -> Self {
        Self::new(i.to_string())
    }
}

/// Capability an entity type implements to take part in tenant migrations.
///
/// The connection slot is written when the entity is bound to a migrator, so
/// that later queries through the entity go to the tenant's own database.
pub trait HasTenantConnection: Send + Sync + fmt::Debug {
    /// Primary key of the entity.
    fn identity(&self) -> TenantId;

    /// Table (or collection) the entity is stored in.
    fn table(&self) -> &str;

    /// Raw attribute projection, used to fill connection-name placeholders.
    fn attributes(&self) -> Attributes;

    /// Name of the connection this entity currently uses.
    fn connection(&self) -> Option<&str>;

    /// Point the entity at another connection.
    fn set_connection(&mut self, name: Option<String>);

    /// Prefer the write connection for subsequent reads.
    fn use_write_connection(&mut self);

    /// Whether reads are pinned to the write connection.
    fn prefers_write_connection(&self) -> bool;
}

/// A plain tenant record.
///
/// Suitable for entity resolvers that do not map tenants onto richer types.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tenant {
    table: String,
    attributes: Attributes,
    #[serde(default)]
    connection: Option<String>,
    #[serde(default)]
    write_connection: bool,
}

impl Tenant {
    /// Create a tenant with only an identity.
    pub fn new(table: impl Into<String>, id: impl Into<TenantId>) -> Self {
        let mut attributes = Attributes::new();
        attributes.insert("id".to_string(), Value::String(id.into().into_inner()));
        Self {
            table: table.into(),
            attributes,
            connection: None,
            write_connection: false,
        }
    }

    /// Build a tenant from a raw attribute map. The map must carry an `id`.
    pub fn from_attributes(table: impl Into<String>, attributes: Attributes) -> MigrateResult<Self> {
        let table = table.into();
        match attributes.get("id").and_then(TenantId::from_value) {
            Some(_) => Ok(Self {
                table,
                attributes,
                connection: None,
                write_connection: false,
            }),
            None => Err(MigrationError::other(format!(
                "Tenant attributes for [{}] have no usable `id`",
                table
            ))),
        }
    }

    /// Add an attribute.
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    /// Set the initial connection.
    pub fn with_connection(mut self, name: impl Into<String>) -> Self {
        self.connection = Some(name.into());
        self
    }
}

impl HasTenantConnection for Tenant {
    fn identity(&self) -> TenantId {
        self.attributes
            .get("id")
            .and_then(TenantId::from_value)
            .unwrap_or_else(|| TenantId::new(""))
    }

    fn table(&self) -> &str {
        &self.table
    }

    fn attributes(&self) -> Attributes {
        self.attributes.clone()
    }

    fn connection(&self) -> Option<&str> {
        self.connection.as_deref()
    }

    fn set_connection(&mut self, name: Option<String>) {
        self.connection = name;
    }

    fn use_write_connection(&mut self) {
        self.write_connection = true;
    }

    fn prefers_write_connection(&self) -> bool {
        self.write_connection
    }
}

/// Raw tenant data carried by provisioning jobs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantPayload(Attributes);

impl TenantPayload {
    /// Wrap an attribute map.
    pub fn new(attributes: Attributes) -> Self {
        Self(attributes)
    }

    /// Payload naming a tenant by identity only.
    pub fn for_id(id: impl Into<TenantId>) -> Self {
        let mut attributes = Attributes::new();
        attributes.insert("id".to_string(), Value::String(id.into().into_inner()));
        Self(attributes)
    }

    /// Snapshot an entity into a payload.
    pub fn from_entity(entity: &dyn HasTenantConnection) -> Self {
        Self(entity.attributes())
    }

    /// The identity the payload refers to, if it carries one.
    pub fn key(&self) -> Option<TenantId> {
        self.0.get("id").and_then(TenantId::from_value)
    }

    /// Get an attribute.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// Borrow the raw attributes.
    pub fn attributes(&self) -> &Attributes {
        &self.0
    }

    /// Convert into the raw attributes.
    pub fn into_attributes(self) -> Attributes {
        self.0
    }
}

/// Lookup and creation of tenant entities (the persistence layer).
#[async_trait]
pub trait EntityResolver: Send + Sync {
    /// Find the entity a payload refers to. `None` when it is not (yet) visible.
    async fn find(&self, payload: &TenantPayload) -> MigrateResult<Option<BoxedEntity>>;

    /// Persist a new entity.
    async fn create(&self, attributes: Attributes) -> MigrateResult<BoxedEntity>;

    /// Load a page of entities, in a stable order, for bulk operations.
    async fn chunk(&self, offset: usize, limit: usize) -> MigrateResult<Vec<BoxedEntity>>;
}

static PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{([A-Za-z0-9_]+)\}").expect("placeholder pattern is valid"));

/// Replace `{token}` placeholders in `pattern`.
///
/// `{id}` is the entity identity, explicit `extra` pairs come next, then the
/// entity's attributes. Unknown tokens are left untouched.
pub fn interpolate(pattern: &str, entity: &dyn HasTenantConnection, extra: &[(&str, &str)]) -> String {
    let attributes = entity.attributes();
    let identity = entity.identity();

    PLACEHOLDER
        .replace_all(pattern, |caps: &Captures<'_>| {
            let token = &caps[1];
            if token == "id" {
                return identity.to_string();
            }
            if let Some((_, value)) = extra.iter().find(|(key, _)| *key == token) {
                return (*value).to_string();
            }
            match attributes.get(token) {
                Some(Value::String(s)) => s.clone(),
                Some(Value::Null) | None => caps[0].to_string(),
                Some(other) => other.to_string(),
            }
        })
        .into_owned()
}

/// Replace only the listed `{token}` placeholders in `pattern`.
pub fn replace_tokens(pattern: &str, tokens: &[(&str, &str)]) -> String {
    PLACEHOLDER
        .replace_all(pattern, |caps: &Captures<'_>| {
            match tokens.iter().find(|(key, _)| *key == &caps[1]) {
                Some((_, value)) => (*value).to_string(),
                None => caps[0].to_string(),
            }
        })
        .into_owned()
}
