//! Database authorization graph: the snapshot taken before a restore and the
//! machinery that replays it afterwards.

pub(crate) mod capture;
pub(crate) mod rank;
pub(crate) mod replay;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::sql::{qualified_name, quote_ident};

pub type PrincipalId = i32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrincipalKind {
    Role,
    ApplicationRole,
    SqlLoginUser,
    WindowsLoginUser,
    CertificateUser,
    Group,
}

impl PrincipalKind {
    /// Maps `sys.database_principals.type`. Kinds the tool does not replay map to `None`.
    pub fn from_type_code(code: &str) -> Option<Self> {
        match code.trim() {
            "R" => Some(PrincipalKind::Role),
            "A" => Some(PrincipalKind::ApplicationRole),
            "S" => Some(PrincipalKind::SqlLoginUser),
            "U" => Some(PrincipalKind::WindowsLoginUser),
            "G" => Some(PrincipalKind::Group),
            "C" => Some(PrincipalKind::CertificateUser),
            _ => None,
        }
    }

    pub fn is_user(self) -> bool {
        !matches!(self, PrincipalKind::Role | PrincipalKind::ApplicationRole)
    }
}

/// `sys.database_principals.authentication_type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Authentication {
    #[default]
    None,
    Instance,
    Database,
    Windows,
}

impl Authentication {
    pub fn from_code(code: Option<i32>) -> Self {
        match code {
            Some(1) => Authentication::Instance,
            Some(2) => Authentication::Database,
            Some(3) => Authentication::Windows,
            _ => Authentication::None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoginKind {
    Sql,
    Windows,
    WindowsGroup,
    Certificate,
    AsymmetricKey,
}

impl LoginKind {
    /// Maps `sys.server_principals.type`.
    pub fn from_type_code(code: &str) -> Option<Self> {
        match code.trim() {
            "S" => Some(LoginKind::Sql),
            "U" => Some(LoginKind::Windows),
            "G" => Some(LoginKind::WindowsGroup),
            "C" => Some(LoginKind::Certificate),
            "K" => Some(LoginKind::AsymmetricKey),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginBinding {
    pub name: String,
    pub kind: LoginKind,
}

/// One authorization entity inside the captured database.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    pub id: PrincipalId,
    /// Hex form of the security identifier, e.g. `0x0105...`.
    pub sid: Option<String>,
    pub name: String,
    pub kind: PrincipalKind,
    pub default_schema: Option<String>,
    /// Owning principal. May point outside the snapshot (e.g. `dbo`).
    pub owner_id: Option<PrincipalId>,
    pub owner_name: Option<String>,
    pub login: Option<LoginBinding>,
    #[serde(default)]
    pub authentication: Authentication,
    /// Certificate a certificate-mapped user is bound to.
    pub certificate: Option<String>,
}

/// "child is a member of parent", restricted to user-defined roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RoleHierarchyEdge {
    pub child_id: PrincipalId,
    pub parent_id: PrincipalId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnedSchema {
    pub principal_id: PrincipalId,
    pub schema_id: i32,
    pub schema_name: String,
}

/// One level of membership; the role may be a fixed role such as `db_datareader`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleMembership {
    pub member_id: PrincipalId,
    pub role_id: PrincipalId,
    pub role_name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PermissionState {
    Grant,
    Deny,
    Revoke,
}

impl PermissionState {
    /// Maps `sys.database_permissions.state`; `W` is a grant with grant option.
    pub fn from_code(code: &str) -> Option<(Self, bool)> {
        match code.trim() {
            "G" => Some((PermissionState::Grant, false)),
            "W" => Some((PermissionState::Grant, true)),
            "D" => Some((PermissionState::Deny, false)),
            "R" => Some((PermissionState::Revoke, false)),
            _ => None,
        }
    }

    pub fn keyword(self) -> &'static str {
        match self {
            PermissionState::Grant => "GRANT",
            PermissionState::Deny => "DENY",
            PermissionState::Revoke => "REVOKE",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrincipalClass {
    User,
    Role,
    ApplicationRole,
}

/// Typed reference to the target of a permission.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "class", rename_all = "snake_case")]
pub enum Securable {
    Database,
    Schema { name: String },
    Object { schema: String, name: String },
    Column { schema: String, object: String, column: String },
    Type { schema: String, name: String },
    XmlSchemaCollection { schema: String, name: String },
    Assembly { name: String },
    Certificate { name: String },
    AsymmetricKey { name: String },
    SymmetricKey { name: String },
    FulltextCatalog { name: String },
    MessageType { name: String },
    Contract { name: String },
    Service { name: String },
    RemoteServiceBinding { name: String },
    Route { name: String },
    DatabasePrincipal { kind: PrincipalClass, name: String },
}

impl Securable {
    /// Builds a securable from a `sys.database_permissions` row whose names were
    /// resolved in the database context. Returns `None` for classes the tool does
    /// not replay or rows whose names could not be resolved.
    pub fn from_catalog(
        class: i32,
        schema: Option<&str>,
        major: Option<&str>,
        minor: Option<&str>,
        principal_type: Option<&str>,
    ) -> Option<Self> {
        let named = |f: fn(String) -> Securable| major.map(|n| f(n.to_string()));
        let scoped = |f: fn(String, String) -> Securable| match (schema, major) {
            (Some(s), Some(n)) => Some(f(s.to_string(), n.to_string())),
            _ => None,
        };
        match class {
            0 => Some(Securable::Database),
            1 => match (schema, major, minor) {
                (Some(s), Some(o), Some(c)) => Some(Securable::Column {
                    schema: s.to_string(),
                    object: o.to_string(),
                    column: c.to_string(),
                }),
                _ => scoped(|schema, name| Securable::Object { schema, name }),
            },
            3 => named(|name| Securable::Schema { name }),
            4 => {
                let kind = match principal_type.map(str::trim) {
                    Some("R") => PrincipalClass::Role,
                    Some("A") => PrincipalClass::ApplicationRole,
                    Some(_) => PrincipalClass::User,
                    None => return None,
                };
                major.map(|n| Securable::DatabasePrincipal {
                    kind,
                    name: n.to_string(),
                })
            }
            5 => named(|name| Securable::Assembly { name }),
            6 => scoped(|schema, name| Securable::Type { schema, name }),
            10 => scoped(|schema, name| Securable::XmlSchemaCollection { schema, name }),
            15 => named(|name| Securable::MessageType { name }),
            16 => named(|name| Securable::Contract { name }),
            17 => named(|name| Securable::Service { name }),
            18 => named(|name| Securable::RemoteServiceBinding { name }),
            19 => named(|name| Securable::Route { name }),
            23 => named(|name| Securable::FulltextCatalog { name }),
            24 => named(|name| Securable::SymmetricKey { name }),
            25 => named(|name| Securable::Certificate { name }),
            26 => named(|name| Securable::AsymmetricKey { name }),
            _ => None,
        }
    }

    /// The ` ON <class>::<name>` clause; empty for database-level permissions.
    pub fn on_clause(&self) -> String {
        let simple = |class: &str, name: &str| format!(" ON {}::{}", class, quote_ident(name));
        match self {
            Securable::Database => String::new(),
            Securable::Schema { name } => simple("SCHEMA", name),
            Securable::Object { schema, name } => {
                format!(" ON OBJECT::{}", qualified_name(schema, name))
            }
            Securable::Column {
                schema,
                object,
                column,
            } => format!(
                " ON OBJECT::{} ({})",
                qualified_name(schema, object),
                quote_ident(column)
            ),
            Securable::Type { schema, name } => format!(" ON TYPE::{}", qualified_name(schema, name)),
            Securable::XmlSchemaCollection { schema, name } => format!(
                " ON XML SCHEMA COLLECTION::{}",
                qualified_name(schema, name)
            ),
            Securable::Assembly { name } => simple("ASSEMBLY", name),
            Securable::Certificate { name } => simple("CERTIFICATE", name),
            Securable::AsymmetricKey { name } => simple("ASYMMETRIC KEY", name),
            Securable::SymmetricKey { name } => simple("SYMMETRIC KEY", name),
            Securable::FulltextCatalog { name } => simple("FULLTEXT CATALOG", name),
            Securable::MessageType { name } => simple("MESSAGE TYPE", name),
            Securable::Contract { name } => simple("CONTRACT", name),
            Securable::Service { name } => simple("SERVICE", name),
            Securable::RemoteServiceBinding { name } => simple("REMOTE SERVICE BINDING", name),
            Securable::Route { name } => simple("ROUTE", name),
            Securable::DatabasePrincipal { kind, name } => match kind {
                PrincipalClass::User => simple("USER", name),
                PrincipalClass::Role => simple("ROLE", name),
                PrincipalClass::ApplicationRole => simple("APPLICATION ROLE", name),
            },
        }
    }

    pub fn principal_name(&self) -> Option<&str> {
        match self {
            Securable::DatabasePrincipal { name, .. } => Some(name),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExplicitGrant {
    pub grantee_id: PrincipalId,
    pub state: PermissionState,
    pub permission: String,
    pub securable: Securable,
    pub with_grant_option: bool,
    /// Grantor name, preserved verbatim. May be absent from the snapshot.
    pub grantor: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtendedProperty {
    pub principal_id: PrincipalId,
    pub name: String,
    pub value: Option<String>,
}

/// Read-only picture of one database's authorization graph.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrincipalSnapshot {
    pub database: String,
    pub principals: Vec<Principal>,
    pub hierarchy: Vec<RoleHierarchyEdge>,
    pub owned_schemas: Vec<OwnedSchema>,
    pub memberships: Vec<RoleMembership>,
    pub grants: Vec<ExplicitGrant>,
    pub properties: Vec<ExtendedProperty>,
}

impl PrincipalSnapshot {
    pub fn principal(&self, id: PrincipalId) -> Option<&Principal> {
        self.principals.iter().find(|p| p.id == id)
    }

    pub fn by_id(&self) -> BTreeMap<PrincipalId, &Principal> {
        self.principals.iter().map(|p| (p.id, p)).collect()
    }
}
