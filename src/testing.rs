//! In-memory SQL Server instance for unit tests.
//!
//! `FakeServer` answers every [`CatalogQuery`] with rows shaped like the real
//! catalog queries and interprets the typed statements of each
//! [`AuditedCommand`], including guards and transactional rollback.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};

use crate::config::{DEFAULT_REMOTE_JOIN_PROCEDURE, RestoreConfig, RestoreOptions};
use crate::errors::{AppError, Result, ServerMessage};
use crate::principals::{PermissionState, PrincipalClass, PrincipalKind, Securable};
use crate::session::{AuditedCommand, CommandType, SqlSession};
use crate::sql::{CatalogQuery, FileGrowth, Guard, GuardedStatement, Statement, UserBinding};

const BUILTIN_USERS: &[(&str, i32)] = &[
    ("dbo", 1),
    ("guest", 2),
    ("INFORMATION_SCHEMA", 3),
    ("sys", 4),
];

const FIXED_ROLES: &[(&str, i32)] = &[
    ("public", 0),
    ("db_owner", 16384),
    ("db_accessadmin", 16385),
    ("db_securityadmin", 16386),
    ("db_ddladmin", 16387),
    ("db_backupoperator", 16389),
    ("db_datareader", 16390),
    ("db_datawriter", 16391),
    ("db_denydatareader", 16392),
    ("db_denydatawriter", 16393),
];

/// Configuration with every option off, for a local instance.
pub fn restore_config(database: &str, backup_file: &str) -> RestoreConfig {
    RestoreConfig {
        server_url: "mssql://sa@localhost".to_string(),
        backup_file: backup_file.to_string(),
        database_name: database.to_string(),
        options: RestoreOptions::default(),
        data_directory: None,
        log_directory: None,
        command_timeout: None,
        replica_call_timeout: None,
        remote_join_procedure: DEFAULT_REMOTE_JOIN_PROCEDURE.to_string(),
        snapshot_output: format!("{}_principals.json", database).into(),
    }
}

fn type_code(kind: PrincipalKind) -> &'static str {
    match kind {
        PrincipalKind::Role => "R",
        PrincipalKind::ApplicationRole => "A",
        PrincipalKind::SqlLoginUser => "S",
        PrincipalKind::WindowsLoginUser => "U",
        PrincipalKind::Group => "G",
        PrincipalKind::CertificateUser => "C",
    }
}

fn server_error(number: u32, text: impl Into<String>) -> AppError {
    AppError::Command {
        status: "exit status: 1".to_string(),
        messages: vec![ServerMessage {
            number,
            level: 16,
            text: text.into(),
        }],
        stderr: String::new(),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FakePrincipal {
    pub id: i32,
    pub kind: PrincipalKind,
    pub default_schema: Option<String>,
    pub owner: Option<String>,
    /// Login the user was created for; it may since have been dropped from the instance.
    pub login: Option<String>,
    pub certificate: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct FakeGrant {
    pub grantee: String,
    pub permission: String,
    pub securable: Securable,
    pub state: PermissionState,
    pub with_grant_option: bool,
    pub grantor: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FakeFile {
    pub logical_name: String,
    pub is_log: bool,
    pub size_bytes: i64,
    /// 8 KB pages, or a percentage when `is_percent_growth`.
    pub growth: i64,
    pub is_percent_growth: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FakeDatabase {
    pub principals: BTreeMap<String, FakePrincipal>,
    /// (role, member)
    pub role_members: BTreeSet<(String, String)>,
    /// schema -> owner
    pub schemas: BTreeMap<String, String>,
    /// (schema, object) -> columns; user-defined types live here too
    pub objects: BTreeMap<(String, String), BTreeSet<String>>,
    pub grants: BTreeSet<FakeGrant>,
    /// (principal, property) -> value
    pub properties: BTreeMap<(String, String), Option<String>>,
    pub certificates: BTreeSet<String>,
    pub files: Vec<FakeFile>,
    pub next_id: i32,
}

impl FakeDatabase {
    pub fn new() -> Self {
        let mut db = FakeDatabase {
            next_id: 5,
            ..Default::default()
        };
        db.schemas.insert("dbo".to_string(), "dbo".to_string());
        db
    }

    fn add_principal(
        &mut self,
        name: &str,
        kind: PrincipalKind,
        default_schema: Option<String>,
        owner: Option<String>,
        login: Option<String>,
        certificate: Option<String>,
    ) {
        let id = self.next_id;
        self.next_id += 1;
        self.principals.insert(
            name.to_string(),
            FakePrincipal {
                id,
                kind,
                default_schema,
                owner,
                login,
                certificate,
            },
        );
    }

    pub fn role(self, name: &str) -> Self {
        self.role_owned_by(name, "dbo")
    }

    pub fn role_owned_by(mut self, name: &str, owner: &str) -> Self {
        self.add_principal(name, PrincipalKind::Role, None, Some(owner.to_string()), None, None);
        self
    }

    pub fn application_role(mut self, name: &str) -> Self {
        self.add_principal(
            name,
            PrincipalKind::ApplicationRole,
            Some("dbo".to_string()),
            Some("dbo".to_string()),
            None,
            None,
        );
        self
    }

    /// SQL user created for the login of the same name.
    pub fn login_user(mut self, name: &str) -> Self {
        self.add_principal(
            name,
            PrincipalKind::SqlLoginUser,
            Some("dbo".to_string()),
            None,
            Some(name.to_string()),
            None,
        );
        self
    }

    pub fn user_without_login(mut self, name: &str) -> Self {
        self.add_principal(name, PrincipalKind::SqlLoginUser, Some("dbo".to_string()), None, None, None);
        self
    }

    pub fn certificate_user(mut self, name: &str, certificate: &str) -> Self {
        self.certificates.insert(certificate.to_string());
        self.add_principal(
            name,
            PrincipalKind::CertificateUser,
            None,
            None,
            None,
            Some(certificate.to_string()),
        );
        self
    }

    pub fn member(mut self, role: &str, member: &str) -> Self {
        self.role_members.insert((role.to_string(), member.to_string()));
        self
    }

    pub fn schema(mut self, name: &str, owner: &str) -> Self {
        self.schemas.insert(name.to_string(), owner.to_string());
        self
    }

    pub fn table(mut self, schema: &str, name: &str, columns: &[&str]) -> Self {
        self.schemas
            .entry(schema.to_string())
            .or_insert_with(|| "dbo".to_string());
        self.objects.insert(
            (schema.to_string(), name.to_string()),
            columns.iter().map(|c| c.to_string()).collect(),
        );
        self
    }

    pub fn grant(self, grantee: &str, permission: &str, securable: Securable, grantor: &str) -> Self {
        self.permission(PermissionState::Grant, grantee, permission, securable, grantor, false)
    }

    pub fn grant_with_option(self, grantee: &str, permission: &str, securable: Securable, grantor: &str) -> Self {
        self.permission(PermissionState::Grant, grantee, permission, securable, grantor, true)
    }

    pub fn deny(self, grantee: &str, permission: &str, securable: Securable, grantor: &str) -> Self {
        self.permission(PermissionState::Deny, grantee, permission, securable, grantor, false)
    }

    fn permission(
        mut self,
        state: PermissionState,
        grantee: &str,
        permission: &str,
        securable: Securable,
        grantor: &str,
        with_grant_option: bool,
    ) -> Self {
        self.grants.insert(FakeGrant {
            grantee: grantee.to_string(),
            permission: permission.to_string(),
            securable,
            state,
            with_grant_option,
            grantor: grantor.to_string(),
        });
        self
    }

    pub fn property(mut self, principal: &str, name: &str, value: &str) -> Self {
        self.properties
            .insert((principal.to_string(), name.to_string()), Some(value.to_string()));
        self
    }

    pub fn file(mut self, logical_name: &str, is_log: bool, growth: i64, is_percent_growth: bool) -> Self {
        self.files.push(FakeFile {
            logical_name: logical_name.to_string(),
            is_log,
            size_bytes: 8 * 1024 * 1024,
            growth,
            is_percent_growth,
        });
        self
    }

    /// Copy with principal ids cleared, for comparing graphs rebuilt by drop-and-create.
    pub fn without_ids(&self) -> FakeDatabase {
        let mut copy = self.clone();
        copy.next_id = 0;
        for principal in copy.principals.values_mut() {
            principal.id = 0;
        }
        copy
    }

    pub fn is_member(&self, role: &str, member: &str) -> bool {
        self.role_members
            .contains(&(role.to_string(), member.to_string()))
    }

    pub fn principal_id(&self, name: &str) -> Option<i32> {
        self.principals
            .get(name)
            .map(|p| p.id)
            .or_else(|| BUILTIN_USERS.iter().find(|(n, _)| *n == name).map(|(_, id)| *id))
            .or_else(|| FIXED_ROLES.iter().find(|(n, _)| *n == name).map(|(_, id)| *id))
    }

    fn principal_exists(&self, name: &str) -> bool {
        self.principal_id(name).is_some()
    }

    fn is_custom_kind(&self, name: &str, kind: PrincipalKind) -> bool {
        self.principals.get(name).is_some_and(|p| p.kind == kind)
    }

    fn role_exists(&self, name: &str) -> bool {
        self.is_custom_kind(name, PrincipalKind::Role) || FIXED_ROLES.iter().any(|(n, _)| *n == name)
    }

    fn user_exists(&self, name: &str) -> bool {
        self.principals.get(name).is_some_and(|p| p.kind.is_user())
            || BUILTIN_USERS.iter().any(|(n, _)| *n == name)
    }

    fn owns_anything(&self, name: &str) -> bool {
        self.schemas.values().any(|owner| owner == name)
            || self
                .principals
                .values()
                .any(|p| p.owner.as_deref() == Some(name))
    }

    fn securable_exists(&self, securable: &Securable) -> bool {
        match securable {
            Securable::Schema { name } => self.schemas.contains_key(name),
            Securable::Object { schema, name } | Securable::Type { schema, name } => self
                .objects
                .contains_key(&(schema.clone(), name.clone())),
            Securable::Column {
                schema,
                object,
                column,
            } => self
                .objects
                .get(&(schema.clone(), object.clone()))
                .is_some_and(|columns| columns.contains(column)),
            Securable::Certificate { name } => self.certificates.contains(name),
            Securable::DatabasePrincipal { name, .. } => self.principal_exists(name),
            _ => true,
        }
    }

    fn guard_holds(&self, guard: &Guard) -> bool {
        match guard {
            Guard::PrincipalExists(name) => self.principal_exists(name),
            Guard::RoleExists(name) => self.role_exists(name),
            Guard::ApplicationRoleExists(name) => {
                self.is_custom_kind(name, PrincipalKind::ApplicationRole)
            }
            Guard::UserExists(name) => self.user_exists(name),
            Guard::SchemaExists(name) => self.schemas.contains_key(name),
            Guard::CertificateExists(name) => self.certificates.contains(name),
            Guard::ObjectExists { schema, name } | Guard::TypeExists { schema, name } => self
                .objects
                .contains_key(&(schema.clone(), name.clone())),
            Guard::ColumnExists {
                schema,
                object,
                column,
            } => self.securable_exists(&Securable::Column {
                schema: schema.clone(),
                object: object.clone(),
                column: column.clone(),
            }),
            Guard::PropertyMissing { principal, name } => !self
                .properties
                .contains_key(&(principal.clone(), name.clone())),
            Guard::DatabaseExists(_) | Guard::LoginExists(_) => false,
        }
    }

    fn remove_principal(&mut self, name: &str) {
        self.principals.remove(name);
        self.role_members.retain(|(role, member)| role != name && member != name);
        self.grants.retain(|g| g.grantee != name);
        self.properties.retain(|(principal, _), _| principal != name);
    }

    fn require_principal(&self, name: &str) -> Result<()> {
        if self.principal_exists(name) {
            Ok(())
        } else {
            Err(server_error(
                15151,
                format!("Cannot find the user '{}', because it does not exist or you do not have permission.", name),
            ))
        }
    }

    fn require_absent(&self, name: &str) -> Result<()> {
        if self.principal_exists(name) {
            Err(server_error(
                15023,
                format!("User, group, or role '{}' already exists in the current database.", name),
            ))
        } else {
            Ok(())
        }
    }

    fn drop_principal(&mut self, name: &str, matches: impl Fn(PrincipalKind) -> bool) -> Result<()> {
        if !self.principals.get(name).is_some_and(|p| matches(p.kind)) {
            return Err(server_error(
                15151,
                format!("Cannot drop '{}', because it does not exist or you do not have permission.", name),
            ));
        }
        if self.role_members.iter().any(|(role, _)| role == name) {
            return Err(server_error(
                15144,
                "The role has members. It must be empty before it can be dropped.",
            ));
        }
        if self.owns_anything(name) {
            return Err(server_error(
                15138,
                "The database principal owns a securable in the database, and cannot be dropped.",
            ));
        }
        self.remove_principal(name);
        Ok(())
    }

    fn apply(&mut self, statement: &Statement, logins: &BTreeSet<String>) -> Result<()> {
        match statement {
            Statement::ReleaseOwnership { principal } => {
                for owner in self.schemas.values_mut() {
                    if *owner == *principal {
                        *owner = "dbo".to_string();
                    }
                }
                for p in self.principals.values_mut() {
                    if p.owner.as_deref() == Some(principal.as_str()) {
                        p.owner = Some("dbo".to_string());
                    }
                }
            }
            Statement::DetachRoleMembers { role } => {
                self.role_members.retain(|(r, _)| r != role);
            }
            Statement::DropRole { name } => {
                self.drop_principal(name, |k| k == PrincipalKind::Role)?
            }
            Statement::DropApplicationRole { name } => {
                self.drop_principal(name, |k| k == PrincipalKind::ApplicationRole)?
            }
            Statement::DropUser { name } => self.drop_principal(name, PrincipalKind::is_user)?,
            Statement::CreateRole { name, owner } => {
                self.require_absent(name)?;
                let owner = owner.clone().unwrap_or_else(|| "dbo".to_string());
                self.require_principal(&owner)?;
                self.add_principal(name, PrincipalKind::Role, None, Some(owner), None, None);
            }
            Statement::CreateApplicationRole {
                name,
                default_schema,
                ..
            } => {
                self.require_absent(name)?;
                self.add_principal(
                    name,
                    PrincipalKind::ApplicationRole,
                    default_schema.clone(),
                    Some("dbo".to_string()),
                    None,
                    None,
                );
            }
            Statement::CreateUser {
                name,
                binding,
                default_schema,
            } => {
                self.require_absent(name)?;
                match binding {
                    UserBinding::Login(login) => {
                        if !logins.contains(login) {
                            return Err(server_error(
                                15007,
                                format!("'{}' is not a valid login or you do not have permission.", login),
                            ));
                        }
                        let kind = if login.contains('\\') {
                            PrincipalKind::WindowsLoginUser
                        } else {
                            PrincipalKind::SqlLoginUser
                        };
                        self.add_principal(name, kind, default_schema.clone(), None, Some(login.clone()), None);
                    }
                    UserBinding::WithoutLogin => self.add_principal(
                        name,
                        PrincipalKind::SqlLoginUser,
                        default_schema.clone(),
                        None,
                        None,
                        None,
                    ),
                    UserBinding::Certificate(certificate) => {
                        if !self.certificates.contains(certificate) {
                            return Err(server_error(
                                15151,
                                format!("Cannot find the certificate '{}'.", certificate),
                            ));
                        }
                        self.add_principal(
                            name,
                            PrincipalKind::CertificateUser,
                            None,
                            None,
                            None,
                            Some(certificate.clone()),
                        );
                    }
                }
            }
            Statement::AlterRoleOwner { role, owner } => {
                self.require_principal(owner)?;
                match self.principals.get_mut(role) {
                    Some(p) if p.kind == PrincipalKind::Role => p.owner = Some(owner.clone()),
                    _ => return Err(server_error(15151, format!("Cannot find the role '{}'.", role))),
                }
            }
            Statement::AlterSchemaOwner { schema, principal } => {
                self.require_principal(principal)?;
                match self.schemas.get_mut(schema) {
                    Some(owner) => *owner = principal.clone(),
                    None => {
                        return Err(server_error(15151, format!("Cannot find the schema '{}'.", schema)));
                    }
                }
            }
            Statement::AddRoleMember { role, member } => {
                if !self.role_exists(role) {
                    return Err(server_error(15151, format!("Cannot find the role '{}'.", role)));
                }
                self.require_principal(member)?;
                self.role_members.insert((role.clone(), member.clone()));
            }
            Statement::Permission {
                state,
                permission,
                securable,
                grantee,
                with_grant_option,
                grantor,
            } => {
                self.require_principal(grantee)?;
                if let Some(grantor) = grantor {
                    self.require_principal(grantor)?;
                }
                if !self.securable_exists(securable) {
                    return Err(server_error(
                        15151,
                        format!("Cannot find the object '{}'.", securable.on_clause().trim()),
                    ));
                }
                // a user-defined grantor needs the permission WITH GRANT OPTION itself
                if let Some(grantor) = grantor.as_deref().filter(|g| self.principals.contains_key(*g)) {
                    let holds_option = self.grants.iter().any(|g| {
                        g.grantee == grantor
                            && g.permission == *permission
                            && g.securable == *securable
                            && g.state == PermissionState::Grant
                            && g.with_grant_option
                    });
                    if !holds_option {
                        return Err(server_error(4613, "Grantor does not have GRANT permission."));
                    }
                }
                self.grants.retain(|g| {
                    !(g.grantee == *grantee && g.permission == *permission && g.securable == *securable)
                });
                if *state != PermissionState::Revoke {
                    self.grants.insert(FakeGrant {
                        grantee: grantee.clone(),
                        permission: permission.clone(),
                        securable: securable.clone(),
                        state: *state,
                        with_grant_option: *with_grant_option,
                        grantor: grantor.clone().unwrap_or_else(|| "dbo".to_string()),
                    });
                }
            }
            Statement::AddExtendedProperty {
                principal,
                name,
                value,
            } => {
                self.require_principal(principal)?;
                let key = (principal.clone(), name.clone());
                if self.properties.contains_key(&key) {
                    return Err(server_error(
                        15233,
                        format!("Property cannot be added. Property '{}' already exists for '{}'.", name, principal),
                    ));
                }
                self.properties.insert(key, value.clone());
            }
            other => {
                return Err(server_error(
                    50000,
                    format!("statement is not valid in a database context: {:?}", other),
                ));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FakeGroup {
    pub is_primary: bool,
    pub databases: BTreeSet<String>,
    /// Every replica server name, the local one included.
    pub replicas: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteJoin {
    pub server: String,
    pub database: String,
    pub group: String,
    pub full_backup: String,
    pub log_backup: String,
}

#[derive(Debug, Clone)]
pub struct ServerState {
    pub server_name: String,
    pub data_path: String,
    pub log_path: String,
    pub product_version: String,
    pub is_hadr_enabled: bool,
    pub is_sysadmin: bool,
    pub command_execute_installed: bool,
    pub command_log_installed: bool,
    pub logins: BTreeSet<String>,
    pub databases: BTreeMap<String, FakeDatabase>,
    /// Backup path -> database image at backup time.
    pub backups: BTreeMap<String, FakeDatabase>,
    pub groups: BTreeMap<String, FakeGroup>,
    /// Linked server -> rpc out enabled.
    pub linked_servers: BTreeMap<String, bool>,
    pub remote_procedures: BTreeMap<String, BTreeSet<String>>,
    pub unreachable: BTreeSet<String>,
    /// Remote joins stall this long before completing.
    pub remote_delay: Option<Duration>,
    pub failing_commands: Vec<CommandType>,
    pub remote_joins: Vec<RemoteJoin>,
    pub executed: Vec<AuditedCommand>,
}

impl ServerState {
    fn new(server_name: &str) -> Self {
        let model = FakeDatabase::new()
            .file("modeldev", false, 8192, false)
            .file("modellog", true, 8192, false);
        ServerState {
            server_name: server_name.to_string(),
            data_path: "/var/opt/mssql/data/".to_string(),
            log_path: "/var/opt/mssql/log/".to_string(),
            product_version: "16.0.4135.4".to_string(),
            is_hadr_enabled: true,
            is_sysadmin: true,
            command_execute_installed: true,
            command_log_installed: true,
            logins: BTreeSet::new(),
            databases: BTreeMap::from([("model".to_string(), model)]),
            backups: BTreeMap::new(),
            groups: BTreeMap::new(),
            linked_servers: BTreeMap::new(),
            remote_procedures: BTreeMap::new(),
            unreachable: BTreeSet::new(),
            remote_delay: None,
            failing_commands: Vec::new(),
            remote_joins: Vec::new(),
            executed: Vec::new(),
        }
    }

    fn database(&self, name: &str) -> Result<&FakeDatabase> {
        self.databases.get(name).ok_or_else(|| {
            server_error(
                911,
                format!("Database '{}' does not exist. Make sure that the name is entered correctly.", name),
            )
        })
    }

    fn database_mut(&mut self, name: &str) -> Result<&mut FakeDatabase> {
        self.databases.get_mut(name).ok_or_else(|| {
            server_error(
                911,
                format!("Database '{}' does not exist. Make sure that the name is entered correctly.", name),
            )
        })
    }

    fn linked_server_reachable(&self, server: &str) -> Result<bool> {
        let rpc_out = *self.linked_servers.get(server).ok_or_else(|| {
            server_error(
                7202,
                format!("Could not find server '{}' in sys.servers.", server),
            )
        })?;
        if self.unreachable.contains(server) {
            return Err(server_error(
                53,
                "Named Pipes Provider: Could not open a connection to SQL Server [53].",
            ));
        }
        Ok(rpc_out)
    }

    fn answer(&self, query: &CatalogQuery) -> Result<Value> {
        let rows: Vec<Value> = match query {
            CatalogQuery::ServerEnvironment => vec![json!({
                "server_name": self.server_name,
                "data_path": self.data_path,
                "log_path": self.log_path,
                "product_version": self.product_version,
                "is_hadr_enabled": self.is_hadr_enabled,
                "is_sysadmin": self.is_sysadmin,
                "command_execute_installed": self.command_execute_installed,
                "command_log_installed": self.command_log_installed,
            })],
            CatalogQuery::DatabaseExists { database } => self
                .databases
                .get(database)
                .map(|_| json!({"name": database, "state_desc": "ONLINE"}))
                .into_iter()
                .collect(),
            CatalogQuery::Principals { database } => {
                let db = self.database(database)?;
                let mut rows: Vec<(i32, Value)> = db
                    .principals
                    .iter()
                    .map(|(name, p)| {
                        let live_login = p.login.as_ref().filter(|l| self.logins.contains(*l));
                        let windows = p.login.as_ref().is_some_and(|l| l.contains('\\'));
                        let authentication = match (&p.login, windows) {
                            (Some(_), true) => 3,
                            (Some(_), false) => 1,
                            (None, _) => 0,
                        };
                        let row = json!({
                            "id": p.id,
                            "sid": format!("0x{:08X}", p.id),
                            "name": name,
                            "type_code": type_code(p.kind),
                            "default_schema": p.default_schema,
                            "owner_id": p.owner.as_deref().and_then(|o| db.principal_id(o)),
                            "owner_name": p.owner,
                            "login_name": live_login,
                            "login_type": live_login.map(|_| if windows { "U" } else { "S" }),
                            "authentication_type": authentication,
                            "certificate_name": p.certificate,
                        });
                        (p.id, row)
                    })
                    .collect();
                rows.sort_by_key(|(id, _)| *id);
                rows.into_iter().map(|(_, row)| row).collect()
            }
            CatalogQuery::RoleHierarchy { database } => {
                let db = self.database(database)?;
                db.role_members
                    .iter()
                    .filter(|(role, member)| {
                        db.is_custom_kind(role, PrincipalKind::Role)
                            && db.is_custom_kind(member, PrincipalKind::Role)
                    })
                    .map(|(role, member)| {
                        json!({
                            "child_id": db.principal_id(member),
                            "parent_id": db.principal_id(role),
                        })
                    })
                    .collect()
            }
            CatalogQuery::OwnedSchemas { database } => {
                let db = self.database(database)?;
                db.schemas
                    .iter()
                    .zip(5..)
                    .filter(|((_, owner), _)| db.principals.contains_key(*owner))
                    .map(|((schema, owner), schema_id)| {
                        json!({
                            "principal_id": db.principal_id(owner),
                            "schema_id": schema_id,
                            "schema_name": schema,
                        })
                    })
                    .collect()
            }
            CatalogQuery::RoleMemberships { database } => {
                let db = self.database(database)?;
                db.role_members
                    .iter()
                    .filter(|(_, member)| db.principals.contains_key(member))
                    .map(|(role, member)| {
                        json!({
                            "member_id": db.principal_id(member),
                            "role_id": db.principal_id(role),
                            "role_name": role,
                        })
                    })
                    .collect()
            }
            CatalogQuery::ExplicitGrants { database } => {
                let db = self.database(database)?;
                db.grants
                    .iter()
                    .filter_map(|g| {
                        let grantee_id = db.principals.get(&g.grantee)?.id;
                        let (class, schema, major, minor, principal_type) = catalog_columns(&g.securable);
                        let state = match (g.state, g.with_grant_option) {
                            (PermissionState::Grant, true) => "W",
                            (PermissionState::Grant, false) => "G",
                            (PermissionState::Deny, _) => "D",
                            (PermissionState::Revoke, _) => "R",
                        };
                        Some(json!({
                            "grantee_id": grantee_id,
                            "state": state,
                            "permission_name": g.permission,
                            "class": class,
                            "schema_name": schema,
                            "major_name": major,
                            "minor_name": minor,
                            "principal_type": principal_type,
                            "grantor_name": g.grantor,
                        }))
                    })
                    .collect()
            }
            CatalogQuery::ExtendedProperties { database } => {
                let db = self.database(database)?;
                db.properties
                    .iter()
                    .filter_map(|((principal, name), value)| {
                        let id = db.principals.get(principal)?.id;
                        Some(json!({"principal_id": id, "name": name, "value": value}))
                    })
                    .collect()
            }
            CatalogQuery::BackupFileList { backup_file } => {
                let image = self.backups.get(backup_file).ok_or_else(|| {
                    server_error(
                        3201,
                        format!("Cannot open backup device '{}'. Operating system error 2.", backup_file),
                    )
                })?;
                image
                    .files
                    .iter()
                    .map(|f| {
                        json!({
                            "logical_name": f.logical_name,
                            "file_type": if f.is_log { "L" } else { "D" },
                            "size_bytes": f.size_bytes,
                        })
                    })
                    .collect()
            }
            CatalogQuery::DatabaseFiles { database } => self
                .database(database)?
                .files
                .iter()
                .map(|f| {
                    json!({
                        "logical_name": f.logical_name,
                        "file_type": if f.is_log { "LOG" } else { "ROWS" },
                        "growth": f.growth,
                        "is_percent_growth": f.is_percent_growth,
                    })
                })
                .collect(),
            CatalogQuery::AvailabilityGroup { group, database } => self
                .groups
                .get(group)
                .map(|g| {
                    json!({
                        "group_name": group,
                        "is_primary": g.is_primary,
                        "database_is_member": g.databases.contains(database),
                    })
                })
                .into_iter()
                .collect(),
            CatalogQuery::SecondaryReplicas { group } => self
                .groups
                .get(group)
                .map(|g| {
                    let mut replicas: Vec<&String> =
                        g.replicas.iter().filter(|r| **r != self.server_name).collect();
                    replicas.sort();
                    replicas
                        .into_iter()
                        .map(|r| json!({"server_name": r}))
                        .collect()
                })
                .unwrap_or_default(),
            CatalogQuery::LinkedServer { server } => self
                .linked_servers
                .get(server)
                .map(|rpc_out| json!({"name": server, "is_rpc_out_enabled": rpc_out}))
                .into_iter()
                .collect(),
            CatalogQuery::RemoteProcedure { server, procedure } => {
                self.linked_server_reachable(server)?;
                self.remote_procedures
                    .get(server)
                    .filter(|procs| procs.contains(procedure))
                    .map(|_| json!({"name": procedure}))
                    .into_iter()
                    .collect()
            }
        };
        Ok(Value::Array(rows))
    }

    fn guard_holds(&self, database: Option<&str>, guard: &Guard) -> Result<bool> {
        match guard {
            Guard::DatabaseExists(name) => Ok(self.databases.contains_key(name)),
            Guard::LoginExists(name) => Ok(self.logins.contains(name)),
            other => {
                let name = database.unwrap_or("master");
                Ok(self.database(name)?.guard_holds(other))
            }
        }
    }

    fn execute(&mut self, command: &AuditedCommand) -> Result<()> {
        self.executed.push(command.clone());
        if !command.execute {
            return Ok(());
        }
        if self.failing_commands.contains(&command.command_type) {
            return Err(server_error(
                50000,
                format!("{} failed", command.command_type.tag()),
            ));
        }
        let checkpoint = self.clone();
        for statement in &command.statements {
            if let Err(e) = self.apply(command.database.as_deref(), statement) {
                if command.transactional {
                    *self = checkpoint;
                }
                return Err(e);
            }
        }
        Ok(())
    }

    fn apply(&mut self, database: Option<&str>, guarded: &GuardedStatement) -> Result<()> {
        for guard in &guarded.guards {
            if !self.guard_holds(database, guard)? {
                return Ok(());
            }
        }
        match &guarded.statement {
            Statement::SetSingleUser { database } => {
                self.database(database)?;
            }
            Statement::RestoreDatabase {
                database,
                backup_file,
                relocations,
            } => {
                let image = self.backups.get(backup_file).cloned().ok_or_else(|| {
                    server_error(
                        3201,
                        format!("Cannot open backup device '{}'. Operating system error 2.", backup_file),
                    )
                })?;
                if self.groups.values().any(|g| g.databases.contains(database)) {
                    return Err(server_error(
                        3104,
                        format!(
                            "RESTORE cannot operate on database '{}' because it is configured for database mirroring or has joined an availability group.",
                            database
                        ),
                    ));
                }
                if let Some(missing) = relocations
                    .iter()
                    .find(|r| !image.files.iter().any(|f| f.logical_name == r.logical_name))
                {
                    return Err(server_error(
                        3234,
                        format!("Logical file '{}' is not part of database '{}'.", missing.logical_name, database),
                    ));
                }
                self.databases.insert(database.clone(), image);
            }
            Statement::ModifyFileGrowth {
                database,
                logical_name,
                growth,
            } => {
                let db = self.database_mut(database)?;
                let file = db
                    .files
                    .iter_mut()
                    .find(|f| f.logical_name == *logical_name)
                    .ok_or_else(|| {
                        server_error(5041, format!("MODIFY FILE failed. File '{}' does not exist.", logical_name))
                    })?;
                match growth {
                    FileGrowth::Kilobytes(kb) => {
                        file.growth = (*kb / 8) as i64;
                        file.is_percent_growth = false;
                    }
                    FileGrowth::Percent(pct) => {
                        file.growth = *pct as i64;
                        file.is_percent_growth = true;
                    }
                }
            }
            Statement::BackupDatabase { database, path } | Statement::BackupLog { database, path } => {
                let image = self.database(database)?.clone();
                self.backups.insert(path.clone(), image);
            }
            Statement::RemoveDatabaseFromGroup { group, database } => {
                let g = self.group_mut(group)?;
                if !g.databases.remove(database) {
                    return Err(server_error(
                        35211,
                        format!("Database '{}' is not joined to availability group '{}'.", database, group),
                    ));
                }
            }
            Statement::AddDatabaseToGroup { group, database } => {
                self.database(database)?;
                let g = self.group_mut(group)?;
                if !g.databases.insert(database.clone()) {
                    return Err(server_error(
                        35250,
                        format!("Database '{}' is already joined to availability group '{}'.", database, group),
                    ));
                }
            }
            Statement::AddLinkedServer { server } => {
                if self.linked_servers.contains_key(server) {
                    return Err(server_error(15028, format!("The server '{}' already exists.", server)));
                }
                self.linked_servers.insert(server.clone(), false);
            }
            Statement::EnableRpcOut { server } => match self.linked_servers.get_mut(server) {
                Some(rpc_out) => *rpc_out = true,
                None => {
                    return Err(server_error(15015, format!("The server '{}' does not exist.", server)));
                }
            },
            Statement::InvokeRemoteJoin {
                server,
                procedure,
                full_backup,
                log_backup,
                database,
                group,
                ..
            } => {
                if !self.linked_server_reachable(server)? {
                    return Err(server_error(
                        7411,
                        format!("Server '{}' is not configured for RPC.", server),
                    ));
                }
                if !self
                    .remote_procedures
                    .get(server)
                    .is_some_and(|procs| procs.contains(procedure))
                {
                    return Err(server_error(
                        2812,
                        format!("Could not find stored procedure 'master.dbo.{}'.", procedure),
                    ));
                }
                for path in [full_backup, log_backup] {
                    if !self.backups.contains_key(path) {
                        return Err(server_error(
                            3201,
                            format!("Cannot open backup device '{}'. Operating system error 2.", path),
                        ));
                    }
                }
                self.remote_joins.push(RemoteJoin {
                    server: server.clone(),
                    database: database.clone(),
                    group: group.clone(),
                    full_backup: full_backup.clone(),
                    log_backup: log_backup.clone(),
                });
            }
            statement => {
                let logins = &self.logins;
                let name = database.unwrap_or("master");
                let db = self.databases.get_mut(name).ok_or_else(|| {
                    server_error(911, format!("Database '{}' does not exist.", name))
                })?;
                db.apply(statement, logins)?;
            }
        }
        Ok(())
    }

    fn group_mut(&mut self, group: &str) -> Result<&mut FakeGroup> {
        self.groups.get_mut(group).ok_or_else(|| {
            server_error(
                15151,
                format!("Cannot find the availability group '{}'.", group),
            )
        })
    }
}

fn catalog_columns(
    securable: &Securable,
) -> (i32, Option<String>, Option<String>, Option<String>, Option<&'static str>) {
    let named = |class: i32, name: &String| (class, None, Some(name.clone()), None, None);
    let scoped = |class: i32, schema: &String, name: &String| {
        (class, Some(schema.clone()), Some(name.clone()), None, None)
    };
    match securable {
        Securable::Database => (0, None, None, None, None),
        Securable::Object { schema, name } => scoped(1, schema, name),
        Securable::Column {
            schema,
            object,
            column,
        } => (1, Some(schema.clone()), Some(object.clone()), Some(column.clone()), None),
        Securable::Schema { name } => named(3, name),
        Securable::DatabasePrincipal { kind, name } => {
            let code = match kind {
                PrincipalClass::Role => "R",
                PrincipalClass::ApplicationRole => "A",
                PrincipalClass::User => "S",
            };
            (4, None, Some(name.clone()), None, Some(code))
        }
        Securable::Assembly { name } => named(5, name),
        Securable::Type { schema, name } => scoped(6, schema, name),
        Securable::XmlSchemaCollection { schema, name } => scoped(10, schema, name),
        Securable::MessageType { name } => named(15, name),
        Securable::Contract { name } => named(16, name),
        Securable::Service { name } => named(17, name),
        Securable::RemoteServiceBinding { name } => named(18, name),
        Securable::Route { name } => named(19, name),
        Securable::FulltextCatalog { name } => named(23, name),
        Securable::SymmetricKey { name } => named(24, name),
        Securable::Certificate { name } => named(25, name),
        Securable::AsymmetricKey { name } => named(26, name),
    }
}

pub struct FakeServer {
    state: Mutex<ServerState>,
}

impl FakeServer {
    pub fn new(server_name: &str) -> Self {
        FakeServer {
            state: Mutex::new(ServerState::new(server_name)),
        }
    }

    pub fn with_state<R>(&self, f: impl FnOnce(&mut ServerState) -> R) -> R {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut state)
    }

    pub fn database(&self, name: &str) -> Option<FakeDatabase> {
        self.with_state(|s| s.databases.get(name).cloned())
    }

    pub fn executed(&self) -> Vec<AuditedCommand> {
        self.with_state(|s| s.executed.clone())
    }

    pub fn executed_types(&self) -> Vec<CommandType> {
        self.executed().iter().map(|c| c.command_type).collect()
    }

    /// Every statement handed to the server, in order, guarded or not.
    pub fn statements(&self) -> Vec<Statement> {
        self.executed()
            .into_iter()
            .flat_map(|c| c.statements)
            .map(|s| s.statement)
            .collect()
    }

    pub fn remote_joins(&self) -> Vec<RemoteJoin> {
        self.with_state(|s| s.remote_joins.clone())
    }
}

#[async_trait]
impl SqlSession for FakeServer {
    async fn query(&self, query: &CatalogQuery) -> Result<Value> {
        self.with_state(|s| s.answer(query))
    }

    async fn execute(&self, command: &AuditedCommand) -> Result<()> {
        let delay = self.with_state(|s| {
            s.remote_delay
                .filter(|_| command.command_type == CommandType::AddDatabaseOnSecondary)
        });
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.with_state(|s| s.execute(command))
    }
}
