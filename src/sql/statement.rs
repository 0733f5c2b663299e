use serde::{Deserialize, Serialize};

use crate::principals::{PermissionState, Securable};

use super::{qualified_name, quote_ident, quote_literal};

/// Existence precondition evaluated by the server when the statement runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Guard {
    DatabaseExists(String),
    PrincipalExists(String),
    RoleExists(String),
    ApplicationRoleExists(String),
    UserExists(String),
    SchemaExists(String),
    LoginExists(String),
    CertificateExists(String),
    ObjectExists { schema: String, name: String },
    ColumnExists { schema: String, object: String, column: String },
    TypeExists { schema: String, name: String },
    PropertyMissing { principal: String, name: String },
}

impl Guard {
    /// Guard ensuring the securable itself still exists, where the catalog can answer cheaply.
    pub fn for_securable(securable: &Securable) -> Option<Guard> {
        match securable {
            Securable::Schema { name } => Some(Guard::SchemaExists(name.clone())),
            Securable::Object { schema, name } => Some(Guard::ObjectExists {
                schema: schema.clone(),
                name: name.clone(),
            }),
            Securable::Column {
                schema,
                object,
                column,
            } => Some(Guard::ColumnExists {
                schema: schema.clone(),
                object: object.clone(),
                column: column.clone(),
            }),
            Securable::Type { schema, name } => Some(Guard::TypeExists {
                schema: schema.clone(),
                name: name.clone(),
            }),
            Securable::DatabasePrincipal { name, .. } => Some(Guard::PrincipalExists(name.clone())),
            _ => None,
        }
    }

    pub fn render(&self) -> String {
        let principal_of_type = |name: &str, types: &str| {
            format!(
                "EXISTS (SELECT 1 FROM sys.database_principals WHERE name = {} AND type IN ({}))",
                quote_literal(name),
                types
            )
        };
        match self {
            Guard::DatabaseExists(name) => format!("DB_ID({}) IS NOT NULL", quote_literal(name)),
            Guard::PrincipalExists(name) => {
                format!("DATABASE_PRINCIPAL_ID({}) IS NOT NULL", quote_literal(name))
            }
            Guard::RoleExists(name) => principal_of_type(name, "'R'"),
            Guard::ApplicationRoleExists(name) => principal_of_type(name, "'A'"),
            Guard::UserExists(name) => {
                principal_of_type(name, "'S', 'U', 'G', 'C', 'K', 'E', 'X'")
            }
            Guard::SchemaExists(name) => format!("SCHEMA_ID({}) IS NOT NULL", quote_literal(name)),
            Guard::LoginExists(name) => format!(
                "EXISTS (SELECT 1 FROM sys.server_principals WHERE name = {})",
                quote_literal(name)
            ),
            Guard::CertificateExists(name) => {
                format!("CERT_ID({}) IS NOT NULL", quote_literal(name))
            }
            Guard::ObjectExists { schema, name } => format!(
                "OBJECT_ID({}) IS NOT NULL",
                quote_literal(&qualified_name(schema, name))
            ),
            Guard::ColumnExists {
                schema,
                object,
                column,
            } => format!(
                "COL_LENGTH({}, {}) IS NOT NULL",
                quote_literal(&qualified_name(schema, object)),
                quote_literal(column)
            ),
            Guard::TypeExists { schema, name } => format!(
                "TYPE_ID({}) IS NOT NULL",
                quote_literal(&qualified_name(schema, name))
            ),
            Guard::PropertyMissing { principal, name } => format!(
                "NOT EXISTS (SELECT 1 FROM sys.extended_properties WHERE class = 4 AND major_id = DATABASE_PRINCIPAL_ID({}) AND name = {})",
                quote_literal(principal),
                quote_literal(name)
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum UserBinding {
    Login(String),
    WithoutLogin,
    Certificate(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRelocation {
    pub logical_name: String,
    pub physical_path: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileGrowth {
    Kilobytes(u64),
    Percent(u32),
}

impl FileGrowth {
    /// `growth` is expressed in 8 KB pages unless `is_percent` is set.
    pub fn from_catalog(growth: i64, is_percent: bool) -> Self {
        let growth = growth.max(0) as u64;
        if is_percent {
            FileGrowth::Percent(growth as u32)
        } else {
            FileGrowth::Kilobytes(growth * 8)
        }
    }

    fn render(self) -> String {
        match self {
            FileGrowth::Kilobytes(kb) => format!("{}KB", kb),
            FileGrowth::Percent(pct) => format!("{}%", pct),
        }
    }
}

/// Every mutating operation the tool can ask a server to perform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Statement {
    /// Hands every schema and role owned by the principal to `dbo` so it can be dropped.
    ReleaseOwnership { principal: String },
    DetachRoleMembers { role: String },
    DropRole { name: String },
    DropApplicationRole { name: String },
    DropUser { name: String },
    CreateRole { name: String, owner: Option<String> },
    CreateApplicationRole { name: String, password: String, default_schema: Option<String> },
    CreateUser { name: String, binding: UserBinding, default_schema: Option<String> },
    AlterRoleOwner { role: String, owner: String },
    AlterSchemaOwner { schema: String, principal: String },
    AddRoleMember { role: String, member: String },
    Permission {
        state: PermissionState,
        permission: String,
        securable: Securable,
        grantee: String,
        with_grant_option: bool,
        grantor: Option<String>,
    },
    AddExtendedProperty { principal: String, name: String, value: Option<String> },
    SetSingleUser { database: String },
    RestoreDatabase { database: String, backup_file: String, relocations: Vec<FileRelocation> },
    ModifyFileGrowth { database: String, logical_name: String, growth: FileGrowth },
    BackupDatabase { database: String, path: String },
    BackupLog { database: String, path: String },
    RemoveDatabaseFromGroup { group: String, database: String },
    AddDatabaseToGroup { group: String, database: String },
    AddLinkedServer { server: String },
    EnableRpcOut { server: String },
    InvokeRemoteJoin {
        server: String,
        procedure: String,
        full_backup: String,
        log_backup: String,
        database: String,
        group: String,
        log_to_table: bool,
    },
}

impl Statement {
    pub fn render(&self) -> String {
        match self {
            Statement::ReleaseOwnership { principal } => {
                let id = format!("DATABASE_PRINCIPAL_ID({})", quote_literal(principal));
                format!(
                    "DECLARE @release_sql nvarchar(max) = N'';\n\
                     SELECT @release_sql += N'ALTER AUTHORIZATION ON SCHEMA::' + QUOTENAME(s.name) + N' TO [dbo];' FROM sys.schemas AS s WHERE s.principal_id = {id};\n\
                     SELECT @release_sql += N'ALTER AUTHORIZATION ON ROLE::' + QUOTENAME(r.name) + N' TO [dbo];' FROM sys.database_principals AS r WHERE r.type = 'R' AND r.owning_principal_id = {id};\n\
                     EXECUTE (@release_sql)"
                )
            }
            Statement::DetachRoleMembers { role } => format!(
                "DECLARE @detach_sql nvarchar(max) = N'';\n\
                 SELECT @detach_sql += N'ALTER ROLE ' + QUOTENAME(r.name) + N' DROP MEMBER ' + QUOTENAME(m.name) + N';'\n\
                 FROM sys.database_role_members AS rm\n\
                 JOIN sys.database_principals AS r ON r.principal_id = rm.role_principal_id\n\
                 JOIN sys.database_principals AS m ON m.principal_id = rm.member_principal_id\n\
                 WHERE r.name = {};\n\
                 EXECUTE (@detach_sql)",
                quote_literal(role)
            ),
            Statement::DropRole { name } => format!("DROP ROLE {}", quote_ident(name)),
            Statement::DropApplicationRole { name } => {
                format!("DROP APPLICATION ROLE {}", quote_ident(name))
            }
            Statement::DropUser { name } => format!("DROP USER {}", quote_ident(name)),
            Statement::CreateRole { name, owner } => match owner {
                Some(owner) => format!(
                    "CREATE ROLE {} AUTHORIZATION {}",
                    quote_ident(name),
                    quote_ident(owner)
                ),
                None => format!("CREATE ROLE {}", quote_ident(name)),
            },
            Statement::CreateApplicationRole {
                name,
                password,
                default_schema,
            } => {
                let mut sql = format!(
                    "CREATE APPLICATION ROLE {} WITH PASSWORD = {}",
                    quote_ident(name),
                    quote_literal(password)
                );
                if let Some(schema) = default_schema {
                    sql.push_str(&format!(", DEFAULT_SCHEMA = {}", quote_ident(schema)));
                }
                sql
            }
            Statement::CreateUser {
                name,
                binding,
                default_schema,
            } => {
                let mut sql = format!("CREATE USER {}", quote_ident(name));
                match binding {
                    UserBinding::Login(login) => {
                        sql.push_str(&format!(" FOR LOGIN {}", quote_ident(login)))
                    }
                    UserBinding::WithoutLogin => sql.push_str(" WITHOUT LOGIN"),
                    UserBinding::Certificate(cert) => {
                        // certificate users take no default schema
                        return format!("{} FOR CERTIFICATE {}", sql, quote_ident(cert));
                    }
                }
                if let Some(schema) = default_schema {
                    sql.push_str(&format!(" WITH DEFAULT_SCHEMA = {}", quote_ident(schema)));
                }
                sql
            }
            Statement::AlterRoleOwner { role, owner } => format!(
                "ALTER AUTHORIZATION ON ROLE::{} TO {}",
                quote_ident(role),
                quote_ident(owner)
            ),
            Statement::AlterSchemaOwner { schema, principal } => format!(
                "ALTER AUTHORIZATION ON SCHEMA::{} TO {}",
                quote_ident(schema),
                quote_ident(principal)
            ),
            Statement::AddRoleMember { role, member } => format!(
                "ALTER ROLE {} ADD MEMBER {}",
                quote_ident(role),
                quote_ident(member)
            ),
            Statement::Permission {
                state,
                permission,
                securable,
                grantee,
                with_grant_option,
                grantor,
            } => {
                let preposition = if *state == PermissionState::Revoke {
                    "FROM"
                } else {
                    "TO"
                };
                let mut sql = format!(
                    "{} {}{} {} {}",
                    state.keyword(),
                    permission,
                    securable.on_clause(),
                    preposition,
                    quote_ident(grantee)
                );
                if *with_grant_option && *state == PermissionState::Grant {
                    sql.push_str(" WITH GRANT OPTION");
                }
                if let Some(grantor) = grantor {
                    sql.push_str(&format!(" AS {}", quote_ident(grantor)));
                }
                sql
            }
            Statement::AddExtendedProperty {
                principal,
                name,
                value,
            } => format!(
                "EXECUTE sys.sp_addextendedproperty @name = {}, @value = {}, @level0type = N'USER', @level0name = {}",
                quote_literal(name),
                value.as_deref().map(quote_literal).unwrap_or_else(|| "NULL".to_string()),
                quote_literal(principal)
            ),
            Statement::SetSingleUser { database } => format!(
                "ALTER DATABASE {} SET SINGLE_USER WITH ROLLBACK IMMEDIATE",
                quote_ident(database)
            ),
            Statement::RestoreDatabase {
                database,
                backup_file,
                relocations,
            } => {
                let mut options: Vec<String> = relocations
                    .iter()
                    .map(|r| {
                        format!(
                            "MOVE {} TO {}",
                            quote_literal(&r.logical_name),
                            quote_literal(&r.physical_path)
                        )
                    })
                    .collect();
                options.extend(["REPLACE", "RECOVERY", "STATS = 10"].map(String::from));
                format!(
                    "RESTORE DATABASE {} FROM DISK = {} WITH {}",
                    quote_ident(database),
                    quote_literal(backup_file),
                    options.join(", ")
                )
            }
            Statement::ModifyFileGrowth {
                database,
                logical_name,
                growth,
            } => format!(
                "ALTER DATABASE {} MODIFY FILE (NAME = {}, FILEGROWTH = {})",
                quote_ident(database),
                quote_literal(logical_name),
                growth.render()
            ),
            Statement::BackupDatabase { database, path } => format!(
                "BACKUP DATABASE {} TO DISK = {} WITH INIT, CHECKSUM",
                quote_ident(database),
                quote_literal(path)
            ),
            Statement::BackupLog { database, path } => format!(
                "BACKUP LOG {} TO DISK = {} WITH INIT, CHECKSUM",
                quote_ident(database),
                quote_literal(path)
            ),
            Statement::RemoveDatabaseFromGroup { group, database } => format!(
                "ALTER AVAILABILITY GROUP {} REMOVE DATABASE {}",
                quote_ident(group),
                quote_ident(database)
            ),
            Statement::AddDatabaseToGroup { group, database } => format!(
                "ALTER AVAILABILITY GROUP {} ADD DATABASE {}",
                quote_ident(group),
                quote_ident(database)
            ),
            Statement::AddLinkedServer { server } => format!(
                "EXECUTE master.dbo.sp_addlinkedserver @server = {}, @srvproduct = N'SQL Server'",
                quote_literal(server)
            ),
            Statement::EnableRpcOut { server } => format!(
                "EXECUTE master.dbo.sp_serveroption @server = {}, @optname = N'rpc out', @optvalue = N'true'",
                quote_literal(server)
            ),
            Statement::InvokeRemoteJoin {
                server,
                procedure,
                full_backup,
                log_backup,
                database,
                group,
                log_to_table,
            } => format!(
                "EXECUTE {}.[master].[dbo].{} @FullBackupFile = {}, @LogBackupFile = {}, @DatabaseName = {}, @AvailabilityGroup = {}, @LogToTable = {}",
                quote_ident(server),
                quote_ident(procedure),
                quote_literal(full_backup),
                quote_literal(log_backup),
                quote_literal(database),
                quote_literal(group),
                if *log_to_table { "N'Y'" } else { "N'N'" }
            ),
        }
    }
}

/// A statement together with the preconditions that must all hold for it to run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuardedStatement {
    pub guards: Vec<Guard>,
    pub statement: Statement,
}

impl GuardedStatement {
    pub fn new(statement: Statement) -> Self {
        Self {
            guards: Vec::new(),
            statement,
        }
    }

    pub fn guarded_by(mut self, guard: Guard) -> Self {
        self.guards.push(guard);
        self
    }

    pub fn guarded_by_all(mut self, guards: impl IntoIterator<Item = Guard>) -> Self {
        self.guards.extend(guards);
        self
    }

    pub fn render(&self) -> String {
        let body = self.statement.render();
        if self.guards.is_empty() {
            return format!("{};", body);
        }
        let condition = self
            .guards
            .iter()
            .map(Guard::render)
            .collect::<Vec<_>>()
            .join("\n   AND ");
        let indented = body
            .lines()
            .map(|line| format!("    {}", line))
            .collect::<Vec<_>>()
            .join("\n");
        format!("IF {}\nBEGIN\n{};\nEND", condition, indented)
    }
}
