use super::{quote_ident, quote_literal};

/// Read-only catalog inspection. Every query renders to a script whose single
/// result value is a JSON array of rows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CatalogQuery {
    ServerEnvironment,
    DatabaseExists { database: String },
    Principals { database: String },
    RoleHierarchy { database: String },
    OwnedSchemas { database: String },
    RoleMemberships { database: String },
    ExplicitGrants { database: String },
    ExtendedProperties { database: String },
    BackupFileList { backup_file: String },
    DatabaseFiles { database: String },
    AvailabilityGroup { group: String, database: String },
    SecondaryReplicas { group: String },
    LinkedServer { server: String },
    RemoteProcedure { server: String, procedure: String },
}

/// Principals that are never captured: `public` (0), the reserved ids 1-4
/// (`dbo`, `guest`, `INFORMATION_SCHEMA`, `sys`), fixed roles and `##` certificate accounts.
const CAPTURED_PRINCIPAL_FILTER: &str =
    "principal_id > 4 AND is_fixed_role = 0 AND name NOT LIKE N'##%' AND type IN ('R', 'A', 'S', 'U', 'G', 'C')";

impl CatalogQuery {
    /// Short label used in logs.
    pub fn label(&self) -> &'static str {
        match self {
            CatalogQuery::ServerEnvironment => "server environment",
            CatalogQuery::DatabaseExists { .. } => "database existence",
            CatalogQuery::Principals { .. } => "database principals",
            CatalogQuery::RoleHierarchy { .. } => "role hierarchy",
            CatalogQuery::OwnedSchemas { .. } => "schema ownership",
            CatalogQuery::RoleMemberships { .. } => "role memberships",
            CatalogQuery::ExplicitGrants { .. } => "explicit permissions",
            CatalogQuery::ExtendedProperties { .. } => "extended properties",
            CatalogQuery::BackupFileList { .. } => "backup file list",
            CatalogQuery::DatabaseFiles { .. } => "database files",
            CatalogQuery::AvailabilityGroup { .. } => "availability group",
            CatalogQuery::SecondaryReplicas { .. } => "secondary replicas",
            CatalogQuery::LinkedServer { .. } => "linked server",
            CatalogQuery::RemoteProcedure { .. } => "remote procedure",
        }
    }

    /// Complete script, ready for the client tool.
    pub fn render(&self) -> String {
        let (prelude, select) = self.parts();
        let mut script = String::from("SET NOCOUNT ON;\n");
        if let Some(database) = self.database_context() {
            script.push_str(&format!("USE {};\n", quote_ident(database)));
        }
        if let Some(prelude) = prelude {
            script.push_str(&prelude);
            script.push('\n');
        }
        script.push_str(&format!(
            "SELECT ISNULL((\n{}\nFOR JSON PATH, INCLUDE_NULL_VALUES), N'[]') AS [rows];",
            select
        ));
        script
    }

    fn database_context(&self) -> Option<&str> {
        match self {
            CatalogQuery::Principals { database }
            | CatalogQuery::RoleHierarchy { database }
            | CatalogQuery::OwnedSchemas { database }
            | CatalogQuery::RoleMemberships { database }
            | CatalogQuery::ExplicitGrants { database }
            | CatalogQuery::ExtendedProperties { database }
            | CatalogQuery::DatabaseFiles { database } => Some(database),
            _ => None,
        }
    }

    fn parts(&self) -> (Option<String>, String) {
        match self {
            CatalogQuery::ServerEnvironment => (
                None,
                "SELECT CAST(SERVERPROPERTY('ServerName') AS nvarchar(128)) AS server_name,\n\
                 CAST(SERVERPROPERTY('InstanceDefaultDataPath') AS nvarchar(260)) AS data_path,\n\
                 CAST(SERVERPROPERTY('InstanceDefaultLogPath') AS nvarchar(260)) AS log_path,\n\
                 CAST(SERVERPROPERTY('ProductVersion') AS nvarchar(128)) AS product_version,\n\
                 CAST(ISNULL(SERVERPROPERTY('IsHadrEnabled'), 0) AS bit) AS is_hadr_enabled,\n\
                 CAST(IS_SRVROLEMEMBER(N'sysadmin') AS bit) AS is_sysadmin,\n\
                 CAST(CASE WHEN OBJECT_ID(N'master.dbo.CommandExecute', N'P') IS NOT NULL THEN 1 ELSE 0 END AS bit) AS command_execute_installed,\n\
                 CAST(CASE WHEN OBJECT_ID(N'master.dbo.CommandLog', N'U') IS NOT NULL THEN 1 ELSE 0 END AS bit) AS command_log_installed"
                    .to_string(),
            ),
            CatalogQuery::DatabaseExists { database } => (
                None,
                format!(
                    "SELECT d.name, d.state_desc FROM sys.databases AS d WHERE d.name = {}",
                    quote_literal(database)
                ),
            ),
            CatalogQuery::Principals { .. } => (
                None,
                format!(
                    "SELECT dp.principal_id AS id, CONVERT(varchar(200), dp.sid, 1) AS sid, dp.name,\n\
                     dp.type AS type_code, dp.default_schema_name AS default_schema,\n\
                     dp.owning_principal_id AS owner_id, owner.name AS owner_name,\n\
                     sp.name AS login_name, sp.type AS login_type,\n\
                     dp.authentication_type, cert.name AS certificate_name\n\
                     FROM sys.database_principals AS dp\n\
                     LEFT JOIN sys.database_principals AS owner ON owner.principal_id = dp.owning_principal_id\n\
                     LEFT JOIN sys.server_principals AS sp ON sp.sid = dp.sid AND dp.type IN ('S', 'U', 'G')\n\
                     LEFT JOIN sys.certificates AS cert ON cert.sid = dp.sid AND dp.type = 'C'\n\
                     WHERE dp.{}\n\
                     ORDER BY dp.principal_id",
                    CAPTURED_PRINCIPAL_FILTER.replace(" AND ", " AND dp.")
                ),
            ),
            CatalogQuery::RoleHierarchy { .. } => (
                None,
                "SELECT rm.member_principal_id AS child_id, rm.role_principal_id AS parent_id\n\
                 FROM sys.database_role_members AS rm\n\
                 JOIN sys.database_principals AS r ON r.principal_id = rm.role_principal_id\n\
                 JOIN sys.database_principals AS m ON m.principal_id = rm.member_principal_id\n\
                 WHERE r.type = 'R' AND m.type = 'R'\n\
                   AND r.is_fixed_role = 0 AND m.is_fixed_role = 0\n\
                   AND r.principal_id > 4 AND m.principal_id > 4"
                    .to_string(),
            ),
            CatalogQuery::OwnedSchemas { .. } => (
                None,
                format!(
                    "SELECT s.principal_id, s.schema_id, s.name AS schema_name\n\
                     FROM sys.schemas AS s\n\
                     JOIN sys.database_principals AS dp ON dp.principal_id = s.principal_id\n\
                     WHERE dp.{}",
                    CAPTURED_PRINCIPAL_FILTER.replace(" AND ", " AND dp.")
                ),
            ),
            CatalogQuery::RoleMemberships { .. } => (
                None,
                format!(
                    "SELECT rm.member_principal_id AS member_id, rm.role_principal_id AS role_id, r.name AS role_name\n\
                     FROM sys.database_role_members AS rm\n\
                     JOIN sys.database_principals AS r ON r.principal_id = rm.role_principal_id\n\
                     JOIN sys.database_principals AS dp ON dp.principal_id = rm.member_principal_id\n\
                     WHERE r.principal_id > 0 AND dp.{}",
                    CAPTURED_PRINCIPAL_FILTER.replace(" AND ", " AND dp.")
                ),
            ),
            CatalogQuery::ExplicitGrants { .. } => (
                None,
                format!(
                    "SELECT p.grantee_principal_id AS grantee_id, p.state, p.permission_name, p.class,\n\
                     CASE p.class\n\
                       WHEN 1 THEN OBJECT_SCHEMA_NAME(p.major_id)\n\
                       WHEN 6 THEN (SELECT SCHEMA_NAME(t.schema_id) FROM sys.types AS t WHERE t.user_type_id = p.major_id)\n\
                       WHEN 10 THEN (SELECT SCHEMA_NAME(x.schema_id) FROM sys.xml_schema_collections AS x WHERE x.xml_collection_id = p.major_id)\n\
                     END AS schema_name,\n\
                     CASE p.class\n\
                       WHEN 1 THEN OBJECT_NAME(p.major_id)\n\
                       WHEN 3 THEN SCHEMA_NAME(p.major_id)\n\
                       WHEN 4 THEN USER_NAME(p.major_id)\n\
                       WHEN 5 THEN (SELECT a.name FROM sys.assemblies AS a WHERE a.assembly_id = p.major_id)\n\
                       WHEN 6 THEN (SELECT t.name FROM sys.types AS t WHERE t.user_type_id = p.major_id)\n\
                       WHEN 10 THEN (SELECT x.name FROM sys.xml_schema_collections AS x WHERE x.xml_collection_id = p.major_id)\n\
                       WHEN 15 THEN (SELECT mt.name FROM sys.service_message_types AS mt WHERE mt.message_type_id = p.major_id)\n\
                       WHEN 16 THEN (SELECT sc.name FROM sys.service_contracts AS sc WHERE sc.service_contract_id = p.major_id)\n\
                       WHEN 17 THEN (SELECT sv.name FROM sys.services AS sv WHERE sv.service_id = p.major_id)\n\
                       WHEN 18 THEN (SELECT rb.name FROM sys.remote_service_bindings AS rb WHERE rb.remote_service_binding_id = p.major_id)\n\
                       WHEN 19 THEN (SELECT ro.name FROM sys.routes AS ro WHERE ro.route_id = p.major_id)\n\
                       WHEN 23 THEN (SELECT fc.name FROM sys.fulltext_catalogs AS fc WHERE fc.fulltext_catalog_id = p.major_id)\n\
                       WHEN 24 THEN (SELECT sk.name FROM sys.symmetric_keys AS sk WHERE sk.symmetric_key_id = p.major_id)\n\
                       WHEN 25 THEN (SELECT c.name FROM sys.certificates AS c WHERE c.certificate_id = p.major_id)\n\
                       WHEN 26 THEN (SELECT ak.name FROM sys.asymmetric_keys AS ak WHERE ak.asymmetric_key_id = p.major_id)\n\
                     END AS major_name,\n\
                     CASE WHEN p.class = 1 AND p.minor_id > 0 THEN COL_NAME(p.major_id, p.minor_id) END AS minor_name,\n\
                     CASE WHEN p.class = 4 THEN (SELECT sp.type FROM sys.database_principals AS sp WHERE sp.principal_id = p.major_id) END AS principal_type,\n\
                     USER_NAME(p.grantor_principal_id) AS grantor_name\n\
                     FROM sys.database_permissions AS p\n\
                     JOIN sys.database_principals AS dp ON dp.principal_id = p.grantee_principal_id\n\
                     WHERE dp.{}\n\
                     ORDER BY p.grantee_principal_id, p.class, p.major_id, p.minor_id, p.permission_name",
                    CAPTURED_PRINCIPAL_FILTER.replace(" AND ", " AND dp.")
                ),
            ),
            CatalogQuery::ExtendedProperties { .. } => (
                None,
                format!(
                    "SELECT ep.major_id AS principal_id, ep.name, CONVERT(nvarchar(4000), ep.value) AS value\n\
                     FROM sys.extended_properties AS ep\n\
                     JOIN sys.database_principals AS dp ON dp.principal_id = ep.major_id\n\
                     WHERE ep.class = 4 AND dp.{}",
                    CAPTURED_PRINCIPAL_FILTER.replace(" AND ", " AND dp.")
                ),
            ),
            CatalogQuery::BackupFileList { backup_file } => (
                Some(format!(
                    "CREATE TABLE #file_list (\n\
                       LogicalName nvarchar(128), PhysicalName nvarchar(260), [Type] char(1), FileGroupName nvarchar(128),\n\
                       Size numeric(20, 0), MaxSize numeric(20, 0), FileId bigint, CreateLSN numeric(25, 0), DropLSN numeric(25, 0),\n\
                       UniqueId uniqueidentifier, ReadOnlyLSN numeric(25, 0), ReadWriteLSN numeric(25, 0), BackupSizeInBytes bigint,\n\
                       SourceBlockSize int, FileGroupId int, LogGroupGUID uniqueidentifier, DifferentialBaseLSN numeric(25, 0),\n\
                       DifferentialBaseGUID uniqueidentifier, IsReadOnly bit, IsPresent bit, TDEThumbprint varbinary(32), SnapshotUrl nvarchar(360)\n\
                     );\n\
                     INSERT INTO #file_list EXECUTE (N'RESTORE FILELISTONLY FROM DISK = ' + {});",
                    quote_literal(&quote_literal(backup_file))
                )),
                "SELECT LogicalName AS logical_name, [Type] AS file_type, CAST(Size AS bigint) AS size_bytes\n\
                 FROM #file_list\n\
                 ORDER BY FileId"
                    .to_string(),
            ),
            CatalogQuery::DatabaseFiles { .. } => (
                None,
                "SELECT f.name AS logical_name, f.type_desc AS file_type, f.growth, f.is_percent_growth\n\
                 FROM sys.database_files AS f\n\
                 ORDER BY f.file_id"
                    .to_string(),
            ),
            CatalogQuery::AvailabilityGroup { group, database } => (
                None,
                format!(
                    "SELECT ag.name AS group_name,\n\
                     CAST(CASE WHEN ars.role_desc = N'PRIMARY' THEN 1 ELSE 0 END AS bit) AS is_primary,\n\
                     CAST(CASE WHEN EXISTS (SELECT 1 FROM sys.availability_databases_cluster AS adc\n\
                       WHERE adc.group_id = ag.group_id AND adc.database_name = {}) THEN 1 ELSE 0 END AS bit) AS database_is_member\n\
                     FROM sys.availability_groups AS ag\n\
                     LEFT JOIN sys.dm_hadr_availability_replica_states AS ars ON ars.group_id = ag.group_id AND ars.is_local = 1\n\
                     WHERE ag.name = {}",
                    quote_literal(database),
                    quote_literal(group)
                ),
            ),
            CatalogQuery::SecondaryReplicas { group } => (
                None,
                format!(
                    "SELECT ar.replica_server_name AS server_name\n\
                     FROM sys.availability_replicas AS ar\n\
                     JOIN sys.availability_groups AS ag ON ag.group_id = ar.group_id\n\
                     WHERE ag.name = {} AND ar.replica_server_name <> @@SERVERNAME\n\
                     ORDER BY ar.replica_server_name",
                    quote_literal(group)
                ),
            ),
            CatalogQuery::LinkedServer { server } => (
                None,
                format!(
                    "SELECT s.name, s.is_rpc_out_enabled\n\
                     FROM sys.servers AS s\n\
                     WHERE s.name = {} AND s.is_linked = 1",
                    quote_literal(server)
                ),
            ),
            CatalogQuery::RemoteProcedure { server, procedure } => (
                None,
                format!(
                    "SELECT p.name\n\
                     FROM {}.[master].[sys].[procedures] AS p\n\
                     WHERE p.name = {}",
                    quote_ident(server),
                    quote_literal(procedure)
                ),
            ),
        }
    }
}
