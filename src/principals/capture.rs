// restoretool/src/principals/capture.rs
use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::errors::{AppError, Result};
use crate::session::{SqlSession, database_exists, query_rows};
use crate::sql::CatalogQuery;

use super::{
    Authentication, ExplicitGrant, ExtendedProperty, LoginBinding, LoginKind, OwnedSchema,
    PermissionState, Principal, PrincipalId, PrincipalKind, PrincipalSnapshot, RoleHierarchyEdge,
    RoleMembership, Securable,
};

/// Row shape of [`CatalogQuery::Principals`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct PrincipalRow {
    pub id: PrincipalId,
    pub sid: Option<String>,
    pub name: String,
    pub type_code: String,
    pub default_schema: Option<String>,
    pub owner_id: Option<PrincipalId>,
    pub owner_name: Option<String>,
    pub login_name: Option<String>,
    pub login_type: Option<String>,
    pub authentication_type: Option<i32>,
    pub certificate_name: Option<String>,
}

impl PrincipalRow {
    fn into_principal(self) -> Option<Principal> {
        let kind = PrincipalKind::from_type_code(&self.type_code)?;
        let login = match (self.login_name, self.login_type.as_deref()) {
            (Some(name), Some(code)) => {
                LoginKind::from_type_code(code).map(|kind| LoginBinding { name, kind })
            }
            _ => None,
        };
        Some(Principal {
            id: self.id,
            sid: self.sid,
            name: self.name,
            kind,
            default_schema: self.default_schema,
            owner_id: self.owner_id,
            owner_name: self.owner_name,
            login,
            authentication: Authentication::from_code(self.authentication_type),
            certificate: self.certificate_name,
        })
    }
}

/// Row shape of [`CatalogQuery::ExplicitGrants`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct GrantRow {
    pub grantee_id: PrincipalId,
    pub state: String,
    pub permission_name: String,
    pub class: i32,
    pub schema_name: Option<String>,
    pub major_name: Option<String>,
    pub minor_name: Option<String>,
    pub principal_type: Option<String>,
    pub grantor_name: Option<String>,
}

impl GrantRow {
    fn into_grant(self) -> Option<ExplicitGrant> {
        let (state, with_grant_option) = PermissionState::from_code(&self.state)?;
        let securable = Securable::from_catalog(
            self.class,
            self.schema_name.as_deref(),
            self.major_name.as_deref(),
            self.minor_name.as_deref(),
            self.principal_type.as_deref(),
        )?;
        Some(ExplicitGrant {
            grantee_id: self.grantee_id,
            state,
            permission: self.permission_name.trim().to_string(),
            securable,
            with_grant_option,
            grantor: self.grantor_name,
        })
    }
}

/// Reads the authorization graph of `database`.
///
/// Must run before the destructive restore: the source is the pre-restore
/// database. Read-only.
pub async fn capture_snapshot(session: &dyn SqlSession, database: &str) -> Result<PrincipalSnapshot> {
    if !database_exists(session, database)
        .await
        .map_err(AppError::into_capture)?
    {
        return Err(AppError::Capture(format!(
            "Database '{}' does not exist; permissions can only be preserved from an existing database",
            database
        )));
    }
    capture_existing(session, database)
        .await
        .map_err(AppError::into_capture)
}

async fn capture_existing(session: &dyn SqlSession, database: &str) -> Result<PrincipalSnapshot> {
    let db = database.to_string();

    let mut principals = Vec::new();
    for row in query_rows::<PrincipalRow>(session, &CatalogQuery::Principals { database: db.clone() }).await? {
        let name = row.name.clone();
        match row.into_principal() {
            Some(principal) => principals.push(principal),
            None => tracing::warn!(principal = %name, "skipping principal of unsupported type"),
        }
    }
    let ids: BTreeSet<PrincipalId> = principals.iter().map(|p| p.id).collect();
    let role_ids: BTreeSet<PrincipalId> = principals
        .iter()
        .filter(|p| p.kind == PrincipalKind::Role)
        .map(|p| p.id)
        .collect();

    let mut hierarchy: Vec<RoleHierarchyEdge> =
        query_rows(session, &CatalogQuery::RoleHierarchy { database: db.clone() }).await?;
    hierarchy.retain(|e| {
        e.child_id != e.parent_id && role_ids.contains(&e.child_id) && role_ids.contains(&e.parent_id)
    });
    hierarchy.sort();
    hierarchy.dedup();

    let mut owned_schemas: Vec<OwnedSchema> =
        query_rows(session, &CatalogQuery::OwnedSchemas { database: db.clone() }).await?;
    owned_schemas.retain(|s| ids.contains(&s.principal_id));

    let mut memberships: Vec<RoleMembership> =
        query_rows(session, &CatalogQuery::RoleMemberships { database: db.clone() }).await?;
    memberships.retain(|m| ids.contains(&m.member_id));

    let mut grants = Vec::new();
    for row in query_rows::<GrantRow>(session, &CatalogQuery::ExplicitGrants { database: db.clone() }).await? {
        if !ids.contains(&row.grantee_id) {
            continue;
        }
        let (class, permission) = (row.class, row.permission_name.clone());
        match row.into_grant() {
            Some(grant) => grants.push(grant),
            None => tracing::warn!(class, permission = %permission.trim(), "skipping permission on unsupported securable"),
        }
    }

    let mut properties: Vec<ExtendedProperty> =
        query_rows(session, &CatalogQuery::ExtendedProperties { database: db.clone() }).await?;
    properties.retain(|p| ids.contains(&p.principal_id));

    let snapshot = PrincipalSnapshot {
        database: db,
        principals,
        hierarchy,
        owned_schemas,
        memberships,
        grants,
        properties,
    };
    tracing::info!(
        database,
        principals = snapshot.principals.len(),
        memberships = snapshot.memberships.len(),
        grants = snapshot.grants.len(),
        properties = snapshot.properties.len(),
        "captured principal graph"
    );
    Ok(snapshot)
}
