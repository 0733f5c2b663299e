// restoretool/src/restore/verification.rs
use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::errors::Result;
use crate::principals::{PrincipalId, PrincipalSnapshot, RoleMembership};
use crate::session::{SqlSession, query_rows};
use crate::sql::CatalogQuery;

/// Difference between the captured graph and what the restored database holds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReplayAnomaly {
    pub principal: String,
    pub detail: String,
}

#[derive(Debug, Deserialize)]
struct PresentPrincipal {
    id: PrincipalId,
    name: String,
}

/// Compares the restored database against the snapshot. Never fails the run:
/// anomalies are printed and returned.
pub async fn verify_replay(
    session: &dyn SqlSession,
    snapshot: &PrincipalSnapshot,
) -> Result<Vec<ReplayAnomaly>> {
    println!("🔍 Verifying principals of {}...", snapshot.database);
    let database = snapshot.database.clone();
    let present: Vec<PresentPrincipal> =
        query_rows(session, &CatalogQuery::Principals { database: database.clone() }).await?;
    let present_names: BTreeMap<PrincipalId, String> =
        present.into_iter().map(|p| (p.id, p.name)).collect();
    let present_set: BTreeSet<&str> = present_names.values().map(String::as_str).collect();

    let memberships: Vec<RoleMembership> =
        query_rows(session, &CatalogQuery::RoleMemberships { database }).await?;
    let present_memberships: BTreeSet<(String, String)> = memberships
        .into_iter()
        .filter_map(|m| {
            present_names
                .get(&m.member_id)
                .map(|member| (member.clone(), m.role_name))
        })
        .collect();

    let mut anomalies = Vec::new();
    for principal in &snapshot.principals {
        if !present_set.contains(principal.name.as_str()) {
            anomalies.push(ReplayAnomaly {
                principal: principal.name.clone(),
                detail: "was not recreated".to_string(),
            });
        }
    }
    for membership in &snapshot.memberships {
        let Some(member) = snapshot.principal(membership.member_id) else {
            continue;
        };
        if !present_set.contains(member.name.as_str()) {
            continue;
        }
        if !present_memberships.contains(&(member.name.clone(), membership.role_name.clone())) {
            anomalies.push(ReplayAnomaly {
                principal: member.name.clone(),
                detail: format!("is no longer a member of role {}", membership.role_name),
            });
        }
    }

    if anomalies.is_empty() {
        println!(
            "✓ All {} captured principals and {} memberships are present",
            snapshot.principals.len(),
            snapshot.memberships.len()
        );
    } else {
        for anomaly in &anomalies {
            println!("⚠️ {} {}", anomaly.principal, anomaly.detail);
        }
    }
    Ok(anomalies)
}
