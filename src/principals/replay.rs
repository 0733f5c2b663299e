// restoretool/src/principals/replay.rs
use std::collections::{BTreeMap, VecDeque};

use serde::Serialize;
use uuid::Uuid;

use crate::errors::{AppError, Result};
use crate::session::{AuditSettings, AuditedCommand, CommandType, SqlSession};
use crate::sql::{Guard, GuardedStatement, Statement, UserBinding};

use super::rank::ReplayOrder;
use super::{
    Authentication, ExplicitGrant, PermissionState, Principal, PrincipalId, PrincipalKind, PrincipalSnapshot,
};

/// Statements run as one atomic unit for one principal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PrincipalBatch {
    pub principal_id: PrincipalId,
    pub principal_name: String,
    pub statements: Vec<GuardedStatement>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReplayReport {
    pub principals: usize,
    pub statements: usize,
    /// Principals whose create statement was not emitted at all.
    pub skipped: Vec<String>,
}

/// Recreates a captured principal graph on the restored database.
///
/// Principals are processed one at a time in [`ReplayOrder`]. A relationship
/// between captured principals (membership, role ownership, a grant whose
/// grantor or securable is a captured principal) is emitted in the batch of
/// whichever endpoint is processed last, so every captured endpoint has
/// already been recreated when it runs. Every dependent statement also keeps
/// its existence guard for references outside the snapshot.
pub struct PermissionReplayEngine<'a> {
    snapshot: &'a PrincipalSnapshot,
    order: &'a ReplayOrder,
}

struct Planned {
    batches: Vec<PrincipalBatch>,
    skipped: Vec<String>,
}

impl<'a> PermissionReplayEngine<'a> {
    pub fn new(snapshot: &'a PrincipalSnapshot, order: &'a ReplayOrder) -> Self {
        Self { snapshot, order }
    }

    pub fn plan(&self) -> Vec<PrincipalBatch> {
        self.build().batches
    }

    fn build(&self) -> Planned {
        let by_id = self.snapshot.by_id();
        let name_to_id: BTreeMap<&str, PrincipalId> = self
            .snapshot
            .principals
            .iter()
            .map(|p| (p.name.as_str(), p.id))
            .collect();
        let position = |id: PrincipalId| self.order.position(id);
        let position_of_name = |name: &str| name_to_id.get(name).and_then(|id| position(*id));

        let mut released: Vec<Vec<GuardedStatement>> = vec![Vec::new(); self.order.len()];
        let mut release = |positions: &[Option<usize>], statement: GuardedStatement| {
            if let Some(at) = positions.iter().flatten().max() {
                released[*at].push(statement);
            }
        };

        // role ownership
        for entry in self.order.entries() {
            let Some(role) = by_id.get(&entry.id) else { continue };
            if role.kind != PrincipalKind::Role {
                continue;
            }
            let Some(owner) = role.owner_name.as_deref() else { continue };
            if owner == "dbo" || owner == role.name || self.owner_inline(role).is_some() {
                continue;
            }
            release(
                &[position(role.id), position_of_name(owner)],
                GuardedStatement::new(Statement::AlterRoleOwner {
                    role: role.name.clone(),
                    owner: owner.to_string(),
                })
                .guarded_by(Guard::RoleExists(role.name.clone()))
                .guarded_by(Guard::PrincipalExists(owner.to_string())),
            );
        }

        for membership in &self.snapshot.memberships {
            let Some(member) = by_id.get(&membership.member_id) else { continue };
            release(
                &[position(membership.member_id), position(membership.role_id)],
                GuardedStatement::new(Statement::AddRoleMember {
                    role: membership.role_name.clone(),
                    member: member.name.clone(),
                })
                .guarded_by(Guard::RoleExists(membership.role_name.clone()))
                .guarded_by(Guard::PrincipalExists(member.name.clone())),
            );
        }

        let mut pending: Vec<(usize, &ExplicitGrant, &str)> = Vec::new();
        for grant in &self.snapshot.grants {
            let Some(grantee) = by_id.get(&grant.grantee_id) else { continue };
            let endpoints = [
                position(grant.grantee_id),
                grant.grantor.as_deref().and_then(position_of_name),
                grant.securable.principal_name().and_then(position_of_name),
            ];
            if let Some(at) = endpoints.into_iter().flatten().max() {
                pending.push((at, grant, grantee.name.as_str()));
            }
        }
        // a grant made AS a captured grantor waits for the grantor's own grant option
        let mut moved = true;
        while moved {
            moved = false;
            for i in 0..pending.len() {
                let (at, grant, _) = pending[i];
                let needed = pending
                    .iter()
                    .filter(|(_, other, other_grantee)| passes_grant_option(other, other_grantee, grant))
                    .map(|(other_at, ..)| *other_at)
                    .max();
                if let Some(needed) = needed.filter(|needed| *needed > at) {
                    pending[i].0 = needed;
                    moved = true;
                }
            }
        }
        let mut grants_at: Vec<Vec<(&ExplicitGrant, &str)>> = vec![Vec::new(); self.order.len()];
        for (at, grant, grantee) in pending {
            grants_at[at].push((grant, grantee));
        }
        for (at, grants) in grants_at.into_iter().enumerate() {
            for (grant, grantee) in grantor_chain_order(grants) {
                let mut guards = vec![Guard::PrincipalExists(grantee.to_string())];
                if let Some(grantor) = &grant.grantor {
                    guards.push(Guard::PrincipalExists(grantor.clone()));
                }
                guards.extend(Guard::for_securable(&grant.securable));
                released[at].push(
                    GuardedStatement::new(Statement::Permission {
                        state: grant.state,
                        permission: grant.permission.clone(),
                        securable: grant.securable.clone(),
                        grantee: grantee.to_string(),
                        with_grant_option: grant.with_grant_option,
                        grantor: grant.grantor.clone(),
                    })
                    .guarded_by_all(guards),
                );
            }
        }

        let mut skipped = Vec::new();
        let mut batches = Vec::with_capacity(self.order.len());
        for (at, entry) in self.order.entries().iter().enumerate() {
            let Some(principal) = by_id.get(&entry.id) else { continue };
            let mut statements = self.recreate(principal, &mut skipped);

            for owned in self.snapshot.owned_schemas.iter().filter(|s| s.principal_id == principal.id) {
                statements.push(
                    GuardedStatement::new(Statement::AlterSchemaOwner {
                        schema: owned.schema_name.clone(),
                        principal: principal.name.clone(),
                    })
                    .guarded_by(Guard::PrincipalExists(principal.name.clone()))
                    .guarded_by(Guard::SchemaExists(owned.schema_name.clone())),
                );
            }

            statements.append(&mut released[at]);

            for property in self.snapshot.properties.iter().filter(|p| p.principal_id == principal.id) {
                statements.push(
                    GuardedStatement::new(Statement::AddExtendedProperty {
                        principal: principal.name.clone(),
                        name: property.name.clone(),
                        value: property.value.clone(),
                    })
                    .guarded_by(Guard::PrincipalExists(principal.name.clone()))
                    .guarded_by(Guard::PropertyMissing {
                        principal: principal.name.clone(),
                        name: property.name.clone(),
                    }),
                );
            }

            batches.push(PrincipalBatch {
                principal_id: principal.id,
                principal_name: principal.name.clone(),
                statements,
            });
        }
        Planned { batches, skipped }
    }

    /// Owner written into `CREATE ROLE ... AUTHORIZATION`: a captured role that is processed earlier.
    fn owner_inline(&self, role: &Principal) -> Option<&'a str> {
        let owner = self.snapshot.principal(role.owner_id?)?;
        let earlier = self.order.position(owner.id)? < self.order.position(role.id)?;
        (earlier && owner.kind == PrincipalKind::Role && owner.id != role.id).then_some(owner.name.as_str())
    }

    /// Drop of the same-named principal left by the restore, then the create.
    fn recreate(&self, principal: &Principal, skipped: &mut Vec<String>) -> Vec<GuardedStatement> {
        let name = principal.name.clone();
        let exists = match principal.kind {
            PrincipalKind::Role => Guard::RoleExists(name.clone()),
            PrincipalKind::ApplicationRole => Guard::ApplicationRoleExists(name.clone()),
            _ => Guard::UserExists(name.clone()),
        };
        let guarded = |statement: Statement| GuardedStatement::new(statement).guarded_by(exists.clone());

        let mut statements = vec![guarded(Statement::ReleaseOwnership { principal: name.clone() })];
        match principal.kind {
            PrincipalKind::Role => {
                statements.push(guarded(Statement::DetachRoleMembers { role: name.clone() }));
                statements.push(guarded(Statement::DropRole { name: name.clone() }));
                statements.push(GuardedStatement::new(Statement::CreateRole {
                    name,
                    owner: self.owner_inline(principal).map(str::to_string),
                }));
            }
            PrincipalKind::ApplicationRole => {
                statements.push(guarded(Statement::DropApplicationRole { name: name.clone() }));
                statements.push(GuardedStatement::new(Statement::CreateApplicationRole {
                    name,
                    password: Uuid::new_v4().to_string(),
                    default_schema: principal.default_schema.clone(),
                }));
            }
            _ => {
                statements.push(guarded(Statement::DropUser { name: name.clone() }));
                match user_binding(principal) {
                    Some((binding, guard)) => {
                        let create = GuardedStatement::new(Statement::CreateUser {
                            name,
                            binding,
                            default_schema: principal.default_schema.clone(),
                        });
                        statements.push(match guard {
                            Some(guard) => create.guarded_by(guard),
                            None => create,
                        });
                    }
                    None => {
                        tracing::warn!(
                            principal = %principal.name,
                            authentication = ?principal.authentication,
                            "user has neither a live login nor a certificate; it will not be recreated"
                        );
                        skipped.push(name);
                    }
                }
            }
        }
        statements
    }

    /// Drains the plan, one atomic audited command per principal.
    pub async fn replay(&self, session: &dyn SqlSession, audit: &AuditSettings) -> Result<ReplayReport> {
        if self.order.is_empty() {
            println!("✓ No principals to replay");
            return Ok(ReplayReport::default());
        }
        let Planned { batches, skipped } = self.build();
        let mut worklist: VecDeque<PrincipalBatch> = batches.into();
        let mut report = ReplayReport {
            skipped,
            ..Default::default()
        };

        while let Some(batch) = worklist.pop_front() {
            let count = batch.statements.len();
            tracing::debug!(principal = %batch.principal_name, statements = count, "replaying principal");
            let command = AuditedCommand::new(CommandType::RestorePermissions, batch.statements)
                .in_database(&self.snapshot.database)
                .transactional()
                .with_audit(audit);
            session.execute(&command).await.map_err(|e| {
                AppError::Restore(format!(
                    "Replaying principal '{}' failed: {}",
                    batch.principal_name, e
                ))
            })?;
            report.principals += 1;
            report.statements += count;
        }

        println!(
            "✓ Replayed {} principals ({} statements)",
            report.principals, report.statements
        );
        Ok(report)
    }
}

/// Whether `option` is the `WITH GRANT OPTION` grant that lets `grant`'s grantor hand it on.
fn passes_grant_option(option: &ExplicitGrant, option_grantee: &str, grant: &ExplicitGrant) -> bool {
    option.state == PermissionState::Grant
        && option.with_grant_option
        && grant.grantor.as_deref() == Some(option_grantee)
        && option.permission == grant.permission
        && option.securable == grant.securable
}

/// Orders one batch's grants so a grantor receives its grant option before
/// granting `AS` itself. Grants in a grantor cycle keep snapshot order.
fn grantor_chain_order<'g>(mut remaining: Vec<(&'g ExplicitGrant, &'g str)>) -> Vec<(&'g ExplicitGrant, &'g str)> {
    let mut ordered = Vec::with_capacity(remaining.len());
    while !remaining.is_empty() {
        let ready = remaining.iter().position(|(grant, _)| {
            !remaining.iter().any(|(option, option_grantee)| {
                !std::ptr::eq(*option, *grant) && passes_grant_option(option, option_grantee, grant)
            })
        });
        ordered.push(remaining.remove(ready.unwrap_or(0)));
    }
    ordered
}

/// How a captured user is recreated, with the guard the create needs.
fn user_binding(principal: &Principal) -> Option<(UserBinding, Option<Guard>)> {
    if principal.kind == PrincipalKind::CertificateUser {
        let certificate = principal.certificate.clone()?;
        return Some((
            UserBinding::Certificate(certificate.clone()),
            Some(Guard::CertificateExists(certificate)),
        ));
    }
    match (&principal.login, principal.authentication) {
        (Some(login), _) => Some((
            UserBinding::Login(login.name.clone()),
            Some(Guard::LoginExists(login.name.clone())),
        )),
        (None, Authentication::None) => Some((UserBinding::WithoutLogin, None)),
        (None, _) => None,
    }
}
