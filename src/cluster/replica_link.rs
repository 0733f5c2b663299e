// restoretool/src/cluster/replica_link.rs
use std::collections::BTreeSet;
use std::future::Future;
use std::time::Duration;

use serde::Deserialize;
use tokio::time::timeout;

use crate::errors::{AppError, Result};
use crate::session::{AuditSettings, AuditedCommand, CommandType, SqlSession, query_rows};
use crate::sql::{CatalogQuery, GuardedStatement, Statement};

/// A secondary replica the restored database still has to be joined on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicaTarget {
    pub server_name: String,
    pub processed: bool,
}

impl ReplicaTarget {
    pub fn new(server_name: &str) -> Self {
        Self {
            server_name: server_name.to_string(),
            processed: false,
        }
    }
}

/// What every secondary is asked to restore and join.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinRequest {
    pub database: String,
    pub group: String,
    pub full_backup: String,
    pub log_backup: String,
}

#[derive(Debug, Deserialize)]
struct LinkedServerRow {
    #[allow(dead_code)]
    name: String,
    is_rpc_out_enabled: bool,
}

#[derive(Debug, Deserialize)]
struct ProcedureRow {
    #[allow(dead_code)]
    name: String,
}

/// Runs `fut`, failing with [`AppError::Timeout`] once `limit` elapses.
async fn within<T>(limit: Option<Duration>, fut: impl Future<Output = Result<T>>) -> Result<T> {
    match limit {
        Some(limit) => timeout(limit, fut)
            .await
            .map_err(|_| AppError::Timeout(limit))?,
        None => fut.await,
    }
}

/// Provisions linked servers from the primary to each secondary and asks the
/// secondary to restore and join the database.
///
/// Links are checked once per manager: a second join against the same server
/// reuses the link without probing it again.
pub struct ReplicaLinkManager<'a> {
    session: &'a dyn SqlSession,
    audit: AuditSettings,
    procedure: String,
    call_timeout: Option<Duration>,
    ensured: BTreeSet<String>,
    prepared: BTreeSet<String>,
}

impl<'a> ReplicaLinkManager<'a> {
    pub fn new(
        session: &'a dyn SqlSession,
        audit: AuditSettings,
        procedure: &str,
        call_timeout: Option<Duration>,
    ) -> Self {
        Self {
            session,
            audit,
            procedure: procedure.to_string(),
            call_timeout,
            ensured: BTreeSet::new(),
            prepared: BTreeSet::new(),
        }
    }

    fn command(&self, command_type: CommandType, statement: Statement) -> AuditedCommand {
        AuditedCommand::single(command_type, GuardedStatement::new(statement)).with_audit(&self.audit)
    }

    /// Makes sure a linked server with `rpc out` enabled points at `server`.
    ///
    /// Returns whether the link was usable before this call.
    pub async fn ensure_link(&mut self, server: &str) -> Result<bool> {
        if self.ensured.contains(server) {
            return Ok(true);
        }
        let rows: Vec<LinkedServerRow> = query_rows(
            self.session,
            &CatalogQuery::LinkedServer {
                server: server.to_string(),
            },
        )
        .await?;

        let already_usable = match rows.first() {
            None => {
                println!("  Creating linked server {}...", server);
                self.session
                    .execute(&self.command(
                        CommandType::AddLinkedServer,
                        Statement::AddLinkedServer {
                            server: server.to_string(),
                        },
                    ))
                    .await?;
                self.enable_rpc_out(server).await?;
                false
            }
            Some(row) if !row.is_rpc_out_enabled => {
                println!("  Enabling rpc out on linked server {}...", server);
                self.enable_rpc_out(server).await?;
                false
            }
            Some(_) => true,
        };
        self.ensured.insert(server.to_string());
        Ok(already_usable)
    }

    async fn enable_rpc_out(&self, server: &str) -> Result<()> {
        self.session
            .execute(&self.command(
                CommandType::ServerOption,
                Statement::EnableRpcOut {
                    server: server.to_string(),
                },
            ))
            .await
    }

    /// Fails when the join procedure is not installed on `server`.
    pub async fn verify_capability(&self, server: &str) -> Result<()> {
        let query = CatalogQuery::RemoteProcedure {
            server: server.to_string(),
            procedure: self.procedure.clone(),
        };
        let rows: Vec<ProcedureRow> = within(self.call_timeout, query_rows(self.session, &query)).await?;
        if rows.is_empty() {
            return Err(AppError::RemoteJoin {
                server: server.to_string(),
                reason: format!(
                    "stored procedure master.dbo.{} is not installed; add the database to this replica manually",
                    self.procedure
                ),
            });
        }
        Ok(())
    }

    /// Provisions the link to `server` and checks it can run the join procedure.
    pub async fn prepare(&mut self, server: &str) -> Result<()> {
        if self.prepared.contains(server) {
            return Ok(());
        }
        let link_was_usable = self
            .ensure_link(server)
            .await
            .map_err(|e| e.into_remote_join(server))?;

        if self.audit.execute || link_was_usable {
            self.verify_capability(server)
                .await
                .map_err(|e| e.into_remote_join(server))?;
        } else {
            tracing::info!(server = %server, "link not provisioned in plan mode; skipping procedure probe");
        }
        self.prepared.insert(server.to_string());
        Ok(())
    }

    /// Asks one secondary to restore and join the database, preparing its link first if needed.
    pub async fn join(&mut self, target: &mut ReplicaTarget, request: &JoinRequest) -> Result<()> {
        let server = target.server_name.clone();
        self.prepare(&server).await?;

        let invoke = self.command(
            CommandType::AddDatabaseOnSecondary,
            Statement::InvokeRemoteJoin {
                server: server.clone(),
                procedure: self.procedure.clone(),
                full_backup: request.full_backup.clone(),
                log_backup: request.log_backup.clone(),
                database: request.database.clone(),
                group: request.group.clone(),
                log_to_table: self.audit.log_to_table,
            },
        );
        within(self.call_timeout, self.session.execute(&invoke))
            .await
            .map_err(|e| e.into_remote_join(&server))?;

        target.processed = true;
        println!("  ✓ {} joined on {}", request.database, server);
        Ok(())
    }
}
