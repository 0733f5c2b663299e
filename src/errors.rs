use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// One diagnostic line reported by the server (`Msg n, Level n, State n ...`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerMessage {
    pub number: u32,
    pub level: u8,
    pub text: String,
}

impl fmt::Display for ServerMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Msg {}, Level {}: {}", self.number, self.level, self.text)
    }
}

fn join_messages(messages: &[ServerMessage], stderr: &str) -> String {
    if messages.is_empty() {
        return stderr.trim().to_string();
    }
    messages
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Error, Debug)]
pub enum AppError {
    /// Missing privilege, missing collaborator object or invalid parameter combination.
    #[error("Precondition failed: {0}")]
    Precondition(String),

    #[error("Availability group error: {0}")]
    ClusterTopology(String),

    #[error("Permission capture failed: {0}")]
    Capture(String),

    #[error("Restore operation failed: {0}")]
    Restore(String),

    #[error("Remote join failed on replica {server}: {reason}")]
    RemoteJoin { server: String, reason: String },

    #[error("Command execution failed ({status}): {}", join_messages(.messages, .stderr))]
    Command {
        status: String,
        messages: Vec<ServerMessage>,
        stderr: String,
    },

    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serde JSON error: {0}")]
    SerdeJson(#[from] serde_json::Error),

    #[error("UTF-8 conversion error: {0}")]
    Utf8Error(#[from] std::string::FromUtf8Error),

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl AppError {
    /// Re-labels a transport failure as a restore failure, keeping the server text verbatim.
    pub fn into_restore(self) -> Self {
        match self {
            AppError::Restore(_) => self,
            other => AppError::Restore(other.to_string()),
        }
    }

    pub fn into_capture(self) -> Self {
        match self {
            AppError::Capture(_) => self,
            other => AppError::Capture(other.to_string()),
        }
    }

    pub fn into_remote_join(self, server: &str) -> Self {
        match self {
            AppError::RemoteJoin { .. } => self,
            other => AppError::RemoteJoin {
                server: server.to_string(),
                reason: other.to_string(),
            },
        }
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
