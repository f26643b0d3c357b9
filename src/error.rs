//! Error kinds for the debug-execution engine (see spec §7).
//!
//! Command handlers never throw across the dispatch boundary: every public
//! operation returns `Result<_, AgentError>` and callers at the RPC boundary
//! turn that into a `{code, message}` reply instead of unwinding.

use std::fmt;

/// One variant per error kind in spec §7.
#[derive(thiserror::Error, Debug)]
pub enum AgentError {
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("invalid context: {0}")]
    InvalidContext(String),

    #[error("invalid expression in '{expr}': {reason}")]
    InvalidExpression { expr: String, reason: String },

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("OS failure during {op}: {source}")]
    OsFailure { op: &'static str, source: nix::Error },

    #[error("memory fault at {address:#x}: {reason}")]
    MemoryFault { address: u64, reason: String },

    #[error("symbol not found: {0}")]
    SymbolNotFound(String),
}

impl AgentError {
    /// Stable small integer carried in protocol replies. Collaborator wire
    /// codecs (out of scope here) are expected to map these onto whatever
    /// on-the-wire error representation they use.
    pub fn code(&self) -> i32 {
        match self {
            AgentError::Protocol(_) => 1,
            AgentError::InvalidContext(_) => 2,
            AgentError::InvalidExpression { .. } => 3,
            AgentError::Unsupported(_) => 4,
            AgentError::OsFailure { .. } => 5,
            AgentError::MemoryFault { .. } => 6,
            AgentError::SymbolNotFound(_) => 7,
        }
    }

    pub fn os_failure(op: &'static str, source: nix::Error) -> AgentError {
        AgentError::OsFailure { op, source }
    }

    /// True when the OS reported "no such process" on a resume/stop: per
    /// spec §4.B / §7 this means the call succeeds vacuously and the
    /// context should be marked `exiting` rather than surfacing an error.
    pub fn is_no_such_process(&self) -> bool {
        matches!(
            self,
            AgentError::OsFailure { source, .. } if *source == nix::Error::Sys(nix::errno::Errno::ESRCH)
        )
    }
}

/// A reply-shaped rendering of an error, as a command handler would hand
/// back to its collaborator channel.
pub struct ErrorReply {
    pub code: i32,
    pub message: String,
}

impl From<&AgentError> for ErrorReply {
    fn from(e: &AgentError) -> Self {
        ErrorReply {
            code: e.code(),
            message: e.to_string(),
        }
    }
}

impl fmt::Display for ErrorReply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

pub type AgentResult<T> = Result<T, AgentError>;
