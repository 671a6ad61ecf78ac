//! Error types for forkline-core

use thiserror::Error;

/// Which caller operation a checkpoint resolution was performed for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    SendNew,
    Edit,
    Regenerate,
    Resume,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::SendNew => "send_new",
            Operation::Edit => "edit",
            Operation::Regenerate => "regenerate",
            Operation::Resume => "resume",
        }
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Validation failure for one tool call's edited arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecisionArgError {
    /// Tool call the draft belongs to
    pub tool_call_id: String,
    /// Parser or shape error shown next to the draft
    pub message: String,
}

impl std::fmt::Display for DecisionArgError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.tool_call_id, self.message)
    }
}

/// Main error type for the forkline-core library
#[derive(Error, Debug)]
pub enum Error {
    /// No fork point could be found where lineage requires one.
    ///
    /// Never recovered by falling back to the thread's latest checkpoint.
    #[error("missing checkpoint for {operation}: no ancestor of {} carries a checkpoint", .parent_id.as_deref().unwrap_or("<root>"))]
    MissingCheckpoint {
        operation: Operation,
        parent_id: Option<String>,
    },

    /// The execution engine reported a failure mid-stream
    #[error("engine error: {0}")]
    Engine(String),

    /// Stream or network failure (including idle timeouts)
    #[error("transport error: {0}")]
    Transport(String),

    /// Approved tool calls whose drafted arguments are not JSON objects
    #[error("invalid decision arguments: {}", format_arg_errors(.errors))]
    InvalidDecisionArgs { errors: Vec<DecisionArgError> },

    /// Submission attempted before every tool call has a decision
    #[error("undecided tool calls: {}", .0.join(", "))]
    UndecidedToolCalls(Vec<String>),

    /// Decision or submission with no interrupt awaiting decisions
    #[error("no pending interrupt")]
    NoPendingInterrupt,

    /// Tool call id not part of the pending interrupt
    #[error("unknown tool call in pending interrupt: {0}")]
    UnknownToolCall(String),

    /// Message id not present in the accepted node set
    #[error("message not found: {0}")]
    MessageNotFound(String),

    /// Operation not applicable to the referenced message or run state
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    /// Thread not found in the store
    #[error("thread not found: {0}")]
    ThreadNotFound(String),

    /// Database error
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),
}

fn format_arg_errors(errors: &[DecisionArgError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Result type alias for forkline-core
pub type Result<T> = std::result::Result<T, Error>;
