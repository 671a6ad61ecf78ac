//! Core domain types for forkline
//!
//! These types describe a conversation as a graph of messages rather than a
//! flat list. Every message points at its parent; several children of the same
//! parent are branch siblings, and the thread's head selects which root-to-leaf
//! path is active.
//!
//! ## Terminology
//!
//! | Term | Definition |
//! |------|------------|
//! | **Thread** | A named conversation: a message graph plus a head pointer |
//! | **Message** | One node in the graph, authored by a [`Role`] |
//! | **Head** | The selected leaf; its ancestry is the active path |
//! | **Siblings** | Messages sharing one parent (alternatives produced by edit or regenerate) |
//! | **Checkpoint** | Engine-owned snapshot id recorded on the message it follows |
//! | **Run** | One streamed execution against the engine |
//! | **Interrupt** | A run paused until a human decides on its tool calls |

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

// ============================================
// Messages
// ============================================

/// Author of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        }
    }
}

impl std::str::FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" | "human" => Ok(Role::User),
            "assistant" | "ai" => Ok(Role::Assistant),
            "system" => Ok(Role::System),
            _ => Err(format!("unknown role: {}", s)),
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A tool invocation embedded in an assistant message.
///
/// `result` and `is_error` are filled in once the engine reports the outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallPart {
    pub tool_call_id: String,
    pub tool_name: String,
    #[serde(default)]
    pub arguments: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default)]
    pub is_error: bool,
}

impl ToolCallPart {
    pub fn new(tool_call_id: impl Into<String>, tool_name: impl Into<String>, arguments: Value) -> Self {
        Self {
            tool_call_id: tool_call_id.into(),
            tool_name: tool_name.into(),
            arguments,
            result: None,
            is_error: false,
        }
    }

    /// Whether the engine has reported an outcome for this call
    pub fn is_resolved(&self) -> bool {
        self.result.is_some()
    }
}

/// One typed segment of a message's content, in display order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    /// Plain text span
    Text { text: String },

    /// Tool call, possibly already carrying its result
    ToolCall(ToolCallPart),

    /// Standalone tool result whose call is not part of this message
    ToolResult {
        tool_call_id: String,
        result: Value,
        #[serde(default)]
        is_error: bool,
    },

    /// Reference to an uploaded attachment (payload lives elsewhere)
    Attachment {
        attachment_id: String,
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        mime_type: Option<String>,
    },
}

impl ContentPart {
    pub fn text(text: impl Into<String>) -> Self {
        ContentPart::Text { text: text.into() }
    }

    /// Text carried by this part, if it is a text span
    pub fn as_text(&self) -> Option<&str> {
        match self {
            ContentPart::Text { text } => Some(text),
            _ => None,
        }
    }
}

/// Why a message stopped before completing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum IncompleteReason {
    /// Engine or transport failure
    Error { message: String },
    /// User stopped the run, or a newer run superseded it
    Cancelled,
}

/// Lifecycle status of a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessageStatus {
    /// Still streaming
    Running,
    /// Finished normally
    Complete,
    /// Stopped early; content so far is kept
    Incomplete { reason: IncompleteReason },
    /// Paused on a human decision
    RequiresAction { reason: String },
}

impl MessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageStatus::Running => "running",
            MessageStatus::Complete => "complete",
            MessageStatus::Incomplete { .. } => "incomplete",
            MessageStatus::RequiresAction { .. } => "requires_action",
        }
    }

    pub fn requires_action(&self) -> bool {
        matches!(self, MessageStatus::RequiresAction { .. })
    }

    pub fn cancelled() -> Self {
        MessageStatus::Incomplete {
            reason: IncompleteReason::Cancelled,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        MessageStatus::Incomplete {
            reason: IncompleteReason::Error {
                message: message.into(),
            },
        }
    }

    /// Reason string used for tool approval pauses
    pub fn awaiting_approval() -> Self {
        MessageStatus::RequiresAction {
            reason: "tool_approval".to_string(),
        }
    }
}

/// A node in the conversation graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Stable identifier, unique within a thread
    pub id: String,
    pub role: Role,
    /// Ordered content parts
    pub content: Vec<ContentPart>,
    /// Preceding message, or `None` for a root
    pub parent_id: Option<String>,
    /// Engine checkpoint produced right after this message was processed
    pub checkpoint_id: Option<String>,
    pub status: MessageStatus,
    pub created_at: DateTime<Utc>,
}

impl Message {
    /// Build a message with a fresh random id.
    pub fn new(role: Role, content: Vec<ContentPart>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            role,
            content,
            parent_id: None,
            checkpoint_id: None,
            status: MessageStatus::Complete,
            created_at: Utc::now(),
        }
    }

    /// Completed user message with a single text part
    pub fn user_text(text: impl Into<String>) -> Self {
        Self::new(Role::User, vec![ContentPart::text(text)])
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_parent(mut self, parent_id: Option<String>) -> Self {
        self.parent_id = parent_id;
        self
    }

    pub fn with_checkpoint(mut self, checkpoint_id: impl Into<String>) -> Self {
        self.checkpoint_id = Some(checkpoint_id.into());
        self
    }

    pub fn with_status(mut self, status: MessageStatus) -> Self {
        self.status = status;
        self
    }

    /// Concatenation of every text part
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(ContentPart::as_text)
            .collect::<Vec<_>>()
            .join("")
    }

    /// Tool call parts in content order
    pub fn tool_calls(&self) -> impl Iterator<Item = &ToolCallPart> {
        self.content.iter().filter_map(|part| match part {
            ContentPart::ToolCall(call) => Some(call),
            _ => None,
        })
    }
}

/// Deterministic id for a message that arrived without one.
///
/// Derived from the checkpoint it belongs to, its position, its role and its
/// text, so importing the same foreign snapshot twice yields the same ids.
pub fn synthetic_message_id(
    checkpoint_id: Option<&str>,
    index: usize,
    role: Role,
    text: &str,
) -> String {
    let seed = format!(
        "{}:{}:{}:{}",
        checkpoint_id.unwrap_or("none"),
        index,
        role.as_str(),
        text
    );
    Uuid::new_v5(&Uuid::NAMESPACE_URL, seed.as_bytes()).to_string()
}

// ============================================
// Thread snapshots
// ============================================

/// One persisted graph entry.
///
/// `parent_id` is authoritative on import; it overrides whatever the embedded
/// message carries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotEntry {
    pub parent_id: Option<String>,
    pub message: Message,
}

/// Storage-agnostic form of a thread: head pointer plus every node.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ThreadSnapshot {
    pub head_id: Option<String>,
    pub messages: Vec<SnapshotEntry>,
}

impl ThreadSnapshot {
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Look up an entry's message by id
    pub fn message(&self, id: &str) -> Option<&Message> {
        self.messages
            .iter()
            .map(|entry| &entry.message)
            .find(|message| message.id == id)
    }
}

// ============================================
// Thread catalog
// ============================================

/// Visibility of a thread in listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreadStatus {
    #[default]
    Regular,
    Archived,
}

impl ThreadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ThreadStatus::Regular => "regular",
            ThreadStatus::Archived => "archived",
        }
    }
}

impl std::str::FromStr for ThreadStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "regular" => Ok(ThreadStatus::Regular),
            "archived" => Ok(ThreadStatus::Archived),
            _ => Err(format!("unknown thread status: {}", s)),
        }
    }
}

/// Title given to threads that were never renamed.
pub const DEFAULT_THREAD_TITLE: &str = "New Chat";

/// Catalog metadata for a thread.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThreadInfo {
    pub id: String,
    /// Human-friendly title (optional)
    pub title: Option<String>,
    pub status: ThreadStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Number of stored messages across all branches
    pub message_count: usize,
}

impl ThreadInfo {
    pub fn new(id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            title: Some(DEFAULT_THREAD_TITLE.to_string()),
            status: ThreadStatus::Regular,
            created_at: now,
            updated_at: now,
            message_count: 0,
        }
    }
}

// ============================================
// Runs
// ============================================

/// What started a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunKind {
    SendNew,
    Edit,
    Regenerate,
    Resume,
}

impl RunKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunKind::SendNew => "send_new",
            RunKind::Edit => "edit",
            RunKind::Regenerate => "regenerate",
            RunKind::Resume => "resume",
        }
    }
}

impl std::str::FromStr for RunKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "send_new" => Ok(RunKind::SendNew),
            "edit" => Ok(RunKind::Edit),
            "regenerate" => Ok(RunKind::Regenerate),
            "resume" => Ok(RunKind::Resume),
            _ => Err(format!("unknown run kind: {}", s)),
        }
    }
}

/// Terminal state a run ended in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Complete,
    Interrupted,
    Errored,
    Aborted,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Complete => "complete",
            RunStatus::Interrupted => "interrupted",
            RunStatus::Errored => "errored",
            RunStatus::Aborted => "aborted",
        }
    }
}

impl std::str::FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "complete" => Ok(RunStatus::Complete),
            "interrupted" => Ok(RunStatus::Interrupted),
            "errored" => Ok(RunStatus::Errored),
            "aborted" => Ok(RunStatus::Aborted),
            _ => Err(format!("unknown run status: {}", s)),
        }
    }
}

/// Audit entry for one finished run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub id: String,
    pub thread_id: String,
    pub kind: RunKind,
    pub status: RunStatus,
    /// Checkpoint the run forked from (`None` for a fresh thread)
    pub fork_checkpoint_id: Option<String>,
    /// Checkpoint the run produced, when it got that far
    pub result_checkpoint_id: Option<String>,
    /// Assistant message the run streamed into
    pub message_id: Option<String>,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

// ============================================
// Interrupts
// ============================================

/// A tool call the engine wants approved before executing it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRequest {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub arguments: Value,
}

/// Payload of an approval-required interrupt.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InterruptPayload {
    pub tool_calls: Vec<ToolCallRequest>,
}

/// Persisted record of a paused checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterruptRecord {
    pub checkpoint_id: String,
    /// Assistant message left in `requires_action`
    pub message_id: Option<String>,
    pub payload: InterruptPayload,
    pub created_at: DateTime<Utc>,
}

/// Answer to "is this checkpoint still paused?"
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InterruptStatus {
    pub interrupted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<InterruptPayload>,
}

/// Human verdict on one tool call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionKind {
    Approve,
    Reject,
}

/// Resume entry for one tool call. Rejected calls carry no arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResumeDecision {
    pub id: String,
    pub decision: DecisionKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<Value>,
}

/// Input for resuming an interrupted checkpoint.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResumePayload {
    pub decisions: Vec<ResumeDecision>,
}

/// Text recorded as the result of a tool call the user rejected.
pub const REJECTED_TOOL_RESULT: &str = "Tool call rejected by user.";

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_role_parse_accepts_engine_aliases() {
        assert_eq!("human".parse::<Role>().unwrap(), Role::User);
        assert_eq!("ai".parse::<Role>().unwrap(), Role::Assistant);
        assert!("tool".parse::<Role>().is_err());
    }

    #[test]
    fn test_content_part_wire_shape() {
        let part = ContentPart::ToolCall(ToolCallPart::new("call-1", "search", json!({"q": "rust"})));
        let value = serde_json::to_value(&part).unwrap();
        assert_eq!(value["type"], "tool_call");
        assert_eq!(value["tool_call_id"], "call-1");
        assert!(value.get("result").is_none());
    }

    #[test]
    fn test_status_serialization_is_tagged() {
        let status = MessageStatus::error("boom");
        let value = serde_json::to_value(&status).unwrap();
        assert_eq!(
            value,
            json!({"type": "incomplete", "reason": {"kind": "error", "message": "boom"}})
        );
        let back: MessageStatus = serde_json::from_value(value).unwrap();
        assert_eq!(back, status);
    }

    #[test]
    fn test_message_text_joins_text_parts_only() {
        let mut message = Message::new(Role::Assistant, vec![ContentPart::text("Looking")]);
        message
            .content
            .push(ContentPart::ToolCall(ToolCallPart::new("c", "ls", json!({}))));
        message.content.push(ContentPart::text(" done"));
        assert_eq!(message.text(), "Looking done");
        assert_eq!(message.tool_calls().count(), 1);
    }

    #[test]
    fn test_synthetic_id_is_deterministic() {
        let a = synthetic_message_id(Some("cp-1"), 0, Role::User, "hi");
        let b = synthetic_message_id(Some("cp-1"), 0, Role::User, "hi");
        let c = synthetic_message_id(Some("cp-1"), 1, Role::User, "hi");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_rejected_decision_omits_arguments() {
        let decision = ResumeDecision {
            id: "call-1".to_string(),
            decision: DecisionKind::Reject,
            arguments: None,
        };
        assert_eq!(
            serde_json::to_value(&decision).unwrap(),
            json!({"id": "call-1", "decision": "reject"})
        );
    }
}
