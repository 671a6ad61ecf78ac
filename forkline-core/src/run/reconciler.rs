//! Token reconciler
//!
//! Folds streamed engine events into the ordered content parts of the message
//! being generated. Part lists sit behind an [`Arc`] so every change can be
//! published as a full snapshot without copying the parts for each subscriber.

use crate::engine::EngineEvent;
use crate::types::{ContentPart, ToolCallPart};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use uuid::Uuid;

/// Prefix of locally generated message ids.
pub const PENDING_ID_PREFIX: &str = "pending-";

/// A tool result held for a call this message has not seen.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolOutcome {
    pub result: Value,
    pub is_error: bool,
}

/// What an event did to the in-flight message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Change {
    /// Nothing visible changed
    None,
    /// The ordered part list changed
    Parts,
    /// A result arrived for an unknown call and went to the side channel
    EarlyResult { tool_call_id: String },
    /// The engine revealed the permanent id of the message
    Retarget { from: String, to: String },
}

/// Assembles one in-flight message from its event stream.
#[derive(Debug, Clone, Default)]
pub struct TokenReconciler {
    message_id: Option<String>,
    id_is_local: bool,
    parts: Arc<Vec<ContentPart>>,
    /// tool_call_id -> index into `parts`
    tool_index: HashMap<String, usize>,
    early_results: Arc<BTreeMap<String, ToolOutcome>>,
}

impl TokenReconciler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current target id, local or engine-assigned.
    pub fn message_id(&self) -> Option<&str> {
        self.message_id.as_deref()
    }

    /// Whether the current id was generated locally.
    pub fn has_local_id(&self) -> bool {
        self.id_is_local
    }

    /// Returns the target id, generating a local one on first use.
    pub fn ensure_id(&mut self) -> &str {
        if self.message_id.is_none() {
            self.message_id = Some(format!("{}{}", PENDING_ID_PREFIX, Uuid::new_v4()));
            self.id_is_local = true;
        }
        self.message_id.as_deref().unwrap_or_default()
    }

    /// Point back at `id` after the graph refused a rename.
    pub fn restore_id(&mut self, id: &str) {
        self.id_is_local = id.starts_with(PENDING_ID_PREFIX);
        self.message_id = Some(id.to_string());
    }

    /// Cheap handle on the current part list.
    pub fn parts(&self) -> Arc<Vec<ContentPart>> {
        Arc::clone(&self.parts)
    }

    pub fn has_content(&self) -> bool {
        !self.parts.is_empty()
    }

    /// Results whose calls this message has not seen, keyed by tool call id.
    pub fn early_results(&self) -> Arc<BTreeMap<String, ToolOutcome>> {
        Arc::clone(&self.early_results)
    }

    /// Drop a side-channel result once something else has attached it.
    pub fn take_early_result(&mut self, tool_call_id: &str) -> Option<ToolOutcome> {
        if !self.early_results.contains_key(tool_call_id) {
            return None;
        }
        Arc::make_mut(&mut self.early_results).remove(tool_call_id)
    }

    /// Fold one event. Lifecycle events (`meta`, `interrupt`, `done`,
    /// `error`) are not content and report [`Change::None`].
    pub fn apply(&mut self, event: &EngineEvent) -> Change {
        match event {
            EngineEvent::TextDelta { text } => self.push_text(text),
            EngineEvent::ToolCall {
                id,
                name,
                arguments,
            } => self.merge_tool_call(id, name, arguments),
            EngineEvent::ToolResult {
                tool_call_id,
                result,
                is_error,
            } => self.attach_result(tool_call_id, result, *is_error),
            EngineEvent::MessageId { id } => self.assign_id(id),
            EngineEvent::Interrupt { .. }
            | EngineEvent::Meta { .. }
            | EngineEvent::Done { .. }
            | EngineEvent::Error { .. } => Change::None,
        }
    }

    fn push_text(&mut self, text: &str) -> Change {
        if text.is_empty() {
            return Change::None;
        }
        self.ensure_id();
        let parts = Arc::make_mut(&mut self.parts);
        match parts.last_mut() {
            Some(ContentPart::Text { text: last }) => last.push_str(text),
            _ => parts.push(ContentPart::text(text)),
        }
        Change::Parts
    }

    fn merge_tool_call(&mut self, id: &str, name: &str, arguments: &Value) -> Change {
        self.ensure_id();
        if let Some(&index) = self.tool_index.get(id) {
            let Some(ContentPart::ToolCall(existing)) = self.parts.get(index) else {
                return Change::None;
            };
            let name_changes = !name.is_empty() && existing.tool_name != name;
            let args_change = !arguments.is_null() && existing.arguments != *arguments;
            if !name_changes && !args_change {
                return Change::None;
            }
            if let Some(ContentPart::ToolCall(call)) = Arc::make_mut(&mut self.parts).get_mut(index) {
                if name_changes {
                    call.tool_name = name.to_string();
                }
                if args_change {
                    call.arguments = arguments.clone();
                }
            }
            return Change::Parts;
        }

        let mut call = ToolCallPart::new(id, name, arguments.clone());
        if let Some(outcome) = self.take_early_result(id) {
            tracing::debug!(tool_call_id = id, "Backfilling early tool result");
            call.result = Some(outcome.result);
            call.is_error = outcome.is_error;
        }
        let parts = Arc::make_mut(&mut self.parts);
        self.tool_index.insert(id.to_string(), parts.len());
        parts.push(ContentPart::ToolCall(call));
        Change::Parts
    }

    fn attach_result(&mut self, tool_call_id: &str, result: &Value, is_error: bool) -> Change {
        if let Some(&index) = self.tool_index.get(tool_call_id) {
            if let Some(ContentPart::ToolCall(call)) = Arc::make_mut(&mut self.parts).get_mut(index) {
                call.result = Some(result.clone());
                call.is_error = is_error;
                return Change::Parts;
            }
        }

        tracing::debug!(tool_call_id, "Tool result arrived before its call");
        Arc::make_mut(&mut self.early_results).insert(
            tool_call_id.to_string(),
            ToolOutcome {
                result: result.clone(),
                is_error,
            },
        );
        Change::EarlyResult {
            tool_call_id: tool_call_id.to_string(),
        }
    }

    fn assign_id(&mut self, id: &str) -> Change {
        match self.message_id.as_deref() {
            Some(current) if current == id => Change::None,
            None => {
                self.message_id = Some(id.to_string());
                self.id_is_local = false;
                Change::None
            }
            Some(current) => {
                let from = current.to_string();
                self.message_id = Some(id.to_string());
                self.id_is_local = false;
                Change::Retarget {
                    from,
                    to: id.to_string(),
                }
            }
        }
    }
}
