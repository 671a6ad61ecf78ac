//! Human-in-the-loop approval gate
//!
//! When a run pauses on tool calls that need approval, the gate holds one
//! editable argument draft and one decision per call. Submission is all or
//! nothing: every call must be decided and every approved draft must parse as
//! a JSON object, otherwise nothing is sent and each bad call gets its own
//! error. A successful submission yields the resume payload together with the
//! checkpoint recorded when the interrupt was created.

use crate::error::{DecisionArgError, Error, Result};
use crate::types::{
    DecisionKind, InterruptPayload, InterruptRecord, InterruptStatus, Message, ResumeDecision,
    ResumePayload, ToolCallRequest,
};
use chrono::{DateTime, Utc};
use serde_json::Value;

/// Per-call decision state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Decision {
    #[default]
    Undecided,
    Approved,
    Rejected,
}

impl From<DecisionKind> for Decision {
    fn from(kind: DecisionKind) -> Self {
        match kind {
            DecisionKind::Approve => Decision::Approved,
            DecisionKind::Reject => Decision::Rejected,
        }
    }
}

/// One tool call awaiting a decision.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingToolCall {
    pub id: String,
    pub name: String,
    /// Arguments as the engine proposed them
    pub arguments: Value,
    /// Editable JSON text, initialised from `arguments`
    pub draft: String,
    pub decision: Decision,
}

impl PendingToolCall {
    fn from_request(request: &ToolCallRequest) -> Self {
        Self {
            id: request.id.clone(),
            name: request.name.clone(),
            arguments: request.arguments.clone(),
            draft: serde_json::to_string_pretty(&request.arguments)
                .unwrap_or_else(|_| request.arguments.to_string()),
            decision: Decision::Undecided,
        }
    }

    /// Parse the draft as the arguments an approval would send.
    fn parsed_draft(&self) -> std::result::Result<Value, String> {
        match serde_json::from_str::<Value>(&self.draft) {
            Ok(value @ Value::Object(_)) => Ok(value),
            Ok(other) => Err(format!(
                "arguments must be a JSON object, got {}",
                json_kind(&other)
            )),
            Err(e) => Err(e.to_string()),
        }
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// A run paused on a specific checkpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingInterrupt {
    pub checkpoint_id: String,
    /// Assistant message left in `requires_action`
    pub message_id: Option<String>,
    pub tool_calls: Vec<PendingToolCall>,
    pub created_at: DateTime<Utc>,
}

impl PendingInterrupt {
    pub fn new(checkpoint_id: impl Into<String>, message_id: Option<String>, payload: &InterruptPayload) -> Self {
        Self {
            checkpoint_id: checkpoint_id.into(),
            message_id,
            tool_calls: payload.tool_calls.iter().map(PendingToolCall::from_request).collect(),
            created_at: Utc::now(),
        }
    }

    pub fn tool_call(&self, id: &str) -> Option<&PendingToolCall> {
        self.tool_calls.iter().find(|call| call.id == id)
    }

    /// Persistable form, carrying the engine's original arguments
    pub fn to_record(&self) -> InterruptRecord {
        InterruptRecord {
            checkpoint_id: self.checkpoint_id.clone(),
            message_id: self.message_id.clone(),
            payload: InterruptPayload {
                tool_calls: self
                    .tool_calls
                    .iter()
                    .map(|call| ToolCallRequest {
                        id: call.id.clone(),
                        name: call.name.clone(),
                        arguments: call.arguments.clone(),
                    })
                    .collect(),
            },
            created_at: self.created_at,
        }
    }

    fn call_mut(&mut self, id: &str) -> Result<&mut PendingToolCall> {
        self.tool_calls
            .iter_mut()
            .find(|call| call.id == id)
            .ok_or_else(|| Error::UnknownToolCall(id.to_string()))
    }

    /// Build the resume payload, or explain every reason it cannot be built.
    pub fn validate(&self) -> Result<ResumePayload> {
        let undecided: Vec<String> = self
            .tool_calls
            .iter()
            .filter(|call| call.decision == Decision::Undecided)
            .map(|call| call.id.clone())
            .collect();
        if !undecided.is_empty() {
            return Err(Error::UndecidedToolCalls(undecided));
        }

        let mut errors = Vec::new();
        let mut decisions = Vec::with_capacity(self.tool_calls.len());
        for call in &self.tool_calls {
            match call.decision {
                Decision::Approved => match call.parsed_draft() {
                    Ok(arguments) => decisions.push(ResumeDecision {
                        id: call.id.clone(),
                        decision: DecisionKind::Approve,
                        arguments: Some(arguments),
                    }),
                    Err(message) => errors.push(DecisionArgError {
                        tool_call_id: call.id.clone(),
                        message,
                    }),
                },
                Decision::Rejected => decisions.push(ResumeDecision {
                    id: call.id.clone(),
                    decision: DecisionKind::Reject,
                    arguments: None,
                }),
                Decision::Undecided => {}
            }
        }

        if !errors.is_empty() {
            return Err(Error::InvalidDecisionArgs { errors });
        }
        Ok(ResumePayload { decisions })
    }
}

/// Gate state machine.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum GateState {
    #[default]
    NoInterrupt,
    AwaitingDecisions(PendingInterrupt),
    /// Decisions submitted; kept so a failed resume can be retried
    Resuming(PendingInterrupt),
}

/// A resume ready to hand to the run coordinator.
#[derive(Debug, Clone, PartialEq)]
pub struct ResumeTicket {
    /// Checkpoint the interrupt was recorded at
    pub checkpoint_id: String,
    /// Interrupted assistant message the resumed output follows
    pub message_id: Option<String>,
    pub payload: ResumePayload,
}

#[derive(Debug, Clone, Default)]
pub struct InterruptGate {
    state: GateState,
}

impl InterruptGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> &GateState {
        &self.state
    }

    /// The interrupt awaiting decisions, if any
    pub fn pending(&self) -> Option<&PendingInterrupt> {
        match &self.state {
            GateState::AwaitingDecisions(pending) => Some(pending),
            _ => None,
        }
    }

    pub fn is_awaiting(&self) -> bool {
        matches!(self.state, GateState::AwaitingDecisions(_))
    }

    /// Enter `AwaitingDecisions` for a freshly paused run.
    pub fn open(&mut self, pending: PendingInterrupt) {
        tracing::info!(
            checkpoint_id = %pending.checkpoint_id,
            tool_calls = pending.tool_calls.len(),
            "Awaiting tool call decisions"
        );
        self.state = GateState::AwaitingDecisions(pending);
    }

    fn pending_mut(&mut self) -> Result<&mut PendingInterrupt> {
        match &mut self.state {
            GateState::AwaitingDecisions(pending) => Ok(pending),
            _ => Err(Error::NoPendingInterrupt),
        }
    }

    /// Record a decision, optionally replacing the argument draft.
    pub fn decide(&mut self, tool_call_id: &str, decision: DecisionKind, edited_args: Option<String>) -> Result<()> {
        let call = self.pending_mut()?.call_mut(tool_call_id)?;
        call.decision = decision.into();
        if let Some(draft) = edited_args {
            call.draft = draft;
        }
        Ok(())
    }

    /// Replace a draft without deciding.
    pub fn set_draft(&mut self, tool_call_id: &str, draft: impl Into<String>) -> Result<()> {
        self.pending_mut()?.call_mut(tool_call_id)?.draft = draft.into();
        Ok(())
    }

    /// Validate and move to `Resuming`. On failure the state is unchanged.
    pub fn begin_resume(&mut self) -> Result<ResumeTicket> {
        let pending = self.pending().ok_or(Error::NoPendingInterrupt)?;
        let payload = pending.validate()?;
        let ticket = ResumeTicket {
            checkpoint_id: pending.checkpoint_id.clone(),
            message_id: pending.message_id.clone(),
            payload,
        };
        if let GateState::AwaitingDecisions(pending) = std::mem::take(&mut self.state) {
            self.state = GateState::Resuming(pending);
        }
        Ok(ticket)
    }

    /// Resume handed off; the interrupt is gone.
    pub fn finish_resume(&mut self) {
        if matches!(self.state, GateState::Resuming(_)) {
            self.state = GateState::NoInterrupt;
        }
    }

    /// Resume could not be started; decisions become editable again.
    pub fn revert_resume(&mut self) {
        if let GateState::Resuming(pending) = std::mem::take(&mut self.state) {
            self.state = GateState::AwaitingDecisions(pending);
        }
    }

    /// Drop any interrupt, e.g. because an unrelated run started.
    pub fn abandon(&mut self) -> Option<PendingInterrupt> {
        match std::mem::take(&mut self.state) {
            GateState::NoInterrupt => None,
            GateState::AwaitingDecisions(pending) | GateState::Resuming(pending) => {
                tracing::info!(checkpoint_id = %pending.checkpoint_id, "Abandoning pending interrupt");
                Some(pending)
            }
        }
    }

    /// Rebuild `AwaitingDecisions` after a reload.
    ///
    /// `head` must be the persisted head message in `requires_action`;
    /// `status` is what the engine or interrupt store reports for its
    /// checkpoint. Returns whether an interrupt was restored.
    pub fn rehydrate(&mut self, head: &Message, status: &InterruptStatus) -> bool {
        if !head.status.requires_action() || !status.interrupted {
            return false;
        }
        let Some(checkpoint_id) = head.checkpoint_id.clone() else {
            tracing::warn!(message_id = %head.id, "Interrupted message has no checkpoint");
            return false;
        };

        let payload = match &status.payload {
            Some(payload) if !payload.tool_calls.is_empty() => payload.clone(),
            _ => InterruptPayload {
                tool_calls: head
                    .tool_calls()
                    .filter(|call| !call.is_resolved())
                    .map(|call| ToolCallRequest {
                        id: call.tool_call_id.clone(),
                        name: call.tool_name.clone(),
                        arguments: call.arguments.clone(),
                    })
                    .collect(),
            },
        };
        if payload.tool_calls.is_empty() {
            tracing::warn!(message_id = %head.id, "Interrupt has no tool calls to decide");
            return false;
        }

        tracing::info!(
            message_id = %head.id,
            checkpoint_id = %checkpoint_id,
            "Rehydrated pending interrupt"
        );
        self.state = GateState::AwaitingDecisions(PendingInterrupt::new(
            checkpoint_id,
            Some(head.id.clone()),
            &payload,
        ));
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ContentPart, MessageStatus, Role, ToolCallPart};
    use serde_json::json;

    fn payload() -> InterruptPayload {
        InterruptPayload {
            tool_calls: vec![
                ToolCallRequest {
                    id: "call-1".to_string(),
                    name: "write_file".to_string(),
                    arguments: json!({"path": "a.txt", "body": "x"}),
                },
                ToolCallRequest {
                    id: "call-2".to_string(),
                    name: "delete_file".to_string(),
                    arguments: json!({"path": "b.txt"}),
                },
            ],
        }
    }

    fn awaiting() -> InterruptGate {
        let mut gate = InterruptGate::new();
        gate.open(PendingInterrupt::new("cp-5", Some("a1".to_string()), &payload()));
        gate
    }

    #[test]
    fn test_open_initialises_drafts_and_undecided() {
        let gate = awaiting();
        let pending = gate.pending().unwrap();
        assert_eq!(pending.tool_calls.len(), 2);
        let first = pending.tool_call("call-1").unwrap();
        assert_eq!(first.decision, Decision::Undecided);
        assert_eq!(
            serde_json::from_str::<Value>(&first.draft).unwrap(),
            json!({"path": "a.txt", "body": "x"})
        );
    }

    #[test]
    fn test_submission_requires_every_decision() {
        let mut gate = awaiting();
        gate.decide("call-1", DecisionKind::Approve, None).unwrap();
        let err = gate.begin_resume().unwrap_err();
        assert!(matches!(err, Error::UndecidedToolCalls(ids) if ids == vec!["call-2".to_string()]));
        assert!(gate.is_awaiting());
    }

    #[test]
    fn test_invalid_drafts_block_submission_per_call() {
        let mut gate = awaiting();
        gate.decide("call-1", DecisionKind::Approve, Some("{not json".to_string()))
            .unwrap();
        gate.decide("call-2", DecisionKind::Approve, Some("[1, 2]".to_string()))
            .unwrap();

        let Err(Error::InvalidDecisionArgs { errors }) = gate.begin_resume() else {
            panic!("expected invalid decision args");
        };
        let ids: Vec<_> = errors.iter().map(|e| e.tool_call_id.as_str()).collect();
        assert_eq!(ids, vec!["call-1", "call-2"]);
        assert!(errors[1].message.contains("an array"));
        assert!(gate.is_awaiting());
    }

    #[test]
    fn test_rejected_call_ignores_bad_draft() {
        let mut gate = awaiting();
        gate.decide("call-1", DecisionKind::Approve, Some(r#"{"path": "c.txt"}"#.to_string()))
            .unwrap();
        gate.decide("call-2", DecisionKind::Reject, Some("garbage".to_string()))
            .unwrap();

        let ticket = gate.begin_resume().unwrap();
        assert_eq!(ticket.checkpoint_id, "cp-5");
        assert_eq!(ticket.message_id.as_deref(), Some("a1"));
        assert_eq!(
            serde_json::to_value(&ticket.payload).unwrap(),
            json!({"decisions": [
                {"id": "call-1", "decision": "approve", "arguments": {"path": "c.txt"}},
                {"id": "call-2", "decision": "reject"}
            ]})
        );
        assert!(matches!(gate.state(), GateState::Resuming(_)));

        gate.finish_resume();
        assert_eq!(gate.state(), &GateState::NoInterrupt);
    }

    #[test]
    fn test_revert_resume_restores_decisions() {
        let mut gate = awaiting();
        gate.decide("call-1", DecisionKind::Reject, None).unwrap();
        gate.decide("call-2", DecisionKind::Reject, None).unwrap();
        gate.begin_resume().unwrap();
        gate.revert_resume();
        let pending = gate.pending().unwrap();
        assert_eq!(pending.tool_calls[0].decision, Decision::Rejected);
    }

    #[test]
    fn test_decide_without_interrupt_or_unknown_call() {
        let mut gate = InterruptGate::new();
        assert!(matches!(
            gate.decide("x", DecisionKind::Approve, None),
            Err(Error::NoPendingInterrupt)
        ));
        let mut gate = awaiting();
        assert!(matches!(
            gate.decide("nope", DecisionKind::Approve, None),
            Err(Error::UnknownToolCall(_))
        ));
    }

    #[test]
    fn test_abandon_clears_interrupt() {
        let mut gate = awaiting();
        let dropped = gate.abandon().unwrap();
        assert_eq!(dropped.checkpoint_id, "cp-5");
        assert!(gate.pending().is_none());
        assert!(gate.abandon().is_none());
    }

    fn paused_head() -> Message {
        Message::new(
            Role::Assistant,
            vec![ContentPart::ToolCall(ToolCallPart::new(
                "call-1",
                "write_file",
                json!({"path": "a.txt"}),
            ))],
        )
        .with_id("a1")
        .with_checkpoint("cp-5")
        .with_status(MessageStatus::awaiting_approval())
    }

    #[test]
    fn test_rehydrate_uses_reported_payload() {
        let mut gate = InterruptGate::new();
        let restored = gate.rehydrate(
            &paused_head(),
            &InterruptStatus {
                interrupted: true,
                payload: Some(payload()),
            },
        );
        assert!(restored);
        let pending = gate.pending().unwrap();
        assert_eq!(pending.checkpoint_id, "cp-5");
        assert_eq!(pending.tool_calls.len(), 2);
    }

    #[test]
    fn test_rehydrate_falls_back_to_message_tool_calls() {
        let mut gate = InterruptGate::new();
        assert!(gate.rehydrate(
            &paused_head(),
            &InterruptStatus {
                interrupted: true,
                payload: None,
            },
        ));
        assert_eq!(gate.pending().unwrap().tool_calls[0].id, "call-1");
    }

    #[test]
    fn test_rehydrate_skips_resolved_checkpoint() {
        let mut gate = InterruptGate::new();
        assert!(!gate.rehydrate(&paused_head(), &InterruptStatus::default()));
        assert!(gate.pending().is_none());
    }

    #[test]
    fn test_record_keeps_engine_arguments() {
        let mut gate = awaiting();
        gate.set_draft("call-1", "{}").unwrap();
        let record = gate.pending().unwrap().to_record();
        assert_eq!(
            record.payload.tool_calls[0].arguments,
            json!({"path": "a.txt", "body": "x"})
        );
    }
}
