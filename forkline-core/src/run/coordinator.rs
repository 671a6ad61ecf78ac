//! Run coordinator
//!
//! Owns at most one active run per thread. Starting a run supersedes the
//! previous one: its cancel flag is raised, its message is kept as
//! `incomplete(cancelled)`, and any event still arriving under its run id is
//! dropped. Within a run, only strictly increasing sequence numbers apply.

use super::reconciler::{Change, TokenReconciler, ToolOutcome};
use crate::engine::{CancelSignal, DoneStatus, EngineEvent, MetaPhase, RunEnvelope, RunId};
use crate::error::Error;
use crate::graph::MessageGraph;
use crate::resolver::ForkPoint;
use crate::types::{
    ContentPart, InterruptPayload, Message, MessageStatus, Role, RunKind, RunStatus,
};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use uuid::Uuid;

/// Coordinator state as seen by callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Running,
}

/// Parameters for starting a run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunStart {
    pub kind: RunKind,
    pub fork: ForkPoint,
    /// Graph parent of the assistant message this run produces
    pub parent_id: Option<String>,
    /// User message fed to the engine, stamped with the start checkpoint
    pub input_message_id: Option<String>,
}

/// How a run ended.
#[derive(Debug, Clone, PartialEq)]
pub struct RunOutcome {
    pub run_id: RunId,
    pub kind: RunKind,
    pub status: RunStatus,
    /// Assistant message the run streamed into
    pub message_id: Option<String>,
    pub fork_checkpoint_id: Option<String>,
    /// Latest checkpoint the engine reported for this run
    pub result_checkpoint_id: Option<String>,
    /// Present when the run paused on an approval
    pub interrupt: Option<InterruptPayload>,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl RunOutcome {
    pub fn is_error(&self) -> bool {
        self.status == RunStatus::Errored
    }
}

/// Full-state view of the in-flight message after a change.
#[derive(Debug, Clone, PartialEq)]
pub struct PartsSnapshot {
    pub run_id: RunId,
    pub message_id: String,
    pub parts: Arc<Vec<ContentPart>>,
    /// Tool results whose calls are not part of this message
    pub early_results: Arc<BTreeMap<String, ToolOutcome>>,
}

/// Result of feeding one envelope to the coordinator.
#[derive(Debug, Clone, PartialEq)]
pub enum Applied {
    /// Stale run id or non-increasing sequence
    Dropped,
    /// Accepted, nothing visible changed
    Unchanged,
    /// Accepted and the in-flight message changed
    Snapshot(PartsSnapshot),
    /// Accepted and the run is over
    Finished(RunOutcome),
}

#[derive(Debug)]
struct ActiveRun {
    run_id: RunId,
    kind: RunKind,
    fork: ForkPoint,
    parent_id: Option<String>,
    input_message_id: Option<String>,
    last_sequence: u64,
    cancel: CancelSignal,
    reconciler: TokenReconciler,
    /// Whether the assistant message exists in the graph yet
    materialized: bool,
    /// The engine never opened a stream
    refused: bool,
    result_checkpoint: Option<String>,
    interrupt_checkpoint: Option<String>,
    interrupt: Option<InterruptPayload>,
    started_at: DateTime<Utc>,
}

/// Single-run state machine for one thread.
#[derive(Debug)]
pub struct RunCoordinator {
    next_run_id: RunId,
    active: Option<ActiveRun>,
    last_status: Option<RunStatus>,
}

impl Default for RunCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

/// Random 52-bit starting point for a coordinator's run ids.
fn run_id_base() -> RunId {
    (Uuid::new_v4().as_u128() >> 76) as RunId
}

impl RunCoordinator {
    pub fn new() -> Self {
        Self {
            next_run_id: run_id_base(),
            active: None,
            last_status: None,
        }
    }

    pub fn state(&self) -> RunState {
        if self.active.is_some() {
            RunState::Running
        } else {
            RunState::Idle
        }
    }

    pub fn active_run_id(&self) -> Option<RunId> {
        self.active.as_ref().map(|run| run.run_id)
    }

    /// Terminal status of the most recently finished run
    pub fn last_status(&self) -> Option<RunStatus> {
        self.last_status
    }

    /// Id of the assistant message the active run streams into, once known
    pub fn active_message_id(&self) -> Option<&str> {
        self.active
            .as_ref()
            .filter(|run| run.materialized)
            .and_then(|run| run.reconciler.message_id())
    }

    /// Start a new run, superseding any active one.
    ///
    /// Returns the new run id, its cancel flag, and the outcome of the run it
    /// replaced.
    pub fn begin(
        &mut self,
        graph: &mut MessageGraph,
        start: RunStart,
    ) -> (RunId, CancelSignal, Option<RunOutcome>) {
        let superseded = if self.active.is_some() {
            tracing::info!(run_id = ?self.active_run_id(), "Superseding active run");
            self.finish(graph, RunStatus::Aborted, None)
        } else {
            None
        };

        // The new message becomes the head once it exists.
        if let Some(parent) = start.parent_id.as_deref() {
            graph.set_head(parent);
        }

        self.next_run_id += 1;
        let run_id = self.next_run_id;
        let cancel: CancelSignal = Arc::new(AtomicBool::new(false));

        tracing::info!(
            run_id,
            kind = start.kind.as_str(),
            checkpoint_id = ?start.fork.checkpoint_id(),
            parent_id = ?start.parent_id,
            "Run started"
        );

        self.active = Some(ActiveRun {
            run_id,
            kind: start.kind,
            fork: start.fork,
            parent_id: start.parent_id,
            input_message_id: start.input_message_id,
            last_sequence: 0,
            cancel: Arc::clone(&cancel),
            reconciler: TokenReconciler::new(),
            materialized: false,
            refused: false,
            result_checkpoint: None,
            interrupt_checkpoint: None,
            interrupt: None,
            started_at: Utc::now(),
        });

        (run_id, cancel, superseded)
    }

    /// Whether `envelope` belongs to the active run and advances its sequence.
    fn accept(&mut self, envelope: &RunEnvelope) -> bool {
        let Some(run) = self.active.as_mut() else {
            tracing::debug!(run_id = envelope.run_id, sequence = envelope.sequence, "Dropping event with no active run");
            return false;
        };
        if envelope.run_id != run.run_id {
            tracing::debug!(
                run_id = envelope.run_id,
                active_run_id = run.run_id,
                "Dropping event from superseded run"
            );
            return false;
        }
        if envelope.sequence <= run.last_sequence {
            tracing::debug!(
                run_id = envelope.run_id,
                sequence = envelope.sequence,
                last_sequence = run.last_sequence,
                "Dropping out-of-order event"
            );
            return false;
        }
        run.last_sequence = envelope.sequence;
        true
    }

    /// Apply one envelope from the engine stream.
    pub fn apply(&mut self, graph: &mut MessageGraph, envelope: RunEnvelope) -> Applied {
        if !self.accept(&envelope) {
            return Applied::Dropped;
        }
        let Some(run) = self.active.as_mut() else {
            return Applied::Dropped;
        };

        match envelope.event {
            EngineEvent::Meta {
                phase,
                checkpoint_id,
            } => {
                match phase {
                    MetaPhase::Start => {
                        if let Some(input_id) = run.input_message_id.as_deref() {
                            stamp_checkpoint(graph, input_id, &checkpoint_id);
                        }
                    }
                    MetaPhase::Interrupt => {
                        run.interrupt_checkpoint = Some(checkpoint_id.clone());
                        run.result_checkpoint = Some(checkpoint_id);
                    }
                    MetaPhase::Complete => run.result_checkpoint = Some(checkpoint_id),
                }
                Applied::Unchanged
            }
            EngineEvent::Interrupt { tool_calls } => {
                for call in &tool_calls {
                    run.reconciler.apply(&EngineEvent::ToolCall {
                        id: call.id.clone(),
                        name: call.name.clone(),
                        arguments: call.arguments.clone(),
                    });
                }
                run.interrupt = Some(InterruptPayload { tool_calls });
                Self::publish(graph, run)
            }
            EngineEvent::Done { status } => {
                let terminal = match status {
                    DoneStatus::Cancelled => RunStatus::Aborted,
                    DoneStatus::Interrupted => RunStatus::Interrupted,
                    DoneStatus::Complete if run.interrupt.is_some() => RunStatus::Interrupted,
                    DoneStatus::Complete => RunStatus::Complete,
                };
                self.finish_applied(graph, terminal, None)
            }
            EngineEvent::Error { message } => {
                let error = Error::Engine(message).to_string();
                self.finish_applied(graph, RunStatus::Errored, Some(error))
            }
            EngineEvent::MessageId { id }
                if run.reconciler.message_id() != Some(id.as_str()) && id_in_use(graph, &id) =>
            {
                tracing::warn!(
                    run_id = run.run_id,
                    message_id = %id,
                    "Ignoring engine message id that names an existing message"
                );
                Applied::Unchanged
            }
            event => match run.reconciler.apply(&event) {
                Change::None => Applied::Unchanged,
                Change::Parts => Self::publish(graph, run),
                Change::EarlyResult { tool_call_id } => {
                    backfill_ancestor(graph, run, &tool_call_id);
                    Self::publish(graph, run)
                }
                Change::Retarget { from, to } => {
                    if run.materialized {
                        if let Err(e) = graph.retarget(&from, &to) {
                            tracing::warn!(error = %e, from = %from, to = %to, "Could not retarget streamed message");
                            run.reconciler.restore_id(&from);
                        }
                    }
                    Self::publish(graph, run)
                }
            },
        }
    }

    /// Transport failure or timeout on the active run.
    pub fn fail(&mut self, graph: &mut MessageGraph, run_id: RunId, error: &Error) -> Option<RunOutcome> {
        if self.active_run_id() != Some(run_id) {
            return None;
        }
        tracing::warn!(run_id, error = %error, "Run failed");
        self.finish(graph, RunStatus::Errored, Some(error.to_string()))
    }

    /// The stream closed. Without a terminal event this is a failure.
    pub fn stream_ended(&mut self, graph: &mut MessageGraph, run_id: RunId) -> Option<RunOutcome> {
        if self.active_run_id() != Some(run_id) {
            return None;
        }
        let error = Error::Transport("stream ended without a terminal event".to_string());
        self.fail(graph, run_id, &error)
    }

    /// The engine refused to open a stream for the active run.
    ///
    /// Nothing was produced, so no assistant message is written.
    pub fn refuse(&mut self, graph: &mut MessageGraph, run_id: RunId, error: &Error) -> Option<RunOutcome> {
        let run = self.active.as_mut().filter(|run| run.run_id == run_id)?;
        run.refused = true;
        tracing::warn!(run_id, error = %error, "Engine refused run");
        self.finish(graph, RunStatus::Errored, Some(error.to_string()))
    }

    /// User-initiated stop. Partial content is kept as `incomplete(cancelled)`.
    pub fn abort(&mut self, graph: &mut MessageGraph) -> Option<RunOutcome> {
        self.active.as_ref()?;
        tracing::info!(run_id = ?self.active_run_id(), "Run aborted");
        self.finish(graph, RunStatus::Aborted, None)
    }

    fn finish_applied(&mut self, graph: &mut MessageGraph, status: RunStatus, error: Option<String>) -> Applied {
        match self.finish(graph, status, error) {
            Some(outcome) => Applied::Finished(outcome),
            None => Applied::Unchanged,
        }
    }

    fn finish(
        &mut self,
        graph: &mut MessageGraph,
        mut status: RunStatus,
        mut error: Option<String>,
    ) -> Option<RunOutcome> {
        let mut run = self.active.take()?;
        run.cancel.store(true, Ordering::SeqCst);

        let checkpoint = if status == RunStatus::Interrupted {
            match run.interrupt_checkpoint.clone().or_else(|| run.result_checkpoint.clone()) {
                Some(cp) if run.interrupt.is_some() => Some(cp),
                _ => {
                    status = RunStatus::Errored;
                    error = Some(
                        Error::Engine("interrupt without a payload and checkpoint".to_string())
                            .to_string(),
                    );
                    run.result_checkpoint.clone()
                }
            }
        } else {
            run.result_checkpoint.clone()
        };

        let message_status = match status {
            RunStatus::Complete => MessageStatus::Complete,
            RunStatus::Interrupted => MessageStatus::awaiting_approval(),
            RunStatus::Errored => MessageStatus::error(error.clone().unwrap_or_default()),
            RunStatus::Aborted => MessageStatus::cancelled(),
        };
        // An aborted or refused run that produced nothing leaves no node behind.
        let message_id = if !run.materialized && (status == RunStatus::Aborted || run.refused) {
            None
        } else {
            Some(write_message(graph, &mut run, message_status, checkpoint))
        };

        let outcome = RunOutcome {
            run_id: run.run_id,
            kind: run.kind,
            status,
            message_id,
            fork_checkpoint_id: run.fork.checkpoint_id().map(str::to_string),
            result_checkpoint_id: if status == RunStatus::Interrupted {
                run.interrupt_checkpoint.clone().or(run.result_checkpoint.clone())
            } else {
                run.result_checkpoint.clone()
            },
            interrupt: if status == RunStatus::Interrupted {
                run.interrupt.take()
            } else {
                None
            },
            error,
            started_at: run.started_at,
            finished_at: Utc::now(),
        };

        tracing::info!(
            run_id = outcome.run_id,
            status = outcome.status.as_str(),
            message_id = ?outcome.message_id,
            checkpoint_id = ?outcome.result_checkpoint_id,
            "Run finished"
        );
        self.last_status = Some(status);
        Some(outcome)
    }

    fn publish(graph: &mut MessageGraph, run: &mut ActiveRun) -> Applied {
        let message_id = write_message(graph, run, MessageStatus::Running, None);
        Applied::Snapshot(PartsSnapshot {
            run_id: run.run_id,
            message_id,
            parts: run.reconciler.parts(),
            early_results: run.reconciler.early_results(),
        })
    }
}

/// Write the run's assistant message into the graph, creating it on first use.
///
/// The head follows a newly created message only while it still points at the
/// message's parent, so a user who switched branches mid-stream stays put.
fn write_message(
    graph: &mut MessageGraph,
    run: &mut ActiveRun,
    status: MessageStatus,
    checkpoint_id: Option<String>,
) -> String {
    let id = run.reconciler.ensure_id().to_string();
    let created_at = graph
        .get(&id)
        .map(|existing| existing.created_at)
        .unwrap_or_else(Utc::now);
    let message = Message {
        id: id.clone(),
        role: Role::Assistant,
        content: run.reconciler.parts().as_ref().clone(),
        parent_id: run.parent_id.clone(),
        checkpoint_id,
        status,
        created_at,
    };
    graph.add_or_update(run.parent_id.as_deref(), message);

    if !run.materialized {
        run.materialized = true;
        if graph.head() == run.parent_id.as_deref() || graph.head().is_none() {
            graph.set_head(&id);
        }
    }
    id
}

/// Whether `id` names a message already stored, admitted or parked.
fn id_in_use(graph: &MessageGraph, id: &str) -> bool {
    graph.contains(id) || graph.orphans().iter().any(|message| message.id == id)
}

fn stamp_checkpoint(graph: &mut MessageGraph, message_id: &str, checkpoint_id: &str) {
    let Some(mut message) = graph.get(message_id).cloned() else {
        return;
    };
    if message.checkpoint_id.as_deref() == Some(checkpoint_id) {
        return;
    }
    message.checkpoint_id = Some(checkpoint_id.to_string());
    let parent = message.parent_id.clone();
    graph.add_or_update(parent.as_deref(), message);
}

/// Attach a side-channel result to the nearest ancestor holding that call.
///
/// Resumed runs receive results for calls that were streamed into the
/// interrupted message rather than the new one.
fn backfill_ancestor(graph: &mut MessageGraph, run: &mut ActiveRun, tool_call_id: &str) {
    let Some(outcome) = run.reconciler.early_results().get(tool_call_id).cloned() else {
        return;
    };
    let mut cursor = run.parent_id.clone();
    while let Some(id) = cursor {
        let Some(mut message) = graph.get(&id).cloned() else {
            return;
        };
        let mut found = false;
        for part in &mut message.content {
            if let ContentPart::ToolCall(call) = part {
                if call.tool_call_id == tool_call_id {
                    call.result = Some(outcome.result.clone());
                    call.is_error = outcome.is_error;
                    found = true;
                }
            }
        }
        if found {
            let parent = message.parent_id.clone();
            graph.add_or_update(parent.as_deref(), message);
            run.reconciler.take_early_result(tool_call_id);
            tracing::debug!(tool_call_id, message_id = %id, "Backfilled tool result onto earlier message");
            return;
        }
        if message.role != Role::Assistant {
            return;
        }
        cursor = message.parent_id;
    }
}
