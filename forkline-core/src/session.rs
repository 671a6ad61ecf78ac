//! Chat session
//!
//! [`ChatSession`] owns one thread and is the entry point for callers: it
//! resolves fork points, starts and drives runs, routes approval decisions and
//! keeps the thread persisted. Graph writes made while streaming are coalesced
//! by a debounce window; terminal run states and user actions are written
//! immediately, and every operation that resolves a checkpoint flushes first.

use crate::config::Config;
use crate::engine::{CancelSignal, EventStream, ExecutionEngine, RunEnvelope, RunId, StreamInput, StreamRequest};
use crate::error::{Error, Result};
use crate::graph::MessageGraph;
use crate::hitl::{InterruptGate, PendingInterrupt};
use crate::resolver::{CheckpointResolver, ForkPlan, ForkPoint};
use crate::run::{Applied, PartsSnapshot, RunCoordinator, RunOutcome, RunStart, RunState};
use crate::store::ThreadStore;
use crate::types::{
    ContentPart, DecisionKind, Message, MessageStatus, Role, RunKind, RunRecord, RunStatus,
    ThreadSnapshot,
};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Notify};
use uuid::Uuid;

/// Finished outcomes kept for handles driven after their run ended.
const RECENT_OUTCOMES: usize = 8;

/// What happened while opening a thread.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadReport {
    /// Messages whose parent was never observed
    pub orphans: Vec<String>,
    /// Messages imported without an id
    pub synthesized_ids: usize,
    /// The persisted head was missing or invalid and was recomputed
    pub head_recomputed: bool,
    /// A pending approval was reconstructed for the head message
    pub interrupt_restored: bool,
}

/// Full-state notifications for a rendering layer.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionUpdate {
    RunStarted { run_id: RunId, kind: RunKind },
    /// Complete part list of the in-flight message
    Streaming(PartsSnapshot),
    RunFinished(RunOutcome),
    HeadChanged { head_id: Option<String> },
    /// Tool calls are waiting on decisions at this checkpoint
    AwaitingDecisions { checkpoint_id: String, tool_call_ids: Vec<String> },
}

/// A started run, ready to be driven.
#[derive(Debug)]
pub struct RunHandle {
    pub run_id: RunId,
    pub kind: RunKind,
    /// Outcome of the run this one superseded, if any
    pub superseded: Option<RunOutcome>,
    stream: EventStream,
    cancel: CancelSignal,
}

impl RunHandle {
    /// Whether the engine has been told to stop this run
    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Default)]
struct AbortSignal {
    requested: AtomicBool,
    notify: Notify,
}

/// Cloneable stop button for whatever run the session is driving.
#[derive(Debug, Clone)]
pub struct AbortHandle {
    signal: Arc<AbortSignal>,
}

impl AbortHandle {
    /// Request an abort. Takes effect at the driver's next wake-up.
    pub fn abort(&self) {
        self.signal.requested.store(true, Ordering::SeqCst);
        self.signal.notify.notify_one();
    }
}

/// Coalesces snapshot writes within a debounce window.
#[derive(Debug)]
struct SnapshotWriter {
    debounce: Duration,
    dirty: bool,
    last_write: Option<Instant>,
}

impl SnapshotWriter {
    fn new(debounce: Duration) -> Self {
        Self {
            debounce,
            dirty: false,
            last_write: None,
        }
    }

    fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    fn is_due(&self, force: bool) -> bool {
        self.dirty
            && (force
                || self
                    .last_write
                    .map_or(true, |at| at.elapsed() >= self.debounce))
    }

    fn written(&mut self) {
        self.dirty = false;
        self.last_write = Some(Instant::now());
    }
}

/// One thread's conversation state plus its collaborators.
pub struct ChatSession {
    thread_id: String,
    graph: MessageGraph,
    resolver: CheckpointResolver,
    coordinator: RunCoordinator,
    gate: InterruptGate,
    store: Arc<dyn ThreadStore>,
    engine: Arc<dyn ExecutionEngine>,
    writer: SnapshotWriter,
    idle_timeout: Duration,
    abort: Arc<AbortSignal>,
    subscribers: Vec<mpsc::UnboundedSender<SessionUpdate>>,
    recent: VecDeque<RunOutcome>,
}

impl std::fmt::Debug for ChatSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatSession")
            .field("thread_id", &self.thread_id)
            .field("messages", &self.graph.len())
            .field("head", &self.graph.head())
            .field("run_state", &self.coordinator.state())
            .finish()
    }
}

impl ChatSession {
    /// Load (or create) a thread and restore any pending approval.
    pub fn open(
        thread_id: impl Into<String>,
        store: Arc<dyn ThreadStore>,
        engine: Arc<dyn ExecutionEngine>,
        config: &Config,
    ) -> Result<(Self, LoadReport)> {
        let thread_id = thread_id.into();
        store.initialize_thread(&thread_id)?;
        let snapshot = store.load_thread(&thread_id)?.unwrap_or_default();
        let (mut graph, import) =
            MessageGraph::import(&snapshot, config.graph.max_admission_passes);

        let mut report = LoadReport {
            orphans: import.orphans,
            synthesized_ids: import.synthesized_ids,
            ..LoadReport::default()
        };
        if graph.head().is_none() && !graph.is_empty() {
            let head = graph.recompute_head().map(str::to_string);
            tracing::warn!(
                thread_id = %thread_id,
                persisted_head = ?import.invalid_head,
                head_id = ?head,
                "Recomputed thread head"
            );
            report.head_recomputed = true;
        }

        let mut session = Self {
            thread_id,
            graph,
            resolver: CheckpointResolver::new(config.resolver.max_ancestor_hops),
            coordinator: RunCoordinator::new(),
            gate: InterruptGate::new(),
            store,
            engine,
            writer: SnapshotWriter::new(config.persistence.debounce()),
            idle_timeout: config.engine.idle_timeout(),
            abort: Arc::new(AbortSignal::default()),
            subscribers: Vec::new(),
            recent: VecDeque::new(),
        };
        report.interrupt_restored = session.refresh_interrupt()?;

        tracing::info!(
            thread_id = %session.thread_id,
            messages = session.graph.len(),
            orphans = report.orphans.len(),
            head_id = ?session.graph.head(),
            interrupt_restored = report.interrupt_restored,
            "Opened thread"
        );
        Ok((session, report))
    }

    // ============================================
    // Read access
    // ============================================

    pub fn thread_id(&self) -> &str {
        &self.thread_id
    }

    pub fn graph(&self) -> &MessageGraph {
        &self.graph
    }

    pub fn head(&self) -> Option<&str> {
        self.graph.head()
    }

    pub fn active_path(&self) -> Vec<&Message> {
        self.graph.active_path()
    }

    pub fn siblings_of(&self, message_id: &str) -> Vec<&Message> {
        self.graph.siblings_of(message_id)
    }

    pub fn run_state(&self) -> RunState {
        self.coordinator.state()
    }

    pub fn gate(&self) -> &InterruptGate {
        &self.gate
    }

    pub fn pending_interrupt(&self) -> Option<&PendingInterrupt> {
        self.gate.pending()
    }

    pub fn export(&self) -> ThreadSnapshot {
        self.graph.export()
    }

    pub fn abort_handle(&self) -> AbortHandle {
        AbortHandle {
            signal: Arc::clone(&self.abort),
        }
    }

    /// Receive every update from now on.
    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<SessionUpdate> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.push(tx);
        rx
    }

    // ============================================
    // Caller operations
    // ============================================

    /// Append a user message under `parent_id` and run the engine on it.
    pub fn send_new(&mut self, parent_id: Option<&str>, content: Vec<ContentPart>) -> Result<RunHandle> {
        self.flush()?;
        let plan = self.resolver.resolve_for_new_message(&self.graph, parent_id)?;
        self.start_with_user_message(RunKind::SendNew, plan, content)
    }

    /// Append a text message under the current head.
    pub fn send_text(&mut self, text: &str) -> Result<RunHandle> {
        let parent = self.graph.head().map(str::to_string);
        self.send_new(parent.as_deref(), vec![ContentPart::text(text)])
    }

    /// Create an edited sibling of user message `source_id` and run from
    /// the state before it.
    pub fn edit(&mut self, source_id: &str, content: Vec<ContentPart>) -> Result<RunHandle> {
        self.flush()?;
        let plan = self.resolver.resolve_for_edit(&self.graph, source_id)?;
        self.start_with_user_message(RunKind::Edit, plan, content)
    }

    /// Produce a new sibling of assistant message `assistant_id`.
    pub fn regenerate(&mut self, assistant_id: &str) -> Result<RunHandle> {
        self.flush()?;
        let plan = self.resolver.resolve_for_regenerate(&self.graph, assistant_id)?;

        // When the user turn itself has no checkpoint the engine never saw it
        // at the fork point, so it is sent again.
        let parent = plan.parent_id.as_deref().and_then(|id| self.graph.get(id));
        let (input, input_message_id) = match parent {
            Some(user)
                if user.role == Role::User
                    && user.checkpoint_id.as_deref() != plan.fork.checkpoint_id() =>
            {
                (StreamInput::Message(user.clone()), Some(user.id.clone()))
            }
            _ => (StreamInput::Continue, None),
        };

        self.start_run(
            RunStart {
                kind: RunKind::Regenerate,
                fork: plan.fork,
                parent_id: plan.parent_id,
                input_message_id,
            },
            input,
        )
    }

    /// Move the head to `message_id`.
    pub fn switch_branch(&mut self, message_id: &str) -> Result<()> {
        if !self.graph.set_head(message_id) {
            return Err(Error::MessageNotFound(message_id.to_string()));
        }
        tracing::debug!(thread_id = %self.thread_id, head_id = message_id, "Switched branch");
        self.writer.mark_dirty();
        self.persist(true)?;
        self.emit(SessionUpdate::HeadChanged {
            head_id: Some(message_id.to_string()),
        });

        if self.coordinator.state() == RunState::Idle {
            let owns_gate = self
                .gate
                .pending()
                .is_some_and(|pending| pending.message_id.as_deref() == Some(message_id));
            if !owns_gate {
                self.gate.abandon();
            }
            self.refresh_interrupt()?;
        }
        Ok(())
    }

    /// Record a decision for one pending tool call.
    pub fn decide(&mut self, tool_call_id: &str, decision: DecisionKind, edited_args: Option<String>) -> Result<()> {
        self.gate.decide(tool_call_id, decision, edited_args)
    }

    /// Resume the interrupted checkpoint with every recorded decision.
    pub fn submit_decisions(&mut self) -> Result<RunHandle> {
        self.flush()?;
        let ticket = self.gate.begin_resume()?;
        let parent_id = ticket
            .message_id
            .clone()
            .or_else(|| self.graph.head().map(str::to_string));

        let start = RunStart {
            kind: RunKind::Resume,
            fork: ForkPoint::Checkpoint(ticket.checkpoint_id.clone()),
            parent_id: parent_id.clone(),
            input_message_id: None,
        };
        let handle = match self.start_run(start, StreamInput::Resume(ticket.payload)) {
            Ok(handle) => handle,
            Err(e) => {
                self.gate.revert_resume();
                return Err(e);
            }
        };

        self.gate.finish_resume();
        self.store.clear_interrupt(&self.thread_id, &ticket.checkpoint_id)?;
        if let Some(mut interrupted) = parent_id.as_deref().and_then(|id| self.graph.get(id)).cloned() {
            if interrupted.status.requires_action() {
                interrupted.status = MessageStatus::Complete;
                let parent = interrupted.parent_id.clone();
                self.graph.add_or_update(parent.as_deref(), interrupted);
                self.writer.mark_dirty();
            }
        }
        Ok(handle)
    }

    /// Stop the active run now, keeping its partial content.
    pub fn abort(&mut self) -> Result<Option<RunOutcome>> {
        match self.coordinator.abort(&mut self.graph) {
            Some(outcome) => {
                self.on_finished(&outcome)?;
                Ok(Some(outcome))
            }
            None => Ok(None),
        }
    }

    /// Pump a run's stream until it ends.
    ///
    /// Engine and transport failures come back as an `Errored` outcome. An
    /// idle period longer than the configured timeout counts as a transport
    /// failure.
    pub async fn drive(&mut self, handle: RunHandle) -> Result<RunOutcome> {
        let RunHandle {
            run_id, mut stream, ..
        } = handle;
        let signal = Arc::clone(&self.abort);

        loop {
            if self.coordinator.active_run_id() != Some(run_id) {
                return self.finished_outcome(run_id);
            }

            let next = tokio::select! {
                biased;
                _ = signal.notify.notified() => {
                    if signal.requested.swap(false, Ordering::SeqCst) {
                        if let Some(outcome) = self.abort()? {
                            return Ok(outcome);
                        }
                    }
                    continue;
                }
                next = tokio::time::timeout(self.idle_timeout, stream.recv()) => next,
            };

            let finished = match next {
                Ok(Some(Ok(envelope))) => self.apply_envelope(envelope)?,
                Ok(Some(Err(e))) => self.fail_run(run_id, &e)?,
                Ok(None) => {
                    let outcome = self.coordinator.stream_ended(&mut self.graph, run_id);
                    self.record(outcome)?
                }
                Err(_) => {
                    let e = Error::Transport(format!(
                        "no event within {}s",
                        self.idle_timeout.as_secs_f64()
                    ));
                    self.fail_run(run_id, &e)?
                }
            };
            if let Some(outcome) = finished {
                if outcome.run_id == run_id {
                    return Ok(outcome);
                }
            }
        }
    }

    /// Apply one envelope from a transport the caller owns.
    ///
    /// Returns the outcome when the envelope ended the run.
    pub fn apply_envelope(&mut self, envelope: RunEnvelope) -> Result<Option<RunOutcome>> {
        match self.coordinator.apply(&mut self.graph, envelope) {
            Applied::Dropped => Ok(None),
            Applied::Unchanged => {
                self.writer.mark_dirty();
                self.persist_streaming();
                Ok(None)
            }
            Applied::Snapshot(snapshot) => {
                self.writer.mark_dirty();
                self.persist_streaming();
                self.emit(SessionUpdate::Streaming(snapshot));
                Ok(None)
            }
            Applied::Finished(outcome) => {
                self.on_finished(&outcome)?;
                Ok(Some(outcome))
            }
        }
    }

    /// Write any pending snapshot now.
    pub fn flush(&mut self) -> Result<()> {
        self.persist(true)
    }

    // ============================================
    // Run lifecycle
    // ============================================

    fn start_with_user_message(
        &mut self,
        kind: RunKind,
        plan: ForkPlan,
        content: Vec<ContentPart>,
    ) -> Result<RunHandle> {
        let user = Message::new(Role::User, content).with_parent(plan.parent_id.clone());
        let user_id = user.id.clone();
        self.graph.add_or_update(plan.parent_id.as_deref(), user.clone());
        self.graph.set_head(&user_id);
        self.writer.mark_dirty();

        self.start_run(
            RunStart {
                kind,
                fork: plan.fork,
                parent_id: Some(user_id.clone()),
                input_message_id: Some(user_id),
            },
            StreamInput::Message(user),
        )
    }

    fn start_run(&mut self, start: RunStart, input: StreamInput) -> Result<RunHandle> {
        let kind = start.kind;
        if kind != RunKind::Resume && self.gate.abandon().is_some() {
            tracing::info!(thread_id = %self.thread_id, "New run replaces pending approval");
        }
        let checkpoint_id = start.fork.checkpoint_id().map(str::to_string);

        let (run_id, cancel, superseded) = self.coordinator.begin(&mut self.graph, start);
        if let Some(outcome) = &superseded {
            self.on_finished(outcome)?;
        }
        self.signal_reset();

        let request = StreamRequest {
            run_id,
            thread_id: self.thread_id.clone(),
            checkpoint_id,
            input,
        };
        let stream = match self.engine.stream_run(request, Arc::clone(&cancel)) {
            Ok(stream) => stream,
            Err(e) => {
                let outcome = self.coordinator.refuse(&mut self.graph, run_id, &e);
                self.record(outcome)?;
                return Err(e);
            }
        };

        self.writer.mark_dirty();
        self.persist(true)?;
        self.emit(SessionUpdate::RunStarted { run_id, kind });
        self.emit(SessionUpdate::HeadChanged {
            head_id: self.graph.head().map(str::to_string),
        });

        Ok(RunHandle {
            run_id,
            kind,
            superseded,
            stream,
            cancel,
        })
    }

    fn signal_reset(&self) {
        self.abort.requested.store(false, Ordering::SeqCst);
    }

    fn fail_run(&mut self, run_id: RunId, error: &Error) -> Result<Option<RunOutcome>> {
        let outcome = self.coordinator.fail(&mut self.graph, run_id, error);
        self.record(outcome)
    }

    fn record(&mut self, outcome: Option<RunOutcome>) -> Result<Option<RunOutcome>> {
        if let Some(outcome) = &outcome {
            self.on_finished(outcome)?;
        }
        Ok(outcome)
    }

    fn finished_outcome(&self, run_id: RunId) -> Result<RunOutcome> {
        self.recent
            .iter()
            .rev()
            .find(|outcome| outcome.run_id == run_id)
            .cloned()
            .ok_or_else(|| Error::InvalidOperation(format!("run {run_id} is not active")))
    }

    /// Publish a terminal outcome, then persist it.
    ///
    /// In-memory state settles before any store write. The audit record is
    /// attempted even when the snapshot write fails.
    fn on_finished(&mut self, outcome: &RunOutcome) -> Result<()> {
        let mut interrupt_record = None;
        if outcome.status == RunStatus::Interrupted {
            if let (Some(checkpoint_id), Some(payload)) =
                (outcome.result_checkpoint_id.as_deref(), outcome.interrupt.as_ref())
            {
                let pending =
                    PendingInterrupt::new(checkpoint_id, outcome.message_id.clone(), payload);
                interrupt_record = Some(pending.to_record());
                self.emit(SessionUpdate::AwaitingDecisions {
                    checkpoint_id: checkpoint_id.to_string(),
                    tool_call_ids: payload.tool_calls.iter().map(|call| call.id.clone()).collect(),
                });
                self.gate.open(pending);
            }
        }

        if outcome.is_error() {
            tracing::warn!(
                thread_id = %self.thread_id,
                run_id = outcome.run_id,
                error = ?outcome.error,
                "Run ended with an error"
            );
        }

        self.recent.push_back(outcome.clone());
        while self.recent.len() > RECENT_OUTCOMES {
            self.recent.pop_front();
        }
        self.emit(SessionUpdate::RunFinished(outcome.clone()));

        let interrupt_saved = match &interrupt_record {
            Some(record) => self.store.save_interrupt(&self.thread_id, record),
            None => Ok(()),
        };
        self.writer.mark_dirty();
        let snapshot_saved = self.persist(true);
        let audited = self.store.append_run(&RunRecord {
            id: Uuid::new_v4().to_string(),
            thread_id: self.thread_id.clone(),
            kind: outcome.kind,
            status: outcome.status,
            fork_checkpoint_id: outcome.fork_checkpoint_id.clone(),
            result_checkpoint_id: outcome.result_checkpoint_id.clone(),
            message_id: outcome.message_id.clone(),
            error: outcome.error.clone(),
            started_at: outcome.started_at,
            finished_at: outcome.finished_at,
        });
        interrupt_saved.and(snapshot_saved).and(audited)
    }

    /// Rebuild the approval gate when the head is paused on tool calls.
    ///
    /// The engine's answer wins; when it cannot answer, the persisted
    /// interrupt record decides.
    fn refresh_interrupt(&mut self) -> Result<bool> {
        let Some(head) = self.graph.head_message().cloned() else {
            return Ok(false);
        };
        if !head.status.requires_action() {
            return Ok(false);
        }
        if self
            .gate
            .pending()
            .is_some_and(|pending| pending.message_id.as_deref() == Some(head.id.as_str()))
        {
            return Ok(true);
        }
        let Some(checkpoint_id) = head.checkpoint_id.clone() else {
            tracing::warn!(message_id = %head.id, "Paused message has no checkpoint");
            return Ok(false);
        };

        let status = match self.engine.query_interrupt(&self.thread_id, &checkpoint_id) {
            Ok(Some(status)) => {
                if !status.interrupted {
                    self.store.clear_interrupt(&self.thread_id, &checkpoint_id)?;
                }
                status
            }
            Ok(None) => self
                .store
                .query_interrupt_status(&self.thread_id, &checkpoint_id)?,
            Err(e) => {
                tracing::warn!(error = %e, checkpoint_id = %checkpoint_id, "Engine interrupt query failed");
                self.store
                    .query_interrupt_status(&self.thread_id, &checkpoint_id)?
            }
        };

        let restored = self.gate.rehydrate(&head, &status);
        if let Some(pending) = self.gate.pending() {
            self.emit(SessionUpdate::AwaitingDecisions {
                checkpoint_id: pending.checkpoint_id.clone(),
                tool_call_ids: pending.tool_calls.iter().map(|call| call.id.clone()).collect(),
            });
        }
        Ok(restored)
    }

    fn persist(&mut self, force: bool) -> Result<()> {
        if !self.writer.is_due(force) {
            return Ok(());
        }
        self.store.save_thread(&self.thread_id, &self.graph.export())?;
        self.writer.written();
        Ok(())
    }

    /// Mid-stream writes stay pending on failure and are retried by the next
    /// event or the terminal write.
    fn persist_streaming(&mut self) {
        if let Err(e) = self.persist(false) {
            tracing::warn!(thread_id = %self.thread_id, error = %e, "Deferred snapshot write failed");
        }
    }

    fn emit(&mut self, update: SessionUpdate) {
        self.subscribers.retain(|tx| tx.send(update.clone()).is_ok());
    }
}

impl Drop for ChatSession {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            tracing::warn!(thread_id = %self.thread_id, error = %e, "Failed to flush thread on close");
        }
    }
}
