//! Deterministic scripted engine.
//!
//! Replays queued [`Script`]s, allocates checkpoint ids, and records every
//! request it receives. Used by tests, the demo command and local runs.

use super::{
    CancelSignal, DoneStatus, EngineEvent, EventStream, ExecutionEngine, MetaPhase, RunEnvelope,
    StreamInput, StreamRequest,
};
use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::lock_unpoisoned;
use crate::types::{
    DecisionKind, InterruptPayload, InterruptStatus, ToolCallRequest, REJECTED_TOOL_RESULT,
};
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::Ordering;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;

/// One scripted action.
#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    /// Send this event as-is
    Emit(EngineEvent),
    /// Allocate a fresh checkpoint and send `meta` for it
    Checkpoint(MetaPhase),
    /// Fail the transport with this message and end the stream
    TransportFailure(String),
    /// Go quiet until cancelled
    Hang,
}

/// Ordered steps for one run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Script {
    steps: Vec<Step>,
}

impl Script {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start checkpoint, the text word by word, completion checkpoint, done.
    pub fn reply(text: &str) -> Self {
        Self::new().start().text(text).complete()
    }

    /// Start checkpoint, optional lead-in text, then pause on `tool_calls`.
    pub fn interrupt(lead_in: &str, tool_calls: Vec<ToolCallRequest>) -> Self {
        let mut script = Self::new().start();
        if !lead_in.is_empty() {
            script = script.text(lead_in);
        }
        for call in &tool_calls {
            script = script.event(EngineEvent::ToolCall {
                id: call.id.clone(),
                name: call.name.clone(),
                arguments: call.arguments.clone(),
            });
        }
        script
            .event(EngineEvent::Interrupt { tool_calls })
            .step(Step::Checkpoint(MetaPhase::Interrupt))
            .event(EngineEvent::Done {
                status: DoneStatus::Interrupted,
            })
    }

    /// Start checkpoint, optional partial text, then an engine error.
    pub fn error(partial: &str, message: &str) -> Self {
        let mut script = Self::new().start();
        if !partial.is_empty() {
            script = script.text(partial);
        }
        script.event(EngineEvent::Error {
            message: message.to_string(),
        })
    }

    pub fn step(mut self, step: Step) -> Self {
        self.steps.push(step);
        self
    }

    pub fn event(self, event: EngineEvent) -> Self {
        self.step(Step::Emit(event))
    }

    pub fn start(self) -> Self {
        self.step(Step::Checkpoint(MetaPhase::Start))
    }

    /// Text split into word-sized deltas (whitespace kept with the word).
    pub fn text(mut self, text: &str) -> Self {
        for token in split_tokens(text) {
            self = self.event(EngineEvent::TextDelta { text: token });
        }
        self
    }

    pub fn message_id(self, id: &str) -> Self {
        self.event(EngineEvent::MessageId { id: id.to_string() })
    }

    pub fn tool_call(self, id: &str, name: &str, arguments: Value) -> Self {
        self.event(EngineEvent::ToolCall {
            id: id.to_string(),
            name: name.to_string(),
            arguments,
        })
    }

    pub fn tool_result(self, tool_call_id: &str, result: Value, is_error: bool) -> Self {
        self.event(EngineEvent::ToolResult {
            tool_call_id: tool_call_id.to_string(),
            result,
            is_error,
        })
    }

    /// Completion checkpoint followed by `done`.
    pub fn complete(self) -> Self {
        self.step(Step::Checkpoint(MetaPhase::Complete))
            .event(EngineEvent::Done {
                status: DoneStatus::Complete,
            })
    }

    pub fn hang(self) -> Self {
        self.step(Step::Hang)
    }

    pub fn transport_failure(self, message: &str) -> Self {
        self.step(Step::TransportFailure(message.to_string()))
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }
}

fn split_tokens(text: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut pending = String::new();
    for ch in text.chars() {
        pending.push(ch);
        if ch.is_whitespace() {
            tokens.push(std::mem::take(&mut pending));
        }
    }
    if !pending.is_empty() {
        tokens.push(pending);
    }
    tokens
}

#[derive(Debug, Default)]
struct ScriptState {
    scripts: VecDeque<Script>,
    requests: Vec<StreamRequest>,
    next_checkpoint: u64,
    /// Paused checkpoints per (thread, checkpoint)
    paused: HashMap<(String, String), InterruptPayload>,
}

impl ScriptState {
    fn allocate_checkpoint(&mut self) -> String {
        self.next_checkpoint += 1;
        format!("cp-{}", self.next_checkpoint)
    }
}

/// Deterministic in-process engine.
#[derive(Debug)]
pub struct ScriptedEngine {
    state: Mutex<ScriptState>,
    buffer: usize,
    event_delay: Option<Duration>,
}

impl Default for ScriptedEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedEngine {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ScriptState::default()),
            buffer: 64,
            event_delay: None,
        }
    }

    /// Engine whose event channel holds `stream_buffer` envelopes.
    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new().with_buffer(config.stream_buffer)
    }

    /// Pause between events, to exercise streaming from the caller's side.
    pub fn with_event_delay(mut self, delay: Duration) -> Self {
        self.event_delay = Some(delay);
        self
    }

    pub fn with_buffer(mut self, buffer: usize) -> Self {
        self.buffer = buffer.max(1);
        self
    }

    /// Queue a script for the next run that has none of its own.
    pub fn push(&self, script: Script) {
        lock_unpoisoned(&self.state).scripts.push_back(script);
    }

    /// Every request received so far, oldest first
    pub fn requests(&self) -> Vec<StreamRequest> {
        lock_unpoisoned(&self.state).requests.clone()
    }

    pub fn last_request(&self) -> Option<StreamRequest> {
        lock_unpoisoned(&self.state).requests.last().cloned()
    }

    /// Fallback script when nothing is queued.
    fn default_script(input: &StreamInput) -> Script {
        match input {
            StreamInput::Message(message) => Script::reply(&format!("You said: {}", message.text())),
            StreamInput::Continue => Script::reply("Here is another take."),
            StreamInput::Resume(payload) => {
                let mut script = Script::new().start();
                for decision in &payload.decisions {
                    script = match decision.decision {
                        DecisionKind::Approve => script.tool_result(
                            &decision.id,
                            json!({
                                "status": "ok",
                                "arguments": decision.arguments.clone().unwrap_or(Value::Null),
                            }),
                            false,
                        ),
                        DecisionKind::Reject => {
                            script.tool_result(&decision.id, json!(REJECTED_TOOL_RESULT), true)
                        }
                    };
                }
                script.text("Done.").complete()
            }
        }
    }
}

impl ExecutionEngine for ScriptedEngine {
    fn stream_run(&self, request: StreamRequest, cancel: CancelSignal) -> Result<EventStream> {
        let script = {
            let mut state = lock_unpoisoned(&self.state);
            if let (StreamInput::Resume(_), Some(checkpoint)) =
                (&request.input, request.checkpoint_id.as_ref())
            {
                let key = (request.thread_id.clone(), checkpoint.clone());
                if state.paused.remove(&key).is_none() {
                    return Err(Error::Engine(format!(
                        "checkpoint {checkpoint} is not awaiting a resume"
                    )));
                }
            }
            state.requests.push(request.clone());
            state
                .scripts
                .pop_front()
                .unwrap_or_else(|| Self::default_script(&request.input))
        };

        tracing::debug!(
            run_id = request.run_id,
            thread_id = %request.thread_id,
            checkpoint_id = ?request.checkpoint_id,
            input = request.input.kind(),
            steps = script.steps.len(),
            "Scripted run starting"
        );

        // Checkpoints are allocated up front so the sender task owns no lock.
        let mut pending_interrupt: Option<InterruptPayload> = None;
        let mut outgoing = Vec::with_capacity(script.steps.len());
        {
            let mut state = lock_unpoisoned(&self.state);
            for step in script.steps {
                match step {
                    Step::Checkpoint(phase) => {
                        let checkpoint_id = state.allocate_checkpoint();
                        if phase == MetaPhase::Interrupt {
                            if let Some(payload) = pending_interrupt.take() {
                                state.paused.insert(
                                    (request.thread_id.clone(), checkpoint_id.clone()),
                                    payload,
                                );
                            }
                        }
                        outgoing.push(Step::Emit(EngineEvent::Meta {
                            phase,
                            checkpoint_id,
                        }));
                    }
                    Step::Emit(EngineEvent::Interrupt { tool_calls }) => {
                        pending_interrupt = Some(InterruptPayload {
                            tool_calls: tool_calls.clone(),
                        });
                        outgoing.push(Step::Emit(EngineEvent::Interrupt { tool_calls }));
                    }
                    other => outgoing.push(other),
                }
            }
        }

        let (tx, rx) = mpsc::channel(self.buffer);
        let run_id = request.run_id;
        let delay = self.event_delay;
        tokio::spawn(async move {
            let mut sequence = 0;
            for step in outgoing {
                if cancel.load(Ordering::SeqCst) {
                    tracing::debug!(run_id, "Scripted run cancelled");
                    return;
                }
                match step {
                    Step::Emit(event) => {
                        sequence += 1;
                        if tx.send(Ok(RunEnvelope::new(run_id, sequence, event))).await.is_err() {
                            return;
                        }
                    }
                    Step::TransportFailure(message) => {
                        let _ = tx.send(Err(Error::Transport(message))).await;
                        return;
                    }
                    Step::Hang => {
                        while !cancel.load(Ordering::SeqCst) && !tx.is_closed() {
                            tokio::time::sleep(Duration::from_millis(5)).await;
                        }
                        return;
                    }
                    Step::Checkpoint(_) => {}
                }
                match delay {
                    Some(delay) => tokio::time::sleep(delay).await,
                    None => tokio::task::yield_now().await,
                }
            }
        });

        Ok(rx)
    }

    fn query_interrupt(&self, thread_id: &str, checkpoint_id: &str) -> Result<Option<InterruptStatus>> {
        let state = lock_unpoisoned(&self.state);
        // Threads this engine never ran belong to an earlier process.
        if !state.requests.iter().any(|r| r.thread_id == thread_id) {
            return Ok(None);
        }
        let payload = state
            .paused
            .get(&(thread_id.to_string(), checkpoint_id.to_string()))
            .cloned();
        Ok(Some(InterruptStatus {
            interrupted: payload.is_some(),
            payload,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Message, ResumeDecision, ResumePayload};
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;

    fn request(run_id: u64, input: StreamInput) -> StreamRequest {
        StreamRequest {
            run_id,
            thread_id: "t1".to_string(),
            checkpoint_id: None,
            input,
        }
    }

    async fn collect(mut stream: EventStream) -> Vec<Result<RunEnvelope>> {
        let mut events = Vec::new();
        while let Some(item) = stream.recv().await {
            events.push(item);
        }
        events
    }

    #[test]
    fn test_split_tokens_keeps_whitespace() {
        assert_eq!(split_tokens("a bc  d"), vec!["a ", "bc ", " ", "d"]);
    }

    #[tokio::test]
    async fn test_reply_script_streams_sequenced_events() {
        let engine = ScriptedEngine::new();
        engine.push(Script::reply("hello world"));
        let stream = engine
            .stream_run(
                request(4, StreamInput::Message(Message::user_text("hi"))),
                Arc::new(AtomicBool::new(false)),
            )
            .unwrap();

        let events: Vec<_> = collect(stream).await.into_iter().map(|e| e.unwrap()).collect();
        let sequences: Vec<_> = events.iter().map(|e| e.sequence).collect();
        assert_eq!(sequences, vec![1, 2, 3, 4, 5]);
        assert!(events.iter().all(|e| e.run_id == 4));
        assert!(matches!(
            &events[0].event,
            EngineEvent::Meta { phase: MetaPhase::Start, checkpoint_id } if checkpoint_id == "cp-1"
        ));
        assert!(events[4].event.is_terminal());
        assert_eq!(engine.requests().len(), 1);
    }

    #[tokio::test]
    async fn test_cancel_stops_the_stream() {
        let engine = ScriptedEngine::new();
        engine.push(Script::new().start().hang());
        let cancel = Arc::new(AtomicBool::new(false));
        let mut stream = engine
            .stream_run(request(1, StreamInput::Continue), cancel.clone())
            .unwrap();

        assert!(stream.recv().await.is_some());
        cancel.store(true, Ordering::SeqCst);
        assert!(stream.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_interrupt_marks_checkpoint_paused_until_resumed() {
        let engine = ScriptedEngine::new();
        engine.push(Script::interrupt(
            "",
            vec![ToolCallRequest {
                id: "call-1".to_string(),
                name: "delete_file".to_string(),
                arguments: json!({"path": "a.txt"}),
            }],
        ));
        let stream = engine
            .stream_run(
                request(1, StreamInput::Message(Message::user_text("clean up"))),
                Arc::new(AtomicBool::new(false)),
            )
            .unwrap();
        let events = collect(stream).await;
        let paused_at = events
            .iter()
            .filter_map(|e| match &e.as_ref().unwrap().event {
                EngineEvent::Meta {
                    phase: MetaPhase::Interrupt,
                    checkpoint_id,
                } => Some(checkpoint_id.clone()),
                _ => None,
            })
            .next()
            .unwrap();

        let status = engine.query_interrupt("t1", &paused_at).unwrap().unwrap();
        assert!(status.interrupted);
        assert_eq!(status.payload.unwrap().tool_calls[0].id, "call-1");

        let resume = StreamRequest {
            run_id: 2,
            thread_id: "t1".to_string(),
            checkpoint_id: Some(paused_at.clone()),
            input: StreamInput::Resume(ResumePayload {
                decisions: vec![ResumeDecision {
                    id: "call-1".to_string(),
                    decision: DecisionKind::Reject,
                    arguments: None,
                }],
            }),
        };
        let events = collect(
            engine
                .stream_run(resume.clone(), Arc::new(AtomicBool::new(false)))
                .unwrap(),
        )
        .await;
        assert!(events.iter().any(|e| matches!(
            &e.as_ref().unwrap().event,
            EngineEvent::ToolResult { is_error: true, .. }
        )));
        assert!(!engine.query_interrupt("t1", &paused_at).unwrap().unwrap().interrupted);

        let again = engine.stream_run(resume, Arc::new(AtomicBool::new(false)));
        assert!(matches!(again, Err(Error::Engine(_))));
        assert_eq!(engine.query_interrupt("other", &paused_at).unwrap(), None);
    }

    #[tokio::test]
    async fn test_transport_failure_is_delivered_as_error() {
        let engine = ScriptedEngine::new();
        engine.push(Script::new().start().text("partial").transport_failure("connection reset"));
        let events = collect(
            engine
                .stream_run(request(1, StreamInput::Continue), Arc::new(AtomicBool::new(false)))
                .unwrap(),
        )
        .await;
        assert!(matches!(events.last(), Some(Err(Error::Transport(_)))));
    }

    #[tokio::test]
    async fn test_single_slot_buffer_delivers_whole_reply() {
        let config = EngineConfig {
            stream_buffer: 1,
            ..EngineConfig::default()
        };
        let engine = ScriptedEngine::from_config(&config);
        assert_eq!(engine.buffer, 1);

        engine.push(Script::reply("one two three four"));
        let stream = engine
            .stream_run(
                request(1, StreamInput::Message(Message::user_text("count"))),
                Arc::new(AtomicBool::new(false)),
            )
            .unwrap();
        let events: Vec<_> = collect(stream).await.into_iter().map(|e| e.unwrap()).collect();
        let sequences: Vec<_> = events.iter().map(|e| e.sequence).collect();
        assert_eq!(sequences, (1..=events.len() as u64).collect::<Vec<_>>());
        assert!(events.last().unwrap().event.is_terminal());
    }
}
