//! Execution engine contract
//!
//! The engine is a black box that starts from a checkpoint (or from nothing),
//! takes either a new message, a resume payload or nothing at all, and streams
//! back a closed set of events. Every event travels inside a [`RunEnvelope`]
//! carrying the run id and a per-run sequence number so stale or replayed
//! events can be fenced off.

mod scripted;

pub use scripted::{Script, ScriptedEngine, Step};

use crate::error::{Error, Result};
use crate::types::{InterruptPayload, InterruptStatus, Message, ResumePayload, ToolCallRequest};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::{atomic::AtomicBool, Arc};
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::sync::mpsc;

/// Identifier for one run, unique within a session.
pub type RunId = u64;

/// Shared cancellation flag for a run.
pub type CancelSignal = Arc<AtomicBool>;

/// Receiving half of a run's event stream.
pub type EventStream = mpsc::Receiver<Result<RunEnvelope>>;

/// Which checkpoint a `meta` event reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetaPhase {
    /// State after the run's input was appended
    Start,
    /// State the run paused in
    Interrupt,
    /// State after the run finished
    Complete,
}

/// Final status carried by `done`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DoneStatus {
    #[default]
    Complete,
    Interrupted,
    Cancelled,
}

/// Engine event taxonomy. Anything else is rejected at decode time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    TextDelta {
        text: String,
    },
    ToolCall {
        id: String,
        name: String,
        #[serde(default)]
        arguments: Value,
    },
    ToolResult {
        tool_call_id: String,
        result: Value,
        #[serde(default)]
        is_error: bool,
    },
    /// Engine-assigned id for the message being streamed
    MessageId {
        id: String,
    },
    Interrupt {
        tool_calls: Vec<ToolCallRequest>,
    },
    Meta {
        phase: MetaPhase,
        checkpoint_id: String,
    },
    Done {
        #[serde(default)]
        status: DoneStatus,
    },
    Error {
        message: String,
    },
}

impl EngineEvent {
    /// Returns true when this event ends the run.
    pub fn is_terminal(&self) -> bool {
        matches!(self, EngineEvent::Done { .. } | EngineEvent::Error { .. })
    }

    pub fn kind(&self) -> &'static str {
        match self {
            EngineEvent::TextDelta { .. } => "text_delta",
            EngineEvent::ToolCall { .. } => "tool_call",
            EngineEvent::ToolResult { .. } => "tool_result",
            EngineEvent::MessageId { .. } => "message_id",
            EngineEvent::Interrupt { .. } => "interrupt",
            EngineEvent::Meta { .. } => "meta",
            EngineEvent::Done { .. } => "done",
            EngineEvent::Error { .. } => "error",
        }
    }

    pub fn interrupt(payload: InterruptPayload) -> Self {
        EngineEvent::Interrupt {
            tool_calls: payload.tool_calls,
        }
    }
}

/// One event as it travels on the stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunEnvelope {
    pub run_id: RunId,
    pub sequence: u64,
    #[serde(flatten)]
    pub event: EngineEvent,
}

impl RunEnvelope {
    pub fn new(run_id: RunId, sequence: u64, event: EngineEvent) -> Self {
        Self {
            run_id,
            sequence,
            event,
        }
    }
}

/// Parse one NDJSON line. Blank lines yield `None`.
pub fn decode_line(line: &str) -> Result<Option<RunEnvelope>> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    serde_json::from_str(trimmed)
        .map(Some)
        .map_err(|e| Error::Transport(format!("malformed event line: {e}")))
}

/// Serialize an envelope as a single NDJSON line (no trailing newline).
pub fn encode_line(envelope: &RunEnvelope) -> Result<String> {
    Ok(serde_json::to_string(envelope)?)
}

/// Turn an NDJSON byte stream into an [`EventStream`].
///
/// Malformed lines are forwarded as transport errors and end the stream.
pub fn ndjson_stream<R>(reader: R, buffer: usize) -> EventStream
where
    R: AsyncBufRead + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(buffer.max(1));
    tokio::spawn(async move {
        let mut lines = reader.lines();
        loop {
            let item = match lines.next_line().await {
                Ok(Some(line)) => match decode_line(&line) {
                    Ok(Some(envelope)) => Ok(envelope),
                    Ok(None) => continue,
                    Err(e) => Err(e),
                },
                Ok(None) => break,
                Err(e) => Err(Error::Transport(format!("stream read failed: {e}"))),
            };
            let failed = item.is_err();
            if tx.send(item).await.is_err() || failed {
                break;
            }
        }
    });
    rx
}

/// What the engine should feed into the forked state.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamInput {
    /// Append a fresh message and run
    Message(Message),
    /// Answer a pending approval interrupt
    Resume(ResumePayload),
    /// Run again from the checkpoint without new input
    Continue,
}

impl StreamInput {
    pub fn kind(&self) -> &'static str {
        match self {
            StreamInput::Message(_) => "message",
            StreamInput::Resume(_) => "resume",
            StreamInput::Continue => "continue",
        }
    }
}

/// Request to open one run.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamRequest {
    pub run_id: RunId,
    pub thread_id: String,
    /// `None` starts from empty state
    pub checkpoint_id: Option<String>,
    pub input: StreamInput,
}

/// Execution engine interface.
pub trait ExecutionEngine: Send + Sync {
    /// Open an event stream for one run.
    ///
    /// Implementations must stop producing events once `cancel` is set.
    fn stream_run(&self, request: StreamRequest, cancel: CancelSignal) -> Result<EventStream>;

    /// Ask the engine whether a checkpoint is still paused.
    ///
    /// `Ok(None)` means the engine cannot answer and the persisted interrupt
    /// record is authoritative.
    fn query_interrupt(&self, _thread_id: &str, _checkpoint_id: &str) -> Result<Option<InterruptStatus>> {
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_line_reads_flat_envelope() {
        let line = r#"{"run_id":3,"sequence":7,"type":"tool_call","id":"c1","name":"search","arguments":{"q":"x"}}"#;
        let envelope = decode_line(line).unwrap().unwrap();
        assert_eq!(envelope.run_id, 3);
        assert_eq!(envelope.sequence, 7);
        assert_eq!(
            envelope.event,
            EngineEvent::ToolCall {
                id: "c1".to_string(),
                name: "search".to_string(),
                arguments: json!({"q": "x"}),
            }
        );
    }

    #[test]
    fn test_decode_line_rejects_unknown_type() {
        let err = decode_line(r#"{"run_id":1,"sequence":1,"type":"custom_ui"}"#).unwrap_err();
        assert!(matches!(err, Error::Transport(_)));
    }

    #[test]
    fn test_decode_line_skips_blank() {
        assert!(decode_line("   ").unwrap().is_none());
    }

    #[test]
    fn test_done_status_defaults_to_complete() {
        let envelope = decode_line(r#"{"run_id":1,"sequence":9,"type":"done"}"#)
            .unwrap()
            .unwrap();
        assert_eq!(
            envelope.event,
            EngineEvent::Done {
                status: DoneStatus::Complete
            }
        );
        assert!(envelope.event.is_terminal());
    }

    #[test]
    fn test_encode_line_is_decodable() {
        let envelope = RunEnvelope::new(
            2,
            1,
            EngineEvent::Meta {
                phase: MetaPhase::Interrupt,
                checkpoint_id: "cp-9".to_string(),
            },
        );
        let line = encode_line(&envelope).unwrap();
        assert!(line.contains(r#""phase":"interrupt""#));
        assert_eq!(decode_line(&line).unwrap(), Some(envelope));
    }

    #[tokio::test]
    async fn test_ndjson_stream_forwards_events_then_error() {
        let input = concat!(
            r#"{"run_id":1,"sequence":1,"type":"text_delta","text":"hi"}"#,
            "\n\n",
            "not json\n",
            r#"{"run_id":1,"sequence":2,"type":"done"}"#,
            "\n"
        );
        let reader = tokio::io::BufReader::new(input.as_bytes());
        let mut stream = ndjson_stream(reader, 4);

        let first = stream.recv().await.unwrap().unwrap();
        assert_eq!(first.sequence, 1);
        assert!(matches!(stream.recv().await, Some(Err(Error::Transport(_)))));
        assert!(stream.recv().await.is_none());
    }
}
