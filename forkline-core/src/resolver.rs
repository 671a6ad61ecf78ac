//! Checkpoint resolution
//!
//! Decides which engine checkpoint an operation forks from. Resolution walks a
//! bounded number of ancestors looking for a recorded checkpoint and fails with
//! [`Error::MissingCheckpoint`] when none is found. It never substitutes the
//! thread's latest checkpoint: doing so would graft the new turn onto whatever
//! branch ran last.

use crate::error::{Error, Operation, Result};
use crate::graph::MessageGraph;
use crate::types::Role;

/// Where execution should start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ForkPoint {
    /// Engine starts with empty state
    Fresh,
    /// Engine resumes from this checkpoint
    Checkpoint(String),
}

impl ForkPoint {
    pub fn checkpoint_id(&self) -> Option<&str> {
        match self {
            ForkPoint::Fresh => None,
            ForkPoint::Checkpoint(id) => Some(id),
        }
    }
}

/// A resolved fork: the checkpoint plus the graph parent of the new node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForkPlan {
    pub fork: ForkPoint,
    /// Parent the operation's new message attaches to
    pub parent_id: Option<String>,
}

/// Stateless resolver; every method reads the graph and mutates nothing.
#[derive(Debug, Clone, Copy)]
pub struct CheckpointResolver {
    max_hops: usize,
}

impl Default for CheckpointResolver {
    fn default() -> Self {
        Self::new(4)
    }
}

impl CheckpointResolver {
    pub fn new(max_hops: usize) -> Self {
        Self {
            max_hops: max_hops.max(1),
        }
    }

    pub fn max_hops(&self) -> usize {
        self.max_hops
    }

    /// Fork point for a new message appended under `parent_id`.
    pub fn resolve_for_new_message(
        &self,
        graph: &MessageGraph,
        parent_id: Option<&str>,
    ) -> Result<ForkPlan> {
        let fork = match parent_id {
            None if !graph.has_assistant() => ForkPoint::Fresh,
            None => {
                return Err(Error::MissingCheckpoint {
                    operation: Operation::SendNew,
                    parent_id: None,
                })
            }
            Some(parent) => self.walk(graph, parent, Operation::SendNew)?,
        };
        Ok(ForkPlan {
            fork,
            parent_id: parent_id.map(str::to_string),
        })
    }

    /// Fork point for editing `source_id`: the state before the source message.
    ///
    /// The edited copy becomes a sibling of the source. Editing a root starts
    /// the engine fresh.
    pub fn resolve_for_edit(&self, graph: &MessageGraph, source_id: &str) -> Result<ForkPlan> {
        let source = graph
            .get(source_id)
            .ok_or_else(|| Error::MessageNotFound(source_id.to_string()))?;
        if source.role != Role::User {
            return Err(Error::InvalidOperation(format!(
                "only user messages can be edited, {} is {}",
                source_id, source.role
            )));
        }

        let fork = match source.parent_id.as_deref() {
            None => ForkPoint::Fresh,
            Some(parent) => self.walk(graph, parent, Operation::Edit)?,
        };
        Ok(ForkPlan {
            fork,
            parent_id: source.parent_id.clone(),
        })
    }

    /// Fork point for regenerating `assistant_id`: the state before that turn.
    pub fn resolve_for_regenerate(
        &self,
        graph: &MessageGraph,
        assistant_id: &str,
    ) -> Result<ForkPlan> {
        let assistant = graph
            .get(assistant_id)
            .ok_or_else(|| Error::MessageNotFound(assistant_id.to_string()))?;
        if assistant.role != Role::Assistant {
            return Err(Error::InvalidOperation(format!(
                "only assistant messages can be regenerated, {} is {}",
                assistant_id, assistant.role
            )));
        }

        let parent = assistant
            .parent_id
            .as_deref()
            .ok_or(Error::MissingCheckpoint {
                operation: Operation::Regenerate,
                parent_id: None,
            })?;
        let fork = self.walk(graph, parent, Operation::Regenerate)?;
        Ok(ForkPlan {
            fork,
            parent_id: Some(parent.to_string()),
        })
    }

    /// Nearest checkpoint at or above `start`, looking at no more than `max_hops` messages.
    fn walk(&self, graph: &MessageGraph, start: &str, operation: Operation) -> Result<ForkPoint> {
        if !graph.contains(start) {
            return Err(Error::MessageNotFound(start.to_string()));
        }

        let mut cursor = Some(start);
        for _ in 0..self.max_hops {
            let Some(message) = cursor.and_then(|id| graph.get(id)) else {
                break;
            };
            if let Some(checkpoint) = &message.checkpoint_id {
                tracing::debug!(
                    operation = %operation,
                    start,
                    message_id = %message.id,
                    checkpoint_id = %checkpoint,
                    "Resolved fork checkpoint"
                );
                return Ok(ForkPoint::Checkpoint(checkpoint.clone()));
            }
            cursor = message.parent_id.as_deref();
        }

        tracing::warn!(operation = %operation, parent_id = start, "No checkpoint in ancestry");
        Err(Error::MissingCheckpoint {
            operation,
            parent_id: Some(start.to_string()),
        })
    }
}
