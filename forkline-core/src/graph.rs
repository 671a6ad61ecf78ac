//! Message graph
//!
//! Holds a thread's messages as a tree of parent pointers. Children of the same
//! parent are branch siblings, kept in insertion order. A message whose parent
//! has not been seen yet is parked in a pending set and admitted by a bounded
//! fixed-point pass once the parent arrives; whatever never admits is reported
//! as an orphan.

use crate::error::{Error, Result};
use crate::types::{synthetic_message_id, Message, SnapshotEntry, ThreadSnapshot};
use std::collections::HashMap;

/// Result of [`MessageGraph::add_or_update`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    /// New node admitted into the graph
    Inserted,
    /// Existing node replaced in place
    Updated,
    /// Same id and identical content; nothing changed
    Unchanged,
    /// Parent unknown; parked until it arrives
    Queued,
}

/// Diagnostics from [`MessageGraph::import`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImportReport {
    /// Nodes admitted into the accepted set
    pub admitted: usize,
    /// Ids whose parent never resolved (kept, but outside the active view)
    pub orphans: Vec<String>,
    /// Persisted head id that did not reference an accepted node
    pub invalid_head: Option<String>,
    /// Messages that were given a synthetic id
    pub synthesized_ids: usize,
}

/// Conversation DAG for one thread.
#[derive(Debug, Clone, Default)]
pub struct MessageGraph {
    nodes: HashMap<String, Message>,
    /// Child ids per parent; the `None` key lists roots.
    children: HashMap<Option<String>, Vec<String>>,
    /// Global admission order
    order: Vec<String>,
    pending: Vec<Message>,
    head: Option<String>,
    /// Admission pass bound; 0 means the pending-set size
    max_passes: usize,
}

impl MessageGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Graph with an explicit admission pass bound (0 = pending-set size).
    pub fn with_max_passes(max_passes: usize) -> Self {
        Self {
            max_passes,
            ..Self::default()
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn get(&self, id: &str) -> Option<&Message> {
        self.nodes.get(id)
    }

    pub fn head(&self) -> Option<&str> {
        self.head.as_deref()
    }

    pub fn head_message(&self) -> Option<&Message> {
        self.head.as_deref().and_then(|id| self.nodes.get(id))
    }

    /// Accepted messages in admission order
    pub fn messages(&self) -> impl Iterator<Item = &Message> {
        self.order.iter().filter_map(|id| self.nodes.get(id))
    }

    /// Messages still waiting on an unknown parent
    pub fn orphans(&self) -> &[Message] {
        &self.pending
    }

    /// Whether any accepted message was authored by the assistant
    pub fn has_assistant(&self) -> bool {
        self.nodes
            .values()
            .any(|message| message.role == crate::types::Role::Assistant)
    }

    /// Insert `message` under `parent_id`, or replace a node with the same id.
    ///
    /// A replaced node keeps its original parent and sibling position. A node
    /// whose parent is unknown is queued and admitted later.
    pub fn add_or_update(&mut self, parent_id: Option<&str>, mut message: Message) -> AddOutcome {
        if let Some(existing) = self.nodes.get_mut(&message.id) {
            if existing.parent_id.as_deref() != parent_id {
                tracing::debug!(
                    message_id = %message.id,
                    kept_parent = ?existing.parent_id,
                    "Ignoring parent change on update"
                );
            }
            message.parent_id = existing.parent_id.clone();
            if *existing == message {
                return AddOutcome::Unchanged;
            }
            *existing = message;
            return AddOutcome::Updated;
        }

        message.parent_id = parent_id.map(str::to_string);

        if let Some(queued) = self.pending.iter_mut().find(|m| m.id == message.id) {
            *queued = message;
            return AddOutcome::Queued;
        }

        if self.is_admissible(&message) {
            self.admit(message);
            self.admit_pending();
            AddOutcome::Inserted
        } else {
            tracing::debug!(
                message_id = %message.id,
                parent_id = ?message.parent_id,
                "Parent unknown, queueing message"
            );
            self.pending.push(message);
            AddOutcome::Queued
        }
    }

    fn is_admissible(&self, message: &Message) -> bool {
        match message.parent_id.as_deref() {
            None => true,
            Some(parent) => parent != message.id && self.nodes.contains_key(parent),
        }
    }

    fn admit(&mut self, message: Message) {
        let id = message.id.clone();
        self.children
            .entry(message.parent_id.clone())
            .or_default()
            .push(id.clone());
        self.order.push(id.clone());
        self.nodes.insert(id, message);
    }

    /// Fixed-point admission over the pending set.
    ///
    /// Each pass admits every pending message whose parent is accepted; the
    /// loop stops after a pass admits nothing or the pass bound is reached.
    fn admit_pending(&mut self) -> usize {
        let limit = if self.max_passes == 0 {
            self.pending.len()
        } else {
            self.max_passes
        };

        let mut admitted = 0;
        for _ in 0..limit {
            let mut progressed = false;
            for message in std::mem::take(&mut self.pending) {
                if self.is_admissible(&message) {
                    self.admit(message);
                    admitted += 1;
                    progressed = true;
                } else {
                    self.pending.push(message);
                }
            }
            if !progressed || self.pending.is_empty() {
                break;
            }
        }
        admitted
    }

    /// Move the head. Unknown ids leave the previous head in place.
    pub fn set_head(&mut self, message_id: &str) -> bool {
        if self.nodes.contains_key(message_id) {
            self.head = Some(message_id.to_string());
            true
        } else {
            tracing::warn!(message_id, head = ?self.head, "Rejected head move to unknown message");
            false
        }
    }

    pub fn clear_head(&mut self) {
        self.head = None;
    }

    /// Select a head without consulting persisted state.
    ///
    /// Starts at the most recent root and follows the most recently inserted
    /// child until reaching a leaf.
    pub fn recompute_head(&mut self) -> Option<&str> {
        let mut current = self.children.get(&None).and_then(|roots| roots.last()).cloned();
        let mut steps = 0;
        while let Some(id) = current.clone() {
            steps += 1;
            match self.children.get(&Some(id)).and_then(|kids| kids.last()) {
                Some(child) if steps <= self.nodes.len() => current = Some(child.clone()),
                _ => break,
            }
        }
        self.head = current;
        self.head.as_deref()
    }

    /// Messages from the root down to the head, recomputed on every call.
    pub fn active_path(&self) -> Vec<&Message> {
        let mut path = Vec::new();
        let mut cursor = self.head.as_deref();
        while let Some(id) = cursor {
            let Some(message) = self.nodes.get(id) else {
                break;
            };
            path.push(message);
            if path.len() > self.nodes.len() {
                break;
            }
            cursor = message.parent_id.as_deref();
        }
        path.reverse();
        path
    }

    /// Ids along the active path
    pub fn active_ids(&self) -> Vec<String> {
        self.active_path().iter().map(|m| m.id.clone()).collect()
    }

    /// Children of `parent_id` (`None` = roots) in insertion order
    pub fn children_of(&self, parent_id: Option<&str>) -> Vec<&Message> {
        self.children
            .get(&parent_id.map(str::to_string))
            .map(|ids| ids.iter().filter_map(|id| self.nodes.get(id)).collect())
            .unwrap_or_default()
    }

    /// All messages sharing `message_id`'s parent, the message included.
    pub fn siblings_of(&self, message_id: &str) -> Vec<&Message> {
        match self.nodes.get(message_id) {
            Some(message) => self.children_of(message.parent_id.as_deref()),
            None => Vec::new(),
        }
    }

    /// 1-based position among siblings and the sibling count, e.g. `(2, 3)`.
    pub fn sibling_position(&self, message_id: &str) -> Option<(usize, usize)> {
        let siblings = self.siblings_of(message_id);
        siblings
            .iter()
            .position(|m| m.id == message_id)
            .map(|index| (index + 1, siblings.len()))
    }

    /// Rename a node, carrying its position, children and head selection.
    pub fn retarget(&mut self, old_id: &str, new_id: &str) -> Result<()> {
        if old_id == new_id {
            return Ok(());
        }
        if self.nodes.contains_key(new_id) {
            return Err(Error::InvalidOperation(format!(
                "cannot retarget {old_id}: {new_id} already exists"
            )));
        }
        let mut message = self
            .nodes
            .remove(old_id)
            .ok_or_else(|| Error::MessageNotFound(old_id.to_string()))?;
        message.id = new_id.to_string();

        if let Some(slot) = self
            .children
            .get_mut(&message.parent_id)
            .and_then(|ids| ids.iter_mut().find(|id| id.as_str() == old_id))
        {
            *slot = new_id.to_string();
        }
        if let Some(kids) = self.children.remove(&Some(old_id.to_string())) {
            for kid in &kids {
                if let Some(child) = self.nodes.get_mut(kid) {
                    child.parent_id = Some(new_id.to_string());
                }
            }
            self.children.insert(Some(new_id.to_string()), kids);
        }
        if let Some(slot) = self.order.iter_mut().find(|id| id.as_str() == old_id) {
            *slot = new_id.to_string();
        }
        for queued in &mut self.pending {
            if queued.parent_id.as_deref() == Some(old_id) {
                queued.parent_id = Some(new_id.to_string());
            }
        }
        if self.head.as_deref() == Some(old_id) {
            self.head = Some(new_id.to_string());
        }

        self.nodes.insert(new_id.to_string(), message);
        self.admit_pending();
        Ok(())
    }

    /// Serialize every node (accepted first, then pending) plus the head.
    pub fn export(&self) -> ThreadSnapshot {
        let messages = self
            .messages()
            .chain(self.pending.iter())
            .map(|message| SnapshotEntry {
                parent_id: message.parent_id.clone(),
                message: message.clone(),
            })
            .collect();

        ThreadSnapshot {
            head_id: self.head.clone(),
            messages,
        }
    }

    /// Rebuild a graph from a snapshot in any order.
    ///
    /// The entry's `parent_id` wins over the embedded message's. A head that
    /// does not reference an accepted node is dropped and reported.
    pub fn import(snapshot: &ThreadSnapshot, max_passes: usize) -> (Self, ImportReport) {
        let mut graph = Self::with_max_passes(max_passes);
        let mut report = ImportReport::default();

        for (index, entry) in snapshot.messages.iter().enumerate() {
            let mut message = entry.message.clone();
            if message.id.is_empty() {
                message.id = synthetic_message_id(
                    message.checkpoint_id.as_deref(),
                    index,
                    message.role,
                    &message.text(),
                );
                report.synthesized_ids += 1;
            }
            graph.add_or_update(entry.parent_id.as_deref(), message);
        }
        // Entries queued early may have been blocked by a bounded pass count.
        graph.admit_pending();

        report.admitted = graph.len();
        report.orphans = graph.pending.iter().map(|m| m.id.clone()).collect();
        if !report.orphans.is_empty() {
            tracing::warn!(
                orphans = ?report.orphans,
                "Messages reference parents that were never observed"
            );
        }

        if let Some(head) = snapshot.head_id.as_deref() {
            if graph.contains(head) {
                graph.head = Some(head.to_string());
            } else {
                tracing::warn!(head_id = head, "Persisted head is not an accepted message");
                report.invalid_head = Some(head.to_string());
            }
        }

        (graph, report)
    }
}
