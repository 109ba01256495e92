//! Sequence number allocation and the queue of not-yet-sent commands.

use std::collections::VecDeque;

use crate::bridge::protocol::Request;
use crate::outcome::CommandKind;

/// Monotonic sequence number source, one per engine.
#[derive(Debug, Default)]
pub struct Sequencer {
    next: u64,
}

impl Sequencer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allocate(&mut self) -> u64 {
        let seq = self.next;
        self.next += 1;
        seq
    }
}

/// A command bound to its sequence number. Immutable once created.
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    seq: u64,
    name: String,
    arguments: serde_json::Value,
}

impl Command {
    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn arguments(&self) -> &serde_json::Value {
        &self.arguments
    }

    pub fn to_request(&self) -> Request {
        Request {
            seq: self.seq,
            command: self.name.clone(),
            arguments: self.arguments.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct QueuedItem {
    pub command: Command,
    pub expects_reply: bool,
    pub kind: CommandKind,
}

impl QueuedItem {
    /// Whether sending this item occupies the synchronous in-flight slot.
    pub fn gates_pipeline(&self) -> bool {
        self.expects_reply && !self.kind.is_async()
    }
}

/// FIFO of commands waiting for the drain gate. No reordering, no priorities.
#[derive(Debug, Default)]
pub struct CommandQueue {
    sequencer: Sequencer,
    items: VecDeque<QueuedItem>,
}

impl CommandQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(
        &mut self,
        name: impl Into<String>,
        arguments: serde_json::Value,
        expects_reply: bool,
        kind: CommandKind,
    ) -> Command {
        let command = Command {
            seq: self.sequencer.allocate(),
            name: name.into(),
            arguments,
        };
        self.items.push_back(QueuedItem {
            command: command.clone(),
            expects_reply,
            kind,
        });
        command
    }

    pub fn dequeue_next(&mut self) -> Option<QueuedItem> {
        self.items.pop_front()
    }

    /// Removes a queued-but-unsent command. Returns whether one was found.
    pub fn cancel_if_queued(&mut self, seq: u64) -> bool {
        match self.items.iter().position(|item| item.command.seq == seq) {
            Some(index) => {
                self.items.remove(index);
                true
            }
            None => false,
        }
    }

    /// Drops every queued item; returns how many there were.
    pub fn clear(&mut self) -> usize {
        let n = self.items.len();
        self.items.clear();
        n
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}
