//! Outcome registry: sequence number -> the caller waiting on it.
//!
//! A single map whose records carry their [`CommandKind`] replaces separate
//! sync/async buckets; lookups on an ordinary response therefore find async
//! commands too.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::outcome::{CommandError, CommandKind, CommandResult, Outcome};

/// A registered caller continuation. Consumed by `succeed` or `fail`, so a
/// record can only ever be resolved once.
#[derive(Debug)]
pub struct PendingOutcome {
    command: String,
    kind: CommandKind,
    submitted_at: Instant,
    responder: oneshot::Sender<CommandResult>,
    settled: CancellationToken,
}

impl PendingOutcome {
    /// Creates the record and the caller-side [`Outcome`] it resolves.
    pub fn new(command: impl Into<String>, kind: CommandKind) -> (Self, Outcome) {
        let (responder, rx) = oneshot::channel();
        let pending = Self {
            command: command.into(),
            kind,
            submitted_at: Instant::now(),
            responder,
            settled: CancellationToken::new(),
        };
        (pending, Outcome::pending(rx))
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn kind(&self) -> CommandKind {
        self.kind
    }

    pub fn elapsed(&self) -> Duration {
        self.submitted_at.elapsed()
    }

    /// Token cancelled once this record is resolved, for watchers that should
    /// stop caring about the command.
    pub fn settled_token(&self) -> CancellationToken {
        self.settled.clone()
    }

    pub fn succeed(self, value: serde_json::Value) {
        self.resolve(Ok(value));
    }

    pub fn fail(self, error: CommandError) {
        self.resolve(Err(error));
    }

    fn resolve(self, result: CommandResult) {
        self.settled.cancel();
        if self.responder.send(result).is_err() {
            tracing::debug!(command = %self.command, "Outcome receiver dropped before resolution");
        }
    }
}

#[derive(Debug, Default)]
pub struct OutcomeRegistry {
    pending: HashMap<u64, PendingOutcome>,
}

impl OutcomeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores the outcome for `seq`. A sequence number maps to at most one
    /// record; registering over a live one fails the displaced caller.
    pub fn register(&mut self, seq: u64, outcome: PendingOutcome) {
        if let Some(previous) = self.pending.insert(seq, outcome) {
            debug_assert!(false, "sequence number registered twice");
            tracing::error!(seq, command = %previous.command, "Bug: sequence number registered twice");
            previous.fail(CommandError::EngineStopped);
        }
    }

    /// Removes and returns the record for `seq`. Idempotent.
    pub fn resolve_and_remove(&mut self, seq: u64) -> Option<PendingOutcome> {
        self.pending.remove(&seq)
    }

    /// Fails every outstanding record with `error` and empties the registry.
    pub fn force_fail_all(&mut self, error: CommandError) -> usize {
        let n = self.pending.len();
        for (seq, outcome) in self.pending.drain() {
            tracing::debug!(
                seq,
                command = %outcome.command,
                kind = outcome.kind.as_str(),
                %error,
                "Failing pending outcome"
            );
            outcome.fail(error.clone());
        }
        n
    }

    pub fn contains(&self, seq: u64) -> bool {
        self.pending.contains_key(&seq)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
