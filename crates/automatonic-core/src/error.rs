//! Error taxonomy shared by every stage of the command pipeline.

use std::{error::Error as StdError, fmt, sync::Arc, time::Duration};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Message carried by every error synthesized for a drained command.
pub const DRAIN_MESSAGE: &str = "queued operation failed; queue drained";

/// Canonical shape of a failure raised inside the remote target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{message}")]
pub struct RemoteError {
    /// The remote exception's message.
    pub message: String,
    /// The remote stack trace, when the target provided one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

impl RemoteError {
    /// Create a remote error without a stack.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stack: None,
        }
    }

    /// Attach a stack trace.
    #[must_use]
    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }
}

/// Error synthesized for a command that never started because an earlier
/// command failed.
#[derive(Debug, Clone, Default)]
pub struct DrainError {
    cause: Option<Arc<CommandError>>,
}

impl DrainError {
    /// Create a drain error wrapping the failure that triggered the drain.
    #[must_use]
    pub const fn new(cause: Option<Arc<CommandError>>) -> Self {
        Self { cause }
    }

    /// The failure that triggered the drain.
    #[must_use]
    pub fn cause(&self) -> Option<&CommandError> {
        self.cause.as_deref()
    }
}

impl fmt::Display for DrainError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(DRAIN_MESSAGE)
    }
}

impl StdError for DrainError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.cause
            .as_deref()
            .map(|cause| cause as &(dyn StdError + 'static))
    }
}

/// Error surfaced through a command's future.
#[derive(Debug, Clone, Error)]
pub enum CommandError {
    /// The remote target threw while evaluating a script.
    #[error(transparent)]
    Remote(#[from] RemoteError),

    /// A condition wait ran out of budget.
    #[error(
        "timed out waiting for {what} after {}ms (budget {}ms)",
        elapsed.as_millis(),
        budget.as_millis()
    )]
    Timeout {
        what: String,
        budget: Duration,
        elapsed: Duration,
    },

    /// The target reported a failed page load.
    #[error("navigation to {url} failed: {reason}")]
    Navigation { url: String, reason: String },

    /// An earlier command failed and this one was discarded.
    #[error(transparent)]
    Drained(#[from] DrainError),

    /// The remote target went away.
    #[error("{target} closed")]
    TargetClosed { target: String },

    /// A coroutine yielded something that cannot be awaited.
    #[error("type error: {0}")]
    Type(String),

    /// The connection to the remote target failed.
    #[error("transport error: {0}")]
    Transport(String),

    /// The command's queue was dropped before the command settled.
    #[error("command abandoned before it settled")]
    Abandoned,

    /// A call argument could not be encoded.
    #[error("invalid argument: {0}")]
    Argument(String),
}

impl CommandError {
    /// Build the error attached to every command discarded by a drain.
    #[must_use]
    pub fn drained(cause: Option<Self>) -> Self {
        Self::Drained(DrainError::new(cause.map(Arc::new)))
    }

    /// Whether this error was synthesized by a drain.
    #[must_use]
    pub const fn is_drained(&self) -> bool {
        matches!(self, Self::Drained(_))
    }

    /// Remote stack trace carried by this error, if any.
    #[must_use]
    pub fn stack(&self) -> Option<&str> {
        match self {
            Self::Remote(remote) => remote.stack.as_deref(),
            _ => None,
        }
    }

    /// The root failure, following drain causes to the end of the chain.
    #[must_use]
    pub fn root_cause(&self) -> &Self {
        let mut current = self;
        while let Self::Drained(drain) = current {
            match drain.cause() {
                Some(cause) => current = cause,
                None => break,
            }
        }
        current
    }

    /// Multi-line rendering of the full cause chain, remote stacks included.
    #[must_use]
    pub fn report(&self) -> String {
        let mut out = self.to_string();
        if let Some(stack) = self.stack() {
            out.push('\n');
            out.push_str(stack);
        }
        let mut current = self;
        while let Self::Drained(drain) = current {
            let Some(cause) = drain.cause() else { break };
            out.push_str("\n----------\ncaused by: ");
            out.push_str(&cause.to_string());
            if let Some(stack) = cause.stack() {
                out.push('\n');
                out.push_str(stack);
            }
            current = cause;
        }
        out
    }
}
