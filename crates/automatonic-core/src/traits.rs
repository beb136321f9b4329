//! Contract between the pipeline and a remote execution target.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::broadcast;

use crate::script::Script;

/// Lifecycle signal emitted by a remote target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TargetEvent {
    /// The current page finished loading.
    LoadFinished,
    /// The current page failed to load.
    LoadFailed { code: i32, description: String },
    /// The target went away. Emitted at most once.
    Closed,
}

/// Options forwarded with a page load.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NavigateOptions {
    /// HTTP referrer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub referrer: Option<String>,
    /// User agent override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    /// Extra headers separated by `\n`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra_headers: Option<String>,
}

impl NavigateOptions {
    /// Set the referrer.
    #[must_use]
    pub fn with_referrer(mut self, referrer: impl Into<String>) -> Self {
        self.referrer = Some(referrer.into());
        self
    }

    /// Set the user agent.
    #[must_use]
    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    /// Append an extra header line.
    #[must_use]
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        let line = format!("{name}: {value}");
        self.extra_headers = Some(match self.extra_headers.take() {
            Some(existing) => format!("{existing}\n{line}"),
            None => line,
        });
        self
    }
}

/// Failure in the target's native shape, before normalization.
#[derive(Debug, Clone, Error)]
pub enum TargetFailure {
    /// An error object was thrown.
    #[error("{message}")]
    Exception {
        message: String,
        stack: Option<String>,
    },
    /// A non-error value was thrown.
    #[error("uncaught {0}")]
    Thrown(Value),
    /// The target is no longer reachable.
    #[error("target disconnected")]
    Disconnected,
    /// The channel to the target failed.
    #[error("I/O error: {0}")]
    Io(String),
}

/// A live remote execution target.
#[async_trait]
pub trait RemoteTarget: Send + Sync {
    /// Evaluate a script and return its JSON result.
    async fn evaluate(&self, script: Script) -> Result<Value, TargetFailure>;

    /// Start loading `url`. Completion is signalled through [`TargetEvent`]s.
    async fn load_url(&self, url: &str, options: &NavigateOptions) -> Result<(), TargetFailure>;

    /// Current document title.
    async fn title(&self) -> Result<String, TargetFailure>;

    /// Close gracefully.
    async fn close(&self) -> Result<(), TargetFailure>;

    /// Destroy without a graceful close.
    async fn destroy(&self) -> Result<(), TargetFailure>;

    /// Subscribe to lifecycle events.
    fn subscribe(&self) -> broadcast::Receiver<TargetEvent>;

    /// Whether the target has emitted [`TargetEvent::Closed`].
    fn is_closed(&self) -> bool;
}
