//! Remote executor: submits scripts to a target and normalizes failures.

use std::sync::Arc;

use automatonic_core::{
    CommandError, NavigateOptions, RemoteError, RemoteTarget, Script, TargetFailure,
};
use serde::de::DeserializeOwned;
use serde_json::Value;

/// Translate a target-native failure into the pipeline's error contract.
///
/// Thrown error objects keep their message and stack. Thrown non-error
/// values become a message of their own, so callers always see
/// [`CommandError::Remote`] for anything raised by the target.
#[must_use]
pub fn normalize(failure: TargetFailure, target_name: &str) -> CommandError {
    match failure {
        TargetFailure::Exception { message, stack } => {
            CommandError::Remote(RemoteError { message, stack })
        }
        TargetFailure::Thrown(value) => CommandError::Remote(thrown_to_remote(value)),
        TargetFailure::Disconnected => CommandError::TargetClosed {
            target: target_name.to_string(),
        },
        TargetFailure::Io(reason) => CommandError::Transport(reason),
    }
}

fn thrown_to_remote(value: Value) -> RemoteError {
    match value {
        Value::String(message) => RemoteError::new(message),
        Value::Object(ref map) if map.get("message").is_some_and(Value::is_string) => {
            let message = map
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let stack = map.get("stack").and_then(Value::as_str).map(str::to_string);
            RemoteError { message, stack }
        }
        other => RemoteError::new(other.to_string()),
    }
}

/// Stateless front end to one remote target.
#[derive(Clone)]
pub struct RemoteExecutor {
    target: Arc<dyn RemoteTarget>,
    target_name: String,
}

impl RemoteExecutor {
    /// Create an executor for `target`. `target_name` appears in the error
    /// raised when the target has gone away.
    #[must_use]
    pub fn new(target: Arc<dyn RemoteTarget>, target_name: impl Into<String>) -> Self {
        Self {
            target,
            target_name: target_name.into(),
        }
    }

    /// The underlying target.
    #[must_use]
    pub fn target(&self) -> &Arc<dyn RemoteTarget> {
        &self.target
    }

    /// Name used in close errors.
    #[must_use]
    pub fn target_name(&self) -> &str {
        &self.target_name
    }

    fn normalize(&self, failure: TargetFailure) -> CommandError {
        normalize(failure, &self.target_name)
    }

    /// Evaluate a script.
    ///
    /// # Errors
    /// Returns the normalized remote failure.
    pub async fn execute(&self, script: Script) -> Result<Value, CommandError> {
        tracing::trace!(op = script.op(), selector = ?script.selector(), "executing script");
        self.target
            .evaluate(script)
            .await
            .map_err(|failure| self.normalize(failure))
    }

    /// Evaluate a script and decode its result.
    ///
    /// # Errors
    /// Returns the normalized remote failure, or a transport error if the
    /// result does not have the expected shape.
    pub async fn execute_as<T: DeserializeOwned>(&self, script: Script) -> Result<T, CommandError> {
        let op = script.op();
        let value = self.execute(script).await?;
        serde_json::from_value(value)
            .map_err(|e| CommandError::Transport(format!("unexpected result from {op}: {e}")))
    }

    /// Whether an element matches `selector`.
    ///
    /// # Errors
    /// Returns the normalized remote failure.
    pub async fn has_element(&self, selector: &str) -> Result<bool, CommandError> {
        self.execute_as(Script::has_element(selector)).await
    }

    /// Start loading a URL.
    ///
    /// # Errors
    /// Returns the normalized remote failure.
    pub async fn load_url(&self, url: &str, options: &NavigateOptions) -> Result<(), CommandError> {
        self.target
            .load_url(url, options)
            .await
            .map_err(|failure| self.normalize(failure))
    }

    /// Current document title.
    ///
    /// # Errors
    /// Returns the normalized remote failure.
    pub async fn title(&self) -> Result<String, CommandError> {
        self.target
            .title()
            .await
            .map_err(|failure| self.normalize(failure))
    }

    /// Close the target gracefully.
    ///
    /// # Errors
    /// Returns the normalized remote failure.
    pub async fn close(&self) -> Result<(), CommandError> {
        self.target
            .close()
            .await
            .map_err(|failure| self.normalize(failure))
    }

    /// Destroy the target.
    ///
    /// # Errors
    /// Returns the normalized remote failure.
    pub async fn destroy(&self) -> Result<(), CommandError> {
        self.target
            .destroy()
            .await
            .map_err(|failure| self.normalize(failure))
    }
}
