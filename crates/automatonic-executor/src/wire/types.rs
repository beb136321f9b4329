//! Frames exchanged with a line-delimited JSON target.

use automatonic_core::{NavigateOptions, Script, TargetEvent, TargetFailure};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Request body, tagged by `method`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum Request {
    /// Run a script; the response carries its result.
    Evaluate { script: Script },
    /// Start loading `url`. The outcome arrives as a load event.
    LoadUrl {
        url: String,
        #[serde(default)]
        options: NavigateOptions,
    },
    /// Current document title.
    Title,
    /// Close the window gracefully.
    Close,
    /// Tear the window down.
    Destroy,
}

/// Request frame written to the target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestFrame {
    pub id: u64,
    #[serde(flatten)]
    pub request: Request,
}

/// Error payload of a response frame.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WireError {
    /// Message of a thrown error object.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Stack of a thrown error object.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
    /// A thrown non-error value.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
}

impl From<WireError> for TargetFailure {
    fn from(err: WireError) -> Self {
        match err.message {
            Some(message) => Self::Exception {
                message,
                stack: err.stack,
            },
            None => Self::Thrown(err.value.unwrap_or(Value::Null)),
        }
    }
}

impl From<TargetFailure> for WireError {
    fn from(failure: TargetFailure) -> Self {
        match failure {
            TargetFailure::Exception { message, stack } => Self {
                message: Some(message),
                stack,
                value: None,
            },
            TargetFailure::Thrown(value) => Self {
                value: Some(value),
                ..Self::default()
            },
            other => Self {
                message: Some(other.to_string()),
                ..Self::default()
            },
        }
    }
}

/// Frame read from the target, tagged by `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    /// Reply to the request with the same `id`.
    Response {
        id: u64,
        #[serde(default)]
        result: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<WireError>,
    },
    /// Unsolicited lifecycle event.
    Event { event: TargetEvent },
}

impl Frame {
    /// Successful response.
    #[must_use]
    pub const fn ok(id: u64, result: Value) -> Self {
        Self::Response {
            id,
            result,
            error: None,
        }
    }

    /// Failed response.
    #[must_use]
    pub const fn err(id: u64, error: WireError) -> Self {
        Self::Response {
            id,
            result: Value::Null,
            error: Some(error),
        }
    }
}
