//! Statically-typed script descriptors interpreted by the remote target.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A unit of remote evaluation: an opcode plus typed arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Script {
    /// Invoke a function registered on the remote side with JSON arguments.
    Call {
        function: String,
        #[serde(default)]
        args: Vec<Value>,
    },
    /// Whether an element matches `selector`.
    HasElement { selector: String },
    /// Dispatch mouseover, mousedown, click and mouseup on the element.
    Click { selector: String },
    /// Focus the element and type `text` one key at a time.
    Type {
        selector: String,
        text: String,
        #[serde(default)]
        append: bool,
        typing_interval_ms: u64,
    },
    /// The document body's HTML.
    BodyHtml,
}

impl Script {
    /// Call a remote function.
    #[must_use]
    pub fn call(function: impl Into<String>, args: Vec<Value>) -> Self {
        Self::Call {
            function: function.into(),
            args,
        }
    }

    /// Probe for an element.
    #[must_use]
    pub fn has_element(selector: impl Into<String>) -> Self {
        Self::HasElement {
            selector: selector.into(),
        }
    }

    /// Opcode name, for logs.
    #[must_use]
    pub const fn op(&self) -> &'static str {
        match self {
            Self::Call { .. } => "call",
            Self::HasElement { .. } => "has_element",
            Self::Click { .. } => "click",
            Self::Type { .. } => "type",
            Self::BodyHtml => "body_html",
        }
    }

    /// Selector the script targets, if any.
    #[must_use]
    pub fn selector(&self) -> Option<&str> {
        match self {
            Self::HasElement { selector } | Self::Click { selector } | Self::Type { selector, .. } => {
                Some(selector)
            }
            Self::Call { .. } | Self::BodyHtml => None,
        }
    }
}
