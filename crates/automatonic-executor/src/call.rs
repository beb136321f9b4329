//! Builder for remote function calls.

use automatonic_core::{CommandError, Script};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

/// Call build error.
#[derive(Debug, Error)]
pub enum CallBuildError {
    #[error("Function name is empty")]
    EmptyFunction,
    #[error("Argument {index} cannot be encoded: {source}")]
    Encode {
        index: usize,
        #[source]
        source: serde_json::Error,
    },
}

impl From<CallBuildError> for CommandError {
    fn from(err: CallBuildError) -> Self {
        Self::Argument(err.to_string())
    }
}

/// Builder for a [`Script::Call`].
///
/// Arguments are JSON-encoded as they are added; the first encoding failure
/// is reported by [`CallBuilder::build`].
#[derive(Debug)]
pub struct CallBuilder {
    function: String,
    args: Vec<Value>,
    error: Option<CallBuildError>,
}

impl CallBuilder {
    /// Create a builder for `function`.
    #[must_use]
    pub fn new<S: Into<String>>(function: S) -> Self {
        Self {
            function: function.into(),
            args: Vec::new(),
            error: None,
        }
    }

    /// Append one argument.
    #[must_use]
    pub fn arg<T: Serialize + ?Sized>(mut self, value: &T) -> Self {
        if self.error.is_none() {
            match serde_json::to_value(value) {
                Ok(v) => self.args.push(v),
                Err(source) => {
                    self.error = Some(CallBuildError::Encode {
                        index: self.args.len(),
                        source,
                    });
                }
            }
        }
        self
    }

    /// Append several arguments.
    #[must_use]
    pub fn args<I>(self, values: I) -> Self
    where
        I: IntoIterator,
        I::Item: Serialize,
    {
        values.into_iter().fold(self, |builder, v| builder.arg(&v))
    }

    /// Override the function name.
    #[must_use]
    pub fn override_function<S: Into<String>>(mut self, function: S) -> Self {
        self.function = function.into();
        self
    }

    /// Build the script.
    ///
    /// # Errors
    /// Returns error if the function name is empty or an argument failed to
    /// encode.
    pub fn build(self) -> Result<Script, CallBuildError> {
        if let Some(err) = self.error {
            return Err(err);
        }
        if self.function.trim().is_empty() {
            return Err(CallBuildError::EmptyFunction);
        }
        Ok(Script::call(self.function, self.args))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use serde_json::json;

    use super::*;

    #[test]
    fn test_build_call() {
        let script = CallBuilder::new("fill")
            .arg("#name")
            .arg(&json!({"append": true}))
            .args([1, 2])
            .build()
            .unwrap();

        assert_eq!(
            script,
            Script::call("fill", vec![json!("#name"), json!({"append": true}), json!(1), json!(2)])
        );
    }

    #[test]
    fn test_empty_function_rejected() {
        assert!(matches!(
            CallBuilder::new("  ").build(),
            Err(CallBuildError::EmptyFunction)
        ));
    }

    #[test]
    fn test_unencodable_argument_reported() {
        // Maps with non-string keys have no JSON form.
        let mut bad = HashMap::new();
        bad.insert(vec![1u8], 1);

        let err = CallBuilder::new("f").arg(&1).arg(&bad).arg(&2).build().unwrap_err();
        assert!(matches!(err, CallBuildError::Encode { index: 1, .. }));

        let command_error = CommandError::from(err);
        assert!(matches!(command_error, CommandError::Argument(_)));
    }
}
