//! Job envelopes: the encoded `(task, args, kwargs)` carried as job payload.
//!
//! Arguments are held as JSON values. Converting a caller's arguments into
//! values happens when the call is built, so an argument that cannot be
//! serialized is rejected before anything is sent to the broker.
//!
//! The default `JsonCodec` writes a three element array:
//!
//! ```text
//! ["add", [1, 2], {"verbose": true}]
//! ```

use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::CodecError;

/// Arguments of a single task call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskCall {
    /// Positional arguments.
    pub args: Vec<Value>,
    /// Keyword arguments.
    pub kwargs: Map<String, Value>,
}

impl TaskCall {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_parts(args: Vec<Value>, kwargs: Map<String, Value>) -> Self {
        Self { args, kwargs }
    }

    /// Appends a positional argument.
    ///
    /// # Errors
    ///
    /// Returns `CodecError::Serialization` if the value cannot be represented as JSON.
    pub fn arg<T: Serialize>(mut self, value: T) -> Result<Self, CodecError> {
        self.args
            .push(serde_json::to_value(value).map_err(CodecError::Serialization)?);
        Ok(self)
    }

    /// Sets a keyword argument.
    ///
    /// # Errors
    ///
    /// Returns `CodecError::Serialization` if the value cannot be represented as JSON.
    pub fn kwarg<T: Serialize>(mut self, key: impl Into<String>, value: T) -> Result<Self, CodecError> {
        self.kwargs.insert(
            key.into(),
            serde_json::to_value(value).map_err(CodecError::Serialization)?,
        );
        Ok(self)
    }
}

/// A task invocation as transported to workers.
#[derive(Debug, Clone, PartialEq)]
pub struct JobInvocation {
    pub task: String,
    pub args: Vec<Value>,
    pub kwargs: Map<String, Value>,
}

impl JobInvocation {
    pub fn new(task: impl Into<String>, call: TaskCall) -> Self {
        Self {
            task: task.into(),
            args: call.args,
            kwargs: call.kwargs,
        }
    }

    /// Splits off the task name, returning the call arguments.
    pub fn into_parts(self) -> (String, TaskCall) {
        (
            self.task,
            TaskCall {
                args: self.args,
                kwargs: self.kwargs,
            },
        )
    }
}

/// Encodes and decodes job envelopes.
pub trait EnvelopeCodec: Send + Sync {
    fn encode(&self, invocation: &JobInvocation) -> Result<Vec<u8>, CodecError>;

    fn decode(&self, payload: &[u8]) -> Result<JobInvocation, CodecError>;
}

/// JSON array codec: `[task, args, kwargs]`.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl EnvelopeCodec for JsonCodec {
    fn encode(&self, invocation: &JobInvocation) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(&(&invocation.task, &invocation.args, &invocation.kwargs))
            .map_err(CodecError::Serialization)
    }

    fn decode(&self, payload: &[u8]) -> Result<JobInvocation, CodecError> {
        let (task, args, kwargs): (String, Vec<Value>, Map<String, Value>) =
            serde_json::from_slice(payload).map_err(CodecError::Deserialization)?;
        Ok(JobInvocation { task, args, kwargs })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;

    fn roundtrip(invocation: &JobInvocation) -> JobInvocation {
        let codec = JsonCodec;
        let bytes = codec.encode(invocation).expect("encode");
        codec.decode(&bytes).expect("decode")
    }

    #[test]
    fn test_wire_format() {
        let call = TaskCall::new()
            .arg(1)
            .and_then(|c| c.arg(2))
            .and_then(|c| c.kwarg("verbose", true))
            .expect("serializable");
        let bytes = JsonCodec
            .encode(&JobInvocation::new("add", call))
            .expect("encode");
        assert_eq!(
            String::from_utf8(bytes).expect("utf8"),
            r#"["add",[1,2],{"verbose":true}]"#
        );
    }

    #[test]
    fn test_nested_values_roundtrip() {
        let args = vec![
            json!(null),
            json!(true),
            json!(-42),
            json!(u64::MAX),
            json!(1.25),
            json!("text with \"quotes\" and ünicode"),
            json!([1, [2, [3, {"deep": [null, false]}]]]),
        ];
        let mut kwargs = Map::new();
        kwargs.insert("config".to_string(), json!({"a": {"b": [1.5, "x"]}, "c": {}}));
        kwargs.insert("empty".to_string(), json!([]));

        let invocation = JobInvocation {
            task: "process".to_string(),
            args,
            kwargs,
        };
        assert_eq!(roundtrip(&invocation), invocation);
    }

    #[test]
    fn test_empty_call_roundtrip() {
        let invocation = JobInvocation::new("noop", TaskCall::new());
        assert_eq!(roundtrip(&invocation), invocation);
    }

    #[test]
    fn test_non_string_map_keys_fail_when_call_is_built() {
        let mut bad = HashMap::new();
        bad.insert((1, 2), "tuple keys are not JSON");

        let err = TaskCall::new().arg(bad).expect_err("unserializable");
        assert!(matches!(err, CodecError::Serialization(_)));
    }

    #[test]
    fn test_malformed_payload_is_rejected() {
        let err = JsonCodec.decode(b"not json").expect_err("garbage");
        assert!(matches!(err, CodecError::Deserialization(_)));

        let err = JsonCodec.decode(br#"["add", 1, {}]"#).expect_err("args not a list");
        assert!(matches!(err, CodecError::Deserialization(_)));
    }

    #[test]
    fn test_into_parts() {
        let call = TaskCall::new().arg("x").expect("serializable");
        let (task, parts) = JobInvocation::new("echo", call.clone()).into_parts();
        assert_eq!(task, "echo");
        assert_eq!(parts, call);
    }
}
