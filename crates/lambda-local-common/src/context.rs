//! Invocation context passed to handlers alongside the event.

use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Remaining time reported when an invocation has no deadline.
pub const NO_DEADLINE: i64 = i64::MAX;

/// Milliseconds left until `deadline_ms`, never negative.
///
/// A deadline of zero means the invocation has none.
pub fn remaining_millis(deadline_ms: i64) -> i64 {
    if deadline_ms == 0 {
        return NO_DEADLINE;
    }
    (deadline_ms - Utc::now().timestamp_millis()).max(0)
}

/// Per-invocation metadata, serialized with the remote platform's field names.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct InvocationContext {
    /// Unique id of this invocation.
    pub aws_request_id: String,
    /// Name of the invoked function.
    pub function_name: String,
    /// Always `$LATEST` locally.
    pub function_version: String,
    /// Placeholder ARN derived from the function name.
    pub invoked_function_arn: String,
    /// Placeholder log group derived from the function name.
    pub log_group_name: String,
    /// Placeholder log stream derived from the function name.
    pub log_stream_name: String,
    /// Memory limit. A string on the remote platform.
    #[serde(rename = "memoryLimitInMB")]
    pub memory_limit_in_mb: String,
    /// Mobile client context. Always `null` locally.
    pub client_context: Option<Value>,
    /// Cognito identity. Always `null` locally.
    pub identity: Option<Value>,
    /// Accepted for compatibility, not emulated.
    pub callback_waits_for_empty_event_loop: bool,
    /// Absolute deadline in epoch milliseconds. Zero means none.
    pub deadline_ms: i64,
}

impl Default for InvocationContext {
    fn default() -> Self {
        Self {
            aws_request_id: String::new(),
            function_name: String::new(),
            function_version: "$LATEST".to_string(),
            invoked_function_arn: String::new(),
            log_group_name: String::new(),
            log_stream_name: String::new(),
            memory_limit_in_mb: String::new(),
            client_context: None,
            identity: None,
            callback_waits_for_empty_event_loop: true,
            deadline_ms: 0,
        }
    }
}

impl InvocationContext {
    /// Milliseconds left until the deadline, never negative.
    ///
    /// [`NO_DEADLINE`] when the context carries no deadline.
    pub fn get_remaining_time_in_millis(&self) -> i64 {
        remaining_millis(self.deadline_ms)
    }

    /// JSON form sent across a language boundary.
    ///
    /// `callbackWaitsForEmptyEventLoop` is a mutable flag of the host language
    /// and is stripped; the adapter rebuilds its own context object.
    pub fn to_portable_json(&self) -> Value {
        let mut value = serde_json::to_value(self).unwrap_or(Value::Null);
        if let Value::Object(map) = &mut value {
            map.remove("callbackWaitsForEmptyEventLoop");
        }
        value
    }
}

/// Factory for the contexts of one function.
#[derive(Debug, Clone)]
pub struct LambdaContext {
    function_name: String,
    memory_size_mb: u32,
}

impl LambdaContext {
    /// Create a context factory for a function.
    pub fn new(function_name: impl Into<String>, memory_size_mb: u32) -> Self {
        Self {
            function_name: function_name.into(),
            memory_size_mb,
        }
    }

    /// Build a fresh context for one invocation.
    pub fn create(&self, request_id: impl Into<String>, timeout: Duration) -> InvocationContext {
        let name = &self.function_name;
        let timeout_ms = i64::try_from(timeout.as_millis()).unwrap_or(i64::MAX);

        InvocationContext {
            aws_request_id: request_id.into(),
            function_name: name.clone(),
            function_version: "$LATEST".to_string(),
            invoked_function_arn: format!("offline_invokedFunctionArn_for_{name}"),
            log_group_name: format!("offline_logGroupName_for_{name}"),
            log_stream_name: format!("offline_logStreamName_for_{name}"),
            memory_limit_in_mb: self.memory_size_mb.to_string(),
            client_context: None,
            identity: None,
            callback_waits_for_empty_event_loop: true,
            deadline_ms: Utc::now().timestamp_millis().saturating_add(timeout_ms),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_context() {
        let ctx = LambdaContext::new("hello", 512).create("req-1", Duration::from_secs(6));

        assert_eq!(ctx.aws_request_id, "req-1");
        assert_eq!(ctx.function_name, "hello");
        assert_eq!(ctx.function_version, "$LATEST");
        assert_eq!(ctx.invoked_function_arn, "offline_invokedFunctionArn_for_hello");
        assert_eq!(ctx.memory_limit_in_mb, "512");
        assert!(ctx.callback_waits_for_empty_event_loop);
    }

    #[test]
    fn test_remaining_time() {
        let ctx = LambdaContext::new("hello", 128).create("req", Duration::from_secs(10));
        let remaining = ctx.get_remaining_time_in_millis();

        assert!(remaining > 9_000 && remaining <= 10_000, "remaining = {remaining}");

        let expired = InvocationContext {
            deadline_ms: 1,
            ..Default::default()
        };
        assert_eq!(expired.get_remaining_time_in_millis(), 0);

        let unbounded = InvocationContext::default();
        assert_eq!(unbounded.get_remaining_time_in_millis(), NO_DEADLINE);
    }

    #[test]
    fn test_serialized_field_names() {
        let ctx = LambdaContext::new("f", 1024).create("x", Duration::from_secs(1));
        let json = serde_json::to_value(&ctx).unwrap();

        assert_eq!(json["awsRequestId"], "x");
        assert_eq!(json["memoryLimitInMB"], "1024");
        assert_eq!(json["callbackWaitsForEmptyEventLoop"], true);
        assert!(json["deadlineMs"].is_i64());
    }

    #[test]
    fn test_portable_json_strips_callback_flag() {
        let ctx = LambdaContext::new("f", 1024).create("x", Duration::from_secs(1));
        let json = ctx.to_portable_json();

        assert!(json.get("callbackWaitsForEmptyEventLoop").is_none());
        assert_eq!(json["awsRequestId"], "x");
        // The original context is untouched.
        assert!(ctx.callback_waits_for_empty_event_loop);
    }

    #[test]
    fn test_partial_context_deserializes() {
        let ctx: InvocationContext = serde_json::from_str(r#"{"awsRequestId":"x"}"#).unwrap();
        assert_eq!(ctx.aws_request_id, "x");
        assert_eq!(ctx.function_version, "$LATEST");
    }
}
