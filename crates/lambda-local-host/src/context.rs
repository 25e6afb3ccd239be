//! Invocation context host functions.

use lambda_local_core::store::InvocationState;
use tracing::debug;

/// Host implementation of `env.fail` and `env.remaining_time_ms`.
pub struct ContextHost;

impl ContextHost {
    /// Record a handler error. The invocation fails with this message once the
    /// handler returns or traps.
    pub fn fail(state: &mut InvocationState, message: &str) {
        debug!(request_id = %state.request_id, "Guest reported an error");
        state.report_error(message.to_string());
    }

    /// Milliseconds until the invocation deadline.
    pub fn remaining_time_ms(state: &InvocationState) -> i64 {
        state.remaining_time_ms()
    }
}
