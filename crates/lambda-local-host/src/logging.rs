//! Logging host function implementation.
//!
//! Guest log lines are both kept on the [`InvocationState`] and emitted through
//! `tracing` with the request id attached.

use lambda_local_core::store::{InvocationState, LogLevel};
use tracing::{debug, error, info, warn};

/// Host implementation of `env.log`.
pub struct LoggingHost;

impl LoggingHost {
    /// Log a message at the specified level.
    pub fn log(state: &mut InvocationState, level: LogLevel, message: &str) {
        state.log(level, message.to_string());

        let request_id = &state.request_id;
        match level {
            LogLevel::Debug => debug!(request_id, guest_log = true, "{}", message),
            LogLevel::Info => info!(request_id, guest_log = true, "{}", message),
            LogLevel::Warn => warn!(request_id, guest_log = true, "{}", message),
            LogLevel::Error => error!(request_id, guest_log = true, "{}", message),
        }
    }
}

/// Convert a numeric log level to [`LogLevel`].
///
/// 0=debug, 1=info, 2=warn, 3=error; unknown values default to info.
pub fn level_from_i32(level: i32) -> LogLevel {
    match level {
        0 => LogLevel::Debug,
        2 => LogLevel::Warn,
        3 => LogLevel::Error,
        _ => LogLevel::Info,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_logging_stores_in_state() {
        let mut state = InvocationState::new("test-123".into());

        LoggingHost::log(&mut state, LogLevel::Info, "Hello");
        LoggingHost::log(&mut state, LogLevel::Error, "World");

        assert_eq!(state.logs.len(), 2);
        assert_eq!(state.logs[0].message, "Hello");
        assert_eq!(state.logs[0].level, LogLevel::Info);
        assert_eq!(state.logs[1].message, "World");
        assert_eq!(state.logs[1].level, LogLevel::Error);
    }

    #[test]
    fn test_level_from_i32() {
        assert_eq!(level_from_i32(0), LogLevel::Debug);
        assert_eq!(level_from_i32(1), LogLevel::Info);
        assert_eq!(level_from_i32(2), LogLevel::Warn);
        assert_eq!(level_from_i32(3), LogLevel::Error);
        assert_eq!(level_from_i32(99), LogLevel::Info);
    }
}
