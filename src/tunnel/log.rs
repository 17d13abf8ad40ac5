//! Per-session log fan-out.
//!
//! Every message goes to `tracing`, to the caller's log callback when its
//! severity passes the configured level, and, for errors, into a bounded
//! last-error buffer the controller can read back after a failed call.

use std::any::Any;
use std::sync::Arc;

use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::config::LogLevel;

/// Upper bound of the last-error buffer, in bytes.
pub const LAST_ERROR_CAPACITY: usize = 2000;

/// Opaque value handed back to the log callback.
pub type UserContext = Arc<dyn Any + Send + Sync>;

/// Receives `(context, message, severity)` for every message that passes
/// the session's log level.
pub type LogCallback = Arc<dyn Fn(&LogContext<'_>, &str, LogLevel) + Send + Sync>;

/// Identifies the session a callback invocation comes from.
pub struct LogContext<'a> {
    pub session_id: Uuid,
    pub user_context: Option<&'a UserContext>,
}

impl LogContext<'_> {
    /// Downcast the user context to a concrete type.
    pub fn user_context<T: Any>(&self) -> Option<&T> {
        self.user_context.and_then(|context| context.downcast_ref::<T>())
    }
}

pub(crate) struct SessionLogger {
    session_id: Uuid,
    level: LogLevel,
    callback: Option<LogCallback>,
    user_context: Option<UserContext>,
    last_error: String,
}

impl SessionLogger {
    pub(crate) fn new(
        session_id: Uuid,
        level: LogLevel,
        callback: Option<LogCallback>,
        user_context: Option<UserContext>,
    ) -> Self {
        Self {
            session_id,
            level,
            callback,
            user_context,
            last_error: String::new(),
        }
    }

    pub(crate) fn error(&mut self, message: &str) {
        error!(session_id = %self.session_id, "{}", message);
        self.store_last_error(message);
        self.notify(message, LogLevel::Error);
    }

    pub(crate) fn warn(&self, message: &str) {
        warn!(session_id = %self.session_id, "{}", message);
        self.notify(message, LogLevel::Warn);
    }

    pub(crate) fn info(&self, message: &str) {
        info!(session_id = %self.session_id, "{}", message);
        self.notify(message, LogLevel::Info);
    }

    pub(crate) fn debug(&self, message: &str) {
        debug!(session_id = %self.session_id, "{}", message);
        self.notify(message, LogLevel::Debug);
    }

    pub(crate) fn last_error(&self) -> &str {
        &self.last_error
    }

    fn notify(&self, message: &str, severity: LogLevel) {
        if !self.level.allows(severity) {
            return;
        }
        if let Some(callback) = &self.callback {
            let context = LogContext {
                session_id: self.session_id,
                user_context: self.user_context.as_ref(),
            };
            callback(&context, message, severity);
        }
    }

    fn store_last_error(&mut self, message: &str) {
        let mut end = message.len().min(LAST_ERROR_CAPACITY);
        while !message.is_char_boundary(end) {
            end -= 1;
        }
        self.last_error.clear();
        self.last_error.push_str(&message[..end]);
    }
}
