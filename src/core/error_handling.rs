//! Generic error reporting for the CLI boundary
//!
//! Errors that carry a message the operator can act on (a dependency cycle, an
//! unknown command) are shown verbatim. Everything else is reported with the
//! operation context only, and the full error goes to the debug log.

/// Errors that can tell user-actionable failures from system failures
///
/// When `is_user_actionable()` returns `true`, `user_message()` must return
/// `Some(message)`; otherwise it returns `None`.
pub trait ContextualError: std::error::Error {
    /// True if the error message should be shown to the operator as-is
    fn is_user_actionable(&self) -> bool;

    /// The message to show for user-actionable errors
    fn user_message(&self) -> Option<String>;
}

/// Render the line shown to the operator for a fatal error
pub fn fatal_message<E: ContextualError>(error: &E, operation_context: &str) -> String {
    match error.user_message() {
        Some(user_msg) if error.is_user_actionable() => user_msg,
        _ => format!("{} failed", operation_context),
    }
}

/// Log an error with the detail level matching its kind
pub fn log_error_with_context<E: ContextualError + std::fmt::Debug>(
    error: &E,
    operation_context: &str,
) {
    log::error!("FATAL: {}", fatal_message(error, operation_context));
    log::debug!("DETAIL: {}", error);
    log::debug!("DEBUG_DETAILS: {:?}", error);
}
