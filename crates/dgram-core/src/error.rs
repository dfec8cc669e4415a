//! A slim error taxonomy shared by every crate in this family.
//!
//! This is deliberately smaller than a general-purpose framework's error
//! type: there is no security classification, no distributed tracing
//! metadata, and no resource-budget accounting here. Those belong to a
//! larger host application, not to a datagram I/O core.

use std::borrow::Cow;
use std::fmt;
use std::time::Duration;

/// Default result alias used throughout the crate family.
pub type Result<T, E = CoreError> = std::result::Result<T, E>;

/// A coarse classification of an error, used by callers deciding whether
/// to retry, back off, or give up.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub enum ErrorCategory {
    /// The caller may retry, optionally after the suggested wait.
    Retryable(RetryAdvice),
    /// Retrying will not help; the condition is permanent for this call.
    NonRetryable,
    /// The operation was cancelled by the caller, not by a failure.
    Cancelled,
    /// The operation exceeded its deadline.
    Timeout,
}

/// A suggested backoff for a [`ErrorCategory::Retryable`] error.
#[derive(Clone, Debug)]
pub struct RetryAdvice {
    pub wait: Duration,
    pub reason: Option<Cow<'static, str>>,
}

impl RetryAdvice {
    pub const fn after(wait: Duration) -> Self {
        Self {
            wait,
            reason: None,
        }
    }

    pub fn with_reason(mut self, reason: impl Into<Cow<'static, str>>) -> Self {
        self.reason = Some(reason.into());
        self
    }
}

/// The crate family's top-level error type: a stable code, a human
/// message, an optional category, and an optional source error.
pub struct CoreError {
    code: &'static str,
    message: Cow<'static, str>,
    category: Option<ErrorCategory>,
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl CoreError {
    pub fn new(code: &'static str, message: impl Into<Cow<'static, str>>) -> Self {
        Self {
            code,
            message: message.into(),
            category: None,
            source: None,
        }
    }

    pub fn with_category(mut self, category: ErrorCategory) -> Self {
        self.category = Some(category);
        self
    }

    pub fn with_source(
        mut self,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    pub fn code(&self) -> &'static str {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn category(&self) -> ErrorCategory {
        self.category.clone().unwrap_or(ErrorCategory::NonRetryable)
    }
}

impl fmt::Debug for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CoreError")
            .field("code", &self.code)
            .field("message", &self.message)
            .finish_non_exhaustive()
    }
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

impl std::error::Error for CoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|boxed| boxed.as_ref() as &(dyn std::error::Error + 'static))
    }
}

/// Implemented by leaf error enums (e.g. `UdpError`) so they can cross a
/// crate boundary as a [`CoreError`] without every caller hand-writing the
/// conversion.
pub trait IntoCoreError {
    fn into_core_error(self) -> CoreError;
}

pub mod codes {
    pub const IO_SETUP: &str = "dgram.io_setup";
    pub const READ: &str = "dgram.read";
    pub const WRITE: &str = "dgram.write";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_code_and_message() {
        let err = CoreError::new(codes::READ, "boom");
        assert_eq!(err.to_string(), "[dgram.read] boom");
    }

    #[test]
    fn default_category_is_non_retryable() {
        let err = CoreError::new(codes::READ, "boom");
        assert!(matches!(err.category(), ErrorCategory::NonRetryable));
    }
}
