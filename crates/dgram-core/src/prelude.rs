//! Convenience re-exports for downstream crates.

pub use crate::address::SocketEndpoint;
pub use crate::cancellation::Cancellation;
pub use crate::clock::{Clock, Sleep, SystemClock};
pub use crate::error::{CoreError, ErrorCategory, IntoCoreError, Result, RetryAdvice};
