//! Shared contracts reused across the datagram I/O crate family.
//!
//! This crate carries the parts of the ambient stack that don't belong to
//! any one protocol: a slim error taxonomy, a cancellation primitive, a
//! clock abstraction swappable for deterministic tests, and a
//! platform-independent socket address representation.

pub mod address;
pub mod cancellation;
pub mod clock;
pub mod error;
pub mod prelude;

pub use address::SocketEndpoint;
pub use cancellation::Cancellation;
pub use clock::{Clock, MockClock, SystemClock};
pub use error::{CoreError, ErrorCategory, Result, RetryAdvice};
