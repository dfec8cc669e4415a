//! Error kinds surfaced by this subsystem, per the §7 error taxonomy:
//! setup failures are synchronous, transient I/O is swallowed and retried,
//! and hard read/write failures are delivered as events rather than
//! propagated through a `Result`.

use std::io;
use std::net::SocketAddr;

use dgram_core::error::{CoreError, ErrorCategory, IntoCoreError, RetryAdvice};
use std::time::Duration;

/// Failures this crate can surface. `TransientIo` never reaches a caller —
/// it is handled internally by rescheduling on the next readiness edge —
/// but is listed here to document the full state space the internals
/// reason about.
#[derive(Debug, thiserror::Error)]
pub enum UdpError {
    #[error("failed to set up UDP socket on {addr}: {source}")]
    IoSetup {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("transient I/O condition: {0}")]
    TransientIo(#[source] io::Error),

    #[error("unrecoverable read failure: {0}")]
    Read(#[source] io::Error),

    #[error("datagram exceeded maximum size {max_datagram_size} bytes")]
    DatagramTooLarge { max_datagram_size: usize },

    #[error("unrecoverable write failure: {0}")]
    Write(#[source] io::Error),

    #[error("connection is not connected; an explicit destination is required")]
    NotConnected,

    #[error("operation invalid in connection state {state}")]
    InvalidState { state: &'static str },
}

impl UdpError {
    /// `true` for errno classes the core retries locally and never turns
    /// into a callback (`EAGAIN`/`EWOULDBLOCK`/`EINTR`/not-connected).
    pub fn is_transient(err: &io::Error) -> bool {
        matches!(
            err.kind(),
            io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted | io::ErrorKind::NotConnected
        )
    }
}

impl IntoCoreError for UdpError {
    fn into_core_error(self) -> CoreError {
        let code = match &self {
            UdpError::IoSetup { .. } => dgram_core::error::codes::IO_SETUP,
            UdpError::Read(_) | UdpError::DatagramTooLarge { .. } => {
                dgram_core::error::codes::READ
            }
            UdpError::Write(_) => dgram_core::error::codes::WRITE,
            UdpError::TransientIo(_) => dgram_core::error::codes::READ,
            UdpError::NotConnected | UdpError::InvalidState { .. } => dgram_core::error::codes::IO_SETUP,
        };
        let category = match &self {
            UdpError::TransientIo(_) => {
                ErrorCategory::Retryable(RetryAdvice::after(Duration::from_millis(1)))
            }
            _ => ErrorCategory::NonRetryable,
        };
        CoreError::new(code, self.to_string())
            .with_category(category)
            .with_source(self)
    }
}
