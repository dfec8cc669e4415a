//! The callback contract connections use to report activity upward,
//! replacing the source's continuation + event-code dispatch with a typed
//! `Event` enum delivered through one trait method (§9 redesign).

use crate::error::UdpError;

/// Everything a [`crate::connection::Connection`] can report about itself.
/// `#[non_exhaustive]` so new event kinds can be added without breaking
/// downstream observers.
#[derive(Debug)]
#[non_exhaustive]
pub enum Event {
    /// The connection's socket is bound and ready to send/receive.
    Open,
    /// A connected (not just bound) socket finished its `connect()` call.
    ConnectSuccess,
    ConnectError(UdpError),
    /// One or more datagrams are now sitting in the receive queue; the
    /// upper layer drains them with [`crate::connection::Connection::
    /// recv`] rather than receiving the payload inline here, matching the
    /// source's "notify, then pull" `DATAGRAM_READ_READY` contract.
    ReadReady,
    ReadError(UdpError),
    /// A previously-enqueued packet was flushed to the kernel.
    WriteReady,
    WriteError(UdpError),
}

/// Implemented by whoever owns a connection and wants to hear about its
/// activity. One instance per connection; invoked from whichever task
/// drives that connection's actor loop, never concurrently with itself.
pub trait DatagramObserver: Send + Sync + 'static {
    fn on_event(&self, event: Event);
}

/// An observer that discards everything. Useful for connections created
/// purely to be polled synchronously via `recv()`/`try_recv()` rather than
/// driven by callback.
pub struct NullObserver;

impl DatagramObserver for NullObserver {
    fn on_event(&self, _event: Event) {}
}
