//! UDP datagram I/O subsystem: a timing-wheel egress scheduler, a
//! thread-affined connection state machine, and a connection registry,
//! built to sit under any upper layer (QUIC, SIP/RTP, DNS, ...) that
//! needs precisely-timed outbound packets and demultiplexed inbound
//! packets over connectionless sockets.
//!
//! The three pieces tie together like this: a [`manager::ConnectionManager`]
//! hands out [`connection::Connection`]s (plain or accept-flavoured); each
//! owns a private [`queue::UDPQueue`], itself wrapping a [`wheel::PacketQueue`]
//! timing wheel, to schedule its outbound [`packet::Packet`]s; activity is
//! reported to the caller through the [`observer::DatagramObserver`]
//! trait. See `SPEC_FULL.md` at the workspace root for the full component
//! breakdown this crate implements.

#[cfg(feature = "runtime-tokio")]
pub mod batch;
pub mod config;
pub mod connection;
pub mod error;
pub mod manager;
pub mod observer;
pub mod packet;
pub mod queue;
pub mod wheel;

pub use config::UdpConfig;
pub use connection::{Connection, ConnectionHandle, ConnectionState};
pub use error::UdpError;
pub use manager::ConnectionManager;
pub use observer::{DatagramObserver, Event, NullObserver};
pub use packet::Packet;
