//! The unit of send and receive for this subsystem: a single datagram plus
//! whatever scheduling metadata the egress path needs to place it in the
//! timing wheel.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;

use crate::connection::ConnectionHandle;

/// Where a [`Packet`] currently lives. Kept on the packet itself so the
/// timing wheel can remove it in O(1) without a separate index structure.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum BucketIndex {
    #[default]
    None,
    Bucket(u16),
    LongTerm,
}

/// Scheduling metadata present only on outbound packets.
#[derive(Clone)]
pub struct OutboundMeta {
    pub delivery_time: Option<Instant>,
    pub cancel_generation: u64,
    pub owner: ConnectionHandle,
    pub bucket: BucketIndex,
}

/// A single UDP datagram: payload plus endpoints, optionally carrying
/// outbound scheduling metadata.
#[derive(Clone)]
pub struct Packet {
    pub from: Option<SocketAddr>,
    pub to: Option<SocketAddr>,
    payload: Bytes,
    pub segment_size: u16,
    pub outbound: Option<OutboundMeta>,
}

impl Packet {
    /// Build an outbound packet destined for `to`, eligible for send at
    /// `delivery_time` (`None` means "as soon as possible").
    pub fn new_outbound(
        to: SocketAddr,
        delivery_time: Option<Instant>,
        payload: Bytes,
        owner: ConnectionHandle,
        cancel_generation: u64,
        segment_size: u16,
    ) -> Self {
        Self {
            from: None,
            to: Some(to),
            payload,
            segment_size,
            outbound: Some(OutboundMeta {
                delivery_time,
                cancel_generation,
                owner,
                bucket: BucketIndex::None,
            }),
        }
    }

    /// Build an inbound packet as received off the wire.
    pub fn new_inbound(from: SocketAddr, to: SocketAddr, payload: Bytes) -> Self {
        Self {
            from: Some(from),
            to: Some(to),
            payload,
            segment_size: 0,
            outbound: None,
        }
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Total payload length. `bytes::Bytes` already tracks this in O(1);
    /// this method exists so callers don't need to reach into the payload
    /// field directly, matching the source contract's `length()`.
    pub fn length(&self) -> usize {
        self.payload.len()
    }

    /// Materialise a contiguous owned view of the payload. `Bytes` is
    /// already a single contiguous allocation in this implementation, so
    /// this never copies, but the method is kept as a stable seam for
    /// callers that previously dealt with a chained buffer representation.
    pub fn entire_buffer(&self) -> Bytes {
        self.payload.clone()
    }

    pub fn is_due(&self, now: Instant) -> bool {
        match &self.outbound {
            Some(meta) => meta.delivery_time.is_none_or(|t| t <= now),
            None => true,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        match &self.outbound {
            Some(meta) => meta.cancel_generation != meta.owner.send_generation(),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inbound_packet_has_no_outbound_metadata() {
        let pkt = Packet::new_inbound(
            "127.0.0.1:1".parse().unwrap(),
            "127.0.0.1:2".parse().unwrap(),
            Bytes::from_static(b"hi"),
        );
        assert!(pkt.outbound.is_none());
        assert_eq!(pkt.length(), 2);
    }
}
