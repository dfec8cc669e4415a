//! Per-connection egress driver: wraps the timing wheel with byte
//! accounting, matching the source's `UDPQueue` sitting in front of its
//! `PacketQueue`.

use std::time::Instant;

use crate::config::UdpConfig;
use crate::packet::Packet;
use crate::wheel::PacketQueue;

pub struct UDPQueue {
    wheel: PacketQueue,
    pending_bytes: u64,
    soft_cap: u64,
}

impl UDPQueue {
    pub fn new(config: &UdpConfig, now: Instant) -> Self {
        Self {
            wheel: PacketQueue::new(config.slot_time, config.n_slots, config.long_term_drain_interval, now),
            pending_bytes: 0,
            soft_cap: config.pending_bytes_soft_cap,
        }
    }

    /// Enqueue a packet for eventual delivery. Never rejects on the soft
    /// cap — it's advisory, surfaced via [`UDPQueue::is_over_soft_cap`]
    /// for callers that want to shed load themselves.
    pub fn submit(&mut self, packet: Packet, now: Instant) {
        self.pending_bytes += packet.length() as u64;
        self.wheel.add(packet, now);
    }

    /// Pop every packet due by `now`, silently dropping any whose
    /// generation went stale after it was enqueued (invariant 6: a
    /// cancelled packet never reaches a `send*` syscall).
    pub fn service(&mut self, now: Instant) -> Vec<Packet> {
        let mut due = Vec::new();
        while let Some(packet) = self.wheel.pop_due(now) {
            self.pending_bytes = self.pending_bytes.saturating_sub(packet.length() as u64);
            if !packet.is_cancelled() {
                due.push(packet);
            }
        }
        due
    }

    /// Put a run of packets that couldn't be sent this tick — a transient
    /// error stopped a batch partway through — back at the head of the
    /// current slot, in their original order, so they are retried before
    /// newer packets rather than being reordered behind them or dropped.
    pub fn requeue_remaining(&mut self, packets: Vec<Packet>) {
        let bytes: u64 = packets.iter().map(|p| p.length() as u64).sum();
        self.pending_bytes += bytes;
        self.wheel.requeue_to_now_slot(packets);
    }

    pub fn earliest_deadline(&self) -> Option<Instant> {
        self.wheel.earliest_deadline()
    }

    /// Reclaim memory held by cancelled packets before their delivery
    /// time would otherwise bring them to `service()`. Cheap to call
    /// every tick since `slots_to_scan` bounds the work.
    pub fn purge_cancelled(&mut self, slots_to_scan: usize) {
        let freed = self.wheel.purge_cancelled(slots_to_scan);
        self.pending_bytes = self.pending_bytes.saturating_sub(freed);
    }

    pub fn pending_bytes(&self) -> u64 {
        self.pending_bytes
    }

    pub fn is_over_soft_cap(&self) -> bool {
        self.pending_bytes > self.soft_cap
    }

    pub fn len(&self) -> u64 {
        self.wheel.len()
    }

    pub fn is_empty(&self) -> bool {
        self.wheel.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::test_support::fake_owner;
    use bytes::Bytes;
    use std::time::Duration;

    #[test]
    fn pending_bytes_tracks_submit_and_service() {
        let now = Instant::now();
        let config = UdpConfig::default();
        let mut queue = UDPQueue::new(&config, now);
        let owner = fake_owner(0);
        let packet = Packet::new_outbound(
            "127.0.0.1:9".parse().unwrap(),
            None,
            Bytes::from_static(b"hello"),
            owner,
            0,
            0,
        );
        queue.submit(packet, now);
        assert_eq!(queue.pending_bytes(), 5);
        let due = queue.service(now + Duration::from_millis(1));
        assert_eq!(due.len(), 1);
        assert_eq!(queue.pending_bytes(), 0);
    }

    /// S3 — packets enqueued under a cancelled generation never reach
    /// `service()`, even once their delivery time has passed.
    #[test]
    fn cancelled_generation_packets_are_dropped_at_dequeue() {
        let now = Instant::now();
        let config = UdpConfig::default();
        let mut queue = UDPQueue::new(&config, now);
        let owner = fake_owner(0);

        let a = Packet::new_outbound(
            "127.0.0.1:9".parse().unwrap(),
            Some(now + Duration::from_millis(10)),
            Bytes::from_static(b"a"),
            owner.clone(),
            0,
            0,
        );
        let b = Packet::new_outbound(
            "127.0.0.1:9".parse().unwrap(),
            Some(now + Duration::from_millis(15)),
            Bytes::from_static(b"b"),
            owner.clone(),
            0,
            0,
        );
        queue.submit(a, now);
        queue.submit(b, now);

        owner.cancel_pending(); // generation 0 -> 1

        let c = Packet::new_outbound(
            "127.0.0.1:9".parse().unwrap(),
            Some(now + Duration::from_millis(20)),
            Bytes::from_static(b"c"),
            owner,
            1,
            0,
        );
        queue.submit(c, now);

        let due = queue.service(now + Duration::from_millis(30));
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].payload().as_ref(), b"c");
    }
}
