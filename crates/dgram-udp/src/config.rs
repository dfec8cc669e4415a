//! Plain configuration data for the subsystem. No file-format parsing
//! lives here — config-file parsing is out of scope for this crate
//! (spec §1); callers build this struct however they like and pass it in.

use std::time::Duration;

/// Tunables for [`crate::manager::ConnectionManager`] and the connections
/// it creates.
#[derive(Clone, Debug)]
pub struct UdpConfig {
    /// Number of reactor threads intended to own UDP connections. This
    /// crate does not spawn the runtime itself; the value is informational
    /// for callers sizing their own tokio runtime.
    pub n_udp_threads: usize,

    /// Width of one timing-wheel bucket.
    pub slot_time: Duration,

    /// Number of buckets in the timing wheel. Horizon = `slot_time *
    /// n_slots`.
    pub n_slots: usize,

    /// Buffers per receive batch, each `recv_chunk_size` bytes. Sized for
    /// a caller building [`crate::batch::RecvBatchSlot`] arrays; the
    /// portable per-datagram path `Connection` itself drives does not
    /// need a batch width since it reads until would-block.
    pub max_niov: usize,

    /// Size in bytes of each receive buffer chunk.
    pub recv_chunk_size: usize,

    /// Hard ceiling a receive buffer may grow to before a truncated
    /// datagram becomes a `ReadError` instead of triggering adaptive
    /// growth (§9 open-question resolution).
    pub max_datagram_size: usize,

    /// Advisory counter threshold; crossing it is visible to callers via
    /// [`crate::queue::UDPQueue::pending_bytes`] but enforces nothing on
    /// its own.
    pub pending_bytes_soft_cap: u64,

    pub recv_buf_size: Option<usize>,
    pub send_buf_size: Option<usize>,

    /// If `true`, bind failures are fatal (`IoSetup` is always returned);
    /// this flag exists purely as documentation of intent for callers that
    /// want to branch on it themselves, since `create` always returns a
    /// `Result` regardless.
    pub restricted_bind_mode: bool,

    /// Interval at which the long-term overflow list is re-triaged into
    /// the wheel. Defaults to half the horizon.
    pub long_term_drain_interval: Duration,
}

impl UdpConfig {
    pub fn horizon(&self) -> Duration {
        self.slot_time * self.n_slots as u32
    }
}

impl Default for UdpConfig {
    fn default() -> Self {
        let slot_time = Duration::from_millis(20);
        let n_slots = 2048;
        Self {
            n_udp_threads: 1,
            slot_time,
            n_slots,
            max_niov: 1,
            recv_chunk_size: 2048,
            max_datagram_size: 65_507,
            pending_bytes_soft_cap: 16 * 1024 * 1024,
            recv_buf_size: None,
            send_buf_size: None,
            restricted_bind_mode: false,
            long_term_drain_interval: slot_time * (n_slots as u32 - 1) / 2,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_horizon_is_roughly_forty_seconds() {
        let config = UdpConfig::default();
        assert_eq!(config.horizon(), Duration::from_millis(20 * 2048));
    }
}
