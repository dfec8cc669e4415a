//! Process-wide connection registry (source `UDP2ConnectionManager`).
//!
//! Keyed by the `(local, peer)` tuple so a caller asking for the same
//! pair twice gets the same [`Connection`] back instead of binding a
//! second socket. Also owns the deferred-close queue: [`Connection`]s
//! that finish draining hand themselves here rather than tearing down
//! inline, so destruction always happens on a predictable tick instead of
//! inside whatever call stack happened to notice the queues went empty.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use dgram_core::clock::Clock;

use crate::config::UdpConfig;
use crate::connection::{Connection, ConnectionState};
use crate::error::UdpError;
use crate::observer::DatagramObserver;

#[cfg(feature = "runtime-tokio")]
use tokio::sync::Notify;

type ConnKey = (SocketAddr, Option<SocketAddr>);

/// Registry of live connections plus a deferred-close queue, reaped on a
/// background tick rather than synchronously inside `close()` (§4.6).
pub struct ConnectionManager {
    connections: DashMap<ConnKey, Connection>,
    deferred_close: Mutex<VecDeque<Connection>>,
    #[cfg(feature = "runtime-tokio")]
    reap_notify: Notify,
}

impl ConnectionManager {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            connections: DashMap::new(),
            deferred_close: Mutex::new(VecDeque::new()),
            #[cfg(feature = "runtime-tokio")]
            reap_notify: Notify::new(),
        })
    }

    /// Spawn the background reaper task that drains the deferred-close
    /// queue. Separate from `new()` so tests that never close a
    /// connection don't need a runtime running just to construct a
    /// manager. A connection closed while still draining (queues
    /// non-empty) isn't removed by the notification that queued it —
    /// its actor loop hasn't reached `Dead` yet — so the reaper also
    /// wakes on a fixed interval to retry until it has.
    #[cfg(feature = "runtime-tokio")]
    pub fn spawn_reaper(self: &Arc<Self>, sweep_interval: std::time::Duration) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = this.reap_notify.notified() => {}
                    _ = tokio::time::sleep(sweep_interval) => {}
                }
                this.reap_once();
            }
        });
    }

    /// Find-or-create a connection for `(local, peer)`, binding and
    /// starting its I/O if it didn't already exist.
    #[cfg(feature = "runtime-tokio")]
    pub async fn create(
        self: &Arc<Self>,
        local: SocketAddr,
        peer: Option<SocketAddr>,
        observer: Arc<dyn DatagramObserver>,
        config: UdpConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Connection, UdpError> {
        if let Some(existing) = self.find(local, peer) {
            return Ok(existing);
        }
        let conn = Connection::create(local, peer, observer, config, clock).await?;
        let key = (conn.local_addr(), conn.peer_addr());
        match self.connections.entry(key) {
            dashmap::mapref::entry::Entry::Occupied(existing) => return Ok(existing.get().clone()),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(conn.clone());
            }
        }
        conn.start_io();
        Ok(conn)
    }

    /// Create a listening connection. Never inserted into the 4-tuple
    /// map — it has no peer — so `find` can never return it; callers
    /// hold onto the handle this returns directly.
    #[cfg(feature = "runtime-tokio")]
    pub async fn create_accept(
        self: &Arc<Self>,
        local: SocketAddr,
        observer: Arc<dyn DatagramObserver>,
        config: UdpConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Connection, UdpError> {
        let conn = Connection::create_accept(local, observer, config, clock).await?;
        conn.start_io();
        Ok(conn)
    }

    pub fn find(&self, local: SocketAddr, peer: Option<SocketAddr>) -> Option<Connection> {
        self.connections.get(&(local, peer)).map(|entry| entry.value().clone())
    }

    /// Queue `connection` for destruction. Does not remove it from the
    /// map synchronously — that happens the next time the reaper (or a
    /// caller-driven [`ConnectionManager::reap_once`]) runs, matching the
    /// source's "deferred close, reaped on the next tick" contract.
    pub fn close(&self, connection: Connection) {
        connection.close();
        self.deferred_close.lock().unwrap().push_back(connection);
        #[cfg(feature = "runtime-tokio")]
        self.reap_notify.notify_one();
    }

    /// Drain the deferred-close queue, dropping the registry's reference
    /// to every entry that has actually finished draining. An entry whose
    /// connection is still `Draining` is pushed back for the next pass
    /// rather than removed early.
    pub fn reap_once(&self) {
        let mut pending = self.deferred_close.lock().unwrap();
        let mut still_pending = VecDeque::with_capacity(pending.len());
        for connection in pending.drain(..) {
            if connection.state() == ConnectionState::Dead {
                let key = (connection.local_addr(), connection.peer_addr());
                self.connections.remove(&key);
            } else {
                still_pending.push_back(connection);
            }
        }
        *pending = still_pending;
    }

    /// Number of connections currently tracked in the 4-tuple map (not
    /// counting accept connections, which are never inserted into it).
    pub fn size(&self) -> usize {
        self.connections.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observer::NullObserver;
    use dgram_core::clock::SystemClock;

    #[tokio::test]
    async fn create_is_idempotent_for_the_same_local_peer_pair() {
        let manager = ConnectionManager::new();
        let local: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let first = manager
            .create(local, None, Arc::new(NullObserver), UdpConfig::default(), Arc::new(SystemClock))
            .await
            .unwrap();
        let second = manager
            .create(first.local_addr(), None, Arc::new(NullObserver), UdpConfig::default(), Arc::new(SystemClock))
            .await
            .unwrap();
        assert_eq!(first.local_addr(), second.local_addr());
        assert_eq!(manager.size(), 1);
    }

    #[tokio::test]
    async fn close_defers_removal_until_reap() {
        let manager = ConnectionManager::new();
        let local: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let conn = manager
            .create(local, None, Arc::new(NullObserver), UdpConfig::default(), Arc::new(SystemClock))
            .await
            .unwrap();
        assert_eq!(manager.size(), 1);
        manager.close(conn);
        // Not yet reaped: still tracked.
        assert_eq!(manager.size(), 1);
        manager.reap_once();
        assert_eq!(manager.size(), 0);
    }
}
