//! Connection state machine and the accept-side demultiplexer.
//!
//! The source models a bound/connected UDP endpoint as `UDP2ConnectionImpl`
//! and a listening, peer-demuxing endpoint as the derived
//! `AcceptUDP2ConnectionImpl`. Here that inheritance becomes one
//! `Connection` type tagged by [`ConnectionKind`] (§9 redesign): a plain
//! connection behaves exactly like today's accept-connection's children,
//! and an accept connection additionally owns a map of them.
//!
//! Each `Connection` that calls [`Connection::start_io`] gets its own
//! background task driving all of its mutable state exclusively; sends
//! from any other task go through a shared intake queue woken by a
//! `tokio::sync::Notify`, which collapses the source's same-thread /
//! cross-thread `_reenable` split into one path (§9).
//!
//! A sub-connection promoted out of an accept connection's peer map
//! (`Connection::create_sub_connection`) gets its own independently
//! connected socket rather than sharing the listener's fd: it binds the
//! same local address with `SO_REUSEPORT` set, then `connect()`s to the
//! peer, so the kernel routes every further datagram from that 4-tuple
//! straight to the dedicated socket instead of the wildcard listener.

use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Instant;

use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use dgram_core::clock::Clock;
use tracing::{debug, info_span, warn, Instrument};

use crate::config::UdpConfig;
use crate::error::UdpError;
use crate::observer::{DatagramObserver, Event};
use crate::packet::Packet;
use crate::queue::UDPQueue;

#[cfg(feature = "runtime-tokio")]
use tokio::net::UdpSocket as TokioUdpSocket;
#[cfg(feature = "runtime-tokio")]
use tokio::sync::Notify;

/// Lifecycle states. `Draining` is entered by [`Connection::close`] when
/// outbound packets are still queued; the actor loop flushes them, then
/// transitions to `Dead` and stops itself.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Init,
    Running,
    Draining,
    Dead,
}

/// What makes an accept connection different: a registry of the
/// per-peer children it demultiplexes inbound packets into, plus a
/// holding pen for datagrams that arrived before anyone claimed that
/// peer.
pub struct AcceptState {
    pub children: DashMap<SocketAddr, Connection>,
    pub unclaimed_recv: Mutex<VecDeque<Packet>>,
}

impl AcceptState {
    fn new() -> Self {
        Self {
            children: DashMap::new(),
            unclaimed_recv: Mutex::new(VecDeque::new()),
        }
    }
}

pub enum ConnectionKind {
    Plain,
    Accept(AcceptState),
}

struct ConnectionInner {
    local_addr: SocketAddr,
    peer_addr: Mutex<Option<SocketAddr>>,
    #[cfg(feature = "runtime-tokio")]
    socket: Option<Arc<TokioUdpSocket>>,
    state: Mutex<ConnectionState>,
    send_generation: AtomicU64,
    #[cfg(feature = "runtime-tokio")]
    notify: Notify,
    outbound: Mutex<UDPQueue>,
    recv_intake: Mutex<VecDeque<Packet>>,
    /// Swappable so [`Connection::close`] can detach the upper layer in
    /// place of the source's "set_continuation(null)" (§4.4, invariant 5):
    /// once swapped to [`crate::observer::NullObserver`], no callback
    /// reaches the original observer again, even if the actor loop has
    /// more ticks to run while queues drain.
    observer: Mutex<Arc<dyn DatagramObserver>>,
    kind: ConnectionKind,
    config: UdpConfig,
    clock: Arc<dyn Clock>,
    last_activity: Mutex<Instant>,
    /// Set only on children promoted out of an accept connection's peer
    /// map; used to remove the entry once this child reaches `Dead`
    /// (source `AcceptUDP2ConnectionImpl::close_connection`). `Weak` so a
    /// live child never keeps its parent's map (and thus itself) alive.
    parent: Mutex<Option<Weak<ConnectionInner>>>,
}

/// A handle to a connection. Cheap to clone; all clones share one
/// underlying state machine. Also the currency the timing wheel uses to
/// ask "does this packet still belong to a live generation" (`Packet::
/// is_cancelled`), which is why [`crate::packet::OutboundMeta::owner`] is
/// this type rather than a raw socket.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

/// Alias kept distinct from [`Connection`] at the type level so call
/// sites that only need to read generation/cancellation state read as
/// such, even though today it is the same type.
pub type ConnectionHandle = Connection;

impl Connection {
    fn new(
        local_addr: SocketAddr,
        peer_addr: Option<SocketAddr>,
        #[cfg(feature = "runtime-tokio")] socket: Option<Arc<TokioUdpSocket>>,
        kind: ConnectionKind,
        observer: Arc<dyn DatagramObserver>,
        config: UdpConfig,
        clock: Arc<dyn Clock>,
        parent: Option<Weak<ConnectionInner>>,
    ) -> Self {
        let now = clock.now();
        Self {
            inner: Arc::new(ConnectionInner {
                local_addr,
                peer_addr: Mutex::new(peer_addr),
                #[cfg(feature = "runtime-tokio")]
                socket,
                state: Mutex::new(ConnectionState::Init),
                send_generation: AtomicU64::new(0),
                #[cfg(feature = "runtime-tokio")]
                notify: Notify::new(),
                outbound: Mutex::new(UDPQueue::new(&config, now)),
                recv_intake: Mutex::new(VecDeque::new()),
                observer: Mutex::new(observer),
                kind,
                config,
                clock,
                last_activity: Mutex::new(now),
                parent: Mutex::new(parent),
            }),
        }
    }

    /// Bind a socket at `local_addr` and, if `peer_addr` is given, connect
    /// it so `send`/`recv` no longer need an explicit address (source
    /// `UDP2ConnectionImpl::connect`).
    #[cfg(feature = "runtime-tokio")]
    pub async fn create(
        local_addr: SocketAddr,
        peer_addr: Option<SocketAddr>,
        observer: Arc<dyn DatagramObserver>,
        config: UdpConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Connection, UdpError> {
        let socket = bind_socket(local_addr, &config)?;
        if let Some(peer) = peer_addr {
            socket.connect(peer).await.map_err(|source| UdpError::IoSetup { addr: peer, source })?;
        }
        let bound_addr = socket.local_addr().unwrap_or(local_addr);
        Ok(Connection::new(
            bound_addr,
            peer_addr,
            Some(Arc::new(socket)),
            ConnectionKind::Plain,
            observer,
            config,
            clock,
            None,
        ))
    }

    /// Bind a listening socket that demultiplexes inbound datagrams to
    /// per-peer children (source `AcceptUDP2ConnectionImpl`).
    #[cfg(feature = "runtime-tokio")]
    pub async fn create_accept(
        local_addr: SocketAddr,
        observer: Arc<dyn DatagramObserver>,
        config: UdpConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Connection, UdpError> {
        let socket = bind_socket(local_addr, &config)?;
        let bound_addr = socket.local_addr().unwrap_or(local_addr);
        Ok(Connection::new(
            bound_addr,
            None,
            Some(Arc::new(socket)),
            ConnectionKind::Accept(AcceptState::new()),
            observer,
            config,
            clock,
            None,
        ))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        *self.inner.peer_addr.lock().unwrap()
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.lock().unwrap()
    }

    pub fn is_accept(&self) -> bool {
        matches!(self.inner.kind, ConnectionKind::Accept(_))
    }

    /// Monotonic counter bumped by [`Connection::cancel_pending`]. A
    /// packet is stale once its recorded generation no longer matches
    /// this value (`Packet::is_cancelled`).
    pub fn send_generation(&self) -> u64 {
        self.inner.send_generation.load(Ordering::Acquire)
    }

    pub fn last_activity(&self) -> Instant {
        *self.inner.last_activity.lock().unwrap()
    }

    /// Enqueue a datagram for eventual transmission. Safe to call from any
    /// task; wakes the owning actor loop if one is running.
    pub fn send(
        &self,
        payload: Bytes,
        to: Option<SocketAddr>,
        delivery_time: Option<Instant>,
        segment_size: u16,
    ) -> Result<(), UdpError> {
        let dest = to.or_else(|| self.peer_addr()).ok_or(UdpError::NotConnected)?;
        let generation = self.send_generation();
        let packet = Packet::new_outbound(dest, delivery_time, payload, self.clone(), generation, segment_size);
        let now = self.inner.clock.now();
        self.inner.outbound.lock().unwrap().submit(packet, now);
        self.wake();
        Ok(())
    }

    /// Bump the send generation, marking every packet already queued
    /// under the previous generation as cancelled. They are physically
    /// dropped the next time the wheel scans past them. Returns the new
    /// generation so the caller can correlate it with subsequent sends.
    pub fn cancel_pending(&self) -> u64 {
        let new_generation = self.inner.send_generation.fetch_add(1, Ordering::AcqRel) + 1;
        self.wake();
        new_generation
    }

    /// Pull the next buffered inbound datagram, or `None` if the receive
    /// queue is empty. Non-blocking; meant to be called from the
    /// `ReadReady` callback, though nothing stops a test from polling it
    /// directly (source `UDP2ConnectionImpl::recv`).
    pub fn recv(&self) -> Option<Packet> {
        self.inner.recv_intake.lock().unwrap().pop_front()
    }

    /// For an accept connection: pull one inbound datagram that arrived
    /// before any child claimed its peer.
    pub fn recv_unclaimed(&self) -> Option<Packet> {
        match &self.inner.kind {
            ConnectionKind::Accept(state) => state.unclaimed_recv.lock().unwrap().pop_front(),
            ConnectionKind::Plain => None,
        }
    }

    /// Fetch the existing per-peer child of an accept connection, if one
    /// has already been promoted, without creating a new one.
    pub fn find_child(&self, peer: SocketAddr) -> Option<Connection> {
        match &self.inner.kind {
            ConnectionKind::Accept(state) => state.children.get(&peer).map(|entry| entry.value().clone()),
            ConnectionKind::Plain => None,
        }
    }

    /// Idempotently promote a peer 4-tuple observed on an accept
    /// connection to its own sub-connection (source
    /// `AcceptUDP2ConnectionImpl::find_connection` /
    /// `create_connection`): binds a fresh socket connected to `peer`,
    /// migrates any datagrams from `peer` already sitting in
    /// `unclaimed_recv`, and starts the child's own actor loop.
    #[cfg(feature = "runtime-tokio")]
    pub async fn create_sub_connection(&self, peer: SocketAddr) -> Result<Connection, UdpError> {
        if let Some(existing) = self.find_child(peer) {
            return Ok(existing);
        }
        let ConnectionKind::Accept(_) = &self.inner.kind else {
            return Err(UdpError::InvalidState { state: "not an accept connection" });
        };

        let observer = self.inner.observer.lock().unwrap().clone();
        let child = Connection::create(
            self.inner.local_addr,
            Some(peer),
            observer,
            self.inner.config.clone(),
            self.inner.clock.clone(),
        )
        .await?;
        child.inner_set_parent(Arc::downgrade(&self.inner));

        let ConnectionKind::Accept(state) = &self.inner.kind else {
            unreachable!("checked above");
        };
        // Re-check under the lock implied by `DashMap::entry` semantics:
        // another task may have raced us to create the same child between
        // the `find_child` miss above and now.
        match state.children.entry(peer) {
            dashmap::mapref::entry::Entry::Occupied(existing) => {
                return Ok(existing.get().clone());
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(child.clone());
            }
        }

        {
            let mut unclaimed = state.unclaimed_recv.lock().unwrap();
            let mut retained = VecDeque::with_capacity(unclaimed.len());
            for packet in unclaimed.drain(..) {
                if packet.from == Some(peer) {
                    child.inner.recv_intake.lock().unwrap().push_back(packet);
                } else {
                    retained.push_back(packet);
                }
            }
            *unclaimed = retained;
        }
        if !child.inner.recv_intake.lock().unwrap().is_empty() {
            child.inner.observer.lock().unwrap().on_event(Event::ReadReady);
        }

        child.start_io();
        Ok(child)
    }

    /// Rebind the observer. Only valid before [`Connection::start_io`] —
    /// a mid-flight continuation swap is exactly what the source's
    /// `set_continuation` allowed and this port disallows (§9): once the
    /// actor loop is running, panics in debug builds and is a logged
    /// no-op in release builds.
    pub fn bind_observer(&self, observer: Arc<dyn DatagramObserver>) {
        let state = self.inner.state.lock().unwrap();
        if *state != ConnectionState::Init {
            drop(state);
            debug_assert!(false, "bind_observer called after start_io");
            warn!("bind_observer called after start_io; ignoring");
            return;
        }
        drop(state);
        *self.inner.observer.lock().unwrap() = observer;
    }

    fn inner_set_parent(&self, parent: Weak<ConnectionInner>) {
        *self.inner.parent.lock().unwrap() = Some(parent);
    }

    pub fn remove_child(&self, peer: &SocketAddr) {
        if let ConnectionKind::Accept(state) = &self.inner.kind {
            state.children.remove(peer);
        }
    }

    /// Begin draining (if packets are queued) or die immediately, mirroring
    /// the source's `close()` decision between an immediate self-destruct
    /// and an `endEvent`-driven drain. Detaches the observer immediately
    /// regardless of which path is taken, per invariant 5: once `close()`
    /// returns, no further callback reaches the caller's observer.
    pub fn close(&self) {
        let mut state = self.inner.state.lock().unwrap();
        if *state == ConnectionState::Dead {
            return;
        }
        let pending = self.inner.outbound.lock().unwrap().pending_bytes();
        *state = if pending == 0 { ConnectionState::Dead } else { ConnectionState::Draining };
        drop(state);
        *self.inner.observer.lock().unwrap() = Arc::new(crate::observer::NullObserver);
        self.inner.recv_intake.lock().unwrap().clear();
        self.wake();
        if self.state() == ConnectionState::Dead {
            self.detach_from_parent();
        }
    }

    fn detach_from_parent(&self) {
        let parent = self.inner.parent.lock().unwrap().clone();
        if let Some(parent) = parent.and_then(|weak| weak.upgrade()) {
            if let ConnectionKind::Accept(state) = &parent.kind {
                if let Some(peer) = self.peer_addr() {
                    state.children.remove(&peer);
                }
            }
        }
    }

    #[cfg(feature = "runtime-tokio")]
    fn wake(&self) {
        self.inner.notify.notify_one();
    }

    #[cfg(not(feature = "runtime-tokio"))]
    fn wake(&self) {}

    /// Spawn the background task that owns this connection's I/O. No-op
    /// (beyond the state transition) for a connection created without a
    /// socket, which only exists for unit tests.
    #[cfg(feature = "runtime-tokio")]
    pub fn start_io(&self) {
        {
            let mut state = self.inner.state.lock().unwrap();
            if *state != ConnectionState::Init {
                return;
            }
            *state = ConnectionState::Running;
        }
        self.inner.observer.lock().unwrap().on_event(Event::Open);
        if self.peer_addr().is_some() {
            self.inner.observer.lock().unwrap().on_event(Event::ConnectSuccess);
        }
        if self.inner.socket.is_none() {
            return;
        }
        let this = self.clone();
        let span = info_span!("udp_connection", local = %this.local_addr());
        tokio::spawn(async move { this.run_actor_loop().await }.instrument(span));
    }

    #[cfg(feature = "runtime-tokio")]
    async fn run_actor_loop(self) {
        loop {
            if self.state() == ConnectionState::Dead {
                return;
            }

            let now = self.inner.clock.now();
            let deadline = self.next_deadline(now);
            let sleep = self.inner.clock.sleep(deadline.saturating_duration_since(now));

            let socket = match &self.inner.socket {
                Some(socket) => socket.clone(),
                None => return,
            };

            tokio::select! {
                _ = self.inner.notify.notified() => {}
                _ = sleep => {}
                readable = socket.readable() => {
                    if readable.is_ok() {
                        self.net_read_io(&socket);
                    }
                }
                writable = socket.writable() => {
                    if writable.is_ok() {
                        self.net_write_io(&socket).await;
                    }
                }
            }

            self.service_outbound(&socket).await;

            let draining_done = self.state() == ConnectionState::Draining
                && self.inner.outbound.lock().unwrap().pending_bytes() == 0;
            if draining_done {
                *self.inner.state.lock().unwrap() = ConnectionState::Dead;
                self.detach_from_parent();
                return;
            }
        }
    }

    #[cfg(feature = "runtime-tokio")]
    fn next_deadline(&self, now: Instant) -> Instant {
        self.inner
            .outbound
            .lock()
            .unwrap()
            .earliest_deadline()
            .unwrap_or(now + self.inner.config.slot_time)
    }

    /// Drain every packet due by now out of the wheel and write it,
    /// mirroring the source's `net_write_io` draining `send_queue` into
    /// `send_list` before looping over `sendmsg`. A packet carrying a
    /// non-zero `segment_size` goes out through [`crate::batch::send_gso`]
    /// instead of a plain send (spec §4.1/§4.3/§6): real kernel GSO on
    /// Linux with `batch-udp-unix` enabled, software segmentation
    /// elsewhere.
    #[cfg(feature = "runtime-tokio")]
    async fn service_outbound(&self, socket: &TokioUdpSocket) {
        let now = self.inner.clock.now();
        let mut outbound = self.inner.outbound.lock().unwrap();
        outbound.purge_cancelled(self.inner.config.n_slots / 8);
        let due = outbound.service(now);
        drop(outbound);
        let mut any_sent = false;
        let mut iter = due.into_iter();
        while let Some(packet) = iter.next() {
            let Some(to) = packet.to else { continue };
            let result = if packet.segment_size > 0 {
                crate::batch::send_gso(socket, packet.payload(), packet.segment_size, to)
                    .await
                    .map_err(|err| io::Error::other(err.to_string()))
            } else {
                socket.try_send_to(packet.payload(), to)
            };
            match result {
                Ok(_) => {
                    *self.inner.last_activity.lock().unwrap() = now;
                    any_sent = true;
                }
                Err(err) if UdpError::is_transient(&err) => {
                    // Per the per-connection submission-order guarantee, a
                    // blocked write must stop the batch here rather than
                    // let later packets jump ahead of this one; the whole
                    // remaining run goes back to `now_slot` in order and
                    // waits for the next writable edge.
                    let mut remaining = vec![packet];
                    remaining.extend(iter);
                    self.inner.outbound.lock().unwrap().requeue_remaining(remaining);
                    break;
                }
                Err(err) => {
                    warn!(error = %err, "udp write failed");
                    self.inner.observer.lock().unwrap().on_event(Event::WriteError(UdpError::Write(err)));
                }
            }
        }
        if any_sent {
            self.inner.observer.lock().unwrap().on_event(Event::WriteReady);
        }
    }

    /// Read as many datagrams as are ready without blocking, rather than
    /// the source's fatal assertion on truncation (§9 open-question
    /// resolution). Every read uses a buffer already sized to
    /// `max_datagram_size` — the largest a UDP datagram can legally be —
    /// rather than growing a smaller buffer on a truncation guess: `n ==
    /// buf_len` is not a reliable truncation signal (a datagram that
    /// happens to land exactly on the old buffer size is indistinguishable
    /// from a truncated one, and by the time it's noticed the real bytes
    /// are already gone, consumed by the `recv` that returned them), so
    /// sizing the buffer up front avoids needing that signal at all.
    /// Datagrams are buffered and the upper layer notified once per batch,
    /// matching the source's single `DATAGRAM_READ_READY` per
    /// `net_read_io` invocation rather than per-packet.
    #[cfg(feature = "runtime-tokio")]
    fn net_read_io(&self, socket: &TokioUdpSocket) {
        let buf_len = self.inner.config.max_datagram_size;
        let mut batch = Vec::new();
        loop {
            let mut buf = BytesMut::zeroed(buf_len);
            match socket.try_recv_from(&mut buf) {
                Ok((n, from)) => {
                    buf.truncate(n);
                    *self.inner.last_activity.lock().unwrap() = self.inner.clock.now();
                    batch.push((from, buf.freeze()));
                }
                Err(err) if UdpError::is_transient(&err) => break,
                Err(err) => {
                    self.inner.observer.lock().unwrap().on_event(Event::ReadError(UdpError::Read(err)));
                    break;
                }
            }
        }
        if !batch.is_empty() {
            self.dispatch_inbound_batch(batch);
        }
    }

    fn dispatch_inbound_batch(&self, batch: Vec<(SocketAddr, Bytes)>) {
        match &self.inner.kind {
            ConnectionKind::Plain => {
                {
                    let mut intake = self.inner.recv_intake.lock().unwrap();
                    for (from, payload) in batch {
                        intake.push_back(Packet::new_inbound(from, self.inner.local_addr, payload));
                    }
                }
                self.inner.observer.lock().unwrap().on_event(Event::ReadReady);
            }
            ConnectionKind::Accept(state) => {
                let mut touched_unclaimed = false;
                let mut touched_children: Vec<Connection> = Vec::new();
                for (from, payload) in batch {
                    let packet = Packet::new_inbound(from, self.inner.local_addr, payload);
                    if let Some(child) = state.children.get(&from) {
                        child.inner.recv_intake.lock().unwrap().push_back(packet);
                        if !touched_children.iter().any(|c| c.local_addr() == child.local_addr() && c.peer_addr() == child.peer_addr()) {
                            touched_children.push(child.clone());
                        }
                    } else {
                        debug!(peer = %from, "datagram for unclaimed peer");
                        state.unclaimed_recv.lock().unwrap().push_back(packet);
                        touched_unclaimed = true;
                    }
                }
                for child in touched_children {
                    child.inner.observer.lock().unwrap().on_event(Event::ReadReady);
                }
                if touched_unclaimed {
                    self.inner.observer.lock().unwrap().on_event(Event::ReadReady);
                }
            }
        }
    }

    /// Present for symmetry with the write path; real write backpressure
    /// is already handled inline by [`Connection::service_outbound`].
    #[cfg(feature = "runtime-tokio")]
    async fn net_write_io(&self, socket: &TokioUdpSocket) {
        self.service_outbound(socket).await;
    }
}

#[cfg(feature = "runtime-tokio")]
fn bind_socket(addr: SocketAddr, config: &UdpConfig) -> Result<TokioUdpSocket, UdpError> {
    use socket2::{Domain, Protocol, Socket, Type};

    let domain = if addr.is_ipv6() { Domain::IPV6 } else { Domain::IPV4 };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))
        .map_err(|source| UdpError::IoSetup { addr, source })?;
    socket.set_reuse_address(true).map_err(|source| UdpError::IoSetup { addr, source })?;
    #[cfg(unix)]
    {
        let _ = socket.set_reuse_port(true);
    }
    if addr.is_ipv6() {
        let _ = socket.set_only_v6(true);
    }
    if let Some(size) = config.recv_buf_size {
        let _ = socket.set_recv_buffer_size(size);
    }
    if let Some(size) = config.send_buf_size {
        let _ = socket.set_send_buffer_size(size);
    }
    socket.set_nonblocking(true).map_err(|source| UdpError::IoSetup { addr, source })?;
    socket.bind(&addr.into()).map_err(|source| UdpError::IoSetup { addr, source })?;
    TokioUdpSocket::from_std(socket.into()).map_err(|source| UdpError::IoSetup { addr, source })
}
