//! # Connection Manager
//!
//! Process-scoped registry of [`Connection`]s, keyed by `connection_id` with a
//! secondary `peer_id` index, plus the handshake orchestration and inactivity
//! sweep that sit above a single connection's own state machine. The registry
//! itself follows the same `Arc<Inner>` shape the control plane uses for its
//! agent table — a `DashMap` gives every caller lock-free reads without a
//! surrounding `RwLock`.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use tracing::{debug, info, warn};

use crate::config::TransportConfig;
use crate::connection::{Connection, ConnectionState, KeyExchange, NullKeyExchange};
use crate::error::{Result, TransportError};
use crate::flow::FlowController;
use crate::global_flow::{self, GlobalFlowController};
use crate::ids::IdGenerator;
use crate::send_message::FrameTransmit;
use crate::stats::{GlobalStats, GlobalStatsSnapshot};
use crate::timer::TimerWheel;
use crate::wire::{Frame, FrameType, Priority};

/// End-to-end handshake retries: the CONNECT_REQUEST is resent this many
/// times (beyond the initial send) if no CONNECT_RESPONSE arrives, spaced
/// by [`HANDSHAKE_RETRY_DELAY`], before the whole `connect` call gives up.
const HANDSHAKE_RETRIES: u32 = 2;
const HANDSHAKE_RETRY_DELAY: std::time::Duration = std::time::Duration::from_millis(50);

struct Inner {
    connections: DashMap<u64, Arc<Connection>>,
    peer_index: DashMap<String, HashSet<u64>>,
    config: Arc<TransportConfig>,
    local_peer_id: String,
    id_gen: Arc<IdGenerator>,
    kex: Arc<dyn KeyExchange>,
    global_flow: &'static GlobalFlowController,
    timer: TimerWheel,
    stats: GlobalStats,
    delivered_tx: crossbeam_channel::Sender<(u64, String, Bytes)>,
    delivered_rx: crossbeam_channel::Receiver<(u64, String, Bytes)>,
}

/// Owns every live [`Connection`] for this process and hands out handles to
/// the UDP I/O adapter and the application. Cheap to clone; all state lives
/// behind the inner `Arc`.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    pub fn new(config: Arc<TransportConfig>, local_peer_id: impl Into<String>) -> Self {
        Self::with_key_exchange(config, local_peer_id, Arc::new(NullKeyExchange))
    }

    pub fn with_key_exchange(
        config: Arc<TransportConfig>,
        local_peer_id: impl Into<String>,
        kex: Arc<dyn KeyExchange>,
    ) -> Self {
        let (delivered_tx, delivered_rx) = crossbeam_channel::bounded(config.delivered_queue_capacity);
        let global_flow = global_flow::global(config.global_rate);
        ConnectionManager {
            inner: Arc::new(Inner {
                connections: DashMap::with_capacity(config.connection_registry_capacity),
                peer_index: DashMap::new(),
                id_gen: Arc::new(IdGenerator::new(rand::random::<u16>() as u64)),
                kex,
                global_flow,
                timer: TimerWheel::new(),
                stats: GlobalStats::new(),
                delivered_tx,
                delivered_rx,
                local_peer_id: local_peer_id.into(),
                config,
            }),
        }
    }

    pub fn config(&self) -> &Arc<TransportConfig> {
        &self.inner.config
    }

    pub fn global_flow(&self) -> &'static GlobalFlowController {
        self.inner.global_flow
    }

    pub fn timer(&self) -> &TimerWheel {
        &self.inner.timer
    }

    pub fn local_peer_id(&self) -> &str {
        &self.inner.local_peer_id
    }

    pub fn connection_count(&self) -> usize {
        self.inner.connections.len()
    }

    pub fn get(&self, connection_id: u64) -> Option<Arc<Connection>> {
        self.inner.connections.get(&connection_id).map(|e| e.clone())
    }

    fn new_connection(&self, connection_id: u64, remote: SocketAddr, outbound: bool) -> Arc<Connection> {
        Arc::new(Connection::new(
            connection_id,
            remote,
            outbound,
            self.inner.config.clone(),
            Arc::new(FlowController::new(self.inner.config.per_connection_rate)),
            self.inner.global_flow,
            self.inner.id_gen.clone(),
            self.inner.kex.clone(),
            self.inner.delivered_tx.clone(),
        ))
    }

    fn register(&self, connection: Arc<Connection>) {
        self.inner.connections.insert(connection.connection_id(), connection);
        self.inner.stats.connection_registered();
    }

    fn unregister(&self, connection_id: u64) {
        if let Some((_, connection)) = self.inner.connections.remove(&connection_id) {
            self.inner.global_flow.on_complete(connection.flow().in_flight());
            if let Some(peer_id) = connection.peer_id() {
                if let Some(mut ids) = self.inner.peer_index.get_mut(&peer_id) {
                    ids.remove(&connection_id);
                    if ids.is_empty() {
                        drop(ids);
                        self.inner.peer_index.remove(&peer_id);
                    }
                }
            }
            self.inner.stats.connection_unregistered();
        }
    }

    fn index_peer(&self, peer_id: &str, connection_id: u64) {
        self.inner
            .peer_index
            .entry(peer_id.to_string())
            .or_default()
            .insert(connection_id);
    }

    /// Dial `peer_id` at `remote`, sending a CONNECT_REQUEST and waiting for
    /// the matching CONNECT_RESPONSE. On timeout the half-built connection is
    /// discarded entirely — a fresh `connect()` call starts clean rather than
    /// retrying the same handshake.
    pub async fn connect(
        &self,
        peer_id: &str,
        remote: SocketAddr,
        transmit: Arc<dyn FrameTransmit>,
    ) -> Result<Arc<Connection>> {
        let connection_id = self.inner.id_gen.next_id();
        let connection = self.new_connection(connection_id, remote, true);
        connection.set_peer_id(peer_id.to_string());
        self.register(connection.clone());

        let (data_id, request) = connection.make_connect_request(self.local_peer_id());
        let mut rx = connection.register_waiter(data_id);
        let wire = request.encode().freeze();
        transmit.transmit(remote, wire.clone());

        let ttl = self.inner.config.request_response_ttl;
        let deadline = tokio::time::Instant::now() + ttl;
        let mut retries_left = HANDSHAKE_RETRIES;
        let response = loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                break None;
            }
            let wait = remaining.min(HANDSHAKE_RETRY_DELAY);
            match tokio::time::timeout(wait, &mut rx).await {
                Ok(Ok(response)) => break Some(response),
                Ok(Err(_)) => break None,
                Err(_) if retries_left > 0 => {
                    retries_left -= 1;
                    debug!(connection_id, peer_id, %remote, retries_left, "retrying connect request");
                    transmit.transmit(remote, wire.clone());
                }
                Err(_) => continue,
            }
        };

        match response {
            Some(response) if response.header.frame_type == FrameType::ConnectResponse => {
                self.index_peer(peer_id, connection_id);
                info!(connection_id, peer_id, %remote, "outbound connection established");
                Ok(connection)
            }
            _ => {
                self.unregister(connection_id);
                warn!(connection_id, peer_id, %remote, "handshake timed out");
                Err(TransportError::HandshakeTimeout { elapsed_ms: ttl.as_millis() as u64 })
            }
        }
    }

    /// Look up `connection_id` for the I/O adapter's inbound dispatch. A new
    /// passive connection is only minted for a CONNECT_REQUEST; any other
    /// frame type addressed at an unknown connection is dropped upstream.
    pub fn get_or_create_inbound(
        &self,
        connection_id: u64,
        remote: SocketAddr,
        frame_type: FrameType,
    ) -> Option<Arc<Connection>> {
        if let Some(existing) = self.get(connection_id) {
            return Some(existing);
        }
        if frame_type != FrameType::ConnectRequest {
            debug!(connection_id, ?frame_type, "dropping frame for unknown connection");
            return None;
        }
        if self.inner.connections.len() >= self.inner.config.connection_registry_capacity {
            warn!(connection_id, "connection registry at capacity, dropping inbound handshake");
            return None;
        }
        let connection = self.new_connection(connection_id, remote, false);
        self.register(connection.clone());
        Some(connection)
    }

    /// Record a peer id discovered on an inbound handshake, once the
    /// connection has resolved it from the CONNECT_REQUEST payload.
    pub fn mark_established(&self, connection_id: u64) {
        if let Some(connection) = self.get(connection_id) {
            if let Some(peer_id) = connection.peer_id() {
                self.index_peer(&peer_id, connection_id);
            }
        }
    }

    /// Release one connection: emit an OFF frame, fail its pending sends,
    /// and drop it from the registry.
    pub fn release(&self, connection_id: u64, transmit: &dyn FrameTransmit) {
        if let Some(connection) = self.get(connection_id) {
            let off = connection.release();
            transmit.transmit(connection.remote_address(), off.encode().freeze());
            self.unregister(connection_id);
        }
    }

    /// A connection reported `ConnectionEvent::Released` (it received an OFF
    /// frame) — no reply is owed, just local bookkeeping.
    pub fn forget(&self, connection_id: u64) {
        self.unregister(connection_id);
    }

    /// Propagate a PEER_OFF: release every local connection registered under
    /// `peer_id`.
    pub fn release_peer(&self, peer_id: &str, transmit: &dyn FrameTransmit) {
        let ids: Vec<u64> = self
            .inner
            .peer_index
            .get(peer_id)
            .map(|ids| ids.iter().copied().collect())
            .unwrap_or_default();
        for connection_id in ids {
            self.release(connection_id, transmit);
        }
    }

    pub fn get_online_peers(&self) -> HashSet<String> {
        self.inner
            .connections
            .iter()
            .filter(|e| e.state() == ConnectionState::Established && !e.is_expired())
            .filter_map(|e| e.peer_id())
            .collect()
    }

    /// Send any connection's request/response messages a whole-message send
    /// call (e.g. `send_data`) — exposed so the I/O adapter's periodic sweep
    /// can find every outbound connection in one pass.
    pub fn connections(&self) -> Vec<Arc<Connection>> {
        self.inner.connections.iter().map(|e| e.clone()).collect()
    }

    /// Send one application payload to an established connection.
    pub async fn send_data(
        &self,
        connection_id: u64,
        payload: Bytes,
        transmit: Arc<dyn FrameTransmit>,
        priority: Priority,
    ) -> Result<()> {
        let connection = self
            .get(connection_id)
            .ok_or(TransportError::UnknownConnection { connection_id })?;
        if connection.is_expired() {
            return Err(TransportError::ConnectionExpired { connection_id });
        }
        connection
            .send_data(payload, transmit, self.inner.global_flow, &self.inner.timer, priority)
            .await
    }

    /// Drain one delivered application message, if any is queued.
    pub fn try_take_delivered_message(&self) -> Option<(u64, String, Bytes)> {
        self.inner.delivered_rx.try_recv().ok()
    }

    /// Block the calling thread until a message is delivered. Intended for
    /// hosts driving the transport from outside an async context; async
    /// callers should prefer [`ConnectionManager::try_take_delivered_message`]
    /// polled from a blocking task.
    pub fn take_delivered_message(&self) -> Option<(u64, String, Bytes)> {
        self.inner.delivered_rx.recv().ok()
    }

    pub fn stats(&self) -> GlobalStatsSnapshot {
        self.inner.stats.set_in_flight(self.inner.global_flow.in_flight());
        self.inner.stats.snapshot()
    }

    /// Periodic maintenance: flush due batched ACKs, send outbound keepalive
    /// pings, and evict connections past their inactivity timeout. Driven by
    /// the I/O adapter's tick loop; safe to call at any cadence.
    pub fn tick(&self, transmit: &dyn FrameTransmit) {
        let mut expired = Vec::new();
        for entry in self.inner.connections.iter() {
            let connection = entry.value();
            connection.flush_due_acks(transmit);

            if connection.is_expired() {
                expired.push(connection.connection_id());
                continue;
            }

            if connection.needs_outbound_heartbeat() {
                let ping = connection.make_ping();
                transmit.transmit(connection.remote_address(), ping.encode().freeze());
                connection.mark_heartbeat_sent();
            }
        }

        for connection_id in expired {
            if let Some(connection) = self.get(connection_id) {
                connection.expire();
            }
            self.unregister(connection_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct NullTransmit {
        sent: AtomicUsize,
    }

    impl FrameTransmit for NullTransmit {
        fn transmit(&self, _remote: SocketAddr, _frame: Bytes) {
            self.sent.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
    }

    fn manager() -> ConnectionManager {
        ConnectionManager::new(Arc::new(TransportConfig::default()), "host-a")
    }

    #[tokio::test]
    async fn connect_times_out_with_no_peer_listening() {
        let mut cfg = TransportConfig::default();
        cfg.request_response_ttl = std::time::Duration::from_millis(20);
        let mgr = ConnectionManager::new(Arc::new(cfg), "host-a");
        let transmit = Arc::new(NullTransmit { sent: AtomicUsize::new(0) });
        let err = mgr.connect("host-b", addr(6000), transmit).await.unwrap_err();
        assert!(matches!(err, TransportError::HandshakeTimeout { .. }));
        assert_eq!(mgr.connection_count(), 0);
    }

    #[tokio::test]
    async fn connect_retries_connect_request_before_giving_up() {
        let mut cfg = TransportConfig::default();
        cfg.request_response_ttl = std::time::Duration::from_millis(140);
        let mgr = ConnectionManager::new(Arc::new(cfg), "host-a");
        let transmit = Arc::new(NullTransmit { sent: AtomicUsize::new(0) });
        let err = mgr.connect("host-b", addr(6001), transmit.clone()).await.unwrap_err();
        assert!(matches!(err, TransportError::HandshakeTimeout { .. }));
        // initial send plus HANDSHAKE_RETRIES retransmissions
        assert_eq!(transmit.sent.load(Ordering::SeqCst), 1 + HANDSHAKE_RETRIES as usize);
    }

    #[test]
    fn inbound_connect_request_creates_a_passive_connection() {
        let mgr = manager();
        let connection = mgr
            .get_or_create_inbound(42, addr(7000), FrameType::ConnectRequest)
            .expect("should create");
        assert_eq!(connection.connection_id(), 42);
        assert_eq!(mgr.connection_count(), 1);
    }

    #[test]
    fn non_handshake_frame_for_unknown_connection_is_dropped() {
        let mgr = manager();
        assert!(mgr.get_or_create_inbound(42, addr(7000), FrameType::Ping).is_none());
        assert_eq!(mgr.connection_count(), 0);
    }

    #[test]
    fn release_removes_from_registry_and_sends_off() {
        let mgr = manager();
        let connection = mgr.get_or_create_inbound(7, addr(8000), FrameType::ConnectRequest).unwrap();
        connection.set_peer_id("host-c".to_string());
        mgr.mark_established(7);
        let transmit = NullTransmit { sent: AtomicUsize::new(0) };
        mgr.release(7, &transmit);
        assert_eq!(mgr.connection_count(), 0);
        assert_eq!(transmit.sent.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn online_peers_only_counts_established_connections() {
        let mgr = manager();
        let connection = mgr.get_or_create_inbound(9, addr(8001), FrameType::ConnectRequest).unwrap();
        assert!(mgr.get_online_peers().is_empty());
        connection.set_peer_id("host-d".to_string());
        let transmit = NullTransmit { sent: AtomicUsize::new(0) };
        let req_header = crate::wire::FrameHeader::control(9, 1, FrameType::ConnectRequest, 4);
        let frame = Frame { header: req_header, payload: Bytes::from_static(b"peer") };
        connection.handle_frame(frame, addr(8001), &transmit).unwrap();
        mgr.mark_established(9);
        assert_eq!(mgr.get_online_peers().len(), 1);
    }
}
