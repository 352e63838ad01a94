//! # Connection
//!
//! Per-peer state machine: handshake, keepalive, migration, and inbound
//! frame dispatch. Connection owns no socket — the UDP I/O adapter (§4.L)
//! feeds it decoded frames and takes encoded frames to send, so a changed
//! `remote_address` is visible to every future send without touching any
//! per-connection socket.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use quanta::Instant;
use tracing::{debug, info, instrument, warn};

use crate::config::TransportConfig;
use crate::congestion::CongestionController;
use crate::error::{Result, TransportError};
use crate::fec::{FecDecoder, FecEncoder};
use crate::flow::FlowController;
use crate::global_flow::GlobalFlowController;
use crate::ids::IdGenerator;
use crate::recv_message::{FrameOutcome, ReceivedCache, RecvMessage};
use crate::send_message::{FrameTransmit, SendMessage, SendOutcome};
use crate::stats::ConnectionStats;
use crate::timer::TimerWheel;
use crate::wire::{Frame, FrameHeader, FrameType, Priority};

/// A pluggable stand-in for the handshake's key-exchange primitive, out of
/// scope for this transport: it only needs to yield *some* shared secret
/// material so the handshake path has something to install.
pub trait KeyExchange: Send + Sync + 'static {
    fn derive_shared_secret(&self, peer_payload: &[u8]) -> Vec<u8>;
}

/// No-op [`KeyExchange`] for hosts that don't need payload confidentiality.
pub struct NullKeyExchange;

impl KeyExchange for NullKeyExchange {
    fn derive_shared_secret(&self, _peer_payload: &[u8]) -> Vec<u8> {
        Vec::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    New = 0,
    Handshaking = 1,
    Established = 2,
    Expired = 3,
}

impl ConnectionState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => ConnectionState::Handshaking,
            2 => ConnectionState::Established,
            3 => ConnectionState::Expired,
            _ => ConnectionState::New,
        }
    }
}

/// Events a connection surfaces to the manager/I/O adapter after dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    None,
    Established,
    Released,
    PeerReleased { peer_id: String },
}

struct Waiter {
    tx: tokio::sync::oneshot::Sender<Frame>,
}

/// Per-peer connection state. No socket; outbound frames are handed to a
/// [`FrameTransmit`] supplied by the caller.
pub struct Connection {
    connection_id: u64,
    peer_id: Mutex<Option<String>>,
    remote_address: Mutex<SocketAddr>,
    state: AtomicU8,
    last_seen: Mutex<Instant>,
    last_heartbeat_sent: Mutex<Instant>,
    outbound: bool,

    flow: Arc<FlowController>,
    congestion: Arc<Mutex<CongestionController>>,
    global_flow: &'static GlobalFlowController,
    fec_encoder: Mutex<FecEncoder>,
    fec_decoder: Mutex<FecDecoder>,
    kex: Arc<dyn KeyExchange>,
    id_gen: Arc<IdGenerator>,
    ping_sent_at: Mutex<HashMap<u64, Instant>>,

    send_messages: Mutex<HashMap<u64, Arc<SendMessage>>>,
    recv_messages: Mutex<HashMap<u64, RecvMessage>>,
    received_cache: ReceivedCache,
    waiters: Mutex<HashMap<u64, Waiter>>,

    stats: ConnectionStats,
    delivered_tx: crossbeam_channel::Sender<(u64, String, Bytes)>,

    config: Arc<TransportConfig>,
}

impl Connection {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        connection_id: u64,
        remote_address: SocketAddr,
        outbound: bool,
        config: Arc<TransportConfig>,
        flow: Arc<FlowController>,
        global_flow: &'static GlobalFlowController,
        id_gen: Arc<IdGenerator>,
        kex: Arc<dyn KeyExchange>,
        delivered_tx: crossbeam_channel::Sender<(u64, String, Bytes)>,
    ) -> Self {
        Connection {
            connection_id,
            peer_id: Mutex::new(None),
            remote_address: Mutex::new(remote_address),
            state: AtomicU8::new(ConnectionState::New as u8),
            last_seen: Mutex::new(Instant::now()),
            last_heartbeat_sent: Mutex::new(Instant::now()),
            outbound,
            flow,
            congestion: Arc::new(Mutex::new(CongestionController::new(config.congestion))),
            global_flow,
            fec_encoder: Mutex::new(FecEncoder::new(config.fec_redundancy_ratio.max(1))),
            fec_decoder: Mutex::new(FecDecoder::new(64)),
            kex,
            id_gen,
            ping_sent_at: Mutex::new(HashMap::new()),
            send_messages: Mutex::new(HashMap::new()),
            recv_messages: Mutex::new(HashMap::new()),
            received_cache: ReceivedCache::new(config.dedup_cache_capacity, config.dedup_cache_ttl),
            waiters: Mutex::new(HashMap::new()),
            stats: ConnectionStats::new(),
            delivered_tx,
            config,
        }
    }

    pub fn connection_id(&self) -> u64 {
        self.connection_id
    }

    pub fn peer_id(&self) -> Option<String> {
        self.peer_id.lock().unwrap().clone()
    }

    /// Set ahead of a handshake completing, e.g. for an outbound dial where
    /// the caller already knows which peer it's reaching.
    pub fn set_peer_id(&self, peer_id: String) {
        *self.peer_id.lock().unwrap() = Some(peer_id);
    }

    pub fn flow(&self) -> &Arc<FlowController> {
        &self.flow
    }

    pub fn outbound(&self) -> bool {
        self.outbound
    }

    pub fn remote_address(&self) -> SocketAddr {
        *self.remote_address.lock().unwrap()
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn stats(&self) -> &ConnectionStats {
        &self.stats
    }

    fn set_state(&self, new_state: ConnectionState) {
        let old = self.state.swap(new_state as u8, Ordering::AcqRel);
        if old != new_state as u8 {
            debug!(connection_id = self.connection_id, from = old, to = new_state as u8, "connection state transition");
        }
    }

    fn touch(&self) {
        *self.last_seen.lock().unwrap() = Instant::now();
    }

    pub fn is_expired(&self) -> bool {
        self.state() == ConnectionState::Expired
            || self.last_seen.lock().unwrap().elapsed() > self.config.connection_expire_timeout
    }

    pub fn needs_outbound_heartbeat(&self) -> bool {
        self.outbound
            && self.state() == ConnectionState::Established
            && self.last_heartbeat_sent.lock().unwrap().elapsed() > self.config.outbound_heartbeat_interval
    }

    pub fn mark_heartbeat_sent(&self) {
        *self.last_heartbeat_sent.lock().unwrap() = Instant::now();
    }

    pub fn make_ping(&self) -> Frame {
        let data_id = self.id_gen.next_id();
        self.ping_sent_at.lock().unwrap().insert(data_id, Instant::now());
        let header = FrameHeader::control(self.connection_id, data_id, FrameType::Ping, 0);
        Frame { header, payload: Bytes::new() }
    }

    /// Migration: an inbound frame from a different source address updates
    /// `remote_address` atomically; all subsequent sends target it.
    fn maybe_migrate(&self, src: SocketAddr) {
        let mut addr = self.remote_address.lock().unwrap();
        if *addr != src {
            info!(connection_id = self.connection_id, old = %*addr, new = %src, "connection migrated");
            *addr = src;
        }
    }

    // ─── Handshake ──────────────────────────────────────────────────────

    pub fn make_connect_request(&self, local_peer_id: &str) -> (u64, Frame) {
        self.set_state(ConnectionState::Handshaking);
        let data_id = self.id_gen.next_id();
        let payload = Bytes::copy_from_slice(local_peer_id.as_bytes());
        let header = FrameHeader::control(self.connection_id, data_id, FrameType::ConnectRequest, payload.len());
        (data_id, Frame { header, payload })
    }

    pub fn register_waiter(&self, data_id: u64) -> tokio::sync::oneshot::Receiver<Frame> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.waiters.lock().unwrap().insert(data_id, Waiter { tx });
        rx
    }

    fn resolve_waiter(&self, data_id: u64, frame: Frame) {
        if let Some(waiter) = self.waiters.lock().unwrap().remove(&data_id) {
            let _ = waiter.tx.send(frame);
        }
    }

    // ─── Outbound data ──────────────────────────────────────────────────

    /// Obtain a fresh `data_id`, build and register the send-side message,
    /// and drive it to completion. Succeeds iff every frame is acked before
    /// `GLOBAL_TIMEOUT_MS`.
    pub async fn send_data(
        self: &Arc<Self>,
        payload: Bytes,
        transmit: Arc<dyn FrameTransmit>,
        global_flow: &'static GlobalFlowController,
        timer: &TimerWheel,
        priority: Priority,
    ) -> Result<()> {
        let data_id = self.id_gen.next_id();
        let remote = self.remote_address();
        let msg = Arc::new(SendMessage::new(
            self.connection_id,
            data_id,
            payload,
            remote,
            self.config.max_frame_payload,
            priority,
        )?);
        self.send_messages.lock().unwrap().insert(data_id, msg.clone());

        let fec = if self.config.fec_redundancy_ratio > 0 { Some(&self.fec_encoder) } else { None };
        let rx = msg
            .send_all(
                transmit,
                self.flow.clone(),
                self.congestion.clone(),
                global_flow,
                timer,
                self.config.global_timeout,
                fec,
            )
            .await;

        let outcome = rx.await.unwrap_or(SendOutcome::TimedOut);
        self.send_messages.lock().unwrap().remove(&data_id);

        match outcome {
            SendOutcome::Success => {
                self.stats.record_frame_acked();
                Ok(())
            }
            SendOutcome::TimedOut => Err(TransportError::MessageTimeout {
                data_id,
                elapsed_ms: self.config.global_timeout.as_millis() as u64,
            }),
        }
    }

    pub fn release(&self) -> Frame {
        self.set_state(ConnectionState::Expired);
        self.fail_all_sends();
        let header = FrameHeader::control(self.connection_id, 0, FrameType::Off, 0);
        Frame { header, payload: Bytes::new() }
    }

    /// Mark this connection expired outright, e.g. on the manager's
    /// inactivity sweep, without emitting an OFF frame.
    pub fn expire(&self) {
        self.set_state(ConnectionState::Expired);
        self.fail_all_sends();
    }

    /// Force-complete every still-pending send-side message with
    /// [`SendOutcome::TimedOut`]. Idempotent: each message only fires its
    /// completion once, so calling this after some messages already
    /// succeeded is harmless.
    fn fail_all_sends(&self) {
        let messages = self.send_messages.lock().unwrap();
        for msg in messages.values() {
            msg.fail(&self.flow, &self.congestion, self.global_flow);
        }
    }

    // ─── Inbound dispatch ───────────────────────────────────────────────

    /// Dispatch one decoded inbound frame. Never blocks: reassembly and ACK
    /// bookkeeping are in-memory only; application delivery is a bounded,
    /// non-blocking channel send.
    #[instrument(skip(self, frame, transmit), fields(connection_id = self.connection_id))]
    pub fn handle_frame(
        &self,
        frame: Frame,
        src: SocketAddr,
        transmit: &dyn FrameTransmit,
    ) -> Result<ConnectionEvent> {
        self.touch();
        self.maybe_migrate(src);

        match frame.header.frame_type {
            FrameType::Data => self.handle_data(frame, transmit),
            FrameType::DataAck => {
                self.with_send_message(frame.header.data_id, |msg| {
                    let seq = decode_u32_payload(&frame.payload).unwrap_or(0);
                    msg.on_ack(seq, &self.flow, &self.congestion, self.global_flow);
                });
                self.sync_congestion_stats();
                Ok(ConnectionEvent::None)
            }
            FrameType::BatchAck => {
                self.with_send_message(frame.header.data_id, |msg| {
                    msg.on_batch_ack(&frame.payload, &self.flow, &self.congestion, self.global_flow);
                });
                self.sync_congestion_stats();
                Ok(ConnectionEvent::None)
            }
            FrameType::AllAck => {
                self.with_send_message(frame.header.data_id, |msg| {
                    msg.all_received(&self.flow, &self.congestion, self.global_flow);
                });
                self.sync_congestion_stats();
                Ok(ConnectionEvent::None)
            }
            FrameType::Ping => {
                let pong = FrameHeader::control(self.connection_id, frame.header.data_id, FrameType::Pong, 0);
                transmit.transmit(self.remote_address(), Frame { header: pong, payload: Bytes::new() }.encode().freeze());
                Ok(ConnectionEvent::None)
            }
            FrameType::Pong | FrameType::ConnectResponse => {
                if frame.header.frame_type == FrameType::ConnectResponse {
                    self.set_state(ConnectionState::Established);
                }
                if frame.header.frame_type == FrameType::Pong {
                    if let Some(sent_at) = self.ping_sent_at.lock().unwrap().remove(&frame.header.data_id) {
                        let rtt_us = sent_at.elapsed().as_micros() as f64;
                        self.congestion.lock().unwrap().on_rtt_sample(rtt_us);
                        self.sync_congestion_stats();
                    }
                }
                self.resolve_waiter(frame.header.data_id, frame);
                Ok(ConnectionEvent::None)
            }
            FrameType::ConnectRequest => {
                let secret = self.kex.derive_shared_secret(&frame.payload);
                debug!(connection_id = self.connection_id, secret_len = secret.len(), "handshake shared secret installed");
                if let Ok(peer_id) = std::str::from_utf8(&frame.payload) {
                    *self.peer_id.lock().unwrap() = Some(peer_id.to_string());
                }
                self.set_state(ConnectionState::Established);
                let response = FrameHeader::control(self.connection_id, frame.header.data_id, FrameType::ConnectResponse, 0);
                transmit.transmit(self.remote_address(), Frame { header: response, payload: Bytes::new() }.encode().freeze());
                Ok(ConnectionEvent::Established)
            }
            FrameType::Off => {
                self.set_state(ConnectionState::Expired);
                self.fail_all_sends();
                Ok(ConnectionEvent::Released)
            }
            FrameType::PeerOff => {
                let peer_id = String::from_utf8_lossy(&frame.payload).to_string();
                Ok(ConnectionEvent::PeerReleased { peer_id })
            }
            FrameType::Fec => {
                self.handle_fec(frame, transmit)
            }
            FrameType::Heartbeat | FrameType::StreamCreate | FrameType::StreamClose | FrameType::MtuDetect => {
                debug!(connection_id = self.connection_id, frame_type = ?frame.header.frame_type, "frame type has no dispatch behavior, dropping");
                Ok(ConnectionEvent::None)
            }
        }
    }

    /// Mirror the live congestion window, pacing rate, and SRTT onto the
    /// connection's published stats snapshot.
    fn sync_congestion_stats(&self) {
        let congestion = self.congestion.lock().unwrap();
        self.stats.set_cwnd(congestion.cwnd());
        self.stats.set_rate(self.flow.rate());
        self.stats.set_srtt_us(congestion.srtt_us());
    }

    fn with_send_message(&self, data_id: u64, f: impl FnOnce(&Arc<SendMessage>)) {
        let messages = self.send_messages.lock().unwrap();
        if let Some(msg) = messages.get(&data_id) {
            f(msg);
        }
    }

    fn handle_data(&self, frame: Frame, transmit: &dyn FrameTransmit) -> Result<ConnectionEvent> {
        let data_id = frame.header.data_id;
        let total = frame.header.total;

        if self.received_cache.contains(self.connection_id, data_id) {
            let ack = all_ack_frame(self.connection_id, data_id, frame.header.sequence);
            transmit.transmit(self.remote_address(), ack.encode().freeze());
            return Ok(ConnectionEvent::None);
        }

        self.stats.record_bytes_received(frame.payload.len() as u64);

        let mut messages = self.recv_messages.lock().unwrap();
        let entry = messages.entry(data_id).or_insert_with(|| RecvMessage::new(self.connection_id, data_id, total));
        let outcome = entry.handle_frame(frame);

        match outcome {
            FrameOutcome::Duplicate { ack_frame } => {
                transmit.transmit(self.remote_address(), ack_frame.encode().freeze());
            }
            FrameOutcome::Accepted => {
                let pending = entry.pending_ack_len();
                if pending >= self.config.batch_ack_threshold {
                    if let Some(batch) = entry.flush_pending_ack() {
                        transmit.transmit(self.remote_address(), batch.encode().freeze());
                    }
                }
            }
            FrameOutcome::Completed { payload, all_ack_frame } => {
                messages.remove(&data_id);
                self.received_cache.insert(self.connection_id, data_id);
                transmit.transmit(self.remote_address(), all_ack_frame.encode().freeze());
                let peer = self.peer_id().unwrap_or_default();
                if self.delivered_tx.try_send((self.connection_id, peer, payload)).is_err() {
                    warn!(connection_id = self.connection_id, data_id, "delivered-message queue full, dropping");
                }
            }
        }

        Ok(ConnectionEvent::None)
    }

    /// Flush any message's batched ACK whose flush timer has fired. Called
    /// by the per-connection `BATCH_ACK_DELAY` tick.
    pub fn flush_due_acks(&self, transmit: &dyn FrameTransmit) {
        let messages = self.recv_messages.lock().unwrap();
        for msg in messages.values() {
            if let Some(batch) = msg.flush_pending_ack() {
                transmit.transmit(self.remote_address(), batch.encode().freeze());
            }
        }
    }

    /// Submits one FEC-protected slot to the per-connection decoder. By
    /// convention the wire payload carried by an FEC frame is itself a fully
    /// encoded DATA frame (header included), so a recovered slot decodes
    /// straight back into the original frame for reinjection. `total` names
    /// the group's `N`; `fec_index == N` marks the parity slot.
    fn handle_fec(&self, frame: Frame, transmit: &dyn FrameTransmit) -> Result<ConnectionEvent> {
        let group_id = frame.header.fec_group_id;
        let n = frame.header.total;
        let is_parity = frame.header.fec_index as u32 == n;

        let mut decoder = self.fec_decoder.lock().unwrap();
        if is_parity {
            decoder.add_parity(group_id, n, frame.payload.clone());
        } else {
            decoder.add_data(group_id, n, frame.header.fec_index as u32, frame.payload.clone());
        }
        let recovered = decoder.try_recover(group_id);
        drop(decoder);

        // A directly-arrived data slot already carries the original frame;
        // deliver it whether or not the group is later fully recovered.
        if !is_parity {
            let mut payload = frame.payload.clone();
            if let Ok(member_frame) = Frame::decode(&mut payload) {
                if member_frame.header.frame_type == FrameType::Data {
                    let _ = self.handle_data(member_frame, transmit);
                }
            }
        }

        match recovered {
            Ok(Some((_slot, mut payload))) => {
                if let Ok(recovered_frame) = Frame::decode(&mut payload) {
                    if recovered_frame.header.frame_type == FrameType::Data {
                        let _ = self.handle_data(recovered_frame, transmit);
                    }
                }
                self.fec_decoder.lock().unwrap().remove_group(group_id);
            }
            Ok(None) => {}
            Err(err) => {
                warn!(connection_id = self.connection_id, group_id, error = %err, "FEC group unrecoverable");
            }
        }
        Ok(ConnectionEvent::None)
    }
}

fn decode_u32_payload(payload: &Bytes) -> Option<u32> {
    if payload.len() < 4 {
        return None;
    }
    Some(u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]))
}

fn all_ack_frame(connection_id: u64, data_id: u64, sequence: u32) -> Frame {
    use bytes::{BufMut, BytesMut};
    let mut buf = BytesMut::with_capacity(4);
    buf.put_u32(sequence);
    let payload = buf.freeze();
    let header = FrameHeader::control(connection_id, data_id, FrameType::AllAck, payload.len());
    Frame { header, payload }
}
