//! # UDP I/O Adapter
//!
//! The only thing in this crate that touches a socket. One
//! `tokio::net::UdpSocket`, bound once and shared by every connection this
//! process holds — never a socket per connection or per link, since address
//! migration (§4.J) depends on a connection's sends simply following its
//! `remote_address` rather than needing a new socket dialed to it.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tokio::net::UdpSocket;
use tracing::{debug, warn};

use crate::connection::ConnectionEvent;
use crate::manager::ConnectionManager;
use crate::send_message::FrameTransmit;
use crate::wire::Frame;

/// Maximum datagram this adapter will read. Comfortably above any frame this
/// transport emits (header plus `max_frame_payload`), with headroom for a
/// jumbo-frame path MTU.
const RECV_BUF_SIZE: usize = 65_536;

/// Owns the bound socket, shared by every inbound/outbound path through an
/// inner `Arc` so a send can be spawned off the calling task without
/// borrowing `self`.
pub struct UdpIoAdapter {
    socket: Arc<UdpSocket>,
}

impl UdpIoAdapter {
    pub async fn bind(addr: SocketAddr) -> std::io::Result<Arc<Self>> {
        let socket = UdpSocket::bind(addr).await?;
        Ok(Arc::new(UdpIoAdapter { socket: Arc::new(socket) }))
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Spawn the inbound dispatch loop: decode each datagram, route it to the
    /// owning (or newly admitted) connection, and act on the
    /// [`ConnectionEvent`] it reports back.
    pub fn spawn_ingress(self: &Arc<Self>, manager: ConnectionManager) {
        let io = self.clone();
        tokio::spawn(async move { io.run_ingress(manager).await });
    }

    async fn run_ingress(self: Arc<Self>, manager: ConnectionManager) {
        let mut buf = BytesMut::zeroed(RECV_BUF_SIZE);
        loop {
            let (len, src) = match self.socket.recv_from(&mut buf).await {
                Ok(v) => v,
                Err(err) => {
                    warn!(error = %err, "udp recv_from failed");
                    continue;
                }
            };

            let mut datagram = Bytes::copy_from_slice(&buf[..len]);
            let frame = match Frame::decode(&mut datagram) {
                Ok(frame) => frame,
                Err(err) => {
                    debug!(%src, error = %err, "dropping malformed datagram");
                    continue;
                }
            };

            let connection_id = frame.header.connection_id;
            let frame_type = frame.header.frame_type;
            let connection = match manager.get_or_create_inbound(connection_id, src, frame_type) {
                Some(connection) => connection,
                None => continue,
            };

            let transmit: Arc<dyn FrameTransmit> = self.clone();
            match connection.handle_frame(frame, src, transmit.as_ref()) {
                Ok(ConnectionEvent::Established) => manager.mark_established(connection_id),
                Ok(ConnectionEvent::Released) => manager.forget(connection_id),
                Ok(ConnectionEvent::PeerReleased { peer_id }) => {
                    manager.release_peer(&peer_id, transmit.as_ref());
                }
                Ok(ConnectionEvent::None) => {}
                Err(err) => warn!(connection_id, error = %err, "frame dispatch failed"),
            }
        }
    }

    /// Spawn the periodic maintenance loop: batched-ACK flush, outbound
    /// heartbeat, and inactivity eviction, all delegated to the manager's
    /// `tick`. Runs at `batch_ack_delay` cadence since that's the tightest
    /// per-tick deadline any of the three needs.
    pub fn spawn_periodic(self: &Arc<Self>, manager: ConnectionManager) {
        let io = self.clone();
        let period = manager.config().batch_ack_delay;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                let transmit: Arc<dyn FrameTransmit> = io.clone();
                manager.tick(transmit.as_ref());
            }
        });
    }
}

/// Local send failures (socket not writable, transient `EAGAIN`) retry up to
/// this many times before the datagram is given up on.
const LOCAL_SEND_RETRIES: u32 = 3;
const LOCAL_SEND_RETRY_DELAY: std::time::Duration = std::time::Duration::from_millis(20);

impl FrameTransmit for UdpIoAdapter {
    fn transmit(&self, remote: SocketAddr, frame: Bytes) {
        let socket = self.socket.clone();
        tokio::spawn(async move {
            for attempt in 0..=LOCAL_SEND_RETRIES {
                match socket.send_to(&frame, remote).await {
                    Ok(_) => return,
                    Err(err) if attempt < LOCAL_SEND_RETRIES => {
                        debug!(%remote, error = %err, attempt, "udp send_to failed, retrying");
                        tokio::time::sleep(LOCAL_SEND_RETRY_DELAY).await;
                    }
                    Err(err) => warn!(%remote, error = %err, "udp send_to failed, giving up"),
                }
            }
        });
    }
}
