//! # Receive-Side Message
//!
//! Reassembles one `(connection_id, data_id)` from its DATA frames, tracks
//! per-sequence duplicates, and schedules batched ACKs. Completed
//! `(connection_id, data_id)` pairs are tracked separately in a
//! [`ReceivedCache`] so a retransmitted whole-message send (the caller's
//! retry, since this transport never retransmits individual frames) is
//! answered with an immediate ALL_ACK instead of being reassembled twice.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use quanta::Instant;
use tracing::trace;

use crate::wire::{encode_batch_ack_bitmap, Frame, FrameHeader, FrameType};

/// Outcome of feeding one DATA frame into a [`RecvMessage`].
pub enum FrameOutcome {
    /// `sequence` was already received; an immediate single-sequence ACK
    /// should be sent so the sender's duplicate suppression resolves.
    Duplicate { ack_frame: Frame },
    /// Frame accepted into the reassembly buffer; no immediate reply.
    Accepted,
    /// The message is now complete; payload reassembled in sequence order.
    Completed { payload: Bytes, all_ack_frame: Frame },
}

/// A DATA frame reassembly in progress for one `(connection_id, data_id)`.
pub struct RecvMessage {
    connection_id: u64,
    data_id: u64,
    total: u32,
    received: HashMap<u32, Bytes>,
    pending_ack: Mutex<BTreeSet<u32>>,
}

impl RecvMessage {
    pub fn new(connection_id: u64, data_id: u64, total: u32) -> Self {
        RecvMessage {
            connection_id,
            data_id,
            total,
            received: HashMap::with_capacity(total as usize),
            pending_ack: Mutex::new(BTreeSet::new()),
        }
    }

    pub fn total(&self) -> u32 {
        self.total
    }

    pub fn received_count(&self) -> usize {
        self.received.len()
    }

    /// Feed one DATA frame. `frame.header.sequence` must be `< total`;
    /// callers are expected to have already validated the header via
    /// [`crate::wire::FrameHeader::decode`].
    pub fn handle_frame(&mut self, frame: Frame) -> FrameOutcome {
        let sequence = frame.header.sequence;
        if self.received.contains_key(&sequence) {
            trace!(connection_id = self.connection_id, data_id = self.data_id, sequence, "duplicate data frame");
            return FrameOutcome::Duplicate {
                ack_frame: build_data_ack(self.connection_id, self.data_id, sequence),
            };
        }

        self.received.insert(sequence, frame.payload);
        self.pending_ack.lock().unwrap().insert(sequence);

        if self.received.len() as u32 == self.total {
            let mut buf = BytesMut::new();
            for seq in 0..self.total {
                buf.extend_from_slice(&self.received[&seq]);
            }
            FrameOutcome::Completed {
                payload: buf.freeze(),
                all_ack_frame: build_all_ack(self.connection_id, self.data_id, sequence),
            }
        } else {
            FrameOutcome::Accepted
        }
    }

    /// Pop a BATCH_ACK frame if there are any pending sequences, clearing
    /// the pending set. Called either once the pending set crosses
    /// `BATCH_ACK_THRESHOLD` or on the periodic flush timer.
    pub fn flush_pending_ack(&self) -> Option<Frame> {
        let mut pending = self.pending_ack.lock().unwrap();
        if pending.is_empty() {
            return None;
        }
        let bitmap = encode_batch_ack_bitmap(&pending, self.total);
        pending.clear();
        Some(build_batch_ack(self.connection_id, self.data_id, self.total, bitmap))
    }

    pub fn pending_ack_len(&self) -> usize {
        self.pending_ack.lock().unwrap().len()
    }
}

fn build_data_ack(connection_id: u64, data_id: u64, sequence: u32) -> Frame {
    let mut payload = BytesMut::with_capacity(4);
    payload.put_u32(sequence);
    let payload = payload.freeze();
    let header = FrameHeader::control(connection_id, data_id, FrameType::DataAck, payload.len());
    Frame { header, payload }
}

fn build_all_ack(connection_id: u64, data_id: u64, sequence: u32) -> Frame {
    let mut payload = BytesMut::with_capacity(4);
    payload.put_u32(sequence);
    let payload = payload.freeze();
    let header = FrameHeader::control(connection_id, data_id, FrameType::AllAck, payload.len());
    Frame { header, payload }
}

fn build_batch_ack(connection_id: u64, data_id: u64, total: u32, bitmap: Bytes) -> Frame {
    let header = FrameHeader {
        total,
        ..FrameHeader::control(connection_id, data_id, FrameType::BatchAck, bitmap.len())
    };
    Frame { header, payload: bitmap }
}

// ─── Received Cache ──────────────────────────────────────────────────────────

/// Bounded, TTL-pruned set of `(connection_id, data_id)` pairs whose message
/// has already been fully reassembled, so a whole-message retry (this
/// transport's only loss-recovery mechanism, per §4.H) is answered with an
/// immediate ALL_ACK instead of a second reassembly.
pub struct ReceivedCache {
    capacity: usize,
    ttl: Duration,
    entries: Mutex<HashMap<(u64, u64), Instant>>,
    order: Mutex<VecDeque<(u64, u64)>>,
}

impl ReceivedCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        ReceivedCache {
            capacity,
            ttl,
            entries: Mutex::new(HashMap::new()),
            order: Mutex::new(VecDeque::new()),
        }
    }

    pub fn contains(&self, connection_id: u64, data_id: u64) -> bool {
        self.prune();
        self.entries.lock().unwrap().contains_key(&(connection_id, data_id))
    }

    pub fn insert(&self, connection_id: u64, data_id: u64) {
        let key = (connection_id, data_id);
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap();
        if entries.insert(key, now).is_some() {
            return;
        }
        drop(entries);

        let mut order = self.order.lock().unwrap();
        order.push_back(key);
        if order.len() > self.capacity {
            if let Some(evicted) = order.pop_front() {
                self.entries.lock().unwrap().remove(&evicted);
            }
        }
    }

    fn prune(&self) {
        let mut entries = self.entries.lock().unwrap();
        let ttl = self.ttl;
        entries.retain(|_, t| t.elapsed() < ttl);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::Priority;

    fn data_frame(connection_id: u64, data_id: u64, sequence: u32, total: u32, payload: &[u8]) -> Frame {
        let header = FrameHeader::data(connection_id, data_id, sequence, total, Priority::Standard, payload.len());
        Frame { header, payload: Bytes::copy_from_slice(payload) }
    }

    #[test]
    fn accepts_frames_and_completes_in_order() {
        let mut msg = RecvMessage::new(1, 2, 3);
        assert!(matches!(msg.handle_frame(data_frame(1, 2, 0, 3, b"aaa")), FrameOutcome::Accepted));
        assert!(matches!(msg.handle_frame(data_frame(1, 2, 2, 3, b"ccc")), FrameOutcome::Accepted));
        match msg.handle_frame(data_frame(1, 2, 1, 3, b"bbb")) {
            FrameOutcome::Completed { payload, .. } => assert_eq!(&payload[..], b"aaabbbccc"),
            _ => panic!("expected completion"),
        }
    }

    #[test]
    fn duplicate_sequence_is_dropped_but_still_acked() {
        let mut msg = RecvMessage::new(1, 2, 2);
        msg.handle_frame(data_frame(1, 2, 0, 2, b"aa"));
        match msg.handle_frame(data_frame(1, 2, 0, 2, b"aa")) {
            FrameOutcome::Duplicate { ack_frame } => {
                assert_eq!(ack_frame.header.frame_type, FrameType::DataAck);
            }
            _ => panic!("expected duplicate outcome"),
        }
        assert_eq!(msg.received_count(), 1);
    }

    #[test]
    fn pending_ack_accumulates_and_flushes() {
        let mut msg = RecvMessage::new(1, 2, 4);
        msg.handle_frame(data_frame(1, 2, 0, 4, b"a"));
        msg.handle_frame(data_frame(1, 2, 1, 4, b"b"));
        assert_eq!(msg.pending_ack_len(), 2);
        let ack = msg.flush_pending_ack().unwrap();
        assert_eq!(ack.header.frame_type, FrameType::BatchAck);
        assert_eq!(msg.pending_ack_len(), 0);
    }

    #[test]
    fn flush_with_nothing_pending_returns_none() {
        let msg = RecvMessage::new(1, 2, 4);
        assert!(msg.flush_pending_ack().is_none());
    }

    #[test]
    fn received_cache_detects_completed_messages() {
        let cache = ReceivedCache::new(10, Duration::from_secs(5));
        assert!(!cache.contains(1, 2));
        cache.insert(1, 2);
        assert!(cache.contains(1, 2));
    }

    #[test]
    fn received_cache_evicts_oldest_beyond_capacity() {
        let cache = ReceivedCache::new(2, Duration::from_secs(5));
        cache.insert(1, 1);
        cache.insert(1, 2);
        cache.insert(1, 3);
        assert_eq!(cache.len(), 2);
        assert!(!cache.contains(1, 1));
        assert!(cache.contains(1, 3));
    }

    #[test]
    fn received_cache_expires_by_ttl() {
        let cache = ReceivedCache::new(10, Duration::from_millis(20));
        cache.insert(1, 1);
        assert!(cache.contains(1, 1));
        std::thread::sleep(Duration::from_millis(50));
        assert!(!cache.contains(1, 1));
    }
}
