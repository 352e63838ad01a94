//! # Send-Side Message
//!
//! Fragments one `(connection_id, data_id)` payload into DATA frames, tracks
//! their acknowledgment, and resolves to success or timeout. Unlike the
//! legacy NACK-driven sender this replaces, a send-side message never
//! retransmits an individual frame — a whole-message deadline covers loss,
//! and the caller decides whether to retry the entire send.

use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use tracing::{debug, trace, warn};

use crate::congestion::CongestionController;
use crate::error::{Result, TransportError};
use crate::fec::FecEncoder;
use crate::flow::FlowController;
use crate::global_flow::GlobalFlowController;
use crate::timer::{TimerHandle, TimerWheel};
use crate::wire::{decode_batch_ack_bitmap, Frame, FrameHeader, FrameType, Priority, HEADER_SIZE};

const ADMISSION_RETRY_INTERVAL: Duration = Duration::from_micros(200);

/// Ceil-divide `payload_len` by `max` into a frame count, with the empty
/// payload always occupying exactly one frame. Pulled out of [`SendMessage::new`]
/// so the `u32::MAX` boundary can be checked without allocating a payload big
/// enough to actually trigger it.
fn frame_count(payload_len: usize, max: usize) -> usize {
    if payload_len == 0 {
        1
    } else {
        (payload_len + max - 1) / max
    }
}

/// How a send-side message concluded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Success,
    TimedOut,
}

/// Transmits a single wire frame to a remote address, off the calling task.
/// Implementations own the actual socket and are expected to spawn the send
/// rather than block the caller.
pub trait FrameTransmit: Send + Sync + 'static {
    fn transmit(&self, remote: SocketAddr, frame: Bytes);
}

struct Inner {
    acked: Mutex<BTreeSet<u32>>,
    completed: AtomicBool,
    completion: Mutex<Option<tokio::sync::oneshot::Sender<SendOutcome>>>,
    deadline: Mutex<Option<(TimerWheel, TimerHandle)>>,
}

/// An in-flight send-side message: `total` DATA frames awaiting ACK.
pub struct SendMessage {
    connection_id: u64,
    data_id: u64,
    total: u32,
    frames: Vec<Bytes>,
    remote_address: SocketAddr,
    inner: Arc<Inner>,
}

impl SendMessage {
    /// Fragment `payload` into DATA frames of at most `max_frame_payload`
    /// bytes each, via ceil-division; `sequence` runs `[0, total)`. Rejects a
    /// payload that would fragment into more than `u32::MAX` frames.
    pub fn new(
        connection_id: u64,
        data_id: u64,
        payload: Bytes,
        remote_address: SocketAddr,
        max_frame_payload: u32,
        priority: Priority,
    ) -> Result<Self> {
        let max = max_frame_payload as usize;
        let total_frames = frame_count(payload.len(), max);
        if total_frames > u32::MAX as usize {
            return Err(TransportError::MessageTooLarge {
                payload_len: payload.len(),
                max_frame_payload,
            });
        }
        let total = total_frames as u32;

        let mut frames = Vec::with_capacity(total as usize);
        let mut offset = 0usize;
        for sequence in 0..total {
            let end = (offset + max).min(payload.len());
            let chunk = payload.slice(offset..end);
            let header = FrameHeader::data(connection_id, data_id, sequence, total, priority, chunk.len());
            let frame = Frame { header, payload: chunk };
            frames.push(frame.encode().freeze());
            offset = end;
        }

        Ok(SendMessage {
            connection_id,
            data_id,
            total,
            frames,
            remote_address,
            inner: Arc::new(Inner {
                acked: Mutex::new(BTreeSet::new()),
                completed: AtomicBool::new(false),
                completion: Mutex::new(None),
                deadline: Mutex::new(None),
            }),
        })
    }

    pub fn connection_id(&self) -> u64 {
        self.connection_id
    }

    pub fn data_id(&self) -> u64 {
        self.data_id
    }

    pub fn total(&self) -> u32 {
        self.total
    }

    /// Begin transmission: starts the whole-message deadline timer, then
    /// admits and emits each frame in order, respecting both the
    /// per-connection and global flow-control budgets. A frame blocked on
    /// admission busy-waits in small increments rather than queuing — this
    /// message owns no background scheduler of its own.
    ///
    /// When `fec` is `Some`, every DATA frame is wrapped as one FEC slot
    /// (payload = the already-encoded DATA frame, header included) instead
    /// of going out as a bare DATA frame, and a parity frame follows once the
    /// shared encoder fills a group. `fec` is `None` when the connection has
    /// FEC disabled, in which case frames go out unwrapped as before.
    ///
    /// Returns a receiver that resolves once every frame is acked or the
    /// deadline fires.
    pub async fn send_all(
        &self,
        transmit: Arc<dyn FrameTransmit>,
        flow: Arc<FlowController>,
        congestion: Arc<Mutex<CongestionController>>,
        global: &'static GlobalFlowController,
        timer: &TimerWheel,
        deadline: Duration,
        fec: Option<&Mutex<FecEncoder>>,
    ) -> tokio::sync::oneshot::Receiver<SendOutcome> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        *self.inner.completion.lock().unwrap() = Some(tx);

        let deadline_inner = self.inner.clone();
        let deadline_flow = flow.clone();
        let deadline_congestion = congestion.clone();
        let total = self.total;
        let handle = timer.schedule(deadline, move || {
            Self::complete(&deadline_inner, SendOutcome::TimedOut, &deadline_flow, &deadline_congestion, global, total);
        });
        *self.inner.deadline.lock().unwrap() = Some((timer.clone(), handle));

        for (sequence, frame) in self.frames.iter().enumerate() {
            loop {
                if self.inner.completed.load(Ordering::Acquire) {
                    return rx;
                }
                let local_ok = flow.can_send(1) == crate::flow::AdmissionResult::Admitted;
                let global_ok = global.can_send(1) == crate::flow::AdmissionResult::Admitted;
                if local_ok && global_ok {
                    flow.on_admit(1);
                    global.on_admit(1);
                    break;
                }
                tokio::time::sleep(ADMISSION_RETRY_INTERVAL).await;
            }
            trace!(connection_id = self.connection_id, data_id = self.data_id, sequence, "emitting data frame");
            congestion.lock().unwrap().on_data_sent(self.payload_len(sequence as u32) as u64);

            match fec {
                Some(encoder) => self.emit_fec_protected(encoder, frame, &transmit),
                None => transmit.transmit(self.remote_address, frame.clone()),
            }
        }

        rx
    }

    /// Wraps one already-encoded DATA frame as an FEC slot and sends it,
    /// then sends the group's parity frame if this slot completed it. The
    /// parity payload XORs full encoded DATA frames (header included), so a
    /// recovered slot decodes straight back into the original frame.
    fn emit_fec_protected(&self, encoder: &Mutex<FecEncoder>, frame: &Bytes, transmit: &Arc<dyn FrameTransmit>) {
        let (group_id, fec_index, n, parity) = {
            let mut encoder = encoder.lock().unwrap();
            let fec_index = encoder.next_index();
            let group_id = encoder.group_id();
            let n = encoder.n();
            let parity = encoder.add_frame(frame.clone());
            (group_id, fec_index, n, parity)
        };

        let member_header = FrameHeader {
            connection_id: self.connection_id,
            data_id: self.data_id,
            frame_type: FrameType::Fec,
            sequence: fec_index,
            total: n,
            fec_group_id: group_id,
            fec_index: fec_index as u16,
            priority: Priority::Standard,
            frame_total_length: (HEADER_SIZE + frame.len()) as u32,
        };
        let member = Frame { header: member_header, payload: frame.clone() };
        transmit.transmit(self.remote_address, member.encode().freeze());

        if let Some((parity_group, parity_payload)) = parity {
            let parity_header = FrameHeader {
                connection_id: self.connection_id,
                data_id: self.data_id,
                frame_type: FrameType::Fec,
                sequence: n.saturating_sub(1),
                total: n,
                fec_group_id: parity_group,
                fec_index: n as u16,
                priority: Priority::Standard,
                frame_total_length: (HEADER_SIZE + parity_payload.len()) as u32,
            };
            let parity_frame = Frame { header: parity_header, payload: parity_payload };
            transmit.transmit(self.remote_address, parity_frame.encode().freeze());
        }
    }

    /// Payload length of one fragment, derived from its already-encoded wire
    /// bytes rather than stored separately.
    fn payload_len(&self, seq: u32) -> usize {
        self.frames[seq as usize].len() - HEADER_SIZE
    }

    /// Record an ACK for `seq`. Idempotent under duplicate ACKs.
    pub fn on_ack(
        &self,
        seq: u32,
        flow: &FlowController,
        congestion: &Mutex<CongestionController>,
        global: &'static GlobalFlowController,
    ) {
        if self.inner.completed.load(Ordering::Acquire) {
            return;
        }
        let newly_inserted = {
            let mut acked = self.inner.acked.lock().unwrap();
            acked.insert(seq)
        };
        if newly_inserted {
            flow.on_ack();
            global.on_ack(1);
            if (seq as usize) < self.frames.len() {
                congestion.lock().unwrap().on_ack(self.payload_len(seq) as u64);
            }
        }
        let done = self.inner.acked.lock().unwrap().len() as u32 == self.total;
        if done {
            Self::complete(&self.inner, SendOutcome::Success, flow, congestion, global, self.total);
        }
    }

    /// Apply a BATCH_ACK bitmap. Logs and ignores a length mismatch rather
    /// than treating it as a transport error.
    pub fn on_batch_ack(
        &self,
        bitmap: &[u8],
        flow: &FlowController,
        congestion: &Mutex<CongestionController>,
        global: &'static GlobalFlowController,
    ) {
        match decode_batch_ack_bitmap(bitmap, self.total) {
            Some(seqs) => {
                let seqs: Vec<u32> = seqs.collect();
                for seq in seqs {
                    self.on_ack(seq, flow, congestion, global);
                }
            }
            None => {
                warn!(
                    connection_id = self.connection_id,
                    data_id = self.data_id,
                    total = self.total,
                    bitmap_len = bitmap.len(),
                    "batch ack bitmap length mismatch, dropping"
                );
            }
        }
    }

    /// Treat as if every sequence were acked; short-circuits completion.
    /// Releases the same per-frame flow/congestion/global-admission budget
    /// [`Self::on_ack`] would have for every sequence not already acked,
    /// since this is the path the normal ALL_ACK-on-completion case takes
    /// (`on_batch_ack`/`on_ack` only run ahead of it for a partial ACK).
    pub fn all_received(
        &self,
        flow: &FlowController,
        congestion: &Mutex<CongestionController>,
        global: &'static GlobalFlowController,
    ) {
        if self.inner.completed.load(Ordering::Acquire) {
            return;
        }
        let newly_acked: Vec<u32> = {
            let mut acked = self.inner.acked.lock().unwrap();
            (0..self.total).filter(|&seq| acked.insert(seq)).collect()
        };
        for seq in newly_acked {
            flow.on_ack();
            global.on_ack(1);
            if (seq as usize) < self.frames.len() {
                congestion.lock().unwrap().on_ack(self.payload_len(seq) as u64);
            }
        }
        Self::complete(&self.inner, SendOutcome::Success, flow, congestion, global, self.total);
    }

    pub fn is_complete(&self) -> bool {
        self.inner.completed.load(Ordering::Acquire)
    }

    /// Force completion as [`SendOutcome::TimedOut`], e.g. when the owning
    /// connection is released or expires. A no-op if already complete.
    pub fn fail(
        &self,
        flow: &FlowController,
        congestion: &Mutex<CongestionController>,
        global: &'static GlobalFlowController,
    ) {
        Self::complete(&self.inner, SendOutcome::TimedOut, flow, congestion, global, self.total);
    }

    fn complete(
        inner: &Arc<Inner>,
        outcome: SendOutcome,
        flow: &FlowController,
        congestion: &Mutex<CongestionController>,
        global: &'static GlobalFlowController,
        total: u32,
    ) {
        if inner.completed.swap(true, Ordering::AcqRel) {
            return;
        }
        // Cancelling here is a harmless no-op when the deadline is what
        // fired `complete` in the first place; it matters on the ack path,
        // where it frees the wheel slot instead of leaving a dead task to
        // skip past on its next tick.
        if let Some((timer, handle)) = inner.deadline.lock().unwrap().take() {
            timer.cancel(&handle);
        }
        if outcome == SendOutcome::TimedOut {
            let acked_count = inner.acked.lock().unwrap().len() as u32;
            let remaining = total.saturating_sub(acked_count);
            if remaining > 0 {
                flow.on_failure(remaining);
                global.on_ack(remaining);
                congestion.lock().unwrap().on_loss();
            }
        }
        debug!(outcome = ?outcome, "send message completed");
        if let Some(tx) = inner.completion.lock().unwrap().take() {
            let _ = tx.send(outcome);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RateConfig;
    use std::net::{IpAddr, Ipv4Addr};
    use std::sync::atomic::AtomicUsize;

    struct CountingTransmit {
        count: AtomicUsize,
    }

    impl FrameTransmit for CountingTransmit {
        fn transmit(&self, _remote: SocketAddr, _frame: Bytes) {
            self.count.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct RecordingTransmit {
        frames: Mutex<Vec<Bytes>>,
    }

    impl FrameTransmit for RecordingTransmit {
        fn transmit(&self, _remote: SocketAddr, frame: Bytes) {
            self.frames.lock().unwrap().push(frame);
        }
    }

    fn addr() -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 9999)
    }

    fn rate_config() -> RateConfig {
        RateConfig { min: 512, max: 8192, in_flight_cap: 8192 }
    }

    fn test_congestion_controller() -> Mutex<CongestionController> {
        Mutex::new(CongestionController::new(crate::config::TransportConfig::default().congestion))
    }

    #[test]
    fn fragments_via_ceil_division() {
        let payload = Bytes::from(vec![0u8; 2500]);
        let msg = SendMessage::new(1, 2, payload, addr(), 1024, Priority::Standard).unwrap();
        assert_eq!(msg.total(), 3);
    }

    #[test]
    fn oversized_message_is_rejected_at_build_time() {
        // frame_count is pure, so this checks the u32::MAX boundary without
        // allocating a multi-gigabyte payload to actually trigger it.
        assert!(frame_count(u32::MAX as usize, 1) > u32::MAX as usize);

        let err = SendMessage::new(1, 2, Bytes::from(vec![0u8; 10]), addr(), 1024, Priority::Standard);
        assert!(err.is_ok(), "a normal-sized payload must still build");
    }

    #[test]
    fn empty_payload_is_a_single_frame() {
        let msg = SendMessage::new(1, 2, Bytes::new(), addr(), 1024, Priority::Standard).unwrap();
        assert_eq!(msg.total(), 1);
    }

    #[tokio::test]
    async fn send_all_emits_every_frame_and_completes_on_full_ack() {
        let msg = SendMessage::new(1, 2, Bytes::from(vec![0u8; 100]), addr(), 1024, Priority::Standard).unwrap();
        let transmit = Arc::new(CountingTransmit { count: AtomicUsize::new(0) });
        let flow = Arc::new(FlowController::new(rate_config()));
        let congestion = Arc::new(test_congestion_controller());
        let global = Box::leak(Box::new(test_global_flow_controller()));
        let timer = TimerWheel::new();

        let rx = msg
            .send_all(transmit.clone(), flow.clone(), congestion.clone(), global, &timer, Duration::from_millis(500), None)
            .await;
        assert_eq!(transmit.count.load(Ordering::SeqCst), 1);
        flow.on_admit(1);
        msg.on_ack(0, &flow, &congestion, global);
        let outcome = rx.await.unwrap();
        assert_eq!(outcome, SendOutcome::Success);
        assert_eq!(flow.in_flight(), 0);
    }

    #[tokio::test]
    async fn fec_enabled_send_wraps_frames_and_emits_parity() {
        // 4 data frames at N=4 means group 0 fills on the last fragment and
        // emits exactly one trailing parity frame: 5 sends total.
        let msg = SendMessage::new(1, 2, Bytes::from(vec![7u8; 4000]), addr(), 1024, Priority::Standard).unwrap();
        assert_eq!(msg.total(), 4);
        let transmit = Arc::new(RecordingTransmit { frames: Mutex::new(Vec::new()) });
        let flow = Arc::new(FlowController::new(rate_config()));
        let congestion = Arc::new(test_congestion_controller());
        let global = Box::leak(Box::new(test_global_flow_controller()));
        let timer = TimerWheel::new();
        let fec = Mutex::new(FecEncoder::new(4));

        let _rx = msg
            .send_all(transmit.clone(), flow.clone(), congestion.clone(), global, &timer, Duration::from_millis(500), Some(&fec))
            .await;

        let sent = transmit.frames.lock().unwrap();
        assert_eq!(sent.len(), 5);
        for raw in sent.iter() {
            let mut buf = raw.clone();
            let decoded = Frame::decode(&mut buf).unwrap();
            assert_eq!(decoded.header.frame_type, FrameType::Fec);
        }
        let mut last = sent[4].clone();
        let parity = Frame::decode(&mut last).unwrap();
        assert_eq!(parity.header.fec_index, 4);
        assert_eq!(parity.header.total, 4);
    }

    #[tokio::test]
    async fn duplicate_ack_is_idempotent() {
        let msg = SendMessage::new(1, 2, Bytes::from(vec![0u8; 100]), addr(), 1024, Priority::Standard).unwrap();
        let flow = Arc::new(FlowController::new(rate_config()));
        let congestion = test_congestion_controller();
        let global = Box::leak(Box::new(test_global_flow_controller()));
        msg.on_ack(0, &flow, &congestion, global);
        msg.on_ack(0, &flow, &congestion, global);
        assert!(msg.is_complete());
    }

    #[test]
    fn batch_ack_length_mismatch_is_ignored_not_erroring() {
        let msg = SendMessage::new(1, 2, Bytes::from(vec![0u8; 3000]), addr(), 1024, Priority::Standard).unwrap();
        let flow = Arc::new(FlowController::new(rate_config()));
        let congestion = test_congestion_controller();
        let global = Box::leak(Box::new(test_global_flow_controller()));
        msg.on_batch_ack(&[0u8; 1], &flow, &congestion, global); // wrong length for total=3
        assert!(!msg.is_complete());
    }

    #[test]
    fn batch_ack_applies_every_set_bit() {
        let msg = SendMessage::new(1, 2, Bytes::from(vec![0u8; 3000]), addr(), 1024, Priority::Standard).unwrap();
        let flow = Arc::new(FlowController::new(rate_config()));
        let congestion = test_congestion_controller();
        let global = Box::leak(Box::new(test_global_flow_controller()));
        assert_eq!(msg.total(), 3);
        msg.on_batch_ack(&[0b1110_0000], &flow, &congestion, global); // bits 0,1,2 set
        assert!(msg.is_complete());
    }

    #[test]
    fn all_received_short_circuits_completion() {
        let msg = SendMessage::new(1, 2, Bytes::from(vec![0u8; 3000]), addr(), 1024, Priority::Standard).unwrap();
        let flow = Arc::new(FlowController::new(rate_config()));
        let congestion = test_congestion_controller();
        let global = Box::leak(Box::new(test_global_flow_controller()));
        flow.on_admit(msg.total());
        msg.all_received(&flow, &congestion, global);
        assert!(msg.is_complete());
        assert_eq!(flow.in_flight(), 0);
    }

    fn test_global_flow_controller() -> GlobalFlowController {
        GlobalFlowController::new(RateConfig { min: 512, max: 81920, in_flight_cap: 65536 })
    }
}
