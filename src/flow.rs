//! # Per-Connection Flow Controller
//!
//! AIMD rate control over frames/sec, independent of the byte-granularity
//! congestion controller. Admission requires both an in-flight-frame budget
//! and a per-second frame budget.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;

use crate::config::RateConfig;

const CONSECUTIVE_ACK_THRESHOLD: u32 = 200;
const RATE_INCREASE_FACTOR: f64 = 1.2;
const RATE_DECREASE_FACTOR: f64 = 0.8;
const SEND_DURATION_HISTORY: usize = 1024;

/// Per-connection admission state for the frames/sec AIMD scheme.
pub struct FlowController {
    in_flight: AtomicU32,
    frames_this_second: AtomicU32,
    current_sec_ts: AtomicU64,
    rate: AtomicU32,
    consecutive_acks: AtomicU32,
    min_rate: u32,
    max_rate: u32,
    in_flight_cap: u32,
    send_durations: Mutex<VecDeque<u64>>,
}

/// Outcome of an admission check, including whatever caused rejection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionResult {
    Admitted,
    InFlightCapExceeded,
    RateCapExceeded,
}

impl FlowController {
    pub fn new(config: RateConfig) -> Self {
        FlowController {
            in_flight: AtomicU32::new(0),
            frames_this_second: AtomicU32::new(0),
            current_sec_ts: AtomicU64::new(Self::now_secs()),
            rate: AtomicU32::new(config.min),
            consecutive_acks: AtomicU32::new(0),
            min_rate: config.min,
            max_rate: config.max,
            in_flight_cap: config.in_flight_cap,
            send_durations: Mutex::new(VecDeque::with_capacity(SEND_DURATION_HISTORY)),
        }
    }

    fn now_secs() -> u64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0)
    }

    fn roll_second_if_needed(&self) {
        let now = Self::now_secs();
        let prev = self.current_sec_ts.load(Ordering::Acquire);
        if now != prev && self.current_sec_ts.compare_exchange(prev, now, Ordering::AcqRel, Ordering::Relaxed).is_ok() {
            self.frames_this_second.store(0, Ordering::Release);
        }
    }

    /// Check whether `batch` additional frames can be admitted right now.
    /// Non-blocking: does not reserve budget, callers should call
    /// [`Self::on_admit`] immediately after a positive result.
    pub fn can_send(&self, batch: u32) -> AdmissionResult {
        self.roll_second_if_needed();
        let in_flight = self.in_flight.load(Ordering::Acquire);
        if in_flight + batch > self.in_flight_cap {
            return AdmissionResult::InFlightCapExceeded;
        }
        let this_second = self.frames_this_second.load(Ordering::Acquire);
        let rate = self.rate.load(Ordering::Acquire);
        if this_second + batch > rate {
            return AdmissionResult::RateCapExceeded;
        }
        AdmissionResult::Admitted
    }

    /// Record that `batch` frames were actually admitted and sent.
    pub fn on_admit(&self, batch: u32) {
        self.in_flight.fetch_add(batch, Ordering::AcqRel);
        self.frames_this_second.fetch_add(batch, Ordering::AcqRel);
    }

    /// Feedback for a successful ACK: decrement in-flight, grow the rate
    /// multiplicatively once [`CONSECUTIVE_ACK_THRESHOLD`] consecutive ACKs
    /// accumulate.
    pub fn on_ack(&self) {
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
        let prev = self.consecutive_acks.fetch_add(1, Ordering::AcqRel) + 1;
        if prev >= CONSECUTIVE_ACK_THRESHOLD {
            self.consecutive_acks.fetch_sub(CONSECUTIVE_ACK_THRESHOLD, Ordering::AcqRel);
            self.grow_rate();
        }
    }

    /// Feedback for a send failure or timeout: shrink the rate
    /// multiplicatively, reset the consecutive-ACK counter, and withdraw the
    /// failed frames from both in-flight and this-second counters.
    pub fn on_failure(&self, failed_frames: u32) {
        self.consecutive_acks.store(0, Ordering::Release);
        self.shrink_rate();
        self.in_flight.fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| {
            Some(v.saturating_sub(failed_frames))
        }).ok();
        self.frames_this_second.fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| {
            Some(v.saturating_sub(failed_frames))
        }).ok();
    }

    fn grow_rate(&self) {
        self.rate
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |r| {
                let grown = ((r as f64) * RATE_INCREASE_FACTOR) as u32;
                Some(grown.min(self.max_rate))
            })
            .ok();
    }

    fn shrink_rate(&self) {
        self.rate
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |r| {
                let shrunk = ((r as f64) * RATE_DECREASE_FACTOR) as u32;
                Some(shrunk.max(self.min_rate))
            })
            .ok();
    }

    pub fn in_flight(&self) -> u32 {
        self.in_flight.load(Ordering::Acquire)
    }

    pub fn rate(&self) -> u32 {
        self.rate.load(Ordering::Acquire)
    }

    /// Record a per-frame send duration (nanoseconds) into the bounded
    /// observability ring buffer.
    pub fn record_send_duration(&self, nanos: u64) {
        let mut history = self.send_durations.lock().unwrap();
        if history.len() == SEND_DURATION_HISTORY {
            history.pop_front();
        }
        history.push_back(nanos);
    }

    pub fn send_duration_samples(&self) -> Vec<u64> {
        self.send_durations.lock().unwrap().iter().copied().collect()
    }
}
