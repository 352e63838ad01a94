//! # Transport Statistics
//!
//! Per-connection and process-wide counters, readable via snapshot without
//! locking out the hot path — every field is atomic, `snapshot()` just reads
//! them. Designed for Prometheus export and JSON serialization, matching the
//! teacher's own stats shape.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use serde::Serialize;

// ─── Connection Stats ───────────────────────────────────────────────────────

/// Live, lock-free per-connection counters.
#[derive(Debug, Default)]
pub struct ConnectionStats {
    frames_sent: AtomicU64,
    frames_acked: AtomicU64,
    frames_expired: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    cwnd_bits: AtomicU64,
    rate: AtomicU32,
    srtt_us_bits: AtomicU64,
}

/// Point-in-time snapshot of [`ConnectionStats`], safe to serialize.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ConnectionStatsSnapshot {
    pub frames_sent: u64,
    pub frames_acked: u64,
    pub frames_expired: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub cwnd: f64,
    pub rate: u32,
    pub srtt_us: f64,
}

impl ConnectionStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_frame_sent(&self, bytes: u64) {
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_frame_acked(&self) {
        self.frames_acked.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_frame_expired(&self) {
        self.frames_expired.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_bytes_received(&self, bytes: u64) {
        self.bytes_received.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn set_cwnd(&self, cwnd: f64) {
        self.cwnd_bits.store(cwnd.to_bits(), Ordering::Relaxed);
    }

    pub fn set_rate(&self, rate: u32) {
        self.rate.store(rate, Ordering::Relaxed);
    }

    pub fn set_srtt_us(&self, srtt_us: f64) {
        self.srtt_us_bits.store(srtt_us.to_bits(), Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ConnectionStatsSnapshot {
        ConnectionStatsSnapshot {
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            frames_acked: self.frames_acked.load(Ordering::Relaxed),
            frames_expired: self.frames_expired.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            cwnd: f64::from_bits(self.cwnd_bits.load(Ordering::Relaxed)),
            rate: self.rate.load(Ordering::Relaxed),
            srtt_us: f64::from_bits(self.srtt_us_bits.load(Ordering::Relaxed)),
        }
    }
}

// ─── Global Stats ───────────────────────────────────────────────────────────

/// Process-wide counters maintained by the connection manager.
#[derive(Debug, Default)]
pub struct GlobalStats {
    in_flight: AtomicU32,
    registered_connections: AtomicU32,
    admission_rejections: AtomicU64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct GlobalStatsSnapshot {
    pub in_flight: u32,
    pub registered_connections: u32,
    pub admission_rejections: u64,
}

impl GlobalStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_admission_rejection(&self) {
        self.admission_rejections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_registered(&self) {
        self.registered_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_unregistered(&self) {
        self.registered_connections.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
            Some(v.saturating_sub(1))
        }).ok();
    }

    pub fn set_in_flight(&self, value: u32) {
        self.in_flight.store(value, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> GlobalStatsSnapshot {
        GlobalStatsSnapshot {
            in_flight: self.in_flight.load(Ordering::Relaxed),
            registered_connections: self.registered_connections.load(Ordering::Relaxed),
            admission_rejections: self.admission_rejections.load(Ordering::Relaxed),
        }
    }
}

// ─── EWMA ───────────────────────────────────────────────────────────────────

/// Exponentially weighted moving average, used by higher layers for
/// observability series that don't need full windowed accuracy.
#[derive(Debug, Clone)]
pub struct Ewma {
    alpha: f64,
    value: f64,
    initialized: bool,
}

impl Ewma {
    pub fn new(alpha: f64) -> Self {
        assert!((0.0..=1.0).contains(&alpha), "alpha must be in [0, 1]");
        Ewma {
            alpha,
            value: 0.0,
            initialized: false,
        }
    }

    pub fn update(&mut self, sample: f64) -> f64 {
        if !self.initialized {
            self.value = sample;
            self.initialized = true;
        } else {
            self.value = self.alpha * sample + (1.0 - self.alpha) * self.value;
        }
        self.value
    }

    pub fn value(&self) -> f64 {
        self.value
    }

    pub fn reset(&mut self) {
        self.value = 0.0;
        self.initialized = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_stats_accumulate() {
        let stats = ConnectionStats::new();
        stats.record_frame_sent(100);
        stats.record_frame_sent(50);
        stats.record_frame_acked();
        let snap = stats.snapshot();
        assert_eq!(snap.frames_sent, 2);
        assert_eq!(snap.bytes_sent, 150);
        assert_eq!(snap.frames_acked, 1);
    }

    #[test]
    fn connection_stats_float_fields_round_trip_via_bits() {
        let stats = ConnectionStats::new();
        stats.set_cwnd(12345.678);
        stats.set_srtt_us(999.5);
        let snap = stats.snapshot();
        assert!((snap.cwnd - 12345.678).abs() < 1e-9);
        assert!((snap.srtt_us - 999.5).abs() < 1e-9);
    }

    #[test]
    fn global_stats_registration_tracking() {
        let stats = GlobalStats::new();
        stats.connection_registered();
        stats.connection_registered();
        stats.connection_unregistered();
        assert_eq!(stats.snapshot().registered_connections, 1);
    }

    #[test]
    fn global_stats_unregister_floors_at_zero() {
        let stats = GlobalStats::new();
        stats.connection_unregistered();
        assert_eq!(stats.snapshot().registered_connections, 0);
    }

    #[test]
    fn global_stats_serializes() {
        let stats = GlobalStats::new();
        stats.record_admission_rejection();
        let json = serde_json::to_string(&stats.snapshot()).unwrap();
        assert!(json.contains("\"admission_rejections\":1"));
    }

    #[test]
    fn ewma_first_sample_sets_value() {
        let mut ewma = Ewma::new(0.125);
        ewma.update(100.0);
        assert_eq!(ewma.value(), 100.0);
    }

    #[test]
    fn ewma_smooths_toward_new_value() {
        let mut ewma = Ewma::new(0.5);
        ewma.update(100.0);
        let v = ewma.update(200.0);
        assert!((v - 150.0).abs() < 0.001);
    }

    #[test]
    fn ewma_reset() {
        let mut ewma = Ewma::new(0.5);
        ewma.update(100.0);
        ewma.reset();
        assert_eq!(ewma.value(), 0.0);
    }
}
