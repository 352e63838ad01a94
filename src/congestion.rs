//! # Congestion Control
//!
//! Byte-granularity congestion window, independent of the frame-count AIMD
//! flow controllers. Slow start ramps `cwnd` until the first RTT spike or a
//! loss, then CUBIC governs window growth with an RFC 6298 RTT estimator
//! feeding a BBR-style pacing target layered on top.

use std::time::Duration;
use quanta::Instant;
use tracing::debug;

use crate::config::CongestionConfig;

const ALPHA: f64 = 0.125;
const BETA: f64 = 0.25;
const MIN_RATE_SAMPLE_INTERVAL: Duration = Duration::from_millis(100);
const RECOVERY_GROWTH_PER_ACK: f64 = 1024.0;

/// Byte-granularity congestion controller for one connection.
pub struct CongestionController {
    cwnd: f64,
    ssthresh: f64,
    min_cwnd: f64,
    max_cwnd: f64,

    srtt_us: f64,
    rttvar_us: f64,
    min_rtt_us: f64,
    max_rtt_us: f64,
    sample_count: u64,

    delivery_rate_bytes_per_ms: f64,
    last_rate_sample: Instant,
    bytes_since_rate_sample: u64,

    in_slow_start: bool,
    in_recovery: bool,
    recovery_started: Option<Instant>,
    recovery_timeout: Duration,

    cubic_origin: f64,
    cubic_epoch: Instant,
    cubic_c: f64,
    cubic_beta: f64,
    loss_rate_beta_threshold: f64,
    recovery_beta: f64,
    rtt_spike_threshold_us: f64,

    recent_losses: u64,
    recent_acks: u64,
}

impl CongestionController {
    pub fn new(config: CongestionConfig) -> Self {
        let now = Instant::now();
        CongestionController {
            cwnd: config.initial_cwnd as f64,
            ssthresh: f64::MAX,
            min_cwnd: config.min_cwnd as f64,
            max_cwnd: config.max_cwnd as f64,

            srtt_us: 0.0,
            rttvar_us: 0.0,
            min_rtt_us: f64::MAX,
            max_rtt_us: 0.0,
            sample_count: 0,

            delivery_rate_bytes_per_ms: 0.0,
            last_rate_sample: now,
            bytes_since_rate_sample: 0,

            in_slow_start: true,
            in_recovery: false,
            recovery_started: None,
            recovery_timeout: config.recovery_timeout,

            cubic_origin: config.initial_cwnd as f64,
            cubic_epoch: now,
            cubic_c: config.cubic_c,
            cubic_beta: config.cubic_beta,
            loss_rate_beta_threshold: config.loss_rate_beta_threshold,
            recovery_beta: config.recovery_beta,
            rtt_spike_threshold_us: (config.rtt_spike_threshold_ms * 1000) as f64,

            recent_losses: 0,
            recent_acks: 0,
        }
    }

    pub fn cwnd(&self) -> f64 {
        self.cwnd
    }

    pub fn in_slow_start(&self) -> bool {
        self.in_slow_start
    }

    pub fn in_recovery(&self) -> bool {
        self.in_recovery
    }

    pub fn srtt_us(&self) -> f64 {
        self.srtt_us
    }

    /// Pacing rate in bytes/ms derived from the current window and smoothed
    /// RTT; callers divide `cwnd` over `srtt` to get a send budget per ms.
    pub fn pacing_rate_bytes_per_ms(&self) -> f64 {
        if self.srtt_us <= 0.0 {
            return self.cwnd;
        }
        self.cwnd * 1000.0 / self.srtt_us
    }

    /// Record bytes handed off to the network. Grows `cwnd` during slow
    /// start; checks for an RTT spike that should exit slow start early.
    pub fn on_data_sent(&mut self, bytes: u64) {
        self.bytes_since_rate_sample += bytes;
        if self.in_slow_start {
            self.cwnd = (self.cwnd + bytes as f64).min(self.ssthresh).min(self.max_cwnd);
        }
        if self.min_rtt_us.is_finite()
            && self.srtt_us > self.min_rtt_us + self.rtt_spike_threshold_us
        {
            self.exit_slow_start();
        }
    }

    /// Record an RTT sample (microseconds) from an ACK or keepalive pong.
    pub fn on_rtt_sample(&mut self, rtt_us: f64) {
        if rtt_us <= 0.0 {
            return;
        }
        self.sample_count += 1;
        if rtt_us < self.min_rtt_us {
            self.min_rtt_us = rtt_us;
        }
        if rtt_us > self.max_rtt_us {
            self.max_rtt_us = rtt_us;
        }
        if self.sample_count == 1 {
            self.srtt_us = rtt_us;
            self.rttvar_us = rtt_us / 2.0;
        } else {
            self.rttvar_us = (1.0 - BETA) * self.rttvar_us + BETA * (self.srtt_us - rtt_us).abs();
            self.srtt_us = (1.0 - ALPHA) * self.srtt_us + ALPHA * rtt_us;
        }
        if self.min_rtt_us.is_finite()
            && self.srtt_us > self.min_rtt_us + self.rtt_spike_threshold_us
        {
            self.exit_slow_start();
        }
    }

    pub fn rto_us(&self) -> f64 {
        (self.srtt_us + 4.0 * self.rttvar_us).clamp(1_000.0, 60_000_000.0)
    }

    fn exit_slow_start(&mut self) {
        if self.in_slow_start {
            self.in_slow_start = false;
            self.ssthresh = self.cwnd;
            self.cubic_origin = self.cwnd;
            self.cubic_epoch = Instant::now();
            debug!(cwnd = self.cwnd, srtt_us = self.srtt_us, "exiting slow start");
        }
    }

    /// Feedback for an ACK: maintains the delivery-rate EWMA, and once out of
    /// slow start grows `cwnd` toward a CUBIC target, with recovery mode
    /// growing linearly instead.
    pub fn on_ack(&mut self, acked_bytes: u64) {
        self.bytes_since_rate_sample += acked_bytes;
        let elapsed = self.last_rate_sample.elapsed();
        if elapsed >= MIN_RATE_SAMPLE_INTERVAL {
            self.delivery_rate_bytes_per_ms =
                self.bytes_since_rate_sample as f64 / elapsed.as_millis().max(1) as f64;
            self.bytes_since_rate_sample = 0;
            self.last_rate_sample = Instant::now();
        }

        self.recent_acks += 1;

        if self.in_recovery {
            self.cwnd = (self.cwnd + RECOVERY_GROWTH_PER_ACK).min(self.max_cwnd);
            if let Some(started) = self.recovery_started {
                if started.elapsed() >= self.recovery_timeout {
                    self.in_recovery = false;
                    self.recovery_started = None;
                    debug!(cwnd = self.cwnd, "recovery timed out, resuming congestion avoidance");
                }
            }
            return;
        }

        if !self.in_slow_start {
            let t = self.cubic_epoch.elapsed().as_secs_f64();
            let target = self.cubic_origin + self.cubic_c * t.powi(3);
            let bounded_target = target.clamp(self.min_cwnd, self.max_cwnd);
            // Approach the CUBIC target in quarter-steps rather than
            // jumping straight there.
            self.cwnd = (self.cwnd + (bounded_target - self.cwnd) / 4.0)
                .clamp(self.min_cwnd, self.max_cwnd);
        }
    }

    /// Feedback for a detected loss: shrink `cwnd` multiplicatively (beta
    /// depends on recent loss rate), snapshot a new CUBIC anchor, and enter
    /// recovery.
    pub fn on_loss(&mut self) {
        self.recent_losses += 1;
        let total = (self.recent_acks + self.recent_losses).max(1);
        let loss_rate = self.recent_losses as f64 / total as f64;
        let beta = if loss_rate > self.loss_rate_beta_threshold {
            self.recovery_beta
        } else {
            self.cubic_beta
        };

        let new_cwnd = (self.cwnd * beta).max(self.min_cwnd);
        debug!(from_cwnd = self.cwnd, to_cwnd = new_cwnd, beta, loss_rate, "loss detected, entering recovery");
        self.cwnd = new_cwnd;
        self.ssthresh = new_cwnd;
        self.in_slow_start = false;
        self.in_recovery = true;
        self.recovery_started = Some(Instant::now());

        self.cubic_origin = new_cwnd;
        self.cubic_epoch = Instant::now();
    }

    pub fn delivery_rate_bytes_per_ms(&self) -> f64 {
        self.delivery_rate_bytes_per_ms
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> CongestionConfig {
        CongestionConfig {
            initial_cwnd: 10_000,
            min_cwnd: 2_000,
            max_cwnd: 100_000_000,
            cubic_beta: 0.7,
            cubic_c: 0.4,
            loss_rate_beta_threshold: 0.02,
            recovery_beta: 0.5,
            rtt_spike_threshold_ms: 200,
            recovery_timeout: Duration::from_secs(5),
        }
    }

    #[test]
    fn starts_in_slow_start_with_initial_cwnd() {
        let cc = CongestionController::new(config());
        assert!(cc.in_slow_start());
        assert_eq!(cc.cwnd(), 10_000.0);
    }

    #[test]
    fn slow_start_grows_cwnd_on_data_sent() {
        let mut cc = CongestionController::new(config());
        cc.on_data_sent(5_000);
        assert_eq!(cc.cwnd(), 15_000.0);
    }

    #[test]
    fn rtt_spike_exits_slow_start() {
        let mut cc = CongestionController::new(config());
        cc.on_rtt_sample(20_000.0); // 20ms baseline, becomes min_rtt
        cc.on_rtt_sample(250_000.0); // 250ms, spike > 200ms threshold over min
        assert!(!cc.in_slow_start());
    }

    #[test]
    fn loss_shrinks_cwnd_and_enters_recovery() {
        let mut cc = CongestionController::new(config());
        let before = cc.cwnd();
        cc.on_loss();
        assert!(cc.cwnd() < before);
        assert!(cc.in_recovery());
        assert_eq!(cc.cwnd(), before * 0.7);
    }

    #[test]
    fn heavy_loss_rate_uses_recovery_beta() {
        let mut cc = CongestionController::new(config());
        for _ in 0..10 {
            cc.on_loss();
        }
        // with recent_losses dominating, loss rate exceeds threshold so
        // subsequent shrinks use recovery_beta (0.5) not cubic_beta (0.7).
        let before = cc.cwnd();
        cc.on_loss();
        assert_eq!(cc.cwnd(), (before * 0.5).max(cc.min_cwnd.max(2_000.0)));
    }

    #[test]
    fn cwnd_never_drops_below_min() {
        let mut cc = CongestionController::new(config());
        for _ in 0..100 {
            cc.on_loss();
        }
        assert!(cc.cwnd() >= 2_000.0);
    }

    #[test]
    fn recovery_grows_linearly_per_ack() {
        let mut cc = CongestionController::new(config());
        cc.on_loss();
        let after_loss = cc.cwnd();
        cc.on_ack(0);
        assert_eq!(cc.cwnd(), after_loss + 1024.0);
    }

    #[test]
    fn rto_has_floor_and_ceiling() {
        let cc = CongestionController::new(config());
        assert!(cc.rto_us() >= 1_000.0);
        assert!(cc.rto_us() <= 60_000_000.0);
    }

    #[test]
    fn rtt_sample_updates_srtt_and_min_rtt() {
        let mut cc = CongestionController::new(config());
        cc.on_rtt_sample(50_000.0);
        assert_eq!(cc.srtt_us(), 50_000.0);
        cc.on_rtt_sample(30_000.0);
        assert!(cc.srtt_us() < 50_000.0);
    }

    #[test]
    fn pacing_rate_uses_cwnd_over_srtt() {
        let mut cc = CongestionController::new(config());
        cc.on_rtt_sample(10_000.0); // 10ms
        let rate = cc.pacing_rate_bytes_per_ms();
        assert!((rate - (10_000.0 * 1000.0 / 10_000.0)).abs() < 1.0);
    }

    #[test]
    fn cubic_avoidance_moves_cwnd_toward_target_after_slow_start() {
        let mut cc = CongestionController::new(config());
        cc.on_rtt_sample(20_000.0);
        cc.on_rtt_sample(250_000.0); // exit slow start
        assert!(!cc.in_slow_start());
        let before = cc.cwnd();
        cc.on_ack(0);
        // quarter-step toward a cubic target should move cwnd, not leave it static
        assert_ne!(cc.cwnd(), before);
    }
}
