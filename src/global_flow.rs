//! # Global Flow Controller
//!
//! Process-wide admission control layered above the per-connection
//! [`crate::flow::FlowController`]. A frame must clear both the connection's
//! local AIMD budget and this process-wide budget before it is sent.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use once_cell::sync::OnceCell;

use crate::config::RateConfig;
use crate::flow::AdmissionResult;

static GLOBAL: OnceCell<GlobalFlowController> = OnceCell::new();

/// Process-wide frame budget, independent of and layered above any single
/// connection's [`crate::flow::FlowController`].
pub struct GlobalFlowController {
    in_flight: AtomicU32,
    frames_this_second: AtomicU32,
    current_sec_ts: AtomicU64,
    rate: AtomicU32,
    in_flight_cap: u32,
    max_rate: u32,
}

impl GlobalFlowController {
    pub(crate) fn new(config: RateConfig) -> Self {
        GlobalFlowController {
            in_flight: AtomicU32::new(0),
            frames_this_second: AtomicU32::new(0),
            current_sec_ts: AtomicU64::new(Self::now_secs()),
            rate: AtomicU32::new(config.max),
            in_flight_cap: config.in_flight_cap,
            max_rate: config.max,
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
        if now != prev
            && self
                .current_sec_ts
                .compare_exchange(prev, now, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
        {
            self.frames_this_second.store(0, Ordering::Release);
        }
    }

    pub fn can_send(&self, batch: u32) -> AdmissionResult {
        self.roll_second_if_needed();
        if self.in_flight.load(Ordering::Acquire) + batch > self.in_flight_cap {
            return AdmissionResult::InFlightCapExceeded;
        }
        if self.frames_this_second.load(Ordering::Acquire) + batch > self.max_rate {
            return AdmissionResult::RateCapExceeded;
        }
        AdmissionResult::Admitted
    }

    pub fn on_admit(&self, batch: u32) {
        self.in_flight.fetch_add(batch, Ordering::AcqRel);
        self.frames_this_second.fetch_add(batch, Ordering::AcqRel);
    }

    /// Mirror of a per-connection ACK (or a failure/timeout releasing
    /// frames that will never be acked): withdraw `batch` frames from the
    /// process-wide in-flight count, saturating at zero. Called from every
    /// send-side completion path so this counter tracks the sum of what
    /// every connection's own `FlowController.in_flight` reports, never
    /// drifting upward for the life of a long-running connection.
    pub fn on_ack(&self, batch: u32) {
        self.in_flight.fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| {
            Some(v.saturating_sub(batch))
        }).ok();
    }

    pub fn on_complete(&self, batch: u32) {
        self.in_flight.fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| {
            Some(v.saturating_sub(batch))
        }).ok();
    }

    pub fn in_flight(&self) -> u32 {
        self.in_flight.load(Ordering::Acquire)
    }

    #[cfg(test)]
    pub fn rate(&self) -> u32 {
        self.rate.load(Ordering::Acquire)
    }
}

/// Install the process-wide global flow controller. Only the first call per
/// process takes effect; later calls are no-ops, matching the
/// once-per-process singleton the connection manager expects.
pub fn install(config: RateConfig) {
    let _ = GLOBAL.set(GlobalFlowController::new(config));
}

/// Fetch the process-wide global flow controller, installing it with
/// default-ish caps from `config` on first access if [`install`] was never
/// called.
pub fn global(config: RateConfig) -> &'static GlobalFlowController {
    GLOBAL.get_or_init(|| GlobalFlowController::new(config))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> RateConfig {
        RateConfig {
            min: 512,
            max: 81920,
            in_flight_cap: 65536,
        }
    }

    #[test]
    fn admits_within_global_caps() {
        let gfc = GlobalFlowController::new(config());
        assert_eq!(gfc.can_send(1000), AdmissionResult::Admitted);
    }

    #[test]
    fn rejects_beyond_global_in_flight_cap() {
        let gfc = GlobalFlowController::new(config());
        gfc.on_admit(65536);
        assert_eq!(gfc.can_send(1), AdmissionResult::InFlightCapExceeded);
    }

    #[test]
    fn rejects_beyond_global_rate_cap() {
        let gfc = GlobalFlowController::new(config());
        assert_eq!(gfc.can_send(81921), AdmissionResult::RateCapExceeded);
    }

    #[test]
    fn on_complete_frees_in_flight_budget() {
        let gfc = GlobalFlowController::new(config());
        gfc.on_admit(100);
        gfc.on_complete(100);
        assert_eq!(gfc.in_flight(), 0);
    }

    #[test]
    fn on_ack_withdraws_in_flight_budget() {
        let gfc = GlobalFlowController::new(config());
        gfc.on_admit(10);
        gfc.on_ack(4);
        assert_eq!(gfc.in_flight(), 6);
    }

    #[test]
    fn on_ack_saturates_at_zero() {
        let gfc = GlobalFlowController::new(config());
        gfc.on_ack(1);
        assert_eq!(gfc.in_flight(), 0);
    }
}
