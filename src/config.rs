//! Transport-wide configuration. One struct aggregating every tunable from
//! the external-interfaces defaults; constructed once by the host and handed
//! to the [`crate::manager::ConnectionManager`].

use std::time::Duration;

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub outbound_heartbeat_interval: Duration,
    pub connection_expire_timeout: Duration,
    pub global_timeout: Duration,
    pub max_frame_payload: u32,
    pub fec_redundancy_ratio: u32,
    pub batch_ack_delay: Duration,
    pub batch_ack_threshold: usize,
    pub per_connection_rate: RateConfig,
    pub global_rate: RateConfig,
    pub congestion: CongestionConfig,
    pub delivered_queue_capacity: usize,
    pub connection_registry_capacity: usize,
    pub request_response_ttl: Duration,
    pub dedup_cache_capacity: usize,
    pub dedup_cache_ttl: Duration,
}

#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize)]
pub struct RateConfig {
    pub min: u32,
    pub max: u32,
    pub in_flight_cap: u32,
}

#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize)]
pub struct CongestionConfig {
    pub initial_cwnd: u32,
    pub min_cwnd: u32,
    pub max_cwnd: u32,
    pub cubic_beta: f64,
    pub cubic_c: f64,
    pub loss_rate_beta_threshold: f64,
    pub recovery_beta: f64,
    pub rtt_spike_threshold_ms: u64,
    pub recovery_timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        TransportConfig {
            outbound_heartbeat_interval: Duration::from_millis(500),
            connection_expire_timeout: Duration::from_millis(2000),
            global_timeout: Duration::from_millis(5000),
            max_frame_payload: 1024,
            fec_redundancy_ratio: 4,
            batch_ack_delay: Duration::from_millis(20),
            batch_ack_threshold: 32,
            per_connection_rate: RateConfig {
                min: 512,
                max: 8192,
                in_flight_cap: 8192,
            },
            global_rate: RateConfig {
                min: 512,
                max: 81920,
                in_flight_cap: 65536,
            },
            congestion: CongestionConfig {
                initial_cwnd: 10_000,
                min_cwnd: 2_000,
                max_cwnd: 100_000_000,
                cubic_beta: 0.7,
                cubic_c: 0.4,
                loss_rate_beta_threshold: 0.02,
                recovery_beta: 0.5,
                rtt_spike_threshold_ms: 200,
                recovery_timeout: Duration::from_secs(5),
            },
            delivered_queue_capacity: 10_000,
            connection_registry_capacity: 10_000,
            request_response_ttl: Duration::from_secs(5),
            dedup_cache_capacity: 5_000_000,
            dedup_cache_ttl: Duration::from_secs(5),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let cfg = TransportConfig::default();
        assert_eq!(cfg.max_frame_payload, 1024);
        assert_eq!(cfg.per_connection_rate.in_flight_cap, 8192);
        assert_eq!(cfg.global_rate.in_flight_cap, 65536);
        assert_eq!(cfg.batch_ack_threshold, 32);
    }

    #[test]
    fn serializes_round_trip_via_json() {
        let cfg = TransportConfig::default();
        let json = serde_json::to_string(&cfg).unwrap();
        let back: TransportConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.max_frame_payload, cfg.max_frame_payload);
    }
}
