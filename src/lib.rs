//! # strata-quicdgram
//!
//! Reliable, multiplexed, unordered-between-messages datagram transport over
//! a single shared UDP socket. Custom 64-byte fixed-header wire format,
//! AIMD + CUBIC/BBR-style congestion control, XOR `(N+1)` FEC, and a
//! whole-message send/receive model that never retransmits an individual
//! frame — loss is covered by the caller retrying the whole send.
//!
//! ## Crate structure
//!
//! - [`wire`] — frame header/payload codec, frame types, BATCH_ACK bitmap
//! - [`error`] — closed `TransportError` set
//! - [`config`] — [`config::TransportConfig`] and its sub-configs
//! - [`ids`] — snowflake-style `connection_id`/`data_id` generator
//! - [`timer`] — hashed timer wheel for deadlines and keepalives
//! - [`fec`] — XOR `(N+1)` forward error correction
//! - [`flow`] — per-connection AIMD frame-rate admission control
//! - [`global_flow`] — process-wide admission control singleton
//! - [`congestion`] — byte-granularity CUBIC/BBR-style congestion window
//! - [`send_message`] — fragmentation, admission, and ACK tracking for one
//!   outbound `(connection_id, data_id)`
//! - [`recv_message`] — reassembly, duplicate detection, and batched ACKs
//!   for one inbound `(connection_id, data_id)`
//! - [`connection`] — per-peer state machine, handshake, keepalive,
//!   migration, and inbound frame dispatch
//! - [`manager`] — process-wide connection registry, peer index, and
//!   handshake orchestration
//! - [`io`] — the single shared `UdpSocket` and its ingress/periodic loops
//! - [`stats`] — lock-free per-connection and process-wide counters

pub mod config;
pub mod congestion;
pub mod connection;
pub mod error;
pub mod fec;
pub mod flow;
pub mod global_flow;
pub mod ids;
pub mod io;
pub mod manager;
pub mod recv_message;
pub mod send_message;
pub mod stats;
pub mod timer;
pub mod wire;
