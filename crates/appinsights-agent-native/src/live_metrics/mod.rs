//! Live metrics: concurrent counters plus the QuickPulse control loop.
//!
//! The collector side is wait-free for writers: every envelope the pipeline
//! fans out lands in a pair of packed 64-bit words and three plain counters,
//! and a snapshot is an atomic swap-and-reset, so one envelope contributes
//! to exactly one snapshot. The sender side polls the control endpoint for
//! activation and streams one snapshot per second while a subscriber is
//! attached.

pub mod collector;
pub mod sender;

pub use collector::{FinalCounters, QuickPulseDataCollector};
pub use sender::QuickPulseSender;
