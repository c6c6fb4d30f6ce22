//! Host-facing contract, stdio bridge and latency harness.

pub mod channel;
pub mod contract;
pub mod latency;
pub mod stdio;
