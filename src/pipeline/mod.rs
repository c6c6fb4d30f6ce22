//! Turn pipeline: messages, state machine, shared pools and the event bus.

pub mod bus;
pub mod controller;
pub mod coordinator;
pub mod latency;
pub mod messages;
pub mod pool;
pub mod queue;
pub mod turn;
