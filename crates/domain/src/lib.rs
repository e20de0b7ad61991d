//! Shared types for LaneAgent: configuration, errors, ledger/queue message
//! shapes, and structured trace events.

pub mod config;
pub mod error;
pub mod inbound;
pub mod message;
pub mod paths;
pub mod trace;
