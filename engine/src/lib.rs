//! Elastic rendezvous coordination engine
//!
//! Drives a round to completion over a compare-and-swap backend:
//! - Join, quorum detection and last call
//! - Deterministic rank assignment
//! - Keep-alive and eviction of dead peers
//! - Closing a run

pub mod executor;
pub mod factory;
pub mod handler;
pub mod op;

pub use executor::*;
pub use factory::*;
pub use handler::*;
pub use op::*;
