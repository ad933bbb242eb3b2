//! Elastic rendezvous tooling
//!
//! Runs in-process rendezvous simulations and inspects persisted round
//! state. Used by the `rendezvous-node` binary.

mod inspect;
mod simulation;

pub use inspect::*;
pub use simulation::*;
