//! Elastic Rendezvous Core Library
//!
//! Core types, traits, and abstractions shared by the rendezvous crates:
//! node identity, the timeout policy, the CAS backend contract and errors.

pub mod types;
pub mod traits;
pub mod error;
pub mod config;

pub use types::*;
pub use traits::*;
pub use error::*;
pub use config::*;
