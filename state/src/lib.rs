//! Elastic Rendezvous State Management
//!
//! Provides the shared round record, the CAS state holder that keeps a local
//! view of it in sync, and concrete backends and stores.

pub mod record;
pub mod holder;
pub mod store;
pub mod memory;
pub mod persistent;

pub use record::*;
pub use holder::*;
pub use store::*;
pub use memory::*;
pub use persistent::*;
