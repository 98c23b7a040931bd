//! Wire contract shared by the execution server, worker nodes and the
//! training-side client.
//!
//! Bodies on the wire are raw bytes. The only structure this crate imposes
//! is the framing the broker itself reads: big-endian `u64` batch-id
//! prefixes, the 24-byte version triple, the 16-byte parameters block, and
//! the JSON factory specs that replace pickled classes.

pub mod batch;
pub mod factory;
pub mod http;
pub mod wire;

pub use batch::Sample;
pub use factory::FactorySpec;
pub use wire::{Parameters, VersionTriple, WireError};
