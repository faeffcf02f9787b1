//! The collector: write buffers, barriers, the four-stage handshake, RC
//! updating and reclamation, the tracing backup, and cycle scheduling.

pub mod barriers;
#[cfg(test)]
mod collection_tests;
pub mod gc_requester;
pub mod global;
pub(crate) mod handshake;
pub mod log_buffer;
pub mod mutator;
pub(crate) mod rc;
pub(crate) mod tracing;

pub use global::{CollectionKind, CycleStats};
pub use mutator::{Mutator, Stage};
