//! SVRC is an on-the-fly reference-counting memory manager. It combines a
//! sliding-view reference-counting collector with an occasional backup
//! tracing collector, both running on a dedicated collector thread that
//! never stops the world: mutators are coordinated through a four-stage
//! handshake and advance between stages independently.
//!
//! Logically, this crate includes these major parts:
//! * The [block manager](heap/block_manager/index.html): carves a single
//!   contiguous heap reservation into block-granular regions, with
//!   quick-lists, an ordered list-of-lists, and a wilderness.
//! * The [chunk manager](heap/chunk_manager/index.html): size-class
//!   allocation lists owned by mutators, global partial lists, and a
//!   recycled-lists cache for deferred frees.
//! * The [collector](plan/index.html): per-mutator write buffers, the
//!   four-stage handshake that captures a consistent sliding view, RC
//!   updating from logged replicas, a zero-count table, recursive
//!   deletion, and the backup trace-and-sweep.
//! * Interfaces: [the memory manager API](memory_manager/index.html) that
//!   a language runtime calls into, and the
//!   [RuntimeBinding trait](vm/trait.RuntimeBinding.html) through which
//!   SVRC calls back into the runtime.

extern crate libc;
#[macro_use]
extern crate lazy_static;
#[macro_use]
extern crate log;
extern crate atomic;
extern crate num_cpus;
#[macro_use]
extern crate static_assertions;

#[macro_use]
pub mod util;
pub mod heap;
pub mod memory_manager;
pub mod plan;
mod svrc;
pub mod vm;

pub use crate::plan::Mutator;
pub use crate::svrc::{FreeBytes, Stats, SVRC};
