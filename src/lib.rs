//! Packed indexed sequences: compact, self-describing blocks of integers
//! with an embedded summary tree for fast range sums, prefix searches and
//! symbol rank/select.
//!
//! A block is a plain byte buffer owned by the caller. `PackedSequence`
//! formats one with `init`, reattaches to one with `open`, and never grows
//! it; a capacity error tells the owner to relocate (see `alloc`).

pub mod alloc;
pub mod codec;
pub mod config;
pub mod error;
pub mod index;
pub mod layout;
pub mod sequence;
pub mod serialize;
pub mod walker;

pub use alloc::{insert_with_growth, AllocEvent, BlockAllocator, BlockId, MockAllocator};
pub use config::{Encoding, PackedConfig};
pub use error::{PackedError, Result};
pub use layout::{block_size, max_size_for_block};
pub use sequence::{Event, EventHandler, EventLog, PackedSequence, PackedSequenceOps};
pub use walker::{FindGeWalker, FindGtWalker, FindResult, Measure, SearchType, Walker};
