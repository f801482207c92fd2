// The boundary to the block allocator that owns sequence blocks.
//
// The core never grows a block on its own; `insert_with_growth` is the
// owner-side policy that reacts to a capacity error by relocating the
// sequence into a bigger block and retrying.

use std::fmt;

use anyhow::bail;

use crate::{
    layout::block_size,
    sequence::PackedSequence,
};

pub type BlockId = usize;

pub trait BlockAllocator {
    /// Allocates a zeroed block of `bytes` bytes.
    fn allocate(&mut self, bytes: usize) -> anyhow::Result<BlockId>;

    fn get(&self, id: BlockId) -> &[u8];

    fn get_mut(&mut self, id: BlockId) -> &mut [u8];

    /// Changes the length of a block, keeping its common prefix.
    fn resize(&mut self, id: BlockId, bytes: usize) -> anyhow::Result<()>;

    fn free(&mut self, id: BlockId);

    /// True if the block holds no bytes, which is the case after `free`.
    fn is_empty(&self, id: BlockId) -> bool;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AllocEvent {
    Allocate(BlockId, usize),
    Resize(BlockId, usize, usize),
    Free(BlockId),
}

impl AllocEvent {
    pub fn write_abbrev<W: fmt::Write>(&self, w: &mut W) -> fmt::Result {
        match self {
            AllocEvent::Allocate(id, bytes) => {
                write!(w, "Allocate({}, {})", id, bytes)?;
            }
            AllocEvent::Resize(id, from, to) => {
                write!(w, "Resize({}, {}, {})", id, from, to)?;
            }
            AllocEvent::Free(id) => {
                write!(w, "Free({})", id)?;
            }
        }
        Ok(())
    }
}

/// In-memory allocator that records every call, optionally refusing blocks
/// over `limit` bytes.
#[derive(Debug, Default)]
pub struct MockAllocator {
    blocks: Vec<Vec<u8>>,
    events: Vec<AllocEvent>,
    limit: Option<usize>,
}

impl MockAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limit(limit: usize) -> Self {
        MockAllocator {
            limit: Some(limit),
            ..Self::default()
        }
    }

    pub fn take_events(&mut self) -> Vec<AllocEvent> {
        std::mem::take(&mut self.events)
    }

    fn check_limit(&self, bytes: usize) -> anyhow::Result<()> {
        if let Some(limit) = self.limit {
            if bytes > limit {
                bail!("block of {} bytes exceeds the limit of {}", bytes, limit);
            }
        }
        Ok(())
    }
}

impl BlockAllocator for MockAllocator {
    fn allocate(&mut self, bytes: usize) -> anyhow::Result<BlockId> {
        self.check_limit(bytes)?;
        let id = self.blocks.len();
        self.blocks.push(vec![0; bytes]);
        self.events.push(AllocEvent::Allocate(id, bytes));
        Ok(id)
    }

    fn get(&self, id: BlockId) -> &[u8] {
        &self.blocks[id]
    }

    fn get_mut(&mut self, id: BlockId) -> &mut [u8] {
        &mut self.blocks[id]
    }

    fn resize(&mut self, id: BlockId, bytes: usize) -> anyhow::Result<()> {
        self.check_limit(bytes)?;
        let from = self.blocks[id].len();
        self.blocks[id].resize(bytes, 0);
        self.events.push(AllocEvent::Resize(id, from, bytes));
        Ok(())
    }

    fn free(&mut self, id: BlockId) {
        self.blocks[id] = Vec::new();
        self.events.push(AllocEvent::Free(id));
    }

    fn is_empty(&self, id: BlockId) -> bool {
        self.blocks[id].is_empty()
    }
}

// Doubling stops long before this.
const MAX_GROWTH_STEPS: usize = 32;

/// Inserts into the sequence stored in block `id`, growing the block when the
/// sequence runs out of element slots or bytes.
pub fn insert_with_growth<A: BlockAllocator>(
    alloc: &mut A,
    id: BlockId,
    at: usize,
    columns: &[&[u64]],
) -> anyhow::Result<()> {
    let (config, size, mut max_size) = {
        let mut seq = PackedSequence::open(alloc.get_mut(id))?;
        match seq.insert(at, columns) {
            Ok(()) => return Ok(()),
            Err(e) if e.is_capacity() => {
                tracing::debug!(id, error = %e, "growing block");
            }
            Err(e) => return Err(e.into()),
        }
        (*seq.config(), seq.size(), seq.max_size())
    };

    let needed = size + columns.first().map_or(0, |c| c.len());
    for _ in 0..MAX_GROWTH_STEPS {
        max_size = std::cmp::max(max_size * 2, needed);
        let mut grown = vec![0_u8; block_size(&config, max_size)];
        let src = PackedSequence::open(alloc.get(id))?;
        let mut seq = src.resize(grown.as_mut_slice(), max_size)?;
        match seq.insert(at, columns) {
            Ok(()) => {}
            Err(e) if e.is_capacity() => continue,
            Err(e) => return Err(e.into()),
        }

        alloc.resize(id, grown.len())?;
        alloc.get_mut(id).copy_from_slice(&grown);
        tracing::debug!(id, max_size, bytes = grown.len(), "grew block");
        return Ok(());
    }
    bail!("block {} could not grow enough to insert", id)
}
