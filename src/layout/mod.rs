// Layout calculator.
//
// A block is laid out as
//
//   [header][index col 0]..[index col N-1][offsets col 0]..[offsets col N-1]
//   [values col 0]..[values col N-1]
//
// with every segment padded to 8 bytes. The index of a column is a flat
// array of cells, one level after another, root first. Everything here is a
// pure function of the config and max_size, and the reindex and walker code
// reads level geometry only through `TreeLayout`.

use serde::{Deserialize, Serialize};

use crate::{codec::Codec, config::PackedConfig};

pub const HEADER_MAGIC: u32 = 0x5153_4b50;
pub const FORMAT_VERSION: u32 = 1;

pub(crate) const SIZE_OFFSET: usize = 4;
pub(crate) const MAX_SIZE_OFFSET: usize = 8;
pub(crate) const INDEX_SIZE_OFFSET: usize = 12;
pub(crate) const BRANCHING_OFFSET: usize = 16;
pub(crate) const VPB_OFFSET: usize = 20;
pub(crate) const COLUMNS_OFFSET: usize = 24;
pub(crate) const ENCODING_OFFSET: usize = 26;
pub(crate) const VERSION_OFFSET: usize = 28;
pub(crate) const DATA_SIZES_OFFSET: usize = 32;

pub(crate) const OFFSET_WIDTH: usize = 4;
pub(crate) const LANE_WIDTH: usize = 8;

pub(crate) fn div_up(value: usize, divisor: usize) -> usize {
    (value + divisor - 1) / divisor
}

pub(crate) fn align8(bytes: usize) -> usize {
    div_up(bytes, 8) * 8
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LevelGeometry {
    /// First cell of the level within the index segment.
    pub start: usize,
    pub size: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeLayout {
    /// Root first; the last level is the leaf level, one cell per window of
    /// `values_per_branch` elements.
    pub levels: Vec<LevelGeometry>,
    pub index_size: usize,
}

impl TreeLayout {
    pub fn is_empty(&self) -> bool {
        self.levels.is_empty()
    }

    pub fn leaf_level(&self) -> Option<usize> {
        self.levels.len().checked_sub(1)
    }
}

/// The one index geometry formula. Blocks of at most one window get no
/// index at all.
pub fn compute_tree_layout(
    max_size: usize,
    values_per_branch: usize,
    branching_factor: usize,
) -> TreeLayout {
    if max_size <= values_per_branch {
        return TreeLayout::default();
    }

    let mut level = div_up(max_size, values_per_branch);
    let mut sizes = vec![level];
    while level > 1 {
        level = div_up(level, branching_factor);
        sizes.push(level);
    }
    sizes.reverse();

    let mut levels = Vec::with_capacity(sizes.len());
    let mut start = 0;
    for size in sizes {
        levels.push(LevelGeometry { start, size });
        start += size;
    }

    TreeLayout {
        levels,
        index_size: start,
    }
}

pub fn index_size(config: &PackedConfig, max_size: usize) -> usize {
    compute_tree_layout(max_size, config.values_per_branch, config.branching_factor).index_size
}

/// Number of `values_per_branch` windows a column of `max_size` elements
/// spans, which is also the number of offsets-cache entries.
pub fn windows(config: &PackedConfig, max_size: usize) -> usize {
    div_up(max_size, config.values_per_branch)
}

/// Byte offsets of every segment of a block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockLayout {
    pub columns: usize,
    pub header_len: usize,
    pub index_len: usize,
    pub offsets_len: usize,
    pub values_len: usize,
}

impl BlockLayout {
    pub fn new(config: &PackedConfig, max_size: usize) -> Self {
        let codec = config.codec();
        let index_len = align8(index_size(config, max_size) * config.lanes() * LANE_WIDTH);
        let offsets_len = if config.is_variable() {
            align8(windows(config, max_size) * OFFSET_WIDTH)
        } else {
            0
        };
        BlockLayout {
            columns: config.columns,
            header_len: header_len(config.columns),
            index_len,
            offsets_len,
            values_len: align8(codec.segment_bytes(max_size)),
        }
    }

    pub fn index(&self, column: usize) -> usize {
        self.header_len + column * self.index_len
    }

    pub fn offsets(&self, column: usize) -> usize {
        self.header_len + self.columns * self.index_len + column * self.offsets_len
    }

    pub fn values(&self, column: usize) -> usize {
        self.header_len
            + self.columns * (self.index_len + self.offsets_len)
            + column * self.values_len
    }

    pub fn block_size(&self) -> usize {
        self.header_len + self.columns * (self.index_len + self.offsets_len + self.values_len)
    }
}

pub fn header_len(columns: usize) -> usize {
    align8(DATA_SIZES_OFFSET + columns * 4)
}

pub fn block_size(config: &PackedConfig, max_size: usize) -> usize {
    BlockLayout::new(config, max_size).block_size()
}

/// Largest `max_size` whose block fits in `bytes`. `block_size` is monotonic
/// in `max_size`, so a binary search over it is exact.
pub fn max_size_for_block(config: &PackedConfig, bytes: usize) -> usize {
    if block_size(config, 0) > bytes {
        return 0;
    }
    // Every element takes at least one bit.
    let mut lo = 0;
    let mut hi = bytes.saturating_mul(8).min(u32::MAX as usize);
    while lo < hi {
        let mid = lo + (hi - lo + 1) / 2;
        if block_size(config, mid) <= bytes {
            lo = mid;
        } else {
            hi = mid - 1;
        }
    }
    lo
}
