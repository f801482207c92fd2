// The hierarchical summary index.
//
// Each column owns a flat array of cells laid out per `TreeLayout` (root
// first). A cell holds `lanes` u64 aggregates over its subtree: lane 0 is the
// sum of the values, and symbol sequences add one occurrence count per
// symbol. Leaf cells summarize `values_per_branch` consecutive elements;
// every other cell summarizes `branching_factor` cells of the level below.

use crate::{
    codec::{read_u32, read_u64, write_u32, write_u64, AnyCodec, Codec},
    layout::{div_up, TreeLayout, LANE_WIDTH, OFFSET_WIDTH},
};

/// Column-independent facts the index and walker code needs.
#[derive(Debug, Clone, Copy)]
pub struct Geometry<'a> {
    pub codec: &'a AnyCodec,
    pub tree: &'a TreeLayout,
    pub size: usize,
    pub values_per_branch: usize,
    pub branching_factor: usize,
    pub lanes: usize,
    /// Number of leaf windows in the block, including empty ones.
    pub windows: usize,
}

impl<'a> Geometry<'a> {
    pub fn window_bounds(&self, window: usize) -> (usize, usize) {
        let start = window * self.values_per_branch;
        let end = std::cmp::min(start + self.values_per_branch, self.size);
        (start, std::cmp::max(start, end))
    }
}

/// Read-only view over one column of a reindexed block.
#[derive(Debug, Clone, Copy)]
pub struct ColumnView<'a> {
    pub(crate) geo: Geometry<'a>,
    pub(crate) index: &'a [u8],
    pub(crate) offsets: &'a [u8],
    pub(crate) values: &'a [u8],
    pub(crate) data_size: usize,
}

impl<'a> ColumnView<'a> {
    pub fn size(&self) -> usize {
        self.geo.size
    }

    pub fn tree(&self) -> &'a TreeLayout {
        self.geo.tree
    }

    pub fn values_per_branch(&self) -> usize {
        self.geo.values_per_branch
    }

    pub fn branching_factor(&self) -> usize {
        self.geo.branching_factor
    }

    pub fn has_index(&self) -> bool {
        !self.geo.tree.is_empty()
    }

    pub fn cell(&self, cell: usize, lane: usize) -> u64 {
        read_u64(self.index, (cell * self.geo.lanes + lane) * LANE_WIDTH)
    }

    pub fn level_cell(&self, level: usize, idx: usize, lane: usize) -> u64 {
        self.cell(self.geo.tree.levels[level].start + idx, lane)
    }

    /// Stream position of the first element of `window`.
    pub fn window_offset(&self, window: usize) -> usize {
        match self.geo.codec.fixed_width() {
            Some(bits) => window * self.geo.values_per_branch * bits,
            None => read_u32(self.offsets, window * OFFSET_WIDTH) as usize,
        }
    }

    /// Stream position of element `idx`. O(1) for fixed widths, otherwise a
    /// jump through the offsets cache and a scan of less than one window.
    pub fn locate(&self, idx: usize) -> usize {
        if let Some(bits) = self.geo.codec.fixed_width() {
            return idx * bits;
        }
        if idx >= self.geo.size {
            return self.data_size;
        }
        let window = idx / self.geo.values_per_branch;
        let mut pos = self.window_offset(window);
        for _ in 0..idx % self.geo.values_per_branch {
            pos += self.geo.codec.decode(self.values, pos).1;
        }
        pos
    }

    pub fn get(&self, idx: usize) -> u64 {
        self.geo.codec.decode(self.values, self.locate(idx)).0
    }

    pub fn cursor(&self, idx: usize) -> Cursor<'a> {
        Cursor {
            codec: self.geo.codec,
            values: self.values,
            pos: self.locate(idx),
            idx,
            end: self.geo.size,
        }
    }

    pub(crate) fn decode_into(&self, start: usize, end: usize, out: &mut Vec<u64>) {
        out.clear();
        out.extend(self.cursor(start).take(end - start));
    }
}

/// Sequential decoder over a column's values.
#[derive(Debug, Clone)]
pub struct Cursor<'a> {
    codec: &'a AnyCodec,
    values: &'a [u8],
    pos: usize,
    idx: usize,
    end: usize,
}

impl<'a> Cursor<'a> {
    pub fn position(&self) -> usize {
        self.pos
    }
}

impl<'a> Iterator for Cursor<'a> {
    type Item = u64;

    fn next(&mut self) -> Option<u64> {
        if self.idx >= self.end {
            return None;
        }
        let (v, len) = self.codec.decode(self.values, self.pos);
        self.pos += len;
        self.idx += 1;
        Some(v)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let n = self.end - self.idx;
        (n, Some(n))
    }
}

fn write_cell(index: &mut [u8], lanes: usize, cell: usize, acc: &[u64]) {
    for (lane, v) in acc.iter().enumerate() {
        write_u64(index, (cell * lanes + lane) * LANE_WIDTH, *v);
    }
}

// Mutations keep every column total within u64, so on a consistent block
// lane sums never wrap.
pub(crate) fn accumulate(acc: &mut [u64], value: u64) {
    acc[0] = acc[0].wrapping_add(value);
    if acc.len() > 1 {
        acc[1 + value as usize] += 1;
    }
}

/// Rebuilds the leaf windows overlapping `[start, end)` and their ancestors,
/// strictly bottom-up. For variable-width columns the offsets cache of those
/// windows is rebuilt too, anchored at the offset of the first one, which the
/// caller must not have invalidated. Returns the stream position reached
/// after the last rebuilt window.
pub(crate) fn reindex_range(
    geo: &Geometry,
    index: &mut [u8],
    offsets: &mut [u8],
    values: &[u8],
    start: usize,
    end: usize,
) -> usize {
    if geo.windows == 0 {
        return 0;
    }
    let vpb = geo.values_per_branch;
    let first = std::cmp::min(start / vpb, geo.windows - 1);
    let last = std::cmp::min(std::cmp::max(div_up(end, vpb), first + 1), geo.windows);
    let variable = geo.codec.fixed_width().is_none();

    let mut pos = match geo.codec.fixed_width() {
        Some(bits) => first * vpb * bits,
        None if first == 0 => 0,
        None => read_u32(offsets, first * OFFSET_WIDTH) as usize,
    };

    let leaf = geo.tree.leaf_level();
    let mut acc = vec![0_u64; geo.lanes];

    for window in first..last {
        acc.fill(0);
        if variable {
            write_u32(offsets, window * OFFSET_WIDTH, pos as u32);
        }
        let (ws, we) = geo.window_bounds(window);
        for _ in ws..we {
            let (v, len) = geo.codec.decode(values, pos);
            pos += len;
            accumulate(&mut acc, v);
        }
        if let Some(leaf) = leaf {
            write_cell(index, geo.lanes, geo.tree.levels[leaf].start + window, &acc);
        }
    }

    if let Some(leaf) = leaf {
        let bf = geo.branching_factor;
        let (mut lo, mut hi) = (first, last);
        for level in (0..leaf).rev() {
            let parent = geo.tree.levels[level];
            let child = geo.tree.levels[level + 1];
            lo /= bf;
            hi = std::cmp::min(div_up(hi, bf), parent.size);
            for p in lo..hi {
                acc.fill(0);
                let children_end = std::cmp::min((p + 1) * bf, child.size);
                for c in p * bf..children_end {
                    for (lane, a) in acc.iter_mut().enumerate() {
                        let v = read_u64(index, ((child.start + c) * geo.lanes + lane) * LANE_WIDTH);
                        *a = a.wrapping_add(v);
                    }
                }
                write_cell(index, geo.lanes, parent.start + p, &acc);
            }
        }
    }

    tracing::trace!(first, last, size = geo.size, "reindexed windows");

    pos
}
