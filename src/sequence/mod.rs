use crate::{
    codec::{read_u16, read_u32, write_u16, write_u32, AnyCodec, Codec},
    config::{Encoding, PackedConfig},
    error::{PackedError, Result},
    index::{accumulate, reindex_range, ColumnView, Cursor, Geometry},
    layout::{
        self, compute_tree_layout, header_len, max_size_for_block, BlockLayout, TreeLayout,
        BRANCHING_OFFSET, COLUMNS_OFFSET, DATA_SIZES_OFFSET, ENCODING_OFFSET, FORMAT_VERSION,
        HEADER_MAGIC, INDEX_SIZE_OFFSET, MAX_SIZE_OFFSET, SIZE_OFFSET, VERSION_OFFSET, VPB_OFFSET,
    },
    walker::{
        prefix, walk_bw, walk_fw, FindGeWalker, FindGtWalker, FindResult, Measure, SearchType,
        Walker,
    },
};

mod events;
mod mutate;


pub use events::{Event, EventHandler, EventLog};

/// A packed indexed sequence living inside a caller-owned byte block.
///
/// All state is in the block itself; the handle only caches the geometry
/// derived from the header, so a block written by one handle can be reopened
/// by another with `open`.
#[derive(Debug)]
pub struct PackedSequence<B> {
    buf: B,
    config: PackedConfig,
    codec: AnyCodec,
    tree: TreeLayout,
    block: BlockLayout,
    max_size: usize,
    windows: usize,
}

pub(crate) fn column_parts_mut<'a>(
    buf: &'a mut [u8],
    block: &BlockLayout,
    column: usize,
) -> (&'a mut [u8], &'a mut [u8], &'a mut [u8]) {
    let (head, values) = buf.split_at_mut(block.values(column));
    let (head, offsets) = head.split_at_mut(block.offsets(column));
    let index = &mut head[block.index(column)..block.index(column) + block.index_len];
    (
        index,
        &mut offsets[..block.offsets_len],
        &mut values[..block.values_len],
    )
}

/// Header fields, checked for consistency with each other but not against
/// the rest of the block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Header {
    pub config: PackedConfig,
    pub size: usize,
    pub max_size: usize,
    pub index_size: usize,
    pub data_sizes: Vec<usize>,
}

pub(crate) fn read_header(bytes: &[u8]) -> Result<Header> {
    if bytes.len() < DATA_SIZES_OFFSET {
        return Err(PackedError::InvalidHeader(format!(
            "block of {} bytes is shorter than the header",
            bytes.len()
        )));
    }
    let magic = read_u32(bytes, 0);
    if magic != HEADER_MAGIC {
        return Err(PackedError::InvalidHeader(format!("bad magic {:#x}", magic)));
    }
    let version = read_u32(bytes, VERSION_OFFSET);
    if version != FORMAT_VERSION {
        return Err(PackedError::InvalidHeader(format!(
            "unsupported version {}",
            version
        )));
    }

    let encoding = Encoding::from_tag(bytes[ENCODING_OFFSET], bytes[ENCODING_OFFSET + 1])
        .ok_or_else(|| {
            PackedError::InvalidHeader(format!("unknown encoding {}", bytes[ENCODING_OFFSET]))
        })?;
    let config = PackedConfig {
        branching_factor: read_u32(bytes, BRANCHING_OFFSET) as usize,
        values_per_branch: read_u32(bytes, VPB_OFFSET) as usize,
        columns: read_u16(bytes, COLUMNS_OFFSET) as usize,
        encoding,
    };
    config
        .validate()
        .map_err(|e| PackedError::InvalidHeader(e.to_string()))?;
    if bytes.len() < header_len(config.columns) {
        return Err(PackedError::InvalidHeader(format!(
            "block of {} bytes is shorter than the header",
            bytes.len()
        )));
    }

    let size = read_u32(bytes, SIZE_OFFSET) as usize;
    let max_size = read_u32(bytes, MAX_SIZE_OFFSET) as usize;
    if size > max_size {
        return Err(PackedError::InvalidHeader(format!(
            "size {} exceeds max_size {}",
            size, max_size
        )));
    }

    let codec = config.codec();
    let budget = codec.stream_units(max_size);
    let data_sizes = (0..config.columns)
        .map(|column| read_u32(bytes, DATA_SIZES_OFFSET + 4 * column) as usize)
        .collect::<Vec<_>>();
    for (column, data_size) in data_sizes.iter().enumerate() {
        let expected = codec.fixed_width().map(|bits| size * bits);
        if *data_size > budget || expected.map_or(false, |e| e != *data_size) {
            return Err(PackedError::InvalidHeader(format!(
                "column {} data size {} is inconsistent",
                column, data_size
            )));
        }
    }

    Ok(Header {
        config,
        size,
        max_size,
        index_size: read_u32(bytes, INDEX_SIZE_OFFSET) as usize,
        data_sizes,
    })
}

impl<B> PackedSequence<B> {
    fn with_geometry(buf: B, config: PackedConfig, max_size: usize) -> Self {
        PackedSequence {
            buf,
            codec: config.codec(),
            tree: compute_tree_layout(max_size, config.values_per_branch, config.branching_factor),
            block: BlockLayout::new(&config, max_size),
            windows: layout::windows(&config, max_size),
            max_size,
            config,
        }
    }

    pub fn config(&self) -> &PackedConfig {
        &self.config
    }

    pub fn tree(&self) -> &TreeLayout {
        &self.tree
    }

    pub fn block_layout(&self) -> &BlockLayout {
        &self.block
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub fn columns(&self) -> usize {
        self.config.columns
    }

    pub fn index_size(&self) -> usize {
        self.tree.index_size
    }

    pub fn into_inner(self) -> B {
        self.buf
    }

    fn assert_column(&self, column: usize) {
        assert!(
            column < self.config.columns,
            "column {} out of range for {} columns",
            column,
            self.config.columns
        );
    }

    fn assert_measure(&self, measure: Measure) {
        if let Measure::Symbol(s) = measure {
            let alphabet = self
                .config
                .alphabet()
                .unwrap_or_else(|| panic!("symbol queries need a symbol sequence"));
            assert!(s < alphabet, "symbol {} out of range for {}", s, alphabet);
        }
    }
}

impl<B: AsRef<[u8]>> PackedSequence<B> {
    /// Reattaches to a block previously built by `init`.
    pub fn open(buf: B) -> Result<Self> {
        let len = buf.as_ref().len();
        let header = read_header(buf.as_ref())?;
        let seq = Self::with_geometry(buf, header.config, header.max_size);
        if seq.tree.index_size != header.index_size {
            return Err(PackedError::InvalidHeader(format!(
                "index size {} does not match max_size {} (expected {})",
                header.index_size, header.max_size, seq.tree.index_size
            )));
        }
        if len < seq.block.block_size() {
            return Err(PackedError::InvalidHeader(format!(
                "block of {} bytes is shorter than its layout ({} bytes)",
                len,
                seq.block.block_size()
            )));
        }

        tracing::debug!(size = header.size, max_size = header.max_size, "opened packed sequence");
        Ok(seq)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf.as_ref()[..self.block.block_size()]
    }

    pub fn size(&self) -> usize {
        read_u32(self.buf.as_ref(), SIZE_OFFSET) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Free element slots.
    pub fn capacity(&self) -> usize {
        self.max_size - self.size()
    }

    /// Stream units (bits or bytes) used by `column`.
    pub fn data_size(&self, column: usize) -> usize {
        read_u32(self.buf.as_ref(), DATA_SIZES_OFFSET + 4 * column) as usize
    }

    /// Stream units `column` may use at most.
    pub fn data_budget(&self) -> usize {
        self.codec.stream_units(self.max_size)
    }

    fn geometry(&self) -> Geometry<'_> {
        Geometry {
            codec: &self.codec,
            tree: &self.tree,
            size: self.size(),
            values_per_branch: self.config.values_per_branch,
            branching_factor: self.config.branching_factor,
            lanes: self.config.lanes(),
            windows: self.windows,
        }
    }

    pub fn column(&self, column: usize) -> ColumnView<'_> {
        self.assert_column(column);
        let bytes = self.buf.as_ref();
        let b = &self.block;
        ColumnView {
            geo: self.geometry(),
            index: &bytes[b.index(column)..b.index(column) + b.index_len],
            offsets: &bytes[b.offsets(column)..b.offsets(column) + b.offsets_len],
            values: &bytes[b.values(column)..b.values(column) + b.values_len],
            data_size: self.data_size(column),
        }
    }

    fn assert_range(&self, start: usize, end: usize) {
        assert!(
            start <= end && end <= self.size(),
            "range {}..{} out of bounds for size {}",
            start,
            end,
            self.size()
        );
    }

    pub fn get(&self, column: usize, idx: usize) -> u64 {
        assert!(idx < self.size(), "index {} out of bounds for size {}", idx, self.size());
        self.column(column).get(idx)
    }

    pub fn iter(&self, column: usize) -> Cursor<'_> {
        self.column(column).cursor(0)
    }

    pub fn values(&self, column: usize) -> Vec<u64> {
        self.iter(column).collect()
    }

    pub fn read(&self, column: usize, start: usize, end: usize) -> Vec<u64> {
        self.assert_range(start, end);
        self.column(column).cursor(start).take(end - start).collect()
    }

    pub fn scan<F>(&self, column: usize, start: usize, end: usize, mut f: F)
    where
        F: FnMut(usize, u64),
    {
        self.assert_range(start, end);
        for (i, v) in self.column(column).cursor(start).take(end - start).enumerate() {
            f(start + i, v);
        }
    }

    pub fn sum(&self, column: usize, start: usize, end: usize) -> u64 {
        self.assert_range(start, end);
        let view = self.column(column);
        prefix(&view, end, Measure::Sum) - prefix(&view, start, Measure::Sum)
    }

    pub fn prefix_sum(&self, column: usize, end: usize) -> u64 {
        self.assert_range(0, end);
        prefix(&self.column(column), end, Measure::Sum)
    }

    pub fn total(&self, column: usize) -> u64 {
        let view = self.column(column);
        if view.has_index() {
            view.cell(0, 0)
        } else {
            prefix(&view, self.size(), Measure::Sum)
        }
    }

    /// Occurrences of `symbol` in `[0, end)`.
    pub fn rank(&self, column: usize, end: usize, symbol: usize) -> u64 {
        self.rank_range(column, 0, end, symbol)
    }

    pub fn rank_range(&self, column: usize, start: usize, end: usize, symbol: usize) -> u64 {
        self.assert_range(start, end);
        let measure = Measure::Symbol(symbol);
        self.assert_measure(measure);
        let view = self.column(column);
        prefix(&view, end, measure) - prefix(&view, start, measure)
    }

    pub fn walk_forward<W: Walker>(
        &self,
        column: usize,
        start: usize,
        measure: Measure,
        walker: &mut W,
    ) -> FindResult {
        self.assert_measure(measure);
        let idx = walk_fw(&self.column(column), start, measure, walker);
        FindResult {
            idx,
            prefix: walker.prefix(),
        }
    }

    pub fn walk_backward<W: Walker>(
        &self,
        column: usize,
        start: usize,
        measure: Measure,
        walker: &mut W,
    ) -> FindResult {
        self.assert_measure(measure);
        let idx = walk_bw(&self.column(column), start, measure, walker);
        FindResult {
            idx,
            prefix: walker.prefix(),
        }
    }

    /// First `i >= start` at which the running sum of `[start, i]` reaches
    /// (`GE`) or exceeds (`GT`) `target`.
    pub fn find_forward(
        &self,
        column: usize,
        start: usize,
        search: SearchType,
        target: u64,
    ) -> FindResult {
        match search {
            SearchType::GE => {
                self.walk_forward(column, start, Measure::Sum, &mut FindGeWalker::new(target))
            }
            SearchType::GT => {
                self.walk_forward(column, start, Measure::Sum, &mut FindGtWalker::new(target))
            }
        }
    }

    /// Mirror of `find_forward`, summing `[i, start]` from `start` down.
    pub fn find_backward(
        &self,
        column: usize,
        start: usize,
        search: SearchType,
        target: u64,
    ) -> FindResult {
        match search {
            SearchType::GE => {
                self.walk_backward(column, start, Measure::Sum, &mut FindGeWalker::new(target))
            }
            SearchType::GT => {
                self.walk_backward(column, start, Measure::Sum, &mut FindGtWalker::new(target))
            }
        }
    }

    /// Position of the `rank`-th (1-based) occurrence of `symbol` at or after
    /// `start`.
    pub fn select_forward(&self, column: usize, start: usize, symbol: usize, rank: u64) -> FindResult {
        assert!(rank >= 1, "select ranks are 1-based, got 0");
        self.walk_forward(column, start, Measure::Symbol(symbol), &mut FindGeWalker::new(rank))
    }

    pub fn select_backward(&self, column: usize, start: usize, symbol: usize, rank: u64) -> FindResult {
        assert!(rank >= 1, "select ranks are 1-based, got 0");
        self.walk_backward(column, start, Measure::Symbol(symbol), &mut FindGeWalker::new(rank))
    }

    /// First index in `[start, end)` holding a non-zero value, or `end`.
    pub fn find_nonzero(&self, column: usize, start: usize, end: usize) -> usize {
        self.assert_range(start, end);
        if start == end {
            return end;
        }
        let result = self.find_forward(column, start, SearchType::GT, 0);
        std::cmp::min(result.idx as usize, end)
    }

    /// Verifies every structural invariant by recomputing the index and the
    /// offsets cache from the values. Expensive; meant for tests and
    /// debugging.
    pub fn check(&self) -> Result<()> {
        let size = self.size();
        if size > self.max_size {
            return Err(PackedError::Inconsistent(format!(
                "size {} exceeds max_size {}",
                size, self.max_size
            )));
        }
        for column in 0..self.config.columns {
            self.check_column(column)?;
        }
        Ok(())
    }

    fn check_column(&self, column: usize) -> Result<()> {
        let size = self.size();
        let view = self.column(column);
        let data_size = self.data_size(column);
        let vpb = self.config.values_per_branch;
        let lanes = self.config.lanes();
        let variable = self.config.is_variable();

        if data_size > self.data_budget() {
            return Err(PackedError::Inconsistent(format!(
                "column {} uses {} units of {}",
                column,
                data_size,
                self.data_budget()
            )));
        }
        if let Some(bits) = self.codec.fixed_width() {
            if data_size != size * bits {
                return Err(PackedError::Inconsistent(format!(
                    "column {} data size {} != {} * {}",
                    column, data_size, size, bits
                )));
            }
        }

        let mut cells = vec![vec![0_u64; lanes]; self.windows];
        let mut pos = 0;
        let mut total = 0_u64;
        for idx in 0..size {
            if variable && idx % vpb == 0 && view.window_offset(idx / vpb) != pos {
                return Err(PackedError::Inconsistent(format!(
                    "column {} window {} offset {} != {}",
                    column,
                    idx / vpb,
                    view.window_offset(idx / vpb),
                    pos
                )));
            }
            let (v, len) = self
                .codec
                .try_decode(view.values, pos, data_size)
                .ok_or_else(|| {
                    PackedError::Inconsistent(format!(
                        "column {} element {} at unit {} does not decode",
                        column, idx, pos
                    ))
                })?;
            // Every cell is bounded by the total, so this also rules out
            // overflow in the leaf and parent cells.
            total = total.checked_add(v).ok_or_else(|| {
                PackedError::Inconsistent(format!(
                    "column {} sum overflows at element {}",
                    column, idx
                ))
            })?;
            pos += len;
            accumulate(&mut cells[idx / vpb], v);
        }
        if pos != data_size {
            return Err(PackedError::Inconsistent(format!(
                "column {} decodes to {} units, header says {}",
                column, pos, data_size
            )));
        }
        if variable {
            for window in layout::div_up(size, vpb)..self.windows {
                if view.window_offset(window) != data_size {
                    return Err(PackedError::Inconsistent(format!(
                        "column {} empty window {} offset {} != {}",
                        column,
                        window,
                        view.window_offset(window),
                        data_size
                    )));
                }
            }
        }

        let leaf = match self.tree.leaf_level() {
            Some(leaf) => leaf,
            None => return Ok(()),
        };
        let bf = self.config.branching_factor;
        for level in (0..=leaf).rev() {
            for (i, cell) in cells.iter().enumerate() {
                for (lane, expected) in cell.iter().enumerate() {
                    let stored = view.level_cell(level, i, lane);
                    if stored != *expected {
                        return Err(PackedError::Inconsistent(format!(
                            "column {} level {} cell {} lane {}: stored {}, expected {}",
                            column, level, i, lane, stored, expected
                        )));
                    }
                }
            }
            if level > 0 {
                let mut parents = vec![vec![0_u64; lanes]; self.tree.levels[level - 1].size];
                for (i, cell) in cells.iter().enumerate() {
                    for (lane, v) in cell.iter().enumerate() {
                        parents[i / bf][lane] += v;
                    }
                }
                cells = parents;
            }
        }
        Ok(())
    }

    /// Reports the header, the level table, every index cell and every value.
    pub fn generate_events(&self, handler: &mut dyn EventHandler) {
        handler.event(Event::Header {
            size: self.size(),
            max_size: self.max_size,
            index_size: self.tree.index_size,
            columns: self.config.columns,
        });
        for (level, geo) in self.tree.levels.iter().enumerate() {
            handler.event(Event::Level {
                level,
                start: geo.start,
                size: geo.size,
            });
        }
        let lanes = self.config.lanes();
        for column in 0..self.config.columns {
            handler.event(Event::Column {
                column,
                data_size: self.data_size(column),
            });
            let view = self.column(column);
            for cell in 0..self.tree.index_size {
                handler.event(Event::IndexCell {
                    column,
                    cell,
                    lanes: (0..lanes).map(|lane| view.cell(cell, lane)).collect(),
                });
            }
            for (idx, value) in view.cursor(0).enumerate() {
                handler.event(Event::Value { column, idx, value });
            }
        }
    }

    pub fn dump(&self) -> String {
        let mut log = EventLog::default();
        self.generate_events(&mut log);
        log.to_string()
    }
}

impl<B: AsRef<[u8]> + AsMut<[u8]>> PackedSequence<B> {
    /// Formats an empty sequence into `buf`, taking as many elements as the
    /// buffer can hold.
    pub fn init(buf: B, config: PackedConfig) -> Result<Self> {
        config.validate()?;
        let available = buf.as_ref().len();
        let required = layout::block_size(&config, 0);
        if available < required {
            return Err(PackedError::BlockTooSmall {
                required,
                available,
            });
        }
        let max_size = max_size_for_block(&config, available);
        Self::init_exact(buf, config, max_size)
    }

    /// Formats an empty sequence of exactly `max_size` elements into the
    /// front of `buf`.
    pub fn init_exact(mut buf: B, config: PackedConfig, max_size: usize) -> Result<Self> {
        config.validate()?;
        if max_size > u32::MAX as usize {
            return Err(PackedError::InvalidConfig(format!(
                "max_size {} does not fit the header",
                max_size
            )));
        }
        let required = layout::block_size(&config, max_size);
        let available = buf.as_ref().len();
        if available < required {
            return Err(PackedError::BlockTooSmall {
                required,
                available,
            });
        }

        let bytes = &mut buf.as_mut()[..required];
        bytes.fill(0);
        let (kind, param) = config.encoding.tag();
        let tree = compute_tree_layout(max_size, config.values_per_branch, config.branching_factor);
        write_u32(bytes, 0, HEADER_MAGIC);
        write_u32(bytes, MAX_SIZE_OFFSET, max_size as u32);
        write_u32(bytes, INDEX_SIZE_OFFSET, tree.index_size as u32);
        write_u32(bytes, BRANCHING_OFFSET, config.branching_factor as u32);
        write_u32(bytes, VPB_OFFSET, config.values_per_branch as u32);
        write_u16(bytes, COLUMNS_OFFSET, config.columns as u16);
        bytes[ENCODING_OFFSET] = kind;
        bytes[ENCODING_OFFSET + 1] = param;
        write_u32(bytes, VERSION_OFFSET, FORMAT_VERSION);

        tracing::debug!(max_size, index_size = tree.index_size, "initialized packed sequence");
        Ok(Self::with_geometry(buf, config, max_size))
    }

    pub(crate) fn bytes_mut(&mut self) -> &mut [u8] {
        let end = self.block.block_size();
        &mut self.buf.as_mut()[..end]
    }

    pub(crate) fn set_size(&mut self, size: usize) {
        write_u32(self.buf.as_mut(), SIZE_OFFSET, size as u32);
    }

    pub(crate) fn set_data_size(&mut self, column: usize, units: usize) {
        write_u32(self.buf.as_mut(), DATA_SIZES_OFFSET + 4 * column, units as u32);
    }

    /// Rebuilds the whole index of every column.
    pub fn reindex(&mut self) {
        let max_size = self.max_size;
        self.reindex_range(0, max_size);
    }

    /// Rebuilds the windows touching `[start, end)` in every column, plus
    /// their ancestors.
    pub fn reindex_range(&mut self, start: usize, end: usize) {
        for column in 0..self.config.columns {
            self.reindex_column(column, start, end);
        }
    }

    pub(crate) fn reindex_column(&mut self, column: usize, start: usize, end: usize) -> usize {
        let size = self.size();
        let geo = Geometry {
            codec: &self.codec,
            tree: &self.tree,
            size,
            values_per_branch: self.config.values_per_branch,
            branching_factor: self.config.branching_factor,
            lanes: self.config.lanes(),
            windows: self.windows,
        };
        let (index, offsets, values) = column_parts_mut(self.buf.as_mut(), &self.block, column);
        reindex_range(&geo, index, offsets, values, start, end)
    }
}

/// Object-safe surface shared by every sequence flavour, for owners that
/// dispatch over them dynamically.
pub trait PackedSequenceOps {
    fn size(&self) -> usize;
    fn capacity(&self) -> usize;
    fn sum(&self, column: usize, start: usize, end: usize) -> u64;
    fn find_forward(&self, column: usize, start: usize, search: SearchType, target: u64)
        -> FindResult;
    fn find_backward(
        &self,
        column: usize,
        start: usize,
        search: SearchType,
        target: u64,
    ) -> FindResult;
    fn insert(&mut self, at: usize, columns: &[&[u64]]) -> Result<()>;
    fn remove(&mut self, start: usize, end: usize) -> Result<()>;
    fn split(&mut self, other: &mut Self, at: usize) -> Result<()>
    where
        Self: Sized;
    fn merge(&mut self, other: &mut Self) -> Result<()>
    where
        Self: Sized;
    fn check(&self) -> Result<()>;
    fn dump(&self) -> String;
    fn generate_events(&self, handler: &mut dyn EventHandler);
}

impl<B: AsRef<[u8]> + AsMut<[u8]>> PackedSequenceOps for PackedSequence<B> {
    fn size(&self) -> usize {
        PackedSequence::size(self)
    }

    fn capacity(&self) -> usize {
        PackedSequence::capacity(self)
    }

    fn sum(&self, column: usize, start: usize, end: usize) -> u64 {
        PackedSequence::sum(self, column, start, end)
    }

    fn find_forward(
        &self,
        column: usize,
        start: usize,
        search: SearchType,
        target: u64,
    ) -> FindResult {
        PackedSequence::find_forward(self, column, start, search, target)
    }

    fn find_backward(
        &self,
        column: usize,
        start: usize,
        search: SearchType,
        target: u64,
    ) -> FindResult {
        PackedSequence::find_backward(self, column, start, search, target)
    }

    fn insert(&mut self, at: usize, columns: &[&[u64]]) -> Result<()> {
        PackedSequence::insert(self, at, columns)
    }

    fn remove(&mut self, start: usize, end: usize) -> Result<()> {
        self.remove_space(start, end);
        Ok(())
    }

    fn split(&mut self, other: &mut Self, at: usize) -> Result<()> {
        self.split_to(other, at)
    }

    fn merge(&mut self, other: &mut Self) -> Result<()> {
        self.merge_with(other)
    }

    fn check(&self) -> Result<()> {
        PackedSequence::check(self)
    }

    fn dump(&self) -> String {
        PackedSequence::dump(self)
    }

    fn generate_events(&self, handler: &mut dyn EventHandler) {
        PackedSequence::generate_events(self, handler)
    }
}

#[cfg(test)]
mod test {
    use rand::Rng;

    use super::{EventLog, PackedSequence, PackedSequenceOps};
    use crate::{
        config::PackedConfig,
        error::PackedError,
        layout::block_size,
        walker::{FindGtWalker, Measure, SearchType},
    };

    fn new_seq(config: PackedConfig, max_size: usize) -> PackedSequence<Vec<u8>> {
        PackedSequence::init_exact(vec![0; block_size(&config, max_size)], config, max_size)
            .unwrap()
    }

    fn slices(columns: &[Vec<u64>]) -> Vec<&[u64]> {
        columns.iter().map(|c| c.as_slice()).collect()
    }

    fn reached(search: SearchType, sum: u64, target: u64) -> bool {
        match search {
            SearchType::GE => sum >= target,
            SearchType::GT => sum > target,
        }
    }

    fn naive_find_fw(values: &[u64], start: usize, search: SearchType, target: u64) -> (isize, u64) {
        let mut sum = 0;
        for (i, v) in values.iter().enumerate().skip(start) {
            if reached(search, sum + v, target) {
                return (i as isize, sum);
            }
            sum += v;
        }
        (values.len() as isize, sum)
    }

    fn naive_find_bw(values: &[u64], start: usize, search: SearchType, target: u64) -> (isize, u64) {
        let mut sum = 0;
        for i in (0..=start).rev() {
            if reached(search, sum + values[i], target) {
                return (i as isize, sum);
            }
            sum += values[i];
        }
        (-1, sum)
    }

    fn gen_value<R: Rng>(rng: &mut R, config: &PackedConfig) -> u64 {
        match config.alphabet() {
            Some(alphabet) => rng.gen_range(0..alphabet as u64),
            None if config.is_variable() => match rng.gen_range(0..3) {
                0 => rng.gen_range(0..1 << 30),
                1 => 0,
                _ => rng.gen_range(0..300),
            },
            None => rng.gen_range(0..1 << 12),
        }
    }

    fn verify<R: Rng>(rng: &mut R, seq: &PackedSequence<Vec<u8>>, model: &[Vec<u64>]) {
        seq.check().unwrap();
        let size = model[0].len();
        assert_eq!(seq.size(), size);
        for (column, values) in model.iter().enumerate() {
            assert_eq!(&seq.values(column), values);
            let total = values.iter().sum::<u64>();
            assert_eq!(seq.total(column), total);
            for _ in 0..20 {
                let start = rng.gen_range(0..=size);
                let end = rng.gen_range(start..=size);
                assert_eq!(
                    seq.sum(column, start, end),
                    values[start..end].iter().sum::<u64>()
                );
                let target = rng.gen_range(0..=total + 1);
                for search in [SearchType::GE, SearchType::GT] {
                    let r = seq.find_forward(column, start, search, target);
                    assert_eq!((r.idx, r.prefix), naive_find_fw(values, start, search, target));
                    if size > 0 {
                        let from = rng.gen_range(0..size);
                        let r = seq.find_backward(column, from, search, target);
                        assert_eq!((r.idx, r.prefix), naive_find_bw(values, from, search, target));
                    }
                }
            }
            if let Some(alphabet) = seq.config().alphabet() {
                for symbol in 0..alphabet {
                    let hits = values
                        .iter()
                        .map(|v| (*v == symbol as u64) as u64)
                        .collect::<Vec<_>>();
                    let end = rng.gen_range(0..=size);
                    assert_eq!(seq.rank(column, end, symbol), hits[..end].iter().sum::<u64>());
                    let start = rng.gen_range(0..=size);
                    let rank = rng.gen_range(1..=4);
                    let r = seq.select_forward(column, start, symbol, rank);
                    assert_eq!((r.idx, r.prefix), naive_find_fw(&hits, start, SearchType::GE, rank));
                    if size > 0 {
                        let from = rng.gen_range(0..size);
                        let r = seq.select_backward(column, from, symbol, rank);
                        assert_eq!((r.idx, r.prefix), naive_find_bw(&hits, from, SearchType::GE, rank));
                    }
                }
            }
        }
    }

    #[test]
    fn test_against_model() {
        let mut rng = rand::thread_rng();
        for config in [
            PackedConfig::fixed(12).with_geometry(2, 4).with_columns(2),
            PackedConfig::fixed(12).with_geometry(3, 2),
            PackedConfig::varint(3).with_geometry(2, 4),
            PackedConfig::varint(2).with_geometry(4, 8).with_columns(3),
            PackedConfig::symbols(2).with_geometry(2, 4),
            PackedConfig::symbols(1).with_geometry(5, 3),
        ] {
            let max_size = 150;
            let mut seq = new_seq(config, max_size);
            let mut spare = new_seq(config, max_size);
            let mut model = vec![Vec::new(); config.columns];

            for _ in 0..120 {
                let size = model[0].len();
                match rng.gen_range(0..6) {
                    0 | 1 => {
                        let at = rng.gen_range(0..=size);
                        let count = rng.gen_range(0..20);
                        let columns = (0..config.columns)
                            .map(|_| (0..count).map(|_| gen_value(&mut rng, &config)).collect())
                            .collect::<Vec<Vec<u64>>>();
                        match seq.insert(at, &slices(&columns)) {
                            Ok(()) => {
                                for (m, c) in model.iter_mut().zip(columns) {
                                    m.splice(at..at, c);
                                }
                            }
                            Err(e) => assert!(e.is_capacity(), "{}", e),
                        }
                    }
                    2 => {
                        let start = rng.gen_range(0..=size);
                        let end = rng.gen_range(start..=std::cmp::min(size, start + 30));
                        seq.remove_space(start, end);
                        for m in model.iter_mut() {
                            m.drain(start..end);
                        }
                    }
                    3 if size > 0 => {
                        let column = rng.gen_range(0..config.columns);
                        let idx = rng.gen_range(0..size);
                        let value = gen_value(&mut rng, &config);
                        match seq.set(column, idx, value) {
                            Ok(()) => model[column][idx] = value,
                            Err(e) => assert!(e.is_capacity(), "{}", e),
                        }
                    }
                    4 => {
                        let at = rng.gen_range(0..=size);
                        seq.split_to(&mut spare, at).unwrap();
                        assert_eq!(spare.size(), size - at);
                        spare.merge_with(&mut seq).unwrap();
                        assert!(spare.is_empty());
                    }
                    5 => {
                        let grown = rng.gen_range(size..=max_size);
                        let relocated = seq
                            .resize(vec![0; block_size(&config, grown)], grown)
                            .unwrap();
                        verify(&mut rng, &relocated, &model);
                        seq = relocated
                            .resize(vec![0; block_size(&config, max_size)], max_size)
                            .unwrap();
                    }
                    _ => {}
                }
                verify(&mut rng, &seq, &model);
            }
        }
    }

    #[test]
    fn test_four_column_scenario() -> anyhow::Result<()> {
        let config = PackedConfig::fixed(16).with_columns(4);
        let mut seq = new_seq(config, 10_000);
        assert_eq!(seq.max_size(), 10_000);
        let mut rng = rand::thread_rng();
        let columns = (0..4)
            .map(|_| {
                (0..10_000)
                    .map(|_| rng.gen_range(1..1000))
                    .collect::<Vec<u64>>()
            })
            .collect::<Vec<_>>();
        seq.insert(0, &slices(&columns))?;
        seq.check()?;

        for (column, values) in columns.iter().enumerate() {
            assert_eq!(seq.sum(column, 0, 10_000), values.iter().sum::<u64>());
            let target = seq.sum(column, 0, 5000);
            assert_eq!(target, values[..5000].iter().sum::<u64>());

            // Every value is positive, so the prefix first reaches the
            // target on element 4999 and first exceeds it on 5000.
            let ge = seq.find_forward(column, 0, SearchType::GE, target);
            assert_eq!(ge.idx, 4999);
            assert_eq!(ge.prefix, target - values[4999]);
            let gt = seq.find_forward(column, 0, SearchType::GT, target);
            assert_eq!(gt.idx, 5000);
            assert_eq!(gt.prefix, target);
        }
        Ok(())
    }

    #[test]
    fn test_find_inverse_of_sum() {
        let config = PackedConfig::fixed(4).with_geometry(4, 8);
        let mut seq = new_seq(config, 500);
        let mut rng = rand::thread_rng();
        // Zeros included on purpose.
        let values = (0..500).map(|_| rng.gen_range(0..4)).collect::<Vec<u64>>();
        seq.insert(0, &[&values]).unwrap();

        let total = seq.total(0);
        for target in 1..=total {
            let ge = seq.find_forward(0, 0, SearchType::GE, target);
            let i = ge.idx as usize;
            assert!(seq.sum(0, 0, i) < target && target <= seq.sum(0, 0, i + 1));
            assert_eq!(ge.prefix, seq.sum(0, 0, i));

            let gt = seq.find_forward(0, 0, SearchType::GT, target - 1);
            let i = gt.idx as usize;
            assert!(seq.sum(0, 0, i) <= target - 1 && target - 1 < seq.sum(0, 0, i + 1));
        }
        let past = seq.find_forward(0, 0, SearchType::GE, total + 1);
        assert_eq!(past.idx, 500);
        assert_eq!(past.prefix, total);
    }

    #[test]
    fn test_insert_remove_inverse() {
        let mut rng = rand::thread_rng();
        for config in [
            PackedConfig::fixed(9).with_geometry(2, 4).with_columns(2),
            PackedConfig::varint(2).with_geometry(2, 4).with_columns(2),
        ] {
            let mut seq = new_seq(config, 200);
            let columns = (0..2)
                .map(|_| (0..120).map(|_| rng.gen_range(0..500)).collect::<Vec<u64>>())
                .collect::<Vec<_>>();
            seq.insert(0, &slices(&columns)).unwrap();
            let before = seq.dump();

            for _ in 0..20 {
                let at = rng.gen_range(0..=120);
                let count = rng.gen_range(0..=80);
                seq.insert_space(at, count).unwrap();
                for idx in at..at + count {
                    seq.set(1, idx, rng.gen_range(0..500)).unwrap();
                }
                seq.remove_space(at, at + count);
                assert_eq!(seq.dump(), before);
            }
        }
    }

    #[test]
    fn test_split_merge_inverse() {
        let config = PackedConfig::varint(2).with_geometry(2, 4);
        let mut rng = rand::thread_rng();
        let values = (0..60).map(|_| rng.gen_range(0..1000)).collect::<Vec<u64>>();
        let mut seq = new_seq(config, 64);
        seq.insert(0, &[&values]).unwrap();

        for k in 0..=60 {
            let mut copy = PackedSequence::open(seq.as_bytes().to_vec()).unwrap();
            let mut other = new_seq(config, 64);
            copy.split_to(&mut other, k).unwrap();
            assert_eq!(copy.values(0), values[..k].to_vec());
            assert_eq!(other.values(0), values[k..].to_vec());
            copy.check().unwrap();
            other.check().unwrap();

            other.merge_with(&mut copy).unwrap();
            assert_eq!(copy.values(0), values);
            assert!(other.is_empty());
            copy.check().unwrap();
        }
    }

    #[test]
    fn test_split_needs_room() {
        let config = PackedConfig::fixed(8).with_geometry(2, 4);
        let mut seq = new_seq(config, 16);
        seq.insert(0, &[&[1; 10]]).unwrap();
        let mut other = new_seq(config, 16);
        other.insert(0, &[&[2; 10]]).unwrap();
        let (a, b) = (seq.as_bytes().to_vec(), other.as_bytes().to_vec());

        assert!(matches!(
            seq.split_to(&mut other, 2),
            Err(PackedError::CapacityExceeded { .. })
        ));
        assert_eq!(seq.as_bytes(), a.as_slice());
        assert_eq!(other.as_bytes(), b.as_slice());
        assert!(seq.merge_with(&mut other).is_err());
        assert_eq!(seq.as_bytes(), a.as_slice());
    }

    #[test]
    fn test_capacity_boundary() {
        for config in [
            PackedConfig::fixed(7).with_geometry(2, 4).with_columns(3),
            PackedConfig::varint(4).with_geometry(3, 4),
        ] {
            let mut seq = new_seq(config, 50);
            seq.insert_space(0, 17).unwrap();
            let room = seq.max_size() - seq.size();

            let before = seq.as_bytes().to_vec();
            let too_many = vec![vec![5_u64; room + 1]; config.columns];
            assert_eq!(
                seq.insert(3, &slices(&too_many)),
                Err(PackedError::CapacityExceeded {
                    requested: 51,
                    available: 50
                })
            );
            assert_eq!(seq.as_bytes(), before.as_slice());

            let exact = vec![vec![5_u64; room]; config.columns];
            seq.insert(3, &slices(&exact)).unwrap();
            assert_eq!(seq.size(), 50);
            assert_eq!(seq.capacity(), 0);
            seq.check().unwrap();
        }
    }

    #[test]
    fn test_byte_budget_is_atomic() {
        let config = PackedConfig::varint(1).with_geometry(2, 4).with_columns(2);
        let mut seq = new_seq(config, 20);
        seq.insert(0, &[&[1; 10], &[2; 10]]).unwrap();
        seq.insert(5, &[&[1, 1, 1], &[1000, 1000, 1000]]).unwrap();
        assert_eq!(seq.data_size(1), 16);
        let before = seq.as_bytes().to_vec();

        // Column 0 has room for three more bytes, column 1 does not.
        assert_eq!(
            seq.insert(0, &[&[1, 1, 1], &[1000, 1000, 1000]]),
            Err(PackedError::ByteBudgetExceeded {
                column: 1,
                requested: 22,
                available: 20
            })
        );
        assert_eq!(seq.as_bytes(), before.as_slice());
        seq.check().unwrap();
    }

    #[test]
    fn test_set_over_byte_budget() {
        let config = PackedConfig::varint(1).with_geometry(2, 4);
        let mut seq = new_seq(config, 8);
        seq.insert(0, &[&[1, 2, 3, 4, 5, 6, 7]]).unwrap();
        seq.set(0, 3, 200).unwrap();
        assert_eq!(seq.data_size(0), 8);
        let before = seq.as_bytes().to_vec();
        assert_eq!(
            seq.set(0, 0, 300),
            Err(PackedError::ByteBudgetExceeded {
                column: 0,
                requested: 9,
                available: 8
            })
        );
        assert_eq!(seq.as_bytes(), before.as_slice());
        seq.set(0, 3, 4).unwrap();
        assert_eq!(seq.values(0), vec![1, 2, 3, 4, 5, 6, 7]);
        seq.check().unwrap();
    }

    #[test]
    fn test_sum_overflow_is_atomic() {
        for (config, big) in [
            (PackedConfig::fixed(64).with_geometry(2, 4), u64::MAX),
            (PackedConfig::varint(10).with_geometry(2, 4), 1 << 63),
        ] {
            let mut seq = new_seq(config, 16);
            seq.insert(0, &[&[3, 4]]).unwrap();
            let before = seq.as_bytes().to_vec();
            assert_eq!(
                seq.insert(1, &[&[big, big]]),
                Err(PackedError::SumOverflow { column: 0 })
            );
            assert!(!PackedError::SumOverflow { column: 0 }.is_capacity());
            assert_eq!(seq.as_bytes(), before.as_slice());
            seq.check().unwrap();

            // Exactly u64::MAX in total still fits.
            let rest = u64::MAX - 7;
            seq.insert(2, &[&[rest]]).unwrap();
            seq.check().unwrap();
            assert_eq!(seq.total(0), u64::MAX);
            assert_eq!(seq.sum(0, 1, 3), u64::MAX - 3);
            let found = seq.find_forward(0, 0, SearchType::GE, u64::MAX);
            assert_eq!((found.idx, found.prefix), (2, 7));

            let before = seq.as_bytes().to_vec();
            assert_eq!(seq.insert(3, &[&[1]]), Err(PackedError::SumOverflow { column: 0 }));
            assert_eq!(seq.set(0, 0, 4), Err(PackedError::SumOverflow { column: 0 }));
            assert_eq!(seq.as_bytes(), before.as_slice());
            seq.set(0, 0, 2).unwrap();
            assert_eq!(seq.values(0), vec![2, 4, rest]);
            seq.check().unwrap();
        }
    }

    #[test]
    #[should_panic(expected = "1-based")]
    fn test_select_rank_zero() {
        let mut seq = new_seq(PackedConfig::symbols(2).with_geometry(2, 4), 16);
        seq.insert(0, &[&[1, 2, 3]]).unwrap();
        seq.select_forward(0, 0, 3, 0);
    }

    #[test]
    #[should_panic(expected = "overflows")]
    fn test_add_overflow() {
        let mut seq = new_seq(PackedConfig::varint(10), 16);
        seq.insert(0, &[&[u64::MAX - 1]]).unwrap();
        seq.add(0, 0, 1).unwrap();
        assert_eq!(seq.get(0, 0), u64::MAX);
        let _ = seq.add(0, 0, 1);
    }

    #[test]
    fn test_reindex_idempotent() {
        let mut rng = rand::thread_rng();
        for config in [
            PackedConfig::fixed(11).with_geometry(3, 5).with_columns(2),
            PackedConfig::varint(3).with_geometry(2, 4),
            PackedConfig::symbols(3).with_geometry(2, 4),
        ] {
            let mut seq = new_seq(config, 300);
            let columns = (0..config.columns)
                .map(|_| (0..257).map(|_| gen_value(&mut rng, &config)).collect())
                .collect::<Vec<Vec<u64>>>();
            seq.insert(0, &slices(&columns)).unwrap();
            let before = seq.as_bytes().to_vec();
            seq.reindex();
            assert_eq!(seq.as_bytes(), before.as_slice());
            seq.reindex();
            assert_eq!(seq.as_bytes(), before.as_slice());
        }
    }

    #[test]
    fn test_open() {
        let config = PackedConfig::fixed(10).with_geometry(4, 4).with_columns(2);
        let mut seq = new_seq(config, 100);
        seq.insert(0, &[&[3; 70], &[9; 70]]).unwrap();
        let bytes = seq.into_inner();

        let reopened = PackedSequence::open(bytes.as_slice()).unwrap();
        assert_eq!(reopened.size(), 70);
        assert_eq!(reopened.sum(1, 10, 20), 90);
        assert_eq!(reopened.find_forward(0, 0, SearchType::GE, 30).idx, 9);
        reopened.check().unwrap();

        let mut bad = bytes.clone();
        bad[0] ^= 1;
        assert!(matches!(
            PackedSequence::open(bad.as_slice()),
            Err(PackedError::InvalidHeader(_))
        ));
        assert!(matches!(
            PackedSequence::open(&bytes[..bytes.len() - 1]),
            Err(PackedError::InvalidHeader(_))
        ));
        assert!(matches!(
            PackedSequence::open(&bytes[..8]),
            Err(PackedError::InvalidHeader(_))
        ));
    }

    #[test]
    fn test_init() {
        let config = PackedConfig::fixed(8);
        assert!(matches!(
            PackedSequence::init(vec![0; 10], config),
            Err(PackedError::BlockTooSmall { .. })
        ));
        assert!(matches!(
            PackedSequence::init(vec![0; 1000], PackedConfig::fixed(0)),
            Err(PackedError::InvalidConfig(_))
        ));
        let seq = PackedSequence::init(vec![0; block_size(&config, 100)], config).unwrap();
        assert!(seq.max_size() >= 100);
        assert!(seq.is_empty());
        seq.check().unwrap();
    }

    #[test]
    fn test_walk_and_scan() {
        let config = PackedConfig::fixed(8).with_geometry(2, 4);
        let mut seq = new_seq(config, 64);
        let values = (0..50).map(|i| i % 7).collect::<Vec<u64>>();
        seq.insert(0, &[&values]).unwrap();

        let mut walker = FindGtWalker::new(40);
        let walked = seq.walk_forward(0, 5, Measure::Sum, &mut walker);
        assert_eq!(walked, seq.find_forward(0, 5, SearchType::GT, 40));

        let mut seen = Vec::new();
        seq.scan(0, 10, 15, |i, v| seen.push((i, v)));
        assert_eq!(seen, vec![(10, 3), (11, 4), (12, 5), (13, 6), (14, 0)]);
        assert_eq!(seq.read(0, 48, 50), vec![6, 0]);
        assert_eq!(seq.iter(0).count(), 50);
        assert_eq!(seq.get(0, 20), 6);
        assert_eq!(seq.find_nonzero(0, 14, 50), 15);
        assert_eq!(seq.find_nonzero(0, 14, 15), 15);
        assert_eq!(seq.prefix_sum(0, 7), 21);
    }

    #[test]
    fn test_dispatch() {
        let mut seqs: Vec<Box<dyn PackedSequenceOps>> = vec![
            Box::new(new_seq(PackedConfig::fixed(6).with_geometry(2, 4), 40)),
            Box::new(new_seq(PackedConfig::varint(2).with_geometry(2, 4), 40)),
        ];
        for seq in seqs.iter_mut() {
            seq.insert(0, &[&[5; 30]]).unwrap();
            seq.remove(0, 10).unwrap();
            assert_eq!(seq.size(), 20);
            assert_eq!(seq.capacity(), 20);
            assert_eq!(seq.sum(0, 0, 20), 100);
            assert_eq!(seq.find_forward(0, 0, SearchType::GE, 50).idx, 9);
            assert_eq!(seq.find_backward(0, 19, SearchType::GT, 50).idx, 9);
            seq.check().unwrap();

            let mut log = EventLog::default();
            seq.generate_events(&mut log);
            assert_eq!(log.to_string(), seq.dump());
        }
    }
}
