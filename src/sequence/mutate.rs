// Mutation engine. Every operation validates its preconditions and capacity
// against all columns before the first byte changes, so a failed mutation
// leaves the block exactly as it was.

use crate::{
    codec::{read_bits, write_bits, AnyCodec, Codec},
    error::{PackedError, Result},
    layout,
};

use super::{column_parts_mut, PackedSequence};

// Moves the units in `[from, end)` so that they start at `to`.
fn move_units(codec: &AnyCodec, data: &mut [u8], from: usize, end: usize, to: usize) {
    if from == to || from == end {
        return;
    }
    match codec.fixed_width() {
        None => data.copy_within(from..end, to),
        Some(bits) if bits % 8 == 0 => data.copy_within(from / 8..end / 8, to / 8),
        Some(bits) => {
            let n = (end - from) / bits;
            if to > from {
                for i in (0..n).rev() {
                    let v = read_bits(data, from + i * bits, bits);
                    write_bits(data, to + i * bits, bits, v);
                }
            } else {
                for i in 0..n {
                    let v = read_bits(data, from + i * bits, bits);
                    write_bits(data, to + i * bits, bits, v);
                }
            }
        }
    }
}

// Zeroes the units in `[from, end)`.
fn clear_units(codec: &AnyCodec, data: &mut [u8], from: usize, end: usize) {
    match codec.fixed_width() {
        None => data[from..end].fill(0),
        Some(bits) => {
            let mut pos = from;
            while pos < end {
                write_bits(data, pos, bits, 0);
                pos += bits;
            }
        }
    }
}

impl<B: AsRef<[u8]>> PackedSequence<B> {
    /// Copies this sequence into `buf`, which becomes a block of exactly
    /// `new_max_size` elements. `self` is left untouched.
    pub fn resize<C>(&self, buf: C, new_max_size: usize) -> Result<PackedSequence<C>>
    where
        C: AsRef<[u8]> + AsMut<[u8]>,
    {
        let size = self.size();
        if new_max_size < size {
            tracing::debug!(size, new_max_size, "resize below size");
            return Err(PackedError::CapacityExceeded {
                requested: size,
                available: new_max_size,
            });
        }
        let budget = self.codec.stream_units(new_max_size);
        for column in 0..self.config.columns {
            let data_size = self.data_size(column);
            if data_size > budget {
                tracing::debug!(column, data_size, budget, "resize below byte budget");
                return Err(PackedError::ByteBudgetExceeded {
                    column,
                    requested: data_size,
                    available: budget,
                });
            }
        }

        let mut target = PackedSequence::init_exact(buf, self.config, new_max_size)?;
        for column in 0..self.config.columns {
            let data_size = self.data_size(column);
            let bytes = match self.codec.fixed_width() {
                Some(_) => layout::div_up(data_size, 8),
                None => data_size,
            };
            let src = self.column(column).values;
            let (_, _, dst) = column_parts_mut(target.buf.as_mut(), &target.block, column);
            dst[..bytes].copy_from_slice(&src[..bytes]);
            target.set_data_size(column, data_size);
        }
        target.set_size(size);
        target.reindex();

        tracing::debug!(size, from = self.max_size, to = new_max_size, "resized packed sequence");
        Ok(target)
    }
}

impl<B: AsRef<[u8]> + AsMut<[u8]>> PackedSequence<B> {
    /// Inserts `columns[c][..]` into column `c` at `at`, for every column.
    /// Every slice must have the same length.
    pub fn insert(&mut self, at: usize, columns: &[&[u64]]) -> Result<()> {
        assert_eq!(
            columns.len(),
            self.config.columns,
            "insert needs one slice per column"
        );
        let count = columns[0].len();
        assert!(
            columns.iter().all(|c| c.len() == count),
            "insert needs the same number of values in every column"
        );
        let size = self.size();
        assert!(at <= size, "insert at {} out of bounds for size {}", at, size);
        let max_value = self.codec.max_value();
        assert!(
            columns.iter().all(|c| c.iter().all(|v| *v <= max_value)),
            "value does not fit in {:?}",
            self.config.encoding
        );
        if count == 0 {
            return Ok(());
        }

        if size + count > self.max_size {
            tracing::debug!(size, count, max_size = self.max_size, "insert over capacity");
            return Err(PackedError::CapacityExceeded {
                requested: size + count,
                available: self.max_size,
            });
        }

        let budget = self.data_budget();
        let mut plan = Vec::with_capacity(columns.len());
        for (column, values) in columns.iter().enumerate() {
            let pos = self.column(column).locate(at);
            let needed: usize = values.iter().map(|v| self.codec.length(*v)).sum();
            let data_size = self.data_size(column);
            if data_size + needed > budget {
                tracing::debug!(column, data_size, needed, budget, "insert over byte budget");
                return Err(PackedError::ByteBudgetExceeded {
                    column,
                    requested: data_size + needed,
                    available: budget,
                });
            }
            let total = self.total(column);
            if values
                .iter()
                .try_fold(total, |acc, v| acc.checked_add(*v))
                .is_none()
            {
                tracing::debug!(column, total, "insert overflows column sum");
                return Err(PackedError::SumOverflow { column });
            }
            plan.push((pos, needed, data_size));
        }

        for (column, (values, (pos, needed, data_size))) in columns.iter().zip(plan).enumerate() {
            let (_, _, data) = column_parts_mut(self.buf.as_mut(), &self.block, column);
            move_units(&self.codec, data, pos, data_size, pos + needed);
            let mut p = pos;
            for v in values.iter() {
                p += self.codec.encode(data, p, *v);
            }
            self.set_data_size(column, data_size + needed);
        }
        self.set_size(size + count);
        self.reindex();

        tracing::debug!(at, count, size = size + count, "inserted");
        Ok(())
    }

    /// Appends one value per column.
    pub fn push(&mut self, row: &[u64]) -> Result<()> {
        let columns = row.iter().map(std::slice::from_ref).collect::<Vec<_>>();
        let size = self.size();
        self.insert(size, &columns)
    }

    /// Inserts `count` zeros into every column at `at`.
    pub fn insert_space(&mut self, at: usize, count: usize) -> Result<()> {
        let zeros = vec![0_u64; count];
        let columns = vec![zeros.as_slice(); self.config.columns];
        self.insert(at, &columns)
    }

    /// Removes `[start, end)` from every column.
    pub fn remove_space(&mut self, start: usize, end: usize) {
        let size = self.size();
        assert!(
            start <= end && end <= size,
            "remove {}..{} out of bounds for size {}",
            start,
            end,
            size
        );
        if start == end {
            return;
        }

        for column in 0..self.config.columns {
            let view = self.column(column);
            let (from, to) = (view.locate(start), view.locate(end));
            let data_size = self.data_size(column);
            let (_, _, data) = column_parts_mut(self.buf.as_mut(), &self.block, column);
            move_units(&self.codec, data, to, data_size, from);
            let new_size = data_size - (to - from);
            clear_units(&self.codec, data, new_size, data_size);
            self.set_data_size(column, new_size);
        }
        self.set_size(size - (end - start));
        self.reindex();

        tracing::debug!(start, end, size = size - (end - start), "removed");
    }

    pub fn set(&mut self, column: usize, idx: usize, value: u64) -> Result<()> {
        let size = self.size();
        assert!(idx < size, "index {} out of bounds for size {}", idx, size);
        assert!(
            value <= self.codec.max_value(),
            "value {} does not fit in {:?}",
            value,
            self.config.encoding
        );

        let view = self.column(column);
        let pos = view.locate(idx);
        let (old, old_len) = self.codec.decode(view.values, pos);
        let new_len = self.codec.length(value);
        let data_size = self.data_size(column);

        let total = self.total(column) - old;
        if total.checked_add(value).is_none() {
            tracing::debug!(column, idx, total, "set overflows column sum");
            return Err(PackedError::SumOverflow { column });
        }

        if new_len == old_len {
            let (_, _, data) = column_parts_mut(self.buf.as_mut(), &self.block, column);
            self.codec.encode(data, pos, value);
            self.reindex_column(column, idx, idx + 1);
            return Ok(());
        }

        let new_data_size = data_size + new_len - old_len;
        if new_data_size > self.data_budget() {
            tracing::debug!(column, idx, new_data_size, "set over byte budget");
            return Err(PackedError::ByteBudgetExceeded {
                column,
                requested: new_data_size,
                available: self.data_budget(),
            });
        }
        let (_, _, data) = column_parts_mut(self.buf.as_mut(), &self.block, column);
        move_units(&self.codec, data, pos + old_len, data_size, pos + new_len);
        if new_data_size < data_size {
            clear_units(&self.codec, data, new_data_size, data_size);
        }
        self.codec.encode(data, pos, value);
        self.set_data_size(column, new_data_size);
        // Every later window moved, so its offset entry is stale.
        let max_size = self.max_size;
        self.reindex_column(column, idx, max_size);
        Ok(())
    }

    pub fn add(&mut self, column: usize, idx: usize, delta: u64) -> Result<()> {
        let current = self.get(column, idx);
        let value = current.checked_add(delta).unwrap_or_else(|| {
            panic!("add of {} to {} at index {} overflows", delta, current, idx)
        });
        self.set(column, idx, value)
    }

    /// Moves `[at, size)` to the front of `other`.
    pub fn split_to<C>(&mut self, other: &mut PackedSequence<C>, at: usize) -> Result<()>
    where
        C: AsRef<[u8]> + AsMut<[u8]>,
    {
        assert_eq!(self.config, other.config, "split between different configs");
        let size = self.size();
        assert!(at <= size, "split at {} out of bounds for size {}", at, size);
        if at == size {
            return Ok(());
        }

        let moved = (0..self.config.columns)
            .map(|column| self.read(column, at, size))
            .collect::<Vec<_>>();
        let slices = moved.iter().map(|c| c.as_slice()).collect::<Vec<_>>();
        other.insert(0, &slices)?;
        self.remove_space(at, size);

        tracing::debug!(at, moved = size - at, "split");
        Ok(())
    }

    /// Appends every element of `self` to `other` and empties `self`.
    pub fn merge_with<C>(&mut self, other: &mut PackedSequence<C>) -> Result<()>
    where
        C: AsRef<[u8]> + AsMut<[u8]>,
    {
        assert_eq!(self.config, other.config, "merge between different configs");
        let size = self.size();
        if size == 0 {
            return Ok(());
        }

        let moved = (0..self.config.columns)
            .map(|column| self.values(column))
            .collect::<Vec<_>>();
        let slices = moved.iter().map(|c| c.as_slice()).collect::<Vec<_>>();
        let at = other.size();
        other.insert(at, &slices)?;
        self.clear();

        tracing::debug!(moved = size, "merged");
        Ok(())
    }

    /// Empties the sequence, zeroing every segment.
    pub fn clear(&mut self) {
        let header = self.block.header_len;
        let end = self.block.block_size();
        self.buf.as_mut()[header..end].fill(0);
        for column in 0..self.config.columns {
            self.set_data_size(column, 0);
        }
        self.set_size(0);
    }
}
