// Byte-exact save and restore of a sequence.
//
// The stream is the raw header followed, per column, by three
// length-prefixed segments: the used part of the index, the used part of the
// offsets cache and the used part of the value stream. Restoring needs a
// target built with the same config and max_size, and is all or nothing.

use std::io::{Read, Write};

use anyhow::bail;

use crate::{
    codec::Codec,
    config::PackedConfig,
    layout::{div_up, LANE_WIDTH, OFFSET_WIDTH},
    sequence::{column_parts_mut, read_header, PackedSequence},
};

fn write_segment<W: Write>(w: &mut W, data: &[u8]) -> anyhow::Result<()> {
    w.write_all(&(data.len() as u32).to_le_bytes())?;
    w.write_all(data)?;
    Ok(())
}

fn read_segment<R: Read>(r: &mut R, into: &mut [u8], what: &str) -> anyhow::Result<()> {
    let mut len = [0_u8; 4];
    r.read_exact(&mut len)?;
    let len = u32::from_le_bytes(len) as usize;
    if len != into.len() {
        bail!("{} segment is {} bytes, expected {}", what, len, into.len());
    }
    r.read_exact(into)?;
    Ok(())
}

// Bytes of each segment that hold live data.
fn used_lengths(
    config: &PackedConfig,
    max_size: usize,
    index_size: usize,
    data_size: usize,
) -> (usize, usize, usize) {
    let index = index_size * config.lanes() * LANE_WIDTH;
    match config.codec().fixed_width() {
        Some(_) => (index, 0, div_up(data_size, 8)),
        None => (
            index,
            div_up(max_size, config.values_per_branch) * OFFSET_WIDTH,
            data_size,
        ),
    }
}

impl<B: AsRef<[u8]>> PackedSequence<B> {
    pub fn serialize<W: Write>(&self, w: &mut W) -> anyhow::Result<()> {
        let bytes = self.as_bytes();
        let block = self.block_layout();
        w.write_all(&bytes[..block.header_len])?;
        for column in 0..self.columns() {
            let (index, offsets, values) = used_lengths(
                self.config(),
                self.max_size(),
                self.index_size(),
                self.data_size(column),
            );
            let at = block.index(column);
            write_segment(w, &bytes[at..at + index])?;
            let at = block.offsets(column);
            write_segment(w, &bytes[at..at + offsets])?;
            let at = block.values(column);
            write_segment(w, &bytes[at..at + values])?;
        }
        tracing::debug!(size = self.size(), "serialized packed sequence");
        Ok(())
    }
}

impl<B: AsRef<[u8]> + AsMut<[u8]>> PackedSequence<B> {
    /// Replaces the contents of this sequence with a serialized one. The
    /// stream is restored into a scratch block and verified with `check`
    /// first; on any error `self` is left untouched.
    pub fn deserialize<R: Read>(&mut self, r: &mut R) -> anyhow::Result<()> {
        let block = self.block_layout().clone();
        let mut scratch = vec![0_u8; block.block_size()];
        r.read_exact(&mut scratch[..block.header_len])?;
        let parsed = read_header(&scratch[..block.header_len])?;
        if parsed.config != *self.config() {
            bail!(
                "serialized config {:?} does not match {:?}",
                parsed.config,
                self.config()
            );
        }
        if parsed.max_size != self.max_size() {
            bail!(
                "serialized max_size {} does not match {}",
                parsed.max_size,
                self.max_size()
            );
        }

        for (column, data_size) in parsed.data_sizes.iter().enumerate() {
            let (index_len, offsets_len, values_len) = used_lengths(
                &parsed.config,
                parsed.max_size,
                self.index_size(),
                *data_size,
            );
            let (index, offsets, values) = column_parts_mut(&mut scratch, &block, column);
            read_segment(r, &mut index[..index_len], "index")?;
            read_segment(r, &mut offsets[..offsets_len], "offsets")?;
            read_segment(r, &mut values[..values_len], "values")?;
        }

        PackedSequence::open(scratch.as_slice())?.check()?;
        self.bytes_mut().copy_from_slice(&scratch);
        tracing::debug!(size = parsed.size, "deserialized packed sequence");
        Ok(())
    }
}
