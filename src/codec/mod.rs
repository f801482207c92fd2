// Value codecs for the packed value streams.
//
// A stream is addressed in "units": bits for the fixed-width codec and bytes
// for varints. Every codec reports how many units a value takes, so the
// sequence code above it never needs to know which one it is talking to,
// except to pick an O(1) locate when the width is fixed.

pub trait Codec: std::fmt::Debug {
    /// Decodes the value starting at `pos`, returning it together with the
    /// number of units it occupies.
    fn decode(&self, data: &[u8], pos: usize) -> (u64, usize);

    /// Like `decode`, but for untrusted streams: `None` if the value would
    /// run past unit `end` or is not a well-formed encoding.
    fn try_decode(&self, data: &[u8], pos: usize, end: usize) -> Option<(u64, usize)>;

    /// Encodes `value` at `pos` and returns the number of units written. The
    /// caller has already checked that the value fits.
    fn encode(&self, data: &mut [u8], pos: usize, value: u64) -> usize;

    fn length(&self, value: u64) -> usize;

    /// Width in bits when every value takes the same space.
    fn fixed_width(&self) -> Option<usize>;

    fn max_value(&self) -> u64;

    /// Number of units a column of `max_size` elements may use.
    fn stream_units(&self, max_size: usize) -> usize;

    /// Bytes needed to hold `stream_units(max_size)` units.
    fn segment_bytes(&self, max_size: usize) -> usize;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedWidth {
    bits: usize,
}

impl FixedWidth {
    pub fn new(bits: usize) -> Self {
        assert!((1..=64).contains(&bits), "bad width: {}", bits);
        FixedWidth { bits }
    }

    pub fn bits(&self) -> usize {
        self.bits
    }
}

fn mask(bits: usize) -> u64 {
    if bits >= 64 {
        u64::MAX
    } else {
        (1_u64 << bits) - 1
    }
}

// A value of up to 64 bits starting at an arbitrary bit offset spans at most
// nine bytes.
pub(crate) fn read_bits(data: &[u8], pos: usize, bits: usize) -> u64 {
    let byte = pos / 8;
    let shift = pos % 8;
    let n = (shift + bits + 7) / 8;
    let mut word = 0_u128;
    for (i, b) in data[byte..byte + n].iter().enumerate() {
        word |= (*b as u128) << (8 * i);
    }
    ((word >> shift) as u64) & mask(bits)
}

pub(crate) fn write_bits(data: &mut [u8], pos: usize, bits: usize, value: u64) {
    let byte = pos / 8;
    let shift = pos % 8;
    let n = (shift + bits + 7) / 8;
    let mut word = 0_u128;
    for (i, b) in data[byte..byte + n].iter().enumerate() {
        word |= (*b as u128) << (8 * i);
    }
    let m = (mask(bits) as u128) << shift;
    word = (word & !m) | (((value & mask(bits)) as u128) << shift);
    for (i, b) in data[byte..byte + n].iter_mut().enumerate() {
        *b = (word >> (8 * i)) as u8;
    }
}

impl Codec for FixedWidth {
    fn decode(&self, data: &[u8], pos: usize) -> (u64, usize) {
        (read_bits(data, pos, self.bits), self.bits)
    }

    fn try_decode(&self, data: &[u8], pos: usize, end: usize) -> Option<(u64, usize)> {
        let stop = pos.checked_add(self.bits)?;
        if stop > end || (stop + 7) / 8 > data.len() {
            return None;
        }
        Some(self.decode(data, pos))
    }

    fn encode(&self, data: &mut [u8], pos: usize, value: u64) -> usize {
        write_bits(data, pos, self.bits, value);
        self.bits
    }

    fn length(&self, _value: u64) -> usize {
        self.bits
    }

    fn fixed_width(&self) -> Option<usize> {
        Some(self.bits)
    }

    fn max_value(&self) -> u64 {
        mask(self.bits)
    }

    fn stream_units(&self, max_size: usize) -> usize {
        max_size * self.bits
    }

    fn segment_bytes(&self, max_size: usize) -> usize {
        (self.stream_units(max_size) + 7) / 8
    }
}

/// Unsigned LEB128. `bytes_per_value` only sizes the column's byte budget;
/// any single value may take up to ten bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Varint {
    bytes_per_value: usize,
}

impl Varint {
    pub const MAX_LEN: usize = 10;

    pub fn new(bytes_per_value: usize) -> Self {
        assert!(
            (1..=Self::MAX_LEN).contains(&bytes_per_value),
            "bad byte budget: {}",
            bytes_per_value
        );
        Varint { bytes_per_value }
    }

    pub fn bytes_per_value(&self) -> usize {
        self.bytes_per_value
    }
}

impl Codec for Varint {
    // Stops after MAX_LEN bytes even without a terminator.
    fn decode(&self, data: &[u8], pos: usize) -> (u64, usize) {
        let mut value = 0_u64;
        for i in 0..Self::MAX_LEN {
            let b = data[pos + i];
            value |= ((b & 0x7f) as u64) << (7 * i);
            if b & 0x80 == 0 {
                return (value, i + 1);
            }
        }
        (value, Self::MAX_LEN)
    }

    fn try_decode(&self, data: &[u8], pos: usize, end: usize) -> Option<(u64, usize)> {
        let end = std::cmp::min(end, data.len());
        let mut value = 0_u64;
        for i in 0..Self::MAX_LEN {
            if pos + i >= end {
                return None;
            }
            let b = data[pos + i];
            // The tenth byte carries only the top bit of a u64.
            if i == Self::MAX_LEN - 1 && b > 1 {
                return None;
            }
            value |= ((b & 0x7f) as u64) << (7 * i);
            if b & 0x80 == 0 {
                return Some((value, i + 1));
            }
        }
        None
    }

    fn encode(&self, data: &mut [u8], pos: usize, mut value: u64) -> usize {
        let mut idx = pos;
        loop {
            let b = (value & 0x7f) as u8;
            value >>= 7;
            if value == 0 {
                data[idx] = b;
                idx += 1;
                break;
            }
            data[idx] = b | 0x80;
            idx += 1;
        }
        idx - pos
    }

    fn length(&self, value: u64) -> usize {
        let bits = 64 - value.leading_zeros() as usize;
        std::cmp::max(1, (bits + 6) / 7)
    }

    fn fixed_width(&self) -> Option<usize> {
        None
    }

    fn max_value(&self) -> u64 {
        u64::MAX
    }

    fn stream_units(&self, max_size: usize) -> usize {
        max_size * self.bytes_per_value
    }

    fn segment_bytes(&self, max_size: usize) -> usize {
        self.stream_units(max_size)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnyCodec {
    Fixed(FixedWidth),
    Varint(Varint),
}

impl Codec for AnyCodec {
    fn decode(&self, data: &[u8], pos: usize) -> (u64, usize) {
        match self {
            AnyCodec::Fixed(c) => c.decode(data, pos),
            AnyCodec::Varint(c) => c.decode(data, pos),
        }
    }

    fn try_decode(&self, data: &[u8], pos: usize, end: usize) -> Option<(u64, usize)> {
        match self {
            AnyCodec::Fixed(c) => c.try_decode(data, pos, end),
            AnyCodec::Varint(c) => c.try_decode(data, pos, end),
        }
    }

    fn encode(&self, data: &mut [u8], pos: usize, value: u64) -> usize {
        match self {
            AnyCodec::Fixed(c) => c.encode(data, pos, value),
            AnyCodec::Varint(c) => c.encode(data, pos, value),
        }
    }

    fn length(&self, value: u64) -> usize {
        match self {
            AnyCodec::Fixed(c) => c.length(value),
            AnyCodec::Varint(c) => c.length(value),
        }
    }

    fn fixed_width(&self) -> Option<usize> {
        match self {
            AnyCodec::Fixed(c) => c.fixed_width(),
            AnyCodec::Varint(c) => c.fixed_width(),
        }
    }

    fn max_value(&self) -> u64 {
        match self {
            AnyCodec::Fixed(c) => c.max_value(),
            AnyCodec::Varint(c) => c.max_value(),
        }
    }

    fn stream_units(&self, max_size: usize) -> usize {
        match self {
            AnyCodec::Fixed(c) => c.stream_units(max_size),
            AnyCodec::Varint(c) => c.stream_units(max_size),
        }
    }

    fn segment_bytes(&self, max_size: usize) -> usize {
        match self {
            AnyCodec::Fixed(c) => c.segment_bytes(max_size),
            AnyCodec::Varint(c) => c.segment_bytes(max_size),
        }
    }
}

// Little-endian header/index accessors.

pub(crate) fn read_u16(buf: &[u8], at: usize) -> u16 {
    let mut bytes = [0_u8; 2];
    bytes.copy_from_slice(&buf[at..at + 2]);
    u16::from_le_bytes(bytes)
}

pub(crate) fn write_u16(buf: &mut [u8], at: usize, v: u16) {
    buf[at..at + 2].copy_from_slice(&v.to_le_bytes());
}

pub(crate) fn read_u32(buf: &[u8], at: usize) -> u32 {
    let mut bytes = [0_u8; 4];
    bytes.copy_from_slice(&buf[at..at + 4]);
    u32::from_le_bytes(bytes)
}

pub(crate) fn write_u32(buf: &mut [u8], at: usize, v: u32) {
    buf[at..at + 4].copy_from_slice(&v.to_le_bytes());
}

pub(crate) fn read_u64(buf: &[u8], at: usize) -> u64 {
    let mut bytes = [0_u8; 8];
    bytes.copy_from_slice(&buf[at..at + 8]);
    u64::from_le_bytes(bytes)
}

pub(crate) fn write_u64(buf: &mut [u8], at: usize, v: u64) {
    buf[at..at + 8].copy_from_slice(&v.to_le_bytes());
}
