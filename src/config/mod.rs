use std::{
    fs::{self, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};

use crate::{
    codec::{AnyCodec, FixedWidth, Varint},
    error::{PackedError, Result},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Encoding {
    /// Bit-packed values of `bits` bits each.
    Fixed { bits: u8 },
    /// LEB128 values; each column gets `bytes_per_value` bytes per element
    /// slot as its byte budget.
    Varint { bytes_per_value: u8 },
    /// Bit-packed symbols of an alphabet of `2^bits` letters, with rank and
    /// select support.
    Symbols { bits: u8 },
}

impl Encoding {
    pub(crate) fn tag(&self) -> (u8, u8) {
        match *self {
            Encoding::Fixed { bits } => (0, bits),
            Encoding::Varint { bytes_per_value } => (1, bytes_per_value),
            Encoding::Symbols { bits } => (2, bits),
        }
    }

    pub(crate) fn from_tag(kind: u8, param: u8) -> Option<Self> {
        match kind {
            0 => Some(Encoding::Fixed { bits: param }),
            1 => Some(Encoding::Varint {
                bytes_per_value: param,
            }),
            2 => Some(Encoding::Symbols { bits: param }),
            _ => None,
        }
    }
}

/// Geometry and encoding of a packed sequence. Fixed at `init`, stored in the
/// block header, and never changed afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackedConfig {
    pub branching_factor: usize,
    pub values_per_branch: usize,
    pub columns: usize,
    pub encoding: Encoding,
}

impl PackedConfig {
    pub const DEFAULT_BRANCHING_FACTOR: usize = 32;
    pub const DEFAULT_VALUES_PER_BRANCH: usize = 32;

    pub fn new(encoding: Encoding) -> Self {
        PackedConfig {
            branching_factor: Self::DEFAULT_BRANCHING_FACTOR,
            values_per_branch: Self::DEFAULT_VALUES_PER_BRANCH,
            columns: 1,
            encoding,
        }
    }

    pub fn fixed(bits: u8) -> Self {
        Self::new(Encoding::Fixed { bits })
    }

    pub fn varint(bytes_per_value: u8) -> Self {
        Self::new(Encoding::Varint { bytes_per_value })
    }

    pub fn symbols(bits: u8) -> Self {
        Self::new(Encoding::Symbols { bits })
    }

    pub fn with_geometry(mut self, branching_factor: usize, values_per_branch: usize) -> Self {
        self.branching_factor = branching_factor;
        self.values_per_branch = values_per_branch;
        self
    }

    pub fn with_columns(mut self, columns: usize) -> Self {
        self.columns = columns;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.branching_factor < 2 || self.branching_factor > u32::MAX as usize {
            return Err(PackedError::InvalidConfig(format!(
                "branching factor must be at least 2, got {}",
                self.branching_factor
            )));
        }
        if self.values_per_branch < 1 || self.values_per_branch > u32::MAX as usize {
            return Err(PackedError::InvalidConfig(format!(
                "values per branch must be at least 1, got {}",
                self.values_per_branch
            )));
        }
        if self.columns < 1 || self.columns > u16::MAX as usize {
            return Err(PackedError::InvalidConfig(format!(
                "columns must be in 1..=65535, got {}",
                self.columns
            )));
        }
        match self.encoding {
            Encoding::Fixed { bits } if !(1..=64).contains(&bits) => Err(
                PackedError::InvalidConfig(format!("fixed width must be 1..=64 bits, got {}", bits)),
            ),
            Encoding::Symbols { bits } if !(1..=8).contains(&bits) => Err(
                PackedError::InvalidConfig(format!("symbol width must be 1..=8 bits, got {}", bits)),
            ),
            Encoding::Varint { bytes_per_value }
                if !(1..=Varint::MAX_LEN as u8).contains(&bytes_per_value) =>
            {
                Err(PackedError::InvalidConfig(format!(
                    "varint budget must be 1..=10 bytes per value, got {}",
                    bytes_per_value
                )))
            }
            _ => Ok(()),
        }
    }

    /// Number of symbols, for symbol sequences.
    pub fn alphabet(&self) -> Option<usize> {
        match self.encoding {
            Encoding::Symbols { bits } => Some(1 << bits),
            _ => None,
        }
    }

    /// Aggregates per index cell: the window sum, then one count per symbol.
    pub fn lanes(&self) -> usize {
        1 + self.alphabet().unwrap_or(0)
    }

    pub fn codec(&self) -> AnyCodec {
        match self.encoding {
            Encoding::Fixed { bits } | Encoding::Symbols { bits } => {
                AnyCodec::Fixed(FixedWidth::new(bits as usize))
            }
            Encoding::Varint { bytes_per_value } => {
                AnyCodec::Varint(Varint::new(bytes_per_value as usize))
            }
        }
    }

    pub fn is_variable(&self) -> bool {
        matches!(self.encoding, Encoding::Varint { .. })
    }

    pub fn from_json(s: &str) -> anyhow::Result<Self> {
        let config: PackedConfig = serde_json::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json(&self) -> anyhow::Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn load<P>(path: P) -> anyhow::Result<Self>
    where
        P: AsRef<Path>,
    {
        Self::from_json(fs::read_to_string(path)?.as_str())
    }

    // Written to a sibling temp file first so a reader never sees half a
    // config.
    pub fn save<P>(&self, path: P) -> anyhow::Result<()>
    where
        P: AsRef<Path>,
    {
        let path = path.as_ref();
        let tmp_path = Self::tmp_path(path);
        let mut file = OpenOptions::new()
            .write(true)
            .truncate(true)
            .create(true)
            .open(&tmp_path)?;
        file.write_all(self.to_json()?.as_bytes())?;
        file.sync_all()?;
        fs::rename(tmp_path, path)?;
        Ok(())
    }

    fn tmp_path(path: &Path) -> PathBuf {
        let mut name = path.file_name().unwrap_or_default().to_os_string();
        name.push(".tmp");
        path.with_file_name(name)
    }
}
