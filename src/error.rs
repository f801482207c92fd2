use thiserror::Error;

pub type Result<T> = std::result::Result<T, PackedError>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PackedError {
    /// The mutation needs more elements than the block holds. The owner is
    /// expected to grow the block and retry.
    #[error("capacity exceeded: requested {requested} elements, {available} available")]
    CapacityExceeded { requested: usize, available: usize },

    /// A variable-width column ran out of bytes before running out of
    /// element slots.
    #[error("byte budget exceeded in column {column}: requested {requested} bytes, {available} available")]
    ByteBudgetExceeded {
        column: usize,
        requested: usize,
        available: usize,
    },

    /// The column total, and so the root of its index, would no longer fit
    /// in a u64. Growing the block does not help.
    #[error("sum overflow in column {column}: values would total more than u64::MAX")]
    SumOverflow { column: usize },

    #[error("block too small: {required} bytes required, {available} given")]
    BlockTooSmall { required: usize, available: usize },

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("invalid header: {0}")]
    InvalidHeader(String),

    /// Only produced by `check()`.
    #[error("structural inconsistency: {0}")]
    Inconsistent(String),
}

impl PackedError {
    pub fn is_capacity(&self) -> bool {
        matches!(
            self,
            PackedError::CapacityExceeded { .. }
                | PackedError::ByteBudgetExceeded { .. }
                | PackedError::BlockTooSmall { .. }
        )
    }
}
