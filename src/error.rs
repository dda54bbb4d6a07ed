use thiserror::Error;

/// Error kinds surfaced by the index.
#[derive(Error, Debug)]
pub enum NvhError {
    /// The table's probe chain is exhausted (occupancy above the refusal
    /// threshold), or the external block allocator has nothing left to give.
    #[error("no space: {0}")]
    NoSpace(String),

    /// The underlying block device failed a read, write, or sync.
    #[error("block device I/O error: {0}")]
    Io(String),

    /// A metadata descriptor's magic did not match, or an on-disk structure
    /// was read out of its declared bounds.
    #[error("corrupt on-disk structure: {0}")]
    Corrupt(String),

    /// Bad arguments from the caller (e.g. an out-of-range logical block).
    #[error("invalid argument: {0}")]
    Invalid(String),
}

pub type Result<T> = std::result::Result<T, NvhError>;
