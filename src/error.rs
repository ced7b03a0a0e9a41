use thiserror::Error;

#[derive(Error, Debug)]
pub enum FatError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Allocation failure: {0}")]
    AllocationFailure(String),

    #[error("{what} {address} out of bounds (limit {limit})")]
    OutOfBounds {
        what: &'static str,
        address: u64,
        limit: u64,
    },

    #[error("Corrupt {structure} signature: expected {expected:#x}, found {found:#x}")]
    CorruptSignature {
        structure: &'static str,
        expected: u32,
        found: u32,
    },

    #[error("No free clusters left on the volume")]
    ClusterAllocError,

    #[error("Path not found: {0}")]
    PathNotFound(String),

    #[error("Type mismatch at {path}: expected a {expected}")]
    TypeMismatch { path: String, expected: &'static str },

    #[error("Invalid short name: {0}")]
    InvalidName(String),

    #[error("Unsupported volume: {0}")]
    Unsupported(String),
}

pub type Result<T, E = FatError> = std::result::Result<T, E>;
