//! Error kinds shared by every subsystem of the engine.
//!
//! The engine distinguishes six failure classes. Construction-time misuse
//! (bad partition counts, mismatched zip sizes) is a [`Error::Config`];
//! anything touching the swap file, the VFS or the transport is an
//! [`Error::Io`] and always fatal to the job; serialization round-trip
//! failures are [`Error::Decode`]; allocation failure despite eviction and
//! reduce-table spill recursion overflow are [`Error::OutOfMemory`];
//! API misuse detected at runtime (reading a consumed DIA, double-running a
//! consuming action) is a [`Error::Logic`]; failures escaping user callbacks
//! surface as [`Error::User`].
//!
//! Per-item errors are not recovered. The first error recorded on any worker
//! is the job's outcome; [`crate::run_local`] wraps it in [`Error::Worker`]
//! so the caller learns which rank and operator failed.

use thiserror::Error;

/// All error kinds produced by the engine.
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid construction-time arguments, surfaced at DAG-build time.
    #[error("configuration error: {0}")]
    Config(String),

    /// VFS, transport or swap-file failure. Always fatal to the job.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization round-trip failure (truncated source, type mismatch).
    #[error("decode error: {0}")]
    Decode(String),

    /// The block pool cannot satisfy an allocation despite eviction, or a
    /// reduce-table spill recursed past its configured depth.
    #[error("out of memory: {0}")]
    OutOfMemory(String),

    /// API misuse detected at runtime.
    #[error("logic error: {0}")]
    Logic(String),

    /// A failure escaping a user callback.
    #[error("user error: {0}")]
    User(String),

    /// A worker-level wrapper recording which rank and operator failed.
    #[error("worker {rank} failed in {operator}: {source}")]
    Worker {
        rank: usize,
        operator: String,
        #[source]
        source: Box<Error>,
    },
}

impl From<postcard::Error> for Error {
    fn from(e: postcard::Error) -> Self {
        Error::Decode(e.to_string())
    }
}

/// Engine-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;
