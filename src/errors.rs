//! Error kinds for the whole pipeline. Every error aborts the run with a
//! single diagnostic line and the exit code of the matching errno.

use std::io;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PastmlError {
    /// Malformed arguments, model/method names, csv rows, newick syntax,
    /// or a tip/tree mismatch.
    #[error("{0}")]
    BadInput(String),

    /// An input file does not exist or cannot be opened.
    #[error("could not open {path}: {source}")]
    NotFound {
        path: String,
        #[source]
        source: io::Error,
    },

    /// The tree file exceeds MAX_TREELENGTH.
    #[error("tree file {0} is larger than {1} bytes")]
    TooLarge(String, u64),

    /// A likelihood buffer could not be allocated.
    #[error("could not allocate likelihood buffers ({0} states per node)")]
    OutOfMemory(usize),

    /// The bottom-up pass produced a non-finite or all-zero vector.
    #[error("numeric failure: {0}")]
    NumericFailure(String),
}

pub type Result<T, E = PastmlError> = std::result::Result<T, E>;

impl PastmlError {
    /// Maps every kind to the errno-style process exit code.
    pub fn exit_code(&self) -> i32 {
        match self {
            PastmlError::BadInput(_) => 22,    // EINVAL
            PastmlError::NotFound { .. } => 2, // ENOENT
            PastmlError::TooLarge(..) => 27,   // EFBIG
            PastmlError::OutOfMemory(_) => 12, // ENOMEM
            PastmlError::NumericFailure(_) => 1,
        }
    }

    pub fn not_found(path: &Path, source: io::Error) -> PastmlError {
        PastmlError::NotFound {
            path: path.display().to_string(),
            source,
        }
    }
}
