use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Main error type for sfi operations
#[derive(Error, Debug)]
pub enum SfiError {
    /// An input source could not be opened
    #[error("Cannot open file `{}`: {source}", .path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Reading an already opened source failed part way through
    #[error("Read error on {name}: {source}")]
    Read {
        name: String,
        #[source]
        source: io::Error,
    },

    /// IO error when writing the expanded output
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// A delimiter token was configured as the empty string
    #[error("Invalid {which} delimiter: token must not be empty")]
    EmptyDelimiter { which: &'static str },

    /// An escape table entry has an empty escape sequence
    #[error("Invalid escape table entry {index}: sequence must not be empty")]
    EmptyEscape { index: usize },

    /// Import nesting went past the configured depth guard
    #[error("Import depth limit of {max_depth} exceeded while importing {}", .path.display())]
    DepthExceeded { path: PathBuf, max_depth: usize },

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, SfiError>;
