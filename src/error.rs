use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AlignError {
    #[error("I/O error while {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{}:{line}: {message}", path.display())]
    Parse {
        path: PathBuf,
        line: usize,
        message: String,
    },
    #[error("invalid configuration: {0}")]
    Config(String),
    /// The lattice produced scores that cannot both be right
    #[error("inconsistent lattice for pair {pair}: {message}")]
    Inconsistent { pair: usize, message: String },
    #[error("no probability mass left for pair {pair} at target position {position}")]
    Underflow { pair: usize, position: usize },
}

impl AlignError {
    pub(crate) fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    pub(crate) fn parse(path: &Path, line: usize, message: impl Into<String>) -> Self {
        Self::Parse {
            path: path.to_path_buf(),
            line,
            message: message.into(),
        }
    }

    pub(crate) fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    pub(crate) fn inconsistent(pair: usize, message: impl Into<String>) -> Self {
        Self::Inconsistent {
            pair,
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, AlignError>;
