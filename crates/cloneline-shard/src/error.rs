//! Common error type for shard production

use std::fmt;

use cloneline_core::record::RecordError;

/// Error from producing or reading one shard.
#[derive(Debug)]
pub enum ShardError {
    Io(std::io::Error),
    Record { line: usize, source: RecordError },
}

impl fmt::Display for ShardError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "IO: {e}"),
            Self::Record { line, source } => write!(f, "line {line}: {source}"),
        }
    }
}

impl std::error::Error for ShardError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::Record { source, .. } => Some(source),
        }
    }
}

impl From<std::io::Error> for ShardError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}
