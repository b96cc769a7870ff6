//! Common error type for shard merging

use std::fmt;

use cloneline_shard::ShardError;
use cloneline_shard::model::FileId;

/// Error from merging two shard results.
#[derive(Debug)]
pub enum MergeError {
    Io(std::io::Error),
    Shard(ShardError),
    /// No creation timestamp recorded for a file id the merge must compare.
    MissingCreatedAt(FileId),
    /// An input shard violates an invariant the merge relies on. Correct
    /// inputs never trigger this; there is no recovery path.
    Corrupt(String),
}

impl fmt::Display for MergeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "IO: {e}"),
            Self::Shard(e) => write!(f, "{e}"),
            Self::MissingCreatedAt(id) => {
                write!(f, "no creation timestamp recorded for file {id}")
            }
            Self::Corrupt(msg) => write!(f, "corrupt shard input: {msg}"),
        }
    }
}

impl std::error::Error for MergeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::Shard(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for MergeError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<ShardError> for MergeError {
    fn from(e: ShardError) -> Self {
        Self::Shard(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_names_the_file() {
        let err = MergeError::MissingCreatedAt(42);
        assert!(format!("{err}").contains("42"));
    }
}
