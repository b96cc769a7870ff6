//! Common error type for pipeline stage handlers

use std::fmt;

/// Error from handling one job inside a pipeline stage.
///
/// Recoverable errors are counted and the stage moves on to the next job.
/// Fatal errors (broken stage state) are counted separately, but the worker
/// loop likewise continues — the queue never loses a job once accepted, and
/// a stage is only ever stopped from outside.
#[derive(Debug)]
pub enum JobError {
    Recoverable(String),
    Fatal(String),
}

impl JobError {
    pub fn recoverable(msg: impl fmt::Display) -> Self {
        Self::Recoverable(msg.to_string())
    }

    pub fn fatal(msg: impl fmt::Display) -> Self {
        Self::Fatal(msg.to_string())
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal(_))
    }
}

impl fmt::Display for JobError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Recoverable(msg) => write!(f, "{msg}"),
            Self::Fatal(msg) => write!(f, "fatal: {msg}"),
        }
    }
}

impl std::error::Error for JobError {}

impl From<std::io::Error> for JobError {
    fn from(e: std::io::Error) -> Self {
        Self::Recoverable(format!("IO: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recoverable_is_not_fatal() {
        assert!(!JobError::recoverable("bad record").is_fatal());
        assert!(JobError::fatal("output stream gone").is_fatal());
    }

    #[test]
    fn display_marks_fatal() {
        let msg = format!("{}", JobError::fatal("x"));
        assert!(msg.starts_with("fatal:"));
        let msg = format!("{}", JobError::recoverable("y"));
        assert_eq!(msg, "y");
    }

    #[test]
    fn io_error_converts_to_recoverable() {
        let err: JobError = std::io::Error::other("oops").into();
        assert!(!err.is_fatal());
        assert!(format!("{err}").contains("IO:"));
    }
}
