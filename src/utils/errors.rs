//! Error types for the auto scheduler.
//!
//! Usage errors are reported back to the caller; they describe pipelines
//! the scheduler refuses to process (partially scheduled stages, unknown
//! callees). Internal invariant violations are not errors and panic
//! instead.

use std::fmt;
use thiserror::Error;

/// Top-level error type for the auto scheduler.
#[derive(Error, Debug)]
pub enum AutoScheduleError {
    /// The pipeline violates a precondition of the scheduler.
    #[error("Usage error: {0}")]
    Usage(#[from] UsageError),

    /// A schedule transcript could not be parsed back into directives.
    #[error("Transcript parse error: {0}")]
    Transcript(#[from] TranscriptError),
}

/// Error describing a pipeline the scheduler cannot process.
#[derive(Error, Debug, Clone)]
pub struct UsageError {
    /// The error message.
    pub message: String,
    /// The function the error was detected on, if any.
    pub func: Option<String>,
    /// The kind of usage error.
    pub kind: UsageErrorKind,
}

impl fmt::Display for UsageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.func {
            Some(ref name) => write!(f, "{} (function \"{}\")", self.message, name),
            None => write!(f, "{}", self.message),
        }
    }
}

impl UsageError {
    /// Create a usage error attached to a function.
    pub fn new(kind: UsageErrorKind, func: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            func: Some(func.into()),
            kind,
        }
    }

    /// Create a usage error not attached to any function.
    pub fn pipeline(kind: UsageErrorKind, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            func: None,
            kind,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsageErrorKind {
    /// A stage already carries splits.
    PartialSplits,
    /// A loop dimension is not serial.
    NonSerialLoop,
    /// Loop dimensions were reordered relative to the declaration order.
    ReorderedDims,
    /// A call references a name that is neither a function nor an input.
    UnknownCallee,
    /// An output name does not refer to a registered function.
    UnknownOutput,
    /// A function was registered twice.
    DuplicateFunction,
}

/// Error produced when re-parsing a schedule transcript.
#[derive(Error, Debug, Clone)]
pub struct TranscriptError {
    /// The error message.
    pub message: String,
    /// The offending line.
    pub line: String,
}

impl fmt::Display for TranscriptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} in \"{}\"", self.message, self.line)
    }
}

impl TranscriptError {
    /// Create a transcript error for a line.
    pub fn new(message: impl Into<String>, line: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            line: line.into(),
        }
    }
}

/// Result type using AutoScheduleError.
pub type SchedResult<T> = Result<T, AutoScheduleError>;
