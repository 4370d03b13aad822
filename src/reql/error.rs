//! Structured query errors with term-tree backtraces.
//!
//! Every failure inside the evaluator is a [`QueryError`]: an error kind, a
//! human-readable message, and a [`Backtrace`] describing the path from the
//! query root to the failing term. Frames are attached on the way out of the
//! evaluation stack — each argument boundary the error crosses prepends the
//! child's position within its parent — so the finished backtrace reads
//! root-to-leaf.
//!
//! # Example
//!
//! ```rust,ignore
//! use reql_core::reql::error::{Frame, QueryError};
//!
//! let err = QueryError::non_existence("Index out of bounds: 5")
//!     .with_frame(Frame::Pos(1))
//!     .with_frame(Frame::Pos(0));
//! assert_eq!(err.backtrace().frames(), &[Frame::Pos(0), Frame::Pos(1)]);
//! ```

use thiserror::Error;

/// Classification of a query failure.
///
/// The kind is what clients branch on; the message is for humans.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Wrong number of positional arguments.
    Arity,
    /// An optional argument name the operator does not declare.
    UnrecognizedOptarg,
    /// A value had the wrong type for the requested operation.
    Type,
    /// An index or attribute was not found / out of range.
    NonExistence,
    /// A precondition the caller violated (negative limit, bad coercion
    /// target, unsupported stream index, ...).
    Logic,
    /// An array or object exceeded the configured size limit.
    ResourceLimit,
    /// Evaluation was interrupted through the environment's interruptor.
    Cancelled,
    /// An engine invariant was violated; never the caller's fault.
    Internal,
}

/// One step in a backtrace: which child of the enclosing term was being
/// evaluated when the error surfaced.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Frame {
    /// Positional argument at the given index.
    Pos(usize),
    /// Named optional argument.
    Opt(String),
}

impl std::fmt::Display for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Frame::Pos(i) => write!(f, "{}", i),
            Frame::Opt(name) => write!(f, "{}", name),
        }
    }
}

/// Path of frames from the query root to the failing term.
///
/// Immutable once the error reaches the caller; an error response carries
/// exactly one backtrace.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Backtrace {
    frames: Vec<Frame>,
}

impl Backtrace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn frames(&self) -> &[Frame] {
        &self.frames
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Prepend a frame one level closer to the root.
    fn push_outer(&mut self, frame: Frame) {
        self.frames.insert(0, frame);
    }
}

impl std::fmt::Display for Backtrace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[")?;
        for (i, frame) in self.frames.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", frame)?;
        }
        write!(f, "]")
    }
}

/// Private alias so the `#[derive(Error)]` macro does not mistake this field
/// for a `std::backtrace::Backtrace` provider (thiserror special-cases any
/// field whose type's final path segment is literally `Backtrace`).
type TermTrace = Backtrace;

/// The single error type threaded through every evaluation call.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{message}")]
pub struct QueryError {
    kind: ErrorKind,
    message: String,
    trace: TermTrace,
}

impl QueryError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            trace: Backtrace::new(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn backtrace(&self) -> &Backtrace {
        &self.trace
    }

    /// Record that this error crossed an argument boundary; the frame ends up
    /// in front of any frames attached deeper in the tree.
    pub fn with_frame(mut self, frame: Frame) -> Self {
        self.trace.push_outer(frame);
        self
    }

    pub fn arity(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Arity, message)
    }

    pub fn unrecognized_optarg(name: &str) -> Self {
        Self::new(
            ErrorKind::UnrecognizedOptarg,
            format!("Unrecognized optional argument `{}`.", name),
        )
    }

    pub fn type_error(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Type, message)
    }

    pub fn non_existence(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NonExistence, message)
    }

    pub fn logic(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Logic, message)
    }

    pub fn resource_limit(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ResourceLimit, message)
    }

    pub fn cancelled() -> Self {
        Self::new(ErrorKind::Cancelled, "Query interrupted.")
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }
}

pub type Result<T> = std::result::Result<T, QueryError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frames_read_root_to_leaf() {
        // Innermost boundary attaches first, outermost last.
        let err = QueryError::logic("boom")
            .with_frame(Frame::Pos(2))
            .with_frame(Frame::Pos(1));
        assert_eq!(err.backtrace().frames(), &[Frame::Pos(1), Frame::Pos(2)]);
    }

    #[test]
    fn test_optarg_frame_display() {
        let err = QueryError::logic("boom").with_frame(Frame::Opt("left_bound".into()));
        assert_eq!(format!("{}", err.backtrace()), "[left_bound]");
    }

    #[test]
    fn test_kind_and_message() {
        let err = QueryError::non_existence("Index out of bounds: 5");
        assert_eq!(err.kind(), ErrorKind::NonExistence);
        assert_eq!(err.to_string(), "Index out of bounds: 5");
        assert!(err.backtrace().is_empty());
    }
}
