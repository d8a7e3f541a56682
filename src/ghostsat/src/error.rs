//! Error kinds surfaced by the library.

use std::fmt;
use std::io;

/// Failure to build an interned formula node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FmlaError {
    Arity { op: &'static str, given: usize },
    Unsupported(&'static str),
}

impl fmt::Display for FmlaError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            FmlaError::Arity { op, given } => {
                write!(f, "operator '{}' cannot take {} arguments", op, given)
            }
            FmlaError::Unsupported(what) => write!(f, "unsupported construction: {}", what),
        }
    }
}

impl std::error::Error for FmlaError {}

#[derive(Debug)]
pub enum SolverError {
    /// Malformed input, undefined references, duplicate variables.
    Parse(String),
    /// The fresh-variable arena is exhausted.
    ResourceExhausted(&'static str),
    /// The configured time limit was exceeded.
    Timeout,
    /// A constraint on the requested operation does not hold
    /// (e.g. prenex form required for DIMACS emission).
    Unsupported(String),
    Io(io::Error),
    /// An internal invariant failed; should never surface in production.
    Internal(&'static str),
}

impl fmt::Display for SolverError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SolverError::Parse(msg) => write!(f, "parse error: {}", msg),
            SolverError::ResourceExhausted(what) => write!(f, "out of {}", what),
            SolverError::Timeout => write!(f, "time limit exceeded"),
            SolverError::Unsupported(msg) => write!(f, "{}", msg),
            SolverError::Io(e) => write!(f, "i/o error: {}", e),
            SolverError::Internal(msg) => write!(f, "internal invariant violated: {}", msg),
        }
    }
}

impl std::error::Error for SolverError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SolverError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for SolverError {
    fn from(e: io::Error) -> SolverError {
        SolverError::Io(e)
    }
}

impl From<FmlaError> for SolverError {
    fn from(e: FmlaError) -> SolverError {
        SolverError::Parse(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, SolverError>;
