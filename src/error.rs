//! Error taxonomy.
//!
//! Build-time failures (`BuildError`) and wire-time failures (`CodecError`)
//! are kept separate: a build error means no factory was produced, a codec
//! error surfaces from a compiled operation at pack/unpack time. Errors
//! during one type's build never touch the shared container; a failed
//! build simply abandons its context and sequence number.

use std::fmt;

use crate::emitter::EmitterFlavor;
use crate::value::ValueType;

/// Failure while building a serializer factory.
#[derive(Debug)]
pub enum BuildError {
    /// The environment forbids the requested code-generation strategy.
    /// Recoverable by switching to the expression-graph builder, which has
    /// no container dependency.
    PlatformUnsupported(&'static str),
    /// Neither emitter flavor is available on this platform.
    UnsupportedFlavor(EmitterFlavor),
    /// A member/method lookup matched more than one candidate.
    AmbiguousMember { name: String, candidates: usize },
    /// A member/method lookup matched nothing.
    UnresolvedMember { name: String },
    /// Internal graph invariant violation. Always a builder defect; callers
    /// should treat this as fatal rather than catch and suppress it.
    Compilation(String),
    /// Emission attempted against a context that is no longer `Open`.
    InvalidState {
        operation: &'static str,
        state: &'static str,
    },
    /// Persisting a debuggable container to disk failed. Propagated with the
    /// underlying cause; a retry without operator intervention cannot
    /// succeed.
    Io(std::io::Error),
}

impl fmt::Display for BuildError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BuildError::PlatformUnsupported(what) => {
                write!(f, "platform does not support {what}")
            }
            BuildError::UnsupportedFlavor(flavor) => {
                write!(f, "emitter flavor {flavor} is not supported on this platform")
            }
            BuildError::AmbiguousMember { name, candidates } => {
                write!(f, "member \"{name}\" is ambiguous ({candidates} candidates)")
            }
            BuildError::UnresolvedMember { name } => {
                write!(f, "member \"{name}\" could not be resolved")
            }
            BuildError::Compilation(msg) => write!(f, "graph compilation failed: {msg}"),
            BuildError::InvalidState { operation, state } => {
                write!(f, "{operation} is not valid on a {state} context")
            }
            BuildError::Io(e) => write!(f, "persist failed: {e}"),
        }
    }
}

impl std::error::Error for BuildError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            BuildError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for BuildError {
    fn from(e: std::io::Error) -> Self {
        BuildError::Io(e)
    }
}

/// Failure raised by a compiled operation at pack/unpack time.
#[derive(Debug, Clone, PartialEq)]
pub enum CodecError {
    UnexpectedEof,
    /// The decoder saw a marker byte it cannot interpret in this position.
    InvalidMarker(u8),
    TypeMismatch {
        expected: ValueType,
        found: ValueType,
    },
    NumberOutOfRange,
    InvalidUtf8,
    UnknownEnumMember(String),
    /// A named unpack operation was required but the wire map lacked it.
    MissingMember(String),
    /// Accessor- or collaborator-supplied failure.
    Message(String),
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CodecError::UnexpectedEof => write!(f, "unexpected end of input"),
            CodecError::InvalidMarker(m) => write!(f, "invalid marker byte 0x{m:02x}"),
            CodecError::TypeMismatch { expected, found } => {
                write!(f, "type mismatch: expected {expected}, found {found}")
            }
            CodecError::NumberOutOfRange => write!(f, "number out of range"),
            CodecError::InvalidUtf8 => write!(f, "invalid UTF-8"),
            CodecError::UnknownEnumMember(name) => {
                write!(f, "unknown enum member: {name}")
            }
            CodecError::MissingMember(name) => write!(f, "missing member: {name}"),
            CodecError::Message(msg) => write!(f, "{msg}"),
        }
    }
}

impl std::error::Error for CodecError {}
