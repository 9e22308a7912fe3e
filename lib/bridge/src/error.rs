use wasmer::{CompileError, ExportError, InstantiationError, RuntimeError};

use crate::{exception::ModuleException, table::TableIndex};

pub(crate) type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors that prevent [`Loader::load()`][crate::Loader::load] from producing
/// an [`InstantiatedHandle`][crate::InstantiatedHandle].
///
/// No partial handle is ever returned alongside one of these.
#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    /// The module's bytes couldn't be obtained (fetch or IO failure, a
    /// non-success response, or a rejected deferred source).
    ///
    /// Retrying with a new source may succeed.
    #[error("the module source is unavailable")]
    SourceUnavailable(#[source] BoxError),
    /// The bytes were obtained but aren't a valid module, or the module
    /// doesn't provide the bridge exports.
    #[error("malformed module: {reason}")]
    MalformedModule {
        reason: String,
        #[source]
        source: Option<CompileError>,
    },
    /// A host-supplied memory doesn't satisfy the module's memory import.
    #[error("incompatible memory: {reason}")]
    IncompatibleMemory { reason: String },
    /// Linking or the module's start-up routine failed.
    #[error("instantiation failed")]
    InstantiationFailed(#[source] BoxError),
    /// A precompiled module or host memory came from a loader with a
    /// different engine.
    #[error("the {what} was created by a loader with a different engine")]
    ForeignEngine { what: &'static str },
}

impl LoadError {
    pub(crate) fn unavailable(error: impl Into<BoxError>) -> Self {
        LoadError::SourceUnavailable(error.into())
    }

    pub(crate) fn malformed(reason: impl Into<String>) -> Self {
        LoadError::MalformedModule {
            reason: reason.into(),
            source: None,
        }
    }

    pub(crate) fn incompatible_memory(reason: impl Into<String>) -> Self {
        LoadError::IncompatibleMemory {
            reason: reason.into(),
        }
    }
}

impl From<CompileError> for LoadError {
    fn from(e: CompileError) -> Self {
        LoadError::MalformedModule {
            reason: e.to_string(),
            source: Some(e),
        }
    }
}

impl From<InstantiationError> for LoadError {
    fn from(e: InstantiationError) -> Self {
        LoadError::InstantiationFailed(Box::new(e))
    }
}

/// Errors from calls into an instantiated module.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    /// The bridge contract was broken. This indicates a bug in the caller and
    /// retrying won't help.
    #[error(transparent)]
    BoundaryViolation(#[from] BoundaryViolation),
    /// The module deliberately signaled failure through the exception store.
    #[error("the module raised an exception: {0}")]
    ModuleRaised(ModuleException),
    #[error("unable to allocate {size} bytes inside the module")]
    AllocationFailed {
        size: usize,
        #[source]
        source: Option<RuntimeError>,
    },
    /// The module trapped without leaving an exception behind.
    #[error("the module trapped")]
    Trap(#[from] RuntimeError),
    #[error("the module doesn't export a compatible \"{name}\"")]
    MissingExport {
        name: String,
        #[source]
        source: ExportError,
    },
}

/// Misuse of the dispatch table or memory management contracts.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BoundaryViolation {
    #[error("dispatch table index {0} isn't registered")]
    UnregisteredIndex(TableIndex),
    #[error("dispatch table index {index} holds a {actual} callback, not a {expected} one")]
    WrongShape {
        index: TableIndex,
        expected: &'static str,
        actual: &'static str,
    },
    #[error("the indirect call through table index {index} trapped: {message}")]
    IndirectCall { index: TableIndex, message: String },
    #[error("freeing {offset:#x} with size {size}, but it was allocated with size {expected}")]
    MismatchedFree { offset: u32, size: u32, expected: u32 },
    #[error(
        "accessing {len} bytes at {offset:#x} is outside of linear memory ({memory_size} bytes)"
    )]
    OutOfBounds {
        offset: u64,
        len: u64,
        memory_size: u64,
    },
    #[error("the module returned an unknown status code, {0}")]
    UnknownStatus(i32),
    #[error("the module signaled a failure without storing an exception")]
    MissingException,
}
