//! The single-slot exception channel between a module and its host.

use std::fmt;

/// The raw value sitting in an [`ExceptionStore`].
#[derive(Debug)]
pub enum Exception {
    /// Stored by module code: UTF-8 text at `offset..offset + len` in linear
    /// memory. The module owns that region; the host only copies it.
    Guest { offset: u32, len: u32 },
    /// Stored by a host callback adapter when the callback failed.
    Host(anyhow::Error),
}

impl Exception {
    pub fn origin(&self) -> ExceptionOrigin {
        match self {
            Exception::Guest { .. } => ExceptionOrigin::Guest,
            Exception::Host(_) => ExceptionOrigin::Host,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ExceptionOrigin {
    Guest,
    Host,
}

impl fmt::Display for ExceptionOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExceptionOrigin::Guest => f.write_str("module"),
            ExceptionOrigin::Host => f.write_str("host callback"),
        }
    }
}

/// Holds at most one pending [`Exception`].
///
/// This is deliberately not a queue. Whoever observes a failed call must
/// [`take()`][ExceptionStore::take] the exception before issuing the next call
/// that could fail, otherwise a later failure may be attributed to stale data.
#[derive(Debug, Default)]
pub struct ExceptionStore {
    slot: Option<Exception>,
}

impl ExceptionStore {
    /// Record an exception.
    ///
    /// Storing while another exception is still pending breaks the contract.
    /// The previous value is dropped and the new one wins.
    pub fn store(&mut self, exception: Exception) {
        if let Some(previous) = self.slot.replace(exception) {
            tracing::warn!(
                previous.origin = %previous.origin(),
                "Overwriting an exception that was never read",
            );
        }
    }

    pub fn take(&mut self) -> Option<Exception> {
        self.slot.take()
    }

    pub fn peek(&self) -> Option<&Exception> {
        self.slot.as_ref()
    }

    pub fn is_pending(&self) -> bool {
        self.slot.is_some()
    }
}

/// A decoded exception, ready to be reported to the host's caller.
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct ModuleException {
    origin: ExceptionOrigin,
    message: String,
    payload: Vec<u8>,
    host: Option<anyhow::Error>,
}

impl ModuleException {
    pub(crate) fn from_guest(payload: Vec<u8>) -> Self {
        ModuleException {
            origin: ExceptionOrigin::Guest,
            message: String::from_utf8_lossy(&payload).into_owned(),
            payload,
            host: None,
        }
    }

    pub(crate) fn from_host(error: anyhow::Error) -> Self {
        ModuleException {
            origin: ExceptionOrigin::Host,
            message: format!("{error:#}"),
            payload: Vec::new(),
            host: Some(error),
        }
    }

    pub fn origin(&self) -> ExceptionOrigin {
        self.origin
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// The raw bytes copied out of linear memory, empty for host exceptions.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// The error returned by the host callback, if that's where this came from.
    pub fn host_error(&self) -> Option<&anyhow::Error> {
        self.host.as_ref()
    }
}
