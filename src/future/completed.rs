//! Result wrapper for operations that finished synchronously.

use crate::error::{Error, Result};

use parking_lot::Mutex;

/// An already-resolved operation result.
///
/// Produced when the synchronous attempt completed the I/O on the calling
/// thread, and for validation failures that are surfaced as an immediately
/// failed future. If a completion handler was supplied the outcome has
/// already been handed to it and [`take`](Self::take) reports that instead.
pub struct CompletedResult<T> {
    outcome: Mutex<Option<Result<T>>>,
}

impl<T> CompletedResult<T> {
    pub(crate) fn with_result(value: T) -> Self {
        Self {
            outcome: Mutex::new(Some(Ok(value))),
        }
    }

    pub(crate) fn with_failure(error: Error) -> Self {
        Self {
            outcome: Mutex::new(Some(Err(error))),
        }
    }

    /// A completed result whose outcome was consumed by the handler.
    pub(crate) fn consumed() -> Self {
        Self {
            outcome: Mutex::new(None),
        }
    }

    /// Takes the outcome out of the result.
    pub(crate) fn take(&self) -> Result<T> {
        match self.outcome.lock().take() {
            Some(outcome) => outcome,
            None => Err(Error::InvalidInput(
                "result was already taken or delivered to the completion handler",
            )),
        }
    }
}
