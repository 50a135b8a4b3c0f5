//! Shared error types

use thiserror::Error;

/// Marker for an operation that completed because stop was requested.
///
/// Cancellation is not a failure: senders observing the stop token resolve
/// with `Err(Cancelled)` instead of a value, and callers usually unwind their
/// loop in response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("operation cancelled")]
pub struct Cancelled;
