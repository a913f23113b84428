//! Explicit callback delivery.
//!
//! Collaborators never push events on their own. They queue them, and the
//! host process periodically calls [`run_callbacks`], which drains every
//! [`CallbackSource`] into a single [`EventSink`]. This keeps the callback
//! context explicit and separate from the poll loop.

use crate::transport::StatusChange;
use crate::validation::ValidationResult;

/// Receiver of asynchronous collaborator events.
pub trait EventSink {
    /// A transport connection changed state.
    fn on_status_changed(&self, change: StatusChange);

    /// A ticket validation finished.
    fn on_validation_result(&self, result: ValidationResult);
}

/// A collaborator with queued events to deliver.
pub trait CallbackSource {
    /// Deliver every queued event to `sink`, returning how many were delivered.
    ///
    /// Implementations must not hold internal locks while calling into the
    /// sink, since the sink may call straight back into the source.
    fn pump(&self, sink: &dyn EventSink) -> usize;
}

/// Pump each source once, in order. Returns the total number of events.
pub fn run_callbacks(sources: &[&dyn CallbackSource], sink: &dyn EventSink) -> usize {
    sources.iter().map(|source| source.pump(sink)).sum()
}
