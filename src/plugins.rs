//! Process-wide undeliverable-error sink.
//!
//! Errors that cannot reach a live observer end up here: a failure after the
//! consumer disposed, a second error of a fail-fast coordinator, a value pushed
//! after a terminal signal. The default handler logs through `tracing` and
//! returns; it never panics, since it runs on scheduler threads and inside
//! dispose paths. Install a panicking handler to crash on the first report.
//!
//! The handler is a test-only mutation point. Production code never relies on
//! it for control flow; see [`crate::testing::capture_undeliverable`] for the
//! scoped way to install one in tests.

use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::RwLock;

use crate::error::RxError;

type ErrorHandler = Arc<dyn Fn(RxError) + Send + Sync>;

static ERROR_HANDLER: Lazy<RwLock<Option<ErrorHandler>>> = Lazy::new(|| RwLock::new(None));

/// Replace the handler. It may be called from any thread.
pub fn set_error_handler<F>(handler: F)
where
  F: Fn(RxError) + Send + Sync + 'static,
{
  *ERROR_HANDLER.write() = Some(Arc::new(handler));
}

/// Restore the default handler.
pub fn reset() { *ERROR_HANDLER.write() = None; }

pub fn has_custom_handler() -> bool { ERROR_HANDLER.read().is_some() }

/// Report an error that has nowhere else to go.
///
/// Errors that already describe a bug (protocol violations, missing
/// backpressure, composites, unhandled errors) are reported as they are;
/// everything else is wrapped in [`RxError::Undeliverable`].
pub fn on_error(err: RxError) {
  let err = match err {
    RxError::Protocol(_)
    | RxError::Composite(_)
    | RxError::MissingBackpressure(_)
    | RxError::OnErrorNotImplemented(_)
    | RxError::Undeliverable(_) => err,
    other => RxError::Undeliverable(Box::new(other)),
  };
  // Clone out of the lock so a handler may replace itself.
  let handler = ERROR_HANDLER.read().clone();
  match handler {
    Some(handler) => handler(err),
    None => tracing::error!(error = %err, "undeliverable error"),
  }
}
