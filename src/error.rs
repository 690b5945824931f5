//! Error types carried through the terminal path of a stream.
//!
//! Every stream in this crate fails with an [`RxError`]. The type is cheap to
//! clone because a single failure may have to reach a downstream observer, be
//! folded into a [`RxError::Composite`] and be reported to the
//! [undeliverable sink](crate::plugins) at the same time.

use std::{error::Error as StdError, sync::Arc};

use parking_lot::Mutex;

/// Result alias used by fallible user functions (`try_map`, `from_action`,
/// `defer`, ...).
pub type RxResult<T> = Result<T, RxError>;

#[derive(Debug, Clone, thiserror::Error)]
pub enum RxError {
  /// A failure raised by user code or by a source.
  #[error("{0}")]
  Upstream(Arc<dyn StdError + Send + Sync>),

  /// A failure described by a plain message.
  #[error("{0}")]
  Message(Arc<str>),

  /// Several failures collected while errors were being delayed.
  #[error("{} errors occurred: {}", .0.len(), join_messages(.0))]
  Composite(Vec<RxError>),

  /// A failure that could not reach any live observer.
  #[error("undeliverable error: {0}")]
  Undeliverable(Box<RxError>),

  /// A broken emission contract.
  #[error(transparent)]
  Protocol(#[from] ProtocolViolation),

  /// A push producer outran a bounded consumer.
  #[error("missing backpressure: {0}")]
  MissingBackpressure(&'static str),

  /// A subscriber without an error callback received an error.
  #[error("error not handled by subscriber: {0}")]
  OnErrorNotImplemented(Box<RxError>),

  /// The scheduled task running on this thread was cancelled.
  #[error("task interrupted")]
  Interrupted,
}

/// Violations of the emission contract. They never panic; they are routed
/// either to the offending subscription or to the undeliverable sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolViolation {
  #[error("disposable already set: multiple subscription")]
  MultipleSubscription,
  #[error("value emitted after a terminal signal")]
  NextAfterTerminal,
  #[error("terminal signal emitted more than once")]
  TerminalAfterTerminal,
  #[error("queue is full")]
  QueueOverflow,
}

impl RxError {
  /// Wrap any error type.
  pub fn new<E: StdError + Send + Sync + 'static>(err: E) -> Self {
    RxError::Upstream(Arc::new(err))
  }

  pub fn message(msg: impl Into<Arc<str>>) -> Self { RxError::Message(msg.into()) }

  /// Fold a list of errors: one error stays itself, several become a
  /// composite.
  pub fn composite(mut errors: Vec<RxError>) -> Self {
    if errors.len() == 1 {
      if let Some(err) = errors.pop() {
        return err;
      }
    }
    RxError::Composite(errors)
  }

  /// The errors a composite holds, or the error itself.
  pub fn errors(&self) -> Vec<&RxError> {
    match self {
      RxError::Composite(errors) => errors.iter().collect(),
      other => vec![other],
    }
  }

  /// Strips `Undeliverable` and `OnErrorNotImplemented` wrappers.
  pub fn root(&self) -> &RxError {
    match self {
      RxError::Undeliverable(inner) | RxError::OnErrorNotImplemented(inner) => {
        inner.root()
      }
      other => other,
    }
  }

  pub fn is_protocol_violation(&self, violation: ProtocolViolation) -> bool {
    matches!(self.root(), RxError::Protocol(v) if *v == violation)
  }

  pub fn is_interrupted(&self) -> bool { matches!(self.root(), RxError::Interrupted) }

  /// A second `on_subscribe` arrived. Callers have disposed both upstreams
  /// and fail their downstream with the returned error.
  pub(crate) fn multiple_subscription() -> Self {
    tracing::warn!("on_subscribe called twice, the subscription is failed");
    ProtocolViolation::MultipleSubscription.into()
  }
}

impl From<&'static str> for RxError {
  fn from(msg: &'static str) -> Self { RxError::Message(Arc::from(msg)) }
}

impl From<String> for RxError {
  fn from(msg: String) -> Self { RxError::Message(Arc::from(msg)) }
}

fn join_messages(errors: &[RxError]) -> String {
  errors.iter().map(ToString::to_string).collect::<Vec<_>>().join("; ")
}

// ==================== Error accumulation ====================

/// Shared error state of a coordinator.
///
/// In fail-fast mode only the first error is kept and every later one is
/// handed back to the caller, who reports it as undeliverable. In delay-error
/// mode all errors are kept until `terminate` folds them into one.
#[derive(Default)]
pub(crate) struct ErrorCollector {
  state: Mutex<CollectorState>,
}

#[derive(Default)]
struct CollectorState {
  errors: Vec<RxError>,
  terminated: bool,
}

impl ErrorCollector {
  /// Record `err`. Returns it back when it was not accepted.
  pub(crate) fn add(&self, err: RxError, accumulate: bool) -> Result<(), RxError> {
    let mut state = self.state.lock();
    if state.terminated || (!accumulate && !state.errors.is_empty()) {
      return Err(err);
    }
    state.errors.push(err);
    Ok(())
  }

  pub(crate) fn has_error(&self) -> bool { !self.state.lock().errors.is_empty() }

  /// Seal the collector and take what it holds. Any later `add` is rejected.
  pub(crate) fn terminate(&self) -> Option<RxError> {
    let mut state = self.state.lock();
    state.terminated = true;
    let errors = std::mem::take(&mut state.errors);
    drop(state);
    if errors.is_empty() { None } else { Some(RxError::composite(errors)) }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[derive(Debug, thiserror::Error)]
  #[error("io failed: {0}")]
  struct IoLike(&'static str);

  #[test]
  fn wraps_foreign_errors() {
    let err = RxError::new(IoLike("disk"));
    assert_eq!(err.to_string(), "io failed: disk");
    let clone = err.clone();
    assert_eq!(clone.to_string(), err.to_string());
  }

  #[test]
  fn composite_of_one_is_the_error() {
    let err = RxError::composite(vec![RxError::message("only")]);
    assert!(matches!(err, RxError::Message(_)));
  }

  #[test]
  fn composite_lists_all_messages() {
    let err = RxError::composite(vec!["a".into(), "b".into()]);
    assert_eq!(err.to_string(), "2 errors occurred: a; b");
    assert_eq!(err.errors().len(), 2);
  }

  #[test]
  fn root_unwraps_wrappers() {
    let err = RxError::Undeliverable(Box::new(ProtocolViolation::NextAfterTerminal.into()));
    assert!(err.is_protocol_violation(ProtocolViolation::NextAfterTerminal));
    assert!(!err.is_interrupted());
  }

  #[test]
  fn fail_fast_collector_rejects_second_error() {
    let collector = ErrorCollector::default();
    assert!(collector.add("first".into(), false).is_ok());
    let rejected = collector.add("second".into(), false);
    assert_eq!(rejected.unwrap_err().to_string(), "second");
    assert_eq!(collector.terminate().unwrap().to_string(), "first");
  }

  #[test]
  fn delaying_collector_builds_composite() {
    let collector = ErrorCollector::default();
    collector.add("a".into(), true).unwrap();
    collector.add("b".into(), true).unwrap();
    assert!(collector.has_error());
    let err = collector.terminate().unwrap();
    assert_eq!(err.errors().len(), 2);
    assert!(collector.add("late".into(), true).is_err());
  }
}
