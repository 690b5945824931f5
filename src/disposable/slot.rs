use std::mem;

use parking_lot::Mutex;

use super::{Disposable, DisposableRef};
use crate::error::RxError;

enum SlotState {
  Empty,
  Holding(DisposableRef),
  Disposed,
}

/// A container for one upstream handle.
///
/// Once the slot is disposed, anything stored later is disposed on arrival,
/// which closes the race between a subscription completing its setup and a
/// concurrent cancel.
pub struct DisposableSlot(Mutex<SlotState>);

impl Default for DisposableSlot {
  fn default() -> Self { Self(Mutex::new(SlotState::Empty)) }
}

impl DisposableSlot {
  pub fn new() -> Self { Self::default() }

  /// Store the first handle and return `Ok(true)`.
  ///
  /// A slot that is already disposed disposes the handle and returns
  /// `Ok(false)`. A second handle is a multiple subscription: the slot
  /// disposes both and returns the violation, which the caller delivers to
  /// its downstream.
  pub fn set_once(&self, handle: DisposableRef) -> Result<bool, RxError> {
    let mut state = self.0.lock();
    match mem::replace(&mut *state, SlotState::Disposed) {
      SlotState::Empty => {
        *state = SlotState::Holding(handle);
        Ok(true)
      }
      SlotState::Disposed => {
        drop(state);
        handle.dispose();
        Ok(false)
      }
      SlotState::Holding(current) => {
        drop(state);
        handle.dispose();
        current.dispose();
        Err(RxError::multiple_subscription())
      }
    }
  }

  /// Store `handle`, disposing the previous one.
  pub fn set(&self, handle: DisposableRef) -> bool {
    match self.swap(handle) {
      Ok(Some(previous)) => {
        previous.dispose();
        true
      }
      Ok(None) => true,
      Err(handle) => {
        handle.dispose();
        false
      }
    }
  }

  /// Store `handle` and leave the previous one running.
  pub fn replace(&self, handle: DisposableRef) -> bool {
    match self.swap(handle) {
      Ok(_) => true,
      Err(handle) => {
        handle.dispose();
        false
      }
    }
  }

  pub fn get(&self) -> Option<DisposableRef> {
    match &*self.0.lock() {
      SlotState::Holding(handle) => Some(handle.clone()),
      _ => None,
    }
  }

  fn swap(&self, handle: DisposableRef) -> Result<Option<DisposableRef>, DisposableRef> {
    let mut state = self.0.lock();
    if let SlotState::Disposed = *state {
      return Err(handle);
    }
    match mem::replace(&mut *state, SlotState::Holding(handle)) {
      SlotState::Holding(previous) => Ok(Some(previous)),
      _ => Ok(None),
    }
  }
}

impl Disposable for DisposableSlot {
  fn dispose(&self) {
    let previous = mem::replace(&mut *self.0.lock(), SlotState::Disposed);
    if let SlotState::Holding(handle) = previous {
      handle.dispose();
    }
  }

  fn is_disposed(&self) -> bool { matches!(*self.0.lock(), SlotState::Disposed) }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{disposable::empty, error::ProtocolViolation};

  #[test]
  fn second_set_once_disposes_both() {
    let slot = DisposableSlot::new();
    let first = empty();
    let second = empty();
    assert!(matches!(slot.set_once(first.clone()), Ok(true)));
    let err = slot.set_once(second.clone()).unwrap_err();
    assert!(err.is_protocol_violation(ProtocolViolation::MultipleSubscription));
    assert!(first.is_disposed());
    assert!(second.is_disposed());
    assert!(slot.is_disposed());
  }

  #[test]
  fn set_after_dispose_disposes_newcomer() {
    let slot = DisposableSlot::new();
    let held = empty();
    slot.set(held.clone());
    slot.dispose();
    assert!(held.is_disposed());

    let late = empty();
    assert!(!slot.set(late.clone()));
    assert!(late.is_disposed());
    assert!(matches!(slot.set_once(empty()), Ok(false)));
  }

  #[test]
  fn set_disposes_previous_replace_does_not() {
    let slot = DisposableSlot::new();
    let a = empty();
    let b = empty();
    let c = empty();
    slot.set(a.clone());
    slot.set(b.clone());
    assert!(a.is_disposed());
    slot.replace(c.clone());
    assert!(!b.is_disposed());
    assert!(slot.get().is_some_and(|h| std::sync::Arc::ptr_eq(&h, &c)));
  }
}
