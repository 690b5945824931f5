//! Cancellation handles.
//!
//! A [`Disposable`] moves from active to disposed exactly once. Disposing is
//! idempotent and may happen from any thread; the first caller performs the
//! release, later callers are no-ops.
//!
//! Containers built on top of it:
//!
//! - [`DisposableSlot`]: holds at most one upstream handle (single or serial).
//! - [`CompositeDisposable`]: a set of handles disposed together.
//! - [`DisposeGuard`]: disposes its handle when dropped.

use std::sync::{
  atomic::{AtomicBool, Ordering},
  Arc,
};

use parking_lot::Mutex;

mod composite;
mod registry;
mod slot;

pub use composite::CompositeDisposable;
pub use registry::Registry;
pub use slot::DisposableSlot;

pub trait Disposable: Send + Sync {
  /// Cancel the associated work and release its resources.
  fn dispose(&self);

  fn is_disposed(&self) -> bool;
}

pub type DisposableRef = Arc<dyn Disposable>;

impl<D: Disposable + ?Sized> Disposable for Arc<D> {
  #[inline]
  fn dispose(&self) { (**self).dispose() }
  #[inline]
  fn is_disposed(&self) -> bool { (**self).is_disposed() }
}

impl<D: Disposable + ?Sized> Disposable for Box<D> {
  #[inline]
  fn dispose(&self) { (**self).dispose() }
  #[inline]
  fn is_disposed(&self) -> bool { (**self).is_disposed() }
}

/// A flag with no attached resource.
#[derive(Debug, Default)]
pub struct BooleanDisposable(AtomicBool);

impl BooleanDisposable {
  pub fn new() -> Self { Self::default() }
}

impl Disposable for BooleanDisposable {
  fn dispose(&self) { self.0.store(true, Ordering::Release); }

  fn is_disposed(&self) -> bool { self.0.load(Ordering::Acquire) }
}

/// Runs a closure on the first dispose.
pub struct ActionDisposable {
  action: Mutex<Option<Box<dyn FnOnce() + Send>>>,
  disposed: AtomicBool,
}

impl ActionDisposable {
  pub fn new<F: FnOnce() + Send + 'static>(action: F) -> Self {
    Self { action: Mutex::new(Some(Box::new(action))), disposed: AtomicBool::new(false) }
  }
}

impl Disposable for ActionDisposable {
  fn dispose(&self) {
    if !self.disposed.swap(true, Ordering::AcqRel) {
      let action = self.action.lock().take();
      if let Some(action) = action {
        action();
      }
    }
  }

  fn is_disposed(&self) -> bool { self.disposed.load(Ordering::Acquire) }
}

/// A fresh, active handle with nothing attached.
pub fn empty() -> DisposableRef { Arc::new(BooleanDisposable::new()) }

/// A handle that is already disposed.
pub fn disposed() -> DisposableRef {
  let d = BooleanDisposable::new();
  d.dispose();
  Arc::new(d)
}

/// A handle running `action` once when disposed.
pub fn from_fn<F: FnOnce() + Send + 'static>(action: F) -> DisposableRef {
  Arc::new(ActionDisposable::new(action))
}

// ==================== RAII ====================

/// Disposes the wrapped handle when dropped.
///
/// ```rust
/// use rxcore::prelude::*;
///
/// let handle = disposable::empty();
/// {
///   let _guard = handle.clone().dispose_when_dropped();
/// }
/// assert!(handle.is_disposed());
/// ```
#[must_use = "the handle is disposed as soon as the guard is dropped"]
pub struct DisposeGuard(Option<DisposableRef>);

impl DisposeGuard {
  pub fn new(handle: DisposableRef) -> Self { Self(Some(handle)) }

  /// Give the handle back without disposing it.
  pub fn release(mut self) -> Option<DisposableRef> { self.0.take() }
}

impl Drop for DisposeGuard {
  fn drop(&mut self) {
    if let Some(handle) = self.0.take() {
      handle.dispose();
    }
  }
}

pub trait DisposableExt {
  fn dispose_when_dropped(self) -> DisposeGuard;
}

impl DisposableExt for DisposableRef {
  fn dispose_when_dropped(self) -> DisposeGuard { DisposeGuard::new(self) }
}

#[cfg(test)]
mod tests {
  use std::sync::atomic::AtomicUsize;

  use super::*;

  #[test]
  fn action_runs_once() {
    let hits = Arc::new(AtomicUsize::new(0));
    let c = hits.clone();
    let d = from_fn(move || {
      c.fetch_add(1, Ordering::SeqCst);
    });
    assert!(!d.is_disposed());
    d.dispose();
    d.dispose();
    assert!(d.is_disposed());
    assert_eq!(hits.load(Ordering::SeqCst), 1);
  }

  #[test]
  fn concurrent_dispose_runs_action_once() {
    let hits = Arc::new(AtomicUsize::new(0));
    let c = hits.clone();
    let d = from_fn(move || {
      c.fetch_add(1, Ordering::SeqCst);
    });
    let threads: Vec<_> = (0..8)
      .map(|_| {
        let d = d.clone();
        std::thread::spawn(move || d.dispose())
      })
      .collect();
    threads.into_iter().for_each(|t| t.join().unwrap());
    assert_eq!(hits.load(Ordering::SeqCst), 1);
  }

  #[test]
  fn factories() {
    assert!(disposed().is_disposed());
    assert!(!empty().is_disposed());
  }

  #[test]
  fn guard_disposes_on_drop() {
    let handle = empty();
    drop(handle.clone().dispose_when_dropped());
    assert!(handle.is_disposed());

    let other = empty();
    let kept = other.clone().dispose_when_dropped().release();
    assert!(kept.is_some());
    assert!(!other.is_disposed());
  }
}
