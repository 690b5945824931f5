use std::sync::{
  atomic::{AtomicBool, Ordering},
  Arc,
};

use crate::{
  disposable::{self, Disposable, DisposableRef, DisposableSlot},
  error::{ProtocolViolation, RxError},
  fusion::Upstream,
  observable::{Observable, ObservableSource},
  observer::{BoxedObserver, DownstreamSlot},
  plugins,
};

/// Build a source from a function that drives an [`Emitter`].
///
/// The function runs once per subscription. It should stop emitting once
/// [`Emitter::is_disposed`] reports true.
///
/// ```rust
/// use rxcore::prelude::*;
///
/// let source = observable::create(|emitter: Emitter<i32>| {
///   for i in 0..3 {
///     if emitter.is_disposed() {
///       return;
///     }
///     emitter.next(i);
///   }
///   emitter.complete();
/// });
/// source.test().assert_result(&[0, 1, 2]);
/// ```
pub fn create<T, F>(subscribe: F) -> Observable<T>
where
  T: Send + 'static,
  F: Fn(Emitter<T>) + Send + Sync + 'static,
{
  Observable::new(CreateSource(subscribe))
}

struct CreateSource<F>(F);

impl<T, F> ObservableSource<T> for CreateSource<F>
where
  T: Send + 'static,
  F: Fn(Emitter<T>) + Send + Sync,
{
  fn subscribe_actual(&self, mut observer: BoxedObserver<T>) {
    let state = Arc::new(EmitterState {
      downstream: DownstreamSlot::empty(),
      disposed: AtomicBool::new(false),
      terminated: AtomicBool::new(false),
      teardown: DisposableSlot::new(),
    });
    observer.on_subscribe(Upstream::Plain(state.clone()));
    if !state.disposed.load(Ordering::Acquire) {
      state.downstream.install(observer);
    }
    (self.0)(Emitter(state));
  }
}

/// The producer side of [`create`]. Cloneable, so it can be handed to other
/// threads or callbacks. Calls from several threads, or from inside the
/// consumer's own `next`, are delivered one at a time in arrival order.
pub struct Emitter<T>(Arc<EmitterState<T>>);

impl<T> Clone for Emitter<T> {
  fn clone(&self) -> Self { Emitter(self.0.clone()) }
}

struct EmitterState<T> {
  downstream: DownstreamSlot<T>,
  disposed: AtomicBool,
  terminated: AtomicBool,
  teardown: DisposableSlot,
}

impl<T: Send + 'static> Emitter<T> {
  pub fn next(&self, value: T) {
    let state = &*self.0;
    if state.disposed.load(Ordering::Acquire) {
      return;
    }
    if state.terminated.load(Ordering::Acquire) {
      plugins::on_error(ProtocolViolation::NextAfterTerminal.into());
      return;
    }
    state.downstream.next(value);
  }

  pub fn error(&self, err: RxError) {
    let state = &*self.0;
    if state.disposed.load(Ordering::Acquire) || state.terminated.swap(true, Ordering::AcqRel) {
      plugins::on_error(err);
      return;
    }
    state.downstream.error(err);
    state.teardown.dispose();
  }

  pub fn complete(&self) {
    let state = &*self.0;
    if state.disposed.load(Ordering::Acquire) {
      return;
    }
    if state.terminated.swap(true, Ordering::AcqRel) {
      plugins::on_error(ProtocolViolation::TerminalAfterTerminal.into());
      return;
    }
    state.downstream.complete();
    state.teardown.dispose();
  }

  /// True once the consumer disposed or a terminal signal was sent.
  pub fn is_disposed(&self) -> bool {
    self.0.disposed.load(Ordering::Acquire) || self.0.terminated.load(Ordering::Acquire)
  }

  /// Resource released on dispose or after the terminal signal. Replaces and
  /// releases the previous one.
  pub fn set_disposable(&self, resource: DisposableRef) { self.0.teardown.set(resource); }

  pub fn set_cancellable<F: FnOnce() + Send + 'static>(&self, cancel: F) {
    self.set_disposable(disposable::from_fn(cancel));
  }
}

impl<T: Send + 'static> Disposable for EmitterState<T> {
  fn dispose(&self) {
    if !self.disposed.swap(true, Ordering::AcqRel) {
      self.teardown.dispose();
      self.downstream.release();
    }
  }

  fn is_disposed(&self) -> bool { self.disposed.load(Ordering::Acquire) }
}
