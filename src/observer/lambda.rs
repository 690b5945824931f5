use std::sync::{
  atomic::{AtomicBool, Ordering},
  Arc,
};

use super::Observer;
use crate::{
  disposable::{Disposable, DisposableSlot},
  error::RxError,
  fusion::Upstream,
  plugins,
};

pub(crate) type NextFn<T> = Box<dyn FnMut(T) + Send>;
pub(crate) type ErrorFn = Box<dyn FnOnce(RxError) + Send>;
pub(crate) type CompleteFn = Box<dyn FnOnce() + Send>;

/// Observer built from closures, returned by `Observable::subscribe`.
pub(crate) struct LambdaObserver<T> {
  on_next: NextFn<T>,
  on_error: Option<ErrorFn>,
  on_complete: Option<CompleteFn>,
  handle: Arc<LambdaHandle>,
}

/// The handle the caller keeps to cancel a lambda subscription. It reports
/// disposed once the stream terminated.
#[derive(Default)]
pub(crate) struct LambdaHandle {
  upstream: DisposableSlot,
  terminated: AtomicBool,
}

impl Disposable for LambdaHandle {
  fn dispose(&self) { self.upstream.dispose() }

  fn is_disposed(&self) -> bool {
    self.terminated.load(Ordering::Acquire) || self.upstream.is_disposed()
  }
}

impl<T> LambdaObserver<T> {
  pub(crate) fn new(
    on_next: NextFn<T>,
    on_error: Option<ErrorFn>,
    on_complete: Option<CompleteFn>,
  ) -> Self {
    Self { on_next, on_error, on_complete, handle: Arc::new(LambdaHandle::default()) }
  }

  pub(crate) fn handle(&self) -> Arc<LambdaHandle> { self.handle.clone() }
}

impl<T: Send + 'static> Observer<T> for LambdaObserver<T> {
  fn on_subscribe(&mut self, upstream: Upstream<T>) {
    if let Err(err) = self.handle.upstream.set_once(upstream.disposable()) {
      self.handle.terminated.store(true, Ordering::Release);
      match self.on_error.take() {
        Some(on_error) => on_error(err),
        None => plugins::on_error(RxError::OnErrorNotImplemented(Box::new(err))),
      }
    }
  }

  fn next(&mut self, value: T) {
    if !self.handle.is_disposed() {
      (self.on_next)(value);
    }
  }

  fn error(self: Box<Self>, err: RxError) {
    let this = *self;
    if this.handle.is_disposed() {
      plugins::on_error(err);
      return;
    }
    this.handle.terminated.store(true, Ordering::Release);
    match this.on_error {
      Some(on_error) => on_error(err),
      None => plugins::on_error(RxError::OnErrorNotImplemented(Box::new(err))),
    }
  }

  fn complete(self: Box<Self>) {
    let this = *self;
    if this.handle.is_disposed() {
      return;
    }
    this.handle.terminated.store(true, Ordering::Release);
    if let Some(on_complete) = this.on_complete {
      on_complete();
    }
  }
}
