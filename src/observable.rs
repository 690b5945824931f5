//! Sources.
//!
//! An [`Observable`] is a cheap, cloneable template. Every `subscribe` starts
//! an independent execution of the chain it describes. Operators are inherent
//! methods defined next to their implementation under [`crate::ops`].

use std::sync::Arc;

use crate::{
  disposable::DisposableRef,
  error::RxError,
  observer::{BoxedObserver, LambdaObserver, Observer},
  testing::TestObserver,
};

mod create;
mod from_iter;
mod timer;

pub use create::{create, Emitter};
pub use from_iter::{defer, empty, error, from_action, from_iter, just, never};
pub use timer::timer;

/// Something that can be subscribed to.
pub trait ObservableSource<T>: Send + Sync {
  fn subscribe_actual(&self, observer: BoxedObserver<T>);
}

pub struct Observable<T>(Arc<dyn ObservableSource<T>>);

impl<T> Clone for Observable<T> {
  fn clone(&self) -> Self { Observable(self.0.clone()) }
}

impl<T: Send + 'static> Observable<T> {
  pub fn new<S: ObservableSource<T> + 'static>(source: S) -> Self { Observable(Arc::new(source)) }

  pub fn subscribe_with<O: Observer<T> + 'static>(&self, observer: O) {
    self.0.subscribe_actual(Box::new(observer))
  }

  pub fn subscribe_boxed(&self, observer: BoxedObserver<T>) { self.0.subscribe_actual(observer) }

  /// Subscribe with a value callback. Errors go to the undeliverable sink.
  pub fn subscribe<N>(&self, on_next: N) -> DisposableRef
  where
    N: FnMut(T) + Send + 'static,
  {
    self.subscribe_observer(LambdaObserver::new(Box::new(on_next), None, None))
  }

  pub fn subscribe_all<N, E, C>(&self, on_next: N, on_error: E, on_complete: C) -> DisposableRef
  where
    N: FnMut(T) + Send + 'static,
    E: FnOnce(RxError) + Send + 'static,
    C: FnOnce() + Send + 'static,
  {
    self.subscribe_observer(LambdaObserver::new(
      Box::new(on_next),
      Some(Box::new(on_error)),
      Some(Box::new(on_complete)),
    ))
  }

  /// Subscribe a fresh [`TestObserver`] and return it.
  pub fn test(&self) -> TestObserver<T> {
    let observer = TestObserver::new();
    self.subscribe_with(observer.clone());
    observer
  }

  fn subscribe_observer(&self, observer: LambdaObserver<T>) -> DisposableRef {
    let handle = observer.handle();
    self.subscribe_with(observer);
    handle
  }
}
