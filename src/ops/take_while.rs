use crate::{
  error::RxError,
  fusion::Upstream,
  observable::{Observable, ObservableSource},
  observer::{set_upstream_once, BoxedObserver, Observer},
};
use std::sync::Arc;

impl<T: Send + 'static> Observable<T> {
  /// Emit values while `predicate` holds. The first failing value is dropped,
  /// the upstream cancelled and the stream completed.
  pub fn take_while<F>(&self, predicate: F) -> Observable<T>
  where
    F: Fn(&T) -> bool + Send + Sync + 'static,
  {
    Observable::new(TakeWhileOp { source: self.clone(), predicate: Arc::new(predicate) })
  }
}

struct TakeWhileOp<T, F> {
  source: Observable<T>,
  predicate: Arc<F>,
}

impl<T, F> ObservableSource<T> for TakeWhileOp<T, F>
where
  T: Send + 'static,
  F: Fn(&T) -> bool + Send + Sync + 'static,
{
  fn subscribe_actual(&self, observer: BoxedObserver<T>) {
    self.source.subscribe_with(TakeWhileObserver {
      observer: Some(observer),
      predicate: self.predicate.clone(),
      upstream: None,
    });
  }
}

struct TakeWhileObserver<T, F> {
  observer: Option<BoxedObserver<T>>,
  predicate: Arc<F>,
  upstream: Option<Upstream<T>>,
}

impl<T, F> Observer<T> for TakeWhileObserver<T, F>
where
  T: Send + 'static,
  F: Fn(&T) -> bool + Send + Sync + 'static,
{
  fn on_subscribe(&mut self, upstream: Upstream<T>) {
    if set_upstream_once(&mut self.upstream, upstream.clone(), &mut self.observer) {
      if let Some(observer) = self.observer.as_mut() {
        observer.on_subscribe(upstream.into_plain());
      }
    }
  }

  fn next(&mut self, value: T) {
    let Some(observer) = self.observer.as_mut() else { return };
    if (self.predicate)(&value) {
      observer.next(value);
      return;
    }
    if let Some(upstream) = &self.upstream {
      upstream.dispose();
    }
    if let Some(observer) = self.observer.take() {
      observer.complete();
    }
  }

  fn error(self: Box<Self>, err: RxError) {
    if let Some(observer) = self.observer {
      observer.error(err);
    }
  }

  fn complete(self: Box<Self>) {
    if let Some(observer) = self.observer {
      observer.complete();
    }
  }
}

#[cfg(test)]
mod tests {
  use crate::observable;

  #[test]
  fn stops_at_first_failure() {
    observable::from_iter(vec![1, 2, 5, 1]).take_while(|v| *v < 3).test().assert_result(&[1, 2]);
  }

  #[test]
  fn all_pass() { observable::from_iter(0..3).take_while(|_| true).test().assert_result(&[0, 1, 2]); }
}
