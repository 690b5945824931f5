use std::sync::Arc;

use crate::{
  error::RxError,
  fusion::Upstream,
  observable::{Observable, ObservableSource},
  observer::{set_upstream_once, BoxedObserver, Observer},
};

impl<T: Clone + Send + 'static> Observable<T> {
  /// Run `action` with each value after the downstream received it. A failing
  /// action cancels the upstream and terminates the stream with its error.
  pub fn do_after_next<F>(&self, action: F) -> Observable<T>
  where
    F: Fn(&T) -> Result<(), RxError> + Send + Sync + 'static,
  {
    Observable::new(DoAfterNextOp { source: self.clone(), action: Arc::new(action) })
  }
}

struct DoAfterNextOp<T, F> {
  source: Observable<T>,
  action: Arc<F>,
}

impl<T, F> ObservableSource<T> for DoAfterNextOp<T, F>
where
  T: Clone + Send + 'static,
  F: Fn(&T) -> Result<(), RxError> + Send + Sync + 'static,
{
  fn subscribe_actual(&self, observer: BoxedObserver<T>) {
    self.source.subscribe_with(DoAfterNextObserver {
      observer: Some(observer),
      action: self.action.clone(),
      upstream: None,
    });
  }
}

struct DoAfterNextObserver<T, F> {
  observer: Option<BoxedObserver<T>>,
  action: Arc<F>,
  upstream: Option<Upstream<T>>,
}

impl<T, F> Observer<T> for DoAfterNextObserver<T, F>
where
  T: Clone + Send + 'static,
  F: Fn(&T) -> Result<(), RxError> + Send + Sync + 'static,
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
    observer.next(value.clone());
    if let Err(err) = (self.action)(&value) {
      if let Some(upstream) = &self.upstream {
        upstream.dispose();
      }
      if let Some(observer) = self.observer.take() {
        observer.error(err);
      }
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
  use parking_lot::Mutex;

  use super::*;
  use crate::observable;

  #[test]
  fn runs_after_downstream() {
    let log = Arc::new(Mutex::new(vec![]));
    let (a, b) = (log.clone(), log.clone());
    observable::just(1)
      .do_after_next(move |v| {
        a.lock().push(-v);
        Ok(())
      })
      .subscribe(move |v| b.lock().push(v));
    assert_eq!(*log.lock(), vec![1, -1]);
  }

  #[test]
  fn failing_action_terminates() {
    observable::from_iter(1..=3)
      .do_after_next(|v| if *v == 2 { Err("after two".into()) } else { Ok(()) })
      .test()
      .assert_failure("after two", &[1, 2]);
  }
}
