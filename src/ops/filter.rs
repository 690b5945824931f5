use std::sync::Arc;

use crate::{
  disposable::Disposable,
  error::RxError,
  fusion::{FusionMode, QueueSubscription, Upstream},
  observable::{Observable, ObservableSource},
  observer::{set_upstream_once, BoxedObserver, Observer},
};

impl<T: Send + 'static> Observable<T> {
  /// Only let through the values for which `predicate` holds.
  pub fn filter<F>(&self, predicate: F) -> Observable<T>
  where
    F: Fn(&T) -> bool + Send + Sync + 'static,
  {
    Observable::new(FilterOp { source: self.clone(), filter: Arc::new(predicate) })
  }
}

struct FilterOp<T, F> {
  source: Observable<T>,
  filter: Arc<F>,
}

impl<T, F> ObservableSource<T> for FilterOp<T, F>
where
  T: Send + 'static,
  F: Fn(&T) -> bool + Send + Sync + 'static,
{
  fn subscribe_actual(&self, observer: BoxedObserver<T>) {
    self.source.subscribe_with(FilterObserver {
      observer: Some(observer),
      filter: self.filter.clone(),
      upstream: None,
    });
  }
}

struct FilterObserver<T, F> {
  observer: Option<BoxedObserver<T>>,
  filter: Arc<F>,
  upstream: Option<Upstream<T>>,
}

impl<T, F> Observer<T> for FilterObserver<T, F>
where
  T: Send + 'static,
  F: Fn(&T) -> bool + Send + Sync + 'static,
{
  fn on_subscribe(&mut self, upstream: Upstream<T>) {
    if !set_upstream_once(&mut self.upstream, upstream.clone(), &mut self.observer) {
      return;
    }
    let upstream = match upstream {
      Upstream::Fused(queue) => {
        Upstream::Fused(Arc::new(FilterQueue { queue, filter: self.filter.clone() }))
      }
      plain => plain,
    };
    if let Some(observer) = self.observer.as_mut() {
      observer.on_subscribe(upstream);
    }
  }

  fn next(&mut self, value: T) {
    let Some(observer) = self.observer.as_mut() else { return };
    if (self.filter)(&value) {
      observer.next(value);
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

  fn ready(&mut self) {
    if let Some(observer) = self.observer.as_mut() {
      observer.ready();
    }
  }
}

struct FilterQueue<T, F> {
  queue: Arc<dyn QueueSubscription<T>>,
  filter: Arc<F>,
}

impl<T, F> QueueSubscription<T> for FilterQueue<T, F>
where
  T: 'static,
  F: Fn(&T) -> bool + Send + Sync,
{
  fn request_fusion(&self, mode: FusionMode) -> FusionMode {
    if mode.contains(FusionMode::BOUNDARY) {
      FusionMode::NONE
    } else {
      self.queue.request_fusion(mode)
    }
  }

  fn poll(&self) -> Result<Option<T>, RxError> {
    loop {
      match self.queue.poll()? {
        Some(value) if (self.filter)(&value) => return Ok(Some(value)),
        Some(_) => {}
        None => return Ok(None),
      }
    }
  }

  fn is_empty(&self) -> bool { self.queue.is_empty() }

  fn clear(&self) { self.queue.clear() }
}

impl<T: 'static, F: Send + Sync> Disposable for FilterQueue<T, F> {
  fn dispose(&self) { self.queue.dispose() }

  fn is_disposed(&self) -> bool { self.queue.is_disposed() }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{
    observable,
    testing::{check_double_on_subscribe, TestObserver},
  };

  #[test]
  fn keeps_matching_values() {
    observable::from_iter(0..10).filter(|v| v % 3 == 0).test().assert_result(&[0, 3, 6, 9]);
  }

  #[test]
  fn fused_poll_skips_rejected() {
    let to = TestObserver::with_fusion(FusionMode::SYNC);
    observable::from_iter(0..6).filter(|v| v % 2 == 1).subscribe_with(to.clone());
    assert_eq!(to.fusion_mode(), FusionMode::SYNC);
    to.assert_result(&[1, 3, 5]);
  }

  #[test]
  fn nothing_matches() { observable::from_iter(0..3).filter(|_| false).test().assert_result(&[]); }

  #[test]
  fn double_on_subscribe() { check_double_on_subscribe(|o: Observable<i32>| o.filter(|v| *v > 0)); }
}
