use std::sync::Arc;

use crate::{
  disposable::Disposable,
  error::RxError,
  fusion::{FusionMode, QueueSubscription, Upstream},
  observable::{Observable, ObservableSource},
  observer::{set_upstream_once, BoxedObserver, Observer},
};

impl<T: Send + 'static> Observable<T> {
  /// Transform every value with `f`.
  ///
  /// ```rust
  /// use rxcore::prelude::*;
  ///
  /// observable::from_iter(1..=3).map(|v| v * 2).test().assert_result(&[2, 4, 6]);
  /// ```
  pub fn map<U, F>(&self, f: F) -> Observable<U>
  where
    U: Send + 'static,
    F: Fn(T) -> U + Send + Sync + 'static,
  {
    self.try_map(move |v| Ok(f(v)))
  }

  /// Like [`map`](Observable::map), but a failing `f` cancels the upstream
  /// and terminates the stream with its error.
  pub fn try_map<U, F>(&self, f: F) -> Observable<U>
  where
    U: Send + 'static,
    F: Fn(T) -> Result<U, RxError> + Send + Sync + 'static,
  {
    Observable::new(MapOp { source: self.clone(), func: Arc::new(f) })
  }
}

struct MapOp<T, F> {
  source: Observable<T>,
  func: Arc<F>,
}

impl<T, U, F> ObservableSource<U> for MapOp<T, F>
where
  T: Send + 'static,
  U: Send + 'static,
  F: Fn(T) -> Result<U, RxError> + Send + Sync + 'static,
{
  fn subscribe_actual(&self, observer: BoxedObserver<U>) {
    self.source.subscribe_with(MapObserver {
      observer: Some(observer),
      func: self.func.clone(),
      upstream: None,
    });
  }
}

struct MapObserver<T, U, F> {
  observer: Option<BoxedObserver<U>>,
  func: Arc<F>,
  upstream: Option<Upstream<T>>,
}

impl<T, U, F> Observer<T> for MapObserver<T, U, F>
where
  T: Send + 'static,
  U: Send + 'static,
  F: Fn(T) -> Result<U, RxError> + Send + Sync + 'static,
{
  fn on_subscribe(&mut self, upstream: Upstream<T>) {
    if !set_upstream_once(&mut self.upstream, upstream.clone(), &mut self.observer) {
      return;
    }
    let upstream = match upstream {
      Upstream::Fused(queue) => Upstream::Fused(Arc::new(MapQueue { queue, func: self.func.clone() })),
      Upstream::Plain(d) => Upstream::Plain(d),
    };
    if let Some(observer) = self.observer.as_mut() {
      observer.on_subscribe(upstream);
    }
  }

  fn next(&mut self, value: T) {
    let Some(observer) = self.observer.as_mut() else { return };
    match (self.func)(value) {
      Ok(mapped) => observer.next(mapped),
      Err(err) => {
        if let Some(upstream) = &self.upstream {
          upstream.dispose();
        }
        if let Some(observer) = self.observer.take() {
          observer.error(err);
        }
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

  fn ready(&mut self) {
    if let Some(observer) = self.observer.as_mut() {
      observer.ready();
    }
  }
}

/// The upstream queue seen through the mapper.
struct MapQueue<T, F> {
  queue: Arc<dyn QueueSubscription<T>>,
  func: Arc<F>,
}

impl<T, U, F> QueueSubscription<U> for MapQueue<T, F>
where
  T: 'static,
  F: Fn(T) -> Result<U, RxError> + Send + Sync,
{
  fn request_fusion(&self, mode: FusionMode) -> FusionMode {
    // The mapper must run where the value was produced.
    if mode.contains(FusionMode::BOUNDARY) {
      FusionMode::NONE
    } else {
      self.queue.request_fusion(mode)
    }
  }

  fn poll(&self) -> Result<Option<U>, RxError> {
    match self.queue.poll()? {
      Some(value) => (self.func)(value).map(Some),
      None => Ok(None),
    }
  }

  fn is_empty(&self) -> bool { self.queue.is_empty() }

  fn clear(&self) { self.queue.clear() }
}

impl<T: 'static, F: Send + Sync> Disposable for MapQueue<T, F> {
  fn dispose(&self) { self.queue.dispose() }

  fn is_disposed(&self) -> bool { self.queue.is_disposed() }
}

#[cfg(test)]
mod tests {
  use std::sync::atomic::{AtomicUsize, Ordering};

  use super::*;
  use crate::{
    observable::{self, Emitter},
    testing::{check_double_on_subscribe, TestObserver},
  };

  #[test]
  fn maps_values() { observable::from_iter(vec![1, 2, 3]).map(|v| v + 1).test().assert_result(&[2, 3, 4]); }

  #[test]
  fn mapper_error_cancels_upstream() {
    let emitted = Arc::new(AtomicUsize::new(0));
    let e = emitted.clone();
    observable::from_iter(1..=5)
      .map(move |v| {
        e.fetch_add(1, Ordering::SeqCst);
        v
      })
      .try_map(|v| if v == 2 { Err("two".into()) } else { Ok(v) })
      .test()
      .assert_failure("two", &[1]);
    assert_eq!(emitted.load(Ordering::SeqCst), 2);
  }

  #[test]
  fn sync_fusion_passes_through() {
    let to = TestObserver::with_fusion(FusionMode::ANY);
    observable::from_iter(vec![1, 2]).map(|v| v * 10).subscribe_with(to.clone());
    assert_eq!(to.fusion_mode(), FusionMode::SYNC);
    to.assert_result(&[10, 20]);
  }

  #[test]
  fn boundary_fusion_is_refused() {
    let to = TestObserver::with_fusion(FusionMode::ANY | FusionMode::BOUNDARY);
    observable::from_iter(vec![1, 2]).map(|v| v * 10).subscribe_with(to.clone());
    assert_eq!(to.fusion_mode(), FusionMode::NONE);
    to.assert_result(&[10, 20]);
  }

  #[test]
  fn fused_mapper_error_surfaces_from_poll() {
    let to = TestObserver::with_fusion(FusionMode::SYNC);
    observable::from_iter(vec![1, 2, 3])
      .try_map(|v| if v == 3 { Err("three".into()) } else { Ok(v) })
      .subscribe_with(to.clone());
    to.assert_failure("three", &[1, 2]);
  }

  #[test]
  fn error_passes_through() {
    observable::create(|e: Emitter<i32>| {
      e.next(1);
      e.error("upstream".into());
    })
    .map(|v| v * 2)
    .test()
    .assert_failure("upstream", &[2]);
  }

  #[test]
  fn double_on_subscribe() { check_double_on_subscribe(|o: Observable<i32>| o.map(|v| v)); }
}
