//! Flatten every value into the items of an iterator.
//!
//! Without fusion each upstream value is expanded on the spot, checking for
//! cancellation between items. A consumer may instead fuse in ASYNC mode: the
//! upstream values are parked in a queue and expanded lazily by `poll`. SYNC
//! fusion is never granted because an iterator may be left half-consumed when
//! the upstream completes.

use std::sync::{
  atomic::{AtomicBool, Ordering},
  Arc,
};

use parking_lot::Mutex;

use crate::{
  disposable::{Disposable, DisposableRef},
  error::RxError,
  fusion::{FusionMode, QueueSubscription, SpscQueue, Upstream},
  observable::{Observable, ObservableSource},
  observer::{BoxedObserver, Observer},
};

impl<T: Send + 'static> Observable<T> {
  /// Emit the items of the iterable every value is mapped to.
  ///
  /// ```rust
  /// use rxcore::prelude::*;
  ///
  /// observable::from_iter(vec![1, 3])
  ///   .flat_map_iter(|v| v..v + 2)
  ///   .test()
  ///   .assert_result(&[1, 2, 3, 4]);
  /// ```
  pub fn flat_map_iter<U, I, F>(&self, f: F) -> Observable<U>
  where
    U: Send + 'static,
    I: IntoIterator<Item = U> + 'static,
    I::IntoIter: Send + 'static,
    F: Fn(T) -> I + Send + Sync + 'static,
  {
    self.try_flat_map_iter(move |v| Ok(f(v)))
  }

  pub fn try_flat_map_iter<U, I, F>(&self, f: F) -> Observable<U>
  where
    U: Send + 'static,
    I: IntoIterator<Item = U> + 'static,
    I::IntoIter: Send + 'static,
    F: Fn(T) -> Result<I, RxError> + Send + Sync + 'static,
  {
    Observable::new(FlatMapIterOp { source: self.clone(), func: Arc::new(f) })
  }
}

struct FlatMapIterOp<T, F> {
  source: Observable<T>,
  func: Arc<F>,
}

impl<T, U, I, F> ObservableSource<U> for FlatMapIterOp<T, F>
where
  T: Send + 'static,
  U: Send + 'static,
  I: IntoIterator<Item = U> + 'static,
  I::IntoIter: Send + 'static,
  F: Fn(T) -> Result<I, RxError> + Send + Sync + 'static,
{
  fn subscribe_actual(&self, observer: BoxedObserver<U>) {
    self.source.subscribe_with(FlatMapIterObserver {
      observer: Some(observer),
      queue: Arc::new(FlattenQueue {
        values: SpscQueue::unbounded(),
        current: Mutex::new(None),
        func: self.func.clone(),
        upstream: Mutex::new(None),
        fused: AtomicBool::new(false),
        disposed: AtomicBool::new(false),
      }),
      subscribed: false,
    });
  }
}

struct FlatMapIterObserver<T, I: IntoIterator, F> {
  observer: Option<BoxedObserver<I::Item>>,
  queue: Arc<FlattenQueue<T, I::IntoIter, F>>,
  subscribed: bool,
}

impl<T, U, I, F> FlatMapIterObserver<T, I, F>
where
  T: Send + 'static,
  U: Send + 'static,
  I: IntoIterator<Item = U> + 'static,
  I::IntoIter: Send + 'static,
  F: Fn(T) -> Result<I, RxError> + Send + Sync + 'static,
{
  fn fail(&mut self, err: RxError) {
    self.queue.dispose();
    if let Some(observer) = self.observer.take() {
      observer.error(err);
    }
  }
}

impl<T, U, I, F> Observer<T> for FlatMapIterObserver<T, I, F>
where
  T: Send + 'static,
  U: Send + 'static,
  I: IntoIterator<Item = U> + 'static,
  I::IntoIter: Send + 'static,
  F: Fn(T) -> Result<I, RxError> + Send + Sync + 'static,
{
  fn on_subscribe(&mut self, upstream: Upstream<T>) {
    if self.subscribed {
      upstream.dispose();
      self.fail(RxError::multiple_subscription());
      return;
    }
    self.subscribed = true;
    *self.queue.upstream.lock() = Some(upstream.disposable());
    let queue: Arc<dyn QueueSubscription<U>> = self.queue.clone();
    if let Some(observer) = self.observer.as_mut() {
      observer.on_subscribe(Upstream::Fused(queue));
    }
  }

  fn next(&mut self, value: T) {
    if self.observer.is_none() || self.queue.is_disposed() {
      return;
    }
    if self.queue.fused.load(Ordering::Acquire) {
      self.queue.values.push(value);
      if let Some(observer) = self.observer.as_mut() {
        observer.ready();
      }
      return;
    }
    let items = match (self.queue.func)(value) {
      Ok(items) => items,
      Err(err) => return self.fail(err),
    };
    let mut items = items.into_iter();
    loop {
      if self.queue.is_disposed() {
        return;
      }
      let Some(item) = items.next() else { return };
      match self.observer.as_mut() {
        Some(observer) => observer.next(item),
        None => return,
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

/// Parked upstream values plus the iterator being drained.
struct FlattenQueue<T, It, F> {
  values: SpscQueue<T>,
  current: Mutex<Option<It>>,
  func: Arc<F>,
  upstream: Mutex<Option<DisposableRef>>,
  fused: AtomicBool,
  disposed: AtomicBool,
}

impl<T, U, I, It, F> QueueSubscription<U> for FlattenQueue<T, It, F>
where
  T: Send + 'static,
  U: Send + 'static,
  It: Iterator<Item = U> + Send + 'static,
  I: IntoIterator<Item = U, IntoIter = It> + 'static,
  F: Fn(T) -> Result<I, RxError> + Send + Sync + 'static,
{
  fn request_fusion(&self, mode: FusionMode) -> FusionMode {
    if mode.contains(FusionMode::ASYNC) && !mode.contains(FusionMode::BOUNDARY) {
      self.fused.store(true, Ordering::Release);
      FusionMode::ASYNC
    } else {
      FusionMode::NONE
    }
  }

  fn poll(&self) -> Result<Option<U>, RxError> {
    let mut current = self.current.lock();
    loop {
      if let Some(item) = current.as_mut().and_then(Iterator::next) {
        return Ok(Some(item));
      }
      *current = None;
      let Some(value) = self.values.poll() else { return Ok(None) };
      match (self.func)(value) {
        Ok(items) => *current = Some(items.into_iter()),
        Err(err) => {
          drop(current);
          self.dispose();
          return Err(err);
        }
      }
    }
  }

  fn is_empty(&self) -> bool {
    // An exhausted iterator still reads as non-empty until the next poll.
    self.values.is_empty() && self.current.lock().is_none()
  }

  fn clear(&self) {
    let current = self.current.lock().take();
    drop(current);
    self.values.clear();
  }
}

impl<T, It, F> Disposable for FlattenQueue<T, It, F>
where
  T: Send,
  It: Send,
  F: Send + Sync,
{
  fn dispose(&self) {
    if self.disposed.swap(true, Ordering::AcqRel) {
      return;
    }
    let upstream = self.upstream.lock().take();
    if let Some(upstream) = upstream {
      upstream.dispose();
    }
  }

  fn is_disposed(&self) -> bool { self.disposed.load(Ordering::Acquire) }
}

#[cfg(test)]
mod tests {
  use std::sync::atomic::AtomicUsize;

  use super::*;
  use crate::{
    observable,
    subject::PublishSubject,
    testing::{check_disposed, check_double_on_subscribe, TestObserver},
  };

  #[test]
  fn expands_each_value() {
    observable::from_iter(vec![1, 2, 3])
      .flat_map_iter(|v| vec![v; v])
      .test()
      .assert_result(&[1, 2, 2, 3, 3, 3]);
  }

  #[test]
  fn empty_iterables_are_skipped() {
    observable::from_iter(0..4)
      .flat_map_iter(|v| if v % 2 == 0 { vec![] } else { vec![v] })
      .test()
      .assert_result(&[1, 3]);
  }

  #[test]
  fn take_stops_the_iteration() {
    let produced = Arc::new(AtomicUsize::new(0));
    let p = produced.clone();
    observable::just(())
      .flat_map_iter(move |_| {
        let p = p.clone();
        (0..1000).inspect(move |_| {
          p.fetch_add(1, Ordering::SeqCst);
        })
      })
      .take(3)
      .test()
      .assert_result(&[0, 1, 2]);
    assert_eq!(produced.load(Ordering::SeqCst), 3);
  }

  #[test]
  fn async_fusion_is_granted() {
    let subject = PublishSubject::new();
    let to = TestObserver::with_fusion(FusionMode::ANY);
    subject.as_observable().flat_map_iter(|v: i32| vec![v, v * 10]).subscribe_with(to.clone());
    assert_eq!(to.fusion_mode(), FusionMode::ASYNC);
    subject.next(1);
    to.assert_values(&[1, 10]);
    subject.next(2);
    subject.complete();
    to.assert_result(&[1, 10, 2, 20]);
  }

  #[test]
  fn sync_and_boundary_fusion_are_refused() {
    let to = TestObserver::with_fusion(FusionMode::SYNC);
    observable::from_iter(vec![1]).flat_map_iter(|v| vec![v]).subscribe_with(to.clone());
    assert_eq!(to.fusion_mode(), FusionMode::NONE);
    to.assert_result(&[1]);

    let to = TestObserver::with_fusion(FusionMode::ANY | FusionMode::BOUNDARY);
    observable::from_iter(vec![1]).flat_map_iter(|v| vec![v]).subscribe_with(to.clone());
    assert_eq!(to.fusion_mode(), FusionMode::NONE);
  }

  #[test]
  fn mapper_error_cancels_upstream() {
    let subject = PublishSubject::new();
    let to = subject
      .as_observable()
      .try_flat_map_iter(|v: i32| if v < 0 { Err("negative".into()) } else { Ok(vec![v]) })
      .test();
    subject.next(1);
    subject.next(-1);
    to.assert_failure("negative", &[1]);
    assert!(!subject.has_observers());
  }

  #[test]
  fn fused_mapper_error_surfaces_from_poll() {
    let subject = PublishSubject::new();
    let to = TestObserver::with_fusion(FusionMode::ASYNC);
    subject
      .as_observable()
      .try_flat_map_iter(|v: i32| if v < 0 { Err("negative".into()) } else { Ok(vec![v]) })
      .subscribe_with(to.clone());
    subject.next(1);
    subject.next(-1);
    to.assert_failure("negative", &[1]);
    assert!(!subject.has_observers());
  }

  #[test]
  fn dispose_handle() { check_disposed(observable::never::<i32>().flat_map_iter(|v| vec![v])); }

  #[test]
  fn double_on_subscribe() {
    check_double_on_subscribe(|o: Observable<i32>| o.flat_map_iter(|v| vec![v]));
  }
}
