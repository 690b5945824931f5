//! Subscribe to the inner sources one after another.
//!
//! Outer values wait in a queue, or in the outer source itself when it grants
//! fusion, until the current inner source completes. The drain lane polls the
//! next value, maps it and subscribes; a synchronously completing inner only
//! raises `wip`, so long chains of such inners do not recurse.

use std::sync::{
  atomic::{AtomicBool, AtomicUsize, Ordering},
  Arc,
};

use parking_lot::Mutex;

use super::flat_map::ErrorMode;
use crate::{
  disposable::{Disposable, DisposableSlot},
  error::{ErrorCollector, ProtocolViolation, RxError},
  fusion::{FusedQueue, FusionMode, SpscQueue, Upstream},
  observable::{Observable, ObservableSource},
  observer::{BoxedObserver, DownstreamSlot, Observer},
  plugins,
};

/// Options of [`Observable::concat_map_with`].
#[derive(Clone, Debug, Default)]
pub struct ConcatMapConfig {
  pub error_mode: ErrorMode,
  /// Outer values that may wait for their turn. `None` is unbounded.
  pub capacity: Option<usize>,
}

impl ConcatMapConfig {
  pub fn new() -> Self { Self::default() }

  pub fn error_mode(mut self, mode: ErrorMode) -> Self {
    self.error_mode = mode;
    self
  }

  /// Bound the outer queue. An overflow cancels the outer source and fails
  /// with [`RxError::MissingBackpressure`]. Clamped to at least one.
  pub fn capacity(mut self, capacity: usize) -> Self {
    self.capacity = Some(capacity.max(1));
    self
  }
}

impl<T: Send + 'static> Observable<T> {
  /// Map every value to an inner source and emit the inner sources in order,
  /// one at a time.
  ///
  /// ```rust
  /// use rxcore::prelude::*;
  ///
  /// observable::from_iter(1..=3)
  ///   .concat_map(|v| observable::from_iter(vec![v; v as usize]))
  ///   .test()
  ///   .assert_result(&[1, 2, 2, 3, 3, 3]);
  /// ```
  pub fn concat_map<U, F>(&self, f: F) -> Observable<U>
  where
    U: Send + 'static,
    F: Fn(T) -> Observable<U> + Send + Sync + 'static,
  {
    self.concat_map_with(ConcatMapConfig::default(), f)
  }

  pub fn concat_map_with<U, F>(&self, config: ConcatMapConfig, f: F) -> Observable<U>
  where
    U: Send + 'static,
    F: Fn(T) -> Observable<U> + Send + Sync + 'static,
  {
    self.try_concat_map_with(config, move |v| Ok(f(v)))
  }

  /// A failing mapper cancels everything and terminates the stream, whatever
  /// the error mode.
  pub fn try_concat_map_with<U, F>(&self, config: ConcatMapConfig, f: F) -> Observable<U>
  where
    U: Send + 'static,
    F: Fn(T) -> Result<Observable<U>, RxError> + Send + Sync + 'static,
  {
    Observable::new(ConcatMapOp { source: self.clone(), func: Arc::new(f), config })
  }
}

struct ConcatMapOp<T, F> {
  source: Observable<T>,
  func: Arc<F>,
  config: ConcatMapConfig,
}

impl<T, U, F> ObservableSource<U> for ConcatMapOp<T, F>
where
  T: Send + 'static,
  U: Send + 'static,
  F: Fn(T) -> Result<Observable<U>, RxError> + Send + Sync + 'static,
{
  fn subscribe_actual(&self, mut observer: BoxedObserver<U>) {
    let state = Arc::new(ConcatState {
      downstream: DownstreamSlot::empty(),
      upstream: DisposableSlot::new(),
      inner: DisposableSlot::new(),
      queue: Mutex::new(None),
      func: self.func.clone(),
      config: self.config.clone(),
      errors: ErrorCollector::default(),
      active: AtomicBool::new(false),
      done: AtomicBool::new(false),
      outer_failed: AtomicBool::new(false),
      cancelled: AtomicBool::new(false),
      fail_fast: AtomicBool::new(false),
      wip: AtomicUsize::new(0),
    });
    observer.on_subscribe(Upstream::Plain(state.clone()));
    if state.is_disposed() {
      return;
    }
    state.downstream.install(observer);
    self.source.subscribe_with(ConcatOuter { state });
  }
}

struct ConcatState<T, U, F> {
  downstream: DownstreamSlot<U>,
  upstream: DisposableSlot,
  inner: DisposableSlot,
  queue: Mutex<Option<FusedQueue<T>>>,
  func: Arc<F>,
  config: ConcatMapConfig,
  errors: ErrorCollector,
  /// An inner source is running.
  active: AtomicBool,
  done: AtomicBool,
  /// A Boundary outer error waits for the current inner.
  outer_failed: AtomicBool,
  cancelled: AtomicBool,
  fail_fast: AtomicBool,
  wip: AtomicUsize,
}

impl<T, U, F> ConcatState<T, U, F>
where
  T: Send + 'static,
  U: Send + 'static,
  F: Fn(T) -> Result<Observable<U>, RxError> + Send + Sync + 'static,
{
  fn drain(self: &Arc<Self>) {
    if self.wip.fetch_add(1, Ordering::AcqRel) != 0 {
      return;
    }
    loop {
      if self.cancelled.load(Ordering::Acquire) {
        self.clear_queue();
        self.downstream.release();
        return;
      }
      if self.fail_fast.load(Ordering::Acquire) {
        self.fail();
        return;
      }
      if !self.active.load(Ordering::Acquire) {
        if self.config.error_mode == ErrorMode::Boundary && self.errors.has_error() {
          self.fail();
          return;
        }
        let done = self.done.load(Ordering::Acquire);
        let queue = self.queue.lock().clone();
        let polled = match &queue {
          Some(queue) => queue.poll(),
          None => Ok(None),
        };
        match polled.and_then(|value| value.map(|v| (self.func)(v)).transpose()) {
          Ok(Some(source)) => {
            self.active.store(true, Ordering::Release);
            source.subscribe_with(ConcatInner { state: self.clone() });
          }
          Ok(None) => {
            if done {
              self.cancelled.store(true, Ordering::Release);
              self.terminate();
              return;
            }
          }
          Err(err) => {
            // Mapper or fused poll failure: nothing more can be produced.
            self.upstream.dispose();
            if let Err(err) = self.errors.add(err, true) {
              plugins::on_error(err);
            }
            self.fail();
            return;
          }
        }
      }
      if self.wip.fetch_sub(1, Ordering::AcqRel) == 1 {
        return;
      }
    }
  }

  /// Cancel everything and deliver the collected errors.
  fn fail(&self) {
    self.cancelled.store(true, Ordering::Release);
    self.upstream.dispose();
    self.inner.dispose();
    self.clear_queue();
    self.terminate();
  }

  fn terminate(&self) {
    match self.errors.terminate() {
      Some(err) => {
        tracing::trace!(error = %err, "concat_map terminated with error");
        self.downstream.error(err);
      }
      None => {
        tracing::trace!("concat_map completed");
        self.downstream.complete();
      }
    }
  }

  fn clear_queue(&self) {
    let queue = self.queue.lock().clone();
    if let Some(queue) = queue {
      queue.clear();
    }
  }

  fn outer_error(self: &Arc<Self>, err: RxError) {
    let mode = self.config.error_mode;
    match self.errors.add(err, mode != ErrorMode::Immediate) {
      Ok(()) => match mode {
        ErrorMode::Immediate => self.fail_fast.store(true, Ordering::Release),
        ErrorMode::Boundary => self.outer_failed.store(true, Ordering::Release),
        ErrorMode::End => {}
      },
      Err(err) => plugins::on_error(err),
    }
    self.done.store(true, Ordering::Release);
    self.drain();
  }

  fn inner_error(self: &Arc<Self>, err: RxError) {
    let mode = self.config.error_mode;
    // A pending outer error and this one reach the downstream together.
    let accumulate = mode == ErrorMode::End || self.outer_failed.load(Ordering::Acquire);
    match self.errors.add(err, accumulate) {
      Ok(()) => match mode {
        ErrorMode::Immediate => self.fail_fast.store(true, Ordering::Release),
        // The boundary is now: stop the outer source, the lane fails once it
        // sees no active inner.
        ErrorMode::Boundary => self.upstream.dispose(),
        ErrorMode::End => {}
      },
      Err(err) => plugins::on_error(err),
    }
    self.active.store(false, Ordering::Release);
    self.drain();
  }
}

impl<T, U, F> Disposable for ConcatState<T, U, F>
where
  T: Send + 'static,
  U: Send + 'static,
  F: Send + Sync,
{
  fn dispose(&self) {
    if self.cancelled.swap(true, Ordering::AcqRel) {
      return;
    }
    self.inner.dispose();
    self.upstream.dispose();
    if self.wip.fetch_add(1, Ordering::AcqRel) == 0 {
      let queue = self.queue.lock().clone();
      if let Some(queue) = queue {
        queue.clear();
      }
      self.downstream.release();
    }
  }

  fn is_disposed(&self) -> bool { self.cancelled.load(Ordering::Acquire) }
}

// ==================== Observers ====================

struct ConcatOuter<T, U, F> {
  state: Arc<ConcatState<T, U, F>>,
}

impl<T, U, F> Observer<T> for ConcatOuter<T, U, F>
where
  T: Send + 'static,
  U: Send + 'static,
  F: Fn(T) -> Result<Observable<U>, RxError> + Send + Sync + 'static,
{
  fn on_subscribe(&mut self, upstream: Upstream<T>) {
    let state = &self.state;
    match state.upstream.set_once(upstream.disposable()) {
      Ok(true) => {}
      Ok(false) => return,
      Err(err) => {
        if let Err(err) = state.errors.add(err, true) {
          plugins::on_error(err);
        }
        state.done.store(true, Ordering::Release);
        state.fail_fast.store(true, Ordering::Release);
        state.drain();
        return;
      }
    }
    if let Some(queue) = upstream.queue() {
      let mode = queue.request_fusion(FusionMode::ANY);
      if mode == FusionMode::SYNC {
        *state.queue.lock() = Some(FusedQueue::Upstream(queue));
        state.done.store(true, Ordering::Release);
        state.drain();
        return;
      }
      if mode == FusionMode::ASYNC {
        *state.queue.lock() = Some(FusedQueue::Upstream(queue));
        return;
      }
    }
    let buffer = match state.config.capacity {
      Some(capacity) => SpscQueue::bounded(capacity),
      None => SpscQueue::unbounded(),
    };
    *state.queue.lock() = Some(FusedQueue::Owned(Arc::new(buffer)));
  }

  fn next(&mut self, value: T) {
    let state = &self.state;
    if state.done.load(Ordering::Acquire) {
      return;
    }
    let queue = state.queue.lock().clone();
    let overflow = match queue {
      Some(FusedQueue::Owned(buffer)) => buffer.offer(value).is_err(),
      _ => false,
    };
    if overflow {
      tracing::warn!(violation = %ProtocolViolation::QueueOverflow, "concat_map outer queue is full");
      state.upstream.dispose();
      state.outer_error(RxError::MissingBackpressure("concat_map outer queue is full"));
      return;
    }
    state.drain();
  }

  fn error(self: Box<Self>, err: RxError) {
    if self.state.done.load(Ordering::Acquire) {
      plugins::on_error(err);
      return;
    }
    self.state.outer_error(err);
  }

  fn complete(self: Box<Self>) {
    self.state.done.store(true, Ordering::Release);
    self.state.drain();
  }

  fn ready(&mut self) { self.state.drain() }
}

struct ConcatInner<T, U, F> {
  state: Arc<ConcatState<T, U, F>>,
}

impl<T, U, F> Observer<U> for ConcatInner<T, U, F>
where
  T: Send + 'static,
  U: Send + 'static,
  F: Fn(T) -> Result<Observable<U>, RxError> + Send + Sync + 'static,
{
  fn on_subscribe(&mut self, upstream: Upstream<U>) {
    // The previous inner already finished; its handle is simply replaced.
    self.state.inner.replace(upstream.disposable());
  }

  fn next(&mut self, value: U) {
    let state = &self.state;
    if !state.fail_fast.load(Ordering::Acquire) && !state.cancelled.load(Ordering::Acquire) {
      state.downstream.next(value);
    }
  }

  fn error(self: Box<Self>, err: RxError) { self.state.inner_error(err) }

  fn complete(self: Box<Self>) {
    self.state.active.store(false, Ordering::Release);
    self.state.drain();
  }
}
