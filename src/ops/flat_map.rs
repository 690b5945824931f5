//! Merge the inner sources produced from every outer value.
//!
//! One coordinator per subscription owns the outer subscription, the set of
//! live inner records and the sources waiting for a concurrency slot. All
//! delivery to the downstream happens on a single drain lane: whichever
//! thread raises `wip` from zero runs the loop, every other thread queues its
//! value and leaves. Disposal only flips flags and cancels sources; the drain
//! lane releases the downstream.

use std::{
  collections::VecDeque,
  marker::PhantomData,
  sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Arc,
  },
};

use parking_lot::Mutex;

use crate::{
  disposable::{Disposable, DisposableSlot, Registry},
  error::{ErrorCollector, RxError},
  fusion::{FusedQueue, FusionMode, Upstream},
  observable::{Observable, ObservableSource},
  observer::{BoxedObserver, DownstreamSlot, Observer},
  plugins,
};

/// When an error reaches the downstream of a coordinator.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ErrorMode {
  /// Any error cancels everything and is delivered at once.
  Immediate,
  /// Inner errors are delivered at once. An outer error waits until the
  /// active inner sources finished; for `concat_map`, until the current
  /// inner source finished.
  #[default]
  Boundary,
  /// Every source runs to its end; the collected errors are delivered last.
  End,
}

/// Options of [`Observable::flat_map_with`].
///
/// ```rust
/// use rxcore::prelude::*;
///
/// let config = FlatMapConfig::new().max_concurrency(2).error_mode(ErrorMode::End);
/// observable::from_iter(1..=3)
///   .flat_map_with(config, |v| observable::from_iter(vec![v; 2]))
///   .test()
///   .assert_result(&[1, 1, 2, 2, 3, 3]);
/// ```
#[derive(Clone, Debug, Default)]
pub struct FlatMapConfig {
  pub max_concurrency: Option<usize>,
  pub error_mode: ErrorMode,
}

impl FlatMapConfig {
  pub fn new() -> Self { Self::default() }

  /// At most `limit` inner sources run at once; the rest wait in
  /// subscription order. Clamped to at least one.
  pub fn max_concurrency(mut self, limit: usize) -> Self {
    self.max_concurrency = Some(limit.max(1));
    self
  }

  pub fn error_mode(mut self, mode: ErrorMode) -> Self {
    self.error_mode = mode;
    self
  }
}

impl<T: Send + 'static> Observable<T> {
  /// Map every value to an inner source and merge their emissions.
  ///
  /// ```rust
  /// use rxcore::prelude::*;
  ///
  /// let to = observable::from_iter(1..=3)
  ///   .flat_map(|v| observable::from_iter(vec![v * 10, v * 10 + 1]))
  ///   .test();
  /// to.assert_result(&[10, 11, 20, 21, 30, 31]);
  /// ```
  pub fn flat_map<U, F>(&self, f: F) -> Observable<U>
  where
    U: Send + 'static,
    F: Fn(T) -> Observable<U> + Send + Sync + 'static,
  {
    self.flat_map_with(FlatMapConfig::default(), f)
  }

  pub fn flat_map_with<U, F>(&self, config: FlatMapConfig, f: F) -> Observable<U>
  where
    U: Send + 'static,
    F: Fn(T) -> Observable<U> + Send + Sync + 'static,
  {
    self.try_flat_map_with(config, move |v| Ok(f(v)))
  }

  /// A failing mapper cancels the outer source and counts as an outer error.
  pub fn try_flat_map_with<U, F>(&self, config: FlatMapConfig, f: F) -> Observable<U>
  where
    U: Send + 'static,
    F: Fn(T) -> Result<Observable<U>, RxError> + Send + Sync + 'static,
  {
    Observable::new(FlatMapOp { source: self.clone(), func: Arc::new(f), config })
  }
}

struct FlatMapOp<T, F> {
  source: Observable<T>,
  func: Arc<F>,
  config: FlatMapConfig,
}

impl<T, U, F> ObservableSource<U> for FlatMapOp<T, F>
where
  T: Send + 'static,
  U: Send + 'static,
  F: Fn(T) -> Result<Observable<U>, RxError> + Send + Sync + 'static,
{
  fn subscribe_actual(&self, mut observer: BoxedObserver<U>) {
    let state = Arc::new(MergeState::new(self.config.clone()));
    observer.on_subscribe(Upstream::Plain(state.clone()));
    if state.is_disposed() {
      return;
    }
    state.downstream.install(observer);
    self.source.subscribe_with(MergeOuter::<T, U, F> {
      state,
      func: self.func.clone(),
      done: false,
      _value: PhantomData,
    });
  }
}

// ==================== Coordinator ====================

struct MergeState<U> {
  downstream: DownstreamSlot<U>,
  upstream: DisposableSlot,
  inners: Mutex<Registry<Arc<InnerRecord<U>>>>,
  /// Inner sources subscribed and not yet finished.
  active: AtomicUsize,
  /// Sources waiting for a concurrency slot. Only the drain lane subscribes
  /// them.
  waiting: Mutex<VecDeque<Observable<U>>>,
  errors: ErrorCollector,
  config: FlatMapConfig,
  /// The outer source terminated.
  done: AtomicBool,
  /// A Boundary outer error waits for the active inners.
  outer_failed: AtomicBool,
  cancelled: AtomicBool,
  /// An error must be delivered now, cancelling everything else.
  fail_fast: AtomicBool,
  wip: AtomicUsize,
}

struct InnerRecord<U> {
  id: usize,
  upstream: DisposableSlot,
  /// The fused upstream queue, or a buffer for values that arrived while the
  /// drain lane was busy.
  queue: Mutex<Option<FusedQueue<U>>>,
  done: AtomicBool,
}

impl<U: Send + 'static> MergeState<U> {
  fn new(config: FlatMapConfig) -> Self {
    Self {
      downstream: DownstreamSlot::empty(),
      upstream: DisposableSlot::new(),
      inners: Mutex::new(Registry::new()),
      active: AtomicUsize::new(0),
      waiting: Mutex::new(VecDeque::new()),
      errors: ErrorCollector::default(),
      config,
      done: AtomicBool::new(false),
      outer_failed: AtomicBool::new(false),
      cancelled: AtomicBool::new(false),
      fail_fast: AtomicBool::new(false),
      wip: AtomicUsize::new(0),
    }
  }

  fn is_stopping(&self) -> bool {
    self.cancelled.load(Ordering::Acquire) || self.fail_fast.load(Ordering::Acquire)
  }

  /// Subscribe `source` right away when concurrency is unbounded, otherwise
  /// queue it for the drain lane.
  fn admit(self: &Arc<Self>, source: Observable<U>) {
    if self.config.max_concurrency.is_none() {
      self.active.fetch_add(1, Ordering::AcqRel);
      self.subscribe_inner(source);
      return;
    }
    self.waiting.lock().push_back(source);
    self.drain();
  }

  /// Fill the free concurrency slots from the waiting sources, in arrival
  /// order. Only called on the drain lane.
  fn subscribe_waiting(self: &Arc<Self>) {
    let Some(limit) = self.config.max_concurrency else { return };
    while self.active.load(Ordering::Acquire) < limit {
      let Some(source) = self.waiting.lock().pop_front() else { return };
      self.active.fetch_add(1, Ordering::AcqRel);
      self.subscribe_inner(source);
      if self.is_stopping() {
        return;
      }
    }
  }

  fn subscribe_inner(self: &Arc<Self>, source: Observable<U>) {
    let record = {
      let mut inners = self.inners.lock();
      let id = inners.reserve_id();
      let record = Arc::new(InnerRecord {
        id,
        upstream: DisposableSlot::new(),
        queue: Mutex::new(None),
        done: AtomicBool::new(false),
      });
      inners.insert(id, record.clone());
      record
    };
    if self.is_stopping() {
      record.upstream.dispose();
      return;
    }
    source.subscribe_with(MergeInner { state: self.clone(), record });
  }

  /// Deliver `value` directly when the lane is free and nothing of this inner
  /// is queued, otherwise queue it for the lane.
  fn try_emit(self: &Arc<Self>, record: &InnerRecord<U>, value: U) {
    if self.wip.compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire).is_ok() {
      let queued = record.queue.lock().as_ref().is_some_and(|q| !q.is_empty());
      if queued || self.is_stopping() {
        Self::enqueue(record, value);
      } else {
        self.downstream.next(value);
      }
      if self.wip.fetch_sub(1, Ordering::AcqRel) == 1 {
        return;
      }
    } else {
      Self::enqueue(record, value);
      if self.wip.fetch_add(1, Ordering::AcqRel) != 0 {
        return;
      }
    }
    self.drain_loop();
  }

  fn enqueue(record: &InnerRecord<U>, value: U) {
    let mut queue = record.queue.lock();
    if let FusedQueue::Owned(buffer) = queue.get_or_insert_with(FusedQueue::unbounded) {
      buffer.push(value);
    }
  }

  fn drain(self: &Arc<Self>) {
    if self.wip.fetch_add(1, Ordering::AcqRel) == 0 {
      self.drain_loop();
    }
  }

  fn drain_loop(self: &Arc<Self>) {
    let mut missed = 1;
    loop {
      if self.check_terminate() {
        return;
      }
      self.subscribe_waiting();
      let mut finished = false;
      let inners = self.inners.lock().snapshot();
      for record in inners {
        loop {
          if self.check_terminate() {
            return;
          }
          // Read before polling: a value queued after an empty poll is
          // always followed by `done`.
          let done = record.done.load(Ordering::Acquire);
          let queue = record.queue.lock().clone();
          let polled = match &queue {
            Some(queue) => queue.poll(),
            None => Ok(None),
          };
          match polled {
            Ok(Some(value)) => {
              self.downstream.next(value);
            }
            Ok(None) => {
              if done {
                self.finish_inner(&record);
                finished = true;
              }
              break;
            }
            Err(err) => {
              record.upstream.dispose();
              if let Some(queue) = queue {
                queue.clear();
              }
              self.record_inner_error(err);
              self.finish_inner(&record);
              finished = true;
              break;
            }
          }
        }
      }
      if finished {
        continue;
      }

      if self.done.load(Ordering::Acquire) {
        let idle = self.active.load(Ordering::Acquire) == 0 && self.waiting.lock().is_empty();
        if idle {
          self.cancelled.store(true, Ordering::Release);
          self.terminate();
          return;
        }
      }

      missed = self.wip.fetch_sub(missed, Ordering::AcqRel) - missed;
      if missed == 0 {
        return;
      }
    }
  }

  /// Stop when disposed or failing fast. Only called on the drain lane.
  fn check_terminate(&self) -> bool {
    if self.cancelled.load(Ordering::Acquire) {
      self.cancel_sources();
      self.downstream.release();
      return true;
    }
    if self.fail_fast.load(Ordering::Acquire) {
      self.cancelled.store(true, Ordering::Release);
      self.cancel_sources();
      self.terminate();
      return true;
    }
    false
  }

  fn terminate(&self) {
    match self.errors.terminate() {
      Some(err) => {
        tracing::trace!(error = %err, "flat_map terminated with error");
        self.downstream.error(err);
      }
      None => {
        tracing::trace!("flat_map completed");
        self.downstream.complete();
      }
    }
  }

  /// Drop a terminated inner and free its slot. The next pass of the lane
  /// subscribes a waiting source into it.
  fn finish_inner(self: &Arc<Self>, record: &InnerRecord<U>) {
    let removed = self.inners.lock().remove(record.id);
    if removed.is_some() {
      self.active.fetch_sub(1, Ordering::AcqRel);
    }
  }

  fn record_inner_error(&self, err: RxError) {
    let mode = self.config.error_mode;
    // A pending outer error and this one reach the downstream together.
    let accumulate = mode == ErrorMode::End || self.outer_failed.load(Ordering::Acquire);
    match self.errors.add(err, accumulate) {
      Ok(()) if mode != ErrorMode::End => self.fail_fast.store(true, Ordering::Release),
      Ok(()) => {}
      Err(err) => plugins::on_error(err),
    }
  }

  /// A broken subscription protocol fails the whole merge at once.
  fn fail_now(self: &Arc<Self>, err: RxError) {
    match self.errors.add(err, true) {
      Ok(()) => self.fail_fast.store(true, Ordering::Release),
      Err(err) => plugins::on_error(err),
    }
    self.drain();
  }

  fn outer_error(self: &Arc<Self>, err: RxError) {
    match self.config.error_mode {
      ErrorMode::Immediate => match self.errors.add(err, false) {
        Ok(()) => self.fail_fast.store(true, Ordering::Release),
        Err(err) => plugins::on_error(err),
      },
      ErrorMode::Boundary => match self.errors.add(err, true) {
        Ok(()) => {
          self.outer_failed.store(true, Ordering::Release);
          let dropped = std::mem::take(&mut *self.waiting.lock());
          drop(dropped);
        }
        Err(err) => plugins::on_error(err),
      },
      ErrorMode::End => {
        if let Err(err) = self.errors.add(err, true) {
          plugins::on_error(err);
        }
      }
    }
    self.done.store(true, Ordering::Release);
    self.drain();
  }

  fn cancel_sources(&self) {
    self.upstream.dispose();
    let inners: Vec<_> = self.inners.lock().drain().collect();
    for record in inners {
      record.upstream.dispose();
      let queue = record.queue.lock().take();
      if let Some(queue) = queue {
        queue.clear();
      }
    }
    let sources = std::mem::take(&mut *self.waiting.lock());
    drop(sources);
  }
}

impl<U: Send + 'static> Disposable for MergeState<U> {
  fn dispose(&self) {
    if self.cancelled.swap(true, Ordering::AcqRel) {
      return;
    }
    self.cancel_sources();
    if self.wip.fetch_add(1, Ordering::AcqRel) == 0 {
      self.downstream.release();
    }
  }

  fn is_disposed(&self) -> bool { self.cancelled.load(Ordering::Acquire) }
}

// ==================== Observers ====================

struct MergeOuter<T, U, F> {
  state: Arc<MergeState<U>>,
  func: Arc<F>,
  done: bool,
  _value: PhantomData<fn(T)>,
}

impl<T, U, F> Observer<T> for MergeOuter<T, U, F>
where
  T: Send + 'static,
  U: Send + 'static,
  F: Fn(T) -> Result<Observable<U>, RxError> + Send + Sync + 'static,
{
  fn on_subscribe(&mut self, upstream: Upstream<T>) {
    if let Err(err) = self.state.upstream.set_once(upstream.disposable()) {
      self.done = true;
      self.state.done.store(true, Ordering::Release);
      self.state.fail_now(err);
    }
  }

  fn next(&mut self, value: T) {
    if self.done || self.state.is_stopping() {
      return;
    }
    match (self.func)(value) {
      Ok(source) => self.state.admit(source),
      Err(err) => {
        self.done = true;
        self.state.upstream.dispose();
        self.state.outer_error(err);
      }
    }
  }

  fn error(self: Box<Self>, err: RxError) {
    if self.done {
      plugins::on_error(err);
      return;
    }
    self.state.outer_error(err);
  }

  fn complete(self: Box<Self>) {
    if !self.done {
      self.state.done.store(true, Ordering::Release);
      self.state.drain();
    }
  }
}

struct MergeInner<U> {
  state: Arc<MergeState<U>>,
  record: Arc<InnerRecord<U>>,
}

impl<U: Send + 'static> Observer<U> for MergeInner<U> {
  fn on_subscribe(&mut self, upstream: Upstream<U>) {
    match self.record.upstream.set_once(upstream.disposable()) {
      Ok(true) => {}
      Ok(false) => return,
      Err(err) => {
        self.record.done.store(true, Ordering::Release);
        self.state.fail_now(err);
        return;
      }
    }
    let Some(queue) = upstream.queue() else { return };
    let mode = queue.request_fusion(FusionMode::ANY | FusionMode::BOUNDARY);
    if mode == FusionMode::SYNC {
      *self.record.queue.lock() = Some(FusedQueue::Upstream(queue));
      self.record.done.store(true, Ordering::Release);
      self.state.drain();
    } else if mode == FusionMode::ASYNC {
      *self.record.queue.lock() = Some(FusedQueue::Upstream(queue));
    }
  }

  fn next(&mut self, value: U) { self.state.try_emit(&self.record, value) }

  fn error(self: Box<Self>, err: RxError) {
    self.state.record_inner_error(err);
    if self.state.fail_fast.load(Ordering::Acquire) {
      // Cancel the siblings now; the drain lane delivers the error.
      self.state.cancel_sources();
    }
    self.record.done.store(true, Ordering::Release);
    self.state.drain();
  }

  fn complete(self: Box<Self>) {
    self.record.done.store(true, Ordering::Release);
    self.state.drain();
  }

  fn ready(&mut self) { self.state.drain() }
}
