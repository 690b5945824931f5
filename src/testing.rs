//! Test support: a recording observer, contract checks and a scoped
//! undeliverable-error capture.
//!
//! ```rust
//! use rxcore::prelude::*;
//!
//! observable::from_iter(vec![1, 2, 3])
//!   .map(|v| v * 10)
//!   .test()
//!   .assert_result(&[10, 20, 30]);
//! ```

use std::{
  fmt::Debug,
  marker::PhantomData,
  sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
  },
  time::{Duration, Instant},
};

use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::{
  disposable::{BooleanDisposable, Disposable},
  error::{ProtocolViolation, RxError},
  fusion::{FusionMode, Upstream},
  observable::{Observable, ObservableSource},
  observer::{BoxedObserver, Observer},
  plugins,
};

// ==================== TestObserver ====================

/// Records everything it receives. Clones share the same record, so one
/// clone can be subscribed while another is inspected.
pub struct TestObserver<T>(Arc<TestState<T>>);

impl<T> Clone for TestObserver<T> {
  fn clone(&self) -> Self { TestObserver(self.0.clone()) }
}

struct TestState<T> {
  record: Mutex<Record<T>>,
  changed: Condvar,
  upstream: Mutex<Option<Upstream<T>>>,
  requested: FusionMode,
  disposed: AtomicBool,
}

struct Record<T> {
  values: Vec<T>,
  errors: Vec<RxError>,
  completions: usize,
  fusion: FusionMode,
}

impl<T: Send + 'static> Default for TestObserver<T> {
  fn default() -> Self { Self::new() }
}

impl<T: Send + 'static> TestObserver<T> {
  pub fn new() -> Self { Self::with_fusion(FusionMode::NONE) }

  /// An observer that asks its upstream for `mode` when subscribed.
  pub fn with_fusion(mode: FusionMode) -> Self {
    TestObserver(Arc::new(TestState {
      record: Mutex::new(Record {
        values: vec![],
        errors: vec![],
        completions: 0,
        fusion: FusionMode::NONE,
      }),
      changed: Condvar::new(),
      upstream: Mutex::new(None),
      requested: mode,
      disposed: AtomicBool::new(false),
    }))
  }

  /// The mode granted by the upstream; `NONE` when fusion was not asked for
  /// or declined.
  pub fn fusion_mode(&self) -> FusionMode { self.0.record.lock().fusion }

  pub fn dispose(&self) {
    self.0.disposed.store(true, Ordering::Release);
    let upstream = self.0.upstream.lock().clone();
    if let Some(upstream) = upstream {
      upstream.dispose();
    }
  }

  pub fn is_disposed(&self) -> bool { self.0.disposed.load(Ordering::Acquire) }

  pub fn value_count(&self) -> usize { self.0.record.lock().values.len() }

  pub fn errors(&self) -> Vec<RxError> { self.0.record.lock().errors.clone() }

  pub fn error_count(&self) -> usize { self.0.record.lock().errors.len() }

  pub fn completions(&self) -> usize { self.0.record.lock().completions }

  pub fn is_terminated(&self) -> bool {
    let record = self.0.record.lock();
    record.completions + record.errors.len() > 0
  }

  /// Block until a terminal signal arrived or `timeout` passed. Returns
  /// whether the stream terminated.
  pub fn await_done(&self, timeout: Duration) -> bool {
    self.await_until(timeout, |r| r.completions + r.errors.len() > 0)
  }

  /// Block until at least `count` values arrived, the stream terminated or
  /// `timeout` passed. Returns whether `count` values arrived.
  pub fn await_count(&self, count: usize, timeout: Duration) -> bool {
    self.await_until(timeout, |r| r.values.len() >= count || r.completions + r.errors.len() > 0);
    self.value_count() >= count
  }

  fn await_until(&self, timeout: Duration, done: impl Fn(&Record<T>) -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    let mut record = self.0.record.lock();
    while !done(&record) {
      if self.0.changed.wait_until(&mut record, deadline).timed_out() {
        return done(&record);
      }
    }
    true
  }

  fn update(&self, f: impl FnOnce(&mut Record<T>)) {
    f(&mut self.0.record.lock());
    self.0.changed.notify_all();
  }

  /// Pull everything the fused upstream has. In SYNC mode an empty poll
  /// means completion.
  fn drain_fused(&self, sync: bool) {
    let Some(queue) = self.0.upstream.lock().as_ref().and_then(Upstream::queue) else { return };
    loop {
      if self.is_disposed() {
        return;
      }
      match queue.poll() {
        Ok(Some(value)) => self.update(|r| r.values.push(value)),
        Ok(None) => {
          if sync {
            self.update(|r| r.completions += 1);
          }
          return;
        }
        Err(err) => {
          queue.dispose();
          self.update(|r| r.errors.push(err));
          return;
        }
      }
    }
  }

  fn is_async_fused(&self) -> bool { self.fusion_mode() == FusionMode::ASYNC }
}

impl<T: Send + 'static> Observer<T> for TestObserver<T> {
  fn on_subscribe(&mut self, upstream: Upstream<T>) {
    {
      let mut slot = self.0.upstream.lock();
      if let Some(current) = slot.clone() {
        drop(slot);
        upstream.dispose();
        current.dispose();
        self.update(|r| r.errors.push(RxError::multiple_subscription()));
        return;
      }
      *slot = Some(upstream.clone());
    }
    if self.is_disposed() {
      upstream.dispose();
      return;
    }
    if self.0.requested.is_none() {
      return;
    }
    if let Some(queue) = upstream.queue() {
      let granted = queue.request_fusion(self.0.requested);
      self.update(|r| r.fusion = granted);
      if granted == FusionMode::SYNC {
        self.drain_fused(true);
      }
    }
  }

  fn next(&mut self, value: T) { self.update(|r| r.values.push(value)); }

  fn error(self: Box<Self>, err: RxError) {
    if self.is_async_fused() {
      self.drain_fused(false);
    }
    self.update(|r| r.errors.push(err));
  }

  fn complete(self: Box<Self>) {
    if self.is_async_fused() {
      self.drain_fused(false);
    }
    self.update(|r| r.completions += 1);
  }

  fn ready(&mut self) {
    if self.is_async_fused() {
      self.drain_fused(false);
    }
  }
}

// ==================== Assertions ====================

impl<T: Clone + Debug + PartialEq + Send + 'static> TestObserver<T> {
  pub fn values(&self) -> Vec<T> { self.0.record.lock().values.clone() }

  #[track_caller]
  pub fn assert_values(&self, expected: &[T]) -> &Self {
    assert_eq!(self.values(), expected, "values differ");
    self
  }

  #[track_caller]
  pub fn assert_value_count(&self, count: usize) -> &Self {
    assert_eq!(self.value_count(), count, "value count differs");
    self
  }

  #[track_caller]
  pub fn assert_complete(&self) -> &Self {
    assert_eq!(self.completions(), 1, "expected exactly one completion");
    self
  }

  #[track_caller]
  pub fn assert_not_complete(&self) -> &Self {
    assert_eq!(self.completions(), 0, "unexpected completion");
    self
  }

  #[track_caller]
  pub fn assert_no_errors(&self) -> &Self {
    let errors = self.errors();
    assert!(errors.is_empty(), "unexpected errors: {errors:?}");
    self
  }

  /// Exactly one error, whose message contains `fragment`.
  #[track_caller]
  pub fn assert_error_message(&self, fragment: &str) -> &Self {
    let errors = self.errors();
    assert_eq!(errors.len(), 1, "expected one error, got {errors:?}");
    let message = errors[0].to_string();
    assert!(message.contains(fragment), "error `{message}` does not mention `{fragment}`");
    self
  }

  /// Exactly one error, which satisfies `check`.
  #[track_caller]
  pub fn assert_error<F: FnOnce(&RxError) -> bool>(&self, check: F) -> &Self {
    let errors = self.errors();
    assert_eq!(errors.len(), 1, "expected one error, got {errors:?}");
    assert!(check(&errors[0]), "unexpected error {:?}", errors[0]);
    self
  }

  /// `expected` values, then completion.
  #[track_caller]
  pub fn assert_result(&self, expected: &[T]) -> &Self {
    self.assert_values(expected).assert_no_errors().assert_complete()
  }

  /// `expected` values, then one error mentioning `fragment`.
  #[track_caller]
  pub fn assert_failure(&self, fragment: &str, expected: &[T]) -> &Self {
    self.assert_values(expected).assert_error_message(fragment).assert_not_complete()
  }
}

// ==================== Contract checks ====================

/// Subscribe to `source` with an observer that disposes its upstream right
/// away, and check that the handle reports it.
#[track_caller]
pub fn check_disposed<T: Send + 'static>(source: Observable<T>) {
  let seen = Arc::new(Mutex::new(None));
  source.subscribe_with(DisposingProbe::<T>(seen.clone(), PhantomData));
  let seen = seen.lock().take();
  match seen {
    Some((before, after)) => {
      assert!(!before, "upstream was disposed before the consumer asked");
      assert!(after, "upstream does not report disposed");
    }
    None => panic!("on_subscribe was never called"),
  }
}

struct DisposingProbe<T>(Arc<Mutex<Option<(bool, bool)>>>, PhantomData<fn(T)>);

impl<T: Send + 'static> Observer<T> for DisposingProbe<T> {
  fn on_subscribe(&mut self, upstream: Upstream<T>) {
    let before = upstream.is_disposed();
    upstream.dispose();
    *self.0.lock() = Some((before, upstream.is_disposed()));
  }

  fn next(&mut self, _: T) {}

  fn error(self: Box<Self>, _: RxError) {}

  fn complete(self: Box<Self>) {}
}

/// Feed the operator built by `compose` a source that calls `on_subscribe`
/// twice. The operator must dispose both upstreams and fail its downstream
/// with exactly one multiple-subscription error.
#[track_caller]
pub fn check_double_on_subscribe<T, U, F>(compose: F)
where
  T: Send + 'static,
  U: Send + 'static,
  F: FnOnce(Observable<T>) -> Observable<U>,
{
  let first = Arc::new(BooleanDisposable::new());
  let second = Arc::new(BooleanDisposable::new());
  let source = Observable::new(DoubleSubscribe::<T> {
    first: first.clone(),
    second: second.clone(),
    _item: PhantomData,
  });
  let to = TestObserver::<U>::new();
  compose(source).subscribe_with(to.clone());
  assert!(to.await_done(Duration::from_secs(5)), "the subscription was not failed");
  assert!(first.is_disposed(), "the first upstream was kept");
  assert!(second.is_disposed(), "the second upstream was kept");
  let errors = to.errors();
  assert_eq!(errors.len(), 1, "expected one error, got {errors:?}");
  assert!(
    errors[0].is_protocol_violation(ProtocolViolation::MultipleSubscription),
    "unexpected error {:?}",
    errors[0]
  );
  assert_eq!(to.completions(), 0, "unexpected completion");
}

struct DoubleSubscribe<T> {
  first: Arc<BooleanDisposable>,
  second: Arc<BooleanDisposable>,
  _item: PhantomData<fn() -> T>,
}

impl<T: Send + 'static> ObservableSource<T> for DoubleSubscribe<T> {
  fn subscribe_actual(&self, mut observer: BoxedObserver<T>) {
    observer.on_subscribe(Upstream::Plain(self.first.clone()));
    observer.on_subscribe(Upstream::Plain(self.second.clone()));
  }
}

// ==================== Undeliverable capture ====================

/// Serializes every test that replaces the process-wide error handler.
pub(crate) static PLUGIN_LOCK: Mutex<()> = parking_lot::const_mutex(());

/// Route undeliverable errors into a buffer until dropped.
///
/// Tests running in parallel may report into the same buffer, so assert on
/// the presence of an error rather than on the exact list.
pub fn capture_undeliverable() -> UndeliverableCapture {
  let guard = PLUGIN_LOCK.lock();
  let errors = Arc::new(Mutex::new(vec![]));
  let sink = errors.clone();
  plugins::set_error_handler(move |err| sink.lock().push(err));
  UndeliverableCapture { errors, _guard: guard }
}

pub struct UndeliverableCapture {
  errors: Arc<Mutex<Vec<RxError>>>,
  _guard: MutexGuard<'static, ()>,
}

impl UndeliverableCapture {
  pub fn errors(&self) -> Vec<RxError> { self.errors.lock().clone() }
}

impl Drop for UndeliverableCapture {
  fn drop(&mut self) { plugins::reset(); }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::observable;

  #[test]
  fn records_signals() {
    let to = observable::from_iter(vec![1, 2]).test();
    to.assert_result(&[1, 2]);
    assert!(to.is_terminated());
    assert!(to.await_done(Duration::ZERO));
  }

  #[test]
  fn disposed_before_subscribe_cancels_upstream() {
    let to = TestObserver::<i32>::new();
    to.dispose();
    observable::from_iter(vec![1, 2]).subscribe_with(to.clone());
    to.assert_values(&[]).assert_not_complete();
  }

  #[test]
  fn await_times_out_on_silent_source() {
    let to = observable::never::<i32>().test();
    assert!(!to.await_done(Duration::from_millis(10)));
    assert!(!to.await_count(1, Duration::from_millis(10)));
  }

  #[test]
  fn second_on_subscribe_is_recorded_as_error() {
    let to = TestObserver::<i32>::new();
    let (first, second) = (crate::disposable::empty(), crate::disposable::empty());
    to.clone().on_subscribe(Upstream::Plain(first.clone()));
    to.clone().on_subscribe(Upstream::Plain(second.clone()));
    assert!(first.is_disposed() && second.is_disposed());
    to.assert_error(|e| e.is_protocol_violation(ProtocolViolation::MultipleSubscription));
  }

  #[test]
  #[should_panic(expected = "values differ")]
  fn mismatch_panics() { observable::just(1).test().assert_values(&[2]); }
}
