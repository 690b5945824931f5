//! Resubscribe to a source when a trigger stream says so.
//!
//! Every terminal signal of the source that should be redone (completion for
//! `repeat_when`, an error for `retry_when`) is pushed into a signal stream.
//! The caller turns that stream into a trigger: each trigger value subscribes
//! to the source again, the trigger's own terminal ends the whole stream.
//!
//! Resubscription goes through a trampoline worker. A source that terminates
//! synchronously queues its next run behind the current one instead of
//! recursing into it.
//!
//! ```rust
//! use std::sync::atomic::{AtomicUsize, Ordering};
//! use rxcore::prelude::*;
//!
//! let to = observable::just(1)
//!   .repeat_when(|signals| {
//!     let left = AtomicUsize::new(2);
//!     signals.take_while(move |_| left.fetch_sub(1, Ordering::SeqCst) > 0)
//!   })
//!   .test();
//! to.assert_result(&[1, 1, 1]);
//! ```

use std::{
  marker::PhantomData,
  sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Arc,
  },
};

use crate::{
  disposable::{Disposable, DisposableSlot},
  error::RxError,
  fusion::Upstream,
  observable::{self, Observable, ObservableSource},
  observer::{BoxedObserver, DownstreamSlot, Observer},
  plugins,
  scheduler::{self, Duration, WorkerRef},
  subject::PublishSubject,
};

impl<T: Send + 'static> Observable<T> {
  /// Subscribe again each time the trigger built from the completion signals
  /// emits. Errors of the source pass through.
  pub fn repeat_when<S, H>(&self, handler: H) -> Observable<T>
  where
    S: Send + 'static,
    H: Fn(Observable<()>) -> Observable<S> + Send + Sync + 'static,
  {
    Observable::new(RedoOp::<T, Repeat, H> { source: self.clone(), handler: Arc::new(handler), _kind: PhantomData })
  }

  /// Subscribe again each time the trigger built from the error signals
  /// emits. Completion of the source passes through.
  pub fn retry_when<S, H>(&self, handler: H) -> Observable<T>
  where
    S: Send + 'static,
    H: Fn(Observable<RxError>) -> Observable<S> + Send + Sync + 'static,
  {
    Observable::new(RedoOp::<T, Retry, H> { source: self.clone(), handler: Arc::new(handler), _kind: PhantomData })
  }

  /// Run the source `times` times in total, one after another.
  pub fn repeat(&self, times: usize) -> Observable<T> {
    if times == 0 {
      return observable::empty();
    }
    self.repeat_when(move |signals| {
      let runs = AtomicUsize::new(1);
      signals.take_while(move |_| runs.fetch_add(1, Ordering::AcqRel) < times)
    })
  }

  /// Resubscribe after an error, at most `count` times. The last error is
  /// delivered once the retries are used up.
  pub fn retry(&self, count: usize) -> Observable<T> {
    self.retry_when(move |errors| {
      let attempts = AtomicUsize::new(0);
      errors.try_map(move |err| {
        if attempts.fetch_add(1, Ordering::AcqRel) < count {
          Ok(())
        } else {
          Err(err)
        }
      })
    })
  }
}

/// Which terminal signal of the source is turned into a redo signal.
trait RedoSignal: Send + Sync + 'static {
  type Signal: Clone + Send + 'static;

  /// `Some` when a completion should be redone.
  fn on_complete() -> Option<Self::Signal>;

  /// `Ok` when an error should be redone, `Err` to pass it on.
  fn on_error(err: RxError) -> Result<Self::Signal, RxError>;
}

struct Repeat;

impl RedoSignal for Repeat {
  type Signal = ();

  fn on_complete() -> Option<()> { Some(()) }

  fn on_error(err: RxError) -> Result<(), RxError> { Err(err) }
}

struct Retry;

impl RedoSignal for Retry {
  type Signal = RxError;

  fn on_complete() -> Option<RxError> { None }

  fn on_error(err: RxError) -> Result<RxError, RxError> { Ok(err) }
}

struct RedoOp<T, K, H> {
  source: Observable<T>,
  handler: Arc<H>,
  _kind: PhantomData<fn() -> K>,
}

impl<T, K, S, H> ObservableSource<T> for RedoOp<T, K, H>
where
  T: Send + 'static,
  K: RedoSignal,
  S: Send + 'static,
  H: Fn(Observable<K::Signal>) -> Observable<S> + Send + Sync + 'static,
{
  fn subscribe_actual(&self, mut observer: BoxedObserver<T>) {
    let signals = PublishSubject::new();
    let trigger = (self.handler)(signals.as_observable());
    let state = Arc::new(RedoState::<T, K> {
      downstream: DownstreamSlot::empty(),
      source: self.source.clone(),
      signals,
      upstream: DisposableSlot::new(),
      trigger: DisposableSlot::new(),
      worker: scheduler::trampoline().create_worker(),
      active: AtomicBool::new(false),
      done: AtomicBool::new(false),
      disposed: AtomicBool::new(false),
    });
    observer.on_subscribe(Upstream::Plain(state.clone()));
    if state.is_disposed() {
      return;
    }
    state.downstream.install(observer);
    trigger.subscribe_with(TriggerObserver { state: state.clone() });
    state.subscribe_next();
  }
}

struct RedoState<T, K: RedoSignal> {
  downstream: DownstreamSlot<T>,
  source: Observable<T>,
  signals: PublishSubject<K::Signal>,
  upstream: DisposableSlot,
  trigger: DisposableSlot,
  worker: WorkerRef,
  /// A subscription to the source is live.
  active: AtomicBool,
  done: AtomicBool,
  disposed: AtomicBool,
}

impl<T: Send + 'static, K: RedoSignal> RedoState<T, K> {
  fn subscribe_next(self: &Arc<Self>) {
    let state = self.clone();
    self.worker.schedule(
      Box::new(move || {
        if state.is_disposed() || state.done.load(Ordering::Acquire) {
          return;
        }
        if !state.active.swap(true, Ordering::AcqRel) {
          tracing::trace!("redo subscribing to source");
          state.source.subscribe_with(RedoObserver { state: state.clone(), subscribed: false });
        }
      }),
      Duration::ZERO,
    );
  }

  /// The source ended with a signal to redo.
  fn signal(&self, signal: K::Signal) {
    self.active.store(false, Ordering::Release);
    self.signals.next(signal);
  }

  fn finish(&self, result: Result<(), RxError>) {
    if self.done.swap(true, Ordering::AcqRel) {
      if let Err(err) = result {
        plugins::on_error(err);
      }
      return;
    }
    self.trigger.dispose();
    self.upstream.dispose();
    self.worker.dispose();
    match result {
      Ok(()) => self.downstream.complete(),
      Err(err) => self.downstream.error(err),
    }
  }
}

impl<T: Send + 'static, K: RedoSignal> Disposable for RedoState<T, K> {
  fn dispose(&self) {
    if self.disposed.swap(true, Ordering::AcqRel) {
      return;
    }
    self.upstream.dispose();
    self.trigger.dispose();
    self.worker.dispose();
    self.downstream.release();
  }

  fn is_disposed(&self) -> bool { self.disposed.load(Ordering::Acquire) }
}

// ==================== Observers ====================

/// Subscribed to the source, once per run.
struct RedoObserver<T, K: RedoSignal> {
  state: Arc<RedoState<T, K>>,
  subscribed: bool,
}

impl<T: Send + 'static, K: RedoSignal> Observer<T> for RedoObserver<T, K> {
  fn on_subscribe(&mut self, upstream: Upstream<T>) {
    if self.subscribed {
      upstream.dispose();
      self.state.finish(Err(RxError::multiple_subscription()));
      return;
    }
    self.subscribed = true;
    // The previous run already terminated, its handle is just dropped.
    self.state.upstream.replace(upstream.disposable());
  }

  fn next(&mut self, value: T) { self.state.downstream.next(value); }

  fn error(self: Box<Self>, err: RxError) {
    match K::on_error(err) {
      Ok(signal) => self.state.signal(signal),
      Err(err) => self.state.finish(Err(err)),
    }
  }

  fn complete(self: Box<Self>) {
    match K::on_complete() {
      Some(signal) => self.state.signal(signal),
      None => self.state.finish(Ok(())),
    }
  }
}

struct TriggerObserver<T, K: RedoSignal> {
  state: Arc<RedoState<T, K>>,
}

impl<T: Send + 'static, K: RedoSignal, S: Send + 'static> Observer<S> for TriggerObserver<T, K> {
  fn on_subscribe(&mut self, upstream: Upstream<S>) {
    if let Err(err) = self.state.trigger.set_once(upstream.disposable()) {
      self.state.finish(Err(err));
    }
  }

  fn next(&mut self, _: S) { self.state.subscribe_next(); }

  fn error(self: Box<Self>, err: RxError) { self.state.finish(Err(err)) }

  fn complete(self: Box<Self>) { self.state.finish(Ok(())) }
}

#[cfg(test)]
mod tests {
  use std::sync::atomic::AtomicI32;

  use super::*;
  use crate::{
    observable::Emitter,
    testing::{check_disposed, check_double_on_subscribe},
  };

  #[test]
  fn counted_repeat_runs_four_times() {
    let runs = Arc::new(AtomicUsize::new(0));
    let r = runs.clone();
    observable::from_action::<(), _>(move || {
      r.fetch_add(1, Ordering::SeqCst);
      Ok(())
    })
    .repeat_when(|signals| {
      let left = AtomicI32::new(3);
      signals.take_while(move |_| left.fetch_sub(1, Ordering::SeqCst) != 0)
    })
    .test()
    .assert_result(&[]);
    assert_eq!(runs.load(Ordering::SeqCst), 4);
  }

  #[test]
  fn many_synchronous_repeats_do_not_grow_the_stack() {
    let to = observable::just(1)
      .repeat_when(|signals| {
        let left = AtomicUsize::new(9_999);
        signals.take_while(move |_| left.fetch_sub(1, Ordering::SeqCst) > 0)
      })
      .test();
    to.assert_no_errors().assert_complete().assert_value_count(10_000);
  }

  #[test]
  fn repeat_passes_errors_through() {
    observable::error::<i32>("boom".into())
      .repeat_when(|signals| signals)
      .test()
      .assert_failure("boom", &[]);
  }

  #[test]
  fn trigger_error_ends_the_stream() {
    observable::just(1)
      .repeat_when(|signals| signals.try_map(|_| Err::<(), _>("stop".into())))
      .test()
      .assert_failure("stop", &[1]);
  }

  #[test]
  fn retry_when_resubscribes_on_error() {
    let attempts = Arc::new(AtomicUsize::new(0));
    let a = attempts.clone();
    observable::create(move |e: Emitter<i32>| {
      if a.fetch_add(1, Ordering::SeqCst) < 2 {
        e.error("flaky".into());
      } else {
        e.next(7);
        e.complete();
      }
    })
    .retry_when(|errors| errors)
    .test()
    .assert_result(&[7]);
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
  }

  #[test]
  fn retry_when_sees_the_errors() {
    let seen = Arc::new(parking_lot::Mutex::new(vec![]));
    let s = seen.clone();
    observable::error::<i32>("nope".into())
      .retry_when(move |errors| {
        let s = s.clone();
        errors.take(2).map(move |err| s.lock().push(err.to_string()))
      })
      .test()
      .assert_result(&[]);
    assert_eq!(*seen.lock(), vec!["nope".to_string(), "nope".to_string()]);
  }

  #[test]
  fn retry_gives_up_with_the_last_error() {
    let attempts = Arc::new(AtomicUsize::new(0));
    let a = attempts.clone();
    observable::create(move |e: Emitter<i32>| {
      let n = a.fetch_add(1, Ordering::SeqCst);
      e.error(format!("attempt {n}").into());
    })
    .retry(2)
    .test()
    .assert_failure("attempt 2", &[]);
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
  }

  #[test]
  fn repeat_counts_total_runs() {
    observable::from_iter(vec![1, 2]).repeat(3).test().assert_result(&[1, 2, 1, 2, 1, 2]);
    observable::just(1).repeat(0).test().assert_result(&[]);
  }

  #[test]
  fn dispose_stops_resubscription() {
    let scheduler = crate::scheduler::TestScheduler::new();
    let to = observable::timer(Duration::from_millis(10), Arc::new(scheduler.clone()))
      .repeat_when(|signals| signals)
      .test();
    scheduler.advance_by(Duration::from_millis(25));
    to.assert_values(&[0, 0]);
    to.dispose();
    scheduler.advance_by(Duration::from_millis(100));
    to.assert_values(&[0, 0]).assert_not_complete();
    assert_eq!(scheduler.pending_count(), 0);
  }

  #[test]
  fn consumer_pushing_into_the_source() {
    let subject = crate::subject::PublishSubject::new();
    let echo = subject.clone();
    let seen = Arc::new(parking_lot::Mutex::new(vec![]));
    let s = seen.clone();
    let _d = subject.as_observable().retry_when(|errors| errors).subscribe(move |v: i32| {
      s.lock().push(v);
      if v < 3 {
        echo.next(v + 1);
      }
    });
    subject.next(1);
    assert_eq!(*seen.lock(), vec![1, 2, 3]);
  }

  struct SubscribesTwice;

  impl ObservableSource<()> for SubscribesTwice {
    fn subscribe_actual(&self, mut observer: BoxedObserver<()>) {
      observer.on_subscribe(Upstream::Plain(crate::disposable::empty()));
      observer.on_subscribe(Upstream::Plain(crate::disposable::empty()));
    }
  }

  #[test]
  fn trigger_subscribed_twice_fails_the_stream() {
    let to = observable::never::<i32>().repeat_when(|_| Observable::new(SubscribesTwice)).test();
    to.assert_error(|e| e.is_protocol_violation(crate::error::ProtocolViolation::MultipleSubscription));
  }

  #[test]
  fn dispose_handle() {
    check_disposed(observable::never::<i32>().repeat_when(|signals| signals));
  }

  #[test]
  fn double_on_subscribe() {
    check_double_on_subscribe(|o: Observable<i32>| o.retry_when(|errors| errors));
  }
}
