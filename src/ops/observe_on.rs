//! Move delivery onto a scheduler worker.
//!
//! Upstream signals land in a queue: the upstream's own queue when it grants
//! fusion across the thread boundary, otherwise an unbounded buffer. A drain
//! task on the worker empties it in order. At most one drain task is queued or
//! running at any time (`wip`). Downstream consumers may fuse in ASYNC mode and
//! poll that queue themselves from the worker.

use std::sync::{
  atomic::{AtomicBool, AtomicUsize, Ordering},
  Arc,
};

use parking_lot::Mutex;

use crate::{
  disposable::{Disposable, DisposableSlot},
  error::RxError,
  fusion::{FusedQueue, FusionMode, QueueSubscription, Upstream},
  observable::{Observable, ObservableSource},
  observer::{BoxedObserver, DownstreamSlot, Observer},
  plugins,
  scheduler::{Duration, SchedulerRef, WorkerRef},
};

impl<T: Send + 'static> Observable<T> {
  /// Deliver every signal on a worker of `scheduler`. An error skips the
  /// values still queued.
  pub fn observe_on(&self, scheduler: SchedulerRef) -> Observable<T> { self.observe_on_with(scheduler, false) }

  /// With `delay_error` the queued values are delivered before the error.
  pub fn observe_on_with(&self, scheduler: SchedulerRef, delay_error: bool) -> Observable<T> {
    Observable::new(ObserveOnOp { source: self.clone(), scheduler, delay_error })
  }
}

struct ObserveOnOp<T> {
  source: Observable<T>,
  scheduler: SchedulerRef,
  delay_error: bool,
}

impl<T: Send + 'static> ObservableSource<T> for ObserveOnOp<T> {
  fn subscribe_actual(&self, mut observer: BoxedObserver<T>) {
    let state = Arc::new(ObserveOnState {
      worker: self.scheduler.create_worker(),
      downstream: DownstreamSlot::empty(),
      upstream: DisposableSlot::new(),
      queue: Mutex::new(None),
      error: Mutex::new(None),
      delay_error: self.delay_error,
      output_fused: AtomicBool::new(false),
      done: AtomicBool::new(false),
      cancelled: AtomicBool::new(false),
      wip: AtomicUsize::new(0),
    });
    observer.on_subscribe(Upstream::Fused(state.clone()));
    if state.is_disposed() {
      return;
    }
    state.downstream.install(observer);
    self.source.subscribe_with(ObserveOnObserver { state });
  }
}

struct ObserveOnState<T> {
  worker: WorkerRef,
  downstream: DownstreamSlot<T>,
  upstream: DisposableSlot,
  queue: Mutex<Option<FusedQueue<T>>>,
  error: Mutex<Option<RxError>>,
  delay_error: bool,
  /// The downstream polls us instead of receiving `next`.
  output_fused: AtomicBool,
  done: AtomicBool,
  cancelled: AtomicBool,
  wip: AtomicUsize,
}

impl<T: Send + 'static> ObserveOnState<T> {
  fn schedule(self: &Arc<Self>) {
    if self.wip.fetch_add(1, Ordering::AcqRel) == 0 {
      let state = self.clone();
      self.worker.schedule(Box::new(move || state.run()), Duration::ZERO);
    }
  }

  fn run(&self) {
    if self.output_fused.load(Ordering::Acquire) {
      self.run_fused();
    } else {
      self.run_normal();
    }
  }

  fn current_queue(&self) -> Option<FusedQueue<T>> { self.queue.lock().clone() }

  fn run_normal(&self) {
    let mut missed = 1;
    loop {
      loop {
        let done = self.done.load(Ordering::Acquire);
        let polled = match self.current_queue() {
          Some(queue) => queue.poll(),
          None => Ok(None),
        };
        let value = match polled {
          Ok(value) => value,
          Err(err) => {
            // A fused upstream failed while being polled.
            self.upstream.dispose();
            self.clear_queue();
            self.downstream.error(err);
            self.worker.dispose();
            return;
          }
        };
        if self.check_terminated(done, value.is_none()) {
          return;
        }
        match value {
          Some(value) => {
            self.downstream.next(value);
          }
          None => break,
        }
      }
      missed = self.wip.fetch_sub(missed, Ordering::AcqRel) - missed;
      if missed == 0 {
        return;
      }
    }
  }

  fn run_fused(&self) {
    let mut missed = 1;
    loop {
      if self.cancelled.load(Ordering::Acquire) {
        return;
      }
      let done = self.done.load(Ordering::Acquire);
      if done && !self.delay_error {
        let err = self.error.lock().take();
        if let Some(err) = err {
          self.downstream.error(err);
          self.worker.dispose();
          return;
        }
      }
      self.downstream.ready();
      if done {
        let err = self.error.lock().take();
        match err {
          Some(err) => self.downstream.error(err),
          None => self.downstream.complete(),
        }
        self.worker.dispose();
        return;
      }
      missed = self.wip.fetch_sub(missed, Ordering::AcqRel) - missed;
      if missed == 0 {
        return;
      }
    }
  }

  /// Deliver the terminal signal once it is due. Only for the drain task.
  fn check_terminated(&self, done: bool, empty: bool) -> bool {
    if self.cancelled.load(Ordering::Acquire) {
      self.clear_queue();
      self.downstream.release();
      return true;
    }
    if !done {
      return false;
    }
    if self.delay_error {
      if !empty {
        return false;
      }
      let err = self.error.lock().take();
      match err {
        Some(err) => self.downstream.error(err),
        None => self.downstream.complete(),
      }
    } else {
      let err = self.error.lock().take();
      match err {
        Some(err) => {
          self.clear_queue();
          self.downstream.error(err);
        }
        None if empty => self.downstream.complete(),
        None => return false,
      }
    }
    self.worker.dispose();
    true
  }

  fn clear_queue(&self) {
    if let Some(queue) = self.current_queue() {
      queue.clear();
    }
  }
}

impl<T: Send + 'static> Disposable for ObserveOnState<T> {
  fn dispose(&self) {
    if self.cancelled.swap(true, Ordering::AcqRel) {
      return;
    }
    self.upstream.dispose();
    // A queued drain task is cancelled with the worker and will not release
    // the downstream itself.
    self.worker.dispose();
    self.clear_queue();
    self.downstream.release();
  }

  fn is_disposed(&self) -> bool { self.cancelled.load(Ordering::Acquire) }
}

impl<T: Send + 'static> QueueSubscription<T> for ObserveOnState<T> {
  fn request_fusion(&self, mode: FusionMode) -> FusionMode {
    if mode.contains(FusionMode::ASYNC) {
      self.output_fused.store(true, Ordering::Release);
      FusionMode::ASYNC
    } else {
      FusionMode::NONE
    }
  }

  fn poll(&self) -> Result<Option<T>, RxError> {
    match self.current_queue() {
      Some(queue) => queue.poll(),
      None => Ok(None),
    }
  }

  fn is_empty(&self) -> bool { self.current_queue().map_or(true, |queue| queue.is_empty()) }

  fn clear(&self) { self.clear_queue() }
}

struct ObserveOnObserver<T> {
  state: Arc<ObserveOnState<T>>,
}

impl<T: Send + 'static> Observer<T> for ObserveOnObserver<T> {
  fn on_subscribe(&mut self, upstream: Upstream<T>) {
    let state = &self.state;
    match state.upstream.set_once(upstream.disposable()) {
      Ok(true) => {}
      Ok(false) => return,
      Err(err) => {
        if !state.done.swap(true, Ordering::AcqRel) {
          *state.error.lock() = Some(err);
          state.schedule();
        } else {
          plugins::on_error(err);
        }
        return;
      }
    }
    if let Some(queue) = upstream.queue() {
      let mode = queue.request_fusion(FusionMode::ANY | FusionMode::BOUNDARY);
      if mode == FusionMode::SYNC {
        *state.queue.lock() = Some(FusedQueue::Upstream(queue));
        state.done.store(true, Ordering::Release);
        state.schedule();
        return;
      }
      if mode == FusionMode::ASYNC {
        *state.queue.lock() = Some(FusedQueue::Upstream(queue));
        return;
      }
    }
    *state.queue.lock() = Some(FusedQueue::unbounded());
  }

  fn next(&mut self, value: T) {
    let state = &self.state;
    if state.done.load(Ordering::Acquire) {
      return;
    }
    if let Some(FusedQueue::Owned(buffer)) = state.current_queue() {
      buffer.push(value);
    }
    state.schedule();
  }

  fn error(self: Box<Self>, err: RxError) {
    let state = &self.state;
    if state.done.load(Ordering::Acquire) {
      plugins::on_error(err);
      return;
    }
    *state.error.lock() = Some(err);
    state.done.store(true, Ordering::Release);
    state.schedule();
  }

  fn complete(self: Box<Self>) {
    self.state.done.store(true, Ordering::Release);
    self.state.schedule();
  }

  fn ready(&mut self) { self.state.schedule() }
}

#[cfg(test)]
mod tests {
  use std::thread;

  use super::*;
  use crate::{
    observable,
    scheduler::{self, TestScheduler},
    subject::PublishSubject,
    testing::{check_disposed, check_double_on_subscribe, TestObserver},
  };

  #[test]
  fn delivers_on_the_worker_thread() {
    let threads = Arc::new(Mutex::new(vec![]));
    let t = threads.clone();
    let to = observable::from_iter(0..100)
      .observe_on(scheduler::single())
      .do_after_next(move |_| {
        t.lock().push(thread::current().id());
        Ok(())
      })
      .test();
    assert!(to.await_done(Duration::from_secs(5)));
    to.assert_result(&(0..100).collect::<Vec<_>>());
    let threads = threads.lock();
    assert!(threads.iter().all(|id| *id != thread::current().id()));
    assert!(threads.windows(2).all(|w| w[0] == w[1]));
  }

  #[test]
  fn waits_for_the_worker() {
    let scheduler = TestScheduler::new();
    let subject = PublishSubject::new();
    let to = subject.as_observable().observe_on(Arc::new(scheduler.clone())).test();
    subject.next(1);
    subject.next(2);
    to.assert_values(&[]);
    scheduler.trigger_actions();
    to.assert_values(&[1, 2]);
    subject.complete();
    to.assert_not_complete();
    scheduler.trigger_actions();
    to.assert_result(&[1, 2]);
  }

  #[test]
  fn error_skips_queued_values() {
    let scheduler = TestScheduler::new();
    let subject = PublishSubject::new();
    let to = subject.as_observable().observe_on(Arc::new(scheduler.clone())).test();
    subject.next(1);
    subject.next(2);
    subject.error("boom".into());
    scheduler.trigger_actions();
    to.assert_failure("boom", &[]);
  }

  #[test]
  fn delayed_error_keeps_queued_values() {
    let scheduler = TestScheduler::new();
    let subject = PublishSubject::new();
    let to = subject.as_observable().observe_on_with(Arc::new(scheduler.clone()), true).test();
    subject.next(1);
    subject.next(2);
    subject.error("boom".into());
    scheduler.trigger_actions();
    to.assert_failure("boom", &[1, 2]);
  }

  #[test]
  fn sync_fused_upstream_is_polled_on_the_worker() {
    let scheduler = TestScheduler::new();
    let to = observable::from_iter(vec![1, 2, 3]).observe_on(Arc::new(scheduler.clone())).test();
    to.assert_values(&[]);
    scheduler.trigger_actions();
    to.assert_result(&[1, 2, 3]);
  }

  #[test]
  fn downstream_may_fuse_async() {
    let scheduler = TestScheduler::new();
    let subject = PublishSubject::new();
    let to = TestObserver::with_fusion(FusionMode::ANY);
    subject.as_observable().observe_on(Arc::new(scheduler.clone())).subscribe_with(to.clone());
    assert_eq!(to.fusion_mode(), FusionMode::ASYNC);
    subject.next(1);
    subject.complete();
    scheduler.trigger_actions();
    to.assert_result(&[1]);
  }

  #[test]
  fn dispose_drops_pending_values() {
    let scheduler = TestScheduler::new();
    let subject = PublishSubject::new();
    let to = subject.as_observable().observe_on(Arc::new(scheduler.clone())).test();
    subject.next(1);
    to.dispose();
    assert!(!subject.has_observers());
    scheduler.trigger_actions();
    to.assert_values(&[]).assert_not_complete();
  }

  #[test]
  fn dispose_handle() { check_disposed(observable::never::<i32>().observe_on(scheduler::trampoline())); }

  #[test]
  fn double_on_subscribe() {
    check_double_on_subscribe(|o: Observable<i32>| o.observe_on(scheduler::trampoline()));
  }
}
