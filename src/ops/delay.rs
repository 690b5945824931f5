use std::sync::Arc;

use crate::{
  disposable::{Disposable, DisposableSlot},
  error::RxError,
  fusion::Upstream,
  observable::{Observable, ObservableSource},
  observer::{BoxedObserver, DownstreamSlot, Observer},
  scheduler::{Duration, SchedulerRef, WorkerRef},
};

impl<T: Send + 'static> Observable<T> {
  /// Shift every value and the completion by `delay`. An error is delivered
  /// right away and drops the values still waiting.
  pub fn delay(&self, delay: Duration, scheduler: SchedulerRef) -> Observable<T> {
    self.delay_with(delay, scheduler, false)
  }

  /// With `delay_error` the error is shifted like the values.
  pub fn delay_with(&self, delay: Duration, scheduler: SchedulerRef, delay_error: bool) -> Observable<T> {
    Observable::new(DelayOp { source: self.clone(), delay, scheduler, delay_error })
  }
}

struct DelayOp<T> {
  source: Observable<T>,
  delay: Duration,
  scheduler: SchedulerRef,
  delay_error: bool,
}

impl<T: Send + 'static> ObservableSource<T> for DelayOp<T> {
  fn subscribe_actual(&self, mut observer: BoxedObserver<T>) {
    let state = Arc::new(DelayState {
      downstream: DownstreamSlot::empty(),
      upstream: DisposableSlot::new(),
      worker: self.scheduler.create_worker(),
    });
    observer.on_subscribe(Upstream::Plain(state.clone()));
    if state.is_disposed() {
      return;
    }
    state.downstream.install(observer);
    self.source.subscribe_with(DelayObserver { state, delay: self.delay, delay_error: self.delay_error });
  }
}

struct DelayState<T> {
  downstream: DownstreamSlot<T>,
  upstream: DisposableSlot,
  /// Every signal goes through the same worker, so they keep their order.
  worker: WorkerRef,
}

impl<T: Send + 'static> Disposable for DelayState<T> {
  fn dispose(&self) {
    self.upstream.dispose();
    self.worker.dispose();
    self.downstream.release();
  }

  fn is_disposed(&self) -> bool { self.worker.is_disposed() }
}

struct DelayObserver<T> {
  state: Arc<DelayState<T>>,
  delay: Duration,
  delay_error: bool,
}

impl<T: Send + 'static> Observer<T> for DelayObserver<T> {
  fn on_subscribe(&mut self, upstream: Upstream<T>) {
    if let Err(err) = self.state.upstream.set_once(upstream.disposable()) {
      // Pending values are dropped; the violation is not delayed.
      self.state.worker.dispose();
      self.state.downstream.error(err);
    }
  }

  fn next(&mut self, value: T) {
    let state = self.state.clone();
    self.state.worker.schedule(
      Box::new(move || {
        state.downstream.next(value);
      }),
      self.delay,
    );
  }

  fn error(self: Box<Self>, err: RxError) {
    let delay = if self.delay_error { self.delay } else { Duration::ZERO };
    let state = self.state.clone();
    self.state.worker.schedule(
      Box::new(move || {
        state.downstream.error(err);
        state.worker.dispose();
      }),
      delay,
    );
  }

  fn complete(self: Box<Self>) {
    let state = self.state.clone();
    self.state.worker.schedule(
      Box::new(move || {
        state.downstream.complete();
        state.worker.dispose();
      }),
      self.delay,
    );
  }
}
