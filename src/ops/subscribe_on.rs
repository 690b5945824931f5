use std::sync::Arc;

use crate::{
  disposable::{Disposable, DisposableSlot},
  error::RxError,
  fusion::Upstream,
  observable::{Observable, ObservableSource},
  observer::{BoxedObserver, Observer},
  scheduler::{Duration, SchedulerRef},
};

impl<T: Send + 'static> Observable<T> {
  /// Subscribe to the upstream on `scheduler`. Subscription side effects of
  /// the source, and anything it emits synchronously, run there.
  pub fn subscribe_on(&self, scheduler: SchedulerRef) -> Observable<T> {
    Observable::new(SubscribeOnOp { source: self.clone(), scheduler })
  }
}

struct SubscribeOnOp<T> {
  source: Observable<T>,
  scheduler: SchedulerRef,
}

impl<T: Send + 'static> ObservableSource<T> for SubscribeOnOp<T> {
  fn subscribe_actual(&self, mut observer: BoxedObserver<T>) {
    let state = Arc::new(SubscribeOnState { upstream: DisposableSlot::new(), task: DisposableSlot::new() });
    observer.on_subscribe(Upstream::Plain(state.clone()));
    if state.is_disposed() {
      return;
    }
    let source = self.source.clone();
    let hop = state.clone();
    let handle = self.scheduler.schedule_direct(
      Box::new(move || source.subscribe_with(SubscribeOnObserver { observer: Some(observer), state: hop })),
      Duration::ZERO,
    );
    state.task.set(handle);
  }
}

struct SubscribeOnState {
  upstream: DisposableSlot,
  task: DisposableSlot,
}

impl Disposable for SubscribeOnState {
  fn dispose(&self) {
    self.task.dispose();
    self.upstream.dispose();
  }

  fn is_disposed(&self) -> bool { self.upstream.is_disposed() }
}

struct SubscribeOnObserver<T> {
  observer: Option<BoxedObserver<T>>,
  state: Arc<SubscribeOnState>,
}

impl<T: Send + 'static> Observer<T> for SubscribeOnObserver<T> {
  fn on_subscribe(&mut self, upstream: Upstream<T>) {
    if let Err(err) = self.state.upstream.set_once(upstream.disposable()) {
      if let Some(observer) = self.observer.take() {
        observer.error(err);
      }
    }
  }

  fn next(&mut self, value: T) {
    if let Some(observer) = self.observer.as_mut() {
      observer.next(value);
    }
  }

  fn error(self: Box<Self>, err: RxError) {
    match self.observer {
      Some(observer) => observer.error(err),
      None => crate::plugins::on_error(err),
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
  use std::thread;

  use parking_lot::Mutex;

  use super::*;
  use crate::{
    observable::{self, Emitter},
    scheduler::{self, TestScheduler},
    testing::{check_disposed, check_double_on_subscribe},
  };

  #[test]
  fn subscribes_on_the_scheduler_thread() {
    let subscribed_on = Arc::new(Mutex::new(None));
    let s = subscribed_on.clone();
    let to = observable::create(move |e: Emitter<i32>| {
      *s.lock() = Some(thread::current().id());
      e.next(1);
      e.complete();
    })
    .subscribe_on(scheduler::single())
    .test();
    assert!(to.await_done(Duration::from_secs(5)));
    to.assert_result(&[1]);
    assert_ne!(*subscribed_on.lock(), Some(thread::current().id()));
  }

  #[test]
  fn dispose_before_the_hop_skips_subscription() {
    let scheduler = TestScheduler::new();
    let subscribed = Arc::new(Mutex::new(false));
    let s = subscribed.clone();
    let to = observable::create(move |_: Emitter<i32>| *s.lock() = true)
      .subscribe_on(Arc::new(scheduler.clone()))
      .test();
    to.dispose();
    scheduler.trigger_actions();
    assert!(!*subscribed.lock());
    assert_eq!(scheduler.pending_count(), 0);
  }

  #[test]
  fn dispose_reaches_the_upstream() {
    let scheduler = TestScheduler::new();
    let upstream = Arc::new(Mutex::new(None));
    let u = upstream.clone();
    let to = observable::create(move |e: Emitter<i32>| *u.lock() = Some(e))
      .subscribe_on(Arc::new(scheduler.clone()))
      .test();
    scheduler.trigger_actions();
    let emitter = upstream.lock().take().unwrap();
    emitter.next(1);
    to.dispose();
    assert!(emitter.is_disposed());
    to.assert_values(&[1]);
  }

  #[test]
  fn dispose_handle() { check_disposed(observable::never::<i32>().subscribe_on(scheduler::trampoline())); }

  #[test]
  fn double_on_subscribe() {
    check_double_on_subscribe(|o: Observable<i32>| o.subscribe_on(scheduler::trampoline()));
  }
}
