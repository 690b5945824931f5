use std::{sync::Arc, time::Duration};

use parking_lot::Mutex;

use crate::{
  disposable::{Disposable, DisposableSlot},
  fusion::Upstream,
  observable::{Observable, ObservableSource},
  observer::BoxedObserver,
  scheduler::SchedulerRef,
};

/// Emit `0` after `delay` on `scheduler`, then complete.
pub fn timer(delay: Duration, scheduler: SchedulerRef) -> Observable<u64> {
  Observable::new(Timer { delay, scheduler })
}

struct Timer {
  delay: Duration,
  scheduler: SchedulerRef,
}

impl ObservableSource<u64> for Timer {
  fn subscribe_actual(&self, mut observer: BoxedObserver<u64>) {
    let state = Arc::new(TimerState { downstream: Mutex::new(None), task: DisposableSlot::new() });
    observer.on_subscribe(Upstream::Plain(state.clone()));
    if state.is_disposed() {
      return;
    }
    *state.downstream.lock() = Some(observer);
    let fire = state.clone();
    let handle = self.scheduler.schedule_direct(Box::new(move || fire.fire()), self.delay);
    state.task.set(handle);
  }
}

struct TimerState {
  downstream: Mutex<Option<BoxedObserver<u64>>>,
  task: DisposableSlot,
}

impl TimerState {
  fn fire(&self) {
    let observer = self.downstream.lock().take();
    if let Some(mut observer) = observer {
      observer.next(0);
      if !self.is_disposed() {
        observer.complete();
      }
    }
  }
}

impl Disposable for TimerState {
  fn dispose(&self) {
    self.task.dispose();
    let observer = self.downstream.try_lock().and_then(|mut slot| slot.take());
    drop(observer);
  }

  fn is_disposed(&self) -> bool { self.task.is_disposed() }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::scheduler::{self, TestScheduler};

  #[test]
  fn fires_once_after_delay() {
    let scheduler = TestScheduler::new();
    let to = timer(Duration::from_millis(50), Arc::new(scheduler.clone())).test();
    scheduler.advance_by(Duration::from_millis(49));
    to.assert_values(&[]).assert_not_complete();
    scheduler.advance_by(Duration::from_millis(1));
    to.assert_result(&[0]);
  }

  #[test]
  fn dispose_before_due_cancels() {
    let scheduler = TestScheduler::new();
    let to = timer(Duration::from_millis(50), Arc::new(scheduler.clone())).test();
    to.dispose();
    assert_eq!(scheduler.pending_count(), 0);
    scheduler.advance_by(Duration::from_secs(1));
    to.assert_values(&[]).assert_not_complete().assert_no_errors();
  }

  #[test]
  fn trampoline_fires_inline() {
    timer(Duration::ZERO, scheduler::trampoline()).test().assert_result(&[0]);
  }

  #[test]
  fn threaded_timer_completes() {
    let to = timer(Duration::from_millis(5), scheduler::computation()).test();
    assert!(to.await_done(Duration::from_secs(5)));
    to.assert_result(&[0]);
  }
}
