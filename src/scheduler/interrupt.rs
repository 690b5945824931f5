//! Cooperative interruption of running tasks.
//!
//! Threads cannot be interrupted from the outside, so cancelling a task that
//! is already running raises a flag the task can observe. Work that waits or
//! loops for long should use [`sleep`] or poll [`is_interrupted`].

use std::{
  cell::RefCell,
  sync::Arc,
  time::{Duration, Instant},
};

use parking_lot::{Condvar, Mutex};

use crate::error::RxError;

#[derive(Default)]
pub(crate) struct Interrupt {
  raised: Mutex<bool>,
  cond: Condvar,
}

impl Interrupt {
  pub(crate) fn raise(&self) {
    *self.raised.lock() = true;
    self.cond.notify_all();
  }

  pub(crate) fn is_raised(&self) -> bool { *self.raised.lock() }

  /// Block for `timeout` or until raised. Returns true when raised.
  fn wait(&self, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    let mut raised = self.raised.lock();
    while !*raised {
      if self.cond.wait_until(&mut raised, deadline).timed_out() {
        break;
      }
    }
    *raised
  }
}

thread_local! {
  static CURRENT: RefCell<Option<Arc<Interrupt>>> = const { RefCell::new(None) };
}

/// Makes `interrupt` the current one until dropped, then restores the
/// previous one (tasks may run nested on a trampoline).
pub(crate) struct CurrentInterrupt(Option<Arc<Interrupt>>);

impl CurrentInterrupt {
  pub(crate) fn enter(interrupt: Arc<Interrupt>) -> Self {
    CurrentInterrupt(CURRENT.with(|c| c.replace(Some(interrupt))))
  }
}

impl Drop for CurrentInterrupt {
  fn drop(&mut self) {
    let previous = self.0.take();
    CURRENT.with(|c| *c.borrow_mut() = previous);
  }
}

/// Whether `interrupt` belongs to the task running on this thread.
pub(crate) fn is_current(interrupt: &Arc<Interrupt>) -> bool {
  CURRENT.with(|c| c.borrow().as_ref().is_some_and(|cur| Arc::ptr_eq(cur, interrupt)))
}

/// Whether the scheduled task running on this thread has been cancelled.
/// Always false outside scheduled tasks.
pub fn is_interrupted() -> bool {
  CURRENT.with(|c| c.borrow().as_ref().is_some_and(|cur| cur.is_raised()))
}

/// Sleep that ends early with [`RxError::Interrupted`] when the scheduled task
/// running on this thread is cancelled. Outside scheduled tasks it is a plain
/// sleep.
pub fn sleep(duration: Duration) -> Result<(), RxError> {
  let current = CURRENT.with(|c| c.borrow().clone());
  match current {
    Some(interrupt) => {
      if interrupt.wait(duration) {
        Err(RxError::Interrupted)
      } else {
        Ok(())
      }
    }
    None => {
      std::thread::sleep(duration);
      Ok(())
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn raised_interrupt_cuts_sleep_short() {
    let interrupt = Arc::new(Interrupt::default());
    let remote = interrupt.clone();
    let raiser = std::thread::spawn(move || {
      std::thread::sleep(Duration::from_millis(20));
      remote.raise();
    });
    let _current = CurrentInterrupt::enter(interrupt);
    let started = Instant::now();
    assert!(matches!(sleep(Duration::from_secs(5)), Err(RxError::Interrupted)));
    assert!(started.elapsed() < Duration::from_secs(4));
    assert!(is_interrupted());
    raiser.join().unwrap();
  }

  #[test]
  fn nesting_restores_previous() {
    let outer = Arc::new(Interrupt::default());
    let inner = Arc::new(Interrupt::default());
    let _o = CurrentInterrupt::enter(outer.clone());
    {
      let _i = CurrentInterrupt::enter(inner.clone());
      assert!(is_current(&inner));
    }
    assert!(is_current(&outer));
    assert!(!is_interrupted());
  }

  #[test]
  fn plain_sleep_outside_tasks() {
    assert!(!is_interrupted());
    assert!(sleep(Duration::from_millis(1)).is_ok());
  }
}
