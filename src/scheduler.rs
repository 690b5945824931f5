//! Where work runs.
//!
//! A [`Scheduler`] creates [`Worker`]s; a worker is one serial execution lane.
//! Tasks scheduled on the same worker run one after another in due-time order,
//! FIFO among equal due times. Every scheduled task returns a
//! [`Disposable`]: disposing before the task starts prevents it from running,
//! disposing while it runs raises an interrupt the task can observe through
//! [`sleep`] and [`is_interrupted`].
//!
//! Available schedulers:
//!
//! | Function | Behavior |
//! |----------|----------|
//! | [`trampoline()`] | runs on the calling thread, queueing reentrant work |
//! | [`single()`] | one shared background thread |
//! | [`computation()`] | fixed pool of serial lanes, workers assigned round-robin |
//! | [`new_thread()`] | a new thread per worker |
//! | [`TestScheduler`] | virtual time, driven by the test |
//! | `TokioScheduler` | tasks on a tokio runtime (feature `tokio-scheduler`) |
//!
//! A zero delay means "as soon as possible on the lane", never "inside the
//! caller's stack frame" once a lane is busy.

use std::sync::Arc;

use once_cell::sync::Lazy;

use crate::disposable::{Disposable, DisposableRef};

pub use std::time::Duration;

mod computation;
mod interrupt;
mod lane;
mod new_thread;
mod single;
mod task;
mod test_scheduler;
#[cfg(feature = "tokio-scheduler")]
mod tokio_scheduler;
mod trampoline;

pub use computation::ComputationScheduler;
pub use interrupt::{is_interrupted, sleep};
pub use new_thread::NewThreadScheduler;
pub use single::SingleScheduler;
pub use task::{PeriodicTask, Task};
pub use test_scheduler::TestScheduler;
#[cfg(feature = "tokio-scheduler")]
pub use tokio_scheduler::TokioScheduler;
pub use trampoline::TrampolineScheduler;

/// One serial execution lane. Disposing the worker cancels every task it
/// still holds.
pub trait Worker: Disposable {
  fn schedule(&self, task: Task, delay: Duration) -> DisposableRef;

  /// Run `task` after `initial_delay`, then every `period` at a fixed rate.
  fn schedule_periodic(
    &self,
    task: PeriodicTask,
    initial_delay: Duration,
    period: Duration,
  ) -> DisposableRef;
}

pub type WorkerRef = Arc<dyn Worker>;

pub trait Scheduler: Send + Sync {
  fn create_worker(&self) -> WorkerRef;

  /// Run one task on a worker of its own.
  fn schedule_direct(&self, task: Task, delay: Duration) -> DisposableRef {
    let worker = self.create_worker();
    let lane = worker.clone();
    let handle = worker.schedule(
      Box::new(move || {
        task();
        lane.dispose();
      }),
      delay,
    );
    Arc::new(DirectTask { worker, handle })
  }

  fn schedule_periodic_direct(
    &self,
    task: PeriodicTask,
    initial_delay: Duration,
    period: Duration,
  ) -> DisposableRef {
    let worker = self.create_worker();
    let handle = worker.schedule_periodic(task, initial_delay, period);
    Arc::new(DirectTask { worker, handle })
  }
}

pub type SchedulerRef = Arc<dyn Scheduler>;

/// A task together with the worker created for it.
struct DirectTask {
  worker: WorkerRef,
  handle: DisposableRef,
}

impl Disposable for DirectTask {
  fn dispose(&self) {
    self.handle.dispose();
    self.worker.dispose();
  }

  fn is_disposed(&self) -> bool { self.handle.is_disposed() }
}

static TRAMPOLINE: Lazy<SchedulerRef> = Lazy::new(|| Arc::new(TrampolineScheduler));
static SINGLE: Lazy<SchedulerRef> = Lazy::new(|| Arc::new(SingleScheduler::new()));
static COMPUTATION: Lazy<SchedulerRef> = Lazy::new(|| {
  Arc::new(ComputationScheduler::new(crate::config::RxConfig::global().computation_threads))
});
static NEW_THREAD: Lazy<SchedulerRef> = Lazy::new(|| Arc::new(NewThreadScheduler::new()));

pub fn trampoline() -> SchedulerRef { TRAMPOLINE.clone() }

pub fn single() -> SchedulerRef { SINGLE.clone() }

pub fn computation() -> SchedulerRef { COMPUTATION.clone() }

pub fn new_thread() -> SchedulerRef { NEW_THREAD.clone() }
