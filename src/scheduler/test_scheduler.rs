//! Virtual time for deterministic tests of time-based operators.
//!
//! Nothing runs until the test moves the clock. Tasks then run synchronously
//! on the calling thread, in due-time order, with [`TestScheduler::now`]
//! reporting each task's due time while it runs.
//!
//! ```rust
//! use std::sync::Arc;
//!
//! use rxcore::prelude::*;
//!
//! let scheduler = TestScheduler::new();
//! let to = observable::timer(Duration::from_millis(100), Arc::new(scheduler.clone())).test();
//!
//! scheduler.advance_by(Duration::from_millis(99));
//! to.assert_values(&[]);
//! scheduler.advance_by(Duration::from_millis(1));
//! to.assert_result(&[0]);
//! ```

use std::{sync::Arc, time::Duration};

use parking_lot::Mutex;

use super::{
  task::{Job, JobQueue, PeriodicTask, ScheduledTask, Task},
  Scheduler, Worker, WorkerRef,
};
use crate::disposable::{self, CompositeDisposable, Disposable, DisposableRef};

// ==================== Internal State ====================

#[derive(Default)]
struct TestSchedulerState {
  virtual_time: Duration,
  jobs: JobQueue<Duration>,
}

// ==================== TestScheduler ====================

/// A scheduler driven by virtual time. Clones share the same clock and queue.
#[derive(Clone, Default)]
pub struct TestScheduler {
  state: Arc<Mutex<TestSchedulerState>>,
}

impl TestScheduler {
  pub fn new() -> Self { Self::default() }

  /// The current virtual time, starting at zero.
  pub fn now(&self) -> Duration { self.state.lock().virtual_time }

  /// Number of tasks waiting for the clock.
  pub fn pending_count(&self) -> usize { self.state.lock().jobs.len() }

  /// Move the clock forward by `delta`, running everything that falls due.
  pub fn advance_by(&self, delta: Duration) {
    let target = self.now() + delta;
    self.advance_to(target);
  }

  /// Move the clock to `target`, running everything that falls due. The
  /// clock never goes backwards.
  pub fn advance_to(&self, target: Duration) {
    loop {
      let next = {
        let mut state = self.state.lock();
        let next = state.jobs.pop_due(target);
        match &next {
          Some((_, due, _)) => state.virtual_time = state.virtual_time.max(*due),
          None => state.virtual_time = state.virtual_time.max(target),
        }
        next
      };
      let Some((id, due, job)) = next else { return };
      if let Some((period, job)) = job.run() {
        self.state.lock().jobs.reinsert(id, due + period, job);
      }
    }
  }

  /// Run the tasks due at the current time.
  pub fn trigger_actions(&self) { self.advance_to(self.now()) }

  /// Advance to the latest due time currently queued. Periodic tasks only
  /// run up to that point.
  pub fn flush(&self) {
    let last = self.state.lock().jobs.last_due();
    if let Some(last) = last {
      self.advance_to(last);
    }
  }

  fn submit(&self, job: Job, delay: Duration) {
    let task = job.task.clone();
    let id = {
      let mut state = self.state.lock();
      let due = state.virtual_time + delay;
      state.jobs.push(due, job)
    };
    let state = Arc::downgrade(&self.state);
    task.on_cleanup(move || {
      if let Some(state) = state.upgrade() {
        let purged = state.lock().jobs.remove(id);
        drop(purged);
      }
    });
  }
}

impl Scheduler for TestScheduler {
  fn create_worker(&self) -> WorkerRef {
    Arc::new(TestWorker { scheduler: self.clone(), tasks: Arc::new(CompositeDisposable::new()) })
  }
}

struct TestWorker {
  scheduler: TestScheduler,
  tasks: Arc<CompositeDisposable>,
}

impl TestWorker {
  fn submit(&self, job: Job, delay: Duration) -> DisposableRef {
    let task = job.task.clone();
    if !task.track_in(&self.tasks) {
      return disposable::disposed();
    }
    self.scheduler.submit(job, delay);
    task
  }
}

impl Disposable for TestWorker {
  fn dispose(&self) { self.tasks.dispose() }

  fn is_disposed(&self) -> bool { self.tasks.is_disposed() }
}

impl Worker for TestWorker {
  fn schedule(&self, task: Task, delay: Duration) -> DisposableRef {
    self.submit(Job::once(ScheduledTask::new(), task), delay)
  }

  fn schedule_periodic(
    &self,
    task: PeriodicTask,
    initial_delay: Duration,
    period: Duration,
  ) -> DisposableRef {
    self.submit(Job::periodic(ScheduledTask::new(), task, period), initial_delay)
  }
}

#[cfg(test)]
mod tests {
  use std::sync::atomic::{AtomicUsize, Ordering};

  use super::*;

  #[test]
  fn nothing_runs_until_time_advances() {
    let scheduler = TestScheduler::new();
    let hits = Arc::new(AtomicUsize::new(0));
    let h = hits.clone();
    scheduler.schedule_direct(
      Box::new(move || {
        h.fetch_add(1, Ordering::SeqCst);
      }),
      Duration::from_millis(10),
    );
    assert_eq!(scheduler.pending_count(), 1);
    scheduler.advance_by(Duration::from_millis(9));
    assert_eq!(hits.load(Ordering::SeqCst), 0);
    scheduler.advance_by(Duration::from_millis(1));
    assert_eq!(hits.load(Ordering::SeqCst), 1);
    assert_eq!(scheduler.now(), Duration::from_millis(10));
    assert_eq!(scheduler.pending_count(), 0);
  }

  #[test]
  fn clock_reads_due_time_inside_tasks() {
    let scheduler = TestScheduler::new();
    let seen = Arc::new(Mutex::new(vec![]));
    for ms in [30u64, 10, 20] {
      let (s, clock) = (seen.clone(), scheduler.clone());
      scheduler.schedule_direct(Box::new(move || s.lock().push(clock.now())), Duration::from_millis(ms));
    }
    scheduler.advance_to(Duration::from_secs(1));
    let expected: Vec<_> = [10u64, 20, 30].iter().map(|ms| Duration::from_millis(*ms)).collect();
    assert_eq!(*seen.lock(), expected);
    assert_eq!(scheduler.now(), Duration::from_secs(1));
  }

  #[test]
  fn zero_delay_needs_a_trigger() {
    let scheduler = TestScheduler::new();
    let hits = Arc::new(AtomicUsize::new(0));
    let h = hits.clone();
    scheduler.schedule_direct(
      Box::new(move || {
        h.fetch_add(1, Ordering::SeqCst);
      }),
      Duration::ZERO,
    );
    assert_eq!(hits.load(Ordering::SeqCst), 0);
    scheduler.trigger_actions();
    assert_eq!(hits.load(Ordering::SeqCst), 1);
  }

  #[test]
  fn periodic_runs_at_fixed_rate() {
    let scheduler = TestScheduler::new();
    let hits = Arc::new(AtomicUsize::new(0));
    let h = hits.clone();
    let handle = scheduler.schedule_periodic_direct(
      Box::new(move || {
        h.fetch_add(1, Ordering::SeqCst);
      }),
      Duration::from_millis(5),
      Duration::from_millis(10),
    );
    scheduler.advance_by(Duration::from_millis(35));
    assert_eq!(hits.load(Ordering::SeqCst), 4);
    handle.dispose();
    assert_eq!(scheduler.pending_count(), 0);
    scheduler.advance_by(Duration::from_millis(100));
    assert_eq!(hits.load(Ordering::SeqCst), 4);
  }

  #[test]
  fn disposed_worker_drops_its_tasks() {
    let scheduler = TestScheduler::new();
    let worker = scheduler.create_worker();
    worker.schedule(Box::new(|| panic!("cancelled task ran")), Duration::from_millis(1));
    worker.dispose();
    assert_eq!(scheduler.pending_count(), 0);
    assert!(worker.schedule(Box::new(|| {}), Duration::ZERO).is_disposed());
    scheduler.flush();
  }
}
