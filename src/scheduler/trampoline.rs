//! Runs work on the thread that schedules it.
//!
//! The first task scheduled on an idle worker runs inside the `schedule`
//! call. Tasks scheduled while the worker is draining, including from inside
//! a running task, are queued and run after the current one returns. Deep
//! recursion through the scheduler therefore turns into a loop.

use std::{
  sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Arc,
  },
  thread,
  time::{Duration, Instant},
};

use parking_lot::Mutex;

use super::{
  task::{Job, JobQueue, PeriodicTask, ScheduledTask, Task},
  Scheduler, Worker, WorkerRef,
};
use crate::disposable::{Disposable, DisposableRef};

#[derive(Clone, Copy, Debug, Default)]
pub struct TrampolineScheduler;

impl Scheduler for TrampolineScheduler {
  fn create_worker(&self) -> WorkerRef { Arc::new(TrampolineWorker::default()) }
}

#[derive(Default)]
struct TrampolineWorker {
  queue: Arc<Mutex<JobQueue<Instant>>>,
  wip: AtomicUsize,
  disposed: AtomicBool,
}

enum Step {
  Run(u64, Instant, Job),
  Wait(Instant),
  Idle,
}

impl TrampolineWorker {
  fn enqueue(&self, job: Job, delay: Duration) -> DisposableRef {
    let task = job.task.clone();
    if self.disposed.load(Ordering::Acquire) {
      task.dispose();
      return task;
    }
    let id = self.queue.lock().push(Instant::now() + delay, job);
    let queue = Arc::downgrade(&self.queue);
    task.on_cleanup(move || {
      if let Some(queue) = queue.upgrade() {
        let purged = queue.lock().remove(id);
        drop(purged);
      }
    });
    if self.wip.fetch_add(1, Ordering::AcqRel) == 0 {
      self.drain();
    }
    task
  }

  fn drain(&self) {
    let mut missed = 1;
    loop {
      loop {
        if self.disposed.load(Ordering::Acquire) {
          return;
        }
        let step = {
          let mut queue = self.queue.lock();
          match queue.pop_due(Instant::now()) {
            Some((id, due, job)) => Step::Run(id, due, job),
            None => queue.next_due().map_or(Step::Idle, Step::Wait),
          }
        };
        match step {
          Step::Run(id, due, job) => {
            if let Some((period, job)) = job.run() {
              self.queue.lock().reinsert(id, due + period, job);
            }
          }
          Step::Wait(due) => thread::sleep(due.saturating_duration_since(Instant::now())),
          Step::Idle => break,
        }
      }
      missed = self.wip.fetch_sub(missed, Ordering::AcqRel) - missed;
      if missed == 0 {
        return;
      }
    }
  }
}

impl Disposable for TrampolineWorker {
  fn dispose(&self) {
    if !self.disposed.swap(true, Ordering::AcqRel) {
      let pending = self.queue.lock().drain();
      for job in pending {
        job.task.dispose();
      }
    }
  }

  fn is_disposed(&self) -> bool { self.disposed.load(Ordering::Acquire) }
}

impl Worker for TrampolineWorker {
  fn schedule(&self, task: Task, delay: Duration) -> DisposableRef {
    self.enqueue(Job::once(ScheduledTask::new(), task), delay)
  }

  fn schedule_periodic(
    &self,
    task: PeriodicTask,
    initial_delay: Duration,
    period: Duration,
  ) -> DisposableRef {
    self.enqueue(Job::periodic(ScheduledTask::new(), task, period), initial_delay)
  }
}
