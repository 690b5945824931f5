//! A dedicated thread that runs jobs in due-time order.

use std::{
  panic::{self, AssertUnwindSafe},
  sync::{Arc, Weak},
  thread,
  time::{Duration, Instant},
};

use parking_lot::{Condvar, Mutex};

use super::{
  task::{Job, JobQueue, PeriodicTask, ScheduledTask, Task},
  Worker,
};
use crate::{
  disposable::{self, CompositeDisposable, Disposable, DisposableRef},
  error::RxError,
  plugins,
};

#[derive(Clone)]
pub(crate) struct Lane {
  shared: Arc<LaneShared>,
}

struct LaneShared {
  name: String,
  queue: Mutex<LaneQueue>,
  wake: Condvar,
}

#[derive(Default)]
struct LaneQueue {
  jobs: JobQueue<Instant>,
  shutdown: bool,
}

impl Lane {
  pub(crate) fn spawn(name: String) -> Self {
    let shared = Arc::new(LaneShared {
      name: name.clone(),
      queue: Mutex::new(LaneQueue::default()),
      wake: Condvar::new(),
    });
    let runner = shared.clone();
    match thread::Builder::new().name(name.clone()).spawn(move || runner.run()) {
      Ok(_) => tracing::debug!(lane = %name, "scheduler lane started"),
      Err(err) => {
        tracing::error!(lane = %name, error = %err, "failed to spawn scheduler thread");
        shared.queue.lock().shutdown = true;
      }
    }
    Lane { shared }
  }

  /// Queue `job`. The job's task gets a hook that purges it when cancelled.
  pub(crate) fn submit(&self, job: Job, delay: Duration) {
    let task = job.task.clone();
    let due = Instant::now() + delay;
    let mut queue = self.shared.queue.lock();
    if queue.shutdown {
      drop(queue);
      task.dispose();
      return;
    }
    let id = queue.jobs.push(due, job);
    drop(queue);
    self.shared.wake.notify_one();

    let lane: Weak<LaneShared> = Arc::downgrade(&self.shared);
    task.on_cleanup(move || {
      if let Some(shared) = lane.upgrade() {
        let purged = shared.queue.lock().jobs.remove(id);
        drop(purged);
      }
    });
  }

  /// Stop the thread once its current job returns. Pending jobs are
  /// cancelled.
  pub(crate) fn shutdown(&self) {
    let pending = {
      let mut queue = self.shared.queue.lock();
      queue.shutdown = true;
      queue.jobs.drain()
    };
    self.shared.wake.notify_all();
    for job in pending {
      job.task.dispose();
    }
  }
}

impl LaneShared {
  fn run(self: Arc<Self>) {
    let mut queue = self.queue.lock();
    loop {
      if queue.shutdown {
        break;
      }
      match queue.jobs.pop_due(Instant::now()) {
        Some((id, due, job)) => {
          drop(queue);
          let again = run_guarded(&self.name, job);
          queue = self.queue.lock();
          if let Some((period, job)) = again {
            if queue.shutdown {
              drop(queue);
              job.task.dispose();
              drop(job);
              queue = self.queue.lock();
            } else {
              queue.jobs.reinsert(id, due + period, job);
            }
          }
        }
        None => match queue.jobs.next_due() {
          Some(due) => {
            self.wake.wait_until(&mut queue, due);
          }
          None => self.wake.wait(&mut queue),
        },
      }
    }
    drop(queue);
    tracing::debug!(lane = %self.name, "scheduler lane stopped");
  }
}

/// A panicking job must not take the lane down with it.
fn run_guarded(lane: &str, job: Job) -> Option<(Duration, Job)> {
  let task = job.task.clone();
  match panic::catch_unwind(AssertUnwindSafe(move || job.run())) {
    Ok(again) => again,
    Err(_) => {
      tracing::error!(lane = %lane, "scheduled task panicked");
      task.abandon();
      plugins::on_error(RxError::message(format!("task on lane {lane} panicked")));
      None
    }
  }
}

// ==================== Worker ====================

/// A worker backed by a lane. Shared-lane workers only cancel their own
/// tasks on dispose; a dedicated worker also stops the thread.
pub(crate) struct LaneWorker {
  lane: Lane,
  tasks: Arc<CompositeDisposable>,
  owns_lane: bool,
}

impl LaneWorker {
  pub(crate) fn shared(lane: Lane) -> Self {
    Self { lane, tasks: Arc::new(CompositeDisposable::new()), owns_lane: false }
  }

  pub(crate) fn dedicated(lane: Lane) -> Self {
    Self { lane, tasks: Arc::new(CompositeDisposable::new()), owns_lane: true }
  }

  fn submit(&self, job: Job, delay: Duration) -> DisposableRef {
    let task = job.task.clone();
    if !task.track_in(&self.tasks) {
      return disposable::disposed();
    }
    self.lane.submit(job, delay);
    task
  }
}

impl Disposable for LaneWorker {
  fn dispose(&self) {
    self.tasks.dispose();
    if self.owns_lane {
      self.lane.shutdown();
    }
  }

  fn is_disposed(&self) -> bool { self.tasks.is_disposed() }
}

impl Drop for LaneWorker {
  fn drop(&mut self) {
    if self.owns_lane {
      self.lane.shutdown();
    }
  }
}

impl Worker for LaneWorker {
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
  use std::sync::mpsc;

  use super::*;

  #[test]
  fn cancelled_job_is_purged_from_queue() {
    let lane = Lane::spawn("rx-test-purge".into());
    let worker = LaneWorker::shared(lane.clone());
    let handle = worker.schedule(Box::new(|| {}), Duration::from_secs(60));
    assert_eq!(lane.shared.queue.lock().jobs.len(), 1);
    handle.dispose();
    assert_eq!(lane.shared.queue.lock().jobs.len(), 0);
    assert!(worker.tasks.is_empty());
    lane.shutdown();
  }

  #[test]
  fn panicking_task_keeps_lane_alive() {
    let capture = crate::testing::capture_undeliverable();
    let lane = Lane::spawn("rx-test-panic".into());
    let worker = LaneWorker::shared(lane.clone());
    let (tx, rx) = mpsc::channel();
    worker.schedule(Box::new(|| panic!("boom")), Duration::ZERO);
    worker.schedule(Box::new(move || tx.send(()).unwrap()), Duration::ZERO);
    rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert!(capture.errors().iter().any(|e| e.root().to_string().contains("panicked")));
    lane.shutdown();
  }

  #[test]
  fn dedicated_worker_stops_its_thread() {
    let worker = LaneWorker::dedicated(Lane::spawn("rx-test-dedicated".into()));
    let pending = worker.schedule(Box::new(|| {}), Duration::from_secs(60));
    worker.dispose();
    assert!(pending.is_disposed());
    assert!(worker.is_disposed());
    assert!(worker.schedule(Box::new(|| {}), Duration::ZERO).is_disposed());
  }
}
