//! Scheduler backed by a tokio runtime.
//!
//! Each worker owns one consumer task that runs its work items in order.
//! Delays and periods are driven by tokio timers. Work items are plain
//! blocking closures: a long-running item occupies a runtime thread.

use std::{
  panic::{self, AssertUnwindSafe},
  sync::Arc,
  time::Duration,
};

use parking_lot::Mutex;
use tokio::{runtime::Handle, sync::mpsc, task::JoinHandle};

use super::{
  task::{PeriodicTask, ScheduledTask, Task},
  Scheduler, Worker, WorkerRef,
};
use crate::{
  disposable::{self, CompositeDisposable, Disposable, DisposableRef},
  error::RxError,
  plugins,
};

#[derive(Clone)]
pub struct TokioScheduler {
  handle: Handle,
}

impl TokioScheduler {
  pub fn new(handle: Handle) -> Self { Self { handle } }

  /// The runtime this thread runs in, if any.
  pub fn current() -> Option<Self> { Handle::try_current().ok().map(Self::new) }
}

impl Scheduler for TokioScheduler {
  fn create_worker(&self) -> WorkerRef { Arc::new(TokioWorker::spawn(&self.handle)) }
}

struct TokioWorker {
  handle: Handle,
  sender: mpsc::UnboundedSender<Task>,
  consumer: JoinHandle<()>,
  tasks: Arc<CompositeDisposable>,
}

impl TokioWorker {
  fn spawn(handle: &Handle) -> Self {
    let (sender, mut receiver) = mpsc::unbounded_channel::<Task>();
    let consumer = handle.spawn(async move {
      while let Some(work) = receiver.recv().await {
        if panic::catch_unwind(AssertUnwindSafe(work)).is_err() {
          tracing::error!("task on tokio worker panicked");
          plugins::on_error(RxError::message("task on tokio worker panicked"));
        }
      }
    });
    Self { handle: handle.clone(), sender, consumer, tasks: Arc::new(CompositeDisposable::new()) }
  }

  fn send(sender: &mpsc::UnboundedSender<Task>, task: &Arc<ScheduledTask>, work: Task) {
    if sender.send(work).is_err() {
      task.dispose();
    }
  }
}

impl Disposable for TokioWorker {
  fn dispose(&self) {
    self.tasks.dispose();
    self.consumer.abort();
  }

  fn is_disposed(&self) -> bool { self.tasks.is_disposed() }
}

impl Drop for TokioWorker {
  fn drop(&mut self) { self.consumer.abort(); }
}

impl Worker for TokioWorker {
  fn schedule(&self, work: Task, delay: Duration) -> DisposableRef {
    let task = ScheduledTask::new();
    if !task.track_in(&self.tasks) {
      return disposable::disposed();
    }
    let st = task.clone();
    let run: Task = Box::new(move || st.run_once(work));
    if delay.is_zero() {
      Self::send(&self.sender, &task, run);
    } else {
      let (sender, st) = (self.sender.clone(), task.clone());
      let sleeper = self.handle.spawn(async move {
        tokio::time::sleep(delay).await;
        TokioWorker::send(&sender, &st, run);
      });
      task.on_cleanup(move || sleeper.abort());
    }
    task
  }

  fn schedule_periodic(
    &self,
    work: PeriodicTask,
    initial_delay: Duration,
    period: Duration,
  ) -> DisposableRef {
    let task = ScheduledTask::new();
    if !task.track_in(&self.tasks) {
      return disposable::disposed();
    }
    let work = Arc::new(Mutex::new(work));
    let (sender, st) = (self.sender.clone(), task.clone());
    let ticker = self.handle.spawn(async move {
      tokio::time::sleep(initial_delay).await;
      let mut interval = tokio::time::interval(period.max(Duration::from_nanos(1)));
      loop {
        interval.tick().await;
        if st.is_disposed() {
          return;
        }
        let (round, work) = (st.clone(), work.clone());
        let tick: Task = Box::new(move || {
          round.run_periodic(&mut work.lock());
        });
        if sender.send(tick).is_err() {
          st.dispose();
          return;
        }
      }
    });
    task.on_cleanup(move || ticker.abort());
    task
  }
}

#[cfg(test)]
mod tests {
  use std::sync::mpsc as std_mpsc;

  use super::*;

  fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_multi_thread().worker_threads(2).enable_all().build().unwrap()
  }

  #[test]
  fn worker_runs_in_order() {
    let rt = runtime();
    let worker = TokioScheduler::new(rt.handle().clone()).create_worker();
    let (tx, rx) = std_mpsc::channel();
    for i in 0..50 {
      let tx = tx.clone();
      worker.schedule(Box::new(move || tx.send(i).unwrap()), Duration::ZERO);
    }
    let got: Vec<i32> = (0..50).map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap()).collect();
    assert_eq!(got, (0..50).collect::<Vec<_>>());
    worker.dispose();
  }

  #[test]
  fn cancelled_delay_never_fires() {
    let rt = runtime();
    let scheduler = TokioScheduler::new(rt.handle().clone());
    let (tx, rx) = std_mpsc::channel::<()>();
    let handle = scheduler.schedule_direct(Box::new(move || tx.send(()).unwrap()), Duration::from_millis(30));
    handle.dispose();
    assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
  }

  #[test]
  fn periodic_stops_after_dispose() {
    let rt = runtime();
    let scheduler = TokioScheduler::new(rt.handle().clone());
    let (tx, rx) = std_mpsc::channel();
    let handle = scheduler.schedule_periodic_direct(
      Box::new(move || {
        let _ = tx.send(());
      }),
      Duration::ZERO,
      Duration::from_millis(5),
    );
    for _ in 0..3 {
      rx.recv_timeout(Duration::from_secs(5)).unwrap();
    }
    handle.dispose();
    std::thread::sleep(Duration::from_millis(30));
    while rx.try_recv().is_ok() {}
    std::thread::sleep(Duration::from_millis(30));
    assert!(rx.try_recv().is_err());
  }

  #[test]
  fn current_needs_a_runtime() { assert!(TokioScheduler::current().is_none()); }

  #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
  async fn timer_on_the_current_runtime() {
    let scheduler = TokioScheduler::current().unwrap();
    let to = crate::observable::timer(Duration::from_millis(5), std::sync::Arc::new(scheduler)).test();
    for _ in 0..500 {
      if to.is_terminated() {
        break;
      }
      tokio::time::sleep(Duration::from_millis(10)).await;
    }
    to.assert_result(&[0]);
  }
}
