use std::sync::{
  atomic::{AtomicUsize, Ordering},
  Arc,
};

use super::{
  lane::{Lane, LaneWorker},
  Scheduler, WorkerRef,
};
use crate::config::RxConfig;

/// Unbounded pool: every worker gets a thread of its own, stopped when the
/// worker is disposed.
pub struct NewThreadScheduler {
  counter: AtomicUsize,
}

impl NewThreadScheduler {
  pub fn new() -> Self { Self { counter: AtomicUsize::new(0) } }
}

impl Default for NewThreadScheduler {
  fn default() -> Self { Self::new() }
}

impl Scheduler for NewThreadScheduler {
  fn create_worker(&self) -> WorkerRef {
    let n = self.counter.fetch_add(1, Ordering::Relaxed);
    let name = format!("{}-new-thread-{n}", RxConfig::global().thread_name_prefix);
    Arc::new(LaneWorker::dedicated(Lane::spawn(name)))
  }
}

#[cfg(test)]
mod tests {
  use std::{sync::mpsc, thread, time::Duration};

  use super::*;
  use crate::{disposable::Disposable, scheduler::Worker};

  #[test]
  fn each_worker_has_its_own_thread() {
    let scheduler = NewThreadScheduler::new();
    let (tx, rx) = mpsc::channel();
    let workers: Vec<_> = (0..2).map(|_| scheduler.create_worker()).collect();
    for worker in &workers {
      let tx = tx.clone();
      worker.schedule(Box::new(move || tx.send(thread::current().id()).unwrap()), Duration::ZERO);
    }
    let a = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    let b = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_ne!(a, b);
    workers.iter().for_each(|w| w.dispose());
  }
}
