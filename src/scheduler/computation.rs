use std::sync::{
  atomic::{AtomicUsize, Ordering},
  Arc,
};

use super::{
  lane::{Lane, LaneWorker},
  Scheduler, WorkerRef,
};
use crate::config::RxConfig;

/// A fixed pool of serial lanes. Each worker is pinned to one lane, picked
/// round-robin, so work of one worker stays ordered while different workers
/// run in parallel.
pub struct ComputationScheduler {
  lanes: Vec<Lane>,
  next: AtomicUsize,
}

impl ComputationScheduler {
  pub fn new(threads: usize) -> Self {
    let prefix = &RxConfig::global().thread_name_prefix;
    let lanes = (0..threads.max(1)).map(|i| Lane::spawn(format!("{prefix}-computation-{i}"))).collect();
    Self { lanes, next: AtomicUsize::new(0) }
  }

  pub fn parallelism(&self) -> usize { self.lanes.len() }
}

impl Scheduler for ComputationScheduler {
  fn create_worker(&self) -> WorkerRef {
    let index = self.next.fetch_add(1, Ordering::Relaxed) % self.lanes.len();
    Arc::new(LaneWorker::shared(self.lanes[index].clone()))
  }
}

impl Drop for ComputationScheduler {
  fn drop(&mut self) { self.lanes.iter().for_each(Lane::shutdown); }
}

#[cfg(test)]
mod tests {
  use std::{collections::HashSet, sync::mpsc, thread, time::Duration};

  use super::*;
  use crate::scheduler::Worker;

  #[test]
  fn workers_spread_over_lanes() {
    let scheduler = ComputationScheduler::new(2);
    assert_eq!(scheduler.parallelism(), 2);
    let (tx, rx) = mpsc::channel();
    for _ in 0..4 {
      let tx = tx.clone();
      scheduler
        .create_worker()
        .schedule(Box::new(move || tx.send(thread::current().id()).unwrap()), Duration::ZERO);
    }
    let ids: HashSet<_> = (0..4).map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap()).collect();
    assert_eq!(ids.len(), 2);
  }
}
