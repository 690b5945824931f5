use super::{
  lane::{Lane, LaneWorker},
  Scheduler, WorkerRef,
};
use crate::config::RxConfig;

/// Every worker shares one background thread, so all work scheduled through
/// it is serialized.
pub struct SingleScheduler {
  lane: Lane,
}

impl SingleScheduler {
  pub fn new() -> Self { Self::named(format!("{}-single", RxConfig::global().thread_name_prefix)) }

  pub fn named(name: impl Into<String>) -> Self { Self { lane: Lane::spawn(name.into()) } }
}

impl Default for SingleScheduler {
  fn default() -> Self { Self::new() }
}

impl Scheduler for SingleScheduler {
  fn create_worker(&self) -> WorkerRef { std::sync::Arc::new(LaneWorker::shared(self.lane.clone())) }
}

impl Drop for SingleScheduler {
  fn drop(&mut self) { self.lane.shutdown(); }
}

#[cfg(test)]
mod tests {
  use std::{sync::mpsc, thread, time::Duration};

  use super::*;
  use crate::scheduler::Worker;

  #[test]
  fn all_workers_share_one_thread() {
    let scheduler = SingleScheduler::named("rx-test-single");
    let (tx, rx) = mpsc::channel();
    for _ in 0..3 {
      let tx = tx.clone();
      scheduler
        .create_worker()
        .schedule(Box::new(move || tx.send(thread::current().id()).unwrap()), Duration::ZERO);
    }
    let ids: Vec<_> = (0..3).map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap()).collect();
    assert!(ids.windows(2).all(|w| w[0] == w[1]));
    assert_ne!(ids[0], thread::current().id());
  }
}
