use std::{
  collections::{BTreeMap, HashMap},
  sync::{
    atomic::{AtomicU8, Ordering},
    Arc,
  },
  time::Duration,
};

use parking_lot::Mutex;
use smallvec::SmallVec;

use super::interrupt::{is_current, CurrentInterrupt, Interrupt};
use crate::disposable::{CompositeDisposable, Disposable};

pub type Task = Box<dyn FnOnce() + Send>;
pub type PeriodicTask = Box<dyn FnMut() + Send>;

type Cleanup = Box<dyn FnOnce() + Send>;

const READY: u8 = 0;
const RUNNING: u8 = 1;
const FINISHED: u8 = 2;
const CANCELLED: u8 = 3;

/// The cancellation handle of one scheduled unit of work.
///
/// Cancelling before the task starts prevents it from running. Cancelling
/// while it runs on another thread raises its interrupt. Cleanup hooks run
/// exactly once, when the task finishes or is cancelled.
pub(crate) struct ScheduledTask {
  state: AtomicU8,
  interrupt: Arc<Interrupt>,
  cleanup: Mutex<Option<SmallVec<[Cleanup; 2]>>>,
}

impl ScheduledTask {
  pub(crate) fn new() -> Arc<Self> {
    Arc::new(Self {
      state: AtomicU8::new(READY),
      interrupt: Arc::new(Interrupt::default()),
      cleanup: Mutex::new(Some(SmallVec::new())),
    })
  }

  /// Register a hook; runs immediately if the task is already over.
  pub(crate) fn on_cleanup<F: FnOnce() + Send + 'static>(&self, hook: F) {
    let mut cleanup = self.cleanup.lock();
    match cleanup.as_mut() {
      Some(hooks) => hooks.push(Box::new(hook)),
      None => {
        drop(cleanup);
        hook();
      }
    }
  }

  fn run_cleanup(&self) {
    let hooks = self.cleanup.lock().take();
    for hook in hooks.into_iter().flatten() {
      hook();
    }
  }

  pub(crate) fn run_once(&self, task: Task) {
    if self.start() {
      {
        let _current = CurrentInterrupt::enter(self.interrupt.clone());
        task();
      }
      self.state.compare_exchange(RUNNING, FINISHED, Ordering::AcqRel, Ordering::Acquire).ok();
      self.run_cleanup();
    }
  }

  /// Run one period. Returns whether the task should run again.
  pub(crate) fn run_periodic(&self, task: &mut PeriodicTask) -> bool {
    if !self.start() {
      return false;
    }
    {
      let _current = CurrentInterrupt::enter(self.interrupt.clone());
      task();
    }
    let again = self
      .state
      .compare_exchange(RUNNING, READY, Ordering::AcqRel, Ordering::Acquire)
      .is_ok();
    if !again {
      self.run_cleanup();
    }
    again
  }

  /// Add to a worker's task set. The entry leaves the set once the task is
  /// over. Returns false when the set is already disposed.
  pub(crate) fn track_in(self: &Arc<Self>, tasks: &Arc<CompositeDisposable>) -> bool {
    match tasks.add(self.clone()) {
      Some(id) => {
        let tasks = Arc::downgrade(tasks);
        self.on_cleanup(move || {
          if let Some(tasks) = tasks.upgrade() {
            tasks.remove(id);
          }
        });
        true
      }
      None => false,
    }
  }

  /// Mark a task whose body panicked as finished.
  pub(crate) fn abandon(&self) {
    self.state.store(FINISHED, Ordering::Release);
    self.run_cleanup();
  }

  fn start(&self) -> bool {
    self.state.compare_exchange(READY, RUNNING, Ordering::AcqRel, Ordering::Acquire).is_ok()
  }
}

impl Disposable for ScheduledTask {
  fn dispose(&self) {
    loop {
      match self.state.load(Ordering::Acquire) {
        READY => {
          if self
            .state
            .compare_exchange(READY, CANCELLED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
          {
            self.run_cleanup();
            return;
          }
        }
        RUNNING => {
          if self
            .state
            .compare_exchange(RUNNING, CANCELLED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
          {
            // A task cancelling itself is not interrupted.
            if !is_current(&self.interrupt) {
              self.interrupt.raise();
            }
            return;
          }
        }
        _ => return,
      }
    }
  }

  fn is_disposed(&self) -> bool { self.state.load(Ordering::Acquire) >= FINISHED }
}

// ==================== Jobs ====================

pub(crate) enum Work {
  Once(Task),
  Periodic { run: PeriodicTask, period: Duration },
}

pub(crate) struct Job {
  pub(crate) task: Arc<ScheduledTask>,
  pub(crate) work: Work,
}

impl Job {
  pub(crate) fn once(task: Arc<ScheduledTask>, run: Task) -> Self { Job { task, work: Work::Once(run) } }

  pub(crate) fn periodic(task: Arc<ScheduledTask>, run: PeriodicTask, period: Duration) -> Self {
    Job { task, work: Work::Periodic { run, period } }
  }

  /// Execute. A periodic job that should go on is handed back with its
  /// period.
  pub(crate) fn run(self) -> Option<(Duration, Job)> {
    let Job { task, work } = self;
    match work {
      Work::Once(run) => {
        task.run_once(run);
        None
      }
      Work::Periodic { mut run, period } => {
        if task.run_periodic(&mut run) {
          Some((period, Job::periodic(task, run, period)))
        } else {
          None
        }
      }
    }
  }
}

/// Pending jobs ordered by due time, FIFO among equal due times.
///
/// Every job keeps a stable id across periodic re-insertions, so the
/// cancellation hook registered at first submission can always purge it.
pub(crate) struct JobQueue<K> {
  by_due: BTreeMap<(K, u64), (u64, Job)>,
  key_of: HashMap<u64, (K, u64)>,
  next_seq: u64,
}

impl<K: Ord + Copy> Default for JobQueue<K> {
  fn default() -> Self { Self { by_due: BTreeMap::new(), key_of: HashMap::new(), next_seq: 0 } }
}

impl<K: Ord + Copy> JobQueue<K> {
  pub(crate) fn push(&mut self, due: K, job: Job) -> u64 {
    let id = self.next_seq;
    self.reinsert(id, due, job);
    id
  }

  pub(crate) fn reinsert(&mut self, id: u64, due: K, job: Job) {
    let key = (due, self.next_seq);
    self.next_seq += 1;
    self.by_due.insert(key, (id, job));
    self.key_of.insert(id, key);
  }

  pub(crate) fn remove(&mut self, id: u64) -> Option<Job> {
    let key = self.key_of.remove(&id)?;
    self.by_due.remove(&key).map(|(_, job)| job)
  }

  /// Take the earliest job due at or before `now`.
  pub(crate) fn pop_due(&mut self, now: K) -> Option<(u64, K, Job)> {
    let (&key, _) = self.by_due.first_key_value()?;
    if key.0 > now {
      return None;
    }
    let (id, job) = self.by_due.remove(&key)?;
    self.key_of.remove(&id);
    Some((id, key.0, job))
  }

  pub(crate) fn next_due(&self) -> Option<K> { self.by_due.first_key_value().map(|(k, _)| k.0) }

  pub(crate) fn last_due(&self) -> Option<K> { self.by_due.last_key_value().map(|(k, _)| k.0) }

  pub(crate) fn len(&self) -> usize { self.by_due.len() }

  pub(crate) fn drain(&mut self) -> Vec<Job> {
    self.key_of.clear();
    std::mem::take(&mut self.by_due).into_values().map(|(_, job)| job).collect()
  }
}

#[cfg(test)]
mod tests {
  use std::sync::atomic::{AtomicBool, AtomicUsize};

  use super::*;

  #[test]
  fn cancelled_before_start_never_runs() {
    let ran = Arc::new(AtomicBool::new(false));
    let cleaned = Arc::new(AtomicBool::new(false));
    let task = ScheduledTask::new();
    let c = cleaned.clone();
    task.on_cleanup(move || c.store(true, Ordering::SeqCst));
    task.dispose();
    let r = ran.clone();
    task.run_once(Box::new(move || r.store(true, Ordering::SeqCst)));
    assert!(!ran.load(Ordering::SeqCst));
    assert!(cleaned.load(Ordering::SeqCst));
    assert!(task.is_disposed());
  }

  #[test]
  fn finished_task_runs_late_hooks_immediately() {
    let task = ScheduledTask::new();
    task.run_once(Box::new(|| {}));
    assert!(task.is_disposed());
    let hit = Arc::new(AtomicBool::new(false));
    let h = hit.clone();
    task.on_cleanup(move || h.store(true, Ordering::SeqCst));
    assert!(hit.load(Ordering::SeqCst));
  }

  #[test]
  fn self_cancel_does_not_interrupt() {
    let task = ScheduledTask::new();
    let inner = task.clone();
    let interrupted = Arc::new(AtomicBool::new(true));
    let flag = interrupted.clone();
    task.run_once(Box::new(move || {
      inner.dispose();
      flag.store(crate::scheduler::is_interrupted(), Ordering::SeqCst);
    }));
    assert!(!interrupted.load(Ordering::SeqCst));
  }

  #[test]
  fn periodic_stops_after_cancel() {
    let task = ScheduledTask::new();
    let count = Arc::new(AtomicUsize::new(0));
    let c = count.clone();
    let handle = task.clone();
    let mut run: PeriodicTask = Box::new(move || {
      if c.fetch_add(1, Ordering::SeqCst) == 2 {
        handle.dispose();
      }
    });
    let mut rounds = 0;
    while task.run_periodic(&mut run) {
      rounds += 1;
    }
    assert_eq!(rounds, 2);
    assert_eq!(count.load(Ordering::SeqCst), 3);
  }

  #[test]
  fn queue_orders_by_due_then_fifo() {
    let mut q = JobQueue::default();
    let order = Arc::new(Mutex::new(vec![]));
    let job = |tag: &'static str| {
      let order = order.clone();
      Job::once(ScheduledTask::new(), Box::new(move || order.lock().push(tag)))
    };
    q.push(5u32, job("late"));
    q.push(1, job("first"));
    let removed = q.push(1, job("removed"));
    q.push(1, job("second"));
    assert!(q.remove(removed).is_some());
    assert_eq!(q.next_due(), Some(1));
    assert!(q.pop_due(0).is_none());
    while let Some((_, _, job)) = q.pop_due(10) {
      job.run();
    }
    assert_eq!(*order.lock(), vec!["first", "second", "late"]);
    assert_eq!(q.len(), 0);
  }
}
