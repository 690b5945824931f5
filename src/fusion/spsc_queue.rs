use std::collections::VecDeque;

use parking_lot::Mutex;

/// Queue between one producing and one draining side of an operator.
///
/// `offer` respects the capacity of a bounded queue; `push` ignores it and is
/// meant for queues whose size is governed elsewhere.
pub struct SpscQueue<T> {
  items: Mutex<VecDeque<T>>,
  capacity: Option<usize>,
}

impl<T> SpscQueue<T> {
  pub fn unbounded() -> Self { Self { items: Mutex::new(VecDeque::new()), capacity: None } }

  pub fn bounded(capacity: usize) -> Self {
    let capacity = capacity.max(1);
    Self { items: Mutex::new(VecDeque::with_capacity(capacity)), capacity: Some(capacity) }
  }

  /// Enqueue, or hand the value back when the queue is full.
  pub fn offer(&self, value: T) -> Result<(), T> {
    let mut items = self.items.lock();
    if self.capacity.is_some_and(|cap| items.len() >= cap) {
      return Err(value);
    }
    items.push_back(value);
    Ok(())
  }

  pub fn push(&self, value: T) { self.items.lock().push_back(value); }

  pub fn poll(&self) -> Option<T> { self.items.lock().pop_front() }

  pub fn is_empty(&self) -> bool { self.items.lock().is_empty() }

  pub fn len(&self) -> usize { self.items.lock().len() }

  pub fn capacity(&self) -> Option<usize> { self.capacity }

  /// Drop all queued values outside the lock.
  pub fn clear(&self) {
    let dropped = std::mem::take(&mut *self.items.lock());
    drop(dropped);
  }
}
