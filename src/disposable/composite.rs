use std::mem;

use parking_lot::Mutex;

use super::{Disposable, DisposableRef, Registry};

/// A group of handles disposed together.
///
/// Adding to an already disposed group disposes the newcomer immediately.
/// Members are disposed outside the internal lock, so a member may call back
/// into the group while it is being torn down.
pub struct CompositeDisposable {
  entries: Mutex<Option<Registry<DisposableRef>>>,
}

impl Default for CompositeDisposable {
  fn default() -> Self { Self { entries: Mutex::new(Some(Registry::new())) } }
}

impl CompositeDisposable {
  pub fn new() -> Self { Self::default() }

  /// Track `handle`. Returns its id, or `None` when the group is disposed.
  pub fn add(&self, handle: DisposableRef) -> Option<usize> {
    let mut entries = self.entries.lock();
    match entries.as_mut() {
      Some(reg) => Some(reg.add(handle)),
      None => {
        drop(entries);
        handle.dispose();
        None
      }
    }
  }

  /// Stop tracking a member without disposing it.
  pub fn remove(&self, id: usize) -> Option<DisposableRef> {
    self.entries.lock().as_mut().and_then(|reg| reg.remove(id))
  }

  /// Stop tracking a member and dispose it.
  pub fn delete(&self, id: usize) -> bool {
    match self.remove(id) {
      Some(handle) => {
        handle.dispose();
        true
      }
      None => false,
    }
  }

  pub fn len(&self) -> usize { self.entries.lock().as_ref().map_or(0, Registry::len) }

  pub fn is_empty(&self) -> bool { self.len() == 0 }
}

impl Disposable for CompositeDisposable {
  fn dispose(&self) {
    let taken = mem::take(&mut *self.entries.lock());
    if let Some(mut reg) = taken {
      for handle in reg.drain() {
        handle.dispose();
      }
    }
  }

  fn is_disposed(&self) -> bool { self.entries.lock().is_none() }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::disposable::{empty, from_fn};

  #[test]
  fn disposes_every_member() {
    let group = CompositeDisposable::new();
    let a = empty();
    let b = empty();
    group.add(a.clone());
    group.add(b.clone());
    assert_eq!(group.len(), 2);
    group.dispose();
    assert!(a.is_disposed() && b.is_disposed());
    assert!(group.is_disposed());
  }

  #[test]
  fn late_member_is_disposed_on_add() {
    let group = CompositeDisposable::new();
    group.dispose();
    let late = empty();
    assert!(group.add(late.clone()).is_none());
    assert!(late.is_disposed());
  }

  #[test]
  fn removed_member_survives() {
    let group = CompositeDisposable::new();
    let kept = empty();
    let id = group.add(kept.clone()).unwrap();
    assert!(group.remove(id).is_some());
    group.dispose();
    assert!(!kept.is_disposed());
  }

  #[test]
  fn member_may_touch_group_while_disposed() {
    let group = std::sync::Arc::new(CompositeDisposable::new());
    let g = group.clone();
    group.add(from_fn(move || {
      g.add(empty());
    }));
    group.dispose();
    assert!(group.is_empty());
  }
}
