use smallvec::SmallVec;

/// Id-keyed storage for the live members of a group: inner subscriptions of a
/// coordinator, observers of a subject, tasks of a worker.
///
/// - Stores up to two entries inline before allocating.
/// - `reserve_id()` + `insert()` hands out an id before the entry exists, for
///   members that must know their own id to remove themselves later.
///
/// ```rust
/// use rxcore::disposable::Registry;
///
/// let mut inners: Registry<&str> = Registry::new();
/// let a = inners.add("a");
/// let b = inners.reserve_id();
/// inners.insert(b, "b");
/// assert_eq!(inners.remove(a), Some("a"));
/// assert_eq!(inners.len(), 1);
/// ```
pub struct Registry<U> {
  next_id: usize,
  entries: SmallVec<[(usize, U); 2]>,
}

impl<U> Default for Registry<U> {
  fn default() -> Self { Self { next_id: 0, entries: SmallVec::new() } }
}

impl<U> Registry<U> {
  #[inline]
  pub fn new() -> Self { Self::default() }

  pub fn add(&mut self, entry: U) -> usize {
    let id = self.reserve_id();
    self.entries.push((id, entry));
    id
  }

  #[inline]
  pub fn reserve_id(&mut self) -> usize {
    let id = self.next_id;
    self.next_id += 1;
    id
  }

  /// Insert under an id obtained from `reserve_id()`.
  #[inline]
  pub fn insert(&mut self, id: usize, entry: U) { self.entries.push((id, entry)); }

  pub fn remove(&mut self, id: usize) -> Option<U> {
    self
      .entries
      .iter()
      .position(|(i, _)| *i == id)
      .map(|pos| self.entries.remove(pos).1)
  }

  #[inline]
  pub fn contains(&self, id: usize) -> bool { self.entries.iter().any(|(i, _)| *i == id) }

  #[inline]
  pub fn len(&self) -> usize { self.entries.len() }

  #[inline]
  pub fn is_empty(&self) -> bool { self.entries.is_empty() }

  pub fn drain(&mut self) -> impl Iterator<Item = U> + '_ {
    self.entries.drain(..).map(|(_, entry)| entry)
  }

  pub fn iter(&self) -> impl Iterator<Item = &U> { self.entries.iter().map(|(_, entry)| entry) }
}

impl<U: Clone> Registry<U> {
  /// Copy of the current members, for iterating without holding a lock.
  pub fn snapshot(&self) -> Vec<U> { self.iter().cloned().collect() }
}
