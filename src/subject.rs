//! A hot multicast source.
//!
//! A [`PublishSubject`] is both ends of a stream: values pushed into it reach
//! every observer subscribed at that moment. Late subscribers only see later
//! values, or the terminal signal if the subject already finished.
//!
//! ```rust
//! use rxcore::prelude::*;
//!
//! let subject = PublishSubject::new();
//! let early = subject.as_observable().test();
//! subject.next(1);
//! let late = subject.as_observable().test();
//! subject.next(2);
//! subject.complete();
//!
//! early.assert_result(&[1, 2]);
//! late.assert_result(&[2]);
//! ```

use std::{
  collections::VecDeque,
  sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Weak,
  },
};

use parking_lot::Mutex;

use crate::{
  disposable::{self, Disposable, Registry},
  error::{ProtocolViolation, RxError},
  fusion::Upstream,
  observable::{Observable, ObservableSource},
  observer::{BoxedObserver, DownstreamSlot, Observer},
  plugins,
};

pub struct PublishSubject<T>(Arc<SubjectState<T>>);

impl<T> Clone for PublishSubject<T> {
  fn clone(&self) -> Self { PublishSubject(self.0.clone()) }
}

struct SubjectState<T> {
  inner: Mutex<SubjectInner<T>>,
  emission: Mutex<Emission<T>>,
}

struct SubjectInner<T> {
  observers: Registry<Arc<SubjectEntry<T>>>,
  terminal: Option<Terminal>,
}

/// Signals pushed while another call is delivering wait here, so observers
/// see them one at a time and in call order.
struct Emission<T> {
  queue: VecDeque<SubjectSignal<T>>,
  emitting: bool,
}

enum SubjectSignal<T> {
  Next(T),
  Terminal(Terminal),
}

#[derive(Clone)]
enum Terminal {
  Completed,
  Failed(RxError),
}

impl Terminal {
  fn deliver<T>(self, observer: BoxedObserver<T>) {
    match self {
      Terminal::Completed => observer.complete(),
      Terminal::Failed(err) => observer.error(err),
    }
  }

  fn send<T: 'static>(self, downstream: &DownstreamSlot<T>) {
    match self {
      Terminal::Completed => downstream.complete(),
      Terminal::Failed(err) => downstream.error(err),
    }
  }
}

/// One subscriber. Disposing it removes it from the subject.
struct SubjectEntry<T> {
  id: usize,
  downstream: DownstreamSlot<T>,
  disposed: AtomicBool,
  subject: Weak<SubjectState<T>>,
}

impl<T: Send + 'static> Disposable for SubjectEntry<T> {
  fn dispose(&self) {
    if self.disposed.swap(true, Ordering::AcqRel) {
      return;
    }
    if let Some(subject) = self.subject.upgrade() {
      let removed = subject.inner.lock().observers.remove(self.id);
      drop(removed);
    }
    self.downstream.release();
  }

  fn is_disposed(&self) -> bool { self.disposed.load(Ordering::Acquire) }
}

impl<T: Clone + Send + 'static> Default for PublishSubject<T> {
  fn default() -> Self { Self::new() }
}

impl<T: Clone + Send + 'static> PublishSubject<T> {
  pub fn new() -> Self {
    PublishSubject(Arc::new(SubjectState {
      inner: Mutex::new(SubjectInner { observers: Registry::new(), terminal: None }),
      emission: Mutex::new(Emission { queue: VecDeque::new(), emitting: false }),
    }))
  }

  /// Push `value` to the current observers. Concurrent and re-entrant calls
  /// are serialized.
  pub fn next(&self, value: T) {
    if self.is_terminated() {
      plugins::on_error(ProtocolViolation::NextAfterTerminal.into());
      return;
    }
    self.emit(SubjectSignal::Next(value));
  }

  pub fn error(&self, err: RxError) {
    match self.set_terminal(Terminal::Failed(err.clone())) {
      Some(terminal) => self.emit(SubjectSignal::Terminal(terminal)),
      None => plugins::on_error(err),
    }
  }

  pub fn complete(&self) {
    match self.set_terminal(Terminal::Completed) {
      Some(terminal) => self.emit(SubjectSignal::Terminal(terminal)),
      None => plugins::on_error(ProtocolViolation::TerminalAfterTerminal.into()),
    }
  }

  /// Record the terminal signal. `None` when the subject had already
  /// terminated.
  fn set_terminal(&self, terminal: Terminal) -> Option<Terminal> {
    let mut inner = self.0.inner.lock();
    if inner.terminal.is_some() {
      return None;
    }
    inner.terminal = Some(terminal.clone());
    Some(terminal)
  }

  fn emit(&self, signal: SubjectSignal<T>) {
    {
      let mut emission = self.0.emission.lock();
      if emission.emitting {
        emission.queue.push_back(signal);
        return;
      }
      emission.emitting = true;
    }
    let mut signal = signal;
    loop {
      self.deliver(signal);
      let mut emission = self.0.emission.lock();
      match emission.queue.pop_front() {
        Some(queued) => signal = queued,
        None => {
          emission.emitting = false;
          return;
        }
      }
    }
  }

  fn deliver(&self, signal: SubjectSignal<T>) {
    match signal {
      SubjectSignal::Next(value) => {
        let observers = self.0.inner.lock().observers.snapshot();
        for entry in observers {
          if !entry.is_disposed() {
            entry.downstream.next(value.clone());
          }
        }
      }
      SubjectSignal::Terminal(terminal) => {
        let observers: Vec<_> = self.0.inner.lock().observers.drain().collect();
        for entry in observers {
          if !entry.is_disposed() {
            terminal.clone().send(&entry.downstream);
          }
        }
      }
    }
  }

  pub fn has_observers(&self) -> bool { !self.0.inner.lock().observers.is_empty() }

  pub fn observer_count(&self) -> usize { self.0.inner.lock().observers.len() }

  pub fn is_terminated(&self) -> bool { self.0.inner.lock().terminal.is_some() }

  pub fn as_observable(&self) -> Observable<T> { Observable::new(SubjectSource(self.0.clone())) }
}

struct SubjectSource<T>(Arc<SubjectState<T>>);

impl<T: Send + 'static> ObservableSource<T> for SubjectSource<T> {
  fn subscribe_actual(&self, mut observer: BoxedObserver<T>) {
    let reserved = {
      let mut inner = self.0.inner.lock();
      match &inner.terminal {
        Some(terminal) => Err(terminal.clone()),
        None => Ok(inner.observers.reserve_id()),
      }
    };
    let id = match reserved {
      Ok(id) => id,
      Err(terminal) => {
        observer.on_subscribe(Upstream::Plain(disposable::empty()));
        terminal.deliver(observer);
        return;
      }
    };

    let entry = Arc::new(SubjectEntry {
      id,
      downstream: DownstreamSlot::empty(),
      disposed: AtomicBool::new(false),
      subject: Arc::downgrade(&self.0),
    });
    observer.on_subscribe(Upstream::Plain(entry.clone()));
    if entry.is_disposed() {
      return;
    }
    entry.downstream.install(observer);

    let late = {
      let mut inner = self.0.inner.lock();
      match &inner.terminal {
        Some(terminal) => Some(terminal.clone()),
        None => {
          inner.observers.insert(id, entry.clone());
          None
        }
      }
    };
    match late {
      Some(terminal) => terminal.send(&entry.downstream),
      // Disposed while being added.
      None if entry.is_disposed() => {
        let removed = self.0.inner.lock().observers.remove(id);
        drop(removed);
      }
      None => {}
    }
  }
}

/// Subscribing a subject to a source turns the source hot.
impl<T: Clone + Send + 'static> Observer<T> for PublishSubject<T> {
  fn on_subscribe(&mut self, upstream: Upstream<T>) {
    if self.is_terminated() {
      upstream.dispose();
    }
  }

  fn next(&mut self, value: T) { PublishSubject::next(self, value) }

  fn error(self: Box<Self>, err: RxError) { PublishSubject::error(&self, err) }

  fn complete(self: Box<Self>) { PublishSubject::complete(&self) }
}
