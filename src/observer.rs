//! The push contract between a producer and its consumer.
//!
//! A producer calls, on one thread at a time:
//!
//! 1. `on_subscribe` exactly once, before anything else;
//! 2. `next` zero or more times;
//! 3. at most one of `error` or `complete`.
//!
//! The terminal methods consume the observer, so the holder of a
//! [`BoxedObserver`] cannot signal twice. Producers that still have something
//! to say after the terminal signal, or after their consumer disposed, route it
//! to the [undeliverable sink](crate::plugins). A second `on_subscribe`
//! disposes both upstreams and fails the subscription with
//! [`ProtocolViolation::MultipleSubscription`](crate::error::ProtocolViolation).

use std::{collections::VecDeque, mem};

use parking_lot::Mutex;

use crate::{error::RxError, fusion::Upstream, plugins};

mod lambda;

pub(crate) use lambda::LambdaObserver;

pub trait Observer<T>: Send {
  /// Receives the handle used to cancel, and optionally fuse with, the
  /// producer.
  fn on_subscribe(&mut self, upstream: Upstream<T>);

  fn next(&mut self, value: T);

  fn error(self: Box<Self>, err: RxError);

  fn complete(self: Box<Self>);

  /// ASYNC fusion only: values were queued and can be polled.
  fn ready(&mut self) {}
}

pub type BoxedObserver<T> = Box<dyn Observer<T>>;

/// Store the first upstream of an operator.
///
/// A second one is a multiple subscription: both upstreams are disposed and
/// `downstream` is failed with the violation. Returns whether `upstream` was
/// stored.
pub(crate) fn set_upstream_once<T: 'static, U>(
  slot: &mut Option<Upstream<T>>,
  upstream: Upstream<T>,
  downstream: &mut Option<BoxedObserver<U>>,
) -> bool {
  match slot {
    None => {
      *slot = Some(upstream);
      true
    }
    Some(current) => {
      upstream.dispose();
      current.dispose();
      let err = RxError::multiple_subscription();
      match downstream.take() {
        Some(observer) => observer.error(err),
        None => plugins::on_error(err),
      }
      false
    }
  }
}

// ==================== Shared downstream ====================

enum Signal<T> {
  Next(T),
  Ready,
  Error(RxError),
  Complete,
}

struct SlotState<T> {
  observer: Option<BoxedObserver<T>>,
  queue: VecDeque<Signal<T>>,
  emitting: bool,
  done: bool,
}

/// The downstream of a stateful operator that several threads, or a
/// re-entrant consumer, signal through.
///
/// One caller at a time delivers. A signal arriving while another is being
/// delivered is queued and handed over by the delivering caller when the
/// observer returns, so no lock is held across an observer call and a consumer
/// emitting back into its own producer cannot deadlock. After a terminal
/// signal or `release` every later signal is dropped; errors go to the sink.
pub(crate) struct DownstreamSlot<T>(Mutex<SlotState<T>>);

impl<T: 'static> DownstreamSlot<T> {
  pub(crate) fn empty() -> Self {
    Self(Mutex::new(SlotState { observer: None, queue: VecDeque::new(), emitting: false, done: false }))
  }

  pub(crate) fn install(&self, observer: BoxedObserver<T>) {
    let mut state = self.0.lock();
    if state.done {
      drop(state);
      drop(observer);
      return;
    }
    state.observer = Some(observer);
  }

  pub(crate) fn next(&self, value: T) { self.signal(Signal::Next(value)) }

  pub(crate) fn ready(&self) { self.signal(Signal::Ready) }

  /// Deliver `err`, or report it when the observer is gone.
  pub(crate) fn error(&self, err: RxError) { self.signal(Signal::Error(err)) }

  pub(crate) fn complete(&self) { self.signal(Signal::Complete) }

  /// Drop the observer. Safe from any thread, including from inside the
  /// observer's own `next`: a delivery in progress drops it when it returns.
  pub(crate) fn release(&self) {
    let (observer, queue) = {
      let mut state = self.0.lock();
      state.done = true;
      (state.observer.take(), mem::take(&mut state.queue))
    };
    drop(observer);
    report_dropped(queue);
  }

  fn signal(&self, signal: Signal<T>) {
    let mut state = self.0.lock();
    if state.emitting {
      if state.done {
        drop(state);
        report_dropped([signal]);
      } else {
        state.queue.push_back(signal);
      }
      return;
    }
    let observer = if state.done { None } else { state.observer.take() };
    let Some(mut observer) = observer else {
      drop(state);
      report_dropped([signal]);
      return;
    };
    state.emitting = true;
    drop(state);

    let mut signal = signal;
    loop {
      match signal {
        Signal::Next(value) => observer.next(value),
        Signal::Ready => observer.ready(),
        Signal::Error(err) => {
          self.finish();
          observer.error(err);
          return;
        }
        Signal::Complete => {
          self.finish();
          observer.complete();
          return;
        }
      }
      let mut state = self.0.lock();
      if state.done {
        // Released while the observer was running.
        state.emitting = false;
        let queue = mem::take(&mut state.queue);
        drop(state);
        drop(observer);
        report_dropped(queue);
        return;
      }
      match state.queue.pop_front() {
        Some(queued) => signal = queued,
        None => {
          state.emitting = false;
          state.observer = Some(observer);
          return;
        }
      }
    }
  }

  /// Seal the slot before a terminal call.
  fn finish(&self) {
    let queue = {
      let mut state = self.0.lock();
      state.done = true;
      state.emitting = false;
      mem::take(&mut state.queue)
    };
    report_dropped(queue);
  }
}

fn report_dropped<T>(signals: impl IntoIterator<Item = Signal<T>>) {
  for signal in signals {
    if let Signal::Error(err) = signal {
      plugins::on_error(err);
    }
  }
}

#[cfg(test)]
mod tests {
  use std::sync::Arc;

  use super::*;
  use crate::{
    disposable::Disposable,
    testing::{capture_undeliverable, TestObserver},
  };

  /// Forwards to a recorder and pushes a value back into its own slot.
  struct Echo {
    slot: Arc<DownstreamSlot<i32>>,
    to: TestObserver<i32>,
    depth: usize,
  }

  impl Observer<i32> for Echo {
    fn on_subscribe(&mut self, _: Upstream<i32>) {}

    fn next(&mut self, value: i32) {
      self.to.clone().next(value);
      if self.depth > 0 {
        self.depth -= 1;
        self.slot.next(value + 1);
      }
    }

    fn error(self: Box<Self>, err: RxError) { Box::new(self.to.clone()).error(err) }

    fn complete(self: Box<Self>) { Box::new(self.to.clone()).complete() }
  }

  #[test]
  fn reentrant_next_is_queued_not_deadlocked() {
    let slot = Arc::new(DownstreamSlot::empty());
    let to = TestObserver::new();
    slot.install(Box::new(Echo { slot: slot.clone(), to: to.clone(), depth: 3 }));
    slot.next(1);
    slot.complete();
    to.assert_result(&[1, 2, 3, 4]);
  }

  #[test]
  fn release_inside_next_stops_delivery() {
    struct Releasing(Arc<DownstreamSlot<i32>>, TestObserver<i32>);
    impl Observer<i32> for Releasing {
      fn on_subscribe(&mut self, _: Upstream<i32>) {}
      fn next(&mut self, value: i32) {
        self.1.clone().next(value);
        self.0.release();
        self.0.next(value + 1);
      }
      fn error(self: Box<Self>, _: RxError) {}
      fn complete(self: Box<Self>) {}
    }

    let slot = Arc::new(DownstreamSlot::empty());
    let to = TestObserver::new();
    slot.install(Box::new(Releasing(slot.clone(), to.clone())));
    slot.next(1);
    slot.next(5);
    to.assert_values(&[1]).assert_not_complete();
  }

  #[test]
  fn error_after_terminal_goes_to_the_sink() {
    let capture = capture_undeliverable();
    let slot = DownstreamSlot::empty();
    let to = TestObserver::new();
    slot.install(Box::new(to.clone()));
    slot.complete();
    slot.next(1);
    slot.error("late".into());
    to.assert_result(&[]);
    assert!(capture.errors().iter().any(|e| e.root().to_string() == "late"));
  }

  #[test]
  fn second_upstream_fails_the_downstream() {
    let first = crate::disposable::empty();
    let second = crate::disposable::empty();
    let to = TestObserver::<i32>::new();
    let mut slot: Option<Upstream<i32>> = None;
    let mut downstream: Option<BoxedObserver<i32>> = Some(Box::new(to.clone()));
    assert!(set_upstream_once(&mut slot, Upstream::Plain(first.clone()), &mut downstream));
    assert!(!set_upstream_once(&mut slot, Upstream::Plain(second.clone()), &mut downstream));
    assert!(first.is_disposed() && second.is_disposed());
    assert!(downstream.is_none());
    to.assert_error(|e| e.is_protocol_violation(crate::error::ProtocolViolation::MultipleSubscription));
  }
}
