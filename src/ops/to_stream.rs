//! Conversion into a pull-based `futures::Stream`.
//!
//! The observable keeps pushing at its own pace; the stream buffers up to a
//! capacity and a [`BackpressureStrategy`] decides what happens once the
//! consumer falls behind.
//!
//! ```rust
//! use futures::{executor::block_on, StreamExt};
//! use rxcore::prelude::*;
//!
//! let items: Vec<_> = block_on(
//!   observable::from_iter(1..=3).to_stream(BackpressureStrategy::Buffer).collect(),
//! );
//! assert_eq!(items.len(), 3);
//! ```

use std::{
  collections::VecDeque,
  pin::Pin,
  sync::Arc,
  task::{Context, Poll, Waker},
};

use futures::stream::Stream;
use parking_lot::Mutex;

use crate::{
  config::RxConfig,
  disposable::{Disposable, DisposableSlot},
  error::{ProtocolViolation, RxError},
  fusion::Upstream,
  observable::Observable,
  observer::Observer,
  plugins,
};

/// What to do with a value that arrives while the buffer is full.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum BackpressureStrategy {
  /// No strategy: a full buffer is a protocol failure of the producer.
  Missing,
  /// Fail the stream with [`RxError::MissingBackpressure`].
  #[default]
  Error,
  /// Evict the oldest buffered value.
  DropOldest,
  /// Drop the arriving value.
  DropLatest,
  /// Ignore the capacity.
  Buffer,
}

impl<T: Send + 'static> Observable<T> {
  /// Convert into a stream with the configured default capacity
  /// ([`RxConfig::buffer_size`]).
  pub fn to_stream(&self, strategy: BackpressureStrategy) -> ObservableStream<T> {
    self.to_stream_with(strategy, RxConfig::global().buffer_size)
  }

  pub fn to_stream_with(&self, strategy: BackpressureStrategy, capacity: usize) -> ObservableStream<T> {
    let capacity = if capacity == 0 {
      tracing::warn!("to_stream capacity of zero raised to one");
      1
    } else {
      capacity
    };
    ObservableStream {
      source: Some(self.clone()),
      shared: Arc::new(StreamShared {
        buffer: Mutex::new(Buffer {
          items: VecDeque::new(),
          terminal: None,
          finished: false,
          waker: None,
        }),
        upstream: DisposableSlot::new(),
        strategy,
        capacity,
      }),
    }
  }
}

/// A stream of the values of an observable, subscribed on first poll.
///
/// Yields `Ok` per value, one `Err` if the observable fails or the buffer
/// overflows, then ends. Dropping the stream disposes the subscription.
pub struct ObservableStream<T> {
  source: Option<Observable<T>>,
  shared: Arc<StreamShared<T>>,
}

struct StreamShared<T> {
  buffer: Mutex<Buffer<T>>,
  upstream: DisposableSlot,
  strategy: BackpressureStrategy,
  capacity: usize,
}

struct Buffer<T> {
  items: VecDeque<T>,
  terminal: Option<Result<(), RxError>>,
  finished: bool,
  waker: Option<Waker>,
}

impl<T> Buffer<T> {
  fn wake(&mut self) {
    if let Some(waker) = self.waker.take() {
      waker.wake();
    }
  }
}

impl<T: Send + 'static> Stream for ObservableStream<T> {
  type Item = Result<T, RxError>;

  fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
    let this = self.get_mut();
    if let Some(source) = this.source.take() {
      source.subscribe_with(StreamObserver { shared: this.shared.clone() });
    }
    let mut buffer = this.shared.buffer.lock();
    if let Some(value) = buffer.items.pop_front() {
      return Poll::Ready(Some(Ok(value)));
    }
    match buffer.terminal.take() {
      Some(Err(err)) => {
        buffer.finished = true;
        Poll::Ready(Some(Err(err)))
      }
      Some(Ok(())) => {
        buffer.finished = true;
        Poll::Ready(None)
      }
      None if buffer.finished => Poll::Ready(None),
      None => {
        buffer.waker = Some(cx.waker().clone());
        Poll::Pending
      }
    }
  }
}

impl<T> Drop for ObservableStream<T> {
  fn drop(&mut self) { self.shared.upstream.dispose(); }
}

struct StreamObserver<T> {
  shared: Arc<StreamShared<T>>,
}

impl<T> StreamObserver<T> {
  fn overflow(&self, buffer: &mut Buffer<T>, reason: &'static str) {
    tracing::warn!(violation = %ProtocolViolation::QueueOverflow, reason, "stream buffer overflow");
    self.shared.upstream.dispose();
    buffer.terminal = Some(Err(RxError::MissingBackpressure(reason)));
  }
}

impl<T: Send + 'static> Observer<T> for StreamObserver<T> {
  fn on_subscribe(&mut self, upstream: Upstream<T>) {
    if let Err(err) = self.shared.upstream.set_once(upstream.disposable()) {
      let mut buffer = self.shared.buffer.lock();
      if buffer.terminal.is_none() && !buffer.finished {
        buffer.terminal = Some(Err(err));
        buffer.wake();
      }
    }
  }

  fn next(&mut self, value: T) {
    let shared = &self.shared;
    let mut buffer = shared.buffer.lock();
    if buffer.terminal.is_some() || buffer.finished {
      return;
    }
    if shared.strategy != BackpressureStrategy::Buffer && buffer.items.len() >= shared.capacity {
      match shared.strategy {
        BackpressureStrategy::Missing => self.overflow(&mut buffer, "queue is full"),
        BackpressureStrategy::Error => {
          self.overflow(&mut buffer, "could not emit value due to lack of requests")
        }
        BackpressureStrategy::DropOldest => {
          buffer.items.pop_front();
          buffer.items.push_back(value);
        }
        BackpressureStrategy::DropLatest | BackpressureStrategy::Buffer => {}
      }
    } else {
      buffer.items.push_back(value);
    }
    buffer.wake();
  }

  fn error(self: Box<Self>, err: RxError) {
    let mut buffer = self.shared.buffer.lock();
    if buffer.terminal.is_some() || buffer.finished {
      drop(buffer);
      plugins::on_error(err);
      return;
    }
    buffer.terminal = Some(Err(err));
    buffer.wake();
  }

  fn complete(self: Box<Self>) {
    let mut buffer = self.shared.buffer.lock();
    if buffer.terminal.is_none() && !buffer.finished {
      buffer.terminal = Some(Ok(()));
    }
    buffer.wake();
  }
}

#[cfg(test)]
mod tests {
  use futures::{executor::block_on, StreamExt};

  use super::*;
  use crate::{observable, subject::PublishSubject};

  fn collect<T: Send + 'static>(stream: ObservableStream<T>) -> Vec<Result<T, RxError>> {
    block_on(stream.collect())
  }

  #[test]
  fn yields_values_then_ends() {
    let items = collect(observable::from_iter(1..=3).to_stream(BackpressureStrategy::Error));
    let values: Vec<_> = items.into_iter().map(|item| item.unwrap()).collect();
    assert_eq!(values, vec![1, 2, 3]);
  }

  #[test]
  fn error_is_the_last_item() {
    let subject = PublishSubject::new();
    let mut stream = subject.as_observable().to_stream(BackpressureStrategy::Buffer);
    // The first poll subscribes.
    block_on(async { assert!(futures::poll!(stream.next()).is_pending()) });
    subject.next(1);
    subject.error("boom".into());
    let items = collect(stream);
    assert_eq!(items.len(), 2);
    assert_eq!(*items[0].as_ref().unwrap(), 1);
    assert_eq!(items[1].as_ref().unwrap_err().to_string(), "boom");
  }

  fn overflowing(strategy: BackpressureStrategy) -> (PublishSubject<i32>, ObservableStream<i32>) {
    let subject = PublishSubject::new();
    let mut stream = subject.as_observable().to_stream_with(strategy, 2);
    block_on(async { assert!(futures::poll!(stream.next()).is_pending()) });
    for v in 1..=4 {
      subject.next(v);
    }
    (subject, stream)
  }

  #[test]
  fn error_strategy_fails_on_overflow() {
    let (subject, stream) = overflowing(BackpressureStrategy::Error);
    assert!(!subject.has_observers());
    let items = collect(stream);
    assert_eq!(items.len(), 3);
    let err = items[2].as_ref().unwrap_err();
    assert!(matches!(err, RxError::MissingBackpressure(_)));
    assert!(err.to_string().contains("could not emit value due to lack of requests"));
  }

  #[test]
  fn missing_strategy_reports_full_queue() {
    let (_subject, stream) = overflowing(BackpressureStrategy::Missing);
    let items = collect(stream);
    assert!(items[2].as_ref().unwrap_err().to_string().contains("queue is full"));
  }

  #[test]
  fn drop_oldest_keeps_the_newest() {
    let (subject, stream) = overflowing(BackpressureStrategy::DropOldest);
    subject.complete();
    let values: Vec<_> = collect(stream).into_iter().map(|item| item.unwrap()).collect();
    assert_eq!(values, vec![3, 4]);
  }

  #[test]
  fn drop_latest_keeps_the_first() {
    let (subject, stream) = overflowing(BackpressureStrategy::DropLatest);
    subject.complete();
    let values: Vec<_> = collect(stream).into_iter().map(|item| item.unwrap()).collect();
    assert_eq!(values, vec![1, 2]);
  }

  #[test]
  fn buffer_ignores_capacity() {
    let (subject, stream) = overflowing(BackpressureStrategy::Buffer);
    subject.complete();
    assert_eq!(collect(stream).len(), 4);
  }

  #[test]
  fn dropping_the_stream_disposes() {
    let subject = PublishSubject::<i32>::new();
    let mut stream = subject.as_observable().to_stream(BackpressureStrategy::Buffer);
    block_on(async { assert!(futures::poll!(stream.next()).is_pending()) });
    assert!(subject.has_observers());
    drop(stream);
    assert!(!subject.has_observers());
  }

  #[test]
  fn consumed_from_another_thread() {
    let stream = observable::from_iter(0..1000)
      .observe_on(crate::scheduler::single())
      .to_stream(BackpressureStrategy::Buffer);
    let handle = std::thread::spawn(move || collect(stream).len());
    assert_eq!(handle.join().unwrap(), 1000);
  }
}
