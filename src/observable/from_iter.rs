use std::{
  iter::Peekable,
  sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
  },
};

use parking_lot::Mutex;

use crate::{
  disposable::{self, Disposable},
  error::RxError,
  fusion::{FusionMode, QueueSubscription, Upstream},
  observable::{Observable, ObservableSource},
  observer::BoxedObserver,
  plugins,
};

/// Emit every item of `iter`, then complete.
///
/// The subscription supports SYNC fusion: a fusing consumer polls the
/// iterator directly instead of receiving pushes.
pub fn from_iter<I>(iter: I) -> Observable<I::Item>
where
  I: IntoIterator + Clone + Send + Sync + 'static,
  I::IntoIter: Send + 'static,
  I::Item: Send + 'static,
{
  Observable::new(FromIter(iter))
}

/// Emit `value`, then complete.
pub fn just<T>(value: T) -> Observable<T>
where
  T: Clone + Send + Sync + 'static,
{
  from_iter(std::iter::once(value))
}

pub fn empty<T: Send + 'static>() -> Observable<T> {
  Observable::new(Signal::<T>(SignalKind::Complete, std::marker::PhantomData))
}

pub fn never<T: Send + 'static>() -> Observable<T> {
  Observable::new(Signal::<T>(SignalKind::Never, std::marker::PhantomData))
}

/// Fail every subscriber with `err`.
pub fn error<T: Send + 'static>(err: RxError) -> Observable<T> {
  Observable::new(Signal::<T>(SignalKind::Error(err), std::marker::PhantomData))
}

/// Run `action` per subscription and complete, or fail with its error.
pub fn from_action<T, F>(action: F) -> Observable<T>
where
  T: Send + 'static,
  F: Fn() -> Result<(), RxError> + Send + Sync + 'static,
{
  Observable::new(FromAction(action, std::marker::PhantomData))
}

/// Build the actual source lazily, once per subscription.
pub fn defer<T, F>(factory: F) -> Observable<T>
where
  T: Send + 'static,
  F: Fn() -> Result<Observable<T>, RxError> + Send + Sync + 'static,
{
  Observable::new(Defer(factory))
}

// ==================== from_iter ====================

struct FromIter<I>(I);

impl<I> ObservableSource<I::Item> for FromIter<I>
where
  I: IntoIterator + Clone + Send + Sync,
  I::IntoIter: Send + 'static,
  I::Item: Send + 'static,
{
  fn subscribe_actual(&self, mut observer: BoxedObserver<I::Item>) {
    let sub = Arc::new(IterSubscription {
      iter: Mutex::new(Some(self.0.clone().into_iter().peekable())),
      disposed: AtomicBool::new(false),
      fused: AtomicBool::new(false),
    });
    observer.on_subscribe(Upstream::Fused(sub.clone()));
    if sub.fused.load(Ordering::Acquire) {
      return;
    }
    loop {
      if sub.is_disposed() {
        return;
      }
      let item = sub.iter.lock().as_mut().and_then(Iterator::next);
      match item {
        Some(item) => observer.next(item),
        None => {
          if !sub.is_disposed() {
            observer.complete();
          }
          return;
        }
      }
    }
  }
}

struct IterSubscription<It: Iterator> {
  iter: Mutex<Option<Peekable<It>>>,
  disposed: AtomicBool,
  fused: AtomicBool,
}

impl<It> Disposable for IterSubscription<It>
where
  It: Iterator + Send,
  It::Item: Send,
{
  fn dispose(&self) {
    self.disposed.store(true, Ordering::Release);
    self.clear();
  }

  fn is_disposed(&self) -> bool { self.disposed.load(Ordering::Acquire) }
}

impl<It> QueueSubscription<It::Item> for IterSubscription<It>
where
  It: Iterator + Send,
  It::Item: Send,
{
  fn request_fusion(&self, mode: FusionMode) -> FusionMode {
    if mode.contains(FusionMode::SYNC) {
      self.fused.store(true, Ordering::Release);
      FusionMode::SYNC
    } else {
      FusionMode::NONE
    }
  }

  fn poll(&self) -> Result<Option<It::Item>, RxError> {
    Ok(self.iter.lock().as_mut().and_then(Iterator::next))
  }

  fn is_empty(&self) -> bool {
    self.iter.lock().as_mut().map_or(true, |it| it.peek().is_none())
  }

  fn clear(&self) {
    let dropped = self.iter.lock().take();
    drop(dropped);
  }
}

// ==================== constant signals ====================

enum SignalKind {
  Complete,
  Never,
  Error(RxError),
}

struct Signal<T>(SignalKind, std::marker::PhantomData<fn() -> T>);

impl<T: Send + 'static> ObservableSource<T> for Signal<T> {
  fn subscribe_actual(&self, mut observer: BoxedObserver<T>) {
    let handle = disposable::empty();
    observer.on_subscribe(Upstream::Plain(handle.clone()));
    if handle.is_disposed() {
      return;
    }
    match &self.0 {
      SignalKind::Complete => observer.complete(),
      SignalKind::Error(err) => observer.error(err.clone()),
      SignalKind::Never => {}
    }
  }
}

// ==================== from_action ====================

struct FromAction<F, T>(F, std::marker::PhantomData<fn() -> T>);

impl<T, F> ObservableSource<T> for FromAction<F, T>
where
  T: Send + 'static,
  F: Fn() -> Result<(), RxError> + Send + Sync,
{
  fn subscribe_actual(&self, mut observer: BoxedObserver<T>) {
    let handle = disposable::empty();
    observer.on_subscribe(Upstream::Plain(handle.clone()));
    if handle.is_disposed() {
      return;
    }
    let result = (self.0)();
    match (result, handle.is_disposed()) {
      (Ok(()), false) => observer.complete(),
      (Err(err), false) => observer.error(err),
      (Err(err), true) => plugins::on_error(err),
      (Ok(()), true) => {}
    }
  }
}

// ==================== defer ====================

struct Defer<F>(F);

impl<T, F> ObservableSource<T> for Defer<F>
where
  T: Send + 'static,
  F: Fn() -> Result<Observable<T>, RxError> + Send + Sync,
{
  fn subscribe_actual(&self, mut observer: BoxedObserver<T>) {
    match (self.0)() {
      Ok(source) => source.subscribe_boxed(observer),
      Err(err) => {
        observer.on_subscribe(Upstream::Plain(disposable::empty()));
        observer.error(err);
      }
    }
  }
}
