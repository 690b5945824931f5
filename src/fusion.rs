//! Operator fusion.
//!
//! Instead of receiving values through `next`, a consumer may pull them
//! straight from its producer's queue. The consumer asks for a mode when it
//! receives an [`Upstream::Fused`] handle; the producer answers with the mode
//! it grants:
//!
//! - [`FusionMode::SYNC`]: every value is already available. The consumer
//!   polls until `poll` returns `Ok(None)`, which also means completion. The
//!   producer sends nothing else.
//! - [`FusionMode::ASYNC`]: values arrive over time. The producer calls
//!   [`Observer::ready`](crate::observer::Observer::ready) instead of `next`
//!   when something was queued, and still sends `error`/`complete`.
//! - [`FusionMode::NONE`]: declined; values keep arriving through `next`.
//!
//! [`FusionMode::BOUNDARY`] tells the producer that `poll` will run on a
//! different thread than the one that produced the value. Producers whose
//! `poll` runs user code (`map`, `filter`) refuse fusion in that case.
//!
//! `poll` never fails for "no data": errors raised while polling come from
//! user functions and are returned as `Err`.

use std::{fmt, ops::BitOr, sync::Arc};

use crate::{
  disposable::{Disposable, DisposableRef},
  error::RxError,
};

mod spsc_queue;

pub use spsc_queue::SpscQueue;

#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct FusionMode(u8);

impl FusionMode {
  pub const NONE: FusionMode = FusionMode(0);
  pub const SYNC: FusionMode = FusionMode(1);
  pub const ASYNC: FusionMode = FusionMode(2);
  /// Either `SYNC` or `ASYNC`, whichever the producer supports.
  pub const ANY: FusionMode = FusionMode(3);
  pub const BOUNDARY: FusionMode = FusionMode(4);

  /// Whether all bits of `other` are requested. `NONE` is never contained.
  #[inline]
  pub fn contains(self, other: FusionMode) -> bool {
    other.0 != 0 && self.0 & other.0 == other.0
  }

  #[inline]
  pub fn without(self, other: FusionMode) -> FusionMode { FusionMode(self.0 & !other.0) }

  #[inline]
  pub fn is_none(self) -> bool { self.0 & FusionMode::ANY.0 == 0 }
}

impl BitOr for FusionMode {
  type Output = FusionMode;
  #[inline]
  fn bitor(self, rhs: FusionMode) -> FusionMode { FusionMode(self.0 | rhs.0) }
}

impl fmt::Debug for FusionMode {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self.without(FusionMode::BOUNDARY) {
      FusionMode::NONE => "NONE",
      FusionMode::SYNC => "SYNC",
      FusionMode::ASYNC => "ASYNC",
      _ => "ANY",
    };
    if self.contains(FusionMode::BOUNDARY) {
      write!(f, "{name}|BOUNDARY")
    } else {
      f.write_str(name)
    }
  }
}

/// The queue side of a fuseable upstream.
///
/// A producer hands this out once. Until `request_fusion` grants a mode the
/// producer keeps pushing through `next`.
pub trait QueueSubscription<T>: Disposable {
  fn request_fusion(&self, mode: FusionMode) -> FusionMode;

  fn poll(&self) -> Result<Option<T>, RxError>;

  fn is_empty(&self) -> bool;

  /// Drop everything queued. Safe to call concurrently with `dispose`.
  fn clear(&self);
}

/// What a producer hands to its observer in `on_subscribe`.
pub enum Upstream<T> {
  Plain(DisposableRef),
  Fused(Arc<dyn QueueSubscription<T>>),
}

impl<T> Clone for Upstream<T> {
  fn clone(&self) -> Self {
    match self {
      Upstream::Plain(d) => Upstream::Plain(d.clone()),
      Upstream::Fused(q) => Upstream::Fused(q.clone()),
    }
  }
}

impl<T: 'static> Upstream<T> {
  pub fn dispose(&self) {
    match self {
      Upstream::Plain(d) => d.dispose(),
      Upstream::Fused(q) => q.dispose(),
    }
  }

  pub fn is_disposed(&self) -> bool {
    match self {
      Upstream::Plain(d) => d.is_disposed(),
      Upstream::Fused(q) => q.is_disposed(),
    }
  }

  /// The cancellation side alone.
  pub fn disposable(&self) -> DisposableRef {
    match self {
      Upstream::Plain(d) => d.clone(),
      Upstream::Fused(q) => Arc::new(FusedHandle(q.clone())),
    }
  }

  pub fn queue(&self) -> Option<Arc<dyn QueueSubscription<T>>> {
    match self {
      Upstream::Plain(_) => None,
      Upstream::Fused(q) => Some(q.clone()),
    }
  }

  /// Hide the queue: consumers further down can only push.
  pub fn into_plain(self) -> Upstream<T> { Upstream::Plain(self.disposable()) }
}

struct FusedHandle<T>(Arc<dyn QueueSubscription<T>>);

impl<T: 'static> Disposable for FusedHandle<T> {
  fn dispose(&self) { self.0.dispose() }

  fn is_disposed(&self) -> bool { self.0.is_disposed() }
}

/// The queue a consumer drains: its own buffer for pushed values, or the
/// upstream's queue after fusion was granted.
pub(crate) enum FusedQueue<T> {
  Owned(Arc<SpscQueue<T>>),
  Upstream(Arc<dyn QueueSubscription<T>>),
}

impl<T> Clone for FusedQueue<T> {
  fn clone(&self) -> Self {
    match self {
      FusedQueue::Owned(q) => FusedQueue::Owned(q.clone()),
      FusedQueue::Upstream(q) => FusedQueue::Upstream(q.clone()),
    }
  }
}

impl<T> FusedQueue<T> {
  pub(crate) fn unbounded() -> Self { FusedQueue::Owned(Arc::new(SpscQueue::unbounded())) }

  pub(crate) fn poll(&self) -> Result<Option<T>, RxError> {
    match self {
      FusedQueue::Owned(q) => Ok(q.poll()),
      FusedQueue::Upstream(q) => q.poll(),
    }
  }

  pub(crate) fn is_empty(&self) -> bool {
    match self {
      FusedQueue::Owned(q) => q.is_empty(),
      FusedQueue::Upstream(q) => q.is_empty(),
    }
  }

  pub(crate) fn clear(&self) {
    match self {
      FusedQueue::Owned(q) => q.clear(),
      FusedQueue::Upstream(q) => q.clear(),
    }
  }
}
