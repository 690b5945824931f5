use crate::{
  error::RxError,
  fusion::Upstream,
  observable::{Observable, ObservableSource},
  observer::{set_upstream_once, BoxedObserver, Observer},
};

impl<T: Send + 'static> Observable<T> {
  /// Emit the first `count` values, then cancel the upstream and complete.
  pub fn take(&self, count: usize) -> Observable<T> {
    Observable::new(TakeOp { source: self.clone(), count })
  }
}

struct TakeOp<T> {
  source: Observable<T>,
  count: usize,
}

impl<T: Send + 'static> ObservableSource<T> for TakeOp<T> {
  fn subscribe_actual(&self, observer: BoxedObserver<T>) {
    self.source.subscribe_with(TakeObserver {
      observer: Some(observer),
      remaining: self.count,
      upstream: None,
    });
  }
}

struct TakeObserver<T> {
  observer: Option<BoxedObserver<T>>,
  remaining: usize,
  upstream: Option<Upstream<T>>,
}

impl<T: Send + 'static> TakeObserver<T> {
  fn stop(&mut self) {
    if let Some(upstream) = &self.upstream {
      upstream.dispose();
    }
    if let Some(observer) = self.observer.take() {
      observer.complete();
    }
  }
}

impl<T: Send + 'static> Observer<T> for TakeObserver<T> {
  fn on_subscribe(&mut self, upstream: Upstream<T>) {
    if !set_upstream_once(&mut self.upstream, upstream.clone(), &mut self.observer) {
      return;
    }
    // Counting needs every value to pass through `next`.
    if let Some(observer) = self.observer.as_mut() {
      observer.on_subscribe(upstream.into_plain());
    }
    if self.remaining == 0 {
      self.stop();
    }
  }

  fn next(&mut self, value: T) {
    if self.remaining == 0 {
      return;
    }
    self.remaining -= 1;
    if let Some(observer) = self.observer.as_mut() {
      observer.next(value);
    }
    if self.remaining == 0 {
      self.stop();
    }
  }

  fn error(self: Box<Self>, err: RxError) {
    if let Some(observer) = self.observer {
      observer.error(err);
    }
  }

  fn complete(self: Box<Self>) {
    if let Some(observer) = self.observer {
      observer.complete();
    }
  }
}

#[cfg(test)]
mod tests {
  use crate::{
    fusion::FusionMode,
    observable::{self, Emitter},
    testing::TestObserver,
  };

  #[test]
  fn takes_prefix() { observable::from_iter(0..100).take(3).test().assert_result(&[0, 1, 2]); }

  #[test]
  fn take_zero_completes_at_once() {
    observable::never::<i32>().take(0).test().assert_result(&[]);
  }

  #[test]
  fn stops_the_source() {
    let to = observable::create(|e: Emitter<i32>| {
      let mut i = 0;
      while !e.is_disposed() {
        e.next(i);
        i += 1;
      }
    })
    .take(2)
    .test();
    to.assert_result(&[0, 1]);
  }

  #[test]
  fn declines_fusion() {
    let to = TestObserver::with_fusion(FusionMode::ANY);
    observable::from_iter(0..5).take(2).subscribe_with(to.clone());
    assert_eq!(to.fusion_mode(), FusionMode::NONE);
    to.assert_result(&[0, 1]);
  }
}
