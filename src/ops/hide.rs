use crate::{
  error::RxError,
  fusion::Upstream,
  observable::{Observable, ObservableSource},
  observer::{BoxedObserver, Observer},
};

impl<T: Send + 'static> Observable<T> {
  /// Hide the identity of the upstream: consumers only see a plain
  /// cancellation handle, so no fusion happens across this point.
  pub fn hide(&self) -> Observable<T> { Observable::new(HideOp(self.clone())) }
}

struct HideOp<T>(Observable<T>);

impl<T: Send + 'static> ObservableSource<T> for HideOp<T> {
  fn subscribe_actual(&self, observer: BoxedObserver<T>) { self.0.subscribe_with(HideObserver(observer)) }
}

struct HideObserver<T>(BoxedObserver<T>);

impl<T: Send + 'static> Observer<T> for HideObserver<T> {
  fn on_subscribe(&mut self, upstream: Upstream<T>) { self.0.on_subscribe(upstream.into_plain()) }

  fn next(&mut self, value: T) { self.0.next(value) }

  fn error(self: Box<Self>, err: RxError) { self.0.error(err) }

  fn complete(self: Box<Self>) { self.0.complete() }
}
