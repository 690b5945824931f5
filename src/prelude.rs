//! Prelude module for convenient imports
//!
//! This module re-exports commonly used types and traits for easy access.

// Sources
pub use crate::observable::{self, Emitter, Observable, ObservableSource};
// Observer side
pub use crate::observer::{BoxedObserver, Observer};
// Cancellation
pub use crate::disposable::{self, Disposable, DisposableExt, DisposableRef, DisposeGuard};
// Errors
pub use crate::error::{ProtocolViolation, RxError, RxResult};
// Fusion
pub use crate::fusion::{FusionMode, QueueSubscription, Upstream};
// Operator configuration
pub use crate::ops::{BackpressureStrategy, ConcatMapConfig, ErrorMode, FlatMapConfig, ObservableStream};
// Schedulers
pub use crate::scheduler::{self, Duration, Scheduler, SchedulerRef, TestScheduler, Worker, WorkerRef};
// Subject
pub use crate::subject::PublishSubject;
// Test tooling
pub use crate::testing::TestObserver;
