//! # rxcore: a push-based reactive stream engine
//!
//! Thread-safe Reactive Extensions with cooperative cancellation, pluggable
//! schedulers, operator fusion and flat-map coordination.
//!
//! ## Quick Start
//!
//! ```rust
//! use rxcore::prelude::*;
//!
//! observable::from_iter(0..10)
//!   .filter(|v| v % 2 == 0)
//!   .map(|v| v * 2)
//!   .subscribe(|v| println!("Value: {}", v));
//! ```
//!
//! ## Key Concepts
//!
//! | Type | Description |
//! |------|-------------|
//! | [`Observable`] | A cold source; every subscription runs it anew |
//! | [`Observer`] | Consumes `next`, `error`, and `complete` events |
//! | [`Disposable`] | Idempotent handle to cancel a subscription |
//! | [`Scheduler`] | Where work runs: trampoline, pools, virtual time |
//! | [`FusionMode`] | Pull values straight from the upstream's queue |
//!
//! Errors nobody can receive go to the [undeliverable sink](plugins).
//!
//! ## Feature Flags
//!
//! - **`tokio-scheduler`**: a [`Scheduler`] running on a tokio runtime
//!
//! [`Observable`]: observable::Observable
//! [`Observer`]: observer::Observer
//! [`Disposable`]: disposable::Disposable
//! [`Scheduler`]: scheduler::Scheduler
//! [`FusionMode`]: fusion::FusionMode

pub mod config;
pub mod disposable;
pub mod error;
pub mod fusion;
pub mod observable;
pub mod observer;
pub mod ops;
pub mod plugins;
pub mod prelude;
pub mod scheduler;
pub mod subject;
pub mod testing;

pub use prelude::*;
