//! Operators.
//!
//! Each file adds its methods to [`Observable`](crate::observable::Observable)
//! through an inherent `impl` block and keeps its observer types private.
//!
//! | Group | Operators |
//! |-------|-----------|
//! | Transform | `map`, `try_map`, `filter`, `take`, `take_while`, `hide`, `do_after_next` |
//! | Flatten | `flat_map*`, `concat_map*`, `flat_map_iter`, `try_flat_map_iter` |
//! | Scheduling | `subscribe_on`, `observe_on*`, `delay*` |
//! | Resubscription | `repeat_when`, `retry_when`, `repeat`, `retry` |
//! | Conversion | `to_stream*` |

pub mod concat_map;
pub mod delay;
pub mod do_after_next;
pub mod filter;
pub mod flat_map;
pub mod flat_map_iter;
pub mod hide;
pub mod map;
pub mod observe_on;
pub mod redo;
pub mod subscribe_on;
pub mod take;
pub mod take_while;
pub mod to_stream;

pub use concat_map::ConcatMapConfig;
pub use flat_map::{ErrorMode, FlatMapConfig};
pub use to_stream::{BackpressureStrategy, ObservableStream};
