//! Runtime configuration.
//!
//! The global configuration is read once from the environment the first time
//! it is needed:
//!
//! | Variable | Meaning | Default |
//! |----------|---------|---------|
//! | `RXCORE_COMPUTATION_THREADS` | lanes of [`computation`](crate::scheduler::computation) | available parallelism |
//! | `RXCORE_BUFFER_SIZE` | default capacity of [`to_stream`](crate::observable::Observable::to_stream) | 128 |
//! | `RXCORE_THREAD_PREFIX` | prefix of scheduler thread names | `rx` |
//!
//! Invalid values are logged and replaced with the default.
//!
//! ```rust
//! use rxcore::config::RxConfig;
//!
//! let config = RxConfig::new().computation_threads(2).buffer_size(16);
//! assert_eq!(config.buffer_size, 16);
//! ```

use once_cell::sync::Lazy;

pub const COMPUTATION_THREADS_VAR: &str = "RXCORE_COMPUTATION_THREADS";
pub const BUFFER_SIZE_VAR: &str = "RXCORE_BUFFER_SIZE";
pub const THREAD_PREFIX_VAR: &str = "RXCORE_THREAD_PREFIX";

pub const DEFAULT_BUFFER_SIZE: usize = 128;

static GLOBAL: Lazy<RxConfig> = Lazy::new(RxConfig::from_env);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RxConfig {
  /// Number of serial lanes backing the computation scheduler.
  pub computation_threads: usize,
  /// Default buffer capacity of the push-to-pull conversion.
  pub buffer_size: usize,
  pub thread_name_prefix: String,
}

impl Default for RxConfig {
  fn default() -> Self {
    Self {
      computation_threads: default_threads(),
      buffer_size: DEFAULT_BUFFER_SIZE,
      thread_name_prefix: "rx".to_owned(),
    }
  }
}

impl RxConfig {
  pub fn new() -> Self { Self::default() }

  /// The process-wide configuration, read from the environment on first use.
  pub fn global() -> &'static RxConfig { &GLOBAL }

  pub fn from_env() -> Self { Self::from_lookup(|key| std::env::var(key).ok()) }

  /// Build a configuration from an arbitrary key lookup.
  pub fn from_lookup<L>(lookup: L) -> Self
  where
    L: Fn(&str) -> Option<String>,
  {
    let mut config = Self::default();
    if let Some(threads) = parse_positive(&lookup, COMPUTATION_THREADS_VAR) {
      config.computation_threads = threads;
    }
    if let Some(size) = parse_positive(&lookup, BUFFER_SIZE_VAR) {
      config.buffer_size = size;
    }
    if let Some(prefix) = lookup(THREAD_PREFIX_VAR) {
      let prefix = prefix.trim();
      if prefix.is_empty() {
        tracing::warn!(var = THREAD_PREFIX_VAR, "empty thread prefix ignored");
      } else {
        config.thread_name_prefix = prefix.to_owned();
      }
    }
    config
  }

  pub fn computation_threads(mut self, threads: usize) -> Self {
    self.computation_threads = threads.max(1);
    self
  }

  pub fn buffer_size(mut self, size: usize) -> Self {
    self.buffer_size = size.max(1);
    self
  }

  pub fn thread_name_prefix(mut self, prefix: impl Into<String>) -> Self {
    self.thread_name_prefix = prefix.into();
    self
  }
}

fn default_threads() -> usize {
  std::thread::available_parallelism().map_or(1, |n| n.get())
}

fn parse_positive<L>(lookup: &L, key: &str) -> Option<usize>
where
  L: Fn(&str) -> Option<String>,
{
  let raw = lookup(key)?;
  match raw.trim().parse::<usize>() {
    Ok(value) if value > 0 => Some(value),
    _ => {
      tracing::warn!(var = key, value = %raw, "expected a positive integer, using default");
      None
    }
  }
}
