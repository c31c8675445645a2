use core::ffi::CStr;

use getset::CopyGetters;
use memforge_sync::thread::ThreadToken;

use crate::error::{
  ForgeError,
  ForgeResult,
};

/// Upper bound on arenas per allocator instance.
pub const MAX_ARENAS: usize = 64;
/// Number of segregated free-list buckets.
pub const NSCLASSES: usize = 16;
/// Smallest payload a block may carry.
pub const MIN_ALLOC: usize = 16;
/// Corruption tag stamped into every block header.
pub const MAGIC: u32 = 0xDEAD_BEEF;

pub const DEFAULT_MMAP_THRESHOLD: usize = 128 * 1024;
pub const DEFAULT_PAGE_SIZE: usize = 4096;
pub const DEFAULT_ALIGNMENT: usize = 16;
pub const MAX_ALIGNMENT: usize = 4096;
pub const DEFAULT_ARENA_COUNT: usize = 4;
pub const DEFAULT_SEGMENT_SIZE: usize = 128 * 1024;
pub const DEFAULT_MAX_HEAP_SIZE: usize = 16 * 1024 * 1024;

/// Placement policy used when searching a bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Strategy {
  FirstFit,
  BestFit,
  #[default]
  Hybrid,
}

impl Strategy {
  pub fn parse(raw: &str) -> Option<Self> {
    match raw.trim() {
      "0" | "first-fit" | "first_fit" | "first" => Some(Strategy::FirstFit),
      "1" | "best-fit" | "best_fit" | "best" => Some(Strategy::BestFit),
      "2" | "hybrid" => Some(Strategy::Hybrid),
      _ => None,
    }
  }
}

/// Maps `(thread token, live arena count)` to an arena index.
pub type AssignFn = fn(ThreadToken, usize) -> usize;

/// How calling threads are spread over arenas.
#[derive(Debug, Clone, Copy, Default)]
pub enum Assignment {
  /// Threads take arenas in order of first use.
  #[default]
  RoundRobin,
  /// Like `RoundRobin`, but a thread whose arena is busy tries the others.
  ContentionAware,
  /// Every thread uses the main arena.
  Single,
  Custom(AssignFn),
}

impl Assignment {
  pub fn parse(raw: &str) -> Option<Self> {
    match raw.trim() {
      "round-robin" | "round_robin" | "rr" => Some(Assignment::RoundRobin),
      "contention" | "contention-aware" | "contention_aware" => Some(Assignment::ContentionAware),
      "single" => Some(Assignment::Single),
      _ => None,
    }
  }
}

#[derive(Debug, Clone, Copy, CopyGetters)]
#[getset(get_copy = "pub")]
pub struct Config {
  /// Requests of at least this many bytes get their own mapping.
  mmap_threshold: usize,
  /// Rounding unit for segment growth. Never below the OS page.
  page_size: usize,
  /// Alignment of every payload and every recorded block size.
  alignment: usize,
  strategy: Strategy,
  assignment: Assignment,
  thread_safe: bool,
  arena_count: usize,
  /// Minimum size of a freshly grown heap segment.
  segment_size: usize,
  /// Per-arena heap footprint above which requests are mapped directly.
  max_heap_size: usize,
}

impl Config {
  pub const DEFAULT: Config = Config {
    mmap_threshold: DEFAULT_MMAP_THRESHOLD,
    page_size: DEFAULT_PAGE_SIZE,
    alignment: DEFAULT_ALIGNMENT,
    strategy: Strategy::Hybrid,
    assignment: Assignment::RoundRobin,
    thread_safe: true,
    arena_count: DEFAULT_ARENA_COUNT,
    segment_size: DEFAULT_SEGMENT_SIZE,
    max_heap_size: DEFAULT_MAX_HEAP_SIZE,
  };

  pub const fn with_mmap_threshold(mut self, bytes: usize) -> Self {
    self.mmap_threshold = bytes;
    self
  }

  pub const fn with_page_size(mut self, bytes: usize) -> Self {
    self.page_size = bytes;
    self
  }

  pub const fn with_alignment(mut self, bytes: usize) -> Self {
    self.alignment = bytes;
    self
  }

  pub const fn with_strategy(mut self, strategy: Strategy) -> Self {
    self.strategy = strategy;
    self
  }

  pub const fn with_assignment(mut self, assignment: Assignment) -> Self {
    self.assignment = assignment;
    self
  }

  pub const fn with_thread_safe(mut self, on: bool) -> Self {
    self.thread_safe = on;
    self
  }

  pub const fn with_arena_count(mut self, count: usize) -> Self {
    self.arena_count = count;
    self
  }

  pub const fn with_segment_size(mut self, bytes: usize) -> Self {
    self.segment_size = bytes;
    self
  }

  pub const fn with_max_heap_size(mut self, bytes: usize) -> Self {
    self.max_heap_size = bytes;
    self
  }

  /// Arenas to create. A single-threaded configuration only gets the main
  /// arena.
  pub const fn arena_slots(&self) -> usize {
    if self.thread_safe { self.arena_count } else { 1 }
  }

  pub fn validate(&self) -> ForgeResult<()> {
    if self.mmap_threshold == 0 {
      return Err(ForgeError::InvalidArgument("mmap threshold must be non-zero"));
    }
    if !self.page_size.is_power_of_two() {
      return Err(ForgeError::InvalidArgument("page size must be a power of two"));
    }
    if !self.alignment.is_power_of_two()
      || self.alignment < DEFAULT_ALIGNMENT
      || self.alignment > MAX_ALIGNMENT
    {
      return Err(ForgeError::InvalidArgument(
        "alignment must be a power of two in 16..=4096",
      ));
    }
    if self.arena_count == 0 || self.arena_count > MAX_ARENAS {
      return Err(ForgeError::InvalidArgument("arena count out of range"));
    }
    if self.segment_size == 0 {
      return Err(ForgeError::InvalidArgument("segment size must be non-zero"));
    }
    Ok(())
  }

  /// Defaults overridden by `MEMFORGE_*` environment variables. Reads
  /// through `getenv`, so it never allocates.
  pub fn from_env() -> Self {
    Self::from_vars(env_str)
  }

  /// Applies overrides one field at a time. A value that does not parse, or
  /// that would make the configuration invalid, leaves that field at its
  /// default and keeps every other override.
  pub fn from_vars<'a>(var: impl Fn(&CStr) -> Option<&'a str>) -> Self {
    let number = |name: &CStr| var(name).and_then(|s| s.trim().parse::<usize>().ok());
    let mut config = Config::DEFAULT;

    if let Some(v) = number(c"MEMFORGE_MMAP_THRESHOLD") {
      config.accept(config.with_mmap_threshold(v));
    }
    if let Some(v) = number(c"MEMFORGE_PAGE_SIZE") {
      config.accept(config.with_page_size(v));
    }
    if let Some(v) = number(c"MEMFORGE_ALIGNMENT") {
      config.accept(config.with_alignment(v));
    }
    if let Some(v) = var(c"MEMFORGE_STRATEGY").and_then(Strategy::parse) {
      config.accept(config.with_strategy(v));
    }
    if let Some(v) = var(c"MEMFORGE_ARENA_STRATEGY").and_then(Assignment::parse) {
      config.accept(config.with_assignment(v));
    }
    if let Some(v) = var(c"MEMFORGE_THREAD_SAFE").and_then(parse_bool) {
      config.accept(config.with_thread_safe(v));
    }
    if let Some(v) = number(c"MEMFORGE_ARENA_COUNT") {
      config.accept(config.with_arena_count(v));
    }
    if let Some(v) = number(c"MEMFORGE_SEGMENT_SIZE") {
      config.accept(config.with_segment_size(v));
    }
    if let Some(v) = number(c"MEMFORGE_MAX_HEAP_SIZE") {
      config.accept(config.with_max_heap_size(v));
    }

    config
  }

  fn accept(&mut self, candidate: Config) {
    if candidate.validate().is_ok() {
      *self = candidate;
    }
  }
}

impl Default for Config {
  fn default() -> Self {
    Config::DEFAULT
  }
}

fn env_str(name: &CStr) -> Option<&'static str> {
  let raw = unsafe { libc::getenv(name.as_ptr()) };
  if raw.is_null() {
    return None;
  }
  // getenv storage lives until the variable is modified
  let value: &'static CStr = unsafe { CStr::from_ptr(raw) };
  value.to_str().ok()
}

fn parse_bool(raw: &str) -> Option<bool> {
  match raw.trim() {
    "1" | "true" | "on" | "yes" => Some(true),
    "0" | "false" | "off" | "no" => Some(false),
    _ => None,
  }
}
