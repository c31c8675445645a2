use core::sync::atomic::{
  AtomicUsize,
  Ordering,
};

use getset::CopyGetters;

/// Process-visible counters. Every field is updated with relaxed atomics,
/// so a snapshot taken under traffic may be slightly out of step across
/// fields but never loses an update.
#[derive(Debug, Default)]
pub struct Stats {
  total_mapped: AtomicUsize,
  total_allocated: AtomicUsize,
  total_freed: AtomicUsize,
  current_usage: AtomicUsize,
  peak_usage: AtomicUsize,
  allocation_count: AtomicUsize,
  free_count: AtomicUsize,
  mmap_count: AtomicUsize,
  segment_count: AtomicUsize,
  arena_count: AtomicUsize,
  contention_count: AtomicUsize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, CopyGetters)]
#[getset(get_copy = "pub")]
pub struct StatsSnapshot {
  /// Bytes currently mapped from the OS, arena headers included.
  total_mapped: usize,
  /// Usable bytes ever handed out.
  total_allocated: usize,
  /// Usable bytes ever taken back.
  total_freed: usize,
  current_usage: usize,
  peak_usage: usize,
  allocation_count: usize,
  free_count: usize,
  /// Live direct mappings.
  mmap_count: usize,
  /// Live heap segments.
  segment_count: usize,
  arena_count: usize,
  /// Times a thread found its arena busy.
  contention_count: usize,
}

const R: Ordering = Ordering::Relaxed;

impl Stats {
  pub const fn new() -> Self {
    Self {
      total_mapped: AtomicUsize::new(0),
      total_allocated: AtomicUsize::new(0),
      total_freed: AtomicUsize::new(0),
      current_usage: AtomicUsize::new(0),
      peak_usage: AtomicUsize::new(0),
      allocation_count: AtomicUsize::new(0),
      free_count: AtomicUsize::new(0),
      mmap_count: AtomicUsize::new(0),
      segment_count: AtomicUsize::new(0),
      arena_count: AtomicUsize::new(0),
      contention_count: AtomicUsize::new(0),
    }
  }

  pub fn record_alloc(&self, bytes: usize) {
    self.total_allocated.fetch_add(bytes, R);
    self.allocation_count.fetch_add(1, R);
    let now = self.current_usage.fetch_add(bytes, R) + bytes;
    self.peak_usage.fetch_max(now, R);
  }

  pub fn record_free(&self, bytes: usize) {
    self.total_freed.fetch_add(bytes, R);
    self.free_count.fetch_add(1, R);
    self.current_usage.fetch_sub(bytes, R);
  }

  /// An in-place size change. Not counted as an allocation or a free.
  pub fn record_resize(&self, old: usize, new: usize) {
    if new >= old {
      let grown = new - old;
      self.total_allocated.fetch_add(grown, R);
      let now = self.current_usage.fetch_add(grown, R) + grown;
      self.peak_usage.fetch_max(now, R);
    } else {
      let shrunk = old - new;
      self.total_freed.fetch_add(shrunk, R);
      self.current_usage.fetch_sub(shrunk, R);
    }
  }

  pub fn record_map(&self, bytes: usize) {
    self.total_mapped.fetch_add(bytes, R);
    self.mmap_count.fetch_add(1, R);
  }

  pub fn record_unmap(&self, bytes: usize) {
    self.total_mapped.fetch_sub(bytes, R);
    self.mmap_count.fetch_sub(1, R);
  }

  pub fn record_segment(&self, bytes: usize) {
    self.total_mapped.fetch_add(bytes, R);
    self.segment_count.fetch_add(1, R);
  }

  pub fn record_segment_release(&self, segments: usize, bytes: usize) {
    self.total_mapped.fetch_sub(bytes, R);
    self.segment_count.fetch_sub(segments, R);
  }

  pub fn record_arena(&self, bytes: usize) {
    self.total_mapped.fetch_add(bytes, R);
    self.arena_count.fetch_add(1, R);
  }

  pub fn record_arena_release(&self, bytes: usize) {
    self.total_mapped.fetch_sub(bytes, R);
    self.arena_count.fetch_sub(1, R);
  }

  pub fn record_contention(&self) {
    self.contention_count.fetch_add(1, R);
  }

  pub fn snapshot(&self) -> StatsSnapshot {
    StatsSnapshot {
      total_mapped: self.total_mapped.load(R),
      total_allocated: self.total_allocated.load(R),
      total_freed: self.total_freed.load(R),
      current_usage: self.current_usage.load(R),
      peak_usage: self.peak_usage.load(R),
      allocation_count: self.allocation_count.load(R),
      free_count: self.free_count.load(R),
      mmap_count: self.mmap_count.load(R),
      segment_count: self.segment_count.load(R),
      arena_count: self.arena_count.load(R),
      contention_count: self.contention_count.load(R),
    }
  }

  pub fn reset(&self) {
    for counter in [
      &self.total_mapped,
      &self.total_allocated,
      &self.total_freed,
      &self.current_usage,
      &self.peak_usage,
      &self.allocation_count,
      &self.free_count,
      &self.mmap_count,
      &self.segment_count,
      &self.arena_count,
      &self.contention_count,
    ] {
      counter.store(0, R);
    }
  }
}

/// Result of walking every heap segment.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, CopyGetters)]
#[getset(get_copy = "pub")]
pub struct HeapReport {
  segments: usize,
  blocks: usize,
  free_blocks: usize,
  /// Payload bytes in free blocks.
  free_bytes: usize,
  /// Payload bytes in blocks in use.
  used_bytes: usize,
}

impl HeapReport {
  pub(crate) fn add_segment(&mut self) {
    self.segments += 1;
  }

  pub(crate) fn add_block(&mut self, size: usize, free: bool) {
    self.blocks += 1;
    if free {
      self.free_blocks += 1;
      self.free_bytes += size;
    } else {
      self.used_bytes += size;
    }
  }

  pub fn merge(&mut self, other: HeapReport) {
    self.segments += other.segments;
    self.blocks += other.blocks;
    self.free_blocks += other.free_blocks;
    self.free_bytes += other.free_bytes;
    self.used_bytes += other.used_bytes;
  }
}

/// Outcome of a trim.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, CopyGetters)]
#[getset(get_copy = "pub")]
pub struct Trimmed {
  /// Segments unmapped.
  segments: usize,
  /// Bytes unmapped with them.
  released: usize,
  /// Bytes of free payload whose pages went back to the OS.
  reclaimed: usize,
}

impl Trimmed {
  pub(crate) fn new(segments: usize, released: usize, reclaimed: usize) -> Self {
    Self {
      segments,
      released,
      reclaimed,
    }
  }

  pub fn merge(&mut self, other: Trimmed) {
    self.segments += other.segments;
    self.released += other.released;
    self.reclaimed += other.reclaimed;
  }

  /// True when any memory went back to the OS.
  pub fn any(&self) -> bool {
    self.released > 0 || self.reclaimed > 0
  }
}
