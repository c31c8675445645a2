//! The allocator context.
//!
//! A [`Forge`] owns its arenas, its live configuration and its counters.
//! Independent instances never share state, so tests can build as many as
//! they like while the drop-in front ends go through one process-wide
//! instance.

use core::{
  cell::UnsafeCell,
  hint::spin_loop,
  ptr::{
    self,
    NonNull,
  },
  sync::atomic::{
    AtomicPtr,
    AtomicU8,
    AtomicUsize,
    Ordering,
  },
};

use memforge_sync::thread::{
  ThreadToken,
  thread_token,
};
use memforge_sys::system::{
  DEFAULT_SYSTEM,
  System,
};
use spin::Mutex;

use crate::{
  arena::{
    Arena,
    Placement,
    Policy,
  },
  backing::{
    Backing,
    DirectMaps,
    Route,
  },
  block::{
    Block,
    Geometry,
  },
  classes::SizeClasses,
  config::{
    Assignment,
    Config,
    DEFAULT_ALIGNMENT,
    DEFAULT_MAX_HEAP_SIZE,
    DEFAULT_PAGE_SIZE,
    DEFAULT_SEGMENT_SIZE,
    MAX_ALIGNMENT,
    MAX_ARENAS,
    Strategy,
  },
  error::{
    Corruption,
    ForgeError,
    ForgeResult,
  },
  stats::{
    HeapReport,
    Stats,
    StatsSnapshot,
    Trimmed,
  },
};

const UNINITIALIZED: u8 = 0;
const INITIALIZING: u8 = 1;
const READY: u8 = 2;
const SHUTTING_DOWN: u8 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
  Uninitialized,
  Initializing,
  Ready,
  ShuttingDown,
}

impl Lifecycle {
  const fn from_tag(tag: u8) -> Self {
    match tag {
      INITIALIZING => Lifecycle::Initializing,
      READY => Lifecycle::Ready,
      SHUTTING_DOWN => Lifecycle::ShuttingDown,
      _ => Lifecycle::Uninitialized,
    }
  }
}

/// Everything derived from the live configuration. Written only while the
/// state is `Initializing`.
struct Settings {
  config: Config,
  policy: Policy,
  backing: Backing,
}

impl Settings {
  const fn placeholder(config: Config, system: &'static dyn System) -> Self {
    Self {
      config,
      policy: Policy {
        geo: Geometry::new(DEFAULT_ALIGNMENT),
        strategy: Strategy::Hybrid,
        segment_size: DEFAULT_SEGMENT_SIZE,
        max_heap_size: DEFAULT_MAX_HEAP_SIZE,
      },
      backing: Backing::from_parts(system, DEFAULT_PAGE_SIZE),
    }
  }

  fn build(config: Config, system: &'static dyn System) -> Self {
    Self {
      config,
      policy: Policy {
        geo: Geometry::new(config.alignment()),
        strategy: config.strategy(),
        segment_size: config.segment_size(),
        max_heap_size: config.max_heap_size(),
      },
      backing: Backing::new(system, config.page_size()),
    }
  }
}

pub struct Forge {
  state: AtomicU8,
  /// Used when the first call arrives before any explicit initialization.
  defaults: Config,
  system: &'static dyn System,
  settings: UnsafeCell<Settings>,
  arenas: [AtomicPtr<Arena>; MAX_ARENAS],
  live: AtomicUsize,
  /// Outlives shutdown, since direct blocks stay valid across it.
  direct: Mutex<DirectMaps>,
  stats: Stats,
}

// Settings are only written by the thread that won the Initializing
// transition, and arenas guard their own state.
unsafe impl Sync for Forge {}

impl Forge {
  pub const fn new(defaults: Config) -> Self {
    Self::with_system(defaults, DEFAULT_SYSTEM)
  }

  /// An instance that takes its memory from `system` instead of the OS.
  pub const fn with_system(defaults: Config, system: &'static dyn System) -> Self {
    Self {
      state: AtomicU8::new(UNINITIALIZED),
      defaults,
      system,
      settings: UnsafeCell::new(Settings::placeholder(defaults, system)),
      arenas: [const { AtomicPtr::new(ptr::null_mut()) }; MAX_ARENAS],
      live: AtomicUsize::new(0),
      direct: Mutex::new(DirectMaps::new()),
      stats: Stats::new(),
    }
  }

  pub fn state(&self) -> Lifecycle {
    Lifecycle::from_tag(self.state.load(Ordering::Acquire))
  }

  pub fn is_ready(&self) -> bool {
    self.state.load(Ordering::Acquire) == READY
  }

  fn settings(&self) -> &Settings {
    unsafe { &*self.settings.get() }
  }

  /// Live configuration, or the defaults before the first initialization.
  pub fn config(&self) -> Config {
    if self.is_ready() { self.settings().config } else { self.defaults }
  }

  pub fn stats(&self) -> StatsSnapshot {
    self.stats.snapshot()
  }

  /// Arenas actually running. May be below the configured count.
  pub fn arena_count(&self) -> usize {
    self.live.load(Ordering::Acquire)
  }

  /// Brings the allocator up with `config`, or the instance defaults. The
  /// first caller wins; everyone else waits until it is done. Calling this
  /// on a ready instance keeps the running configuration.
  pub fn initialize(&self, config: Option<Config>) -> ForgeResult<()> {
    let config = config.unwrap_or(self.defaults);
    config.validate()?;

    loop {
      match self
        .state
        .compare_exchange(UNINITIALIZED, INITIALIZING, Ordering::AcqRel, Ordering::Acquire)
      {
        Ok(_) => break,
        Err(READY) => return Ok(()),
        Err(_) => spin_loop(),
      }
    }

    let requested = config.arena_slots();
    match self.build(config) {
      Ok(created) => {
        self.state.store(READY, Ordering::Release);
        log::info!(
          "memforge ready: {created} arena(s), mmap threshold {} bytes, {:?} placement",
          config.mmap_threshold(),
          config.strategy()
        );
        if created < requested {
          log::warn!("only {created} of {requested} arenas could be created; continuing degraded");
        }
        Ok(())
      }
      Err(err) => {
        self.state.store(UNINITIALIZED, Ordering::Release);
        Err(err)
      }
    }
  }

  /// Creates the arenas. Failed slots are skipped and the survivors are
  /// packed from index zero. Fails only when not even one arena exists.
  fn build(&self, config: Config) -> ForgeResult<usize> {
    let settings = Settings::build(config, self.system);
    let classes = SizeClasses::new(settings.policy.geo.min_block);
    let backing = settings.backing;
    unsafe { *self.settings.get() = settings };

    let mut live = 0;
    let mut last = ForgeError::OutOfMemory;
    for _ in 0..config.arena_slots() {
      match Arena::create(live, &backing, classes) {
        Ok(arena) => {
          self.stats.record_arena(unsafe { arena.as_ref() }.header_bytes());
          self.arenas[live].store(arena.as_ptr(), Ordering::Release);
          live += 1;
        }
        Err(err) => last = err,
      }
    }

    if live == 0 {
      return Err(last);
    }
    self.live.store(live, Ordering::Release);
    Ok(live)
  }

  /// Initializes lazily, or waits for a concurrent initializer.
  fn ensure_ready(&self) -> ForgeResult<()> {
    loop {
      match self.state.load(Ordering::Acquire) {
        READY => return Ok(()),
        UNINITIALIZED => self.initialize(None)?,
        INITIALIZING => spin_loop(),
        _ => return Err(ForgeError::NotReady),
      }
    }
  }

  /// Destroys every arena and returns to `Uninitialized`. Heap pointers
  /// handed out earlier become invalid. Direct mappings stay valid and can
  /// still be released.
  pub fn shutdown(&self) {
    if !self.is_ready() {
      return;
    }
    log::info!("memforge shutting down {} arena(s)", self.arena_count());
    if self
      .state
      .compare_exchange(READY, SHUTTING_DOWN, Ordering::AcqRel, Ordering::Acquire)
      .is_err()
    {
      return;
    }

    let live = self.live.swap(0, Ordering::AcqRel);
    for slot in &self.arenas[..live] {
      let Some(arena) = NonNull::new(slot.swap(ptr::null_mut(), Ordering::AcqRel)) else {
        continue;
      };
      let header = unsafe { arena.as_ref() }.header_bytes();
      let (segments, bytes) = unsafe { Arena::destroy(arena) };
      self.stats.record_segment_release(segments, bytes);
      self.stats.record_arena_release(header);
    }

    self.state.store(UNINITIALIZED, Ordering::Release);
  }

  /// Shuts down, clears the counters and starts again with the last
  /// configuration, including its full arena count.
  pub fn reset(&self) -> ForgeResult<()> {
    let config = self.config();
    self.shutdown();
    self.stats.reset();
    self.initialize(Some(config))
  }

  fn arena(&self, index: usize) -> Option<&Arena> {
    let arena = self.arenas.get(index)?.load(Ordering::Acquire);
    unsafe { arena.as_ref() }
  }

  /// Arena index for a thread with the given token. Out-of-range answers
  /// fall back to the main arena.
  pub fn resolve_arena(&self, token: ThreadToken) -> usize {
    let live = self.arena_count();
    if live <= 1 {
      return 0;
    }

    let index = match self.settings().config.assignment() {
      Assignment::RoundRobin => token % live,
      Assignment::Single => 0,
      Assignment::Custom(assign) => assign(token, live),
      Assignment::ContentionAware => self.first_idle(token % live, live),
    };
    if index < live { index } else { 0 }
  }

  /// First idle arena starting at `preferred`. Settles on `preferred` when
  /// all of them are busy.
  fn first_idle(&self, preferred: usize, live: usize) -> usize {
    for step in 0..live {
      let index = (preferred + step) % live;
      let Some(arena) = self.arena(index) else {
        continue;
      };
      if !arena.is_locked() {
        return index;
      }
      arena.note_contention();
      self.stats.record_contention();
    }
    preferred
  }

  fn pick_arena(&self) -> ForgeResult<&Arena> {
    let index = self.resolve_arena(thread_token());
    self
      .arena(index)
      .or_else(|| self.arena(0))
      .ok_or(ForgeError::NotReady)
  }

  fn map_direct(&self, want: usize, align: usize) -> ForgeResult<NonNull<Block>> {
    let settings = self.settings();
    let (block, len) = settings.backing.map_direct(want, align, &settings.policy.geo)?;
    unsafe { self.direct.lock().insert(block) };
    self.stats.record_map(len);
    Ok(block)
  }

  /// Validated header of a live block. Headers that are neither registered
  /// direct blocks nor backed by mapped memory are never read.
  fn lookup(&self, ptr: NonNull<u8>) -> ForgeResult<NonNull<Block>> {
    let settings = self.settings();
    let geo = &settings.policy.geo;
    let addr = ptr.as_ptr() as usize;
    if addr % geo.alignment != 0 {
      return Err(Corruption::Misaligned.into());
    }
    let Some(header) = addr.checked_sub(geo.header).and_then(|at| NonNull::new(at as *mut Block)) else {
      return Err(Corruption::BadMagic.into());
    };

    let registered = self.direct.lock().contains(header);
    if !registered && !settings.backing.system().is_live(header.as_ptr() as usize) {
      // the direct mapping it came from is gone
      return Err(Corruption::DoubleFree.into());
    }

    let block = unsafe { Block::validate(ptr, geo) }?;
    match (registered, unsafe { block.as_ref() }.is_mapped()) {
      (true, false) => Err(Corruption::BadMagic.into()),
      (false, true) => Err(Corruption::DoubleFree.into()),
      _ => Ok(block),
    }
  }

  /// Routes a request of `raw` caller bytes, already rounded to `want`.
  fn place(&self, raw: usize, want: usize, align: usize) -> ForgeResult<NonNull<u8>> {
    let settings = self.settings();
    let geo = &settings.policy.geo;

    let block = match Route::for_request(raw, settings.config.mmap_threshold()) {
      Route::Direct => self.map_direct(want, align)?,
      Route::Heap => {
        let arena = self.pick_arena()?;
        match arena.allocate(want, align, &settings.backing, &settings.policy)? {
          Placement::Reused(block) => block,
          Placement::Grown { block, mapped } => {
            self.stats.record_segment(mapped);
            log::trace!("arena {} grew by a {mapped} byte segment", arena.index());
            block
          }
          Placement::HeapFull => {
            log::debug!(
              "arena {} reached its heap limit, mapping {want} bytes directly",
              arena.index()
            );
            self.map_direct(want, align)?
          }
        }
      }
    };

    self.stats.record_alloc(unsafe { block.as_ref() }.size());
    Ok(Block::payload(block, geo))
  }

  /// At least `size` bytes aligned to the configured unit. Zero-byte
  /// requests get a distinct minimum block.
  pub fn allocate(&self, size: usize) -> ForgeResult<NonNull<u8>> {
    self.ensure_ready()?;
    let geo = self.settings().policy.geo;
    let want = geo.request(size)?;
    self.place(size, want, geo.alignment)
  }

  /// `alignment` must be a power of two no larger than a page.
  pub fn allocate_aligned(&self, alignment: usize, size: usize) -> ForgeResult<NonNull<u8>> {
    if !alignment.is_power_of_two() {
      return Err(ForgeError::InvalidArgument("alignment must be a power of two"));
    }
    if alignment > MAX_ALIGNMENT {
      return Err(ForgeError::InvalidArgument("alignment above 4096 is not supported"));
    }
    self.ensure_ready()?;
    let geo = self.settings().policy.geo;
    let want = geo.request(size)?;
    self.place(size, want, alignment.max(geo.alignment))
  }

  /// `count * size` zeroed bytes.
  pub fn allocate_zeroed(&self, count: usize, size: usize) -> ForgeResult<NonNull<u8>> {
    let total = count.checked_mul(size).ok_or(ForgeError::Overflow)?;
    let ptr = self.allocate(total)?;
    let geo = &self.settings().policy.geo;
    // fresh direct mappings come zeroed from the OS
    if !unsafe { Block::from_payload(ptr, geo).as_ref() }.is_mapped() {
      unsafe { ptr.as_ptr().write_bytes(0, total) };
    }
    Ok(ptr)
  }

  /// Returns memory from any of the allocate calls. Null is ignored. A
  /// pointer that fails header validation is reported as corruption and
  /// left untouched.
  pub fn release(&self, ptr: *mut u8) -> ForgeResult<()> {
    let Some(ptr) = NonNull::new(ptr) else {
      return Ok(());
    };
    self.ensure_ready()?;

    let settings = self.settings();
    let geo = &settings.policy.geo;
    let block = self.lookup(ptr)?;
    let header = unsafe { block.as_ref() };
    let size = header.size();

    if header.is_mapped() {
      if !self.direct.lock().remove(block) {
        return Err(Corruption::DoubleFree.into());
      }
      let len = unsafe { settings.backing.unmap_direct(block, geo) };
      self.stats.record_unmap(len);
    } else {
      let segment = unsafe { &*header.segment() };
      let arena = unsafe { &*segment.arena() };
      unsafe { arena.release(block, geo) }?;
    }

    self.stats.record_free(size);
    Ok(())
  }

  /// [`Forge::release`] for callers that cannot handle corruption. Aborts
  /// the process when the heap can no longer be trusted.
  pub fn free(&self, ptr: *mut u8) {
    if let Err(err) = self.release(ptr) {
      if err.is_fatal() {
        log::error!("memforge: {err} while releasing {ptr:p}; aborting");
        std::process::abort();
      }
    }
  }

  /// Changes the size of an allocation, keeping the first
  /// `min(old, new_size)` bytes. Null behaves as allocate, and a zero size
  /// releases and hands back a fresh zero-byte block.
  pub fn resize(&self, ptr: *mut u8, new_size: usize) -> ForgeResult<NonNull<u8>> {
    let Some(old_ptr) = NonNull::new(ptr) else {
      return self.allocate(new_size);
    };
    if new_size == 0 {
      self.release(ptr)?;
      return self.allocate(0);
    }
    self.ensure_ready()?;

    let settings = self.settings();
    let geo = &settings.policy.geo;
    let block = self.lookup(old_ptr)?;
    let header = unsafe { block.as_ref() };
    let old = header.size();
    let want = geo.request(new_size)?;

    if header.is_mapped() {
      // keep the mapping unless it would be mostly empty
      if want <= old && want.saturating_mul(2) >= old {
        return Ok(old_ptr);
      }
    } else {
      let arena = unsafe { &*(*header.segment()).arena() };
      if want <= old {
        unsafe { arena.shrink(block, want, geo) };
        self.stats.record_resize(old, unsafe { block.as_ref() }.size());
        return Ok(old_ptr);
      }
      let route = Route::for_request(new_size, settings.config.mmap_threshold());
      if route == Route::Heap && unsafe { arena.grow_in_place(block, want, geo) } {
        self.stats.record_resize(old, unsafe { block.as_ref() }.size());
        return Ok(old_ptr);
      }
    }

    let fresh = self.allocate(new_size)?;
    unsafe { ptr::copy_nonoverlapping(old_ptr.as_ptr(), fresh.as_ptr(), old.min(new_size)) };
    self.release(ptr)?;
    Ok(fresh)
  }

  /// Usable bytes behind `ptr`, which may exceed what was asked for.
  pub fn usable_size(&self, ptr: *mut u8) -> ForgeResult<usize> {
    let Some(ptr) = NonNull::new(ptr) else {
      return Ok(0);
    };
    if !self.is_ready() {
      return Err(ForgeError::NotReady);
    }
    let block = self.lookup(ptr)?;
    Ok(unsafe { block.as_ref() }.size())
  }

  /// Gives free memory back to the OS, keeping about `pad` free bytes per
  /// arena.
  pub fn trim(&self, pad: usize) -> Trimmed {
    let mut total = Trimmed::default();
    if !self.is_ready() {
      return total;
    }

    let geo = &self.settings().policy.geo;
    for index in 0..self.arena_count() {
      let Some(arena) = self.arena(index) else {
        continue;
      };
      let trimmed = arena.trim(pad, geo);
      self
        .stats
        .record_segment_release(trimmed.segments(), trimmed.released());
      total.merge(trimmed);
    }

    if total.any() {
      log::debug!(
        "trim released {} segment(s) ({} bytes), reclaimed {} bytes",
        total.segments(),
        total.released(),
        total.reclaimed()
      );
    }
    total
  }

  /// Walks every arena's heap and checks the block invariants.
  pub fn verify(&self) -> ForgeResult<HeapReport> {
    let mut report = HeapReport::default();
    if !self.is_ready() {
      return Ok(report);
    }

    let geo = &self.settings().policy.geo;
    for index in 0..self.arena_count() {
      if let Some(arena) = self.arena(index) {
        report.merge(arena.verify(geo)?);
      }
    }
    Ok(report)
  }

  /// Direct mappings handed out and not yet released.
  pub fn direct_count(&self) -> usize {
    self.direct.lock().len()
  }

  /// Failed try-locks recorded on one arena.
  pub fn arena_contention(&self, index: usize) -> usize {
    self.arena(index).map_or(0, Arena::contention)
  }
}

impl Drop for Forge {
  fn drop(&mut self) {
    self.shutdown();
  }
}

#[cfg(test)]
mod tests;
