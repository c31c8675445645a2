use super::*;
use crate::{
  config::Strategy,
  error::Corruption,
};
use core::sync::atomic::AtomicUsize;
use memforge_sys::system::{
  GLOBAL_SYSTEM,
  SysError,
  SysOption,
  SysResult,
};
use rand::{
  Rng,
  SeedableRng,
  rngs::StdRng,
  seq::SliceRandom,
};
use std::{
  collections::HashSet,
  thread,
};

/// Passes through to the OS except for map calls numbered in
/// `fail_from..fail_until`.
struct Flaky {
  calls: AtomicUsize,
  fail_from: usize,
  fail_until: usize,
}

impl Flaky {
  const fn new(fail_from: usize, fail_until: usize) -> Self {
    Self {
      calls: AtomicUsize::new(0),
      fail_from,
      fail_until,
    }
  }
}

unsafe impl System for Flaky {
  unsafe fn map<'mem>(&self, size: usize, options: SysOption) -> SysResult<&'mem mut [u8]> {
    let call = self.calls.fetch_add(1, Ordering::SeqCst);
    if (self.fail_from..self.fail_until).contains(&call) {
      return Err(SysError::OutOfMemory);
    }
    unsafe { GLOBAL_SYSTEM.map(size, options) }
  }

  unsafe fn advise(&self, slice: &[u8], options: SysOption) -> SysResult<()> {
    unsafe { GLOBAL_SYSTEM.advise(slice, options) }
  }

  unsafe fn unmap(&self, slice: &[u8]) -> SysResult<()> {
    unsafe { GLOBAL_SYSTEM.unmap(slice) }
  }

  fn is_live(&self, addr: usize) -> bool {
    GLOBAL_SYSTEM.is_live(addr)
  }
}

/// Passes through to the OS but keeps reporting the most recent unmapped
/// range as dead, even if the OS hands those pages to someone else.
struct Graveyard {
  start: AtomicUsize,
  len: AtomicUsize,
}

unsafe impl System for Graveyard {
  unsafe fn map<'mem>(&self, size: usize, options: SysOption) -> SysResult<&'mem mut [u8]> {
    unsafe { GLOBAL_SYSTEM.map(size, options) }
  }

  unsafe fn advise(&self, slice: &[u8], options: SysOption) -> SysResult<()> {
    unsafe { GLOBAL_SYSTEM.advise(slice, options) }
  }

  unsafe fn unmap(&self, slice: &[u8]) -> SysResult<()> {
    self.len.store(slice.len(), Ordering::SeqCst);
    self.start.store(slice.as_ptr() as usize, Ordering::SeqCst);
    unsafe { GLOBAL_SYSTEM.unmap(slice) }
  }

  fn is_live(&self, addr: usize) -> bool {
    let start = self.start.load(Ordering::SeqCst);
    let len = self.len.load(Ordering::SeqCst);
    !(start..start + len).contains(&addr) && GLOBAL_SYSTEM.is_live(addr)
  }
}

fn single() -> Config {
  Config::DEFAULT.with_arena_count(1)
}

fn forge(config: Config) -> Forge {
  let forge = Forge::new(config);
  forge.initialize(None).unwrap();
  forge
}

fn addr(ptr: NonNull<u8>) -> usize {
  ptr.as_ptr() as usize
}

#[test]
fn test_every_result_is_aligned() {
  let forge = forge(Config::DEFAULT);
  let sizes = [0, 1, 7, 16, 17, 100, 1000, 4095, 70_000, 131_071, 131_072, 500_000];

  let ptrs: Vec<_> = sizes
    .iter()
    .map(|&size| {
      let ptr = forge.allocate(size).unwrap();
      assert_eq!(addr(ptr) % 16, 0, "size {size}");
      assert!(forge.usable_size(ptr.as_ptr()).unwrap() >= size);
      unsafe { ptr.as_ptr().write_bytes(0xC3, size) };
      ptr
    })
    .collect();

  for ptr in ptrs {
    forge.release(ptr.as_ptr()).unwrap();
  }
  assert_eq!(forge.stats().current_usage(), 0);
}

#[test]
fn test_zero_size_allocations_are_distinct() {
  let forge = forge(single());
  let ptrs: Vec<_> = (0..8).map(|_| forge.allocate(0).unwrap()).collect();
  let unique: HashSet<_> = ptrs.iter().map(|&p| addr(p)).collect();
  assert_eq!(unique.len(), ptrs.len());

  for ptr in ptrs {
    assert_eq!(forge.usable_size(ptr.as_ptr()), Ok(16));
    forge.release(ptr.as_ptr()).unwrap();
  }
}

#[test]
fn test_release_null_is_noop() {
  let forge = forge(single());
  assert_eq!(forge.release(ptr::null_mut()), Ok(()));
  assert_eq!(forge.usable_size(ptr::null_mut()), Ok(0));
  assert_eq!(forge.stats().free_count(), 0);
}

#[test]
fn test_usage_returns_to_baseline() {
  let forge = forge(Config::DEFAULT);
  let baseline = forge.stats();
  let mut rng = StdRng::seed_from_u64(0x5EED);

  for _ in 0..20 {
    let mut live: Vec<_> = (0..64)
      .map(|_| forge.allocate(rng.random_range(0..20_000)).unwrap())
      .collect();
    live.shuffle(&mut rng);
    for ptr in live {
      forge.release(ptr.as_ptr()).unwrap();
    }
  }

  let after = forge.stats();
  assert_eq!(after.current_usage(), baseline.current_usage());
  assert_eq!(after.allocation_count(), after.free_count());
  assert_eq!(after.total_allocated(), after.total_freed());
  assert!(after.peak_usage() > 0);
}

#[test]
fn test_adjacent_blocks_coalesce() {
  let forge = forge(single());
  let a = forge.allocate(64).unwrap();
  let b = forge.allocate(64).unwrap();
  let _fence = forge.allocate(64).unwrap();
  let header = Geometry::new(16).header;
  assert_eq!(addr(b), addr(a) + 64 + header);

  forge.release(a.as_ptr()).unwrap();
  forge.release(b.as_ptr()).unwrap();

  // only fits where A and B used to be if they merged
  let merged = forge.allocate(64 + header + 64).unwrap();
  assert_eq!(merged, a);
  assert_eq!(forge.usable_size(merged.as_ptr()), Ok(176));
}

#[test]
fn test_released_block_is_reused() {
  for strategy in [Strategy::FirstFit, Strategy::Hybrid] {
    let forge = forge(single().with_strategy(strategy));
    let x = forge.allocate(256).unwrap();
    let _fence = forge.allocate(16).unwrap();

    forge.release(x.as_ptr()).unwrap();
    let y = forge.allocate(200).unwrap();
    assert_eq!(y, x, "{strategy:?}");
  }
}

#[test]
fn test_threshold_boundary() {
  let forge = forge(single());
  let threshold = forge.config().mmap_threshold();

  let before = forge.stats().mmap_count();
  let heap = forge.allocate(threshold - 1).unwrap();
  assert_eq!(forge.stats().mmap_count(), before);
  assert_eq!(forge.stats().segment_count(), 1);

  let direct = forge.allocate(threshold).unwrap();
  assert_eq!(forge.stats().mmap_count(), before + 1);

  forge.release(direct.as_ptr()).unwrap();
  assert_eq!(forge.stats().mmap_count(), before);
  forge.release(heap.as_ptr()).unwrap();
}

#[test]
fn test_resize_preserves_prefix() {
  let forge = forge(single());
  let pattern: Vec<u8> = (0..50u8).collect();

  let ptr = forge.allocate(50).unwrap();
  unsafe { ptr::copy_nonoverlapping(pattern.as_ptr(), ptr.as_ptr(), 50) };
  let _fence = forge.allocate(16).unwrap();

  let grown = forge.resize(ptr.as_ptr(), 500).unwrap();
  let prefix = unsafe { core::slice::from_raw_parts(grown.as_ptr(), 50) };
  assert_eq!(prefix, &pattern[..]);

  let huge = forge.resize(grown.as_ptr(), 300_000).unwrap();
  assert_eq!(forge.stats().mmap_count(), 1);
  let prefix = unsafe { core::slice::from_raw_parts(huge.as_ptr(), 50) };
  assert_eq!(prefix, &pattern[..]);

  let small = forge.resize(huge.as_ptr(), 40).unwrap();
  assert_eq!(forge.stats().mmap_count(), 0);
  let prefix = unsafe { core::slice::from_raw_parts(small.as_ptr(), 40) };
  assert_eq!(prefix, &pattern[..40]);

  forge.release(small.as_ptr()).unwrap();
  forge.verify().unwrap();
}

#[test]
fn test_resize_in_place() {
  let forge = forge(single());
  let ptr = forge.allocate(1024).unwrap();
  let _fence = forge.allocate(16).unwrap();

  let shrunk = forge.resize(ptr.as_ptr(), 100).unwrap();
  assert_eq!(shrunk, ptr);
  assert_eq!(forge.usable_size(ptr.as_ptr()), Ok(112));

  let regrown = forge.resize(ptr.as_ptr(), 1000).unwrap();
  assert_eq!(regrown, ptr);
  assert_eq!(forge.stats().current_usage(), 1024 + 16);
  forge.verify().unwrap();
}

#[test]
fn test_resize_edges() {
  let forge = forge(single());
  let fresh = forge.resize(ptr::null_mut(), 32).unwrap();
  assert_eq!(forge.usable_size(fresh.as_ptr()), Ok(32));

  let zero = forge.resize(fresh.as_ptr(), 0).unwrap();
  assert_eq!(forge.usable_size(zero.as_ptr()), Ok(16));
  assert_eq!(forge.stats().current_usage(), 16);
}

#[test]
fn test_double_release_is_corruption() {
  let forge = forge(single());
  let a = forge.allocate(64).unwrap();
  let b = forge.allocate(64).unwrap();
  let _fence = forge.allocate(64).unwrap();

  forge.release(a.as_ptr()).unwrap();
  assert_eq!(
    forge.release(a.as_ptr()),
    Err(ForgeError::Corruption(Corruption::DoubleFree))
  );

  // B merges into A but its old header still reads as free
  forge.release(b.as_ptr()).unwrap();
  assert_eq!(
    forge.release(b.as_ptr()),
    Err(ForgeError::Corruption(Corruption::DoubleFree))
  );
  assert_eq!(forge.stats().free_count(), 2);
  forge.verify().unwrap();
}

#[test]
fn test_direct_double_release_is_corruption() {
  let forge = forge(single());
  let p = forge.allocate(200_000).unwrap();
  assert_eq!(forge.direct_count(), 1);

  forge.release(p.as_ptr()).unwrap();
  assert_eq!(forge.direct_count(), 0);

  // the pages may already belong to another mapping by now
  assert!(matches!(
    forge.release(p.as_ptr()),
    Err(ForgeError::Corruption(_))
  ));
  assert_eq!(forge.stats().free_count(), 1);
  assert_eq!(forge.stats().current_usage(), 0);
}

#[test]
fn test_stale_direct_pointer_is_never_read() {
  static GRAVEYARD: Graveyard = Graveyard {
    start: AtomicUsize::new(0),
    len: AtomicUsize::new(0),
  };
  let forge = Forge::with_system(single(), &GRAVEYARD);
  forge.initialize(None).unwrap();

  let p = forge.allocate(300_000).unwrap();
  let q = forge.allocate(300_000).unwrap();
  forge.release(p.as_ptr()).unwrap();

  let double_free = ForgeError::Corruption(Corruption::DoubleFree);
  assert_eq!(forge.release(p.as_ptr()), Err(double_free));
  assert_eq!(forge.usable_size(p.as_ptr()), Err(double_free));
  assert_eq!(forge.resize(p.as_ptr(), 10), Err(double_free));

  assert_eq!(forge.direct_count(), 1);
  assert!(forge.usable_size(q.as_ptr()).unwrap() >= 300_000);
  forge.release(q.as_ptr()).unwrap();
  assert_eq!(forge.direct_count(), 0);
}

#[test]
fn test_unregistered_direct_block_is_rejected() {
  let forge = forge(single());
  let settings = forge.settings();
  let geo = settings.policy.geo;
  let (block, _) = settings.backing.map_direct(150_000, 16, &geo).unwrap();
  let payload = Block::payload(block, &geo);

  assert_eq!(
    forge.release(payload.as_ptr()),
    Err(ForgeError::Corruption(Corruption::DoubleFree))
  );
  assert_eq!(forge.direct_count(), 0);
  unsafe { settings.backing.unmap_direct(block, &geo) };
}

#[test]
fn test_direct_registry_under_contention() {
  let forge = forge(Config::DEFAULT);

  thread::scope(|scope| {
    for t in 0..4 {
      let forge = &forge;
      scope.spawn(move || {
        let mut rng = StdRng::seed_from_u64(t);
        for _ in 0..50 {
          let size = rng.random_range(131_072..400_000);
          let p = forge.allocate(size).unwrap();
          unsafe { p.as_ptr().write_bytes(t as u8, size) };
          forge.release(p.as_ptr()).unwrap();
        }
      });
    }
  });

  assert_eq!(forge.direct_count(), 0);
  assert_eq!(forge.stats().allocation_count(), 200);
  assert_eq!(forge.stats().mmap_count(), 0);
  assert_eq!(forge.stats().current_usage(), 0);
}

#[test]
fn test_foreign_pointers_are_rejected() {
  let forge = forge(single());
  let buffer = vec![0u128; 64];
  let inside = unsafe { buffer.as_ptr().add(8) } as *mut u8;

  assert_eq!(
    forge.release(inside),
    Err(ForgeError::Corruption(Corruption::BadMagic))
  );
  assert_eq!(
    forge.release(unsafe { inside.add(1) }),
    Err(ForgeError::Corruption(Corruption::Misaligned))
  );
  assert!(ForgeError::Corruption(Corruption::BadMagic).is_fatal());
}

#[test]
fn test_concurrent_cycles_keep_counters_and_regions_apart() {
  const THREADS: usize = 8;
  const ROUNDS: usize = 200;

  let forge = forge(Config::DEFAULT);
  let baseline = forge.stats();

  thread::scope(|scope| {
    for t in 0..THREADS {
      let forge = &forge;
      scope.spawn(move || {
        let mut rng = StdRng::seed_from_u64(t as u64);
        let tag = t as u8 + 1;
        for _ in 0..ROUNDS {
          let held: Vec<_> = (0..16)
            .map(|_| {
              let size = rng.random_range(1..4096);
              let ptr = forge.allocate(size).unwrap();
              unsafe { ptr.as_ptr().write_bytes(tag, size) };
              (ptr, size)
            })
            .collect();

          for (ptr, size) in held {
            let bytes = unsafe { core::slice::from_raw_parts(ptr.as_ptr(), size) };
            assert!(bytes.iter().all(|&b| b == tag), "region overwritten by another thread");
            forge.release(ptr.as_ptr()).unwrap();
          }
        }
      });
    }
  });

  let after = forge.stats();
  assert_eq!(after.current_usage(), baseline.current_usage());
  assert_eq!(after.allocation_count(), THREADS * ROUNDS * 16);
  assert_eq!(after.free_count(), THREADS * ROUNDS * 16);
  let report = forge.verify().unwrap();
  assert_eq!(report.used_bytes(), 0);
}

#[test]
fn test_live_regions_never_overlap() {
  let forge = forge(Config::DEFAULT);

  let regions: Vec<(usize, usize)> = thread::scope(|scope| {
    let handles: Vec<_> = (0..4)
      .map(|t| {
        let forge = &forge;
        scope.spawn(move || {
          let mut rng = StdRng::seed_from_u64(100 + t);
          (0..256)
            .map(|_| {
              let size = rng.random_range(1..8192);
              let ptr = forge.allocate(size).unwrap();
              (addr(ptr), size)
            })
            .collect::<Vec<_>>()
        })
      })
      .collect();
    handles.into_iter().flat_map(|h| h.join().unwrap()).collect()
  });

  let mut sorted = regions.clone();
  sorted.sort_unstable();
  for pair in sorted.windows(2) {
    assert!(pair[0].0 + pair[0].1 <= pair[1].0, "{pair:?} overlap");
  }

  for (ptr, _) in regions {
    forge.release(ptr as *mut u8).unwrap();
  }
  forge.verify().unwrap();
}

#[test]
fn test_out_of_memory_leaves_no_partial_state() {
  static NO_GROWTH: Flaky = Flaky::new(1, usize::MAX);
  let forge = Forge::with_system(single(), &NO_GROWTH);
  forge.initialize(None).unwrap();

  assert_eq!(forge.allocate(64), Err(ForgeError::OutOfMemory));
  assert_eq!(forge.allocate(1 << 20), Err(ForgeError::OutOfMemory));

  let stats = forge.stats();
  assert_eq!(stats.current_usage(), 0);
  assert_eq!(stats.allocation_count(), 0);
  assert_eq!(stats.segment_count(), 0);
  assert_eq!(stats.mmap_count(), 0);
  assert_eq!(forge.verify(), Ok(HeapReport::default()));
}

#[test]
fn test_failed_initialization_stays_uninitialized() {
  static NOTHING: Flaky = Flaky::new(0, usize::MAX);
  let forge = Forge::with_system(single(), &NOTHING);

  assert_eq!(forge.initialize(None), Err(ForgeError::OutOfMemory));
  assert_eq!(forge.state(), Lifecycle::Uninitialized);
  assert_eq!(forge.allocate(16), Err(ForgeError::OutOfMemory));
}

#[test]
fn test_invalid_alignment_is_rejected() {
  let forge = forge(single());
  for bad in [0, 3, 24, 8192] {
    assert!(
      matches!(
        forge.allocate_aligned(bad, 64),
        Err(ForgeError::InvalidArgument(_))
      ),
      "alignment {bad}"
    );
  }
  assert_eq!(forge.stats().allocation_count(), 0);
}

#[test]
fn test_aligned_allocations() {
  let forge = forge(single());
  let mut ptrs = Vec::new();
  for align in [1, 8, 16, 64, 256, 1024, 4096] {
    for size in [1, 100, 5000, 200_000] {
      let ptr = forge.allocate_aligned(align, size).unwrap();
      assert_eq!(addr(ptr) % align, 0, "align {align} size {size}");
      unsafe { ptr.as_ptr().write_bytes(0x11, size) };
      ptrs.push(ptr);
    }
  }
  forge.verify().unwrap();

  for ptr in ptrs {
    forge.release(ptr.as_ptr()).unwrap();
  }
  assert_eq!(forge.stats().current_usage(), 0);
  forge.verify().unwrap();
}

#[test]
fn test_degraded_start_skips_failed_arenas() {
  // arenas 0 and 1 map fine, 2 and 3 fail, everything after works
  static PARTIAL: Flaky = Flaky::new(2, 4);
  let forge = Forge::with_system(Config::DEFAULT.with_arena_count(4), &PARTIAL);
  forge.initialize(None).unwrap();

  assert_eq!(forge.state(), Lifecycle::Ready);
  assert_eq!(forge.arena_count(), 2);
  assert_eq!(forge.stats().arena_count(), 2);
  assert_eq!(forge.config().arena_count(), 4);
  for token in 0..16 {
    assert!(forge.resolve_arena(token) < 2);
  }

  let ptr = forge.allocate(100).unwrap();
  forge.release(ptr.as_ptr()).unwrap();

  forge.reset().unwrap();
  assert_eq!(forge.arena_count(), 4);
}

#[test]
fn test_trim_returns_free_segments() {
  let forge = forge(single().with_segment_size(64 * 1024));
  let ptrs: Vec<_> = (0..6).map(|_| forge.allocate(60 * 1024).unwrap()).collect();
  assert_eq!(forge.stats().segment_count(), 6);
  let arenas_only = forge.stats().total_mapped() - 6 * 64 * 1024;

  for ptr in ptrs {
    forge.release(ptr.as_ptr()).unwrap();
  }
  let trimmed = forge.trim(0);
  assert_eq!(trimmed.segments(), 6);
  assert_eq!(trimmed.released(), 6 * 64 * 1024);

  let stats = forge.stats();
  assert_eq!(stats.segment_count(), 0);
  assert_eq!(stats.total_mapped(), arenas_only);
  assert_eq!(forge.verify().unwrap().segments(), 0);

  let again = forge.allocate(64).unwrap();
  forge.release(again.as_ptr()).unwrap();
}

#[test]
fn test_verify_after_random_workload() {
  for strategy in [Strategy::FirstFit, Strategy::BestFit, Strategy::Hybrid] {
    let forge = forge(single().with_strategy(strategy));
    let mut rng = StdRng::seed_from_u64(7);
    let mut live = Vec::new();

    for step in 0..2000 {
      if live.is_empty() || rng.random_bool(0.6) {
        let size = rng.random_range(0..10_000);
        live.push(forge.allocate(size).unwrap());
      } else {
        let at = rng.random_range(0..live.len());
        let ptr: NonNull<u8> = live.swap_remove(at);
        forge.release(ptr.as_ptr()).unwrap();
      }
      if step % 250 == 0 {
        forge.verify().unwrap();
      }
    }

    let report = forge.verify().unwrap();
    assert_eq!(report.blocks(), report.free_blocks() + live.len());
    for ptr in live {
      forge.release(ptr.as_ptr()).unwrap();
    }
    let report = forge.verify().unwrap();
    assert_eq!(report.used_bytes(), 0);
    assert_eq!(report.free_blocks(), report.segments(), "{strategy:?}");
  }
}

#[test]
fn test_heap_limit_falls_back_to_direct() {
  let forge = forge(
    single()
      .with_segment_size(64 * 1024)
      .with_max_heap_size(64 * 1024),
  );
  let a = forge.allocate(40 * 1024).unwrap();
  assert_eq!(forge.stats().mmap_count(), 0);

  let b = forge.allocate(40 * 1024).unwrap();
  assert_eq!(forge.stats().mmap_count(), 1);
  assert_eq!(forge.stats().segment_count(), 1);

  forge.release(b.as_ptr()).unwrap();
  forge.release(a.as_ptr()).unwrap();
}

#[test]
fn test_allocate_zeroed() {
  let forge = forge(single());
  let dirty = forge.allocate(1000).unwrap();
  unsafe { dirty.as_ptr().write_bytes(0xFF, 1000) };
  let _fence = forge.allocate(16).unwrap();
  forge.release(dirty.as_ptr()).unwrap();

  let zeroed = forge.allocate_zeroed(10, 100).unwrap();
  assert_eq!(zeroed, dirty);
  let bytes = unsafe { core::slice::from_raw_parts(zeroed.as_ptr(), 1000) };
  assert!(bytes.iter().all(|&b| b == 0));

  let big = forge.allocate_zeroed(1024, 1024).unwrap();
  let bytes = unsafe { core::slice::from_raw_parts(big.as_ptr(), 1 << 20) };
  assert!(bytes.iter().all(|&b| b == 0));

  assert_eq!(forge.allocate_zeroed(usize::MAX, 2), Err(ForgeError::Overflow));
}

fn last_arena(_token: ThreadToken, live: usize) -> usize {
  live - 1
}

fn nowhere(_token: ThreadToken, _live: usize) -> usize {
  usize::MAX
}

#[test]
fn test_assignment_policies() {
  let rr = forge(Config::DEFAULT.with_arena_count(4));
  assert_eq!(rr.resolve_arena(0), 0);
  assert_eq!(rr.resolve_arena(5), 1);
  assert_eq!(rr.resolve_arena(7), 3);

  let single_arena = forge(Config::DEFAULT.with_assignment(Assignment::Single));
  assert_eq!(single_arena.resolve_arena(3), 0);

  let custom = forge(Config::DEFAULT.with_assignment(Assignment::Custom(last_arena)));
  assert_eq!(custom.resolve_arena(0), 3);

  let broken = forge(Config::DEFAULT.with_assignment(Assignment::Custom(nowhere)));
  assert_eq!(broken.resolve_arena(2), 0);

  let unthreaded = forge(Config::DEFAULT.with_thread_safe(false).with_arena_count(8));
  assert_eq!(unthreaded.arena_count(), 1);
  assert_eq!(unthreaded.resolve_arena(5), 0);
}

#[test]
fn test_contention_aware_moves_to_idle_arenas() {
  let forge = forge(Config::DEFAULT.with_assignment(Assignment::ContentionAware));
  let Some(first) = forge.arena(0) else {
    panic!("no main arena");
  };

  let guard = first.lock();
  assert_eq!(forge.resolve_arena(0), 1);
  assert_eq!(forge.resolve_arena(4), 1);
  drop(guard);

  assert_eq!(forge.resolve_arena(0), 0);
  assert_eq!(forge.arena_contention(0), 2);
  assert_eq!(forge.stats().contention_count(), 2);
}

#[test]
fn test_lifecycle_transitions() {
  let forge = Forge::new(single());
  assert_eq!(forge.state(), Lifecycle::Uninitialized);

  let ptr = forge.allocate(10).unwrap();
  assert_eq!(forge.state(), Lifecycle::Ready);
  forge.release(ptr.as_ptr()).unwrap();

  forge
    .initialize(Some(Config::DEFAULT.with_arena_count(3)))
    .unwrap();
  assert_eq!(forge.arena_count(), 1);

  forge.shutdown();
  assert_eq!(forge.state(), Lifecycle::Uninitialized);
  assert_eq!(forge.arena_count(), 0);
  assert_eq!(forge.stats().total_mapped(), 0);
  assert_eq!(forge.stats().arena_count(), 0);

  forge
    .initialize(Some(Config::DEFAULT.with_arena_count(3)))
    .unwrap();
  assert_eq!(forge.arena_count(), 3);
  assert_eq!(forge.config().arena_count(), 3);

  let _ = forge.allocate(64).unwrap();
  forge.reset().unwrap();
  assert_eq!(forge.state(), Lifecycle::Ready);
  assert_eq!(forge.arena_count(), 3);
  assert_eq!(forge.stats().allocation_count(), 0);
}

#[test]
fn test_invalid_config_is_rejected() {
  let forge = Forge::new(single());
  assert!(matches!(
    forge.initialize(Some(Config::DEFAULT.with_alignment(24))),
    Err(ForgeError::InvalidArgument(_))
  ));
  assert_eq!(forge.state(), Lifecycle::Uninitialized);
}

#[test]
fn test_concurrent_initialization_builds_once() {
  let forge = Forge::new(Config::DEFAULT.with_arena_count(4));

  thread::scope(|scope| {
    for _ in 0..8 {
      scope.spawn(|| {
        let ptr = forge.allocate(32).unwrap();
        forge.release(ptr.as_ptr()).unwrap();
      });
    }
  });

  assert_eq!(forge.arena_count(), 4);
  assert_eq!(forge.stats().arena_count(), 4);
}

#[test]
fn test_wider_alignment_unit() {
  let forge = forge(single().with_alignment(64));
  let ptrs: Vec<_> = [0, 1, 65, 1000]
    .iter()
    .map(|&size| forge.allocate(size).unwrap())
    .collect();
  for &ptr in &ptrs {
    assert_eq!(addr(ptr) % 64, 0);
    assert_eq!(forge.usable_size(ptr.as_ptr()).unwrap() % 64, 0);
  }
  for ptr in ptrs {
    forge.release(ptr.as_ptr()).unwrap();
  }
  forge.verify().unwrap();
}
