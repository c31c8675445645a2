//! Arenas: independently locked heaps.
//!
//! An arena lives at the start of its own OS mapping. All of its free lists
//! and its segment chain sit behind one spin lock. The lock is never held
//! while a new segment is mapped or while a detached segment is unmapped.

use core::{
  mem::{
    ManuallyDrop,
    size_of,
  },
  ptr::NonNull,
  sync::atomic::{
    AtomicUsize,
    Ordering,
  },
};

use memforge_extent::Extent;
use memforge_list::{
  Chain,
  HasLink,
};
use memforge_sys::math::align_up;
use spin::{
  Mutex,
  MutexGuard,
};

use crate::{
  backing::Backing,
  block::{
    Block,
    Geometry,
  },
  classes::SizeClasses,
  config::Strategy,
  error::{
    Corruption,
    ForgeError,
    ForgeResult,
  },
  freelist::FreeLists,
  segment::{
    Segment,
    Segments,
  },
  stats::{
    HeapReport,
    Trimmed,
  },
};

/// Knobs an arena needs on its allocation path.
#[derive(Debug, Clone, Copy)]
pub struct Policy {
  pub geo: Geometry,
  pub strategy: Strategy,
  pub segment_size: usize,
  pub max_heap_size: usize,
}

/// How a heap request was satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
  /// Carved from a block already on the free lists.
  Reused(NonNull<Block>),
  /// Carved from a segment mapped for this request.
  Grown { block: NonNull<Block>, mapped: usize },
  /// Growing would push the arena past its heap limit.
  HeapFull,
}

pub struct ArenaState {
  lists: FreeLists,
  segments: Segments,
}

// Raw block and segment pointers are only touched under the arena lock.
unsafe impl Send for ArenaState {}

impl ArenaState {
  const fn new(classes: SizeClasses) -> Self {
    Self {
      lists: FreeLists::new(classes),
      segments: Segments::new(),
    }
  }

  pub fn lists(&self) -> &FreeLists {
    &self.lists
  }

  pub fn segments(&self) -> &Segments {
    &self.segments
  }

  /// Takes a block for `want` payload bytes at `align`, cuts it to size and
  /// returns the leftovers to the lists.
  fn carve(&mut self, want: usize, align: usize, policy: &Policy) -> Option<NonNull<Block>> {
    let geo = &policy.geo;
    let search = search_size(want, align, geo)?;
    let block = self.lists.take(search, policy.strategy)?;
    let block = unsafe { self.realign(block, align, geo) };

    if let Some(rest) = unsafe { Block::split(block, want, geo) } {
      unsafe { self.lists.insert(rest) };
    }
    Some(block)
  }

  /// Moves the start of `block` forward until its payload is aligned to
  /// `align`. The skipped front becomes a free block of its own.
  unsafe fn realign(&mut self, block: NonNull<Block>, align: usize, geo: &Geometry) -> NonNull<Block> {
    let payload = Block::payload(block, geo).as_ptr() as usize;
    if payload % align == 0 {
      return block;
    }

    // search_size reserved room for a whole leading block plus the shift
    let target = match align_up(payload + geo.min_split(), align) {
      Some(target) => target,
      None => return block,
    };
    let shift = target - payload;
    let (size, segment) = {
      let header = unsafe { block.as_ref() };
      (header.size(), header.segment())
    };

    let at = unsafe { NonNull::new_unchecked((target - geo.header) as *mut u8) };
    let moved = unsafe { Block::init(at, size - shift, shift, segment, 0) };
    unsafe {
      Block::relink_follower(moved, geo);
      (*block.as_ptr()).set_size(shift - geo.header);
      self.lists.insert(block);
    }
    moved
  }
}

/// Bytes to search the free lists for. Over-aligned requests reserve room
/// to move the payload forward by up to `align` while leaving a valid free
/// block in front.
fn search_size(want: usize, align: usize, geo: &Geometry) -> Option<usize> {
  if align <= geo.alignment {
    return Some(want);
  }
  want.checked_add(align)?.checked_add(geo.min_split())
}

#[repr(C)]
pub struct Arena {
  index: usize,
  state: Mutex<ArenaState>,
  contention: AtomicUsize,
  extent: ManuallyDrop<Extent>,
}

impl Arena {
  /// Maps a fresh arena with empty free lists and no segments.
  pub fn create(index: usize, backing: &Backing, classes: SizeClasses) -> ForgeResult<NonNull<Arena>> {
    let extent = Extent::new(backing.system(), size_of::<Arena>())?;
    let this = extent.base().cast::<Arena>();
    unsafe {
      this.write(Arena {
        index,
        state: Mutex::new(ArenaState::new(classes)),
        contention: AtomicUsize::new(0),
        extent: ManuallyDrop::new(extent),
      })
    };
    Ok(this)
  }

  /// Unmaps every segment, then the arena itself. Returns the number of
  /// segments and the bytes they covered.
  ///
  /// # Safety
  ///
  /// No other thread may use the arena, and no pointer into its heap may be
  /// used afterwards.
  pub unsafe fn destroy(this: NonNull<Arena>) -> (usize, usize) {
    let arena = unsafe { &mut *this.as_ptr() };
    let mut chain = {
      let state = arena.state.get_mut();
      state.lists.clear();
      state.segments.take_all()
    };

    let mut segments = 0;
    let mut bytes = 0;
    while let Some(segment) = unsafe { chain.pop_front() } {
      segments += 1;
      bytes += unsafe { segment.as_ref() }.mapped();
      unsafe { Segment::release(segment) };
    }

    let extent = unsafe { ManuallyDrop::take(&mut arena.extent) };
    drop(extent);
    (segments, bytes)
  }

  pub fn index(&self) -> usize {
    self.index
  }

  /// Bytes of the arena's own mapping.
  pub fn header_bytes(&self) -> usize {
    self.extent.len()
  }

  pub fn is_locked(&self) -> bool {
    self.state.is_locked()
  }

  pub fn contention(&self) -> usize {
    self.contention.load(Ordering::Relaxed)
  }

  pub fn note_contention(&self) {
    self.contention.fetch_add(1, Ordering::Relaxed);
  }

  pub fn lock(&self) -> MutexGuard<'_, ArenaState> {
    self.state.lock()
  }

  /// Serves `want` aligned payload bytes at `align` from this arena's heap,
  /// growing it by one segment on a miss.
  pub fn allocate(&self, want: usize, align: usize, backing: &Backing, policy: &Policy) -> ForgeResult<Placement> {
    let geo = &policy.geo;
    let footprint = {
      let mut state = self.state.lock();
      if let Some(block) = state.carve(want, align, policy) {
        return Ok(Placement::Reused(block));
      }
      state.segments.mapped()
    };

    let search = search_size(want, align, geo).ok_or(ForgeError::OutOfMemory)?;
    let len = backing.segment_len(search, policy.segment_size, geo)?;
    if footprint.saturating_add(len) > policy.max_heap_size {
      return Ok(Placement::HeapFull);
    }
    let extent = backing.grow(len)?;

    let mut state = self.state.lock();
    let segment = unsafe { Segment::create(extent, self, geo) };
    unsafe {
      state.segments.push(segment);
      state.lists.insert(segment.as_ref().first_block());
    }
    // the fresh block always fits, whatever else was freed meanwhile
    let block = state.carve(want, align, policy).ok_or(ForgeError::OutOfMemory)?;
    Ok(Placement::Grown { block, mapped: len })
  }

  /// Returns a validated heap block to the free lists, merging it with free
  /// neighbours.
  ///
  /// # Safety
  ///
  /// `block` must be a heap block of this arena that passed validation.
  pub unsafe fn release(&self, mut block: NonNull<Block>, geo: &Geometry) -> ForgeResult<()> {
    let mut state = self.state.lock();
    // another thread may have released it since validation
    if unsafe { block.as_ref() }.is_free() {
      return Err(Corruption::DoubleFree.into());
    }

    unsafe {
      block.as_mut().mark_free();
      let merged = Block::coalesce(block, &mut state.lists, geo);
      state.lists.insert(merged);
    }
    Ok(())
  }

  /// Cuts `block` down to `want` bytes where the tail is large enough to
  /// stand alone.
  ///
  /// # Safety
  ///
  /// `block` must be an in-use heap block of this arena.
  pub unsafe fn shrink(&self, block: NonNull<Block>, want: usize, geo: &Geometry) {
    let mut state = self.state.lock();
    if let Some(rest) = unsafe { Block::split(block, want, geo) } {
      unsafe {
        let merged = Block::coalesce(rest, &mut state.lists, geo);
        state.lists.insert(merged);
      }
    }
  }

  /// Extends `block` to at least `want` bytes by absorbing a free follower.
  /// Returns false and leaves everything as is when that is not possible.
  ///
  /// # Safety
  ///
  /// `block` must be an in-use heap block of this arena.
  pub unsafe fn grow_in_place(&self, block: NonNull<Block>, want: usize, geo: &Geometry) -> bool {
    let mut state = self.state.lock();
    let Some(next) = (unsafe { Block::next_in_segment(block, geo) }) else {
      return false;
    };

    let (next_free, next_size) = {
      let header = unsafe { next.as_ref() };
      (header.is_free(), header.size())
    };
    let have = unsafe { block.as_ref() }.size() + geo.span(next_size);
    if !next_free || have < want {
      return false;
    }

    unsafe {
      state.lists.remove(next);
      Block::absorb(block, next, geo);
      if let Some(rest) = Block::split(block, want, geo) {
        state.lists.insert(rest);
      }
    }
    true
  }

  /// Unmaps segments that are entirely free while keeping at least `pad`
  /// free bytes on the lists, then hands the pages under the remaining free
  /// payloads back to the OS. Page reclaim happens under the lock.
  pub fn trim(&self, pad: usize, geo: &Geometry) -> Trimmed {
    let mut detached: Chain<Segment> = Chain::new();
    let mut released = 0;
    let mut reclaimed = 0;

    {
      let mut guard = self.state.lock();
      let ArenaState { lists, segments } = &mut *guard;

      let mut cursor = segments.first();
      while let Some(segment) = cursor {
        let seg = unsafe { segment.as_ref() };
        cursor = *seg.link().next();
        if !seg.is_fully_free(geo) {
          continue;
        }

        let block = seg.first_block();
        let size = unsafe { block.as_ref() }.size();
        if lists.free_bytes() - size < pad {
          continue;
        }
        released += seg.mapped();
        unsafe {
          lists.remove(block);
          segments.detach(segment);
          detached.push_back(segment);
        }
      }

      for block in lists.iter() {
        let segment = unsafe { &*block.as_ref().segment() };
        reclaimed += unsafe { segment.reclaim(block, geo) }.unwrap_or(0);
      }
    }

    let count = detached.len();
    while let Some(segment) = unsafe { detached.pop_front() } {
      unsafe { Segment::release(segment) };
    }
    Trimmed::new(count, released, reclaimed)
  }

  /// Walks every segment and checks the block invariants against the free
  /// lists.
  pub fn verify(&self, geo: &Geometry) -> ForgeResult<HeapReport> {
    let state = self.state.lock();
    let mut report = HeapReport::default();

    for segment in state.segments.iter() {
      let seg = unsafe { segment.as_ref() };
      if !seg.has_magic() || !core::ptr::eq(seg.arena(), self) {
        return Err(Corruption::OutOfSegment.into());
      }
      report.add_segment();

      let mut expected_prev = 0;
      let mut prev_free = false;
      let mut end = seg.start();
      for block in seg.blocks(geo) {
        let header = unsafe { block.as_ref() };
        if !header.has_magic() || header.is_mapped() {
          return Err(Corruption::BadMagic.into());
        }
        if header.size() < geo.min_block || header.size() % geo.alignment != 0 {
          return Err(Corruption::BadSize.into());
        }
        if header.segment() != segment.as_ptr() || header.prev_span() != expected_prev {
          return Err(Corruption::OutOfSegment.into());
        }
        if prev_free && header.is_free() {
          return Err(Corruption::Unmerged.into());
        }

        report.add_block(header.size(), header.is_free());
        prev_free = header.is_free();
        expected_prev = geo.span(header.size());
        end = block.as_ptr() as usize + expected_prev;
      }

      if end != seg.end() {
        return Err(Corruption::OutOfSegment.into());
      }
    }

    let listed = state.lists.len();
    let all_free = state.lists.iter().all(|b| unsafe { b.as_ref() }.is_free());
    if listed != report.free_blocks() || !all_free || state.lists.free_bytes() != report.free_bytes() {
      return Err(Corruption::ListMismatch.into());
    }
    Ok(report)
  }
}

unsafe impl Send for Arena {}
unsafe impl Sync for Arena {}
