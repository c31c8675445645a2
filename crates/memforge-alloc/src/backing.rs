use core::ptr::NonNull;

use memforge_extent::Extent;
use memforge_list::Chain;
use memforge_sys::{
  math::align_up,
  prim::page_align_to,
  system::System,
};

use crate::{
  block::{
    Block,
    Geometry,
    MAPPED,
  },
  error::{
    ForgeError,
    ForgeResult,
  },
};

/// Where a request is served from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
  /// Carved out of the arena's heap segments.
  Heap,
  /// Given its own OS mapping.
  Direct,
}

impl Route {
  /// `size` is the request as the caller made it, before alignment.
  pub const fn for_request(size: usize, threshold: usize) -> Route {
    if size < threshold { Route::Heap } else { Route::Direct }
  }
}

/// Turns OS mappings into heap segments and direct allocations.
#[derive(Clone, Copy)]
pub struct Backing {
  system: &'static dyn System,
  /// Rounding unit for segment sizes.
  page: usize,
}

impl Backing {
  /// The rounding unit never drops below what the system can map.
  pub fn new(system: &'static dyn System, page_size: usize) -> Self {
    Self {
      system,
      page: page_size.max(system.granularity()),
    }
  }

  pub(crate) const fn from_parts(system: &'static dyn System, page: usize) -> Self {
    Self { system, page }
  }

  pub fn system(&self) -> &'static dyn System {
    self.system
  }

  pub fn page(&self) -> usize {
    self.page
  }

  /// Length of a segment able to hold one block of `want` payload bytes.
  pub fn segment_len(&self, want: usize, segment_size: usize, geo: &Geometry) -> ForgeResult<usize> {
    let needed = want
      .checked_add(geo.header + geo.seg_header)
      .ok_or(ForgeError::OutOfMemory)?;
    Ok(page_align_to(needed.max(segment_size), self.page)?)
  }

  /// Maps a fresh segment of exactly `len` bytes.
  pub fn grow(&self, len: usize) -> ForgeResult<Extent> {
    Ok(Extent::new(self.system, len)?)
  }

  /// Maps a standalone block of at least `want` payload bytes whose payload
  /// is aligned to `align`. The recorded size runs to the end of the
  /// mapping. Returns the block and the mapped length.
  pub fn map_direct(&self, want: usize, align: usize, geo: &Geometry) -> ForgeResult<(NonNull<Block>, usize)> {
    let align = align.max(geo.alignment);
    let granularity = self.system.granularity();
    let lead = align_up(geo.header, align).ok_or(ForgeError::OutOfMemory)?;
    let slack = if align > granularity { align } else { 0 };
    let needed = want
      .checked_add(lead + slack)
      .ok_or(ForgeError::OutOfMemory)?;

    let extent = Extent::new(self.system, needed)?;
    let (base, len) = extent.into_raw();
    let base_addr = base.as_ptr() as usize;

    let payload = align_up(base_addr + geo.header, align).ok_or(ForgeError::OutOfMemory)?;
    let offset = payload - geo.header - base_addr;
    let size = len - offset - geo.header;

    let at = unsafe { base.add(offset) };
    let block = unsafe { Block::init(at, size, offset, core::ptr::null_mut(), MAPPED) };
    Ok((block, len))
  }

  /// Unmaps a block made by [`Backing::map_direct`]. Returns the mapped
  /// length given back.
  ///
  /// # Safety
  ///
  /// `block` must be a live direct block of this backing.
  pub unsafe fn unmap_direct(&self, block: NonNull<Block>, geo: &Geometry) -> usize {
    let header = unsafe { block.as_ref() };
    let offset = header.prev_span();
    let len = offset + geo.span(header.size());
    let base = unsafe { block.cast::<u8>().sub(offset) };
    drop(unsafe { Extent::from_raw(self.system, base, len) });
    len
  }
}

/// Direct blocks that are still mapped, linked through their own headers.
/// A pointer whose header is not on this chain is not a live direct block.
pub struct DirectMaps {
  chain: Chain<Block>,
}

// Only reached through the owning context's lock.
unsafe impl Send for DirectMaps {}

impl DirectMaps {
  pub const fn new() -> Self {
    Self { chain: Chain::new() }
  }

  pub fn len(&self) -> usize {
    self.chain.len()
  }

  pub fn is_empty(&self) -> bool {
    self.chain.is_empty()
  }

  /// Compares addresses only. Headers of unregistered blocks are never
  /// read.
  pub fn contains(&self, block: NonNull<Block>) -> bool {
    self.chain.iter().any(|live| live == block)
  }

  /// # Safety
  ///
  /// `block` must be a fresh block from [`Backing::map_direct`].
  pub unsafe fn insert(&mut self, block: NonNull<Block>) {
    unsafe { self.chain.push_front(block) };
  }

  /// Unregisters `block`. False when it was not registered, which means it
  /// was already released.
  pub fn remove(&mut self, block: NonNull<Block>) -> bool {
    if !self.contains(block) {
      return false;
    }
    unsafe { self.chain.remove(block) };
    true
  }
}

impl Default for DirectMaps {
  fn default() -> Self {
    Self::new()
  }
}
