//! Block headers and the in-place block state machine.
//!
//! Every payload is preceded by a [`Block`] header. Heap blocks tile their
//! segment without gaps: the block after `b` starts at `b + header + size`,
//! and `prev_span` leads back to the block before it. Neighbours are only
//! ever looked up inside the owning segment.

use core::{
  mem::size_of,
  ptr::NonNull,
};

use memforge_list::{
  HasLink,
  Link,
};
use memforge_sys::math::align_up;

use crate::{
  config::{
    MAGIC,
    MIN_ALLOC,
  },
  error::{
    Corruption,
    ForgeError,
    ForgeResult,
  },
  freelist::FreeLists,
  segment::Segment,
};

pub const FREE: u32 = 1 << 0;
pub const MAPPED: u32 = 1 << 1;
const KNOWN_FLAGS: u32 = FREE | MAPPED;

/// Sizes derived from the configured alignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
  /// Payload alignment and size granularity.
  pub alignment: usize,
  /// Bytes reserved for a block header.
  pub header: usize,
  /// Bytes reserved for a segment header.
  pub seg_header: usize,
  /// Smallest payload a block may have.
  pub min_block: usize,
}

const fn round(value: usize, align: usize) -> usize {
  match align_up(value, align) {
    Some(v) => v,
    None => panic!("header size overflow"),
  }
}

impl Geometry {
  /// `alignment` must be a power of two of at least 16.
  pub const fn new(alignment: usize) -> Self {
    Self {
      alignment,
      header: round(size_of::<Block>(), alignment),
      seg_header: round(size_of::<Segment>(), alignment),
      min_block: if alignment > MIN_ALLOC { alignment } else { MIN_ALLOC },
    }
  }

  /// Aligned payload size for a request of `size` bytes. Zero-byte requests
  /// still get a minimum block.
  pub fn request(&self, size: usize) -> ForgeResult<usize> {
    if size > isize::MAX as usize {
      return Err(ForgeError::OutOfMemory);
    }
    let aligned = align_up(size, self.alignment).ok_or(ForgeError::OutOfMemory)?;
    Ok(aligned.max(self.min_block))
  }

  /// Header plus payload.
  pub const fn span(&self, size: usize) -> usize {
    self.header + size
  }

  /// Smallest remainder worth carving into its own block.
  pub const fn min_split(&self) -> usize {
    self.header + self.min_block
  }
}

#[repr(C)]
pub struct Block {
  magic: u32,
  flags: u32,
  /// Payload bytes, header excluded.
  size: usize,
  /// Heap: bytes back to the previous block's header, `0` for the first
  /// block. Mapped: offset of this header from the mapping base.
  prev_span: usize,
  /// Owning segment. Null for direct mappings.
  segment: *mut Segment,
  link: Link<Block>,
}

impl HasLink for Block {
  fn link(&self) -> &Link<Self> {
    &self.link
  }

  fn link_mut(&mut self) -> &mut Link<Self> {
    &mut self.link
  }
}

impl Block {
  /// Writes a fresh header at `at`.
  ///
  /// # Safety
  ///
  /// `at` must be aligned and have room for the header and `size` payload
  /// bytes.
  pub unsafe fn init(
    at: NonNull<u8>,
    size: usize,
    prev_span: usize,
    segment: *mut Segment,
    flags: u32,
  ) -> NonNull<Block> {
    let block = at.cast::<Block>();
    unsafe {
      block.write(Block {
        magic: MAGIC,
        flags,
        size,
        prev_span,
        segment,
        link: Link::new(),
      })
    };
    block
  }

  pub fn size(&self) -> usize {
    self.size
  }

  pub fn prev_span(&self) -> usize {
    self.prev_span
  }

  pub fn segment(&self) -> *mut Segment {
    self.segment
  }

  pub fn is_free(&self) -> bool {
    self.flags & FREE != 0
  }

  pub fn is_mapped(&self) -> bool {
    self.flags & MAPPED != 0
  }

  pub fn has_magic(&self) -> bool {
    self.magic == MAGIC
  }

  pub fn mark_free(&mut self) {
    self.flags |= FREE;
  }

  pub fn mark_used(&mut self) {
    self.flags &= !FREE;
  }

  pub(crate) fn set_size(&mut self, size: usize) {
    self.size = size;
  }

  /// Header of the payload at `ptr`.
  ///
  /// # Safety
  ///
  /// `ptr` must be at least `geo.header` bytes past a mapped address.
  pub unsafe fn from_payload(ptr: NonNull<u8>, geo: &Geometry) -> NonNull<Block> {
    unsafe { ptr.sub(geo.header) }.cast()
  }

  pub fn payload(this: NonNull<Block>, geo: &Geometry) -> NonNull<u8> {
    unsafe { this.cast::<u8>().add(geo.header) }
  }

  fn end_addr(this: NonNull<Block>, geo: &Geometry) -> usize {
    let size = unsafe { this.as_ref() }.size;
    this.as_ptr() as usize + geo.span(size)
  }

  /// Physically following block, if it is still inside the segment.
  ///
  /// # Safety
  ///
  /// `this` must be a valid heap block.
  pub unsafe fn next_in_segment(this: NonNull<Block>, geo: &Geometry) -> Option<NonNull<Block>> {
    let block = unsafe { this.as_ref() };
    let segment = unsafe { &*block.segment };
    let next = Self::end_addr(this, geo);
    if next + geo.header > segment.end() {
      return None;
    }
    NonNull::new(next as *mut Block)
  }

  /// Physically preceding block, if any.
  ///
  /// # Safety
  ///
  /// `this` must be a valid heap block.
  pub unsafe fn prev_in_segment(this: NonNull<Block>) -> Option<NonNull<Block>> {
    let block = unsafe { this.as_ref() };
    if block.prev_span == 0 {
      return None;
    }
    let segment = unsafe { &*block.segment };
    let prev = (this.as_ptr() as usize).checked_sub(block.prev_span)?;
    if prev < segment.start() {
      return None;
    }
    NonNull::new(prev as *mut Block)
  }

  /// Repoints the follower of `this` back at it after `this` changed size.
  ///
  /// # Safety
  ///
  /// `this` must be a valid heap block.
  pub unsafe fn relink_follower(this: NonNull<Block>, geo: &Geometry) {
    let span = geo.span(unsafe { this.as_ref() }.size);
    if let Some(mut next) = unsafe { Self::next_in_segment(this, geo) } {
      unsafe { next.as_mut() }.prev_span = span;
    }
  }

  /// Cuts `this` down to `size` payload bytes and turns the tail into a new
  /// block, returned marked free but not on any list. Nothing happens when
  /// the tail would be too small to hold a block of its own.
  ///
  /// # Safety
  ///
  /// `this` must be a heap block that is not on a free list, and `size`
  /// must be aligned.
  pub unsafe fn split(mut this: NonNull<Block>, size: usize, geo: &Geometry) -> Option<NonNull<Block>> {
    let block = unsafe { this.as_mut() };
    let spare = block.size.checked_sub(size)?;
    if spare < geo.min_split() {
      return None;
    }

    let at = unsafe { Self::payload(this, geo).add(size) };
    let rest = unsafe {
      Self::init(
        at,
        spare - geo.header,
        geo.span(size),
        block.segment,
        FREE,
      )
    };
    block.size = size;
    unsafe { Self::relink_follower(rest, geo) };
    Some(rest)
  }

  /// Folds a free neighbour that follows `this` into it. The neighbour must
  /// already be off its free list. Its header keeps the free tag, so a
  /// stale release of it still reads as a double free.
  ///
  /// # Safety
  ///
  /// Both blocks must be valid, adjacent, and in the same segment.
  pub unsafe fn absorb(mut this: NonNull<Block>, next: NonNull<Block>, geo: &Geometry) {
    let extra = geo.span(unsafe { next.as_ref() }.size);
    unsafe { this.as_mut() }.size += extra;
    unsafe { Self::relink_follower(this, geo) };
  }

  /// Merges `this` with whichever physical neighbours are free. The
  /// neighbours are pulled off their lists first. Returns the merged block,
  /// which is not on any list.
  ///
  /// # Safety
  ///
  /// `this` must be a heap block marked free and not on any list.
  pub unsafe fn coalesce(this: NonNull<Block>, lists: &mut FreeLists, geo: &Geometry) -> NonNull<Block> {
    let mut merged = this;

    if let Some(next) = unsafe { Self::next_in_segment(merged, geo) } {
      if unsafe { next.as_ref() }.is_free() {
        unsafe {
          lists.remove(next);
          Self::absorb(merged, next, geo);
        }
      }
    }

    if let Some(prev) = unsafe { Self::prev_in_segment(merged) } {
      if unsafe { prev.as_ref() }.is_free() {
        unsafe {
          lists.remove(prev);
          Self::absorb(prev, merged, geo);
        }
        merged = prev;
      }
    }

    merged
  }

  /// Checks the header in front of a user pointer.
  ///
  /// # Safety
  ///
  /// The `geo.header` bytes before `ptr` must be readable.
  pub unsafe fn validate(ptr: NonNull<u8>, geo: &Geometry) -> ForgeResult<NonNull<Block>> {
    if ptr.as_ptr() as usize % geo.alignment != 0 {
      return Err(Corruption::Misaligned.into());
    }

    let this = unsafe { Self::from_payload(ptr, geo) };
    let block = unsafe { this.as_ref() };
    if block.magic != MAGIC || block.flags & !KNOWN_FLAGS != 0 {
      return Err(Corruption::BadMagic.into());
    }
    if block.is_free() {
      return Err(Corruption::DoubleFree.into());
    }
    if block.size < geo.min_block || block.size % geo.alignment != 0 {
      return Err(Corruption::BadSize.into());
    }

    if block.is_mapped() {
      if !block.segment.is_null() {
        return Err(Corruption::BadMagic.into());
      }
      return Ok(this);
    }

    let Some(segment) = (unsafe { block.segment.as_ref() }) else {
      return Err(Corruption::OutOfSegment.into());
    };
    if !segment.has_magic() {
      return Err(Corruption::OutOfSegment.into());
    }
    let start = this.as_ptr() as usize;
    let end = start
      .checked_add(geo.span(block.size))
      .ok_or(Corruption::BadSize)?;
    if start < segment.start() || end > segment.end() {
      return Err(Corruption::OutOfSegment.into());
    }
    Ok(this)
  }
}
