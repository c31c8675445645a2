//! Heap segments and the per-arena segment chain.
//!
//! A segment is one OS mapping. Its [`Segment`] header sits at the start of
//! the mapping and owns the [`Extent`] it lives in, so releasing a segment
//! drops the extent last.

use core::{
  mem::ManuallyDrop,
  ptr::NonNull,
};

use memforge_extent::Extent;
use memforge_list::{
  Chain,
  HasLink,
  Link,
};

use crate::{
  arena::Arena,
  block::{
    Block,
    FREE,
    Geometry,
  },
  error::ForgeResult,
};

const SEGMENT_MAGIC: u64 = 0x4D46_5345_474D_454E;

#[repr(C)]
pub struct Segment {
  magic: u64,
  link: Link<Segment>,
  arena: *const Arena,
  /// Address of the first block header.
  start: usize,
  /// One past the last usable byte.
  end: usize,
  extent: ManuallyDrop<Extent>,
}

impl HasLink for Segment {
  fn link(&self) -> &Link<Self> {
    &self.link
  }

  fn link_mut(&mut self) -> &mut Link<Self> {
    &mut self.link
  }
}

impl Segment {
  /// Writes the segment header into `extent` and seeds it with a single free
  /// block covering the rest of the mapping. The block is not put on any
  /// list.
  ///
  /// # Safety
  ///
  /// `extent` must be large enough for a segment header, a block header and
  /// a minimum block.
  pub unsafe fn create(extent: Extent, arena: *const Arena, geo: &Geometry) -> NonNull<Segment> {
    let base = extent.base();
    let start = base.as_ptr() as usize + geo.seg_header;
    let end = base.as_ptr() as usize + extent.len();
    let this = base.cast::<Segment>();

    unsafe {
      this.write(Segment {
        magic: SEGMENT_MAGIC,
        link: Link::new(),
        arena,
        start,
        end,
        extent: ManuallyDrop::new(extent),
      });

      let at = base.add(geo.seg_header);
      Block::init(at, end - start - geo.header, 0, this.as_ptr(), FREE);
    }

    this
  }

  /// Unmaps the segment. Every block inside it becomes invalid.
  ///
  /// # Safety
  ///
  /// `this` must be detached from its chain and none of its blocks may be
  /// on a free list.
  pub unsafe fn release(this: NonNull<Segment>) {
    let extent = unsafe { ManuallyDrop::take(&mut (*this.as_ptr()).extent) };
    drop(extent);
  }

  pub fn has_magic(&self) -> bool {
    self.magic == SEGMENT_MAGIC
  }

  pub fn arena(&self) -> *const Arena {
    self.arena
  }

  pub fn start(&self) -> usize {
    self.start
  }

  pub fn end(&self) -> usize {
    self.end
  }

  /// Bytes of the whole mapping, header included.
  pub fn mapped(&self) -> usize {
    self.extent.len()
  }

  pub fn first_block(&self) -> NonNull<Block> {
    unsafe { NonNull::new_unchecked(self.start as *mut Block) }
  }

  /// True when a single free block spans the segment.
  pub fn is_fully_free(&self, geo: &Geometry) -> bool {
    let first = unsafe { self.first_block().as_ref() };
    first.is_free() && self.start + geo.span(first.size()) == self.end
  }

  /// Hands the physical pages under a free block's payload back to the OS.
  /// Returns the number of bytes reclaimed.
  ///
  /// # Safety
  ///
  /// `block` must be a free block of this segment.
  pub unsafe fn reclaim(&self, block: NonNull<Block>, geo: &Geometry) -> ForgeResult<usize> {
    let base = self.extent.base().as_ptr() as usize;
    let payload = Block::payload(block, geo).as_ptr() as usize - base;
    let size = unsafe { block.as_ref() }.size();
    Ok(self.extent.reclaim(payload..payload + size)?)
  }

  /// Walks the blocks of this segment in address order.
  pub fn blocks<'seg>(&'seg self, geo: &'seg Geometry) -> SegmentBlocks<'seg> {
    SegmentBlocks {
      segment: self,
      geo,
      cursor: self.start,
    }
  }
}

pub struct SegmentBlocks<'seg> {
  segment: &'seg Segment,
  geo: &'seg Geometry,
  cursor: usize,
}

impl Iterator for SegmentBlocks<'_> {
  type Item = NonNull<Block>;

  fn next(&mut self) -> Option<Self::Item> {
    if self.cursor + self.geo.header > self.segment.end {
      return None;
    }
    let block = NonNull::new(self.cursor as *mut Block)?;
    let size = unsafe { block.as_ref() }.size();
    // a zero size would never advance the cursor
    if size == 0 {
      self.cursor = self.segment.end;
    } else {
      self.cursor = self.cursor.saturating_add(self.geo.span(size));
    }
    Some(block)
  }
}

/// The chain of segments owned by one arena.
pub struct Segments {
  chain: Chain<Segment>,
  mapped: usize,
}

impl Segments {
  pub const fn new() -> Self {
    Self {
      chain: Chain::new(),
      mapped: 0,
    }
  }

  pub fn len(&self) -> usize {
    self.chain.len()
  }

  pub fn is_empty(&self) -> bool {
    self.chain.is_empty()
  }

  /// Bytes mapped by all segments in the chain.
  pub fn mapped(&self) -> usize {
    self.mapped
  }

  /// # Safety
  ///
  /// `segment` must be live and on no chain.
  pub unsafe fn push(&mut self, segment: NonNull<Segment>) {
    self.mapped += unsafe { segment.as_ref() }.mapped();
    unsafe { self.chain.push_back(segment) };
  }

  /// Unlinks `segment` without unmapping it.
  ///
  /// # Safety
  ///
  /// `segment` must be on this chain.
  pub unsafe fn detach(&mut self, segment: NonNull<Segment>) {
    self.mapped -= unsafe { segment.as_ref() }.mapped();
    unsafe { self.chain.remove(segment) };
  }

  /// Unlinks and unmaps `segment`. Returns the bytes given back.
  ///
  /// # Safety
  ///
  /// `segment` must be on this chain and none of its blocks may be on a
  /// free list.
  pub unsafe fn release(&mut self, segment: NonNull<Segment>) -> usize {
    let len = unsafe { segment.as_ref() }.mapped();
    unsafe {
      self.detach(segment);
      Segment::release(segment);
    }
    len
  }

  /// Detaches every segment and returns them as a standalone chain.
  pub fn take_all(&mut self) -> Chain<Segment> {
    self.mapped = 0;
    core::mem::take(&mut self.chain)
  }

  pub fn first(&self) -> Option<NonNull<Segment>> {
    self.chain.head()
  }

  pub fn iter(&self) -> impl Iterator<Item = NonNull<Segment>> + '_ {
    self.chain.iter()
  }
}

impl Default for Segments {
  fn default() -> Self {
    Self::new()
  }
}
