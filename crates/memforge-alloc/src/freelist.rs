use core::ptr::NonNull;

use memforge_list::Chain;

use crate::{
  block::Block,
  classes::{
    ClassIndex,
    SizeClasses,
  },
  config::{
    NSCLASSES,
    Strategy,
  },
};

/// Segregated free lists of one arena. The lists only refer to blocks; the
/// storage belongs to the segments.
pub struct FreeLists {
  buckets: [Chain<Block>; NSCLASSES],
  classes: SizeClasses,
  free_bytes: usize,
}

impl FreeLists {
  pub const fn new(classes: SizeClasses) -> Self {
    Self {
      buckets: [const { Chain::new() }; NSCLASSES],
      classes,
      free_bytes: 0,
    }
  }

  pub fn classes(&self) -> &SizeClasses {
    &self.classes
  }

  /// Payload bytes currently sitting on the lists.
  pub fn free_bytes(&self) -> usize {
    self.free_bytes
  }

  pub fn len(&self) -> usize {
    self.buckets.iter().map(|b| b.len()).sum()
  }

  pub fn is_empty(&self) -> bool {
    self.buckets.iter().all(|b| b.is_empty())
  }

  pub fn bucket_len(&self, class: ClassIndex) -> usize {
    self.buckets[class.get()].len()
  }

  /// Files `block` under the bucket its size reaches and marks it free.
  ///
  /// # Safety
  ///
  /// `block` must be a valid heap block that is on no list.
  pub unsafe fn insert(&mut self, mut block: NonNull<Block>) {
    let header = unsafe { block.as_mut() };
    header.mark_free();
    let size = header.size();
    let class = self.classes.bucket_of(size);
    unsafe { self.buckets[class.get()].push_front(block) };
    self.free_bytes += size;
  }

  /// Unlinks `block`. Its free tag is left as is.
  ///
  /// # Safety
  ///
  /// `block` must be on one of these lists with the size it was filed at.
  pub unsafe fn remove(&mut self, block: NonNull<Block>) {
    let size = unsafe { block.as_ref() }.size();
    let class = self.classes.bucket_of(size);
    unsafe { self.buckets[class.get()].remove(block) };
    self.free_bytes -= size;
  }

  fn first_fit(&self, class: ClassIndex, size: usize) -> Option<NonNull<Block>> {
    self.buckets[class.get()]
      .iter()
      .find(|b| unsafe { b.as_ref() }.size() >= size)
  }

  fn best_fit(&self, class: ClassIndex, size: usize) -> Option<NonNull<Block>> {
    self.buckets[class.get()]
      .iter()
      .filter(|b| unsafe { b.as_ref() }.size() >= size)
      .min_by_key(|b| unsafe { b.as_ref() }.size())
  }

  /// Locates a free block of at least `size` bytes without unlinking it.
  ///
  /// The search starts at the bucket a block of exactly `size` bytes would
  /// be filed under and moves to larger buckets only when that one has
  /// nothing. Any block in a later bucket is large enough, so hybrid takes
  /// the head there instead of walking the list.
  pub fn find(&self, size: usize, strategy: Strategy) -> Option<NonNull<Block>> {
    let start = self.classes.bucket_of(size).get();

    match strategy {
      Strategy::FirstFit => (start..NSCLASSES).find_map(|i| self.first_fit(ClassIndex(i), size)),
      Strategy::BestFit => (start..NSCLASSES).find_map(|i| self.best_fit(ClassIndex(i), size)),
      Strategy::Hybrid => self.first_fit(ClassIndex(start), size).or_else(|| {
        (start + 1..NSCLASSES).find_map(|i| {
          let class = ClassIndex(i);
          if class.is_last() {
            self.first_fit(class, size)
          } else {
            self.buckets[i].head()
          }
        })
      }),
    }
  }

  /// [`FreeLists::find`], then unlink the block and mark it in use.
  pub fn take(&mut self, size: usize, strategy: Strategy) -> Option<NonNull<Block>> {
    let mut block = self.find(size, strategy)?;
    unsafe {
      self.remove(block);
      block.as_mut().mark_used();
    }
    Some(block)
  }

  pub fn iter(&self) -> impl Iterator<Item = NonNull<Block>> + '_ {
    self.buckets.iter().flat_map(|b| b.iter())
  }

  /// Drops every entry without touching the blocks.
  pub fn clear(&mut self) {
    self.buckets = [const { Chain::new() }; NSCLASSES];
    self.free_bytes = 0;
  }
}
