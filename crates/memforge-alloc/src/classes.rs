use crate::config::NSCLASSES;

/// Index of a free-list bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ClassIndex(pub usize);

impl ClassIndex {
  pub const LAST: ClassIndex = ClassIndex(NSCLASSES - 1);

  pub const fn get(self) -> usize {
    self.0
  }

  pub const fn is_last(self) -> bool {
    self.0 == NSCLASSES - 1
  }
}

/// Bucket boundaries: `NSCLASSES` powers of two starting at the minimum
/// block size.
///
/// A request is classified to the smallest boundary that holds it. A free
/// block is filed under the largest boundary it reaches, so every block in
/// bucket `i` satisfies every request classified to `i`. The last bucket is
/// unbounded above.
#[derive(Debug, Clone, Copy)]
pub struct SizeClasses {
  shift: u32,
  bounds: [usize; NSCLASSES],
}

const fn log2c(x: usize) -> u32 {
  if x <= 1 {
    return 0;
  }
  usize::BITS - (x - 1).leading_zeros()
}

const fn log2f(x: usize) -> u32 {
  usize::BITS - 1 - x.leading_zeros()
}

impl SizeClasses {
  /// `min` must be a power of two.
  pub const fn new(min: usize) -> Self {
    let shift = log2f(min);
    let mut bounds = [0; NSCLASSES];
    let mut i = 0;
    while i < NSCLASSES {
      bounds[i] = min << i;
      i += 1;
    }
    Self { shift, bounds }
  }

  pub const fn boundary(&self, class: ClassIndex) -> usize {
    self.bounds[class.0]
  }

  pub const fn smallest(&self) -> usize {
    self.bounds[0]
  }

  pub const fn largest(&self) -> usize {
    self.bounds[NSCLASSES - 1]
  }

  /// Bucket searched first for a request of `size` aligned bytes.
  pub const fn classify(&self, size: usize) -> ClassIndex {
    if size <= self.smallest() {
      return ClassIndex(0);
    }
    if size > self.largest() {
      return ClassIndex::LAST;
    }
    ClassIndex((log2c(size) - self.shift) as usize)
  }

  /// Bucket a free block of `size` bytes is filed under.
  pub const fn bucket_of(&self, size: usize) -> ClassIndex {
    if size <= self.smallest() {
      return ClassIndex(0);
    }
    if size >= self.largest() {
      return ClassIndex::LAST;
    }
    ClassIndex((log2f(size) - self.shift) as usize)
  }

  pub fn iter(&self) -> impl Iterator<Item = (ClassIndex, usize)> + '_ {
    self
      .bounds
      .iter()
      .enumerate()
      .map(|(i, &bound)| (ClassIndex(i), bound))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  const CLASSES: SizeClasses = SizeClasses::new(16);

  #[test]
  fn test_boundaries_are_monotonic_powers_of_two() {
    let mut last = 0;
    for (_, bound) in CLASSES.iter() {
      assert!(bound > last);
      assert!(bound.is_power_of_two());
      assert_eq!(bound % 16, 0);
      last = bound;
    }
    assert_eq!(CLASSES.smallest(), 16);
    assert_eq!(CLASSES.largest(), 16 << 15);
  }

  #[test]
  fn test_classify_is_smallest_boundary_holding_size() {
    assert_eq!(CLASSES.classify(0), ClassIndex(0));
    assert_eq!(CLASSES.classify(16), ClassIndex(0));
    assert_eq!(CLASSES.classify(32), ClassIndex(1));
    assert_eq!(CLASSES.classify(48), ClassIndex(2));
    assert_eq!(CLASSES.classify(64), ClassIndex(2));
    assert_eq!(CLASSES.classify(131_072), ClassIndex(13));
    assert_eq!(CLASSES.classify(CLASSES.largest()), ClassIndex::LAST);
    assert_eq!(CLASSES.classify(CLASSES.largest() + 16), ClassIndex::LAST);

    for size in (16..=CLASSES.largest()).step_by(16) {
      let class = CLASSES.classify(size);
      assert!(CLASSES.boundary(class) >= size);
      if class.0 > 0 {
        assert!(CLASSES.boundary(ClassIndex(class.0 - 1)) < size);
      }
    }
  }

  #[test]
  fn test_bucket_of_is_largest_boundary_reached() {
    assert_eq!(CLASSES.bucket_of(16), ClassIndex(0));
    assert_eq!(CLASSES.bucket_of(48), ClassIndex(1));
    assert_eq!(CLASSES.bucket_of(64), ClassIndex(2));
    assert_eq!(CLASSES.bucket_of(127 * 16), ClassIndex(6));
    assert_eq!(CLASSES.bucket_of(usize::MAX / 2), ClassIndex::LAST);

    for size in (16..CLASSES.largest()).step_by(48) {
      let bucket = CLASSES.bucket_of(size);
      assert!(CLASSES.boundary(bucket) <= size);
    }
  }

  #[test]
  fn test_bucket_blocks_satisfy_classified_requests() {
    for request in (16..=CLASSES.largest()).step_by(16 * 7) {
      let class = CLASSES.classify(request);
      let smallest_filed = CLASSES.boundary(class);
      assert_eq!(CLASSES.bucket_of(smallest_filed), class);
      assert!(smallest_filed >= request);
    }
  }

  #[test]
  fn test_wider_minimum() {
    let classes = SizeClasses::new(64);
    assert_eq!(classes.smallest(), 64);
    assert_eq!(classes.classify(65), ClassIndex(1));
    assert_eq!(classes.bucket_of(127), ClassIndex(0));
  }
}
