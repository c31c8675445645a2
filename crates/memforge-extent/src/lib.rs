#![cfg_attr(not(test), no_std)]

//! Owned OS mappings.

use core::{
  mem::ManuallyDrop,
  ops::Range,
  ptr::NonNull,
};

use memforge_sys::{
  math::{
    align_down,
    align_up,
  },
  prim::{
    PrimError,
    page_align_to,
  },
  system::{
    SysError,
    SysOption,
    System,
  },
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtentError {
  SystemError(SysError),
  PrimError(PrimError),
  OutOfBounds,
}

impl From<SysError> for ExtentError {
  fn from(err: SysError) -> Self {
    ExtentError::SystemError(err)
  }
}

impl From<PrimError> for ExtentError {
  fn from(err: PrimError) -> Self {
    ExtentError::PrimError(err)
  }
}

pub type ExtentResult<T> = Result<T, ExtentError>;

/// One contiguous mapping. Unmapped when dropped.
pub struct Extent {
  system: &'static dyn System,
  base: NonNull<u8>,
  len: usize,
}

impl Extent {
  /// Maps at least `size` bytes, rounded up to the system granularity.
  pub fn new(system: &'static dyn System, size: usize) -> ExtentResult<Extent> {
    let len = page_align_to(size.max(1), system.granularity())?;
    let slice = unsafe { system.map(len, SysOption::ReadWrite) }?;
    let base = NonNull::new(slice.as_mut_ptr()).ok_or(ExtentError::SystemError(SysError::OutOfMemory))?;

    Ok(Extent { system, base, len })
  }

  /// Rebuilds an extent from parts previously produced by [`Extent::into_raw`].
  ///
  /// # Safety
  ///
  /// `base` and `len` must describe a live mapping from `system` that no
  /// other `Extent` owns.
  pub unsafe fn from_raw(system: &'static dyn System, base: NonNull<u8>, len: usize) -> Extent {
    Extent { system, base, len }
  }

  /// Gives up ownership without unmapping.
  pub fn into_raw(self) -> (NonNull<u8>, usize) {
    let this = ManuallyDrop::new(self);
    (this.base, this.len)
  }

  pub fn base(&self) -> NonNull<u8> {
    self.base
  }

  pub fn len(&self) -> usize {
    self.len
  }

  pub fn is_empty(&self) -> bool {
    self.len == 0
  }

  pub fn system(&self) -> &'static dyn System {
    self.system
  }

  pub fn range(&self) -> Range<usize> {
    let start = self.base.as_ptr() as usize;
    start..start + self.len
  }

  pub fn contains(&self, addr: usize) -> bool {
    self.range().contains(&addr)
  }

  pub fn check(&self, range: Range<usize>) -> ExtentResult<()> {
    if range.start > range.end || range.end > self.len {
      return Err(ExtentError::OutOfBounds);
    }
    Ok(())
  }

  /// Returns the physical pages fully covered by `range` (offsets into the
  /// extent) to the OS. Partial pages at either end are left alone.
  /// Returns the number of bytes reclaimed.
  pub fn reclaim(&self, range: Range<usize>) -> ExtentResult<usize> {
    self.check(range.clone())?;

    let unit = self.system.granularity();
    let start = align_up(range.start, unit).ok_or(ExtentError::PrimError(PrimError::Overflow))?;
    let end = align_down(range.end, unit).ok_or(ExtentError::PrimError(PrimError::InvalidAlignment))?;
    if start >= end {
      return Ok(0);
    }

    let slice = unsafe { core::slice::from_raw_parts(self.base.as_ptr().add(start), end - start) };
    unsafe { self.system.advise(slice, SysOption::Reclaim) }?;
    Ok(end - start)
  }
}

impl Drop for Extent {
  fn drop(&mut self) {
    let slice = unsafe { core::slice::from_raw_parts(self.base.as_ptr(), self.len) };
    let _ = unsafe { self.system.unmap(slice) };
  }
}

unsafe impl Send for Extent {}
unsafe impl Sync for Extent {}
