#[cfg(any(target_os = "linux", target_os = "macos"))]
use crate::unix::UnixSystem;

use crate::prim::page_size;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SysError {
  Unsupported,
  OutOfMemory,
  InvalidArgument,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SysOption {
  /// Readable and writable anonymous memory.
  ReadWrite,
  /// Hand the physical pages back while keeping the mapping.
  Reclaim,
}

pub type SysResult<T> = Result<T, SysError>;

/// Source of raw OS memory.
///
/// # Safety
///
/// Implementors must ensure that:
/// - `map` returns zero-filled memory aligned to `granularity()` that stays
///   valid until it is passed to `unmap`
/// - `advise` and `unmap` only accept memory this system handed out
/// - after `advise(.., Reclaim)` the range reads back as zeroes
pub unsafe trait System
where
  Self: Send + Sync,
{
  /// Allocation granularity of `map`. Sizes passed to `map` must be a
  /// multiple of it.
  fn granularity(&self) -> usize {
    page_size()
  }

  /// Maps `size` bytes of fresh memory.
  ///
  /// # Safety
  ///
  /// `size` must be a non-zero multiple of `granularity()`.
  unsafe fn map<'mem>(&self, size: usize, options: SysOption) -> SysResult<&'mem mut [u8]> {
    _ = (size, options);
    Err(SysError::Unsupported)
  }

  /// Changes advisory state of a mapped range.
  ///
  /// # Safety
  ///
  /// `slice` must lie inside a live mapping from this system and be
  /// aligned to `granularity()`.
  unsafe fn advise(&self, slice: &[u8], options: SysOption) -> SysResult<()> {
    _ = (slice, options);
    Err(SysError::Unsupported)
  }

  /// Releases a mapping previously returned by `map`.
  ///
  /// # Safety
  ///
  /// `slice` must be exactly a mapping returned by `map` and must not be
  /// touched afterwards.
  unsafe fn unmap(&self, slice: &[u8]) -> SysResult<()> {
    _ = slice;
    Err(SysError::Unsupported)
  }

  /// Whether the page holding `addr` is currently mapped. Never touches the
  /// memory itself. Systems that cannot tell answer true.
  fn is_live(&self, addr: usize) -> bool {
    _ = addr;
    true
  }
}

pub struct UnsupportedSystem {}
unsafe impl System for UnsupportedSystem {}

#[cfg(any(target_os = "linux", target_os = "macos"))]
pub const DEFAULT_SYSTEM: &dyn System = &UnixSystem {};

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
pub const DEFAULT_SYSTEM: &dyn System = &UnsupportedSystem {};

pub static GLOBAL_SYSTEM: &dyn System = DEFAULT_SYSTEM;
