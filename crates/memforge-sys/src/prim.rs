use crate::math::align_up;
use core::sync::atomic::{
  AtomicUsize,
  Ordering,
};

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum PrimError {
  InvalidAlignment,
  Overflow,
}

pub type PrimResult<T> = Result<T, PrimError>;

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
const COMMON_PAGE_SIZE: usize = 4096;

#[cfg(any(target_os = "linux", target_os = "macos"))]
fn page_size_helper() -> usize {
  let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
  if size <= 0 { 4096 } else { size as usize }
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
fn page_size_helper() -> usize {
  COMMON_PAGE_SIZE
}

/// OS page size, queried once.
pub fn page_size() -> usize {
  static PAGE_SIZE: AtomicUsize = AtomicUsize::new(0);

  let cached = PAGE_SIZE.load(Ordering::Acquire);
  if cached != 0 {
    return cached;
  }

  let size = page_size_helper();
  PAGE_SIZE.store(size, Ordering::Release);
  size
}

/// Rounds `value` up to a multiple of a caller-chosen page unit.
pub fn page_align_to(value: usize, page: usize) -> PrimResult<usize> {
  if !page.is_power_of_two() {
    return Err(PrimError::InvalidAlignment);
  }
  align_up(value, page).ok_or(PrimError::Overflow)
}
