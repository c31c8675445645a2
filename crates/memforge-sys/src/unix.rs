#[cfg(any(target_os = "linux", target_os = "macos"))]
use crate::{
  math::{
    align_down,
    is_aligned,
  },
  system::{
    SysError,
    SysOption,
    SysResult,
    System,
  },
};

pub struct UnixSystem {}

#[cfg(any(target_os = "linux", target_os = "macos"))]
impl UnixSystem {
  const fn prot() -> i32 {
    libc::PROT_READ | libc::PROT_WRITE
  }

  const fn flags() -> i32 {
    libc::MAP_PRIVATE | libc::MAP_ANONYMOUS
  }

  const fn as_c(slice: &[u8]) -> *mut libc::c_void {
    slice.as_ptr() as *mut libc::c_void
  }

  fn check(&self, len: usize) -> SysResult<()> {
    match is_aligned(len, self.granularity()) {
      Some(true) if len != 0 => Ok(()),
      _ => Err(SysError::InvalidArgument),
    }
  }
}

#[cfg(any(target_os = "linux", target_os = "macos"))]
unsafe impl System for UnixSystem {
  unsafe fn map<'mem>(&self, size: usize, options: SysOption) -> SysResult<&'mem mut [u8]> {
    self.check(size)?;
    if options != SysOption::ReadWrite {
      return Err(SysError::InvalidArgument);
    }

    let ptr = unsafe { libc::mmap(core::ptr::null_mut(), size, Self::prot(), Self::flags(), -1, 0) };

    match ptr {
      libc::MAP_FAILED => Err(SysError::OutOfMemory),
      _ => Ok(unsafe { core::slice::from_raw_parts_mut(ptr as *mut u8, size) }),
    }
  }

  unsafe fn advise(&self, slice: &[u8], options: SysOption) -> SysResult<()> {
    self.check(slice.len())?;
    let flags = match options {
      SysOption::Reclaim => libc::MADV_DONTNEED,
      SysOption::ReadWrite => return Err(SysError::InvalidArgument),
    };

    let result = unsafe { libc::madvise(Self::as_c(slice), slice.len(), flags) };
    if result == 0 {
      Ok(())
    } else {
      Err(SysError::InvalidArgument)
    }
  }

  unsafe fn unmap(&self, slice: &[u8]) -> SysResult<()> {
    let result = unsafe { libc::munmap(Self::as_c(slice), slice.len()) };
    if result == 0 {
      return Ok(());
    }

    Err(SysError::InvalidArgument)
  }

  fn is_live(&self, addr: usize) -> bool {
    let page = self.granularity();
    let Some(start) = align_down(addr, page) else {
      return false;
    };
    // fails with ENOMEM once nothing is mapped there
    let result = unsafe { libc::msync(start as *mut libc::c_void, page, libc::MS_ASYNC) };
    result == 0
  }
}
