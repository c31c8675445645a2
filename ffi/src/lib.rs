//! C entry points over the process-wide allocator.
//!
//! Every function is prefixed with `mf_`. Building with the `interpose`
//! feature also exports the plain libc names so the library can be
//! preloaded in front of the system allocator.

use core::{
  ffi::{
    c_int,
    c_void,
  },
  ptr::{
    self,
    NonNull,
  },
};

pub use memforge::prelude::*;

#[cfg(feature = "interpose")]
mod interpose;

#[cfg(target_os = "linux")]
fn set_errno(code: c_int) {
  unsafe { *libc::__errno_location() = code };
}

#[cfg(target_os = "macos")]
fn set_errno(code: c_int) {
  unsafe { *libc::__error() = code };
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
fn set_errno(code: c_int) {
  _ = code;
}

fn errno_for(err: ForgeError) -> c_int {
  match err {
    ForgeError::InvalidArgument(_) => libc::EINVAL,
    _ => libc::ENOMEM,
  }
}

/// Corruption cannot be reported through the C interface.
fn fatal(err: ForgeError, ptr: *mut c_void) -> ! {
  log::error!("memforge: {err} at {ptr:p}; aborting");
  std::process::abort();
}

fn hand_out(result: ForgeResult<NonNull<u8>>, ptr: *mut c_void) -> *mut c_void {
  match result {
    Ok(block) => block.as_ptr().cast(),
    Err(err) if err.is_fatal() => fatal(err, ptr),
    Err(err) => {
      set_errno(errno_for(err));
      ptr::null_mut()
    }
  }
}

#[unsafe(no_mangle)]
pub extern "C" fn mf_malloc(size: usize) -> *mut c_void {
  hand_out(DEFAULT.allocate(size), ptr::null_mut())
}

#[unsafe(no_mangle)]
pub extern "C" fn mf_free(ptr: *mut c_void) {
  DEFAULT.free(ptr.cast());
}

#[unsafe(no_mangle)]
pub extern "C" fn mf_calloc(count: usize, size: usize) -> *mut c_void {
  hand_out(DEFAULT.allocate_zeroed(count, size), ptr::null_mut())
}

/// On failure the original block is left untouched.
#[unsafe(no_mangle)]
pub extern "C" fn mf_realloc(ptr: *mut c_void, size: usize) -> *mut c_void {
  hand_out(DEFAULT.resize(ptr.cast(), size), ptr)
}

#[unsafe(no_mangle)]
pub extern "C" fn mf_memalign(alignment: usize, size: usize) -> *mut c_void {
  hand_out(DEFAULT.allocate_aligned(alignment, size), ptr::null_mut())
}

#[unsafe(no_mangle)]
pub extern "C" fn mf_aligned_alloc(alignment: usize, size: usize) -> *mut c_void {
  mf_memalign(alignment, size)
}

/// # Safety
///
/// `out` must be valid for a pointer-sized write.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn mf_posix_memalign(out: *mut *mut c_void, alignment: usize, size: usize) -> c_int {
  if out.is_null() || alignment % size_of::<*mut c_void>() != 0 {
    return libc::EINVAL;
  }
  match DEFAULT.allocate_aligned(alignment, size) {
    Ok(block) => {
      unsafe { *out = block.as_ptr().cast() };
      0
    }
    Err(err) => errno_for(err),
  }
}

#[unsafe(no_mangle)]
pub extern "C" fn mf_malloc_usable_size(ptr: *mut c_void) -> usize {
  match DEFAULT.usable_size(ptr.cast()) {
    Ok(size) => size,
    Err(err) if err.is_fatal() => fatal(err, ptr),
    Err(_) => 0,
  }
}

/// Returns 1 when any memory went back to the OS.
#[unsafe(no_mangle)]
pub extern "C" fn mf_malloc_trim(pad: usize) -> c_int {
  c_int::from(DEFAULT.trim(pad).any())
}

/// Counters copied out by [`mf_malloc_stats_get`].
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct MfStats {
  pub total_mapped: usize,
  pub total_allocated: usize,
  pub total_freed: usize,
  pub current_usage: usize,
  pub peak_usage: usize,
  pub allocation_count: usize,
  pub free_count: usize,
  pub mmap_count: usize,
  pub segment_count: usize,
  pub arena_count: usize,
  pub contention_count: usize,
}

impl From<StatsSnapshot> for MfStats {
  fn from(snap: StatsSnapshot) -> Self {
    Self {
      total_mapped: snap.total_mapped(),
      total_allocated: snap.total_allocated(),
      total_freed: snap.total_freed(),
      current_usage: snap.current_usage(),
      peak_usage: snap.peak_usage(),
      allocation_count: snap.allocation_count(),
      free_count: snap.free_count(),
      mmap_count: snap.mmap_count(),
      segment_count: snap.segment_count(),
      arena_count: snap.arena_count(),
      contention_count: snap.contention_count(),
    }
  }
}

/// # Safety
///
/// `out` must be null or valid for a write of [`MfStats`].
#[unsafe(no_mangle)]
pub unsafe extern "C" fn mf_malloc_stats_get(out: *mut MfStats) -> c_int {
  if out.is_null() {
    return libc::EINVAL;
  }
  unsafe { out.write(DEFAULT.stats().into()) };
  0
}

/// Prints the counters to stderr.
#[unsafe(no_mangle)]
pub extern "C" fn mf_malloc_stats() {
  let s = MfStats::from(DEFAULT.stats());
  eprintln!("memforge: arenas {} segments {} direct {}", s.arena_count, s.segment_count, s.mmap_count);
  eprintln!("memforge: mapped {} in use {} peak {}", s.total_mapped, s.current_usage, s.peak_usage);
  eprintln!(
    "memforge: allocations {} frees {} contended {}",
    s.allocation_count, s.free_count, s.contention_count
  );
}

/// Checks every heap block. Returns 0 when the heap is consistent and -1
/// after logging the first corruption found.
#[unsafe(no_mangle)]
pub extern "C" fn mf_malloc_verify() -> c_int {
  match DEFAULT.verify() {
    Ok(_) => 0,
    Err(err) => {
      log::error!("memforge: heap check failed: {err}");
      -1
    }
  }
}

/// Starts the allocator with the built-in defaults. Returns 0 on success
/// and -1 on failure. Does nothing if it is already running.
#[unsafe(no_mangle)]
pub extern "C" fn mf_init() -> c_int {
  match DEFAULT.initialize(Some(Config::DEFAULT)) {
    Ok(()) => 0,
    Err(err) => {
      set_errno(errno_for(err));
      -1
    }
  }
}

/// Like [`mf_init`], tuned by the `MEMFORGE_*` environment variables.
#[unsafe(no_mangle)]
pub extern "C" fn mf_init_from_env() -> c_int {
  match DEFAULT.initialize(Some(Config::from_env())) {
    Ok(()) => 0,
    Err(err) => {
      set_errno(errno_for(err));
      -1
    }
  }
}

/// Releases every arena. Heap pointers handed out before become invalid.
#[unsafe(no_mangle)]
pub extern "C" fn mf_cleanup() {
  DEFAULT.shutdown();
}
