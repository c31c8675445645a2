use core::ffi::{
  c_int,
  c_void,
};

use crate::*;

#[unsafe(no_mangle)]
pub extern "C" fn malloc(size: usize) -> *mut c_void {
  mf_malloc(size)
}

#[unsafe(no_mangle)]
pub extern "C" fn free(ptr: *mut c_void) {
  mf_free(ptr);
}

#[unsafe(no_mangle)]
pub extern "C" fn calloc(count: usize, size: usize) -> *mut c_void {
  mf_calloc(count, size)
}

#[unsafe(no_mangle)]
pub extern "C" fn realloc(ptr: *mut c_void, size: usize) -> *mut c_void {
  mf_realloc(ptr, size)
}

#[unsafe(no_mangle)]
pub extern "C" fn memalign(alignment: usize, size: usize) -> *mut c_void {
  mf_memalign(alignment, size)
}

#[unsafe(no_mangle)]
pub extern "C" fn aligned_alloc(alignment: usize, size: usize) -> *mut c_void {
  mf_aligned_alloc(alignment, size)
}

/// # Safety
///
/// `out` must be valid for a pointer-sized write.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn posix_memalign(out: *mut *mut c_void, alignment: usize, size: usize) -> c_int {
  unsafe { mf_posix_memalign(out, alignment, size) }
}

#[unsafe(no_mangle)]
pub extern "C" fn malloc_usable_size(ptr: *mut c_void) -> usize {
  mf_malloc_usable_size(ptr)
}

#[unsafe(no_mangle)]
pub extern "C" fn malloc_trim(pad: usize) -> c_int {
  mf_malloc_trim(pad)
}

#[unsafe(no_mangle)]
pub extern "C" fn malloc_stats() {
  mf_malloc_stats();
}

#[unsafe(no_mangle)]
pub extern "C" fn malloc_verify() -> c_int {
  mf_malloc_verify()
}
