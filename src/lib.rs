#![cfg_attr(not(test), no_std)]

//! Drop-in global allocator backed by a process-wide [`Forge`].
//!
//! ```ignore
//! #[global_allocator]
//! static GLOBAL: memforge::MemForge = memforge::MemForge;
//! ```

use core::{
  alloc::{
    GlobalAlloc,
    Layout,
  },
  ptr::{
    self,
    NonNull,
  },
};

use memforge_alloc::{
  config::Config,
  forge::Forge,
};
use memforge_sync::lazy::LazyLock;

pub mod prelude {
  pub use memforge_alloc::prelude::*;
  pub use memforge_list::prelude::*;
  pub use memforge_sys::prelude::*;

  pub use super::{
    DEFAULT,
    MemForge,
  };
}

/// The process-wide instance, configured from `MEMFORGE_*` on first use.
pub static DEFAULT: LazyLock<Forge> = LazyLock::new(|| Forge::new(Config::from_env()));

pub struct MemForge;

impl MemForge {
  fn unit() -> usize {
    DEFAULT.config().alignment()
  }

  fn allocate(layout: Layout) -> *mut u8 {
    let result = if layout.align() <= Self::unit() {
      DEFAULT.allocate(layout.size())
    } else {
      DEFAULT.allocate_aligned(layout.align(), layout.size())
    };
    result.map_or(ptr::null_mut(), NonNull::as_ptr)
  }
}

unsafe impl GlobalAlloc for MemForge {
  unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
    Self::allocate(layout)
  }

  unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
    if layout.align() <= Self::unit() {
      return DEFAULT
        .allocate_zeroed(1, layout.size())
        .map_or(ptr::null_mut(), NonNull::as_ptr);
    }
    let ptr = Self::allocate(layout);
    if !ptr.is_null() {
      unsafe { ptr.write_bytes(0, layout.size()) };
    }
    ptr
  }

  unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
    DEFAULT.free(ptr);
  }

  unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
    if layout.align() <= Self::unit() {
      return DEFAULT
        .resize(ptr, new_size)
        .map_or(ptr::null_mut(), NonNull::as_ptr);
    }

    let Ok(new_layout) = Layout::from_size_align(new_size, layout.align()) else {
      return ptr::null_mut();
    };
    let fresh = Self::allocate(new_layout);
    if !fresh.is_null() {
      unsafe {
        ptr::copy_nonoverlapping(ptr, fresh, layout.size().min(new_size));
      }
      DEFAULT.free(ptr);
    }
    fresh
  }
}
