#![cfg_attr(not(test), no_std)]

pub mod math;
pub mod prim;
pub mod system;
pub mod unix;

pub use system::GLOBAL_SYSTEM;

pub mod prelude {
  pub use super::{
    GLOBAL_SYSTEM,
    math::{
      align_down,
      align_up,
      is_aligned,
    },
    prim::{
      PrimError,
      PrimResult,
      page_align_to,
      page_size,
    },
    system::{
      SysError,
      SysOption,
      SysResult,
      System,
    },
  };
}
