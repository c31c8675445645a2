use memforge_extent::ExtentError;
use memforge_sys::{
  prim::PrimError,
  system::SysError,
};
use thiserror::Error;

/// Ways a block header can fail validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Corruption {
  #[error("header tag mismatch")]
  BadMagic,
  #[error("block released twice")]
  DoubleFree,
  #[error("implausible block size")]
  BadSize,
  #[error("block lies outside its segment")]
  OutOfSegment,
  #[error("pointer is not aligned to the allocation unit")]
  Misaligned,
  #[error("adjacent free blocks were left unmerged")]
  Unmerged,
  #[error("free lists disagree with the heap")]
  ListMismatch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ForgeError {
  #[error("out of memory")]
  OutOfMemory,
  #[error("invalid argument: {0}")]
  InvalidArgument(&'static str),
  #[error("heap corruption detected: {0}")]
  Corruption(#[from] Corruption),
  #[error("size computation overflowed")]
  Overflow,
  #[error("allocator is shutting down")]
  NotReady,
}

impl ForgeError {
  /// Corruption means the allocator's own invariants can no longer be
  /// trusted.
  pub fn is_fatal(&self) -> bool {
    matches!(self, ForgeError::Corruption(_))
  }
}

impl From<SysError> for ForgeError {
  fn from(err: SysError) -> Self {
    match err {
      SysError::OutOfMemory | SysError::Unsupported => ForgeError::OutOfMemory,
      SysError::InvalidArgument => ForgeError::InvalidArgument("rejected by the operating system"),
    }
  }
}

impl From<ExtentError> for ForgeError {
  fn from(err: ExtentError) -> Self {
    match err {
      ExtentError::SystemError(sys) => sys.into(),
      ExtentError::PrimError(prim) => prim.into(),
      ExtentError::OutOfBounds => ForgeError::InvalidArgument("range outside mapping"),
    }
  }
}

impl From<PrimError> for ForgeError {
  fn from(err: PrimError) -> Self {
    match err {
      PrimError::Overflow => ForgeError::OutOfMemory,
      PrimError::InvalidAlignment => ForgeError::InvalidArgument("alignment must be a power of two"),
    }
  }
}

pub type ForgeResult<T> = Result<T, ForgeError>;
