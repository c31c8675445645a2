pub mod arena;
pub mod backing;
pub mod block;
pub mod classes;
pub mod config;
pub mod error;
pub mod forge;
pub mod freelist;
pub mod segment;
pub mod stats;

pub mod prelude {
  pub use super::{
    config::{
      AssignFn,
      Assignment,
      Config,
      Strategy,
    },
    error::{
      Corruption,
      ForgeError,
      ForgeResult,
    },
    forge::{
      Forge,
      Lifecycle,
    },
    stats::{
      HeapReport,
      StatsSnapshot,
      Trimmed,
    },
  };
}
