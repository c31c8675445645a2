pub mod lazy;
pub mod thread;

pub mod prelude {
  pub use super::{
    lazy::LazyLock,
    thread::{
      ThreadToken,
      thread_token,
    },
  };
}
