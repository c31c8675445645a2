use core::{
  cell::Cell,
  sync::atomic::{
    AtomicUsize,
    Ordering,
  },
};

/// Dense per-thread identity, handed out in order of first use.
pub type ThreadToken = usize;

const UNASSIGNED: usize = usize::MAX;

static NEXT_TOKEN: AtomicUsize = AtomicUsize::new(0);

thread_local! {
  // const-initialized and drop-free, so touching it never allocates
  static TOKEN: Cell<usize> = const { Cell::new(UNASSIGNED) };
}

/// Token of the calling thread. Falls back to `0` once the thread-local
/// slot has been torn down.
pub fn thread_token() -> ThreadToken {
  TOKEN
    .try_with(|slot| {
      let current = slot.get();
      if current != UNASSIGNED {
        return current;
      }
      let fresh = NEXT_TOKEN.fetch_add(1, Ordering::Relaxed);
      slot.set(fresh);
      fresh
    })
    .unwrap_or(0)
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::{
    collections::HashSet,
    thread,
  };

  #[test]
  fn test_token_is_stable_per_thread() {
    let first = thread_token();
    assert_eq!(thread_token(), first);
  }

  #[test]
  fn test_tokens_differ_across_threads() {
    let tokens: HashSet<ThreadToken> = (0..8)
      .map(|_| thread::spawn(thread_token))
      .collect::<Vec<_>>()
      .into_iter()
      .map(|h| h.join().unwrap())
      .collect();

    assert_eq!(tokens.len(), 8);
  }
}
