use core::{
  cell::UnsafeCell,
  mem::ManuallyDrop,
  ops::Deref,
};

use spin::Once;

struct Data<T, F> {
  value: Option<T>,
  f: ManuallyDrop<F>,
}

/// Lazily built value behind a spin `Once`.
///
/// Unlike `std::sync::LazyLock` the initializer never touches the global
/// allocator, so it is safe to force from inside an allocation path.
pub struct LazyLock<T, F = fn() -> T> {
  once: Once,
  data: UnsafeCell<Data<T, F>>,
}

impl<T, F> LazyLock<T, F>
where
  F: FnOnce() -> T,
{
  pub const fn new(f: F) -> Self {
    Self {
      once: Once::new(),
      data: UnsafeCell::new(Data {
        f: ManuallyDrop::new(f),
        value: None,
      }),
    }
  }

  pub fn force(this: &LazyLock<T, F>) -> &T {
    this.once.call_once(|| {
      let data = unsafe { &mut *this.data.get() };
      let f = unsafe { ManuallyDrop::take(&mut data.f) };
      data.value = Some(f());
    });

    let data = unsafe { &*this.data.get() };
    match data.value.as_ref() {
      Some(value) => value,
      None => unreachable!("Once completed without a value"),
    }
  }

  pub fn is_forced(this: &LazyLock<T, F>) -> bool {
    this.once.is_completed()
  }
}

impl<T, F> Deref for LazyLock<T, F>
where
  F: FnOnce() -> T,
{
  type Target = T;
  fn deref(&self) -> &Self::Target {
    Self::force(self)
  }
}

unsafe impl<T, F> Sync for LazyLock<T, F>
where
  T: Sync + Send,
  F: Send + FnOnce() -> T,
{
}
unsafe impl<T, F> Send for LazyLock<T, F>
where
  T: Send,
  F: Send + FnOnce() -> T,
{
}

#[cfg(test)]
mod tests {
  use super::*;
  use core::sync::atomic::{
    AtomicUsize,
    Ordering,
  };

  static CALLS: AtomicUsize = AtomicUsize::new(0);

  fn build() -> usize {
    CALLS.fetch_add(1, Ordering::SeqCst);
    7
  }

  #[test]
  fn test_initializer_runs_once() {
    static VALUE: LazyLock<usize> = LazyLock::new(build);

    assert!(!LazyLock::is_forced(&VALUE));
    let handles: Vec<_> = (0..4).map(|_| std::thread::spawn(|| *VALUE)).collect();
    for handle in handles {
      assert_eq!(handle.join().unwrap(), 7);
    }
    assert_eq!(*VALUE, 7);
    assert!(LazyLock::is_forced(&VALUE));
    assert_eq!(CALLS.load(Ordering::SeqCst), 1);
  }
}
