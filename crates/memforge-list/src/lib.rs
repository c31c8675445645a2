#![cfg_attr(not(test), no_std)]

//! Intrusive doubly-linked lists.
//!
//! Nodes carry their own [`Link`] and live in storage the list does not
//! own. A node must be removed from one list before it is pushed onto
//! another.

use core::{
  marker::PhantomData,
  ptr::NonNull,
};

use getset::{
  CopyGetters,
  Getters,
  MutGetters,
};

pub mod prelude {
  pub use super::{
    Chain,
    HasLink,
    Link,
    List,
    ListIter,
  };
}

pub trait HasLink {
  fn link(&self) -> &Link<Self>
  where
    Self: Sized;
  fn link_mut(&mut self) -> &mut Link<Self>
  where
    Self: Sized;
}

#[derive(Debug, Getters, MutGetters)]
pub struct Link<T>
where
  T: HasLink,
{
  #[getset(get = "pub", get_mut = "pub")]
  next: Option<NonNull<T>>,
  #[getset(get = "pub", get_mut = "pub")]
  prev: Option<NonNull<T>>,
}

impl<T> Link<T>
where
  T: HasLink,
{
  pub const fn new() -> Self {
    Self {
      next: None,
      prev: None,
    }
  }

  pub fn is_linked(&self) -> bool {
    self.next.is_some() || self.prev.is_some()
  }

  pub fn clear(&mut self) {
    self.next = None;
    self.prev = None;
  }
}

impl<T> Default for Link<T>
where
  T: HasLink,
{
  fn default() -> Self {
    Self::new()
  }
}

/// Pointer surgery on bare nodes, without a head.
pub struct List {}

impl List {
  fn to_non_null<T>(item: &mut T) -> NonNull<T>
  where
    T: HasLink,
  {
    NonNull::from(&mut *item)
  }

  pub fn insert_before<T>(item: &mut T, at: &mut T)
  where
    T: HasLink,
  {
    let at_ptr = Self::to_non_null(at);
    let item_ptr = Self::to_non_null(item);

    let item_link = item.link_mut();
    let at_link = at.link_mut();

    item_link.next = Some(at_ptr);
    item_link.prev = at_link.prev;

    if let Some(mut prev) = at_link.prev {
      unsafe { prev.as_mut().link_mut().next = Some(item_ptr) };
    }

    at_link.prev = Some(item_ptr);
  }

  pub fn insert_after<T>(item: &mut T, at: &mut T)
  where
    T: HasLink,
  {
    let at_ptr = Self::to_non_null(at);
    let item_ptr = Self::to_non_null(item);

    let item_link = item.link_mut();
    let at_link = at.link_mut();

    item_link.prev = Some(at_ptr);
    item_link.next = at_link.next;

    if let Some(mut next) = at_link.next {
      unsafe { next.as_mut().link_mut().prev = Some(item_ptr) };
    }

    at_link.next = Some(item_ptr);
  }

  pub fn remove<T>(item: &mut T)
  where
    T: HasLink,
  {
    let item_link = item.link_mut();

    if let Some(mut prev) = item_link.prev {
      unsafe { prev.as_mut().link_mut().next = item_link.next };
    }

    if let Some(mut next) = item_link.next {
      unsafe { next.as_mut().link_mut().prev = item_link.prev };
    }

    item_link.clear();
  }
}

/// A headed list: tracks both ends and the node count.
#[derive(Debug, CopyGetters)]
pub struct Chain<T>
where
  T: HasLink,
{
  #[getset(get_copy = "pub")]
  head: Option<NonNull<T>>,
  #[getset(get_copy = "pub")]
  tail: Option<NonNull<T>>,
  #[getset(get_copy = "pub")]
  len: usize,
}

impl<T> Chain<T>
where
  T: HasLink,
{
  pub const fn new() -> Self {
    Self {
      head: None,
      tail: None,
      len: 0,
    }
  }

  pub fn is_empty(&self) -> bool {
    self.head.is_none()
  }

  /// # Safety
  ///
  /// `item` must be valid, unlinked, and outlive its membership.
  pub unsafe fn push_front(&mut self, mut item: NonNull<T>) {
    let node = unsafe { item.as_mut() };
    match self.head {
      Some(mut head) => List::insert_before(node, unsafe { head.as_mut() }),
      None => self.tail = Some(item),
    }
    self.head = Some(item);
    self.len += 1;
  }

  /// # Safety
  ///
  /// `item` must be valid, unlinked, and outlive its membership.
  pub unsafe fn push_back(&mut self, mut item: NonNull<T>) {
    let node = unsafe { item.as_mut() };
    match self.tail {
      Some(mut tail) => List::insert_after(node, unsafe { tail.as_mut() }),
      None => self.head = Some(item),
    }
    self.tail = Some(item);
    self.len += 1;
  }

  /// # Safety
  ///
  /// `item` must currently be a member of this chain.
  pub unsafe fn remove(&mut self, mut item: NonNull<T>) {
    let node = unsafe { item.as_mut() };
    if self.head == Some(item) {
      self.head = *node.link().next();
    }
    if self.tail == Some(item) {
      self.tail = *node.link().prev();
    }
    List::remove(node);
    self.len -= 1;
  }

  /// # Safety
  ///
  /// Every member must still be valid.
  pub unsafe fn pop_front(&mut self) -> Option<NonNull<T>> {
    let head = self.head?;
    unsafe { self.remove(head) };
    Some(head)
  }

  pub fn iter(&self) -> ListIter<'_, T> {
    ListIter::new(self.head)
  }
}

impl<T> Default for Chain<T>
where
  T: HasLink,
{
  fn default() -> Self {
    Self::new()
  }
}

/// Walks forward from a node. Yields raw pointers so callers decide how
/// much of each node they touch.
pub struct ListIter<'list, T>
where
  T: HasLink + 'list,
{
  next: Option<NonNull<T>>,
  marker: PhantomData<&'list T>,
}

impl<'list, T> ListIter<'list, T>
where
  T: HasLink + 'list,
{
  pub fn new(start: Option<NonNull<T>>) -> Self {
    Self {
      next: start,
      marker: PhantomData,
    }
  }
}

impl<'list, T> From<&'list T> for ListIter<'list, T>
where
  T: HasLink + 'list,
{
  fn from(start: &'list T) -> Self {
    Self::new(Some(NonNull::from(start)))
  }
}

impl<'list, T> Iterator for ListIter<'list, T>
where
  T: HasLink + 'list,
{
  type Item = NonNull<T>;

  fn next(&mut self) -> Option<Self::Item> {
    let current = self.next?;
    self.next = *unsafe { current.as_ref() }.link().next();
    Some(current)
  }
}
