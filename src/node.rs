use core::mem::MaybeUninit;

use crossbeam_epoch::{self as epoch, Atomic};

use crate::{
  sync::{AtomicU8, Mutex, Ordering},
  MAX_HEIGHT,
};

/// The tower has been published at every level of the node's height. Only
/// fully linked, unmarked nodes are members of the map.
pub(crate) const FULLY_LINKED: u8 = 1;
/// The node is logically deleted. Monotonic: once set, never cleared.
pub(crate) const MARKED: u8 = 1 << 1;
/// The sentinel. Its key slot is uninitialized and must never be read.
pub(crate) const HEAD: u8 = 1 << 2;

/// Lifecycle bits, packed into one atomic so that `fully linked and not
/// marked` is a single load.
pub(crate) struct Flags(AtomicU8);

impl Flags {
  #[inline]
  fn new(bits: u8) -> Self {
    Self(AtomicU8::new(bits))
  }

  #[inline]
  pub(crate) fn contains(&self, bit: u8) -> bool {
    self.0.load(Ordering::Acquire) & bit == bit
  }

  /// Checks `masked bits == expect` in a single load.
  #[inline]
  fn check(&self, mask: u8, expect: u8) -> bool {
    self.0.load(Ordering::Acquire) & mask == expect
  }

  #[inline]
  fn set(&self, bit: u8) {
    self.0.fetch_or(bit, Ordering::Release);
  }
}

/// A key/value record carrying a variable-height tower of forward links, a
/// mutex serializing structural changes to its outgoing links, and the
/// lifecycle flags.
///
/// The memory layout follows the usual truncated-tower scheme: the
/// probability of each successive level decreases geometrically, so the
/// tower is allocated at the sampled height instead of [`MAX_HEIGHT`].
pub(crate) struct Node<K, V> {
  /// Immutable after construction. Uninitialized only in the head sentinel,
  /// which never appears as a successor and is never compared.
  key: MaybeUninit<K>,
  /// Replaceable value cell. Overwrites swap the pointer and defer the old
  /// value to the epoch reclaimer. Null only in the head sentinel.
  pub(crate) value: Atomic<V>,
  /// Serializes mutation of this node's outgoing links and its transition
  /// to `MARKED`.
  pub(crate) mu: Mutex<()>,
  flags: Flags,
  tower: Box<[Atomic<Node<K, V>>]>,
}

impl<K, V> Node<K, V> {
  pub(crate) fn new(key: K, value: V, height: usize) -> Self {
    debug_assert!((1..=MAX_HEIGHT).contains(&height));
    Self {
      key: MaybeUninit::new(key),
      value: Atomic::new(value),
      mu: Mutex::new(()),
      flags: Flags::new(0),
      tower: (0..height).map(|_| Atomic::null()).collect(),
    }
  }

  pub(crate) fn head() -> Self {
    Self {
      key: MaybeUninit::uninit(),
      value: Atomic::null(),
      mu: Mutex::new(()),
      flags: Flags::new(HEAD | FULLY_LINKED),
      tower: (0..MAX_HEIGHT).map(|_| Atomic::null()).collect(),
    }
  }

  #[inline]
  pub(crate) fn key(&self) -> &K {
    debug_assert!(!self.flags.contains(HEAD));
    // Safety: every node except the head sentinel is constructed with an
    // initialized key, and the head is never handed out as a successor.
    unsafe { self.key.assume_init_ref() }
  }

  #[inline]
  pub(crate) fn height(&self) -> usize {
    self.tower.len()
  }

  #[inline]
  pub(crate) fn tower(&self, level: usize) -> &Atomic<Node<K, V>> {
    &self.tower[level]
  }

  #[inline]
  pub(crate) fn is_fully_linked(&self) -> bool {
    self.flags.contains(FULLY_LINKED)
  }

  #[inline]
  pub(crate) fn is_marked(&self) -> bool {
    self.flags.contains(MARKED)
  }

  /// Fully linked and not marked, in a single flags load.
  #[inline]
  pub(crate) fn is_live(&self) -> bool {
    self.flags.check(FULLY_LINKED | MARKED, FULLY_LINKED)
  }

  #[inline]
  pub(crate) fn set_fully_linked(&self) {
    self.flags.set(FULLY_LINKED);
  }

  /// Caller must hold `self.mu`.
  #[inline]
  pub(crate) fn set_marked(&self) {
    self.flags.set(MARKED);
  }
}

impl<K, V> Drop for Node<K, V> {
  fn drop(&mut self) {
    // Nodes are dropped either after an epoch grace period (unlinked by a
    // remove) or while the map is being torn down, so nothing can still be
    // reading the key or the current value.
    unsafe {
      if !self.flags.contains(HEAD) {
        self.key.assume_init_drop();
      }
      let value = self.value.load(Ordering::Relaxed, epoch::unprotected());
      if !value.is_null() {
        drop(value.into_owned());
      }
    }
  }
}
