use core::hash::{BuildHasher, Hash};
use std::collections::hash_map::RandomState;

/// A strict weak order over keys.
///
/// `less` must be irreflexive, asymmetric and transitive, or the structural
/// invariants of the map are undefined. Equivalence is derived:
/// two keys are the same mapping when neither is less than the other.
pub trait Comparator<K: ?Sized> {
  /// Returns true if `a` sorts strictly before `b`.
  fn less(&self, a: &K, b: &K) -> bool;

  /// Returns true if `a` and `b` belong to the same equivalence class.
  #[inline]
  fn equivalent(&self, a: &K, b: &K) -> bool {
    !self.less(a, b) && !self.less(b, a)
  }
}

/// Natural ascending order for `K: Ord`. The default comparator.
#[derive(Debug, Default, Clone, Copy)]
pub struct Ascend;

impl<K: Ord + ?Sized> Comparator<K> for Ascend {
  #[inline]
  fn less(&self, a: &K, b: &K) -> bool {
    a < b
  }

  #[inline]
  fn equivalent(&self, a: &K, b: &K) -> bool {
    a == b
  }
}

/// Natural descending order for `K: Ord`.
#[derive(Debug, Default, Clone, Copy)]
pub struct Descend;

impl<K: Ord + ?Sized> Comparator<K> for Descend {
  #[inline]
  fn less(&self, a: &K, b: &K) -> bool {
    b < a
  }

  #[inline]
  fn equivalent(&self, a: &K, b: &K) -> bool {
    a == b
  }
}

mod sealed {
  /// Floating-point keys the NaN-aware comparators accept.
  pub trait FloatKey: Copy {
    fn is_nan(self) -> bool;
    fn raw_less(self, other: Self) -> bool;
  }

  impl FloatKey for f32 {
    #[inline]
    fn is_nan(self) -> bool {
      self.is_nan()
    }

    #[inline]
    fn raw_less(self, other: Self) -> bool {
      self < other
    }
  }

  impl FloatKey for f64 {
    #[inline]
    fn is_nan(self) -> bool {
      self.is_nan()
    }

    #[inline]
    fn raw_less(self, other: Self) -> bool {
      self < other
    }
  }
}

use sealed::FloatKey;

/// Ascending order for `f32`/`f64` keys.
///
/// All NaN payloads collapse into one equivalence class that sorts below
/// every other value, so NaN entries range first. IEEE comparisons on NaN
/// are not a strict weak order, which rules out `Ascend` for float keys.
#[derive(Debug, Default, Clone, Copy)]
pub struct AscendFloat;

impl<F: FloatKey> Comparator<F> for AscendFloat {
  #[inline]
  fn less(&self, a: &F, b: &F) -> bool {
    if a.is_nan() {
      !b.is_nan()
    } else if b.is_nan() {
      false
    } else {
      a.raw_less(*b)
    }
  }
}

/// Descending order for `f32`/`f64` keys.
///
/// The NaN class sorts above every other value, so NaN entries still range
/// first. This is not the mirror image of [`AscendFloat`].
#[derive(Debug, Default, Clone, Copy)]
pub struct DescendFloat;

impl<F: FloatKey> Comparator<F> for DescendFloat {
  #[inline]
  fn less(&self, a: &F, b: &F) -> bool {
    if a.is_nan() {
      !b.is_nan()
    } else if b.is_nan() {
      false
    } else {
      b.raw_less(*a)
    }
  }
}

/// Orders keys by a per-map seeded hash, falling back to the natural order
/// on hash collisions.
///
/// Membership semantics are identical to [`Ascend`]; only the structural
/// order is randomized, which spreads hot key prefixes across the list.
/// The range order differs from map to map.
#[derive(Debug, Default, Clone)]
pub struct HashOrdered {
  state: RandomState,
}

impl HashOrdered {
  /// Creates a comparator with a fresh random seed.
  #[inline]
  pub fn new() -> Self {
    Self::default()
  }
}

impl<K: Hash + Ord + ?Sized> Comparator<K> for HashOrdered {
  #[inline]
  fn less(&self, a: &K, b: &K) -> bool {
    let (ha, hb) = (self.state.hash_one(a), self.state.hash_one(b));
    ha < hb || (ha == hb && a < b)
  }

  #[inline]
  fn equivalent(&self, a: &K, b: &K) -> bool {
    a == b
  }
}
