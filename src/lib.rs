#![doc = include_str!("../README.md")]
#![cfg_attr(docsrs, feature(doc_cfg))]
#![deny(missing_docs)]

mod comparator;
pub use comparator::{Ascend, AscendFloat, Comparator, Descend, DescendFloat, HashOrdered};

mod node;

mod map;
pub use map::SkipMap;

/// The maximum tower height of any node. Towers are truncated to the sampled
/// height, so most nodes allocate far fewer links than this.
pub const MAX_HEIGHT: usize = 32;

/// Where searches start before any tall node has been inserted. The search
/// hint never drops below this and never exceeds [`MAX_HEIGHT`].
pub(crate) const DEFAULT_HIGHEST_LEVEL: usize = 4;

/// Precompute the skiplist probabilities so that only a single random number
/// needs to be generated per insert.
const PROBABILITIES: [u32; MAX_HEIGHT] = {
  const P: f64 = 0.25;

  let mut probabilities = [0; MAX_HEIGHT];
  let mut p = 1f64;

  let mut i = 0;
  while i < MAX_HEIGHT {
    probabilities[i] = ((u32::MAX as f64) * p) as u32;
    p *= P;
    i += 1;
  }

  probabilities
};

/// Samples a tower height in `1..=MAX_HEIGHT`, geometrically distributed
/// with p = 1/4. Independent per insert.
#[inline]
pub(crate) fn random_height() -> usize {
  use rand::{thread_rng, Rng};
  let rnd: u32 = thread_rng().gen();
  let mut h = 1;

  while h < MAX_HEIGHT && rnd <= PROBABILITIES[h] {
    h += 1;
  }
  h
}

mod sync {
  #[cfg(not(loom))]
  pub(crate) use core::sync::atomic::*;

  #[cfg(loom)]
  pub(crate) use loom::sync::atomic::*;

  #[cfg(not(loom))]
  pub(crate) use parking_lot::{Mutex, MutexGuard};

  #[cfg(loom)]
  pub(crate) use loom::sync::{Mutex, MutexGuard};

  #[cfg(not(loom))]
  #[inline]
  pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock()
  }

  #[cfg(loom)]
  pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap()
  }
}
