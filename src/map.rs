use core::fmt;
use core::ptr::NonNull;

use crossbeam_epoch::{self as epoch, Guard, Owned, Shared};
use crossbeam_utils::{Backoff, CachePadded};

use crate::{
  comparator::{Ascend, Comparator},
  node::Node,
  sync::{self, AtomicUsize, Ordering},
  DEFAULT_HIGHEST_LEVEL, MAX_HEIGHT,
};


/// A concurrent, ordered map based on a lock-based skip list.
///
/// Lookups are lock-free and never block. Mutations take the mutexes of a
/// constant number of predecessor nodes, validate that the optimistic
/// search still describes the list, and retry from the search on conflict.
/// Removal is lazy: a node is first marked dead under its own lock, then
/// unlinked level by level, and finally reclaimed once every thread that
/// could have observed it has moved on.
///
/// The order of the map is decided by the comparator type parameter, which
/// defaults to the natural ascending order of `K`.
///
/// # Examples
///
/// ```
/// use skipmap::SkipMap;
///
/// let m = SkipMap::new();
/// m.insert("key1", 1);
/// m.insert("key2", 2);
/// assert_eq!(m.get(&"key1"), Some(1));
/// assert_eq!(m.remove(&"key2"), Some(2));
/// assert_eq!(m.len(), 1);
/// ```
pub struct SkipMap<K, V, C = Ascend> {
  head: NonNull<Node<K, V>>,

  /// Search start hint. 1 <= height <= MAX_HEIGHT, raised by CAS whenever a
  /// taller node is about to be inserted; never lowered.
  height: CachePadded<AtomicUsize>,
  len: CachePadded<AtomicUsize>,

  cmp: C,
}

// Safety: nodes reachable from `head` are owned by the map and only handed
// out by value (clones) or borrowed under an epoch guard. Deferred
// destruction may drop keys and values on another thread.
unsafe impl<K: Send, V: Send, C: Send> Send for SkipMap<K, V, C> {}
unsafe impl<K: Send + Sync, V: Send + Sync, C: Sync> Sync for SkipMap<K, V, C> {}

impl<K, V> SkipMap<K, V> {
  /// Creates an empty map ordered by the natural ascending order of `K`.
  pub fn new() -> Self {
    Self::with_comparator(Ascend)
  }
}

impl<K, V, C> SkipMap<K, V, C> {
  /// Like [`SkipMap::new`], but with a custom comparator deciding the
  /// structural order of the keys.
  pub fn with_comparator(cmp: C) -> Self {
    let head = Box::new(Node::head());
    Self {
      head: NonNull::from(Box::leak(head)),
      height: CachePadded::new(AtomicUsize::new(DEFAULT_HIGHEST_LEVEL)),
      len: CachePadded::new(AtomicUsize::new(0)),
      cmp,
    }
  }

  /// Returns the number of entries in the map.
  ///
  /// The counter is kept with sequentially consistent updates, so after all
  /// operations quiesce it equals the number of live entries; while
  /// mutations are in flight it may momentarily differ from a full scan.
  #[inline]
  pub fn len(&self) -> usize {
    self.len.load(Ordering::SeqCst)
  }

  /// Returns true if the map holds no entries.
  #[inline]
  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  /// Returns the height of the highest tower within any node that has ever
  /// been inserted into the map.
  #[inline]
  pub fn height(&self) -> usize {
    self.height.load(Ordering::Acquire)
  }

  #[inline]
  fn head_shared<'g>(&self) -> Shared<'g, Node<K, V>> {
    Shared::from(self.head.as_ptr() as *const Node<K, V>)
  }

  /// Samples a height for a new node and raises the search hint to cover
  /// it. The hint is advisory, so raising it before the insert commits is
  /// harmless even if the insert retries.
  fn random_height_and_raise(&self) -> usize {
    let height = crate::random_height();
    let mut hint = self.height.load(Ordering::Acquire);
    while height > hint {
      match self
        .height
        .compare_exchange(hint, height, Ordering::SeqCst, Ordering::SeqCst)
      {
        Ok(_) => break,
        Err(current) => hint = current,
      }
    }
    height
  }
}

impl<K, V, C> SkipMap<K, V, C>
where
  C: Comparator<K>,
{
  /// Top-down unsynchronized search. Fills `preds`/`succs` for every level
  /// below the current search hint and reports the highest level at which a
  /// node with an equivalent key was observed.
  ///
  /// The splice is a snapshot: callers that intend to mutate must lock the
  /// predecessors and re-validate before publishing anything.
  fn find_node<'g>(
    &self,
    key: &K,
    preds: &mut [Shared<'g, Node<K, V>>; MAX_HEIGHT],
    succs: &mut [Shared<'g, Node<K, V>>; MAX_HEIGHT],
    guard: &'g Guard,
  ) -> Option<usize> {
    let mut found = None;
    let mut pred = self.head_shared();

    for level in (0..self.height()).rev() {
      // Safety: pred is the head sentinel or was read through an acquire
      // load while the guard was pinned.
      let mut curr = unsafe { pred.deref() }.tower(level).load(Ordering::Acquire, guard);

      while let Some(c) = unsafe { curr.as_ref() } {
        if self.cmp.less(c.key(), key) {
          pred = curr;
          curr = c.tower(level).load(Ordering::Acquire, guard);
        } else {
          break;
        }
      }

      preds[level] = pred;
      succs[level] = curr;

      if found.is_none() {
        if let Some(c) = unsafe { curr.as_ref() } {
          if self.cmp.equivalent(c.key(), key) {
            found = Some(level);
          }
        }
      }
    }
    found
  }

  /// Lean read path: descends towards `key` and returns the first node with
  /// an equivalent key, dead or alive, without recording the splice.
  fn seek<'g>(&self, key: &K, guard: &'g Guard) -> Option<&'g Node<K, V>> {
    let mut pred = self.head_shared();

    for level in (0..self.height()).rev() {
      // Safety: same as in find_node.
      let mut curr = unsafe { pred.deref() }.tower(level).load(Ordering::Acquire, guard);

      while let Some(c) = unsafe { curr.as_ref() } {
        if self.cmp.less(c.key(), key) {
          pred = curr;
          curr = c.tower(level).load(Ordering::Acquire, guard);
          continue;
        }
        if self.cmp.equivalent(c.key(), key) {
          return Some(c);
        }
        break;
      }
    }
    None
  }

  /// Returns true if the map contains a live entry for `key`.
  #[inline]
  pub fn contains_key(&self, key: &K) -> bool {
    let guard = &epoch::pin();
    self.seek(key, guard).map_or(false, Node::is_live)
  }

  /// Returns a clone of the value mapped to `key`, or `None` if the key is
  /// absent. Never locks.
  pub fn get(&self, key: &K) -> Option<V>
  where
    V: Clone,
  {
    let guard = &epoch::pin();
    let node = self.seek(key, guard)?;
    if !node.is_live() {
      return None;
    }
    let value = node.value.load(Ordering::Acquire, guard);
    // Safety: the value cell of a published node is never null, and the
    // pinned epoch keeps a replaced value alive until the clone finishes.
    Some(unsafe { value.deref() }.clone())
  }

  /// Maps `key` to `value`, replacing the previous value if the key was
  /// already present.
  pub fn insert(&self, key: K, value: V) {
    let guard = &epoch::pin();
    self.update(key, || value, true, guard);
  }

  /// Returns the value mapped to `key` if one exists, otherwise inserts
  /// `value` and returns it. The boolean is true when an existing mapping
  /// was loaded.
  ///
  /// Under contention on an absent key, exactly one caller inserts; every
  /// caller returns the winner's value.
  pub fn get_or_insert(&self, key: K, value: V) -> (V, bool)
  where
    V: Clone,
  {
    let guard = &epoch::pin();
    let (value, loaded) = self.update(key, || value, false, guard);
    (value.clone(), loaded)
  }

  /// Like [`SkipMap::get_or_insert`], but the value is produced by `f`,
  /// which is invoked at most once, and only by the caller that wins the
  /// insert. Callers that observe an existing mapping never run `f`.
  ///
  /// # Examples
  ///
  /// ```
  /// use skipmap::SkipMap;
  ///
  /// let m = SkipMap::new();
  /// let (v, loaded) = m.get_or_insert_with(10, || "ten".to_string());
  /// assert!(!loaded);
  /// let (v2, loaded) = m.get_or_insert_with(10, || unreachable!());
  /// assert!(loaded);
  /// assert_eq!(v, v2);
  /// ```
  pub fn get_or_insert_with<F>(&self, key: K, f: F) -> (V, bool)
  where
    F: FnOnce() -> V,
    V: Clone,
  {
    let guard = &epoch::pin();
    let (value, loaded) = self.update(key, f, false, guard);
    (value.clone(), loaded)
  }

  /// The shared insert path. `value` is forced at most once: on the replace
  /// fast path, or inside the validated locked region right before linking,
  /// so racing lazy producers either observe the winner or retry.
  ///
  /// Returns a borrow of the mapping's value and whether an existing
  /// mapping was loaded.
  fn update<'g, F>(&self, key: K, value: F, replace: bool, guard: &'g Guard) -> (&'g V, bool)
  where
    F: FnOnce() -> V,
  {
    let mut value = Some(value);
    let height = self.random_height_and_raise();
    let mut preds = [Shared::null(); MAX_HEIGHT];
    let mut succs = [Shared::null(); MAX_HEIGHT];
    let backoff = Backoff::new();

    loop {
      if let Some(level) = self.find_node(&key, &mut preds, &mut succs, guard) {
        // Safety: a found successor is non-null.
        let n = unsafe { succs[level].deref() };
        if !n.is_marked() {
          // An insert of this key is completing; wait for the tower to be
          // fully published before touching the value cell.
          while !n.is_fully_linked() {
            backoff.snooze();
          }
          // A removal may have claimed the node while we waited. Marking is
          // its linearization point, so the value cell is off limits.
          if n.is_marked() {
            backoff.spin();
            continue;
          }

          let value_ref = if replace {
            let new = Owned::new((value.take().unwrap())()).into_shared(guard);
            let old = n.value.swap(new, Ordering::AcqRel, guard);
            // Safety: readers of the previous value are pinned; defer until
            // their epochs pass.
            unsafe {
              guard.defer_destroy(old);
            }
            unsafe { new.deref() }
          } else {
            unsafe { n.value.load(Ordering::Acquire, guard).deref() }
          };
          return (value_ref, true);
        }
        // The mapping is marked; retry once the removal unlinks it.
        backoff.spin();
        continue;
      }

      // Lock the unique predecessors in ascending level order, then check
      // that the splice still holds.
      let mut locks = Vec::with_capacity(height);
      let mut prev_pred = Shared::null();
      let mut valid = true;
      for level in 0..height {
        let pred = preds[level];
        let succ = succs[level];
        if pred != prev_pred {
          // Safety: preds are the head or nodes observed under the guard.
          locks.push(sync::lock(&unsafe { pred.deref() }.mu));
          prev_pred = pred;
        }
        let p = unsafe { pred.deref() };
        valid = !p.is_marked()
          && unsafe { succ.as_ref() }.map_or(true, |s| !s.is_marked())
          && p.tower(level).load(Ordering::Acquire, guard) == succ;
        if !valid {
          break;
        }
      }
      if !valid {
        drop(locks);
        backoff.spin();
        continue;
      }

      let node = Owned::new(Node::new(key, (value.take().unwrap())(), height)).into_shared(guard);
      // Safety: freshly allocated, not yet published.
      let n = unsafe { node.deref() };
      let value_ref = unsafe { n.value.load(Ordering::Relaxed, guard).deref() };

      for level in 0..height {
        n.tower(level).store(succs[level], Ordering::Relaxed);
        // Publishing the level-0 link is the linearization point of the
        // insert.
        unsafe { preds[level].deref() }
          .tower(level)
          .store(node, Ordering::Release);
      }
      n.set_fully_linked();
      self.len.fetch_add(1, Ordering::SeqCst);
      drop(locks);
      return (value_ref, false);
    }
  }

  /// Removes the mapping for `key` and returns its value, or `None` if the
  /// key was absent at the linearization point of the removal.
  ///
  /// Under contention, exactly one caller observes `Some` for a given
  /// mapping.
  pub fn remove(&self, key: &K) -> Option<V>
  where
    V: Clone,
  {
    let guard = &epoch::pin();
    let mut preds = [Shared::null(); MAX_HEIGHT];
    let mut succs = [Shared::null(); MAX_HEIGHT];
    let backoff = Backoff::new();

    let mut victim = Shared::null();
    let mut victim_lock = None;
    let mut height = 0;

    loop {
      let found = self.find_node(key, &mut preds, &mut succs, guard);

      if victim_lock.is_none() {
        let level = found?;
        let candidate = succs[level];
        // Safety: a found successor is non-null.
        let c = unsafe { candidate.deref() };
        if !c.is_live() {
          // Still linking, or another removal already claimed it.
          return None;
        }
        height = c.height();
        let mu = sync::lock(&c.mu);
        if c.is_marked() {
          // Lost the claim; the other removal unlinks it.
          return None;
        }
        // Marking under the victim's own lock is the linearization point
        // of the removal.
        c.set_marked();
        victim = candidate;
        victim_lock = Some(mu);
      }

      // Safety: the victim stays linked until this call unlinks it, and the
      // guard keeps it alive beyond that.
      let v = unsafe { victim.deref() };
      let mut locks = Vec::with_capacity(height);
      let mut prev_pred = Shared::null();
      let mut valid = true;
      for level in 0..height {
        let pred = preds[level];
        if pred != prev_pred {
          locks.push(sync::lock(&unsafe { pred.deref() }.mu));
          prev_pred = pred;
        }
        let p = unsafe { pred.deref() };
        valid = !p.is_marked() && p.tower(level).load(Ordering::Acquire, guard) == victim;
        if !valid {
          break;
        }
      }
      if !valid {
        // Keep the victim claimed; only the predecessor set is stale.
        drop(locks);
        backoff.spin();
        continue;
      }

      let value = unsafe { v.value.load(Ordering::Acquire, guard).deref() }.clone();
      for level in (0..height).rev() {
        // The victim's own lock is held, so its tower is stable; only the
        // predecessor stores need release ordering for concurrent readers.
        let next = v.tower(level).load(Ordering::Relaxed, guard);
        unsafe { preds[level].deref() }
          .tower(level)
          .store(next, Ordering::Release);
      }
      self.len.fetch_sub(1, Ordering::SeqCst);
      drop(locks);
      drop(victim_lock.take());
      // Safety: unlinked at every level; pinned readers keep it alive until
      // their epochs pass.
      unsafe {
        guard.defer_destroy(victim);
      }
      return Some(value);
    }
  }

  /// Visits every live entry in comparator order until `f` returns false.
  ///
  /// Entries present for the whole traversal are visited exactly once; no
  /// entry is visited twice. Entries inserted or removed concurrently may
  /// or may not be observed. No lock is held across visitor calls, and the
  /// visitor is free to mutate the map, including the entry it is looking
  /// at.
  ///
  /// # Examples
  ///
  /// ```
  /// use skipmap::SkipMap;
  ///
  /// let m = SkipMap::new();
  /// m.insert(2, 'b');
  /// m.insert(1, 'a');
  ///
  /// let mut pairs = Vec::new();
  /// m.range(|k, v| {
  ///   pairs.push((*k, *v));
  ///   true
  /// });
  /// assert_eq!(pairs, [(1, 'a'), (2, 'b')]);
  /// ```
  pub fn range<F>(&self, mut f: F)
  where
    F: FnMut(&K, &V) -> bool,
  {
    let guard = &epoch::pin();
    // Safety: the head sentinel lives as long as the map.
    let mut curr = unsafe { self.head_shared().deref() }
      .tower(0)
      .load(Ordering::Acquire, guard);

    while let Some(n) = unsafe { curr.as_ref() } {
      if !n.is_live() {
        curr = n.tower(0).load(Ordering::Acquire, guard);
        continue;
      }
      let value = n.value.load(Ordering::Acquire, guard);
      // Safety: live nodes carry a non-null value; the guard keeps both the
      // node and a concurrently replaced value alive.
      if !f(n.key(), unsafe { value.deref() }) {
        return;
      }
      curr = n.tower(0).load(Ordering::Acquire, guard);
    }
  }
}

impl<K, V, C: Default> Default for SkipMap<K, V, C> {
  fn default() -> Self {
    Self::with_comparator(C::default())
  }
}

impl<K, V, C> fmt::Debug for SkipMap<K, V, C> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("SkipMap")
      .field("len", &self.len())
      .field("height", &self.height())
      .finish_non_exhaustive()
  }
}

impl<K, V, C> Drop for SkipMap<K, V, C> {
  fn drop(&mut self) {
    // Safety: exclusive access; walk the level-0 chain and free everything
    // without pinning.
    unsafe {
      let guard = epoch::unprotected();
      let mut curr = self
        .head_shared()
        .deref()
        .tower(0)
        .load(Ordering::Relaxed, guard);
      while let Some(n) = curr.as_ref() {
        let next = n.tower(0).load(Ordering::Relaxed, guard);
        drop(curr.into_owned());
        curr = next;
      }
      drop(Box::from_raw(self.head.as_ptr()));
    }
  }
}
