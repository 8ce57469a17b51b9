//! Erase-safe dispatch lists.
//!
//! A [`DispatchList`] keeps subjects in registration order and tolerates
//! removal while it is being walked: removals during a walk leave a tombstone
//! so indices stay stable, and the list is compacted once the outermost walk
//! finishes. Entries pushed during a walk are not visited until the next walk.
//!
//! Lists live behind a `RefCell` and are walked with [`walk`], which never
//! holds a borrow while the visitor runs. The visitor is therefore free to
//! register or unregister subjects on the same list.

use std::cell::RefCell;

/// An ordered list of subjects that can be mutated while it is walked.
#[derive(Debug)]
pub struct DispatchList<T> {
    /// Entries in registration order; `None` marks a tombstone.
    entries: Vec<Option<T>>,
    /// Number of live (non-tombstone) entries.
    live: usize,
    /// Number of walks currently in progress.
    walkers: usize,
}

impl<T> DispatchList<T> {
    /// Create an empty list.
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            live: 0,
            walkers: 0,
        }
    }

    /// Number of live entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.live
    }

    /// Returns `true` if there are no live entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Returns `true` if a walk is in progress.
    #[must_use]
    pub fn is_walking(&self) -> bool {
        self.walkers > 0
    }

    /// Returns `true` if removed entries are waiting for compaction.
    #[must_use]
    pub fn has_tombstones(&self) -> bool {
        self.entries.len() != self.live
    }

    /// Append an entry. It is visited from the next walk onwards.
    pub fn push(&mut self, item: T) {
        self.entries.push(Some(item));
        self.live += 1;
    }

    /// Remove the first live entry matching `pred`.
    ///
    /// Returns `true` if an entry was removed.
    pub fn remove_where(&mut self, mut pred: impl FnMut(&T) -> bool) -> bool {
        let Some(index) = self
            .entries
            .iter()
            .position(|entry| entry.as_ref().is_some_and(&mut pred))
        else {
            return false;
        };

        if self.walkers > 0 {
            self.entries[index] = None;
        } else {
            self.entries.remove(index);
        }
        self.live -= 1;
        true
    }

    /// Returns `true` if a live entry matches `pred`.
    #[must_use]
    pub fn contains_where(&self, pred: impl FnMut(&T) -> bool) -> bool {
        self.iter().any(pred)
    }

    /// Remove every entry.
    pub fn clear(&mut self) {
        if self.walkers > 0 {
            self.entries.iter_mut().for_each(|entry| *entry = None);
        } else {
            self.entries.clear();
        }
        self.live = 0;
    }

    /// Iterate over live entries in registration order.
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.entries.iter().filter_map(Option::as_ref)
    }

    /// The entry at a raw walk index, or `None` for a tombstone or an index
    /// past the end.
    #[must_use]
    pub fn get(&self, index: usize) -> Option<&T> {
        self.entries.get(index).and_then(Option::as_ref)
    }

    /// Start a walk. Returns the number of raw slots the walk covers.
    pub fn begin_walk(&mut self) -> usize {
        self.walkers += 1;
        self.entries.len()
    }

    /// Finish a walk, compacting tombstones if no other walk is running.
    pub fn end_walk(&mut self) {
        self.walkers = self.walkers.saturating_sub(1);
        if self.walkers == 0 && self.has_tombstones() {
            self.entries.retain(Option::is_some);
        }
    }
}

impl<T: PartialEq> DispatchList<T> {
    /// Remove the first live entry equal to `item`.
    pub fn remove(&mut self, item: &T) -> bool {
        self.remove_where(|entry| entry == item)
    }

    /// Returns `true` if `item` is a live entry.
    #[must_use]
    pub fn contains(&self, item: &T) -> bool {
        self.contains_where(|entry| entry == item)
    }
}

impl<T> Default for DispatchList<T> {
    fn default() -> Self {
        Self::new()
    }
}

struct WalkGuard<'a, T> {
    list: &'a RefCell<DispatchList<T>>,
}

impl<T> Drop for WalkGuard<'_, T> {
    fn drop(&mut self) {
        if let Ok(mut list) = self.list.try_borrow_mut() {
            list.end_walk();
        }
    }
}

/// Visit every live entry present when the walk starts, in order.
///
/// The list is not borrowed while `visit` runs. An entry removed before the
/// walk reaches it is skipped; entries added during the walk are not visited.
/// The first error returned by `visit` stops the walk and is passed through.
///
/// # Errors
///
/// Returns whatever error `visit` returns.
pub fn walk<T: Clone, E>(
    list: &RefCell<DispatchList<T>>,
    mut visit: impl FnMut(T) -> Result<(), E>,
) -> Result<(), E> {
    let len = list.borrow_mut().begin_walk();
    let _guard = WalkGuard { list };
    for index in 0..len {
        let entry = list.borrow().get(index).cloned();
        if let Some(item) = entry {
            visit(item)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::convert::Infallible;

    use super::*;

    fn list_of(items: &[u32]) -> RefCell<DispatchList<u32>> {
        let mut list = DispatchList::new();
        for &item in items {
            list.push(item);
        }
        RefCell::new(list)
    }

    #[test]
    fn test_walk_in_registration_order() {
        let list = list_of(&[3, 1, 2]);
        let mut seen = Vec::new();
        walk(&list, |item| {
            seen.push(item);
            Ok::<_, Infallible>(())
        })
        .unwrap();
        assert_eq!(seen, vec![3, 1, 2]);
    }

    #[test]
    fn test_self_removal_during_walk() {
        let list = list_of(&[1, 2, 3, 4]);
        let mut seen = Vec::new();
        walk(&list, |item| {
            seen.push(item);
            if item == 2 {
                list.borrow_mut().remove(&2);
            }
            Ok::<_, Infallible>(())
        })
        .unwrap();
        assert_eq!(seen, vec![1, 2, 3, 4], "no other entry skipped or repeated");
        assert_eq!(list.borrow().len(), 3);
        assert!(!list.borrow().has_tombstones(), "compacted after the walk");
    }

    #[test]
    fn test_removal_of_later_entry_skips_it() {
        let list = list_of(&[1, 2, 3]);
        let mut seen = Vec::new();
        walk(&list, |item| {
            seen.push(item);
            if item == 1 {
                list.borrow_mut().remove(&3);
            }
            Ok::<_, Infallible>(())
        })
        .unwrap();
        assert_eq!(seen, vec![1, 2]);
    }

    #[test]
    fn test_push_during_walk_deferred() {
        let list = list_of(&[1]);
        let mut seen = Vec::new();
        walk(&list, |item| {
            seen.push(item);
            list.borrow_mut().push(item + 10);
            Ok::<_, Infallible>(())
        })
        .unwrap();
        assert_eq!(seen, vec![1]);
        assert_eq!(list.borrow().iter().copied().collect::<Vec<_>>(), vec![1, 11]);
    }

    #[test]
    fn test_remove_then_readd_not_visited_twice() {
        let list = list_of(&[1, 2]);
        let mut seen = Vec::new();
        walk(&list, |item| {
            seen.push(item);
            if item == 1 {
                let mut list = list.borrow_mut();
                list.remove(&1);
                list.push(1);
            }
            Ok::<_, Infallible>(())
        })
        .unwrap();
        assert_eq!(seen, vec![1, 2]);
        assert_eq!(list.borrow().iter().copied().collect::<Vec<_>>(), vec![2, 1]);
    }

    #[test]
    fn test_nested_walk_defers_compaction() {
        let list = list_of(&[1, 2, 3]);
        let mut outer = Vec::new();
        walk(&list, |item| {
            outer.push(item);
            if item == 1 {
                walk(&list, |inner| {
                    if inner == 2 {
                        list.borrow_mut().remove(&2);
                    }
                    Ok::<_, Infallible>(())
                })?;
                assert!(list.borrow().has_tombstones(), "outer walk still running");
            }
            Ok::<_, Infallible>(())
        })
        .unwrap();
        assert_eq!(outer, vec![1, 3]);
        assert!(!list.borrow().has_tombstones());
    }

    #[test]
    fn test_error_stops_walk() {
        let list = list_of(&[1, 2, 3]);
        let mut seen = Vec::new();
        let result = walk(&list, |item| {
            seen.push(item);
            if item == 2 { Err("boom") } else { Ok(()) }
        });
        assert_eq!(result, Err("boom"));
        assert_eq!(seen, vec![1, 2]);
        assert!(!list.borrow().is_walking());
    }

    #[test]
    fn test_clear_during_walk() {
        let list = list_of(&[1, 2, 3]);
        let mut seen = Vec::new();
        walk(&list, |item| {
            seen.push(item);
            list.borrow_mut().clear();
            Ok::<_, Infallible>(())
        })
        .unwrap();
        assert_eq!(seen, vec![1]);
        assert!(list.borrow().is_empty());
    }
}
