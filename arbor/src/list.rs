//! A doubly-linked list with O(1) insertion and removal through [`Link`]
//! handles.
//!
//! Entries live in a slab and carry a stamp drawn from a process-wide counter,
//! so a link that outlived its entry (or points into a different list) is
//! rejected instead of removing an unrelated entry. Every wait queue and every
//! children list in the crate is built on this type.
use slab::Slab;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Handle to an entry of a [`List`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Link {
    key: usize,
    stamp: u64,
}

/// Returned when removing an entry that is not linked into the list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("entry is not linked into this list")]
pub struct Unlinked;

struct Entry<T> {
    value: T,
    stamp: u64,
    prev: Option<usize>,
    next: Option<usize>,
}

pub struct List<T> {
    entries: Slab<Entry<T>>,
    head: Option<usize>,
    tail: Option<usize>,
}

fn next_stamp() -> u64 {
    static STAMP: AtomicU64 = AtomicU64::new(1);
    STAMP.fetch_add(1, Ordering::Relaxed)
}

impl<T> Default for List<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> List<T> {
    pub const fn new() -> Self {
        Self {
            entries: Slab::new(),
            head: None,
            tail: None,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn push_back(&mut self, value: T) -> Link {
        let stamp = next_stamp();
        let key = self.entries.insert(Entry {
            value,
            stamp,
            prev: self.tail,
            next: None,
        });

        match self.tail {
            Some(tail) => self.entries[tail].next = Some(key),
            None => self.head = Some(key),
        }
        self.tail = Some(key);

        Link { key, stamp }
    }

    pub fn contains(&self, link: Link) -> bool {
        self.entries
            .get(link.key)
            .is_some_and(|entry| entry.stamp == link.stamp)
    }

    pub fn get(&self, link: Link) -> Option<&T> {
        self.entries
            .get(link.key)
            .filter(|entry| entry.stamp == link.stamp)
            .map(|entry| &entry.value)
    }

    /// Unlinks the entry in O(1).
    pub fn remove(&mut self, link: Link) -> Result<T, Unlinked> {
        if !self.contains(link) {
            return Err(Unlinked);
        }

        let entry = self.entries.remove(link.key);
        match entry.prev {
            Some(prev) => self.entries[prev].next = entry.next,
            None => self.head = entry.next,
        }
        match entry.next {
            Some(next) => self.entries[next].prev = entry.prev,
            None => self.tail = entry.prev,
        }

        Ok(entry.value)
    }

    pub fn front(&self) -> Option<&T> {
        self.head.map(|key| &self.entries[key].value)
    }

    pub fn pop_front(&mut self) -> Option<T> {
        let key = self.head?;
        let stamp = self.entries[key].stamp;
        self.remove(Link { key, stamp }).ok()
    }

    /// Snapshot of the links in list order.
    ///
    /// Walking the snapshot with [`List::get`] tolerates removal of the
    /// current or any later entry while iterating: removed links simply stop
    /// resolving.
    pub fn links(&self) -> Vec<Link> {
        let mut links = Vec::with_capacity(self.len());
        let mut cursor = self.head;
        while let Some(key) = cursor {
            let entry = &self.entries[key];
            links.push(Link {
                key,
                stamp: entry.stamp,
            });
            cursor = entry.next;
        }
        links
    }

    pub fn iter(&self) -> Iter<'_, T> {
        Iter {
            list: self,
            cursor: self.head,
        }
    }

    /// Swaps out every entry, leaving the list empty.
    pub fn take(&mut self) -> Self {
        std::mem::take(self)
    }
}

impl<T> IntoIterator for List<T> {
    type Item = T;
    type IntoIter = IntoIter<T>;

    fn into_iter(self) -> Self::IntoIter {
        IntoIter { list: self }
    }
}

pub struct Iter<'a, T> {
    list: &'a List<T>,
    cursor: Option<usize>,
}

impl<'a, T> Iterator for Iter<'a, T> {
    type Item = &'a T;

    fn next(&mut self) -> Option<Self::Item> {
        let entry = &self.list.entries[self.cursor?];
        self.cursor = entry.next;
        Some(&entry.value)
    }
}

pub struct IntoIter<T> {
    list: List<T>,
}

impl<T> Iterator for IntoIter<T> {
    type Item = T;

    fn next(&mut self) -> Option<Self::Item> {
        self.list.pop_front()
    }
}

impl<T: fmt::Debug> fmt::Debug for List<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.iter()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(list: &List<u32>) -> Vec<u32> {
        list.iter().copied().collect()
    }

    #[test]
    fn test_push_back_keeps_insertion_order() {
        let mut list = List::new();
        for i in 0..5 {
            list.push_back(i);
        }

        assert_eq!(collect(&list), vec![0, 1, 2, 3, 4]);
        assert_eq!(list.front(), Some(&0));
        assert_eq!(list.len(), 5);
    }

    #[test]
    fn test_remove_head_middle_and_tail() {
        let mut list = List::new();
        let links: Vec<_> = (0..5).map(|i| list.push_back(i)).collect();

        assert_eq!(list.remove(links[2]), Ok(2));
        assert_eq!(list.remove(links[0]), Ok(0));
        assert_eq!(list.remove(links[4]), Ok(4));
        assert_eq!(collect(&list), vec![1, 3]);

        list.push_back(5);
        assert_eq!(collect(&list), vec![1, 3, 5]);
    }

    #[test]
    fn test_remove_unlinked_is_an_error() {
        let mut list = List::new();
        let link = list.push_back(1);

        assert_eq!(list.remove(link), Ok(1));
        assert_eq!(list.remove(link), Err(Unlinked));

        // The slab slot gets reused, the stale link must not match it.
        let fresh = list.push_back(2);
        assert_ne!(fresh, link);
        assert_eq!(list.remove(link), Err(Unlinked));
        assert_eq!(collect(&list), vec![2]);
    }

    #[test]
    fn test_link_from_other_list_is_rejected() {
        let mut a = List::new();
        let mut b = List::new();
        let link = a.push_back(1);
        b.push_back(1);

        assert_eq!(b.remove(link), Err(Unlinked));
        assert_eq!(b.len(), 1);
    }

    #[test]
    fn test_iteration_tolerates_removal() {
        let mut list = List::new();
        let links: Vec<_> = (0..6).map(|i| list.push_back(i)).collect();

        let mut seen = Vec::new();
        for link in list.links() {
            let Some(&value) = list.get(link) else {
                continue;
            };
            seen.push(value);

            // Remove the current entry and the one after next.
            list.remove(link).unwrap();
            if let Some(later) = links.get(value as usize + 2) {
                let _ = list.remove(*later);
            }
        }

        assert_eq!(seen, vec![0, 1, 4, 5]);
        assert!(list.is_empty());
    }

    #[test]
    fn test_take_leaves_empty_list() {
        let mut list = List::new();
        let link = list.push_back(7);

        let taken = list.take();
        assert!(list.is_empty());
        assert_eq!(list.remove(link), Err(Unlinked));
        assert_eq!(taken.into_iter().collect::<Vec<_>>(), vec![7]);
    }
}
