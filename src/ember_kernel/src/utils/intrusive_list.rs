//! Arena-indexed intrusive doubly linked list
//!
//! The links are stored in the elements of an arena (e.g., the TCB table) and
//! refer to other elements by index. A [`ListHead`] is a plain `Copy` value,
//! so it can be kept anywhere (in the arena, in a kernel object, or on the
//! stack while it's being manipulated).
use core::fmt;

/// Link fields embedded in a list element.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Link<Index> {
    pub prev: Option<Index>,
    pub next: Option<Index>,
}

impl<Index> Link<Index> {
    pub const fn new() -> Self {
        Self {
            prev: None,
            next: None,
        }
    }
}

impl<Index> Default for Link<Index> {
    fn default() -> Self {
        Self::new()
    }
}

impl<Index: fmt::Debug> fmt::Debug for Link<Index> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Link({:?} <- -> {:?})", self.prev, self.next)
    }
}

/// Provides access to the [`Link`] of each element of an arena.
pub trait LinkArena<Index> {
    fn link(&self, i: Index) -> &Link<Index>;
    fn link_mut(&mut self, i: Index) -> &mut Link<Index>;
}

/// The head of a list.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct ListHead<Index> {
    pub first: Option<Index>,
    pub last: Option<Index>,
}

impl<Index> ListHead<Index> {
    pub const fn new() -> Self {
        Self {
            first: None,
            last: None,
        }
    }
}

impl<Index> Default for ListHead<Index> {
    fn default() -> Self {
        Self::new()
    }
}

impl<Index: fmt::Debug> fmt::Debug for ListHead<Index> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "ListHead({:?} ..= {:?})", self.first, self.last)
    }
}

impl<Index: Copy + PartialEq> ListHead<Index> {
    pub fn is_empty(&self) -> bool {
        self.first.is_none()
    }

    /// Insert `item` before `at`. If `at` is `None`, `item` is appended to
    /// the end of the list.
    ///
    /// `item` must not be linked to any list.
    pub fn insert_before(
        &mut self,
        arena: &mut impl LinkArena<Index>,
        item: Index,
        at: Option<Index>,
    ) {
        debug_assert!(*arena.link(item) == Link::new() && self.first != Some(item));

        let prev = match at {
            Some(at) => arena.link(at).prev,
            None => self.last,
        };

        *arena.link_mut(item) = Link { prev, next: at };

        match prev {
            Some(prev) => arena.link_mut(prev).next = Some(item),
            None => self.first = Some(item),
        }
        match at {
            Some(at) => arena.link_mut(at).prev = Some(item),
            None => self.last = Some(item),
        }
    }

    /// Append `item` to the end of the list.
    pub fn push_back(&mut self, arena: &mut impl LinkArena<Index>, item: Index) {
        self.insert_before(arena, item, None);
    }

    /// Unlink `item` from the list. `item` must be a member of `self`.
    pub fn remove(&mut self, arena: &mut impl LinkArena<Index>, item: Index) {
        let Link { prev, next } = core::mem::take(arena.link_mut(item));

        match prev {
            Some(prev) => arena.link_mut(prev).next = next,
            None => {
                debug_assert!(self.first == Some(item));
                self.first = next;
            }
        }
        match next {
            Some(next) => arena.link_mut(next).prev = prev,
            None => {
                debug_assert!(self.last == Some(item));
                self.last = prev;
            }
        }
    }

    /// Remove the first element and return it.
    pub fn pop_front(&mut self, arena: &mut impl LinkArena<Index>) -> Option<Index> {
        let first = self.first?;
        self.remove(arena, first);
        Some(first)
    }

    /// Iterate over the elements of the list, from front to back.
    pub fn iter<'a, A: LinkArena<Index>>(&self, arena: &'a A) -> Iter<'a, Index, A> {
        Iter {
            arena,
            next: self.first,
        }
    }
}

/// Iterator returned by [`ListHead::iter`].
pub struct Iter<'a, Index, A> {
    arena: &'a A,
    next: Option<Index>,
}

impl<Index: Copy, A: LinkArena<Index>> Iterator for Iter<'_, Index, A> {
    type Item = Index;

    fn next(&mut self) -> Option<Self::Item> {
        let cur = self.next?;
        self.next = self.arena.link(cur).next;
        Some(cur)
    }
}
