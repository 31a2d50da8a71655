//! Binary heap with a contextful comparator and position tracking
//!
//! Unlike the standard library's `BinaryHeap`, the heap operations are
//! provided on any [`VecLike`] storage and report every element move to the
//! context, so that the owners of the elements can remember where each
//! element currently is and remove it later in logarithmic time.
mod veclike;
pub use self::veclike::*;

/// Context type for [`BinaryHeap`]'s operations.
pub trait BinaryHeapCtx<Element> {
    /// Return `true` iff `x < y`.
    fn lt(&mut self, x: &Element, y: &Element) -> bool;

    /// Called when the element `e` is moved to the new position `new_index`.
    fn on_move(&mut self, e: &mut Element, new_index: usize) {
        let _ = (e, new_index);
    }
}

impl<T: Ord> BinaryHeapCtx<T> for () {
    fn lt(&mut self, x: &T, y: &T) -> bool {
        *x < *y
    }
}

/// Min-heap.
pub trait BinaryHeap: VecLike {
    /// Remove the least item from the heap and return it.
    #[cfg(test)]
    fn heap_pop(&mut self, ctx: impl BinaryHeapCtx<Self::Element>) -> Option<Self::Element>;

    /// Remove the item at the specified position and return it.
    fn heap_remove(
        &mut self,
        i: usize,
        ctx: impl BinaryHeapCtx<Self::Element>,
    ) -> Option<Self::Element>;

    /// Push an item onto the heap and return its position.
    fn heap_push(&mut self, item: Self::Element, ctx: impl BinaryHeapCtx<Self::Element>) -> usize;
}

impl<T: VecLike> BinaryHeap for T {
    #[cfg(test)]
    fn heap_pop(&mut self, ctx: impl BinaryHeapCtx<Self::Element>) -> Option<Self::Element> {
        self.heap_remove(0, ctx)
    }

    fn heap_remove(
        &mut self,
        i: usize,
        mut ctx: impl BinaryHeapCtx<Self::Element>,
    ) -> Option<Self::Element> {
        if i >= self.len() {
            return None;
        }

        let mut item = self.pop()?;
        let slice = &mut **self;
        if i < slice.len() {
            // Swap the last item with the item at `i`
            core::mem::swap(&mut slice[i], &mut item);
            ctx.on_move(&mut slice[i], i);

            // Sift down or up the item at `i`, restoring the invariant
            if i > 0 && ctx.lt(&slice[i], &slice[(i - 1) / 2]) {
                sift_up(slice, i, &mut ctx);
            } else {
                sift_down(slice, i, &mut ctx);
            }
        }
        Some(item)
    }

    fn heap_push(&mut self, item: Self::Element, mut ctx: impl BinaryHeapCtx<Self::Element>) -> usize {
        let i = self.len();
        self.push(item);

        let slice = &mut **self;
        assert!(i < slice.len());
        ctx.on_move(&mut slice[i], i);

        sift_up(slice, i, &mut ctx)
    }
}

/// Move the element at `pos` up the heap while it's less than its parent.
/// Returns the final position of the element.
fn sift_up<Element>(
    this: &mut [Element],
    mut pos: usize,
    ctx: &mut impl BinaryHeapCtx<Element>,
) -> usize {
    while pos > 0 {
        let parent = (pos - 1) / 2;
        if !ctx.lt(&this[pos], &this[parent]) {
            break;
        }

        this.swap(pos, parent);

        // `[pos]` is now filled with the element moved from `[parent]`
        ctx.on_move(&mut this[pos], pos);
        ctx.on_move(&mut this[parent], parent);
        pos = parent;
    }
    pos
}

/// Move the element at `pos` down the heap while its children are less.
fn sift_down<Element>(this: &mut [Element], mut pos: usize, ctx: &mut impl BinaryHeapCtx<Element>) {
    let end = this.len();
    loop {
        let mut child = 2 * pos + 1;
        if child >= end {
            break;
        }

        // compare with the lesser of the two children
        let right = child + 1;
        if right < end && !ctx.lt(&this[child], &this[right]) {
            child = right;
        }

        // if we are already in order, stop.
        if !ctx.lt(&this[child], &this[pos]) {
            break;
        }

        this.swap(pos, child);
        ctx.on_move(&mut this[pos], pos);
        ctx.on_move(&mut this[child], child);
        pos = child;
    }
}
