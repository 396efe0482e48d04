//! Lock-free LIFO stack (Treiber), intrusive core plus a value adapter.
//!
//! The intrusive [`IntrusiveStack`] links caller-owned items through a
//! [`StackNode`] embedded in each item; it never allocates. [`Stack`] is the
//! non-intrusive convenience layer that boxes arbitrary values into nodes of
//! its own and is the recommended entry point for message passing.
//!
//! # Real-time safety
//!
//! Push and pop are single-CAS retry loops on one head slot. They never take
//! a lock, never make a system call and never wait on another thread, so they
//! are safe to call from an audio callback. Progress is lock-free, not
//! wait-free: under contention an individual call may retry, but some call
//! always completes.
//!
//! # ABA caveat
//!
//! The classic Treiber pop reads `head` and `head.next` and then swings
//! `head` with a plain pointer CAS. If another thread pops the same node,
//! frees it, and its memory is reused for a node pushed back at the same
//! address, the stale CAS can succeed against the wrong chain. The intrusive
//! stack therefore requires that a popped item is not freed and re-pushed
//! while any other thread may still be inside a `pop` that observed it; the
//! caller owns node lifetimes and must provide that guarantee (for example by
//! recycling nodes through a quiescent period, or by having a single
//! consumer). This is a documented assumption, not something the stack works
//! around internally - the FIFO in [`crate::fifo`] is the structure that
//! carries its own ABA defense.

use std::marker::PhantomData;
use std::ptr::{self, NonNull};

use crossbeam::utils::Backoff;

use crate::sync::{AtomicPtr, Ordering};

/// The embeddable link for [`IntrusiveStack`] items.
///
/// Each item carries exactly one of these. While the item is linked into a
/// stack the node's `next` field belongs to the stack's CAS protocol and must
/// not be touched; after `pop` hands the item back, the node is cleared and
/// the item may be relinked.
pub struct StackNode {
    // Type-erased: holds a `*mut T` of whichever stack the item is linked
    // into. Null when unlinked (and, ambiguously, for the bottom element).
    next: AtomicPtr<()>,
}

impl StackNode {
    /// A fresh, unlinked node. `const` so intrusive items can live in
    /// statics.
    #[cfg(not(loom))]
    pub const fn new() -> Self {
        Self {
            next: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// A fresh, unlinked node. Loom's atomics cannot be built in const
    /// context, so the model-checking build loses the `const`.
    #[cfg(loom)]
    pub fn new() -> Self {
        Self {
            next: AtomicPtr::new(ptr::null_mut()),
        }
    }

    fn is_linked(&self) -> bool {
        !self.next.load(Ordering::Relaxed).is_null()
    }
}

impl Default for StackNode {
    fn default() -> Self {
        Self::new()
    }
}

/// Access to the [`StackNode`] embedded in an item.
///
/// # Safety
///
/// Implementations must return a reference to the *same* node embedded in
/// `self` on every call. Returning a different node, or one shared between
/// items, breaks the linkage invariants and the stack's memory safety.
pub unsafe trait StackItem {
    /// The item's embedded link.
    fn stack_node(&self) -> &StackNode;
}

/// Intrusive lock-free LIFO stack over caller-owned items.
///
/// The stack stores raw item pointers and performs no allocation; ownership
/// of an item transfers to the stack at `push` and back to the caller at
/// `pop`, carried by the CAS that links or unlinks it. An item must be in at
/// most one structure at a time and must outlive its linkage.
pub struct IntrusiveStack<T> {
    head: AtomicPtr<T>,
    _marker: PhantomData<*mut T>,
}

// Items are handed across threads by pointer, so this is exactly as
// thread-safe as sending `T` itself.
unsafe impl<T: Send> Send for IntrusiveStack<T> {}
unsafe impl<T: Send> Sync for IntrusiveStack<T> {}

impl<T: StackItem> IntrusiveStack<T> {
    /// A new, empty stack.
    pub fn new() -> Self {
        Self {
            head: AtomicPtr::new(ptr::null_mut()),
            _marker: PhantomData,
        }
    }

    /// Snapshot emptiness check.
    ///
    /// Concurrent pushes and pops may invalidate the answer before it is
    /// returned; use it for diagnostics, never for mutual-exclusion
    /// decisions.
    pub fn is_empty(&self) -> bool {
        self.head.load(Ordering::SeqCst).is_null()
    }

    /// Push an item, transferring its ownership to the stack.
    ///
    /// # Safety
    ///
    /// `item` must point to a live item that is not currently linked into
    /// any structure, and it must stay valid until a `pop` returns it.
    pub unsafe fn push(&self, item: NonNull<T>) {
        let node = unsafe { item.as_ref() }.stack_node();
        debug_assert!(!node.is_linked(), "item is already linked into a stack");

        let backoff = Backoff::new();
        loop {
            let current = self.head.load(Ordering::SeqCst);
            node.next.store(current.cast(), Ordering::SeqCst);
            if self
                .head
                .compare_exchange_weak(current, item.as_ptr(), Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return;
            }
            backoff.spin();
        }
    }

    /// Pop the most recently pushed item, transferring its ownership back to
    /// the caller.
    ///
    /// Returns `None` if the stack is empty - a normal outcome, not an
    /// error. The returned item's node is cleared, so it may immediately be
    /// relinked (subject to the module-level ABA caveat).
    pub fn pop(&self) -> Option<NonNull<T>> {
        let backoff = Backoff::new();
        loop {
            let node = NonNull::new(self.head.load(Ordering::SeqCst))?;
            // The push contract keeps `node` alive while it is reachable
            // from `head`; see the module docs for the reuse caveat.
            let next = unsafe { node.as_ref() }
                .stack_node()
                .next
                .load(Ordering::SeqCst)
                .cast::<T>();
            if self
                .head
                .compare_exchange_weak(node.as_ptr(), next, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                // Unlink fully so the item can be pushed again elsewhere.
                unsafe { node.as_ref() }
                    .stack_node()
                    .next
                    .store(ptr::null_mut(), Ordering::SeqCst);
                return Some(node);
            }
            backoff.spin();
        }
    }
}

impl<T: StackItem> Default for IntrusiveStack<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for IntrusiveStack<T> {
    fn drop(&mut self) {
        // Linked items are caller-owned; dropping a non-empty intrusive
        // stack would strand them.
        debug_assert!(
            self.head.load(Ordering::Relaxed).is_null(),
            "intrusive stack dropped while items are still linked"
        );
    }
}

/// Heap node used by the non-intrusive [`Stack`].
struct StackValueNode<T> {
    node: StackNode,
    value: T,
}

unsafe impl<T> StackItem for StackValueNode<T> {
    fn stack_node(&self) -> &StackNode {
        &self.node
    }
}

/// Non-intrusive lock-free LIFO stack of owned values.
///
/// Each `push` boxes the value into a private node and each `pop` frees it
/// again, so callers deal only in values. The concurrency protocol is the
/// intrusive stack's, caveats included.
///
/// Dropping the stack drains and frees whatever is left; destroying it while
/// other threads still have calls in flight is a usage error the structure
/// cannot detect (teardown synchronization belongs to the owner, typically
/// the control thread of an audio host).
pub struct Stack<T> {
    inner: IntrusiveStack<StackValueNode<T>>,
}

impl<T> Stack<T> {
    /// A new, empty stack.
    pub fn new() -> Self {
        Self {
            inner: IntrusiveStack::new(),
        }
    }

    /// Snapshot emptiness check; same advisory semantics as
    /// [`IntrusiveStack::is_empty`].
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Push a value.
    pub fn push(&self, value: T) {
        let node = Box::into_raw(Box::new(StackValueNode {
            node: StackNode::new(),
            value,
        }));
        // Freshly boxed: unlinked, valid until the matching pop frees it.
        unsafe { self.inner.push(NonNull::new_unchecked(node)) };
    }

    /// Pop the most recently pushed value, or `None` when empty.
    pub fn pop(&self) -> Option<T> {
        let node = self.inner.pop()?;
        let boxed = unsafe { Box::from_raw(node.as_ptr()) };
        Some(boxed.value)
    }
}

impl<T> Default for Stack<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for Stack<T> {
    fn drop(&mut self) {
        let mut drained = 0usize;
        while self.pop().is_some() {
            drained += 1;
        }
        if drained > 0 {
            log::trace!("stack dropped with {drained} unconsumed values");
        }
    }
}


#[cfg(all(test, loom))]
mod loom_tests {
    use super::*;
    use loom::sync::Arc;
    use loom::thread;

    #[test]
    fn concurrent_pushes_are_all_observed() {
        loom::model(|| {
            let stack = Arc::new(Stack::new());

            let handles: Vec<_> = (0..2)
                .map(|n| {
                    let stack = Arc::clone(&stack);
                    thread::spawn(move || stack.push(n))
                })
                .collect();
            for handle in handles {
                handle.join().unwrap();
            }

            let mut drained = vec![stack.pop().unwrap(), stack.pop().unwrap()];
            drained.sort_unstable();
            assert_eq!(drained, vec![0, 1]);
            assert_eq!(stack.pop(), None);
        });
    }

    #[test]
    fn push_races_pop_without_losing_values() {
        loom::model(|| {
            let stack = Arc::new(Stack::new());
            stack.push(1u32);

            let pusher = {
                let stack = Arc::clone(&stack);
                thread::spawn(move || stack.push(2))
            };
            let popped = stack.pop();
            pusher.join().unwrap();

            // Whatever the interleaving, exactly one value was taken and
            // exactly one remains.
            let popped = popped.expect("stack held at least one value");
            let rest = stack.pop().expect("the other value is still linked");
            let mut all = vec![popped, rest];
            all.sort_unstable();
            assert_eq!(all, vec![1, 2]);
            assert_eq!(stack.pop(), None);
        });
    }
}
