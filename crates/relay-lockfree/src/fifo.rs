//! Lock-free FIFO queue (Michael & Scott), intrusive core plus a value
//! adapter.
//!
//! The algorithm is the classic two-pointer queue from Michael & Scott,
//! "Simple, Fast, and Practical Non-Blocking and Blocking Concurrent Queue
//! Algorithms": a permanent sentinel node keeps the empty state regular, the
//! tail is allowed to lag one node behind the true end, and any thread that
//! notices the lag *helps* by advancing the tail before retrying its own
//! operation. Helping is what makes the queue lock-free: a stalled enqueuer
//! can never make anyone else wait, because the next thread through finishes
//! the linkage on its behalf.
//!
//! # Link records
//!
//! Items do not link to each other directly. Each item owns a small
//! heap-allocated *link record* (held by its embedded [`FifoNode`]), and the
//! queue chains link records. On dequeue the consumed sentinel record is
//! handed to the returned item as its new spare, while the item's old record
//! stays behind as the new sentinel. Records therefore circulate through the
//! queue for its whole lifetime, and the head/tail slots are [`TaggedAtomic`]
//! generation-tagged pointers so that a recirculated record reappearing at a
//! previously observed address can never satisfy a stale CAS (the ABA
//! problem; see [`crate::tagged`]).
//!
//! # Real-time safety
//!
//! Enqueue and dequeue are bounded CAS-retry loops with no locks and no
//! system calls, safe to run inside an audio callback. The intrusive core
//! never allocates; the [`Fifo`] value adapter allocates one node per
//! enqueue, so hosts that must not allocate on the callback thread should
//! enqueue from the control side or pre-box their payloads.
//!
//! # Reclamation caveat
//!
//! The generation tag makes a stale compare-and-swap *fail*; it does not stop
//! a stalled thread from still *reading* a record that another consumer has
//! dequeued and whose owning item has since been destroyed. An item (and
//! with it, its link record) must therefore not be destroyed while another
//! thread may still be inside an operation that observed it. With a single
//! consumer this holds trivially; multiple consumers that destroy dequeued
//! items immediately need an external quiescent period. This mirrors the
//! free-list assumption of the original algorithm and is a documented usage
//! contract, not a runtime-checked condition.

use std::cell::Cell;
use std::marker::PhantomData;
use std::ptr::{self, NonNull};

use crossbeam::utils::{Backoff, CachePadded};

use crate::sync::{AtomicPtr, Ordering};
use crate::tagged::TaggedAtomic;

/// A link record: one hop in the queue's internal chain.
struct Link {
    next: AtomicPtr<Link>,
    /// Back-pointer to the item whose payload this hop carries, type-erased.
    /// Written before the record is published by the enqueue CAS.
    item: AtomicPtr<()>,
}

impl Link {
    fn boxed() -> *mut Link {
        Box::into_raw(Box::new(Link {
            next: AtomicPtr::new(ptr::null_mut()),
            item: AtomicPtr::new(ptr::null_mut()),
        }))
    }
}

/// The embeddable handle for [`IntrusiveFifo`] items.
///
/// Owns one [`Link`] record at a time: the one allocated at construction
/// until the item is first dequeued, and the consumed sentinel it inherits
/// on every dequeue thereafter. The record it holds at destruction is freed
/// with it.
pub struct FifoNode {
    link: Cell<*mut Link>,
}

// The handle is a plain pointer cell; it moves between threads together with
// the item that owns it.
unsafe impl Send for FifoNode {}

impl FifoNode {
    /// A fresh handle with its own link record. Allocates.
    pub fn new() -> Self {
        Self {
            link: Cell::new(Link::boxed()),
        }
    }
}

impl Default for FifoNode {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for FifoNode {
    fn drop(&mut self) {
        // The item must be unlinked by now; while enqueued, the record
        // belongs to the queue's chain.
        unsafe { drop(Box::from_raw(self.link.get())) };
    }
}

/// Access to the [`FifoNode`] embedded in an item.
///
/// # Safety
///
/// Implementations must return a reference to the *same* node embedded in
/// `self` on every call; the queue stores the consumed sentinel through it
/// during dequeue.
pub unsafe trait FifoItem {
    /// The item's embedded handle.
    fn fifo_node(&self) -> &FifoNode;
}

/// Intrusive lock-free FIFO queue over caller-owned items.
///
/// Ownership of an item transfers to the queue at `enqueue` and back to the
/// caller at `dequeue`, carried by the CAS that links or unlinks its record.
/// An item must be in at most one structure at a time, must not be enqueued
/// twice concurrently, and must outlive its linkage (see the module-level
/// reclamation caveat).
pub struct IntrusiveFifo<T> {
    // Producers hammer `tail`, consumers hammer `head`; keep them on
    // separate cache lines.
    head: CachePadded<TaggedAtomic<Link>>,
    tail: CachePadded<TaggedAtomic<Link>>,
    _marker: PhantomData<*mut T>,
}

unsafe impl<T: Send> Send for IntrusiveFifo<T> {}
unsafe impl<T: Send> Sync for IntrusiveFifo<T> {}

impl<T: FifoItem> IntrusiveFifo<T> {
    /// A new, empty queue. Allocates the permanent sentinel record.
    pub fn new() -> Self {
        let sentinel = Link::boxed();
        Self {
            head: CachePadded::new(TaggedAtomic::new(sentinel)),
            tail: CachePadded::new(TaggedAtomic::new(sentinel)),
            _marker: PhantomData,
        }
    }

    /// Snapshot emptiness check.
    ///
    /// Compares two independently loaded slots, so the answer may be stale
    /// the moment it is computed and can transiently disagree with an
    /// in-flight enqueue whose tail swing is still pending. Diagnostics
    /// only; never gate a correctness decision on it.
    pub fn is_empty(&self) -> bool {
        self.head.load(Ordering::SeqCst).ptr() == self.tail.load(Ordering::SeqCst).ptr()
    }

    /// Append an item, transferring its ownership to the queue.
    ///
    /// # Safety
    ///
    /// `item` must point to a live item that is not currently linked into
    /// any structure, and it must stay valid until a `dequeue` returns it.
    pub unsafe fn enqueue(&self, item: NonNull<T>) {
        let link = unsafe { item.as_ref() }.fifo_node().link.get();
        // Prepare the record before it becomes reachable: it is the new end
        // of the chain and it carries this item's identity.
        unsafe {
            (*link).next.store(ptr::null_mut(), Ordering::SeqCst);
            (*link).item.store(item.as_ptr().cast(), Ordering::SeqCst);
        }

        let backoff = Backoff::new();
        loop {
            let tail = self.tail.load(Ordering::SeqCst);
            let next = unsafe { (*tail.ptr()).next.load(Ordering::SeqCst) };
            // The two loads above are not one atomic unit; only act on them
            // if the tail has not moved in between.
            if self.tail.load(Ordering::SeqCst) != tail {
                continue;
            }

            if next.is_null() {
                // `tail` really is the last record: splice behind it.
                if unsafe { &(*tail.ptr()).next }
                    .compare_exchange(ptr::null_mut(), link, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok()
                {
                    // Swing the tail. Failure is fine: another thread
                    // already helped it past us.
                    let _ = self.tail.compare_exchange(tail, link);
                    return;
                }
                backoff.spin();
            } else {
                // Tail lags one behind the true end: finish the other
                // thread's enqueue, then retry our own.
                let _ = self.tail.compare_exchange(tail, next);
            }
        }
    }

    /// Remove the oldest item, transferring its ownership back to the
    /// caller.
    ///
    /// Returns `None` if the queue is empty - a normal outcome, not an
    /// error. On success the consumed sentinel record is stored into the
    /// returned item's [`FifoNode`] as its new spare.
    pub fn dequeue(&self) -> Option<NonNull<T>> {
        let backoff = Backoff::new();
        loop {
            let head = self.head.load(Ordering::SeqCst);
            let tail = self.tail.load(Ordering::SeqCst);
            let next = unsafe { (*head.ptr()).next.load(Ordering::SeqCst) };
            if self.head.load(Ordering::SeqCst) != head {
                continue;
            }

            if head.ptr() == tail.ptr() {
                if next.is_null() {
                    // Sentinel is the whole chain: genuinely empty.
                    return None;
                }
                // Not empty, the tail just lags: help it forward and retry.
                let _ = self.tail.compare_exchange(tail, next);
            } else {
                // Capture the payload identity before the CAS; afterwards
                // another consumer could already be past us.
                let item = unsafe { (*next).item.load(Ordering::SeqCst) }.cast::<T>();
                if self.head.compare_exchange(head, next) {
                    // `next` stays behind as the new sentinel; the consumed
                    // one becomes the returned item's spare record.
                    let item = unsafe { NonNull::new_unchecked(item) };
                    unsafe { item.as_ref() }.fifo_node().link.set(head.ptr());
                    return Some(item);
                }
                backoff.spin();
            }
        }
    }
}

impl<T: FifoItem> Default for IntrusiveFifo<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for IntrusiveFifo<T> {
    fn drop(&mut self) {
        debug_assert!(
            self.head.load(Ordering::Relaxed).ptr() == self.tail.load(Ordering::Relaxed).ptr(),
            "intrusive fifo dropped while items are still linked"
        );
        // Only the sentinel belongs to the queue; every other record is
        // owned by the item it chains.
        unsafe { drop(Box::from_raw(self.head.load(Ordering::Relaxed).ptr())) };
    }
}

/// Heap node used by the non-intrusive [`Fifo`].
struct FifoValueNode<T> {
    node: FifoNode,
    value: T,
}

unsafe impl<T> FifoItem for FifoValueNode<T> {
    fn fifo_node(&self) -> &FifoNode {
        &self.node
    }
}

/// Non-intrusive lock-free FIFO queue of owned values.
///
/// The usual channel between an audio callback and a control thread: any
/// thread may `enqueue`, any thread may `dequeue`, neither ever blocks.
/// Each `enqueue` boxes the value into a private node and each `dequeue`
/// frees it again.
///
/// Dropping the queue drains and frees whatever is left; destroying it while
/// other threads still have calls in flight is a usage error the structure
/// cannot detect (teardown synchronization belongs to the owner).
pub struct Fifo<T> {
    inner: IntrusiveFifo<FifoValueNode<T>>,
}

impl<T> Fifo<T> {
    /// A new, empty queue.
    pub fn new() -> Self {
        Self {
            inner: IntrusiveFifo::new(),
        }
    }

    /// Snapshot emptiness check; same advisory semantics as
    /// [`IntrusiveFifo::is_empty`].
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Append a value.
    pub fn enqueue(&self, value: T) {
        let node = Box::into_raw(Box::new(FifoValueNode {
            node: FifoNode::new(),
            value,
        }));
        // Freshly boxed: unlinked, valid until the matching dequeue frees it.
        unsafe { self.inner.enqueue(NonNull::new_unchecked(node)) };
    }

    /// Remove the oldest value, or `None` when empty.
    pub fn dequeue(&self) -> Option<T> {
        let node = self.inner.dequeue()?;
        let boxed = unsafe { Box::from_raw(node.as_ptr()) };
        Some(boxed.value)
    }
}

impl<T> Default for Fifo<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for Fifo<T> {
    fn drop(&mut self) {
        let mut drained = 0usize;
        while self.dequeue().is_some() {
            drained += 1;
        }
        if drained > 0 {
            log::trace!("fifo dropped with {drained} unconsumed values");
        }
    }
}


#[cfg(all(test, loom))]
mod loom_tests {
    use super::*;
    use loom::sync::Arc;
    use loom::thread;

    #[test]
    fn concurrent_enqueues_are_all_observed() {
        loom::model(|| {
            let fifo = Arc::new(Fifo::new());

            let handles: Vec<_> = (0..2)
                .map(|n| {
                    let fifo = Arc::clone(&fifo);
                    thread::spawn(move || fifo.enqueue(n))
                })
                .collect();
            for handle in handles {
                handle.join().unwrap();
            }

            let mut drained = vec![fifo.dequeue().unwrap(), fifo.dequeue().unwrap()];
            drained.sort_unstable();
            assert_eq!(drained, vec![0, 1]);
            assert_eq!(fifo.dequeue(), None);
        });
    }

    #[test]
    fn enqueue_races_dequeue_without_losing_values() {
        loom::model(|| {
            let fifo = Arc::new(Fifo::new());
            fifo.enqueue(1u32);

            let producer = {
                let fifo = Arc::clone(&fifo);
                thread::spawn(move || fifo.enqueue(2))
            };
            let got = fifo.dequeue();
            producer.join().unwrap();

            // 1 was linked before the race, so the dequeue must see it.
            assert_eq!(got, Some(1));
            assert_eq!(fifo.dequeue(), Some(2));
            assert_eq!(fifo.dequeue(), None);
        });
    }
}
