//! Tagged atomic pointer: a (pointer, generation) pair updated as one unit.
//!
//! A plain pointer CAS cannot tell "nothing happened" apart from "the value
//! changed and changed back" - the ABA problem. If a node is unlinked, freed
//! and a fresh allocation lands at the same address, a thread still holding
//! the old pointer will CAS successfully against a structurally different
//! chain and corrupt it. [`TaggedAtomic`] defeats this by pairing the pointer
//! with a generation tag that is bumped on every successful swap: a stale
//! reader may see a matching address, but never a matching generation.
//!
//! # Representation
//!
//! Stable Rust offers no double-word compare-and-swap, so the pair is packed
//! into a single `AtomicU64`: the low 48 bits carry the address (the
//! canonical user-space width on x86_64 and aarch64), the high 16 bits carry
//! the generation. The generation wraps after 65 536 successful swaps, so an
//! ABA escape would need one thread to stall across a full wrap of the slot
//! while holding a pointer to memory that gets reused at the same address -
//! a vanishingly small window compared to the single-swap window of an
//! untagged pointer.

use std::fmt;
use std::marker::PhantomData;
use std::ptr;

use crate::sync::{AtomicU64, Ordering};

#[cfg(not(target_pointer_width = "64"))]
compile_error!("relay-lockfree packs (pointer, tag) into 64 bits and requires a 64-bit target");

const TAG_SHIFT: u32 = 48;
const ADDR_MASK: u64 = (1 << TAG_SHIFT) - 1;

/// A snapshot of a [`TaggedAtomic`] slot: a raw pointer plus the generation
/// it was observed at.
///
/// Equality compares *both* fields. Two snapshots of the same address taken
/// across an intervening mutation are distinct values, which is exactly what
/// makes a stale CAS fail.
pub struct TaggedPtr<T> {
    ptr: *mut T,
    tag: u16,
}

impl<T> TaggedPtr<T> {
    /// Pair `ptr` with an explicit generation.
    pub fn new(ptr: *mut T, tag: u16) -> Self {
        Self { ptr, tag }
    }

    /// The null pointer at generation zero.
    pub fn null() -> Self {
        Self::new(ptr::null_mut(), 0)
    }

    /// The raw pointer half of the pair.
    pub fn ptr(&self) -> *mut T {
        self.ptr
    }

    /// The generation half of the pair.
    pub fn tag(&self) -> u16 {
        self.tag
    }

    /// Whether the pointer half is null.
    pub fn is_null(&self) -> bool {
        self.ptr.is_null()
    }
}

// Manual impls: the derives would bound on `T`, but a snapshot is just a
// (pointer, tag) pair regardless of the pointee.
impl<T> Copy for TaggedPtr<T> {}

impl<T> Clone for TaggedPtr<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> PartialEq for TaggedPtr<T> {
    fn eq(&self, other: &Self) -> bool {
        self.ptr == other.ptr && self.tag == other.tag
    }
}

impl<T> Eq for TaggedPtr<T> {}

impl<T> fmt::Debug for TaggedPtr<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaggedPtr")
            .field("ptr", &self.ptr)
            .field("tag", &self.tag)
            .finish()
    }
}

/// An atomic (pointer, generation) slot.
///
/// The slot never blocks and has no failure mode of its own: a failed
/// [`compare_exchange`](TaggedAtomic::compare_exchange) simply reports that
/// the live value moved, and the caller re-reads and retries.
pub struct TaggedAtomic<T> {
    bits: AtomicU64,
    _marker: PhantomData<*mut T>,
}

// Like `AtomicPtr`, the slot itself is just a word; whatever synchronization
// the pointee needs is the owning structure's responsibility.
unsafe impl<T> Send for TaggedAtomic<T> {}
unsafe impl<T> Sync for TaggedAtomic<T> {}

impl<T> TaggedAtomic<T> {
    /// Create a slot holding `ptr` at generation zero.
    pub fn new(ptr: *mut T) -> Self {
        Self {
            bits: AtomicU64::new(pack(ptr, 0)),
            _marker: PhantomData,
        }
    }

    /// Atomically read both fields as one snapshot.
    pub fn load(&self, order: Ordering) -> TaggedPtr<T> {
        unpack(self.bits.load(order))
    }

    /// Attempt to replace `current` with `(new_ptr, current.tag() + 1)`.
    ///
    /// Succeeds only if the live pointer *and* generation both still equal
    /// `current`; the generation bump on success is what invalidates every
    /// other thread's outstanding snapshot of this slot. Returns `false` and
    /// leaves the slot untouched otherwise.
    pub fn compare_exchange(&self, current: TaggedPtr<T>, new_ptr: *mut T) -> bool {
        let old = pack(current.ptr, current.tag);
        let new = pack(new_ptr, current.tag.wrapping_add(1));
        self.bits
            .compare_exchange(old, new, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }
}

fn pack<T>(ptr: *mut T, tag: u16) -> u64 {
    let addr = ptr as u64;
    debug_assert_eq!(addr & !ADDR_MASK, 0, "pointer outside the 48-bit canonical range");
    addr | ((tag as u64) << TAG_SHIFT)
}

fn unpack<T>(bits: u64) -> TaggedPtr<T> {
    TaggedPtr::new((bits & ADDR_MASK) as *mut T, (bits >> TAG_SHIFT) as u16)
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    #[test]
    fn load_returns_both_fields() {
        let mut value = 7u32;
        let slot = TaggedAtomic::new(&mut value as *mut u32);

        let snap = slot.load(Ordering::SeqCst);
        assert_eq!(snap.ptr(), &mut value as *mut u32);
        assert_eq!(snap.tag(), 0);
        assert!(!snap.is_null());
    }

    #[test]
    fn equality_compares_pointer_and_tag() {
        let mut value = 0u32;
        let p = &mut value as *mut u32;

        assert_eq!(TaggedPtr::new(p, 3), TaggedPtr::new(p, 3));
        assert_ne!(TaggedPtr::new(p, 3), TaggedPtr::new(p, 4));
        assert_ne!(TaggedPtr::new(p, 3), TaggedPtr::<u32>::null());
    }

    #[test]
    fn tag_increments_by_one_per_successful_swap() {
        let mut a = 1u32;
        let mut b = 2u32;
        let slot = TaggedAtomic::new(&mut a as *mut u32);

        for round in 0..10u16 {
            let snap = slot.load(Ordering::SeqCst);
            assert_eq!(snap.tag(), round);
            let next = if round % 2 == 0 { &mut b } else { &mut a };
            assert!(slot.compare_exchange(snap, next as *mut u32));
        }
        assert_eq!(slot.load(Ordering::SeqCst).tag(), 10);
    }

    #[test]
    fn stale_tag_fails_even_at_the_same_address() {
        let mut a = 1u32;
        let mut b = 2u32;
        let pa = &mut a as *mut u32;
        let slot = TaggedAtomic::new(pa);

        // One thread's snapshot of the initial state.
        let stale = slot.load(Ordering::SeqCst);

        // Meanwhile the slot moves away from `a` and back to the same
        // address, as if the allocation had been freed and reused.
        let snap = slot.load(Ordering::SeqCst);
        assert!(slot.compare_exchange(snap, &mut b as *mut u32));
        let snap = slot.load(Ordering::SeqCst);
        assert!(slot.compare_exchange(snap, pa));

        // Same address, different generation: the stale CAS must fail.
        let live = slot.load(Ordering::SeqCst);
        assert_eq!(live.ptr(), stale.ptr());
        assert_ne!(live, stale);
        assert!(!slot.compare_exchange(stale, &mut b as *mut u32));

        // And the failed attempt left the slot untouched.
        assert_eq!(slot.load(Ordering::SeqCst), live);
    }

    #[test]
    fn null_slot_round_trip() {
        let slot = TaggedAtomic::<u32>::new(ptr::null_mut());
        let snap = slot.load(Ordering::SeqCst);
        assert!(snap.is_null());

        let mut value = 9u32;
        assert!(slot.compare_exchange(snap, &mut value as *mut u32));
        assert!(slot.compare_exchange(slot.load(Ordering::SeqCst), ptr::null_mut()));
        let snap = slot.load(Ordering::SeqCst);
        assert!(snap.is_null());
        assert_eq!(snap.tag(), 2);
    }

    #[test]
    fn tag_wraps_around() {
        let slot = TaggedAtomic::<u32>::new(ptr::null_mut());
        let almost = TaggedPtr::new(ptr::null_mut(), u16::MAX);
        // Jump the slot to the last generation, then swap once more.
        slot.bits.store(pack(ptr::null_mut::<u32>(), u16::MAX), Ordering::SeqCst);
        assert!(slot.compare_exchange(almost, ptr::null_mut()));
        assert_eq!(slot.load(Ordering::SeqCst).tag(), 0);
    }
}
