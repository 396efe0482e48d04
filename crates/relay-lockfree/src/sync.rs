//! Atomic primitives, switchable between `std` and `loom`.
//!
//! Built normally this re-exports `std::sync::atomic`. Under
//! `RUSTFLAGS="--cfg loom"` the same paths resolve to loom's model-checked
//! atomics, so the structures run unmodified inside `loom::model` and every
//! interleaving of the CAS protocols gets explored instead of sampled.

#[cfg(loom)]
pub(crate) use loom::sync::atomic::{AtomicPtr, AtomicU64, Ordering};

#[cfg(not(loom))]
pub(crate) use std::sync::atomic::{AtomicPtr, AtomicU64, Ordering};
