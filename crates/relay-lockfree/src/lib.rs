//! Lock-free message passing primitives for real-time audio.
//!
//! An audio callback runs on a thread that must never wait: a mutex held by
//! the GUI for a millisecond, a page fault, or a scheduler decision is an
//! audible dropout. This crate provides the structures that let a real-time
//! callback and a non-real-time control thread exchange messages without
//! either side ever blocking:
//!
//! - [`tagged::TaggedAtomic`] - an atomic (pointer, generation) slot whose
//!   CAS bumps the generation on every success, the defense against the ABA
//!   problem.
//! - [`stack::IntrusiveStack`] / [`stack::Stack`] - a Treiber LIFO stack,
//!   intrusive core and value-wrapping adapter.
//! - [`fifo::IntrusiveFifo`] / [`fifo::Fifo`] - a Michael & Scott FIFO
//!   queue with a permanent sentinel and tail helping, intrusive core and
//!   value-wrapping adapter.
//!
//! The intrusive structures operate on caller-owned items and never
//! allocate; the adapters box values in and out and are the usual entry
//! point. All operations are CAS-retry loops: lock-free (some thread always
//! completes), not wait-free (a given call may retry under contention), and
//! an empty structure answers with `None` immediately rather than waiting.
//!
//! # Example
//!
//! One queue per direction is the typical host wiring: the control thread
//! builds the channel, both sides enqueue/dequeue, and the control thread
//! tears it down once the callback is guaranteed to no longer run.
//!
//! ```
//! use std::sync::Arc;
//! use std::thread;
//!
//! use relay_lockfree::Fifo;
//!
//! let to_audio = Arc::new(Fifo::new());
//!
//! let control = {
//!     let to_audio = Arc::clone(&to_audio);
//!     thread::spawn(move || {
//!         for n in 0..4 {
//!             to_audio.enqueue(n);
//!         }
//!     })
//! };
//! control.join().unwrap();
//!
//! let mut received = Vec::new();
//! while let Some(n) = to_audio.dequeue() {
//!     received.push(n);
//! }
//! assert_eq!(received, vec![0, 1, 2, 3]);
//! ```
//!
//! # Teardown contract
//!
//! The structures synchronize their operations, not their own lifetime.
//! Whoever owns a channel (normally the control thread) must guarantee no
//! other thread is mid-call when it is dropped; for an audio host that means
//! deactivating the callback before tearing down its queues.

pub mod fifo;
pub mod stack;
pub mod tagged;

mod sync;

pub use fifo::{Fifo, FifoItem, FifoNode, IntrusiveFifo};
pub use stack::{IntrusiveStack, Stack, StackItem, StackNode};
pub use tagged::{TaggedAtomic, TaggedPtr};
