//! # segalloc - A Segregated-Fit Heap Allocator
//!
//! This crate implements a general-purpose heap allocator that services
//! `allocate` / `free` / `reallocate` requests by subdividing a single
//! contiguous arena, using **boundary tags**, **segregated explicit free
//! lists**, and **first-fit placement with splitting**.
//!
//! ## Overview
//!
//! Every byte of the heap belongs to exactly one block. Each block is
//! bracketed by an 8-byte header and an identical footer encoding its
//! size and allocation state, so physical neighbors in either direction
//! are one size-arithmetic step away:
//!
//! ```text
//!                             THE HEAP
//!
//!   lo                                                              hi
//!   ▼                                                               ▼
//!   ┌────────┬──────────────┬───────────┬────────┬────────┬─────────┐
//!   │prologue│ 6 list heads │ allocated │  free  │ alloc. │epilogue │
//!   │ (8:a)  │  (6 × 32:a)  │  (88:a)   │(4096:f)│ (40:a) │  (0:a)  │
//!   └────────┴──────────────┴───────────┴────────┴────────┴─────────┘
//!                    │                      ▲
//!                    │     {next, prev}     │
//!                    └──────────────────────┘
//!              free blocks double as nodes of a doubly
//!              linked list rooted in their size class's
//!              permanently allocated list-head block
//! ```
//!
//! The permanently allocated **prologue** and **epilogue** sentinels mean
//! that neighbor lookups from the first and last real blocks always land
//! on an allocated block, which collapses the boundary cases of
//! coalescing into the ordinary ones.
//!
//! ## Allocation Strategy
//!
//! - **Segregated fit**: free blocks are filed into six size classes
//!   with doubling upper bounds; a request searches its own class first,
//!   then larger ones.
//! - **Bounded first fit**: each class is scanned from its head for at
//!   most a fixed number of probes, trading a little utilization for a
//!   hard latency cap.
//! - **Splitting**: a chosen block sheds its tail as a new free block
//!   whenever the remainder can stand alone.
//! - **Coalescing**: a freed block merges with free physical neighbors
//!   immediately, so no two adjacent free blocks ever exist between
//!   operations.
//! - **Tail-aware growth**: when no fit exists the heap grows by the
//!   request size minus any free block already sitting at the tail,
//!   which the new space absorbs on arrival.
//!
//! ## Crate Structure
//!
//! ```text
//!   segalloc
//!   ├── align      - alignment macros (align!, align_to!)
//!   ├── arena      - the contiguous region and its sbrk-style growth
//!   ├── block      - boundary tags and physical navigation
//!   ├── seglist    - the segregated free-list index
//!   ├── heap       - placement, coalescing, extension; the public API
//!   └── check      - structural audit used by tests and diagnostics
//! ```
//!
//! ## Quick Start
//!
//! ```rust
//! use segalloc::Heap;
//!
//! let mut heap = Heap::new().unwrap();
//!
//! unsafe {
//!   let p = heap.allocate(256);
//!   assert!(!p.is_null());
//!
//!   p.write_bytes(0x2A, 256);
//!   let p = heap.reallocate(p, 512);
//!   assert_eq!(*p, 0x2A);
//!
//!   heap.free(p);
//! }
//!
//! // The structural audit counts invariant violations; 0 means clean.
//! assert_eq!(heap.check(false), 0);
//! ```
//!
//! ## Limitations
//!
//! - **Single-threaded only**: a [`Heap`] is neither `Send` nor `Sync`;
//!   wrap it in external synchronization if you must share it.
//! - **Fixed alignment**: payloads are 8-aligned, never more.
//! - **No shrinking**: memory claimed from the reservation is only
//!   returned when the whole heap is dropped.
//! - **Trusting**: freeing a foreign pointer, double-freeing, or writing
//!   outside a payload corrupts the heap; nothing defends against it.
//!
//! ## Safety
//!
//! The allocation entry points are `unsafe`: they hand out and consume
//! raw pointers whose validity the borrow checker cannot track. Callers
//! must ensure:
//! - pointers passed to `free` / `reallocate` came from this heap's
//!   `allocate` / `reallocate` and were not freed since
//! - payloads are only used while allocated, within their size

pub mod align;
mod arena;
mod block;
mod check;
mod heap;
mod seglist;

pub use arena::{Arena, ArenaError, MAX_HEAP};
pub use block::{ALIGN, MIN_BLOCK, OVERHEAD};
pub use heap::{CHUNK, Heap, PROBE_LIMIT};
pub use seglist::{CLASS_BASE, SEG_CLASSES};
