//! # Segregated-Fit Heap Allocator
//!
//! The allocator core: first-fit placement over segregated explicit free
//! lists, boundary-tag coalescing, and the heap-extension policy.
//!
//! ## Heap Layout
//!
//! The arena is covered edge to edge by blocks. Two permanently allocated
//! sentinels bound the region, and the six list-head blocks of the
//! segregated index live right after the prologue:
//!
//! ```text
//!   lo                                                              hi
//!   ▼                                                               ▼
//!   ┌────────┬──────────────────┬────────────────────────┬──────────┐
//!   │prologue│ 6 list-head      │  user blocks           │ epilogue │
//!   │ (8:a)  │ blocks (32:a)    │  (allocated and free)  │  (0:a)   │
//!   └────────┴──────────────────┴────────────────────────┴──────────┘
//! ```
//!
//! The prologue means a "previous block" lookup from the first real block
//! always finds an allocated neighbor; the epilogue does the same for
//! "next block" lookups from the last. Growing the heap recycles the old
//! epilogue's tag as the new free block's header.
//!
//! ## Allocation Flow
//!
//! ```text
//!   allocate(size)
//!     │
//!     ├─ asize = max(align!(size + OVERHEAD), MIN_BLOCK)
//!     │
//!     ├─ find_fit(asize) ── hit ──► place(block, asize) ──► payload
//!     │        │                      │
//!     │       miss                    └─ split off the remainder when it
//!     │        │                         can stand alone as a block
//!     │        ▼
//!     └─ extend_heap(asize - free tail, if any)
//!              │
//!              └─ coalesce with the old tail ──► place ──► payload
//! ```
//!
//! ## Coalescing
//!
//! A freed block merges with its physical neighbors before it is indexed.
//! Neighbors are unlinked from their lists *before* any tag is rewritten,
//! so class lookup still sees their old size:
//!
//! ```text
//!   prev  next  │  action                              survivor
//!   ─────────────────────────────────────────────────────────────
//!    a     a    │  insert(B)                              B
//!    a     f    │  absorb next                            B
//!    f     a    │  prev absorbs B                        prev
//!    f     f    │  prev absorbs B and next               prev
//! ```
//!
//! ## Thread Safety
//!
//! A [`Heap`] is a single-threaded value: it owns its arena, is neither
//! `Send` nor `Sync`, and interior pointers never escape except as
//! payloads.

use std::{cmp, process, ptr};

use tracing::{debug, error, instrument};

use crate::align;
use crate::arena::{Arena, ArenaError, MAX_HEAP};
use crate::block::{self, Block, BlockState, MIN_BLOCK, OVERHEAD, WORD};
use crate::seglist::{SEG_CLASSES, SegIndex, class_of};

/// Initial chunk claimed from the arena at startup: 8 KiB.
pub const CHUNK: usize = 1 << 13;

/// Most blocks the first-fit scan examines per size class.
///
/// Bounding the scan caps worst-case latency at the cost of sometimes
/// missing a usable block and extending the heap instead.
pub const PROBE_LIMIT: usize = 12;

/// Largest adjusted block size a 31-bit tag can describe.
const MAX_BLOCK: usize = 1 << 31;

/// A segregated-fit heap allocator over one contiguous arena.
///
/// Every `Heap` value is a fresh, independent heap; dropping it returns
/// the whole reservation at once.
///
/// # Example
///
/// ```rust
/// use segalloc::Heap;
///
/// let mut heap = Heap::new().unwrap();
///
/// unsafe {
///   let p = heap.allocate(128);
///   assert!(!p.is_null());
///
///   p.write_bytes(0xAB, 128);
///   heap.free(p);
/// }
///
/// assert_eq!(heap.check(false), 0);
/// ```
pub struct Heap {
  pub(crate) arena: Arena,
  pub(crate) prologue: *mut Block,
  pub(crate) index: SegIndex,
  pub(crate) epilogue: *mut Block,
}

impl Heap {
  /// Builds a heap over the default 20 MiB reservation.
  pub fn new() -> Result<Self, ArenaError> {
    Self::with_limit(MAX_HEAP)
  }

  /// Builds a heap that may never grow past `limit` bytes.
  ///
  /// The initial chunk holds the prologue, the six list-head sentinels,
  /// one free block spanning the rest of the chunk, and the epilogue:
  ///
  /// ```text
  ///   ┌────────┬─────────────┬──────────────────────────┬──────────┐
  ///   │ (8:a)  │ 6 × (32:a)  │ free (CHUNK - 216 : f)   │  (0:a)   │
  ///   └────────┴─────────────┴──────────────────────────┴──────────┘
  /// ```
  pub fn with_limit(limit: usize) -> Result<Self, ArenaError> {
    let mut arena = Arena::new(limit)?;
    let base = arena.sbrk(CHUNK)?;

    unsafe {
      // Prologue: a lone allocated tag.
      let prologue = base as *mut Block;
      (*prologue).header.pack(WORD, BlockState::Allocated);

      // One list-head sentinel block per size class.
      let seg_base = block::next_block(prologue);
      let mut bp = seg_base;
      for _ in 0..SEG_CLASSES {
        block::pack_tags(bp, MIN_BLOCK, BlockState::Allocated);
        (*bp).next = ptr::null_mut();
        (*bp).prev = ptr::null_mut();
        bp = block::next_block(bp);
      }

      // Everything left in the chunk becomes the first free block.
      let initial = bp;
      let free_size = CHUNK - OVERHEAD - MIN_BLOCK * SEG_CLASSES;
      block::pack_tags(initial, free_size, BlockState::Free);

      let epilogue = block::next_block(initial);
      (*epilogue).header.pack(0, BlockState::Allocated);

      let mut index = SegIndex::new(seg_base);
      index.insert(initial);

      debug!(chunk = CHUNK, free = free_size, "heap initialized");

      Ok(Self {
        arena,
        prologue,
        index,
        epilogue,
      })
    }
  }

  /// Services a request for `size` payload bytes.
  ///
  /// The returned pointer is 8-aligned and writable for `size` bytes.
  /// Returns null for a zero-size request, a request too large for a
  /// boundary tag, or when the arena refuses to grow.
  ///
  /// # Safety
  ///
  /// The heap's blocks must be intact; a caller that wrote outside an
  /// allocated payload has already corrupted the structures this walks.
  #[instrument(level = "debug", skip(self))]
  pub unsafe fn allocate(
    &mut self,
    size: usize,
  ) -> *mut u8 {
    if size == 0 {
      return ptr::null_mut();
    }

    let Some(wanted) = size.checked_add(OVERHEAD) else {
      return ptr::null_mut();
    };
    if wanted > MAX_BLOCK {
      return ptr::null_mut();
    }
    let asize = cmp::max(align!(wanted), MIN_BLOCK);

    unsafe {
      if let Some(bp) = self.find_fit(asize) {
        self.place(bp, asize);
        return block::payload(bp);
      }

      // No fit. A free block at the tail will coalesce with whatever we
      // append, so grow only by the shortfall.
      let extend = match self.free_tail_size() {
        Some(tail) => cmp::max(asize.saturating_sub(tail), WORD),
        None => asize,
      };

      match self.extend_heap(extend) {
        Ok(bp) => {
          self.place(bp, asize);
          block::payload(bp)
        }
        Err(err) => {
          debug!(%err, asize, "allocation failed");
          ptr::null_mut()
        }
      }
    }
  }

  /// Releases a payload previously returned by [`allocate`](Self::allocate).
  ///
  /// A null pointer is a no-op, matching `free(NULL)`.
  ///
  /// # Safety
  ///
  /// `payload` must have come from this heap's `allocate` or
  /// `reallocate` and must not have been freed since.
  #[instrument(level = "debug", skip(self))]
  pub unsafe fn free(
    &mut self,
    payload: *mut u8,
  ) {
    if payload.is_null() {
      return;
    }

    unsafe {
      let bp = block::from_payload(payload);
      block::pack_tags(bp, (*bp).header.size(), BlockState::Free);
      self.coalesce(bp);
    }
  }

  /// Moves a payload into a freshly allocated block of `new_size` bytes,
  /// preserving the first `min(new_size, old payload size)` bytes.
  ///
  /// Aborts the process when the new block cannot be allocated, which
  /// includes `new_size == 0`. A null `payload` degenerates to
  /// [`allocate`](Self::allocate).
  ///
  /// # Safety
  ///
  /// Same contract as [`free`](Self::free) for `payload`; the returned
  /// pointer replaces it.
  #[instrument(level = "debug", skip(self))]
  pub unsafe fn reallocate(
    &mut self,
    payload: *mut u8,
    new_size: usize,
  ) -> *mut u8 {
    unsafe {
      if payload.is_null() {
        return self.allocate(new_size);
      }

      let new = self.allocate(new_size);
      if new.is_null() {
        error!(new_size, "allocation failed during reallocate");
        process::abort();
      }

      let bp = block::from_payload(payload);
      let old_payload = (*bp).header.size() - OVERHEAD;
      ptr::copy_nonoverlapping(payload, new, cmp::min(new_size, old_payload));

      self.free(payload);
      new
    }
  }

  /// Bytes currently claimed from the arena.
  pub fn heap_size(&self) -> usize {
    self.arena.size()
  }

  /// First fit over the segregated lists.
  ///
  /// Scans from the smallest class that could hold `asize` upward,
  /// probing at most [`PROBE_LIMIT`] blocks per class.
  unsafe fn find_fit(
    &self,
    asize: usize,
  ) -> Option<*mut Block> {
    unsafe {
      for class in class_of(asize)..SEG_CLASSES {
        let mut bp = (*self.index.head_of(class)).next;
        let mut probes = 0;

        while !bp.is_null() && probes < PROBE_LIMIT {
          if (*bp).header.size() >= asize {
            debug!(class, asize, block = ?bp, "fit found");
            return Some(bp);
          }
          bp = (*bp).next;
          probes += 1;
        }
      }

      None
    }
  }

  /// Commits `asize` bytes of the free block `bp`.
  ///
  /// The block leaves its list first; the remainder is split off as a new
  /// free block when it is large enough to stand alone, and stays inside
  /// the allocation otherwise.
  unsafe fn place(
    &mut self,
    bp: *mut Block,
    asize: usize,
  ) {
    unsafe {
      let remainder = (*bp).header.size() - asize;
      self.index.remove(bp);

      if remainder < MIN_BLOCK {
        block::pack_tags(bp, (*bp).header.size(), BlockState::Allocated);
      } else {
        block::pack_tags(bp, asize, BlockState::Allocated);

        let split = block::next_block(bp);
        block::pack_tags(split, remainder, BlockState::Free);
        self.index.insert(split);
      }
    }
  }

  /// Merges a just-freed block with any free physical neighbors and
  /// indexes the survivor, which is returned.
  ///
  /// The freed block must carry free tags already and belong to no list.
  /// A neighbor is removed from its list before the size rewrite that
  /// would change its class.
  unsafe fn coalesce(
    &mut self,
    bp: *mut Block,
  ) -> *mut Block {
    unsafe {
      let prev_allocated = (*block::prev_footer(bp)).is_allocated();
      let next = block::next_block(bp);
      let next_allocated = (*next).header.is_allocated();
      let mut size = (*bp).header.size();

      match (prev_allocated, next_allocated) {
        (true, true) => {
          self.index.insert(bp);
          bp
        }
        (true, false) => {
          self.index.remove(next);
          size += (*next).header.size();
          block::pack_tags(bp, size, BlockState::Free);
          self.index.insert(bp);
          bp
        }
        (false, true) => {
          let prev = block::prev_block(bp);
          self.index.remove(prev);
          size += (*prev).header.size();
          block::pack_tags(prev, size, BlockState::Free);
          self.index.insert(prev);
          prev
        }
        (false, false) => {
          let prev = block::prev_block(bp);
          self.index.remove(prev);
          self.index.remove(next);
          size += (*prev).header.size() + (*next).header.size();
          block::pack_tags(prev, size, BlockState::Free);
          self.index.insert(prev);
          prev
        }
      }
    }
  }

  /// Size of the last block before the epilogue, if that block is free.
  unsafe fn free_tail_size(&self) -> Option<usize> {
    unsafe {
      let last = block::prev_block(self.epilogue);
      if (*last).header.is_allocated() {
        None
      } else {
        Some((*last).header.size())
      }
    }
  }

  /// Claims `bytes` more arena and overlays them as one free block,
  /// recycling the old epilogue tag as its header and writing a fresh
  /// epilogue at the new end. Returns the block after coalescing, which
  /// absorbs a free tail left before the old epilogue.
  unsafe fn extend_heap(
    &mut self,
    bytes: usize,
  ) -> Result<*mut Block, ArenaError> {
    unsafe {
      let raw = self.arena.sbrk(bytes)?;

      let bp = raw.sub(WORD) as *mut Block;
      block::pack_tags(bp, bytes, BlockState::Free);

      let epilogue = block::next_block(bp);
      (*epilogue).header.pack(0, BlockState::Allocated);
      self.epilogue = epilogue;

      debug!(bytes, heap = self.arena.size(), "heap extended");

      Ok(self.coalesce(bp))
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use rand::rngs::StdRng;
  use rand::{Rng, SeedableRng};

  /// Initial free space: the chunk minus prologue, epilogue, and the six
  /// list-head sentinels.
  const INITIAL_FREE: usize = CHUNK - OVERHEAD - MIN_BLOCK * SEG_CLASSES;

  fn is_aligned(ptr: *mut u8) -> bool {
    (ptr as usize) % crate::ALIGN == 0
  }

  #[test]
  fn init_leaves_a_single_free_block() {
    let heap = Heap::new().unwrap();

    assert_eq!(heap.check(false), 0);
    assert_eq!(heap.heap_size(), CHUNK);
    assert_eq!(heap.free_block_sizes(), vec![INITIAL_FREE]);
    assert_eq!(INITIAL_FREE, 7984);
  }

  #[test]
  fn allocate_free_allocate_reuses_the_same_region() {
    let mut heap = Heap::new().unwrap();

    unsafe {
      let first = heap.allocate(100);
      assert!(!first.is_null());
      assert!(is_aligned(first));
      assert_eq!(heap.check(false), 0);

      heap.free(first);
      assert_eq!(heap.check(false), 0);
      assert_eq!(heap.free_block_sizes(), vec![INITIAL_FREE]);

      let second = heap.allocate(100);
      assert_eq!(second, first);
      assert_eq!(heap.heap_size(), CHUNK);
      assert_eq!(heap.check(false), 0);
    }
  }

  #[test]
  fn adjacent_frees_coalesce_both_ways() {
    let mut heap = Heap::new().unwrap();

    unsafe {
      let a = heap.allocate(24);
      let b = heap.allocate(24);
      assert!(!a.is_null() && !b.is_null());

      // Freeing `a` merges nothing (both neighbors allocated); freeing
      // `b` then absorbs `a` and the trailing free block in one pass.
      heap.free(a);
      assert_eq!(heap.check(false), 0);

      heap.free(b);
      assert_eq!(heap.check(false), 0);
      assert_eq!(heap.free_block_sizes(), vec![INITIAL_FREE]);
    }
  }

  #[test]
  fn interleaved_frees_collapse_to_one_block() {
    let mut heap = Heap::new().unwrap();

    unsafe {
      let ptrs: Vec<*mut u8> = [16usize, 64, 512, 16]
        .iter()
        .map(|&size| heap.allocate(size))
        .collect();
      assert!(ptrs.iter().all(|p| !p.is_null()));

      ptrs[0].write_bytes(0x11, 16);

      heap.free(ptrs[1]);
      heap.free(ptrs[3]);
      assert_eq!(heap.check(false), 0);

      heap.free(ptrs[2]);
      assert_eq!(heap.check(false), 0);

      // Everything after the first allocation has merged back into a
      // single free block; the first payload is untouched.
      assert_eq!(heap.free_block_sizes(), vec![INITIAL_FREE - 32]);
      for i in 0..16 {
        assert_eq!(*ptrs[0].add(i), 0x11);
      }
    }
  }

  #[test]
  fn exhaustion_returns_null_and_leaves_payloads_intact() {
    let limit = 32 * 1024;
    let mut heap = Heap::with_limit(limit).unwrap();
    let mut payloads = Vec::new();

    unsafe {
      loop {
        let p = heap.allocate(1000);
        if p.is_null() {
          break;
        }
        assert!(is_aligned(p));
        p.write_bytes(payloads.len() as u8, 1000);
        payloads.push(p);
        assert!(heap.heap_size() <= limit);
      }

      assert!(!payloads.is_empty());
      assert_eq!(heap.check(false), 0);

      // Payloads are disjoint...
      let mut ranges: Vec<(usize, usize)> = payloads
        .iter()
        .map(|&p| (p as usize, p as usize + 1000))
        .collect();
      ranges.sort();
      for pair in ranges.windows(2) {
        assert!(pair[0].1 <= pair[1].0, "payloads overlap: {pair:?}");
      }

      // ...and still hold what was written.
      for (i, &p) in payloads.iter().enumerate() {
        for off in [0, 499, 999] {
          assert_eq!(*p.add(off), i as u8);
        }
      }
    }
  }

  #[test]
  fn extension_absorbs_a_free_tail() {
    let mut heap = Heap::new().unwrap();

    unsafe {
      // Carve the initial block so a free tail of 3968 bytes remains.
      let a = heap.allocate(4000);
      assert!(!a.is_null());
      assert_eq!(heap.free_block_sizes(), vec![INITIAL_FREE - 4016]);

      // 6000 bytes need a 6016-byte block: no fit, so the heap grows by
      // the shortfall and the new space merges with the tail.
      let b = heap.allocate(6000);
      assert!(!b.is_null());
      assert_eq!(heap.heap_size(), CHUNK + 6016 - 3968);
      assert!(heap.free_block_sizes().is_empty());
      assert_eq!(heap.check(false), 0);
    }
  }

  #[test]
  fn zero_size_and_oversized_requests_are_rejected() {
    let mut heap = Heap::new().unwrap();

    unsafe {
      assert!(heap.allocate(0).is_null());
      assert!(heap.allocate(usize::MAX).is_null());
      assert!(heap.allocate(MAX_BLOCK).is_null());
      assert_eq!(heap.check(false), 0);
    }
  }

  #[test]
  fn reallocate_preserves_the_payload_prefix() {
    let mut heap = Heap::new().unwrap();

    unsafe {
      let p = heap.allocate(64);
      for i in 0..64 {
        p.add(i).write(i as u8);
      }

      // Grow: all 64 bytes survive the move.
      let bigger = heap.reallocate(p, 256);
      assert!(!bigger.is_null());
      for i in 0..64 {
        assert_eq!(*bigger.add(i), i as u8);
      }

      // Shrink: the first 16 bytes survive.
      let smaller = heap.reallocate(bigger, 16);
      assert!(!smaller.is_null());
      for i in 0..16 {
        assert_eq!(*smaller.add(i), i as u8);
      }

      heap.free(smaller);
      assert_eq!(heap.check(false), 0);
    }
  }

  #[test]
  fn reallocate_null_behaves_like_allocate() {
    let mut heap = Heap::new().unwrap();

    unsafe {
      let p = heap.reallocate(ptr::null_mut(), 48);
      assert!(!p.is_null());
      assert!(is_aligned(p));

      heap.free(p);
      assert_eq!(heap.check(false), 0);
    }
  }

  /// Random allocate/free/reallocate trace with a shadow model, checking
  /// the structural audit, alignment, payload disjointness, content
  /// preservation, and arena monotonicity after every operation.
  #[test]
  fn random_trace_keeps_every_invariant() {
    let mut rng = StdRng::seed_from_u64(0x5E6A110C);
    let mut heap = Heap::new().unwrap();

    // (payload, requested size, fill byte)
    let mut live: Vec<(*mut u8, usize, u8)> = Vec::new();
    let mut high_water = heap.heap_size();

    unsafe {
      for step in 0..400 {
        match rng.gen_range(0..10) {
          // Allocate
          0..=4 => {
            let size = rng.gen_range(1..2048);
            let p = heap.allocate(size);
            assert!(!p.is_null());
            assert!(is_aligned(p));

            for &(q, qsize, _) in &live {
              let disjoint =
                p as usize + size <= q as usize || q as usize + qsize <= p as usize;
              assert!(disjoint, "overlapping payloads at step {step}");
            }

            let fill = step as u8;
            p.write_bytes(fill, size);
            live.push((p, size, fill));
          }

          // Free
          5..=7 if !live.is_empty() => {
            let (p, size, fill) = live.swap_remove(rng.gen_range(0..live.len()));
            for off in 0..size {
              assert_eq!(*p.add(off), fill, "payload changed before free");
            }
            heap.free(p);
          }

          // Reallocate
          8..=9 if !live.is_empty() => {
            let slot = rng.gen_range(0..live.len());
            let (p, size, fill) = live[slot];
            let new_size = rng.gen_range(1..2048);

            let q = heap.reallocate(p, new_size);
            assert!(!q.is_null());
            for off in 0..cmp::min(size, new_size) {
              assert_eq!(*q.add(off), fill, "prefix lost in reallocate");
            }

            q.write_bytes(fill, new_size);
            live[slot] = (q, new_size, fill);
          }

          _ => {}
        }

        assert!(heap.heap_size() >= high_water, "arena shrank");
        high_water = heap.heap_size();
        assert_eq!(heap.check(false), 0, "audit failed at step {step}");
      }

      for (p, ..) in live.drain(..) {
        heap.free(p);
      }
      assert_eq!(heap.check(false), 0);
      assert_eq!(heap.free_block_sizes().len(), 1);
    }
  }
}
