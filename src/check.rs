//! Heap and free-list audit.
//!
//! Walks the physical block chain from prologue to epilogue and every
//! segregated list, verifying the structural invariants the allocator
//! maintains. The audit reports what it finds and repairs nothing; a
//! non-zero fault count means the heap is already lost.

use tracing::{debug, error};

use crate::block::{self, ALIGN, Block, MIN_BLOCK, WORD};
use crate::heap::Heap;
use crate::seglist::{SEG_CLASSES, class_of};

impl Heap {
  /// Audits every structural invariant; returns the number of faults.
  ///
  /// Checks, in order: the prologue tag; per block, arena bounds,
  /// payload alignment, size sanity, header/footer agreement, and that
  /// no two neighbors are both free; the epilogue tag and position; per
  /// list, sentinel integrity, termination, forward/backward agreement,
  /// membership marking, and class placement; finally that the lists and
  /// the walk enumerate the same free blocks.
  ///
  /// `verbose` additionally dumps each block at debug level.
  pub fn check(
    &self,
    verbose: bool,
  ) -> usize {
    let mut faults = 0;

    let mut by_walk = unsafe { self.audit_blocks(verbose, &mut faults) };
    let mut by_lists = unsafe { self.audit_lists(&mut faults) };

    by_walk.sort_unstable();
    by_lists.sort_unstable();
    if by_walk != by_lists {
      error!(
        walk = by_walk.len(),
        lists = by_lists.len(),
        "free lists disagree with the heap walk"
      );
      faults += 1;
    }

    faults
  }

  /// Sizes of all free blocks, in address order.
  ///
  /// Diagnostic companion to [`check`](Self::check); lets tests and the
  /// demo observe splitting and coalescing directly.
  pub fn free_block_sizes(&self) -> Vec<usize> {
    let mut sizes = Vec::new();

    unsafe {
      let mut bp = block::next_block(self.prologue);
      while (*bp).header.size() > 0 {
        if !(*bp).header.is_allocated() {
          sizes.push((*bp).header.size());
        }
        bp = block::next_block(bp);
      }
    }

    sizes
  }

  /// Walks the block chain; returns the addresses of free blocks seen.
  unsafe fn audit_blocks(
    &self,
    verbose: bool,
    faults: &mut usize,
  ) -> Vec<usize> {
    let lo = self.arena.lo() as usize;
    let hi = self.arena.hi() as usize;
    let mut free = Vec::new();

    unsafe {
      if verbose {
        debug!(lo = ?self.arena.lo(), hi = ?self.arena.hi(), "heap dump");
      }

      let prologue = self.prologue;
      if (*prologue).header.size() != WORD || !(*prologue).header.is_allocated() {
        error!("bad prologue tag");
        *faults += 1;
      }

      let mut bp = block::next_block(prologue);
      let mut prev_free = false;

      while (*bp).header.size() > 0 {
        let size = (*bp).header.size();
        let addr = bp as usize;

        if addr < lo || addr + size > hi {
          error!(block = ?bp, size, "block extends outside the arena");
          *faults += 1;
          // Walking on would leave the mapping.
          break;
        }
        if verbose {
          dump_block(bp);
        }
        if (block::payload(bp) as usize) % ALIGN != 0 {
          error!(block = ?bp, "payload is not aligned");
          *faults += 1;
        }
        if size % ALIGN != 0 || size < MIN_BLOCK {
          error!(block = ?bp, size, "bad block size");
          *faults += 1;
        }

        let foot = &*block::footer(bp);
        if foot.size() != size {
          error!(block = ?bp, "header size does not match footer");
          *faults += 1;
        }
        if foot.is_allocated() != (*bp).header.is_allocated() {
          error!(block = ?bp, "header alloc does not match footer");
          *faults += 1;
        }

        let is_free = !(*bp).header.is_allocated();
        if is_free && prev_free {
          error!(block = ?bp, "adjacent free blocks escaped coalescing");
          *faults += 1;
        }
        if is_free {
          free.push(addr);
        }

        prev_free = is_free;
        bp = block::next_block(bp);
      }

      if verbose && (*bp).header.size() == 0 {
        dump_block(bp);
      }
      if bp != self.epilogue {
        error!(found = ?bp, expected = ?self.epilogue, "walk ended before the epilogue");
        *faults += 1;
      }
      if (*bp).header.size() != 0 || !(*bp).header.is_allocated() {
        error!("bad epilogue tag");
        *faults += 1;
      }
      if bp as usize + WORD != hi {
        error!("epilogue is not at the heap end");
        *faults += 1;
      }
    }

    free
  }

  /// Traverses every segregated list; returns the member addresses.
  unsafe fn audit_lists(
    &self,
    faults: &mut usize,
  ) -> Vec<usize> {
    let mut members = Vec::new();
    // A corrupted list may cycle; no list can legitimately hold more
    // nodes than the heap holds minimum-sized blocks.
    let max_nodes = self.arena.size() / MIN_BLOCK + 1;

    unsafe {
      for class in 0..SEG_CLASSES {
        let sentinel = self.index.head_of(class);

        if !(*sentinel).header.is_allocated() || (*sentinel).header.size() != MIN_BLOCK {
          error!(class, "list-head sentinel tag was rewritten");
          *faults += 1;
        }

        let mut forward = Vec::new();
        let mut bp = (*sentinel).next;
        while !bp.is_null() && forward.len() <= max_nodes {
          forward.push(bp);
          bp = (*bp).next;
        }
        if forward.len() > max_nodes {
          error!(class, "free list does not terminate");
          *faults += 1;
          continue;
        }

        let mut backward = Vec::new();
        let mut bp = (*sentinel).prev;
        while !bp.is_null() && backward.len() <= max_nodes {
          backward.push(bp);
          bp = (*bp).prev;
        }
        backward.reverse();
        if forward != backward {
          error!(class, "forward and backward traversals disagree");
          *faults += 1;
        }

        match (forward.first(), forward.last()) {
          (Some(&head), Some(&tail)) => {
            if !(*head).prev.is_null() {
              error!(class, "list head has a predecessor");
              *faults += 1;
            }
            if !(*tail).next.is_null() {
              error!(class, "list tail has a successor");
              *faults += 1;
            }
            if (*sentinel).prev != tail {
              error!(class, "sentinel tail link is stale");
              *faults += 1;
            }
          }
          _ => {
            if !(*sentinel).prev.is_null() {
              error!(class, "empty list with a tail link");
              *faults += 1;
            }
          }
        }

        for &bp in &forward {
          let size = (*bp).header.size();

          if (*bp).header.is_allocated() {
            error!(block = ?bp, class, "allocated block on a free list");
            *faults += 1;
          }
          if class_of(size) != class {
            error!(block = ?bp, size, class, "block filed in the wrong size class");
            *faults += 1;
          }

          members.push(bp as usize);
        }
      }
    }

    members
  }
}

/// One line per block, the audit's verbose form.
unsafe fn dump_block(bp: *mut Block) {
  unsafe {
    let header = &(*bp).header;

    if header.size() == 0 {
      debug!("{:p}: epilogue [0:{}]", bp, flag(header.is_allocated()));
      return;
    }

    let foot = &*block::footer(bp);
    debug!(
      "{:p}: header [{}:{}] footer [{}:{}]",
      bp,
      header.size(),
      flag(header.is_allocated()),
      foot.size(),
      flag(foot.is_allocated()),
    );
  }
}

fn flag(allocated: bool) -> char {
  if allocated { 'a' } else { 'f' }
}
