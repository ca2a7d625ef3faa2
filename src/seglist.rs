//! Segregated free-list index.
//!
//! Free blocks are partitioned into six doubly linked lists by size
//! class. The list heads are themselves blocks: permanently allocated
//! `MIN_BLOCK`-sized sentinels sitting right after the prologue, whose
//! link area stores their class's head and tail:
//!
//! ```text
//!              list-head sentinel                 free blocks
//!   ┌──────────────────────────────┐    ┌──────┐      ┌──────┐
//!   │ header (32:a)                │    │      │ next │      │
//!   │ next ────────────────────────┼───►│ head ├─────►│ tail ├──► ⊥
//!   │ prev ───────────────────┐    │    │      │◄─────┤      │
//!   │ footer (32:a)           │    │    └──────┘ prev └──▲───┘
//!   └─────────────────────────┼────┘                     │
//!                             └──────────────────────────┘
//! ```
//!
//! Class bounds double from [`CLASS_BASE`]:
//!
//! ```text
//!   class 0:          size <=   4000
//!   class 1:   4000 < size <=   8000
//!   class 2:   8000 < size <=  16000
//!   class 3:  16000 < size <=  32000
//!   class 4:  32000 < size <=  64000
//!   class 5:  64000 < size
//! ```

use std::ptr;

use tracing::error;

use crate::block::{Block, MIN_BLOCK};

/// Number of segregated size classes.
pub const SEG_CLASSES: usize = 6;

/// Upper bound of the smallest size class; each class doubles it.
pub const CLASS_BASE: usize = 4000;

/// Index of the smallest class whose range covers `size`.
pub fn class_of(size: usize) -> usize {
  let mut bound = CLASS_BASE;

  for class in 0..SEG_CLASSES {
    if size <= bound {
      return class;
    }
    bound *= 2;
  }

  SEG_CLASSES - 1
}

/// Directory of the per-class list-head sentinels.
///
/// A sentinel's `next` points at the first free block of its class, its
/// `prev` at the last; both are null for an empty class.
pub struct SegIndex {
  base: *mut Block,
}

impl SegIndex {
  /// Wraps the directory whose first sentinel sits at `base`.
  ///
  /// # Safety
  ///
  /// `base` must point at [`SEG_CLASSES`] consecutive list-head blocks of
  /// size [`MIN_BLOCK`], initialized with null links.
  pub unsafe fn new(base: *mut Block) -> Self {
    Self { base }
  }

  /// The sentinel block for `class`.
  pub fn head_of(
    &self,
    class: usize,
  ) -> *mut Block {
    debug_assert!(class < SEG_CLASSES);
    unsafe { (self.base as *mut u8).add(MIN_BLOCK * class) as *mut Block }
  }

  /// Prepends a free block to the list for its size class (LIFO).
  ///
  /// # Safety
  ///
  /// `bp` must be a free block inside the arena that is not currently a
  /// member of any list.
  pub unsafe fn insert(
    &mut self,
    bp: *mut Block,
  ) {
    unsafe {
      let sentinel = self.head_of(class_of((*bp).header.size()));
      let old_head = (*sentinel).next;

      (*bp).prev = ptr::null_mut();
      (*bp).next = old_head;

      if old_head.is_null() {
        if !(*sentinel).prev.is_null() {
          error!(sentinel = ?sentinel, "free list has a tail but no head");
          debug_assert!(false, "free list has a tail but no head");
        }
        (*sentinel).prev = bp;
      } else {
        (*old_head).prev = bp;
      }

      (*sentinel).next = bp;
    }
  }

  /// Unlinks a block from its class list and clears its link fields.
  ///
  /// Five cases: empty list (a structural bug), singleton, head, tail,
  /// middle.
  ///
  /// # Safety
  ///
  /// `bp` must be a member of the list for its size class.
  pub unsafe fn remove(
    &mut self,
    bp: *mut Block,
  ) {
    unsafe {
      let sentinel = self.head_of(class_of((*bp).header.size()));
      let head = (*sentinel).next;
      let tail = (*sentinel).prev;

      if head.is_null() {
        error!(block = ?bp, "removing a block from an empty free list");
        debug_assert!(false, "removing a block from an empty free list");
        return;
      }

      if head == tail {
        debug_assert!(bp == head, "block is not the singleton list member");
        (*sentinel).next = ptr::null_mut();
        (*sentinel).prev = ptr::null_mut();
      } else if bp == head {
        let succ = (*bp).next;
        (*sentinel).next = succ;
        (*succ).prev = ptr::null_mut();
      } else if bp == tail {
        let pred = (*bp).prev;
        (*sentinel).prev = pred;
        (*pred).next = ptr::null_mut();
      } else {
        let pred = (*bp).prev;
        let succ = (*bp).next;
        (*pred).next = succ;
        (*succ).prev = pred;
      }

      (*bp).next = ptr::null_mut();
      (*bp).prev = ptr::null_mut();
    }
  }
}
