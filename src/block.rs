//! Boundary-tag block layout.
//!
//! Every byte of the arena between the prologue and epilogue belongs to
//! exactly one block:
//!
//! ```text
//!   ┌──────────┬───────────────────────────────┬──────────┐
//!   │  header  │     payload / link area       │  footer  │
//!   │  (8 B)   │                               │  (8 B)   │
//!   └──────────┴───────────────────────────────┴──────────┘
//!   ▲ block base                               ▲ base + size - 8
//! ```
//!
//! Header and footer carry the same `{size, allocated}` pair, so physical
//! neighbors are reachable by size arithmetic in both directions. While a
//! block is free, the first 16 payload bytes hold its `{next, prev}` free
//! list links; while it is allocated, those bytes belong to the caller.

use std::mem;

use static_assertions::const_assert;

/// Payload alignment; every block size is a multiple of this.
pub const ALIGN: usize = 8;

/// Size of one boundary tag.
pub const WORD: usize = 8;

/// Header plus footer.
pub const OVERHEAD: usize = 2 * WORD;

/// Smallest block: header, footer, and room for the two list links.
pub const MIN_BLOCK: usize = 32;

const_assert!(mem::size_of::<Tag>() == WORD);
const_assert!(mem::size_of::<Block>() <= MIN_BLOCK);

/// Allocation state carried in a tag's low bit.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u32)]
pub enum BlockState {
  Free = 0,
  Allocated = 1,
}

/// One 8-byte boundary tag: a 31-bit size, the allocated bit, padding.
///
/// Sizes are multiples of [`ALIGN`], so the flag shares the word without
/// colliding with size bits.
#[repr(C)]
pub struct Tag {
  bits: u32,
  _pad: u32,
}

impl Tag {
  /// Writes size and allocation state in a single store.
  pub fn pack(
    &mut self,
    size: usize,
    state: BlockState,
  ) {
    self.bits = size as u32 | state as u32;
  }

  /// Block size in bytes; masks out the flag bits.
  pub fn size(&self) -> usize {
    (self.bits & !(ALIGN as u32 - 1)) as usize
  }

  pub fn is_allocated(&self) -> bool {
    self.bits & 1 == 1
  }
}

/// A block viewed through its base address.
///
/// `next` and `prev` overlay the payload and are meaningful only while
/// the block is free.
#[repr(C)]
pub struct Block {
  pub header: Tag,
  pub next: *mut Block,
  pub prev: *mut Block,
}

/// Address of the block's footer tag.
///
/// # Safety
///
/// `bp` must point at a block whose header holds the block's true size.
pub unsafe fn footer(bp: *mut Block) -> *mut Tag {
  unsafe { (bp as *mut u8).add((*bp).header.size() - WORD) as *mut Tag }
}

/// The physically next block.
///
/// # Safety
///
/// `bp` must point at a valid block that is not the epilogue.
pub unsafe fn next_block(bp: *mut Block) -> *mut Block {
  unsafe { (bp as *mut u8).add((*bp).header.size()) as *mut Block }
}

/// The footer tag of the physically previous block.
///
/// # Safety
///
/// `bp` must point at a valid block that is not the prologue.
pub unsafe fn prev_footer(bp: *mut Block) -> *mut Tag {
  unsafe { (bp as *mut u8).sub(WORD) as *mut Tag }
}

/// The physically previous block, located through its footer.
///
/// # Safety
///
/// `bp` must point at a valid block whose predecessor wrote a footer.
pub unsafe fn prev_block(bp: *mut Block) -> *mut Block {
  unsafe { (bp as *mut u8).sub((*prev_footer(bp)).size()) as *mut Block }
}

/// Payload address handed to callers.
///
/// # Safety
///
/// `bp` must point at a valid block.
pub unsafe fn payload(bp: *mut Block) -> *mut u8 {
  unsafe { (bp as *mut u8).add(WORD) }
}

/// Recovers the block base from a payload pointer.
///
/// # Safety
///
/// `payload` must have been produced by [`payload`] on a live block.
pub unsafe fn from_payload(payload: *mut u8) -> *mut Block {
  unsafe { payload.sub(WORD) as *mut Block }
}

/// Rewrites header and footer with the same `{size, state}` pair.
///
/// The header is written first; the footer location is then derived from
/// the new size, so this also serves to grow a block over its successor.
///
/// # Safety
///
/// The whole `size` bytes starting at `bp` must lie inside the arena and
/// belong to blocks being merged or carved by the caller.
pub unsafe fn pack_tags(
  bp: *mut Block,
  size: usize,
  state: BlockState,
) {
  unsafe {
    (*bp).header.pack(size, state);
    (*footer(bp)).pack(size, state);
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn tag_pack_roundtrip() {
    let mut tag = Tag { bits: 0, _pad: 0 };

    tag.pack(4096, BlockState::Allocated);
    assert_eq!(tag.size(), 4096);
    assert!(tag.is_allocated());

    tag.pack(4096, BlockState::Free);
    assert_eq!(tag.size(), 4096);
    assert!(!tag.is_allocated());
  }

  #[test]
  fn tags_bound_the_block() {
    // Backing store for one MIN_BLOCK-sized block plus slack.
    let mut buf = [0u64; 6];
    let bp = buf.as_mut_ptr() as *mut Block;

    unsafe {
      pack_tags(bp, MIN_BLOCK, BlockState::Free);

      assert_eq!(footer(bp) as usize, bp as usize + MIN_BLOCK - WORD);
      assert_eq!(next_block(bp) as usize, bp as usize + MIN_BLOCK);
      assert_eq!(payload(bp), (bp as *mut u8).add(WORD));
      assert_eq!(from_payload(payload(bp)), bp);

      // The next block finds this one through the shared footer.
      let next = next_block(bp);
      assert_eq!(prev_footer(next), footer(bp));
      assert_eq!(prev_block(next), bp);
    }
  }
}
