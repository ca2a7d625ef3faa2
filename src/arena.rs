//! Heap arena: the single contiguous region the allocator subdivides.
//!
//! The arena exposes the classic `sbrk` contract — a monotonically growing
//! break inside one region, with the current low and high bounds — but
//! simulates it over an anonymous private mapping instead of moving the
//! real program break. The whole reservation is mapped up front; `sbrk`
//! only advances the break within it, so block addresses never move and
//! every `Arena` value is independent of every other.
//!
//! ```text
//!   base                     base + brk              base + limit
//!   ▼                        ▼                       ▼
//!   ┌────────────────────────┬───────────────────────┐
//!   │   heap (claimed)       │   reserved, unused    │
//!   └────────────────────────┴───────────────────────┘
//!   ◄──── lo() .. hi() ─────►
//! ```

use std::{io, ptr};

use libc::{MAP_ANONYMOUS, MAP_FAILED, MAP_PRIVATE, PROT_READ, PROT_WRITE, c_void};
use thiserror::Error;
use tracing::debug;

/// Default reservation: 20 MiB, the ceiling a heap may grow to.
pub const MAX_HEAP: usize = 20 * (1 << 20);

/// Failures mapping or growing the arena.
#[derive(Debug, Error)]
pub enum ArenaError {
  /// The reservation itself could not be mapped.
  #[error("failed to map heap arena: {0}")]
  Map(#[from] io::Error),

  /// A grow request ran past the reservation.
  #[error("heap limit exceeded: requested {requested} bytes, {available} available")]
  Exhausted { requested: usize, available: usize },
}

/// A monotonically growing memory region with `sbrk` semantics.
pub struct Arena {
  base: *mut u8,
  brk: usize,
  limit: usize,
}

impl Arena {
  /// Reserves `limit` bytes of address space.
  ///
  /// Nothing counts as heap until [`sbrk`](Self::sbrk) claims it.
  pub fn new(limit: usize) -> Result<Self, ArenaError> {
    let base = unsafe {
      libc::mmap(
        ptr::null_mut(),
        limit,
        PROT_READ | PROT_WRITE,
        MAP_PRIVATE | MAP_ANONYMOUS,
        -1,
        0,
      )
    };

    if base == MAP_FAILED {
      return Err(ArenaError::Map(io::Error::last_os_error()));
    }

    debug!(limit, base = ?base, "mapped heap arena");

    Ok(Self {
      base: base as *mut u8,
      brk: 0,
      limit,
    })
  }

  /// Extends the heap by `incr` bytes and returns the old break, the base
  /// of the newly claimed region.
  ///
  /// The allocator never asks for a non-positive increment; growing past
  /// the reservation fails with [`ArenaError::Exhausted`] and leaves the
  /// break untouched.
  pub fn sbrk(
    &mut self,
    incr: usize,
  ) -> Result<*mut u8, ArenaError> {
    debug_assert!(incr > 0, "sbrk increment must be positive");

    let available = self.limit - self.brk;
    if incr > available {
      return Err(ArenaError::Exhausted {
        requested: incr,
        available,
      });
    }

    let old = unsafe { self.base.add(self.brk) };
    self.brk += incr;

    debug!(incr, brk = self.brk, "extended arena");

    Ok(old)
  }

  /// Lowest heap address.
  pub fn lo(&self) -> *mut u8 {
    self.base
  }

  /// One past the highest heap address.
  pub fn hi(&self) -> *mut u8 {
    unsafe { self.base.add(self.brk) }
  }

  /// Bytes claimed so far.
  pub fn size(&self) -> usize {
    self.brk
  }
}

impl Drop for Arena {
  fn drop(&mut self) {
    unsafe {
      libc::munmap(self.base as *mut c_void, self.limit);
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn sbrk_is_monotonic_and_contiguous() {
    let mut arena = Arena::new(1 << 16).unwrap();
    assert_eq!(arena.size(), 0);
    assert_eq!(arena.lo(), arena.hi());

    let first = arena.sbrk(4096).unwrap();
    assert_eq!(first, arena.lo());
    assert_eq!(arena.size(), 4096);

    let second = arena.sbrk(512).unwrap();
    assert_eq!(second as usize, first as usize + 4096);
    assert_eq!(arena.hi() as usize, second as usize + 512);
  }

  #[test]
  fn sbrk_fails_past_the_reservation() {
    let mut arena = Arena::new(8192).unwrap();
    arena.sbrk(8000).unwrap();

    match arena.sbrk(1024) {
      Err(ArenaError::Exhausted {
        requested,
        available,
      }) => {
        assert_eq!(requested, 1024);
        assert_eq!(available, 192);
      }
      other => panic!("expected exhaustion, got {other:?}"),
    }

    // A failed grow must not move the break.
    assert_eq!(arena.size(), 8000);
  }

  #[test]
  fn claimed_memory_is_writable() {
    let mut arena = Arena::new(1 << 16).unwrap();
    let region = arena.sbrk(4096).unwrap();

    unsafe {
      ptr::write_bytes(region, 0x5A, 4096);
      assert_eq!(*region, 0x5A);
      assert_eq!(*region.add(4095), 0x5A);
    }
  }
}
