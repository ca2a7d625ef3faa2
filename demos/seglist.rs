use segalloc::{CHUNK, Heap};
use tracing_subscriber::EnvFilter;

/// Prints the heap's growth and free-list state under a label.
/// Useful for tracking how each operation reshapes the block chain.
fn print_heap_state(
  label: &str,
  heap: &Heap,
) {
  println!(
    "[{}] heap size = {} bytes, free blocks = {:?}, audit faults = {}",
    label,
    heap.heap_size(),
    heap.free_block_sizes(),
    heap.check(false),
  );
}

fn main() {
  // RUST_LOG=debug shows the allocator's own tracing output between the
  // walkthrough lines.
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::from_default_env())
    .init();

  let mut heap = Heap::new().expect("mapping the heap arena failed");

  unsafe {
    // --------------------------------------------------------------------
    // 1) A fresh heap: one free block spanning the initial chunk, minus
    //    the prologue, epilogue, and the six list-head sentinels.
    // --------------------------------------------------------------------
    println!("\n[1] Fresh heap (initial chunk = {CHUNK} bytes)");
    print_heap_state("init", &heap);

    // --------------------------------------------------------------------
    // 2) Allocate a few blocks. Each one is carved off the front of the
    //    free block, which shrinks accordingly.
    // --------------------------------------------------------------------
    let a = heap.allocate(100);
    let b = heap.allocate(500);
    let c = heap.allocate(100);
    println!("\n[2] Allocated 100, 500, 100 bytes at {a:?}, {b:?}, {c:?}");
    print_heap_state("after allocs", &heap);

    // Write something into a payload to show it's usable.
    a.write_bytes(0xAB, 100);
    println!("[2] Filled the first payload with 0xAB");

    // --------------------------------------------------------------------
    // 3) Free the middle block. Its neighbors are allocated, so it
    //    becomes a free island in its size class.
    // --------------------------------------------------------------------
    heap.free(b);
    println!("\n[3] Freed the middle block");
    print_heap_state("island", &heap);

    // --------------------------------------------------------------------
    // 4) Free the first block, then the third. The third free merges
    //    with both free neighbors at once, and the whole region folds
    //    back into a single block.
    // --------------------------------------------------------------------
    heap.free(a);
    print_heap_state("two islands", &heap);

    heap.free(c);
    println!("\n[4] Freed the remaining blocks; coalescing folded everything back");
    print_heap_state("coalesced", &heap);

    // --------------------------------------------------------------------
    // 5) Reallocate: grow a payload and watch its contents survive.
    // --------------------------------------------------------------------
    let d = heap.allocate(64);
    for i in 0..64 {
      d.add(i).write(i as u8);
    }
    let d = heap.reallocate(d, 4096);
    println!(
      "\n[5] Reallocated 64 -> 4096 bytes; first bytes still {:?}...",
      std::slice::from_raw_parts(d, 4)
    );
    print_heap_state("after realloc", &heap);
    heap.free(d);

    // --------------------------------------------------------------------
    // 6) Force the heap to grow: ask for more than the whole chunk. The
    //    free block at the tail is absorbed, so the heap grows only by
    //    the shortfall.
    // --------------------------------------------------------------------
    let before = heap.heap_size();
    let big = heap.allocate(12_000);
    println!(
      "\n[6] Allocated 12000 bytes; heap grew by {} bytes",
      heap.heap_size() - before
    );
    print_heap_state("extended", &heap);

    heap.free(big);
    print_heap_state("final", &heap);
  }
}
