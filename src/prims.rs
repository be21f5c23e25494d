// Hosted SIMT primitives.
//
// On the device these are CSR accesses and barrier instructions. On the
// host every NoCL thread is an OS thread, and the state the hardware would
// keep per hart lives in a thread-local.

use std::cell::RefCell;
use std::sync::atomic::{self, Ordering};
use std::sync::{Arc, Barrier};

// Device configuration
// ====================

pub mod config {
  // Number of lanes per warp
  pub const SIMT_LOG_LANES : usize = 5;
  pub const SIMT_LANES : usize = 1 << SIMT_LOG_LANES;

  // Number of warps
  pub const SIMT_LOG_WARPS : usize = 5;
  pub const SIMT_WARPS : usize = 1 << SIMT_LOG_WARPS;

  // Shared local memory: banks of 32-bit words
  pub const SIMT_LOG_SRAM_BANKS : usize = 5;
  pub const SIMT_LOG_WORDS_PER_SRAM_BANK : usize = 9;
  pub const SRAM_WORDS : usize =
    1 << (SIMT_LOG_SRAM_BANKS + SIMT_LOG_WORDS_PER_SRAM_BANK);

  // Stack given to each hosted hardware thread
  pub const HART_STACK_BYTES : usize = 256 << 10;
}

// Per-hart state
// ==============

struct Hart {
  id : usize,
  barrier : Arc<Barrier>
}

thread_local! {
  static HART : RefCell<Option<Hart>> = const { RefCell::new(None) };
}

// Bind the calling OS thread to a hardware thread id and its block barrier.
pub(crate) fn simt_enter(id : usize, barrier : Arc<Barrier>) {
  HART.with(|h| *h.borrow_mut() = Some(Hart { id, barrier }))
}

// Release the binding made by `simt_enter`.
pub(crate) fn simt_exit() {
  HART.with(|h| *h.borrow_mut() = None)
}

// Hardware thread id of the caller.
pub fn hart_id() -> usize {
  HART.with(|h| {
    let hart = h.borrow();
    assert(hart.is_some(), "hart_id() called outside a kernel");
    hart.as_ref().map_or(0, |hart| hart.id)
  })
}

// Block-wide barrier: wait until every thread of the block arrives.
pub fn simt_barrier() {
  let barrier = HART.with(|h| h.borrow().as_ref().map(|hart| hart.barrier.clone()));
  match barrier {
    Some(b) => { b.wait(); }
    None => assert(false, "simt_barrier() called outside a kernel")
  }
}

// Make all prior writes visible before the thread retires.
#[inline(always)]
pub fn fence() {
  atomic::fence(Ordering::SeqCst)
}

// Trap on a violated device-side assumption.
#[inline(always)]
#[track_caller]
pub fn assert(cond : bool, msg : &str) {
  if !cond { panic!("{}", msg) }
}
