// Port of NoCL to the host.
//
// Every NoCL thread is an OS thread. The device's hardware threads are
// divided into block slots; a slot holds one resident block at a time and
// strides over the grid, with its own partition of shared local memory and
// its own barrier.

use std::sync::atomic::AtomicU32;
use std::sync::{Arc, Barrier, Condvar, Mutex};
use std::thread;

use rayon::prelude::*;
use thiserror::Error;
use tracing::{debug, instrument};

use crate::buffer::{Local, Word};
use crate::prims;

// Utility functions
// =================

// Return input where only first non-zero bit is set, starting from LSB.
fn first_hot(x : usize) -> usize {
  x & (!x).wrapping_add(1)
}

// Is the given value a power of two?
fn is_one_hot(x : usize) -> bool {
  x > 0 && (x & !first_hot(x)) == 0
}

// Compute logarithm (base 2)
fn log2_floor(input : usize) -> usize {
  let mut x : usize = input;
  let mut count : usize = 0;
  while x > 1 { x >>= 1; count += 1 };
  count
}

// Data types
// ==========

// Structure for holding thread block and grid dimensions.
// Unlike CUDA, we don't (yet) support the Z dimension.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Dim2 {
  pub x : usize,
  pub y : usize
}

// Block and grid dimensions
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Dims {
  pub block_dim : Dim2,
  pub grid_dim : Dim2
}

impl Dims {
  pub fn threads_per_block(&self) -> usize {
    self.block_dim.x * self.block_dim.y
  }

  pub fn num_blocks(&self) -> usize {
    self.grid_dim.x * self.grid_dim.y
  }
}

// Bump allocator over a block's shared local memory, with no ability to
// deallocate. Every thread of a block makes the same sequence of
// allocations and so sees the same arrays.
pub struct Mem<'s> {
  // Remaining space
  next : &'s [AtomicU32]
}

impl<'s> Mem<'s> {
  fn new(local : &'s [AtomicU32]) -> Self {
    Mem { next: local }
  }

  // Words still available
  pub fn space(&self) -> usize {
    self.next.len()
  }
}

// Allocate `n` elements of type `T`.
#[inline(always)]
pub fn alloc<'s, T : Word>(mem : &mut Mem<'s>, n : usize) -> Local<'s, T> {
  prims::assert(mem.space() >= n, "NoCL: out of shared local memory");
  let (words, rest) = mem.next.split_at(n);
  mem.next = rest;
  Local::new(words)
}

// Mapping between hardware threads and NoCL thread/block indices
#[derive(Debug)]
struct ThreadMapping {
  // Use these to map hardware thread id to thread X/Y coords within block
  thread_x_mask : usize,
  thread_y_mask : usize,
  thread_x_shift : usize,

  // Use this to map hardware thread id to its block slot
  block_shift : usize,

  // Number of blocks resident at once
  resident_blocks : usize,

  // Amount of shared local memory available per block (in words)
  local_words_per_block : usize,
}

// Information about a kernel passed from host to device
struct Kernel<'t, P> {
  // Grid and block dimensions
  dims : Dims,

  // Mapping between hardware threads and NoCL thread/block indices
  map : ThreadMapping,

  // Parameters for a specific kernel
  params : &'t P,
}

// Information given to thread so it can determine its identity.
#[derive(Debug)]
pub struct My {
  // Grid and block dimensions
  pub grid_dim : Dim2,
  pub block_dim : Dim2,

  // Block and thread indices
  pub block_idx : Dim2,
  pub thread_idx : Dim2,
}

// Errors
// ======

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NoclError {
  #[error("NoCL: block_dim ({x}, {y}) is not a power of two")]
  BlockDimNotPowerOfTwo { x : usize, y : usize },
  #[error("NoCL: block size {threads} exceeds SIMT thread count {available}")]
  BlockTooLarge { threads : usize, available : usize },
  #[error("NoCL: empty grid")]
  EmptyGrid,
  #[error("NoCL: kernel needs {requested} words of shared local memory, {available} available")]
  SharedMemoryExhausted { requested : usize, available : usize },
  #[error("NoCL: failed to start hardware thread: {0}")]
  Spawn(String),
}

// Traits
// ======

// The code for a kernel.
pub trait Code {
  fn run(my : &My, shared : &mut Mem, params : &Self);

  // Shared local memory (in words) the kernel allocates per block
  fn shared_words(_dims : &Dims) -> usize { 0 }
}

// Device-side main function
// =========================

// Execute kernel code for every block assigned to the calling thread.
fn nocl_simt_main<K : Code>(k : &Kernel<K>, local : &[AtomicU32]) {
  let hart = prims::hart_id();

  // Block slot within the device
  let slot = hart >> k.map.block_shift;

  // Create thread identity
  let mut my =
    My {
      grid_dim: k.dims.grid_dim
    , block_dim: k.dims.block_dim
    , thread_idx:
        Dim2 {
          x: hart & k.map.thread_x_mask,
          y: (hart >> k.map.thread_x_shift) & k.map.thread_y_mask
        }
    , block_idx: Dim2 { x: 0, y: 0 }
    };

  // Invoke kernel
  let num_blocks = k.dims.num_blocks();
  let mut block = slot;
  while block < num_blocks {
    my.block_idx = Dim2 { x: block % my.grid_dim.x, y: block / my.grid_dim.x };
    let mut mem = Mem::new(local);
    K::run(&my, &mut mem, k.params);
    syncthreads();
    block += k.map.resident_blocks;
  }

  // Issue a fence to ensure all data has reached global memory
  prims::fence();
}

// Start gate for the threads of a block slot: they run the kernel only once
// every thread of the slot has been created.
struct Gate {
  state : Mutex<Option<bool>>,
  ready : Condvar
}

impl Gate {
  fn new() -> Self {
    Gate { state: Mutex::new(None), ready: Condvar::new() }
  }

  fn open(&self, go : bool) {
    let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
    *state = Some(go);
    self.ready.notify_all()
  }

  fn wait(&self) -> bool {
    let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
    loop {
      if let Some(go) = *state { return go }
      state = self.ready.wait(state).unwrap_or_else(|e| e.into_inner());
    }
  }
}

// Create the hardware threads of one block slot and wait for them.
fn run_block_slot<K : Code + Sync>(k : &Kernel<K>, slot : usize,
                                   local : &[AtomicU32]) -> Result<(), NoclError> {
  let threads = k.dims.threads_per_block();
  let barrier = Arc::new(Barrier::new(threads));
  let gate = Gate::new();

  thread::scope(|s| {
    let mut started = Ok(());
    for lane in 0 .. threads {
      let hart = (slot << k.map.block_shift) | lane;
      let barrier = barrier.clone();
      let gate = &gate;
      let spawned = thread::Builder::new()
        .name(format!("nocl-hart-{hart}"))
        .stack_size(prims::config::HART_STACK_BYTES)
        .spawn_scoped(s, move || {
          if gate.wait() {
            prims::simt_enter(hart, barrier);
            nocl_simt_main(k, local);
            prims::simt_exit();
          }
        });
      if let Err(e) = spawned {
        started = Err(NoclError::Spawn(e.to_string()));
        break;
      }
    }
    // Threads already created retire without running if the slot is short
    gate.open(started.is_ok());
    started
  })
}

// Host-side kernel invocation
// ===========================

// Run given kernel on device, returning once every block has finished.
#[instrument(name = "nocl.run_kernel", level = "debug", skip_all,
             fields(grid = ?dims.grid_dim, block = ?dims.block_dim))]
pub fn nocl_run_kernel<K : Code + Sync>(dims : &Dims, params : &K) -> Result<(), NoclError> {
  let threads_per_block = dims.threads_per_block();
  let simt_threads = prims::config::SIMT_WARPS *
                     prims::config::SIMT_LANES;

  // Limitations for simplicity
  if !is_one_hot(dims.block_dim.x) || !is_one_hot(dims.block_dim.y) {
    return Err(NoclError::BlockDimNotPowerOfTwo {
      x: dims.block_dim.x, y: dims.block_dim.y })
  }
  if threads_per_block > simt_threads {
    return Err(NoclError::BlockTooLarge {
      threads: threads_per_block, available: simt_threads })
  }
  if dims.num_blocks() == 0 {
    return Err(NoclError::EmptyGrid)
  }

  // Map hardware threads to NoCL thread&block indices
  // -------------------------------------------------

  // Block dimensions are all powers of two
  let thread_x_shift = log2_floor(dims.block_dim.x);
  let thread_y_shift = log2_floor(dims.block_dim.y);

  // Determine amount of shared local memory available per block
  let blocks_per_sm = simt_threads / threads_per_block;
  let local_words_per_block = prims::config::SRAM_WORDS / blocks_per_sm;
  let requested = K::shared_words(dims);
  if requested > local_words_per_block {
    return Err(NoclError::SharedMemoryExhausted {
      requested, available: local_words_per_block })
  }

  // Final mapping
  let map =
    ThreadMapping {
      thread_x_mask: dims.block_dim.x - 1,
      thread_y_mask: dims.block_dim.y - 1,
      thread_x_shift,
      block_shift: thread_x_shift + thread_y_shift,
      resident_blocks: blocks_per_sm.min(dims.num_blocks()),
      local_words_per_block,
    };
  debug!(?map, "thread mapping");

  // End of mapping
  // --------------

  // Shared local memory lives for the duration of the launch
  let sram : [AtomicU32; prims::config::SRAM_WORDS] =
    [const { AtomicU32::new(0) }; prims::config::SRAM_WORDS];

  let k =
    Kernel {
      dims: *dims,
      params,
      map,
    };

  let used = k.map.resident_blocks * k.map.local_words_per_block;
  sram[.. used]
    .par_chunks(k.map.local_words_per_block)
    .enumerate()
    .try_for_each(|(slot, local)| run_block_slot(&k, slot, local))?;

  prims::fence();
  Ok(())
}

// Barrier synchronisation
#[inline(always)]
pub fn syncthreads() { prims::simt_barrier() }
