// Scan kernels
// ============
//
// A chunk of 2 * block_dim.x elements is scanned by one block of threads
// (work-efficient up-sweep/down-sweep in shared local memory). The same
// kernel scans the per-chunk totals, and a second kernel adds each chunk's
// preceding total back into it.

use crate::buffer::{Buffer, Word};
use crate::nocl::*;

// Inclusive scan of each chunk of `input` into `output`. When `totals` is
// given, the sum of chunk `k` is written to `totals[k]`.
pub struct ChunkScan<'t, T> {
  pub len    : usize,
  pub input  : &'t Buffer<T>,
  pub output : &'t Buffer<T>,
  pub totals : Option<&'t Buffer<T>>
}

impl<T : Word> Code for ChunkScan<'_, T> {

#[inline(always)]
fn run(my : &My, shared : &mut Mem, params : &Self) {
  let g = my.block_dim.x;
  let chunk = 2 * g;
  let temp = alloc::<T>(shared, chunk);

  // Shorthand for local thread id
  let t = my.thread_idx.x;
  let base = my.block_idx.x * chunk;

  // Load data, padding with zeros past the end
  for i in [t, t + g] {
    let x = if base + i < params.len { params.input.get(base + i) } else { T::ZERO };
    temp.set(i, x)
  }
  syncthreads();

  // Up-sweep: build partial sums in place; temp[chunk-1] ends up with the total
  let mut stride = 1;
  while stride <= g {
    let index = (t + 1) * stride * 2 - 1;
    if index < chunk {
      temp.set(index, temp.get(index).plus(temp.get(index - stride)))
    }
    syncthreads();
    stride <<= 1
  }

  // Down-sweep: push partial sums right to complete the inclusive scan
  let mut stride = g >> 1;
  while stride > 0 {
    let index = (t + 1) * stride * 2 - 1;
    if index + stride < chunk {
      temp.set(index + stride, temp.get(index + stride).plus(temp.get(index)))
    }
    syncthreads();
    stride >>= 1
  }

  // Store data
  for i in [t, t + g] {
    if base + i < params.len { params.output.set(base + i, temp.get(i)) }
  }
  if let Some(totals) = params.totals {
    if t == g - 1 { totals.set(my.block_idx.x, temp.get(chunk - 1)) }
  }
}

fn shared_words(dims : &Dims) -> usize { 2 * dims.block_dim.x }

}

// Add the inclusive scan of the chunk totals back into every chunk but the
// first: chunk `k` receives `offsets[k-1]`.
pub struct AddOffsets<'t, T> {
  pub len     : usize,
  pub offsets : &'t Buffer<T>,
  pub data    : &'t Buffer<T>
}

impl<T : Word> Code for AddOffsets<'_, T> {

#[inline(always)]
fn run(my : &My, _shared : &mut Mem, params : &Self) {
  let k = my.block_idx.x;
  if k == 0 { return }

  let g = my.block_dim.x;
  let base = k * 2 * g;
  let offset = params.offsets.get(k - 1);
  for i in [my.thread_idx.x, my.thread_idx.x + g] {
    if base + i < params.len {
      params.data.set(base + i, params.data.get(base + i).plus(offset))
    }
  }
}

}

#[cfg(test)]
mod tests {
  use super::*;

  fn dims(chunks : usize, g : usize) -> Dims {
    Dims {
      block_dim: Dim2 { x: g, y: 1 },
      grid_dim: Dim2 { x: chunks, y: 1 }
    }
  }

  fn scan_chunks<T : Word>(input : &[T], g : usize) -> (Vec<T>, Vec<T>) {
    let chunks = input.len().div_ceil(2 * g);
    let input_buf = Buffer::from_slice(input).unwrap();
    let output = Buffer::zeroed(input.len()).unwrap();
    let totals = Buffer::zeroed(chunks).unwrap();
    let params = ChunkScan {
      len: input.len(),
      input: &input_buf,
      output: &output,
      totals: Some(&totals)
    };
    nocl_run_kernel(&dims(chunks, g), &params).unwrap();
    (output.to_vec(), totals.to_vec())
  }

  #[test]
  fn scans_single_full_chunk() {
    let (out, totals) = scan_chunks(&[1i32, 2, 3, 4], 2);
    assert_eq!(out, vec![1, 3, 6, 10]);
    assert_eq!(totals, vec![10]);
  }

  #[test]
  fn chunks_are_scanned_independently() {
    let (out, totals) = scan_chunks(&[1u32; 8], 2);
    assert_eq!(out, vec![1, 2, 3, 4, 1, 2, 3, 4]);
    assert_eq!(totals, vec![4, 4]);
  }

  #[test]
  fn padding_does_not_leak_into_partial_chunk() {
    let input : Vec<i32> = (1 ..= 11).collect();
    let (out, totals) = scan_chunks(&input, 4);
    assert_eq!(out, vec![1, 3, 6, 10, 15, 21, 28, 36, 9, 19, 30]);
    assert_eq!(totals, vec![36, 30]);
  }

  #[test]
  fn single_thread_blocks() {
    let (out, totals) = scan_chunks(&[2i32, 3, 5], 1);
    assert_eq!(out, vec![2, 5, 5]);
    assert_eq!(totals, vec![5, 5]);
  }

  #[test]
  fn large_chunk_matches_sequential_scan() {
    let input : Vec<u32> = (0 .. 1024u32).map(|i| (i * 7919) % 101).collect();
    let (out, totals) = scan_chunks(&input, 512);
    let expected : Vec<u32> = input.iter()
      .scan(0, |acc, &x| { *acc += x; Some(*acc) })
      .collect();
    assert_eq!(out, expected);
    assert_eq!(totals, vec![expected[1023]]);
  }

  #[test]
  fn add_offsets_skips_first_chunk() {
    let data = Buffer::from_slice(&[1i32, 2, 3, 4, 1, 2, 3, 4, 1]).unwrap();
    let offsets = Buffer::from_slice(&[4i32, 8, 9]).unwrap();
    let params = AddOffsets { len: 9, offsets: &offsets, data: &data };
    nocl_run_kernel(&dims(3, 2), &params).unwrap();
    assert_eq!(data.to_vec(), vec![1, 2, 3, 4, 5, 6, 7, 8, 9]);
  }
}
