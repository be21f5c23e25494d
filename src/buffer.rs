// Device memory.
//
// The device is a 32-bit machine: global and shared local memory are arrays
// of 32-bit words. Threads of a kernel share them by reference; ordering
// between threads comes from barriers and kernel completion, so individual
// word accesses are relaxed.

use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU32, Ordering};

use thiserror::Error;

use crate::prims;

// Element types
// =============

// A value that fits in one device word and supports the scan's addition.
pub trait Word : Copy + Default + PartialEq + fmt::Debug + Send + Sync + 'static {
  // Additive identity, used for padding.
  const ZERO : Self;

  fn to_word(self) -> u32;
  fn from_word(word : u32) -> Self;

  // Addition as the device performs it (integers wrap).
  fn plus(self, rhs : Self) -> Self;
}

impl Word for u32 {
  const ZERO : Self = 0;
  #[inline(always)]
  fn to_word(self) -> u32 { self }
  #[inline(always)]
  fn from_word(word : u32) -> Self { word }
  #[inline(always)]
  fn plus(self, rhs : Self) -> Self { self.wrapping_add(rhs) }
}

impl Word for i32 {
  const ZERO : Self = 0;
  #[inline(always)]
  fn to_word(self) -> u32 { self as u32 }
  #[inline(always)]
  fn from_word(word : u32) -> Self { word as i32 }
  #[inline(always)]
  fn plus(self, rhs : Self) -> Self { self.wrapping_add(rhs) }
}

impl Word for f32 {
  const ZERO : Self = 0.0;
  #[inline(always)]
  fn to_word(self) -> u32 { self.to_bits() }
  #[inline(always)]
  fn from_word(word : u32) -> Self { f32::from_bits(word) }
  #[inline(always)]
  fn plus(self, rhs : Self) -> Self { self + rhs }
}

// Errors
// ======

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BufferError {
  #[error("Buffer allocation failed: requested {requested} words")]
  AllocationFailed { requested : usize },
}

// Global memory
// =============

// A fixed-length array in global memory.
pub struct Buffer<T> {
  words : Box<[AtomicU32]>,
  _elem : PhantomData<T>,
}

fn try_alloc_words(n : usize) -> Result<Vec<AtomicU32>, BufferError> {
  let mut words = Vec::new();
  words
    .try_reserve_exact(n)
    .map_err(|_| BufferError::AllocationFailed { requested: n })?;
  Ok(words)
}

impl<T : Word> Buffer<T> {
  // Allocate `len` elements, all zero.
  pub fn zeroed(len : usize) -> Result<Self, BufferError> {
    let mut words = try_alloc_words(len)?;
    words.extend((0 .. len).map(|_| AtomicU32::new(T::ZERO.to_word())));
    Ok(Self { words: words.into_boxed_slice(), _elem: PhantomData })
  }

  // Allocate a buffer holding a copy of `data`.
  pub fn from_slice(data : &[T]) -> Result<Self, BufferError> {
    let mut words = try_alloc_words(data.len())?;
    words.extend(data.iter().map(|x| AtomicU32::new(x.to_word())));
    Ok(Self { words: words.into_boxed_slice(), _elem: PhantomData })
  }

  #[inline(always)]
  pub fn len(&self) -> usize {
    self.words.len()
  }

  #[inline(always)]
  pub fn is_empty(&self) -> bool {
    self.words.is_empty()
  }

  #[inline(always)]
  pub fn get(&self, i : usize) -> T {
    T::from_word(self.words[i].load(Ordering::Relaxed))
  }

  #[inline(always)]
  pub fn set(&self, i : usize, x : T) {
    self.words[i].store(x.to_word(), Ordering::Relaxed)
  }

  // Overwrite every element with the matching element of `src`. The two
  // buffers must have the same length.
  pub fn copy_from(&self, src : &Buffer<T>) {
    prims::assert(self.len() == src.len(), "copy_from: length mismatch");
    for (dst, w) in self.words.iter().zip(src.words.iter()) {
      dst.store(w.load(Ordering::Relaxed), Ordering::Relaxed)
    }
  }

  // Copy the contents back to the host.
  pub fn to_vec(&self) -> Vec<T> {
    (0 .. self.len()).map(|i| self.get(i)).collect()
  }
}

impl<T : Word> fmt::Debug for Buffer<T> {
  fn fmt(&self, f : &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_list().entries((0 .. self.len()).map(|i| self.get(i))).finish()
  }
}

// Shared local memory
// ===================

// A typed view onto part of a block's shared local memory.
#[derive(Clone, Copy)]
pub struct Local<'s, T> {
  words : &'s [AtomicU32],
  _elem : PhantomData<T>,
}

impl<'s, T : Word> Local<'s, T> {
  pub(crate) fn new(words : &'s [AtomicU32]) -> Self {
    Self { words, _elem: PhantomData }
  }

  #[inline(always)]
  pub fn len(&self) -> usize {
    self.words.len()
  }

  #[inline(always)]
  pub fn is_empty(&self) -> bool {
    self.words.is_empty()
  }

  #[inline(always)]
  pub fn get(&self, i : usize) -> T {
    T::from_word(self.words[i].load(Ordering::Relaxed))
  }

  #[inline(always)]
  pub fn set(&self, i : usize, x : T) {
    self.words[i].store(x.to_word(), Ordering::Relaxed)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn words_preserve_values() {
    assert_eq!(i32::from_word((-5i32).to_word()), -5);
    assert_eq!(f32::from_word(1.5f32.to_word()), 1.5);
    assert_eq!(u32::MAX.plus(2), 1);
    assert_eq!(i32::MAX.plus(1), i32::MIN);
  }

  #[test]
  fn buffer_copies_in_and_out() {
    let buf = Buffer::from_slice(&[3i32, -1, 4]).unwrap();
    assert_eq!(buf.len(), 3);
    buf.set(1, 10);
    assert_eq!(buf.to_vec(), vec![3, 10, 4]);
  }

  #[test]
  fn zeroed_buffer_holds_identity() {
    let buf = Buffer::<f32>::zeroed(4).unwrap();
    assert_eq!(buf.to_vec(), vec![0.0; 4]);
    assert!(Buffer::<u32>::zeroed(0).unwrap().is_empty());
  }

  #[test]
  fn copy_from_overwrites_every_element() {
    let src = Buffer::from_slice(&[1u32, 2, 3]).unwrap();
    let dst = Buffer::from_slice(&[9u32, 9, 9]).unwrap();
    dst.copy_from(&src);
    assert_eq!(dst.to_vec(), vec![1, 2, 3]);
    assert_eq!(src.to_vec(), vec![1, 2, 3]);
  }

  #[test]
  #[should_panic(expected = "length mismatch")]
  fn copy_from_rejects_other_lengths() {
    let src = Buffer::<u32>::zeroed(2).unwrap();
    Buffer::<u32>::zeroed(3).unwrap().copy_from(&src);
  }

  #[test]
  fn absurd_allocation_is_reported() {
    let err = Buffer::<u32>::zeroed(usize::MAX).unwrap_err();
    assert_eq!(err, BufferError::AllocationFailed { requested: usize::MAX });
  }
}
