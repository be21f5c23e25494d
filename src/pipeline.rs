// Scan pipeline
// =============
//
// Three launches, each waited on before the next starts:
//
//   1. ChunkScan over every chunk, recording chunk totals
//   2. ChunkScan over the totals (a single block)
//   3. AddOffsets over every chunk
//
// There is no way for one block to wait for another inside a launch, so the
// launch boundaries are the only global barriers.

use thiserror::Error;
use tracing::{debug, instrument};

use crate::buffer::{Buffer, BufferError, Word};
use crate::nocl::*;
use crate::prims;
use crate::scan::{AddOffsets, ChunkScan};

// Default threads per block.
pub const DEFAULT_GROUP_SIZE : usize = 512;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScanError {
  #[error("Buffer allocation failed: requested {requested} words")]
  ResourceExhaustion { requested : usize },
  #[error("{chunks} chunks exceed the single-level capacity of {capacity}")]
  CapacityViolation { chunks : usize, capacity : usize },
  #[error("Invalid group size {0}: must be a power of two no larger than {1}")]
  InvalidGroupSize(usize, usize),
  #[error("Output length {output} does not match input length {input}")]
  LengthMismatch { input : usize, output : usize },
  #[error("Kernel launch failed: {0}")]
  Launch(#[from] NoclError),
}

impl From<BufferError> for ScanError {
  fn from(e : BufferError) -> Self {
    match e {
      BufferError::AllocationFailed { requested } =>
        ScanError::ResourceExhaustion { requested },
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanConfig {
  // Threads per block (G). Each block scans a chunk of 2G elements.
  pub group_size : usize,
  // Scan the chunk totals with the full pipeline when they do not fit in
  // one chunk, instead of reporting `CapacityViolation`.
  pub recursive : bool,
}

impl Default for ScanConfig {
  fn default() -> Self {
    Self { group_size: DEFAULT_GROUP_SIZE, recursive: false }
  }
}

impl ScanConfig {
  pub fn with_group_size(mut self, group_size : usize) -> Self {
    self.group_size = group_size;
    self
  }

  pub fn with_recursive(mut self, recursive : bool) -> Self {
    self.recursive = recursive;
    self
  }
}

// Launch geometry for one pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
  pub len : usize,
  pub group_size : usize,
  pub chunk_size : usize,
  pub chunks : usize,
}

impl Geometry {
  pub fn new(len : usize, config : &ScanConfig) -> Result<Self, ScanError> {
    let g = config.group_size;
    let simt_threads = prims::config::SIMT_WARPS * prims::config::SIMT_LANES;
    if !g.is_power_of_two() || g > simt_threads {
      return Err(ScanError::InvalidGroupSize(g, simt_threads))
    }
    let chunk_size = 2 * g;
    let chunks = len.div_ceil(chunk_size);
    if chunks > chunk_size && !config.recursive {
      return Err(ScanError::CapacityViolation { chunks, capacity: chunk_size })
    }
    Ok(Self { len, group_size: g, chunk_size, chunks })
  }

  // Whether the chunk totals fit in a single block.
  pub fn single_level(&self) -> bool {
    self.chunks <= self.chunk_size
  }

  fn dims(&self, blocks : usize) -> Dims {
    Dims {
      block_dim: Dim2 { x: self.group_size, y: 1 },
      grid_dim: Dim2 { x: blocks, y: 1 }
    }
  }
}

// Stage 1: scan every chunk of `input` into `partial`, writing chunk sums
// to `totals`.
pub fn scan_chunks<T : Word>(geom : &Geometry, input : &Buffer<T>, partial : &Buffer<T>,
                             totals : &Buffer<T>) -> Result<(), ScanError> {
  let params = ChunkScan {
    len: geom.len,
    input,
    output: partial,
    totals: Some(totals)
  };
  nocl_run_kernel(&geom.dims(geom.chunks), &params)?;
  debug!(chunks = geom.chunks, "chunks scanned");
  Ok(())
}

// Stage 2: inclusive scan of the chunk totals in a single block. Requires
// `geom.single_level()`.
pub fn scan_offsets<T : Word>(geom : &Geometry, totals : &Buffer<T>,
                              offsets : &Buffer<T>) -> Result<(), ScanError> {
  if !geom.single_level() {
    return Err(ScanError::CapacityViolation {
      chunks: geom.chunks, capacity: geom.chunk_size })
  }
  let params = ChunkScan {
    len: geom.chunks,
    input: totals,
    output: offsets,
    totals: None
  };
  nocl_run_kernel(&geom.dims(1), &params)?;
  debug!(chunks = geom.chunks, "chunk totals scanned");
  Ok(())
}

// Stage 3: add `offsets[k-1]` to every element of chunk `k > 0`.
pub fn add_offsets<T : Word>(geom : &Geometry, offsets : &Buffer<T>,
                             data : &Buffer<T>) -> Result<(), ScanError> {
  if geom.chunks < 2 {
    return Ok(())
  }
  let params = AddOffsets { len: geom.len, offsets, data };
  nocl_run_kernel(&geom.dims(geom.chunks), &params)?;
  debug!(chunks = geom.chunks, "offsets added");
  Ok(())
}

// Inclusive prefix sum over a device buffer.
#[derive(Debug, Clone, Default)]
pub struct ScanPipeline {
  config : ScanConfig,
}

impl ScanPipeline {
  pub fn new(config : ScanConfig) -> Self {
    Self { config }
  }

  pub fn config(&self) -> &ScanConfig {
    &self.config
  }

  // Scan `input` into a newly allocated vector.
  pub fn run<T : Word>(&self, input : &[T]) -> Result<Vec<T>, ScanError> {
    // Reject a bad configuration even when there is nothing to do
    Geometry::new(input.len(), &self.config)?;
    if input.is_empty() {
      return Ok(Vec::new())
    }
    let input = Buffer::from_slice(input)?;
    let output = Buffer::zeroed(input.len())?;
    self.scan_into(&input, &output)?;
    Ok(output.to_vec())
  }

  // Scan `input` into `output`, which must have the same length. On error
  // `output` is left as it was.
  pub fn run_buffers<T : Word>(&self, input : &Buffer<T>,
                               output : &Buffer<T>) -> Result<(), ScanError> {
    if input.len() != output.len() {
      return Err(ScanError::LengthMismatch { input: input.len(), output: output.len() })
    }
    let scratch = Buffer::zeroed(input.len())?;
    self.scan_into(input, &scratch)?;
    output.copy_from(&scratch);
    Ok(())
  }

  // All three stages, writing straight into `output`.
  #[instrument(name = "scan.pipeline", skip_all,
               fields(len = input.len(), group_size = self.config.group_size))]
  fn scan_into<T : Word>(&self, input : &Buffer<T>,
                         output : &Buffer<T>) -> Result<(), ScanError> {
    let geom = Geometry::new(input.len(), &self.config)?;
    debug!(?geom, "geometry");
    if geom.len == 0 {
      return Ok(())
    }

    // Auxiliary buffers, one word per chunk
    let totals = Buffer::zeroed(geom.chunks)?;
    let offsets = Buffer::zeroed(geom.chunks)?;

    scan_chunks(&geom, input, output, &totals)?;
    if geom.single_level() {
      scan_offsets(&geom, &totals, &offsets)?;
    }
    else {
      debug!(chunks = geom.chunks, "chunk totals exceed one block; recursing");
      self.scan_into(&totals, &offsets)?;
    }
    add_offsets(&geom, &offsets, output)
  }
}

// Inclusive prefix sum with the default configuration.
pub fn prefix_sum<T : Word>(input : &[T]) -> Result<Vec<T>, ScanError> {
  ScanPipeline::default().run(input)
}

#[cfg(test)]
mod tests {
  use super::*;
  use test_case::test_case;

  fn pipeline(g : usize) -> ScanPipeline {
    ScanPipeline::new(ScanConfig::default().with_group_size(g))
  }

  #[test_case(0, 2 => (0, 4) ; "empty")]
  #[test_case(1, 2 => (1, 4) ; "one element")]
  #[test_case(4, 2 => (1, 4) ; "exactly one chunk")]
  #[test_case(9, 2 => (3, 4) ; "partial last chunk")]
  #[test_case(1 << 20, 512 => (1024, 1024) ; "full capacity")]
  fn geometry(len : usize, g : usize) -> (usize, usize) {
    let geom = Geometry::new(len, &ScanConfig::default().with_group_size(g)).unwrap();
    (geom.chunks, geom.chunk_size)
  }

  #[test_case(0)]
  #[test_case(3)]
  #[test_case(2048)]
  fn rejects_group_size(g : usize) {
    assert!(matches!(Geometry::new(10, &ScanConfig::default().with_group_size(g)),
                     Err(ScanError::InvalidGroupSize(..))));
  }

  #[test]
  fn capacity_is_checked_before_any_launch() {
    let err = pipeline(2).run(&[1u32; 17]).unwrap_err();
    assert_eq!(err, ScanError::CapacityViolation { chunks: 5, capacity: 4 });
  }

  #[test]
  fn stages_expose_totals_and_offsets() {
    let geom = Geometry::new(8, &ScanConfig::default().with_group_size(2)).unwrap();
    let input = Buffer::from_slice(&[1i32; 8]).unwrap();
    let output = Buffer::zeroed(8).unwrap();
    let totals = Buffer::zeroed(geom.chunks).unwrap();
    let offsets = Buffer::zeroed(geom.chunks).unwrap();

    scan_chunks(&geom, &input, &output, &totals).unwrap();
    assert_eq!(totals.to_vec(), vec![4, 4]);
    scan_offsets(&geom, &totals, &offsets).unwrap();
    // Inclusive; chunk k uses offsets[k-1], giving exclusive offsets [0, 4]
    assert_eq!(offsets.to_vec(), vec![4, 8]);
    add_offsets(&geom, &offsets, &output).unwrap();
    assert_eq!(output.to_vec(), (1 ..= 8).collect::<Vec<i32>>());
  }

  #[test]
  fn single_chunk_leaves_partial_output_alone() {
    let geom = Geometry::new(4, &ScanConfig::default().with_group_size(2)).unwrap();
    let data = Buffer::from_slice(&[1u32, 3, 6, 10]).unwrap();
    let offsets = Buffer::from_slice(&[10u32]).unwrap();
    add_offsets(&geom, &offsets, &data).unwrap();
    assert_eq!(data.to_vec(), vec![1, 3, 6, 10]);
  }

  #[test]
  fn recursive_mode_lifts_capacity_bound() {
    let input : Vec<u32> = (0 .. 100).collect();
    let config = ScanConfig::default().with_group_size(2).with_recursive(true);
    let out = ScanPipeline::new(config).run(&input).unwrap();
    let expected : Vec<u32> = input.iter()
      .scan(0, |acc, &x| { *acc += x; Some(*acc) })
      .collect();
    assert_eq!(out, expected);
  }

  #[test]
  fn mismatched_output_is_rejected() {
    let input = Buffer::from_slice(&[1u32, 2, 3]).unwrap();
    let output = Buffer::zeroed(2).unwrap();
    assert_eq!(pipeline(2).run_buffers(&input, &output),
               Err(ScanError::LengthMismatch { input: 3, output: 2 }));
  }

  #[test]
  fn failed_run_leaves_output_untouched() {
    let input = Buffer::from_slice(&[1u32; 17]).unwrap();
    let output = Buffer::from_slice(&[7u32; 17]).unwrap();
    assert_eq!(pipeline(2).run_buffers(&input, &output),
               Err(ScanError::CapacityViolation { chunks: 5, capacity: 4 }));
    assert_eq!(output.to_vec(), vec![7u32; 17]);
  }

  #[test]
  fn allocation_failure_is_resource_exhaustion() {
    assert_eq!(ScanError::from(BufferError::AllocationFailed { requested: 7 }),
               ScanError::ResourceExhaustion { requested: 7 });

    fn alloc(len : usize) -> Result<Buffer<u32>, ScanError> {
      Ok(Buffer::zeroed(len)?)
    }
    assert_eq!(alloc(usize::MAX).unwrap_err(),
               ScanError::ResourceExhaustion { requested: usize::MAX });
    assert_eq!(alloc(3).unwrap().len(), 3);
  }

  #[test]
  fn bad_group_size_rejected_for_empty_input() {
    assert!(matches!(pipeline(6).run::<u32>(&[]),
                     Err(ScanError::InvalidGroupSize(6, _))));
  }
}
