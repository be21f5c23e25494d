// Inclusive prefix sum of large arrays on a NoCL (CUDA-like) device model.
//
// The array is split into chunks of `2 * G` elements, each scanned by one
// block of `G` threads in shared local memory. The chunk totals are scanned
// by a single block and added back into every chunk. See `ScanPipeline`.

// Device primitives and runtime
// =============================

pub mod prims;
pub mod buffer;
pub mod nocl;
pub mod rand;

// Scan
// ====

pub mod scan;
pub mod pipeline;

pub use buffer::{Buffer, BufferError, Word};
pub use nocl::NoclError;
pub use pipeline::{
  add_offsets, prefix_sum, scan_chunks, scan_offsets, Geometry, ScanConfig, ScanError,
  ScanPipeline, DEFAULT_GROUP_SIZE,
};
