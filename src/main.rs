// Self test: scan pseudo-random data and check it against a sequential scan.

use std::process::ExitCode;

use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

use nocl_scan::rand::rand15;
use nocl_scan::{ScanConfig, ScanPipeline};

fn setup_tracing() {
  let env_filter = EnvFilter::try_from_default_env()
    .unwrap_or_else(|_| EnvFilter::new("info"));
  let _ = Registry::default()
    .with(env_filter)
    .with(tracing_subscriber::fmt::layer())
    .try_init();
}

fn main() -> ExitCode {
  setup_tracing();

  // Vector size for benchmarking
  #[cfg(not(feature = "large_data_set"))]
  const N : usize = 3000;
  #[cfg(feature = "large_data_set")]
  const N : usize = 1000000;

  // Initialise inputs
  let mut seed : u32 = 1;
  let input : Vec<i32> = (0 .. N).map(|_| rand15(&mut seed) as i32).collect();

  let pipeline = ScanPipeline::new(ScanConfig::default());
  let output = match pipeline.run(&input) {
    Ok(output) => output,
    Err(e) => {
      error!("scan failed: {e}");
      return ExitCode::FAILURE
    }
  };

  // Check result
  let mut ok = output.len() == N;
  let mut acc : i32 = 0;
  for (x, y) in input.iter().zip(&output) {
    acc = acc.wrapping_add(*x);
    ok = ok && *y == acc
  }
  info!(len = N, group_size = pipeline.config().group_size, "scan finished");

  // Display result
  println!("Self test: {}", if ok { "PASSED" } else { "FAILED" });
  if ok { ExitCode::SUCCESS } else { ExitCode::FAILURE }
}
