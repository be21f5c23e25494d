// 15-bit linear congruential generator, for self-test data.
pub fn rand15(seed : &mut u32) -> u32 {
  *seed = seed.wrapping_mul(1664525).wrapping_add(1013904223) & 0x7fffffff;
  *seed >> 16
}
