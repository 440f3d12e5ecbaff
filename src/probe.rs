//! A CPU-bound workload with no memory traffic, used to sanity-check the
//! measurement wrapper against something other than a scan.

use std::hint::black_box;

/// Problem sizes measured after the counting kernels.
pub const FIB_SIZES: [u32; 2] = [10, 40];

#[inline(never)]
pub fn fib(n: u32) -> u64 {
    match black_box(n) {
        0 => 0,
        1 => 1,
        n => fib(n - 1) + fib(n - 2),
    }
}
