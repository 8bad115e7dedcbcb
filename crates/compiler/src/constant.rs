//! Useful constants for use within the compiler.

/// The width of the `index` type once lowered to LLVM.
pub const INDEX_BIT_WIDTH: u32 = 64;

/// The number of bits that a `bf16` is shifted by to occupy the upper half of
/// an `f32`.
pub const BF16_SHIFT: i64 = 16;

/// The bias added to the bits of an `f32` before truncating it to a `bf16`.
///
/// Adding this bias plus the least significant bit of the result rounds to
/// nearest with ties to even.
pub const BF16_ROUNDING_BIAS: i64 = 0x7fff;

/// The magnitude beyond which not every integer is representable in an `f64`.
pub const F64_EXACT_INTEGER_LIMIT: i64 = 1 << 53;

/// The low bits of a wide integer that only matter for rounding to `bf16` by
/// whether any of them are set.
pub const STICKY_MASK: i64 = 0xfff;

/// The bit that stands in for the bits of [`STICKY_MASK`] when any of them are
/// set.
pub const STICKY_BIT: i64 = 0x800;

/// The bit set in the truncated bits of an `f32` NaN to make sure that the
/// resulting `bf16` is a quiet NaN.
pub const BF16_QUIET_NAN_BIT: i64 = 0x40;

/// The intrinsics that read the id of the executing thread along each
/// dimension, as an `i32`.
pub const THREAD_ID_INTRINSICS: [&str; 3] = [
    "llvm.nvvm.read.ptx.sreg.tid.x",
    "llvm.nvvm.read.ptx.sreg.tid.y",
    "llvm.nvvm.read.ptx.sreg.tid.z",
];
