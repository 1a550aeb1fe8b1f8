// SPDX-License-Identifier: MPL-2.0

/// Aligns `value` down to a multiple of `align`, which must be a power of two.
pub(crate) const fn align_down(value: u64, align: u64) -> u64 {
    debug_assert!(align.is_power_of_two());
    value & !(align - 1)
}

/// Aligns `value` up to a multiple of `align`, which must be a power of two.
pub(crate) const fn align_up(value: u64, align: u64) -> u64 {
    debug_assert!(align.is_power_of_two());
    (value + align - 1) & !(align - 1)
}

const GOLDEN_RATIO_64: u64 = 0x61c8_8646_80b5_83eb;

/// Hashes a 64-bit value into `bits` bits.
pub(crate) const fn hash_long(value: u64, bits: u32) -> usize {
    (value.wrapping_mul(GOLDEN_RATIO_64) >> (64 - bits)) as usize
}
