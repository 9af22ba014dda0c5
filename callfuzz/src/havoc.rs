//! AFL-style havoc over byte buffers.
//!
//! A havoc pass stacks several small edits on one buffer. Fixed-width buffers
//! (the byte encodings of numbers) only see in-place edits; variable-length
//! buffers (text and bytes) may additionally shrink and grow, never past
//! [`MAX_HAVOC_BUFFER_LEN`].
//!
//! Every operator draws from the [`Generator`] in a fixed order, so a pass is
//! a pure function of the buffer and the generator state.

use num_traits::{PrimInt, WrappingAdd, WrappingSub};

use crate::constants::{
    ARITH_MAX, HAVOC_BLK_LARGE, HAVOC_BLK_MEDIUM, HAVOC_BLK_SMALL, HAVOC_BLK_XL, HAVOC_FIXED_OPS,
    HAVOC_VARIABLE_OPS, INTERESTING_8, INTERESTING_16, INTERESTING_32, MAX_HAVOC_BUFFER_LEN,
};
use crate::generator::Generator;

/// An unsigned window of a buffer that arithmetic and interesting-value
/// operators work on. Values are read and written little-endian.
trait Window: PrimInt + WrappingAdd + WrappingSub {
    const WIDTH: usize;

    fn read(bytes: &[u8]) -> Self;
    fn write(self, bytes: &mut [u8]);
    fn truncate(v: u64) -> Self;
}

macro_rules! impl_window {
    ($ty:ty) => {
        impl Window for $ty {
            const WIDTH: usize = std::mem::size_of::<$ty>();

            fn read(bytes: &[u8]) -> Self {
                let mut raw = [0u8; std::mem::size_of::<$ty>()];
                raw.copy_from_slice(&bytes[..Self::WIDTH]);
                <$ty>::from_le_bytes(raw)
            }

            fn write(self, bytes: &mut [u8]) {
                bytes[..Self::WIDTH].copy_from_slice(&self.to_le_bytes());
            }

            fn truncate(v: u64) -> Self {
                v as $ty
            }
        }
    };
}

impl_window!(u8);
impl_window!(u16);
impl_window!(u32);

/// Flips one bit anywhere in the buffer.
fn bitflip(rng: &mut Generator, buf: &mut [u8]) {
    if buf.is_empty() {
        return;
    }
    let bit = rng.below_usize(buf.len() * 8);
    buf[bit >> 3] ^= 128 >> (bit & 7);
}

/// Overwrites a window with a value from an interesting table. Multi-byte
/// values are byte-swapped on half of the draws.
fn interesting<T: Window>(
    rng: &mut Generator,
    buf: &mut [u8],
    table_len: usize,
    entry: impl Fn(usize) -> i64,
) {
    if buf.len() < T::WIDTH {
        return;
    }
    let pos = rng.below_usize(buf.len() - T::WIDTH + 1);
    let mut value = T::truncate(entry(rng.below_usize(table_len)) as u64);
    if T::WIDTH > 1 && !rng.coinflip() {
        value = value.swap_bytes();
    }
    value.write(&mut buf[pos..]);
}

/// Adds or subtracts `1..=ARITH_MAX` on a window, for multi-byte windows
/// optionally through the byte-swapped view.
fn arith<T: Window>(rng: &mut Generator, buf: &mut [u8]) {
    if buf.len() < T::WIDTH {
        return;
    }
    let pos = rng.below_usize(buf.len() - T::WIDTH + 1);
    let delta = T::truncate(1 + rng.below(ARITH_MAX));
    let subtract = rng.coinflip();
    let swapped = T::WIDTH > 1 && rng.coinflip();

    let mut value = T::read(&buf[pos..]);
    if swapped {
        value = value.swap_bytes();
    }
    value = if subtract {
        value.wrapping_sub(&delta)
    } else {
        value.wrapping_add(&delta)
    };
    if swapped {
        value = value.swap_bytes();
    }
    value.write(&mut buf[pos..]);
}

/// XORs one byte with a non-zero value.
fn byte_random(rng: &mut Generator, buf: &mut [u8]) {
    if buf.is_empty() {
        return;
    }
    let pos = rng.below_usize(buf.len());
    buf[pos] ^= 1 + rng.below(255) as u8;
}

/// Picks a block length no larger than `limit`, biased towards small blocks.
fn choose_block_len(rng: &mut Generator, limit: usize) -> usize {
    if limit == 0 {
        return 1;
    }
    let (mut min, max) = match rng.below(3) {
        0 => (1, HAVOC_BLK_SMALL),
        1 => (HAVOC_BLK_SMALL, HAVOC_BLK_MEDIUM),
        _ => {
            if rng.below(10) != 0 {
                (HAVOC_BLK_MEDIUM, HAVOC_BLK_LARGE)
            } else {
                (HAVOC_BLK_LARGE, HAVOC_BLK_XL)
            }
        }
    };
    if min >= limit {
        min = 1;
    }
    min + rng.below_usize(max.min(limit) - min + 1)
}

/// Copies a span over another span of the buffer, or fills a span with one byte.
fn block_overwrite(rng: &mut Generator, buf: &mut [u8]) {
    let len = buf.len();
    if len < 2 {
        return;
    }
    let copy_len = choose_block_len(rng, len - 1);
    let from = rng.below_usize(len - copy_len + 1);
    let to = rng.below_usize(len - copy_len + 1);

    if rng.below(4) != 0 {
        if from != to {
            buf.copy_within(from..from + copy_len, to);
        }
    } else {
        let fill = if rng.coinflip() {
            rng.below(255) as u8
        } else {
            buf[rng.below_usize(len)]
        };
        buf[to..to + copy_len].fill(fill);
    }
}

/// Removes a random span. Variable-length buffers only.
fn block_delete(rng: &mut Generator, buf: &mut Vec<u8>) {
    let len = buf.len();
    if len < 2 {
        return;
    }
    let del_len = rng.below_usize(len - 1);
    let del_from = rng.below_usize(len - del_len);
    buf.drain(del_from..del_from + del_len);
}

/// Inserts either a copy of an existing span or a run of one fill byte.
/// Variable-length buffers only; the result never exceeds [`MAX_HAVOC_BUFFER_LEN`].
fn block_insert(rng: &mut Generator, buf: &mut Vec<u8>) {
    let len = buf.len();
    if len == 0 || len >= MAX_HAVOC_BUFFER_LEN {
        return;
    }
    let clone = rng.below(4) != 0;
    let (growth_len, growth_from) = if clone {
        let growth_len = choose_block_len(rng, len);
        (growth_len, rng.below_usize(len - growth_len + 1))
    } else {
        (choose_block_len(rng, HAVOC_BLK_XL), 0)
    };
    let growth_to = rng.below_usize(len);
    let growth_len = growth_len.min(MAX_HAVOC_BUFFER_LEN - len);

    let inserted: Vec<u8> = if clone {
        buf[growth_from..growth_from + growth_len].to_vec()
    } else {
        let fill = if rng.coinflip() {
            rng.below(256) as u8
        } else {
            buf[rng.below_usize(len)]
        };
        vec![fill; growth_len]
    };
    let tail = buf.split_off(growth_to);
    buf.extend_from_slice(&inserted);
    buf.extend_from_slice(&tail);
}

/// Applies `2^(1 + below(7))` stacked operators to `buf`.
///
/// `variable_length` unlocks the operators that delete and insert spans; it must
/// be false for buffers whose length is fixed by the value they encode.
pub fn havoc(rng: &mut Generator, buf: &mut Vec<u8>, variable_length: bool) {
    let stacking = 1u32 << (1 + rng.below(7));
    let ops = if variable_length {
        HAVOC_VARIABLE_OPS
    } else {
        HAVOC_FIXED_OPS
    };
    for _ in 0..stacking {
        match rng.below(ops) {
            0 => bitflip(rng, buf),
            1 => interesting::<u8>(rng, buf, INTERESTING_8.len(), |i| INTERESTING_8[i] as i64),
            2 => interesting::<u16>(rng, buf, INTERESTING_16.len(), |i| INTERESTING_16[i] as i64),
            3 => interesting::<u32>(rng, buf, INTERESTING_32.len(), |i| INTERESTING_32[i] as i64),
            4 => arith::<u8>(rng, buf),
            5 => arith::<u16>(rng, buf),
            6 => arith::<u32>(rng, buf),
            7 => byte_random(rng, buf),
            8 => block_overwrite(rng, buf),
            9 => block_delete(rng, buf),
            _ => block_insert(rng, buf),
        }
    }
}

/// Mutates an integer through its little-endian encoding: four bytes when the
/// value fits an `i32`, eight otherwise.
pub fn mutate_int(rng: &mut Generator, value: i64) -> i64 {
    match i32::try_from(value) {
        Ok(narrow) => {
            let mut buf = narrow.to_le_bytes().to_vec();
            havoc(rng, &mut buf, false);
            let mut raw = [0u8; 4];
            raw.copy_from_slice(&buf[..4]);
            i32::from_le_bytes(raw) as i64
        }
        Err(_) => {
            let mut buf = value.to_le_bytes().to_vec();
            havoc(rng, &mut buf, false);
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&buf[..8]);
            i64::from_le_bytes(raw)
        }
    }
}

/// Mutates a float through its IEEE-754 single precision encoding.
pub fn mutate_float(rng: &mut Generator, value: f64) -> f64 {
    let mut buf = (value as f32).to_le_bytes().to_vec();
    havoc(rng, &mut buf, false);
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&buf[..4]);
    f32::from_le_bytes(raw) as f64
}

/// Mutates the UTF-8 encoding of `value`; invalid sequences are replaced on the
/// way back, so this never fails.
pub fn mutate_text(rng: &mut Generator, value: &str) -> String {
    let mut buf = value.as_bytes().to_vec();
    havoc(rng, &mut buf, true);
    String::from_utf8_lossy(&buf).into_owned()
}

pub fn mutate_bytes(rng: &mut Generator, value: &[u8]) -> Vec<u8> {
    let mut buf = value.to_vec();
    havoc(rng, &mut buf, true);
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_width_havoc_keeps_length() {
        for state in 0..200u64 {
            let mut rng = Generator::new(state);
            let mut buf = vec![1, 2, 3, 4];
            havoc(&mut rng, &mut buf, false);
            assert_eq!(buf.len(), 4);
        }
    }

    #[test]
    fn block_insert_respects_the_maximum_length() {
        let mut buf = vec![0x41u8; MAX_HAVOC_BUFFER_LEN - 7];
        for state in 0..300u64 {
            let mut rng = Generator::new(state);
            block_insert(&mut rng, &mut buf);
            assert!(buf.len() <= MAX_HAVOC_BUFFER_LEN);
        }
        assert_eq!(buf.len(), MAX_HAVOC_BUFFER_LEN);
    }

    #[test]
    fn variable_havoc_never_exceeds_the_maximum_length() {
        let mut buf = vec![7u8; MAX_HAVOC_BUFFER_LEN - 1];
        for state in 0..5u64 {
            let mut rng = Generator::new(state);
            havoc(&mut rng, &mut buf, true);
            assert!(buf.len() <= MAX_HAVOC_BUFFER_LEN);
        }
    }

    #[test]
    fn block_lengths_fit_their_limit() {
        let mut rng = Generator::new(99);
        for limit in 1..3000usize {
            let len = choose_block_len(&mut rng, limit);
            assert!(len >= 1 && len <= limit, "{len} not within 1..={limit}");
        }
    }

    #[test]
    fn scalar_mutation_is_deterministic() {
        for state in [1u64, 17, 4399, 1 << 40] {
            let mut a = Generator::new(state);
            let mut b = Generator::new(state);
            assert_eq!(mutate_int(&mut a, 12345), mutate_int(&mut b, 12345));
            assert_eq!(
                mutate_float(&mut a, 1.5).to_bits(),
                mutate_float(&mut b, 1.5).to_bits()
            );
            assert_eq!(mutate_text(&mut a, "hello"), mutate_text(&mut b, "hello"));
            assert_eq!(mutate_bytes(&mut a, b"\x00\x01"), mutate_bytes(&mut b, b"\x00\x01"));
            assert_eq!(a.state(), b.state());
        }
    }

    #[test]
    fn mutation_usually_changes_the_value() {
        let mut rng = Generator::new(2024);
        let changed = (0..1000)
            .filter(|_| mutate_int(&mut rng, 1000) != 1000)
            .count();
        assert!(changed > 800, "only {changed} of 1000 mutations changed the value");

        let changed = (0..1000)
            .filter(|_| mutate_text(&mut rng, "fuzzing") != "fuzzing")
            .count();
        assert!(changed > 800, "only {changed} of 1000 mutations changed the text");
    }

    #[test]
    fn wide_integers_use_eight_bytes() {
        let mut rng = Generator::new(5);
        let mut seen_wide = false;
        for _ in 0..100 {
            let v = mutate_int(&mut rng, i64::MAX - 3);
            if i32::try_from(v).is_err() {
                seen_wide = true;
            }
        }
        assert!(seen_wide);
    }

    #[test]
    fn arith_on_single_byte_wraps() {
        // 0 - delta wraps to the top of the byte range.
        let mut buf = vec![0u8];
        let mut rng = Generator::new(3);
        arith::<u8>(&mut rng, &mut buf);
        assert_ne!(buf[0], 0);
    }
}
