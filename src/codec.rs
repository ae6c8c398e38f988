//! Encoding of one prefix's sorted `(suffix, value)` run into a block.
//!
//! Block layout, all fields in one [`BitStream`]:
//!
//! ```text
//! magic:128  prefix:64  nKmers:64
//! kCode:8  unaryBits:32  binaryBits:32  k1:64
//! cCode:8  c1:64  c2:64
//! nKmers x (unary hi-delta, binaryBits low bits)
//! nKmers x value (per cCode)
//! ```
//!
//! Suffixes are split at `binaryBits`: the high part is delta coded in unary
//! starting from `k1`, the low part is stored as is. The split and the value
//! coding are picked per block by [`choose_suffix_encoding`] and
//! [`choose_value_encoding`]; any choice decodes, the choice only moves the
//! file size.

use std::path::Path;

use crate::bits::{BitStream, DEFAULT_BLOCK_BITS};
use crate::error::{KmerError, Result};

pub const BLOCK_MAGIC: [u8; 16] = *b"merylDataFile00\n";

/// Bits in a block header, magic included.
pub const HEADER_BITS: u64 = 128 + 64 + 64 + 8 + 32 + 32 + 64 + 8 + 64 + 64;

const K_CODE_SPLIT: u8 = 1;

const C_CODE_CONSTANT: u8 = 1;
const C_CODE_BINARY: u8 = 2;
const C_CODE_GAMMA: u8 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SuffixEncoding {
    pub unary_bits: u32,
    pub binary_bits: u32,
    /// High part of the first suffix.
    pub k1: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueEncoding {
    /// Every value is the same; nothing stored per entry.
    Constant(u64),
    /// `value - base` in `width` bits.
    Binary { width: u32, base: u64 },
    /// `value - base + 1` Elias gamma coded.
    Gamma { base: u64 },
}

impl ValueEncoding {
    fn code(&self) -> (u8, u64, u64) {
        match *self {
            ValueEncoding::Constant(v) => (C_CODE_CONSTANT, v, 0),
            ValueEncoding::Binary { width, base } => (C_CODE_BINARY, width as u64, base),
            ValueEncoding::Gamma { base } => (C_CODE_GAMMA, 0, base),
        }
    }
}

#[inline]
fn high(x: u64, b: u32) -> u64 {
    if b >= 64 {
        0
    } else {
        x >> b
    }
}

#[inline]
fn shl(x: u64, b: u32) -> u64 {
    if b >= 64 {
        0
    } else {
        x << b
    }
}

/// Pick the unary/binary split that minimizes the encoded suffix bits.
///
/// With the split at `b`, the unary deltas add up to
/// `high(last) - high(first)` zero bits plus one stop bit per entry, and each
/// entry stores `b` low bits.
pub fn choose_suffix_encoding(suffixes: &[u64], suffix_bits: u32) -> SuffixEncoding {
    let suffix_bits = suffix_bits.min(64);
    let (Some(&first), Some(&last)) = (suffixes.first(), suffixes.last()) else {
        return SuffixEncoding {
            unary_bits: 0,
            binary_bits: suffix_bits,
            k1: 0,
        };
    };

    let n = suffixes.len() as u128;
    let mut best = (u128::MAX, 0u32);

    for b in 0..=suffix_bits {
        let span = (high(last, b) - high(first, b)) as u128;
        let cost = span + n + n * b as u128;
        if cost < best.0 {
            best = (cost, b);
        }
    }

    let b = best.1;
    SuffixEncoding {
        unary_bits: suffix_bits - b,
        binary_bits: b,
        k1: high(first, b),
    }
}

/// Pick constant, fixed-width or Elias gamma coding for the values.
pub fn choose_value_encoding(values: &[u64]) -> ValueEncoding {
    let Some(&v0) = values.first() else {
        return ValueEncoding::Constant(0);
    };
    let (min, max) = values
        .iter()
        .fold((v0, v0), |(lo, hi), &v| (lo.min(v), hi.max(v)));

    if min == max {
        return ValueEncoding::Constant(min);
    }

    let width = 64 - (max - min).leading_zeros();
    let binary_cost = values.len() as u128 * width as u128;

    //  gamma of (v - min + 1) needs the +1 to fit
    if max - min < u64::MAX {
        let gamma_cost: u128 = values
            .iter()
            .map(|&v| 2 * (63 - (v - min + 1).leading_zeros()) as u128 + 1)
            .sum();
        if gamma_cost < binary_cost {
            return ValueEncoding::Gamma { base: min };
        }
    }

    ValueEncoding::Binary { width, base: min }
}

/// Decoded entries of one prefix, with a read cursor.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KmerBlock {
    pub prefix: u64,
    pub suffixes: Vec<u64>,
    pub values: Vec<u64>,
    next: usize,
}

impl KmerBlock {
    pub fn new(prefix: u64, suffixes: Vec<u64>, values: Vec<u64>) -> Self {
        debug_assert_eq!(suffixes.len(), values.len());
        Self {
            prefix,
            suffixes,
            values,
            next: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.suffixes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.suffixes.is_empty()
    }

    /// Next `(suffix, value)`; `None` once every entry was handed out.
    pub fn next_entry(&mut self) -> Option<(u64, u64)> {
        let ii = self.next;
        if ii >= self.suffixes.len() {
            return None;
        }
        self.next += 1;
        Some((self.suffixes[ii], self.values[ii]))
    }

    pub fn is_consumed(&self) -> bool {
        self.next >= self.suffixes.len()
    }

    /// Value stored for `suffix`, by binary search.
    pub fn get(&self, suffix: u64) -> Option<u64> {
        self.suffixes
            .binary_search(&suffix)
            .ok()
            .map(|ii| self.values[ii])
    }
}

/// Encode one block. `suffixes` must be non-decreasing.
pub fn encode_block(prefix: u64, suffixes: &[u64], values: &[u64], suffix_bits: u32) -> BitStream {
    debug_assert_eq!(suffixes.len(), values.len());
    debug_assert!(suffixes.windows(2).all(|w| w[0] <= w[1]));

    let senc = choose_suffix_encoding(suffixes, suffix_bits);
    let venc = choose_value_encoding(values);
    let (c_code, c1, c2) = venc.code();

    let mut bits = BitStream::new(DEFAULT_BLOCK_BITS);

    bits.set_binary(64, u64::from_be_bytes(magic_word(0)));
    bits.set_binary(64, u64::from_be_bytes(magic_word(1)));
    bits.set_binary(64, prefix);
    bits.set_binary(64, suffixes.len() as u64);
    bits.set_binary(8, K_CODE_SPLIT as u64);
    bits.set_binary(32, senc.unary_bits as u64);
    bits.set_binary(32, senc.binary_bits as u64);
    bits.set_binary(64, senc.k1);
    bits.set_binary(8, c_code as u64);
    bits.set_binary(64, c1);
    bits.set_binary(64, c2);

    let b = senc.binary_bits;
    let mut last = senc.k1;
    for &s in suffixes {
        let hi = high(s, b);
        bits.set_unary(hi.saturating_sub(last));
        bits.set_binary(b, s);
        last = hi;
    }

    match venc {
        ValueEncoding::Constant(_) => {}
        ValueEncoding::Binary { width, base } => {
            for &v in values {
                bits.set_binary(width, v - base);
            }
        }
        ValueEncoding::Gamma { base } => {
            for &v in values {
                bits.set_elias_gamma(v - base + 1);
            }
        }
    }

    bits
}

fn magic_word(ii: usize) -> [u8; 8] {
    let mut w = [0u8; 8];
    w.copy_from_slice(&BLOCK_MAGIC[ii * 8..ii * 8 + 8]);
    w
}

fn show_magic(bytes: &[u8]) -> String {
    bytes.escape_ascii().to_string()
}

/// Decode the block at the cursor of `bits`.
///
/// `path` and `offset` (byte offset of the block in its file) only feed
/// error messages.
pub fn decode_block(bits: &mut BitStream, path: &Path, offset: u64) -> Result<KmerBlock> {
    let available = bits.len().saturating_sub(bits.position());
    if available < HEADER_BITS {
        return Err(KmerError::format(
            path,
            format!("block at byte offset {offset} is {available} bits, shorter than a header"),
        ));
    }

    let m1 = bits.get_binary(64).to_be_bytes();
    let m2 = bits.get_binary(64).to_be_bytes();
    if m1 != magic_word(0) || m2 != magic_word(1) {
        let found: Vec<u8> = m1.iter().chain(m2.iter()).copied().collect();
        return Err(KmerError::BadMagic {
            path: path.to_path_buf(),
            offset,
            expected: show_magic(&BLOCK_MAGIC),
            found: show_magic(&found),
        });
    }

    let prefix = bits.get_binary(64);
    let n_kmers = bits.get_binary(64);
    let k_code = bits.get_binary(8) as u8;
    let _unary_bits = bits.get_binary(32);
    let binary_bits = bits.get_binary(32) as u32;
    let k1 = bits.get_binary(64);
    let c_code = bits.get_binary(8) as u8;
    let c1 = bits.get_binary(64);
    let c2 = bits.get_binary(64);

    if k_code != K_CODE_SPLIT || binary_bits > 64 {
        return Err(KmerError::format(
            path,
            format!(
                "block at byte offset {offset} has unknown suffix coding {k_code}/{binary_bits}"
            ),
        ));
    }

    //  Every entry costs at least its unary stop bit.
    let payload = bits.len().saturating_sub(bits.position());
    if n_kmers > payload {
        return Err(KmerError::format(
            path,
            format!("block at byte offset {offset} claims {n_kmers} k-mers in {payload} bits"),
        ));
    }

    let n = n_kmers as usize;
    let corrupt = |what: &str, ii: usize| {
        KmerError::format(
            path,
            format!(
                "block at byte offset {offset} has a corrupt {what} at entry {ii} of {n_kmers}"
            ),
        )
    };

    let mut suffixes = Vec::with_capacity(n);
    let mut last = k1;
    for ii in 0..n {
        let delta = bits.try_get_unary().ok_or_else(|| corrupt("suffix", ii))?;
        let low = bits
            .try_get_binary(binary_bits)
            .ok_or_else(|| corrupt("suffix", ii))?;
        last = last.wrapping_add(delta);
        suffixes.push(shl(last, binary_bits) | low);
    }

    let values = match c_code {
        C_CODE_CONSTANT => vec![c1; n],
        C_CODE_BINARY if c1 <= 64 => (0..n)
            .map(|ii| {
                bits.try_get_binary(c1 as u32)
                    .map(|v| v.wrapping_add(c2))
                    .ok_or_else(|| corrupt("value", ii))
            })
            .collect::<Result<Vec<_>>>()?,
        C_CODE_GAMMA => (0..n)
            .map(|ii| {
                bits.try_get_elias_gamma()
                    .map(|v| (v - 1).wrapping_add(c2))
                    .ok_or_else(|| corrupt("value", ii))
            })
            .collect::<Result<Vec<_>>>()?,
        _ => {
            return Err(KmerError::format(
                path,
                format!("block at byte offset {offset} has unknown value coding {c_code}/{c1}"),
            ))
        }
    };

    Ok(KmerBlock::new(prefix, suffixes, values))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::path::PathBuf;

    fn round_trip(prefix: u64, suffixes: &[u64], values: &[u64], suffix_bits: u32) -> KmerBlock {
        let mut bits = encode_block(prefix, suffixes, values, suffix_bits);
        bits.set_position(0, 0);
        decode_block(&mut bits, Path::new("test"), 0).unwrap()
    }

    fn random_run(rng: &mut StdRng, n: usize, suffix_bits: u32) -> Vec<u64> {
        let mask = if suffix_bits >= 64 { u64::MAX } else { (1u64 << suffix_bits) - 1 };
        let mut s: Vec<u64> = (0..n).map(|_| rng.gen::<u64>() & mask).collect();
        s.sort_unstable();
        s.dedup();
        s
    }

    #[test]
    fn round_trip_across_suffix_widths() {
        let mut rng = StdRng::seed_from_u64(42);
        for suffix_bits in [1u32, 2, 7, 20, 31, 32, 33, 63, 64] {
            for n in [1usize, 2, 5, 100, 3000] {
                let suffixes = random_run(&mut rng, n, suffix_bits);
                let values: Vec<u64> = suffixes.iter().map(|_| rng.gen_range(1..1000)).collect();
                let block = round_trip(17, &suffixes, &values, suffix_bits);
                assert_eq!(block.prefix, 17);
                assert_eq!(block.suffixes, suffixes, "width {suffix_bits} n {n}");
                assert_eq!(block.values, values, "width {suffix_bits} n {n}");
            }
        }
    }

    #[test]
    fn degenerate_zero_width_suffix() {
        let block = round_trip(3, &[0], &[12], 0);
        assert_eq!(block.suffixes, vec![0]);
        assert_eq!(block.values, vec![12]);

        let block = round_trip(3, &[], &[], 0);
        assert!(block.is_empty());
    }

    #[test]
    fn full_range_values() {
        let suffixes = vec![0, 1, 2, 3, u64::MAX - 1, u64::MAX];
        let values = vec![u64::MAX, 0, 1, u64::MAX - 1, 1 << 63, 7];
        let block = round_trip(0, &suffixes, &values, 64);
        assert_eq!(block.suffixes, suffixes);
        assert_eq!(block.values, values);
        assert_eq!(choose_value_encoding(&values), ValueEncoding::Binary { width: 64, base: 0 });
    }

    #[test]
    fn multi_set_runs_keep_duplicates() {
        let suffixes = vec![5, 5, 5, 9, 9, 1000];
        let values = vec![1, 2, 3, 1, 1, 4];
        let block = round_trip(1, &suffixes, &values, 12);
        assert_eq!(block.suffixes, suffixes);
        assert_eq!(block.values, values);
    }

    #[test]
    fn constant_values_cost_nothing_per_entry() {
        let suffixes: Vec<u64> = (0..1000).map(|i| i * 3).collect();
        let ones = vec![1u64; 1000];
        let mut twos = ones.clone();
        twos[500] = 2;

        let constant = encode_block(0, &suffixes, &ones, 16);
        let varied = encode_block(0, &suffixes, &twos, 16);
        assert_eq!(choose_value_encoding(&ones), ValueEncoding::Constant(1));
        assert!(varied.len() >= constant.len() + 1000);
    }

    #[test]
    fn value_encoding_prefers_gamma_for_skewed_counts() {
        let mut values = vec![1u64; 200];
        values.push(1_000_000);
        assert_eq!(choose_value_encoding(&values), ValueEncoding::Gamma { base: 1 });
        assert_eq!(
            choose_value_encoding(&[4, 5, 6, 7]),
            ValueEncoding::Binary { width: 2, base: 4 }
        );
        assert_eq!(choose_value_encoding(&[]), ValueEncoding::Constant(0));
    }

    #[test]
    fn suffix_encoding_choice() {
        //  Dense run: everything in unary.
        let dense: Vec<u64> = (100..200).collect();
        let enc = choose_suffix_encoding(&dense, 20);
        assert_eq!(enc.binary_bits, 0);
        assert_eq!(enc.k1, 100);

        //  Two far apart values: mostly binary.
        let sparse = vec![0u64, 1 << 40];
        let enc = choose_suffix_encoding(&sparse, 48);
        assert_eq!(enc.binary_bits + enc.unary_bits, 48);
        assert!(enc.binary_bits >= 35);

        let empty = choose_suffix_encoding(&[], 30);
        assert_eq!(empty.binary_bits, 30);
    }

    #[test]
    fn bad_magic_is_reported_with_offset() {
        let mut bits = encode_block(9, &[1, 2], &[1, 1], 8);
        bits.set_position(0, 0);
        bits.set_binary(64, u64::from_be_bytes(*b"notmeryl"));
        bits.set_position(0, 0);

        let err = decode_block(&mut bits, &PathBuf::from("x.merylData"), 1234).unwrap_err();
        match err {
            KmerError::BadMagic { offset, found, expected, .. } => {
                assert_eq!(offset, 1234);
                assert!(found.starts_with("notmeryl"));
                assert!(expected.starts_with("merylDataFile00"));
            }
            other => panic!("unexpected error {other}"),
        }
    }

    #[test]
    fn inflated_kmer_count_is_a_format_error() {
        let mut bits = encode_block(9, &[1, 2, 3], &[1, 1, 1], 8);
        bits.set_position(128 + 64, 0);
        bits.set_binary(64, 1 << 40);
        bits.set_position(0, 0);
        assert!(matches!(
            decode_block(&mut bits, Path::new("x"), 0),
            Err(KmerError::Format { .. })
        ));
    }

    #[test]
    fn corrupt_gamma_values_are_a_format_error() {
        //  One large value then ones: gamma coded, one bit per trailing value.
        let suffixes: Vec<u64> = (0..201).collect();
        let mut values = vec![1u64; 201];
        values[0] = 1_000_000;
        assert_eq!(choose_value_encoding(&values), ValueEncoding::Gamma { base: 1 });

        let mut bits = encode_block(3, &suffixes, &values, 10);
        let end = bits.len();
        bits.set_position(end - 200, 0);
        for _ in 0..4 {
            bits.set_binary(50, 0);
        }
        assert_eq!(bits.len(), end);
        bits.set_position(0, 0);

        match decode_block(&mut bits, Path::new("x.merylData"), 4096) {
            Err(KmerError::Format { detail, .. }) => {
                assert!(detail.contains("byte offset 4096"), "{detail}");
                assert!(detail.contains("corrupt value"), "{detail}");
            }
            other => panic!("unexpected result {other:?}"),
        }
    }

    #[test]
    fn truncated_suffixes_are_a_format_error() {
        let mut bits = encode_block(3, &[1, 2, 3, 900], &[2, 2, 2, 2], 10);
        let header_end = HEADER_BITS;
        bits.set_position(header_end, 0);
        //  Wipe the stop bits of every unary delta.
        for _ in 0..(bits.len() - header_end) {
            bits.set_binary(1, 0);
        }
        bits.set_position(0, 0);
        assert!(matches!(
            decode_block(&mut bits, Path::new("x"), 0),
            Err(KmerError::Format { .. })
        ));
    }

    #[test]
    fn block_cursor() {
        let mut block = KmerBlock::new(2, vec![1, 4, 9], vec![3, 2, 1]);
        assert_eq!(block.get(4), Some(2));
        assert_eq!(block.get(5), None);
        assert_eq!(block.next_entry(), Some((1, 3)));
        assert_eq!(block.next_entry(), Some((4, 2)));
        assert!(!block.is_consumed());
        assert_eq!(block.next_entry(), Some((9, 1)));
        assert!(block.is_consumed());
        assert_eq!(block.next_entry(), None);
    }
}
