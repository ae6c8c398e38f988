//! 2-bit k-mer helpers and the prefix/suffix/shard layout of a database.
//!
//! A k-mer of size `k` is a `u64` holding `2k` bits, A=0 C=1 G=2 T=3, the
//! first base in the highest bits. The high `prefix_bits` select a bucket
//! (and, through its own high bits, a shard file); the low `suffix_bits` are
//! what is stored per entry.

use std::fmt;
use std::str::FromStr;

use crate::error::{KmerError, Result};

pub const MAX_MER_SIZE: u32 = 32;

/// Default number of bits used to pick a shard file (64 files).
pub const DEFAULT_FILES_BITS: u32 = 6;

pub fn base_to_bits(b: u8) -> Option<u64> {
    match b {
        b'A' | b'a' => Some(0),
        b'C' | b'c' => Some(1),
        b'G' | b'g' => Some(2),
        b'T' | b't' => Some(3),
        _ => None,
    }
}

pub fn bits_to_base(bits: u64) -> u8 {
    match bits & 0b11 {
        0 => b'A',
        1 => b'C',
        2 => b'G',
        _ => b'T',
    }
}

#[inline]
pub fn kmer_mask(k: u32) -> u64 {
    if k >= 32 {
        u64::MAX
    } else {
        (1u64 << (2 * k)) - 1
    }
}

/// Encode `seq` as a k-mer; `None` if it holds anything but ACGT.
pub fn encode_kmer(seq: &[u8]) -> Option<u64> {
    let mut v = 0u64;
    for &b in seq {
        v = (v << 2) | base_to_bits(b)?;
    }
    Some(v)
}

pub fn decode_kmer(kmer: u64, k: u32) -> String {
    (0..k)
        .rev()
        .map(|i| bits_to_base(kmer >> (2 * i)) as char)
        .collect()
}

pub fn reverse_complement(kmer: u64, k: u32) -> u64 {
    let mut rc = 0u64;
    let mut val = kmer;
    for _ in 0..k {
        rc = (rc << 2) | ((!val) & 0b11);
        val >>= 2;
    }
    rc
}

pub fn canonical(kmer: u64, k: u32) -> u64 {
    kmer.min(reverse_complement(kmer, k))
}

/// Which strand of each k-mer gets counted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CountMode {
    Forward,
    Reverse,
    #[default]
    Canonical,
}

impl CountMode {
    /// Pick the k-mer to count given both strands.
    #[inline]
    pub fn select(self, fmer: u64, rmer: u64) -> u64 {
        match self {
            CountMode::Forward => fmer,
            CountMode::Reverse => rmer,
            CountMode::Canonical => fmer.min(rmer),
        }
    }
}

impl FromStr for CountMode {
    type Err = KmerError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "forward" | "f" => Ok(CountMode::Forward),
            "reverse" | "r" => Ok(CountMode::Reverse),
            "canonical" | "c" => Ok(CountMode::Canonical),
            other => Err(KmerError::Config(format!(
                "unknown count mode '{other}' (expected forward, reverse or canonical)"
            ))),
        }
    }
}

impl fmt::Display for CountMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CountMode::Forward => "forward",
            CountMode::Reverse => "reverse",
            CountMode::Canonical => "canonical",
        })
    }
}

/// Sliding-window k-mer extraction over one sequence, both strands at once.
///
/// Non-ACGT bases reset the window.
pub struct KmerIter<'a> {
    seq: &'a [u8],
    idx: usize,
    k: u32,
    mask: u64,
    shift: u32,
    loaded: u32,
    fmer: u64,
    rmer: u64,
}

impl<'a> KmerIter<'a> {
    pub fn new(seq: &'a [u8], k: u32) -> Self {
        Self {
            seq,
            idx: 0,
            k,
            mask: kmer_mask(k),
            shift: 2 * (k - 1),
            loaded: 0,
            fmer: 0,
            rmer: 0,
        }
    }
}

impl Iterator for KmerIter<'_> {
    /// `(forward, reverse complement)`
    type Item = (u64, u64);

    fn next(&mut self) -> Option<Self::Item> {
        while self.idx < self.seq.len() {
            let b = self.seq[self.idx];
            self.idx += 1;

            let Some(bits) = base_to_bits(b) else {
                self.loaded = 0;
                continue;
            };

            self.fmer = ((self.fmer << 2) | bits) & self.mask;
            self.rmer = (self.rmer >> 2) | ((3 - bits) << self.shift);

            if self.loaded + 1 < self.k {
                self.loaded += 1;
                continue;
            }
            return Some((self.fmer, self.rmer));
        }
        None
    }
}

/// Bit layout of a k-mer database.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KmerLayout {
    mer_size: u32,
    prefix_bits: u32,
    suffix_bits: u32,
    files_bits: u32,
    blocks_bits: u32,
}

impl KmerLayout {
    /// `files_bits` is clamped to `prefix_bits`.
    pub fn new(mer_size: u32, prefix_bits: u32, files_bits: u32) -> Result<Self> {
        if mer_size == 0 || mer_size > MAX_MER_SIZE {
            return Err(KmerError::Config(format!(
                "k-mer size {mer_size} out of range 1..={MAX_MER_SIZE}"
            )));
        }
        if prefix_bits == 0 || prefix_bits > 2 * mer_size || prefix_bits > 32 {
            return Err(KmerError::Config(format!(
                "prefix of {prefix_bits} bits does not fit a {mer_size}-mer (1..={} bits)",
                (2 * mer_size).min(32)
            )));
        }
        let files_bits = files_bits.min(prefix_bits);
        Ok(Self {
            mer_size,
            prefix_bits,
            suffix_bits: 2 * mer_size - prefix_bits,
            files_bits,
            blocks_bits: prefix_bits - files_bits,
        })
    }

    /// Rebuild a layout from the widths stored in a master index.
    pub fn from_widths(
        prefix_bits: u32,
        suffix_bits: u32,
        files_bits: u32,
        blocks_bits: u32,
    ) -> Option<Self> {
        let total = prefix_bits.checked_add(suffix_bits)?;
        if total == 0 || total % 2 != 0 || files_bits + blocks_bits != prefix_bits {
            return None;
        }
        let layout = Self::new(total / 2, prefix_bits, files_bits).ok()?;
        (layout.files_bits == files_bits).then_some(layout)
    }

    pub fn mer_size(&self) -> u32 {
        self.mer_size
    }

    pub fn prefix_bits(&self) -> u32 {
        self.prefix_bits
    }

    pub fn suffix_bits(&self) -> u32 {
        self.suffix_bits
    }

    pub fn files_bits(&self) -> u32 {
        self.files_bits
    }

    pub fn blocks_bits(&self) -> u32 {
        self.blocks_bits
    }

    pub fn num_prefixes(&self) -> u64 {
        1u64 << self.prefix_bits
    }

    pub fn num_files(&self) -> u32 {
        1u32 << self.files_bits
    }

    /// Prefixes per shard file.
    pub fn num_blocks(&self) -> u64 {
        1u64 << self.blocks_bits
    }

    #[inline]
    pub fn prefix_of(&self, kmer: u64) -> u64 {
        if self.suffix_bits >= 64 {
            0
        } else {
            kmer >> self.suffix_bits
        }
    }

    #[inline]
    pub fn suffix_of(&self, kmer: u64) -> u64 {
        kmer & kmer_mask_bits(self.suffix_bits)
    }

    #[inline]
    pub fn join(&self, prefix: u64, suffix: u64) -> u64 {
        if self.suffix_bits >= 64 {
            suffix
        } else {
            (prefix << self.suffix_bits) | suffix
        }
    }

    #[inline]
    pub fn file_of(&self, prefix: u64) -> u32 {
        (prefix >> self.blocks_bits) as u32
    }

    /// Index of `prefix` inside its shard file.
    #[inline]
    pub fn block_of(&self, prefix: u64) -> u64 {
        prefix & kmer_mask_bits(self.blocks_bits)
    }

    pub fn prefixes_in_file(&self, file: u32) -> std::ops::Range<u64> {
        let first = (file as u64) << self.blocks_bits;
        first..first + self.num_blocks()
    }
}

#[inline]
fn kmer_mask_bits(bits: u32) -> u64 {
    if bits >= 64 {
        u64::MAX
    } else {
        (1u64 << bits) - 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_strings() {
        let k = encode_kmer(b"ACGT").unwrap();
        assert_eq!(k, 0b00_01_10_11);
        assert_eq!(decode_kmer(k, 4), "ACGT");
        assert_eq!(encode_kmer(b"ACNT"), None);
        assert_eq!(decode_kmer(u64::MAX, 32), "T".repeat(32));
    }

    #[test]
    fn reverse_complement_and_canonical() {
        let k = 4;
        let acgt = encode_kmer(b"ACGT").unwrap();
        let cgta = encode_kmer(b"CGTA").unwrap();
        let tacg = encode_kmer(b"TACG").unwrap();
        assert_eq!(reverse_complement(acgt, k), acgt);
        assert_eq!(reverse_complement(cgta, k), tacg);
        assert_eq!(canonical(tacg, k), cgta);
        assert_eq!(
            reverse_complement(encode_kmer(b"AAAC").unwrap(), k),
            encode_kmer(b"GTTT").unwrap()
        );
    }

    #[test]
    fn sliding_window_resets_on_n() {
        let seq = b"ACGTNACGTA";
        let fwd: Vec<String> = KmerIter::new(seq, 4).map(|(f, _)| decode_kmer(f, 4)).collect();
        assert_eq!(fwd, vec!["ACGT", "ACGT", "CGTA"]);

        for (f, r) in KmerIter::new(b"GATTACAGATTACA", 5) {
            assert_eq!(r, reverse_complement(f, 5));
        }
    }

    #[test]
    fn sliding_window_full_width() {
        let seq = b"ACGTACGTACGTACGTACGTACGTACGTACGTAC";
        let kmers: Vec<(u64, u64)> = KmerIter::new(seq, 32).collect();
        assert_eq!(kmers.len(), 3);
        assert_eq!(kmers[0].0, encode_kmer(&seq[..32]).unwrap());
        assert_eq!(kmers[2].1, reverse_complement(encode_kmer(&seq[2..34]).unwrap(), 32));
    }

    #[test]
    fn layout_split_and_routing() {
        let layout = KmerLayout::new(11, 10, 6).unwrap();
        assert_eq!(layout.suffix_bits(), 12);
        assert_eq!(layout.blocks_bits(), 4);
        assert_eq!(layout.num_files(), 64);

        let kmer = 0x2f_ffab_cdefu64 & kmer_mask(11);
        let p = layout.prefix_of(kmer);
        let s = layout.suffix_of(kmer);
        assert_eq!(layout.join(p, s), kmer);
        assert_eq!(layout.file_of(p), (p >> 4) as u32);
        assert!(layout.prefixes_in_file(layout.file_of(p)).contains(&p));
    }

    #[test]
    fn layout_clamps_files_bits_and_rejects_bad_sizes() {
        let layout = KmerLayout::new(2, 3, 6).unwrap();
        assert_eq!(layout.files_bits(), 3);
        assert_eq!(layout.blocks_bits(), 0);
        assert!(KmerLayout::new(0, 1, 1).is_err());
        assert!(KmerLayout::new(33, 8, 6).is_err());
        assert!(KmerLayout::new(4, 9, 6).is_err());

        let back = KmerLayout::from_widths(10, 12, 6, 4).unwrap();
        assert_eq!(back, KmerLayout::new(11, 10, 6).unwrap());
        assert!(KmerLayout::from_widths(10, 11, 6, 4).is_none());
    }

    #[test]
    fn count_mode_parsing() {
        assert_eq!("canonical".parse::<CountMode>().unwrap(), CountMode::Canonical);
        assert_eq!("Forward".parse::<CountMode>().unwrap(), CountMode::Forward);
        assert!("sideways".parse::<CountMode>().is_err());
        assert_eq!(CountMode::Canonical.select(9, 4), 4);
        assert_eq!(CountMode::Reverse.select(1, 4), 4);
    }
}
