//! In-memory counting buckets.
//!
//! Each prefix owns a [`CountArray`] that collects raw suffixes into
//! fixed-size bit-packed segments. An entry never spans two segments, so a
//! segment is `segment_bits / width` entries and growing the array never
//! moves existing data. Counting unpacks everything, sorts it and collapses
//! runs of equal suffixes into `(suffix, count)` pairs.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::error::{KmerError, Result};
use crate::kmer::KmerLayout;
use crate::writer::KmerFileWriter;

/// Default segment size in bits: 64 KiB minus room for allocator headers.
pub const DEFAULT_SEGMENT_BITS: u64 = 64 * 1024 * 8 - 256;

#[inline]
fn mask(width: u32) -> u64 {
    if width >= 64 {
        u64::MAX
    } else {
        (1u64 << width) - 1
    }
}

#[inline]
fn put(words: &mut [u64], pos: usize, width: u32, value: u64) {
    let wrd = pos / 64;
    let off = (pos % 64) as u32;
    words[wrd] |= value << off;
    if off + width > 64 {
        words[wrd + 1] |= value >> (64 - off);
    }
}

#[inline]
fn take(words: &[u64], pos: usize, width: u32) -> u64 {
    let wrd = pos / 64;
    let off = (pos % 64) as u32;
    let mut value = words[wrd] >> off;
    if off + width > 64 {
        value |= words[wrd + 1] << (64 - off);
    }
    value & mask(width)
}

#[derive(Debug, Default)]
struct Counted {
    suffixes: Vec<u64>,
    values: Vec<u64>,
}

#[derive(Debug)]
pub struct CountArray {
    width: u32,
    seg_words: usize,
    seg_entries: usize,
    segments: Vec<Vec<u64>>,
    n_kmers: u64,
    counted: Option<Counted>,
}

impl CountArray {
    pub fn new(width: u32, segment_bits: u64) -> Self {
        let width = width.min(64);
        //  A segment holds at least one entry.
        let seg_words = (segment_bits / 64).max(1).max(width.div_ceil(64) as u64) as usize;
        let seg_entries = if width == 0 {
            0
        } else {
            seg_words * 64 / width as usize
        };
        Self {
            width,
            seg_words,
            seg_entries,
            segments: Vec::new(),
            n_kmers: 0,
            counted: None,
        }
    }

    /// Raw insertions since the last [`remove_counted_kmers`].
    ///
    /// [`remove_counted_kmers`]: CountArray::remove_counted_kmers
    pub fn n_kmers(&self) -> u64 {
        self.n_kmers
    }

    pub fn is_counted(&self) -> bool {
        self.counted.is_some()
    }

    /// Bytes currently held by segments.
    pub fn used_bytes(&self) -> u64 {
        (self.segments.len() * self.seg_words * 8) as u64
    }

    /// Insert a suffix; returns the bytes newly allocated.
    pub fn add(&mut self, suffix: u64) -> u64 {
        debug_assert!(self.counted.is_none(), "add() on a counted bucket");

        let n = self.n_kmers as usize;
        self.n_kmers += 1;

        if self.width == 0 {
            return 0;
        }

        let seg = n / self.seg_entries;
        let entry = n % self.seg_entries;

        let mut allocated = 0;
        if seg == self.segments.len() {
            if self.segments.len() == self.segments.capacity() {
                let before = self.segments.capacity();
                self.segments.reserve(before.max(4));
                let grown = self.segments.capacity() - before;
                allocated += (grown * std::mem::size_of::<Vec<u64>>()) as u64;
            }
            self.segments.push(vec![0u64; self.seg_words]);
            allocated += (self.seg_words * 8) as u64;
        }

        put(
            &mut self.segments[seg],
            entry * self.width as usize,
            self.width,
            suffix & mask(self.width),
        );

        allocated
    }

    /// Sort the raw insertions and collapse them into `(suffix, count)`
    /// pairs. Segment memory is released; the segment table is kept.
    pub fn count_kmers(&mut self) {
        if self.counted.is_some() {
            return;
        }

        let mut counted = Counted::default();

        if self.width == 0 {
            if self.n_kmers > 0 {
                counted.suffixes.push(0);
                counted.values.push(self.n_kmers);
            }
        } else {
            let mut raw = Vec::with_capacity(self.n_kmers as usize);
            let mut left = self.n_kmers as usize;
            for segment in &self.segments {
                let n = left.min(self.seg_entries);
                raw.extend((0..n).map(|ii| take(segment, ii * self.width as usize, self.width)));
                left -= n;
            }
            self.segments.clear();

            raw.sort_unstable();

            for s in raw {
                match counted.suffixes.last() {
                    Some(&last) if last == s => {
                        if let Some(v) = counted.values.last_mut() {
                            *v += 1;
                        }
                    }
                    _ => {
                        counted.suffixes.push(s);
                        counted.values.push(1);
                    }
                }
            }
        }

        self.counted = Some(counted);
    }

    /// Counted `(suffixes, values)`, if [`count_kmers`] ran.
    ///
    /// [`count_kmers`]: CountArray::count_kmers
    pub fn counted(&self) -> Option<(&[u64], &[u64])> {
        self.counted
            .as_ref()
            .map(|c| (c.suffixes.as_slice(), c.values.as_slice()))
    }

    /// Hand the counted run of `prefix` to the writer.
    pub fn dump_counted_kmers(&self, prefix: u64, writer: &KmerFileWriter) -> Result<()> {
        let Some(counted) = &self.counted else {
            return Err(KmerError::Pipeline(format!(
                "bucket {prefix:#x} dumped before it was counted"
            )));
        };
        writer.add_block(prefix, &counted.suffixes, &counted.values)
    }

    /// Back to empty. The segment table allocation survives for the next batch.
    pub fn remove_counted_kmers(&mut self) {
        self.segments.clear();
        self.counted = None;
        self.n_kmers = 0;
    }
}

/// One mutex-guarded [`CountArray`] per prefix.
#[derive(Debug)]
pub struct CountingTable {
    layout: KmerLayout,
    buckets: Vec<Mutex<CountArray>>,
    held: AtomicU64,
}

impl CountingTable {
    pub fn new(layout: KmerLayout, segment_bits: u64) -> Self {
        let buckets = (0..layout.num_prefixes())
            .map(|_| Mutex::new(CountArray::new(layout.suffix_bits(), segment_bits)))
            .collect();
        Self {
            layout,
            buckets,
            held: AtomicU64::new(0),
        }
    }

    pub fn layout(&self) -> &KmerLayout {
        &self.layout
    }

    /// Fixed cost of a table with `prefix_bits` before any k-mer is inserted.
    pub fn overhead_for(prefix_bits: u32) -> u64 {
        let bucket = std::mem::size_of::<Mutex<CountArray>>() as u64;
        1u64.checked_shl(prefix_bits)
            .map_or(u64::MAX, |n| n.saturating_mul(bucket))
    }

    pub fn overhead_bytes(&self) -> u64 {
        Self::overhead_for(self.layout.prefix_bits())
    }

    /// K-mers inserted since the last flush.
    pub fn held_kmers(&self) -> u64 {
        self.held.load(Ordering::Relaxed)
    }

    /// Insert sorted k-mers, locking each touched bucket once.
    /// Returns the bytes newly allocated.
    pub fn insert_sorted(&self, kmers: &[u64]) -> u64 {
        debug_assert!(kmers.windows(2).all(|w| w[0] <= w[1]));

        let mut allocated = 0;
        let mut rest = kmers;

        while let Some(&first) = rest.first() {
            let prefix = self.layout.prefix_of(first);
            let run = rest
                .iter()
                .position(|&k| self.layout.prefix_of(k) != prefix)
                .unwrap_or(rest.len());

            let mut bucket = self.buckets[prefix as usize].lock();
            for &kmer in &rest[..run] {
                allocated += bucket.add(self.layout.suffix_of(kmer));
            }
            drop(bucket);

            rest = &rest[run..];
        }

        self.held.fetch_add(kmers.len() as u64, Ordering::Relaxed);
        allocated
    }

    /// Count, dump and empty every bucket of one shard file.
    /// Returns the number of distinct k-mers written.
    pub fn flush_file(&self, file: u32, writer: &KmerFileWriter) -> Result<u64> {
        let mut written = 0;
        for prefix in self.layout.prefixes_in_file(file) {
            let mut bucket = self.buckets[prefix as usize].lock();
            if bucket.n_kmers() == 0 {
                continue;
            }
            bucket.count_kmers();
            bucket.dump_counted_kmers(prefix, writer)?;
            if let Some((suffixes, _)) = bucket.counted() {
                written += suffixes.len() as u64;
            }
            bucket.remove_counted_kmers();
        }
        Ok(written)
    }

    /// Forget the held k-mer count once every file was flushed.
    pub fn reset_held(&self) {
        self.held.store(0, Ordering::Relaxed);
    }
}
