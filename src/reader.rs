//! Reading k-mer databases.

use std::fs::File;
use std::io::{BufReader, Seek, SeekFrom};
use std::ops::Range;
use std::path::{Path, PathBuf};

use crate::bits::BitStream;
use crate::codec::{decode_block, KmerBlock};
use crate::error::{IoContext, KmerError, Result};
use crate::files::{
    data_path, index_path, master_index_path, read_block_index, IndexEntry, MasterIndex,
};
use crate::kmer::KmerLayout;
use crate::merge::SortedSource;
use crate::stats::KmerStatistics;

/// Sequential access to the blocks of one data file.
pub struct BlockFileReader {
    path: PathBuf,
    input: BufReader<File>,
    bits: BitStream,
}

impl BlockFileReader {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path).io_context(path, "open data file")?;
        Ok(Self {
            path: path.to_path_buf(),
            input: BufReader::new(file),
            bits: BitStream::default(),
        })
    }

    /// Next block in file order, `None` at end of file.
    pub fn next_block(&mut self) -> Result<Option<KmerBlock>> {
        let offset = self
            .input
            .stream_position()
            .io_context(&self.path, "read data file")?;
        if !self.bits.load_from(&mut self.input).io_context(&self.path, "read block")? {
            return Ok(None);
        }
        self.bits.set_position(0, 0);
        decode_block(&mut self.bits, &self.path, offset).map(Some)
    }

    /// Decode the block starting at byte `offset`.
    pub fn block_at(&mut self, offset: u64) -> Result<KmerBlock> {
        self.input
            .seek(SeekFrom::Start(offset))
            .io_context(&self.path, "seek data file")?;
        match self.next_block()? {
            Some(block) => Ok(block),
            None => Err(KmerError::format(
                &self.path,
                format!("no block at byte offset {offset}"),
            )),
        }
    }
}

/// Cursor over a whole database, or over one shard of it.
pub struct KmerCountFileReader {
    dir: PathBuf,
    index: MasterIndex,
    files: Range<u32>,
    next_file: u32,
    blocks: Option<BlockFileReader>,
    block: KmerBlock,
    kmer: u64,
    value: u64,
    block_indices: Vec<Option<Vec<IndexEntry>>>,
    cached: Option<KmerBlock>,
}

impl KmerCountFileReader {
    /// Open every shard of the database in `dir`.
    pub fn open(dir: &Path) -> Result<Self> {
        let index = MasterIndex::read(dir)?;
        let files = 0..index.layout.num_files();
        Ok(Self::with_files(dir, index, files))
    }

    /// Open one shard; `next_mer` stops at the end of that shard.
    pub fn open_shard(dir: &Path, shard: u32) -> Result<Self> {
        let index = MasterIndex::read(dir)?;
        let n = index.layout.num_files();
        if shard >= n {
            return Err(KmerError::Config(format!(
                "shard {shard} out of range, '{}' has {n} shards",
                dir.display()
            )));
        }
        Ok(Self::with_files(dir, index, shard..shard + 1))
    }

    fn with_files(dir: &Path, index: MasterIndex, files: Range<u32>) -> Self {
        let n_files = index.layout.num_files() as usize;
        Self {
            dir: dir.to_path_buf(),
            index,
            next_file: files.start,
            files,
            blocks: None,
            block: KmerBlock::default(),
            kmer: 0,
            value: 0,
            block_indices: vec![None; n_files],
            cached: None,
        }
    }

    /// Whether `dir` holds a readable master index. Never an error.
    pub fn exists(dir: &Path) -> bool {
        master_index_path(dir).is_file() && MasterIndex::read(dir).is_ok()
    }

    pub fn layout(&self) -> &KmerLayout {
        &self.index.layout
    }

    pub fn mer_size(&self) -> u32 {
        self.index.layout.mer_size()
    }

    pub fn is_multi_set(&self) -> bool {
        self.index.multi_set
    }

    pub fn version(&self) -> u32 {
        self.index.version
    }

    /// Statistics read with the master index.
    pub fn statistics(&self) -> &KmerStatistics {
        &self.index.stats
    }

    /// Re-read the statistics from disk without touching any data file.
    pub fn load_statistics(&self) -> Result<KmerStatistics> {
        MasterIndex::read(&self.dir).map(|index| index.stats)
    }

    /// Advance to the next k-mer. `false` once the last shard is exhausted.
    pub fn next_mer(&mut self) -> Result<bool> {
        loop {
            if let Some((suffix, value)) = self.block.next_entry() {
                self.kmer = self.index.layout.join(self.block.prefix, suffix);
                self.value = value;
                return Ok(true);
            }

            if self.blocks.is_none() {
                if self.next_file >= self.files.end {
                    return Ok(false);
                }
                let path = data_path(&self.dir, self.next_file);
                self.next_file += 1;
                self.blocks = Some(BlockFileReader::open(&path)?);
            }

            let next = match self.blocks.as_mut() {
                Some(reader) => reader.next_block()?,
                None => None,
            };
            match next {
                Some(block) => self.block = block,
                None => self.blocks = None,
            }
        }
    }

    pub fn kmer(&self) -> u64 {
        self.kmer
    }

    pub fn value(&self) -> u64 {
        self.value
    }

    /// Load (once) and return the block index of `shard`.
    pub fn load_shard_index(&mut self, shard: u32) -> Result<&[IndexEntry]> {
        let slot = self
            .block_indices
            .get_mut(shard as usize)
            .ok_or_else(|| KmerError::Config(format!("no shard {shard}")))?;

        if slot.is_none() {
            let path = index_path(&self.dir, shard);
            let entries = read_block_index(&path)?;
            let expected = self.index.layout.num_blocks();
            if entries.len() as u64 != expected {
                return Err(KmerError::format(
                    &path,
                    format!("index has {} entries, expected {expected}", entries.len()),
                ));
            }
            *slot = Some(entries);
        }

        Ok(slot.as_deref().unwrap_or_default())
    }

    /// Load the block index of every shard this reader covers.
    pub fn load_block_index(&mut self) -> Result<()> {
        for shard in self.files.clone() {
            self.load_shard_index(shard)?;
        }
        Ok(())
    }

    /// Seek to and decode the block of `prefix` using the shard index.
    /// An absent prefix gives an empty block.
    pub fn load_block(&mut self, prefix: u64) -> Result<KmerBlock> {
        let layout = self.index.layout;
        if prefix >= layout.num_prefixes() {
            return Err(KmerError::Config(format!(
                "prefix {prefix:#x} out of range for {} prefix bits",
                layout.prefix_bits()
            )));
        }

        let shard = layout.file_of(prefix);
        let entry = self.load_shard_index(shard)?[layout.block_of(prefix) as usize];
        if entry.n_kmers == 0 {
            return Ok(KmerBlock::new(prefix, Vec::new(), Vec::new()));
        }

        let path = data_path(&self.dir, shard);
        let block = BlockFileReader::open(&path)?.block_at(entry.offset)?;

        if block.prefix != prefix || block.len() as u64 != entry.n_kmers || entry.prefix != prefix {
            return Err(KmerError::format(
                &path,
                format!(
                    "index entry for prefix {prefix:#x} (offset {}, {} k-mers) points at \
                     block {:#x} with {} k-mers",
                    entry.offset,
                    entry.n_kmers,
                    block.prefix,
                    block.len()
                ),
            ));
        }
        Ok(block)
    }

    /// Value of `kmer`, by random access.
    pub fn lookup(&mut self, kmer: u64) -> Result<Option<u64>> {
        let layout = self.index.layout;
        let prefix = layout.prefix_of(kmer);

        if !matches!(&self.cached, Some(b) if b.prefix == prefix) {
            self.cached = Some(self.load_block(prefix)?);
        }
        Ok(self
            .cached
            .as_ref()
            .and_then(|b| b.get(layout.suffix_of(kmer))))
    }
}

impl SortedSource for KmerCountFileReader {
    fn next_entry(&mut self) -> Result<Option<(u64, u64)>> {
        Ok(self.next_mer()?.then(|| (self.kmer, self.value)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::writer::KmerFileWriter;

    fn build(dir: &Path) -> KmerLayout {
        //  k=5: 4 prefix bits in 4 shards of 4 prefixes, 6 suffix bits.
        let layout = KmerLayout::new(5, 4, 2).unwrap();
        let mut writer = KmerFileWriter::create(dir, layout).unwrap();
        writer.add_block(0, &[1, 2], &[1, 1]).unwrap();
        writer.add_block(5, &[63], &[7]).unwrap();
        writer.add_block(6, &[0, 10, 20], &[2, 3, 4]).unwrap();
        writer.add_block(15, &[33], &[1]).unwrap();
        writer.finish_batch().unwrap();
        writer.finish().unwrap();
        layout
    }

    #[test]
    fn sequential_scan_in_kmer_order() {
        let dir = tempfile::tempdir().unwrap();
        let layout = build(dir.path());

        let mut reader = KmerCountFileReader::open(dir.path()).unwrap();
        assert_eq!(reader.version(), 2);
        assert!(!reader.is_multi_set());
        let mut got = Vec::new();
        while reader.next_mer().unwrap() {
            got.push((reader.kmer(), reader.value()));
        }
        let expected = vec![
            (layout.join(0, 1), 1),
            (layout.join(0, 2), 1),
            (layout.join(5, 63), 7),
            (layout.join(6, 0), 2),
            (layout.join(6, 10), 3),
            (layout.join(6, 20), 4),
            (layout.join(15, 33), 1),
        ];
        assert_eq!(got, expected);
        assert!(!reader.next_mer().unwrap());

        let stats = reader.load_statistics().unwrap();
        assert_eq!(stats.num_distinct(), 7);
        assert_eq!(&stats, reader.statistics());
    }

    #[test]
    fn shard_mode_stops_at_its_shard() {
        let dir = tempfile::tempdir().unwrap();
        let layout = build(dir.path());

        let mut reader = KmerCountFileReader::open_shard(dir.path(), 1).unwrap();
        let mut got = Vec::new();
        while reader.next_mer().unwrap() {
            got.push(reader.kmer());
        }
        assert_eq!(
            got,
            vec![layout.join(5, 63), layout.join(6, 0), layout.join(6, 10), layout.join(6, 20)]
        );

        let mut empty = KmerCountFileReader::open_shard(dir.path(), 2).unwrap();
        assert!(!empty.next_mer().unwrap());
        assert!(KmerCountFileReader::open_shard(dir.path(), 4).is_err());
    }

    #[test]
    fn random_access() {
        let dir = tempfile::tempdir().unwrap();
        let layout = build(dir.path());
        let mut reader = KmerCountFileReader::open(dir.path()).unwrap();
        reader.load_block_index().unwrap();

        let block = reader.load_block(6).unwrap();
        assert_eq!(block.suffixes, vec![0, 10, 20]);
        assert!(reader.load_block(7).unwrap().is_empty());
        assert!(reader.load_block(16).is_err());

        assert_eq!(reader.lookup(layout.join(6, 10)).unwrap(), Some(3));
        assert_eq!(reader.lookup(layout.join(6, 11)).unwrap(), None);
        assert_eq!(reader.lookup(layout.join(15, 33)).unwrap(), Some(1));
        assert_eq!(reader.lookup(layout.join(3, 0)).unwrap(), None);
    }

    #[test]
    fn probing() {
        let dir = tempfile::tempdir().unwrap();
        assert!(!KmerCountFileReader::exists(dir.path()));
        assert!(KmerCountFileReader::open(dir.path()).is_err());
        build(dir.path());
        assert!(KmerCountFileReader::exists(dir.path()));
    }

    #[test]
    fn corrupt_block_reports_offset() {
        let dir = tempfile::tempdir().unwrap();
        build(dir.path());
        let path = data_path(dir.path(), 1);
        let mut bytes = std::fs::read(&path).unwrap();
        //  Past the stream header of the first block, inside its magic.
        let header = 12 + 16;
        bytes[header] ^= 0xff;
        std::fs::write(&path, bytes).unwrap();

        let mut reader = KmerCountFileReader::open_shard(dir.path(), 1).unwrap();
        match reader.next_mer() {
            Err(KmerError::BadMagic { offset, .. }) => assert_eq!(offset, 0),
            other => panic!("expected a magic error, got {:?}", other.map_err(|e| e.to_string())),
        }
    }
}
