//! Database directory layout: file names, the master index and the
//! per-shard block indices.

use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::error::{IoContext, KmerError, Result};
use crate::kmer::KmerLayout;
use crate::stats::KmerStatistics;

pub const MASTER_INDEX_NAME: &str = "merylIndex";

pub const INDEX_MAGIC_V1: [u8; 16] = *b"merylIndex__v01\n";
pub const INDEX_MAGIC_V2: [u8; 16] = *b"merylIndex__v02\n";

const FLAG_MULTI_SET: u32 = 1;

/// Bytes per `.idx` record.
pub const INDEX_ENTRY_BYTES: usize = 24;

pub fn master_index_path(dir: &Path) -> PathBuf {
    dir.join(MASTER_INDEX_NAME)
}

pub fn data_path(dir: &Path, shard: u32) -> PathBuf {
    dir.join(format!("0x{shard:06x}.merylData"))
}

pub fn index_path(dir: &Path, shard: u32) -> PathBuf {
    dir.join(format!("0x{shard:06x}.merylData.idx"))
}

pub fn batch_data_path(dir: &Path, shard: u32, iteration: u32) -> PathBuf {
    dir.join(format!("0x{shard:06x}[{iteration:03}].merylData"))
}

pub fn batch_index_path(dir: &Path, shard: u32, iteration: u32) -> PathBuf {
    dir.join(format!("0x{shard:06x}[{iteration:03}].merylData.idx"))
}

/// Where one prefix's block lives in its shard file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IndexEntry {
    pub prefix: u64,
    pub offset: u64,
    pub n_kmers: u64,
}

/// Write `entries` as little-endian `(prefix, offset, n_kmers)` triples.
pub fn write_block_index(path: &Path, entries: &[IndexEntry]) -> Result<()> {
    let file = File::create(path).io_context(path, "create index")?;
    let mut out = BufWriter::new(file);
    for e in entries {
        out.write_all(&e.prefix.to_le_bytes())
            .and_then(|_| out.write_all(&e.offset.to_le_bytes()))
            .and_then(|_| out.write_all(&e.n_kmers.to_le_bytes()))
            .io_context(path, "write index")?;
    }
    out.flush().io_context(path, "write index")
}

pub fn read_block_index(path: &Path) -> Result<Vec<IndexEntry>> {
    let bytes = fs::read(path).io_context(path, "read index")?;
    if bytes.len() % INDEX_ENTRY_BYTES != 0 {
        return Err(KmerError::format(
            path,
            format!("index is {} bytes, not a whole number of entries", bytes.len()),
        ));
    }

    let word = |b: &[u8]| {
        let mut w = [0u8; 8];
        w.copy_from_slice(b);
        u64::from_le_bytes(w)
    };

    Ok(bytes
        .chunks_exact(INDEX_ENTRY_BYTES)
        .map(|c| IndexEntry {
            prefix: word(&c[0..8]),
            offset: word(&c[8..16]),
            n_kmers: word(&c[16..24]),
        })
        .collect())
}

/// Contents of `merylIndex`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MasterIndex {
    pub layout: KmerLayout,
    pub multi_set: bool,
    /// 1 or 2, from the magic.
    pub version: u32,
    pub stats: KmerStatistics,
}

impl MasterIndex {
    pub fn new(layout: KmerLayout, multi_set: bool, stats: KmerStatistics) -> Self {
        Self {
            layout,
            multi_set,
            version: 2,
            stats,
        }
    }

    /// Always writes the v02 format, through a temporary file renamed into place.
    pub fn write(&self, dir: &Path) -> Result<()> {
        let path = master_index_path(dir);
        let tmp = dir.join(format!("{MASTER_INDEX_NAME}.tmp"));

        let file = File::create(&tmp).io_context(&tmp, "create master index")?;
        let mut out = BufWriter::new(file);
        let flags = if self.multi_set { FLAG_MULTI_SET } else { 0 };
        let layout = &self.layout;

        (|| {
            out.write_all(&INDEX_MAGIC_V2)?;
            out.write_all(&flags.to_le_bytes())?;
            for v in [
                layout.prefix_bits(),
                layout.suffix_bits(),
                layout.files_bits(),
                layout.blocks_bits(),
            ] {
                out.write_all(&v.to_le_bytes())?;
            }
            self.stats.dump_to(&mut out)?;
            out.flush()
        })()
        .io_context(&tmp, "write master index")?;
        drop(out);

        fs::rename(&tmp, &path).io_context(&path, "rename master index")
    }

    pub fn read(dir: &Path) -> Result<Self> {
        let path = master_index_path(dir);
        let file = File::open(&path).io_context(&path, "open master index")?;
        let mut input = BufReader::new(file);

        let mut magic = [0u8; 16];
        input.read_exact(&mut magic).map_err(|_| KmerError::UnknownFormat {
            path: path.clone(),
            found: "<truncated>".to_string(),
        })?;

        let version = match magic {
            INDEX_MAGIC_V1 => 1,
            INDEX_MAGIC_V2 => 2,
            _ => {
                return Err(KmerError::UnknownFormat {
                    path,
                    found: magic.escape_ascii().to_string(),
                })
            }
        };

        let mut u32_field = || -> std::io::Result<u32> {
            let mut buf = [0u8; 4];
            input.read_exact(&mut buf)?;
            Ok(u32::from_le_bytes(buf))
        };

        let flags = if version >= 2 {
            u32_field().io_context(&path, "read master index")?
        } else {
            0
        };
        let mut widths = [0u32; 4];
        for w in widths.iter_mut() {
            *w = u32_field().io_context(&path, "read master index")?;
        }

        let [prefix_bits, suffix_bits, files_bits, blocks_bits] = widths;
        let layout = KmerLayout::from_widths(prefix_bits, suffix_bits, files_bits, blocks_bits)
            .ok_or_else(|| {
                KmerError::format(
                    &path,
                    format!(
                        "invalid layout: prefix {prefix_bits} suffix {suffix_bits} \
                         files {files_bits} blocks {blocks_bits} bits"
                    ),
                )
            })?;

        let stats = KmerStatistics::load_from(&mut input).io_context(&path, "read statistics")?;

        Ok(Self {
            layout,
            multi_set: flags & FLAG_MULTI_SET != 0,
            version,
            stats,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_names() {
        let dir = Path::new("db");
        assert_eq!(data_path(dir, 5), Path::new("db/0x000005.merylData"));
        assert_eq!(index_path(dir, 63), Path::new("db/0x00003f.merylData.idx"));
        assert_eq!(batch_data_path(dir, 1, 2), Path::new("db/0x000001[002].merylData"));
        assert_eq!(
            batch_index_path(dir, 0, 12),
            Path::new("db/0x000000[012].merylData.idx")
        );
    }

    #[test]
    fn block_index_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.idx");
        let entries = vec![
            IndexEntry { prefix: 0, offset: 0, n_kmers: 0 },
            IndexEntry { prefix: 1, offset: 0, n_kmers: 12 },
            IndexEntry { prefix: 2, offset: 400, n_kmers: 3 },
        ];
        write_block_index(&path, &entries).unwrap();
        assert_eq!(fs::metadata(&path).unwrap().len(), 72);
        assert_eq!(read_block_index(&path).unwrap(), entries);

        fs::write(&path, [0u8; 30]).unwrap();
        assert!(matches!(read_block_index(&path), Err(KmerError::Format { .. })));
    }

    #[test]
    fn master_index_versions() {
        let dir = tempfile::tempdir().unwrap();
        let layout = KmerLayout::new(21, 12, 6).unwrap();
        let mut stats = KmerStatistics::new();
        stats.add(1);
        stats.add(4);

        MasterIndex::new(layout, true, stats.clone()).write(dir.path()).unwrap();
        let back = MasterIndex::read(dir.path()).unwrap();
        assert_eq!(back.version, 2);
        assert!(back.multi_set);
        assert_eq!(back.layout, layout);
        assert_eq!(back.stats, stats);

        //  v01: no flags word.
        let mut v1 = INDEX_MAGIC_V1.to_vec();
        for v in [12u32, 30, 6, 6] {
            v1.extend_from_slice(&v.to_le_bytes());
        }
        KmerStatistics::new().dump_to(&mut v1).unwrap();
        fs::write(master_index_path(dir.path()), &v1).unwrap();
        let back = MasterIndex::read(dir.path()).unwrap();
        assert_eq!(back.version, 1);
        assert!(!back.multi_set);
        assert_eq!(back.layout, layout);

        fs::write(master_index_path(dir.path()), b"notAnIndexAtAll!").unwrap();
        assert!(matches!(
            MasterIndex::read(dir.path()),
            Err(KmerError::UnknownFormat { .. })
        ));
    }
}
