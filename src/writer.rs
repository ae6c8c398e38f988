//! Writing sharded k-mer databases.
//!
//! Blocks are appended to per-shard batch files, one set of files per
//! batch. [`KmerFileWriter::finish`] either renames the only batch into
//! place or k-way merges every batch of a shard into its final file.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use num_format::{Locale, ToFormattedString};
use parking_lot::Mutex;
use rayon::prelude::*;

use crate::codec::{encode_block, KmerBlock};
use crate::error::{IoContext, KmerError, Result};
use crate::files::{
    batch_data_path, batch_index_path, data_path, index_path, write_block_index, IndexEntry,
    MasterIndex,
};
use crate::kmer::KmerLayout;
use crate::merge::{kway_merge, MergeOp};
use crate::reader::BlockFileReader;
use crate::stats::KmerStatistics;

/// Appends blocks to one shard file and remembers where they went.
struct ShardFile {
    path: PathBuf,
    out: BufWriter<File>,
    offset: u64,
    last_prefix: Option<u64>,
    index: Vec<IndexEntry>,
}

impl ShardFile {
    fn create(path: PathBuf, layout: &KmerLayout, shard: u32) -> Result<Self> {
        let file = File::create(&path).io_context(&path, "create data file")?;
        let index = layout
            .prefixes_in_file(shard)
            .map(|prefix| IndexEntry {
                prefix,
                ..IndexEntry::default()
            })
            .collect();
        Ok(Self {
            path,
            out: BufWriter::new(file),
            offset: 0,
            last_prefix: None,
            index,
        })
    }

    fn append(
        &mut self,
        layout: &KmerLayout,
        prefix: u64,
        suffixes: &[u64],
        values: &[u64],
    ) -> Result<()> {
        if self.last_prefix.is_some_and(|last| prefix <= last) {
            return Err(KmerError::Pipeline(format!(
                "block {prefix:#x} written after block {:#x} in '{}'",
                self.last_prefix.unwrap_or_default(),
                self.path.display()
            )));
        }
        self.last_prefix = Some(prefix);

        let bits = encode_block(prefix, suffixes, values, layout.suffix_bits());
        let bytes = bits.dump_to(&mut self.out).io_context(&self.path, "write block")?;

        self.index[layout.block_of(prefix) as usize] = IndexEntry {
            prefix,
            offset: self.offset,
            n_kmers: suffixes.len() as u64,
        };
        self.offset += bytes;
        Ok(())
    }

    fn close(mut self, index_path: &Path) -> Result<()> {
        self.out.flush().io_context(&self.path, "flush data file")?;
        write_block_index(index_path, &self.index)
    }
}

struct ShardWriter {
    shard: u32,
    file: Option<ShardFile>,
    stats: KmerStatistics,
}

pub struct KmerFileWriter {
    dir: PathBuf,
    layout: KmerLayout,
    op: MergeOp,
    multi_set: bool,
    iteration: u32,
    shards: Vec<Mutex<ShardWriter>>,
}

impl KmerFileWriter {
    /// Prepare `dir` (created if missing) for a database with `layout`.
    pub fn create(dir: &Path, layout: KmerLayout) -> Result<Self> {
        fs::create_dir_all(dir).io_context(dir, "create database directory")?;

        let shards = (0..layout.num_files())
            .map(|shard| {
                Mutex::new(ShardWriter {
                    shard,
                    file: None,
                    stats: KmerStatistics::new(),
                })
            })
            .collect();

        Ok(Self {
            dir: dir.to_path_buf(),
            layout,
            op: MergeOp::Add,
            multi_set: false,
            iteration: 0,
            shards,
        })
    }

    /// Operation used when batches are merged in [`finish`](Self::finish).
    pub fn with_merge_op(mut self, op: MergeOp) -> Self {
        self.op = op;
        self
    }

    pub fn with_multi_set(mut self, multi_set: bool) -> Self {
        self.multi_set = multi_set;
        self
    }

    pub fn layout(&self) -> &KmerLayout {
        &self.layout
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Batches closed so far.
    pub fn batches(&self) -> u32 {
        self.iteration
    }

    /// Append the run of `prefix` to its shard's batch file.
    ///
    /// Within a shard, prefixes must arrive in increasing order. Different
    /// shards may be written concurrently.
    pub fn add_block(&self, prefix: u64, suffixes: &[u64], values: &[u64]) -> Result<()> {
        if suffixes.is_empty() {
            return Ok(());
        }
        if suffixes.len() != values.len() {
            return Err(KmerError::Pipeline(format!(
                "block {prefix:#x} has {} suffixes but {} values",
                suffixes.len(),
                values.len()
            )));
        }

        let shard = self.layout.file_of(prefix);
        let mut writer = self.shards[shard as usize].lock();

        if writer.file.is_none() {
            let path = batch_data_path(&self.dir, shard, self.iteration);
            writer.file = Some(ShardFile::create(path, &self.layout, shard)?);
        }
        if let Some(file) = writer.file.as_mut() {
            file.append(&self.layout, prefix, suffixes, values)?;
        }

        for &v in values {
            writer.stats.add(v);
        }
        Ok(())
    }

    /// Close every shard's batch file, write its index and start a new batch.
    pub fn finish_batch(&mut self) -> Result<()> {
        let dir = &self.dir;
        let layout = &self.layout;
        let iteration = self.iteration;

        self.shards.par_iter_mut().try_for_each(|writer| {
            let writer = writer.get_mut();
            let file = match writer.file.take() {
                Some(file) => file,
                None => {
                    let path = batch_data_path(dir, writer.shard, iteration);
                    ShardFile::create(path, layout, writer.shard)?
                }
            };
            file.close(&batch_index_path(dir, writer.shard, iteration))
        })?;

        log::debug!("closed batch {iteration} in '{}'", self.dir.display());
        self.iteration += 1;
        Ok(())
    }

    /// Publish the final shard files and the master index.
    pub fn finish(mut self) -> Result<KmerStatistics> {
        let open = self.shards.iter_mut().any(|w| w.get_mut().file.is_some());
        if open || self.iteration == 0 {
            self.finish_batch()?;
        }

        let stats = if self.iteration == 1 {
            self.rename_single_batch()?
        } else {
            self.merge_batches()?
        };

        MasterIndex::new(self.layout, self.multi_set, stats.clone()).write(&self.dir)?;

        log::info!(
            "wrote {} distinct k-mers in {} files to '{}'",
            stats.num_distinct().to_formatted_string(&Locale::en),
            self.layout.num_files(),
            self.dir.display()
        );
        Ok(stats)
    }

    fn rename_single_batch(&mut self) -> Result<KmerStatistics> {
        let mut stats = KmerStatistics::new();
        for writer in self.shards.iter_mut() {
            let writer = writer.get_mut();
            let shard = writer.shard;

            let from = batch_data_path(&self.dir, shard, 0);
            let to = data_path(&self.dir, shard);
            fs::rename(&from, &to).io_context(&from, "rename data file")?;

            let from = batch_index_path(&self.dir, shard, 0);
            let to = index_path(&self.dir, shard);
            fs::rename(&from, &to).io_context(&from, "rename index")?;

            stats.merge(&writer.stats);
        }
        Ok(stats)
    }

    fn merge_batches(&mut self) -> Result<KmerStatistics> {
        log::info!(
            "merging {} batches in {} files",
            self.iteration,
            self.layout.num_files()
        );

        let shard_stats = (0..self.layout.num_files())
            .into_par_iter()
            .map(|shard| merge_shard(&self.dir, &self.layout, shard, self.iteration, self.op))
            .collect::<Result<Vec<_>>>()?;

        let mut stats = KmerStatistics::new();
        for s in &shard_stats {
            stats.merge(s);
        }
        Ok(stats)
    }
}

/// Merge every batch of one shard into its final file.
fn merge_shard(
    dir: &Path,
    layout: &KmerLayout,
    shard: u32,
    batches: u32,
    op: MergeOp,
) -> Result<KmerStatistics> {
    let mut inputs = (0..batches)
        .map(|iter| BlockFileReader::open(&batch_data_path(dir, shard, iter)))
        .collect::<Result<Vec<_>>>()?;

    let mut heads = inputs
        .iter_mut()
        .map(|r| r.next_block())
        .collect::<Result<Vec<_>>>()?;

    let mut out = ShardFile::create(data_path(dir, shard), layout, shard)?;
    let mut stats = KmerStatistics::new();
    let mut suffixes = Vec::new();
    let mut values = Vec::new();

    while let Some(prefix) = heads.iter().flatten().map(|b| b.prefix).min() {
        //  One source per batch; a batch without this prefix is an empty
        //  source so presence-based operations still count it.
        let mut blocks: Vec<KmerBlock> = Vec::with_capacity(heads.len());
        for (head, input) in heads.iter_mut().zip(inputs.iter_mut()) {
            match head.take_if(|b| b.prefix == prefix) {
                Some(block) => {
                    blocks.push(block);
                    *head = input.next_block()?;
                }
                None => blocks.push(KmerBlock::default()),
            }
        }

        suffixes.clear();
        values.clear();
        kway_merge(&mut blocks, op, |s, v| {
            suffixes.push(s);
            values.push(v);
            Ok(())
        })?;

        if !suffixes.is_empty() {
            out.append(layout, prefix, &suffixes, &values)?;
            for &v in &values {
                stats.add(v);
            }
        }
    }

    out.close(&index_path(dir, shard))?;

    for iter in 0..batches {
        for path in [batch_data_path(dir, shard, iter), batch_index_path(dir, shard, iter)] {
            fs::remove_file(&path).io_context(&path, "remove batch file")?;
        }
    }

    Ok(stats)
}
