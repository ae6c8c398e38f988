//! Memory-bounded, multi-threaded k-mer counting.
//!
//! Three stages run in scoped threads:
//!
//! ```text
//! loader --chunks--> workers (n) --flush requests--> writer
//! ```
//!
//! Workers extract and sort the k-mers of a chunk and insert them into the
//! shared [`CountingTable`]. Every allocation is charged to the shared
//! [`CounterState`]; when the budget is exhausted, one worker becomes the
//! flush leader, waits until no worker is inside the table and asks the
//! writer to dump every bucket as one batch. Batches are merged when the
//! input is exhausted.

pub mod loader;

use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;

use crossbeam::channel::{bounded, Receiver, Sender};
use num_format::{Locale, ToFormattedString};
use parking_lot::{Condvar, Mutex};
use rayon::prelude::*;

use crate::count_array::{CountArray, CountingTable, DEFAULT_SEGMENT_BITS};
use crate::error::{KmerError, Result};
use crate::kmer::{
    kmer_mask, reverse_complement, CountMode, KmerIter, KmerLayout, DEFAULT_FILES_BITS,
    MAX_MER_SIZE,
};
use crate::stats::KmerStatistics;
use crate::writer::KmerFileWriter;

pub use loader::{Chunk, InputStats, SequenceInput};

/// Default bases per chunk handed to a worker.
pub const DEFAULT_CHUNK_BASES: usize = 1 << 20;

#[derive(Debug, Clone)]
pub struct CounterConfig {
    pub mer_size: u32,
    pub mode: CountMode,
    /// Memory budget in bytes for the counting table.
    pub max_memory: u64,
    pub threads: usize,
    /// Bucket prefix width; estimated from the input when `None`.
    pub prefix_bits: Option<u32>,
    /// Overrides the file-size based guess of the input k-mers.
    pub expected_kmers: Option<u64>,
    pub files_bits: u32,
    pub segment_bits: u64,
    pub chunk_bases: usize,
    /// Chunks queued between loader and workers.
    pub queue_depth: usize,
}

impl CounterConfig {
    pub fn new(mer_size: u32) -> Self {
        Self {
            mer_size,
            mode: CountMode::Canonical,
            max_memory: 4 << 30,
            threads: thread::available_parallelism().map_or(1, |n| n.get()),
            prefix_bits: None,
            expected_kmers: None,
            files_bits: DEFAULT_FILES_BITS,
            segment_bits: DEFAULT_SEGMENT_BITS,
            chunk_bases: DEFAULT_CHUNK_BASES,
            queue_depth: 4,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.mer_size == 0 || self.mer_size > MAX_MER_SIZE {
            return Err(KmerError::Config(format!(
                "k-mer size {} out of range 1..={MAX_MER_SIZE}",
                self.mer_size
            )));
        }
        if self.threads == 0 {
            return Err(KmerError::Config("at least one worker thread is needed".to_string()));
        }
        if self.queue_depth == 0 {
            return Err(KmerError::Config("queue depth must be positive".to_string()));
        }
        if let Some(bits) = self.prefix_bits {
            KmerLayout::new(self.mer_size, bits, self.files_bits)?;
            check_table_fits(bits, self.max_memory)?;
        }
        Ok(())
    }
}

/// The empty table alone must fit in the memory limit.
fn check_table_fits(prefix_bits: u32, max_memory: u64) -> Result<()> {
    let overhead = CountingTable::overhead_for(prefix_bits);
    if overhead > max_memory {
        return Err(KmerError::Config(format!(
            "{prefix_bits} prefix bits need {} bytes of buckets, more than the {} byte memory \
             limit; use fewer prefix bits or more memory",
            overhead.to_formatted_string(&Locale::en),
            max_memory.to_formatted_string(&Locale::en)
        )));
    }
    Ok(())
}

/// Table shape chosen for an input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CountPlan {
    pub prefix_bits: u32,
    /// Expected table memory for the whole input, in bytes.
    pub expected_memory: u64,
    /// Expected number of batches under the memory budget.
    pub batches: u64,
}

/// Pick the prefix width that minimizes the table memory for
/// `expected_kmers` k-mers.
///
/// Small tables waste segment space per bucket, large ones pay for the
/// buckets themselves. At least 3 bits are used when the mer size allows.
pub fn estimate_sizes(
    max_memory: u64,
    expected_kmers: u64,
    mer_size: u32,
    segment_bits: u64,
) -> CountPlan {
    let max_bits = (2 * mer_size).min(32);
    let min_bits = 3.min(max_bits);
    let bucket_bytes = std::mem::size_of::<Mutex<CountArray>>() as u128;
    let pointer_bytes = std::mem::size_of::<Vec<u64>>() as u128;
    let segment_bits = segment_bits.max(64) as u128;

    let mut best: Option<(u32, u128)> = None;

    log::debug!("prefix  buckets  kmers/bucket  segs/bucket    memory");
    for wp in 1..=max_bits {
        let n_prefix = 1u128 << wp;
        let width = (2 * mer_size - wp).max(1) as u128;
        let kmers_per_prefix = expected_kmers as u128 / n_prefix + 1;
        let kmers_per_seg = (segment_bits / width).max(1);
        let segs_per_prefix = kmers_per_prefix / kmers_per_seg + 1;

        let struct_memory = bucket_bytes * n_prefix + pointer_bytes * n_prefix * segs_per_prefix;
        let data_memory = n_prefix * segs_per_prefix * segment_bits / 8;
        let total = struct_memory + data_memory;

        log::debug!(
            "{wp:>6}  {n_prefix:>7}  {kmers_per_prefix:>12}  {segs_per_prefix:>11}  {total:>8}"
        );

        if wp >= min_bits && best.map_or(true, |(_, m)| total < m) {
            best = Some((wp, total));
        }
    }

    let (prefix_bits, memory) = best.unwrap_or((max_bits, 0));
    let expected_memory = memory.min(u64::MAX as u128) as u64;
    CountPlan {
        prefix_bits,
        expected_memory,
        batches: expected_memory / max_memory.max(1) + 1,
    }
}

/// Rough k-mer count of the inputs, from file sizes for files.
///
/// Compressed files are scaled up: `.xz` by 5, `.gz` and `.bz2` by 4.
pub fn guess_kmers_in_input(inputs: &[SequenceInput]) -> u64 {
    inputs
        .iter()
        .map(|input| match input {
            SequenceInput::Kmers(kmers) => kmers.len() as u64,
            SequenceInput::Sequences(seqs) => seqs.iter().map(|s| s.len() as u64).sum(),
            SequenceInput::Path(path) => {
                let size = fs::metadata(path).map_or(0, |m| m.len());
                let scale = match path.extension().and_then(|e| e.to_str()) {
                    Some("xz") => 5,
                    Some("gz") | Some("bz2") => 4,
                    _ => 1,
                };
                size * scale
            }
        })
        .sum()
}

#[derive(Debug, Default)]
struct Gate {
    active: usize,
    flushing: bool,
}

/// Memory accounting and the flush gate shared by all pipeline stages.
pub struct CounterState {
    mem_used: AtomicU64,
    mem_base: u64,
    max_memory: u64,
    gate: Mutex<Gate>,
    cond: Condvar,
    failed: AtomicBool,
}

impl CounterState {
    pub fn new(mem_base: u64, max_memory: u64) -> Self {
        Self {
            mem_used: AtomicU64::new(mem_base),
            mem_base,
            max_memory,
            gate: Mutex::new(Gate::default()),
            cond: Condvar::new(),
            failed: AtomicBool::new(false),
        }
    }

    pub fn mem_used(&self) -> u64 {
        self.mem_used.load(Ordering::Relaxed)
    }

    pub fn add_memory(&self, bytes: u64) -> u64 {
        self.mem_used.fetch_add(bytes, Ordering::Relaxed) + bytes
    }

    pub fn memory_full(&self) -> bool {
        self.mem_used() >= self.max_memory
    }

    /// Wait out any flush, then mark this thread as inside the table.
    pub fn enter(&self) {
        let mut gate = self.gate.lock();
        while gate.flushing {
            self.cond.wait(&mut gate);
        }
        gate.active += 1;
    }

    pub fn leave(&self) {
        let mut gate = self.gate.lock();
        gate.active -= 1;
        drop(gate);
        self.cond.notify_all();
    }

    /// Try to become the flush leader.
    ///
    /// Returns `true` with no thread inside the table; the caller must then
    /// call [`end_flush`](Self::end_flush). Returns `false` if another
    /// thread flushed (this call waits for it to finish) or memory is no
    /// longer full.
    pub fn begin_flush(&self) -> bool {
        let mut gate = self.gate.lock();
        if gate.flushing {
            while gate.flushing {
                self.cond.wait(&mut gate);
            }
            return false;
        }
        if !self.memory_full() {
            return false;
        }

        gate.flushing = true;
        while gate.active > 0 {
            self.cond.wait(&mut gate);
        }
        true
    }

    pub fn end_flush(&self) {
        self.mem_used.store(self.mem_base, Ordering::Relaxed);
        let mut gate = self.gate.lock();
        gate.flushing = false;
        drop(gate);
        self.cond.notify_all();
    }

    pub fn fail(&self) {
        self.failed.store(true, Ordering::Relaxed);
    }

    pub fn has_failed(&self) -> bool {
        self.failed.load(Ordering::Relaxed)
    }
}

/// Sent by the flush leader; answered once the batch is on disk.
struct FlushRequest {
    done: Sender<Result<()>>,
}

#[derive(Debug, Clone)]
pub struct CountSummary {
    pub layout: KmerLayout,
    pub kmers_added: u64,
    pub sequences: u64,
    pub bases: u64,
    pub batches: u32,
    pub stats: KmerStatistics,
}

pub struct ThreadedCounter {
    config: CounterConfig,
}

impl ThreadedCounter {
    pub fn new(config: CounterConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &CounterConfig {
        &self.config
    }

    /// Table shape for `inputs` under the configured budget.
    pub fn plan(&self, inputs: &[SequenceInput]) -> CountPlan {
        let cfg = &self.config;
        let expected = cfg
            .expected_kmers
            .unwrap_or_else(|| guess_kmers_in_input(inputs));
        let mut plan = estimate_sizes(cfg.max_memory, expected, cfg.mer_size, cfg.segment_bits);
        if let Some(bits) = cfg.prefix_bits {
            plan.prefix_bits = bits;
        }
        plan
    }

    /// Count `inputs` into a new database at `output`.
    pub fn run(&self, inputs: &[SequenceInput], output: &Path) -> Result<CountSummary> {
        let cfg = &self.config;
        let plan = self.plan(inputs);
        check_table_fits(plan.prefix_bits, cfg.max_memory)?;
        let layout = KmerLayout::new(cfg.mer_size, plan.prefix_bits, cfg.files_bits)?;

        log::info!(
            "counting {}-mers ({}) with {} prefix bits, {} threads, {} MiB budget, ~{} batches",
            cfg.mer_size,
            cfg.mode,
            layout.prefix_bits(),
            cfg.threads,
            (cfg.max_memory >> 20).to_formatted_string(&Locale::en),
            plan.batches
        );

        let table = CountingTable::new(layout, cfg.segment_bits);
        let state = CounterState::new(table.overhead_bytes(), cfg.max_memory);
        let writer = KmerFileWriter::create(output, layout)?;
        let input_stats = InputStats::new();
        let kmers_added = AtomicU64::new(0);

        let (chunk_tx, chunk_rx) = bounded::<Chunk>(cfg.queue_depth);
        let (flush_tx, flush_rx) = bounded::<FlushRequest>(1);

        let results = thread::scope(|s| {
            let table = &table;
            let state = &state;
            let input_stats = &input_stats;
            let kmers_added = &kmers_added;

            let loader_handle = s.spawn(move || {
                let result = loader::load_inputs(
                    inputs,
                    cfg.mer_size,
                    cfg.chunk_bases,
                    input_stats,
                    |chunk| {
                        if state.has_failed() {
                            return Err(KmerError::Pipeline("counting stopped".to_string()));
                        }
                        chunk_tx
                            .send(chunk)
                            .map_err(|_| KmerError::Pipeline("workers stopped".to_string()))
                    },
                );
                if result.is_err() {
                    state.fail();
                }
                result
            });

            let writer_handle = s.spawn(move || {
                let result = write_stage(table, writer, flush_rx, state);
                if result.is_err() {
                    state.fail();
                }
                result
            });

            let workers: Vec<_> = (0..cfg.threads)
                .map(|_| {
                    let rx = chunk_rx.clone();
                    let flush_tx = flush_tx.clone();
                    s.spawn(move || {
                        let result = work_stage(cfg, table, state, rx, flush_tx, kmers_added);
                        if result.is_err() {
                            state.fail();
                        }
                        result
                    })
                })
                .collect();
            drop(chunk_rx);
            drop(flush_tx);

            let mut results: Vec<Result<()>> = Vec::new();
            for worker in workers {
                results.push(join(worker));
            }
            results.push(join(loader_handle));
            let summary = join(writer_handle);
            (results, summary)
        });

        let (results, summary) = results;
        let mut errors: Vec<KmerError> = results.into_iter().filter_map(|r| r.err()).collect();
        let (stats, batches) = match summary {
            Ok(done) => done,
            Err(e) => {
                errors.insert(0, e);
                (KmerStatistics::new(), 0)
            }
        };

        //  Report the root cause, not the shutdown it triggered.
        if !errors.is_empty() {
            let pos = errors
                .iter()
                .position(|e| !matches!(e, KmerError::Pipeline(_)))
                .unwrap_or(0);
            return Err(errors.swap_remove(pos));
        }

        let summary = CountSummary {
            layout,
            kmers_added: kmers_added.load(Ordering::Relaxed),
            sequences: input_stats.sequences(),
            bases: input_stats.bases(),
            batches,
            stats,
        };
        log::info!(
            "counted {} k-mers from {} sequences ({} bases) in {} batches",
            summary.kmers_added.to_formatted_string(&Locale::en),
            summary.sequences.to_formatted_string(&Locale::en),
            summary.bases.to_formatted_string(&Locale::en),
            summary.batches
        );
        summary.stats.report();
        Ok(summary)
    }
}

fn join<T>(handle: thread::ScopedJoinHandle<'_, Result<T>>) -> Result<T> {
    handle
        .join()
        .unwrap_or_else(|_| Err(KmerError::Pipeline("a counting thread panicked".to_string())))
}

/// Extract the k-mers of a chunk in the configured orientation, sorted.
fn chunk_kmers(chunk: Chunk, mer_size: u32, mode: CountMode) -> Vec<u64> {
    let mut kmers = match chunk {
        Chunk::Bases(seqs) => {
            let mut out = Vec::with_capacity(seqs.iter().map(|s| s.len()).sum());
            for seq in &seqs {
                out.extend(KmerIter::new(seq, mer_size).map(|(f, r)| mode.select(f, r)));
            }
            out
        }
        Chunk::Kmers(mut kmers) => {
            let mask = kmer_mask(mer_size);
            for kmer in kmers.iter_mut() {
                let fmer = *kmer & mask;
                *kmer = mode.select(fmer, reverse_complement(fmer, mer_size));
            }
            kmers
        }
    };
    kmers.sort_unstable();
    kmers
}

fn work_stage(
    cfg: &CounterConfig,
    table: &CountingTable,
    state: &CounterState,
    chunks: Receiver<Chunk>,
    flush: Sender<FlushRequest>,
    kmers_added: &AtomicU64,
) -> Result<()> {
    for chunk in chunks.iter() {
        if state.has_failed() {
            break;
        }

        let kmers = chunk_kmers(chunk, cfg.mer_size, cfg.mode);

        state.enter();
        let bytes = table.insert_sorted(&kmers);
        state.add_memory(bytes);
        state.leave();
        kmers_added.fetch_add(kmers.len() as u64, Ordering::Relaxed);

        if state.memory_full() && state.begin_flush() {
            let result = request_flush(&flush);
            state.end_flush();
            result?;
        }
    }
    Ok(())
}

fn request_flush(flush: &Sender<FlushRequest>) -> Result<()> {
    let (done, wait) = bounded(1);
    flush
        .send(FlushRequest { done })
        .map_err(|_| KmerError::Pipeline("writer stopped".to_string()))?;
    wait.recv()
        .map_err(|_| KmerError::Pipeline("writer stopped".to_string()))?
}

/// Serve flush requests, then write the last batch and publish the database.
fn write_stage(
    table: &CountingTable,
    mut writer: KmerFileWriter,
    requests: Receiver<FlushRequest>,
    state: &CounterState,
) -> Result<(KmerStatistics, u32)> {
    for request in requests.iter() {
        match flush_table(table, &mut writer, state) {
            Ok(()) => {
                let _ = request.done.send(Ok(()));
            }
            Err(e) => {
                let _ = request
                    .done
                    .send(Err(KmerError::Pipeline("batch flush failed".to_string())));
                return Err(e);
            }
        }
    }

    if state.has_failed() {
        return Err(KmerError::Pipeline("counting aborted, batches left unmerged".to_string()));
    }

    flush_table(table, &mut writer, state)?;
    let batches = writer.batches();
    let stats = writer.finish()?;
    Ok((stats, batches.max(1)))
}

/// Dump every bucket as one batch, shards in parallel.
fn flush_table(
    table: &CountingTable,
    writer: &mut KmerFileWriter,
    state: &CounterState,
) -> Result<()> {
    let held = table.held_kmers();
    if held == 0 {
        return Ok(());
    }

    let files = table.layout().num_files();
    let shared: &KmerFileWriter = writer;
    let written: u64 = (0..files)
        .into_par_iter()
        .map(|file| table.flush_file(file, shared))
        .collect::<Result<Vec<u64>>>()?
        .into_iter()
        .sum();

    writer.finish_batch()?;
    table.reset_held();

    log::info!(
        "batch {}: {} k-mers held, {} distinct written, {} MiB used",
        writer.batches(),
        held.to_formatted_string(&Locale::en),
        written.to_formatted_string(&Locale::en),
        (state.mem_used() >> 20).to_formatted_string(&Locale::en)
    );
    Ok(())
}
