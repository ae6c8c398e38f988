//! Turning counter inputs into chunks for the workers.

use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use seq_io::fastq::Record as _;

use crate::error::{IoContext, KmerError, Result};

/// Something to count.
#[derive(Debug, Clone)]
pub enum SequenceInput {
    /// FASTA or FASTQ file, compressed or not.
    Path(PathBuf),
    /// Sequences already in memory.
    Sequences(Vec<Vec<u8>>),
    /// Forward k-mers, already 2-bit encoded.
    Kmers(Vec<u64>),
}

/// Unit of work handed to a worker.
#[derive(Debug)]
pub enum Chunk {
    Bases(Vec<Vec<u8>>),
    Kmers(Vec<u64>),
}

pub struct InputStats {
    sequences: AtomicU64,
    bases: AtomicU64,
}

impl InputStats {
    pub fn new() -> Self {
        Self {
            sequences: AtomicU64::new(0),
            bases: AtomicU64::new(0),
        }
    }

    fn add_batch(&self, sequences: u64, bases: u64) {
        if sequences == 0 && bases == 0 {
            return;
        }
        self.sequences.fetch_add(sequences, Ordering::Relaxed);
        self.bases.fetch_add(bases, Ordering::Relaxed);
    }

    pub fn sequences(&self) -> u64 {
        self.sequences.load(Ordering::Relaxed)
    }

    pub fn bases(&self) -> u64 {
        self.bases.load(Ordering::Relaxed)
    }
}

impl Default for InputStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Collects sequence pieces into chunks of about `chunk_bases` bases.
struct Chunker<'a, F> {
    mer_size: usize,
    chunk_bases: usize,
    pending: Vec<Vec<u8>>,
    pending_bases: usize,
    stats: &'a InputStats,
    send: F,
}

impl<F> Chunker<'_, F>
where
    F: FnMut(Chunk) -> Result<()>,
{
    /// Sequences longer than a chunk are cut into pieces that overlap by
    /// `k - 1` bases, so no k-mer is lost or counted twice.
    fn push(&mut self, seq: &[u8]) -> Result<()> {
        self.stats.add_batch(1, seq.len() as u64);
        if seq.len() < self.mer_size {
            return Ok(());
        }

        let mut start = 0;
        loop {
            let end = (start + self.chunk_bases).min(seq.len());
            self.pending.push(seq[start..end].to_vec());
            self.pending_bases += end - start;
            if self.pending_bases >= self.chunk_bases {
                self.flush()?;
            }
            if end == seq.len() {
                return Ok(());
            }
            start = end + 1 - self.mer_size;
        }
    }

    fn flush(&mut self) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        self.pending_bases = 0;
        (self.send)(Chunk::Bases(std::mem::take(&mut self.pending)))
    }
}

/// Read every input in order and hand chunks to `send`.
///
/// `chunk_bases` is raised to at least `2k` so long sequences always make
/// progress.
pub fn load_inputs<F>(
    inputs: &[SequenceInput],
    mer_size: u32,
    chunk_bases: usize,
    stats: &InputStats,
    mut send: F,
) -> Result<()>
where
    F: FnMut(Chunk) -> Result<()>,
{
    let mer_size = mer_size as usize;
    let chunk_bases = chunk_bases.max(2 * mer_size);

    for input in inputs {
        match input {
            SequenceInput::Kmers(kmers) => {
                for part in kmers.chunks(chunk_bases) {
                    send(Chunk::Kmers(part.to_vec()))?;
                }
            }
            SequenceInput::Sequences(seqs) => {
                let mut chunker = Chunker {
                    mer_size,
                    chunk_bases,
                    pending: Vec::new(),
                    pending_bases: 0,
                    stats,
                    send: &mut send,
                };
                for seq in seqs {
                    chunker.push(seq)?;
                }
                chunker.flush()?;
            }
            SequenceInput::Path(path) => {
                log::info!("loading '{}'", path.display());
                let mut chunker = Chunker {
                    mer_size,
                    chunk_bases,
                    pending: Vec::new(),
                    pending_bases: 0,
                    stats,
                    send: &mut send,
                };
                read_fastx(path, |seq| chunker.push(seq))?;
                chunker.flush()?;
            }
        }
    }
    Ok(())
}

fn input_error(path: &Path, detail: impl ToString) -> KmerError {
    KmerError::Input {
        path: path.to_path_buf(),
        detail: detail.to_string(),
    }
}

/// Stream the sequences of a FASTA or FASTQ file, decompressing as needed.
fn read_fastx<F>(path: &Path, mut each: F) -> Result<()>
where
    F: FnMut(&[u8]) -> Result<()>,
{
    let file = File::open(path).io_context(path, "open input")?;
    if file.metadata().io_context(path, "stat input")?.len() == 0 {
        return Ok(());
    }
    let (reader, _format) = niffler::get_reader(Box::new(file)).map_err(|e| input_error(path, e))?;
    let mut reader = BufReader::new(reader);

    let first = match reader.fill_buf().io_context(path, "read input")?.first() {
        Some(&b) => b,
        None => return Ok(()),
    };

    match first {
        b'>' => read_fasta(path, reader, each),
        b'@' => {
            let mut fq = seq_io::fastq::Reader::new(reader);
            while let Some(record) = fq.next() {
                let record = record.map_err(|e| input_error(path, e))?;
                each(record.seq())?;
            }
            Ok(())
        }
        other => Err(input_error(
            path,
            format!("not FASTA or FASTQ, first byte {:?}", other as char),
        )),
    }
}

fn read_fasta<R, F>(path: &Path, reader: R, mut each: F) -> Result<()>
where
    R: Read,
    F: FnMut(&[u8]) -> Result<()>,
{
    let mut fa = seq_io::fasta::Reader::new(reader);
    while let Some(record) = fa.next() {
        let record = record.map_err(|e| input_error(path, e))?;
        each(&record.full_seq())?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kmer::KmerIter;
    use std::io::Write;

    fn collect(inputs: &[SequenceInput], k: u32, chunk: usize) -> (Vec<Chunk>, InputStats) {
        let stats = InputStats::new();
        let mut chunks = Vec::new();
        load_inputs(inputs, k, chunk, &stats, |c| {
            chunks.push(c);
            Ok(())
        })
        .unwrap();
        (chunks, stats)
    }

    fn kmers_of(chunks: &[Chunk], k: u32) -> Vec<u64> {
        let mut out = Vec::new();
        for chunk in chunks {
            match chunk {
                Chunk::Bases(seqs) => {
                    for s in seqs {
                        out.extend(KmerIter::new(s, k).map(|(f, _)| f));
                    }
                }
                Chunk::Kmers(kmers) => out.extend(kmers),
            }
        }
        out
    }

    #[test]
    fn long_sequences_split_with_overlap() {
        let seq = b"ACGTTGCAACGGTACCATGACGTAGCATGCAAGT".to_vec();
        let whole: Vec<u64> = KmerIter::new(&seq, 5).map(|(f, _)| f).collect();

        let (chunks, stats) = collect(&[SequenceInput::Sequences(vec![seq.clone()])], 5, 10);
        assert!(chunks.len() > 2);
        assert_eq!(kmers_of(&chunks, 5), whole);
        assert_eq!(stats.sequences(), 1);
        assert_eq!(stats.bases(), seq.len() as u64);
    }

    #[test]
    fn short_sequences_are_skipped() {
        let (chunks, stats) = collect(&[SequenceInput::Sequences(vec![b"ACG".to_vec()])], 5, 100);
        assert!(chunks.is_empty());
        assert_eq!(stats.sequences(), 1);
    }

    #[test]
    fn kmer_input_is_chunked() {
        let kmers: Vec<u64> = (0..25).collect();
        let (chunks, _) = collect(&[SequenceInput::Kmers(kmers.clone())], 3, 10);
        assert_eq!(chunks.len(), 3);
        assert_eq!(kmers_of(&chunks, 3), kmers);
    }

    #[test]
    fn fasta_and_fastq_files() {
        let dir = tempfile::tempdir().unwrap();

        let fa = dir.path().join("reads.fa");
        let mut f = File::create(&fa).unwrap();
        writeln!(f, ">one\nACGTAC\nGTACGT\n>two\nTTTT").unwrap();
        drop(f);

        let fq = dir.path().join("reads.fq");
        let mut f = File::create(&fq).unwrap();
        writeln!(f, "@r1\nACGTACGTACGT\n+\nIIIIIIIIIIII").unwrap();
        drop(f);

        let inputs = [SequenceInput::Path(fa), SequenceInput::Path(fq)];
        let (chunks, stats) = collect(&inputs, 4, 1000);
        assert_eq!(stats.sequences(), 3);
        assert_eq!(stats.bases(), 12 + 4 + 12);
        assert_eq!(kmers_of(&chunks, 4).len(), 9 + 1 + 9);
    }

    #[test]
    fn unknown_format_is_an_input_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("junk.txt");
        std::fs::write(&path, "hello, world\n").unwrap();
        let stats = InputStats::new();
        let err =
            load_inputs(&[SequenceInput::Path(path)], 4, 100, &stats, |_| Ok(())).unwrap_err();
        assert!(matches!(err, KmerError::Input { .. }));
    }
}
