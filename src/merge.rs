//! Combining sorted `(kmer, value)` streams.
//!
//! The same k-way merge serves two purposes: collapsing the batch files of
//! one counting run, and combining whole databases with a set operation.
//! [`transform_database`] filters or rewrites the values of one database.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use num_format::{Locale, ToFormattedString};

use crate::codec::KmerBlock;
use crate::error::{KmerError, Result};
use crate::kmer::KmerLayout;
use crate::reader::KmerCountFileReader;
use crate::stats::KmerStatistics;
use crate::writer::KmerFileWriter;

/// How values of one k-mer from several inputs are combined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MergeOp {
    /// Saturating sum.
    #[default]
    Add,
    /// Smallest value among the inputs holding the k-mer.
    Min,
    /// Largest value among the inputs holding the k-mer.
    Max,
    /// Present in every input.
    And,
    /// Present in any input.
    Or,
    /// Present in an odd number of inputs.
    Xor,
    /// Present in every input, smallest value.
    IntersectMin,
    /// Present in every input, largest value.
    IntersectMax,
    /// Present in every input, summed values.
    IntersectSum,
    /// Present in the first input and in no other; keeps the first value.
    Difference,
}

fn saturating_sum(held: &[(usize, u64)]) -> u64 {
    held.iter().fold(0u64, |acc, &(_, v)| acc.saturating_add(v))
}

impl MergeOp {
    /// Combine the `(input, value)` entries of one k-mer, in input order.
    /// `None` drops the k-mer from the output.
    ///
    /// An input may appear more than once; it still counts as one input.
    pub fn combine(self, held: &[(usize, u64)], n_inputs: usize) -> Option<u64> {
        if held.is_empty() {
            return None;
        }
        let sources = 1 + held.windows(2).filter(|w| w[0].0 != w[1].0).count();
        let in_all = sources == n_inputs;
        let values = held.iter().map(|&(_, v)| v);

        match self {
            MergeOp::Add => Some(saturating_sum(held)),
            MergeOp::Min => values.min(),
            MergeOp::Max => values.max(),
            MergeOp::And => in_all.then_some(1),
            MergeOp::Or => Some(1),
            MergeOp::Xor => (sources % 2 == 1).then_some(1),
            MergeOp::IntersectMin => values.min().filter(|_| in_all),
            MergeOp::IntersectMax => values.max().filter(|_| in_all),
            MergeOp::IntersectSum => in_all.then(|| saturating_sum(held)),
            MergeOp::Difference => held
                .iter()
                .all(|&(src, _)| src == 0)
                .then(|| saturating_sum(held)),
        }
    }
}

impl FromStr for MergeOp {
    type Err = KmerError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "add" | "sum" | "union-sum" => Ok(MergeOp::Add),
            "min" | "union-min" => Ok(MergeOp::Min),
            "max" | "union-max" => Ok(MergeOp::Max),
            "and" | "intersect" => Ok(MergeOp::And),
            "or" | "union" => Ok(MergeOp::Or),
            "xor" | "symmetric-difference" => Ok(MergeOp::Xor),
            "intersect-min" => Ok(MergeOp::IntersectMin),
            "intersect-max" => Ok(MergeOp::IntersectMax),
            "intersect-sum" => Ok(MergeOp::IntersectSum),
            "difference" => Ok(MergeOp::Difference),
            _ => Err(KmerError::Config(format!(
                "unknown merge operation '{s}' (add, min, max, and, or, xor, \
                 intersect-min, intersect-max, intersect-sum, difference)"
            ))),
        }
    }
}

impl fmt::Display for MergeOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MergeOp::Add => "add",
            MergeOp::Min => "min",
            MergeOp::Max => "max",
            MergeOp::And => "and",
            MergeOp::Or => "or",
            MergeOp::Xor => "xor",
            MergeOp::IntersectMin => "intersect-min",
            MergeOp::IntersectMax => "intersect-max",
            MergeOp::IntersectSum => "intersect-sum",
            MergeOp::Difference => "difference",
        };
        f.write_str(name)
    }
}

/// A per-k-mer value filter or rewrite, written `name:operand`
/// (`at-least:2`, `divide:10`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueOp {
    LessThan(u64),
    GreaterThan(u64),
    AtLeast(u64),
    AtMost(u64),
    EqualTo(u64),
    NotEqualTo(u64),
    /// Saturating add.
    Increase(u64),
    /// Subtract; k-mers that reach zero are dropped.
    Decrease(u64),
    /// Saturating multiply; multiplying by zero drops every k-mer.
    Multiply(u64),
    /// Integer division; k-mers that reach zero are dropped.
    Divide(u64),
    /// Remainder; k-mers that reach zero are dropped.
    Modulo(u64),
}

impl ValueOp {
    /// New value of a k-mer, or `None` to drop it.
    pub fn apply(self, value: u64) -> Option<u64> {
        let keep = |cond: bool| cond.then_some(value);
        match self {
            ValueOp::LessThan(x) => keep(value < x),
            ValueOp::GreaterThan(x) => keep(value > x),
            ValueOp::AtLeast(x) => keep(value >= x),
            ValueOp::AtMost(x) => keep(value <= x),
            ValueOp::EqualTo(x) => keep(value == x),
            ValueOp::NotEqualTo(x) => keep(value != x),
            ValueOp::Increase(x) => Some(value.saturating_add(x)),
            ValueOp::Decrease(x) => value.checked_sub(x).filter(|&v| v > 0),
            ValueOp::Multiply(x) => Some(value.saturating_mul(x)).filter(|&v| v > 0),
            ValueOp::Divide(x) => value.checked_div(x).filter(|&v| v > 0),
            ValueOp::Modulo(x) => value.checked_rem(x).filter(|&v| v > 0),
        }
    }

    fn parts(self) -> (&'static str, u64) {
        match self {
            ValueOp::LessThan(x) => ("less-than", x),
            ValueOp::GreaterThan(x) => ("greater-than", x),
            ValueOp::AtLeast(x) => ("at-least", x),
            ValueOp::AtMost(x) => ("at-most", x),
            ValueOp::EqualTo(x) => ("equal-to", x),
            ValueOp::NotEqualTo(x) => ("not-equal-to", x),
            ValueOp::Increase(x) => ("increase", x),
            ValueOp::Decrease(x) => ("decrease", x),
            ValueOp::Multiply(x) => ("multiply", x),
            ValueOp::Divide(x) => ("divide", x),
            ValueOp::Modulo(x) => ("modulo", x),
        }
    }
}

impl FromStr for ValueOp {
    type Err = KmerError;

    fn from_str(s: &str) -> Result<Self> {
        let bad = |why: &str| KmerError::Config(format!("bad value operation '{s}': {why}"));

        let (name, operand) = s
            .split_once([':', '='])
            .ok_or_else(|| bad("expected name:number, e.g. at-least:2"))?;
        let x: u64 = operand.trim().parse().map_err(|_| bad("operand is not a number"))?;

        let op = match name.trim().to_ascii_lowercase().as_str() {
            "less-than" => ValueOp::LessThan(x),
            "greater-than" => ValueOp::GreaterThan(x),
            "at-least" => ValueOp::AtLeast(x),
            "at-most" => ValueOp::AtMost(x),
            "equal-to" => ValueOp::EqualTo(x),
            "not-equal-to" => ValueOp::NotEqualTo(x),
            "increase" => ValueOp::Increase(x),
            "decrease" => ValueOp::Decrease(x),
            "multiply" => ValueOp::Multiply(x),
            "divide" if x == 0 => return Err(bad("division by zero")),
            "divide" => ValueOp::Divide(x),
            "modulo" if x == 0 => return Err(bad("modulo by zero")),
            "modulo" => ValueOp::Modulo(x),
            _ => return Err(bad("unknown operation")),
        };
        Ok(op)
    }
}

impl fmt::Display for ValueOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (name, x) = self.parts();
        write!(f, "{name}:{x}")
    }
}

/// A stream of `(key, value)` pairs in non-decreasing key order.
pub trait SortedSource {
    fn next_entry(&mut self) -> Result<Option<(u64, u64)>>;
}

impl SortedSource for KmerBlock {
    fn next_entry(&mut self) -> Result<Option<(u64, u64)>> {
        Ok(KmerBlock::next_entry(self))
    }
}

/// Adapter for in-memory sorted data.
pub struct IterSource<I>(pub I);

impl<I: Iterator<Item = (u64, u64)>> SortedSource for IterSource<I> {
    fn next_entry(&mut self) -> Result<Option<(u64, u64)>> {
        Ok(self.0.next())
    }
}

/// Merge `sources` in key order, combining equal keys with `op`.
///
/// Equal keys are gathered in input order, tagged with their input. Returns
/// the number of entries handed to `emit`.
pub fn kway_merge<S, F>(sources: &mut [S], op: MergeOp, mut emit: F) -> Result<u64>
where
    S: SortedSource,
    F: FnMut(u64, u64) -> Result<()>,
{
    let n_inputs = sources.len();
    let mut heap = BinaryHeap::with_capacity(n_inputs);
    let mut pending = vec![0u64; n_inputs];

    for (ii, source) in sources.iter_mut().enumerate() {
        if let Some((key, value)) = source.next_entry()? {
            pending[ii] = value;
            heap.push(Reverse((key, ii)));
        }
    }

    let mut held = Vec::with_capacity(n_inputs);
    let mut emitted = 0;

    while let Some(Reverse((key, ii))) = heap.pop() {
        held.clear();
        held.push((ii, pending[ii]));
        refill(sources, &mut heap, &mut pending, ii)?;

        while let Some(&Reverse((next, jj))) = heap.peek() {
            if next != key {
                break;
            }
            heap.pop();
            held.push((jj, pending[jj]));
            refill(sources, &mut heap, &mut pending, jj)?;
        }

        if let Some(value) = op.combine(&held, n_inputs) {
            emit(key, value)?;
            emitted += 1;
        }
    }

    Ok(emitted)
}

fn refill<S: SortedSource>(
    sources: &mut [S],
    heap: &mut BinaryHeap<Reverse<(u64, usize)>>,
    pending: &mut [u64],
    ii: usize,
) -> Result<()> {
    if let Some((key, value)) = sources[ii].next_entry()? {
        pending[ii] = value;
        heap.push(Reverse((key, ii)));
    }
    Ok(())
}

/// Cuts a sorted k-mer stream into one writer block per prefix.
struct BlockBuilder<'a> {
    writer: &'a KmerFileWriter,
    layout: KmerLayout,
    prefix: Option<u64>,
    suffixes: Vec<u64>,
    values: Vec<u64>,
}

impl<'a> BlockBuilder<'a> {
    fn new(writer: &'a KmerFileWriter) -> Self {
        Self {
            writer,
            layout: *writer.layout(),
            prefix: None,
            suffixes: Vec::new(),
            values: Vec::new(),
        }
    }

    fn push(&mut self, kmer: u64, value: u64) -> Result<()> {
        let p = self.layout.prefix_of(kmer);
        if self.prefix != Some(p) {
            self.flush()?;
            self.prefix = Some(p);
        }
        self.suffixes.push(self.layout.suffix_of(kmer));
        self.values.push(value);
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        if let Some(done) = self.prefix {
            self.writer.add_block(done, &self.suffixes, &self.values)?;
        }
        self.suffixes.clear();
        self.values.clear();
        Ok(())
    }
}

/// Combine whole databases into a new one at `output`.
///
/// The output takes the layout of the first input. All inputs must share the
/// mer size and hold one value per k-mer.
pub fn combine_databases(
    inputs: &[PathBuf],
    output: &Path,
    op: MergeOp,
) -> Result<KmerStatistics> {
    let Some(first) = inputs.first() else {
        return Err(KmerError::Config("no input databases to combine".to_string()));
    };

    let mut readers = inputs
        .iter()
        .map(|p| KmerCountFileReader::open(p))
        .collect::<Result<Vec<_>>>()?;

    let layout = *readers[0].layout();
    for (reader, path) in readers.iter().zip(inputs) {
        if reader.layout().mer_size() != layout.mer_size() {
            return Err(KmerError::MerSizeMismatch {
                path: path.clone(),
                expected: layout.mer_size(),
                found: reader.layout().mer_size(),
            });
        }
        if reader.is_multi_set() {
            return Err(KmerError::Config(format!(
                "'{}' is a multi-set database; combining needs one value per k-mer",
                path.display()
            )));
        }
    }

    log::info!(
        "combining {} databases with '{op}' into '{}' (k={}, first input '{}')",
        inputs.len(),
        output.display(),
        layout.mer_size(),
        first.display()
    );

    let writer = KmerFileWriter::create(output, layout)?;
    let mut blocks = BlockBuilder::new(&writer);
    let emitted = kway_merge(&mut readers, op, |kmer, value| blocks.push(kmer, value))?;
    blocks.flush()?;

    log::info!("{} k-mers after combining", emitted.to_formatted_string(&Locale::en));

    writer.finish()
}

/// Apply `ops` in order to every value of the database at `input` and write
/// the surviving k-mers to `output`, same layout.
pub fn transform_database(input: &Path, output: &Path, ops: &[ValueOp]) -> Result<KmerStatistics> {
    if input == output {
        return Err(KmerError::Config(format!(
            "cannot rewrite '{}' in place",
            input.display()
        )));
    }

    let mut reader = KmerCountFileReader::open(input)?;
    let writer = KmerFileWriter::create(output, *reader.layout())?
        .with_multi_set(reader.is_multi_set());

    let names: Vec<String> = ops.iter().map(ToString::to_string).collect();
    log::info!(
        "applying [{}] to '{}' into '{}'",
        names.join(", "),
        input.display(),
        output.display()
    );

    let mut blocks = BlockBuilder::new(&writer);
    let mut seen = 0u64;
    while reader.next_mer()? {
        seen += 1;
        if let Some(value) = ops.iter().try_fold(reader.value(), |v, op| op.apply(v)) {
            blocks.push(reader.kmer(), value)?;
        }
    }
    blocks.flush()?;

    let stats = writer.finish()?;
    log::info!(
        "kept {} of {} k-mers",
        stats.num_distinct().to_formatted_string(&Locale::en),
        seen.to_formatted_string(&Locale::en)
    );
    Ok(stats)
}
