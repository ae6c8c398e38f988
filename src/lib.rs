//! K-mer counting into a sharded, indexed, bit-packed on-disk database.
//!
//! [`counter::ThreadedCounter`] counts sequence input under a memory budget,
//! spilling batches to disk and merging them at the end.
//! [`reader::KmerCountFileReader`] reads the result back sequentially, one
//! shard at a time, or by random access. [`merge::combine_databases`]
//! combines finished databases with set operations.

pub mod bits;
pub mod codec;
pub mod count_array;
pub mod counter;
pub mod error;
pub mod files;
pub mod kmer;
pub mod logging;
pub mod merge;
pub mod reader;
pub mod stats;
pub mod utils;
pub mod writer;

pub mod constants {
    include!(concat!(env!("OUT_DIR"), "/constants.rs"));
}

pub use counter::{CountSummary, CounterConfig, SequenceInput, ThreadedCounter};
pub use error::{KmerError, Result};
pub use kmer::{CountMode, KmerLayout};
pub use merge::{MergeOp, ValueOp};
pub use reader::KmerCountFileReader;
pub use stats::KmerStatistics;
pub use writer::KmerFileWriter;
