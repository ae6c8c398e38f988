use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use num_format::{Locale, ToFormattedString};

use merstore::constants::DEFAULT_MER_SIZE;
use merstore::counter::{CounterConfig, SequenceInput, ThreadedCounter};
use merstore::error::{IoContext, KmerError};
use merstore::kmer::{decode_kmer, encode_kmer, CountMode, DEFAULT_FILES_BITS};
use merstore::logging::init_logger;
use merstore::merge::{combine_databases, transform_database, MergeOp, ValueOp};
use merstore::reader::KmerCountFileReader;
use merstore::utils::{parse_memory, read_fof};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Log progress at info level (RUST_LOG overrides)
    #[arg(short, long, global = true)]
    verbose: bool,
    /// Number of threads (defaults to all available threads)
    #[arg(short, long, global = true)]
    threads: Option<usize>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Count the k-mers of FASTA/FASTQ files into a database
    Count {
        /// K value
        #[arg(short, long, default_value_t = DEFAULT_MER_SIZE)]
        k_size: u32,
        /// forward, reverse or canonical
        #[arg(short, long, default_value_t = CountMode::Canonical)]
        mode: CountMode,
        /// Memory budget, in GB unless suffixed with K, M, G or T
        #[arg(short = 'r', long, default_value = "8")]
        memory: String,
        /// Output database directory
        #[arg(short, long)]
        output: PathBuf,
        /// File listing input files, one per line
        #[arg(short, long)]
        input_list: Option<PathBuf>,
        /// Expected number of k-mers, instead of a guess from file sizes
        #[arg(long)]
        expected_kmers: Option<u64>,
        /// Bucket prefix bits, instead of the estimated optimum
        #[arg(long)]
        prefix_bits: Option<u32>,
        /// Shard files are 2^files_bits
        #[arg(long, default_value_t = DEFAULT_FILES_BITS)]
        files_bits: u32,
        /// Print the table plan and exit
        #[arg(long)]
        configure_only: bool,
        /// Input FASTA/FASTQ files, optionally compressed
        inputs: Vec<PathBuf>,
    },
    /// Combine databases with a set operation
    Combine {
        /// add, min, max, and, or, xor, intersect-min, intersect-max,
        /// intersect-sum or difference (first input minus the others)
        #[arg(long, default_value_t = MergeOp::Add)]
        op: MergeOp,
        /// Output database directory
        #[arg(short, long)]
        output: PathBuf,
        /// Input database directories
        #[arg(required = true, num_args = 1..)]
        inputs: Vec<PathBuf>,
    },
    /// Filter or rewrite the values of one database
    Transform {
        database: PathBuf,
        /// Output database directory
        #[arg(short, long)]
        output: PathBuf,
        /// Applied in order, as name:number. Filters: less-than, greater-than,
        /// at-least, at-most, equal-to, not-equal-to. Modifiers: increase,
        /// decrease, multiply, divide, modulo
        #[arg(required = true, num_args = 1..)]
        ops: Vec<ValueOp>,
    },
    /// Print every k-mer and its value
    Print {
        database: PathBuf,
        /// Only this shard file
        #[arg(long)]
        shard: Option<u32>,
    },
    /// Value histogram as CSV
    Histogram { database: PathBuf },
    /// Summary statistics
    Statistics { database: PathBuf },
    /// Look up k-mers given as strings
    Lookup {
        database: PathBuf,
        #[arg(required = true, num_args = 1..)]
        kmers: Vec<String>,
    },
}

fn main() -> miette::Result<()> {
    let args = Args::parse();
    init_logger(args.verbose);

    let threads = args
        .threads
        .unwrap_or_else(|| std::thread::available_parallelism().map_or(1, |n| n.get()));
    rayon::ThreadPoolBuilder::new()
        .num_threads(threads)
        .build_global()
        .map_err(|e| KmerError::Config(format!("cannot start {threads} threads: {e}")))?;

    match args.command {
        Command::Count {
            k_size,
            mode,
            memory,
            output,
            input_list,
            expected_kmers,
            prefix_bits,
            files_bits,
            configure_only,
            inputs,
        } => {
            let mut config = CounterConfig::new(k_size);
            config.mode = mode;
            config.max_memory = parse_memory(&memory)?;
            config.threads = threads;
            config.expected_kmers = expected_kmers;
            config.prefix_bits = prefix_bits;
            config.files_bits = files_bits;
            let counter = ThreadedCounter::new(config)?;

            let mut files = match input_list {
                Some(fof) => read_fof(&fof)?,
                None => Vec::new(),
            };
            files.extend(inputs);
            if files.is_empty() {
                return Err(KmerError::Config("no input files given".to_string()).into());
            }
            let inputs: Vec<SequenceInput> = files.into_iter().map(SequenceInput::Path).collect();

            if configure_only {
                let plan = counter.plan(&inputs);
                println!("prefix bits      {}", plan.prefix_bits);
                println!(
                    "expected memory  {} MiB",
                    (plan.expected_memory >> 20).to_formatted_string(&Locale::en)
                );
                println!("expected batches {}", plan.batches);
                return Ok(());
            }

            counter.run(&inputs, &output)?;
        }
        Command::Combine { op, output, inputs } => {
            combine_databases(&inputs, &output, op)?;
        }
        Command::Transform {
            database,
            output,
            ops,
        } => {
            transform_database(&database, &output, &ops)?;
        }
        Command::Print { database, shard } => print_database(&database, shard)?,
        Command::Histogram { database } => {
            let reader = KmerCountFileReader::open(&database)?;
            reader.statistics().write_histogram_csv(io::stdout().lock())?;
        }
        Command::Statistics { database } => {
            let reader = KmerCountFileReader::open(&database)?;
            let stats = reader.statistics();
            let layout = reader.layout();
            println!("mer size       {}", layout.mer_size());
            println!("prefix bits    {}", layout.prefix_bits());
            println!("shard files    {}", layout.num_files());
            println!("format         v{:02}", reader.version());
            println!("multi-set      {}", reader.is_multi_set());
            println!("distinct       {}", stats.num_distinct().to_formatted_string(&Locale::en));
            println!("unique         {}", stats.num_unique().to_formatted_string(&Locale::en));
            println!("total          {}", stats.num_total().to_formatted_string(&Locale::en));
            if let Some(max) = stats.max_value() {
                println!("largest value  {}", max.to_formatted_string(&Locale::en));
            }
        }
        Command::Lookup { database, kmers } => lookup(&database, &kmers)?,
    }
    Ok(())
}

fn print_database(database: &Path, shard: Option<u32>) -> merstore::Result<()> {
    let mut reader = match shard {
        Some(shard) => KmerCountFileReader::open_shard(database, shard)?,
        None => KmerCountFileReader::open(database)?,
    };
    let k = reader.mer_size();
    let stdout = Path::new("<stdout>");
    let mut out = BufWriter::new(io::stdout().lock());
    while reader.next_mer()? {
        writeln!(out, "{}\t{}", decode_kmer(reader.kmer(), k), reader.value())
            .io_context(stdout, "write")?;
    }
    out.flush().io_context(stdout, "write")
}

fn lookup(database: &Path, kmers: &[String]) -> merstore::Result<()> {
    let mut reader = KmerCountFileReader::open(database)?;
    let k = reader.mer_size() as usize;
    for text in kmers {
        let kmer = match encode_kmer(text.as_bytes()) {
            Some(kmer) if text.len() == k => kmer,
            _ => {
                return Err(KmerError::Config(format!(
                    "'{text}' is not a {k}-mer over ACGT"
                )))
            }
        };
        println!("{text}\t{}", reader.lookup(kmer)?.unwrap_or(0));
    }
    Ok(())
}
