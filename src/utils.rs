use std::fs::File;
use std::io::{self, BufRead};
use std::path::{Path, PathBuf};

use crate::error::{IoContext, KmerError, Result};

pub fn read_lines<P>(filename: P) -> io::Result<io::Lines<io::BufReader<File>>>
where
    P: AsRef<Path>,
{
    let file = File::open(filename)?;
    Ok(io::BufReader::new(file).lines())
}

/// Read a file of file names, one per line. Blank lines and `#` comments
/// are skipped; relative names are taken relative to the list's directory.
pub fn read_fof(path: &Path) -> Result<Vec<PathBuf>> {
    let base = path.parent().unwrap_or_else(|| Path::new(""));
    let mut files = Vec::new();
    for line in read_lines(path).io_context(path, "open file list")? {
        let line = line.io_context(path, "read file list")?;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let name = Path::new(line);
        files.push(if name.is_absolute() {
            name.to_path_buf()
        } else {
            base.join(name)
        });
    }
    Ok(files)
}

/// Parse a memory size. A bare number is in gigabytes; `K`, `M`, `G` and
/// `T` suffixes (optionally followed by `B`) select the unit.
pub fn parse_memory(text: &str) -> Result<u64> {
    let t = text.trim().to_ascii_uppercase();
    let t = t.strip_suffix('B').unwrap_or(&t);

    let (number, scale) = match t.char_indices().last() {
        Some((i, 'K')) => (&t[..i], 1u64 << 10),
        Some((i, 'M')) => (&t[..i], 1 << 20),
        Some((i, 'G')) => (&t[..i], 1 << 30),
        Some((i, 'T')) => (&t[..i], 1 << 40),
        _ => (t, 1 << 30),
    };

    let value: f64 = number
        .trim()
        .parse()
        .map_err(|_| KmerError::Config(format!("cannot parse memory size '{text}'")))?;
    if !value.is_finite() || value < 0.0 {
        return Err(KmerError::Config(format!("invalid memory size '{text}'")));
    }
    Ok((value * scale as f64) as u64)
}
