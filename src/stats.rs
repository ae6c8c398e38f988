use std::collections::BTreeMap;
use std::io::{self, Read, Write};

use num_format::{Locale, ToFormattedString};

use crate::error::Result;

/// Value statistics of a k-mer database.
///
/// `num_unique` counts k-mers whose value is 1, `num_distinct` counts k-mers,
/// `num_total` sums the values.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KmerStatistics {
    num_unique: u64,
    num_distinct: u64,
    num_total: u64,
    histogram: BTreeMap<u64, u64>,
}

impl KmerStatistics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, value: u64) {
        if value == 1 {
            self.num_unique += 1;
        }
        self.num_distinct += 1;
        self.num_total = self.num_total.saturating_add(value);
        *self.histogram.entry(value).or_insert(0) += 1;
    }

    pub fn merge(&mut self, other: &KmerStatistics) {
        self.num_unique += other.num_unique;
        self.num_distinct += other.num_distinct;
        self.num_total = self.num_total.saturating_add(other.num_total);
        for (&value, &count) in &other.histogram {
            *self.histogram.entry(value).or_insert(0) += count;
        }
    }

    pub fn num_unique(&self) -> u64 {
        self.num_unique
    }

    pub fn num_distinct(&self) -> u64 {
        self.num_distinct
    }

    pub fn num_total(&self) -> u64 {
        self.num_total
    }

    pub fn is_empty(&self) -> bool {
        self.num_distinct == 0
    }

    /// `(value, occurrences)` in increasing value order.
    pub fn histogram(&self) -> impl Iterator<Item = (u64, u64)> + '_ {
        self.histogram.iter().map(|(&v, &c)| (v, c))
    }

    pub fn max_value(&self) -> Option<u64> {
        self.histogram.keys().next_back().copied()
    }

    /// Little-endian: unique, distinct, total, histogram length, then
    /// `(value, occurrences)` pairs.
    pub fn dump_to<W: Write>(&self, out: &mut W) -> io::Result<()> {
        out.write_all(&self.num_unique.to_le_bytes())?;
        out.write_all(&self.num_distinct.to_le_bytes())?;
        out.write_all(&self.num_total.to_le_bytes())?;
        out.write_all(&(self.histogram.len() as u64).to_le_bytes())?;
        for (&value, &count) in &self.histogram {
            out.write_all(&value.to_le_bytes())?;
            out.write_all(&count.to_le_bytes())?;
        }
        Ok(())
    }

    pub fn load_from<R: Read>(input: &mut R) -> io::Result<Self> {
        let mut next = || -> io::Result<u64> {
            let mut buf = [0u8; 8];
            input.read_exact(&mut buf)?;
            Ok(u64::from_le_bytes(buf))
        };

        let num_unique = next()?;
        let num_distinct = next()?;
        let num_total = next()?;
        let len = next()?;

        let mut histogram = BTreeMap::new();
        for _ in 0..len {
            let value = next()?;
            let count = next()?;
            histogram.insert(value, count);
        }

        Ok(Self {
            num_unique,
            num_distinct,
            num_total,
            histogram,
        })
    }

    /// Histogram as CSV with a `value,occurrences,fraction_distinct,fraction_total` header.
    pub fn write_histogram_csv<W: Write>(&self, out: W) -> Result<()> {
        let mut wtr = csv::Writer::from_writer(out);
        wtr.write_record(["value", "occurrences", "fraction_distinct", "fraction_total"])?;

        let distinct = self.num_distinct.max(1) as f64;
        let total = self.num_total.max(1) as f64;
        let mut cum_distinct = 0u64;
        let mut cum_total = 0u128;

        for (&value, &count) in &self.histogram {
            cum_distinct += count;
            cum_total += value as u128 * count as u128;
            wtr.write_record([
                value.to_string(),
                count.to_string(),
                format!("{:.4}", cum_distinct as f64 / distinct),
                format!("{:.4}", cum_total as f64 / total),
            ])?;
        }
        wtr.flush().map_err(csv::Error::from)?;
        Ok(())
    }

    /// Summary at info level.
    pub fn report(&self) {
        log::info!(
            "{} distinct k-mers, {} unique, {} total",
            self.num_distinct.to_formatted_string(&Locale::en),
            self.num_unique.to_formatted_string(&Locale::en),
            self.num_total.to_formatted_string(&Locale::en)
        );
        if let Some(max) = self.max_value() {
            log::info!("largest value {}", max.to_formatted_string(&Locale::en));
        }
    }
}
