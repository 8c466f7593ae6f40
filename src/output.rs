//! Persisting word counts
//!
//! A job output is a directory of `reduce_n` partition files `mr-{r}.txt`,
//! gzip-compressed to `mr-{r}.txt.gz` by default. A token lands in partition
//! `hash(token) % reduce_n` and every partition is sorted by token, one
//! `token\tcount` line per entry.

use std::{
    collections::hash_map::DefaultHasher,
    fs::{self, File},
    hash::{Hash, Hasher},
    io::{BufRead, BufReader, BufWriter, Write},
    path::{Path, PathBuf},
};

use anyhow::{bail, ensure, Context};
use flate2::{bufread::MultiGzDecoder, write::GzEncoder, Compression};

use crate::{mr::function::wc::PartialCount, warc::is_gzip};

/// Counts read back from one output file
#[derive(Debug, Default)]
pub struct ReadCounts {
    pub counts: PartialCount,
    /// Number of `token\tcount` lines read
    pub lines: u64,
}

fn cal_hash_for_key(key: &str) -> u64 {
    let mut s = DefaultHasher::new();
    key.hash(&mut s);
    s.finish()
}

fn partition_file_name(r: usize, compress: bool) -> String {
    if compress {
        format!("mr-{}.txt.gz", r)
    } else {
        format!("mr-{}.txt", r)
    }
}

/// Write `counts` into `reduce_n` key-sorted partition files under `dir`
pub fn write_counts(
    dir: &Path,
    counts: &PartialCount,
    reduce_n: usize,
    compress: bool,
) -> anyhow::Result<Vec<PathBuf>> {
    ensure!(reduce_n > 0, "the reduce task number must be at least 1");
    fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create output directory {}", dir.display()))?;

    let mut partitions = vec![Vec::new(); reduce_n];
    for (key, value) in counts {
        let index = (cal_hash_for_key(key) % reduce_n as u64) as usize;
        partitions[index].push((key.as_str(), *value));
    }

    let mut paths = Vec::with_capacity(reduce_n);
    for (r, mut entries) in partitions.into_iter().enumerate() {
        entries.sort_unstable_by(|lhs, rhs| lhs.0.cmp(rhs.0));
        let path = dir.join(partition_file_name(r, compress));
        let file = File::create(&path)
            .with_context(|| format!("Failed to create output file {}", path.display()))?;
        let file = BufWriter::new(file);
        if compress {
            let mut encoder = GzEncoder::new(file, Compression::default());
            write_entries(&mut encoder, &entries)?;
            encoder.finish()?.flush()?;
        } else {
            let mut file = file;
            write_entries(&mut file, &entries)?;
            file.flush()?;
        }
        tracing::debug!("[Reduce] Wrote {} entries to {}", entries.len(), path.display());
        paths.push(path);
    }

    Ok(paths)
}

fn write_entries<W: Write>(writer: &mut W, entries: &[(&str, u64)]) -> anyhow::Result<()> {
    for (key, value) in entries {
        writeln!(writer, "{}\t{}", key, value)?;
    }
    Ok(())
}

/// Read a file written by [`write_counts`], summing repeated tokens
pub fn read_counts(path: &Path) -> anyhow::Result<ReadCounts> {
    let file = BufReader::new(
        File::open(path).with_context(|| format!("Failed to open {}", path.display()))?,
    );
    let reader: Box<dyn BufRead> = if is_gzip(path) {
        Box::new(BufReader::new(MultiGzDecoder::new(file)))
    } else {
        Box::new(file)
    };

    let mut read = ReadCounts::default();
    for (n, line) in reader.lines().enumerate() {
        let line = line.with_context(|| format!("Failed to read {}", path.display()))?;
        if line.is_empty() {
            continue;
        }
        let Some((key, value)) = line.rsplit_once('\t') else {
            bail!("{}:{}: expected `token\\tcount`, found {:?}", path.display(), n + 1, line);
        };
        let value = value
            .parse::<u64>()
            .with_context(|| format!("{}:{}: invalid count {:?}", path.display(), n + 1, value))?;
        *read.counts.entry(key.to_string()).or_insert(0) += value;
        read.lines += 1;
    }

    Ok(read)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> PartialCount {
        [("zeta", 1), ("alpha", 4), ("Mid", 2), ("beta", 7), ("42", 3)]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect()
    }

    #[test]
    fn partitions_are_sorted_and_complete() {
        let dir = tempfile::tempdir().unwrap();
        let paths = write_counts(dir.path(), &sample(), 3, false).unwrap();
        assert_eq!(paths.len(), 3);
        assert!(paths[0].ends_with("mr-0.txt"));

        let mut total = PartialCount::new();
        for path in &paths {
            let contents = fs::read_to_string(path).unwrap();
            let keys = contents
                .lines()
                .map(|l| l.split('\t').next().unwrap())
                .collect::<Vec<_>>();
            let mut sorted = keys.clone();
            sorted.sort();
            assert_eq!(keys, sorted);

            total.extend(read_counts(path).unwrap().counts);
        }
        assert_eq!(total, sample());
    }

    #[test]
    fn compressed_output_reads_back() {
        let dir = tempfile::tempdir().unwrap();
        let paths = write_counts(dir.path(), &sample(), 1, true).unwrap();
        assert!(paths[0].ends_with("mr-0.txt.gz"));

        let read = read_counts(&paths[0]).unwrap();
        assert_eq!(read.counts, sample());
        assert_eq!(read.lines, 5);
    }

    #[test]
    fn malformed_lines_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mr-0.txt");

        fs::write(&path, "word 3\n").unwrap();
        assert!(read_counts(&path).is_err());

        fs::write(&path, "word\tmany\n").unwrap();
        assert!(read_counts(&path).is_err());
    }

    #[test]
    fn repeated_tokens_are_summed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mr-0.txt");
        fs::write(&path, "a\t1\n\na\t2\nb\t1\n").unwrap();

        let read = read_counts(&path).unwrap();
        assert_eq!(read.counts["a"], 3);
        assert_eq!(read.lines, 3);
    }
}
