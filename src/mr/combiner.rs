//! Merging of partial word counts into the final result
//!
//! Merging is a plain per-key sum, so it is associative and commutative and
//! can run at every level of the reduction tree: documents into a shard,
//! shards into the job, and finished jobs into one combined result.

use std::path::PathBuf;

use anyhow::Context;
use rayon::prelude::*;

use crate::{
    mr::{counters::Counters, function::wc::PartialCount},
    output,
};

/// The merged counts of a whole job
pub type FinalCount = PartialCount;

/// Add every count of `other` into `acc`
pub fn merge_into(acc: &mut PartialCount, other: PartialCount) {
    for (key, value) in other {
        *acc.entry(key).or_insert(0) += value;
    }
}

/// Merge two partials, always folding the smaller map into the larger one
fn merge_pair(mut lhs: PartialCount, mut rhs: PartialCount) -> PartialCount {
    if lhs.len() < rhs.len() {
        std::mem::swap(&mut lhs, &mut rhs);
    }
    merge_into(&mut lhs, rhs);
    lhs
}

/// Merge any number of partials, in parallel, into the final count
pub fn merge(partials: Vec<PartialCount>) -> FinalCount {
    partials
        .into_par_iter()
        .reduce(PartialCount::new, merge_pair)
}

/// Combine the outputs of several earlier jobs into a single count
///
/// Every input is a job output directory or a single output file. Each line
/// read counts as one fetched record.
pub fn combine_outputs(inputs: &[PathBuf], counters: &Counters) -> anyhow::Result<FinalCount> {
    let mut files = Vec::new();
    for input in inputs {
        let listed = crate::warc::list_input_files(input, None)
            .with_context(|| format!("Failed to list job output {}", input.display()))?;
        files.extend(listed);
    }
    tracing::info!("[Combine] Combining {} output file(s) from {} input(s)", files.len(), inputs.len());

    let partials = files
        .par_iter()
        .map(|file| -> anyhow::Result<PartialCount> {
            let counts = output::read_counts(file)?;
            counters.add_fetched(counts.lines);
            counters.add_collected(counts.lines);
            Ok(counts.counts)
        })
        .collect::<anyhow::Result<Vec<_>>>()?;

    Ok(merge(partials))
}
