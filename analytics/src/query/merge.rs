//! Merge layer: per-chunk accumulation and the global final merge.

use super::post_plan::PostProcessPlan;
use crate::sink::{ResultBuffer, RowMultimap};

/// Merges one chunk's rows into the accumulator, honoring the sort plan.
pub fn accumulate(plan: &PostProcessPlan, input: ResultBuffer, output: &mut ResultBuffer) {
    output.extend(input);
    if plan.sorted {
        output.sort_by(|a, b| plan.compare_rows(a, b));
    } else {
        output.sort_by(|a, b| a.metadata.timestamp.cmp(&b.metadata.timestamp));
    }
}

/// Produces the globally ordered buffer from every chunk's output and
/// applies the limit.
pub fn final_merge(plan: &PostProcessPlan, inputs: Vec<ResultBuffer>) -> ResultBuffer {
    let mut out: ResultBuffer = inputs.into_iter().flatten().collect();
    if plan.sorted {
        out.sort_by(|a, b| plan.compare_rows(a, b));
    } else {
        out.sort_by(|a, b| a.metadata.timestamp.cmp(&b.metadata.timestamp));
    }
    if let Some(limit) = plan.limit {
        out.truncate(limit);
    }
    out
}

/// Merges stat multi-maps keyed by the grouping tuple. The limit bounds the
/// number of groups: the iterator advances `limit` groups and the tail is
/// discarded.
pub fn final_merge_map(limit: Option<usize>, inputs: Vec<RowMultimap>) -> RowMultimap {
    let mut out = RowMultimap::new();
    for input in inputs {
        for (key, rows) in input {
            out.entry(key).or_default().extend(rows);
        }
    }
    if let Some(limit) = limit {
        while out.len() > limit {
            out.pop_last();
        }
    }
    out
}
