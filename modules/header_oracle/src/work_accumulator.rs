//! Cumulative work arithmetic and fork-choice ordering.

use std::cmp::Ordering;

use opentxs_common::{Header, Work};

use crate::header_record::HeaderRecord;

/// Cumulative work of `header` given its parent's cumulative work.
pub fn accumulate(parent_work: &Work, header: &Header) -> Work {
    parent_work + &header.work
}

/// Orders two cumulative work values. `Equal` is a tie, which callers
/// resolve by acceptance order, never by hash or height.
pub fn compare(a: &Work, b: &Work) -> Ordering {
    a.cmp(b)
}

/// Whether `candidate` beats `incumbent` as best tip: strictly more work,
/// or equal work and accepted earlier.
pub fn outranks(candidate: &HeaderRecord, incumbent: &HeaderRecord) -> bool {
    let (Some(candidate_work), Some(incumbent_work)) = (&candidate.work, &incumbent.work) else {
        return candidate.work.is_some();
    };
    match compare(candidate_work, incumbent_work) {
        Ordering::Greater => true,
        Ordering::Less => false,
        Ordering::Equal => candidate.sequence < incumbent.sequence,
    }
}
