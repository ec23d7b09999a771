//! Overlap resolution between accepted ROIs.
//!
//! Peel-off extraction can pull two components out of the same
//! cell, one strong and one residual. Pairs whose pixel overlap
//! exceeds the configured fraction of the smaller ROI are
//! resolved greedily: comparable-strength pairs merge into one
//! ROI, a much weaker partner is simply dropped.

use std::collections::{HashMap, HashSet};

use itertools::Itertools;

use crate::data::roi::RoiMask;

/// A weaker partner with at least this fraction of the stronger
/// ROI's total weight merges instead of being dropped.
const MERGE_STRENGTH_RATIO : f32 = 0.5;

/// What overlap resolution did to the accepted set.
#[derive(Debug, Clone, Copy, Default)]
pub struct MergeOutcome {
    pub merged_pairs : usize,
    pub dropped_overlap : usize,
}

/// Resolves all overlapping pairs in place. Each round finds
/// one offending pair, resolves it, and rescans, so chains of
/// overlaps collapse transitively. IDs of surviving ROIs are
/// unchanged; a merged pair keeps the stronger partner's ID.
///
/// Merged ROIs keep their summed weights until every pair is
/// resolved, so mid-chain strength comparisons stay on the same
/// scale as unmerged ROIs; only the survivors of a merge are
/// renormalized at the end.
pub fn resolve_overlaps(
    rois : &mut Vec<RoiMask>,
    max_overlap : f32,
) -> MergeOutcome {
    let mut outcome = MergeOutcome::default();
    let mut merged_ids : HashSet<u32> = HashSet::new();

    loop {
        let pair = (0..rois.len()).tuple_combinations().find(|&(i, j)| {
            rois[i].overlap_fraction(&rois[j]) > max_overlap
        });
        let (i, j) = match pair {
            Some(pair) => pair,
            None => break,
        };

        // stronger = higher total weight, ties to the lower id
        let (strong, weak) = if rois[j].total_weight() > rois[i].total_weight() {
            (j, i)
        } else {
            (i, j)
        };

        if rois[weak].total_weight()
            >= MERGE_STRENGTH_RATIO * rois[strong].total_weight()
        {
            let weak_roi = rois.remove(weak);
            let strong = if weak < strong { strong - 1 } else { strong };
            merge_into(&mut rois[strong], &weak_roi);
            merged_ids.insert(rois[strong].id);
            outcome.merged_pairs += 1;
        } else {
            rois.remove(weak);
            outcome.dropped_overlap += 1;
        }
    }

    for roi in rois.iter_mut() {
        if merged_ids.contains(&roi.id) {
            roi.normalize_weights();
        }
    }

    outcome
}

/// Union of the two pixel sets; shared pixels sum their
/// weights.
fn merge_into(target : &mut RoiMask, other : &RoiMask) {
    let mut combined : HashMap<(usize, usize), f32> = target.pixels.iter()
        .copied()
        .zip(target.weights.iter().copied())
        .collect();
    for (&pixel, &weight) in other.pixels.iter().zip(other.weights.iter()) {
        *combined.entry(pixel).or_insert(0.0) += weight;
    }

    let mut entries : Vec<((usize, usize), f32)> = combined.into_iter().collect();
    entries.sort_by_key(|&(pixel, _)| pixel);

    target.pixels = entries.iter().map(|&(pixel, _)| pixel).collect();
    target.weights = entries.iter().map(|&(_, weight)| weight).collect();
}
