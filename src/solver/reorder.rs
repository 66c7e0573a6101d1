//! Residual block ordering for Schur-type linear solvers.
//!
//! Schur elimination needs the rows of the Jacobian grouped by the eliminated parameter
//! block they touch. Every residual block gets a bucket: the lowest program index among its
//! non-constant parameter blocks, clamped to the size of the first elimination group. Rows
//! touching no e-block all land in the last bucket. A counting sort keeps the relative
//! order of residual blocks inside each bucket.

use std::collections::HashMap;

use tracing::debug;

use crate::core::{parameter_block::ParameterBlockId, problem::Problem, program::Program};
use crate::error::SolverResult;

/// Stable-sort the residual blocks of `program` by bucket. Returns the bucket sizes, one per
/// e-block followed by the bucket of rows without e-blocks.
///
/// The first `num_eliminate_blocks` parameter blocks of `program` are the e-blocks.
///
/// # Errors
/// Fails when a residual or parameter block handle is stale.
///
/// # Panics
/// Panics when `num_eliminate_blocks` is 0, or when the counting sort's post-conditions
/// do not hold.
pub fn lexicographically_order_residual_blocks(
    problem: &Problem,
    program: &mut Program,
    num_eliminate_blocks: usize,
) -> SolverResult<Vec<usize>> {
    assert!(
        num_eliminate_blocks >= 1,
        "residual ordering needs at least one eliminated parameter block"
    );

    let index_of: HashMap<ParameterBlockId, usize> = program
        .parameter_blocks()
        .iter()
        .enumerate()
        .map(|(index, &id)| (id, index))
        .collect();

    let mut positions = Vec::with_capacity(program.num_residual_blocks());
    for &r in program.residual_blocks() {
        let mut position = num_eliminate_blocks;
        for &p in problem.residual_block(r)?.parameter_blocks() {
            if problem.parameter_block(p)?.is_constant() {
                continue;
            }
            if let Some(&index) = index_of.get(&p) {
                position = position.min(index);
            }
        }
        positions.push(position);
    }

    let mut counts = vec![0usize; num_eliminate_blocks + 1];
    for &position in &positions {
        counts[position] += 1;
    }

    // Bucket ends, consumed from the back.
    let mut ends = counts.clone();
    for i in 1..ends.len() {
        ends[i] += ends[i - 1];
    }

    let residual_blocks = program.residual_blocks();
    let mut reordered = vec![None; residual_blocks.len()];
    for (i, &position) in positions.iter().enumerate().rev() {
        ends[position] -= 1;
        reordered[ends[position]] = Some(residual_blocks[i]);
    }

    // Every end must have been pulled back to its bucket start.
    let mut start = 0;
    for (bucket, &count) in counts.iter().enumerate() {
        assert_eq!(
            ends[bucket], start,
            "bucket {bucket} does not match its histogram count"
        );
        start += count;
    }
    assert!(
        reordered.iter().all(Option::is_some),
        "counting sort left a residual slot unfilled"
    );
    let reordered: Vec<_> = reordered.into_iter().flatten().collect();

    debug!(
        "Residual blocks bucketed over {} e-blocks, {} rows without e-block",
        num_eliminate_blocks, counts[num_eliminate_blocks]
    );
    *program.residual_blocks_mut() = reordered;
    Ok(counts)
}
