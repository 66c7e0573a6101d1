//! Running a minimizer and interpreting its outcome.
//!
//! The driver owns the two policies that are independent of the minimization algorithm:
//! the final cost is the lowest cost in the iteration history, and the optimized state
//! replaces the working state only when the run did not end in `USER_ABORT` or
//! `NUMERICAL_FAILURE`.

use nalgebra::DVector;
use tracing::{debug, warn};
use web_time::{Duration, Instant};

use crate::callbacks::CallbackPipeline;
use crate::optimizer::{IterationSummary, Minimizer, MinimizerOptions, MinimizerSummary};

#[derive(Debug, Clone)]
pub struct DriverOutcome {
    pub summary: MinimizerSummary,
    /// Lowest cost over the iteration history, `None` when no iteration was recorded.
    pub final_cost: Option<f64>,
    /// Whether the working state was replaced by the optimized one.
    pub write_back: bool,
    pub minimizer_time: Duration,
}

/// Minimum cost over `iterations`.
pub fn final_cost_from_history(iterations: &[IterationSummary]) -> Option<f64> {
    iterations
        .iter()
        .map(|iteration| iteration.cost)
        .min_by(|a, b| a.total_cmp(b))
}

/// Run `minimizer` from `x`, updating `x` when the result may be kept.
pub fn run_minimizer(
    minimizer: &mut dyn Minimizer,
    options: &MinimizerOptions,
    x: &mut DVector<f64>,
    callbacks: &mut CallbackPipeline<'_>,
) -> DriverOutcome {
    let start = Instant::now();
    let summary = minimizer.minimize(options, x, callbacks);
    let minimizer_time = start.elapsed();

    let write_back = summary.termination_type.writes_back();
    if write_back {
        x.copy_from(&summary.x);
    } else {
        warn!(
            "Minimizer terminated with {}, keeping the initial state: {}",
            summary.termination_type, summary.message
        );
    }

    let final_cost = final_cost_from_history(&summary.iterations);
    debug!(
        "Minimizer: {} after {} iterations, final cost {:?}",
        summary.termination_type,
        summary.iterations.len().saturating_sub(1),
        final_cost
    );
    DriverOutcome {
        summary,
        final_cost,
        write_back,
        minimizer_time,
    }
}
