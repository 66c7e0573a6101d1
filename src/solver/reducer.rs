//! Reducing a problem to the part the minimizer works on.
//!
//! Residual blocks that depend only on constant parameter blocks never change during the
//! solve: their cost is evaluated once and folded into a fixed cost. Parameter blocks that
//! are constant, or not referenced by any remaining residual block, are dropped. The
//! remaining parameter blocks are then permuted to follow the elimination ordering, with a
//! fallback to a non-Schur linear solver when the ordering no longer has e-blocks.

use std::collections::HashSet;

use tracing::{debug, warn};

use crate::core::{
    CoreError,
    graph::{create_parameter_block_graph, independent_set_ordering, is_independent},
    ordering::ParameterBlockOrdering,
    parameter_block::ParameterBlockId,
    problem::Problem,
    program::Program,
};
use crate::error::SolverResult;
use crate::linalg::{LinearSolverType, PreconditionerType};
use crate::solver::reorder::lexicographically_order_residual_blocks;

/// Result of [`create_reduced_program`].
#[derive(Debug, Clone)]
pub struct ReducedProgram {
    pub program: Program,
    /// Cost of the residual blocks removed because all their parameter blocks are constant.
    pub fixed_cost: f64,
    /// Linear solver to build, after any Schur fallback.
    pub linear_solver_type: LinearSolverType,
    pub preconditioner_type: PreconditionerType,
    /// Ordering restricted to the parameter blocks of `program`.
    pub ordering: ParameterBlockOrdering,
}

impl ReducedProgram {
    /// Number of e-blocks the evaluator and linear solver see.
    pub fn num_eliminate_blocks(&self) -> usize {
        if self.linear_solver_type.is_schur_type() {
            self.ordering.first_group_size()
        } else {
            0
        }
    }
}

/// Remove constant data from `program` and return the cost it contributes.
///
/// Residual blocks whose parameter blocks are all constant are evaluated once at the
/// current values and dropped. Parameter blocks that are constant, or that no remaining
/// residual block uses, are dropped from the program and from `ordering`. Relative order
/// is preserved throughout, so running the function twice is a no-op the second time.
///
/// # Errors
/// Fails when a handle is stale or when a constant residual block cannot be evaluated;
/// the message names the residual block's position in `program`.
///
/// # Panics
/// Panics if the reduced program has residual blocks without parameter blocks or the
/// other way around.
pub fn remove_fixed_blocks_from_program(
    problem: &Problem,
    program: &mut Program,
    mut ordering: Option<&mut ParameterBlockOrdering>,
) -> SolverResult<f64> {
    let mut used: HashSet<ParameterBlockId> = HashSet::with_capacity(program.num_parameter_blocks());
    let mut fixed_cost = 0.0;
    let mut kept = Vec::with_capacity(program.num_residual_blocks());

    for (position, &r) in program.residual_blocks().iter().enumerate() {
        let mut free = Vec::new();
        for &p in problem.residual_block(r)?.parameter_blocks() {
            if !problem.parameter_block(p)?.is_constant() {
                free.push(p);
            }
        }

        if free.is_empty() {
            let evaluation = problem.evaluate_residual_block(r, true, false).map_err(|e| {
                CoreError::Evaluation(format!(
                    "residual block {position} failed to evaluate while computing the fixed cost"
                ))
                .log_with_source(e)
            })?;
            fixed_cost += evaluation.cost;
        } else {
            used.extend(free);
            kept.push(r);
        }
    }
    *program.residual_blocks_mut() = kept;

    let mut num_removed = 0;
    program.parameter_blocks_mut().retain(|id| {
        let keep = used.contains(id);
        if !keep {
            num_removed += 1;
            if let Some(ordering) = ordering.as_deref_mut() {
                ordering.remove(*id);
            }
        }
        keep
    });

    assert_eq!(
        program.num_residual_blocks() == 0,
        program.num_parameter_blocks() == 0,
        "reduced program has {} residual blocks but {} parameter blocks",
        program.num_residual_blocks(),
        program.num_parameter_blocks()
    );
    debug!(
        "Removed {} parameter blocks; {} parameter blocks and {} residual blocks remain, fixed cost {:e}",
        num_removed,
        program.num_parameter_blocks(),
        program.num_residual_blocks(),
        fixed_cost
    );
    Ok(fixed_cost)
}

/// Check a user supplied elimination ordering against the problem.
///
/// The ordering must cover exactly the parameter blocks of the problem. For Schur-type
/// solvers with more than one group the first group must be an independent set.
///
/// # Errors
/// Returns `CoreError::Ordering` describing the mismatch.
pub fn validate_ordering(
    problem: &Problem,
    program: &Program,
    ordering: &ParameterBlockOrdering,
    linear_solver_type: LinearSolverType,
) -> SolverResult<()> {
    for (group, members) in ordering.groups() {
        if let Some(id) = members.iter().find(|&&id| !problem.contains_parameter_block(id)) {
            return Err(CoreError::Ordering(format!(
                "group {group} contains parameter block {id}, which is not part of the problem"
            ))
            .log()
            .into());
        }
    }
    if ordering.num_elements() != problem.num_parameter_blocks() {
        return Err(CoreError::Ordering(format!(
            "ordering has {} parameter blocks but the problem has {}",
            ordering.num_elements(),
            problem.num_parameter_blocks()
        ))
        .log()
        .into());
    }

    if linear_solver_type.is_schur_type()
        && ordering.num_groups() > 1
        && let Some((group, members)) = ordering.groups().next()
        && !is_independent(problem, program, members)?
    {
        return Err(CoreError::Ordering(format!(
            "{linear_solver_type} needs the first elimination group to be an independent set, but group {group} is not"
        ))
        .log()
        .into());
    }
    Ok(())
}

/// Permute the parameter blocks of `program` into ordering order: groups ascending,
/// blocks inside a group by handle.
///
/// # Errors
/// Returns `CoreError::Ordering` when the ordering and the program hold different blocks.
pub fn apply_ordering(program: &mut Program, ordering: &ParameterBlockOrdering) -> SolverResult<()> {
    if ordering.num_elements() != program.num_parameter_blocks() {
        return Err(CoreError::Ordering(format!(
            "ordering has {} parameter blocks but the program has {}",
            ordering.num_elements(),
            program.num_parameter_blocks()
        ))
        .log()
        .into());
    }

    let in_program: HashSet<ParameterBlockId> = program.parameter_blocks().iter().copied().collect();
    let mut ordered = Vec::with_capacity(program.num_parameter_blocks());
    for (group, members) in ordering.groups() {
        for &id in members {
            if !in_program.contains(&id) {
                return Err(CoreError::Ordering(format!(
                    "parameter block {id} of group {group} is not part of the program"
                ))
                .log()
                .into());
            }
            ordered.push(id);
        }
    }
    *program.parameter_blocks_mut() = ordered;
    Ok(())
}

/// Split the blocks of `program` into a greedy independent set (group 0) and the rest
/// (group 1).
fn schur_ordering(problem: &Problem, program: &Program) -> SolverResult<ParameterBlockOrdering> {
    let graph = create_parameter_block_graph(problem, program)?;
    let (vertices, independent_set_size) = independent_set_ordering(&graph);
    let mut ordering = ParameterBlockOrdering::new();
    for (i, &id) in vertices.iter().enumerate() {
        ordering.add_element_to_group(id, usize::from(i >= independent_set_size));
    }
    debug!(
        "Independent set ordering: {} e-blocks out of {}",
        independent_set_size,
        vertices.len()
    );
    Ok(ordering)
}

/// Non-Schur solver and preconditioner to use when a Schur solver has no e-blocks.
fn schur_fallback(
    linear_solver_type: LinearSolverType,
    preconditioner_type: PreconditionerType,
) -> (LinearSolverType, PreconditionerType) {
    let Some(fallback) = linear_solver_type.schur_fallback() else {
        return (linear_solver_type, preconditioner_type);
    };
    let preconditioner = if fallback == LinearSolverType::Cgnr
        && !matches!(
            preconditioner_type,
            PreconditionerType::Identity | PreconditionerType::Jacobi
        ) {
        PreconditionerType::Jacobi
    } else {
        preconditioner_type
    };
    (fallback, preconditioner)
}

/// Reduce `original` and arrange it for the requested linear solver.
///
/// `ordering` covers the parameter blocks of `original`. A Schur-type solver given a
/// single group gets e-blocks from an independent set computation; a Schur-type solver
/// whose first group empties during reduction falls back to the closest non-Schur solver.
/// On return, the reduced program's bookkeeping is written into the problem.
///
/// # Errors
/// Fails on stale handles, on evaluation failure of a constant residual block, and when
/// parameter blocks remain without residual blocks.
pub fn create_reduced_program(
    problem: &mut Problem,
    original: &Program,
    mut ordering: ParameterBlockOrdering,
    linear_solver_type: LinearSolverType,
    preconditioner_type: PreconditionerType,
) -> SolverResult<ReducedProgram> {
    let mut program = original.clone();
    let first_group = ordering.groups().next().map(|(group, _)| group);

    let fixed_cost = remove_fixed_blocks_from_program(problem, &mut program, Some(&mut ordering))?;

    let mut reduced = ReducedProgram {
        program,
        fixed_cost,
        linear_solver_type,
        preconditioner_type,
        ordering,
    };
    if reduced.program.num_parameter_blocks() == 0 {
        if reduced.program.num_residual_blocks() > 0 {
            return Err(CoreError::InvalidInput(format!(
                "reduced program has {} residual blocks but no parameter blocks",
                reduced.program.num_residual_blocks()
            ))
            .log()
            .into());
        }
        warn!("No varying parameter blocks to optimize");
        reduced.program.set_parameter_offsets_and_index(problem)?;
        return Ok(reduced);
    }

    if linear_solver_type.is_schur_type()
        && first_group.is_some_and(|group| reduced.ordering.group_size(group) == 0)
    {
        let (fallback, preconditioner) = schur_fallback(linear_solver_type, preconditioner_type);
        warn!(
            "No e-blocks left in the first elimination group after removing constant parameter blocks; switching from {} to {} ({} preconditioner)",
            linear_solver_type, fallback, preconditioner
        );
        reduced.linear_solver_type = fallback;
        reduced.preconditioner_type = preconditioner;
    }

    if reduced.linear_solver_type.is_schur_type() && reduced.ordering.num_groups() <= 1 {
        reduced.ordering = schur_ordering(problem, &reduced.program)?;
    }
    apply_ordering(&mut reduced.program, &reduced.ordering)?;

    if reduced.linear_solver_type.is_schur_type() {
        lexicographically_order_residual_blocks(
            problem,
            &mut reduced.program,
            reduced.ordering.first_group_size(),
        )?;
    }
    reduced.program.set_parameter_offsets_and_index(problem)?;
    Ok(reduced)
}
