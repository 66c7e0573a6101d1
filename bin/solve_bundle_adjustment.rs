use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use lsq_solver::core::cost_function::{CostFunction, CostFunctionOutput};
use lsq_solver::core::loss_functions::{CauchyLoss, HuberLoss, LossFunction};
use lsq_solver::optimizer::strategy::TrustRegionStrategyType;
use lsq_solver::{
    LinearSolverType, MinimizerType, ParameterBlockId, PreconditionerType, Problem, Solver,
    SolverOptions, init_logger,
};
use nalgebra::{DMatrix, DVector, Vector3};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "solve_bundle_adjustment")]
#[command(about = "Solve a synthetic bundle adjustment problem")]
struct Args {
    /// Number of cameras; camera 0 is held constant
    #[arg(long, default_value = "8")]
    cameras: usize,

    /// Number of 3D points
    #[arg(long, default_value = "200")]
    points: usize,

    /// Half-width of the uniform perturbation applied to the initial estimate
    #[arg(long, default_value = "0.3")]
    noise: f64,

    /// Random seed for the scene and the perturbation
    #[arg(long, default_value = "42")]
    seed: u64,

    #[arg(long, value_enum, default_value = "sparse-schur")]
    linear_solver: LinearSolverArg,

    #[arg(long, value_enum, default_value = "schur-jacobi")]
    preconditioner: PreconditionerArg,

    #[arg(long, value_enum, default_value = "lm")]
    strategy: StrategyArg,

    /// Use the line search minimizer instead of a trust region
    #[arg(long)]
    line_search: bool,

    #[arg(short, long, default_value = "50")]
    max_iterations: usize,

    #[arg(long, default_value = "1")]
    threads: usize,

    /// Alternate over independent groups of blocks after every step
    #[arg(long)]
    inner_iterations: bool,

    #[arg(long, value_enum, default_value = "none")]
    loss: LossArg,

    #[arg(long, default_value = "1.0")]
    loss_scale: f64,

    /// Write a per-iteration log to this file
    #[arg(long)]
    solver_log: Option<PathBuf>,

    /// Print the full report instead of the one-line summary
    #[arg(long)]
    full_report: bool,
}

#[derive(Clone, Copy, ValueEnum)]
enum LinearSolverArg {
    DenseNormalCholesky,
    DenseQr,
    SparseNormalCholesky,
    DenseSchur,
    SparseSchur,
    IterativeSchur,
    Cgnr,
}

impl From<LinearSolverArg> for LinearSolverType {
    fn from(arg: LinearSolverArg) -> Self {
        match arg {
            LinearSolverArg::DenseNormalCholesky => LinearSolverType::DenseNormalCholesky,
            LinearSolverArg::DenseQr => LinearSolverType::DenseQr,
            LinearSolverArg::SparseNormalCholesky => LinearSolverType::SparseNormalCholesky,
            LinearSolverArg::DenseSchur => LinearSolverType::DenseSchur,
            LinearSolverArg::SparseSchur => LinearSolverType::SparseSchur,
            LinearSolverArg::IterativeSchur => LinearSolverType::IterativeSchur,
            LinearSolverArg::Cgnr => LinearSolverType::Cgnr,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum PreconditionerArg {
    Identity,
    Jacobi,
    SchurJacobi,
}

impl From<PreconditionerArg> for PreconditionerType {
    fn from(arg: PreconditionerArg) -> Self {
        match arg {
            PreconditionerArg::Identity => PreconditionerType::Identity,
            PreconditionerArg::Jacobi => PreconditionerType::Jacobi,
            PreconditionerArg::SchurJacobi => PreconditionerType::SchurJacobi,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum StrategyArg {
    Lm,
    Dogleg,
}

#[derive(Clone, Copy, ValueEnum)]
enum LossArg {
    None,
    Huber,
    Cauchy,
}

const FOCAL_LENGTH: f64 = 500.0;

/// Pinhole projection of a point through a camera with identity rotation.
///
/// Parameter blocks: point `[x, y, z]`, camera translation `[tx, ty, tz]`.
struct Reprojection {
    observed: [f64; 2],
}

impl CostFunction for Reprojection {
    fn num_residuals(&self) -> usize {
        2
    }

    fn parameter_block_sizes(&self) -> &[usize] {
        &[3, 3]
    }

    fn evaluate(&self, parameters: &[DVector<f64>], compute_jacobians: bool) -> Option<CostFunctionOutput> {
        let p = Vector3::new(
            parameters[0][0] + parameters[1][0],
            parameters[0][1] + parameters[1][1],
            parameters[0][2] + parameters[1][2],
        );
        // Behind or on the image plane.
        if p.z <= 1e-6 {
            return None;
        }
        let residuals = DVector::from_vec(vec![
            FOCAL_LENGTH * p.x / p.z - self.observed[0],
            FOCAL_LENGTH * p.y / p.z - self.observed[1],
        ]);
        let jacobians = compute_jacobians.then(|| {
            let inv_z = 1.0 / p.z;
            let jacobian = DMatrix::from_row_slice(
                2,
                3,
                &[
                    FOCAL_LENGTH * inv_z,
                    0.0,
                    -FOCAL_LENGTH * p.x * inv_z * inv_z,
                    0.0,
                    FOCAL_LENGTH * inv_z,
                    -FOCAL_LENGTH * p.y * inv_z * inv_z,
                ],
            );
            vec![jacobian.clone(), jacobian]
        });
        Some((residuals, jacobians))
    }
}

struct Scene {
    problem: Problem,
    points: Vec<ParameterBlockId>,
    cameras: Vec<ParameterBlockId>,
}

fn perturb(rng: &mut StdRng, values: &Vector3<f64>, sigma: f64) -> DVector<f64> {
    DVector::from_iterator(
        3,
        values.iter().map(|v| v + sigma * (rng.random::<f64>() * 2.0 - 1.0)),
    )
}

fn build_scene(args: &Args) -> Result<Scene, Box<dyn std::error::Error>> {
    if args.cameras < 2 || args.points == 0 {
        return Err("need at least 2 cameras and 1 point".into());
    }
    let mut rng = StdRng::seed_from_u64(args.seed);
    let loss: Option<Arc<dyn LossFunction>> = match args.loss {
        LossArg::None => None,
        LossArg::Huber => Some(Arc::new(HuberLoss::new(args.loss_scale)?)),
        LossArg::Cauchy => Some(Arc::new(CauchyLoss::new(args.loss_scale)?)),
    };

    let true_points: Vec<Vector3<f64>> = (0..args.points)
        .map(|_| {
            Vector3::new(
                rng.random_range(-3.0..3.0),
                rng.random_range(-3.0..3.0),
                rng.random_range(8.0..12.0),
            )
        })
        .collect();
    let true_cameras: Vec<Vector3<f64>> = (0..args.cameras)
        .map(|i| {
            if i == 0 {
                Vector3::zeros()
            } else {
                Vector3::new(
                    rng.random_range(-1.0..1.0),
                    rng.random_range(-1.0..1.0),
                    rng.random_range(-0.5..0.5),
                )
            }
        })
        .collect();

    let mut problem = Problem::new();
    let points: Vec<_> = true_points
        .iter()
        .map(|point| problem.add_parameter_block(perturb(&mut rng, point, args.noise)))
        .collect();
    let cameras: Vec<_> = true_cameras
        .iter()
        .enumerate()
        .map(|(i, camera)| {
            let sigma = if i == 0 { 0.0 } else { args.noise };
            problem.add_parameter_block(perturb(&mut rng, camera, sigma))
        })
        .collect();
    problem.set_parameter_block_constant(cameras[0])?;

    for (point, true_point) in points.iter().zip(&true_points) {
        for (camera, true_camera) in cameras.iter().zip(&true_cameras) {
            let p = true_point + true_camera;
            let observed = [FOCAL_LENGTH * p.x / p.z, FOCAL_LENGTH * p.y / p.z];
            problem.add_residual_block(
                Arc::new(Reprojection { observed }),
                loss.clone(),
                &[*point, *camera],
            )?;
        }
    }

    Ok(Scene {
        problem,
        points,
        cameras,
    })
}

fn run(args: &Args) -> Result<(), Box<dyn std::error::Error>> {
    let mut scene = build_scene(args)?;
    info!(
        "Scene: {} points, {} cameras, {} observations",
        scene.points.len(),
        scene.cameras.len(),
        scene.problem.num_residual_blocks()
    );

    let mut options = SolverOptions::new()
        .with_linear_solver_type(args.linear_solver.into())
        .with_preconditioner_type(args.preconditioner.into())
        .with_max_num_iterations(args.max_iterations)
        .with_num_threads(args.threads)
        .with_progress_to_stdout(true);
    if args.inner_iterations {
        options = options.with_inner_iterations(None);
    }
    if let Some(path) = &args.solver_log {
        options = options.with_solver_log(path);
    }
    options = match (args.line_search, args.strategy) {
        (true, _) => options.with_minimizer_type(MinimizerType::LineSearch),
        (false, StrategyArg::Lm) => {
            options.with_trust_region_strategy_type(TrustRegionStrategyType::LevenbergMarquardt)
        }
        (false, StrategyArg::Dogleg) => {
            options.with_trust_region_strategy_type(TrustRegionStrategyType::Dogleg)
        }
    };

    let summary = Solver::new(options).solve(&mut scene.problem);
    if args.full_report {
        info!("\n{}", summary.full_report());
    } else {
        info!("{}", summary.brief_report());
    }
    if let Some(e) = &summary.error {
        return Err(e.clone().into());
    }
    Ok(())
}

fn main() {
    init_logger();
    let args = Args::parse();
    if let Err(e) = run(&args) {
        error!("{}", e);
        std::process::exit(1);
    }
}
