//! # Bioweights CLI
//!
//! Command-line interface for the synaptic weight solver.

use anyhow::{bail, Context, Result};
use bioweights_core::{
    CancelToken, ConnectionMask, NeuronModel, SolveOutput, SolveStatus, SolverHooks,
    SolverParameters, WeightProblem,
};
use clap::{Parser, Subcommand};
use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Instant;

#[derive(Parser)]
#[command(name = "bioweights")]
#[command(version = "0.1.0")]
#[command(about = "Synaptic weight solver for populations of model neurons", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Solve a weight problem from a JSON file
    Solve {
        /// Problem file
        problem: PathBuf,
        /// Write the solved weights to this file (JSON)
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Worker threads (0 = all cores)
        #[arg(long, default_value_t = 0)]
        threads: usize,
        /// Report per-neuron objective values
        #[arg(long)]
        objectives: bool,
        /// Solver tolerance
        #[arg(long, default_value_t = 1e-6)]
        tolerance: f64,
        /// Iteration limit per neuron (0 = unbounded)
        #[arg(long, default_value_t = 0)]
        max_iter: usize,
        /// Skip the conditioning rescale (use when currents are not in
        /// biological scales)
        #[arg(long)]
        no_renormalise: bool,
    },

    /// Validate a problem file without solving
    Check {
        /// Problem file
        problem: PathBuf,
    },

    /// Solve a deterministic demonstration problem
    Demo {
        /// Stimulus samples
        #[arg(long, default_value_t = 100)]
        samples: usize,
        /// Presynaptic neurons
        #[arg(long, default_value_t = 40)]
        pre: usize,
        /// Postsynaptic neurons
        #[arg(long, default_value_t = 10)]
        post: usize,
        /// Quadratic regularisation
        #[arg(long, default_value_t = 1e-3)]
        regularisation: f64,
    },
}

// ============================================================================
// PROBLEM FILE FORMAT
// ============================================================================

/// On-disk problem description
///
/// Matrices are row lists; `model` holds either one `[b0,b1,b2,a0,a1,a2]`
/// tuple shared by every postsynaptic neuron or one tuple per neuron.
#[derive(Debug, Serialize, Deserialize)]
struct ProblemFile {
    a_pre: Vec<Vec<f64>>,
    j_post: Vec<Vec<f64>>,
    model: Vec<[f64; 6]>,
    mask_exc: Option<Vec<Vec<bool>>>,
    mask_inh: Option<Vec<Vec<bool>>>,
    regularisation: Option<f64>,
    j_threshold: Option<f64>,
    non_negative: Option<bool>,
}

#[derive(Debug, Serialize)]
struct ResultFile {
    status: String,
    n_solved: usize,
    w_exc: Vec<Vec<f64>>,
    w_inh: Vec<Vec<f64>>,
    objectives: Option<Vec<f64>>,
}

fn to_matrix(rows: &[Vec<f64>], what: &str) -> Result<Array2<f64>> {
    let nrows = rows.len();
    let ncols = rows.first().map(Vec::len).unwrap_or(0);
    if rows.iter().any(|r| r.len() != ncols) {
        bail!("{what}: rows have inconsistent lengths");
    }
    let flat: Vec<f64> = rows.iter().flatten().copied().collect();
    Array2::from_shape_vec((nrows, ncols), flat).with_context(|| format!("{what}: bad shape"))
}

fn to_bool_matrix(rows: &[Vec<bool>], what: &str) -> Result<Array2<bool>> {
    let nrows = rows.len();
    let ncols = rows.first().map(Vec::len).unwrap_or(0);
    if rows.iter().any(|r| r.len() != ncols) {
        bail!("{what}: rows have inconsistent lengths");
    }
    let flat: Vec<bool> = rows.iter().flatten().copied().collect();
    Array2::from_shape_vec((nrows, ncols), flat).with_context(|| format!("{what}: bad shape"))
}

fn matrix_rows(m: &Array2<f64>) -> Vec<Vec<f64>> {
    m.rows().into_iter().map(|r| r.to_vec()).collect()
}

fn build_problem(file: ProblemFile) -> Result<WeightProblem> {
    let a_pre = to_matrix(&file.a_pre, "a_pre")?;
    let j_post = to_matrix(&file.j_post, "j_post")?;
    let n_post = j_post.ncols();

    let models: Vec<NeuronModel> = match file.model.len() {
        1 => vec![NeuronModel::from_coefficients(file.model[0]); n_post],
        n if n == n_post => file
            .model
            .iter()
            .map(|ws| NeuronModel::from_coefficients(*ws))
            .collect(),
        n => bail!("model: expected 1 or {n_post} coefficient tuples, got {n}"),
    };

    let mut problem = WeightProblem::with_models(a_pre, j_post, models)?;

    match (&file.mask_exc, &file.mask_inh) {
        (Some(exc), Some(inh)) => {
            let mask = ConnectionMask::new(
                to_bool_matrix(exc, "mask_exc")?,
                to_bool_matrix(inh, "mask_inh")?,
            )?;
            problem = problem.with_mask(mask)?;
        }
        (None, None) => {}
        _ => bail!("mask_exc and mask_inh must be given together"),
    }

    if let Some(reg) = file.regularisation {
        problem = problem.with_regularisation(reg)?;
    }
    if let Some(th) = file.j_threshold {
        problem = problem.with_threshold(th);
    }
    if let Some(nn) = file.non_negative {
        problem = problem.with_non_negative(nn);
    }
    Ok(problem)
}

// ============================================================================
// SOLVER DRIVING
// ============================================================================

/// Progress bar + warning reporting; cancellation arrives through the
/// shared token set by the Ctrl-C handler
struct BarHooks {
    bar: ProgressBar,
    cancel: CancelToken,
}

impl SolverHooks for BarHooks {
    fn on_progress(&self, n_done: usize, _n_total: usize) -> bool {
        self.bar.set_position(n_done as u64);
        !self.cancel.is_cancelled()
    }

    fn on_warning(&self, message: &str, neuron: usize) {
        let line = format!(
            "{} neuron {}: {}",
            "warning:".yellow().bold(),
            neuron,
            message
        );
        self.bar.suspend(|| eprintln!("{line}"));
    }
}

fn run_solve(problem: &WeightProblem, params: &SolverParameters) -> Result<SolveOutput> {
    let cancel = CancelToken::new();
    let handler_token = cancel.clone();
    ctrlc::set_handler(move || handler_token.cancel())
        .context("installing interrupt handler")?;

    let bar = ProgressBar::new(problem.n_post() as u64);
    bar.set_style(
        ProgressStyle::with_template("{bar:40.cyan/blue} {pos}/{len} neurons {elapsed}")
            .context("progress template")?,
    );
    let hooks = BarHooks {
        bar: bar.clone(),
        cancel: cancel.clone(),
    };

    let started = Instant::now();
    let out = bioweights_qp::solve_with(problem, params, &hooks, &cancel)?;
    bar.finish_and_clear();

    match out.status {
        SolveStatus::Completed => println!(
            "{} {} neurons in {:.2?}",
            "solved:".green().bold(),
            out.n_solved,
            started.elapsed()
        ),
        SolveStatus::Cancelled => println!(
            "{} stopped after {} of {} neurons",
            "cancelled:".yellow().bold(),
            out.n_solved,
            problem.n_post()
        ),
    }
    Ok(out)
}

// ============================================================================
// DEMO PROBLEM
// ============================================================================

/// Deterministic pseudo-random value in [0, 1), keyed by index
///
/// Golden-ratio sequence; keeps the demo reproducible without a random
/// number generator dependency.
fn golden(i: usize, phase: f64) -> f64 {
    ((i as f64) * 0.618_033_988_749_895 + phase).fract()
}

/// Rectified-linear tuning curves over a 1-D stimulus in [-1, 1]
fn demo_curves(samples: usize, pre: usize) -> Array2<f64> {
    let mut a = Array2::zeros((samples, pre));
    for i in 0..pre {
        let gain = 0.5 + 1.5 * golden(i, 0.0);
        let intercept = -0.95 + 1.9 * golden(i, 0.37);
        let sign = if i % 2 == 0 { 1.0 } else { -1.0 };
        for k in 0..samples {
            let x = -1.0 + 2.0 * (k as f64) / ((samples - 1) as f64);
            a[[k, i]] = (gain * (sign * x - intercept)).max(0.0);
        }
    }
    a
}

/// Desired currents: one linear ramp per postsynaptic neuron
fn demo_targets(samples: usize, post: usize) -> Array2<f64> {
    let mut j = Array2::zeros((samples, post));
    for m in 0..post {
        let slope = 0.5 + 2.0 * golden(m, 0.11);
        let offset = -0.5 + golden(m, 0.73);
        for k in 0..samples {
            let x = -1.0 + 2.0 * (k as f64) / ((samples - 1) as f64);
            j[[k, m]] = offset + slope * x;
        }
    }
    j
}

fn rms_current_error(a_pre: &Array2<f64>, j_post: &Array2<f64>, out: &SolveOutput) -> f64 {
    let predicted = a_pre.dot(&out.w_exc) - a_pre.dot(&out.w_inh);
    let diff = &predicted - j_post;
    (diff.iter().map(|d| d * d).sum::<f64>() / (diff.len() as f64)).sqrt()
}

fn run_demo(samples: usize, pre: usize, post: usize, regularisation: f64) -> Result<()> {
    if samples < 2 || pre == 0 || post == 0 {
        bail!("demo needs at least 2 samples and nonzero populations");
    }
    println!(
        "{} {} samples, {} pre, {} post, regularisation {}",
        "demo:".green().bold(),
        samples,
        pre,
        post,
        regularisation
    );

    let a_pre = demo_curves(samples, pre);
    let j_post = demo_targets(samples, post);
    let problem = WeightProblem::new(a_pre.clone(), j_post.clone(), NeuronModel::lif())?
        .with_regularisation(regularisation)?;
    let params = SolverParameters {
        renormalise: false,
        return_objectives: true,
        ..Default::default()
    };

    let out = run_solve(&problem, &params)?;
    let rms = rms_current_error(&a_pre, &j_post, &out);
    println!("  RMS current error: {}", format!("{rms:.6}").cyan());
    if let Some(objectives) = &out.objectives {
        let mean = objectives.iter().filter(|o| o.is_finite()).sum::<f64>()
            / (objectives.len() as f64);
        println!("  mean objective:    {mean:.6}");
    }
    Ok(())
}

// ============================================================================
// ENTRY POINT
// ============================================================================

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Solve {
            problem,
            output,
            threads,
            objectives,
            tolerance,
            max_iter,
            no_renormalise,
        } => {
            let text = std::fs::read_to_string(&problem)
                .with_context(|| format!("reading {}", problem.display()))?;
            let file: ProblemFile =
                serde_json::from_str(&text).context("parsing problem file")?;
            let weight_problem = build_problem(file)?;
            println!(
                "{} {} samples, {} pre, {} post",
                "loaded:".green().bold(),
                weight_problem.n_samples(),
                weight_problem.n_pre(),
                weight_problem.n_post()
            );

            let params = SolverParameters {
                renormalise: !no_renormalise,
                tolerance,
                max_iter,
                n_threads: threads,
                return_objectives: objectives,
            };
            let out = run_solve(&weight_problem, &params)?;

            if let Some(path) = output {
                let result = ResultFile {
                    status: match out.status {
                        SolveStatus::Completed => "completed".into(),
                        SolveStatus::Cancelled => "cancelled".into(),
                    },
                    n_solved: out.n_solved,
                    w_exc: matrix_rows(&out.w_exc),
                    w_inh: matrix_rows(&out.w_inh),
                    objectives: out.objectives.as_ref().map(|o| o.to_vec()),
                };
                let json = serde_json::to_string_pretty(&result)?;
                std::fs::write(&path, json)
                    .with_context(|| format!("writing {}", path.display()))?;
                println!("  weights written to {}", path.display());
            }
        }

        Commands::Check { problem } => {
            let text = std::fs::read_to_string(&problem)
                .with_context(|| format!("reading {}", problem.display()))?;
            let file: ProblemFile =
                serde_json::from_str(&text).context("parsing problem file")?;
            let weight_problem = build_problem(file)?;
            println!(
                "{} {} samples, {} pre, {} post, regularisation {}",
                "valid:".green().bold(),
                weight_problem.n_samples(),
                weight_problem.n_pre(),
                weight_problem.n_post(),
                weight_problem.regularisation()
            );
        }

        Commands::Demo {
            samples,
            pre,
            post,
            regularisation,
        } => {
            run_demo(samples, pre, post, regularisation)?;
        }
    }

    Ok(())
}
