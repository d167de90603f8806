//! # Bioweights QP: Constrained Synaptic Weight Solver
//!
//! Solves for non-negative excitatory and inhibitory synaptic weight
//! matrices connecting a presynaptic population to a postsynaptic one.
//! Given activity samples `A_pre` and desired postsynaptic currents
//! `J_post`, each postsynaptic neuron poses an independent bounded-variable
//! least-squares problem derived from its rational conductance-to-current
//! model; the batch is dispatched over a worker pool with cooperative
//! cancellation and per-neuron progress/warning reporting.
//!
//! Pipeline per neuron:
//! 1. Mask selection - presynaptic units without a connection bit are
//!    excluded from the variables entirely
//! 2. Linearization of the rational transfer around the target currents
//! 3. Optional renormalisation for numerical conditioning
//! 4. Accelerated projected-gradient iteration on the non-negative orthant
//! 5. Scatter of the solved weights into the output columns
//!
//! Per-neuron numerical trouble (degenerate or non-monotone models,
//! iteration limits) is reported through the warning hook and never aborts
//! sibling neurons.

use bioweights_core::{
    CancelToken, NullHooks, Result, SolveOutput, SolveStatus, SolverHooks, SolverParameters,
    WeightProblem, WeightsError,
};
use nalgebra::{DMatrix, DVector};
use ndarray::{Array1, Array2};
use rayon::prelude::*;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Rounds of power iteration used for the Lipschitz estimate
const POWER_ITERATIONS: usize = 30;

/// Safety margin on the estimated Lipschitz constant; power iteration
/// approaches the spectral radius from below
const LIPSCHITZ_MARGIN: f64 = 1.1;

// ============================================================================
// PER-NEURON PROBLEM BUILDER
// ============================================================================

/// Bounded-variable least-squares problem for one postsynaptic neuron
///
/// Derived from the batch problem; read-only for the duration of one solve
/// and independent of every other neuron's problem. Variables are ordered
/// `[masked excitatory weights, masked inhibitory weights]`. Samples whose
/// target current lies below the relaxation threshold live in `a_relaxed`
/// and contribute a one-sided penalty; everything else is an ordinary
/// residual row in `a_valid`.
#[derive(Debug, Clone)]
pub struct NeuronProblem {
    neuron: usize,
    exc_idx: Vec<usize>,
    inh_idx: Vec<usize>,
    a_valid: DMatrix<f64>,
    b_valid: DVector<f64>,
    a_relaxed: DMatrix<f64>,
    /// Relaxation threshold in the linearized target space
    threshold: f64,
    /// Effective quadratic regularisation (sample count and conditioning
    /// scale folded in)
    lambda: f64,
    /// Output scale inverting the renormalisation
    w_scale: f64,
    non_negative: bool,
}

/// Outcome of building one neuron's problem
#[derive(Debug, Clone)]
pub enum NeuronBuild {
    /// No presynaptic unit may connect to this neuron. Both weight columns
    /// are fixed zero and the objective is the unregularised sum of squares
    /// of the linearized target.
    Disconnected { objective: f64 },
    Ready(NeuronProblem),
}

impl NeuronProblem {
    /// Build the problem for postsynaptic neuron `neuron`
    ///
    /// Fails with [`WeightsError::ModelDegenerate`] or
    /// [`WeightsError::ModelNotMonotonic`] when the neuron's model cannot
    /// yield a convex problem; the dispatcher turns these into per-neuron
    /// warnings. Targets beyond the model's saturation current are warned
    /// about through `hooks` but still solved in the least-squares sense.
    pub fn build(
        problem: &WeightProblem,
        params: &SolverParameters,
        neuron: usize,
        hooks: &dyn SolverHooks,
    ) -> Result<NeuronBuild> {
        let a_pre = problem.a_pre();
        let j_post = problem.j_post();
        let j_col = j_post.column(neuron);
        let n_samples = problem.n_samples();

        let mask = problem.mask();
        let exc_idx: Vec<usize> = (0..problem.n_pre())
            .filter(|&i| mask.exc[[i, neuron]])
            .collect();
        let inh_idx: Vec<usize> = (0..problem.n_pre())
            .filter(|&i| mask.inh[[i, neuron]])
            .collect();

        let raw = *problem.model(neuron);
        raw.validate().map_err(|e| prefix_neuron(e, neuron))?;
        raw.check_monotonic().map_err(|e| prefix_neuron(e, neuron))?;

        if exc_idx.is_empty() && inh_idx.is_empty() {
            let objective = j_col
                .iter()
                .map(|&j| {
                    let t = raw.linearize(j).target;
                    t * t
                })
                .sum();
            return Ok(NeuronBuild::Disconnected { objective });
        }

        // Saturating models cannot produce arbitrarily large currents; warn
        // when the targets lie outside the reachable band
        if let (Some(hi), Some(lo)) = (raw.saturation_current(), raw.inhibition_floor()) {
            let j_max = j_col.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
            if j_max > hi {
                hooks.on_warning(
                    &format!(
                        "target currents cannot be reached: {j_max:.6} outside [{lo:.6}, {hi:.6}]"
                    ),
                    neuron,
                );
            }
        }

        let (model, w_scale, lambda_scale) = if params.renormalise {
            raw.renormalised()
        } else {
            (raw, 1.0, 1.0)
        };

        let n_exc = exc_idx.len();
        let n_vars = n_exc + inh_idx.len();

        let valid: Vec<bool> = match problem.j_threshold() {
            Some(th) => j_col.iter().map(|&j| j >= th).collect(),
            None => vec![true; n_samples],
        };
        let n_valid = valid.iter().filter(|&&v| v).count();
        let n_relaxed = n_samples - n_valid;

        let threshold = match problem.j_threshold() {
            Some(th) => model.a0 * th - model.b0,
            None => 0.0,
        };

        let mut a_valid = DMatrix::zeros(n_valid, n_vars);
        let mut b_valid = DVector::zeros(n_valid);
        let mut a_relaxed = DMatrix::zeros(n_relaxed, n_vars);
        let (mut iv, mut ir) = (0, 0);
        for k in 0..n_samples {
            let lin = model.linearize(j_col[k]);
            let (row, target) = if valid[k] {
                (iv, Some(lin.target))
            } else {
                (ir, None)
            };
            let dst = if valid[k] { &mut a_valid } else { &mut a_relaxed };
            for (c, &i) in exc_idx.iter().enumerate() {
                dst[(row, c)] = lin.exc * a_pre[[k, i]];
            }
            for (c, &i) in inh_idx.iter().enumerate() {
                dst[(row, n_exc + c)] = lin.inh * a_pre[[k, i]];
            }
            if let Some(t) = target {
                b_valid[iv] = t;
                iv += 1;
            } else {
                ir += 1;
            }
        }

        let lambda = n_samples as f64 * problem.regularisation() * lambda_scale;

        Ok(NeuronBuild::Ready(NeuronProblem {
            neuron,
            exc_idx,
            inh_idx,
            a_valid,
            b_valid,
            a_relaxed,
            threshold,
            lambda,
            w_scale,
            non_negative: problem.non_negative(),
        }))
    }

    pub fn neuron(&self) -> usize {
        self.neuron
    }

    pub fn n_vars(&self) -> usize {
        self.exc_idx.len() + self.inh_idx.len()
    }

    /// Distribute a solved variable vector into full-length weight columns,
    /// inverting the renormalisation scale
    pub fn scatter(&self, weights: &DVector<f64>, w_exc: &mut Array1<f64>, w_inh: &mut Array1<f64>) {
        let n_exc = self.exc_idx.len();
        for (c, &i) in self.exc_idx.iter().enumerate() {
            let v = weights[c] * self.w_scale;
            w_exc[i] = if self.non_negative { v.max(0.0) } else { v };
        }
        for (c, &i) in self.inh_idx.iter().enumerate() {
            let v = weights[n_exc + c] * self.w_scale;
            w_inh[i] = if self.non_negative { v.max(0.0) } else { v };
        }
    }

    /// Apply the penalised-objective Hessian upper bound
    /// `A_v^T A_v + A_r^T A_r + lambda I` to a vector
    fn hessian_apply(&self, v: &DVector<f64>) -> DVector<f64> {
        let mut out = self.a_valid.tr_mul(&(&self.a_valid * v));
        out += self.a_relaxed.tr_mul(&(&self.a_relaxed * v));
        out.axpy(self.lambda, v, 1.0);
        out
    }

    /// Power-iteration estimate of the gradient Lipschitz constant
    fn lipschitz(&self) -> f64 {
        let n = self.n_vars();
        let mut v = DVector::from_element(n, 1.0 / (n as f64).sqrt());
        let mut rayleigh = 0.0;
        for _ in 0..POWER_ITERATIONS {
            let hv = self.hessian_apply(&v);
            let norm = hv.norm();
            if norm < 1e-300 {
                return 0.0;
            }
            rayleigh = v.dot(&hv);
            v = hv / norm;
        }
        2.0 * rayleigh * LIPSCHITZ_MARGIN
    }

    /// Gradient and value of the smooth penalised objective
    ///
    /// ```text
    ///   f(w) = |A_v w - b|^2 + |max(0, A_r w - h)|^2 + lambda |w|^2
    /// ```
    fn grad_and_objective(&self, w: &DVector<f64>) -> (DVector<f64>, f64) {
        let th = self.threshold;
        let r = &self.a_valid * w - &self.b_valid;
        let mut s = &self.a_relaxed * w;
        s.apply(|x| *x = (*x - th).max(0.0));
        let mut g = self.a_valid.tr_mul(&r);
        g += self.a_relaxed.tr_mul(&s);
        g.axpy(self.lambda, w, 1.0);
        g *= 2.0;
        let f = r.norm_squared() + s.norm_squared() + self.lambda * w.norm_squared();
        (g, f)
    }

    fn project(&self, w: &mut DVector<f64>) {
        if self.non_negative {
            w.apply(|x| *x = x.max(0.0));
        }
    }

    /// Infinity norm of the projected gradient; components pinned at the
    /// boundary only count when the gradient pushes outward
    fn projected_gradient_norm(&self, w: &DVector<f64>, g: &DVector<f64>) -> f64 {
        let mut m = 0.0f64;
        for i in 0..w.len() {
            let pg = if self.non_negative && w[i] <= 0.0 {
                g[i].min(0.0)
            } else {
                g[i]
            };
            m = m.max(pg.abs());
        }
        m
    }
}

fn prefix_neuron(err: WeightsError, neuron: usize) -> WeightsError {
    match err {
        WeightsError::ModelDegenerate(m) => {
            WeightsError::ModelDegenerate(format!("neuron {neuron}: {m}"))
        }
        WeightsError::ModelNotMonotonic(m) => {
            WeightsError::ModelNotMonotonic(format!("neuron {neuron}: {m}"))
        }
        other => other,
    }
}

// ============================================================================
// CONSTRAINED SOLVER
// ============================================================================

/// Result of one neuron's solve
#[derive(Debug, Clone)]
pub struct NeuronSolution {
    /// Solved variables in builder order (before scattering)
    pub weights: DVector<f64>,
    /// Residual sum of squares plus regularisation term
    pub objective: f64,
    pub iterations: usize,
    pub converged: bool,
    /// Projected-gradient infinity norm at the returned iterate
    pub grad_norm: f64,
}

/// Solve one neuron's bounded-variable least-squares problem
///
/// Accelerated projected-gradient iteration (Nesterov momentum with
/// adaptive restart, fixed step from a power-iteration Lipschitz
/// estimate). Converges when the projected-gradient infinity norm falls
/// below `tolerance * (1 + |A^T b|_inf)`; the relative factor keeps
/// renormalised problems solvable with the same tolerance. A nonzero
/// `max_iter` bounds the iteration count; the best iterate seen is
/// returned either way.
pub fn solve_neuron(p: &NeuronProblem, tolerance: f64, max_iter: usize) -> NeuronSolution {
    let c = p.a_valid.tr_mul(&p.b_valid);
    let tol_eff = tolerance * (1.0 + c.amax());

    let mut w = DVector::zeros(p.n_vars());
    let (g0, f0) = p.grad_and_objective(&w);
    let pg0 = p.projected_gradient_norm(&w, &g0);
    let l = p.lipschitz();
    if l <= 0.0 || pg0 <= tol_eff {
        return NeuronSolution {
            weights: w,
            objective: f0,
            iterations: 0,
            converged: true,
            grad_norm: pg0,
        };
    }

    let mut best_w = w.clone();
    let mut best_f = f0;
    let mut y = w.clone();
    let mut t = 1.0f64;
    let limit = if max_iter == 0 { usize::MAX } else { max_iter };
    let mut iterations = 0;
    let mut converged = false;
    let mut grad_norm = pg0;

    while iterations < limit {
        iterations += 1;

        let (g_y, _) = p.grad_and_objective(&y);
        let mut w_next = &y - &g_y / l;
        p.project(&mut w_next);

        let t_next = 0.5 * (1.0 + (1.0 + 4.0 * t * t).sqrt());
        let momentum = (t - 1.0) / t_next;
        let mut y_next = &w_next + (&w_next - &w) * momentum;

        // Restart the momentum when it points against the descent direction
        if (&y - &w_next).dot(&(&w_next - &w)) > 0.0 {
            y_next = w_next.clone();
            t = 1.0;
        } else {
            t = t_next;
        }

        let (g_w, f_w) = p.grad_and_objective(&w_next);
        if f_w < best_f {
            best_f = f_w;
            best_w.copy_from(&w_next);
        }
        grad_norm = p.projected_gradient_norm(&w_next, &g_w);
        w = w_next;
        y = y_next;

        if grad_norm <= tol_eff {
            converged = true;
            break;
        }
    }

    NeuronSolution {
        weights: best_w,
        objective: best_f,
        iterations,
        converged,
        grad_norm,
    }
}

// ============================================================================
// WORK DISPATCHER
// ============================================================================

struct ColumnResult {
    neuron: usize,
    w_exc: Array1<f64>,
    w_inh: Array1<f64>,
    objective: f64,
}

fn solve_column(
    problem: &WeightProblem,
    params: &SolverParameters,
    neuron: usize,
    hooks: &dyn SolverHooks,
) -> ColumnResult {
    let n_pre = problem.n_pre();
    let mut col = ColumnResult {
        neuron,
        w_exc: Array1::zeros(n_pre),
        w_inh: Array1::zeros(n_pre),
        objective: f64::NAN,
    };
    match NeuronProblem::build(problem, params, neuron, hooks) {
        Ok(NeuronBuild::Disconnected { objective }) => {
            col.objective = objective;
        }
        Ok(NeuronBuild::Ready(p)) => {
            let sol = solve_neuron(&p, params.tolerance, params.max_iter);
            if !sol.converged {
                hooks.on_warning(
                    &format!(
                        "solver stopped after {} iterations with projected gradient {:.3e} \
                         above tolerance (residual {:.6e}); weights are best-effort",
                        sol.iterations, sol.grad_norm, sol.objective
                    ),
                    neuron,
                );
            }
            p.scatter(&sol.weights, &mut col.w_exc, &mut col.w_inh);
            col.objective = sol.objective;
        }
        // Model rejection is isolated to this neuron: warn, leave the
        // column zero, keep the batch running
        Err(err) => {
            hooks.on_warning(&err.to_string(), neuron);
        }
    }
    col
}

fn clamp_threads(requested: usize) -> usize {
    let available = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    if requested == 0 || requested > available {
        available
    } else {
        requested
    }
}

/// Solve a batch weight problem with quiet hooks and no external cancellation
pub fn solve(problem: &WeightProblem, params: &SolverParameters) -> Result<SolveOutput> {
    solve_with(problem, params, &NullHooks, &CancelToken::new())
}

/// Solve a batch weight problem
///
/// The `n_post` per-neuron problems are independent and run on a worker
/// pool of `params.n_threads` threads (clamped to the available cores;
/// single-neuron batches run inline). After each neuron completes, the
/// progress hook is invoked with the completed count; returning `false` -
/// or cancelling `cancel` externally - stops scheduling new work, lets
/// in-flight solves finish and yields [`SolveStatus::Cancelled`]. Columns
/// of neurons that never ran keep their initial all-zero value.
pub fn solve_with(
    problem: &WeightProblem,
    params: &SolverParameters,
    hooks: &dyn SolverHooks,
    cancel: &CancelToken,
) -> Result<SolveOutput> {
    params.validate()?;
    let n_post = problem.n_post();
    let n_pre = problem.n_pre();
    let n_threads = clamp_threads(params.n_threads);
    let n_done = AtomicUsize::new(0);

    let kernel = |neuron: usize| -> Option<ColumnResult> {
        if cancel.is_cancelled() {
            return None;
        }
        let col = solve_column(problem, params, neuron, hooks);
        let done = n_done.fetch_add(1, Ordering::SeqCst) + 1;
        if !hooks.on_progress(done, n_post) {
            cancel.cancel();
        }
        Some(col)
    };

    let results: Vec<Option<ColumnResult>> = if n_post == 1 || n_threads == 1 {
        (0..n_post).map(kernel).collect()
    } else {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(n_threads)
            .build()
            .map_err(|e| WeightsError::InvalidParameter(format!("worker pool: {e}")))?;
        pool.install(|| (0..n_post).into_par_iter().map(kernel).collect())
    };

    // Assemble the output matrices; workers never share columns, so this
    // is a plain sequential scatter
    let mut w_exc = Array2::zeros((n_pre, n_post));
    let mut w_inh = Array2::zeros((n_pre, n_post));
    let mut objectives = Array1::zeros(n_post);
    let mut n_solved = 0;
    for col in results.into_iter().flatten() {
        w_exc.column_mut(col.neuron).assign(&col.w_exc);
        w_inh.column_mut(col.neuron).assign(&col.w_inh);
        objectives[col.neuron] = col.objective;
        n_solved += 1;
    }

    let status = if cancel.is_cancelled() {
        SolveStatus::Cancelled
    } else {
        SolveStatus::Completed
    };
    Ok(SolveOutput {
        w_exc,
        w_inh,
        objectives: params.return_objectives.then_some(objectives),
        status,
        n_solved,
    })
}

// ============================================================================
// TESTS
// ============================================================================
