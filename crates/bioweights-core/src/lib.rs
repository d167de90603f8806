//! # Bioweights Core
//!
//! Shared types for the bioweights synaptic weight solver.
//!
//! Given presynaptic activity samples and desired postsynaptic currents,
//! the solver computes non-negative excitatory and inhibitory synaptic
//! weights per postsynaptic neuron. This crate defines everything the
//! solver and its embeddings share:
//!
//! 1. The rational neuron model transform mapping conductances to currents
//! 2. The validated problem descriptor ([`WeightProblem`])
//! 3. Solver parameters, result types and status codes
//! 4. Reporting hooks and the cooperative cancellation token

use ndarray::{Array1, Array2, ArrayView2};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;

/// Common errors
#[derive(Debug, Error)]
pub enum WeightsError {
    #[error("Shape mismatch: {0}")]
    ShapeMismatch(String),

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Degenerate neuron model: {0}")]
    ModelDegenerate(String),

    #[error("Non-monotonic neuron model: {0}")]
    ModelNotMonotonic(String),
}

pub type Result<T> = std::result::Result<T, WeightsError>;

/// Conductance (weighted sum of presynaptic activities)
pub type Conductance = f64;

/// Postsynaptic current
pub type Current = f64;

/// Presynaptic activity samples, one row per sample
pub type ActivityMatrix = Array2<f64>;

/// Denominator magnitudes below this are treated as a vanished denominator
pub const DEGENERACY_EPS: f64 = 1e-12;

/// Slack allowed on the sign of linearized coefficients before a model
/// counts as non-monotonic
pub const MONOTONICITY_EPS: f64 = 1e-9;

// ============================================================================
// NEURON MODEL
// ============================================================================

/// Rational neuron model transform
///
/// Maps excitatory and inhibitory conductances to an equivalent input
/// current via the fixed-form rational function
///
/// ```text
///     J = (b0 + b1*gExc + b2*gInh) / (a0 + a1*gExc + a2*gInh)
/// ```
///
/// The coefficient order `[b0, b1, b2, a0, a1, a2]` matches the order used
/// by connection builders. For a standard current-based LIF neuron the
/// transform reduces to `J = gExc - gInh`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NeuronModel {
    pub b0: f64,
    pub b1: f64,
    pub b2: f64,
    pub a0: f64,
    pub a1: f64,
    pub a2: f64,
}

/// Coefficients of the linearized weight-to-current constraint for one
/// sample: `exc * gExc + inh * gInh = target`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LinearSample {
    pub exc: f64,
    pub inh: f64,
    pub target: f64,
}

impl NeuronModel {
    pub fn new(b0: f64, b1: f64, b2: f64, a0: f64, a1: f64, a2: f64) -> Self {
        Self { b0, b1, b2, a0, a1, a2 }
    }

    /// Standard current-based LIF neuron: `J = gExc - gInh`
    pub fn lif() -> Self {
        Self::new(0.0, 1.0, -1.0, 1.0, 0.0, 0.0)
    }

    /// Build from a `[b0, b1, b2, a0, a1, a2]` coefficient vector
    pub fn from_coefficients(ws: [f64; 6]) -> Self {
        Self::new(ws[0], ws[1], ws[2], ws[3], ws[4], ws[5])
    }

    pub fn coefficients(&self) -> [f64; 6] {
        [self.b0, self.b1, self.b2, self.a0, self.a1, self.a2]
    }

    /// Evaluate the transform for a single conductance pair
    pub fn current(&self, g_exc: Conductance, g_inh: Conductance) -> Result<Current> {
        let den = self.a0 + self.a1 * g_exc + self.a2 * g_inh;
        if den.abs() < DEGENERACY_EPS {
            return Err(WeightsError::ModelDegenerate(format!(
                "denominator vanishes at gExc = {g_exc}, gInh = {g_inh}"
            )));
        }
        Ok((self.b0 + self.b1 * g_exc + self.b2 * g_inh) / den)
    }

    /// Structural degeneracy check
    ///
    /// Conductances are non-negative, so a denominator that vanishes at zero
    /// conductance vanishes for every sample with silent inputs. Such a
    /// model can never be solved for and is rejected up front.
    pub fn validate(&self) -> Result<()> {
        if self.a0.abs() < DEGENERACY_EPS {
            return Err(WeightsError::ModelDegenerate(
                "denominator vanishes at zero conductance (a0 = 0)".into(),
            ));
        }
        Ok(())
    }

    /// Supremum of reachable currents for saturating conductance models
    ///
    /// As `gExc` grows the transform approaches `b1 / a1`; returns `None`
    /// for non-saturating models such as the current-based LIF (`a1 = 0`).
    pub fn saturation_current(&self) -> Option<Current> {
        (self.a1 > 0.0).then(|| self.b1 / self.a1)
    }

    /// Infimum of reachable currents (`b2 / a2`), see [`Self::saturation_current`]
    pub fn inhibition_floor(&self) -> Option<Current> {
        (self.a2 > 0.0).then(|| self.b2 / self.a2)
    }

    /// Linearize the transform around a target current
    ///
    /// Cross-multiplying `J = N/D` and collecting conductance terms turns
    /// the fit `J(gExc, gInh) = J_target` into the linear constraint
    ///
    /// ```text
    ///     (b1 - a1*J)*gExc + (b2 - a2*J)*gInh = a0*J - b0
    /// ```
    ///
    /// which is what the per-neuron least-squares problem is built from.
    pub fn linearize(&self, j_target: Current) -> LinearSample {
        LinearSample {
            exc: self.b1 - self.a1 * j_target,
            inh: self.b2 - self.a2 * j_target,
            target: self.a0 * j_target - self.b0,
        }
    }

    /// Monotonicity check
    ///
    /// The per-neuron fit is convex only when the transfer is monotone:
    /// excitation may never lower the current and inhibition may never
    /// raise it, anywhere on the non-negative conductance quadrant. With
    /// affine numerator and denominator the partial derivative signs are
    /// governed by three bilinear forms, each invariant under the
    /// renormalisation rescaling.
    pub fn check_monotonic(&self) -> Result<()> {
        let d_exc = self.b1 * self.a0 - self.a1 * self.b0;
        let d_inh = self.b2 * self.a0 - self.a2 * self.b0;
        let cross = self.b1 * self.a2 - self.a1 * self.b2;
        if d_exc < -MONOTONICITY_EPS || d_inh > MONOTONICITY_EPS || cross < -MONOTONICITY_EPS {
            return Err(WeightsError::ModelNotMonotonic(format!(
                "conductance-to-current transfer changes direction \
                 (dJ/dgExc ~ {d_exc:.3e}, dJ/dgInh ~ {d_inh:.3e}, cross term {cross:.3e})"
            )));
        }
        Ok(())
    }

    /// Rescale the model for numerical conditioning
    ///
    /// Returns `(scaled model, w_scale, lambda_scale)`. Conductance
    /// coefficients are expressed in nanosiemens (`w_scale = 1e-9`) and the
    /// tuple is normalised so `b1 = 1`; solved weights must be multiplied
    /// by `w_scale` to return to caller units, and the regularisation
    /// factor by `lambda_scale`. Models with `b1 = 0` are left untouched.
    pub fn renormalised(&self) -> (Self, f64, f64) {
        if self.b1.abs() < DEGENERACY_EPS {
            return (*self, 1.0, 1.0);
        }
        let lambda_scale = 1.0 / (self.b1 * self.b1);
        let w_scale = 1e-9;
        let b1 = self.b1 * w_scale;
        let b2 = self.b2 * w_scale;
        let a1 = self.a1 * w_scale;
        let a2 = self.a2 * w_scale;
        let s = b1;
        let scaled = Self::new(self.b0 / s, b1 / s, b2 / s, self.a0 / s, a1 / s, a2 / s);
        (scaled, w_scale, lambda_scale)
    }
}

// ============================================================================
// CONNECTION MASK
// ============================================================================

/// Boolean connectivity restriction, `(n_pre, n_post)` per channel
///
/// An unset entry pins the corresponding synaptic weight to exactly zero
/// and removes it from the optimization variables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionMask {
    pub exc: Array2<bool>,
    pub inh: Array2<bool>,
}

impl ConnectionMask {
    /// Unrestricted connectivity
    pub fn all_to_all(n_pre: usize, n_post: usize) -> Self {
        Self {
            exc: Array2::from_elem((n_pre, n_post), true),
            inh: Array2::from_elem((n_pre, n_post), true),
        }
    }

    pub fn new(exc: Array2<bool>, inh: Array2<bool>) -> Result<Self> {
        if exc.dim() != inh.dim() {
            return Err(WeightsError::ShapeMismatch(format!(
                "excitatory mask is {:?} but inhibitory mask is {:?}",
                exc.dim(),
                inh.dim()
            )));
        }
        Ok(Self { exc, inh })
    }

    pub fn shape(&self) -> (usize, usize) {
        self.exc.dim()
    }
}

// ============================================================================
// PROBLEM DESCRIPTOR
// ============================================================================

/// Default quadratic regularisation on weight magnitude
pub const DEFAULT_REGULARISATION: f64 = 1e-1;

/// Default solver tolerance
pub const DEFAULT_TOLERANCE: f64 = 1e-6;

/// A validated batch weight-solving problem
///
/// Immutable once built; the factory enforces all shape invariants before
/// any solve begins, so the solver itself never re-checks dimensions.
#[derive(Debug, Clone, Serialize)]
pub struct WeightProblem {
    a_pre: Array2<f64>,
    j_post: Array2<f64>,
    models: Vec<NeuronModel>,
    mask: ConnectionMask,
    regularisation: f64,
    j_threshold: Option<f64>,
    non_negative: bool,
}

impl WeightProblem {
    /// Build a problem with one model shared by all postsynaptic neurons
    ///
    /// `a_pre` is `(n_samples, n_pre)`, `j_post` is `(n_samples, n_post)`;
    /// connectivity defaults to all-to-all, regularisation to
    /// [`DEFAULT_REGULARISATION`], and sub-threshold relaxation to off.
    pub fn new(a_pre: Array2<f64>, j_post: Array2<f64>, model: NeuronModel) -> Result<Self> {
        let n_post = j_post.ncols();
        Self::with_models(a_pre, j_post, vec![model; n_post])
    }

    /// Build a problem with one model per postsynaptic neuron
    pub fn with_models(
        a_pre: Array2<f64>,
        j_post: Array2<f64>,
        models: Vec<NeuronModel>,
    ) -> Result<Self> {
        let (n_samples, n_pre) = a_pre.dim();
        let n_post = j_post.ncols();
        if n_samples == 0 || n_pre == 0 || n_post == 0 {
            return Err(WeightsError::ShapeMismatch(format!(
                "empty problem: {n_samples} samples, {n_pre} pre, {n_post} post"
            )));
        }
        if j_post.nrows() != n_samples {
            return Err(WeightsError::ShapeMismatch(format!(
                "a_pre has {} samples but j_post has {}",
                n_samples,
                j_post.nrows()
            )));
        }
        if models.len() != n_post {
            return Err(WeightsError::ShapeMismatch(format!(
                "{} neuron models for {} postsynaptic neurons",
                models.len(),
                n_post
            )));
        }
        Ok(Self {
            mask: ConnectionMask::all_to_all(n_pre, n_post),
            a_pre,
            j_post,
            models,
            regularisation: DEFAULT_REGULARISATION,
            j_threshold: None,
            non_negative: true,
        })
    }

    /// Restrict connectivity; the mask must be `(n_pre, n_post)` per channel
    pub fn with_mask(mut self, mask: ConnectionMask) -> Result<Self> {
        let expected = (self.n_pre(), self.n_post());
        if mask.shape() != expected {
            return Err(WeightsError::ShapeMismatch(format!(
                "connection mask is {:?}, expected {:?}",
                mask.shape(),
                expected
            )));
        }
        self.mask = mask;
        Ok(self)
    }

    pub fn with_regularisation(mut self, regularisation: f64) -> Result<Self> {
        if !(regularisation >= 0.0) || !regularisation.is_finite() {
            return Err(WeightsError::InvalidParameter(format!(
                "regularisation must be finite and >= 0, got {regularisation}"
            )));
        }
        self.regularisation = regularisation;
        Ok(self)
    }

    /// Enable sub-threshold relaxation: samples whose target current lies
    /// below `threshold` only penalise predictions that exceed it.
    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.j_threshold = Some(threshold);
        self
    }

    pub fn with_non_negative(mut self, non_negative: bool) -> Self {
        self.non_negative = non_negative;
        self
    }

    pub fn n_pre(&self) -> usize {
        self.a_pre.ncols()
    }

    pub fn n_post(&self) -> usize {
        self.j_post.ncols()
    }

    pub fn n_samples(&self) -> usize {
        self.a_pre.nrows()
    }

    pub fn a_pre(&self) -> ArrayView2<'_, f64> {
        self.a_pre.view()
    }

    pub fn j_post(&self) -> ArrayView2<'_, f64> {
        self.j_post.view()
    }

    pub fn model(&self, neuron: usize) -> &NeuronModel {
        &self.models[neuron]
    }

    pub fn mask(&self) -> &ConnectionMask {
        &self.mask
    }

    pub fn regularisation(&self) -> f64 {
        self.regularisation
    }

    pub fn j_threshold(&self) -> Option<f64> {
        self.j_threshold
    }

    pub fn non_negative(&self) -> bool {
        self.non_negative
    }
}

// ============================================================================
// SOLVER PARAMETERS
// ============================================================================

/// Tunables for one batch solve
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SolverParameters {
    /// Rescale model coefficients before solving and invert the scale on
    /// the output weights. Only useful when target currents are in
    /// biological scales (pA to nA).
    pub renormalise: bool,
    /// Convergence tolerance on the projected gradient
    pub tolerance: f64,
    /// Iteration limit per neuron; 0 means unbounded
    pub max_iter: usize,
    /// Worker threads; 0 means all available cores
    pub n_threads: usize,
    /// Report the achieved objective value per neuron
    pub return_objectives: bool,
}

impl Default for SolverParameters {
    fn default() -> Self {
        Self {
            renormalise: true,
            tolerance: DEFAULT_TOLERANCE,
            max_iter: 0,
            n_threads: 0,
            return_objectives: false,
        }
    }
}

impl SolverParameters {
    pub fn validate(&self) -> Result<()> {
        if !(self.tolerance > 0.0) || !self.tolerance.is_finite() {
            return Err(WeightsError::InvalidParameter(format!(
                "tolerance must be finite and > 0, got {}",
                self.tolerance
            )));
        }
        Ok(())
    }
}

// ============================================================================
// RESULTS
// ============================================================================

/// Terminal state of a batch solve
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SolveStatus {
    /// Every neuron was processed
    Completed,
    /// Cancellation was observed; already-solved columns are valid, the
    /// remaining columns keep their initial all-zero value
    Cancelled,
}

/// Solved weight matrices and diagnostics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SolveOutput {
    /// Excitatory weights, `(n_pre, n_post)`, entrywise >= 0
    pub w_exc: Array2<f64>,
    /// Inhibitory weights, `(n_pre, n_post)`, entrywise >= 0
    pub w_inh: Array2<f64>,
    /// Residual sum of squares plus regularisation term per neuron; NaN for
    /// neurons whose model was rejected
    pub objectives: Option<Array1<f64>>,
    pub status: SolveStatus,
    /// Number of neurons actually solved (equals `n_post` unless cancelled)
    pub n_solved: usize,
}

// ============================================================================
// REPORTING HOOKS & CANCELLATION
// ============================================================================

/// Progress and warning reporting for a batch solve
///
/// Invoked from worker threads, possibly concurrently; implementations must
/// synchronise any shared caller state internally.
pub trait SolverHooks: Sync {
    /// Called after each neuron completes; return `false` to request
    /// cooperative cancellation.
    fn on_progress(&self, n_done: usize, n_total: usize) -> bool {
        let _ = (n_done, n_total);
        true
    }

    /// Called for per-neuron warnings (degenerate models, convergence
    /// failures, unreachable targets) with the offending neuron index.
    fn on_warning(&self, message: &str, neuron: usize) {
        let _ = (message, neuron);
    }
}

/// Hooks that swallow everything
#[derive(Debug, Default)]
pub struct NullHooks;

impl SolverHooks for NullHooks {}

/// Hooks that report to stderr
///
/// Holds a lock around formatting and flushing so concurrent workers cannot
/// interleave output.
#[derive(Debug, Default)]
pub struct ConsoleHooks {
    lock: Mutex<()>,
}

impl ConsoleHooks {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SolverHooks for ConsoleHooks {
    fn on_progress(&self, n_done: usize, n_total: usize) -> bool {
        let _guard = self.lock.lock().unwrap_or_else(|p| p.into_inner());
        let mut err = std::io::stderr();
        let _ = write!(err, "\rSolved {}/{} neuron weights", n_done, n_total);
        let _ = err.flush();
        true
    }

    fn on_warning(&self, message: &str, neuron: usize) {
        let _guard = self.lock.lock().unwrap_or_else(|p| p.into_inner());
        let mut err = std::io::stderr();
        let _ = writeln!(err, "\nWARN (neuron {}): {}", neuron, message);
        let _ = err.flush();
    }
}

/// Cooperative cancellation flag
///
/// Cloned handles share one flag. The solver checks it between neuron
/// solves, never inside a single solve's iteration loop; the embedding
/// layer is responsible for setting it in response to external interrupts.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lif_transform() {
        let lif = NeuronModel::lif();
        assert_eq!(lif.current(3.0, 1.0).unwrap(), 2.0);
        assert_eq!(lif.current(0.0, 0.5).unwrap(), -0.5);
        assert!(lif.saturation_current().is_none());
    }

    #[test]
    fn test_conductance_transform() {
        // J = (1 + 2*gE - gI) / (1 + 0.5*gE + 0.25*gI)
        let model = NeuronModel::new(1.0, 2.0, -1.0, 1.0, 0.5, 0.25);
        let j = model.current(2.0, 1.0).unwrap();
        assert!((j - 4.0 / 2.25).abs() < 1e-12);
        assert_eq!(model.saturation_current(), Some(4.0));
    }

    #[test]
    fn test_degenerate_denominator() {
        let model = NeuronModel::new(0.0, 1.0, -1.0, 0.0, 0.0, 0.0);
        assert!(model.validate().is_err());
        assert!(model.current(1.0, 0.0).is_err());
        assert!(NeuronModel::lif().validate().is_ok());
    }

    #[test]
    fn test_linearize_lif() {
        let lin = NeuronModel::lif().linearize(1.5);
        assert_eq!(lin.exc, 1.0);
        assert_eq!(lin.inh, -1.0);
        assert_eq!(lin.target, 1.5);
    }

    #[test]
    fn test_monotonicity() {
        assert!(NeuronModel::lif().check_monotonic().is_ok());
        // Conductance-based model with saturating excitation
        assert!(NeuronModel::new(0.0, 2.0, -1.0, 1.0, 0.5, 0.25)
            .check_monotonic()
            .is_ok());
        // Excitation lowering the current is rejected
        let inverted = NeuronModel::new(0.0, -1.0, -1.0, 1.0, 0.0, 0.0);
        assert!(matches!(
            inverted.check_monotonic(),
            Err(WeightsError::ModelNotMonotonic(_))
        ));
        // Inhibition raising the current is rejected
        let inverted = NeuronModel::new(0.0, 1.0, 1.0, 1.0, 0.0, 0.0);
        assert!(inverted.check_monotonic().is_err());
    }

    #[test]
    fn test_renormalised_lif() {
        let (scaled, w_scale, lambda_scale) = NeuronModel::lif().renormalised();
        assert_eq!(w_scale, 1e-9);
        assert_eq!(lambda_scale, 1.0);
        assert_eq!(scaled.b1, 1.0);
        assert_eq!(scaled.b2, -1.0);
        assert!((scaled.a0 - 1e9).abs() < 1.0);
        // The linearized constraint scales with the target
        let lin = scaled.linearize(2.0);
        assert_eq!(lin.exc, 1.0);
        assert!((lin.target - 2e9).abs() < 1.0);
    }

    #[test]
    fn test_problem_validation() {
        let a_pre = Array2::zeros((10, 4));
        let j_post = Array2::zeros((10, 3));
        let problem = WeightProblem::new(a_pre.clone(), j_post.clone(), NeuronModel::lif());
        assert!(problem.is_ok());

        // Sample count mismatch
        let bad = WeightProblem::new(Array2::zeros((9, 4)), j_post.clone(), NeuronModel::lif());
        assert!(matches!(bad, Err(WeightsError::ShapeMismatch(_))));

        // Wrong model count
        let bad = WeightProblem::with_models(a_pre.clone(), j_post.clone(), vec![NeuronModel::lif(); 2]);
        assert!(matches!(bad, Err(WeightsError::ShapeMismatch(_))));

        // Wrong mask shape
        let mask = ConnectionMask::all_to_all(4, 2);
        let bad = WeightProblem::new(a_pre, j_post, NeuronModel::lif())
            .unwrap()
            .with_mask(mask);
        assert!(matches!(bad, Err(WeightsError::ShapeMismatch(_))));
    }

    #[test]
    fn test_problem_defaults() {
        let problem = WeightProblem::new(
            Array2::zeros((5, 2)),
            Array2::zeros((5, 3)),
            NeuronModel::lif(),
        )
        .unwrap();
        assert_eq!(problem.n_pre(), 2);
        assert_eq!(problem.n_post(), 3);
        assert_eq!(problem.n_samples(), 5);
        assert_eq!(problem.regularisation(), DEFAULT_REGULARISATION);
        assert!(problem.j_threshold().is_none());
        assert!(problem.non_negative());
        assert!(problem.mask().exc.iter().all(|&m| m));
    }

    #[test]
    fn test_parameter_validation() {
        assert!(SolverParameters::default().validate().is_ok());
        let bad = SolverParameters {
            tolerance: 0.0,
            ..Default::default()
        };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_cancel_token() {
        let token = CancelToken::new();
        let shared = token.clone();
        assert!(!token.is_cancelled());
        shared.cancel();
        assert!(token.is_cancelled());
    }
}
