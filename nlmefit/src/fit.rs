use crate::covariance::CovarianceMatrix;
use crate::covariate::{CovariateModel, NoCovariates};
use crate::effects::RandomEffectRegistry;
use crate::linearize::linearize;
use crate::model::StructuralModel;
use crate::objective::{conditional_loss, cwres, tag_subject};
use crate::theta::Theta;
use crate::{Error, Population, Result, Subject, SubjectId};
use log::{debug, info, warn};
use nalgebra::{DMatrix, DVector};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

/// Relative step width of the central-difference objective gradient.
const FD_STEP: f64 = 1e-6;

/// Armijo sufficient-decrease constant of the backtracking line search.
const ARMIJO_C: f64 = 1e-4;

/// Maximum number of step halvings per line search.
const MAX_BACKTRACKS: usize = 40;

/// Options of a single fit run.
#[derive(Clone, Debug)]
pub struct FitOptions {
    /// Maximum number of quasi-Newton iterations.
    pub max_iterations: usize,
    /// Fit converges when the gradient norm falls below this.
    pub gradient_tolerance: f64,
    /// Fit converges when the objective decrease falls below this.
    pub objective_tolerance: f64,
    /// Step length the line search starts from.
    pub initial_step: f64,
    /// Optional checkpoint file written after a successful fit.
    pub checkpoint: Option<PathBuf>,
}

impl Default for FitOptions {
    fn default() -> Self {
        Self {
            max_iterations: 1000,
            gradient_tolerance: 1e-2,
            objective_tolerance: 1e-2,
            initial_step: 1.0,
            checkpoint: None,
        }
    }
}

/// Terminal state of a fit run.
///
/// Hitting the iteration cap is a status, not an error; the best iterate is
/// committed either way.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FitStatus {
    /// A convergence criterion was met.
    Converged,
    /// The iteration cap was reached first.
    MaxIterationsReached,
    /// The line search found no acceptable step before the halving limit.
    LineSearchStalled,
}

impl fmt::Display for FitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Converged => write!(f, "converged"),
            Self::MaxIterationsReached => write!(f, "max iterations reached"),
            Self::LineSearchStalled => write!(f, "line search stalled"),
        }
    }
}

/// Result summary of a fit run.
#[derive(Clone, Debug, PartialEq)]
pub struct FitReport {
    /// Terminal status.
    pub status: FitStatus,
    /// Final objective value.
    pub objective: f64,
    /// Number of accepted iterations.
    pub iterations: usize,
    /// Gradient norm at the final iterate.
    pub gradient_norm: f64,
}

impl fmt::Display for FitReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: objective {:.6} after {} iterations, |grad| {:.3e}",
            self.status, self.objective, self.iterations, self.gradient_norm
        )
    }
}

/// Per-subject outcome of [FoceModel::evaluate].
#[derive(Clone, Debug, PartialEq)]
pub struct SubjectEvaluation {
    /// Subject identifier.
    pub id: SubjectId,
    /// The subject's objective contribution.
    pub loss: f64,
    /// Record times, unmasked.
    pub times: Vec<f64>,
    /// Model outputs at every record, epsilons zeroed.
    pub predictions: DVector<f64>,
    /// Conditional weighted residuals of the masked records.
    pub cwres: DVector<f64>,
    /// Observation mask over records.
    pub mask: Vec<bool>,
}

/// Outcome of [FoceModel::evaluate].
#[derive(Clone, Debug, PartialEq)]
pub struct Evaluation {
    /// Total objective over all subjects.
    pub loss: f64,
    /// Per-subject results, in id order.
    pub subjects: Vec<SubjectEvaluation>,
}

/// A population model under the FOCE-I approximation.
///
/// Bundles a structural model, an optional covariate model, the bounded
/// fixed effects, both covariance matrices and the per-subject random
/// effects, and drives estimation, evaluation, covariance-step and
/// simulation on top of them.
pub struct FoceModel<M, C = NoCovariates> {
    pub(crate) model: M,
    pub(crate) covariates: C,
    pub(crate) thetas: Vec<Theta>,
    pub(crate) omega: CovarianceMatrix,
    pub(crate) sigma: CovarianceMatrix,
    pub(crate) effects: RandomEffectRegistry,
}

impl<M: StructuralModel> FoceModel<M, NoCovariates> {
    /// Creates a model without covariates.
    ///
    /// The omega dimension must match the structural model's eta dimension
    /// and the sigma dimension its epsilon dimension.
    pub fn new(
        model: M,
        thetas: Vec<Theta>,
        omega: CovarianceMatrix,
        sigma: CovarianceMatrix,
    ) -> Result<Self> {
        if omega.dim() != model.eta_dim() {
            return Err(Error::LengthMismatch {
                left: "omega",
                left_len: omega.dim(),
                right: "model etas",
                right_len: model.eta_dim(),
            });
        }
        if sigma.dim() != model.eps_dim() {
            return Err(Error::LengthMismatch {
                left: "sigma",
                left_len: sigma.dim(),
                right: "model epsilons",
                right_len: model.eps_dim(),
            });
        }
        let effects = RandomEffectRegistry::new(model.eta_dim(), model.eps_dim());
        Ok(Self {
            model,
            covariates: NoCovariates,
            thetas,
            omega,
            sigma,
            effects,
        })
    }

    /// Attaches a covariate model.
    pub fn with_covariates<C: CovariateModel>(self, covariates: C) -> FoceModel<M, C> {
        FoceModel {
            model: self.model,
            covariates,
            thetas: self.thetas,
            omega: self.omega,
            sigma: self.sigma,
            effects: self.effects,
        }
    }
}

impl<M: StructuralModel, C: CovariateModel> FoceModel<M, C> {
    /// The structural model.
    pub fn model(&self) -> &M {
        &self.model
    }

    /// The bounded fixed effects.
    pub fn thetas(&self) -> &[Theta] {
        &self.thetas
    }

    /// Current bounded fixed-effect values.
    pub fn theta_values(&self) -> Vec<f64> {
        self.thetas.iter().map(Theta::value).collect()
    }

    /// The between-subject covariance matrix.
    pub fn omega(&self) -> &CovarianceMatrix {
        &self.omega
    }

    /// The residual covariance matrix.
    pub fn sigma(&self) -> &CovarianceMatrix {
        &self.sigma
    }

    /// The per-subject random effects.
    pub fn effects(&self) -> &RandomEffectRegistry {
        &self.effects
    }

    /// Mutable access to the per-subject random effects.
    pub fn effects_mut(&mut self) -> &mut RandomEffectRegistry {
        &mut self.effects
    }

    /// Whether thetas and both covariance matrices are in the scaled state.
    pub fn is_scaled(&self) -> bool {
        self.thetas.iter().all(Theta::is_scaled) && self.omega.is_scaled() && self.sigma.is_scaled()
    }

    /// Freezes all parameters at their literal values.
    pub fn descale(&mut self) {
        for theta in &mut self.thetas {
            theta.descale();
        }
        self.omega.descale();
        self.sigma.descale();
    }

    /// Restores the optimizer coordinates saved by the last
    /// [FoceModel::descale].
    pub fn scale(&mut self) {
        for theta in &mut self.thetas {
            theta.scale();
        }
        self.omega.scale();
        self.sigma.scale();
    }

    fn require_scaled(&self, operation: &'static str) -> Result<()> {
        if self.is_scaled() {
            Ok(())
        } else {
            Err(Error::ScaleState {
                operation,
                required: "scaled",
                actual: "descaled",
            })
        }
    }

    /// Fits fixed effects, trainable covariance blocks and all subjects'
    /// etas jointly.
    ///
    /// Random effects are zeroed first, so successive calls on the same
    /// model are independent. The best iterate is committed even when the
    /// iteration cap is hit.
    pub fn fit_population(&mut self, population: &Population, options: &FitOptions) -> Result<FitReport> {
        self.require_scaled("fit_population")?;
        for subject in population.iter() {
            self.effects.eta(subject.id);
            self.effects.eps(subject.id, subject.n_records());
        }
        self.effects.reset_etas();
        self.effects.reset_epss();

        let packing = Packing::population(self, population);
        let subjects: Vec<&Subject> = population.iter().collect();
        let base = self.candidate()?;
        let (best, report) = self.minimize(&subjects, &packing, &base, options)?;
        self.commit(&best)?;
        info!("population fit {report}");
        if let Some(path) = &options.checkpoint {
            self.write_checkpoint(path)?;
        }
        Ok(report)
    }

    /// Fits one subject's eta, holding every population parameter fixed.
    ///
    /// Epsilons stay at zero; without a prior term they would absorb the
    /// residuals outright.
    pub fn fit_individual(
        &mut self,
        population: &Population,
        id: SubjectId,
        options: &FitOptions,
    ) -> Result<FitReport> {
        self.require_scaled("fit_individual")?;
        let subject = population.get(id).ok_or(Error::UnknownSubject { id })?;
        self.effects.eta(id);
        self.effects.eps(id, subject.n_records());

        let packing = Packing::individual(self, subject);
        let subjects = vec![subject];
        let base = self.candidate()?;
        let (best, report) = self.minimize(&subjects, &packing, &base, options)?;
        self.commit(&best)?;
        info!("individual fit of subject {id} {report}");
        Ok(report)
    }

    /// Objective, predictions and conditional weighted residuals at the
    /// current parameters.
    ///
    /// Epsilons are zeroed for the duration of the call and restored
    /// afterwards. Works in both scaling states.
    pub fn evaluate(&mut self, population: &Population) -> Result<Evaluation> {
        let snapshot = self.effects.snapshot();
        let result = self.evaluate_inner(population);
        self.effects.restore(snapshot);
        result
    }

    fn evaluate_inner(&mut self, population: &Population) -> Result<Evaluation> {
        self.effects.reset_epss();
        let theta = self.theta_values();
        let omega = self.omega.matrix();
        let sigma = self.sigma.matrix();
        let mut subjects = Vec::with_capacity(population.len());
        let mut total = 0.0;
        for subject in population.iter() {
            let eta = self.effects.eta(subject.id).clone();
            let eps = self
                .effects
                .eps(subject.id, subject.n_records())
                .clone();
            let lin = linearize(&self.model, &self.covariates, subject, &theta, &eta, &eps)
                .map_err(|e| tag_subject(e, subject.id))?;
            let mask = subject.observation_mask();
            let masked = lin.masked(&mask);
            let observations = subject.observations();
            let loss = conditional_loss(
                &observations,
                &masked.predictions,
                &masked.g,
                &masked.h,
                &eta,
                &omega,
                &sigma,
            )
            .map_err(|e| tag_subject(e, subject.id))?;
            let residuals = cwres(
                &observations,
                &masked.predictions,
                &masked.g,
                &masked.h,
                &eta,
                &omega,
                &sigma,
            )
            .map_err(|e| tag_subject(e, subject.id))?;
            total += loss;
            subjects.push(SubjectEvaluation {
                id: subject.id,
                loss,
                times: subject.times(),
                predictions: lin.predictions,
                cwres: residuals,
                mask,
            });
        }
        Ok(Evaluation {
            loss: total,
            subjects,
        })
    }

    /// Writes the trainable state to a json checkpoint file.
    pub fn write_checkpoint(&self, path: impl AsRef<Path>) -> Result<()> {
        self.require_scaled("write_checkpoint")?;
        let file = CheckpointFile {
            theta_unconstrained: self
                .thetas
                .iter()
                .map(Theta::unconstrained)
                .collect::<Result<_>>()?,
            omega: self
                .omega
                .vectors()
                .iter()
                .map(|v| v.as_slice().to_vec())
                .collect(),
            sigma: self
                .sigma
                .vectors()
                .iter()
                .map(|v| v.as_slice().to_vec())
                .collect(),
            etas: self
                .effects
                .etas()
                .map(|(id, eta)| (*id, eta.as_slice().to_vec()))
                .collect(),
            epss: self
                .effects
                .epss()
                .map(|(id, eps)| {
                    (
                        *id,
                        CheckpointMatrix {
                            rows: eps.nrows(),
                            cols: eps.ncols(),
                            data: eps.transpose().as_slice().to_vec(),
                        },
                    )
                })
                .collect(),
        };
        std::fs::write(path, serde_json::to_string_pretty(&file)?)?;
        Ok(())
    }

    /// Restores the trainable state from a json checkpoint file.
    pub fn read_checkpoint(&mut self, path: impl AsRef<Path>) -> Result<()> {
        self.require_scaled("read_checkpoint")?;
        let file: CheckpointFile = serde_json::from_str(&std::fs::read_to_string(path)?)?;
        if file.theta_unconstrained.len() != self.thetas.len() {
            return Err(Error::LengthMismatch {
                left: "thetas",
                left_len: self.thetas.len(),
                right: "checkpoint thetas",
                right_len: file.theta_unconstrained.len(),
            });
        }
        let omega: Vec<DVector<f64>> = file.omega.iter().map(|v| DVector::from_vec(v.clone())).collect();
        let sigma: Vec<DVector<f64>> = file.sigma.iter().map(|v| DVector::from_vec(v.clone())).collect();
        self.omega.set_vectors(&omega)?;
        self.sigma.set_vectors(&sigma)?;
        for (theta, &u) in self.thetas.iter_mut().zip(&file.theta_unconstrained) {
            theta.set_unconstrained(u)?;
        }
        for (id, eta) in file.etas {
            self.effects.set_eta(id, DVector::from_vec(eta))?;
        }
        for (id, eps) in file.epss {
            let m = DMatrix::from_row_slice(eps.rows, eps.cols, &eps.data);
            self.effects.set_eps(id, m)?;
        }
        Ok(())
    }

    /// Copies the trainable state into an optimizer candidate.
    fn candidate(&self) -> Result<Candidate> {
        Ok(Candidate {
            theta_u: self
                .thetas
                .iter()
                .map(Theta::unconstrained)
                .collect::<Result<_>>()?,
            omega_vecs: self.omega.vectors(),
            sigma_vecs: self.sigma.vectors(),
            etas: self.effects.etas().map(|(id, v)| (*id, v.clone())).collect(),
            epss: self.effects.epss().map(|(id, m)| (*id, m.clone())).collect(),
        })
    }

    /// Writes an optimizer candidate back into the model.
    fn commit(&mut self, candidate: &Candidate) -> Result<()> {
        for (theta, &u) in self.thetas.iter_mut().zip(&candidate.theta_u) {
            theta.set_unconstrained(u)?;
        }
        self.omega.set_vectors(&candidate.omega_vecs)?;
        self.sigma.set_vectors(&candidate.sigma_vecs)?;
        for (id, eta) in &candidate.etas {
            self.effects.set_eta(*id, eta.clone())?;
        }
        for (id, eps) in &candidate.epss {
            self.effects.set_eps(*id, eps.clone())?;
        }
        Ok(())
    }

    /// Total objective over the given subjects for a candidate.
    fn objective(&self, subjects: &[&Subject], candidate: &Candidate) -> Result<f64> {
        let theta: Vec<f64> = self
            .thetas
            .iter()
            .zip(&candidate.theta_u)
            .map(|(t, &u)| t.value_of(u))
            .collect();
        let omega = self.omega.matrix_with(&candidate.omega_vecs)?;
        let sigma = self.sigma.matrix_with(&candidate.sigma_vecs)?;
        let losses: Result<Vec<f64>> = subjects
            .par_iter()
            .map(|subject| {
                let eta = candidate
                    .etas
                    .get(&subject.id)
                    .cloned()
                    .unwrap_or_else(|| DVector::zeros(self.model.eta_dim()));
                let eps = candidate
                    .epss
                    .get(&subject.id)
                    .cloned()
                    .unwrap_or_else(|| {
                        DMatrix::zeros(subject.n_records(), self.model.eps_dim())
                    });
                let lin = linearize(&self.model, &self.covariates, subject, &theta, &eta, &eps)
                    .map_err(|e| tag_subject(e, subject.id))?;
                let masked = lin.masked(&subject.observation_mask());
                conditional_loss(
                    &subject.observations(),
                    &masked.predictions,
                    &masked.g,
                    &masked.h,
                    &eta,
                    &omega,
                    &sigma,
                )
                .map_err(|e| tag_subject(e, subject.id))
            })
            .collect();
        Ok(losses?.iter().sum())
    }

    fn objective_at(
        &self,
        subjects: &[&Subject],
        packing: &Packing,
        base: &Candidate,
        x: &DVector<f64>,
    ) -> Result<f64> {
        self.objective(subjects, &packing.unpack(base, x))
    }

    /// Central-difference gradient of the objective, parallel over
    /// components.
    fn gradient(
        &self,
        subjects: &[&Subject],
        packing: &Packing,
        base: &Candidate,
        x: &DVector<f64>,
    ) -> Result<DVector<f64>> {
        let components: Result<Vec<f64>> = (0..x.len())
            .into_par_iter()
            .map(|k| {
                let h = FD_STEP * (1.0 + x[k].abs());
                let mut up = x.clone();
                up[k] += h;
                let mut down = x.clone();
                down[k] -= h;
                let fu = self.objective_at(subjects, packing, base, &up)?;
                let fd = self.objective_at(subjects, packing, base, &down)?;
                Ok((fu - fd) / (2.0 * h))
            })
            .collect();
        Ok(DVector::from_vec(components?))
    }

    /// BFGS with a backtracking Armijo line search over the packed
    /// parameter vector.
    fn minimize(
        &self,
        subjects: &[&Subject],
        packing: &Packing,
        base: &Candidate,
        options: &FitOptions,
    ) -> Result<(Candidate, FitReport)> {
        let mut x = packing.pack(base);
        let n = x.len();
        let mut f = self.objective_at(subjects, packing, base, &x)?;
        if n == 0 {
            let report = FitReport {
                status: FitStatus::Converged,
                objective: f,
                iterations: 0,
                gradient_norm: 0.0,
            };
            return Ok((base.clone(), report));
        }
        let mut grad = self.gradient(subjects, packing, base, &x)?;
        let mut h_inv = DMatrix::identity(n, n);
        let mut iterations = 0;
        let mut status = FitStatus::MaxIterationsReached;

        while iterations < options.max_iterations {
            if grad.norm() < options.gradient_tolerance {
                status = FitStatus::Converged;
                break;
            }
            let mut direction = -(&h_inv * &grad);
            let mut slope = grad.dot(&direction);
            if slope >= 0.0 {
                // Curvature information went stale, fall back to steepest
                // descent.
                h_inv = DMatrix::identity(n, n);
                direction = -grad.clone();
                slope = grad.dot(&direction);
            }
            let Some((x_new, f_new)) = self.backtrack(
                subjects,
                packing,
                base,
                &x,
                &direction,
                f,
                slope,
                options.initial_step,
            )?
            else {
                warn!("line search stalled at iteration {iterations}, objective {f:.6}");
                status = FitStatus::LineSearchStalled;
                break;
            };
            let grad_new = self.gradient(subjects, packing, base, &x_new)?;

            let s = &x_new - &x;
            let y = &grad_new - &grad;
            let sy = s.dot(&y);
            if sy > 1e-12 {
                let rho = 1.0 / sy;
                let a = DMatrix::identity(n, n) - &s * y.transpose() * rho;
                h_inv = &a * h_inv * a.transpose() + &s * s.transpose() * rho;
            }

            let decrease = f - f_new;
            x = x_new;
            f = f_new;
            grad = grad_new;
            iterations += 1;
            debug!(
                "iteration {iterations}: objective {f:.6}, |grad| {:.3e}",
                grad.norm()
            );
            if decrease.abs() < options.objective_tolerance {
                status = FitStatus::Converged;
                break;
            }
        }
        if iterations >= options.max_iterations {
            warn!("iteration cap of {} reached", options.max_iterations);
        }
        let report = FitReport {
            status,
            objective: f,
            iterations,
            gradient_norm: grad.norm(),
        };
        Ok((packing.unpack(base, &x), report))
    }

    /// Halves the step until the Armijo condition holds.
    ///
    /// A numeric breakdown at a trial point shrinks the step instead of
    /// aborting the fit; any other error propagates.
    #[allow(clippy::too_many_arguments)]
    fn backtrack(
        &self,
        subjects: &[&Subject],
        packing: &Packing,
        base: &Candidate,
        x: &DVector<f64>,
        direction: &DVector<f64>,
        f: f64,
        slope: f64,
        initial_step: f64,
    ) -> Result<Option<(DVector<f64>, f64)>> {
        let mut step = initial_step;
        for _ in 0..MAX_BACKTRACKS {
            let trial = x + direction * step;
            match self.objective_at(subjects, packing, base, &trial) {
                Ok(ft) if ft <= f + ARMIJO_C * step * slope => return Ok(Some((trial, ft))),
                Ok(_) | Err(Error::NumericIndeterminate { .. }) => step *= 0.5,
                Err(e) => return Err(e),
            }
        }
        Ok(None)
    }
}

/// One point of the optimization space in model coordinates.
#[derive(Clone, Debug)]
struct Candidate {
    theta_u: Vec<f64>,
    omega_vecs: Vec<DVector<f64>>,
    sigma_vecs: Vec<DVector<f64>>,
    etas: BTreeMap<SubjectId, DVector<f64>>,
    epss: BTreeMap<SubjectId, DMatrix<f64>>,
}

/// Stacking layout of the free parameters for one fit scope.
///
/// Eta slots carry their dimension so packing never depends on which
/// registry entries a candidate happens to hold. Epsilons are never free;
/// the objective is always taken at zero epsilon.
struct Packing {
    theta_slots: Vec<usize>,
    omega_blocks: Vec<usize>,
    sigma_blocks: Vec<usize>,
    eta_slots: Vec<(SubjectId, usize)>,
}

impl Packing {
    fn population<M: StructuralModel, C: CovariateModel>(
        model: &FoceModel<M, C>,
        population: &Population,
    ) -> Self {
        Self {
            theta_slots: (0..model.thetas.len())
                .filter(|&i| !model.thetas[i].is_fixed())
                .collect(),
            omega_blocks: (0..model.omega.n_blocks())
                .filter(|&i| model.omega.is_block_trainable(i))
                .collect(),
            sigma_blocks: (0..model.sigma.n_blocks())
                .filter(|&i| model.sigma.is_block_trainable(i))
                .collect(),
            eta_slots: population
                .iter()
                .map(|s| (s.id, model.model.eta_dim()))
                .collect(),
        }
    }

    fn individual<M: StructuralModel, C: CovariateModel>(
        model: &FoceModel<M, C>,
        subject: &Subject,
    ) -> Self {
        Self {
            theta_slots: Vec::new(),
            omega_blocks: Vec::new(),
            sigma_blocks: Vec::new(),
            eta_slots: vec![(subject.id, model.model.eta_dim())],
        }
    }

    fn pack(&self, candidate: &Candidate) -> DVector<f64> {
        let mut out = Vec::new();
        for &i in &self.theta_slots {
            out.push(candidate.theta_u[i]);
        }
        for &b in &self.omega_blocks {
            out.extend(candidate.omega_vecs[b].iter());
        }
        for &b in &self.sigma_blocks {
            out.extend(candidate.sigma_vecs[b].iter());
        }
        for (id, dim) in &self.eta_slots {
            match candidate.etas.get(id) {
                Some(eta) => out.extend(eta.iter()),
                None => out.extend(std::iter::repeat_n(0.0, *dim)),
            }
        }
        DVector::from_vec(out)
    }

    fn unpack(&self, base: &Candidate, x: &DVector<f64>) -> Candidate {
        let mut candidate = base.clone();
        let mut offset = 0;
        for &i in &self.theta_slots {
            candidate.theta_u[i] = x[offset];
            offset += 1;
        }
        for &b in &self.omega_blocks {
            let len = candidate.omega_vecs[b].len();
            candidate.omega_vecs[b].copy_from_slice(&x.as_slice()[offset..offset + len]);
            offset += len;
        }
        for &b in &self.sigma_blocks {
            let len = candidate.sigma_vecs[b].len();
            candidate.sigma_vecs[b].copy_from_slice(&x.as_slice()[offset..offset + len]);
            offset += len;
        }
        for (id, dim) in &self.eta_slots {
            let eta = DVector::from_column_slice(&x.as_slice()[offset..offset + dim]);
            candidate.etas.insert(*id, eta);
            offset += dim;
        }
        candidate
    }
}

#[derive(Serialize, Deserialize)]
struct CheckpointMatrix {
    rows: usize,
    cols: usize,
    /// Row-major entries.
    data: Vec<f64>,
}

#[derive(Serialize, Deserialize)]
struct CheckpointFile {
    theta_unconstrained: Vec<f64>,
    omega: Vec<Vec<f64>>,
    sigma: Vec<Vec<f64>>,
    etas: BTreeMap<SubjectId, Vec<f64>>,
    epss: BTreeMap<SubjectId, CheckpointMatrix>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ParamMap;
    use crate::require;
    use num_dual::DualNum;

    /// Flat response with additive error, no random inter-subject
    /// variability.
    struct Constant;

    impl StructuralModel for Constant {
        fn eta_dim(&self) -> usize {
            0
        }
        fn eps_dim(&self) -> usize {
            1
        }
        fn parameters<D: DualNum<f64> + Copy>(
            &self,
            theta: &[f64],
            _eta: &[D],
            _covariates: &BTreeMap<String, f64>,
        ) -> Result<ParamMap<D>> {
            let mut p = ParamMap::new();
            p.insert("level".into(), D::from(theta[0]));
            Ok(p)
        }
        fn predictions<D: DualNum<f64> + Copy>(
            &self,
            subject: &Subject,
            params: &ParamMap<D>,
        ) -> Result<Vec<D>> {
            let level = require(params, "level")?;
            Ok(vec![level; subject.n_records()])
        }
        fn error<D: DualNum<f64> + Copy>(&self, pred: D, eps: &[D]) -> D {
            pred + eps[0]
        }
    }

    /// Rejects any level measurably away from its starting value.
    struct NarrowWindow;

    impl StructuralModel for NarrowWindow {
        fn eta_dim(&self) -> usize {
            0
        }
        fn eps_dim(&self) -> usize {
            1
        }
        fn parameters<D: DualNum<f64> + Copy>(
            &self,
            theta: &[f64],
            _eta: &[D],
            _covariates: &BTreeMap<String, f64>,
        ) -> Result<ParamMap<D>> {
            if (theta[0] - 3.0).abs() > 1e-5 {
                return Err(Error::NumericIndeterminate {
                    what: "level window",
                    context: String::new(),
                });
            }
            let mut p = ParamMap::new();
            p.insert("level".into(), D::from(theta[0]));
            Ok(p)
        }
        fn predictions<D: DualNum<f64> + Copy>(
            &self,
            subject: &Subject,
            params: &ParamMap<D>,
        ) -> Result<Vec<D>> {
            let level = require(params, "level")?;
            Ok(vec![level; subject.n_records()])
        }
        fn error<D: DualNum<f64> + Copy>(&self, pred: D, eps: &[D]) -> D {
            pred + eps[0]
        }
    }

    fn constant_model() -> Result<FoceModel<Constant>> {
        FoceModel::new(
            Constant,
            vec![Theta::with_bounds(0.0, 3.0, 100.0)?],
            CovarianceMatrix::new(&[], &[], &[])?,
            CovarianceMatrix::new(&[vec![0.04]], &[true], &[false])?,
        )
    }

    fn observations() -> Result<Population> {
        Population::new(vec![
            Subject::builder(1)
                .observation(0.0, 4.8)
                .observation(1.0, 5.2)
                .build(),
            Subject::builder(2)
                .observation(0.0, 5.1)
                .observation(1.0, 4.9)
                .build(),
        ])
    }

    #[test]
    fn fits_flat_model_to_the_sample_mean() -> Result<()> {
        let mut model = constant_model()?;
        let population = observations()?;
        let options = FitOptions {
            gradient_tolerance: 1e-7,
            objective_tolerance: 1e-10,
            ..FitOptions::default()
        };
        let report = model.fit_population(&population, &options)?;
        assert_eq!(report.status, FitStatus::Converged);
        assert!((model.theta_values()[0] - 5.0).abs() < 1e-3);
        Ok(())
    }

    #[test]
    fn fit_requires_scaled_parameters() -> Result<()> {
        let mut model = constant_model()?;
        let population = observations()?;
        model.descale();
        let err = model.fit_population(&population, &FitOptions::default());
        assert!(matches!(err, Err(Error::ScaleState { .. })));
        Ok(())
    }

    #[test]
    fn unknown_subject_is_rejected() -> Result<()> {
        let mut model = constant_model()?;
        let population = observations()?;
        assert_eq!(
            model.fit_individual(&population, 9, &FitOptions::default()),
            Err(Error::UnknownSubject { id: 9 })
        );
        Ok(())
    }

    #[test]
    fn stalled_line_search_is_reported_distinctly() -> Result<()> {
        // A tiny residual variance makes the gradient enormous, so every
        // trial step leaves the acceptance window and gets rejected.
        let mut model = FoceModel::new(
            NarrowWindow,
            vec![Theta::with_bounds(0.0, 3.0, 10.0)?],
            CovarianceMatrix::new(&[], &[], &[])?,
            CovarianceMatrix::new(&[vec![1e-10]], &[true], &[false])?,
        )?;
        let population = Population::new(vec![
            Subject::builder(1).observation(0.0, 4.0).build(),
        ])?;
        let options = FitOptions::default();
        let report = model.fit_population(&population, &options)?;
        assert_eq!(report.status, FitStatus::LineSearchStalled);
        assert!(report.iterations < options.max_iterations);
        Ok(())
    }

    #[test]
    fn checkpoint_round_trip_restores_state() -> Result<()> {
        let mut model = constant_model()?;
        let population = observations()?;
        let options = FitOptions {
            gradient_tolerance: 1e-7,
            objective_tolerance: 1e-10,
            ..FitOptions::default()
        };
        model.fit_population(&population, &options)?;
        let fitted = model.evaluate(&population)?.loss;

        let dir = tempfile::tempdir().map_err(|e| Error::Checkpoint(e.to_string()))?;
        let path = dir.path().join("fit.json");
        model.write_checkpoint(&path)?;

        let mut restored = constant_model()?;
        restored.read_checkpoint(&path)?;
        let reloaded = restored.evaluate(&population)?.loss;
        assert!((fitted - reloaded).abs() < 1e-12);
        assert!((restored.theta_values()[0] - model.theta_values()[0]).abs() < 1e-12);
        Ok(())
    }

    #[test]
    fn pack_unpack_round_trip() -> Result<()> {
        let mut model = constant_model()?;
        let population = observations()?;
        for subject in population.iter() {
            model.effects.eta(subject.id);
            model.effects.eps(subject.id, subject.n_records());
        }
        let packing = Packing::population(&model, &population);
        let base = model.candidate()?;
        let x = packing.pack(&base);
        // One free theta; sigma is not trainable and the model has no etas.
        assert_eq!(x.len(), 1);
        let mut shifted = x.clone();
        shifted[0] = 0.42;
        let unpacked = packing.unpack(&base, &shifted);
        assert_eq!(unpacked.theta_u[0], 0.42);
        assert_eq!(packing.pack(&unpacked), shifted);
        Ok(())
    }
}
