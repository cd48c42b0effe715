use crate::covariate::CovariateModel;
use crate::fit::FoceModel;
use crate::model::{StructuralModel, subject_outputs};
use crate::objective::tag_subject;
use crate::{Error, Population, Result, SubjectId};
use nalgebra::{DMatrix, DVector};
use rand::Rng;
use rand_distr::StandardNormal;

/// Simulated replicates of one subject.
#[derive(Clone, Debug, PartialEq)]
pub struct SubjectSimulation {
    /// Subject identifier.
    pub id: SubjectId,
    /// Record times, unmasked.
    pub times: Vec<f64>,
    /// Simulated outputs, one vector over records per replicate.
    pub replicates: Vec<DVector<f64>>,
    /// Drawn etas, one per replicate.
    pub etas: Vec<DVector<f64>>,
    /// Drawn epsilon rows, one matrix per replicate.
    pub epss: Vec<DMatrix<f64>>,
}

/// Outcome of [FoceModel::simulate].
#[derive(Clone, Debug, PartialEq)]
pub struct SimulationOutput {
    /// Per-subject replicates, in id order.
    pub subjects: Vec<SubjectSimulation>,
}

/// A factor `L` with `L L^t` equal to the covariance, for multivariate
/// normal draws.
///
/// Positive-semidefinite matrices that the Cholesky factorization rejects
/// fall back to an eigendecomposition with the nonnegative part of the
/// spectrum, so a zero covariance yields zero draws. Clearly indefinite
/// matrices are an error.
fn sampling_factor(cov: &DMatrix<f64>) -> Result<DMatrix<f64>> {
    let dim = cov.nrows();
    if dim == 0 {
        return Ok(DMatrix::zeros(0, 0));
    }
    if let Some(chol) = cov.clone().cholesky() {
        return Ok(chol.l());
    }
    let eigen = cov.clone().symmetric_eigen();
    let mut scaled = eigen.eigenvectors.clone();
    for (j, &value) in eigen.eigenvalues.iter().enumerate() {
        if value < -1e-8 {
            return Err(Error::NumericIndeterminate {
                what: "sampling factor",
                context: format!(" (eigenvalue {value} is negative)"),
            });
        }
        let root = value.max(0.0).sqrt();
        scaled.column_mut(j).scale_mut(root);
    }
    Ok(scaled)
}

fn draw<R: Rng + ?Sized>(factor: &DMatrix<f64>, rng: &mut R) -> DVector<f64> {
    let z = DVector::from_iterator(
        factor.ncols(),
        (0..factor.ncols()).map(|_| rng.sample::<f64, _>(StandardNormal)),
    );
    factor * z
}

impl<M: StructuralModel, C: CovariateModel> FoceModel<M, C> {
    /// Draws random effects from the current omega and sigma and simulates
    /// replicate outputs for every subject.
    ///
    /// Each replicate substitutes fresh draws into the random-effect
    /// registry and evaluates the full output pipeline; the registry is
    /// restored afterwards. Works in both scaling states.
    pub fn simulate<R: Rng + ?Sized>(
        &mut self,
        population: &Population,
        n_replicates: usize,
        rng: &mut R,
    ) -> Result<SimulationOutput> {
        let snapshot = self.effects.snapshot();
        let result = self.simulate_inner(population, n_replicates, rng);
        self.effects.restore(snapshot);
        result
    }

    fn simulate_inner<R: Rng + ?Sized>(
        &mut self,
        population: &Population,
        n_replicates: usize,
        rng: &mut R,
    ) -> Result<SimulationOutput> {
        let omega_factor = sampling_factor(&self.omega.matrix())?;
        let sigma_factor = sampling_factor(&self.sigma.matrix())?;
        let theta = self.theta_values();
        let mut subjects = Vec::with_capacity(population.len());
        for subject in population.iter() {
            let n = subject.n_records();
            let mut replicates = Vec::with_capacity(n_replicates);
            let mut etas = Vec::with_capacity(n_replicates);
            let mut epss = Vec::with_capacity(n_replicates);
            for _ in 0..n_replicates {
                let eta = draw(&omega_factor, rng);
                let mut eps = DMatrix::zeros(n, self.model.eps_dim());
                for i in 0..n {
                    eps.row_mut(i).tr_copy_from(&draw(&sigma_factor, rng));
                }
                self.effects.set_eta(subject.id, eta)?;
                self.effects.set_eps(subject.id, eps)?;

                let eta_now = self.effects.eta(subject.id).clone();
                let eps_now = self.effects.eps(subject.id, n).clone();
                let eps_rows: Vec<Vec<f64>> = (0..n)
                    .map(|i| (0..self.model.eps_dim()).map(|j| eps_now[(i, j)]).collect())
                    .collect();
                let outputs = subject_outputs(
                    &self.model,
                    &self.covariates,
                    subject,
                    &theta,
                    eta_now.as_slice(),
                    &eps_rows,
                )
                .map_err(|e| tag_subject(e, subject.id))?;
                replicates.push(DVector::from_vec(outputs));
                etas.push(eta_now);
                epss.push(eps_now);
            }
            subjects.push(SubjectSimulation {
                id: subject.id,
                times: subject.times(),
                replicates,
                etas,
                epss,
            });
        }
        Ok(SimulationOutput { subjects })
    }
}
