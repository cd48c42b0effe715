use crate::covariate::CovariateModel;
use crate::fit::FoceModel;
use crate::linearize::linearize;
use crate::model::StructuralModel;
use crate::objective::{conditional_loss, tag_subject};
use crate::{Error, Population, Result, Subject};
use faer::linalg::solvers::Solve;
use faer_ext::{IntoFaer, IntoNalgebra};
use log::info;
use nalgebra::{DMatrix, DVector};
use rayon::prelude::*;

/// Step width factor of the per-subject score differences.
const SCORE_STEP: f64 = 1e-5;

/// Step width factor of the per-subject Hessian differences.
const HESSIAN_STEP: f64 = 1e-4;

/// Sandwich covariance of the population estimates.
///
/// Produced by [FoceModel::covariance_step]; all quantities are indexed by
/// the stacked parameter vector of theta values followed by the literal
/// omega and sigma entries.
#[derive(Clone, Debug, PartialEq)]
pub struct CovarianceOutput {
    /// Sandwich covariance `R^-1 S R^-1`.
    pub cov: DMatrix<f64>,
    /// Standard errors, the square roots of the covariance diagonal.
    pub se: DVector<f64>,
    /// Correlation matrix of the estimates.
    pub correlation: DMatrix<f64>,
    /// Eigenvalues of the correlation matrix, ascending.
    pub eigenvalues: DVector<f64>,
    /// Inverse covariance `R S^-1 R`.
    pub inv_cov: DMatrix<f64>,
    /// Sum of per-subject Hessians of the objective.
    pub r: DMatrix<f64>,
    /// Sum of per-subject score outer products.
    pub s: DMatrix<f64>,
}

impl<M: StructuralModel, C: CovariateModel> FoceModel<M, C> {
    /// Computes sandwich standard errors of the population estimates.
    #[cfg_attr(doc, katexit::katexit)]
    /// Per-subject scores $g_i$ and Hessians $h_i$ of the conditional
    /// objective are taken by central differences with respect to the
    /// stacked literal parameters, then
    /// $$
    /// S = \sum_i g_i g_i^t, \qquad R = \sum_i h_i, \qquad
    /// \mathrm{Cov} = R^{-1} S R^{-1}.
    /// $$
    /// The model must be descaled first so the derivatives are with respect
    /// to the reported parameters rather than optimizer coordinates.
    pub fn covariance_step(&self, population: &Population) -> Result<CovarianceOutput> {
        if self.is_scaled() {
            return Err(Error::ScaleState {
                operation: "covariance_step",
                required: "descaled",
                actual: "scaled",
            });
        }
        let x = self.stacked();
        let dim = x.len();
        let parts: Result<Vec<(DVector<f64>, DMatrix<f64>)>> = population
            .iter()
            .collect::<Vec<_>>()
            .par_iter()
            .map(|subject| {
                let score = self.subject_score(subject, &x)?;
                let hessian = self.subject_hessian(subject, &x)?;
                Ok((score, hessian))
            })
            .collect();
        let mut s = DMatrix::zeros(dim, dim);
        let mut r = DMatrix::zeros(dim, dim);
        for (score, hessian) in parts? {
            s += &score * score.transpose();
            r += hessian;
        }

        let r_f = r.view_range(.., ..).into_faer().to_owned();
        let s_f = s.view_range(.., ..).into_faer().to_owned();
        let r_lu = r_f.partial_piv_lu();
        let s_r_inv = r_lu.solve(&s_f).transpose().to_owned();
        let cov_f = r_lu.solve(&s_r_inv);
        let s_lu = s_f.partial_piv_lu();
        let s_inv_r = s_lu.solve(&r_f);
        let inv_cov_f = &r_f * &s_inv_r;

        let cov: DMatrix<f64> = cov_f.as_ref().into_nalgebra().clone_owned();
        let inv_cov: DMatrix<f64> = inv_cov_f.as_ref().into_nalgebra().clone_owned();
        if cov.iter().any(|v| !v.is_finite()) {
            return Err(Error::NumericIndeterminate {
                what: "sandwich covariance",
                context: " (singular R matrix)".to_string(),
            });
        }

        let mut se = DVector::zeros(dim);
        for i in 0..dim {
            // The sandwich diagonal is nonnegative up to difference-scheme
            // roundoff.
            if cov[(i, i)] < -1e-8 {
                return Err(Error::NumericIndeterminate {
                    what: "standard errors",
                    context: format!(" (negative variance at index {i})"),
                });
            }
            se[i] = cov[(i, i)].max(0.0).sqrt();
        }

        let mut correlation = DMatrix::identity(dim, dim);
        for i in 0..dim {
            for j in 0..dim {
                if i != j {
                    correlation[(i, j)] = cov[(i, j)] / (se[i] * se[j]);
                }
            }
        }
        let mut eigenvalues: Vec<f64> = correlation
            .clone()
            .symmetric_eigen()
            .eigenvalues
            .iter()
            .copied()
            .collect();
        eigenvalues.sort_by(f64::total_cmp);

        info!("covariance step over {dim} parameters, {} subjects", population.len());
        Ok(CovarianceOutput {
            cov,
            se,
            correlation,
            eigenvalues: DVector::from_vec(eigenvalues),
            inv_cov,
            r,
            s,
        })
    }

    /// Stacks theta values and the literal covariance entries.
    fn stacked(&self) -> DVector<f64> {
        let mut out: Vec<f64> = self.theta_values();
        for v in self.omega.vectors() {
            out.extend(v.iter());
        }
        for v in self.sigma.vectors() {
            out.extend(v.iter());
        }
        DVector::from_vec(out)
    }

    /// The subject's objective contribution at a stacked parameter vector,
    /// epsilons zeroed and eta held at its current estimate.
    fn subject_loss_at(&self, subject: &Subject, x: &DVector<f64>) -> Result<f64> {
        let mut offset = self.thetas.len();
        let theta = x.as_slice()[..offset].to_vec();
        let mut omega_vecs = self.omega.vectors();
        for v in &mut omega_vecs {
            let len = v.len();
            v.copy_from_slice(&x.as_slice()[offset..offset + len]);
            offset += len;
        }
        let mut sigma_vecs = self.sigma.vectors();
        for v in &mut sigma_vecs {
            let len = v.len();
            v.copy_from_slice(&x.as_slice()[offset..offset + len]);
            offset += len;
        }
        let omega = self.omega.matrix_with(&omega_vecs)?;
        let sigma = self.sigma.matrix_with(&sigma_vecs)?;

        let eta = self
            .effects
            .try_eta(subject.id)
            .cloned()
            .unwrap_or_else(|| DVector::zeros(self.model.eta_dim()));
        let eps = DMatrix::zeros(subject.n_records(), self.model.eps_dim());
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
    }

    fn subject_score(&self, subject: &Subject, x: &DVector<f64>) -> Result<DVector<f64>> {
        self.subject_score_with(subject, x, SCORE_STEP)
    }

    fn subject_score_with(
        &self,
        subject: &Subject,
        x: &DVector<f64>,
        step: f64,
    ) -> Result<DVector<f64>> {
        let mut score = DVector::zeros(x.len());
        for k in 0..x.len() {
            let h = step * (1.0 + x[k].abs());
            let mut up = x.clone();
            up[k] += h;
            let mut down = x.clone();
            down[k] -= h;
            score[k] = (self.subject_loss_at(subject, &up)?
                - self.subject_loss_at(subject, &down)?)
                / (2.0 * h);
        }
        Ok(score)
    }

    /// Central differences of the score, averaged into a symmetric matrix.
    fn subject_hessian(&self, subject: &Subject, x: &DVector<f64>) -> Result<DMatrix<f64>> {
        let dim = x.len();
        let mut hessian = DMatrix::zeros(dim, dim);
        for k in 0..dim {
            let h = HESSIAN_STEP * (1.0 + x[k].abs());
            let mut up = x.clone();
            up[k] += h;
            let mut down = x.clone();
            down[k] -= h;
            let column = (self.subject_score_with(subject, &up, HESSIAN_STEP)?
                - self.subject_score_with(subject, &down, HESSIAN_STEP)?)
                / (2.0 * h);
            hessian.column_mut(k).copy_from(&column);
        }
        Ok(0.5 * (&hessian + hessian.transpose()))
    }
}
