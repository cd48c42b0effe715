use crate::covariate::CovariateModel;
use crate::{Error, Result, Subject};
use num_dual::DualNum;
use std::collections::BTreeMap;

/// Named model parameters, generic over the scalar type.
///
/// A `BTreeMap` keeps iteration deterministic across runs.
pub type ParamMap<D> = BTreeMap<String, D>;

/// Looks up a parameter by name.
pub fn require<D: Copy>(params: &ParamMap<D>, name: &str) -> Result<D> {
    params
        .get(name)
        .copied()
        .ok_or_else(|| Error::MissingParameter {
            name: name.to_string(),
        })
}

/// A structural model mapping fixed and random effects to predictions.
///
/// Implementations are written once over a generic [DualNum] scalar and get
/// evaluated both with plain `f64` and with dual numbers, which is where the
/// first-order sensitivities of the conditional objective come from. Fixed
/// effects arrive as already-bounded `f64` values; only random effects carry
/// derivative information.
pub trait StructuralModel: Send + Sync {
    /// Number of per-subject random effects (etas).
    fn eta_dim(&self) -> usize;

    /// Number of per-record residual effects (epsilons).
    fn eps_dim(&self) -> usize;

    /// Combines fixed effects, etas and covariates into named parameters.
    fn parameters<D: DualNum<f64> + Copy>(
        &self,
        theta: &[f64],
        eta: &[D],
        covariates: &BTreeMap<String, f64>,
    ) -> Result<ParamMap<D>>;

    /// Model predictions for every record of the subject, in record order.
    fn predictions<D: DualNum<f64> + Copy>(
        &self,
        subject: &Subject,
        params: &ParamMap<D>,
    ) -> Result<Vec<D>>;

    /// Applies the residual error model to one prediction.
    fn error<D: DualNum<f64> + Copy>(&self, pred: D, eps: &[D]) -> D;
}

/// Runs the full per-subject pipeline: parameters, covariates, predictions,
/// residual error.
///
/// `eps_rows` holds one epsilon row per record.
pub(crate) fn subject_outputs<M, C, D>(
    model: &M,
    covariates: &C,
    subject: &Subject,
    theta: &[f64],
    eta: &[D],
    eps_rows: &[Vec<D>],
) -> Result<Vec<D>>
where
    M: StructuralModel,
    C: CovariateModel,
    D: DualNum<f64> + Copy,
{
    if eps_rows.len() != subject.n_records() {
        return Err(Error::LengthMismatch {
            left: "records",
            left_len: subject.n_records(),
            right: "eps rows",
            right_len: eps_rows.len(),
        });
    }
    let mut params = model.parameters(theta, eta, &subject.covariates)?;
    covariates.derive(&mut params)?;
    let preds = model.predictions(subject, &params)?;
    if preds.len() != subject.n_records() {
        return Err(Error::LengthMismatch {
            left: "records",
            left_len: subject.n_records(),
            right: "predictions",
            right_len: preds.len(),
        });
    }
    Ok(preds
        .into_iter()
        .zip(eps_rows)
        .map(|(pred, eps)| model.error(pred, eps))
        .collect())
}
