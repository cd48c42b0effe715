use crate::covariate::CovariateModel;
use crate::model::{StructuralModel, subject_outputs};
use crate::{Result, Subject};
use nalgebra::{DMatrix, DVector};
use num_dual::Dual64;

/// First-order linearization of a subject's outputs around the current
/// random effects.
#[derive(Clone, Debug, PartialEq)]
pub struct Linearization {
    /// Outputs at the expansion point, one per record.
    pub predictions: DVector<f64>,
    /// Jacobian of the outputs with respect to the etas, records by rows.
    pub g: DMatrix<f64>,
    /// Jacobian of the outputs with respect to the record's own epsilons.
    pub h: DMatrix<f64>,
}

impl Linearization {
    /// Keeps only the rows whose mask entry is set.
    pub fn masked(&self, mask: &[bool]) -> Linearization {
        let rows: Vec<usize> = mask
            .iter()
            .enumerate()
            .filter_map(|(i, &m)| m.then_some(i))
            .collect();
        Linearization {
            predictions: DVector::from_iterator(
                rows.len(),
                rows.iter().map(|&i| self.predictions[i]),
            ),
            g: self.g.select_rows(rows.iter()),
            h: self.h.select_rows(rows.iter()),
        }
    }
}

fn lift_rows(eps: &DMatrix<f64>) -> Vec<Vec<Dual64>> {
    (0..eps.nrows())
        .map(|i| (0..eps.ncols()).map(|j| Dual64::from_re(eps[(i, j)])).collect())
        .collect()
}

/// Evaluates a subject's outputs and their eta and epsilon Jacobians.
///
/// One forward dual pass per random-effect component: pass `j` seeds the
/// dual part of component `j` with one and reads off column `j` of the
/// Jacobian. Interaction comes for free since every pass runs at the current
/// eta and epsilon values.
pub fn linearize<M, C>(
    model: &M,
    covariates: &C,
    subject: &Subject,
    theta: &[f64],
    eta: &DVector<f64>,
    eps: &DMatrix<f64>,
) -> Result<Linearization>
where
    M: StructuralModel,
    C: CovariateModel,
{
    let n = subject.n_records();
    let p = model.eta_dim();
    let q = model.eps_dim();

    let eps_plain: Vec<Vec<f64>> = (0..n)
        .map(|i| (0..q).map(|j| eps[(i, j)]).collect())
        .collect();
    let values = subject_outputs(model, covariates, subject, theta, eta.as_slice(), &eps_plain)?;
    let predictions = DVector::from_vec(values);

    let mut g = DMatrix::zeros(n, p);
    for j in 0..p {
        let eta_dual: Vec<Dual64> = eta
            .iter()
            .enumerate()
            .map(|(k, &v)| Dual64::new(v, if k == j { 1.0 } else { 0.0 }))
            .collect();
        let eps_dual = lift_rows(eps);
        let outputs = subject_outputs(model, covariates, subject, theta, &eta_dual, &eps_dual)?;
        for (i, y) in outputs.iter().enumerate() {
            g[(i, j)] = y.eps;
        }
    }

    let mut h = DMatrix::zeros(n, q);
    for j in 0..q {
        let eta_dual: Vec<Dual64> = eta.iter().map(|&v| Dual64::from_re(v)).collect();
        let mut eps_dual = lift_rows(eps);
        for row in &mut eps_dual {
            row[j].eps = 1.0;
        }
        let outputs = subject_outputs(model, covariates, subject, theta, &eta_dual, &eps_dual)?;
        for (i, y) in outputs.iter().enumerate() {
            h[(i, j)] = y.eps;
        }
    }

    Ok(Linearization { predictions, g, h })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::covariate::NoCovariates;
    use crate::{ParamMap, one_compartment_absorption, require};
    use num_dual::DualNum;
    use std::collections::BTreeMap;

    struct Absorption;

    impl StructuralModel for Absorption {
        fn eta_dim(&self) -> usize {
            2
        }
        fn eps_dim(&self) -> usize {
            2
        }
        fn parameters<D: DualNum<f64> + Copy>(
            &self,
            theta: &[f64],
            eta: &[D],
            _covariates: &BTreeMap<String, f64>,
        ) -> Result<ParamMap<D>> {
            let mut p = ParamMap::new();
            p.insert("ka".into(), eta[0].exp() * theta[0]);
            p.insert("ke".into(), eta[1].exp() * theta[1]);
            p.insert("v".into(), D::from(theta[2]));
            Ok(p)
        }
        fn predictions<D: DualNum<f64> + Copy>(
            &self,
            subject: &Subject,
            params: &ParamMap<D>,
        ) -> Result<Vec<D>> {
            let ka = require(params, "ka")?;
            let ke = require(params, "ke")?;
            let v = require(params, "v")?;
            subject
                .records
                .iter()
                .map(|r| one_compartment_absorption(r.time, 320.0, ka, ke, v))
                .collect()
        }
        fn error<D: DualNum<f64> + Copy>(&self, pred: D, eps: &[D]) -> D {
            pred + pred * eps[0] + eps[1]
        }
    }

    /// `y_i = a_i + B[i] . eta`, one row of `B` per record.
    const B: [[f64; 2]; 3] = [[1.0, 2.0], [3.0, -1.0], [0.5, 4.0]];

    struct Affine;

    impl StructuralModel for Affine {
        fn eta_dim(&self) -> usize {
            2
        }
        fn eps_dim(&self) -> usize {
            1
        }
        fn parameters<D: DualNum<f64> + Copy>(
            &self,
            _theta: &[f64],
            eta: &[D],
            _covariates: &BTreeMap<String, f64>,
        ) -> Result<ParamMap<D>> {
            let mut p = ParamMap::new();
            p.insert("e0".into(), eta[0]);
            p.insert("e1".into(), eta[1]);
            Ok(p)
        }
        fn predictions<D: DualNum<f64> + Copy>(
            &self,
            subject: &Subject,
            params: &ParamMap<D>,
        ) -> Result<Vec<D>> {
            let e0 = require(params, "e0")?;
            let e1 = require(params, "e1")?;
            subject
                .records
                .iter()
                .enumerate()
                .map(|(i, _)| Ok(e0 * B[i][0] + e1 * B[i][1] + (1.0 + i as f64)))
                .collect()
        }
        fn error<D: DualNum<f64> + Copy>(&self, pred: D, eps: &[D]) -> D {
            pred + eps[0]
        }
    }

    fn subject() -> Subject {
        Subject::builder(1)
            .dose(0.0, 320.0, 0)
            .observation(1.0, 7.0)
            .observation(4.0, 8.5)
            .build()
    }

    #[test]
    fn jacobians_match_finite_differences() -> Result<()> {
        let subject = subject();
        let theta = [1.5, 0.1, 30.0];
        let eta = DVector::from_vec(vec![0.2, -0.1]);
        let eps = DMatrix::from_row_slice(3, 2, &[0.0, 0.0, 0.03, -0.1, -0.02, 0.2]);
        let lin = linearize(&Absorption, &NoCovariates, &subject, &theta, &eta, &eps)?;

        let h = 1e-6;
        let value = |eta: &DVector<f64>, eps: &DMatrix<f64>, i: usize| -> Result<f64> {
            let rows: Vec<Vec<f64>> = (0..3).map(|r| vec![eps[(r, 0)], eps[(r, 1)]]).collect();
            Ok(subject_outputs(
                &Absorption,
                &NoCovariates,
                &subject,
                &theta,
                eta.as_slice(),
                &rows,
            )?[i])
        };

        for j in 0..2 {
            for i in 0..3 {
                let mut up = eta.clone();
                up[j] += h;
                let mut dn = eta.clone();
                dn[j] -= h;
                let fd = (value(&up, &eps, i)? - value(&dn, &eps, i)?) / (2.0 * h);
                assert!((lin.g[(i, j)] - fd).abs() < 1e-6, "g[{i},{j}]");
            }
        }
        for j in 0..2 {
            for i in 0..3 {
                let mut up = eps.clone();
                up[(i, j)] += h;
                let mut dn = eps.clone();
                dn[(i, j)] -= h;
                let fd = (value(&eta, &up, i)? - value(&eta, &dn, i)?) / (2.0 * h);
                assert!((lin.h[(i, j)] - fd).abs() < 1e-6, "h[{i},{j}]");
            }
        }
        Ok(())
    }

    #[test]
    fn affine_model_jacobian_equals_its_coefficients() -> Result<()> {
        let subject = Subject::builder(1)
            .observation(0.0, 1.0)
            .observation(1.0, 2.0)
            .observation(2.0, 3.0)
            .build();
        let eta = DVector::from_vec(vec![0.3, -0.7]);
        let lin = linearize(&Affine, &NoCovariates, &subject, &[], &eta, &DMatrix::zeros(3, 1))?;
        // Forward duals carry the coefficients through exactly, no
        // tolerance needed.
        for i in 0..3 {
            for j in 0..2 {
                assert_eq!(lin.g[(i, j)], B[i][j]);
            }
        }
        for i in 0..3 {
            assert_eq!(lin.h[(i, 0)], 1.0);
        }
        Ok(())
    }

    #[test]
    fn interaction_jacobian_depends_on_eta() -> Result<()> {
        let subject = subject();
        let theta = [1.5, 0.1, 30.0];
        let eps = DMatrix::zeros(3, 2);
        let at_zero = linearize(
            &Absorption,
            &NoCovariates,
            &subject,
            &theta,
            &DVector::zeros(2),
            &eps,
        )?;
        let at_shift = linearize(
            &Absorption,
            &NoCovariates,
            &subject,
            &theta,
            &DVector::from_vec(vec![0.5, 0.0]),
            &eps,
        )?;
        // The proportional-error slope follows the prediction, which moves
        // with eta.
        assert!((at_zero.h[(1, 0)] - at_zero.predictions[1]).abs() < 1e-12);
        assert!((at_shift.h[(1, 0)] - at_shift.predictions[1]).abs() < 1e-12);
        assert!((at_zero.h[(1, 0)] - at_shift.h[(1, 0)]).abs() > 1e-6);
        Ok(())
    }

    #[test]
    fn masking_drops_dose_rows() -> Result<()> {
        let subject = subject();
        let theta = [1.5, 0.1, 30.0];
        let lin = linearize(
            &Absorption,
            &NoCovariates,
            &subject,
            &theta,
            &DVector::zeros(2),
            &DMatrix::zeros(3, 2),
        )?;
        let masked = lin.masked(&subject.observation_mask());
        assert_eq!(masked.predictions.len(), 2);
        assert_eq!(masked.g.nrows(), 2);
        assert_eq!(masked.predictions[0], lin.predictions[1]);
        Ok(())
    }
}
