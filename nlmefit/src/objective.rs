use crate::{Error, Result, SubjectId};
use nalgebra::{DMatrix, DVector};

/// Appends a subject tag to a numeric breakdown error.
pub(crate) fn tag_subject(err: Error, id: SubjectId) -> Error {
    match err {
        Error::NumericIndeterminate { what, context } => Error::NumericIndeterminate {
            what,
            context: format!("{context} (subject {id})"),
        },
        other => other,
    }
}

/// Marginal covariance of the masked observations under the first-order
/// approximation.
#[cfg_attr(doc, katexit::katexit)]
/// $$
/// V = G \Omega G^t + \mathrm{diag}\!\left(H \Sigma H^t\right)
/// $$
/// with the eta Jacobian $G$ and the epsilon Jacobian $H$ both evaluated at
/// the current eta, which is what makes the approximation interact.
pub fn observation_covariance(
    g: &DMatrix<f64>,
    h: &DMatrix<f64>,
    omega: &DMatrix<f64>,
    sigma: &DMatrix<f64>,
) -> Result<DMatrix<f64>> {
    check_dims(g, h, omega, sigma)?;
    let mut v = g * omega * g.transpose();
    let residual = h * sigma * h.transpose();
    for i in 0..v.nrows() {
        v[(i, i)] += residual[(i, i)];
    }
    Ok(v)
}

/// One subject's contribution to the FOCE-I objective.
#[cfg_attr(doc, katexit::katexit)]
/// $$
/// \ell = \tfrac{1}{2} \ln |V|
///     + \tfrac{1}{2} (y - \hat{y})^t V^{-1} (y - \hat{y})
///     + \tfrac{1}{2} \hat{\eta}^t \Omega^{-1} \hat{\eta}
/// $$
/// over the masked records only. Subjects without observations contribute
/// the eta term alone.
pub fn conditional_loss(
    observations: &DVector<f64>,
    predictions: &DVector<f64>,
    g: &DMatrix<f64>,
    h: &DMatrix<f64>,
    eta: &DVector<f64>,
    omega: &DMatrix<f64>,
    sigma: &DMatrix<f64>,
) -> Result<f64> {
    if observations.len() != predictions.len() {
        return Err(Error::LengthMismatch {
            left: "observations",
            left_len: observations.len(),
            right: "predictions",
            right_len: predictions.len(),
        });
    }
    let mut loss = 0.0;
    if !observations.is_empty() {
        let v = observation_covariance(g, h, omega, sigma)?;
        let chol = v.cholesky().ok_or(Error::NumericIndeterminate {
            what: "observation covariance factorization",
            context: String::new(),
        })?;
        let logdet: f64 = chol.l().diagonal().iter().map(|d| d.ln()).sum::<f64>() * 2.0;
        let residual = observations - predictions;
        let quad = residual.dot(&chol.solve(&residual));
        loss += 0.5 * (logdet + quad);
    }
    if !eta.is_empty() {
        let chol = omega.clone().cholesky().ok_or(Error::NumericIndeterminate {
            what: "omega factorization",
            context: String::new(),
        })?;
        loss += 0.5 * eta.dot(&chol.solve(eta));
    }
    if loss.is_finite() {
        Ok(loss)
    } else {
        Err(Error::NumericIndeterminate {
            what: "objective value",
            context: String::new(),
        })
    }
}

/// Conditional weighted residuals of the masked records.
#[cfg_attr(doc, katexit::katexit)]
/// $$
/// \mathrm{CWRES} = L^{-1} \left( y - \hat{y} + G \hat{\eta} \right),
/// \qquad V = L L^t,
/// $$
/// the population-level residual whitened by the Cholesky factor of $V$.
pub fn cwres(
    observations: &DVector<f64>,
    predictions: &DVector<f64>,
    g: &DMatrix<f64>,
    h: &DMatrix<f64>,
    eta: &DVector<f64>,
    omega: &DMatrix<f64>,
    sigma: &DMatrix<f64>,
) -> Result<DVector<f64>> {
    if observations.is_empty() {
        return Ok(DVector::zeros(0));
    }
    let v = observation_covariance(g, h, omega, sigma)?;
    let chol = v.cholesky().ok_or(Error::NumericIndeterminate {
        what: "observation covariance factorization",
        context: String::new(),
    })?;
    let shifted = observations - predictions + g * eta;
    chol.l()
        .solve_lower_triangular(&shifted)
        .ok_or(Error::NumericIndeterminate {
            what: "residual whitening",
            context: String::new(),
        })
}

fn check_dims(
    g: &DMatrix<f64>,
    h: &DMatrix<f64>,
    omega: &DMatrix<f64>,
    sigma: &DMatrix<f64>,
) -> Result<()> {
    if g.ncols() != omega.nrows() {
        return Err(Error::LengthMismatch {
            left: "eta jacobian columns",
            left_len: g.ncols(),
            right: "omega",
            right_len: omega.nrows(),
        });
    }
    if h.ncols() != sigma.nrows() {
        return Err(Error::LengthMismatch {
            left: "eps jacobian columns",
            left_len: h.ncols(),
            right: "sigma",
            right_len: sigma.nrows(),
        });
    }
    if g.nrows() != h.nrows() {
        return Err(Error::LengthMismatch {
            left: "eta jacobian rows",
            left_len: g.nrows(),
            right: "eps jacobian rows",
            right_len: h.nrows(),
        });
    }
    Ok(())
}
