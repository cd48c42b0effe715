use nlmefit::{
    CovarianceMatrix, FitOptions, FoceModel, ParamMap, Population, Result, StructuralModel,
    Subject, Theta, one_compartment_absorption, require,
};
use num_dual::DualNum;
use std::collections::BTreeMap;

// One-compartment oral absorption with log-normal inter-subject
// variability on ka and combined residual error.
struct Absorption;

impl StructuralModel for Absorption {
    fn eta_dim(&self) -> usize {
        1
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
        p.insert("ke".into(), D::from(theta[1]));
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

fn main() -> Result<()> {
    env_logger::init();

    // synthetic profiles around ka 1.5, ke 0.1, v 30
    let times = [0.5, 1.0, 2.0, 4.0, 8.0, 12.0];
    let etas = [-0.25, -0.1, 0.05, 0.15, 0.3];
    let subjects = etas
        .iter()
        .enumerate()
        .map(|(i, eta)| {
            let ka = 1.5 * eta.exp();
            let mut builder = Subject::builder(i as u64 + 1).dose(0.0, 320.0, 0);
            for &t in &times {
                let c = one_compartment_absorption(t, 320.0, ka, 0.1, 30.0)?;
                builder = builder.observation(t, c);
            }
            Ok(builder.build())
        })
        .collect::<Result<Vec<_>>>()?;
    let population = Population::new(subjects)?;

    // bounded fixed effects and covariance blocks
    let mut model = FoceModel::new(
        Absorption,
        vec![
            Theta::with_bounds(0.0, 1.0, 10.0)?,
            Theta::with_bounds(0.0, 0.08, 1.0)?,
            Theta::with_bounds(0.0, 25.0, 100.0)?,
        ],
        CovarianceMatrix::new(&[vec![0.04]], &[true], &[true])?,
        CovarianceMatrix::new(&[vec![0.01, 0.01]], &[true], &[false])?,
    )?;

    let report = model.fit_population(&population, &FitOptions::default())?;
    println!("{report}");
    let theta = model.theta_values();
    println!("ka {:.4}  ke {:.4}  v {:.4}", theta[0], theta[1], theta[2]);

    // sandwich standard errors on the literal parameters
    model.descale();
    let cov = model.covariance_step(&population)?;
    println!("standard errors: {:.4}", cov.se.transpose());
    println!("correlation eigenvalues: {:.4}", cov.eigenvalues.transpose());
    model.scale();

    Ok(())
}
