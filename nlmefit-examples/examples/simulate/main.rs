use nlmefit::{
    CovarianceMatrix, FoceModel, ParamMap, Population, Result, StructuralModel, Subject, Theta,
    one_compartment_absorption, require,
};
use num_dual::DualNum;
use rand::SeedableRng;
use rand::rngs::StdRng;
use std::collections::BTreeMap;

struct Absorption;

impl StructuralModel for Absorption {
    fn eta_dim(&self) -> usize {
        1
    }
    fn eps_dim(&self) -> usize {
        1
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
        pred + eps[0]
    }
}

fn main() -> Result<()> {
    env_logger::init();

    let times = [0.5, 1.0, 2.0, 4.0, 8.0, 12.0];
    let mut builder = Subject::builder(1).dose(0.0, 320.0, 0);
    for &t in &times {
        builder = builder.observation(t, 0.0);
    }
    let population = Population::new(vec![builder.build()])?;

    let mut model = FoceModel::new(
        Absorption,
        vec![
            Theta::with_bounds(0.0, 1.5, 10.0)?,
            Theta::with_bounds(0.0, 0.1, 1.0)?,
            Theta::with_bounds(0.0, 30.0, 100.0)?,
        ],
        CovarianceMatrix::new(&[vec![0.09]], &[true], &[true])?,
        CovarianceMatrix::new(&[vec![0.25]], &[true], &[true])?,
    )?;

    // posterior-predictive style replicates at the initial estimates
    let mut rng = StdRng::seed_from_u64(17);
    let out = model.simulate(&population, 500, &mut rng)?;
    let subject = &out.subjects[0];

    println!("time    mean     p05      p95");
    for (i, t) in subject.times.iter().enumerate() {
        let mut values: Vec<f64> = subject.replicates.iter().map(|r| r[i]).collect();
        values.sort_by(f64::total_cmp);
        let mean = values.iter().sum::<f64>() / values.len() as f64;
        let p05 = values[values.len() / 20];
        let p95 = values[values.len() - 1 - values.len() / 20];
        println!("{t:5.1}  {mean:7.3}  {p05:7.3}  {p95:7.3}");
    }

    Ok(())
}
