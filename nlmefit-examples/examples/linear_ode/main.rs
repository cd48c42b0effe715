use nalgebra::DMatrix;
use nlmefit::{
    CovarianceMatrix, FitOptions, FoceModel, LinearOdeSystem, OdeModel, ParamMap, Population,
    Result, StructuralModel, Subject, Theta, require,
};
use num_dual::DualNum;
use std::collections::BTreeMap;

// Gut and central compartment, elimination from the central one.
struct GutCentral;

impl LinearOdeSystem for GutCentral {
    fn n_compartments(&self) -> usize {
        2
    }
    fn transition<D: DualNum<f64> + Copy>(&self, params: &ParamMap<D>) -> Result<DMatrix<D>> {
        let ka = require(params, "ka")?;
        let ke = require(params, "ke")?;
        let zero = D::from(0.0);
        Ok(DMatrix::from_row_slice(2, 2, &[-ka, zero, ka, -ke]))
    }
    fn output<D: DualNum<f64> + Copy>(&self, state: &[D], params: &ParamMap<D>) -> Result<D> {
        Ok(state[1] / require(params, "v")?)
    }
}

struct OdeAbsorption {
    ode: OdeModel<GutCentral>,
}

impl StructuralModel for OdeAbsorption {
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
        self.ode.predictions(subject, params)
    }
    fn error<D: DualNum<f64> + Copy>(&self, pred: D, eps: &[D]) -> D {
        pred + eps[0]
    }
}

fn main() -> Result<()> {
    env_logger::init();

    // an infusion over two hours followed by an oral dose at twelve hours
    let observations = [
        (1.0, 2.8),
        (2.0, 5.1),
        (4.0, 4.4),
        (8.0, 3.0),
        (12.5, 4.9),
        (16.0, 5.6),
        (24.0, 2.7),
    ];
    let mut builder = Subject::builder(1)
        .infusion(0.0, 200.0, 100.0, 1)
        .dose(12.0, 320.0, 0);
    for (t, dv) in observations {
        builder = builder.observation(t, dv);
    }
    let population = Population::new(vec![builder.build()])?;

    let model = OdeAbsorption {
        ode: OdeModel::new(GutCentral).with_max_step(0.05),
    };
    let mut model = FoceModel::new(
        model,
        vec![
            Theta::with_bounds(0.0, 1.0, 10.0)?,
            Theta::with_bounds(0.0, 0.1, 1.0)?,
            Theta::with_bounds(0.0, 30.0, 100.0)?,
        ],
        CovarianceMatrix::new(&[vec![0.04]], &[true], &[true])?,
        CovarianceMatrix::new(&[vec![0.04]], &[true], &[true])?,
    )?;

    let report = model.fit_population(&population, &FitOptions::default())?;
    println!("{report}");

    let evaluation = model.evaluate(&population)?;
    let subject = &evaluation.subjects[0];
    println!("time    prediction");
    for (t, pred) in subject.times.iter().zip(subject.predictions.iter()) {
        println!("{t:5.1}   {pred:8.4}");
    }

    Ok(())
}
