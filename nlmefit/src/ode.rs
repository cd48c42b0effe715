use crate::{Error, ParamMap, Result, Subject};
use nalgebra::DMatrix;
use num_dual::DualNum;

/// A linear compartment system `dx/dt = A x + inflow`.
///
/// The transition matrix is rebuilt from the parameter map on every
/// evaluation, so parameter updates always propagate into the dynamics.
pub trait LinearOdeSystem: Send + Sync {
    /// Number of compartments.
    fn n_compartments(&self) -> usize;

    /// Transition matrix `A` for the current parameters.
    fn transition<D: DualNum<f64> + Copy>(&self, params: &ParamMap<D>) -> Result<DMatrix<D>>;

    /// Observable output for a compartment state.
    fn output<D: DualNum<f64> + Copy>(&self, state: &[D], params: &ParamMap<D>) -> Result<D>;
}

/// Fixed-step fourth-order Runge-Kutta integrator over a [LinearOdeSystem].
///
/// Doses are handled as events: bolus rows add to their compartment
/// instantaneously, infusion rows switch a constant inflow on for
/// `amt / rate` time units. Integration intervals are split at infusion end
/// times so the inflow is constant within every step.
#[derive(Clone, Debug)]
pub struct OdeModel<S> {
    system: S,
    max_step: f64,
}

impl<S: LinearOdeSystem> OdeModel<S> {
    /// Wraps a system with the default maximum step width of 0.05 time
    /// units.
    pub fn new(system: S) -> Self {
        Self {
            system,
            max_step: 0.05,
        }
    }

    /// Overrides the maximum integration step width.
    pub fn with_max_step(mut self, max_step: f64) -> Self {
        self.max_step = max_step;
        self
    }

    /// The wrapped system.
    pub fn system(&self) -> &S {
        &self.system
    }

    /// Integrates through the subject's records and returns one output per
    /// record.
    pub fn predictions<D: DualNum<f64> + Copy>(
        &self,
        subject: &Subject,
        params: &ParamMap<D>,
    ) -> Result<Vec<D>> {
        let n = self.system.n_compartments();
        let a = self.system.transition(params)?;
        if a.nrows() != n || a.ncols() != n {
            return Err(Error::LengthMismatch {
                left: "compartments",
                left_len: n,
                right: "transition matrix rows",
                right_len: a.nrows(),
            });
        }
        let mut state = vec![D::from(0.0); n];
        let mut infusions: Vec<Infusion> = Vec::new();
        let mut t = subject.records.first().map_or(0.0, |r| r.time);
        let mut out = Vec::with_capacity(subject.n_records());
        for record in &subject.records {
            self.advance(&a, &mut state, &mut infusions, t, record.time)?;
            t = record.time;
            if record.amt > 0.0 {
                if record.cmt >= n {
                    return Err(Error::CompartmentOutOfRange {
                        cmt: record.cmt,
                        n_compartments: n,
                    });
                }
                if record.rate > 0.0 {
                    infusions.push(Infusion {
                        end: t + record.amt / record.rate,
                        cmt: record.cmt,
                        rate: record.rate,
                    });
                } else {
                    state[record.cmt] = state[record.cmt] + record.amt;
                }
            }
            let y = self.system.output(&state, params)?;
            if !y.re().is_finite() {
                return Err(Error::NumericIndeterminate {
                    what: "ode output",
                    context: format!(" at t = {t}"),
                });
            }
            out.push(y);
        }
        Ok(out)
    }

    /// Integrates from `t0` to `t1`, splitting at infusion end times.
    fn advance<D: DualNum<f64> + Copy>(
        &self,
        a: &DMatrix<D>,
        state: &mut Vec<D>,
        infusions: &mut Vec<Infusion>,
        t0: f64,
        t1: f64,
    ) -> Result<()> {
        let mut t = t0;
        while t < t1 {
            let stop = infusions
                .iter()
                .map(|i| i.end)
                .filter(|&end| end > t && end < t1)
                .fold(t1, f64::min);
            let inflow = inflow_at(infusions, t, self.system.n_compartments());
            let steps = ((stop - t) / self.max_step).ceil().max(1.0) as usize;
            let h = (stop - t) / steps as f64;
            for _ in 0..steps {
                rk4_step(a, state, &inflow, h);
            }
            t = stop;
            infusions.retain(|i| i.end > t);
        }
        Ok(())
    }
}

#[derive(Clone, Debug)]
struct Infusion {
    end: f64,
    cmt: usize,
    rate: f64,
}

fn inflow_at(infusions: &[Infusion], t: f64, n: usize) -> Vec<f64> {
    let mut inflow = vec![0.0; n];
    for infusion in infusions.iter().filter(|i| i.end > t) {
        inflow[infusion.cmt] += infusion.rate;
    }
    inflow
}

fn derivative<D: DualNum<f64> + Copy>(a: &DMatrix<D>, state: &[D], inflow: &[f64]) -> Vec<D> {
    (0..state.len())
        .map(|i| {
            let mut dx = D::from(inflow[i]);
            for (j, &x) in state.iter().enumerate() {
                dx = dx + a[(i, j)] * x;
            }
            dx
        })
        .collect()
}

fn rk4_step<D: DualNum<f64> + Copy>(a: &DMatrix<D>, state: &mut [D], inflow: &[f64], h: f64) {
    let shifted = |base: &[D], k: &[D], c: f64| -> Vec<D> {
        base.iter()
            .zip(k)
            .map(|(&x, &dx)| x + dx * (h * c))
            .collect()
    };
    let k1 = derivative(a, state, inflow);
    let k2 = derivative(a, &shifted(state, &k1, 0.5), inflow);
    let k3 = derivative(a, &shifted(state, &k2, 0.5), inflow);
    let k4 = derivative(a, &shifted(state, &k3, 1.0), inflow);
    for i in 0..state.len() {
        state[i] =
            state[i] + (k1[i] + k2[i] * 2.0 + k3[i] * 2.0 + k4[i]) * (h / 6.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{one_compartment_absorption, one_compartment_infusion, require};

    struct GutCentral;

    impl LinearOdeSystem for GutCentral {
        fn n_compartments(&self) -> usize {
            2
        }
        fn transition<D: DualNum<f64> + Copy>(
            &self,
            params: &ParamMap<D>,
        ) -> Result<DMatrix<D>> {
            let ka = require(params, "ka")?;
            let ke = require(params, "ke")?;
            let zero = D::from(0.0);
            Ok(DMatrix::from_row_slice(2, 2, &[-ka, zero, ka, -ke]))
        }
        fn output<D: DualNum<f64> + Copy>(&self, state: &[D], params: &ParamMap<D>) -> Result<D> {
            Ok(state[1] / require(params, "v")?)
        }
    }

    struct Central;

    impl LinearOdeSystem for Central {
        fn n_compartments(&self) -> usize {
            1
        }
        fn transition<D: DualNum<f64> + Copy>(
            &self,
            params: &ParamMap<D>,
        ) -> Result<DMatrix<D>> {
            let ke = require(params, "ke")?;
            Ok(DMatrix::from_row_slice(1, 1, &[-ke]))
        }
        fn output<D: DualNum<f64> + Copy>(&self, state: &[D], params: &ParamMap<D>) -> Result<D> {
            Ok(state[0] / require(params, "v")?)
        }
    }

    fn params(entries: &[(&str, f64)]) -> ParamMap<f64> {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), *v))
            .collect()
    }

    #[test]
    fn bolus_matches_closed_form() -> Result<()> {
        let subject = Subject::builder(1)
            .dose(0.0, 320.0, 0)
            .observation(0.5, 0.0)
            .observation(1.0, 0.0)
            .observation(4.0, 0.0)
            .observation(12.0, 0.0)
            .build();
        let model = OdeModel::new(GutCentral);
        let p = params(&[("ka", 1.5), ("ke", 0.1), ("v", 30.0)]);
        let preds = model.predictions(&subject, &p)?;
        for (record, pred) in subject.records.iter().zip(&preds).skip(1) {
            let exact = one_compartment_absorption(record.time, 320.0, 1.5, 0.1, 30.0)?;
            assert!(
                (pred - exact).abs() < 1e-5,
                "t = {}: {} vs {}",
                record.time,
                pred,
                exact
            );
        }
        Ok(())
    }

    #[test]
    fn infusion_matches_closed_form() -> Result<()> {
        let subject = Subject::builder(1)
            .infusion(0.0, 100.0, 25.0, 0)
            .observation(2.0, 0.0)
            .observation(4.0, 0.0)
            .observation(10.0, 0.0)
            .build();
        let model = OdeModel::new(Central);
        let p = params(&[("ke", 0.2), ("v", 30.0)]);
        let preds = model.predictions(&subject, &p)?;
        for (record, pred) in subject.records.iter().zip(&preds).skip(1) {
            let exact = one_compartment_infusion(record.time, 100.0, 25.0, 0.2, 30.0)?;
            assert!(
                (pred - exact).abs() < 1e-5,
                "t = {}: {} vs {}",
                record.time,
                pred,
                exact
            );
        }
        Ok(())
    }

    #[test]
    fn dose_into_unknown_compartment_is_rejected() {
        let subject = Subject::builder(1)
            .dose(0.0, 320.0, 5)
            .observation(1.0, 0.0)
            .build();
        let model = OdeModel::new(GutCentral);
        let p = params(&[("ka", 1.5), ("ke", 0.1), ("v", 30.0)]);
        assert_eq!(
            model.predictions(&subject, &p),
            Err(Error::CompartmentOutOfRange {
                cmt: 5,
                n_compartments: 2
            })
        );
    }

    #[test]
    fn dual_sensitivity_matches_finite_difference() -> Result<()> {
        use num_dual::Dual64;
        let subject = Subject::builder(1)
            .dose(0.0, 320.0, 0)
            .observation(3.0, 0.0)
            .build();
        let model = OdeModel::new(GutCentral);
        let at = |ke: f64| {
            let p = params(&[("ka", 1.5), ("ke", ke), ("v", 30.0)]);
            model.predictions(&subject, &p).map(|v| v[1])
        };
        let h = 1e-6;
        let fd = (at(0.1 + h)? - at(0.1 - h)?) / (2.0 * h);
        let p: ParamMap<Dual64> = [
            ("ka".to_string(), Dual64::from_re(1.5)),
            ("ke".to_string(), Dual64::new(0.1, 1.0)),
            ("v".to_string(), Dual64::from_re(30.0)),
        ]
        .into_iter()
        .collect();
        let dual = model.predictions(&subject, &p)?[1];
        assert!((dual.eps - fd).abs() < 1e-6);
        Ok(())
    }
}
