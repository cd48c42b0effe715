use crate::{Error, Result, Subject};
use num_dual::DualNum;

/// Concentration after a single oral bolus in a one-compartment model.
#[cfg_attr(doc, katexit::katexit)]
/// $$
/// c(t) = \frac{d \, k_a}{V (k_a - k_e)} \left( e^{-k_e t} - e^{-k_a t} \right)
/// $$
/// for $t \ge 0$ since the dose, zero before it. Errors when $k_a = k_e$ or
/// any of $k_a$, $k_e$, $V$ is not strictly positive.
pub fn one_compartment_absorption<D: DualNum<f64> + Copy>(
    t: f64,
    dose: f64,
    ka: D,
    ke: D,
    v: D,
) -> Result<D> {
    check_positive("absorption model", &[("ka", ka.re()), ("ke", ke.re()), ("v", v.re())])?;
    if ka.re() == ke.re() {
        return Err(Error::NumericIndeterminate {
            what: "absorption model",
            context: format!(" with ka = ke = {}", ka.re()),
        });
    }
    if t < 0.0 {
        return Ok(D::from(0.0));
    }
    let decay = (-ke * t).exp() - (-ka * t).exp();
    Ok(ka * decay * dose / (v * (ka - ke)))
}

/// Concentration during and after a zero-order infusion into a
/// one-compartment model.
#[cfg_attr(doc, katexit::katexit)]
/// With duration $T = d / r$,
/// $$
/// c(t) = \frac{r}{V k_e} \left(1 - e^{-k_e t}\right) \quad (t \le T), \qquad
/// c(t) = c(T) \, e^{-k_e (t - T)} \quad (t > T),
/// $$
/// zero before the infusion starts. Errors when $k_e$, $V$, the amount or
/// the rate is not strictly positive.
pub fn one_compartment_infusion<D: DualNum<f64> + Copy>(
    t: f64,
    amt: f64,
    rate: f64,
    ke: D,
    v: D,
) -> Result<D> {
    check_positive("infusion model", &[("ke", ke.re()), ("v", v.re()), ("amt", amt), ("rate", rate)])?;
    if t < 0.0 {
        return Ok(D::from(0.0));
    }
    let duration = amt / rate;
    let plateau = ke.recip() * rate / v;
    if t <= duration {
        Ok(plateau * (-(-ke * t).exp() + 1.0))
    } else {
        let end = plateau * (-(-ke * duration).exp() + 1.0);
        Ok(end * (-ke * (t - duration)).exp())
    }
}

/// Predictions for every record of a subject under dose superposition.
///
/// Each dose row contributes from its own time on: bolus rows through
/// [one_compartment_absorption], infusion rows through
/// [one_compartment_infusion].
pub fn superpose<D: DualNum<f64> + Copy>(
    subject: &Subject,
    ka: D,
    ke: D,
    v: D,
) -> Result<Vec<D>> {
    subject
        .records
        .iter()
        .map(|record| {
            let mut c = D::from(0.0);
            for dose in subject.records.iter().filter(|r| r.amt > 0.0) {
                let dt = record.time - dose.time;
                c = c + if dose.rate > 0.0 {
                    one_compartment_infusion(dt, dose.amt, dose.rate, ke, v)?
                } else {
                    one_compartment_absorption(dt, dose.amt, ka, ke, v)?
                };
            }
            Ok(c)
        })
        .collect()
}

fn check_positive(what: &'static str, values: &[(&str, f64)]) -> Result<()> {
    for (name, value) in values {
        if !(*value > 0.0) || !value.is_finite() {
            return Err(Error::NumericIndeterminate {
                what,
                context: format!(" with {name} = {value}"),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use num_dual::Dual64;

    #[test]
    fn absorption_matches_hand_computation() -> Result<()> {
        // 320 * 1.5 / (30 * (1.5 - 0.1)) * (e^{-0.1} - e^{-1.5}) at t = 1
        let c = one_compartment_absorption(1.0, 320.0, 1.5, 0.1, 30.0)?;
        let expected = 320.0 * 1.5 / (30.0 * 1.4) * ((-0.1_f64).exp() - (-1.5_f64).exp());
        assert!((c - expected).abs() < 1e-12);
        Ok(())
    }

    #[test]
    fn absorption_is_zero_at_dose_time_and_before() -> Result<()> {
        assert_eq!(one_compartment_absorption(0.0, 320.0, 1.5, 0.1, 30.0)?, 0.0);
        assert_eq!(one_compartment_absorption(-2.0, 320.0, 1.5, 0.1, 30.0)?, 0.0);
        Ok(())
    }

    #[test]
    fn equal_rate_constants_are_rejected() {
        let r = one_compartment_absorption(1.0, 320.0, 0.5, 0.5, 30.0);
        assert!(matches!(r, Err(Error::NumericIndeterminate { .. })));
    }

    #[test]
    fn nonpositive_parameters_are_rejected() {
        assert!(one_compartment_absorption(1.0, 320.0, -1.5, 0.1, 30.0).is_err());
        assert!(one_compartment_absorption(1.0, 320.0, 1.5, 0.1, 0.0).is_err());
        assert!(one_compartment_infusion(1.0, 100.0, 0.0, 0.1, 30.0).is_err());
    }

    #[test]
    fn infusion_is_continuous_at_end_of_infusion() -> Result<()> {
        let amt = 100.0;
        let rate = 25.0;
        let duration: f64 = amt / rate;
        let before = one_compartment_infusion(duration - 1e-9, amt, rate, 0.2, 30.0)?;
        let after = one_compartment_infusion(duration + 1e-9, amt, rate, 0.2, 30.0)?;
        assert!((before - after).abs() < 1e-8);
        Ok(())
    }

    #[test]
    fn dual_derivative_matches_finite_difference() -> Result<()> {
        let f = |ka: f64| one_compartment_absorption(2.0, 320.0, ka, 0.1, 30.0);
        let h = 1e-6;
        let fd = (f(1.5 + h)? - f(1.5 - h)?) / (2.0 * h);
        let dual = one_compartment_absorption(
            2.0,
            320.0,
            Dual64::new(1.5, 1.0),
            Dual64::from_re(0.1),
            Dual64::from_re(30.0),
        )?;
        assert!((dual.eps - fd).abs() < 1e-6);
        Ok(())
    }

    #[test]
    fn superposition_accumulates_multiple_doses() -> Result<()> {
        let subject = Subject::builder(1)
            .dose(0.0, 100.0, 0)
            .dose(12.0, 100.0, 0)
            .observation(13.0, 0.0)
            .build();
        let preds = superpose(&subject, 1.5, 0.1, 30.0)?;
        let first = one_compartment_absorption(13.0, 100.0, 1.5, 0.1, 30.0)?;
        let second = one_compartment_absorption(1.0, 100.0, 1.5, 0.1, 30.0)?;
        // Records are sorted by time, the observation is last.
        assert!((preds[2] - (first + second)).abs() < 1e-12);
        Ok(())
    }
}
