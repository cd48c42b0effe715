use crate::{Error, Result};

/// Default unconstrained coordinate assigned at construction.
///
/// The offset of the logistic map is chosen so that this coordinate reproduces
/// the initial value exactly.
pub const THETA_INIT_UNCONSTRAINED: f64 = 0.1;

/// Clamp applied to the unconstrained coordinate before the logistic map.
const UNCONSTRAINED_CLAMP: f64 = 10.0;

/// Fraction of the bound interval the initial value is kept away from either
/// bound when computing the logistic offset.
const BOUNDARY_MARGIN: f64 = 1e-9;

/// Scaling state of a [Theta].
///
/// A scaled theta carries its unconstrained optimizer coordinate. Descaling
/// freezes the bounded value and remembers the coordinate so a later
/// [Theta::scale] restores it exactly.
#[derive(Clone, Debug, PartialEq)]
pub enum ThetaState {
    /// Unconstrained optimizer coordinate.
    Scaled(f64),
    /// Literal bounded value, plus the coordinate it was frozen from.
    Descaled {
        /// Bounded parameter value.
        value: f64,
        /// Unconstrained coordinate saved at descale time.
        saved: f64,
    },
}

/// A fixed-effect parameter constrained to an open interval.
#[cfg_attr(doc, katexit::katexit)]
/// The optimizer works on an unconstrained coordinate $u$ which maps to the
/// bounded value through a shifted logistic,
/// $$
/// \theta(u) = l + (h - l) \, \frac{e^{u - \alpha}}{1 + e^{u - \alpha}},
/// $$
/// where the offset $\alpha$ is chosen once at construction so that
/// $\theta(0.1)$ equals the initial value. The coordinate is clamped to
/// $[-10, 10]$ before the map, which keeps every reachable value strictly
/// inside $(l, h)$ and every gradient finite.
#[derive(Clone, Debug, PartialEq)]
pub struct Theta {
    lower: f64,
    upper: f64,
    alpha: f64,
    fixed: bool,
    state: ThetaState,
}

impl Theta {
    /// Creates a theta with bounds `lower <= initial <= upper`.
    pub fn with_bounds(lower: f64, initial: f64, upper: f64) -> Result<Self> {
        if !(lower <= initial && initial <= upper) || !lower.is_finite() || !upper.is_finite() {
            return Err(Error::ThetaBounds {
                lower,
                initial,
                upper,
            });
        }
        let width = upper - lower;
        let q = ((initial - lower) / width).clamp(BOUNDARY_MARGIN, 1.0 - BOUNDARY_MARGIN);
        let alpha = THETA_INIT_UNCONSTRAINED - (q / (1.0 - q)).ln();
        Ok(Self {
            lower,
            upper,
            alpha,
            fixed: false,
            state: ThetaState::Scaled(THETA_INIT_UNCONSTRAINED),
        })
    }

    /// Creates a theta on the default interval `(0, 1e6)`, widened when the
    /// initial value falls outside it.
    pub fn new(initial: f64) -> Result<Self> {
        Self::with_bounds(initial.min(0.0), initial, initial.max(1e6))
    }

    /// Creates a theta starting at the midpoint of its bounds.
    pub fn new_bounded(lower: f64, upper: f64) -> Result<Self> {
        Self::with_bounds(lower, 0.5 * (lower + upper), upper)
    }

    /// Excludes this theta from optimization while keeping its current value.
    pub fn fix(mut self) -> Self {
        self.fixed = true;
        self
    }

    /// Whether this theta is excluded from optimization.
    pub fn is_fixed(&self) -> bool {
        self.fixed
    }

    /// Whether this theta is in the scaled (optimizer) state.
    pub fn is_scaled(&self) -> bool {
        matches!(self.state, ThetaState::Scaled(_))
    }

    /// Lower bound.
    pub fn lower(&self) -> f64 {
        self.lower
    }

    /// Upper bound.
    pub fn upper(&self) -> f64 {
        self.upper
    }

    /// Maps an unconstrained coordinate to the bounded interval.
    ///
    /// Pure function of the construction bounds; does not touch the stored
    /// state.
    pub fn value_of(&self, unconstrained: f64) -> f64 {
        let u = unconstrained.clamp(-UNCONSTRAINED_CLAMP, UNCONSTRAINED_CLAMP);
        let e = (u - self.alpha).exp();
        self.lower + (self.upper - self.lower) * e / (e + 1.0)
    }

    /// Current bounded value.
    pub fn value(&self) -> f64 {
        match self.state {
            ThetaState::Scaled(u) => self.value_of(u),
            ThetaState::Descaled { value, .. } => value,
        }
    }

    /// Current unconstrained coordinate.
    ///
    /// Errors when the theta is descaled; literal values have no optimizer
    /// coordinate.
    pub fn unconstrained(&self) -> Result<f64> {
        match self.state {
            ThetaState::Scaled(u) => Ok(u),
            ThetaState::Descaled { .. } => Err(Error::ScaleState {
                operation: "unconstrained",
                required: "scaled",
                actual: "descaled",
            }),
        }
    }

    /// Replaces the unconstrained coordinate.
    pub fn set_unconstrained(&mut self, unconstrained: f64) -> Result<()> {
        match self.state {
            ThetaState::Scaled(_) => {
                self.state = ThetaState::Scaled(unconstrained);
                Ok(())
            }
            ThetaState::Descaled { .. } => Err(Error::ScaleState {
                operation: "set_unconstrained",
                required: "scaled",
                actual: "descaled",
            }),
        }
    }

    /// Freezes the bounded value, leaving the scaled coordinate recoverable.
    ///
    /// Idempotent.
    pub fn descale(&mut self) {
        if let ThetaState::Scaled(u) = self.state {
            self.state = ThetaState::Descaled {
                value: self.value_of(u),
                saved: u,
            };
        }
    }

    /// Restores the unconstrained coordinate saved by the last [Theta::descale].
    ///
    /// Idempotent.
    pub fn scale(&mut self) {
        if let ThetaState::Descaled { saved, .. } = self.state {
            self.state = ThetaState::Scaled(saved);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initial_value_reproduced() -> Result<()> {
        let theta = Theta::with_bounds(0.0, 1.5, 10.0)?;
        assert!((theta.value() - 1.5).abs() < 1e-12);
        let theta = Theta::with_bounds(-5.0, -0.25, 3.0)?;
        assert!((theta.value() + 0.25).abs() < 1e-12);
        let theta = Theta::new(1.5)?;
        assert!((theta.value() - 1.5).abs() < 1e-9);
        let theta = Theta::new_bounded(2.0, 6.0)?;
        assert!((theta.value() - 4.0).abs() < 1e-12);
        Ok(())
    }

    #[test]
    fn values_stay_inside_open_interval() -> Result<()> {
        let theta = Theta::with_bounds(0.0, 1.5, 10.0)?;
        for u in [-1e9, -50.0, -10.0, 0.0, 0.1, 10.0, 50.0, 1e9] {
            let v = theta.value_of(u);
            assert!(v > 0.0 && v < 10.0, "value {v} escaped bounds at u = {u}");
        }
        Ok(())
    }

    #[test]
    fn map_is_monotone() -> Result<()> {
        let theta = Theta::with_bounds(0.0, 1.5, 10.0)?;
        let mut last = theta.value_of(-10.0);
        for i in 1..=200 {
            let v = theta.value_of(-10.0 + 0.1 * i as f64);
            assert!(v > last);
            last = v;
        }
        Ok(())
    }

    #[test]
    fn default_interval_widens_around_the_initial() -> Result<()> {
        let theta = Theta::new(-2.0)?;
        assert_eq!(theta.lower(), -2.0);
        assert!((theta.value() + 2.0).abs() < 1e-2);
        let theta = Theta::new(2e6)?;
        assert_eq!(theta.upper(), 2e6);
        assert!(theta.value() <= 2e6);
        Ok(())
    }

    #[test]
    fn initial_on_bound_stays_finite() -> Result<()> {
        let theta = Theta::with_bounds(0.0, 0.0, 10.0)?;
        assert!(theta.value().is_finite());
        assert!(theta.value() >= 0.0 && theta.value() < 1e-6);
        Ok(())
    }

    #[test]
    fn scale_round_trip_restores_coordinate() -> Result<()> {
        let mut theta = Theta::with_bounds(0.0, 1.5, 10.0)?;
        theta.set_unconstrained(0.73)?;
        let value = theta.value();
        theta.descale();
        assert!(!theta.is_scaled());
        assert_eq!(theta.value(), value);
        assert!(theta.unconstrained().is_err());
        theta.scale();
        assert_eq!(theta.unconstrained()?, 0.73);
        Ok(())
    }

    #[test]
    fn rejects_unordered_bounds() {
        assert_eq!(
            Theta::with_bounds(1.0, 0.5, 0.0),
            Err(Error::ThetaBounds {
                lower: 1.0,
                initial: 0.5,
                upper: 0.0
            })
        );
    }
}
