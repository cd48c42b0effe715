use crate::{ParamMap, Result};
use num_dual::DualNum;

/// A covariate relationship rewriting model parameters in place.
///
/// Covariate models compose with a structural model by type rather than by
/// wrapping it: [crate::FoceModel] is generic over its covariate model and
/// calls [CovariateModel::derive] on the parameter map after the structural
/// model has built it and before predictions are evaluated. Typical
/// implementations read base parameters and covariate values out of the map
/// and replace the parameters the structural model will consume.
///
/// The no-op default is [NoCovariates].
pub trait CovariateModel: Send + Sync {
    /// Rewrites the parameter map with covariate-derived parameters.
    fn derive<D: DualNum<f64> + Copy>(&self, params: &mut ParamMap<D>) -> Result<()>;
}

/// The identity covariate model.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoCovariates;

impl CovariateModel for NoCovariates {
    fn derive<D: DualNum<f64> + Copy>(&self, _params: &mut ParamMap<D>) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::require;

    struct AllometricClearance;

    impl CovariateModel for AllometricClearance {
        fn derive<D: DualNum<f64> + Copy>(&self, params: &mut ParamMap<D>) -> Result<()> {
            let cl = require(params, "cl")?;
            let wt = require(params, "wt")?;
            params.insert("cl".into(), cl * (wt * (1.0 / 70.0)).powf(0.75));
            Ok(())
        }
    }

    #[test]
    fn rewrites_parameters_in_place() -> Result<()> {
        let mut params = ParamMap::new();
        params.insert("cl".into(), 3.0_f64);
        params.insert("wt".into(), 70.0_f64);
        AllometricClearance.derive(&mut params)?;
        assert!((params["cl"] - 3.0).abs() < 1e-12);

        params.insert("cl".into(), 3.0);
        params.insert("wt".into(), 35.0);
        AllometricClearance.derive(&mut params)?;
        assert!((params["cl"] - 3.0 * 0.5_f64.powf(0.75)).abs() < 1e-12);
        Ok(())
    }

    #[test]
    fn identity_leaves_map_untouched() -> Result<()> {
        let mut params = ParamMap::new();
        params.insert("ka".into(), 1.5_f64);
        NoCovariates.derive(&mut params)?;
        assert_eq!(params.len(), 1);
        assert_eq!(params["ka"], 1.5);
        Ok(())
    }
}
