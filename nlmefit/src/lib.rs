#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![doc = include_str!("../README.md")]
mod closed_form;
mod covariance;
mod covariate;
mod covstep;
mod data;
mod effects;
mod error;
mod fit;
mod linearize;
mod model;
mod objective;
mod ode;
mod simulate;
mod theta;

pub use closed_form::{one_compartment_absorption, one_compartment_infusion, superpose};
pub use covariance::{CovarianceMatrix, Omega, Sigma, matrix_to_packed, packed_to_matrix};
pub use covariate::{CovariateModel, NoCovariates};
pub use covstep::CovarianceOutput;
pub use data::{COLUMNS, Population, Record, Subject, SubjectBuilder, SubjectId};
pub use effects::{EffectsSnapshot, RandomEffectRegistry};
pub use error::{Error, Result};
pub use fit::{Evaluation, FitOptions, FitReport, FitStatus, FoceModel, SubjectEvaluation};
pub use linearize::{Linearization, linearize};
pub use model::{ParamMap, StructuralModel, require};
pub use objective::{conditional_loss, cwres, observation_covariance};
pub use ode::{LinearOdeSystem, OdeModel};
pub use simulate::{SimulationOutput, SubjectSimulation};
pub use theta::{THETA_INIT_UNCONSTRAINED, Theta, ThetaState};
