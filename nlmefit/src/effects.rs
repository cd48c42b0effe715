use crate::{Error, Result, SubjectId};
use nalgebra::{DMatrix, DVector};
use std::collections::BTreeMap;

/// A point-in-time copy of every random effect, taken with
/// [RandomEffectRegistry::snapshot].
#[derive(Clone, Debug, PartialEq)]
pub struct EffectsSnapshot {
    etas: BTreeMap<SubjectId, DVector<f64>>,
    epss: BTreeMap<SubjectId, DMatrix<f64>>,
}

/// Per-subject random effects, created lazily and zero-initialized.
///
/// Etas are one vector per subject, epsilons one row per record. Entries come
/// into existence the first time a subject is touched, so a registry never
/// needs the population up front.
#[derive(Clone, Debug, PartialEq)]
pub struct RandomEffectRegistry {
    eta_dim: usize,
    eps_dim: usize,
    etas: BTreeMap<SubjectId, DVector<f64>>,
    epss: BTreeMap<SubjectId, DMatrix<f64>>,
}

impl RandomEffectRegistry {
    /// Creates an empty registry for the given effect dimensions.
    pub fn new(eta_dim: usize, eps_dim: usize) -> Self {
        Self {
            eta_dim,
            eps_dim,
            etas: BTreeMap::new(),
            epss: BTreeMap::new(),
        }
    }

    /// Eta dimension per subject.
    pub fn eta_dim(&self) -> usize {
        self.eta_dim
    }

    /// Epsilon dimension per record.
    pub fn eps_dim(&self) -> usize {
        self.eps_dim
    }

    /// The subject's eta vector, zero-initialized on first access.
    pub fn eta(&mut self, id: SubjectId) -> &DVector<f64> {
        self.etas
            .entry(id)
            .or_insert_with(|| DVector::zeros(self.eta_dim))
    }

    /// The subject's epsilon rows, zero-initialized on first access.
    pub fn eps(&mut self, id: SubjectId, n_records: usize) -> &DMatrix<f64> {
        self.epss
            .entry(id)
            .or_insert_with(|| DMatrix::zeros(n_records, self.eps_dim))
    }

    /// Replaces the subject's eta vector.
    pub fn set_eta(&mut self, id: SubjectId, eta: DVector<f64>) -> Result<()> {
        if eta.len() != self.eta_dim {
            return Err(Error::LengthMismatch {
                left: "eta",
                left_len: self.eta_dim,
                right: "replacement",
                right_len: eta.len(),
            });
        }
        self.etas.insert(id, eta);
        Ok(())
    }

    /// Replaces the subject's epsilon rows.
    pub fn set_eps(&mut self, id: SubjectId, eps: DMatrix<f64>) -> Result<()> {
        if eps.ncols() != self.eps_dim {
            return Err(Error::LengthMismatch {
                left: "eps columns",
                left_len: self.eps_dim,
                right: "replacement",
                right_len: eps.ncols(),
            });
        }
        self.epss.insert(id, eps);
        Ok(())
    }

    /// Zeroes every eta in place.
    pub fn reset_etas(&mut self) {
        for eta in self.etas.values_mut() {
            eta.fill(0.0);
        }
    }

    /// Zeroes every epsilon in place.
    pub fn reset_epss(&mut self) {
        for eps in self.epss.values_mut() {
            eps.fill(0.0);
        }
    }

    /// The subject's eta vector, if one exists.
    pub fn try_eta(&self, id: SubjectId) -> Option<&DVector<f64>> {
        self.etas.get(&id)
    }

    /// The subject's epsilon rows, if they exist.
    pub fn try_eps(&self, id: SubjectId) -> Option<&DMatrix<f64>> {
        self.epss.get(&id)
    }

    /// Copies all current effects for a later [RandomEffectRegistry::restore].
    pub fn snapshot(&self) -> EffectsSnapshot {
        EffectsSnapshot {
            etas: self.etas.clone(),
            epss: self.epss.clone(),
        }
    }

    /// Restores the effects captured by a snapshot.
    pub fn restore(&mut self, snapshot: EffectsSnapshot) {
        self.etas = snapshot.etas;
        self.epss = snapshot.epss;
    }

    /// Iterates over all known eta vectors.
    pub fn etas(&self) -> impl Iterator<Item = (&SubjectId, &DVector<f64>)> {
        self.etas.iter()
    }

    /// Iterates over all known epsilon matrices.
    pub fn epss(&self) -> impl Iterator<Item = (&SubjectId, &DMatrix<f64>)> {
        self.epss.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lazy_zero_initialization() {
        let mut reg = RandomEffectRegistry::new(3, 2);
        assert_eq!(reg.eta(7), &DVector::zeros(3));
        assert_eq!(reg.eps(7, 5), &DMatrix::zeros(5, 2));
        assert_eq!(reg.etas().count(), 1);
    }

    #[test]
    fn snapshot_restore_round_trip() -> Result<()> {
        let mut reg = RandomEffectRegistry::new(2, 1);
        reg.set_eta(1, DVector::from_vec(vec![0.3, -0.1]))?;
        reg.set_eps(1, DMatrix::from_element(4, 1, 0.05))?;
        let snap = reg.snapshot();
        reg.reset_etas();
        reg.reset_epss();
        assert_eq!(reg.eta(1), &DVector::zeros(2));
        reg.restore(snap);
        assert_eq!(reg.eta(1)[0], 0.3);
        assert_eq!(reg.eps(1, 4)[(2, 0)], 0.05);
        Ok(())
    }

    #[test]
    fn rejects_wrong_dimensions() {
        let mut reg = RandomEffectRegistry::new(2, 1);
        assert!(reg.set_eta(1, DVector::zeros(3)).is_err());
        assert!(reg.set_eps(1, DMatrix::zeros(4, 2)).is_err());
    }
}
