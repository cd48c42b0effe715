use crate::{Error, Result};
use nalgebra::DVector;
use std::collections::BTreeMap;

/// Subject identifier within a [Population].
pub type SubjectId = u64;

/// Mandatory dataset columns, in canonical order.
pub const COLUMNS: [&str; 7] = ["ID", "TIME", "AMT", "RATE", "DV", "MDV", "CMT"];

/// One row of a subject's dose/observation history.
#[derive(Clone, Debug, PartialEq)]
pub struct Record {
    /// Time since the subject's first record.
    pub time: f64,
    /// Dose amount; zero for pure observation rows.
    pub amt: f64,
    /// Infusion rate; zero doses in as a bolus.
    pub rate: f64,
    /// Observed dependent value.
    pub dv: f64,
    /// Missing dependent value flag; `true` excludes the row from the
    /// objective.
    pub mdv: bool,
    /// Target compartment of the dose, zero-based.
    pub cmt: usize,
}

/// One subject's records and covariates.
#[derive(Clone, Debug, PartialEq)]
pub struct Subject {
    /// Subject identifier.
    pub id: SubjectId,
    /// Records in ascending time order.
    pub records: Vec<Record>,
    /// Subject-level covariates by name.
    pub covariates: BTreeMap<String, f64>,
}

impl Subject {
    /// Starts a builder for the given subject id.
    pub fn builder(id: SubjectId) -> SubjectBuilder {
        SubjectBuilder {
            id,
            records: Vec::new(),
            covariates: BTreeMap::new(),
        }
    }

    /// Number of records.
    pub fn n_records(&self) -> usize {
        self.records.len()
    }

    /// Number of observation records (mdv is unset).
    pub fn n_observations(&self) -> usize {
        self.records.iter().filter(|r| !r.mdv).count()
    }

    /// Record times.
    pub fn times(&self) -> Vec<f64> {
        self.records.iter().map(|r| r.time).collect()
    }

    /// Observation mask over records; `true` marks rows entering the
    /// objective.
    pub fn observation_mask(&self) -> Vec<bool> {
        self.records.iter().map(|r| !r.mdv).collect()
    }

    /// Observed dependent values of the masked rows.
    pub fn observations(&self) -> DVector<f64> {
        DVector::from_iterator(
            self.n_observations(),
            self.records.iter().filter(|r| !r.mdv).map(|r| r.dv),
        )
    }
}

/// Builder collecting a subject's rows before validation.
pub struct SubjectBuilder {
    id: SubjectId,
    records: Vec<Record>,
    covariates: BTreeMap<String, f64>,
}

impl SubjectBuilder {
    /// Adds a bolus dose row.
    pub fn dose(mut self, time: f64, amt: f64, cmt: usize) -> Self {
        self.records.push(Record {
            time,
            amt,
            rate: 0.0,
            dv: 0.0,
            mdv: true,
            cmt,
        });
        self
    }

    /// Adds a zero-order infusion row; duration is `amt / rate`.
    pub fn infusion(mut self, time: f64, amt: f64, rate: f64, cmt: usize) -> Self {
        self.records.push(Record {
            time,
            amt,
            rate,
            dv: 0.0,
            mdv: true,
            cmt,
        });
        self
    }

    /// Adds an observation row.
    pub fn observation(mut self, time: f64, dv: f64) -> Self {
        self.records.push(Record {
            time,
            amt: 0.0,
            rate: 0.0,
            dv,
            mdv: false,
            cmt: 0,
        });
        self
    }

    /// Adds a raw record, for rows the other methods do not cover.
    pub fn record(mut self, record: Record) -> Self {
        self.records.push(record);
        self
    }

    /// Sets a subject-level covariate.
    pub fn covariate(mut self, name: &str, value: f64) -> Self {
        self.covariates.insert(name.to_string(), value);
        self
    }

    /// Finishes the subject, sorting records by time.
    pub fn build(mut self) -> Subject {
        self.records
            .sort_by(|a, b| a.time.total_cmp(&b.time));
        Subject {
            id: self.id,
            records: self.records,
            covariates: self.covariates,
        }
    }
}

/// All subjects of a dataset, ordered by id.
#[derive(Clone, Debug, PartialEq)]
pub struct Population {
    subjects: Vec<Subject>,
}

impl Population {
    /// Creates a population; subjects are sorted by id and ids must be
    /// unique.
    pub fn new(mut subjects: Vec<Subject>) -> Result<Self> {
        subjects.sort_by_key(|s| s.id);
        let unique = subjects
            .windows(2)
            .all(|w| w[0].id != w[1].id);
        if !unique {
            return Err(Error::LengthMismatch {
                left: "subjects",
                left_len: subjects.len(),
                right: "unique ids",
                right_len: subjects
                    .iter()
                    .map(|s| s.id)
                    .collect::<std::collections::BTreeSet<_>>()
                    .len(),
            });
        }
        Ok(Self { subjects })
    }

    /// Number of subjects.
    pub fn len(&self) -> usize {
        self.subjects.len()
    }

    /// Whether the population holds no subjects.
    pub fn is_empty(&self) -> bool {
        self.subjects.is_empty()
    }

    /// Iterates over subjects in id order.
    pub fn iter(&self) -> impl Iterator<Item = &Subject> {
        self.subjects.iter()
    }

    /// Looks up a subject by id.
    pub fn get(&self, id: SubjectId) -> Option<&Subject> {
        self.subjects
            .binary_search_by_key(&id, |s| s.id)
            .ok()
            .map(|i| &self.subjects[i])
    }

    /// Total number of observation rows across all subjects.
    pub fn n_observations(&self) -> usize {
        self.subjects.iter().map(Subject::n_observations).sum()
    }

    /// Longest record list over all subjects.
    pub fn max_record_len(&self) -> usize {
        self.subjects.iter().map(Subject::n_records).max().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_sorts_and_masks() {
        let subject = Subject::builder(1)
            .observation(2.0, 5.1)
            .dose(0.0, 320.0, 0)
            .observation(1.0, 3.2)
            .covariate("WT", 70.0)
            .build();
        assert_eq!(subject.times(), vec![0.0, 1.0, 2.0]);
        assert_eq!(subject.observation_mask(), vec![false, true, true]);
        assert_eq!(subject.n_observations(), 2);
        assert_eq!(subject.observations(), DVector::from_vec(vec![3.2, 5.1]));
        assert_eq!(subject.covariates["WT"], 70.0);
    }

    #[test]
    fn population_sorts_and_rejects_duplicates() -> Result<()> {
        let pop = Population::new(vec![
            Subject::builder(2).observation(0.0, 1.0).build(),
            Subject::builder(1).observation(0.0, 1.0).build(),
        ])?;
        assert_eq!(pop.iter().map(|s| s.id).collect::<Vec<_>>(), vec![1, 2]);
        assert!(pop.get(2).is_some());
        assert!(pop.get(3).is_none());
        assert_eq!(pop.max_record_len(), 1);
        assert_eq!(pop.n_observations(), 2);

        let dup = Population::new(vec![
            Subject::builder(1).observation(0.0, 1.0).build(),
            Subject::builder(1).observation(0.0, 2.0).build(),
        ]);
        assert!(dup.is_err());
        Ok(())
    }
}
