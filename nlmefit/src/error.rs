/// Main error type
#[derive(thiserror::Error, Debug, PartialEq)]
pub enum Error {
    /// Theta bounds are not ordered around the initial value.
    #[error("theta bounds must satisfy lower <= initial <= upper, got ({lower}, {initial}, {upper})")]
    ThetaBounds {
        /// Lower bound.
        lower: f64,
        /// Initial value.
        initial: f64,
        /// Upper bound.
        upper: f64,
    },
    /// Two collections that must pair up element-wise have different lengths.
    #[error("{left} has {left_len} entries but {right} has {right_len}")]
    LengthMismatch {
        /// Name of the first collection.
        left: &'static str,
        /// Length of the first collection.
        left_len: usize,
        /// Name of the second collection.
        right: &'static str,
        /// Length of the second collection.
        right_len: usize,
    },
    /// A packed lower-triangular vector has a length that fits no square matrix.
    #[error("lower-triangular vector {vector} of length {len} fits no square matrix")]
    TriangularLength {
        /// Vector name.
        vector: &'static str,
        /// Offending length.
        len: usize,
    },
    /// An initial covariance block is not positive definite.
    #[error("initial covariance block {block} is not positive definite")]
    NotPositiveDefinite {
        /// Index of the block within its covariance matrix.
        block: usize,
    },
    /// A dose row targets a compartment the model does not have.
    #[error("dose targets compartment {cmt} but the model has {n_compartments}")]
    CompartmentOutOfRange {
        /// Zero-based compartment index of the dose row.
        cmt: usize,
        /// Number of model compartments.
        n_compartments: usize,
    },
    /// A named parameter is absent from the parameter map.
    #[error("parameter {name} is missing from the parameter map")]
    MissingParameter {
        /// Parameter name.
        name: String,
    },
    /// An operation was called while the parameter scaling state does not permit it.
    #[error("{operation} requires {required} parameters but they are {actual}")]
    ScaleState {
        /// Operation that was refused.
        operation: &'static str,
        /// Required scaling state.
        required: &'static str,
        /// Actual scaling state.
        actual: &'static str,
    },
    /// A subject id is not present in the population.
    #[error("subject {id} is not in the population")]
    UnknownSubject {
        /// Subject identifier.
        id: u64,
    },
    /// A quantity became non-finite or a factorization broke down during evaluation.
    #[error("numeric breakdown in {what}{context}")]
    NumericIndeterminate {
        /// Quantity or factorization that failed.
        what: &'static str,
        /// Subject id, iteration or parameter values at the point of failure.
        context: String,
    },
    /// Reading or writing a checkpoint file failed.
    #[error("checkpoint failed: {0}")]
    Checkpoint(String),
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::Checkpoint(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Checkpoint(e.to_string())
    }
}

/// Main result type
pub type Result<T> = std::result::Result<T, Error>;
