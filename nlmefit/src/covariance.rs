use crate::{Error, Result};
use nalgebra::{DMatrix, DVector};

/// Clamp applied to every scaled covariance coordinate before the forward
/// transform.
const OPT_CLAMP: f64 = 3.0;

/// Default scaled coordinate magnitude assigned at construction.
const COV_INIT_COORD: f64 = 0.1;

/// Returns the matrix dimension packed into a lower-triangular vector of the
/// given length.
pub(crate) fn tri_dim(len: usize, vector: &'static str) -> Result<usize> {
    let mut dim = 0;
    let mut total = 0;
    while total < len {
        dim += 1;
        total = dim * (dim + 1) / 2;
    }
    if total == len {
        Ok(dim)
    } else {
        Err(Error::TriangularLength { vector, len })
    }
}

/// Builds a symmetric matrix from packed entries.
///
/// Packed order is row-major over the lower triangle; for `diagonal` vectors
/// the entries are the diagonal itself. Errors when the length fits no
/// square matrix. Inverse of [matrix_to_packed].
pub fn packed_to_matrix(entries: &[f64], diagonal: bool) -> Result<DMatrix<f64>> {
    let dim = if diagonal {
        entries.len()
    } else {
        tri_dim(entries.len(), "packed entries")?
    };
    Ok(sym_from_packed(entries, dim, diagonal))
}

/// Packs a symmetric matrix into its lower-triangular (or diagonal) entries.
///
/// Inverse of [packed_to_matrix].
pub fn matrix_to_packed(m: &DMatrix<f64>, diagonal: bool) -> DVector<f64> {
    packed_from_sym(m, diagonal)
}

fn sym_from_packed(entries: &[f64], dim: usize, diagonal: bool) -> DMatrix<f64> {
    let mut m = DMatrix::zeros(dim, dim);
    if diagonal {
        for (i, &v) in entries.iter().enumerate() {
            m[(i, i)] = v;
        }
    } else {
        let mut idx = 0;
        for i in 0..dim {
            for j in 0..=i {
                m[(i, j)] = entries[idx];
                m[(j, i)] = entries[idx];
                idx += 1;
            }
        }
    }
    m
}

fn packed_from_sym(m: &DMatrix<f64>, diagonal: bool) -> DVector<f64> {
    let dim = m.nrows();
    if diagonal {
        DVector::from_iterator(dim, (0..dim).map(|i| m[(i, i)]))
    } else {
        let mut out = Vec::with_capacity(dim * (dim + 1) / 2);
        for i in 0..dim {
            for j in 0..=i {
                out.push(m[(i, j)]);
            }
        }
        DVector::from_vec(out)
    }
}

/// One variance block with its fixed scale factors and current coordinates.
#[derive(Clone, Debug, PartialEq)]
struct Block {
    dim: usize,
    diagonal: bool,
    trainable: bool,
    /// Lower-triangular scale factors, computed once from the initial block.
    scale: DMatrix<f64>,
    /// Scaled coordinates, or literal packed entries when descaled.
    vector: DVector<f64>,
}

impl Block {
    fn new(init: &[f64], diagonal: bool, trainable: bool, index: usize) -> Result<Self> {
        let dim = if diagonal {
            init.len()
        } else {
            tri_dim(init.len(), "covariance block")?
        };
        let init_mat = sym_from_packed(init, dim, diagonal);
        let chol = init_mat
            .clone()
            .cholesky()
            .ok_or(Error::NotPositiveDefinite { block: index })?;
        let l = chol.l();
        let mut scale = DMatrix::zeros(dim, dim);
        let mut vector = Vec::with_capacity(init.len());
        for i in 0..dim {
            for j in 0..=i {
                if i == j {
                    scale[(i, i)] = l[(i, i)] * (-COV_INIT_COORD).exp();
                } else {
                    scale[(i, j)] = 10.0 * l[(i, j)].abs();
                }
                if !diagonal || i == j {
                    // Signed coordinates so the forward transform reproduces
                    // the initial block exactly.
                    let sign = if i != j && l[(i, j)] < 0.0 { -1.0 } else { 1.0 };
                    vector.push(sign * COV_INIT_COORD);
                }
            }
        }
        Ok(Self {
            dim,
            diagonal,
            trainable,
            scale,
            vector: DVector::from_vec(vector),
        })
    }

    /// Forward transform of scaled coordinates into a positive-definite block.
    fn forward(&self, vector: &DVector<f64>) -> DMatrix<f64> {
        let clamped: Vec<f64> = vector
            .iter()
            .map(|x| x.clamp(-OPT_CLAMP, OPT_CLAMP))
            .collect();
        let full = sym_from_packed(&clamped, self.dim, self.diagonal);
        let mut factor = full.component_mul(&self.scale);
        for i in 0..self.dim {
            factor[(i, i)] = full[(i, i)].exp() * self.scale[(i, i)];
        }
        &factor * factor.transpose()
    }

    fn literal(&self, vector: &DVector<f64>) -> DMatrix<f64> {
        sym_from_packed(vector.as_slice(), self.dim, self.diagonal)
    }
}

/// Scaling state of a [CovarianceMatrix].
#[derive(Clone, Debug, PartialEq)]
enum CovState {
    Scaled,
    /// Scaled coordinates saved at descale time, one vector per block.
    Descaled { saved: Vec<DVector<f64>> },
}

/// A block-diagonal covariance matrix of random effects.
#[cfg_attr(doc, katexit::katexit)]
/// Each block is optimized through a fixed scale transform. At construction
/// the block's Cholesky factor $L$ of the initial covariance yields
/// elementwise scale factors
/// $$
/// s_{ij} = \begin{cases} L_{ii} \, e^{-0.1} & i = j \\ 10\,|L_{ij}| & i > j, \end{cases}
/// $$
/// and a coordinate vector $v$ maps to the block
/// $M M^t$ with $M_{ij} = v_{ij} s_{ij}$ off the diagonal and
/// $M_{ii} = e^{v_{ii}} s_{ii}$, which is positive definite for every finite
/// $v$. Coordinates are clamped to $[-3, 3]$ before the transform.
///
/// [CovarianceMatrix::descale] swaps the coordinates for the literal matrix
/// entries they currently produce, so that covariance-step derivatives are
/// taken with respect to the covariances themselves.
#[derive(Clone, Debug, PartialEq)]
pub struct CovarianceMatrix {
    blocks: Vec<Block>,
    state: CovState,
}

/// Between-subject covariance of the etas.
pub type Omega = CovarianceMatrix;

/// Residual covariance of the epsilons.
pub type Sigma = CovarianceMatrix;

impl CovarianceMatrix {
    /// Creates a block-diagonal covariance matrix.
    ///
    /// `init` holds one packed vector per block: row-major lower-triangular
    /// entries for full blocks, variances for `diagonal` blocks. Every block
    /// must be positive definite.
    pub fn new(init: &[Vec<f64>], diagonals: &[bool], trainables: &[bool]) -> Result<Self> {
        if init.len() != diagonals.len() {
            return Err(Error::LengthMismatch {
                left: "covariance blocks",
                left_len: init.len(),
                right: "diagonal flags",
                right_len: diagonals.len(),
            });
        }
        if init.len() != trainables.len() {
            return Err(Error::LengthMismatch {
                left: "covariance blocks",
                left_len: init.len(),
                right: "trainable flags",
                right_len: trainables.len(),
            });
        }
        let blocks = init
            .iter()
            .enumerate()
            .map(|(i, entries)| Block::new(entries, diagonals[i], trainables[i], i))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            blocks,
            state: CovState::Scaled,
        })
    }

    /// Total dimension over all blocks.
    pub fn dim(&self) -> usize {
        self.blocks.iter().map(|b| b.dim).sum()
    }

    /// Number of blocks.
    pub fn n_blocks(&self) -> usize {
        self.blocks.len()
    }

    /// Whether the given block participates in optimization.
    pub fn is_block_trainable(&self, block: usize) -> bool {
        self.blocks[block].trainable
    }

    /// Whether the matrix is in the scaled (optimizer) state.
    pub fn is_scaled(&self) -> bool {
        matches!(self.state, CovState::Scaled)
    }

    /// Current packed vectors, one per block.
    pub fn vectors(&self) -> Vec<DVector<f64>> {
        self.blocks.iter().map(|b| b.vector.clone()).collect()
    }

    /// Replaces the packed vectors of all blocks.
    pub fn set_vectors(&mut self, vectors: &[DVector<f64>]) -> Result<()> {
        if vectors.len() != self.blocks.len() {
            return Err(Error::LengthMismatch {
                left: "covariance blocks",
                left_len: self.blocks.len(),
                right: "vectors",
                right_len: vectors.len(),
            });
        }
        for (block, vector) in self.blocks.iter_mut().zip(vectors) {
            if vector.len() != block.vector.len() {
                return Err(Error::LengthMismatch {
                    left: "block vector",
                    left_len: block.vector.len(),
                    right: "replacement",
                    right_len: vector.len(),
                });
            }
            block.vector = vector.clone();
        }
        Ok(())
    }

    /// Assembles the full block-diagonal matrix from the stored vectors.
    pub fn matrix(&self) -> DMatrix<f64> {
        let vectors = self.vectors();
        self.matrix_with(&vectors)
            .unwrap_or_else(|_| DMatrix::zeros(self.dim(), self.dim()))
    }

    /// Assembles the full block-diagonal matrix from the given vectors.
    ///
    /// Scaled matrices run the forward transform per block, descaled matrices
    /// read the vectors as literal entries.
    pub fn matrix_with(&self, vectors: &[DVector<f64>]) -> Result<DMatrix<f64>> {
        if vectors.len() != self.blocks.len() {
            return Err(Error::LengthMismatch {
                left: "covariance blocks",
                left_len: self.blocks.len(),
                right: "vectors",
                right_len: vectors.len(),
            });
        }
        let dim = self.dim();
        let mut out = DMatrix::zeros(dim, dim);
        let mut offset = 0;
        for (block, vector) in self.blocks.iter().zip(vectors) {
            if vector.len() != block.vector.len() {
                return Err(Error::LengthMismatch {
                    left: "block vector",
                    left_len: block.vector.len(),
                    right: "replacement",
                    right_len: vector.len(),
                });
            }
            let sub = match self.state {
                CovState::Scaled => block.forward(vector),
                CovState::Descaled { .. } => block.literal(vector),
            };
            out.view_mut((offset, offset), (block.dim, block.dim))
                .copy_from(&sub);
            offset += block.dim;
        }
        Ok(out)
    }

    /// Swaps scaled coordinates for the literal entries they produce.
    ///
    /// Idempotent; the coordinates are saved for [CovarianceMatrix::scale].
    pub fn descale(&mut self) {
        if !self.is_scaled() {
            return;
        }
        let saved = self.vectors();
        for block in &mut self.blocks {
            let computed = block.forward(&block.vector);
            block.vector = packed_from_sym(&computed, block.diagonal);
        }
        self.state = CovState::Descaled { saved };
    }

    /// Restores the scaled coordinates saved by the last
    /// [CovarianceMatrix::descale].
    ///
    /// Idempotent.
    pub fn scale(&mut self) {
        let CovState::Descaled { saved } = &self.state else {
            return;
        };
        for (block, vector) in self.blocks.iter_mut().zip(saved) {
            block.vector = vector.clone();
        }
        self.state = CovState::Scaled;
    }
}
