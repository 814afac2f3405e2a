//! Candidate moment tensors.
//!
//! A candidate is stored as the six-vector
//! `(m11, m22, m33, √2·m12, √2·m13, √2·m23)`. Joint inversions of several
//! events stack one six-vector per event, so a batch always has a multiple of
//! six rows and one column per candidate.

use faer::Mat;
use rand::Rng;
use rand_distr::StandardNormal;

use crate::error::{InversionError, Result};

/// Number of independent components of a moment tensor.
pub const MT_COMPONENTS: usize = 6;

/// Immutable batch of candidates, one column per candidate.
#[derive(Debug, Clone)]
pub struct MomentTensorBatch {
    data: Mat<f64>,
}

impl MomentTensorBatch {
    /// Wrap a matrix with `6 * events` rows.
    pub fn new(data: Mat<f64>) -> Result<Self> {
        if data.nrows() == 0 || data.nrows() % MT_COMPONENTS != 0 {
            return Err(InversionError::configuration(format!(
                "Moment tensor batch needs a multiple of {} rows, got {}",
                MT_COMPONENTS,
                data.nrows()
            )));
        }
        Ok(Self { data })
    }

    /// A batch without candidates.
    pub fn empty(events: usize) -> Self {
        Self {
            data: Mat::zeros(MT_COMPONENTS * events.max(1), 0),
        }
    }

    /// Build a batch from candidate vectors of identical length.
    pub fn from_candidates<C: AsRef<[f64]>>(candidates: &[C]) -> Result<Self> {
        let Some(first) = candidates.first() else {
            return Ok(Self::empty(1));
        };
        let rows = first.as_ref().len();
        if let Some(bad) = candidates.iter().find(|c| c.as_ref().len() != rows) {
            return Err(InversionError::configuration(format!(
                "Candidates of different length ({} and {}) in one batch",
                rows,
                bad.as_ref().len()
            )));
        }
        Self::new(Mat::from_fn(rows, candidates.len(), |i, j| {
            candidates[j].as_ref()[i]
        }))
    }

    /// Number of candidates.
    pub fn len(&self) -> usize {
        self.data.ncols()
    }

    pub fn is_empty(&self) -> bool {
        self.data.ncols() == 0
    }

    /// Number of events each candidate describes.
    pub fn events(&self) -> usize {
        self.data.nrows() / MT_COMPONENTS
    }

    /// Values per candidate.
    pub fn rows(&self) -> usize {
        self.data.nrows()
    }

    pub fn as_mat(&self) -> &Mat<f64> {
        &self.data
    }

    /// All values of one candidate.
    pub fn candidate(&self, index: usize) -> Vec<f64> {
        (0..self.data.nrows()).map(|i| self.data[(i, index)]).collect()
    }

    /// The six-vector of one event of one candidate.
    pub fn tensor(&self, index: usize, event: usize) -> [f64; MT_COMPONENTS] {
        let offset = event * MT_COMPONENTS;
        std::array::from_fn(|i| self.data[(offset + i, index)])
    }

    pub fn candidates(&self) -> impl Iterator<Item = Vec<f64>> + '_ {
        (0..self.len()).map(|j| self.candidate(j))
    }

    /// Rows belonging to a single event, as a batch of its own.
    pub fn event_batch(&self, event: usize) -> MomentTensorBatch {
        let offset = event * MT_COMPONENTS;
        MomentTensorBatch {
            data: Mat::from_fn(MT_COMPONENTS, self.len(), |i, j| {
                self.data[(offset + i, j)]
            }),
        }
    }

    /// Columns `start..end` as a new batch.
    pub fn slice(&self, start: usize, end: usize) -> MomentTensorBatch {
        let end = end.min(self.len());
        let start = start.min(end);
        MomentTensorBatch {
            data: Mat::from_fn(self.rows(), end - start, |i, j| self.data[(i, start + j)]),
        }
    }

    /// Split into consecutive sub-batches of at most `chunk` candidates.
    ///
    /// Each sub-batch is returned with the column offset of its first candidate.
    pub fn split(&self, chunk: usize) -> Vec<(usize, MomentTensorBatch)> {
        let chunk = chunk.max(1);
        (0..self.len())
            .step_by(chunk)
            .map(|start| (start, self.slice(start, start + chunk)))
            .collect()
    }

    /// Join sub-batches in the given order.
    pub fn concat<'a>(parts: impl IntoIterator<Item = &'a MomentTensorBatch>) -> Result<Self> {
        let parts: Vec<&MomentTensorBatch> = parts.into_iter().collect();
        let Some(first) = parts.first() else {
            return Ok(Self::empty(1));
        };
        let rows = first.rows();
        if let Some(bad) = parts.iter().find(|p| p.rows() != rows) {
            return Err(InversionError::configuration(format!(
                "Can not join batches with {} and {} rows",
                rows,
                bad.rows()
            )));
        }
        let columns: Vec<(usize, usize)> = parts
            .iter()
            .enumerate()
            .flat_map(|(p, part)| (0..part.len()).map(move |j| (p, j)))
            .collect();
        Ok(MomentTensorBatch {
            data: Mat::from_fn(rows, columns.len(), |i, c| {
                let (p, j) = columns[c];
                parts[p].data[(i, j)]
            }),
        })
    }
}

impl PartialEq for MomentTensorBatch {
    fn eq(&self, other: &Self) -> bool {
        self.rows() == other.rows()
            && self.len() == other.len()
            && (0..self.len())
                .all(|j| (0..self.rows()).all(|i| self.data[(i, j)] == other.data[(i, j)]))
    }
}

/// Scale every six-vector block of a candidate to unit norm.
pub fn normalize_candidate(candidate: &mut [f64]) {
    for block in candidate.chunks_mut(MT_COMPONENTS) {
        let norm = block.iter().map(|v| v * v).sum::<f64>().sqrt();
        if norm > 0. {
            block.iter_mut().for_each(|v| *v /= norm);
        }
    }
}

/// A candidate drawn uniformly from the unit sphere of every event.
pub fn random_candidate<R: Rng + ?Sized>(rng: &mut R, events: usize) -> Vec<f64> {
    let mut candidate: Vec<f64> = (0..MT_COMPONENTS * events)
        .map(|_| rng.sample(StandardNormal))
        .collect();
    normalize_candidate(&mut candidate);
    candidate
}

/// Draw `n` candidates uniformly from the unit sphere of every event.
pub fn uniform_batch<R: Rng + ?Sized>(rng: &mut R, n: usize, events: usize) -> MomentTensorBatch {
    let events = events.max(1);
    let mut data = Mat::zeros(MT_COMPONENTS * events, n);
    for j in 0..n {
        let candidate = random_candidate(rng, events);
        for (i, value) in candidate.into_iter().enumerate() {
            data[(i, j)] = value;
        }
    }
    MomentTensorBatch { data }
}
