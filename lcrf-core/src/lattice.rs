//! # Lattice Scorer
//!
//! Turns the feature vectors of a sequence into the `N × K` table of emission
//! scores the decoder consumes:
//!
//! ```text
//! E(i, l) = Σ_{f ∈ F(x, i)} w(f, l)
//! ```
//!
//! Transition scores come straight from the [`WeightTable`]; the decoder never
//! sees feature keys.

use crate::crf::WeightTable;
use crate::error::DecodeError;
use crate::features::FeatureVector;

/// Emission scores of one sequence, row-major by position.
#[derive(Debug, Clone, PartialEq)]
pub struct Lattice {
    len: usize,
    num_labels: usize,
    emissions: Vec<f64>,
}

impl Lattice {
    /// An all-zero lattice.
    pub fn zeros(len: usize, num_labels: usize) -> Self {
        Self {
            len,
            num_labels,
            emissions: vec![0.0; len * num_labels],
        }
    }

    /// Builds a lattice from one row of label scores per position.
    pub fn from_rows(rows: &[Vec<f64>]) -> Result<Self, DecodeError> {
        let num_labels = rows.first().map_or(0, Vec::len);
        if let Some(bad) = rows.iter().find(|r| r.len() != num_labels) {
            return Err(DecodeError::DimensionMismatch {
                expected: num_labels,
                found: bad.len(),
            });
        }
        Ok(Self {
            len: rows.len(),
            num_labels,
            emissions: rows.iter().flatten().copied().collect(),
        })
    }

    /// Number of positions.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn num_labels(&self) -> usize {
        self.num_labels
    }

    pub fn emission(&self, position: usize, label: usize) -> f64 {
        self.emissions[position * self.num_labels + label]
    }

    /// Scores of every label at `position`.
    pub fn row(&self, position: usize) -> &[f64] {
        let start = position * self.num_labels;
        &self.emissions[start..start + self.num_labels]
    }

    fn row_mut(&mut self, position: usize) -> &mut [f64] {
        let start = position * self.num_labels;
        &mut self.emissions[start..start + self.num_labels]
    }
}

/// Computes the emission scores of a sequence. Keys unknown to the table add
/// nothing, so a position without any known feature scores zero everywhere.
pub fn score(table: &WeightTable, features: &[FeatureVector]) -> Lattice {
    let mut lattice = Lattice::zeros(features.len(), table.num_labels());
    for (i, fv) in features.iter().enumerate() {
        let row = lattice.row_mut(i);
        for attr in fv.iter().filter_map(|key| table.attr_id(key)) {
            for (label, weight) in table.state_weights(attr) {
                row[label.index()] += weight;
            }
        }
    }
    lattice
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crf::WeightTableBuilder;

    fn fv(index: usize, keys: &[&str]) -> FeatureVector {
        let mut fv = FeatureVector::new(index);
        for k in keys {
            fv.insert(*k);
        }
        fv
    }

    #[test]
    fn test_emission_sums_weights() {
        let mut b = WeightTableBuilder::new(["O", "B-LOC"]).unwrap();
        b.state("W[0]=Berlin", "B-LOC", 3.0).unwrap();
        b.state("InitUpper", "B-LOC", 0.5).unwrap();
        b.state("InitUpper", "O", -0.25).unwrap();
        let table = b.build();

        let lattice = score(
            &table,
            &[fv(0, &["W[0]=Berlin", "InitUpper", "W[0]=unseen"]), fv(1, &["W[0]=."])],
        );
        assert_eq!(lattice.len(), 2);
        assert_eq!(lattice.num_labels(), 2);
        assert_eq!(lattice.row(0), &[-0.25, 3.5]);
        assert_eq!(lattice.row(1), &[0.0, 0.0]);
    }

    #[test]
    fn test_empty_sequence() {
        let table = WeightTableBuilder::new(["O"]).unwrap().build();
        let lattice = score(&table, &[]);
        assert!(lattice.is_empty());
    }

    #[test]
    fn test_ragged_rows_rejected() {
        assert!(Lattice::from_rows(&[vec![1.0, 2.0], vec![1.0]]).is_err());
        let l = Lattice::from_rows(&[vec![1.0, 2.0], vec![3.0, 4.0]]).unwrap();
        assert_eq!(l.emission(1, 0), 3.0);
    }
}
