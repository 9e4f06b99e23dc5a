//! # Weight Table
//!
//! The learned parameters of a first-order linear-chain CRF:
//!
//! ```text
//! score(y, x) = Σ_i [ Σ_{f ∈ F(x, i)} w(f, y_i) + T(y_{i-1}, y_i) ]
//! ```
//!
//! - **state weights** `w(f, l)`: one weight per (feature key, label) pair.
//!   Keys are interned into dense attribute ids; each attribute keeps the
//!   short list of labels it has a non-zero weight for.
//! - **transition weights** `T(l', l)`: a dense `K × K` matrix, row = previous
//!   label, column = current label.
//!
//! A feature key the model never saw has weight zero for every label. The
//! table is immutable once built and is shared read-only between workers.

use std::collections::HashMap;

use tracing::warn;

use crate::error::{DecodeError, ModelError};
use crate::tagger::{LabelAlphabet, LabelId};

/// Dense index of a feature key in a [`WeightTable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AttrId(u32);

impl AttrId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Row-major `K × K` matrix of transition weights.
#[derive(Debug, Clone, PartialEq)]
pub struct TransitionMatrix {
    num_labels: usize,
    weights: Vec<f64>,
}

impl TransitionMatrix {
    pub fn zeros(num_labels: usize) -> Self {
        Self {
            num_labels,
            weights: vec![0.0; num_labels * num_labels],
        }
    }

    /// Builds a matrix from rows. Fails when the rows are not `K × K`.
    pub fn from_rows(rows: &[Vec<f64>]) -> Result<Self, DecodeError> {
        let k = rows.len();
        let weights: Vec<f64> = rows.iter().flatten().copied().collect();
        if rows.iter().any(|r| r.len() != k) {
            return Err(DecodeError::TransitionShape {
                expected: k * k,
                found: weights.len(),
            });
        }
        Ok(Self {
            num_labels: k,
            weights,
        })
    }

    pub fn num_labels(&self) -> usize {
        self.num_labels
    }

    /// Weight of moving from label index `prev` to label index `cur`.
    pub fn get(&self, prev: usize, cur: usize) -> f64 {
        self.weights[prev * self.num_labels + cur]
    }

    fn set(&mut self, prev: usize, cur: usize, weight: f64) {
        self.weights[prev * self.num_labels + cur] = weight;
    }
}

/// Immutable, shared weight table of a loaded model.
#[derive(Debug, Clone)]
pub struct WeightTable {
    labels: LabelAlphabet,
    attr_ids: HashMap<String, AttrId>,
    attr_names: Vec<String>,
    /// Indexed by attribute id, sorted by label.
    state: Vec<Vec<(LabelId, f64)>>,
    transitions: TransitionMatrix,
}

impl WeightTable {
    pub fn labels(&self) -> &LabelAlphabet {
        &self.labels
    }

    pub fn num_labels(&self) -> usize {
        self.labels.len()
    }

    pub fn num_attributes(&self) -> usize {
        self.attr_names.len()
    }

    pub fn attr_id(&self, key: &str) -> Option<AttrId> {
        self.attr_ids.get(key).copied()
    }

    pub fn attr_name(&self, id: AttrId) -> &str {
        &self.attr_names[id.index()]
    }

    /// Labels with a non-zero weight for `attr`, in label order.
    pub fn state_weights(&self, attr: AttrId) -> &[(LabelId, f64)] {
        &self.state[attr.index()]
    }

    /// `w(key, label)`; zero for keys or pairs the model does not know.
    pub fn state_weight(&self, key: &str, label: LabelId) -> f64 {
        self.attr_id(key)
            .and_then(|attr| {
                self.state_weights(attr)
                    .iter()
                    .find(|(l, _)| *l == label)
                    .map(|(_, w)| *w)
            })
            .unwrap_or(0.0)
    }

    pub fn transition(&self, prev: LabelId, cur: LabelId) -> f64 {
        self.transitions.get(prev.index(), cur.index())
    }

    pub fn transitions(&self) -> &TransitionMatrix {
        &self.transitions
    }

    pub(crate) fn attr_names(&self) -> &[String] {
        &self.attr_names
    }

    pub fn num_state_features(&self) -> usize {
        self.state.iter().map(Vec::len).sum()
    }
}

/// Assembles a [`WeightTable`] from labels, state weights and transitions.
///
/// ```rust
/// use lcrf_core::crf::WeightTableBuilder;
///
/// let mut builder = WeightTableBuilder::new(["O", "B-PER"]).unwrap();
/// builder.state("W[0]=John", "B-PER", 2.5).unwrap();
/// builder.transition("O", "B-PER", 0.3).unwrap();
/// let table = builder.build();
/// assert_eq!(table.num_attributes(), 1);
/// ```
#[derive(Debug)]
pub struct WeightTableBuilder {
    labels: LabelAlphabet,
    attr_ids: HashMap<String, AttrId>,
    attr_names: Vec<String>,
    state: Vec<Vec<(LabelId, f64)>>,
    transitions: TransitionMatrix,
}

impl WeightTableBuilder {
    pub fn new<I, S>(labels: I) -> Result<Self, ModelError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let labels = LabelAlphabet::new(labels)?;
        let transitions = TransitionMatrix::zeros(labels.len());
        Ok(Self {
            labels,
            attr_ids: HashMap::new(),
            attr_names: Vec::new(),
            state: Vec::new(),
            transitions,
        })
    }

    pub fn labels(&self) -> &LabelAlphabet {
        &self.labels
    }

    /// Declares a feature key without weights, keeping id order stable.
    pub fn attribute(&mut self, key: &str) -> AttrId {
        if let Some(&id) = self.attr_ids.get(key) {
            return id;
        }
        let id = AttrId(self.attr_names.len() as u32);
        self.attr_ids.insert(key.to_string(), id);
        self.attr_names.push(key.to_string());
        self.state.push(Vec::new());
        id
    }

    pub fn has_attribute(&self, key: &str) -> bool {
        self.attr_ids.contains_key(key)
    }

    /// Sets `w(key, label)`. A repeated pair keeps the last weight.
    pub fn state(&mut self, key: &str, label: &str, weight: f64) -> Result<&mut Self, ModelError> {
        let label = self.label_id(label)?;
        check_finite(weight, || format!("{key} --> {}", self.labels.name(label)))?;
        let attr = self.attribute(key);
        let row = &mut self.state[attr.index()];
        match row.binary_search_by_key(&label, |(l, _)| *l) {
            Ok(pos) => {
                warn!(key, label = %self.labels.name(label), "duplicate state feature, keeping last weight");
                row[pos].1 = weight;
            }
            Err(pos) => row.insert(pos, (label, weight)),
        }
        Ok(self)
    }

    /// Sets `T(from, to)`.
    pub fn transition(&mut self, from: &str, to: &str, weight: f64) -> Result<&mut Self, ModelError> {
        let prev = self.label_id(from)?;
        let cur = self.label_id(to)?;
        check_finite(weight, || format!("{from} --> {to}"))?;
        self.transitions.set(prev.index(), cur.index(), weight);
        Ok(self)
    }

    fn label_id(&self, label: &str) -> Result<LabelId, ModelError> {
        self.labels
            .id(label)
            .ok_or_else(|| ModelError::UnknownLabel(label.to_string()))
    }

    pub fn build(self) -> WeightTable {
        WeightTable {
            labels: self.labels,
            attr_ids: self.attr_ids,
            attr_names: self.attr_names,
            state: self.state,
            transitions: self.transitions,
        }
    }
}

fn check_finite(weight: f64, feature: impl FnOnce() -> String) -> Result<(), ModelError> {
    if weight.is_finite() {
        Ok(())
    } else {
        Err(ModelError::NonFiniteWeight {
            feature: feature(),
            weight,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> WeightTable {
        let mut b = WeightTableBuilder::new(["O", "B-PER", "I-PER"]).unwrap();
        b.state("W[0]=John", "B-PER", 2.0).unwrap();
        b.state("W[0]=John", "O", -1.0).unwrap();
        b.state("InitUpper", "I-PER", 0.5).unwrap();
        b.transition("B-PER", "I-PER", 1.5).unwrap();
        b.transition("O", "I-PER", -3.0).unwrap();
        b.build()
    }

    #[test]
    fn test_state_weights_sorted_by_label() {
        let t = table();
        let john = t.attr_id("W[0]=John").unwrap();
        let labels: Vec<usize> = t.state_weights(john).iter().map(|(l, _)| l.index()).collect();
        assert_eq!(labels, vec![0, 1]);
        assert_eq!(t.num_state_features(), 3);
    }

    #[test]
    fn test_unknown_key_weighs_zero() {
        let t = table();
        let per = t.labels().id("B-PER").unwrap();
        assert_eq!(t.state_weight("W[0]=John", per), 2.0);
        assert_eq!(t.state_weight("W[0]=Mary", per), 0.0);
        assert_eq!(t.state_weight("InitUpper", per), 0.0);
    }

    #[test]
    fn test_transitions() {
        let t = table();
        let id = |l| t.labels().id(l).unwrap();
        assert_eq!(t.transition(id("B-PER"), id("I-PER")), 1.5);
        assert_eq!(t.transition(id("O"), id("I-PER")), -3.0);
        assert_eq!(t.transition(id("I-PER"), id("O")), 0.0);
        assert_eq!(t.transitions().num_labels(), 3);
    }

    #[test]
    fn test_builder_rejects_bad_input() {
        let mut b = WeightTableBuilder::new(["O"]).unwrap();
        assert!(matches!(
            b.state("x", "B-LOC", 1.0),
            Err(ModelError::UnknownLabel(l)) if l == "B-LOC"
        ));
        assert!(matches!(
            b.transition("O", "O", f64::NAN),
            Err(ModelError::NonFiniteWeight { .. })
        ));
    }

    #[test]
    fn test_duplicate_state_keeps_last() {
        let mut b = WeightTableBuilder::new(["O", "X"]).unwrap();
        b.state("k", "X", 1.0).unwrap().state("k", "X", 4.0).unwrap();
        let t = b.build();
        assert_eq!(t.state_weight("k", t.labels().id("X").unwrap()), 4.0);
    }

    #[test]
    fn test_matrix_from_rows() {
        let m = TransitionMatrix::from_rows(&[vec![0.0, 1.0], vec![2.0, 3.0]]).unwrap();
        assert_eq!(m.get(1, 0), 2.0);
        assert!(TransitionMatrix::from_rows(&[vec![0.0, 1.0], vec![2.0]]).is_err());
    }
}
