//! # Viterbi Decoding
//!
//! Dynamic programming over the scored lattice. With `K` labels a brute-force
//! search over `N` tokens costs `O(K^N)`; Viterbi uses the fact that the best
//! path ending in label `l` at position `i` only depends on the best paths
//! ending at `i - 1`, which brings it down to `O(N × K²)`.
//!
//! ```text
//! Initialization: δ(0, l) = E(0, l)
//!
//! Recursion:      δ(i, l) = E(i, l) + max_{l'} [δ(i-1, l') + T(l', l)]
//!                 ψ(i, l) = argmax_{l'} [δ(i-1, l') + T(l', l)]
//!
//! Backtracking:   y_N = argmax_l δ(N-1, l), then y_{i-1} = ψ(i, y_i)
//! ```
//!
//! Every argmax scans labels in ascending index order and only moves on a
//! strictly greater score, so ties always resolve to the lowest label index.

use serde::{Deserialize, Serialize};

use crate::crf::TransitionMatrix;
use crate::error::DecodeError;
use crate::lattice::Lattice;
use crate::tagger::LabelId;

/// Best path through a lattice.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViterbiResult {
    /// One label per position.
    pub path: Vec<LabelId>,
    /// Total (unnormalized) score of the path.
    pub score: f64,
    /// Softmax of each δ column, read at the chosen label.
    pub confidences: Vec<f64>,
}

impl ViterbiResult {
    fn empty() -> Self {
        Self {
            path: Vec::new(),
            score: 0.0,
            confidences: Vec::new(),
        }
    }
}

/// Finds the highest scoring label sequence.
///
/// Fails only when the lattice and the transition matrix disagree on the
/// number of labels.
pub fn viterbi_decode(lattice: &Lattice, transitions: &TransitionMatrix) -> Result<ViterbiResult, DecodeError> {
    let n = lattice.len();
    if n == 0 {
        return Ok(ViterbiResult::empty());
    }
    let k = lattice.num_labels();
    if k != transitions.num_labels() || k == 0 {
        return Err(DecodeError::DimensionMismatch {
            expected: transitions.num_labels(),
            found: k,
        });
    }

    // delta[i * k + l], backptr[i * k + l]
    let mut delta = vec![0.0; n * k];
    let mut backptr = vec![0usize; n * k];

    delta[..k].copy_from_slice(lattice.row(0));

    for i in 1..n {
        let (done, rest) = delta.split_at_mut(i * k);
        let prev = &done[(i - 1) * k..];
        let current = &mut rest[..k];
        for (l, cell) in current.iter_mut().enumerate() {
            let mut best_prev = 0;
            let mut best_score = prev[0] + transitions.get(0, l);
            for (p, &score) in prev.iter().enumerate().skip(1) {
                let candidate = score + transitions.get(p, l);
                if candidate > best_score {
                    best_score = candidate;
                    best_prev = p;
                }
            }
            *cell = best_score + lattice.emission(i, l);
            backptr[i * k + l] = best_prev;
        }
    }

    let last = &delta[(n - 1) * k..];
    let (mut label, score) = best_in_slice(last);

    let mut path = vec![LabelId::from_index(0); n];
    let mut confidences = vec![0.0; n];
    for i in (0..n).rev() {
        path[i] = LabelId::from_index(label);
        confidences[i] = scores_to_probs(&delta[i * k..(i + 1) * k])[label];
        label = backptr[i * k + label];
    }

    Ok(ViterbiResult {
        path,
        score,
        confidences,
    })
}

/// Index and value of the maximum; the first one wins on ties.
fn best_in_slice(scores: &[f64]) -> (usize, f64) {
    let mut best = (0, f64::NEG_INFINITY);
    for (i, &s) in scores.iter().enumerate() {
        if i == 0 || s > best.1 {
            best = (i, s);
        }
    }
    best
}

/// Converts scores into softmax probabilities.
pub fn scores_to_probs(scores: &[f64]) -> Vec<f64> {
    if scores.is_empty() {
        return vec![];
    }
    let max_score = scores.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    let exps: Vec<f64> = scores.iter().map(|&s| (s - max_score).exp()).collect();
    let sum: f64 = exps.iter().sum();
    if sum == 0.0 || !sum.is_finite() {
        return vec![1.0 / scores.len() as f64; scores.len()];
    }
    exps.iter().map(|e| e / sum).collect()
}
