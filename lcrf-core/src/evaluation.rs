//! # Evaluation
//!
//! Compares predicted labels against the reference labels of column data.
//!
//! Reports item accuracy, sequence accuracy, per-label precision / recall /
//! F1 with their macro averages, and the "zero hypothesis" scores: with a
//! negative label `N` (usually the default label), a token whose reference is
//! not `N` is a positive, so
//!
//! ```text
//! precision = TP / (TP + FP)      recall = TP / (TP + FN)
//! ```
//!
//! where a mistake on a reference-`N` token counts as a false positive and a
//! mistake on any other token as a false negative.

use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;

use crate::pipeline::{TaggedUnit, UnitResult};

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct LabelScore {
    /// Correct predictions of the label.
    pub correct: usize,
    /// Times the model predicted the label.
    pub predicted: usize,
    /// Times the label occurs in the reference.
    pub observed: usize,
}

impl LabelScore {
    pub fn precision(&self) -> f64 {
        ratio(self.correct, self.predicted)
    }

    pub fn recall(&self) -> f64 {
        ratio(self.correct, self.observed)
    }

    pub fn f1(&self) -> f64 {
        let (p, r) = (self.precision(), self.recall());
        if p + r > 0.0 {
            2.0 * p * r / (p + r)
        } else {
            0.0
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
struct ZeroHypothesis {
    true_positive: usize,
    true_negative: usize,
    false_positive: usize,
    false_negative: usize,
}

/// Accumulated comparison of predictions with reference labels.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Evaluation {
    negative_label: Option<String>,
    labels: BTreeMap<String, LabelScore>,
    items: usize,
    items_correct: usize,
    sequences: usize,
    sequences_correct: usize,
    zero: ZeroHypothesis,
    failed_units: usize,
    unlabeled_units: usize,
    length_mismatches: usize,
}

impl Evaluation {
    /// `negative_label` enables the zero-hypothesis precision and recall.
    pub fn new(negative_label: Option<&str>) -> Self {
        Self {
            negative_label: negative_label.map(String::from),
            ..Self::default()
        }
    }

    /// Adds one sequence. Extra items in the longer slice are ignored, but the
    /// sequence then never counts as fully correct.
    pub fn accumulate<R, P>(&mut self, reference: &[R], prediction: &[P])
    where
        R: AsRef<str>,
        P: AsRef<str>,
    {
        let mut all_correct = reference.len() == prediction.len();
        if !all_correct {
            self.length_mismatches += 1;
        }
        for (gold, guess) in reference.iter().zip(prediction) {
            let (gold, guess) = (gold.as_ref(), guess.as_ref());
            let correct = gold == guess;
            self.items += 1;
            self.labels.entry(gold.to_string()).or_default().observed += 1;
            self.labels.entry(guess.to_string()).or_default().predicted += 1;
            if correct {
                self.items_correct += 1;
                self.labels.entry(gold.to_string()).or_default().correct += 1;
            } else {
                all_correct = false;
            }
            if let Some(negative) = &self.negative_label {
                match (gold == negative, correct) {
                    (true, true) => self.zero.true_negative += 1,
                    (true, false) => self.zero.false_positive += 1,
                    (false, true) => self.zero.true_positive += 1,
                    (false, false) => self.zero.false_negative += 1,
                }
            }
        }
        self.sequences += 1;
        if all_correct {
            self.sequences_correct += 1;
        }
    }

    /// Adds a tagged unit whose tokens carry reference labels. Returns
    /// `false` when some token has no reference label; the unit is then
    /// counted as unlabeled and adds no items.
    pub fn accumulate_unit(&mut self, unit: &TaggedUnit) -> bool {
        let reference: Option<Vec<&str>> = unit.tokens.iter().map(|t| t.token.gold.as_deref()).collect();
        match reference {
            Some(reference) => {
                let prediction: Vec<&str> = unit.labels().collect();
                self.accumulate(&reference, &prediction);
                true
            }
            None => {
                self.unlabeled_units += 1;
                false
            }
        }
    }

    /// Adds one pipeline result. A failed unit is counted, never scored.
    pub fn accumulate_result(&mut self, result: &UnitResult) {
        match result {
            UnitResult::Tagged(unit) => {
                self.accumulate_unit(unit);
            }
            UnitResult::Failed { .. } => self.failed_units += 1,
        }
    }

    /// Units the pipeline could not tag.
    pub fn failed_units(&self) -> usize {
        self.failed_units
    }

    /// Tagged units skipped because a token had no reference label.
    pub fn unlabeled_units(&self) -> usize {
        self.unlabeled_units
    }

    /// Sequences whose reference and prediction differ in length.
    pub fn length_mismatches(&self) -> usize {
        self.length_mismatches
    }

    /// Units left out of the scores, failed or unlabeled.
    pub fn skipped_units(&self) -> usize {
        self.failed_units + self.unlabeled_units
    }

    pub fn item_accuracy(&self) -> f64 {
        ratio(self.items_correct, self.items)
    }

    pub fn sequence_accuracy(&self) -> f64 {
        ratio(self.sequences_correct, self.sequences)
    }

    pub fn label(&self, label: &str) -> Option<&LabelScore> {
        self.labels.get(label)
    }

    /// Labels seen in the reference data, in name order.
    pub fn observed_labels(&self) -> impl Iterator<Item = (&str, &LabelScore)> {
        self.labels
            .iter()
            .filter(|(_, s)| s.observed > 0)
            .map(|(l, s)| (l.as_str(), s))
    }

    /// Macro-averaged (precision, recall, F1) over the observed labels.
    pub fn macro_average(&self) -> (f64, f64, f64) {
        let (mut p, mut r, mut f, mut n) = (0.0, 0.0, 0.0, 0usize);
        for (_, score) in self.observed_labels() {
            p += score.precision();
            r += score.recall();
            f += score.f1();
            n += 1;
        }
        if n == 0 {
            return (0.0, 0.0, 0.0);
        }
        let n = n as f64;
        (p / n, r / n, f / n)
    }

    /// Zero-hypothesis (precision, recall); `None` without a negative label.
    pub fn zero_hypothesis(&self) -> Option<(f64, f64)> {
        self.negative_label.as_ref()?;
        let z = &self.zero;
        Some((
            ratio(z.true_positive, z.true_positive + z.false_positive),
            ratio(z.true_positive, z.true_positive + z.false_negative),
        ))
    }
}

fn ratio(num: usize, den: usize) -> f64 {
    if den == 0 {
        0.0
    } else {
        num as f64 / den as f64
    }
}

impl fmt::Display for Evaluation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Performance by label (#match, #model, #ref) (precision, recall, F1):")?;
        for (label, s) in &self.labels {
            if s.observed == 0 {
                writeln!(f, "\t{label}: ({}, {}, {}) (******, ******, ******)", s.correct, s.predicted, s.observed)?;
            } else {
                writeln!(
                    f,
                    "\t{label}: ({}, {}, {}) ({:.4}, {:.4}, {:.4})",
                    s.correct,
                    s.predicted,
                    s.observed,
                    s.precision(),
                    s.recall(),
                    s.f1()
                )?;
            }
        }
        let (p, r, f1) = self.macro_average();
        writeln!(f, "Macro-average precision, recall, F1: ({p:.4}, {r:.4}, {f1:.4})")?;
        writeln!(
            f,
            "Item accuracy: {}/{} => {:.4}",
            self.items_correct,
            self.items,
            self.item_accuracy()
        )?;
        write!(
            f,
            "Sequence accuracy: {}/{} => {:.4}",
            self.sequences_correct,
            self.sequences,
            self.sequence_accuracy()
        )?;
        write!(
            f,
            "\nSkipped units: {} failed, {} unlabeled; length mismatches: {}",
            self.failed_units, self.unlabeled_units, self.length_mismatches
        )?;
        if let (Some(negative), Some((p, r))) = (&self.negative_label, self.zero_hypothesis()) {
            write!(f, "\nZero hypothesis {negative:?}: precision {p:.4}, recall {r:.4}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Evaluation {
        let mut eval = Evaluation::new(Some("O"));
        eval.accumulate(&["B-PER", "O", "O", "B-LOC"], &["B-PER", "O", "O", "B-LOC"]);
        eval.accumulate(&["B-PER", "I-PER", "O"], &["B-PER", "O", "B-LOC"]);
        eval
    }

    #[test]
    fn test_accuracies() {
        let eval = sample();
        assert!((eval.item_accuracy() - 5.0 / 7.0).abs() < 1e-12);
        assert!((eval.sequence_accuracy() - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_per_label_scores() {
        let eval = sample();
        let loc = eval.label("B-LOC").unwrap();
        assert_eq!((loc.correct, loc.predicted, loc.observed), (1, 2, 1));
        assert!((loc.precision() - 0.5).abs() < 1e-12);
        assert!((loc.recall() - 1.0).abs() < 1e-12);
        let ipr = eval.label("I-PER").unwrap();
        assert_eq!(ipr.f1(), 0.0);
        assert_eq!(eval.observed_labels().count(), 4);
    }

    #[test]
    fn test_zero_hypothesis() {
        let eval = sample();
        // positives: B-PER x2 and B-LOC correct, I-PER missed; one O mislabeled
        let (p, r) = eval.zero_hypothesis().unwrap();
        assert!((p - 3.0 / 4.0).abs() < 1e-12);
        assert!((r - 3.0 / 4.0).abs() < 1e-12);
        assert!(Evaluation::new(None).zero_hypothesis().is_none());
    }

    #[test]
    fn test_length_mismatch_is_not_a_correct_sequence() {
        let mut eval = Evaluation::default();
        eval.accumulate(&["O", "O"], &["O"]);
        assert_eq!(eval.sequence_accuracy(), 0.0);
        assert_eq!(eval.item_accuracy(), 1.0);
        assert_eq!(eval.length_mismatches(), 1);
        assert!(eval.to_string().contains("length mismatches: 1"));
    }

    #[test]
    fn test_failed_and_unlabeled_units_are_counted() {
        use crate::error::SequenceError;
        use crate::tagger::{Segment, TaggedToken};
        use crate::tokenizer::Token;

        let tagged = |index: usize, gold: Option<&str>| {
            let mut token = Token::new("Bonn", 0, 4);
            token.gold = gold.map(String::from);
            UnitResult::Tagged(TaggedUnit {
                index,
                tokens: vec![TaggedToken { token, label: "B-LOC".into(), confidence: 1.0 }],
                segments: Vec::<Segment>::new(),
                score: 0.0,
            })
        };
        let mut eval = Evaluation::new(Some("O"));
        eval.accumulate_result(&tagged(0, Some("B-LOC")));
        eval.accumulate_result(&UnitResult::Failed { index: 1, error: SequenceError::Tokenizer("no tokens".into()) });
        eval.accumulate_result(&tagged(2, None));

        assert_eq!(eval.failed_units(), 1);
        assert_eq!(eval.unlabeled_units(), 1);
        assert_eq!(eval.skipped_units(), 2);
        assert_eq!(eval.sequence_accuracy(), 1.0);
        assert!(eval.to_string().contains("Skipped units: 1 failed, 1 unlabeled"));
    }

    #[test]
    fn test_report_lists_labels() {
        let report = sample().to_string();
        assert!(report.contains("B-LOC: (1, 2, 1)"));
        assert!(report.contains("Sequence accuracy: 1/2"));
        assert!(report.contains("Zero hypothesis"));
    }
}
