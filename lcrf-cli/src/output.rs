//! Renders unit results and evaluation reports as TSV or JSON.

use std::collections::BTreeMap;
use std::io::{self, Write};

use clap::ValueEnum;
use lcrf_core::evaluation::LabelScore;
use lcrf_core::{Evaluation, UnitResult};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Format {
    /// One token per line, blank line after each unit.
    Tsv,
    /// One document per input with the collapsed segments.
    Json,
}

/// Destination for the results of one input.
pub trait ResultSink {
    fn write_unit(&mut self, result: &UnitResult) -> io::Result<()>;

    /// Called once after the last unit of the input.
    fn finish(&mut self) -> io::Result<()>;
}

pub fn sink<'a, W: Write + 'a>(format: Format, out: W, output_token: bool) -> Box<dyn ResultSink + 'a> {
    match format {
        Format::Tsv => Box::new(TsvWriter { out, output_token }),
        Format::Json => Box::new(JsonWriter::new(out)),
    }
}

/// `LABEL\tTOKEN\tCLASS\t(offset,len)` lines, or just `LABEL` without
/// `output_token`.
pub struct TsvWriter<W> {
    out: W,
    output_token: bool,
}

impl<W: Write> ResultSink for TsvWriter<W> {
    fn write_unit(&mut self, result: &UnitResult) -> io::Result<()> {
        match result {
            UnitResult::Tagged(unit) => {
                for t in &unit.tokens {
                    if self.output_token {
                        writeln!(
                            self.out,
                            "{}\t{}\t{}\t({},{})",
                            t.label,
                            t.token.text,
                            t.token.class.name(),
                            t.token.start,
                            t.token.len()
                        )?;
                    } else {
                        writeln!(self.out, "{}", t.label)?;
                    }
                }
            }
            UnitResult::Failed { index, error } => {
                writeln!(self.out, "#FAILED\t{index}\t{error}")?;
            }
        }
        writeln!(self.out)
    }

    fn finish(&mut self) -> io::Result<()> {
        self.out.flush()
    }
}

#[derive(Debug, Serialize)]
struct EntityRecord {
    surface: String,
    entity_type: String,
    start: usize,
    end: usize,
}

#[derive(Debug, Serialize)]
struct ErrorRecord {
    index: usize,
    error: String,
}

#[derive(Debug, Default, Serialize)]
struct Document {
    entities: Vec<EntityRecord>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    errors: Vec<ErrorRecord>,
}

/// Collects segments and failures, written as one JSON document on `finish`.
pub struct JsonWriter<W> {
    out: W,
    doc: Document,
}

impl<W: Write> JsonWriter<W> {
    pub fn new(out: W) -> Self {
        Self {
            out,
            doc: Document::default(),
        }
    }
}

impl<W: Write> ResultSink for JsonWriter<W> {
    fn write_unit(&mut self, result: &UnitResult) -> io::Result<()> {
        match result {
            UnitResult::Tagged(unit) => {
                self.doc.entities.extend(unit.segments.iter().map(|s| EntityRecord {
                    surface: s.text.clone(),
                    entity_type: s.kind.clone(),
                    start: s.start,
                    end: s.end,
                }));
            }
            UnitResult::Failed { index, error } => self.doc.errors.push(ErrorRecord {
                index: *index,
                error: error.to_string(),
            }),
        }
        Ok(())
    }

    fn finish(&mut self) -> io::Result<()> {
        let doc = std::mem::take(&mut self.doc);
        serde_json::to_writer_pretty(&mut self.out, &doc)?;
        writeln!(self.out)?;
        self.out.flush()
    }
}

#[derive(Debug, Serialize)]
struct EvaluationRecord<'a> {
    item_accuracy: f64,
    sequence_accuracy: f64,
    macro_average: (f64, f64, f64),
    #[serde(skip_serializing_if = "Option::is_none")]
    zero_hypothesis: Option<(f64, f64)>,
    labels: BTreeMap<&'a str, &'a LabelScore>,
    failed_units: usize,
    unlabeled_units: usize,
    length_mismatches: usize,
}

/// Writes the evaluation report: the plain text report for TSV, one JSON
/// object otherwise.
pub fn write_evaluation<W: Write>(format: Format, mut out: W, evaluation: &Evaluation) -> io::Result<()> {
    match format {
        Format::Tsv => writeln!(out, "{evaluation}")?,
        Format::Json => {
            let record = EvaluationRecord {
                item_accuracy: evaluation.item_accuracy(),
                sequence_accuracy: evaluation.sequence_accuracy(),
                macro_average: evaluation.macro_average(),
                zero_hypothesis: evaluation.zero_hypothesis(),
                labels: evaluation.observed_labels().collect(),
                failed_units: evaluation.failed_units(),
                unlabeled_units: evaluation.unlabeled_units(),
                length_mismatches: evaluation.length_mismatches(),
            };
            serde_json::to_writer_pretty(&mut out, &record)?;
            writeln!(out)?;
        }
    }
    out.flush()
}

#[cfg(test)]
mod tests {
    use super::*;
    use lcrf_core::{Applier, CrfConfig, SequenceError, Token, WeightTableBuilder};

    fn results() -> Vec<UnitResult> {
        results_for(Token::sequence(&["to", "Paris"]))
    }

    fn results_for(tokens: Vec<Token>) -> Vec<UnitResult> {
        let config = CrfConfig::from_cfg_str("RunningText = yes\nHeadWord = yes\n").unwrap();
        let mut model = WeightTableBuilder::new(["O", "B-LOC"]).unwrap();
        model.state("W[0]=Paris", "B-LOC", 4.0).unwrap();
        let applier = Applier::new(config, model.build());
        vec![
            UnitResult::Tagged(applier.tag_tokens(0, tokens).unwrap()),
            UnitResult::Failed {
                index: 1,
                error: SequenceError::Tokenizer("no tokens".into()),
            },
        ]
    }

    fn render(format: Format, output_token: bool) -> String {
        let mut buf = Vec::new();
        {
            let mut sink = sink(format, &mut buf, output_token);
            for r in &results() {
                sink.write_unit(r).unwrap();
            }
            sink.finish().unwrap();
        }
        String::from_utf8(buf).unwrap()
    }

    #[test]
    fn test_tsv() {
        assert_eq!(
            render(Format::Tsv, true),
            "O\tto\tWORD\t(0,2)\nB-LOC\tParis\tWORD\t(3,5)\n\n#FAILED\t1\ttokenizer failed: no tokens\n\n"
        );
        assert!(render(Format::Tsv, false).starts_with("O\nB-LOC\n\n"));
    }

    #[test]
    fn test_json() {
        let value: serde_json::Value = serde_json::from_str(&render(Format::Json, false)).unwrap();
        assert_eq!(value["entities"][0]["surface"], "Paris");
        assert_eq!(value["entities"][0]["entity_type"], "LOC");
        assert_eq!(value["entities"][0]["start"], 3);
        assert_eq!(value["errors"][0]["index"], 1);
    }

    fn evaluation() -> Evaluation {
        let mut tokens = Token::sequence(&["to", "Paris"]);
        for (token, gold) in tokens.iter_mut().zip(["O", "B-LOC"]) {
            token.gold = Some(gold.to_string());
        }
        let mut evaluation = Evaluation::new(Some("O"));
        for r in &results_for(tokens) {
            evaluation.accumulate_result(r);
        }
        evaluation
    }

    fn report(format: Format) -> String {
        let mut buf = Vec::new();
        write_evaluation(format, &mut buf, &evaluation()).unwrap();
        String::from_utf8(buf).unwrap()
    }

    #[test]
    fn test_evaluation_report_counts_failed_units() {
        let text = report(Format::Tsv);
        assert!(text.contains("Sequence accuracy: 1/1"));
        assert!(text.contains("Skipped units: 1 failed, 0 unlabeled"));

        let value: serde_json::Value = serde_json::from_str(&report(Format::Json)).unwrap();
        assert_eq!(value["failed_units"], 1);
        assert_eq!(value["unlabeled_units"], 0);
        assert_eq!(value["sequence_accuracy"], 1.0);
        assert_eq!(value["labels"]["B-LOC"]["correct"], 1);
    }
}
