//! # Model Files
//!
//! Reads and writes weight tables in the CRFsuite text dump format:
//!
//! ```text
//! FILEHEADER = {
//!   model_order: 1
//!   num_labels: 2
//!   num_attrs: 1
//! }
//!
//! LABELS = {
//!       0: O
//!       1: B-PER
//! }
//!
//! ATTRIBUTES = {
//!       0: W[0]=John
//! }
//!
//! TRANSITIONS = {
//!   (1) O --> B-PER: 0.25
//! }
//!
//! STATE_FEATURES = {
//!   (0) W[0]=John --> B-PER: 2.5
//! }
//! ```
//!
//! Header keys other than `model_order` and `num_labels` are informational
//! and ignored, so dumps produced by CRFsuite load unchanged. Any structural
//! problem is reported with its line number and aborts loading.

use std::fs::File;
use std::io::{self, BufRead, BufReader, Write};
use std::path::Path;

use tracing::{debug, info, warn};

use crate::crf::{WeightTable, WeightTableBuilder};
use crate::error::ModelError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Block {
    Header,
    Labels,
    Attributes,
    Transitions,
    StateFeatures,
    Unknown,
}

impl Block {
    fn from_name(name: &str) -> Block {
        match name {
            "FILEHEADER" => Block::Header,
            "LABELS" => Block::Labels,
            "ATTRIBUTES" => Block::Attributes,
            "TRANSITIONS" => Block::Transitions,
            "STATE_FEATURES" => Block::StateFeatures,
            _ => Block::Unknown,
        }
    }
}

/// Accumulates the blocks of a dump while reading it.
#[derive(Default)]
struct DumpReader {
    declared_labels: Option<usize>,
    labels: Vec<(usize, String)>,
    builder: Option<WeightTableBuilder>,
}

impl DumpReader {
    fn header(&mut self, line_no: usize, body: &str) -> Result<(), ModelError> {
        let (key, value) = split_entry(line_no, body)?;
        match key {
            "model_order" => {
                let order: u32 = parse_field(line_no, "model_order", value)?;
                if order != 1 {
                    return Err(ModelError::UnsupportedOrder(order));
                }
            }
            "num_labels" => {
                self.declared_labels = Some(parse_field(line_no, "num_labels", value)?);
            }
            _ => debug!(key, value, "ignoring header entry"),
        }
        Ok(())
    }

    fn label(&mut self, line_no: usize, body: &str) -> Result<(), ModelError> {
        if self.builder.is_some() {
            return Err(ModelError::Syntax {
                line: line_no,
                message: "label declared after the alphabet was closed by ATTRIBUTES or weights".to_string(),
            });
        }
        let (id, name) = split_entry(line_no, body)?;
        let id: usize = parse_field(line_no, "label id", id)?;
        self.labels.push((id, name.to_string()));
        Ok(())
    }

    /// Turns the collected labels into a builder the first time weights appear.
    fn builder(&mut self, line_no: usize) -> Result<&mut WeightTableBuilder, ModelError> {
        if self.builder.is_none() {
            if self.labels.is_empty() {
                return Err(ModelError::Syntax {
                    line: line_no,
                    message: "weights appear before the LABELS block".to_string(),
                });
            }
            let mut labels = std::mem::take(&mut self.labels);
            labels.sort_by_key(|(id, _)| *id);
            for (expected, (id, _)) in labels.iter().enumerate() {
                if *id != expected {
                    return Err(ModelError::MissingLabelId(expected));
                }
            }
            if let Some(declared) = self.declared_labels {
                if declared != labels.len() {
                    return Err(ModelError::LabelCountMismatch {
                        declared,
                        found: labels.len(),
                    });
                }
            }
            self.builder = Some(WeightTableBuilder::new(labels.into_iter().map(|(_, name)| name))?);
        }
        self.builder.as_mut().ok_or(ModelError::EmptyAlphabet)
    }

    fn attribute(&mut self, line_no: usize, body: &str) -> Result<(), ModelError> {
        let (_, key) = split_entry(line_no, body)?;
        self.builder(line_no)?.attribute(key);
        Ok(())
    }

    fn transition(&mut self, line_no: usize, body: &str) -> Result<(), ModelError> {
        let (from, to, weight) = split_weight(line_no, body)?;
        self.builder(line_no)?
            .transition(from, to, weight)
            .map_err(|e| at_line(line_no, e))?;
        Ok(())
    }

    fn state(&mut self, line_no: usize, body: &str) -> Result<(), ModelError> {
        let (attr, label, weight) = split_weight(line_no, body)?;
        let builder = self.builder(line_no)?;
        if !builder.has_attribute(attr) {
            return Err(ModelError::UnknownAttribute {
                line: line_no,
                attribute: attr.to_string(),
            });
        }
        builder.state(attr, label, weight).map_err(|e| at_line(line_no, e))?;
        Ok(())
    }

    fn finish(mut self) -> Result<WeightTable, ModelError> {
        if self.builder.is_none() && self.labels.is_empty() {
            return Err(ModelError::Syntax {
                line: 0,
                message: "model has no LABELS block".to_string(),
            });
        }
        self.builder(0)?;
        self.builder
            .map(WeightTableBuilder::build)
            .ok_or(ModelError::EmptyAlphabet)
    }
}

/// Reads a model dump.
pub fn read_model<R: BufRead>(reader: R) -> Result<WeightTable, ModelError> {
    let mut dump = DumpReader::default();
    let mut block: Option<Block> = None;

    for (n, line) in reader.lines().enumerate() {
        let line = line?;
        let line_no = n + 1;
        let body = line.trim();
        if body.is_empty() {
            continue;
        }
        match block {
            None => {
                let Some(name) = body.strip_suffix('{').and_then(|b| b.trim_end().strip_suffix('=')) else {
                    return Err(ModelError::Syntax {
                        line: line_no,
                        message: format!("expected `NAME = {{`, found {body:?}"),
                    });
                };
                let opened = Block::from_name(name.trim());
                if opened == Block::Unknown {
                    warn!(block = name.trim(), line = line_no, "skipping unknown model block");
                }
                block = Some(opened);
            }
            Some(_) if body == "}" => block = None,
            Some(Block::Header) => dump.header(line_no, body)?,
            Some(Block::Labels) => dump.label(line_no, body)?,
            Some(Block::Attributes) => dump.attribute(line_no, body)?,
            Some(Block::Transitions) => dump.transition(line_no, body)?,
            Some(Block::StateFeatures) => dump.state(line_no, body)?,
            Some(Block::Unknown) => {}
        }
    }
    if block.is_some() {
        return Err(ModelError::Syntax {
            line: 0,
            message: "unterminated block at end of file".to_string(),
        });
    }
    dump.finish()
}

/// Opens and reads a model dump from disk.
pub fn load_model(path: impl AsRef<Path>) -> Result<WeightTable, ModelError> {
    let path = path.as_ref();
    let file = File::open(path).map_err(|source| ModelError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let table = read_model(BufReader::new(file))?;
    info!(
        path = %path.display(),
        labels = table.num_labels(),
        attributes = table.num_attributes(),
        state_features = table.num_state_features(),
        "model loaded"
    );
    Ok(table)
}

impl WeightTable {
    /// Writes the table in the format [`read_model`] reads.
    pub fn dump<W: Write>(&self, w: &mut W) -> io::Result<()> {
        let labels = self.labels();
        writeln!(w, "FILEHEADER = {{")?;
        writeln!(w, "  model_order: 1")?;
        writeln!(w, "  num_labels: {}", labels.len())?;
        writeln!(w, "  num_attrs: {}", self.num_attributes())?;
        writeln!(w, "  num_state_features: {}", self.num_state_features())?;
        writeln!(w, "}}\n")?;

        writeln!(w, "LABELS = {{")?;
        for id in labels.ids() {
            writeln!(w, "  {:>5}: {}", id.index(), labels.name(id))?;
        }
        writeln!(w, "}}\n")?;

        writeln!(w, "ATTRIBUTES = {{")?;
        for (i, attr) in self.attr_names().iter().enumerate() {
            writeln!(w, "  {i:>5}: {attr}")?;
        }
        writeln!(w, "}}\n")?;

        writeln!(w, "TRANSITIONS = {{")?;
        for prev in labels.ids() {
            for cur in labels.ids() {
                let weight = self.transition(prev, cur);
                if weight != 0.0 {
                    writeln!(w, "  (1) {} --> {}: {weight}", labels.name(prev), labels.name(cur))?;
                }
            }
        }
        writeln!(w, "}}\n")?;

        writeln!(w, "STATE_FEATURES = {{")?;
        for attr in self.attr_names() {
            let Some(id) = self.attr_id(attr) else {
                continue;
            };
            for (label, weight) in self.state_weights(id) {
                writeln!(w, "  (0) {attr} --> {}: {weight}", labels.name(*label))?;
            }
        }
        writeln!(w, "}}")?;
        Ok(())
    }
}

/// `key: value` with the split at the first colon.
fn split_entry(line_no: usize, body: &str) -> Result<(&str, &str), ModelError> {
    match body.split_once(':') {
        Some((key, value)) if !key.trim().is_empty() && !value.trim().is_empty() => {
            Ok((key.trim(), value.trim()))
        }
        _ => Err(ModelError::Syntax {
            line: line_no,
            message: format!("expected `key: value`, found {body:?}"),
        }),
    }
}

/// `(type) source --> target: weight`.
fn split_weight(line_no: usize, body: &str) -> Result<(&str, &str, f64), ModelError> {
    let syntax = || ModelError::Syntax {
        line: line_no,
        message: format!("expected `(n) source --> target: weight`, found {body:?}"),
    };
    let rest = match body.strip_prefix('(') {
        Some(r) => r.split_once(')').map(|(_, rest)| rest.trim_start()).ok_or_else(syntax)?,
        None => body,
    };
    let (lhs, weight) = rest.rsplit_once(':').ok_or_else(syntax)?;
    let (source, target) = lhs.rsplit_once(" --> ").ok_or_else(syntax)?;
    let weight: f64 = parse_field(line_no, "weight", weight.trim())?;
    let (source, target) = (source.trim(), target.trim());
    if source.is_empty() || target.is_empty() {
        return Err(syntax());
    }
    Ok((source, target, weight))
}

fn parse_field<T: std::str::FromStr>(line_no: usize, what: &str, value: &str) -> Result<T, ModelError> {
    value.trim().parse().map_err(|_| ModelError::Syntax {
        line: line_no,
        message: format!("invalid {what} {value:?}"),
    })
}

fn at_line(line_no: usize, err: ModelError) -> ModelError {
    match err {
        ModelError::Syntax { .. } | ModelError::UnknownAttribute { .. } => err,
        other => ModelError::Syntax {
            line: line_no,
            message: other.to_string(),
        },
    }
}
