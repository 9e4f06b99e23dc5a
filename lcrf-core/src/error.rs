//! # Errors
//!
//! Each phase of the engine has its own error type so callers can tell a bad
//! configuration apart from a corrupt model or a single malformed input unit.
//!
//! | Type | Raised by | Scope |
//! |------|-----------|-------|
//! | [`ConfigError`] | configuration parsing, template compilation | fatal at startup |
//! | [`ModelError`] | weight table loading | fatal at startup |
//! | [`SequenceError`] | tokenization, column parsing | one unit only |
//! | [`DecodeError`] | lattice / decoder dimension checks | fatal for the job |
//!
//! [`Error`] wraps all four for callers that do not care which phase failed.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Invalid or inconsistent configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("line {line}: expected `Key = Value`, found {text:?}")]
    Syntax { line: usize, text: String },

    #[error("{key}: invalid boolean {value:?} (expected yes/no, true/false, 1/0)")]
    InvalidBool { key: String, value: String },

    #[error("{key}: invalid number {value:?}")]
    InvalidNumber { key: String, value: String },

    #[error("{key}: {value} is out of range ({constraint})")]
    OutOfRange {
        key: String,
        value: usize,
        constraint: &'static str,
    },

    #[error("unknown annotation scheme {0:?} (expected `bio` or `bilou`)")]
    UnknownScheme(String),

    #[error("unknown feature template or group {0:?}")]
    UnknownTemplate(String),

    #[error("template `{template}` reads the {attribute} attribute, which the input does not provide")]
    MissingAttribute {
        template: String,
        attribute: &'static str,
    },

    #[error("unknown column {0:?} (expected Token, Tag, Lemma or Label)")]
    UnknownColumn(String),

    #[error("column {0:?} is listed twice")]
    DuplicateColumn(String),

    #[error("column layout has no Token column")]
    MissingTokenColumn,

    #[error("regex `{name}`: {source}")]
    Regex {
        name: String,
        #[source]
        source: regex::Error,
    },

    #[error("{path}:{line}: {message}")]
    Resource {
        path: PathBuf,
        line: usize,
        message: String,
    },

    #[error("template `{0}` is enabled but no resource file was configured for it")]
    MissingResource(&'static str),

    #[error("no feature templates are enabled")]
    NoTemplates,

    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("invalid JSON configuration: {0}")]
    Json(#[from] serde_json::Error),
}

/// Missing, corrupt or unsupported model.
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("read error: {0}")]
    Read(#[from] io::Error),

    #[error("line {line}: {message}")]
    Syntax { line: usize, message: String },

    #[error("unsupported model order {0}, only first-order models can be applied")]
    UnsupportedOrder(u32),

    #[error("header declares {declared} labels but the model lists {found}")]
    LabelCountMismatch { declared: usize, found: usize },

    #[error("label ids are not contiguous: id {0} is missing")]
    MissingLabelId(usize),

    #[error("duplicate label {0:?}")]
    DuplicateLabel(String),

    #[error("unknown label {0:?}")]
    UnknownLabel(String),

    #[error("line {line}: attribute {attribute:?} is not declared in the ATTRIBUTES block")]
    UnknownAttribute { line: usize, attribute: String },

    #[error("weight {weight} for {feature} is not a finite number")]
    NonFiniteWeight { feature: String, weight: f64 },

    #[error("model has an empty label alphabet")]
    EmptyAlphabet,
}

/// A single input unit could not be turned into a token sequence.
///
/// Only the offending unit fails; the rest of the stream keeps going.
#[derive(Debug, Error)]
pub enum SequenceError {
    #[error("input is not valid UTF-8 (byte {valid_up_to})")]
    InvalidUtf8 { valid_up_to: usize },

    #[error("line {line}: expected {expected} columns, found {found}")]
    ColumnCount {
        line: usize,
        expected: usize,
        found: usize,
    },

    #[error("line {line}: bad token position {value:?}")]
    InvalidPosition { line: usize, value: String },

    #[error("read error: {0}")]
    Io(#[from] io::Error),

    #[error("tokenizer failed: {0}")]
    Tokenizer(String),
}

/// The lattice or transition table does not match the label alphabet.
///
/// This only happens when the model and the decoding inputs disagree, so it
/// aborts the job instead of being reported per unit.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("lattice has {found} labels per position, transition table has {expected}")]
    DimensionMismatch { expected: usize, found: usize },

    #[error("transition table has {found} cells, expected {expected}")]
    TransitionShape { expected: usize, found: usize },
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("model error: {0}")]
    Model(#[from] ModelError),

    #[error("sequence error: {0}")]
    Sequence(#[from] SequenceError),

    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_umbrella_wraps_phase_errors() {
        let err: Error = ModelError::UnsupportedOrder(2).into();
        assert!(matches!(err, Error::Model(ModelError::UnsupportedOrder(2))));
        assert_eq!(
            err.to_string(),
            "model error: unsupported model order 2, only first-order models can be applied"
        );
    }

    #[test]
    fn test_column_count_message() {
        let err = SequenceError::ColumnCount {
            line: 7,
            expected: 3,
            found: 2,
        };
        assert_eq!(err.to_string(), "line 7: expected 3 columns, found 2");
    }
}
