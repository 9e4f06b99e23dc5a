//! # Label Alphabet and Segment Assembly
//!
//! Labels come from the model: the alphabet is whatever the weight table
//! declares, interned once into dense [`LabelId`]s so the lattice and the
//! decoder work on plain indices.
//!
//! ## Chunk labels
//!
//! For chunking and named entity models the labels follow a boundary scheme
//! (see [`AnnotationScheme`]). Both common spellings are understood:
//!
//! | Role | Prefix form | Suffix form |
//! |------|-------------|-------------|
//! | begin | `B-PER` | `PER_B` |
//! | inside | `I-PER` | `PER_I` |
//! | last (BILOU) | `L-PER` / `E-PER` | `PER_L` / `PER_E` |
//! | unit (BILOU) | `U-PER` / `S-PER` | `PER_U` / `PER_S` |
//! | outside | `O` or the configured default label | |
//!
//! Labels without a boundary marker (POS tags, for instance) never open a
//! segment.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ModelError;
use crate::tokenizer::Token;

/// Dense index of a label in a [`LabelAlphabet`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LabelId(u32);

impl LabelId {
    pub fn index(self) -> usize {
        self.0 as usize
    }

    pub(crate) fn from_index(index: usize) -> Self {
        LabelId(index as u32)
    }
}

impl fmt::Display for LabelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Closed, ordered set of labels known to a model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelAlphabet {
    names: Vec<String>,
    ids: HashMap<String, LabelId>,
}

impl LabelAlphabet {
    /// Interns labels in the given order. Fails on duplicates or an empty list.
    pub fn new<I, S>(labels: I) -> Result<Self, ModelError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut names = Vec::new();
        let mut ids = HashMap::new();
        for label in labels {
            let label = label.into();
            let id = LabelId::from_index(names.len());
            if ids.insert(label.clone(), id).is_some() {
                return Err(ModelError::DuplicateLabel(label));
            }
            names.push(label);
        }
        if names.is_empty() {
            return Err(ModelError::EmptyAlphabet);
        }
        Ok(Self { names, ids })
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn id(&self, label: &str) -> Option<LabelId> {
        self.ids.get(label).copied()
    }

    /// Name of an interned label. Ids always come from this alphabet.
    pub fn name(&self, id: LabelId) -> &str {
        &self.names[id.index()]
    }

    pub fn ids(&self) -> impl Iterator<Item = LabelId> + '_ {
        (0..self.names.len()).map(LabelId::from_index)
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }
}

/// Boundary convention used by chunk labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnnotationScheme {
    /// Begin / Inside / Outside.
    #[default]
    Bio,
    /// Begin / Inside / Last / Outside / Unit.
    Bilou,
}

impl AnnotationScheme {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "bio" | "iob" => Some(AnnotationScheme::Bio),
            "bilou" | "bioes" | "iobes" => Some(AnnotationScheme::Bilou),
            _ => None,
        }
    }
}

/// Boundary role of a label, with its segment type borrowed from the label.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Chunk<'a> {
    Outside,
    Begin(&'a str),
    Inside(&'a str),
    Last(&'a str),
    Unit(&'a str),
}

impl<'a> Chunk<'a> {
    /// Reads the boundary role of `label`. `default_label` and `O` are outside.
    pub fn parse(label: &'a str, default_label: &str) -> Chunk<'a> {
        if label == default_label || label == "O" {
            return Chunk::Outside;
        }
        if let Some((marker, kind)) = label.split_once('-') {
            if let Some(chunk) = Self::from_marker(marker, kind) {
                return chunk;
            }
        }
        if let Some((kind, marker)) = label.rsplit_once('_') {
            if let Some(chunk) = Self::from_marker(marker, kind) {
                return chunk;
            }
        }
        Chunk::Outside
    }

    fn from_marker(marker: &str, kind: &'a str) -> Option<Chunk<'a>> {
        if kind.is_empty() {
            return None;
        }
        match marker {
            "B" => Some(Chunk::Begin(kind)),
            "I" => Some(Chunk::Inside(kind)),
            "L" | "E" => Some(Chunk::Last(kind)),
            "U" | "S" => Some(Chunk::Unit(kind)),
            _ => None,
        }
    }
}

/// A token with the label chosen by the decoder.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaggedToken {
    pub token: Token,
    pub label: String,
    /// Posterior-style confidence of the label at this position (0.0 to 1.0).
    pub confidence: f64,
}

/// A maximal run of tokens forming one chunk or entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    /// Surface text of the run.
    pub text: String,
    /// Segment type (`PER`, `NP`...), i.e. the label without its boundary marker.
    pub kind: String,
    /// Index of the first token.
    pub start_token: usize,
    /// Index of the last token (inclusive).
    pub end_token: usize,
    /// Start byte offset of the first token.
    pub start: usize,
    /// End byte offset of the last token.
    pub end: usize,
    /// Mean confidence of the tokens in the run.
    pub confidence: f64,
}

struct OpenSegment<'a> {
    kind: &'a str,
    first: usize,
    last: usize,
}

/// Collapses a labeled sequence into segments.
///
/// The state machine is lenient: an `I-X` that does not continue an open `X`
/// run starts a new segment, and an `L-X` without an open run becomes a
/// one-token segment. Works for both BIO and BILOU output.
///
/// `[B-PER, I-PER, O, B-LOC]` gives two segments, `PER` over tokens 0..=1 and
/// `LOC` over token 3.
pub fn collapse_segments(tagged: &[TaggedToken], default_label: &str) -> Vec<Segment> {
    let mut segments = Vec::new();
    let mut open: Option<OpenSegment<'_>> = None;

    for (i, item) in tagged.iter().enumerate() {
        match Chunk::parse(&item.label, default_label) {
            Chunk::Outside => {
                close(&mut segments, tagged, open.take());
            }
            Chunk::Begin(kind) => {
                close(&mut segments, tagged, open.take());
                open = Some(OpenSegment { kind, first: i, last: i });
            }
            Chunk::Inside(kind) => match open.as_mut() {
                Some(seg) if seg.kind == kind => seg.last = i,
                _ => {
                    close(&mut segments, tagged, open.take());
                    open = Some(OpenSegment { kind, first: i, last: i });
                }
            },
            Chunk::Last(kind) => match open.take() {
                Some(mut seg) if seg.kind == kind => {
                    seg.last = i;
                    close(&mut segments, tagged, Some(seg));
                }
                other => {
                    close(&mut segments, tagged, other);
                    close(&mut segments, tagged, Some(OpenSegment { kind, first: i, last: i }));
                }
            },
            Chunk::Unit(kind) => {
                close(&mut segments, tagged, open.take());
                close(&mut segments, tagged, Some(OpenSegment { kind, first: i, last: i }));
            }
        }
    }
    close(&mut segments, tagged, open);
    segments
}

fn close(segments: &mut Vec<Segment>, tagged: &[TaggedToken], open: Option<OpenSegment<'_>>) {
    let Some(seg) = open else {
        return;
    };
    let run = &tagged[seg.first..=seg.last];
    let mut text = String::new();
    let mut prev_end = None;
    for item in run {
        if prev_end.is_some_and(|end| item.token.start > end) {
            text.push(' ');
        }
        text.push_str(&item.token.text);
        prev_end = Some(item.token.end);
    }
    let confidence = run.iter().map(|t| t.confidence).sum::<f64>() / run.len() as f64;
    segments.push(Segment {
        text,
        kind: seg.kind.to_string(),
        start_token: run[0].token.index,
        end_token: run[run.len() - 1].token.index,
        start: run[0].token.start,
        end: run[run.len() - 1].token.end,
        confidence,
    });
}
