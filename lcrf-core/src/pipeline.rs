//! # Tagging Pipeline
//!
//! The [`Applier`] ties a configuration and a loaded model together and runs
//! every unit through the same stages:
//!
//! 1. **Unit reading** ([`crate::reader`]): tokens of one sentence or block.
//! 2. **Feature extraction** ([`crate::features`]): one key set per token.
//! 3. **Scoring** ([`crate::lattice`]): emission scores per token and label.
//! 4. **Decoding** ([`crate::viterbi`]): best label path and confidences.
//! 5. **Assembly**: tagged tokens plus collapsed segments.
//!
//! Units share nothing but the read-only engine, so batches are decoded on the
//! rayon pool and merged back in input order. A unit that cannot be read is
//! reported as [`UnitResult::Failed`] and the job goes on.

use std::io::BufRead;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};

use rayon::prelude::*;
use serde::{Deserialize, Serialize, Serializer};
use tracing::{debug, info, warn};

use crate::config::CrfConfig;
use crate::crf::WeightTable;
use crate::error::{DecodeError, Error, SequenceError};
use crate::lattice;
use crate::model::load_model;
use crate::reader::{RawUnit, UnitReader};
use crate::tagger::{collapse_segments, LabelAlphabet, Segment, TaggedToken};
use crate::tokenizer::{RunningTextTokenizer, Token, Tokenize};
use crate::viterbi::viterbi_decode;

/// Result of tagging one unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaggedUnit {
    pub index: usize,
    pub tokens: Vec<TaggedToken>,
    /// Score of the Viterbi path.
    pub score: f64,
    pub segments: Vec<Segment>,
}

impl TaggedUnit {
    pub fn labels(&self) -> impl Iterator<Item = &str> {
        self.tokens.iter().map(|t| t.label.as_str())
    }
}

/// Outcome of one unit of a multi-unit job.
#[derive(Debug)]
pub enum UnitResult {
    Tagged(TaggedUnit),
    Failed { index: usize, error: SequenceError },
}

impl UnitResult {
    pub fn index(&self) -> usize {
        match self {
            UnitResult::Tagged(unit) => unit.index,
            UnitResult::Failed { index, .. } => *index,
        }
    }

    pub fn tagged(&self) -> Option<&TaggedUnit> {
        match self {
            UnitResult::Tagged(unit) => Some(unit),
            UnitResult::Failed { .. } => None,
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, UnitResult::Failed { .. })
    }
}

#[derive(Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
enum UnitResultRepr<'a> {
    Tagged(&'a TaggedUnit),
    Failed { index: usize, error: String },
}

impl Serialize for UnitResult {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            UnitResult::Tagged(unit) => UnitResultRepr::Tagged(unit),
            UnitResult::Failed { index, error } => UnitResultRepr::Failed {
                index: *index,
                error: error.to_string(),
            },
        }
        .serialize(serializer)
    }
}

/// Stops a job from dispatching further units. Units already being decoded
/// run to completion.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Running totals of an [`Applier`], shared by all its clones.
#[derive(Debug, Default)]
struct Counters {
    units: AtomicUsize,
    failed: AtomicUsize,
    tokens: AtomicUsize,
}

/// Snapshot of the counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ApplierStats {
    /// Units tagged successfully.
    pub units: usize,
    /// Units reported as failed.
    pub failed: usize,
    /// Tokens tagged.
    pub tokens: usize,
}

struct Engine {
    config: CrfConfig,
    model: WeightTable,
    tokenizer: Arc<dyn Tokenize>,
    counters: Counters,
}

/// Handle on a configuration and a model, cheap to clone and shareable
/// between threads.
#[derive(Clone)]
pub struct Applier {
    engine: Arc<Engine>,
}

impl std::fmt::Debug for Applier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Applier")
            .field("labels", &self.engine.model.num_labels())
            .field("templates", &self.engine.config.templates().templates().len())
            .finish()
    }
}

impl Applier {
    pub fn new(config: CrfConfig, model: WeightTable) -> Self {
        Self::with_tokenizer(config, model, Arc::new(RunningTextTokenizer))
    }

    /// Uses `tokenizer` instead of the default one for running text.
    pub fn with_tokenizer(config: CrfConfig, model: WeightTable, tokenizer: Arc<dyn Tokenize>) -> Self {
        if model.labels().id(config.default_label()).is_none() {
            warn!(
                default_label = config.default_label(),
                "default label is not in the model's alphabet"
            );
        }
        info!(
            labels = model.num_labels(),
            attributes = model.num_attributes(),
            templates = config.templates().templates().len(),
            scheme = ?config.scheme(),
            "applier ready"
        );
        Self {
            engine: Arc::new(Engine {
                config,
                model,
                tokenizer,
                counters: Counters::default(),
            }),
        }
    }

    /// Loads the configuration and the model from disk.
    pub fn load(config: impl AsRef<Path>, model: impl AsRef<Path>) -> Result<Self, Error> {
        let config = CrfConfig::load(config)?;
        let model = load_model(model)?;
        Ok(Self::new(config, model))
    }

    pub fn config(&self) -> &CrfConfig {
        &self.engine.config
    }

    pub fn model(&self) -> &WeightTable {
        &self.engine.model
    }

    pub fn labels(&self) -> &LabelAlphabet {
        self.engine.model.labels()
    }

    pub fn stats(&self) -> ApplierStats {
        let c = &self.engine.counters;
        ApplierStats {
            units: c.units.load(Ordering::Relaxed),
            failed: c.failed.load(Ordering::Relaxed),
            tokens: c.tokens.load(Ordering::Relaxed),
        }
    }

    /// Tags one token sequence.
    pub fn tag_tokens(&self, index: usize, tokens: Vec<Token>) -> Result<TaggedUnit, DecodeError> {
        let engine = &*self.engine;
        let features = engine.config.templates().extract(&tokens);
        let lattice = lattice::score(&engine.model, &features);
        let best = viterbi_decode(&lattice, engine.model.transitions())?;

        let labels = engine.model.labels();
        let tagged: Vec<TaggedToken> = tokens
            .into_iter()
            .zip(best.path.iter().zip(&best.confidences))
            .map(|(token, (label, confidence))| TaggedToken {
                token,
                label: labels.name(*label).to_string(),
                confidence: *confidence,
            })
            .collect();
        let segments = collapse_segments(&tagged, engine.config.default_label());

        engine.counters.units.fetch_add(1, Ordering::Relaxed);
        engine.counters.tokens.fetch_add(tagged.len(), Ordering::Relaxed);
        debug!(unit = index, tokens = tagged.len(), score = best.score, "unit tagged");

        Ok(TaggedUnit {
            index,
            tokens: tagged,
            score: best.score,
            segments,
        })
    }

    /// Tags one raw unit; reading failures become [`UnitResult::Failed`].
    pub fn apply_unit(&self, unit: RawUnit) -> Result<UnitResult, DecodeError> {
        match unit.tokens {
            Ok(tokens) => Ok(UnitResult::Tagged(self.tag_tokens(unit.index, tokens)?)),
            Err(error) => {
                self.engine.counters.failed.fetch_add(1, Ordering::Relaxed);
                warn!(unit = unit.index, %error, "unit failed");
                Ok(UnitResult::Failed {
                    index: unit.index,
                    error,
                })
            }
        }
    }

    /// Splits `reader` into units according to the configured input format.
    pub fn read_units<R: BufRead>(&self, reader: R) -> UnitReader<R> {
        UnitReader::new(reader, self.engine.config.input(), Arc::clone(&self.engine.tokenizer))
    }

    /// Tags one in-memory text. Running text may yield several sentences.
    pub fn apply_to_text(&self, text: &str) -> Result<Vec<UnitResult>, DecodeError> {
        self.apply_to_reader(text.as_bytes()).collect()
    }

    /// Tags units lazily, one result per pulled item.
    pub fn apply_to_units<'a, I>(&'a self, units: I) -> impl Iterator<Item = Result<UnitResult, DecodeError>> + 'a
    where
        I: IntoIterator<Item = RawUnit>,
        I::IntoIter: 'a,
    {
        units.into_iter().map(move |unit| self.apply_unit(unit))
    }

    /// Reads and tags a stream lazily.
    pub fn apply_to_reader<'a, R: BufRead + 'a>(
        &'a self,
        reader: R,
    ) -> impl Iterator<Item = Result<UnitResult, DecodeError>> + 'a {
        self.apply_to_units(self.read_units(reader))
    }

    /// Tags `units` in parallel. Results keep the input order; units not yet
    /// dispatched when `cancel` fires are left out.
    pub fn apply_batch(&self, units: Vec<RawUnit>, cancel: &CancelToken) -> Result<Vec<UnitResult>, DecodeError> {
        let results: Vec<Option<Result<UnitResult, DecodeError>>> = units
            .into_par_iter()
            .map(|unit| (!cancel.is_cancelled()).then(|| self.apply_unit(unit)))
            .collect();
        results.into_iter().flatten().collect()
    }

    /// Reads `reader` in chunks of `chunk_size` units, decodes each chunk in
    /// parallel and sends the results in input order. Stops early when
    /// `cancel` fires or the receiver hangs up. Returns the number of units
    /// sent.
    pub fn apply_streaming<R: BufRead>(
        &self,
        reader: R,
        chunk_size: usize,
        cancel: &CancelToken,
        tx: mpsc::Sender<UnitResult>,
    ) -> Result<usize, DecodeError> {
        let mut units = self.read_units(reader);
        let chunk_size = chunk_size.max(1);
        let mut sent = 0;
        while !cancel.is_cancelled() {
            let chunk: Vec<RawUnit> = units.by_ref().take(chunk_size).collect();
            if chunk.is_empty() {
                break;
            }
            for result in self.apply_batch(chunk, cancel)? {
                if tx.send(result).is_err() {
                    debug!(sent, "receiver dropped, stopping");
                    return Ok(sent);
                }
                sent += 1;
            }
        }
        Ok(sent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crf::WeightTableBuilder;

    fn applier() -> Applier {
        let config = CrfConfig::from_cfg_str("RunningText = yes\nHeadWord = yes\n").unwrap();
        let mut b = WeightTableBuilder::new(["O", "B-PER", "I-PER"]).unwrap();
        b.state("W[0]=Ada", "B-PER", 3.0).unwrap();
        b.state("W[0]=Lovelace", "I-PER", 3.0).unwrap();
        b.transition("B-PER", "I-PER", 1.0).unwrap();
        b.transition("O", "I-PER", -5.0).unwrap();
        Applier::new(config, b.build())
    }

    #[test]
    fn test_tag_tokens_and_segments() {
        let app = applier();
        let unit = app
            .tag_tokens(0, Token::sequence(&["Ada", "Lovelace", "wrote", "notes"]))
            .unwrap();
        assert_eq!(unit.labels().collect::<Vec<_>>(), vec!["B-PER", "I-PER", "O", "O"]);
        assert_eq!(unit.segments.len(), 1);
        assert_eq!(unit.segments[0].text, "Ada Lovelace");
        assert_eq!(unit.segments[0].kind, "PER");
        assert_eq!(app.stats().tokens, 4);
    }

    #[test]
    fn test_apply_to_text_splits_sentences() {
        let app = applier();
        let results = app.apply_to_text("Ada Lovelace wrote. She left.").unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[1].index(), 1);
        let first = results[0].tagged().unwrap();
        assert_eq!(first.tokens.len(), 4);
    }

    #[test]
    fn test_batch_preserves_order() {
        let app = applier();
        let units: Vec<RawUnit> = (0..50)
            .map(|i| RawUnit {
                index: i,
                tokens: if i % 7 == 3 {
                    Err(SequenceError::Tokenizer("boom".into()))
                } else {
                    Ok(Token::sequence(&["Ada"; 3][..(i % 3) + 1]))
                },
            })
            .collect();
        let results = app.apply_batch(units, &CancelToken::new()).unwrap();
        assert_eq!(results.len(), 50);
        for (i, r) in results.iter().enumerate() {
            assert_eq!(r.index(), i);
            assert_eq!(r.is_failed(), i % 7 == 3);
        }
        assert_eq!(app.stats().failed, 7);
    }

    #[test]
    fn test_cancelled_batch_dispatches_nothing() {
        let app = applier();
        let cancel = CancelToken::new();
        cancel.cancel();
        let units = vec![RawUnit {
            index: 0,
            tokens: Ok(Token::sequence(&["x"])),
        }];
        assert!(app.apply_batch(units, &cancel).unwrap().is_empty());
    }

    #[test]
    fn test_streaming_in_order() {
        let app = applier();
        let (tx, rx) = mpsc::channel();
        let text = "Ada one.\nAda two.\nAda three.\nAda four.\nAda five.\n";
        let sent = app.apply_streaming(text.as_bytes(), 2, &CancelToken::new(), tx).unwrap();
        assert_eq!(sent, 5);
        let indices: Vec<usize> = rx.iter().map(|r| r.index()).collect();
        assert_eq!(indices, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_failed_unit_serializes_with_status() {
        let failed = UnitResult::Failed {
            index: 2,
            error: SequenceError::Tokenizer("bad input".into()),
        };
        let json = serde_json::to_value(&failed).unwrap();
        assert_eq!(json["status"], "failed");
        assert_eq!(json["index"], 2);

        let tagged = applier().tag_tokens(0, Token::sequence(&["Ada"])).unwrap();
        let json = serde_json::to_value(UnitResult::Tagged(tagged)).unwrap();
        assert_eq!(json["status"], "tagged");
        assert_eq!(json["tokens"][0]["label"], "B-PER");
    }
}
