//! # lcrf-core: linear-chain CRF tagging engine
//!
//! Applies a trained first-order linear-chain CRF to text: every token of a
//! sentence gets a label (part of speech, chunk tag, named-entity class) from
//! the globally best scoring label sequence.
//!
//! ## Architecture
//!
//! Data flows through a linear pipeline:
//!
//! 1.  **Input** ([`reader`], [`tokenizer`]): running text or column data, split into units.
//! 2.  **Feature extraction** ([`features`]): templates compiled from the [`config`] turn
//!     each token and its context into a set of feature keys (`W[-1]=the`, `Suff=ing`...).
//! 3.  **Scoring** ([`lattice`]): feature keys are looked up in the [`crf::WeightTable`]
//!     and summed into per-label emission scores.
//! 4.  **Decoding** ([`viterbi`]): dynamic programming finds the best label path.
//! 5.  **Output** ([`pipeline`], [`tagger`]): tagged tokens and collapsed segments
//!     (`B-PER I-PER` → one `PER` segment).
//!
//! ## Example
//!
//! ```rust
//! use lcrf_core::{Applier, CrfConfig, WeightTableBuilder};
//!
//! let config = CrfConfig::from_cfg_str("RunningText = yes\nHeadWord = yes\n").unwrap();
//!
//! let mut model = WeightTableBuilder::new(["O", "B-LOC"]).unwrap();
//! model.state("W[0]=Berlin", "B-LOC", 2.0).unwrap();
//!
//! let applier = Applier::new(config, model.build());
//! let results = applier.apply_to_text("I live in Berlin").unwrap();
//! let unit = results[0].tagged().unwrap();
//! assert_eq!(unit.labels().collect::<Vec<_>>(), ["O", "O", "O", "B-LOC"]);
//! assert_eq!(unit.segments[0].kind, "LOC");
//! ```
//!
//! ## Modules
//!
//! - [`pipeline`]: the [`Applier`] handle, single-unit and batch operations.
//! - [`model`]: reading and writing CRFsuite text dumps.
//! - [`evaluation`]: accuracy and precision / recall against reference labels.

pub mod config;
pub mod crf;
pub mod error;
pub mod evaluation;
pub mod features;
pub mod lattice;
pub mod model;
pub mod pipeline;
pub mod reader;
pub mod tagger;
pub mod tokenizer;
pub mod viterbi;

pub use config::{CrfConfig, InputMode, RawConfig};
pub use crf::{WeightTable, WeightTableBuilder};
pub use error::{ConfigError, DecodeError, Error, ModelError, Result, SequenceError};
pub use evaluation::Evaluation;
pub use model::{load_model, read_model};
pub use pipeline::{Applier, ApplierStats, CancelToken, TaggedUnit, UnitResult};
pub use reader::RawUnit;
pub use tagger::{LabelAlphabet, LabelId, Segment, TaggedToken};
pub use tokenizer::{Token, Tokenize};
