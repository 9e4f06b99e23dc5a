//! # Configuration
//!
//! A [`CrfConfig`] is built once at startup and never changes afterwards. It
//! fixes the input format, the annotation scheme, the default label and the
//! compiled feature templates.
//!
//! Two sources are accepted:
//!
//! - the line based `Key = Value` format (`#` starts a comment), where any key
//!   that is not a setting and is set to `yes` names a feature group:
//!
//! ```text
//! AnnotationScheme = bilou
//! DefaultLabel     = OTHER
//! RunningText      = yes
//! AllWords         = yes
//! AllPrefixes      = yes
//! ```
//!
//! - a JSON document deserialized into [`RawConfig`]:
//!
//! ```json
//! { "AnnotationScheme": "bio", "Columns": "Token;Tag;Label", "Features": ["AllWords"] }
//! ```
//!
//! Both go through the same validation: unknown groups, malformed values and
//! templates that read attributes the input cannot supply are rejected.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::ConfigError;
use crate::features::{
    load_regexes, Attribute, FeatureTemplate, Lexicon, Resources, TemplateOptions, TemplateSet,
};
use crate::tagger::AnnotationScheme;

/// Unvalidated configuration, as read from a file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "PascalCase", deny_unknown_fields)]
pub struct RawConfig {
    pub annotation_scheme: Option<String>,
    pub default_label: Option<String>,
    pub running_text: Option<bool>,
    pub output_token: Option<bool>,
    /// Column names separated by `;` or `|`.
    pub columns: Option<String>,
    pub model_order: Option<usize>,
    pub context_window_size: Option<usize>,
    #[serde(rename = "NGramWindowSize")]
    pub ngram_window_size: Option<usize>,
    pub inner_word_ngrams: Option<bool>,
    pub max_prefix_length: Option<usize>,
    pub max_suffix_length: Option<usize>,
    pub char_ngram_width: Option<usize>,
    pub regex_filename: Option<PathBuf>,
    pub patterns: Option<PathBuf>,
    /// Clue phrases preceding a target token, `phrase<TAB>value` lines.
    pub left_context_filename: Option<PathBuf>,
    /// Clue phrases following a target token.
    pub right_context_filename: Option<PathBuf>,
    /// Feature group names (`AllWords`, `AllShapes`...).
    pub features: Vec<String>,
    /// Single templates (`W[-1]`, `InitUpper`...).
    pub templates: Vec<String>,
}

impl RawConfig {
    /// Parses the `Key = Value` format.
    pub fn parse_cfg(text: &str) -> Result<Self, ConfigError> {
        let mut raw = RawConfig::default();
        for (n, line) in text.lines().enumerate() {
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            let Some((key, value)) = trimmed.split_once('=') else {
                return Err(ConfigError::Syntax {
                    line: n + 1,
                    text: line.to_string(),
                });
            };
            let (key, value) = (key.trim(), value.trim());
            if key.is_empty() || value.is_empty() {
                return Err(ConfigError::Syntax {
                    line: n + 1,
                    text: line.to_string(),
                });
            }
            match key {
                "AnnotationScheme" => raw.annotation_scheme = Some(value.to_string()),
                "DefaultLabel" => raw.default_label = Some(value.to_string()),
                "RunningText" => raw.running_text = Some(parse_bool(key, value)?),
                "OutputToken" => raw.output_token = Some(parse_bool(key, value)?),
                "Columns" => raw.columns = Some(value.to_string()),
                "ModelOrder" => raw.model_order = Some(parse_number(key, value)?),
                "ContextWindowSize" => raw.context_window_size = Some(parse_number(key, value)?),
                "NGramWindowSize" => raw.ngram_window_size = Some(parse_number(key, value)?),
                "InnerWordNgrams" => raw.inner_word_ngrams = Some(parse_bool(key, value)?),
                "MaxPrefixLength" => raw.max_prefix_length = Some(parse_number(key, value)?),
                "MaxSuffixLength" => raw.max_suffix_length = Some(parse_number(key, value)?),
                "CharNgramWidth" => raw.char_ngram_width = Some(parse_number(key, value)?),
                "RegexFilename" => raw.regex_filename = Some(PathBuf::from(value)),
                "Patterns" => raw.patterns = Some(PathBuf::from(value)),
                "LeftContextFilename" => raw.left_context_filename = Some(PathBuf::from(value)),
                "RightContextFilename" => raw.right_context_filename = Some(PathBuf::from(value)),
                "Templates" => raw.templates.extend(
                    value
                        .split(',')
                        .map(str::trim)
                        .filter(|t| !t.is_empty())
                        .map(String::from),
                ),
                group => {
                    if parse_bool(group, value)? {
                        raw.features.push(group.to_string());
                    }
                }
            }
        }
        Ok(raw)
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value {
        "yes" | "true" | "1" => Ok(true),
        "no" | "false" | "0" => Ok(false),
        _ => Err(ConfigError::InvalidBool {
            key: key.to_string(),
            value: value.to_string(),
        }),
    }
}

fn parse_number(key: &str, value: &str) -> Result<usize, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidNumber {
        key: key.to_string(),
        value: value.to_string(),
    })
}

/// A column of column-formatted input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Column {
    Token,
    Tag,
    Lemma,
    Label,
    /// Byte span of the token in its source, `start` or `(start,len)`.
    Position,
}

impl Column {
    fn parse(name: &str) -> Option<Column> {
        match name {
            "Token" => Some(Column::Token),
            "Tag" | "POS" => Some(Column::Tag),
            "Lemma" => Some(Column::Lemma),
            "Label" => Some(Column::Label),
            "Position" => Some(Column::Position),
            _ => None,
        }
    }
}

/// Order of the whitespace separated columns of a token line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnLayout {
    columns: Vec<Column>,
}

impl ColumnLayout {
    /// Parses `Token;Tag;Label` (also `|`-separated).
    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let mut columns = Vec::new();
        for name in text.split([';', '|']).map(str::trim).filter(|n| !n.is_empty()) {
            let column = Column::parse(name).ok_or_else(|| ConfigError::UnknownColumn(name.to_string()))?;
            if columns.contains(&column) {
                return Err(ConfigError::DuplicateColumn(name.to_string()));
            }
            columns.push(column);
        }
        if !columns.contains(&Column::Token) {
            return Err(ConfigError::MissingTokenColumn);
        }
        Ok(Self { columns })
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn position(&self, column: Column) -> Option<usize> {
        self.columns.iter().position(|c| *c == column)
    }

    pub fn has(&self, column: Column) -> bool {
        self.columns.contains(&column)
    }
}

impl Default for ColumnLayout {
    fn default() -> Self {
        Self {
            columns: vec![Column::Token],
        }
    }
}

/// How input units are read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum InputMode {
    /// Plain text, one or more sentences per line.
    RunningText,
    /// One token per line, blank line between units.
    Columns(ColumnLayout),
}

impl InputMode {
    fn provides(&self, attribute: Attribute) -> bool {
        match (self, attribute) {
            (_, Attribute::Word | Attribute::LowercaseWord) => true,
            (InputMode::RunningText, _) => false,
            (InputMode::Columns(layout), Attribute::Pos) => layout.has(Column::Tag),
            (InputMode::Columns(layout), Attribute::Lemma) => layout.has(Column::Lemma),
        }
    }
}

/// Validated configuration.
#[derive(Debug, Clone)]
pub struct CrfConfig {
    /// Informational. Segment assembly reads BIO and BILOU markers alike, so
    /// the scheme is validated and reported but does not change decoding.
    scheme: AnnotationScheme,
    default_label: String,
    input: InputMode,
    output_token: bool,
    options: TemplateOptions,
    templates: TemplateSet,
}

pub const DEFAULT_LABEL: &str = "O";

impl CrfConfig {
    /// Reads a `Key = Value` file. Relative resource paths resolve against
    /// the file's directory.
    pub fn from_cfg_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        info!(path = %path.display(), "loading configuration");
        Self::from_raw(RawConfig::parse_cfg(&text)?, path.parent())
    }

    pub fn from_cfg_str(text: &str) -> Result<Self, ConfigError> {
        Self::from_raw(RawConfig::parse_cfg(text)?, None)
    }

    pub fn from_json_str(text: &str) -> Result<Self, ConfigError> {
        let raw: RawConfig = serde_json::from_str(text)?;
        Self::try_from(raw)
    }

    /// Loads a configuration file, picking the format from the extension.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if path.extension().is_some_and(|ext| ext == "json") {
            let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
                path: path.to_path_buf(),
                source,
            })?;
            let raw: RawConfig = serde_json::from_str(&text)?;
            Self::from_raw(raw, path.parent())
        } else {
            Self::from_cfg_file(path)
        }
    }

    /// Validates `raw` and compiles its templates.
    pub fn from_raw(raw: RawConfig, base_dir: Option<&Path>) -> Result<Self, ConfigError> {
        let scheme = match raw.annotation_scheme.as_deref() {
            Some(s) => AnnotationScheme::parse(s).ok_or_else(|| ConfigError::UnknownScheme(s.to_string()))?,
            None => AnnotationScheme::default(),
        };
        if let Some(order) = raw.model_order {
            if order != 1 {
                return Err(ConfigError::OutOfRange {
                    key: "ModelOrder".to_string(),
                    value: order,
                    constraint: "only first-order models are supported",
                });
            }
        }

        let defaults = TemplateOptions::default();
        let options = TemplateOptions {
            context_window: at_least("ContextWindowSize", raw.context_window_size, defaults.context_window, 1)?,
            ngram_window: at_least("NGramWindowSize", raw.ngram_window_size, defaults.ngram_window, 2)?,
            inner_ngrams: raw.inner_word_ngrams.unwrap_or(defaults.inner_ngrams),
            max_prefix_len: at_least("MaxPrefixLength", raw.max_prefix_length, defaults.max_prefix_len, 1)?,
            max_suffix_len: at_least("MaxSuffixLength", raw.max_suffix_length, defaults.max_suffix_len, 1)?,
            char_ngram_width: at_least("CharNgramWidth", raw.char_ngram_width, defaults.char_ngram_width, 2)?,
        };

        let input = match (raw.running_text, raw.columns.as_deref()) {
            (Some(true), _) | (None, None) => InputMode::RunningText,
            (_, Some(columns)) => InputMode::Columns(ColumnLayout::parse(columns)?),
            (Some(false), None) => InputMode::Columns(ColumnLayout::default()),
        };

        let mut templates = Vec::new();
        for group in &raw.features {
            let expanded = FeatureTemplate::expand_group(group, &options)
                .ok_or_else(|| ConfigError::UnknownTemplate(group.clone()))?;
            templates.extend(expanded);
        }
        for name in &raw.templates {
            let template = FeatureTemplate::parse(name, &options)
                .ok_or_else(|| ConfigError::UnknownTemplate(name.clone()))?;
            templates.push(template);
        }

        let resolve = |p: &PathBuf| match base_dir {
            Some(dir) if p.is_relative() => dir.join(p),
            _ => p.clone(),
        };
        let list = |path: &Option<PathBuf>, template: FeatureTemplate| match path {
            Some(path) if templates.contains(&template) => Lexicon::load(&resolve(path)),
            _ => Ok(Lexicon::new()),
        };
        let resources = Resources {
            regexes: match &raw.regex_filename {
                Some(path) if templates.contains(&FeatureTemplate::Regexes) => load_regexes(&resolve(path))?,
                _ => Vec::new(),
            },
            patterns: list(&raw.patterns, FeatureTemplate::Patterns)?,
            left_clues: list(&raw.left_context_filename, FeatureTemplate::LeftContextClue)?,
            right_clues: list(&raw.right_context_filename, FeatureTemplate::RightContextClue)?,
        };
        let templates = TemplateSet::compile(templates, resources)?;

        let config = Self {
            scheme,
            default_label: raw.default_label.unwrap_or_else(|| DEFAULT_LABEL.to_string()),
            input,
            output_token: raw.output_token.unwrap_or(false),
            options,
            templates,
        };
        config.check_attributes()?;
        debug!(
            templates = config.templates.templates().len(),
            scheme = ?config.scheme,
            input = ?config.input,
            "configuration validated"
        );
        Ok(config)
    }

    /// Switches the input format, re-checking the templates against it.
    pub fn with_input(mut self, input: InputMode) -> Result<Self, ConfigError> {
        self.input = input;
        self.check_attributes()?;
        Ok(self)
    }

    fn check_attributes(&self) -> Result<(), ConfigError> {
        for template in self.templates.templates() {
            if let Some(attribute) = template.required_attribute() {
                if !self.input.provides(attribute) {
                    return Err(ConfigError::MissingAttribute {
                        template: format!("{template:?}"),
                        attribute: match attribute {
                            Attribute::Lemma => "Lemma",
                            _ => "Tag",
                        },
                    });
                }
            }
        }
        Ok(())
    }

    /// Annotation scheme named by the configuration. See the field docs.
    pub fn scheme(&self) -> AnnotationScheme {
        self.scheme
    }

    pub fn default_label(&self) -> &str {
        &self.default_label
    }

    pub fn input(&self) -> &InputMode {
        &self.input
    }

    pub fn is_running_text(&self) -> bool {
        self.input == InputMode::RunningText
    }

    /// Whether serializers should print the token next to its label.
    pub fn output_token(&self) -> bool {
        self.output_token
    }

    pub fn options(&self) -> &TemplateOptions {
        &self.options
    }

    pub fn templates(&self) -> &TemplateSet {
        &self.templates
    }
}

impl TryFrom<RawConfig> for CrfConfig {
    type Error = ConfigError;

    /// Validates `raw` with resource paths taken as given.
    fn try_from(raw: RawConfig) -> Result<Self, ConfigError> {
        Self::from_raw(raw, None)
    }
}

fn at_least(key: &str, value: Option<usize>, default: usize, min: usize) -> Result<usize, ConfigError> {
    match value {
        None => Ok(default),
        Some(v) if v >= min => Ok(v),
        Some(v) => Err(ConfigError::OutOfRange {
            key: key.to_string(),
            value: v,
            constraint: if min == 1 { "must be at least 1" } else { "must be at least 2" },
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tokenizer::Token;

    #[test]
    fn test_parse_cfg_format() {
        let cfg = CrfConfig::from_cfg_str(
            "# NER setup\n\
             AnnotationScheme = bilou\n\
             DefaultLabel = OTHER\n\
             RunningText = yes\n\
             ContextWindowSize = 3\n\
             AllWords = yes\n\
             AllShapes = no\n\
             InitUpperUnused = no\n\
             Templates = InitUpper, TokClass\n",
        )
        .unwrap();
        assert_eq!(cfg.scheme(), AnnotationScheme::Bilou);
        assert_eq!(cfg.default_label(), "OTHER");
        assert!(cfg.is_running_text());
        assert_eq!(cfg.options().context_window, 3);
        assert_eq!(cfg.templates().templates().len(), 7);
    }

    #[test]
    fn test_defaults() {
        let cfg = CrfConfig::from_cfg_str("HeadWord = yes\n").unwrap();
        assert_eq!(cfg.scheme(), AnnotationScheme::Bio);
        assert_eq!(cfg.default_label(), "O");
        assert!(cfg.is_running_text());
        assert!(!cfg.output_token());
        assert_eq!(cfg.options(), &TemplateOptions::default());
    }

    #[test]
    fn test_unknown_group_rejected() {
        let err = CrfConfig::from_cfg_str("AllTheThings = yes\n").unwrap_err();
        assert!(matches!(err, ConfigError::UnknownTemplate(name) if name == "AllTheThings"));
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(matches!(
            CrfConfig::from_cfg_str("AllWords = maybe\n"),
            Err(ConfigError::InvalidBool { .. })
        ));
        assert!(matches!(
            CrfConfig::from_cfg_str("AllWords = yes\nContextWindowSize = four\n"),
            Err(ConfigError::InvalidNumber { .. })
        ));
        assert!(matches!(
            CrfConfig::from_cfg_str("AllWords = yes\nAnnotationScheme = iobx\n"),
            Err(ConfigError::UnknownScheme(_))
        ));
        assert!(matches!(
            CrfConfig::from_cfg_str("AllWords = yes\nNGramWindowSize = 1\n"),
            Err(ConfigError::OutOfRange { .. })
        ));
        assert!(matches!(
            CrfConfig::from_cfg_str("AllWords = yes\nModelOrder = 2\n"),
            Err(ConfigError::OutOfRange { .. })
        ));
        assert!(matches!(
            CrfConfig::from_cfg_str("AllWords\n"),
            Err(ConfigError::Syntax { line: 1, .. })
        ));
    }

    #[test]
    fn test_empty_template_set_rejected() {
        assert!(matches!(
            CrfConfig::from_cfg_str("RunningText = yes\n"),
            Err(ConfigError::NoTemplates)
        ));
    }

    #[test]
    fn test_pos_templates_need_tag_column() {
        let err = CrfConfig::from_cfg_str("RunningText = yes\nAllPosTags = yes\n").unwrap_err();
        assert!(matches!(err, ConfigError::MissingAttribute { attribute: "Tag", .. }));

        let cfg = CrfConfig::from_cfg_str("Columns = Token;Tag;Label\nAllPosTags = yes\n").unwrap();
        assert!(!cfg.is_running_text());

        let err = cfg.with_input(InputMode::RunningText).unwrap_err();
        assert!(matches!(err, ConfigError::MissingAttribute { .. }));
    }

    #[test]
    fn test_column_layout() {
        let layout = ColumnLayout::parse("Token|Tag|Label").unwrap();
        assert_eq!(layout.len(), 3);
        assert_eq!(layout.position(Column::Label), Some(2));
        assert!(!layout.has(Column::Lemma));
        assert!(matches!(
            ColumnLayout::parse("Tag;Label"),
            Err(ConfigError::MissingTokenColumn)
        ));
        assert!(matches!(
            ColumnLayout::parse("Token;Token"),
            Err(ConfigError::DuplicateColumn(_))
        ));
        assert!(matches!(
            ColumnLayout::parse("Token;Chunk"),
            Err(ConfigError::UnknownColumn(_))
        ));
    }

    #[test]
    fn test_json_config() {
        let cfg = CrfConfig::from_json_str(
            r#"{"AnnotationScheme": "bio", "Columns": "Token;Label", "Features": ["AllWords"], "Templates": ["Shape"]}"#,
        )
        .unwrap();
        assert_eq!(cfg.templates().templates().len(), 6);
        assert_eq!(
            cfg.input(),
            &InputMode::Columns(ColumnLayout::parse("Token;Label").unwrap())
        );
        assert!(matches!(
            CrfConfig::from_json_str(r#"{"Bogus": 1}"#),
            Err(ConfigError::Json(_))
        ));
    }

    #[test]
    fn test_missing_resource_file() {
        let err = CrfConfig::from_cfg_str("AllRegexes = yes\nRegexFilename = /nonexistent/regexes.txt\n")
            .unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
        let err = CrfConfig::from_cfg_str("AllRegexes = yes\n").unwrap_err();
        assert!(matches!(err, ConfigError::MissingResource("Regex")));
    }

    fn scratch_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("lcrf-config-{}-{name}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn test_json_resources_resolve_next_to_the_file() {
        let dir = scratch_dir("json");
        fs::write(dir.join("patterns.txt"), "New York\tCITY\n").unwrap();
        fs::write(dir.join("cfg.json"), r#"{"Features": ["AllPatterns"], "Patterns": "patterns.txt"}"#).unwrap();

        let cfg = CrfConfig::load(dir.join("cfg.json")).unwrap();
        let features = cfg.templates().extract(&Token::sequence(&["in", "New", "York"]));
        assert!(features[2].contains("PatternClass[-1..0]=CITY"));
        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_context_clue_files() {
        let dir = scratch_dir("clues");
        fs::write(dir.join("left.txt"), "Mr .\tTITLE\n").unwrap();
        fs::write(dir.join("right.txt"), "said\tVERB_SAID\n").unwrap();
        fs::write(
            dir.join("ner.cfg"),
            "AllContextClues = yes\nLeftContextFilename = left.txt\nRightContextFilename = right.txt\n",
        )
        .unwrap();

        let cfg = CrfConfig::load(dir.join("ner.cfg")).unwrap();
        let features = cfg.templates().extract(&Token::sequence(&["Mr", ".", "Smith", "said"]));
        let keys: Vec<&str> = features[2].iter().collect();
        assert_eq!(keys, vec!["LC-Clue=TITLE", "RC-Clue=VERB_SAID"]);

        let err = CrfConfig::from_cfg_str("AllContextClues = yes\n").unwrap_err();
        assert!(matches!(err, ConfigError::MissingResource("LC-Clue")));
        fs::remove_dir_all(&dir).unwrap();
    }
}
