//! # Feature Templates
//!
//! For each position of a token sequence, produces the set of feature keys the
//! weight table is looked up with. Every enabled template is compiled once from
//! configuration into a [`FeatureTemplate`] value; extraction is then a pure
//! function of the tokens and the position.
//!
//! ## Key naming
//!
//! Keys are strings of the form `name=value`, or a bare `name` for unary
//! predicates. Names carry the relative offsets they read:
//!
//! | Template | Example key |
//! |----------|-------------|
//! | word at offset | `W[-1]=the` |
//! | lowercased word | `lcW[0]=paris` |
//! | POS tag / lemma | `POS[1]=NN`, `L[0]=be` |
//! | word n-gram | `W[-1..0]=New|York` |
//! | POS n-gram | `POS=DT|NN` |
//! | word and POS | `W|POS=York|NNP` |
//! | prefix / suffix | `Pref=Yo`, `Suff=rk` |
//! | character n-gram | `CharNgram[1..2]=or` |
//! | shape / vowel-consonant | `Shape=Xxxx`, `VC=CVCC` |
//! | token class | `TokClass=WORD` |
//! | context window | `InLC[-4..0]=in`, `InRC[0..4]=city` |
//! | regex / lexicon | `Regex=year`, `PatternClass[-1..0]=CITY` |
//! | context clue | `LC-Clue=TITLE`, `RC-Clue=VERB_SAID` |
//! | orthography, delimiters | `InitUpper`, `<BOS>`, `<EOS>` |
//!
//! `:` inside word-derived values is written as `__COLON__`. An offset that
//! falls outside the sequence reads the boundary value [`BOS_MARKER`] or
//! [`EOS_MARKER`] instead of a token. POS n-grams are the exception: they
//! carry no offsets in their name and are only produced when every tag they
//! join lies inside the sequence.

use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::path::Path;

use regex::Regex;
use serde::{Deserialize, Serialize};
use unicode_segmentation::UnicodeSegmentation;

use crate::error::ConfigError;
use crate::tokenizer::Token;

/// Value read by an offset before the first token.
pub const BOS_MARKER: &str = "__BOS__";
/// Value read by an offset after the last token.
pub const EOS_MARKER: &str = "__EOS__";

const COLON_MASK: &str = "__COLON__";
const NGRAM_SEP: &str = "|";

/// Largest absolute offset a positional template may read.
pub const MAX_OFFSET: i32 = 2;

/// Feature keys active at one position. Duplicates collapse.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FeatureVector {
    pub token_index: usize,
    pub keys: BTreeSet<String>,
}

impl FeatureVector {
    pub fn new(token_index: usize) -> Self {
        Self {
            token_index,
            keys: BTreeSet::new(),
        }
    }

    pub fn insert(&mut self, key: impl Into<String>) {
        self.keys.insert(key.into());
    }

    pub fn contains(&self, key: &str) -> bool {
        self.keys.contains(key)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.keys.iter().map(String::as_str)
    }
}

/// Token attribute read by positional templates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Attribute {
    Word,
    LowercaseWord,
    Pos,
    Lemma,
}

impl Attribute {
    fn prefix(self) -> &'static str {
        match self {
            Attribute::Word => "W",
            Attribute::LowercaseWord => "lcW",
            Attribute::Pos => "POS",
            Attribute::Lemma => "L",
        }
    }

    fn value(self, token: &Token) -> Option<String> {
        match self {
            Attribute::Word => Some(mask(&token.text)),
            Attribute::LowercaseWord => Some(mask(&token.text.to_lowercase())),
            Attribute::Pos => token.pos.clone(),
            Attribute::Lemma => token.lemma.as_deref().map(mask),
        }
    }
}

/// Orthographic predicate over the characters of a token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Orthography {
    AllUpper,
    AllDigit,
    AllSymbol,
    AllUpperOrDigit,
    AllUpperOrSymbol,
    AllDigitOrSymbol,
    AllUpperOrDigitOrSymbol,
    InitUpper,
    AllLetter,
    AllAlnum,
}

impl Orthography {
    pub const ALL: [Orthography; 10] = [
        Orthography::AllUpper,
        Orthography::AllDigit,
        Orthography::AllSymbol,
        Orthography::AllUpperOrDigit,
        Orthography::AllUpperOrSymbol,
        Orthography::AllDigitOrSymbol,
        Orthography::AllUpperOrDigitOrSymbol,
        Orthography::InitUpper,
        Orthography::AllLetter,
        Orthography::AllAlnum,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Orthography::AllUpper => "AllUpper",
            Orthography::AllDigit => "AllDigit",
            Orthography::AllSymbol => "AllSymbol",
            Orthography::AllUpperOrDigit => "AllUpperOrDigit",
            Orthography::AllUpperOrSymbol => "AllUpperOrSymbol",
            Orthography::AllDigitOrSymbol => "AllDigitOrSymbol",
            Orthography::AllUpperOrDigitOrSymbol => "AllUpperOrDigitOrSymbol",
            Orthography::InitUpper => "InitUpper",
            Orthography::AllLetter => "AllLetter",
            Orthography::AllAlnum => "AllAlnum",
        }
    }

    fn holds(self, p: &CharProfile) -> bool {
        if p.empty {
            return false;
        }
        match self {
            Orthography::AllUpper => !p.digit && !p.lower && !p.symbol,
            Orthography::AllDigit => !p.upper && !p.lower && !p.symbol,
            Orthography::AllSymbol => !p.upper && !p.lower && !p.digit,
            Orthography::AllUpperOrDigit => !p.lower && !p.symbol,
            Orthography::AllUpperOrSymbol => !p.digit && !p.lower,
            Orthography::AllDigitOrSymbol => !p.upper && !p.lower,
            Orthography::AllUpperOrDigitOrSymbol => !p.lower,
            Orthography::InitUpper => p.init_upper,
            Orthography::AllLetter => !p.digit && !p.symbol,
            Orthography::AllAlnum => !p.symbol,
        }
    }
}

/// Which character classes occur in a token. `,` and `.` count as digits.
#[derive(Debug, Default)]
struct CharProfile {
    empty: bool,
    upper: bool,
    lower: bool,
    digit: bool,
    symbol: bool,
    init_upper: bool,
}

impl CharProfile {
    fn of(word: &str) -> Self {
        let mut p = CharProfile {
            empty: word.is_empty(),
            init_upper: word.chars().next().is_some_and(char::is_uppercase),
            ..Default::default()
        };
        for c in word.chars() {
            if c.is_uppercase() {
                p.upper = true;
            } else if c.is_numeric() || c == ',' || c == '.' {
                p.digit = true;
            } else if c.is_alphabetic() {
                p.lower = true;
            } else {
                p.symbol = true;
            }
        }
        p
    }
}

/// Where an n-gram sits relative to the current position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Anchor {
    /// Ends at the current token.
    Left,
    /// Contains the current token strictly inside.
    Center,
    /// Starts at the current token.
    Right,
}

/// A compiled feature template.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FeatureTemplate {
    /// Attribute of the token at a relative offset.
    At { attribute: Attribute, offset: i32 },
    TokenClass,
    Shape,
    VowelConsonant,
    Prefixes { max_len: usize },
    Suffixes { max_len: usize },
    Orthographic(Orthography),
    WordNgram { width: usize, anchor: Anchor },
    PosNgram { width: usize, anchor: Anchor },
    WordPos,
    CharNgrams { max_width: usize },
    LeftContext { range: usize },
    RightContext { range: usize },
    Bos,
    Eos,
    Regexes,
    Patterns,
    /// A clue phrase ends right before the current token.
    LeftContextClue,
    /// A clue phrase starts right after the current token.
    RightContextClue,
}

/// Window sizes used when expanding template names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateOptions {
    pub context_window: usize,
    /// Read from `NGramWindowSize` and validated. Extraction does not use it.
    pub ngram_window: usize,
    pub inner_ngrams: bool,
    pub max_prefix_len: usize,
    pub max_suffix_len: usize,
    pub char_ngram_width: usize,
}

impl Default for TemplateOptions {
    fn default() -> Self {
        Self {
            context_window: 4,
            ngram_window: 2,
            inner_ngrams: false,
            max_prefix_len: 4,
            max_suffix_len: 4,
            char_ngram_width: 4,
        }
    }
}

impl FeatureTemplate {
    /// Token attribute this template needs beyond the surface form.
    pub fn required_attribute(&self) -> Option<Attribute> {
        match self {
            FeatureTemplate::At { attribute, .. }
                if matches!(attribute, Attribute::Pos | Attribute::Lemma) =>
            {
                Some(*attribute)
            }
            FeatureTemplate::PosNgram { .. } | FeatureTemplate::WordPos => Some(Attribute::Pos),
            _ => None,
        }
    }

    /// Parses a single template name such as `W[-1]`, `lcW[0]`, `Shape` or `InitUpper`.
    pub fn parse(name: &str, opts: &TemplateOptions) -> Option<FeatureTemplate> {
        let name = name.trim();
        let simple = match name {
            "TokClass" => Some(FeatureTemplate::TokenClass),
            "Shape" => Some(FeatureTemplate::Shape),
            "VC" => Some(FeatureTemplate::VowelConsonant),
            "W|POS" => Some(FeatureTemplate::WordPos),
            "<BOS>" => Some(FeatureTemplate::Bos),
            "<EOS>" => Some(FeatureTemplate::Eos),
            "Regex" => Some(FeatureTemplate::Regexes),
            "PatternClass" => Some(FeatureTemplate::Patterns),
            "LC-Clue" => Some(FeatureTemplate::LeftContextClue),
            "RC-Clue" => Some(FeatureTemplate::RightContextClue),
            "Pref" => Some(FeatureTemplate::Prefixes {
                max_len: opts.max_prefix_len,
            }),
            "Suff" => Some(FeatureTemplate::Suffixes {
                max_len: opts.max_suffix_len,
            }),
            "CharNgram" => Some(FeatureTemplate::CharNgrams {
                max_width: opts.char_ngram_width,
            }),
            "InLC" => Some(FeatureTemplate::LeftContext {
                range: opts.context_window,
            }),
            "InRC" => Some(FeatureTemplate::RightContext {
                range: opts.context_window,
            }),
            _ => None,
        };
        if simple.is_some() {
            return simple;
        }
        if let Some(o) = Orthography::ALL.into_iter().find(|o| o.name() == name) {
            return Some(FeatureTemplate::Orthographic(o));
        }

        let (prefix, rest) = name.split_once('[')?;
        let offset: i32 = rest.strip_suffix(']')?.parse().ok()?;
        if offset.abs() > MAX_OFFSET {
            return None;
        }
        let attribute = match prefix {
            "W" => Attribute::Word,
            "lcW" => Attribute::LowercaseWord,
            "POS" => Attribute::Pos,
            "L" => Attribute::Lemma,
            _ => return None,
        };
        Some(FeatureTemplate::At { attribute, offset })
    }

    /// Expands a feature group name (`AllWords`, `AllPrefixes`...) into templates.
    pub fn expand_group(name: &str, opts: &TemplateOptions) -> Option<Vec<FeatureTemplate>> {
        let at = |attribute, offsets: &[i32]| -> Vec<FeatureTemplate> {
            offsets
                .iter()
                .map(|&offset| FeatureTemplate::At { attribute, offset })
                .collect()
        };
        let templates = match name.trim() {
            "HeadWord" => at(Attribute::Word, &[0]),
            "HeadWordLowercased" => at(Attribute::LowercaseWord, &[0]),
            "AllWords" => at(Attribute::Word, &[0, -1, -2, 1, 2]),
            "AllPrevWords" => at(Attribute::Word, &[-1, -2]),
            "AllNextWords" => at(Attribute::Word, &[1, 2]),
            "AllPosTags" => at(Attribute::Pos, &[0, -1, -2, 1, 2]),
            "AllLemmas" => at(Attribute::Lemma, &[0, -1, -2, 1, 2]),
            "AllPrefixes" => vec![FeatureTemplate::Prefixes {
                max_len: opts.max_prefix_len,
            }],
            "AllSuffixes" => vec![FeatureTemplate::Suffixes {
                max_len: opts.max_suffix_len,
            }],
            "AllDelim" => vec![FeatureTemplate::Bos, FeatureTemplate::Eos],
            "AllWBigrams" => word_ngrams(2, opts.inner_ngrams),
            "AllWTrigrams" => word_ngrams(3, opts.inner_ngrams),
            "AllWTetragrams" => word_ngrams(4, opts.inner_ngrams),
            "AllWPentagrams" => word_ngrams(5, opts.inner_ngrams),
            "AllWHexagrams" => word_ngrams(6, opts.inner_ngrams),
            "AllWHeptagrams" => word_ngrams(7, opts.inner_ngrams),
            "AllWOctagrams" => word_ngrams(8, opts.inner_ngrams),
            "AllWNonagrams" => word_ngrams(9, opts.inner_ngrams),
            "AllWDecagrams" => word_ngrams(10, opts.inner_ngrams),
            "AllWNgrams" => [word_ngrams(2, opts.inner_ngrams), word_ngrams(3, opts.inner_ngrams)].concat(),
            "AllPOSBigrams" => pos_ngrams(2),
            "AllPOSTrigrams" => pos_ngrams(3),
            "AllPOSgrams" => [pos_ngrams(2), pos_ngrams(3)].concat(),
            "AllTokenTypes" => Orthography::ALL
                .into_iter()
                .map(FeatureTemplate::Orthographic)
                .collect(),
            "AllPatterns" => vec![FeatureTemplate::Patterns],
            "AllContextClues" => vec![FeatureTemplate::LeftContextClue, FeatureTemplate::RightContextClue],
            "AllListFeatures" => vec![
                FeatureTemplate::LeftContextClue,
                FeatureTemplate::RightContextClue,
                FeatureTemplate::Patterns,
            ],
            "AllRegexes" => vec![FeatureTemplate::Regexes],
            "AllCharNgrams" => vec![FeatureTemplate::CharNgrams {
                max_width: opts.char_ngram_width,
            }],
            "LeftContextContains" => vec![FeatureTemplate::LeftContext {
                range: opts.context_window,
            }],
            "RightContextContains" => vec![FeatureTemplate::RightContext {
                range: opts.context_window,
            }],
            "AllContextContains" => vec![
                FeatureTemplate::LeftContext {
                    range: opts.context_window,
                },
                FeatureTemplate::RightContext {
                    range: opts.context_window,
                },
            ],
            "AllShapes" => vec![FeatureTemplate::Shape],
            "WordPOS" => vec![FeatureTemplate::WordPos],
            "TokenClass" => vec![FeatureTemplate::TokenClass],
            "VCPattern" => vec![FeatureTemplate::VowelConsonant],
            _ => return None,
        };
        Some(templates)
    }
}

fn word_ngrams(width: usize, inner: bool) -> Vec<FeatureTemplate> {
    let mut anchors = vec![Anchor::Left];
    if inner && width > 2 {
        anchors.push(Anchor::Center);
    }
    anchors.push(Anchor::Right);
    anchors
        .into_iter()
        .map(|anchor| FeatureTemplate::WordNgram { width, anchor })
        .collect()
}

fn pos_ngrams(width: usize) -> Vec<FeatureTemplate> {
    let anchors: &[Anchor] = if width > 2 {
        &[Anchor::Left, Anchor::Center, Anchor::Right]
    } else {
        &[Anchor::Left, Anchor::Right]
    };
    anchors
        .iter()
        .map(|&anchor| FeatureTemplate::PosNgram { width, anchor })
        .collect()
}

/// A regex tested against whole tokens. Matching tokens get `Regex=<name>`.
#[derive(Debug, Clone)]
pub struct NamedRegex {
    pub name: String,
    regex: Regex,
}

impl NamedRegex {
    /// Compiles `pattern` anchored at both ends.
    pub fn new(name: impl Into<String>, pattern: &str) -> Result<Self, ConfigError> {
        let name = name.into();
        match Regex::new(&format!("^(?:{pattern})$")) {
            Ok(regex) => Ok(Self { name, regex }),
            Err(source) => Err(ConfigError::Regex { name, source }),
        }
    }

    pub fn is_match(&self, text: &str) -> bool {
        self.regex.is_match(text)
    }
}

/// Reads `name<whitespace>pattern` lines. Blank lines and `#` comments are skipped.
pub fn load_regexes(path: &Path) -> Result<Vec<NamedRegex>, ConfigError> {
    let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let mut regexes = Vec::new();
    for (n, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((name, pattern)) = line.split_once(char::is_whitespace) else {
            return Err(ConfigError::Resource {
                path: path.to_path_buf(),
                line: n + 1,
                message: "expected `name pattern`".to_string(),
            });
        };
        regexes.push(NamedRegex::new(name, pattern.trim())?);
    }
    Ok(regexes)
}

#[derive(Debug, Clone, Default)]
struct LexNode {
    next: HashMap<String, usize>,
    values: Vec<String>,
}

/// Multi-token phrase list. Each phrase maps to one or more class values.
///
/// Stored as a token trie so all phrases starting at a position are found
/// in a single walk.
#[derive(Debug, Clone)]
pub struct Lexicon {
    nodes: Vec<LexNode>,
    longest: usize,
}

impl Default for Lexicon {
    fn default() -> Self {
        Self {
            nodes: vec![LexNode::default()],
            longest: 0,
        }
    }
}

impl Lexicon {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.longest == 0
    }

    pub fn insert<S: AsRef<str>>(&mut self, phrase: &[S], value: impl Into<String>) {
        if phrase.is_empty() {
            return;
        }
        let mut state = 0;
        for word in phrase {
            let word = word.as_ref();
            state = match self.nodes[state].next.get(word) {
                Some(&next) => next,
                None => {
                    self.nodes.push(LexNode::default());
                    let next = self.nodes.len() - 1;
                    self.nodes[state].next.insert(word.to_string(), next);
                    next
                }
            };
        }
        let value = value.into();
        if !self.nodes[state].values.contains(&value) {
            self.nodes[state].values.push(value);
        }
        self.longest = self.longest.max(phrase.len());
    }

    /// Parses `phrase<TAB>value` lines; the phrase is split on whitespace.
    pub fn parse(text: &str, path: &Path) -> Result<Self, ConfigError> {
        let mut lexicon = Lexicon::new();
        for (n, line) in text.lines().enumerate() {
            if line.trim().is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((phrase, value)) = line.rsplit_once('\t') else {
                return Err(ConfigError::Resource {
                    path: path.to_path_buf(),
                    line: n + 1,
                    message: "expected `phrase<TAB>value`".to_string(),
                });
            };
            let words: Vec<&str> = phrase.split_whitespace().collect();
            let value = value.trim();
            if words.is_empty() || value.is_empty() {
                return Err(ConfigError::Resource {
                    path: path.to_path_buf(),
                    line: n + 1,
                    message: "empty phrase or value".to_string(),
                });
            }
            lexicon.insert(&words, value);
        }
        Ok(lexicon)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&text, path)
    }

    /// Phrases that end right before `end`, with their values.
    fn ending_before(&self, tokens: &[Token], end: usize) -> Vec<&String> {
        let first = end.saturating_sub(self.longest);
        (first..end)
            .flat_map(|start| self.matches_from(tokens, start))
            .filter(|(last, _)| last + 1 == end)
            .flat_map(|(_, values)| values.iter())
            .collect()
    }

    /// Phrases starting at `start`, as (last token index, values).
    fn matches_from<'a>(&'a self, tokens: &[Token], start: usize) -> Vec<(usize, &'a [String])> {
        let mut found = Vec::new();
        let mut state = 0;
        for (end, token) in tokens.iter().enumerate().skip(start) {
            let Some(&next) = self.nodes[state].next.get(&token.text) else {
                break;
            };
            state = next;
            if !self.nodes[state].values.is_empty() {
                found.push((end, self.nodes[state].values.as_slice()));
            }
        }
        found
    }
}

/// Lists and regexes read by the resource-backed templates.
#[derive(Debug, Clone, Default)]
pub struct Resources {
    pub regexes: Vec<NamedRegex>,
    /// Phrase list behind `PatternClass`.
    pub patterns: Lexicon,
    /// Phrases that precede a target token (`LC-Clue`).
    pub left_clues: Lexicon,
    /// Phrases that follow a target token (`RC-Clue`).
    pub right_clues: Lexicon,
}

/// The compiled, ordered set of templates plus the resources they read.
#[derive(Debug, Clone)]
pub struct TemplateSet {
    templates: Vec<FeatureTemplate>,
    resources: Resources,
}

impl TemplateSet {
    /// Deduplicates `templates` (first occurrence wins) and checks that
    /// resource-backed templates have their resources.
    pub fn compile(templates: Vec<FeatureTemplate>, resources: Resources) -> Result<Self, ConfigError> {
        let mut unique: Vec<FeatureTemplate> = Vec::with_capacity(templates.len());
        for template in templates {
            if !unique.contains(&template) {
                unique.push(template);
            }
        }
        if unique.is_empty() {
            return Err(ConfigError::NoTemplates);
        }
        let missing = [
            (FeatureTemplate::Regexes, resources.regexes.is_empty(), "Regex"),
            (FeatureTemplate::Patterns, resources.patterns.is_empty(), "PatternClass"),
            (FeatureTemplate::LeftContextClue, resources.left_clues.is_empty(), "LC-Clue"),
            (FeatureTemplate::RightContextClue, resources.right_clues.is_empty(), "RC-Clue"),
        ];
        for (template, empty, name) in missing {
            if empty && unique.contains(&template) {
                return Err(ConfigError::MissingResource(name));
            }
        }
        Ok(Self {
            templates: unique,
            resources,
        })
    }

    pub fn templates(&self) -> &[FeatureTemplate] {
        &self.templates
    }

    /// Extracts the features of every position.
    pub fn extract(&self, tokens: &[Token]) -> Vec<FeatureVector> {
        (0..tokens.len()).map(|i| self.extract_at(tokens, i)).collect()
    }

    /// Extracts the features of position `i`.
    pub fn extract_at(&self, tokens: &[Token], i: usize) -> FeatureVector {
        let mut fv = FeatureVector::new(i);
        for template in &self.templates {
            self.apply(template, tokens, i, &mut fv);
        }
        fv
    }

    fn apply(&self, template: &FeatureTemplate, tokens: &[Token], i: usize, fv: &mut FeatureVector) {
        let token = &tokens[i];
        match *template {
            FeatureTemplate::At { attribute, offset } => {
                if let Some(value) = value_at(tokens, i, offset, |t| attribute.value(t)) {
                    add(fv, &format!("{}[{offset}]", attribute.prefix()), &value);
                }
            }
            FeatureTemplate::TokenClass => add(fv, "TokClass", token.class.name()),
            FeatureTemplate::Shape => add(fv, "Shape", &shape(&token.text)),
            FeatureTemplate::VowelConsonant => add(fv, "VC", &vowel_consonant(&token.text)),
            FeatureTemplate::Prefixes { max_len } => {
                let graphemes: Vec<&str> = token.text.graphemes(true).collect();
                for len in 1..=max_len.min(graphemes.len()) {
                    add(fv, "Pref", &mask(&graphemes[..len].concat()));
                }
            }
            FeatureTemplate::Suffixes { max_len } => {
                let graphemes: Vec<&str> = token.text.graphemes(true).collect();
                let n = graphemes.len();
                for len in 1..=max_len.min(n) {
                    add(fv, "Suff", &mask(&graphemes[n - len..].concat()));
                }
            }
            FeatureTemplate::Orthographic(o) => {
                if o.holds(&CharProfile::of(&token.text)) {
                    fv.insert(o.name());
                }
            }
            FeatureTemplate::WordNgram { width, anchor } => {
                for from in ngram_starts(width, anchor) {
                    let words: Option<Vec<String>> = (from..from + width as i32)
                        .map(|o| value_at(tokens, i, o, |t| Some(mask(&t.text))))
                        .collect();
                    if let Some(words) = words {
                        let name = format!("W[{from}..{}]", from + width as i32 - 1);
                        add(fv, &name, &words.join(NGRAM_SEP));
                    }
                }
            }
            FeatureTemplate::PosNgram { width, anchor } => {
                for from in ngram_starts(width, anchor) {
                    let Some(start) = i.checked_add_signed(from as isize) else {
                        continue;
                    };
                    let Some(window) = tokens.get(start..start + width) else {
                        continue;
                    };
                    let tags: Option<Vec<&str>> = window.iter().map(|t| t.pos.as_deref()).collect();
                    if let Some(tags) = tags {
                        add(fv, "POS", &tags.join(NGRAM_SEP));
                    }
                }
            }
            FeatureTemplate::WordPos => {
                if let Some(pos) = &token.pos {
                    add(fv, "W|POS", &format!("{}{NGRAM_SEP}{pos}", mask(&token.text)));
                }
            }
            FeatureTemplate::CharNgrams { max_width } => {
                let graphemes: Vec<&str> = token.text.graphemes(true).collect();
                if graphemes.len() > 1 {
                    for n in 2..=max_width.min(graphemes.len()) {
                        for start in 0..=graphemes.len() - n {
                            let name = format!("CharNgram[{start}..{}]", start + n - 1);
                            add(fv, &name, &mask(&graphemes[start..start + n].concat()));
                        }
                    }
                }
            }
            FeatureTemplate::LeftContext { range } => {
                let name = format!("InLC[-{range}..0]");
                for t in &tokens[i.saturating_sub(range)..i] {
                    add(fv, &name, &mask(&t.text));
                }
            }
            FeatureTemplate::RightContext { range } => {
                let name = format!("InRC[0..{range}]");
                let end = (i + 1 + range).min(tokens.len());
                for t in &tokens[i + 1..end] {
                    add(fv, &name, &mask(&t.text));
                }
            }
            FeatureTemplate::Bos => {
                if i == 0 {
                    fv.insert("<BOS>");
                }
            }
            FeatureTemplate::Eos => {
                if i + 1 == tokens.len() {
                    fv.insert("<EOS>");
                }
            }
            FeatureTemplate::Regexes => {
                for regex in &self.resources.regexes {
                    if regex.is_match(&token.text) {
                        add(fv, "Regex", &regex.name);
                    }
                }
            }
            FeatureTemplate::Patterns => {
                let patterns = &self.resources.patterns;
                let first = i.saturating_sub(patterns.longest.saturating_sub(1));
                for start in first..=i {
                    for (end, values) in patterns.matches_from(tokens, start) {
                        if end < i {
                            continue;
                        }
                        let name = format!(
                            "PatternClass[{}..{}]",
                            start as i64 - i as i64,
                            end as i64 - i as i64
                        );
                        for value in values {
                            add(fv, &name, value);
                        }
                    }
                }
            }
            FeatureTemplate::LeftContextClue => {
                for value in self.resources.left_clues.ending_before(tokens, i) {
                    add(fv, "LC-Clue", value);
                }
            }
            FeatureTemplate::RightContextClue => {
                for (_, values) in self.resources.right_clues.matches_from(tokens, i + 1) {
                    for value in values {
                        add(fv, "RC-Clue", value);
                    }
                }
            }
        }
    }
}

/// Relative start offsets of the n-grams an anchored template reads.
fn ngram_starts(width: usize, anchor: Anchor) -> Vec<i32> {
    let w = width as i32;
    match anchor {
        Anchor::Left => vec![1 - w],
        Anchor::Right => vec![0],
        Anchor::Center => (2 - w..0).collect(),
    }
}

/// Reads an attribute at `i + offset`, substituting the boundary markers
/// outside the sequence. `None` when the token lacks the attribute.
fn value_at<F>(tokens: &[Token], i: usize, offset: i32, read: F) -> Option<String>
where
    F: Fn(&Token) -> Option<String>,
{
    let target = i as i64 + offset as i64;
    if target < 0 {
        Some(BOS_MARKER.to_string())
    } else if target as usize >= tokens.len() {
        Some(EOS_MARKER.to_string())
    } else {
        read(&tokens[target as usize])
    }
}

fn add(fv: &mut FeatureVector, name: &str, value: &str) {
    if !value.is_empty() {
        fv.insert(format!("{name}={value}"));
    }
}

fn mask(text: &str) -> String {
    text.replace(':', COLON_MASK)
}

/// `X` upper, `x` lower, `9` digit, `-` and `.` kept, `#` anything else.
fn shape(text: &str) -> String {
    text.chars()
        .map(|c| match c {
            c if c.is_uppercase() => 'X',
            c if c.is_alphabetic() => 'x',
            c if c.is_numeric() => '9',
            '-' | '.' => c,
            _ => '#',
        })
        .collect()
}

fn vowel_consonant(text: &str) -> String {
    text.chars()
        .map(|c| match c {
            'a' | 'e' | 'i' | 'o' | 'u' | 'A' | 'E' | 'I' | 'O' | 'U' => 'V',
            c if c.is_alphabetic() => 'C',
            c if c.is_numeric() => '9',
            '-' | '.' => c,
            _ => '#',
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(templates: Vec<FeatureTemplate>) -> TemplateSet {
        TemplateSet::compile(templates, Resources::default()).unwrap()
    }

    fn group(name: &str) -> Vec<FeatureTemplate> {
        FeatureTemplate::expand_group(name, &TemplateOptions::default()).unwrap()
    }

    #[test]
    fn test_word_offsets_with_boundary_markers() {
        let tokens = Token::sequence(&["the", "cat"]);
        let features = set(group("AllWords")).extract(&tokens);

        let first = &features[0];
        assert!(first.contains("W[0]=the"));
        assert!(first.contains("W[-1]=__BOS__"));
        assert!(first.contains("W[-2]=__BOS__"));
        assert!(first.contains("W[1]=cat"));
        assert!(first.contains("W[2]=__EOS__"));
        assert_eq!(first.len(), 5);
        assert!(features[1].contains("W[-1]=the"));
    }

    #[test]
    fn test_single_token_sequence_never_panics() {
        let tokens = Token::sequence(&["alone"]);
        let mut templates = group("AllWords");
        templates.extend(group("AllWTrigrams"));
        templates.extend(group("AllContextContains"));
        let features = set(templates).extract(&tokens);
        assert!(features[0].contains("W[-2..0]=__BOS__|__BOS__|alone"));
        assert!(features[0].contains("W[0..2]=alone|__EOS__|__EOS__"));
    }

    #[test]
    fn test_prefixes_suffixes_and_colon_mask() {
        let tokens = Token::sequence(&["a:b"]);
        let fv = set(vec![
            FeatureTemplate::Prefixes { max_len: 4 },
            FeatureTemplate::Suffixes { max_len: 2 },
            FeatureTemplate::At {
                attribute: Attribute::Word,
                offset: 0,
            },
        ])
        .extract_at(&tokens, 0);
        assert!(fv.contains("Pref=a"));
        assert!(fv.contains("Pref=a__COLON__"));
        assert!(fv.contains("Pref=a__COLON__b"));
        assert!(fv.contains("Suff=b"));
        assert!(fv.contains("Suff=__COLON__b"));
        assert!(fv.contains("W[0]=a__COLON__b"));
        assert_eq!(fv.len(), 6);
    }

    #[test]
    fn test_orthography() {
        let cases = [
            ("NASA", vec!["AllUpper", "AllUpperOrDigit", "AllUpperOrSymbol", "AllUpperOrDigitOrSymbol", "InitUpper", "AllLetter", "AllAlnum"]),
            ("3.14", vec!["AllDigit", "AllUpperOrDigit", "AllDigitOrSymbol", "AllUpperOrDigitOrSymbol", "AllAlnum"]),
            ("--", vec!["AllSymbol", "AllUpperOrSymbol", "AllDigitOrSymbol", "AllUpperOrDigitOrSymbol"]),
            ("Paris", vec!["InitUpper", "AllLetter", "AllAlnum"]),
        ];
        let templates = set(group("AllTokenTypes"));
        for (word, expected) in cases {
            let fv = templates.extract_at(&Token::sequence(&[word]), 0);
            let mut got: Vec<&str> = fv.iter().collect();
            let mut expected = expected.clone();
            got.sort_unstable();
            expected.sort_unstable();
            assert_eq!(got, expected, "orthography of {word}");
        }
    }

    #[test]
    fn test_shape_and_vowel_consonant() {
        assert_eq!(shape("McD-9.x!"), "XxX-9.x#");
        assert_eq!(vowel_consonant("Anna-1"), "VCCV-9");
    }

    #[test]
    fn test_word_ngrams_inner() {
        let opts = TemplateOptions {
            inner_ngrams: true,
            ..Default::default()
        };
        let templates = FeatureTemplate::expand_group("AllWTetragrams", &opts).unwrap();
        assert_eq!(templates.len(), 3);
        let tokens = Token::sequence(&["a", "b", "c", "d", "e"]);
        let fv = set(templates).extract_at(&tokens, 2);
        assert!(fv.contains("W[-3..0]=__BOS__|a|b|c"));
        assert!(fv.contains("W[-2..1]=a|b|c|d"));
        assert!(fv.contains("W[-1..2]=b|c|d|e"));
        assert!(fv.contains("W[0..3]=c|d|e|__EOS__"));
    }

    #[test]
    fn test_pos_templates_need_tags() {
        let tokens: Vec<Token> = Token::sequence(&["the", "dog"])
            .into_iter()
            .zip(["DT", "NN"])
            .map(|(t, p)| t.with_pos(p))
            .collect();
        let mut templates = group("AllPOSBigrams");
        templates.push(FeatureTemplate::WordPos);
        let fv = set(templates).extract_at(&tokens, 1);
        let keys: Vec<&str> = fv.iter().collect();
        assert_eq!(keys, vec!["POS=DT|NN", "W|POS=dog|NN"]);

        let untagged = Token::sequence(&["the", "dog"]);
        let fv = set(vec![FeatureTemplate::WordPos]).extract_at(&untagged, 1);
        assert!(fv.is_empty());
    }

    #[test]
    fn test_pos_trigrams_stay_inside_the_sentence() {
        let tokens: Vec<Token> = Token::sequence(&["a", "big", "dog", "ran"])
            .into_iter()
            .zip(["DT", "JJ", "NN", "VBD"])
            .map(|(t, p)| t.with_pos(p))
            .collect();
        let features = set(group("AllPOSTrigrams")).extract(&tokens);
        let keys: Vec<&str> = features[1].iter().collect();
        assert_eq!(keys, vec!["POS=DT|JJ|NN", "POS=JJ|NN|VBD"]);
        let first: Vec<&str> = features[0].iter().collect();
        assert_eq!(first, vec!["POS=DT|JJ|NN"]);
    }

    #[test]
    fn test_word_ngram_group_has_bigrams_and_trigrams() {
        let templates = group("AllWNgrams");
        assert_eq!(templates.len(), 4);
        let tokens = Token::sequence(&["New", "York", "City"]);
        let fv = set(templates).extract_at(&tokens, 2);
        assert!(fv.contains("W[-1..0]=York|City"));
        assert!(fv.contains("W[-2..0]=New|York|City"));
        assert!(fv.contains("W[0..2]=City|__EOS__|__EOS__"));
    }

    #[test]
    fn test_context_clues() {
        let left = Lexicon::parse("Mr .\tTITLE\nsaid\tVERB\n", Path::new("lc.txt")).unwrap();
        let right = Lexicon::parse("said\tVERB_SAID\nsaid that\tVERB_SAID\n", Path::new("rc.txt")).unwrap();
        let resources = Resources {
            left_clues: left,
            right_clues: right,
            ..Default::default()
        };
        let templates = TemplateSet::compile(group("AllContextClues"), resources).unwrap();
        let tokens = Token::sequence(&["Mr", ".", "Smith", "said", "that"]);
        let features = templates.extract(&tokens);
        let keys: Vec<&str> = features[2].iter().collect();
        assert_eq!(keys, vec!["LC-Clue=TITLE", "RC-Clue=VERB_SAID"]);
        assert!(features[4].contains("LC-Clue=VERB"));
        assert!(features[0].is_empty());
        assert!(features[3].is_empty());
    }

    #[test]
    fn test_list_feature_group() {
        let templates = group("AllListFeatures");
        assert!(templates.contains(&FeatureTemplate::Patterns));
        assert!(templates.contains(&FeatureTemplate::LeftContextClue));
        assert!(templates.contains(&FeatureTemplate::RightContextClue));
    }

    #[test]
    fn test_char_ngrams() {
        let fv = set(vec![FeatureTemplate::CharNgrams { max_width: 3 }])
            .extract_at(&Token::sequence(&["abc"]), 0);
        let keys: Vec<&str> = fv.iter().collect();
        assert_eq!(
            keys,
            vec![
                "CharNgram[0..1]=ab",
                "CharNgram[0..2]=abc",
                "CharNgram[1..2]=bc"
            ]
        );
        let single = set(vec![FeatureTemplate::CharNgrams { max_width: 3 }])
            .extract_at(&Token::sequence(&["a"]), 0);
        assert!(single.is_empty());
    }

    #[test]
    fn test_context_window() {
        let tokens = Token::sequence(&["a", "b", "c", "d"]);
        let fv = set(vec![
            FeatureTemplate::LeftContext { range: 2 },
            FeatureTemplate::RightContext { range: 2 },
        ])
        .extract_at(&tokens, 1);
        assert!(fv.contains("InLC[-2..0]=a"));
        assert!(fv.contains("InRC[0..2]=c"));
        assert!(fv.contains("InRC[0..2]=d"));
        assert_eq!(fv.len(), 3);
    }

    #[test]
    fn test_delimiters() {
        let tokens = Token::sequence(&["x", "y", "z"]);
        let features = set(group("AllDelim")).extract(&tokens);
        assert!(features[0].contains("<BOS>"));
        assert!(features[1].is_empty());
        assert!(features[2].contains("<EOS>"));
    }

    #[test]
    fn test_regexes_match_whole_token() {
        let regexes = vec![
            NamedRegex::new("year", r"(19|20)\d\d").unwrap(),
            NamedRegex::new("digits", r"\d+").unwrap(),
        ];
        let resources = Resources {
            regexes,
            ..Default::default()
        };
        let templates = TemplateSet::compile(vec![FeatureTemplate::Regexes], resources).unwrap();
        let features = templates.extract(&Token::sequence(&["1999", "19999", "x1"]));
        assert!(features[0].contains("Regex=year"));
        assert!(features[0].contains("Regex=digits"));
        assert!(!features[1].contains("Regex=year"));
        assert!(features[2].is_empty());
    }

    #[test]
    fn test_invalid_regex_is_config_error() {
        assert!(matches!(
            NamedRegex::new("broken", "(unclosed"),
            Err(ConfigError::Regex { name, .. }) if name == "broken"
        ));
    }

    #[test]
    fn test_lexicon_patterns() {
        let lexicon = Lexicon::parse(
            "New York\tCITY\nNew York City\tCITY\nYork\tSURNAME\n",
            Path::new("patterns.txt"),
        )
        .unwrap();
        let resources = Resources {
            patterns: lexicon,
            ..Default::default()
        };
        let templates = TemplateSet::compile(vec![FeatureTemplate::Patterns], resources).unwrap();
        let tokens = Token::sequence(&["in", "New", "York", "City"]);
        let features = templates.extract(&tokens);
        assert!(features[0].is_empty());
        assert!(features[1].contains("PatternClass[0..1]=CITY"));
        assert!(features[1].contains("PatternClass[0..2]=CITY"));
        assert!(features[2].contains("PatternClass[-1..0]=CITY"));
        assert!(features[2].contains("PatternClass[0..0]=SURNAME"));
        assert!(features[3].contains("PatternClass[-2..0]=CITY"));
        assert_eq!(features[3].len(), 1);
    }

    #[test]
    fn test_lexicon_rejects_malformed_line() {
        let err = Lexicon::parse("no tab here\n", Path::new("p.txt")).unwrap_err();
        assert!(matches!(err, ConfigError::Resource { line: 1, .. }));
    }

    #[test]
    fn test_compile_dedupes_and_requires_resources() {
        let templates = set([group("HeadWord"), group("AllWords")].concat());
        assert_eq!(templates.templates().len(), 5);
        assert!(matches!(
            TemplateSet::compile(Vec::new(), Resources::default()),
            Err(ConfigError::NoTemplates)
        ));
        assert!(matches!(
            TemplateSet::compile(group("AllRegexes"), Resources::default()),
            Err(ConfigError::MissingResource("Regex"))
        ));
        assert!(matches!(
            TemplateSet::compile(group("AllContextClues"), Resources::default()),
            Err(ConfigError::MissingResource("LC-Clue"))
        ));
    }

    #[test]
    fn test_parse_single_templates() {
        let opts = TemplateOptions::default();
        assert_eq!(
            FeatureTemplate::parse("lcW[0]", &opts),
            Some(FeatureTemplate::At {
                attribute: Attribute::LowercaseWord,
                offset: 0
            })
        );
        assert_eq!(
            FeatureTemplate::parse("InitUpper", &opts),
            Some(FeatureTemplate::Orthographic(Orthography::InitUpper))
        );
        assert_eq!(FeatureTemplate::parse("W[-3]", &opts), None);
        assert_eq!(FeatureTemplate::parse("X[0]", &opts), None);
        assert_eq!(
            FeatureTemplate::parse("POS[1]", &opts).and_then(|t| t.required_attribute()),
            Some(Attribute::Pos)
        );
    }

    #[test]
    fn test_extraction_is_deterministic() {
        let tokens = Token::sequence(&["Mr", "Smith", "went", "to", "Washington"]);
        let mut templates = group("AllWords");
        templates.extend(group("AllPrefixes"));
        templates.extend(group("AllShapes"));
        let templates = set(templates);
        assert_eq!(templates.extract(&tokens), templates.extract(&tokens));
    }
}
