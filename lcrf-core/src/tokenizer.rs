//! # Tokenizer
//!
//! Splits raw running text into tokens and sentences. Every token keeps its byte
//! offsets into the input so that labeled spans can be mapped back to the
//! original text.
//!
//! ## Token classes
//!
//! Each token carries a coarse [`TokenClass`] (word, number, punctuation, quote,
//! bracket, dash, symbol). The class feeds the `TokClass` feature template and
//! drives sentence splitting: a sentence ends after `.`, `!` or `?`, and any
//! closing quotes or brackets right after the terminator stay in the sentence.
//!
//! ## Pluggable tokenization
//!
//! The pipeline talks to tokenizers through the [`Tokenize`] trait.
//! [`RunningTextTokenizer`] is the default; callers with their own segmentation
//! can plug in anything that yields [`Token`]s.
//!
//! ```rust
//! use lcrf_core::tokenizer::{split_sentences, tokenize};
//!
//! let tokens = tokenize("Dr. Smith arrived. \"Welcome!\" said Ann.");
//! let sentences = split_sentences(tokens);
//! assert_eq!(sentences.len(), 3);
//! assert_eq!(sentences[1].last().unwrap().text, "\"");
//! ```

use serde::{Deserialize, Serialize};

use crate::error::SequenceError;

/// Coarse orthographic class of a token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TokenClass {
    Word,
    Number,
    Punct,
    LQuote,
    RQuote,
    LBracket,
    RBracket,
    Dash,
    Symbol,
}

impl TokenClass {
    /// Name used in feature keys and TSV output.
    pub fn name(self) -> &'static str {
        match self {
            TokenClass::Word => "WORD",
            TokenClass::Number => "NUMBER",
            TokenClass::Punct => "PUNCT",
            TokenClass::LQuote => "L_QUOTE",
            TokenClass::RQuote => "R_QUOTE",
            TokenClass::LBracket => "L_BRACKET",
            TokenClass::RBracket => "R_BRACKET",
            TokenClass::Dash => "DASH",
            TokenClass::Symbol => "SYMBOL",
        }
    }

    /// Classifies a token without context. A bare `"` counts as an opening quote.
    pub fn of(text: &str) -> TokenClass {
        let mut chars = text.chars();
        let (Some(first), None) = (chars.next(), chars.next()) else {
            return classify_multi(text);
        };
        match first {
            '.' | ',' | ';' | ':' | '!' | '?' => TokenClass::Punct,
            '"' | '“' | '„' | '«' | '‘' => TokenClass::LQuote,
            '”' | '»' | '’' => TokenClass::RQuote,
            '(' | '[' | '{' => TokenClass::LBracket,
            ')' | ']' | '}' => TokenClass::RBracket,
            '-' | '–' | '—' => TokenClass::Dash,
            c if c.is_numeric() => TokenClass::Number,
            c if c.is_alphabetic() => TokenClass::Word,
            _ => TokenClass::Symbol,
        }
    }
}

fn classify_multi(text: &str) -> TokenClass {
    if text.is_empty() {
        return TokenClass::Symbol;
    }
    let has_digit = text.chars().any(char::is_numeric);
    if has_digit && text.chars().all(|c| c.is_numeric() || c == '.' || c == ',') {
        TokenClass::Number
    } else if text.chars().all(|c| c == '-' || c == '–' || c == '—') {
        TokenClass::Dash
    } else if text.chars().all(|c| c == '.') {
        TokenClass::Punct
    } else if text.chars().any(char::is_alphanumeric) {
        TokenClass::Word
    } else {
        TokenClass::Symbol
    }
}

/// A token of an input unit.
///
/// `pos`, `lemma` and `gold` are only filled when the input is column data
/// that carries those columns.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Token {
    /// Surface form.
    pub text: String,
    /// Start byte offset in the input (inclusive).
    pub start: usize,
    /// End byte offset in the input (exclusive).
    pub end: usize,
    /// Position in the unit (0, 1, 2...).
    pub index: usize,
    pub class: TokenClass,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pos: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lemma: Option<String>,
    /// Reference label, used for evaluation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gold: Option<String>,
}

impl Token {
    pub fn new(text: impl Into<String>, start: usize, end: usize) -> Self {
        let text = text.into();
        let class = TokenClass::of(&text);
        Self {
            text,
            start,
            end,
            index: 0,
            class,
            pos: None,
            lemma: None,
            gold: None,
        }
    }

    /// Builds a token sequence from bare words, offsets as if joined by single spaces.
    pub fn sequence<S: AsRef<str>>(words: &[S]) -> Vec<Token> {
        let mut offset = 0;
        words
            .iter()
            .enumerate()
            .map(|(i, w)| {
                let w = w.as_ref();
                let mut token = Token::new(w, offset, offset + w.len());
                token.index = i;
                offset += w.len() + 1;
                token
            })
            .collect()
    }

    pub fn with_pos(mut self, pos: impl Into<String>) -> Self {
        self.pos = Some(pos.into());
        self
    }

    pub fn with_lemma(mut self, lemma: impl Into<String>) -> Self {
        self.lemma = Some(lemma.into());
        self
    }

    pub fn with_gold(mut self, gold: impl Into<String>) -> Self {
        self.gold = Some(gold.into());
        self
    }

    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    fn ends_sentence(&self) -> bool {
        matches!(self.text.as_str(), "." | "!" | "?" | "..." | "…")
    }
}

/// Turns one unit of raw text into tokens.
///
/// Offsets are relative to `unit`. Implementations must be shareable across
/// worker threads.
pub trait Tokenize: Send + Sync {
    fn tokenize(&self, unit: &str) -> Result<Vec<Token>, SequenceError>;
}

/// Default tokenizer for running text.
///
/// Keeps common abbreviations (`Dr.`, `etc.`) and decimal numbers (`3.14`)
/// together, splits every other punctuation mark into its own token and keeps
/// in-word hyphens and apostrophes.
#[derive(Debug, Clone, Copy, Default)]
pub struct RunningTextTokenizer;

impl Tokenize for RunningTextTokenizer {
    fn tokenize(&self, unit: &str) -> Result<Vec<Token>, SequenceError> {
        Ok(tokenize(unit))
    }
}

/// Abbreviations whose period does not end a sentence.
const ABBREVIATIONS: &[&str] = &[
    "Dr", "Mr", "Mrs", "Ms", "Prof", "Sr", "Jr", "St", "Gen", "Gov", "Sen", "Rep", "Col", "Capt",
    "Lt", "Inc", "Ltd", "Co", "Corp", "vs", "etc", "approx", "vol", "fig",
    "pp", "Jan", "Feb", "Mar", "Apr", "Jun", "Jul", "Aug", "Sep", "Sept", "Oct", "Nov",
    "Dec",
];

/// Tokenizes running text with [`RunningTextTokenizer`] rules.
pub fn tokenize(text: &str) -> Vec<Token> {
    let mut tokens = Vec::new();
    let mut current_start = 0;
    let mut current_text = String::new();
    let chars: Vec<(usize, char)> = text.char_indices().collect();

    for (i, &(byte_pos, ch)) in chars.iter().enumerate() {
        let next = chars.get(i + 1).map(|&(_, c)| c);
        let joins_word = matches!(ch, '-' | '\'' | '’')
            && !current_text.is_empty()
            && next.is_some_and(char::is_alphanumeric);
        if ch.is_alphanumeric() || joins_word {
            if current_text.is_empty() {
                current_start = byte_pos;
            }
            current_text.push(ch);
        } else if ch == '.' && !current_text.is_empty() {
            let is_abbrev = ABBREVIATIONS.contains(&current_text.as_str());
            let current_is_num = current_text.chars().all(char::is_numeric);
            let next_is_num = next.is_some_and(char::is_numeric);
            if is_abbrev || (current_is_num && next_is_num) {
                current_text.push('.');
            } else {
                flush_token(&mut tokens, &mut current_text, current_start, byte_pos);
                push_token(&mut tokens, ".", byte_pos, byte_pos + 1, TokenClass::Punct);
            }
        } else if ch == ','
            && !current_text.is_empty()
            && current_text.chars().all(char::is_numeric)
            && next.is_some_and(char::is_numeric)
        {
            current_text.push(',');
        } else if ch.is_whitespace() {
            flush_token(&mut tokens, &mut current_text, current_start, byte_pos);
        } else {
            flush_token(&mut tokens, &mut current_text, current_start, byte_pos);
            let end = byte_pos + ch.len_utf8();
            let class = if ch == '"' || ch == '\'' {
                quote_direction(&chars, i)
            } else {
                TokenClass::of(&text[byte_pos..end])
            };
            push_token(&mut tokens, &text[byte_pos..end], byte_pos, end, class);
        }
    }
    flush_token(&mut tokens, &mut current_text, current_start, text.len());

    for (i, token) in tokens.iter_mut().enumerate() {
        token.index = i;
    }
    tokens
}

/// A straight quote opens when it follows whitespace, an opening bracket or the start of text.
fn quote_direction(chars: &[(usize, char)], i: usize) -> TokenClass {
    let opens = i == 0
        || chars
            .get(i - 1)
            .is_some_and(|&(_, c)| c.is_whitespace() || matches!(c, '(' | '[' | '{'));
    if opens {
        TokenClass::LQuote
    } else {
        TokenClass::RQuote
    }
}

fn flush_token(tokens: &mut Vec<Token>, text: &mut String, start: usize, end: usize) {
    if !text.is_empty() {
        tokens.push(Token::new(std::mem::take(text), start, end));
    }
}

fn push_token(tokens: &mut Vec<Token>, text: &str, start: usize, end: usize, class: TokenClass) {
    let mut token = Token::new(text, start, end);
    token.class = class;
    tokens.push(token);
}

/// Splits a token stream into sentences.
///
/// Tokens are re-indexed per sentence; byte offsets are left untouched.
pub fn split_sentences(tokens: Vec<Token>) -> Vec<Vec<Token>> {
    let mut sentences = Vec::new();
    let mut current: Vec<Token> = Vec::new();
    let mut closing = false;

    for mut token in tokens {
        if closing && !matches!(token.class, TokenClass::RQuote | TokenClass::RBracket) {
            sentences.push(std::mem::take(&mut current));
            closing = false;
        }
        let ends = token.ends_sentence();
        token.index = current.len();
        current.push(token);
        if ends {
            closing = true;
        }
    }
    if !current.is_empty() {
        sentences.push(current);
    }
    sentences
}
