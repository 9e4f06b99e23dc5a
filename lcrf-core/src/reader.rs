//! # Unit Readers
//!
//! Splits an input stream into decoding units lazily, one unit per `next()`:
//!
//! - **running text**: each line is tokenized and split into sentences; every
//!   sentence is a unit. A line that is not valid UTF-8 or that the tokenizer
//!   rejects becomes one failed unit.
//! - **columns**: one token per line, whitespace separated columns, units
//!   separated by blank lines. A malformed line fails its whole block. A
//!   `Position` column gives the token's byte span; without one, offsets are
//!   counted as if tokens were joined by single spaces.
//!
//! Failures never stop the reader; only an I/O error ends the stream (after
//! being reported as a failed unit).

use std::collections::VecDeque;
use std::io::BufRead;
use std::sync::Arc;

use crate::config::{Column, ColumnLayout, InputMode};
use crate::error::SequenceError;
use crate::tokenizer::{split_sentences, Token, Tokenize};

/// One input unit before tagging.
#[derive(Debug)]
pub struct RawUnit {
    /// Position of the unit in its input, counting failed units.
    pub index: usize,
    pub tokens: Result<Vec<Token>, SequenceError>,
}

enum Source {
    Text(Arc<dyn Tokenize>),
    Columns(ColumnLayout),
}

/// Lazy iterator over the units of a reader.
pub struct UnitReader<R> {
    reader: R,
    source: Source,
    next_index: usize,
    line_no: usize,
    offset: usize,
    pending: VecDeque<Result<Vec<Token>, SequenceError>>,
    done: bool,
}

impl<R: BufRead> UnitReader<R> {
    pub fn new(reader: R, input: &InputMode, tokenizer: Arc<dyn Tokenize>) -> Self {
        let source = match input {
            InputMode::RunningText => Source::Text(tokenizer),
            InputMode::Columns(layout) => Source::Columns(layout.clone()),
        };
        Self {
            reader,
            source,
            next_index: 0,
            line_no: 0,
            offset: 0,
            pending: VecDeque::new(),
            done: false,
        }
    }

    /// Reads one raw line without its terminator. `None` at end of input.
    fn read_line(&mut self, buf: &mut Vec<u8>) -> Option<Result<usize, SequenceError>> {
        buf.clear();
        match self.reader.read_until(b'\n', buf) {
            Ok(0) => None,
            Ok(n) => {
                let start = self.offset;
                self.offset += n;
                self.line_no += 1;
                while matches!(buf.last(), Some(b'\n' | b'\r')) {
                    buf.pop();
                }
                Some(Ok(start))
            }
            Err(e) => Some(Err(SequenceError::Io(e))),
        }
    }

    /// Fills `pending` with the sentences of the next non-blank line.
    fn fill_text(&mut self, tokenizer: &dyn Tokenize) {
        let mut buf = Vec::new();
        loop {
            let start = match self.read_line(&mut buf) {
                None => {
                    self.done = true;
                    return;
                }
                Some(Err(e)) => {
                    self.done = true;
                    self.pending.push_back(Err(e));
                    return;
                }
                Some(Ok(start)) => start,
            };
            let line = match std::str::from_utf8(&buf) {
                Ok(line) => line,
                Err(e) => {
                    self.pending.push_back(Err(SequenceError::InvalidUtf8 {
                        valid_up_to: start + e.valid_up_to(),
                    }));
                    return;
                }
            };
            if line.trim().is_empty() {
                continue;
            }
            match tokenizer.tokenize(line) {
                Err(e) => self.pending.push_back(Err(e)),
                Ok(mut tokens) => {
                    for t in &mut tokens {
                        t.start += start;
                        t.end += start;
                    }
                    self.pending.extend(split_sentences(tokens).into_iter().map(Ok));
                }
            }
            if !self.pending.is_empty() {
                return;
            }
        }
    }

    /// Reads the next blank-line separated block.
    fn fill_columns(&mut self, layout: &ColumnLayout) {
        let mut buf = Vec::new();
        let mut tokens = Vec::new();
        let mut error = None;
        let mut unit_offset = 0;
        loop {
            match self.read_line(&mut buf) {
                None => {
                    self.done = true;
                    break;
                }
                Some(Err(e)) => {
                    self.done = true;
                    error.get_or_insert(e);
                    break;
                }
                Some(Ok(start)) => {
                    let line = match std::str::from_utf8(&buf) {
                        Ok(line) => line,
                        Err(e) => {
                            error.get_or_insert(SequenceError::InvalidUtf8 {
                                valid_up_to: start + e.valid_up_to(),
                            });
                            continue;
                        }
                    };
                    if line.trim().is_empty() {
                        if tokens.is_empty() && error.is_none() {
                            continue;
                        }
                        break;
                    }
                    if error.is_some() {
                        continue;
                    }
                    match column_token(line, layout, self.line_no, tokens.len(), unit_offset) {
                        Ok(token) => {
                            unit_offset = token.end + 1;
                            tokens.push(token);
                        }
                        Err(e) => error = Some(e),
                    }
                }
            }
        }
        match error {
            Some(e) => self.pending.push_back(Err(e)),
            None if !tokens.is_empty() => self.pending.push_back(Ok(tokens)),
            None => {}
        }
    }
}

fn column_token(
    line: &str,
    layout: &ColumnLayout,
    line_no: usize,
    index: usize,
    offset: usize,
) -> Result<Token, SequenceError> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.len() != layout.len() {
        return Err(SequenceError::ColumnCount {
            line: line_no,
            expected: layout.len(),
            found: fields.len(),
        });
    }
    let field = |column| layout.position(column).map(|i| fields[i]);
    let text = field(Column::Token).unwrap_or(fields[0]);
    let (start, end) = match field(Column::Position) {
        Some(value) => parse_position(value, text.len()).ok_or_else(|| SequenceError::InvalidPosition {
            line: line_no,
            value: value.to_string(),
        })?,
        None => (offset, offset + text.len()),
    };
    let mut token = Token::new(text, start, end);
    token.index = index;
    token.pos = field(Column::Tag).map(String::from);
    token.lemma = field(Column::Lemma).map(String::from);
    token.gold = field(Column::Label).map(String::from);
    Ok(token)
}

/// `start` or `(start,len)`, as written by the TSV output.
fn parse_position(value: &str, text_len: usize) -> Option<(usize, usize)> {
    match value.strip_prefix('(').and_then(|v| v.strip_suffix(')')) {
        Some(inner) => {
            let (start, len) = inner.split_once(',')?;
            let start: usize = start.trim().parse().ok()?;
            let len: usize = len.trim().parse().ok()?;
            Some((start, start + len))
        }
        None => {
            let start: usize = value.parse().ok()?;
            Some((start, start + text_len))
        }
    }
}

impl<R: BufRead> Iterator for UnitReader<R> {
    type Item = RawUnit;

    fn next(&mut self) -> Option<RawUnit> {
        if self.pending.is_empty() && !self.done {
            match &self.source {
                Source::Text(tokenizer) => {
                    let tokenizer = Arc::clone(tokenizer);
                    self.fill_text(tokenizer.as_ref());
                }
                Source::Columns(layout) => {
                    let layout = layout.clone();
                    self.fill_columns(&layout);
                }
            }
        }
        let tokens = self.pending.pop_front()?;
        let index = self.next_index;
        self.next_index += 1;
        Some(RawUnit { index, tokens })
    }
}
