//! Corpus tokenizer.
//!
//! Tokens are maximal runs of bytes containing no Unicode whitespace. A
//! newline becomes the sentence-break token, and so does a period when
//! periods are treated as whitespace. Each token carries the byte offset
//! just past it, which the training threads use to stop at the end of their
//! slice of the corpus.

use std::fs::File;
use std::io::{self, BufRead, BufReader, ErrorKind, Seek, SeekFrom};
use std::path::Path;

use anyhow::{Context, Result};

use crate::CTX_BREAK_TOKEN;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Token {
    pub text: String,
    /// Absolute position in the corpus just after this token.
    pub offset: u64,
}

fn is_space(b: u8) -> bool {
    matches!(b, b' ' | b'\t' | b'\n' | b'\x0b' | b'\x0c' | b'\r')
}

/// Length in bytes of the non-ASCII whitespace character (U+00A0, U+3000
/// and the like) that `word` ends with, or 0.
fn trailing_space_len(word: &[u8]) -> usize {
    for len in 2..=word.len().min(3) {
        if let Ok(tail) = std::str::from_utf8(&word[word.len() - len..]) {
            let mut chars = tail.chars();
            if let (Some(c), None) = (chars.next(), chars.next()) {
                return if c.is_whitespace() { len } else { 0 };
            }
        }
    }
    0
}

pub struct Tokens<R> {
    reader: R,
    offset: u64,
    period_is_whitespace: bool,
}

impl<R: BufRead> Tokens<R> {
    /// `offset` is the position of `reader` within the corpus.
    pub fn new(reader: R, offset: u64, period_is_whitespace: bool) -> Self {
        Tokens {
            reader,
            offset,
            period_is_whitespace,
        }
    }

    fn read_token(&mut self) -> io::Result<Option<Token>> {
        let period_breaks = self.period_is_whitespace;
        let mut word = Vec::<u8>::new();
        loop {
            let buf = match self.reader.fill_buf() {
                Ok(buf) => buf,
                Err(ref e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            };
            if buf.is_empty() {
                break;
            }

            let mut used = 0;
            let mut word_done = false;
            let mut sentence_break = false;
            for &b in buf {
                if b == b'\n' || (period_breaks && b == b'.') {
                    // Leave the break for the next call if it ends a word.
                    if word.is_empty() {
                        used += 1;
                        sentence_break = true;
                    }
                    word_done = true;
                    break;
                }
                used += 1;
                if is_space(b) {
                    if word.is_empty() {
                        continue;
                    }
                    word_done = true;
                    break;
                }
                word.push(b);
                if b >= 0x80 {
                    let n = trailing_space_len(&word);
                    if n > 0 {
                        word.truncate(word.len() - n);
                        if word.is_empty() {
                            continue;
                        }
                        word_done = true;
                        break;
                    }
                }
            }
            self.reader.consume(used);
            self.offset += used as u64;

            if sentence_break {
                return Ok(Some(Token {
                    text: CTX_BREAK_TOKEN.to_string(),
                    offset: self.offset,
                }));
            }
            if word_done {
                break;
            }
        }

        Ok(if word.is_empty() {
            None
        } else {
            Some(Token {
                text: String::from_utf8_lossy(&word).into_owned(),
                offset: self.offset,
            })
        })
    }
}

impl<R: BufRead> Iterator for Tokens<R> {
    type Item = io::Result<Token>;

    fn next(&mut self) -> Option<io::Result<Token>> {
        self.read_token().transpose()
    }
}

/// Opens the corpus and positions it at byte `offset`.
pub fn open_corpus(
    path: &Path,
    offset: u64,
    period_is_whitespace: bool,
) -> Result<Tokens<BufReader<File>>> {
    let mut f = File::open(path)
        .with_context(|| format!("error opening corpus {}", path.display()))?;
    f.seek(SeekFrom::Start(offset))
        .context("error seeking within corpus")?;
    Ok(Tokens::new(
        BufReader::new(f),
        offset,
        period_is_whitespace,
    ))
}

pub fn file_size(path: &Path) -> Result<u64> {
    Ok(std::fs::metadata(path)
        .with_context(|| format!("error checking size of {}", path.display()))?
        .len())
}
