use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader, Write};
use std::ops::Index;
use std::path::Path;

use anyhow::{anyhow, ensure, Context, Result};
use serde::{Deserialize, Serialize};

use crate::real;

/// Trained vectors as written to `--output`.
#[derive(Serialize, Deserialize)]
pub struct Vectors {
    /// Embedding vector length (number of dimensions).
    size: usize,

    /// The vocabulary.
    vocab: Vec<String>,

    /// `embeddings[k * size..(k+1) * size]` is the vector embedding for word `k`.
    embeddings: Vec<real>,

    #[serde(skip)]
    index: HashMap<String, usize>,
}

impl Index<usize> for Vectors {
    type Output = [real];

    fn index(&self, i: usize) -> &[real] {
        &self.embeddings[i * self.size..][..self.size]
    }
}

fn build_index(vocab: &[String]) -> HashMap<String, usize> {
    vocab
        .iter()
        .enumerate()
        .map(|(i, w)| (w.clone(), i))
        .collect()
}

impl Vectors {
    pub fn new(size: usize, vocab: Vec<String>, embeddings: Vec<real>) -> Self {
        assert_eq!(vocab.len() * size, embeddings.len());
        Vectors {
            size,
            index: build_index(&vocab),
            vocab,
            embeddings,
        }
    }

    /// Reads the text format: a `words dim` line, then `word v1 ... vdim`
    /// per word.
    pub fn load(file_name: &Path) -> Result<Self> {
        let f = BufReader::new(
            File::open(file_name)
                .with_context(|| format!("error opening {}", file_name.display()))?,
        );
        let mut lines = f.lines();
        let header = lines
            .next()
            .ok_or_else(|| anyhow!("empty vector file"))?
            .context("error reading vector file")?;
        let mut fields = header.split_whitespace();
        let num_words: usize = fields
            .next()
            .ok_or_else(|| anyhow!("invalid vector file header"))?
            .parse()
            .context("invalid vector file header")?;
        let size: usize = fields
            .next()
            .ok_or_else(|| anyhow!("invalid vector file header"))?
            .parse()
            .context("invalid vector file header")?;

        let mut vocab = Vec::with_capacity(num_words);
        let mut embeddings = Vec::with_capacity(num_words * size);
        for (line_num, line) in lines.enumerate() {
            let line = line.context("error reading vector file")?;
            let mut fields = line.split(' ');
            let word = fields.next().unwrap_or_default().to_string();
            let before = embeddings.len();
            for x in fields {
                embeddings.push(x.parse::<real>().with_context(|| {
                    format!("invalid number on line {} of vector file", line_num + 2)
                })?);
            }
            ensure!(
                embeddings.len() - before == size,
                "line {} of vector file has {} values, expected {size}",
                line_num + 2,
                embeddings.len() - before
            );
            vocab.push(word);
        }
        ensure!(
            vocab.len() == num_words,
            "vector file has {} words, header says {num_words}",
            vocab.len()
        );
        Ok(Vectors::new(size, vocab, embeddings))
    }

    pub fn write_text<W: Write>(&self, w: &mut W) -> Result<()> {
        writeln!(w, "{} {}", self.vocab.len(), self.size)?;
        for (i, word) in self.vocab.iter().enumerate() {
            write!(w, "{word}")?;
            for x in &self[i] {
                write!(w, " {x:.6}")?;
            }
            writeln!(w)?;
        }
        Ok(())
    }

    pub fn write_bincode<W: Write>(&self, w: &mut W) -> Result<()> {
        bincode::serialize_into(w, self).context("error writing bincode vectors")
    }

    pub fn load_bincode(file_name: &Path) -> Result<Self> {
        let f = BufReader::new(
            File::open(file_name)
                .with_context(|| format!("failed to open vector file {}", file_name.display()))?,
        );
        let mut v: Vectors = bincode::deserialize_from(f)
            .with_context(|| format!("failed to load vectors from {}", file_name.display()))?;
        v.index = build_index(&v.vocab);
        Ok(v)
    }

    pub fn num_words(&self) -> usize {
        self.vocab.len()
    }

    /// Returns the vector size.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Get the index for a word as string. Exact match only, case-sensitive.
    pub fn lookup_word(&self, word: &str) -> Option<usize> {
        self.index.get(word).copied()
    }

    /// Get the word for a word-index. Panics if `word` is out of range.
    pub fn word(&self, word: usize) -> &str {
        &self.vocab[word]
    }

    pub fn get(&self, word: &str) -> Option<&[real]> {
        self.lookup_word(word).map(|i| &self[i])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Vectors {
        Vectors::new(
            2,
            vec!["a".to_string(), "b".to_string()],
            vec![1.0, 0.0, 0.5, -2.25],
        )
    }

    #[test]
    fn text_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vectors.txt");
        let mut f = File::create(&path).unwrap();
        sample().write_text(&mut f).unwrap();
        drop(f);

        let v = Vectors::load(&path).unwrap();
        assert_eq!(v.num_words(), 2);
        assert_eq!(v.size(), 2);
        assert_eq!(v.word(1), "b");
        assert_eq!(v.lookup_word("b"), Some(1));
        assert_eq!(v.get("b").unwrap(), &[0.5, -2.25]);
        assert!(v.get("c").is_none());
    }

    #[test]
    fn bincode_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vectors.bin");
        let mut f = File::create(&path).unwrap();
        sample().write_bincode(&mut f).unwrap();
        drop(f);

        let v = Vectors::load_bincode(&path).unwrap();
        assert_eq!(v.lookup_word("a"), Some(0));
        assert_eq!(&v[0], &[1.0, 0.0]);
    }

    #[test]
    fn short_line_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vectors.txt");
        std::fs::write(&path, "1 3\nx 1.0 2.0\n").unwrap();
        assert!(Vectors::load(&path).is_err());
    }
}
