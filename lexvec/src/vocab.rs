use std::cmp::Reverse;
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use anyhow::{bail, Context, Result};
use log::{debug, info};
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::config::{with_suffix, Config};
use crate::text::open_corpus;
use crate::window::Windower;
use crate::{checked_inc, real, CONTEXT_PATH_SUFFIX, CTX_BREAK_TOKEN, PROGRESS_INTERVAL};

pub struct Word {
    pub text: String,
    pub idx: u32,
    pub freq: u32,
    /// Number of co-occurrences this word took part in.
    pub total_cooc: u32,
    /// Rows of the word table that are averaged into this word's vector:
    /// the word's own row first, then its subword buckets.
    pub subwords: Vec<u32>,
    pub log_total_cooc: real,
}

impl Word {
    fn new(text: String, idx: u32, freq: u32) -> Self {
        Word {
            text,
            idx,
            freq,
            total_cooc: 0,
            subwords: Vec::new(),
            log_total_cooc: 0.0,
        }
    }

    /// Name of this word seen at relative position `pos` in a window:
    /// `the` at -1 is `the_-1`.
    pub fn positional(&self, pos: i32) -> String {
        format!("{}_{}", self.text, pos)
    }
}

/// An ordered list of words plus a name index. `list[i].idx == i` always holds.
#[derive(Default)]
pub struct Vocab {
    pub list: Vec<Word>,
    index: HashMap<String, u32>,
}

impl Vocab {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }

    /// Returns position of a word in the vocabulary; if the word is not found, returns None.
    pub fn idx(&self, text: &str) -> Option<u32> {
        self.index.get(text).copied()
    }

    pub fn get(&self, text: &str) -> Option<&Word> {
        self.idx(text).map(|i| &self.list[i as usize])
    }

    pub fn get_mut(&mut self, text: &str) -> Option<&mut Word> {
        let i = self.idx(text)?;
        Some(&mut self.list[i as usize])
    }

    pub fn word(&self, idx: u32) -> &Word {
        &self.list[idx as usize]
    }

    /// Adds a word to the end of the vocabulary and returns its index.
    pub fn push(&mut self, text: String, freq: u32) -> u32 {
        let idx = self.list.len() as u32;
        self.index.insert(text.clone(), idx);
        self.list.push(Word::new(text, idx, freq));
        idx
    }

    /// Sorts by descending frequency, keeping encounter order among ties, and
    /// reassigns indices.
    pub fn sort_by_freq(&mut self) {
        self.list.sort_by_key(|w| Reverse(w.freq));
        self.reindex();
    }

    fn reindex(&mut self) {
        self.index.clear();
        for (i, w) in self.list.iter_mut().enumerate() {
            w.idx = i as u32;
            self.index.insert(w.text.clone(), i as u32);
        }
    }

    /// Calls `callback(token, count)` for every `token count` line of a file.
    pub fn read_counts(
        path: &Path,
        mut callback: impl FnMut(&str, u32) -> Result<()>,
    ) -> Result<()> {
        let fin = BufReader::new(
            File::open(path).with_context(|| format!("error opening {}", path.display()))?,
        );
        for (line_num, line) in fin.lines().enumerate() {
            let line = line.with_context(|| format!("error reading {}", path.display()))?;
            if line.is_empty() {
                continue;
            }
            let mut fields = line.split_whitespace();
            let (Some(token), Some(count), None) = (fields.next(), fields.next(), fields.next())
            else {
                bail!("syntax error in {} on line {}", path.display(), line_num + 1);
            };
            let count = count.parse::<u32>().with_context(|| {
                format!(
                    "unrecognized count in {} on line {}",
                    path.display(),
                    line_num + 1
                )
            })?;
            callback(token, count)?;
        }
        Ok(())
    }

    pub fn read(path: &Path) -> Result<Vocab> {
        let mut vocab = Vocab::new();
        Self::read_counts(path, |token, freq| {
            vocab.push(token.to_string(), freq);
            Ok(())
        })?;
        Ok(vocab)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let mut fo = BufWriter::new(
            File::create(path)
                .with_context(|| format!("error creating vocab file {}", path.display()))?,
        );
        for w in &self.list {
            writeln!(fo, "{} {}", w.text, w.freq).context("error writing vocab file")?;
        }
        fo.flush().context("error writing vocab file")?;
        Ok(())
    }
}

/// The word vocabulary and the context vocabulary of a run.
///
/// With positional contexts every word except the sentence break has one
/// context per relative position (`dog_-2`, `dog_-1`, `dog_1`, `dog_2`).
/// Without them the context vocabulary holds the same words as the word
/// vocabulary, but is indexed by its own (context) frequency order.
pub struct Vocabulary {
    pub words: Vocab,
    pub contexts: Vocab,
    /// Index of the sentence-break token in `words`.
    pub ctx_break: u32,
    /// Sum of word frequencies, the denominator of subsampling.
    pub corpus_size: u64,
    /// Rows in the word table: one per word plus the subword buckets.
    pub subword_matrix_rows: u32,
}

impl Vocabulary {
    pub(crate) fn from_parts(words: Vocab, contexts: Vocab) -> Result<Self> {
        let Some(ctx_break) = words.idx(CTX_BREAK_TOKEN) else {
            bail!("ctxbreak {CTX_BREAK_TOKEN} not in vocab");
        };
        let corpus_size = words.list.iter().map(|w| w.freq as u64).sum();
        let subword_matrix_rows = words.len() as u32;
        Ok(Vocabulary {
            words,
            contexts,
            ctx_break,
            corpus_size,
            subword_matrix_rows,
        })
    }

    /// Counts the corpus, prunes it and builds the context vocabulary.
    pub fn build(config: &Config) -> Result<Self> {
        info!("build vocab");
        let corpus_path = config.corpus()?;

        let mut words = Vocab::new();
        let mut raw_corpus_size: u64 = 0;
        for token in open_corpus(corpus_path, 0, config.period_is_whitespace)? {
            let token = token.context("error reading corpus")?;
            let idx = match words.idx(&token.text) {
                Some(idx) => idx,
                None => words.push(token.text, 0),
            };
            checked_inc(&mut words.list[idx as usize].freq, "word frequency")?;
            raw_corpus_size += 1;
            if raw_corpus_size % PROGRESS_INTERVAL == 0 {
                debug!("{}K tokens", raw_corpus_size / 1000);
            }
        }

        // Drop rare words, then cap the size.
        words.list.sort_by_key(|w| Reverse(w.freq));
        let mut cut = words
            .list
            .iter()
            .position(|w| w.freq < config.min_freq)
            .unwrap_or(words.list.len());
        if config.max_vocab > 0 {
            cut = cut.min(config.max_vocab as usize);
        }
        words.list.truncate(cut);
        words.reindex();
        if words.idx(CTX_BREAK_TOKEN).is_none() {
            words.push(CTX_BREAK_TOKEN.to_string(), 0);
        }

        let mut contexts = Vocab::new();
        if config.positional_contexts {
            info!("creating positional vocab words");
            let window = config.window as i32;
            for w in words.list.iter().filter(|w| w.text != CTX_BREAK_TOKEN) {
                for pos in (-window..=window).filter(|&p| p != 0) {
                    contexts.push(w.positional(pos), 0);
                }
            }
        } else {
            for w in &words.list {
                contexts.push(w.text.clone(), 0);
            }
        }

        let mut vocab = Vocabulary::from_parts(words, contexts)?;
        info!(
            "vocab size: {}, raw corpus size: {}, corpus size: {}",
            vocab.words.len(),
            raw_corpus_size,
            vocab.corpus_size
        );

        if config.skip_context_counts {
            vocab.approximate_context_counts(config);
        } else {
            vocab.count_contexts(config)?;
        }
        vocab.contexts.sort_by_freq();
        Ok(vocab)
    }

    /// Sets context frequencies from a windowing pass over the corpus.
    /// Subsampling makes these differ from plain word frequencies, and
    /// positional context frequencies are only known after windowing.
    fn count_contexts(&mut self, config: &Config) -> Result<()> {
        info!("getting ctx freq");
        let mut freqs = vec![0u32; self.contexts.len()];
        {
            let windower = Windower::new(self, config);
            let mut rng = StdRng::seed_from_u64(config.seed);
            let mut pairs: u64 = 0;
            windower.run(
                open_corpus(config.corpus()?, 0, config.period_is_whitespace)?,
                &mut rng,
                false,
                |pair| {
                    if let Some(c) = pair.context {
                        checked_inc(&mut freqs[c as usize], "context frequency")?;
                    }
                    pairs += 1;
                    if pairs % PROGRESS_INTERVAL == 0 {
                        debug!("{}K pairs", pairs / 1000);
                    }
                    Ok(true)
                },
            )?;
        }
        for (c, freq) in self.contexts.list.iter_mut().zip(freqs) {
            c.freq = freq;
        }
        Ok(())
    }

    /// Gives every context the frequency of the word it is built from,
    /// instead of counting windows. Ignores subsampling and sentence edges.
    fn approximate_context_counts(&mut self, config: &Config) {
        info!("approximating ctx freq from word freq");
        let window = config.window as i32;
        let Vocabulary {
            words, contexts, ..
        } = self;
        for w in &words.list {
            if config.positional_contexts {
                for pos in (-window..=window).filter(|&p| p != 0) {
                    if let Some(c) = contexts.get_mut(&w.positional(pos)) {
                        c.freq = w.freq;
                    }
                }
            } else if let Some(c) = contexts.get_mut(&w.text) {
                c.freq = w.freq;
            }
        }
    }

    /// Reads `path` and `path.context`.
    pub fn read(path: &Path) -> Result<Self> {
        info!("reading vocab");
        let words = Vocab::read(path)?;
        info!("reading context vocab");
        let contexts = Vocab::read(&with_suffix(path, CONTEXT_PATH_SUFFIX))?;
        let vocab = Vocabulary::from_parts(words, contexts)?;
        info!(
            "vocab size: {}, context vocab size: {}, corpus size: {}",
            vocab.words.len(),
            vocab.contexts.len(),
            vocab.corpus_size
        );
        Ok(vocab)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        info!("saving vocab");
        self.words.save(path)?;
        info!("saving context vocab");
        self.contexts.save(&with_suffix(path, CONTEXT_PATH_SUFFIX))
    }

    /// Index of the sentence break in the context vocabulary, if it has one.
    pub fn ctx_break_context(&self) -> Option<u32> {
        self.contexts.idx(CTX_BREAK_TOKEN)
    }

    /// For each word, the context that is the same token. Every entry is
    /// `None` with positional contexts, where no context equals a word.
    pub fn self_contexts(&self, config: &Config) -> Vec<Option<u32>> {
        self.words
            .list
            .iter()
            .map(|w| {
                if config.positional_contexts {
                    None
                } else {
                    self.contexts.idx(&w.text)
                }
            })
            .collect()
    }

    /// Fills in every word's `subwords` list and sizes the word table.
    ///
    /// Each word keeps its own row. With `--minn` >= 1 character n-grams
    /// of `<word>` are hashed into `--buckets` extra rows; with `--subword`
    /// the listed subwords are hashed instead.
    pub fn process_subwords(&mut self, config: &Config) -> Result<()> {
        let vocab_size = self.words.len() as u32;
        self.subword_matrix_rows = vocab_size;
        for w in &mut self.words.list {
            w.subwords.clear();
            w.subwords.push(w.idx);
        }
        if !config.uses_subwords() {
            return Ok(());
        }

        let buckets = config.buckets;
        anyhow::ensure!(buckets > 0, "--buckets must be positive");
        self.subword_matrix_rows = vocab_size
            .checked_add(buckets)
            .context("vocab size plus buckets overflows u32")?;

        if config.subword_min_n > 0 {
            info!("building subword information");
            anyhow::ensure!(
                config.subword_min_n <= config.subword_max_n,
                "minn must be greater than 0 and less or equal to maxn"
            );
            let (minn, maxn) = (config.subword_min_n as usize, config.subword_max_n as usize);
            for w in &mut self.words.list {
                for sw in compute_subwords(&w.text, minn, maxn) {
                    w.subwords.push(subword_idx(&sw, vocab_size, buckets));
                }
            }
        } else if let Some(path) = &config.subword_path {
            info!("reading subword information");
            let fin = BufReader::new(
                File::open(path)
                    .with_context(|| format!("error opening subword file {}", path.display()))?,
            );
            let mut found: u32 = 0;
            for line in fin.lines() {
                let line = line.context("error reading subword file")?;
                let parts = line.split(' ').collect::<Vec<&str>>();
                anyhow::ensure!(parts.len() >= 2, "bad subword line: {line}");
                let Some(w) = self.words.get_mut(parts[0]) else {
                    continue;
                };
                found += 1;
                let wrapped = format!("<{}>", parts[0]);
                for sw in &parts[1..] {
                    // The word already has its own row.
                    if *sw == wrapped {
                        continue;
                    }
                    w.subwords.push(subword_idx(sw.as_bytes(), vocab_size, buckets));
                }
            }
            anyhow::ensure!(
                found == vocab_size,
                "(intersection subword list and vocab) {found} != (vocab size) {vocab_size}. \
                 Make sure subword information is generated from the vocab list output by lexvec."
            );
            info!("found subwords for {found} words");
        }
        Ok(())
    }
}

/// Character n-grams of `<word>` with lengths in `[minn, maxn]`, excluding
/// `<word>` itself. Works on bytes, so a multi-byte character may be split.
pub fn compute_subwords(word: &str, minn: usize, maxn: usize) -> Vec<Vec<u8>> {
    let wrapped = format!("<{word}>");
    let w = wrapped.as_bytes();
    let mut subwords = vec![];
    if minn == 0 || w.len() < minn {
        return subwords;
    }
    for i in 0..=(w.len() - minn) {
        let mut l = minn;
        while l < w.len() && l <= maxn && i + l <= w.len() {
            subwords.push(w[i..i + l].to_vec());
            l += 1;
        }
    }
    subwords
}

/// 32-bit FNV-1 (multiply, then xor).
pub fn fnv1_32(data: &[u8]) -> u32 {
    let mut hash: u32 = 0x811c9dc5;
    for &b in data {
        hash = hash.wrapping_mul(0x01000193);
        hash ^= b as u32;
    }
    hash
}

/// Row of the word table that holds subword `sw`.
pub fn subword_idx(sw: &[u8], vocab_size: u32, buckets: u32) -> u32 {
    vocab_size + fnv1_32(sw) % buckets
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::fs;

    use super::*;
    use crate::sampling::UnigramTable;

    fn config_for(corpus: &Path) -> Config {
        Config {
            corpus_path: Some(corpus.to_path_buf()),
            min_freq: 2,
            subsample: 0.0,
            ..Config::default()
        }
    }

    fn write_corpus(dir: &Path, text: &str) -> std::path::PathBuf {
        let path = dir.join("corpus.txt");
        fs::write(&path, text).unwrap();
        path
    }

    #[test]
    fn build_prunes_and_indexes() {
        let dir = tempfile::tempdir().unwrap();
        let corpus = write_corpus(dir.path(), "a b a c\nb a d\na b\n");
        let config = config_for(&corpus);
        let vocab = Vocabulary::build(&config).unwrap();

        let texts = vocab
            .words
            .list
            .iter()
            .map(|w| w.text.as_str())
            .collect::<Vec<_>>();
        // "</s>" appears 3 times, so it is counted like any other word.
        assert_eq!(texts, vec!["a", "b", CTX_BREAK_TOKEN]);
        for (i, w) in vocab.words.list.iter().enumerate() {
            assert_eq!(w.idx as usize, i);
            assert_eq!(vocab.words.idx(&w.text), Some(i as u32));
            assert!(w.freq >= config.min_freq || w.text == CTX_BREAK_TOKEN);
        }
        assert_eq!(vocab.words.word(vocab.ctx_break).text, CTX_BREAK_TOKEN);
        assert_eq!(vocab.corpus_size, 4 + 3 + 3);
    }

    #[test]
    fn break_token_is_appended() {
        let dir = tempfile::tempdir().unwrap();
        let corpus = write_corpus(dir.path(), "x x x y y");
        let config = config_for(&corpus);
        let vocab = Vocabulary::build(&config).unwrap();
        let last = vocab.words.list.last().unwrap();
        assert_eq!(last.text, CTX_BREAK_TOKEN);
        assert_eq!(last.freq, 0);
        assert_eq!(vocab.words.len(), 3);
    }

    #[test]
    fn max_vocab_caps_size() {
        let dir = tempfile::tempdir().unwrap();
        let corpus = write_corpus(dir.path(), "a a a b b c c d\n");
        let config = Config {
            min_freq: 1,
            max_vocab: 2,
            ..config_for(&corpus)
        };
        let vocab = Vocabulary::build(&config).unwrap();
        assert_eq!(vocab.words.len(), 3);
        assert!(vocab.words.idx("c").is_none());
    }

    #[test]
    fn positional_contexts_sorted_by_window_counts() {
        let dir = tempfile::tempdir().unwrap();
        let corpus = write_corpus(dir.path(), "a b\na b\na b\n");
        let config = Config {
            min_freq: 1,
            window: 1,
            ..config_for(&corpus)
        };
        let vocab = Vocabulary::build(&config).unwrap();
        // a, b, </s> => contexts for a and b at -1 and 1.
        assert_eq!(vocab.contexts.len(), 4);
        let counted = vocab
            .contexts
            .list
            .iter()
            .filter(|c| c.freq > 0)
            .map(|c| c.text.as_str())
            .collect::<Vec<_>>();
        assert_eq!(counted.len(), 2);
        assert!(counted.contains(&"a_-1"));
        assert!(counted.contains(&"b_1"));
        assert_eq!(vocab.contexts.get("b_1").unwrap().freq, 3);
        for (i, c) in vocab.contexts.list.iter().enumerate() {
            assert_eq!(c.idx as usize, i);
        }
    }

    #[test]
    fn skipped_context_counts_follow_word_counts() {
        let dir = tempfile::tempdir().unwrap();
        let corpus = write_corpus(dir.path(), "a b a c\nb a c\na a\n");
        let config = Config {
            min_freq: 1,
            skip_context_counts: true,
            positional_contexts: false,
            ..config_for(&corpus)
        };
        let vocab = Vocabulary::build(&config).unwrap();
        for c in &vocab.contexts.list {
            assert_eq!(c.freq, vocab.words.get(&c.text).unwrap().freq, "{}", c.text);
        }
        assert_eq!(vocab.contexts.list[0].text, "a");

        let table = UnigramTable::new(&vocab.contexts, 1000, 0.75).unwrap();
        let mut rng = StdRng::seed_from_u64(3);
        let drawn = (0..200)
            .map(|_| table.sample_avoiding(&mut rng, &[Some(0)]))
            .collect::<HashSet<_>>();
        assert!(drawn.len() > 1);
        assert!(!drawn.contains(&0));

        let config = Config {
            positional_contexts: true,
            window: 1,
            ..config
        };
        let vocab = Vocabulary::build(&config).unwrap();
        assert_eq!(vocab.contexts.len(), 6);
        assert_eq!(vocab.contexts.get("a_-1").unwrap().freq, 5);
        assert_eq!(vocab.contexts.get("c_1").unwrap().freq, 2);
        assert!(vocab.contexts.list.iter().all(|c| c.freq > 0));
    }

    #[test]
    fn vocab_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let corpus = write_corpus(dir.path(), "the cat the dog\nthe cat\n");
        let config = Config {
            min_freq: 1,
            ..config_for(&corpus)
        };
        let vocab = Vocabulary::build(&config).unwrap();
        let path = dir.path().join("vocab.txt");
        vocab.save(&path).unwrap();

        let read = Vocabulary::read(&path).unwrap();
        let pairs = |v: &Vocab| {
            v.list
                .iter()
                .map(|w| (w.text.clone(), w.freq))
                .collect::<Vec<_>>()
        };
        assert_eq!(pairs(&read.words), pairs(&vocab.words));
        assert_eq!(pairs(&read.contexts), pairs(&vocab.contexts));
        assert_eq!(read.corpus_size, vocab.corpus_size);
    }

    #[test]
    fn reading_vocab_without_break_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vocab.txt");
        fs::write(&path, "a 3\nb 2\n").unwrap();
        fs::write(with_suffix(&path, CONTEXT_PATH_SUFFIX), "a 3\n").unwrap();
        let err = Vocabulary::read(&path).err().unwrap();
        assert!(err.to_string().contains("not in vocab"));
    }

    #[test]
    fn subwords_of_short_word() {
        let subwords = compute_subwords("ab", 3, 6)
            .into_iter()
            .map(|s| String::from_utf8(s).unwrap())
            .collect::<Vec<_>>();
        // "<ab>" itself is excluded.
        assert_eq!(subwords, vec!["<ab", "ab>"]);
        assert!(compute_subwords("a", 4, 6).is_empty());
    }

    #[test]
    fn fnv1_known_values() {
        assert_eq!(fnv1_32(b""), 0x811c9dc5);
        assert_eq!(fnv1_32(b"a"), 0x050c5d7e);
        assert_eq!(subword_idx(b"a", 10, 7), 10 + 0x050c5d7e % 7);
    }

    #[test]
    fn process_subwords_generated_and_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let corpus = write_corpus(dir.path(), "ab ab cd cd\n");
        let mut config = Config {
            buckets: 100,
            ..config_for(&corpus)
        };
        let mut vocab = Vocabulary::build(&config).unwrap();
        vocab.process_subwords(&config).unwrap();
        assert_eq!(vocab.subword_matrix_rows, 3 + 100);
        let ab = vocab.words.get("ab").unwrap();
        assert_eq!(ab.subwords[0], ab.idx);
        assert_eq!(ab.subwords.len(), 3);
        assert_eq!(ab.subwords[1], subword_idx(b"<ab", 3, 100));

        let sw_path = dir.path().join("subwords.txt");
        fs::write(&sw_path, "ab <ab> <a b>\ncd c d\n</s> <\nzz z\n").unwrap();
        config.subword_min_n = 0;
        config.subword_path = Some(sw_path.clone());
        vocab.process_subwords(&config).unwrap();
        let ab = vocab.words.get("ab").unwrap();
        assert_eq!(
            ab.subwords,
            vec![ab.idx, subword_idx(b"<a", 3, 100), subword_idx(b"b>", 3, 100)]
        );

        fs::write(&sw_path, "ab <ab\n").unwrap();
        assert!(vocab.process_subwords(&config).is_err());
    }
}
