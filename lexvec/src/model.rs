//! The word and context vector tables, and the files they are saved to.
//!
//! The word table has one row per word followed by the subword bucket rows.
//! A word's vector during training is the mean of the rows in its
//! `subwords` list.

use std::collections::HashMap;
use std::fs::File;
use std::io::{self, BufRead, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::slice;

use aligned_box::AlignedBox;
use anyhow::{anyhow, ensure, Context, Result};
use log::{debug, info};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::config::{with_suffix, Config, OutputModel};
use crate::vectors::Vectors;
use crate::vocab::{compute_subwords, subword_idx, Vocab, Vocabulary, Word};
use crate::{real, Real, CONTEXT_PATH_SUFFIX};

pub const BINARY_MODEL_MAGIC_NUMBER: u32 = 0xbea25956;
pub const BINARY_MODEL_VERSION: u32 = 1;

fn alloc_table(rows: usize, dim: usize) -> Result<AlignedBox<[Real]>> {
    let len = rows
        .checked_mul(dim)
        .ok_or_else(|| anyhow!("vector table of {rows} x {dim} is too large"))?;
    ensure!(len > 0, "cannot allocate an empty vector table ({rows} x {dim})");
    AlignedBox::slice_from_default(128, len)
        .map_err(|_| anyhow!("memory allocation failed for {rows} x {dim} vector table"))
}

/// Word (plus subword) and context vector tables, shared by all SGD threads.
pub struct Model {
    dim: usize,
    word_rows: usize,
    /// `word_table[i * dim..][..dim]` is row `i`.
    word_table: AlignedBox<[Real]>,
    context_table: AlignedBox<[Real]>,
}

impl Model {
    /// Both tables start uniform in `[-0.5 / dim, 0.5 / dim)`.
    pub fn new(word_rows: usize, context_rows: usize, dim: usize, seed: u64) -> Result<Self> {
        info!("create vectors");
        let word_table = alloc_table(word_rows, dim)?;
        let context_table = alloc_table(context_rows, dim)?;
        let mut rng = StdRng::seed_from_u64(seed);
        for x in word_table.iter().chain(context_table.iter()) {
            x.set((rng.gen::<real>() - 0.5) / dim as real);
        }
        Ok(Model {
            dim,
            word_rows,
            word_table,
            context_table,
        })
    }

    /// Tables sized for `vocab`. Subwords must already be processed.
    pub fn for_vocab(vocab: &Vocabulary, config: &Config) -> Result<Self> {
        Model::new(
            vocab.subword_matrix_rows as usize,
            vocab.contexts.len(),
            config.dim,
            config.seed,
        )
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn word_rows(&self) -> usize {
        self.word_rows
    }

    pub fn word_row(&self, row: u32) -> &[Real] {
        &self.word_table[row as usize * self.dim..][..self.dim]
    }

    pub fn context_row(&self, row: u32) -> &[Real] {
        &self.context_table[row as usize * self.dim..][..self.dim]
    }

    /// The word's current vector: the mean of its rows.
    pub fn word_vector(&self, w: &Word, out: &mut [real]) {
        out.fill(0.0);
        let rows = rows_of(w);
        for &sw in rows {
            for (o, x) in out.iter_mut().zip(self.word_row(sw)) {
                *o += x.get();
            }
        }
        for o in out.iter_mut() {
            *o /= rows.len() as real;
        }
    }

    /// One step on `0.5 * (dot(z, c) - y)^2`, where `z` is the mean of the
    /// word's rows. Returns the loss before the step. `z` is scratch space
    /// of length `dim`.
    ///
    /// Many threads call this at once on shared rows without locking.
    pub fn sgd_step(&self, w: &Word, c: u32, y: real, alpha: real, z: &mut [real]) -> real {
        let rows = rows_of(w);
        let n = rows.len() as real;
        self.word_vector(w, z);
        let ctx = self.context_row(c);
        let dot = z.iter().zip(ctx).map(|(&a, b)| a * b.get()).sum::<real>();
        let mut g = dot - y;
        let err = 0.5 * g * g;
        g *= alpha;
        for (j, cj) in ctx.iter().enumerate() {
            let word_g = g * cj.get() / n;
            for &sw in rows {
                self.word_table[sw as usize * self.dim + j].add(-word_g);
            }
            cj.add(-g * z[j]);
        }
        err
    }

    /// Replaces each word's own row with the mean of its rows, so the word
    /// table holds the vectors that training actually used.
    pub fn finalize(&mut self, words: &Vocab) {
        let mut v = vec![0.0; self.dim];
        for w in &words.list {
            self.word_vector(w, &mut v);
            for (x, &y) in self.word_row(w.idx).iter().zip(&v) {
                x.set(y);
            }
        }
    }

    /// Adds each word's context vector to its word vector. With positional
    /// contexts, every positional variant of the word is added.
    pub fn merge_context_vectors(&mut self, vocab: &Vocabulary, config: &Config) {
        let window = config.window as i32;
        for w in &vocab.words.list {
            let contexts = if config.positional_contexts {
                (-window..=window)
                    .filter(|&p| p != 0)
                    .filter_map(|p| vocab.contexts.idx(&w.positional(p)))
                    .collect::<Vec<_>>()
            } else {
                vocab.contexts.idx(&w.text).into_iter().collect()
            };
            let row = self.word_row(w.idx);
            for c in contexts {
                for (x, y) in row.iter().zip(self.context_row(c)) {
                    x.add(y.get());
                }
            }
        }
    }

    fn table_vectors(&self, list: &Vocab, table: &[Real]) -> Vectors {
        let mut embeddings = Vec::with_capacity(list.len() * self.dim);
        for w in &list.list {
            embeddings.extend(table[w.idx as usize * self.dim..][..self.dim].iter().map(Real::get));
        }
        Vectors::new(
            self.dim,
            list.list.iter().map(|w| w.text.clone()).collect(),
            embeddings,
        )
    }

    pub fn word_vectors(&self, words: &Vocab) -> Vectors {
        self.table_vectors(words, &self.word_table)
    }

    pub fn context_vectors(&self, contexts: &Vocab) -> Vectors {
        self.table_vectors(contexts, &self.context_table)
    }

    /// Writes `--outputsub` (if set) from the raw rows, then finalizes the
    /// word vectors and writes `--output` (plus `<output>.context` for
    /// model 0).
    pub fn save(&mut self, vocab: &Vocabulary, config: &Config) -> Result<()> {
        let output = config.output()?;
        if let Some(path) = &config.subvecs_output_path {
            self.save_binary_model(vocab, config, path)?;
        }

        self.finalize(&vocab.words);
        if config.model == OutputModel::WordPlusContext {
            self.merge_context_vectors(vocab, config);
        }

        info!("outputting vectors");
        save_vectors(&self.word_vectors(&vocab.words), output, config.bincode)?;
        if config.model == OutputModel::WordAndContext {
            save_vectors(
                &self.context_vectors(&vocab.contexts),
                &with_suffix(output, CONTEXT_PATH_SUFFIX),
                config.bincode,
            )?;
        }
        Ok(())
    }

    /// Writes the subword model read back by `embed`.
    pub fn save_binary_model(&self, vocab: &Vocabulary, config: &Config, path: &Path) -> Result<()> {
        info!("saving binary model");
        let mut fo = BufWriter::new(
            File::create(path)
                .with_context(|| format!("error creating binary model {}", path.display()))?,
        );
        let header = BinaryModelHeader {
            vocab_size: vocab.words.len() as u32,
            subword_matrix_rows: self.word_rows as u32,
            dim: self.dim as u32,
            subword_min_n: config.subword_min_n,
            subword_max_n: config.subword_max_n,
        };
        header
            .write(&mut fo, &vocab.words)
            .context("error writing binary model")?;
        let rows = self.word_table.iter().map(Real::get).collect::<Vec<real>>();
        write_reals(&mut fo, &rows).context("error writing binary model")?;
        fo.flush().context("error writing binary model")?;
        Ok(())
    }
}

fn rows_of(w: &Word) -> &[u32] {
    if w.subwords.is_empty() {
        slice::from_ref(&w.idx)
    } else {
        &w.subwords
    }
}

fn write_reals<W: Write>(w: &mut W, values: &[real]) -> io::Result<()> {
    #[cfg(target_endian = "little")]
    w.write_all(bytemuck::cast_slice::<real, u8>(values))?;
    #[cfg(not(target_endian = "little"))]
    for v in values {
        w.write_all(&v.to_le_bytes())?;
    }
    Ok(())
}

/// Writes vectors as text (`N dim` line, then `word v1 ... vdim`) or as a
/// bincode dump.
pub fn save_vectors(vectors: &Vectors, path: &Path, bincode: bool) -> Result<()> {
    let mut fo = BufWriter::new(
        File::create(path).with_context(|| format!("error creating {}", path.display()))?,
    );
    if bincode {
        vectors.write_bincode(&mut fo)?;
    } else {
        vectors
            .write_text(&mut fo)
            .with_context(|| format!("error writing {}", path.display()))?;
    }
    fo.flush()
        .with_context(|| format!("error writing {}", path.display()))?;
    Ok(())
}

/// The fixed fields at the start of a binary model file.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BinaryModelHeader {
    pub vocab_size: u32,
    pub subword_matrix_rows: u32,
    pub dim: u32,
    pub subword_min_n: u32,
    pub subword_max_n: u32,
}

impl BinaryModelHeader {
    /// Writes the header and the word list.
    fn write<W: Write>(&self, w: &mut W, words: &Vocab) -> io::Result<()> {
        for v in [
            BINARY_MODEL_MAGIC_NUMBER,
            BINARY_MODEL_VERSION,
            self.vocab_size,
            self.subword_matrix_rows,
            self.dim,
            self.subword_min_n,
            self.subword_max_n,
        ] {
            w.write_all(&v.to_le_bytes())?;
        }
        for word in &words.list {
            w.write_all(&(word.text.len() as u32).to_le_bytes())?;
            w.write_all(word.text.as_bytes())?;
        }
        Ok(())
    }

    fn read<R: Read>(r: &mut R) -> Result<Self> {
        let magic = read_u32(r)?;
        ensure!(
            magic == BINARY_MODEL_MAGIC_NUMBER,
            "magic number doesn't match: {magic:#x}"
        );
        let version = read_u32(r)?;
        ensure!(
            version == BINARY_MODEL_VERSION,
            "version number doesn't match: {version}"
        );
        let header = BinaryModelHeader {
            vocab_size: read_u32(r)?,
            subword_matrix_rows: read_u32(r)?,
            dim: read_u32(r)?,
            subword_min_n: read_u32(r)?,
            subword_max_n: read_u32(r)?,
        };
        ensure!(
            header.subword_matrix_rows >= header.vocab_size,
            "binary model has fewer rows ({}) than words ({})",
            header.subword_matrix_rows,
            header.vocab_size
        );
        Ok(header)
    }

    fn buckets(&self) -> u32 {
        self.subword_matrix_rows - self.vocab_size
    }
}

fn read_u32<R: Read>(r: &mut R) -> Result<u32> {
    let mut b = [0u8; 4];
    r.read_exact(&mut b).context("error reading binary model")?;
    Ok(u32::from_le_bytes(b))
}

/// A binary model opened for row lookups. Rows are read on demand by
/// seeking, so the matrix is never loaded whole.
pub struct BinaryModel<R> {
    pub header: BinaryModelHeader,
    words: Vec<String>,
    index: HashMap<String, u32>,
    /// Stream position of row 0.
    matrix_base_offset: u64,
    reader: R,
    row: Vec<u8>,
}

impl BinaryModel<BufReader<File>> {
    pub fn open(path: &Path) -> Result<Self> {
        info!("loading binary model");
        let f = File::open(path)
            .with_context(|| format!("error opening binary model {}", path.display()))?;
        BinaryModel::read(BufReader::new(f))
    }
}

impl<R: Read + Seek> BinaryModel<R> {
    pub fn read(mut reader: R) -> Result<Self> {
        let header = BinaryModelHeader::read(&mut reader)?;
        let mut words = Vec::with_capacity(header.vocab_size as usize);
        let mut index = HashMap::new();
        for i in 0..header.vocab_size {
            let len = read_u32(&mut reader)?;
            let mut bytes = vec![0u8; len as usize];
            reader
                .read_exact(&mut bytes)
                .context("error reading binary model")?;
            let w = String::from_utf8(bytes).context("invalid word in binary model")?;
            index.insert(w.clone(), i);
            words.push(w);
        }
        let matrix_base_offset = reader
            .stream_position()
            .context("error reading binary model")?;
        debug!(
            "binary model: {} words, {} rows, dim {}",
            header.vocab_size, header.subword_matrix_rows, header.dim
        );
        Ok(BinaryModel {
            row: vec![0u8; header.dim as usize * 8],
            header,
            words,
            index,
            matrix_base_offset,
            reader,
        })
    }

    pub fn words(&self) -> &[String] {
        &self.words
    }

    pub fn matrix_base_offset(&self) -> u64 {
        self.matrix_base_offset
    }

    /// Adds row `idx` to `v`.
    pub fn add_row(&mut self, idx: u32, v: &mut [real]) -> Result<()> {
        ensure!(
            idx < self.header.subword_matrix_rows,
            "row {idx} out of range in binary model"
        );
        let offset = self.matrix_base_offset + idx as u64 * self.row.len() as u64;
        self.reader
            .seek(SeekFrom::Start(offset))
            .context("error seeking in binary model")?;
        self.reader
            .read_exact(&mut self.row)
            .context("error reading binary model")?;
        for (x, b) in v.iter_mut().zip(self.row.chunks_exact(8)) {
            *x += real::from_le_bytes(b.try_into()?);
        }
        Ok(())
    }

    /// Vector for an input line `word` or `word sw1 sw2 ...`: the mean of
    /// the word's own row (if it is in the vocabulary) and its subword rows.
    /// A bare word gets generated subwords when the model was trained with
    /// them.
    pub fn vector(&mut self, line: &str) -> Result<(String, Vec<real>)> {
        let parts = line.split(' ').collect::<Vec<&str>>();
        let w = parts[0];
        let subwords: Vec<Vec<u8>> = if self.header.subword_min_n > 0 && parts.len() == 1 {
            compute_subwords(
                w,
                self.header.subword_min_n as usize,
                self.header.subword_max_n as usize,
            )
        } else {
            parts[1..].iter().map(|s| s.as_bytes().to_vec()).collect()
        };

        let mut v = vec![0.0; self.header.dim as usize];
        let mut n = 0;
        if let Some(&idx) = self.index.get(w) {
            self.add_row(idx, &mut v)?;
            n += 1;
        }
        let buckets = self.header.buckets();
        if buckets > 0 {
            for sw in &subwords {
                self.add_row(subword_idx(sw, self.header.vocab_size, buckets), &mut v)?;
                n += 1;
            }
        }
        if n > 0 {
            for x in &mut v {
                *x /= n as real;
            }
        }
        Ok((w.to_string(), v))
    }

    /// Reads lines until EOF or an empty line, writing `word v1 ... vdim` for
    /// each. Returns the number of lines handled.
    pub fn embed<I: BufRead, O: Write>(&mut self, input: I, mut output: O) -> Result<u64> {
        info!("reading oov words");
        let mut n = 0;
        for line in input.lines() {
            let line = line.context("error reading input")?;
            if line.is_empty() {
                break;
            }
            let (w, v) = self.vector(&line)?;
            write!(output, "{w}").context("error writing output")?;
            for x in &v {
                write!(output, " {x:.6}").context("error writing output")?;
            }
            writeln!(output).context("error writing output")?;
            output.flush().context("error writing output")?;
            n += 1;
            if n % 1000 == 0 {
                debug!("{n} words");
            }
        }
        Ok(n)
    }
}
