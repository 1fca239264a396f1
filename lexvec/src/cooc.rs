//! Co-occurrence counting.
//!
//! In memory, counts go straight into a `MatrixStorage`. For corpora whose
//! counts do not fit in memory, every co-occurrence event is pushed into a
//! `MergeShuffler`, which sorts and coalesces runs on disk, merges them, and
//! writes one shuffled stream of `CoocLine`s for external-memory training.

use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::mem;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, ensure, Context, Result};
use bytemuck::{Pod, Zeroable};
use log::{debug, info};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rayon::slice::ParallelSliceMut;

use crate::config::{with_suffix, Config};
use crate::merge::{self, Record};
use crate::sampling::UnigramTable;
use crate::storage::{self, MatrixStorage};
use crate::text::open_corpus;
use crate::vocab::{Vocab, Vocabulary};
use crate::window::Windower;
use crate::{checked_inc, real, CONTEXT_PATH_SUFFIX, PROGRESS_INTERVAL};

/// Counts windowed co-occurrences of the whole corpus into the storage
/// backend chosen by `--storage`, and sets every word's and context's
/// `total_cooc`.
pub fn build_cooc_matrix(
    vocab: &mut Vocabulary,
    config: &Config,
) -> Result<Box<dyn MatrixStorage>> {
    debug!("initializing cooc storage");
    let mut coocs = storage::open(config, vocab.words.len() as u32)?;

    info!("identify coocurrence");
    let mut word_totals = vec![0u32; vocab.words.len()];
    let mut ctx_totals = vec![0u32; vocab.contexts.len()];
    {
        let windower = Windower::new(vocab, config);
        let mut rng = StdRng::seed_from_u64(config.seed);
        let mut pairs: u64 = 0;
        windower.run(
            open_corpus(config.corpus()?, 0, config.period_is_whitespace)?,
            &mut rng,
            false,
            |pair| {
                let Some(c) = pair.context else {
                    return Ok(true);
                };
                checked_inc(&mut word_totals[pair.target as usize], "word cooc total")?;
                checked_inc(&mut ctx_totals[c as usize], "context cooc total")?;
                let x = coocs.get(pair.target, c)?;
                ensure!(x < u32::MAX as real, "overflow in cooc counter (u32)");
                coocs.set(pair.target, c, x + 1.0)?;
                pairs += 1;
                if pairs % PROGRESS_INTERVAL == 0 {
                    debug!("{}K pairs", pairs / 1000);
                }
                Ok(true)
            },
        )?;
    }
    set_totals(&mut vocab.words, &word_totals);
    set_totals(&mut vocab.contexts, &ctx_totals);

    let mut cells: u64 = 0;
    let mut sum: real = 0.0;
    coocs.transform(&mut |_, _, v| {
        cells += 1;
        sum += v;
        v
    })?;
    info!("{cells} non-zero cells, {sum} co-occurrences");

    coocs.reopen_read_only()?;
    Ok(coocs)
}

fn set_totals(vocab: &mut Vocab, totals: &[u32]) {
    for (w, &t) in vocab.list.iter_mut().zip(totals) {
        w.total_cooc = t;
    }
}

/// One co-occurrence event in the sort/merge stage. `sampled` is how many
/// times the cell is repeated in the final stream.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct CoocRecord {
    pub word: u32,
    pub context: u32,
    pub cooc: u32,
    pub sampled: u32,
}

impl CoocRecord {
    fn key(&self) -> (u32, u32) {
        (self.word, self.context)
    }

    fn absorb(&mut self, other: &CoocRecord) -> Result<()> {
        self.cooc = self
            .cooc
            .checked_add(other.cooc)
            .ok_or_else(|| anyhow!("overflow in cooc counter (u32)"))?;
        self.sampled = self
            .sampled
            .checked_add(other.sampled)
            .ok_or_else(|| anyhow!("overflow in sampled cooc counter (u32)"))?;
        Ok(())
    }
}

impl Record for CoocRecord {
    fn swap_le(self) -> Self {
        CoocRecord {
            word: u32::from_le(self.word),
            context: u32::from_le(self.context),
            cooc: u32::from_le(self.cooc),
            sampled: u32::from_le(self.sampled),
        }
    }
}

/// Folds adjacent records with equal keys into the first of them.
fn coalesce_sorted(records: &mut Vec<CoocRecord>) -> Result<()> {
    let mut kept = 0;
    for i in 0..records.len() {
        let rec = records[i];
        if kept > 0 && records[kept - 1].key() == rec.key() {
            records[kept - 1].absorb(&rec)?;
        } else {
            records[kept] = rec;
            kept += 1;
        }
    }
    records.truncate(kept);
    Ok(())
}

/// One training cell of the final co-occurrence stream (12 bytes on disk).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct CoocLine {
    pub word: u32,
    pub context: u32,
    pub cooc: u32,
}

impl Record for CoocLine {
    fn swap_le(self) -> Self {
        CoocLine {
            word: u32::from_le(self.word),
            context: u32::from_le(self.context),
            cooc: u32::from_le(self.cooc),
        }
    }
}

impl From<CoocRecord> for CoocLine {
    fn from(r: CoocRecord) -> Self {
        CoocLine {
            word: r.word,
            context: r.context,
            cooc: r.cooc,
        }
    }
}

pub const COOC_LINE_SIZE: u64 = mem::size_of::<CoocLine>() as u64;

fn numbered(path: &Path, i: usize, suffix: &str) -> PathBuf {
    with_suffix(path, &format!(".{i}{suffix}"))
}

fn create(path: &Path) -> Result<BufWriter<File>> {
    Ok(BufWriter::new(File::create(path).with_context(|| {
        format!("error creating {}", path.display())
    })?))
}

fn open(path: &Path) -> Result<BufReader<File>> {
    Ok(BufReader::new(File::open(path).with_context(|| {
        format!("error opening {}", path.display())
    })?))
}

/// External-memory sort, merge and shuffle of co-occurrence events.
///
/// 1. Events fill a buffer; each full buffer is sorted by (word, context),
///    coalesced and written to `<path>.<i>`.
/// 2. Those files are k-way merged and coalesced across files. Each merged
///    cell is repeated `sampled` times into a second buffer that is
///    shuffled and written to `<path>.<i>.shuf` whenever it fills.
/// 3. The shuffle files are interleaved round-robin, a bounded number of
///    lines from each per round, through one more shuffled buffer into
///    `<path>`.
///
/// Temporary files are deleted once they have been consumed.
pub struct MergeShuffler {
    path: PathBuf,
    records: Vec<CoocRecord>,
    records_cap: usize,
    lines: Vec<CoocLine>,
    lines_cap: usize,
    files: Vec<PathBuf>,
    shuf_files: Vec<PathBuf>,
    records_pushed: u64,
    lines_written: u64,
    rng: StdRng,
}

impl MergeShuffler {
    /// `memory_gb` bounds each in-memory buffer.
    pub fn new(path: &Path, memory_gb: real, seed: u64) -> Self {
        let bytes = memory_gb * 1e9;
        let records_cap = ((bytes / mem::size_of::<CoocRecord>() as real) as usize).max(1);
        let lines_cap = ((bytes / mem::size_of::<CoocLine>() as real) as usize).max(1);
        MergeShuffler {
            path: path.to_path_buf(),
            records: Vec::new(),
            records_cap,
            lines: Vec::new(),
            lines_cap,
            files: Vec::new(),
            shuf_files: Vec::new(),
            records_pushed: 0,
            lines_written: 0,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn push(&mut self, word: u32, context: u32, cooc: u32) -> Result<()> {
        self.records_pushed += 1;
        self.records.push(CoocRecord {
            word,
            context,
            cooc,
            sampled: 1,
        });
        if self.records.len() >= self.records_cap {
            self.flush()?;
        }
        Ok(())
    }

    /// Sorts, coalesces and writes the event buffer to a new temporary file.
    fn flush(&mut self) -> Result<()> {
        if self.records.is_empty() {
            return Ok(());
        }
        self.records.par_sort_unstable_by_key(CoocRecord::key);
        coalesce_sorted(&mut self.records)?;
        let path = numbered(&self.path, self.files.len(), "");
        let mut w = create(&path)?;
        merge::write_records(&mut w, &self.records)
            .with_context(|| format!("error writing {}", path.display()))?;
        w.flush()
            .with_context(|| format!("error writing {}", path.display()))?;
        self.files.push(path);
        self.records.clear();
        Ok(())
    }

    /// Writes the final stream. Returns the number of lines in it.
    pub fn finish(mut self) -> Result<u64> {
        self.flush()?;
        self.records = Vec::new();
        debug!(
            "total lines = {}, GB = {}",
            self.records_pushed,
            (COOC_LINE_SIZE * self.records_pushed) as real / 1e9
        );
        debug!("have {} tmp files", self.files.len());

        let readers = self
            .files
            .iter()
            .map(|p| open(p))
            .collect::<Result<Vec<_>>>()?;
        let merged = merge::merge_coalesce(
            readers,
            CoocRecord::key,
            CoocRecord::absorb,
            |rec| self.spit_record(rec),
        )?;
        debug!("merged {merged} records");
        self.shuffle_flush()?;
        for path in &self.files {
            fs::remove_file(path)
                .with_context(|| format!("error removing {}", path.display()))?;
        }

        debug!("have {} shuf files", self.shuf_files.len());
        self.lines_written = 0;
        self.merge_shuffled()?;
        for path in &self.shuf_files {
            fs::remove_file(path)
                .with_context(|| format!("error removing {}", path.display()))?;
        }
        debug!("total lines shuffled = {}", self.lines_written);
        Ok(self.lines_written)
    }

    fn spit_record(&mut self, rec: CoocRecord) -> Result<()> {
        for _ in 0..rec.sampled {
            self.lines.push(rec.into());
            if self.lines.len() >= self.lines_cap {
                self.shuffle_flush()?;
            }
        }
        Ok(())
    }

    fn shuffle_flush(&mut self) -> Result<()> {
        if self.lines.is_empty() {
            return Ok(());
        }
        let path = numbered(&self.path, self.shuf_files.len(), ".shuf");
        let mut w = create(&path)?;
        self.shuffle_into(&mut w)?;
        w.flush()
            .with_context(|| format!("error writing {}", path.display()))?;
        self.shuf_files.push(path);
        Ok(())
    }

    fn shuffle_into<W: Write>(&mut self, w: &mut W) -> Result<()> {
        self.lines.shuffle(&mut self.rng);
        merge::write_records(w, &self.lines)?;
        self.lines_written += self.lines.len() as u64;
        self.lines.clear();
        Ok(())
    }

    fn merge_shuffled(&mut self) -> Result<()> {
        let mut out = create(&self.path)?;
        let mut readers = self
            .shuf_files
            .iter()
            .map(|p| open(p).map(Some))
            .collect::<Result<Vec<_>>>()?;
        let quota = if readers.is_empty() {
            0
        } else {
            (self.lines_cap / readers.len()).max(1)
        };

        let mut read_something = true;
        let mut lines_read: u64 = 0;
        while read_something {
            read_something = false;
            for slot in readers.iter_mut() {
                let Some(r) = slot else {
                    continue;
                };
                for _ in 0..quota {
                    match merge::read_record::<CoocLine, _>(r)? {
                        Some(line) => {
                            read_something = true;
                            lines_read += 1;
                            if lines_read % PROGRESS_INTERVAL == 0 {
                                debug!("{}K lines", lines_read / 1000);
                            }
                            self.lines.push(line);
                            if self.lines.len() >= self.lines_cap {
                                self.shuffle_into(&mut out)?;
                            }
                        }
                        None => {
                            *slot = None;
                            break;
                        }
                    }
                }
            }
        }
        self.shuffle_into(&mut out)?;
        out.flush()
            .with_context(|| format!("error writing {}", self.path.display()))?;
        Ok(())
    }
}

/// Streams the corpus once, pushing every co-occurrence (count 1) and
/// `--negative` noise pairs per target (count 0) through a
/// `MergeShuffler` into `--coocpath`, then writes the totals files.
pub fn build_cooc_file(vocab: &mut Vocabulary, config: &Config) -> Result<()> {
    let cooc_path = config.cooc()?;
    let totals_path = config.cooc_totals()?;

    let total_coocs: u64 = vocab.contexts.list.iter().map(|c| c.freq as u64).sum();
    let line_estimate_g = (total_coocs as real
        + config.negative as real * total_coocs as real / (2 * config.window).max(1) as real)
        / 1e9;
    info!(
        "estimate: this should use a peak of {:.3} GB of hard disk space, and {:.3} GB when complete, {:.2}G lines",
        (16 + 12) as real * line_estimate_g,
        12.0 * line_estimate_g,
        line_estimate_g
    );

    let noise = UnigramTable::for_negatives(&vocab.contexts, config)?;
    let ctx_break = vocab.ctx_break_context();
    let self_contexts = vocab.self_contexts(config);

    info!("identify coocurrence");
    let mut word_totals = vec![0u32; vocab.words.len()];
    let mut ctx_totals = vec![0u32; vocab.contexts.len()];
    let mut flusher = MergeShuffler::new(cooc_path, config.line_buf_mem, config.seed);
    {
        let windower = Windower::new(vocab, config);
        let mut rng = StdRng::seed_from_u64(config.seed);
        let mut noise_rng = StdRng::seed_from_u64(config.seed.wrapping_add(1));
        let mut pairs: u64 = 0;
        windower.run(
            open_corpus(config.corpus()?, 0, config.period_is_whitespace)?,
            &mut rng,
            true,
            |pair| {
                let mut push = |context: u32, cooc: u32| -> Result<()> {
                    flusher.push(pair.target, context, cooc)?;
                    pairs += 1;
                    if pairs % PROGRESS_INTERVAL == 0 {
                        debug!("{}K pairs", pairs / 1000);
                    }
                    Ok(())
                };
                match pair.context {
                    Some(c) => {
                        checked_inc(&mut word_totals[pair.target as usize], "word cooc total")?;
                        checked_inc(&mut ctx_totals[c as usize], "context cooc total")?;
                        push(c, 1)?;
                    }
                    None => {
                        let avoid = [ctx_break, self_contexts[pair.target as usize]];
                        for _ in 0..config.negative {
                            push(noise.sample_avoiding(&mut noise_rng, &avoid), 0)?;
                        }
                    }
                }
                Ok(true)
            },
        )?;
    }
    let lines = flusher.finish()?;
    info!("wrote {lines} lines to {}", cooc_path.display());

    set_totals(&mut vocab.words, &word_totals);
    set_totals(&mut vocab.contexts, &ctx_totals);
    write_cooc_totals(&vocab.words, totals_path)?;
    write_cooc_totals(
        &vocab.contexts,
        &with_suffix(totals_path, CONTEXT_PATH_SUFFIX),
    )?;
    Ok(())
}

pub fn write_cooc_totals(vocab: &Vocab, path: &Path) -> Result<()> {
    info!("writing cooc totals to {}", path.display());
    let mut fo = create(path)?;
    for w in &vocab.list {
        writeln!(fo, "{} {}", w.text, w.total_cooc).context("error writing cooc totals")?;
    }
    fo.flush().context("error writing cooc totals")?;
    Ok(())
}

pub fn read_cooc_totals(vocab: &mut Vocab, path: &Path) -> Result<()> {
    info!("reading cooc totals from {}", path.display());
    Vocab::read_counts(path, |token, total| {
        let Some(w) = vocab.get_mut(token) else {
            bail!("word {token} not found in {}", path.display());
        };
        w.total_cooc = total;
        Ok(())
    })
}

/// Reads the totals written by `build_cooc_file` into both vocabularies.
pub fn read_all_cooc_totals(vocab: &mut Vocabulary, config: &Config) -> Result<()> {
    let totals_path = config.cooc_totals()?;
    read_cooc_totals(&mut vocab.words, totals_path)?;
    read_cooc_totals(
        &mut vocab.contexts,
        &with_suffix(totals_path, CONTEXT_PATH_SUFFIX),
    )
}
