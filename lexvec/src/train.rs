//! Multi-threaded SGD over (word, context, target) data.
//!
//! Every iteration runs `--threads` workers, each over its own slice of the
//! data. Workers update the shared `Model` tables without locks; see `Real`.

use std::fs::File;
use std::io::{BufReader, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{anyhow, ensure, Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use log::info;
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::association::AssociationMeasure;
use crate::config::Config;
use crate::cooc::{CoocLine, COOC_LINE_SIZE};
use crate::merge::read_record;
use crate::model::Model;
use crate::sampling::UnigramTable;
use crate::storage::MatrixStorage;
use crate::text::{file_size, open_corpus};
use crate::vocab::Vocabulary;
use crate::window::Windower;
use crate::{real, Real};

/// Data a worker collects before running SGD steps.
pub const BATCH_SIZE: usize = 10_000;

/// One training cell.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Datum {
    pub word: u32,
    pub context: u32,
    pub y: real,
}

/// A source of training data that can be split across threads.
pub trait TrainIterator: Sync {
    /// Size of one iteration's input, in the unit `iterate` reports
    /// progress in.
    fn total_datum(&self) -> u64;

    /// Feeds thread `thread_id`'s slice of the data to `callback`, along with
    /// how much of the slice has been consumed so far.
    fn iterate(
        &self,
        thread_id: usize,
        iteration: usize,
        callback: &mut dyn FnMut(Datum, u64) -> Result<()>,
    ) -> Result<()>;
}

/// Re-windows the corpus every iteration and looks targets up in the
/// co-occurrence matrix. Progress is measured in corpus bytes.
pub struct InMemoryIterator<'a> {
    vocab: &'a Vocabulary,
    config: &'a Config,
    coocs: &'a dyn MatrixStorage,
    measure: &'a AssociationMeasure,
    windower: Windower<'a>,
    noise: UnigramTable,
    self_contexts: Vec<Option<u32>>,
    corpus_path: &'a Path,
    corpus_size: u64,
}

impl<'a> InMemoryIterator<'a> {
    pub fn new(
        vocab: &'a Vocabulary,
        config: &'a Config,
        coocs: &'a dyn MatrixStorage,
        measure: &'a AssociationMeasure,
    ) -> Result<Self> {
        let corpus_path = config.corpus()?;
        let noise = UnigramTable::for_negatives(&vocab.contexts, config)?;
        Ok(InMemoryIterator {
            vocab,
            config,
            coocs,
            measure,
            windower: Windower::new(vocab, config),
            noise,
            self_contexts: vocab.self_contexts(config),
            corpus_path,
            corpus_size: file_size(corpus_path)?,
        })
    }

    fn datum(&self, word: u32, context: u32) -> Result<Datum> {
        let cooc = self.coocs.get(word, context)? as u32;
        let y = self.measure.measure(
            self.vocab.words.word(word),
            self.vocab.contexts.word(context),
            cooc,
        );
        Ok(Datum { word, context, y })
    }
}

impl TrainIterator for InMemoryIterator<'_> {
    fn total_datum(&self) -> u64 {
        self.corpus_size
    }

    fn iterate(
        &self,
        thread_id: usize,
        iteration: usize,
        callback: &mut dyn FnMut(Datum, u64) -> Result<()>,
    ) -> Result<()> {
        let threads = self.config.num_threads as u64;
        let start = self.corpus_size / threads * thread_id as u64;
        let end = (self.corpus_size / threads * (thread_id as u64 + 1)).min(self.corpus_size);
        let seed = self
            .config
            .seed
            .wrapping_add(thread_id as u64)
            .wrapping_add(iteration as u64 * threads);
        let mut rng = StdRng::seed_from_u64(seed);
        let mut noise_rng = StdRng::seed_from_u64(seed.wrapping_add(1 << 32));
        let ctx_break = self.vocab.ctx_break_context();

        let tokens = open_corpus(self.corpus_path, start, self.config.period_is_whitespace)?;
        self.windower.run(tokens, &mut rng, true, |pair| {
            if pair.offset > end {
                return Ok(false);
            }
            let processed = pair.offset.saturating_sub(start);
            match pair.context {
                Some(c) => callback(self.datum(pair.target, c)?, processed)?,
                None => {
                    let avoid = [ctx_break, self.self_contexts[pair.target as usize]];
                    for _ in 0..self.config.negative {
                        let c = self.noise.sample_avoiding(&mut noise_rng, &avoid);
                        callback(self.datum(pair.target, c)?, processed)?;
                    }
                }
            }
            Ok(true)
        })
    }
}

/// Reads the shuffled co-occurrence stream written by `cooc`. Progress is
/// measured in records.
pub struct ExternalIterator<'a> {
    vocab: &'a Vocabulary,
    config: &'a Config,
    measure: &'a AssociationMeasure,
    path: PathBuf,
    lines: u64,
}

impl<'a> ExternalIterator<'a> {
    pub fn new(
        vocab: &'a Vocabulary,
        config: &'a Config,
        measure: &'a AssociationMeasure,
    ) -> Result<Self> {
        let path = config.cooc()?.to_path_buf();
        let size = file_size(&path)?;
        ensure!(
            size % COOC_LINE_SIZE == 0,
            "{} is not a whole number of {COOC_LINE_SIZE}-byte records",
            path.display()
        );
        Ok(ExternalIterator {
            vocab,
            config,
            measure,
            path,
            lines: size / COOC_LINE_SIZE,
        })
    }
}

impl TrainIterator for ExternalIterator<'_> {
    fn total_datum(&self) -> u64 {
        self.lines
    }

    fn iterate(
        &self,
        thread_id: usize,
        _iteration: usize,
        callback: &mut dyn FnMut(Datum, u64) -> Result<()>,
    ) -> Result<()> {
        let threads = self.config.num_threads as u64;
        let start = self.lines * thread_id as u64 / threads;
        let end = self.lines * (thread_id as u64 + 1) / threads;

        let mut f = BufReader::new(
            File::open(&self.path)
                .with_context(|| format!("error opening {}", self.path.display()))?,
        );
        f.seek(SeekFrom::Start(start * COOC_LINE_SIZE))
            .with_context(|| format!("error seeking in {}", self.path.display()))?;
        let (words, contexts) = (&self.vocab.words, &self.vocab.contexts);
        for i in 0..(end - start) {
            let line = read_record::<CoocLine, _>(&mut f)?
                .ok_or_else(|| anyhow!("unexpected end of {}", self.path.display()))?;
            ensure!(
                (line.word as usize) < words.len() && (line.context as usize) < contexts.len(),
                "record ({}, {}) out of range of the vocab",
                line.word,
                line.context
            );
            let y = self.measure.measure(
                words.word(line.word),
                contexts.word(line.context),
                line.cooc,
            );
            let datum = Datum {
                word: line.word,
                context: line.context,
                y,
            };
            callback(datum, i + 1)?;
        }
        Ok(())
    }
}

/// Per-thread counters. Each is written by its own worker and read by the
/// reporter.
#[derive(Default)]
struct ThreadStats {
    loss: Real,
    losses: AtomicU64,
    processed: AtomicU64,
}

impl ThreadStats {
    fn reset(&self) {
        self.loss.set(0.0);
        self.losses.store(0, Ordering::Relaxed);
        self.processed.store(0, Ordering::Relaxed);
    }
}

struct Trainer<'a> {
    model: &'a Model,
    vocab: &'a Vocabulary,
    config: &'a Config,
    total_datum: u64,
    alpha: Real,
    iteration: AtomicUsize,
    stats: Vec<ThreadStats>,
}

impl Trainer<'_> {
    fn total_processed(&self) -> u64 {
        self.stats
            .iter()
            .map(|s| s.processed.load(Ordering::Relaxed))
            .sum()
    }

    fn num_losses(&self) -> u64 {
        self.stats
            .iter()
            .map(|s| s.losses.load(Ordering::Relaxed))
            .sum()
    }

    fn mean_loss(&self) -> real {
        let n = self.num_losses();
        if n == 0 {
            return 0.0;
        }
        let total = self.stats.iter().map(|s| s.loss.get()).sum::<real>();
        total / n as real
    }

    /// Fraction of all iterations done.
    fn progress(&self) -> real {
        let mut done = self.iteration.load(Ordering::Relaxed) as real;
        if self.total_datum > 0 {
            done += self.total_processed() as real / self.total_datum as real;
        }
        done / self.config.iterations as real
    }

    fn decayed_alpha(&self) -> real {
        let initial = self.config.initial_alpha;
        (initial * (1.0 - self.progress())).max(initial * 1e-4)
    }

    fn step(&self, stats: &ThreadStats, batch: &mut Vec<Datum>, z: &mut [real]) -> Result<()> {
        let alpha = self.alpha.get();
        let mut loss = 0.0;
        for d in batch.iter() {
            let w = self.vocab.words.word(d.word);
            loss += self.model.sgd_step(w, d.context, d.y, alpha, z);
        }
        stats.losses.fetch_add(batch.len() as u64, Ordering::Relaxed);
        stats.loss.add(loss);
        batch.clear();

        self.alpha.set(self.decayed_alpha());
        ensure!(
            !stats.loss.get().is_nan(),
            "got a NaN loss, training diverged (try a smaller --alpha)"
        );
        Ok(())
    }

    fn train_thread(&self, it: &dyn TrainIterator, thread_id: usize, iteration: usize) -> Result<()> {
        let stats = &self.stats[thread_id];
        let mut z = vec![0.0; self.model.dim()];
        let mut batch = Vec::with_capacity(BATCH_SIZE);
        it.iterate(thread_id, iteration, &mut |datum, processed| {
            stats.processed.store(processed, Ordering::Relaxed);
            if !self.config.should_process(datum.y) {
                return Ok(());
            }
            batch.push(datum);
            if batch.len() == BATCH_SIZE {
                self.step(stats, &mut batch, &mut z)?;
            }
            Ok(())
        })?;
        self.step(stats, &mut batch, &mut z)
    }

    fn report(&self, bar: &ProgressBar, start: Instant) {
        let secs = start.elapsed().as_secs_f64();
        let pairs_per_sec = self.num_losses() as real / self.config.num_threads as real / secs;
        let processed = self.total_processed();
        let datum_per_sec = processed as real / secs;
        let remaining = (self.config.iterations - self.iteration.load(Ordering::Relaxed)) as u64
            * self.total_datum;
        let eta = remaining.saturating_sub(processed) as real / datum_per_sec;
        let eta = if eta.is_finite() { eta as u64 } else { 0 };
        bar.set_position((self.progress() * 1e4) as u64);
        bar.set_message(format!(
            "alpha {:7.6}, speed {:6.1}k pairs/thread/s, mean loss {:7.6}, eta {:02}h{:02}m",
            self.alpha.get(),
            pairs_per_sec / 1e3,
            self.mean_loss(),
            eta / 3600,
            (eta % 3600) / 60
        ));
    }

    fn run(&self, it: &dyn TrainIterator) -> Result<Vec<real>> {
        info!("running lexvec");
        let bar = if self.config.verbose >= 2 {
            ProgressBar::new(10_000)
        } else {
            ProgressBar::hidden()
        };
        bar.set_style(
            ProgressStyle::default_bar()
                .template("[{elapsed_precise}] {bar:40.cyan/blue} {percent:>3}% {msg}")
                .context("invalid progress bar template")?,
        );

        let mut losses = Vec::with_capacity(self.config.iterations);
        for iteration in 0..self.config.iterations {
            self.iteration.store(iteration, Ordering::Relaxed);
            for s in &self.stats {
                s.reset();
            }
            let start = Instant::now();
            let (quit, quit_rx) = mpsc::channel::<()>();
            thread::scope(|s| -> Result<()> {
                let this = self;
                let bar = &bar;
                s.spawn(move || loop {
                    match quit_rx.recv_timeout(Duration::from_secs(1)) {
                        Err(RecvTimeoutError::Timeout) => this.report(bar, start),
                        _ => return,
                    }
                });
                let threads = (0..self.config.num_threads)
                    .map(|id| s.spawn(move || this.train_thread(it, id, iteration)))
                    .collect::<Vec<_>>();
                let mut result = Ok(());
                for thread in threads {
                    let r = thread
                        .join()
                        .map_err(|_| anyhow!("worker thread panicked"))
                        .and_then(|r| r);
                    if result.is_ok() {
                        result = r;
                    }
                }
                drop(quit);
                result
            })?;
            let mean = self.mean_loss();
            info!(
                "iteration {iteration} MSE = {mean:.6}, sgdsteps {}",
                self.num_losses()
            );
            losses.push(mean);
        }
        bar.finish_and_clear();
        Ok(losses)
    }
}

/// Trains `model` for `--iterations` passes over `it`. Returns each
/// iteration's mean loss.
///
/// Results depend on thread scheduling, and differ between thread counts.
pub fn train(
    model: &Model,
    vocab: &Vocabulary,
    config: &Config,
    it: &dyn TrainIterator,
) -> Result<Vec<real>> {
    ensure!(config.num_threads > 0, "--threads must be at least 1");
    let trainer = Trainer {
        model,
        vocab,
        config,
        total_datum: it.total_datum(),
        alpha: Real::new(config.initial_alpha),
        iteration: AtomicUsize::new(0),
        stats: (0..config.num_threads)
            .map(|_| ThreadStats::default())
            .collect(),
    };
    trainer.run(it)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vocab::Vocab;
    use crate::CTX_BREAK_TOKEN;

    /// The same datum `n` times per iteration.
    struct Repeat {
        datum: Datum,
        n: u64,
    }

    impl TrainIterator for Repeat {
        fn total_datum(&self) -> u64 {
            self.n
        }

        fn iterate(
            &self,
            _thread_id: usize,
            _iteration: usize,
            callback: &mut dyn FnMut(Datum, u64) -> Result<()>,
        ) -> Result<()> {
            for i in 0..self.n {
                callback(self.datum, i + 1)?;
            }
            Ok(())
        }
    }

    fn toy_vocab() -> Vocabulary {
        let mut words = Vocab::new();
        words.push("a".to_string(), 1);
        words.push(CTX_BREAK_TOKEN.to_string(), 0);
        let mut contexts = Vocab::new();
        contexts.push("a".to_string(), 1);
        Vocabulary::from_parts(words, contexts).unwrap()
    }

    fn toy_config() -> Config {
        Config {
            dim: 2,
            num_threads: 1,
            iterations: 10,
            initial_alpha: 0.05,
            verbose: 0,
            ..Config::default()
        }
    }

    fn dot(model: &Model) -> real {
        model
            .word_row(0)
            .iter()
            .zip(model.context_row(0))
            .map(|(a, b)| a.get() * b.get())
            .sum()
    }

    #[test]
    fn single_pair_converges() {
        let vocab = toy_vocab();
        let config = toy_config();
        let model = Model::new(2, 1, 2, 3).unwrap();
        let target = 1.0;
        let before = (dot(&model) - target).abs();
        let it = Repeat {
            datum: Datum {
                word: 0,
                context: 0,
                y: target,
            },
            n: 10,
        };
        let losses = train(&model, &vocab, &config, &it).unwrap();
        assert_eq!(losses.len(), 10);
        for pair in losses.windows(2) {
            assert!(pair[1] < pair[0], "loss went up: {losses:?}");
        }
        assert!((dot(&model) - target).abs() < before);
    }

    #[test]
    fn filtered_data_is_not_trained() {
        let vocab = toy_vocab();
        let config = Config {
            process_strategy: crate::config::ProcessStrategy::Gt,
            process_threshold: 5.0,
            ..toy_config()
        };
        let model = Model::new(2, 1, 2, 3).unwrap();
        let before = dot(&model);
        let it = Repeat {
            datum: Datum {
                word: 0,
                context: 0,
                y: 1.0,
            },
            n: 10,
        };
        train(&model, &vocab, &config, &it).unwrap();
        assert_eq!(dot(&model), before);
    }

    #[test]
    fn nan_is_fatal() {
        let vocab = toy_vocab();
        let config = toy_config();
        let model = Model::new(2, 1, 2, 3).unwrap();
        let it = Repeat {
            datum: Datum {
                word: 0,
                context: 0,
                y: real::NAN,
            },
            n: 3,
        };
        let err = train(&model, &vocab, &config, &it).unwrap_err();
        assert!(err.to_string().contains("NaN"));
    }

    #[test]
    fn many_threads_share_the_tables() {
        let vocab = toy_vocab();
        let config = Config {
            num_threads: 4,
            iterations: 2,
            ..toy_config()
        };
        let model = Model::new(2, 1, 2, 3).unwrap();
        let it = Repeat {
            datum: Datum {
                word: 0,
                context: 0,
                y: 0.5,
            },
            n: 25_000,
        };
        let losses = train(&model, &vocab, &config, &it).unwrap();
        assert!(losses.iter().all(|l| l.is_finite()));
        assert!((dot(&model) - 0.5).abs() < 0.1);
    }
}
