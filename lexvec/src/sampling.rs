use anyhow::{ensure, Context, Result};
use log::info;
use rand::Rng;

use crate::config::Config;
use crate::real;
use crate::vocab::Vocab;

/// Probability of discarding one occurrence of a word with frequency `freq`.
pub fn subsample_p(t: real, freq: u32, corpus_size: u64) -> real {
    if t == 0.0 {
        return 0.0;
    }
    let p = 1.0 - (t / (freq as real / corpus_size as real)).sqrt();
    p.max(0.0)
}

/// Unigram distribution raised to a power, as a lookup table of context indices.
///
/// Read-only once built; every training thread samples from the same table.
#[derive(Debug, Default)]
pub struct UnigramTable {
    table: Vec<u32>,
}

impl UnigramTable {
    /// Fails when the powered frequencies do not sum to a positive finite
    /// number, since every slot would then hold the first context.
    pub fn new(vocab: &Vocab, table_size: usize, power: real) -> Result<Self> {
        ensure!(table_size > 0, "the negative sampling table needs at least one slot");
        let n = vocab.len();
        let train_words_pow = vocab
            .list
            .iter()
            .map(|w| (w.freq as real).powf(power))
            .sum::<real>();
        ensure!(
            train_words_pow > 0.0 && train_words_pow.is_finite(),
            "cannot build a noise distribution from {n} contexts whose frequencies sum to {train_words_pow}"
        );

        let mut table = Vec::with_capacity(table_size);
        let mut i = 0;
        let mut d1 = (vocab.list[i].freq as real).powf(power) / train_words_pow;
        for a in 0..table_size {
            table.push(i as u32);
            if (a as real / table_size as real) > d1 {
                i += 1;
                if i < n {
                    d1 += (vocab.list[i].freq as real).powf(power) / train_words_pow;
                }
            }
            if i >= n {
                i = n - 1;
            }
        }
        Ok(UnigramTable { table })
    }

    /// The table over the context vocabulary negative samples are drawn
    /// from. Empty, and never sampled, without `--negative`.
    pub fn for_negatives(contexts: &Vocab, config: &Config) -> Result<Self> {
        if config.negative == 0 {
            return Ok(UnigramTable::default());
        }
        info!("creating vocab sampling distribution");
        UnigramTable::new(contexts, config.unigram_table_size, config.unigram_power)
            .context("cannot draw negative samples")
    }

    pub fn sample<R: Rng>(&self, rng: &mut R) -> u32 {
        self.table[rng.gen_range(0..self.table.len())]
    }

    /// Draws until the sample is none of `avoid`.
    ///
    /// There is no bound on the number of draws: if every slot of the table
    /// holds an avoided index this never returns.
    pub fn sample_avoiding<R: Rng>(&self, rng: &mut R, avoid: &[Option<u32>]) -> u32 {
        loop {
            let c = self.sample(rng);
            if !avoid.contains(&Some(c)) {
                return c;
            }
        }
    }
}
