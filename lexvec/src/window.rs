use std::io;

use anyhow::{Context, Result};
use log::error;
use rand::rngs::StdRng;
use rand::Rng;

use crate::config::Config;
use crate::sampling::subsample_p;
use crate::text::Token;
use crate::vocab::Vocabulary;
use crate::MAX_SENTENCE_LENGTH;

/// One callback invocation of the windower.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WindowPair {
    /// Index into the word vocabulary.
    pub target: u32,
    /// Index into the context vocabulary, or `None` for the once-per-target
    /// signal that asks for negative samples.
    pub context: Option<u32>,
    /// Relative position of the context (`i - j`); 0 for the target-only signal.
    pub position: i32,
    /// Corpus offset just past the token that closed the sentence.
    pub offset: u64,
}

/// Slides a symmetric window over the sentences of a token stream.
pub struct Windower<'a> {
    vocab: &'a Vocabulary,
    config: &'a Config,
    /// Context index for each (word, relative position) pair, `slots` per word.
    contexts: Vec<Option<u32>>,
    slots: usize,
}

impl<'a> Windower<'a> {
    pub fn new(vocab: &'a Vocabulary, config: &'a Config) -> Self {
        let window = config.window as i32;
        let (slots, contexts) = if config.positional_contexts {
            let positions = (-window..=window).filter(|&p| p != 0).collect::<Vec<_>>();
            let contexts = vocab
                .words
                .list
                .iter()
                .flat_map(|w| positions.iter().map(|&p| vocab.contexts.idx(&w.positional(p))))
                .collect();
            (positions.len(), contexts)
        } else {
            let contexts = vocab
                .words
                .list
                .iter()
                .map(|w| vocab.contexts.idx(&w.text))
                .collect();
            (1, contexts)
        };
        Windower {
            vocab,
            config,
            contexts,
            slots,
        }
    }

    fn context_of(&self, w: u32, pos: i32) -> Option<u32> {
        let slot = if !self.config.positional_contexts {
            0
        } else if pos < 0 {
            (pos + self.config.window as i32) as usize
        } else {
            (pos + self.config.window as i32 - 1) as usize
        };
        self.contexts[w as usize * self.slots + slot]
    }

    fn context_name(&self, w: u32, pos: i32) -> String {
        let word = self.vocab.words.word(w);
        if self.config.positional_contexts {
            word.positional(pos)
        } else {
            word.text.clone()
        }
    }

    /// Runs the window over every sentence of `tokens`.
    ///
    /// Tokens outside the vocabulary are dropped, frequent words are
    /// subsampled, and sentences longer than `MAX_SENTENCE_LENGTH` are split.
    /// `callback` is called for every (target, context) pair in the window,
    /// plus once per target with no context when `include_target_only` is
    /// set. Windowing stops as soon as the callback returns `Ok(false)`.
    pub fn run<I, F>(
        &self,
        tokens: I,
        rng: &mut StdRng,
        include_target_only: bool,
        mut callback: F,
    ) -> Result<()>
    where
        I: Iterator<Item = io::Result<Token>>,
        F: FnMut(WindowPair) -> Result<bool>,
    {
        let ctx_break = self.vocab.ctx_break;
        let corpus_size = self.vocab.corpus_size;
        let subsample = self.config.subsample;

        let mut buf: Vec<u32> = Vec::with_capacity(MAX_SENTENCE_LENGTH);
        let mut last_offset = 0;
        for token in tokens {
            let token = token.context("error reading corpus")?;
            last_offset = token.offset;
            let Some(w) = self.vocab.words.idx(&token.text) else {
                continue;
            };

            if w != ctx_break && subsample > 0.0 {
                let p = subsample_p(subsample, self.vocab.words.word(w).freq, corpus_size);
                if p > 0.0 && rng.gen::<f64>() <= p {
                    continue;
                }
            }

            if w == ctx_break || buf.len() == MAX_SENTENCE_LENGTH {
                if !self.sentence(&buf, token.offset, rng, include_target_only, &mut callback)? {
                    return Ok(());
                }
                buf.clear();
            }
            if w != ctx_break {
                buf.push(w);
            }
        }
        // A corpus that does not end in a newline still has a last sentence.
        self.sentence(&buf, last_offset, rng, include_target_only, &mut callback)?;
        Ok(())
    }

    fn sentence<F>(
        &self,
        buf: &[u32],
        offset: u64,
        rng: &mut StdRng,
        include_target_only: bool,
        callback: &mut F,
    ) -> Result<bool>
    where
        F: FnMut(WindowPair) -> Result<bool>,
    {
        for (j, &target) in buf.iter().enumerate() {
            let mut win = self.config.window;
            if self.config.weighted_window && win > 0 {
                win = 1 + rng.gen_range(0..win);
            }

            let start = j.saturating_sub(win);
            let end = (j + win + 1).min(buf.len());
            for i in start..end {
                if i == j {
                    continue;
                }
                let position = i as i32 - j as i32;
                let Some(context) = self.context_of(buf[i], position) else {
                    error!("ctx word {} not in vocab", self.context_name(buf[i], position));
                    continue;
                };
                let pair = WindowPair {
                    target,
                    context: Some(context),
                    position,
                    offset,
                };
                if !callback(pair)? {
                    return Ok(false);
                }
            }
            if include_target_only {
                let pair = WindowPair {
                    target,
                    context: None,
                    position: 0,
                    offset,
                };
                if !callback(pair)? {
                    return Ok(false);
                }
            }
        }
        Ok(true)
    }
}
