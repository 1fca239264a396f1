//! Word embeddings from a factored word-context association matrix.
//!
//! The pipeline is: build a vocabulary, count windowed co-occurrences (in
//! memory or through an external-memory merge/shuffle on disk), turn counts
//! into PMI-family targets, then fit word and context vectors with
//! multi-threaded SGD so that `dot(word, context)` approximates the target.

use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{anyhow, Result};

pub mod association;
pub mod config;
pub mod cooc;
pub mod merge;
pub mod model;
pub mod pipeline;
pub mod sampling;
pub mod storage;
pub mod text;
pub mod train;
pub mod vectors;
pub mod vocab;
pub mod window;

pub use config::Config;
pub use vectors::Vectors;
pub use vocab::{Vocab, Vocabulary, Word};

#[allow(non_camel_case_types)]
pub type real = f64; // Precision of float numbers

/// Token that marks a sentence break. Newlines in the corpus become this token.
pub const CTX_BREAK_TOKEN: &str = "</s>";

/// Sentences longer than this are split.
pub const MAX_SENTENCE_LENGTH: usize = 1000;

/// Suffix appended to vocabulary, totals and vector paths for the context side.
pub const CONTEXT_PATH_SUFFIX: &str = ".context";

/// How many tokens or records a streaming pass handles between progress lines.
pub const PROGRESS_INTERVAL: u64 = 10_000_000;

/// A floating-point cell that many threads may read and write at once.
///
/// SGD workers update the shared vector tables without locks ("Hogwild").
/// Relaxed atomic loads and stores keep every access well defined, but a
/// read-modify-write by one thread can overwrite a concurrent one by another.
/// Training tolerates the lost updates; results are not bit-reproducible
/// across thread counts.
#[derive(Default)]
#[repr(transparent)]
pub struct Real {
    bits: AtomicU64,
}

impl Real {
    pub fn new(value: real) -> Self {
        Real {
            bits: AtomicU64::new(value.to_bits()),
        }
    }

    pub fn get(&self) -> real {
        real::from_bits(self.bits.load(Ordering::Relaxed))
    }

    pub fn set(&self, value: real) {
        self.bits.store(value.to_bits(), Ordering::Relaxed);
    }

    pub fn add(&self, x: real) {
        let a = self.get();
        self.set(a + x);
    }
}

/// Increment a `u32` counter, failing instead of wrapping.
///
/// A wrapped co-occurrence or frequency count would silently corrupt every
/// PMI value computed from it.
pub fn checked_inc(count: &mut u32, what: &str) -> Result<()> {
    *count = count
        .checked_add(1)
        .ok_or_else(|| anyhow!("overflow in {what} counter (u32)"))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn real_cell_roundtrip() {
        let r = Real::default();
        assert_eq!(r.get(), 0.0);
        r.set(1.5);
        r.add(-0.25);
        assert_eq!(r.get(), 1.25);
    }

    #[test]
    fn checked_inc_detects_overflow() {
        let mut n = u32::MAX - 1;
        checked_inc(&mut n, "test").unwrap();
        assert_eq!(n, u32::MAX);
        let err = checked_inc(&mut n, "test").unwrap_err();
        assert!(err.to_string().contains("overflow"));
        assert_eq!(n, u32::MAX);
    }
}
