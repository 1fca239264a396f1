//! PMI-family association measures.
//!
//! With `cds` the context distribution smoothing exponent,
//! `pmi(w, c) = ln(cooc) - ln(total_w) - ln(total_c^cds) + ln(sum_c total_c^cds)`.

use log::info;

use crate::config::{AssociationKind, Config};
use crate::real;
use crate::vocab::{Vocabulary, Word};

pub struct AssociationMeasure {
    kind: AssociationKind,
    clip: real,
    log_cds_total: real,
}

impl AssociationMeasure {
    /// Caches `log_total_cooc` on every word and context and sums the
    /// smoothed context totals. Co-occurrence totals must be final.
    pub fn finalize(vocab: &mut Vocabulary, config: &Config) -> Self {
        let cds = config.context_distribution_smoothing;
        let cds_total = vocab
            .contexts
            .list
            .iter()
            .map(|c| (c.total_cooc as real).powf(cds))
            .sum::<real>();
        info!("cds total: {cds_total}");
        for w in &mut vocab.words.list {
            w.log_total_cooc = (w.total_cooc as real).ln();
        }
        for c in &mut vocab.contexts.list {
            c.log_total_cooc = (c.total_cooc as real).powf(cds).ln();
        }
        AssociationMeasure {
            kind: config.association,
            clip: config.clip_pmi,
            log_cds_total: cds_total.ln(),
        }
    }

    pub fn log_cds_total(&self) -> real {
        self.log_cds_total
    }

    pub fn pmi(&self, w: &Word, c: &Word, cooc: u32) -> real {
        (cooc as real).ln() - w.log_total_cooc - c.log_total_cooc + self.log_cds_total
    }

    fn npmi(&self, w: &Word, c: &Word, cooc: u32) -> real {
        self.pmi(w, c, cooc) / -((cooc as real).ln() - self.log_cds_total)
    }

    /// The training target for a (word, context) cell holding `cooc`.
    pub fn measure(&self, w: &Word, c: &Word, cooc: u32) -> real {
        match self.kind {
            AssociationKind::Cpmi => {
                if cooc == 0 {
                    return self.clip;
                }
                self.pmi(w, c, cooc).max(self.clip)
            }
            AssociationKind::Npmi => {
                if cooc == 0 {
                    return -1.0;
                }
                self.npmi(w, c, cooc)
            }
            AssociationKind::NNegPmi => {
                if cooc == 0 {
                    return -1.0;
                }
                let pmi = self.pmi(w, c, cooc);
                if pmi >= 0.0 {
                    pmi
                } else {
                    self.npmi(w, c, cooc)
                }
            }
        }
    }
}
