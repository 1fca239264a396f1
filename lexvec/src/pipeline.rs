//! The commands of the `lexvec` binary.

use std::io::{BufRead, Write};

use anyhow::Result;
use log::info;

use crate::association::AssociationMeasure;
use crate::config::Config;
use crate::cooc::{build_cooc_file, build_cooc_matrix, read_all_cooc_totals};
use crate::model::{BinaryModel, Model};
use crate::real;
use crate::train::{self, ExternalIterator, InMemoryIterator};
use crate::vocab::Vocabulary;

/// `vocab`: count the corpus and save the word and context vocabularies.
pub fn vocab(config: &Config) -> Result<()> {
    let vocab_path = config.vocab()?;
    let vocab = Vocabulary::build(config)?;
    vocab.save(vocab_path)
}

/// `cooc`: write the shuffled co-occurrence stream and its totals.
pub fn cooc(config: &Config) -> Result<()> {
    config.cooc()?;
    config.cooc_totals()?;
    let mut vocab = Vocabulary::read(config.vocab()?)?;
    build_cooc_file(&mut vocab, config)
}

/// `train`: count co-occurrences in memory, then train on the corpus.
/// Returns each iteration's mean loss.
pub fn train(config: &Config) -> Result<Vec<real>> {
    config.output()?;
    let mut vocab = Vocabulary::read(config.vocab()?)?;
    vocab.process_subwords(config)?;
    let coocs = build_cooc_matrix(&mut vocab, config)?;
    let measure = AssociationMeasure::finalize(&mut vocab, config);
    let mut model = Model::for_vocab(&vocab, config)?;
    let losses = {
        let it = InMemoryIterator::new(&vocab, config, coocs.as_ref(), &measure)?;
        train::train(&model, &vocab, config, &it)?
    };
    model.save(&vocab, config)?;
    info!("finished!");
    Ok(losses)
}

/// `trainem`: train on the stream written by `cooc`.
/// Returns each iteration's mean loss.
pub fn trainem(config: &Config) -> Result<Vec<real>> {
    config.output()?;
    let mut vocab = Vocabulary::read(config.vocab()?)?;
    vocab.process_subwords(config)?;
    read_all_cooc_totals(&mut vocab, config)?;
    let measure = AssociationMeasure::finalize(&mut vocab, config);
    let mut model = Model::for_vocab(&vocab, config)?;
    let losses = {
        let it = ExternalIterator::new(&vocab, config, &measure)?;
        train::train(&model, &vocab, config, &it)?
    };
    model.save(&vocab, config)?;
    info!("finished!");
    Ok(losses)
}

/// `embed`: vectors for the words on `input`, computed from `--outputsub`.
pub fn embed<I: BufRead, O: Write>(config: &Config, input: I, output: O) -> Result<u64> {
    let mut model = BinaryModel::open(config.outputsub()?)?;
    model.embed(input, output)
}
