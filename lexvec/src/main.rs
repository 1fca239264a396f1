use std::io::{self, BufWriter};
use std::process;

use anyhow::Result;
use clap::{Parser, ValueEnum};

use lexvec::{pipeline, Config};

#[derive(Parser)]
#[command(about = "LexVec word embeddings", long_about = None, version)]
struct Options {
    #[arg(value_enum)]
    command: Command,

    #[command(flatten)]
    config: Config,
}

#[derive(Clone, Copy, ValueEnum)]
enum Command {
    /// Build the word and context vocabularies from --corpus into --vocab
    Vocab,
    /// Count co-occurrences in memory and train on --corpus
    Train,
    /// Write the shuffled co-occurrence stream for external-memory training
    Cooc,
    /// Train from the stream written by `cooc`
    Trainem,
    /// Read words from stdin and print vectors computed from --outputsub
    Embed,
}

fn run(options: &Options) -> Result<()> {
    let config = &options.config;
    match options.command {
        Command::Vocab => pipeline::vocab(config),
        Command::Train => pipeline::train(config).map(drop),
        Command::Cooc => pipeline::cooc(config),
        Command::Trainem => pipeline::trainem(config).map(drop),
        Command::Embed => {
            let stdin = io::stdin().lock();
            let stdout = BufWriter::new(io::stdout().lock());
            pipeline::embed(config, stdin, stdout).map(drop)
        }
    }
}

fn main() {
    let options = Options::parse();
    env_logger::Builder::new()
        .filter_level(options.config.log_level())
        .format_target(false)
        .init();

    if let Err(err) = run(&options) {
        eprintln!("{err:#}");
        process::exit(1);
    }
}
