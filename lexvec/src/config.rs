use std::path::{Path, PathBuf};

use anyhow::{anyhow, Result};
use clap::{ArgAction, Parser, ValueEnum};

use crate::real;

/// Which association measure turns a co-occurrence count into a training target.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum AssociationKind {
    /// PMI floored at `--clip` (0 gives PPMI)
    Cpmi,
    /// Normalized PMI, roughly in [-1, 1]
    Npmi,
    /// PMI when non-negative, normalized PMI otherwise
    #[value(name = "nnegpmi")]
    NNegPmi,
}

/// Which matrix cells are trained on, judged by their target value.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum ProcessStrategy {
    All,
    /// Only cells whose target is greater than `--processthreshold`
    Gt,
    /// Only cells whose target is less than or equal to `--processthreshold`
    Leq,
}

/// Backend for the in-memory co-occurrence matrix.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum StorageKind {
    /// One hash map per row
    Dict,
    /// Hash map for small-index cells, on-disk key-value store for the rest
    Cached,
}

/// What goes into the text vector output.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum OutputModel {
    /// Word vectors, plus context vectors in `<output>.context`
    #[value(name = "0")]
    WordAndContext,
    /// Word vectors only
    #[value(name = "1")]
    Word,
    /// Word vectors with their context vectors added in
    #[value(name = "2")]
    WordPlusContext,
}

/// Every hyperparameter and path of a run. Built once, then passed around by reference.
#[derive(clap::Args, Clone, Debug)]
pub struct Config {
    /// Path to corpus
    #[arg(long = "corpus", value_name = "FILE")]
    pub corpus_path: Option<PathBuf>,

    /// Path where to output/load vocab; the context vocab lives at FILE.context
    #[arg(long = "vocab", value_name = "FILE")]
    pub vocab_path: Option<PathBuf>,

    /// Where to save vectors
    #[arg(long = "output", value_name = "FILE")]
    pub vector_output_path: Option<PathBuf>,

    /// Where to save binary subword vectors
    #[arg(long = "outputsub", value_name = "FILE")]
    pub subvecs_output_path: Option<PathBuf>,

    /// Path to coocs when using external memory
    #[arg(long = "coocpath", value_name = "FILE")]
    pub cooc_path: Option<PathBuf>,

    /// Path to cooc totals for each word when using external memory
    #[arg(long = "cooctotalspath", value_name = "FILE")]
    pub cooc_totals_path: Option<PathBuf>,

    /// Path to subword information (`word sw1 sw2 ...` per line)
    #[arg(long = "subword", value_name = "FILE")]
    pub subword_path: Option<PathBuf>,

    /// Minimum ngram length when generating subwords; 0 disables generated subwords
    #[arg(long = "minn", default_value_t = 3)]
    pub subword_min_n: u32,

    /// Maximum ngram length when generating subwords
    #[arg(long = "maxn", default_value_t = 6)]
    pub subword_max_n: u32,

    /// Subword hash buckets
    #[arg(long, default_value_t = 2_000_000)]
    pub buckets: u32,

    /// Number of dimensions of word vectors
    #[arg(long, default_value_t = 300)]
    pub dim: usize,

    /// Symmetric window of (window, word, window)
    #[arg(long, default_value_t = 2)]
    pub window: usize,

    /// Use randomized window size from uniform(1, window)
    #[arg(long = "weightwindow")]
    pub weighted_window: bool,

    /// Use positional contexts
    #[arg(long = "pos", default_value_t = true, action = ArgAction::Set)]
    pub positional_contexts: bool,

    /// Remove from vocab words that occur less than this number of times
    #[arg(long = "minfreq", default_value_t = 100)]
    pub min_freq: u32,

    /// Max vocab size, 0 for no limit
    #[arg(long = "maxvocab", default_value_t = 0)]
    pub max_vocab: u32,

    /// Subsampling threshold
    #[arg(long, default_value_t = 1e-5)]
    pub subsample: real,

    /// Context distribution smoothing
    #[arg(long = "cds", default_value_t = 0.75)]
    pub context_distribution_smoothing: real,

    /// Raise unigram dist to this power
    #[arg(long = "unigrampow", default_value_t = 0.75)]
    pub unigram_power: real,

    /// Number of slots in the negative sampling table
    #[arg(long = "unigram-table-size", default_value_t = 100_000_000)]
    pub unigram_table_size: usize,

    /// Number of negative samples
    #[arg(long, default_value_t = 5)]
    pub negative: usize,

    /// Which matrix to factor
    #[arg(long = "matrix", value_enum, default_value_t = AssociationKind::Cpmi)]
    pub association: AssociationKind,

    /// Clip value for cPMI (default of 0 gives PPMI)
    #[arg(long = "clip", default_value_t = 0.0, allow_negative_numbers = true)]
    pub clip_pmi: real,

    /// Which matrix cells to factor
    #[arg(long = "process", value_enum, default_value_t = ProcessStrategy::All)]
    pub process_strategy: ProcessStrategy,

    /// Threshold for --process (gt 0 means only cells > 0; leq 0 means only cells <= 0)
    #[arg(long = "processthreshold", default_value_t = 0.0, allow_negative_numbers = true)]
    pub process_threshold: real,

    /// Learning rate
    #[arg(long = "alpha", default_value_t = 0.025)]
    pub initial_alpha: real,

    /// How many times to process corpus
    #[arg(long, default_value_t = 5)]
    pub iterations: usize,

    /// Number of threads to use
    #[arg(long = "threads", value_name = "N", default_value_t = 12)]
    pub num_threads: usize,

    /// 0 = output W, C; 1 = output W; 2 = output W + C
    #[arg(long, value_enum, default_value_t = OutputModel::Word)]
    pub model: OutputModel,

    /// GB of memory to use in line buffer
    #[arg(long = "memory", default_value_t = 4.0)]
    pub line_buf_mem: real,

    /// Backend for the co-occurrence matrix when training in memory
    #[arg(long, value_enum, default_value_t = StorageKind::Dict)]
    pub storage: StorageKind,

    /// GB of memory for the in-memory part of the cached storage backend
    #[arg(long = "cache-memory", default_value_t = 4.0)]
    pub cache_mem: real,

    /// Directory of the cached storage backend's key-value store (temporary if absent)
    #[arg(long = "kv-path", value_name = "DIR")]
    pub kv_path: Option<PathBuf>,

    /// Treat period as whitespace and as a sentence break
    #[arg(long = "periodiswhitespace")]
    pub period_is_whitespace: bool,

    /// Skip the corpus pass that counts context frequencies when building a vocab
    #[arg(long = "skip-context-counts")]
    pub skip_context_counts: bool,

    /// Seed of the random number generator
    #[arg(long, default_value_t = 1)]
    pub seed: u64,

    /// Save the output vectors as a bincode dump instead of text
    #[arg(long)]
    pub bincode: bool,

    /// Verboseness (0 = errors only, 1 = info, 2 = debug)
    #[arg(long, default_value_t = 2)]
    pub verbose: u8,
}

#[derive(Parser)]
struct Defaults {
    #[command(flatten)]
    config: Config,
}

impl Default for Config {
    fn default() -> Self {
        Defaults::parse_from(["lexvec"]).config
    }
}

fn required<'a>(path: &'a Option<PathBuf>, flag: &str) -> Result<&'a Path> {
    path.as_deref()
        .ok_or_else(|| anyhow!("--{flag} is a required argument"))
}

impl Config {
    pub fn corpus(&self) -> Result<&Path> {
        required(&self.corpus_path, "corpus")
    }

    pub fn vocab(&self) -> Result<&Path> {
        required(&self.vocab_path, "vocab")
    }

    pub fn output(&self) -> Result<&Path> {
        required(&self.vector_output_path, "output")
    }

    pub fn outputsub(&self) -> Result<&Path> {
        required(&self.subvecs_output_path, "outputsub")
    }

    pub fn cooc(&self) -> Result<&Path> {
        required(&self.cooc_path, "coocpath")
    }

    pub fn cooc_totals(&self) -> Result<&Path> {
        required(&self.cooc_totals_path, "cooctotalspath")
    }

    /// Whether a cell with target value `y` is trained on.
    pub fn should_process(&self, y: real) -> bool {
        match self.process_strategy {
            ProcessStrategy::All => true,
            ProcessStrategy::Gt => y > self.process_threshold,
            ProcessStrategy::Leq => y <= self.process_threshold,
        }
    }

    /// Whether the word table carries subword bucket rows.
    pub fn uses_subwords(&self) -> bool {
        self.subword_min_n >= 1 || self.subword_path.is_some()
    }

    pub fn log_level(&self) -> log::LevelFilter {
        match self.verbose {
            0 => log::LevelFilter::Error,
            1 => log::LevelFilter::Info,
            _ => log::LevelFilter::Debug,
        }
    }
}

/// Appends `suffix` to the file name of `path` (`vocab.txt` becomes `vocab.txt.context`).
pub fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut s = path.as_os_str().to_owned();
    s.push(suffix);
    PathBuf::from(s)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_cli() {
        let config = Config::default();
        assert_eq!(config.dim, 300);
        assert_eq!(config.window, 2);
        assert!(config.positional_contexts);
        assert_eq!(config.min_freq, 100);
        assert_eq!(config.association, AssociationKind::Cpmi);
        assert_eq!(config.model, OutputModel::Word);
        assert_eq!(config.unigram_table_size, 100_000_000);
        assert_eq!(config.buckets, 2_000_000);
        assert_eq!(config.subsample, 1e-5);
    }

    #[test]
    fn parse_options() {
        let config = Defaults::parse_from([
            "lexvec",
            "--matrix",
            "nnegpmi",
            "--model",
            "0",
            "--pos",
            "false",
            "--clip",
            "-1",
            "--process",
            "gt",
        ])
        .config;
        assert_eq!(config.association, AssociationKind::NNegPmi);
        assert_eq!(config.model, OutputModel::WordAndContext);
        assert!(!config.positional_contexts);
        assert_eq!(config.clip_pmi, -1.0);
        assert!(config.should_process(0.5));
        assert!(!config.should_process(0.0));
    }

    #[test]
    fn invalid_values_are_rejected() {
        assert!(Defaults::try_parse_from(["lexvec", "--matrix", "ppmi"]).is_err());
        assert!(Defaults::try_parse_from(["lexvec", "--model", "3"]).is_err());
        assert!(Defaults::try_parse_from(["lexvec", "--process", "lt"]).is_err());
    }

    #[test]
    fn missing_paths_are_errors() {
        let config = Config::default();
        let err = config.corpus().unwrap_err();
        assert!(err.to_string().contains("--corpus"));
    }

    #[test]
    fn suffix() {
        assert_eq!(
            with_suffix(Path::new("out/vocab.txt"), ".context"),
            PathBuf::from("out/vocab.txt.context")
        );
    }
}
