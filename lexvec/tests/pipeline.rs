//! End-to-end runs of the commands on a small generated corpus.

use std::fs;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use lexvec::config::{with_suffix, AssociationKind, OutputModel, StorageKind};
use lexvec::model::BinaryModel;
use lexvec::{pipeline, Config, Vectors, Vocab, Vocabulary, CONTEXT_PATH_SUFFIX};

const WORDS: &[&str] = &[
    "the", "cat", "dog", "sat", "on", "mat", "ran", "to", "a", "park", "big", "small", "red",
    "blue", "ate", "fish",
];

fn write_corpus(dir: &Path) -> PathBuf {
    let mut rng = StdRng::seed_from_u64(42);
    let mut text = String::new();
    for _ in 0..300 {
        let len = rng.gen_range(3..12);
        let sentence = (0..len)
            .map(|_| WORDS[rng.gen_range(0..WORDS.len())])
            .collect::<Vec<_>>();
        text.push_str(&sentence.join(" "));
        text.push('\n');
    }
    let path = dir.join("corpus.txt");
    fs::write(&path, text).unwrap();
    path
}

fn small_config(dir: &Path) -> Config {
    Config {
        corpus_path: Some(write_corpus(dir)),
        vocab_path: Some(dir.join("vocab.txt")),
        vector_output_path: Some(dir.join("vectors.txt")),
        dim: 8,
        min_freq: 1,
        subsample: 0.0,
        unigram_table_size: 10_000,
        negative: 2,
        iterations: 2,
        num_threads: 2,
        buckets: 50,
        verbose: 0,
        ..Config::default()
    }
}

fn check_vectors(config: &Config, vocab: &Vocabulary) -> Vectors {
    let vectors = Vectors::load(config.output().unwrap()).unwrap();
    assert_eq!(vectors.num_words(), vocab.words.len());
    assert_eq!(vectors.size(), config.dim);
    for w in WORDS {
        let v = vectors.get(w).unwrap();
        assert!(v.iter().all(|x| x.is_finite()));
    }
    vectors
}

#[test]
fn vocab_then_train_in_memory() {
    let dir = tempfile::tempdir().unwrap();
    let config = Config {
        subvecs_output_path: Some(dir.path().join("model.bin")),
        model: OutputModel::WordAndContext,
        ..small_config(dir.path())
    };
    pipeline::vocab(&config).unwrap();
    let vocab = Vocabulary::read(config.vocab().unwrap()).unwrap();
    assert_eq!(vocab.words.len(), WORDS.len() + 1);
    // Positional contexts at -2, -1, 1, 2 for every word but the break.
    assert_eq!(vocab.contexts.len(), WORDS.len() * 4);

    let losses = pipeline::train(&config).unwrap();
    assert_eq!(losses.len(), 2);
    assert!(losses.iter().all(|l| l.is_finite()));
    check_vectors(&config, &vocab);

    let contexts =
        Vectors::load(&with_suffix(config.output().unwrap(), CONTEXT_PATH_SUFFIX)).unwrap();
    assert_eq!(contexts.num_words(), vocab.contexts.len());

    let model = BinaryModel::open(config.outputsub().unwrap()).unwrap();
    assert_eq!(model.header.vocab_size as usize, vocab.words.len());
    assert_eq!(
        model.header.subword_matrix_rows as usize,
        vocab.words.len() + 50
    );
    let vocab_words = vocab.words.list.iter().map(|w| w.text.clone()).collect::<Vec<_>>();
    assert_eq!(model.words(), &vocab_words[..]);

    let mut out = vec![];
    let n = pipeline::embed(&config, Cursor::new("cat\nzebra\ncat <c at>\n"), &mut out).unwrap();
    assert_eq!(n, 3);
    let out = String::from_utf8(out).unwrap();
    let lines = out.lines().collect::<Vec<_>>();
    assert!(lines[1].starts_with("zebra "));
    for line in lines {
        assert_eq!(line.split(' ').count(), 1 + config.dim);
    }
}

#[test]
fn cached_storage_and_merged_context_vectors() {
    let dir = tempfile::tempdir().unwrap();
    let config = Config {
        storage: StorageKind::Cached,
        // Small enough that most cells land in the key-value store.
        cache_mem: 1e-7,
        kv_path: Some(dir.path().join("kv")),
        association: AssociationKind::NNegPmi,
        positional_contexts: false,
        model: OutputModel::WordPlusContext,
        subword_min_n: 0,
        num_threads: 3,
        ..small_config(dir.path())
    };
    pipeline::vocab(&config).unwrap();
    let vocab = Vocabulary::read(config.vocab().unwrap()).unwrap();
    assert_eq!(vocab.contexts.len(), vocab.words.len());
    let losses = pipeline::train(&config).unwrap();
    assert!(losses.iter().all(|l| l.is_finite()));
    check_vectors(&config, &vocab);
}

#[test]
fn skipped_context_counts_still_train() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().to_path_buf();
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let config = Config {
            positional_contexts: false,
            skip_context_counts: true,
            cooc_path: Some(root.join("cooc.bin")),
            cooc_totals_path: Some(root.join("cooctotals.txt")),
            ..small_config(&root)
        };
        let run = || -> anyhow::Result<_> {
            pipeline::vocab(&config)?;
            let vocab = Vocabulary::read(config.vocab()?)?;
            let losses = pipeline::train(&config)?;
            pipeline::cooc(&config)?;
            let em_losses = pipeline::trainem(&config)?;
            Ok((vocab, losses, em_losses))
        };
        let _ = tx.send(run());
    });
    let (vocab, losses, em_losses) = rx
        .recv_timeout(Duration::from_secs(120))
        .expect("training with skipped context counts did not finish")
        .unwrap();

    assert_eq!(vocab.contexts.len(), vocab.words.len());
    for c in &vocab.contexts.list {
        assert_eq!(c.freq, vocab.words.get(&c.text).unwrap().freq, "{}", c.text);
    }
    assert!(vocab.contexts.list.iter().filter(|c| c.freq > 0).count() > 1);
    assert!(losses.iter().all(|l| l.is_finite()));
    assert!(em_losses.iter().all(|l| l.is_finite()));
}

#[test]
fn external_memory_cooc_then_trainem() {
    let dir = tempfile::tempdir().unwrap();
    let cooc_path = dir.path().join("cooc.bin");
    let totals_path = dir.path().join("cooctotals.txt");
    let config = Config {
        cooc_path: Some(cooc_path.clone()),
        cooc_totals_path: Some(totals_path.clone()),
        // A few hundred records per buffer, so the merge sees many files.
        line_buf_mem: 5e-6,
        bincode: true,
        ..small_config(dir.path())
    };
    pipeline::vocab(&config).unwrap();
    pipeline::cooc(&config).unwrap();

    let size = fs::metadata(&cooc_path).unwrap().len();
    assert!(size > 0);
    assert_eq!(size % 12, 0);
    let leftovers = fs::read_dir(dir.path())
        .unwrap()
        .filter(|e| {
            let name = e.as_ref().unwrap().file_name();
            name.to_string_lossy().starts_with("cooc.bin.")
        })
        .count();
    assert_eq!(leftovers, 0);

    let total = |path: &Path| {
        let mut sum = 0u64;
        Vocab::read_counts(path, |_, n| {
            sum += n as u64;
            Ok(())
        })
        .unwrap();
        sum
    };
    let word_total = total(&totals_path);
    assert!(word_total > 0);
    assert_eq!(
        word_total,
        total(&with_suffix(&totals_path, CONTEXT_PATH_SUFFIX))
    );

    let losses = pipeline::trainem(&config).unwrap();
    assert_eq!(losses.len(), 2);
    assert!(losses.iter().all(|l| l.is_finite()));
    let vectors = Vectors::load_bincode(config.output().unwrap()).unwrap();
    assert_eq!(vectors.size(), config.dim);
    assert!(vectors.lookup_word("cat").is_some());
}

#[test]
fn missing_paths_are_reported() {
    let dir = tempfile::tempdir().unwrap();
    let config = Config {
        vector_output_path: None,
        ..small_config(dir.path())
    };
    let err = pipeline::train(&config).unwrap_err();
    assert!(format!("{err:#}").contains("--output"));
    let err = pipeline::cooc(&config).unwrap_err();
    assert!(format!("{err:#}").contains("--coocpath"));
}
