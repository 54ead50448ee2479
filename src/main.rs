use anyhow::{Context, Result};
use clap::Parser;
use hmmalign::corpus::{self, Corpus, Vocabularies};
use hmmalign::handlers::emission::{Emissions, NullEmission, WordEmission};
use hmmalign::handlers::transition::{ContextFeatures, DEFAULT_CONTEXT_CUTOFF};
use hmmalign::tables::jump::{JumpClasses, JumpTable, DEFAULT_BUCKET_LIMIT};
use hmmalign::tables::translation::TTable;
use hmmalign::train::hmm::{Beam, Config as HmmConfig, Hmm, Order};
use hmmalign::train::model1::{Config as Model1Config, Model1};
use std::path::{Path, PathBuf};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    /// Training corpus: count, source and target lines per pair
    #[arg(long)]
    train: PathBuf,
    /// Held-out corpus, scored before every training pass
    #[arg(long)]
    test: Option<PathBuf>,
    /// Number of Model 1 iterations
    #[arg(long, default_value_t = 5)]
    m1: usize,
    /// Number of HMM iterations
    #[arg(long, default_value_t = 5)]
    hmm: usize,
    /// Source tokens carry `_tag` suffixes
    #[arg(long)]
    st: bool,
    /// Target tokens carry `_tag` suffixes
    #[arg(long)]
    tt: bool,
    /// Use the source tags
    #[arg(long, requires = "st")]
    ust: bool,
    /// Use the target tags
    #[arg(long, requires = "tt")]
    utt: bool,
    /// Tags the transitions are conditioned on: 32, 16, 8 for the source
    /// words before, at and after the previous alignment, 4, 2, 1 for the
    /// previous, current and next target words
    #[arg(short, long, default_value_t = 0)]
    mask: u32,
    /// Start from this translation table
    #[arg(long)]
    ttfile: Option<PathBuf>,
    /// Start from this jump table
    #[arg(long)]
    atfile: Option<PathBuf>,
    /// Model staying on a source word apart from the other jumps
    #[arg(long)]
    sg: bool,
    /// Condition transitions on the previous jump as well
    #[arg(long)]
    tri: bool,
    /// Keep the exact previous jump instead of clipping it
    #[arg(long, requires = "tri")]
    exact_history: bool,
    /// Prune the trigram lattice
    #[arg(long, requires = "tri")]
    beam: bool,
    /// Beam width of training passes
    #[arg(long, default_value_t = 500.0)]
    beam_train: f64,
    /// Beam width of held-out passes
    #[arg(long, default_value_t = 5000.0)]
    beam_test: f64,
    /// Back off word emissions to the source tag
    #[arg(long)]
    tag_emissions: bool,
    /// Condition NULL emissions on the following target word
    #[arg(long)]
    null_context: bool,
    /// Transition contexts seen this often or less share one table
    #[arg(long, default_value_t = DEFAULT_CONTEXT_CUTOFF)]
    context_cutoff: f64,
    /// Directory for the tables and alignment dumps
    #[arg(long)]
    output_dir: Option<PathBuf>,
    /// Write the Viterbi alignments of every pass
    #[arg(long, requires = "output_dir")]
    dump_alignments: bool,
    /// Save the jump table every N HMM iterations
    #[arg(long, default_value_t = 0)]
    save_every: usize,
    /// Number of worker threads
    #[arg(long, default_value_t = 1)]
    threads: usize,
    /// Source vocabulary, `e.vcb` next to the training corpus by default
    #[arg(long)]
    source_vocab: Option<PathBuf>,
    /// Target vocabulary, `f.vcb` next to the training corpus by default
    #[arg(long)]
    target_vocab: Option<PathBuf>,
    /// Log per-table diagnostics
    #[arg(long)]
    verbose: bool,
}

fn output_dir(dir: &Path) -> Result<()> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create output directory {}", dir.display()))
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .with_writer(std::io::stderr)
        .init();

    let mut corpus = Corpus::new(corpus::Config {
        source_tags: cli.st,
        target_tags: cli.tt,
        use_source_tags: cli.ust,
        use_target_tags: cli.utt,
    });
    corpus.load_train(&cli.train)?;
    if let Some(test) = &cli.test {
        corpus.load_test(test)?;
    }
    let vocabs = Vocabularies::for_corpus(
        &cli.train,
        cli.source_vocab.as_deref(),
        cli.target_vocab.as_deref(),
    )?;

    let order = if cli.tri {
        Order::Trigram {
            classes: if cli.exact_history {
                JumpClasses::Exact
            } else {
                JumpClasses::Bucketed(DEFAULT_BUCKET_LIMIT)
            },
            beam: cli.beam.then_some(Beam {
                train: cli.beam_train,
                test: cli.beam_test,
            }),
        }
    } else {
        Order::Bigram
    };
    let word_emission = if cli.tag_emissions {
        WordEmission::TagBackoff
    } else {
        WordEmission::Plain
    };
    let hmm_config = HmmConfig {
        iterations: cli.hmm,
        features: ContextFeatures::from_mask(cli.mask)?,
        context_cutoff: cli.context_cutoff,
        stay_go: cli.sg,
        order,
        word_emission,
        null_emission: if cli.null_context {
            NullEmission::FollowingWord
        } else {
            NullEmission::Plain
        },
        output_dir: cli.output_dir.clone(),
        dump_alignments: cli.dump_alignments,
        save_every: cli.save_every,
        threads: cli.threads,
    };
    hmm_config.validate(&corpus)?;
    if let Some(dir) = &cli.output_dir {
        output_dir(dir)?;
    }

    let vocab_size = corpus.target_vocab_size();
    let translation = match &cli.ttfile {
        Some(path) => {
            let table = TTable::read(path, vocab_size)?;
            info!("Read {} translation probabilities from {}", table.len(), path.display());
            table
        }
        None => TTable::new(vocab_size),
    };
    let mut emissions = Emissions::new(
        word_emission,
        NullEmission::Plain,
        translation,
        corpus.occurrences().clone(),
    );

    if cli.m1 > 0 {
        let mut model1 = Model1::new(
            Model1Config {
                iterations: cli.m1,
                output_dir: cli.output_dir.clone(),
                dump_alignments: cli.dump_alignments,
                threads: cli.threads,
            },
            &corpus,
            emissions,
        )?;
        model1.train(&corpus)?;
        emissions = model1.into_emissions();
    }

    if cli.hmm > 0 {
        let warm = match &cli.atfile {
            Some(path) => Some(JumpTable::read(path)?),
            None => None,
        };
        let mut hmm = Hmm::new(hmm_config, &corpus, emissions, warm)?;
        hmm.train(&corpus)?;
        if let Some(dir) = &cli.output_dir {
            hmm.save(dir, Some(&vocabs))?;
        }
    }
    Ok(())
}
