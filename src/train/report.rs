use crate::corpus::SentencePair;
use crate::error::{AlignError, Result};
use std::fs::File;
use std::io::prelude::*;
use std::io::BufWriter;
use std::path::Path;

/// Poisson model of the target length given the source length
#[derive(Debug, Clone, Copy)]
pub struct LengthPrior {
    ratio: f64,
}

impl LengthPrior {
    /// Estimate the mean target/source length ratio
    pub fn fit(pairs: &[SentencePair]) -> LengthPrior {
        let (source, target) = pairs.iter().fold((0.0, 0.0), |(e, f), pair| {
            (
                e + pair.count * pair.source_len() as f64,
                f + pair.count * pair.target_len() as f64,
            )
        });
        let ratio = if source > 0.0 && target > 0.0 {
            target / source
        } else {
            1.0
        };
        LengthPrior { ratio }
    }

    pub fn ratio(&self) -> f64 {
        self.ratio
    }

    /// log P(m | l)
    pub fn log_prob(&self, l: usize, m: usize) -> f64 {
        let lambda = self.ratio * l.max(1) as f64;
        let log_factorial: f64 = (2..=m).map(|k| (k as f64).ln()).sum();
        -lambda + m as f64 * lambda.ln() - log_factorial
    }
}

/// Corpus-level scores of one pass
#[derive(Debug, Clone, Default)]
pub struct PassStats {
    pub pairs: usize,
    /// Weighted sum of log P(m | l) + log P(F | E)
    pub log_prob: f64,
    /// Same with the best alignment instead of the sum over alignments
    pub viterbi_log_prob: f64,
    /// Weighted number of predicted tokens, end of sentence included
    pub words: f64,
    /// Lattice cells reached
    pub cells: usize,
    /// Lattice cells that survived pruning
    pub kept: usize,
}

impl PassStats {
    pub fn add(&mut self, pair: &SentencePair, prior: f64, scored: &Scored) {
        self.pairs += 1;
        self.log_prob += pair.count * (prior + scored.log_likelihood);
        self.viterbi_log_prob += pair.count * (prior + scored.log_viterbi);
        self.words += pair.count * (pair.target_len() + 1) as f64;
        self.cells += scored.cells;
        self.kept += scored.kept;
    }

    pub fn merge(&mut self, other: &PassStats) {
        self.pairs += other.pairs;
        self.log_prob += other.log_prob;
        self.viterbi_log_prob += other.viterbi_log_prob;
        self.words += other.words;
        self.cells += other.cells;
        self.kept += other.kept;
    }

    pub fn perplexity(&self) -> f64 {
        if self.words > 0.0 {
            (-self.log_prob / self.words).exp()
        } else {
            f64::NAN
        }
    }

    pub fn viterbi_perplexity(&self) -> f64 {
        if self.words > 0.0 {
            (-self.viterbi_log_prob / self.words).exp()
        } else {
            f64::NAN
        }
    }

    /// Share of lattice cells kept by the beam
    pub fn kept_ratio(&self) -> f64 {
        if self.cells > 0 {
            self.kept as f64 / self.cells as f64
        } else {
            1.0
        }
    }
}

/// What one EM iteration measured
#[derive(Debug, Clone)]
pub struct IterationReport {
    pub iteration: usize,
    /// Scores of the training pass, before the M-step
    pub train: PassStats,
    /// Scores of the held-out pass, when there is a test split
    pub test: Option<PassStats>,
}

/// Scores and best alignment of one sentence pair
#[derive(Debug, Clone)]
pub struct Scored {
    pub log_likelihood: f64,
    pub log_viterbi: f64,
    /// Best state for each target position, position 0 is the start
    pub alignment: Vec<usize>,
    pub cells: usize,
    pub kept: usize,
}

/// A best alignment as written to the dump files
#[derive(Debug, Clone, PartialEq)]
pub struct Alignment {
    pub source_len: usize,
    pub links: Vec<usize>,
    pub log_score: f64,
}

impl Alignment {
    pub fn new(source_len: usize, scored: &Scored) -> Alignment {
        Alignment {
            source_len,
            links: scored.alignment.clone(),
            log_score: scored.log_viterbi,
        }
    }

    /// `j:i` for every target word, NULL states written as 0, then the score
    pub fn line(&self) -> String {
        let mut line = String::new();
        for (j, &i) in self.links.iter().enumerate().skip(1) {
            let i = if i > self.source_len { 0 } else { i };
            line.push_str(&format!("{}:{} ", j, i));
        }
        line.push_str(&self.log_score.to_string());
        line
    }
}

/// Open `dir/name` for writing
pub fn create(dir: &Path, name: &str) -> Result<BufWriter<File>> {
    let path = dir.join(name);
    File::create(&path)
        .map(BufWriter::new)
        .map_err(|e| AlignError::io(format!("creating {}", path.display()), e))
}

/// Write a file through `body`, reporting errors against its path
pub fn write_file<F>(dir: &Path, name: &str, body: F) -> Result<()>
where
    F: FnOnce(&mut BufWriter<File>) -> std::io::Result<()>,
{
    let mut w = create(dir, name)?;
    body(&mut w)
        .and_then(|_| w.flush())
        .map_err(|e| AlignError::io(format!("writing {}", dir.join(name).display()), e))
}

pub fn write_alignments(dir: &Path, name: &str, alignments: &[Alignment]) -> Result<()> {
    write_file(dir, name, |w| {
        for alignment in alignments {
            writeln!(w, "{}", alignment.line())?;
        }
        Ok(())
    })
}
