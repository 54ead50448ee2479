use crate::corpus::{Corpus, SentencePair};
use crate::error::{AlignError, Result};
use crate::handlers::emission::{BoundEmissions, EmissionCounts, Emissions};
use crate::train::counts::EpochCounts;
use crate::train::report::{self, Alignment, IterationReport, LengthPrior, Scored};
use crate::train::{map_chunks, thread_pool};
use rayon::ThreadPool;
use std::path::PathBuf;
use tracing::info;

/// Configuration parameters for the IBM Model 1 warm-up
#[derive(Debug, Clone)]
pub struct Config {
    /// Number of EM iterations
    pub iterations: usize,
    /// Where tables and alignment dumps go, nothing is written without it
    pub output_dir: Option<PathBuf>,
    /// Write the Viterbi alignments of every pass
    pub dump_alignments: bool,
    /// Number of worker threads for the E-step
    pub threads: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            iterations: 5,
            output_dir: None,
            dump_alignments: false,
            threads: 1,
        }
    }
}

/// Score one pair under Model 1: every source position, NULL included,
/// is equally likely for every target word
fn align(
    index: usize,
    pair: &SentencePair,
    emissions: &BoundEmissions,
    mut counts: Option<&mut EmissionCounts>,
) -> Result<Scored> {
    let l = pair.source_len();
    let m = pair.target_len();
    let uniform = ((l + 1) as f64).ln();
    let mut alignment = vec![0; m + 1];
    let mut log_likelihood = 0.0;
    let mut log_viterbi = 0.0;
    for j in 1..=m {
        let probs: Vec<f64> = (0..=l).map(|i| emissions.prob(j, i)).collect();
        let total: f64 = probs.iter().sum();
        if !(total > 0.0) {
            return Err(AlignError::Underflow {
                pair: index,
                position: j,
            });
        }
        let mut best = 0;
        for (i, &p) in probs.iter().enumerate() {
            if p > probs[best] {
                best = i;
            }
        }
        alignment[j] = best;
        log_likelihood += total.ln() - uniform;
        log_viterbi += probs[best].ln() - uniform;
        if let Some(counts) = counts.as_deref_mut() {
            for (i, &p) in probs.iter().enumerate() {
                emissions.add_count(counts, j, i, pair.count * p / total);
            }
        }
    }
    Ok(Scored {
        log_likelihood,
        log_viterbi,
        alignment,
        cells: m * (l + 1),
        kept: m * (l + 1),
    })
}

/// IBM Model 1 trainer, used to start the HMM from sensible
/// translation probabilities
#[derive(Debug)]
pub struct Model1 {
    pub config: Config,
    emissions: Emissions,
    prior: LengthPrior,
    pool: ThreadPool,
}

impl Model1 {
    /// Start from `emissions`, spread uniformly over the training pairs
    /// if its translation table is still empty
    pub fn new(config: Config, corpus: &Corpus, mut emissions: Emissions) -> Result<Model1> {
        if config.threads == 0 {
            return Err(AlignError::config("at least one worker thread is needed"));
        }
        if emissions.translation.is_empty() {
            emissions.initialize(&corpus.train);
        }
        let pool = thread_pool(config.threads)?;
        Ok(Model1 {
            config,
            emissions,
            prior: LengthPrior::fit(&corpus.train),
            pool,
        })
    }

    pub fn emissions(&self) -> &Emissions {
        &self.emissions
    }

    pub fn into_emissions(self) -> Emissions {
        self.emissions
    }

    /// E-step over `pairs`, counting only when `train` is set
    pub fn expectation(
        &self,
        pairs: &[SentencePair],
        train: bool,
        keep_alignments: bool,
    ) -> Result<EpochCounts> {
        let chunks = map_chunks(
            &self.pool,
            pairs,
            || EpochCounts::new(None),
            |acc, index, pair| {
                let emissions = self.emissions.bind(pair);
                let counts = if train { Some(&mut acc.emissions) } else { None };
                let scored = align(index, pair, &emissions, counts)?;
                let prior = self.prior.log_prob(pair.source_len(), pair.target_len());
                acc.stats.add(pair, prior, &scored);
                if keep_alignments {
                    acc.alignments
                        .push(Alignment::new(pair.source_len(), &scored));
                }
                Ok(())
            },
        )?;
        let mut total = EpochCounts::new(None);
        for chunk in chunks {
            total.merge(chunk);
        }
        Ok(total)
    }

    /// M-step: re-estimate the translation table
    pub fn maximization(&mut self, counts: EpochCounts) {
        self.emissions.absorb(counts.emissions);
        self.emissions.normalize();
    }

    /// Run every iteration, then save `tt.m1.final`
    pub fn train(&mut self, corpus: &Corpus) -> Result<Vec<IterationReport>> {
        let dump = match &self.config.output_dir {
            Some(dir) if self.config.dump_alignments => Some(dir.clone()),
            _ => None,
        };
        let mut reports = Vec::new();
        for iteration in 1..=self.config.iterations {
            let test = if corpus.test.is_empty() {
                None
            } else {
                let counts = self.expectation(&corpus.test, false, dump.is_some())?;
                if let Some(dir) = &dump {
                    let name = format!("At.m1.{}", iteration);
                    report::write_alignments(dir, &name, &counts.alignments)?;
                }
                Some(counts.stats)
            };
            let mut counts = self.expectation(&corpus.train, true, dump.is_some())?;
            if let Some(dir) = &dump {
                let name = format!("A.m1.{}", iteration);
                report::write_alignments(dir, &name, &counts.alignments)?;
            }
            let stats = std::mem::take(&mut counts.stats);
            self.maximization(counts);
            info!(
                "Model 1 iteration {}: perplexity {:.4}, Viterbi perplexity {:.4}",
                iteration,
                stats.perplexity(),
                stats.viterbi_perplexity()
            );
            if let Some(test) = &test {
                info!(
                    "Model 1 iteration {}: test perplexity {:.4}, Viterbi perplexity {:.4}",
                    iteration,
                    test.perplexity(),
                    test.viterbi_perplexity()
                );
            }
            reports.push(IterationReport {
                iteration,
                train: stats,
                test,
            });
        }
        if let Some(dir) = &self.config.output_dir {
            report::write_file(dir, "tt.m1.final", |w| self.emissions.translation.write(w))?;
        }
        Ok(reports)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::corpus;
    use crate::handlers::emission::{NullEmission, WordEmission};
    use crate::tables::translation::{SourceKey, TTable};
    use std::collections::HashMap;

    fn corpus() -> Corpus {
        Corpus::from_pairs(
            corpus::Config::default(),
            vec![
                SentencePair::from_ids(1.0, &[1, 2], &[11, 12]),
                SentencePair::from_ids(1.0, &[1], &[11]),
                SentencePair::from_ids(1.0, &[2, 3], &[12, 13]),
            ],
            vec![SentencePair::from_ids(1.0, &[1, 3], &[11, 13])],
        )
    }

    fn model(corpus: &Corpus, iterations: usize) -> Model1 {
        let emissions = Emissions::new(
            WordEmission::Plain,
            NullEmission::Plain,
            TTable::new(corpus.target_vocab_size()),
            HashMap::new(),
        );
        let config = Config {
            iterations,
            ..Default::default()
        };
        Model1::new(config, corpus, emissions).unwrap()
    }

    #[test]
    fn test_counts_sum_to_target_words() {
        let corpus = corpus();
        let model = model(&corpus, 1);
        let counts = model.expectation(&corpus.train, true, false).unwrap();
        assert!((counts.emissions.translation.total() - 5.0).abs() < 1e-9);
        let none = model.expectation(&corpus.test, false, true).unwrap();
        assert!(none.emissions.translation.is_empty());
        assert_eq!(none.alignments.len(), 1);
    }

    #[test]
    fn test_training_learns_cooccurrence() {
        let corpus = corpus();
        let mut model = model(&corpus, 5);
        let reports = model.train(&corpus).unwrap();
        assert_eq!(reports.len(), 5);
        assert!(reports[4].train.perplexity() < reports[0].train.perplexity());
        assert!(reports[4].test.is_some());
        let t = &model.emissions().translation;
        assert!(t.get(SourceKey::Word(1), 11) > t.get(SourceKey::Word(1), 12));
        assert!(t.get(SourceKey::Word(3), 13) > t.get(SourceKey::Word(3), 12));
    }

    #[test]
    fn test_zero_threads_rejected() {
        let corpus = corpus();
        let emissions = Emissions::new(
            WordEmission::Plain,
            NullEmission::Plain,
            TTable::new(3),
            HashMap::new(),
        );
        let config = Config {
            threads: 0,
            ..Default::default()
        };
        assert!(matches!(
            Model1::new(config, &corpus, emissions),
            Err(AlignError::Config(_))
        ));
    }
}
