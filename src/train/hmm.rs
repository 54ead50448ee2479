use crate::corpus::{Corpus, SentencePair, Vocabularies};
use crate::error::{AlignError, Result};
use crate::handlers::emission::{Emissions, NullEmission, WordEmission};
use crate::handlers::transition::{
    Context, ContextFeatures, Jumps, TaggedJumps, TransitionHandler, DEFAULT_CONTEXT_CUTOFF,
};
use crate::tables::jump::{JumpClasses, JumpTable};
use crate::tables::stay_go::StayGoTable;
use crate::train::counts::EpochCounts;
use crate::train::report::{self, Alignment, IterationReport, LengthPrior, PassStats};
use crate::train::{lattice, map_chunks, thread_pool, trigram};
use rayon::ThreadPool;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Beam widths of a pruned trigram run: cells below `1/K` of their
/// column's best are dropped
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Beam {
    pub train: f64,
    pub test: f64,
}

impl Default for Beam {
    fn default() -> Self {
        Beam {
            train: 500.0,
            test: 5000.0,
        }
    }
}

/// Order of the alignment chain
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Order {
    Bigram,
    /// Transitions also see the class of the previous jump
    Trigram {
        classes: JumpClasses,
        beam: Option<Beam>,
    },
}

impl Order {
    fn classes(&self) -> JumpClasses {
        match self {
            Order::Bigram => JumpClasses::Shared,
            Order::Trigram { classes, .. } => *classes,
        }
    }
}

/// Configuration parameters for HMM training
#[derive(Debug, Clone)]
pub struct Config {
    /// Number of EM iterations
    pub iterations: usize,
    /// Tags the transitions are conditioned on, none for a plain table
    pub features: ContextFeatures,
    /// Contexts seen this often or less fall back to the smoothing table
    pub context_cutoff: f64,
    /// Model staying on a word apart from the other moves
    pub stay_go: bool,
    pub order: Order,
    pub word_emission: WordEmission,
    pub null_emission: NullEmission,
    /// Where tables and alignment dumps go, nothing is written without it
    pub output_dir: Option<PathBuf>,
    /// Write the Viterbi alignments of every pass
    pub dump_alignments: bool,
    /// Save the jump table every this many iterations, 0 for never
    pub save_every: usize,
    /// Number of worker threads for the E-step
    pub threads: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            iterations: 5,
            features: ContextFeatures::default(),
            context_cutoff: DEFAULT_CONTEXT_CUTOFF,
            stay_go: false,
            order: Order::Bigram,
            word_emission: WordEmission::Plain,
            null_emission: NullEmission::Plain,
            output_dir: None,
            dump_alignments: false,
            save_every: 0,
            threads: 1,
        }
    }
}

impl Config {
    /// Reject combinations the corpus cannot support
    pub fn validate(&self, corpus: &Corpus) -> Result<()> {
        if self.features.uses_source_tags() && !corpus.has_source_tags() {
            return Err(AlignError::config(
                "source tag contexts need tagged source sentences (--st --ust)",
            ));
        }
        if self.features.uses_target_tags() && !corpus.has_target_tags() {
            return Err(AlignError::config(
                "target tag contexts need tagged target sentences (--tt --utt)",
            ));
        }
        if self.word_emission == WordEmission::TagBackoff && !corpus.has_source_tags() {
            return Err(AlignError::config(
                "tag emissions need tagged source sentences (--st --ust)",
            ));
        }
        if let Order::Trigram {
            beam: Some(beam), ..
        } = self.order
        {
            if !(beam.train >= 1.0 && beam.test >= 1.0) {
                return Err(AlignError::config(format!(
                    "beam widths must be at least 1, got {} and {}",
                    beam.train, beam.test
                )));
            }
        }
        if self.threads == 0 {
            return Err(AlignError::config("at least one worker thread is needed"));
        }
        Ok(())
    }
}

/// HMM alignment model and its EM trainer
#[derive(Debug)]
pub struct Hmm {
    pub config: Config,
    emissions: Emissions,
    transitions: TransitionHandler,
    prior: LengthPrior,
    pool: ThreadPool,
}

impl Hmm {
    /// Build the model for `corpus`.  The jump table starts uniform
    /// unless `warm` is given; tagged transitions get one table per
    /// context that is frequent along the Viterbi paths of `emissions`.
    pub fn new(
        config: Config,
        corpus: &Corpus,
        mut emissions: Emissions,
        warm: Option<JumpTable>,
    ) -> Result<Hmm> {
        config.validate(corpus)?;
        let classes = config.order.classes();
        let max_len = corpus.max_source_len();
        let base = match warm {
            None => JumpTable::uniform(classes, max_len),
            Some(table) => {
                if table.classes() != classes {
                    return Err(AlignError::config(format!(
                        "jump table conditions on {:?}, the model on {:?}",
                        table.classes(),
                        classes
                    )));
                }
                if table.max_len() < max_len {
                    return Err(AlignError::config(format!(
                        "jump table covers sentences up to {} words, the corpus has {}",
                        table.max_len(),
                        max_len
                    )));
                }
                table
            }
        };
        emissions.word = config.word_emission;
        emissions.null = config.null_emission;
        if emissions.translation.is_empty() {
            emissions.initialize(&corpus.train);
        }
        let pool = thread_pool(config.threads)?;
        let jumps = if config.features.is_empty() {
            Jumps::Plain(base)
        } else {
            let contexts = frequent_contexts(&config, &pool, &corpus.train, &emissions, max_len)?;
            Jumps::Tagged(TaggedJumps::new(config.features, &base, contexts))
        };
        let transitions = if config.stay_go {
            TransitionHandler::StayGo {
                table: StayGoTable::new(),
                go: jumps,
            }
        } else {
            TransitionHandler::Jumps(jumps)
        };
        Ok(Hmm {
            prior: LengthPrior::fit(&corpus.train),
            config,
            emissions,
            transitions,
            pool,
        })
    }

    pub fn emissions(&self) -> &Emissions {
        &self.emissions
    }

    pub fn transitions(&self) -> &TransitionHandler {
        &self.transitions
    }

    fn beam(&self, train: bool) -> Option<f64> {
        match self.config.order {
            Order::Trigram {
                beam: Some(beam), ..
            } => Some(if train { beam.train } else { beam.test }),
            _ => None,
        }
    }

    /// E-step over `pairs`.  Counts are only gathered when `train` is
    /// set; scores and alignments always are.
    pub fn expectation(
        &self,
        pairs: &[SentencePair],
        train: bool,
        keep_alignments: bool,
    ) -> Result<EpochCounts> {
        let beam = self.beam(train);
        let chunks = map_chunks(
            &self.pool,
            pairs,
            || EpochCounts::new(train.then(|| self.transitions.counts())),
            |acc, index, pair| {
                let emissions = self.emissions.bind(pair);
                let transitions = self.transitions.bind(pair);
                let counts = if train { Some(&mut *acc) } else { None };
                let scored = match self.config.order {
                    Order::Bigram => lattice::run(index, pair, &emissions, &transitions, counts)?,
                    Order::Trigram { classes, .. } => trigram::run(
                        index,
                        pair,
                        classes,
                        beam,
                        &emissions,
                        &transitions,
                        counts,
                    )?,
                };
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
        if beam.is_some() && total.stats.kept < total.stats.cells {
            debug!(
                "Beam kept {:.2}% of {} lattice cells",
                100.0 * total.stats.kept_ratio(),
                total.stats.cells
            );
        }
        Ok(total)
    }

    /// M-step: fold the counts into every table and renormalize
    pub fn maximization(&mut self, counts: EpochCounts) {
        self.emissions.absorb(counts.emissions);
        if let Some(transitions) = counts.transitions {
            self.transitions.absorb(transitions);
        }
        self.emissions.normalize();
        self.transitions.normalize();
    }

    fn log_pass(&self, iteration: usize, train: bool, stats: &PassStats) {
        let split = if train { "train" } else { "test" };
        info!(
            "HMM iteration {}: {} perplexity {:.4}, Viterbi perplexity {:.4}",
            iteration,
            split,
            stats.perplexity(),
            stats.viterbi_perplexity()
        );
        if self.beam(train).is_some() && stats.kept < stats.cells {
            warn!(
                "HMM iteration {}: beam dropped {:.2}% of the {} lattice cells",
                iteration,
                100.0 * (1.0 - stats.kept_ratio()),
                split
            );
        }
    }

    /// Run every iteration.  With an output directory, alignments are
    /// dumped per pass and the jump tables saved on schedule.
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
                    let name = format!("At.hmm.{}", iteration);
                    report::write_alignments(dir, &name, &counts.alignments)?;
                }
                self.log_pass(iteration, false, &counts.stats);
                Some(counts.stats)
            };
            let mut counts = self.expectation(&corpus.train, true, dump.is_some())?;
            if let Some(dir) = &dump {
                let name = format!("A.hmm.{}", iteration);
                report::write_alignments(dir, &name, &counts.alignments)?;
            }
            let stats = std::mem::take(&mut counts.stats);
            self.log_pass(iteration, true, &stats);
            self.maximization(counts);
            debug!(
                "HMM iteration {}: jump distributions off by at most {:e}, translation entropy {:.4} bits",
                iteration,
                self.transitions.jumps().max_deviation(),
                self.emissions.translation.conditional_entropy()
            );
            if let Some(dir) = &self.config.output_dir {
                let every = self.config.save_every;
                if every > 0 && iteration % every == 0 {
                    let name = format!("alt.hmm.{}", iteration);
                    report::write_file(dir, &name, |w| self.transitions.jumps().write(w))?;
                }
            }
            reports.push(IterationReport {
                iteration,
                train: stats,
                test,
            });
        }
        Ok(reports)
    }

    /// Write the final tables into `dir`.  Tables by surface form are
    /// only written when vocabularies are given.
    pub fn save(&self, dir: &Path, vocabs: Option<&Vocabularies>) -> Result<()> {
        report::write_file(dir, "at.final", |w| self.transitions.jumps().write(w))?;
        if let Some(table) = self.transitions.stay_go() {
            let vocab = vocabs.map(|v| &v.source);
            report::write_file(dir, "sg.final", |w| table.write(w, vocab))?;
        }
        let translation = &self.emissions.translation;
        report::write_file(dir, "tt.final", |w| translation.write(w))?;
        let following = &self.emissions.following;
        let with_following = self.emissions.null == NullEmission::FollowingWord;
        if with_following {
            report::write_file(dir, "ft.final", |w| following.write(w))?;
        }
        if let Some(vocabs) = vocabs {
            report::write_file(dir, "tt.nm.final", |w| {
                translation.write_names(w, &vocabs.source, &vocabs.target)
            })?;
            if with_following {
                report::write_file(dir, "ft.nm.final", |w| {
                    following.write_names(w, &vocabs.target, &vocabs.target)
                })?;
            }
        }
        info!("Saved tables to {}", dir.display());
        Ok(())
    }
}

/// Transition contexts met more than `cutoff` times along the Viterbi
/// paths of a plain first-order model, in order
fn frequent_contexts(
    config: &Config,
    pool: &ThreadPool,
    pairs: &[SentencePair],
    emissions: &Emissions,
    max_len: usize,
) -> Result<Vec<Context>> {
    let plain = TransitionHandler::Jumps(Jumps::Plain(JumpTable::uniform(
        JumpClasses::Shared,
        max_len,
    )));
    let features = config.features;
    let chunks = map_chunks(pool, pairs, HashMap::<Context, f64>::new, |seen, index, pair| {
        let bound = emissions.bind(pair);
        let scored = lattice::run(index, pair, &bound, &plain.bind(pair), None)?;
        let m = pair.target_len();
        for j in 1..=m + 1 {
            let context = features.context(pair, j, scored.alignment[j - 1]);
            *seen.entry(context).or_insert(0.0) += pair.count;
        }
        Ok(())
    })?;
    let mut seen: HashMap<Context, f64> = HashMap::new();
    for chunk in chunks {
        for (context, count) in chunk {
            *seen.entry(context).or_insert(0.0) += count;
        }
    }
    let mut frequent: Vec<Context> = seen
        .iter()
        .filter(|&(_, &count)| count > config.context_cutoff)
        .map(|(context, _)| *context)
        .collect();
    frequent.sort();
    info!(
        "Kept {} of {} transition contexts seen more than {} times",
        frequent.len(),
        seen.len(),
        config.context_cutoff
    );
    Ok(frequent)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::corpus::{self, Word};
    use crate::tables::translation::TTable;

    fn tagged_corpus() -> Corpus {
        let config = corpus::Config {
            source_tags: true,
            target_tags: true,
            use_source_tags: true,
            use_target_tags: true,
        };
        let pair = |count: f64, e: &[(u32, u32)], f: &[(u32, u32)]| {
            SentencePair::new(
                count,
                e.iter().map(|&(w, t)| Word::tagged(w, t)).collect(),
                f.iter().map(|&(w, t)| Word::tagged(w, t)).collect(),
            )
        };
        Corpus::from_pairs(
            config,
            vec![
                pair(6.0, &[(1, 1), (2, 2)], &[(11, 1), (12, 2)]),
                pair(6.0, &[(2, 2), (1, 1)], &[(12, 2), (11, 1)]),
                pair(1.0, &[(3, 1), (1, 1), (2, 2)], &[(13, 1), (11, 1), (12, 2)]),
            ],
            vec![pair(1.0, &[(1, 1), (3, 1)], &[(11, 1), (13, 1)])],
        )
    }

    fn emissions(corpus: &Corpus) -> Emissions {
        Emissions::new(
            WordEmission::Plain,
            NullEmission::Plain,
            TTable::new(corpus.target_vocab_size()),
            corpus.occurrences().clone(),
        )
    }

    #[test]
    fn test_validation() {
        let mut untagged = tagged_corpus();
        untagged.config.use_source_tags = false;
        let config = Config {
            features: ContextFeatures::from_mask(16).unwrap(),
            ..Default::default()
        };
        assert!(config.validate(&untagged).is_err());
        assert!(config.validate(&tagged_corpus()).is_ok());
        let config = Config {
            order: Order::Trigram {
                classes: JumpClasses::Exact,
                beam: Some(Beam {
                    train: 0.5,
                    test: 10.0,
                }),
            },
            ..Default::default()
        };
        assert!(config.validate(&untagged).is_err());
        let config = Config {
            word_emission: WordEmission::TagBackoff,
            ..Default::default()
        };
        assert!(config.validate(&untagged).is_err());
    }

    #[test]
    fn test_warm_start_must_match() {
        let corpus = tagged_corpus();
        let small = JumpTable::uniform(JumpClasses::Shared, 2);
        let result = Hmm::new(Config::default(), &corpus, emissions(&corpus), Some(small));
        assert!(matches!(result, Err(AlignError::Config(_))));
        let other = JumpTable::uniform(JumpClasses::Exact, 3);
        let result = Hmm::new(Config::default(), &corpus, emissions(&corpus), Some(other));
        assert!(matches!(result, Err(AlignError::Config(_))));
    }

    #[test]
    fn test_frequent_contexts() {
        let corpus = tagged_corpus();
        let config = Config {
            features: ContextFeatures::from_mask(2).unwrap(),
            context_cutoff: 13.0,
            ..Default::default()
        };
        let hmm = Hmm::new(config, &corpus, emissions(&corpus), None).unwrap();
        match hmm.transitions().jumps() {
            // tag 1 is seen 14 times, tag 2 and the end 13 times each
            Jumps::Tagged(tagged) => assert_eq!(tagged.len(), 1),
            Jumps::Plain(_) => panic!("expected tagged jumps"),
        }
    }

    #[test]
    fn test_training_improves_likelihood() {
        let corpus = tagged_corpus();
        let config = Config {
            iterations: 4,
            ..Default::default()
        };
        let mut hmm = Hmm::new(config, &corpus, emissions(&corpus), None).unwrap();
        let reports = hmm.train(&corpus).unwrap();
        assert_eq!(reports.len(), 4);
        assert!(reports[3].train.log_prob > reports[0].train.log_prob);
        assert!(reports[3].test.is_some());
    }

    #[test]
    fn test_tagged_stay_go_training() {
        let corpus = tagged_corpus();
        let config = Config {
            iterations: 3,
            stay_go: true,
            features: ContextFeatures::from_mask(16).unwrap(),
            context_cutoff: 1.0,
            ..Default::default()
        };
        let mut hmm = Hmm::new(config, &corpus, emissions(&corpus), None).unwrap();
        let reports = hmm.train(&corpus).unwrap();
        for report in &reports {
            assert!(report.train.viterbi_log_prob <= report.train.log_prob);
        }
        assert!(hmm.transitions().stay_go().is_some());
        assert!(hmm.transitions().jumps().max_deviation() < 1e-9);
    }
}
