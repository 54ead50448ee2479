use crate::corpus::{SentencePair, WordId, NULL_WORD};
use crate::tables::translation::{SourceKey, TCounts, TTable};
use std::collections::HashMap;

/// Occurrences at which a word's own distribution and its tag's weigh
/// the same
pub const TAG_BACKOFF_MASS: f64 = 10.0;
/// Weight of the following-word distribution for NULL emissions
pub const FOLLOWING_WORD_WEIGHT: f64 = 0.3;

/// How source words emit target words
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WordEmission {
    #[default]
    Plain,
    /// Interpolate t(f | word) with t(f | tag of word)
    TagBackoff,
}

/// How the NULL word emits target words
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NullEmission {
    #[default]
    Plain,
    /// Interpolate t(f | NULL) with a distribution conditioned on the
    /// next target word
    FollowingWord,
}

#[derive(Debug, Clone, Default)]
pub struct EmissionCounts {
    pub translation: TCounts,
    pub following: TCounts,
}

impl EmissionCounts {
    pub fn merge(&mut self, other: EmissionCounts) {
        self.translation.merge(other.translation);
        self.following.merge(other.following);
    }
}

/// Emission model: the translation tables and how they are combined
#[derive(Debug, Clone)]
pub struct Emissions {
    pub word: WordEmission,
    pub null: NullEmission,
    pub translation: TTable,
    /// t(f_j | f_{j+1}) for target words aligned to NULL
    pub following: TTable,
    occurrences: HashMap<WordId, f64>,
}

impl Emissions {
    pub fn new(
        word: WordEmission,
        null: NullEmission,
        translation: TTable,
        occurrences: HashMap<WordId, f64>,
    ) -> Emissions {
        let following = TTable::new(translation.vocab_size());
        Emissions {
            word,
            null,
            translation,
            following,
            occurrences,
        }
    }

    /// Spread every target word evenly over its source words, NULL
    /// included, and normalize
    pub fn initialize(&mut self, pairs: &[SentencePair]) {
        for pair in pairs {
            let weight = pair.count / (pair.source_len() + 1) as f64;
            for f in &pair.target[1..] {
                for e in &pair.source {
                    self.translation.add_count(SourceKey::Word(e.id), f.id, weight);
                    if let (WordEmission::TagBackoff, Some(tag)) = (self.word, e.tag) {
                        self.translation.add_count(SourceKey::Tag(tag), f.id, weight);
                    }
                }
            }
        }
        self.translation.normalize();
    }

    /// Cache the emission probabilities of one sentence pair
    pub fn bind<'a>(&'a self, pair: &'a SentencePair) -> BoundEmissions<'a> {
        let l = pair.source_len();
        let m = pair.target_len();
        let mut probs = vec![0.0; (m + 1) * (l + 1)];
        let mut shares = vec![1.0; (m + 1) * (l + 1)];
        for j in 1..=m {
            for e in 0..=l {
                let (p, share) = self.mixture(pair, j, e);
                probs[j * (l + 1) + e] = p;
                shares[j * (l + 1) + e] = share;
            }
        }
        BoundEmissions {
            emissions: self,
            pair,
            l,
            probs,
            shares,
        }
    }

    /// Probability of the target word at `j` from source position `e`,
    /// with the share of the first component
    fn mixture(&self, pair: &SentencePair, j: usize, e: usize) -> (f64, f64) {
        let f = pair.target[j].id;
        let word = pair.source[e];
        let own = self.translation.get(SourceKey::Word(word.id), f);
        let (weight, other) = match self.second_component(pair, j, e) {
            None => return (own, 1.0),
            Some((weight, SourceKey::Tag(tag))) => {
                (weight, self.translation.get(SourceKey::Tag(tag), f))
            }
            Some((weight, key)) => (weight, self.following.get(key, f)),
        };
        let p = (1.0 - weight) * own + weight * other;
        (p, (1.0 - weight) * own / p)
    }

    /// Weight and key of the distribution mixed with t(f | e), if any
    fn second_component(&self, pair: &SentencePair, j: usize, e: usize) -> Option<(f64, SourceKey)> {
        let word = pair.source[e];
        if word.id == NULL_WORD {
            if self.null == NullEmission::Plain {
                return None;
            }
            let key = match pair.target.get(j + 1) {
                Some(next) => SourceKey::Word(next.id),
                None => SourceKey::Boundary,
            };
            return Some((FOLLOWING_WORD_WEIGHT, key));
        }
        match (self.word, word.tag) {
            (WordEmission::TagBackoff, Some(tag)) => {
                let n = self.occurrences.get(&word.id).copied().unwrap_or(0.0);
                let lambda = n / (n + TAG_BACKOFF_MASS);
                Some((1.0 - lambda, SourceKey::Tag(tag)))
            }
            _ => None,
        }
    }

    pub fn absorb(&mut self, counts: EmissionCounts) {
        self.translation.absorb(counts.translation);
        self.following.absorb(counts.following);
    }

    pub fn normalize(&mut self) {
        self.translation.normalize();
        self.following.normalize();
    }
}

/// Emission probabilities of one sentence pair
#[derive(Debug)]
pub struct BoundEmissions<'a> {
    emissions: &'a Emissions,
    pair: &'a SentencePair,
    l: usize,
    probs: Vec<f64>,
    shares: Vec<f64>,
}

impl BoundEmissions<'_> {
    fn index(&self, j: usize, i: usize) -> usize {
        // NULL states emit through the NULL word
        let e = if i > self.l { 0 } else { i };
        j * (self.l + 1) + e
    }

    /// Probability of emitting target word `j` from state `i`
    pub fn prob(&self, j: usize, i: usize) -> f64 {
        self.probs[self.index(j, i)]
    }

    /// Credit an emission of target word `j` from state `i`, split
    /// between mixture components by their share of the probability
    pub fn add_count(&self, counts: &mut EmissionCounts, j: usize, i: usize, weight: f64) {
        let e = if i > self.l { 0 } else { i };
        let f = self.pair.target[j].id;
        let share = self.shares[self.index(j, i)];
        counts
            .translation
            .add(SourceKey::Word(self.pair.source[e].id), f, weight * share);
        match self.emissions.second_component(self.pair, j, e) {
            None => (),
            Some((_, key @ SourceKey::Tag(_))) => counts.translation.add(key, f, weight * (1.0 - share)),
            Some((_, key)) => counts.following.add(key, f, weight * (1.0 - share)),
        }
    }
}
