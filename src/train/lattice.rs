use crate::corpus::SentencePair;
use crate::error::{AlignError, Result};
use crate::handlers::emission::BoundEmissions;
use crate::handlers::transition::BoundTransitions;
use crate::tables::jump::successors;
use crate::train::counts::EpochCounts;
use crate::train::report::Scored;
use crate::train::{check_agreement, check_viterbi};

/// Score one sentence pair on the first-order lattice, and credit its
/// posterior counts (weighted by the pair count) when `counts` is given.
/// `index` only labels errors.
///
/// Columns `0..=m` hold the states `0..=2l`, column 0 only the initial
/// NULL state.  Forward columns are rescaled by their mass and Viterbi
/// columns by their best cell, and the backward pass reuses the forward
/// scales.
pub fn run(
    index: usize,
    pair: &SentencePair,
    emissions: &BoundEmissions,
    transitions: &BoundTransitions,
    counts: Option<&mut EpochCounts>,
) -> Result<Scored> {
    let l = pair.source_len();
    let m = pair.target_len();
    let n = 2 * l + 1;
    let mut alpha = vec![0.0; (m + 1) * n];
    let mut delta = vec![0.0; (m + 1) * n];
    let mut back = vec![0; (m + 1) * n];
    let mut scales = vec![1.0; m + 1];
    let mut log_scale = 0.0;
    let mut log_viterbi_scale = 0.0;
    let mut cells = 1;
    alpha[0] = 1.0;
    delta[0] = 1.0;

    for j in 1..=m {
        for i_prev in 0..n {
            let a = alpha[(j - 1) * n + i_prev];
            if a == 0.0 {
                continue;
            }
            let d = delta[(j - 1) * n + i_prev];
            for i in successors(i_prev, l) {
                let w = transitions.prob(j, i, i_prev, None) * emissions.prob(j, i);
                let cell = j * n + i;
                alpha[cell] += a * w;
                // strict, so ties go to the lowest previous state
                if d * w > delta[cell] {
                    delta[cell] = d * w;
                    back[cell] = i_prev;
                }
            }
        }
        let column = j * n..(j + 1) * n;
        let mass: f64 = alpha[column.clone()].iter().sum();
        let best = delta[column.clone()].iter().copied().fold(0.0, f64::max);
        if !(mass > 0.0 && best > 0.0 && mass.is_finite()) {
            return Err(AlignError::Underflow {
                pair: index,
                position: j,
            });
        }
        alpha[column.clone()].iter_mut().for_each(|a| *a /= mass);
        delta[column.clone()].iter_mut().for_each(|d| *d /= best);
        scales[j] = mass;
        log_scale += mass.ln();
        log_viterbi_scale += best.ln();
        cells += alpha[column].iter().filter(|&&a| a > 0.0).count();
    }

    let last = m * n;
    let eos: Vec<f64> = (0..n).map(|i| transitions.eos(i, None)).collect();
    let mut total = 0.0;
    let mut best = 0.0;
    let mut best_state = 0;
    for i in 0..n {
        total += alpha[last + i] * eos[i];
        let score = delta[last + i] * eos[i];
        if score > best {
            best = score;
            best_state = i;
        }
    }
    if !(total > 0.0 && best > 0.0) {
        return Err(AlignError::Underflow {
            pair: index,
            position: m + 1,
        });
    }
    let log_likelihood = log_scale + total.ln();
    let log_viterbi = log_viterbi_scale + best.ln();
    check_viterbi(index, log_likelihood, log_viterbi)?;

    let mut alignment = vec![0; m + 1];
    alignment[m] = best_state;
    for j in (1..m).rev() {
        alignment[j] = back[(j + 1) * n + alignment[j + 1]];
    }

    if let Some(counts) = counts {
        let weight = pair.count;
        // beta[i] is the scaled backward score of column j
        let mut beta = vec![0.0; n];
        for i in 0..n {
            if alpha[last + i] > 0.0 {
                beta[i] = eos[i];
                if let Some(tc) = counts.transitions.as_mut() {
                    let posterior = alpha[last + i] * eos[i] / total;
                    transitions.add_eos_count(tc, i, None, weight * posterior);
                }
            }
        }
        for j in (1..=m).rev() {
            for i in 0..n {
                let gamma = alpha[j * n + i] * beta[i] / total;
                if gamma > 0.0 {
                    emissions.add_count(&mut counts.emissions, j, i, weight * gamma);
                }
            }
            let mut previous = vec![0.0; n];
            for i_prev in 0..n {
                let a = alpha[(j - 1) * n + i_prev];
                if a == 0.0 {
                    continue;
                }
                for i in successors(i_prev, l) {
                    if beta[i] == 0.0 {
                        continue;
                    }
                    let w = transitions.prob(j, i, i_prev, None) * emissions.prob(j, i);
                    let flow = w * beta[i] / scales[j];
                    previous[i_prev] += flow;
                    if let Some(tc) = counts.transitions.as_mut() {
                        let xi = a * flow / total;
                        if xi > 0.0 {
                            transitions.add_count(tc, j, i, i_prev, None, weight * xi);
                        }
                    }
                }
            }
            beta = previous;
        }
        check_agreement(index, total, beta[0])?;
    }

    Ok(Scored {
        log_likelihood,
        log_viterbi,
        alignment,
        cells,
        kept: cells,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::corpus::WordId;
    use crate::handlers::emission::{Emissions, NullEmission, WordEmission};
    use crate::handlers::transition::{Jumps, TransitionHandler};
    use crate::tables::jump::{legitimate, JumpClasses, JumpTable};
    use crate::tables::stay_go::StayGoTable;
    use crate::tables::translation::{SourceKey, TTable};
    use std::collections::HashMap;

    fn emissions(pairs: &[SentencePair]) -> Emissions {
        let mut emissions = Emissions::new(
            WordEmission::Plain,
            NullEmission::Plain,
            TTable::new(8),
            HashMap::new(),
        );
        emissions.initialize(pairs);
        emissions
    }

    fn plain(max_len: usize) -> TransitionHandler {
        TransitionHandler::Jumps(Jumps::Plain(JumpTable::uniform(JumpClasses::Shared, max_len)))
    }

    /// Sum over every state sequence, the slow way
    fn brute_force(
        pair: &SentencePair,
        emissions: &BoundEmissions,
        transitions: &BoundTransitions,
    ) -> (f64, f64) {
        let l = pair.source_len();
        let m = pair.target_len();
        let n = 2 * l + 1;
        let mut total = 0.0;
        let mut best: f64 = 0.0;
        let mut path = vec![0; m + 1];
        loop {
            let mut p = 1.0;
            for j in 1..=m {
                if !legitimate(path[j], path[j - 1], l) {
                    p = 0.0;
                    break;
                }
                p *= transitions.prob(j, path[j], path[j - 1], None) * emissions.prob(j, path[j]);
            }
            p *= transitions.eos(path[m], None);
            total += p;
            best = best.max(p);
            let mut k = m;
            while k > 0 && path[k] == n - 1 {
                path[k] = 0;
                k -= 1;
            }
            if k == 0 {
                break;
            }
            path[k] += 1;
        }
        (total, best)
    }

    #[test]
    fn test_matches_brute_force() {
        let pairs = vec![SentencePair::from_ids(1.0, &[1, 2], &[3, 4, 5])];
        let emissions = emissions(&pairs);
        let handler = plain(2);
        let pair = &pairs[0];
        let (em, tr) = (emissions.bind(pair), handler.bind(pair));
        let scored = run(0, pair, &em, &tr, None).unwrap();
        let (total, best) = brute_force(pair, &em, &tr);
        assert!((scored.log_likelihood - total.ln()).abs() < 1e-9);
        assert!((scored.log_viterbi - best.ln()).abs() < 1e-9);
        assert!(scored.log_viterbi <= scored.log_likelihood);
        assert_eq!(scored.alignment.len(), 4);
        assert_eq!(scored.alignment[0], 0);
    }

    #[test]
    fn test_stay_go_matches_brute_force() {
        let pairs = vec![SentencePair::from_ids(1.0, &[1, 2, 3], &[4, 5])];
        let emissions = emissions(&pairs);
        let handler = TransitionHandler::StayGo {
            table: StayGoTable::new(),
            go: Jumps::Plain(JumpTable::uniform(JumpClasses::Shared, 3)),
        };
        let pair = &pairs[0];
        let (em, tr) = (emissions.bind(pair), handler.bind(pair));
        let scored = run(0, pair, &em, &tr, None).unwrap();
        let (total, _) = brute_force(pair, &em, &tr);
        assert!((scored.log_likelihood - total.ln()).abs() < 1e-9);
    }

    #[test]
    fn test_posterior_counts_sum_to_pair_count() {
        let pairs = vec![SentencePair::from_ids(5.0, &[1, 2], &[3, 4])];
        let emissions = emissions(&pairs);
        let handler = plain(2);
        let pair = &pairs[0];
        let mut counts = EpochCounts::new(Some(handler.counts()));
        let (em, tr) = (emissions.bind(pair), handler.bind(pair));
        run(0, pair, &em, &tr, Some(&mut counts)).unwrap();
        // every target word is emitted once, from some state
        assert!((counts.emissions.translation.total() - 10.0).abs() < 1e-9);
        // every target word and the end of sentence is entered once
        let transitions = counts.transitions.unwrap();
        assert!((transitions.jumps.total() - 15.0).abs() < 1e-9);
    }

    #[test]
    fn test_single_word_pair() {
        let pairs = vec![SentencePair::from_ids(5.0, &[1], &[2])];
        let emissions = emissions(&pairs);
        let handler = plain(1);
        let pair = &pairs[0];
        let mut counts = EpochCounts::new(Some(handler.counts()));
        let (em, tr) = (emissions.bind(pair), handler.bind(pair));
        let scored = run(0, pair, &em, &tr, Some(&mut counts)).unwrap();
        assert!((counts.emissions.translation.total() - 5.0).abs() < 1e-9);
        let word: f64 = counts.emissions.translation.get(SourceKey::Word(1), 2);
        let null: f64 = counts.emissions.translation.get(SourceKey::Word(0), 2);
        assert!((word + null - 5.0).abs() < 1e-9);
        assert!(scored.alignment[1] <= 2);
    }

    #[test]
    fn test_viterbi_follows_emissions() {
        let pair = SentencePair::from_ids(1.0, &[1, 2, 3], &[11, 12, 13]);
        let mut translation = TTable::new(3);
        for (e, f) in [(1, 13), (2, 11), (3, 12)] {
            translation.add_count(SourceKey::Word(e as WordId), f, 1.0);
        }
        translation.normalize();
        let emissions = Emissions::new(
            WordEmission::Plain,
            NullEmission::Plain,
            translation,
            HashMap::new(),
        );
        let handler = plain(3);
        let (em, tr) = (emissions.bind(&pair), handler.bind(&pair));
        let scored = run(0, &pair, &em, &tr, None).unwrap();
        assert_eq!(scored.alignment, vec![0, 2, 3, 1]);
    }
}
