pub mod counts;
pub mod hmm;
pub mod lattice;
pub mod model1;
pub mod report;
pub mod trigram;

use crate::corpus::SentencePair;
use crate::error::{AlignError, Result};
use rayon::prelude::*;
use rayon::ThreadPool;

/// Sentence pairs handed to a worker at once.  Fixed, so accumulators
/// are merged in the same order whatever the number of threads.
pub const CHUNK_SIZE: usize = 32;
/// Relative slack allowed for the Viterbi score over the likelihood
pub const VITERBI_SLACK: f64 = 1e-9;
/// Relative disagreement allowed between forward and backward totals
pub const AGREEMENT_TOLERANCE: f64 = 1e-6;

/// A pool of `threads` workers for the E-step
pub fn thread_pool(threads: usize) -> Result<ThreadPool> {
    rayon::ThreadPoolBuilder::new()
        .num_threads(threads)
        .build()
        .map_err(|e| AlignError::config(format!("cannot start {} workers: {}", threads, e)))
}

/// Run `visit` over every pair with one private accumulator per chunk
/// and return the accumulators in corpus order.  `visit` gets the index
/// of the pair in `pairs`.
pub fn map_chunks<T, I, F>(
    pool: &ThreadPool,
    pairs: &[SentencePair],
    init: I,
    visit: F,
) -> Result<Vec<T>>
where
    T: Send,
    I: Fn() -> T + Sync,
    F: Fn(&mut T, usize, &SentencePair) -> Result<()> + Sync,
{
    pool.install(|| {
        pairs
            .par_chunks(CHUNK_SIZE)
            .enumerate()
            .map(|(c, chunk)| {
                let mut acc = init();
                for (k, pair) in chunk.iter().enumerate() {
                    visit(&mut acc, c * CHUNK_SIZE + k, pair)?;
                }
                Ok(acc)
            })
            .collect()
    })
}

/// The best path can never score above the sum over all paths
pub(crate) fn check_viterbi(pair: usize, log_likelihood: f64, log_viterbi: f64) -> Result<()> {
    let slack = VITERBI_SLACK * (1.0 + log_likelihood.abs());
    if log_viterbi <= log_likelihood + slack {
        Ok(())
    } else {
        Err(AlignError::inconsistent(
            pair,
            format!(
                "Viterbi log score {} above log likelihood {}",
                log_viterbi, log_likelihood
            ),
        ))
    }
}

/// Forward and backward passes must find the same total
pub(crate) fn check_agreement(pair: usize, forward: f64, backward: f64) -> Result<()> {
    if (forward - backward).abs() <= AGREEMENT_TOLERANCE * forward {
        Ok(())
    } else {
        Err(AlignError::inconsistent(
            pair,
            format!("forward total {} but backward total {}", forward, backward),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunks_come_back_in_order() {
        let pairs: Vec<SentencePair> = (1..=100)
            .map(|k| SentencePair::from_ids(k as f64, &[1], &[2]))
            .collect();
        let pool = thread_pool(4).unwrap();
        let chunks = map_chunks(&pool, &pairs, Vec::new, |seen, index, pair| {
            seen.push((index, pair.count));
            Ok(())
        })
        .unwrap();
        assert_eq!(chunks.len(), 4);
        let seen: Vec<(usize, f64)> = chunks.into_iter().flatten().collect();
        for (k, (index, count)) in seen.into_iter().enumerate() {
            assert_eq!(index, k);
            assert_eq!(count, (k + 1) as f64);
        }
    }

    #[test]
    fn test_errors_stop_the_pass() {
        let pairs = vec![SentencePair::from_ids(1.0, &[1], &[2]); 40];
        let pool = thread_pool(2).unwrap();
        let result = map_chunks(&pool, &pairs, || (), |_, index, _| {
            if index == 35 {
                Err(AlignError::Underflow {
                    pair: index,
                    position: 1,
                })
            } else {
                Ok(())
            }
        });
        assert!(matches!(result, Err(AlignError::Underflow { pair: 35, .. })));
    }

    #[test]
    fn test_checks() {
        assert!(check_viterbi(0, -10.0, -10.0).is_ok());
        assert!(check_viterbi(0, -10.0, -12.0).is_ok());
        assert!(check_viterbi(0, -10.0, -9.0).is_err());
        assert!(check_agreement(0, 0.5, 0.5 + 1e-9).is_ok());
        assert!(check_agreement(0, 0.5, 0.6).is_err());
    }
}
