use crate::corpus::SentencePair;
use crate::error::{AlignError, Result};
use crate::handlers::emission::BoundEmissions;
use crate::handlers::transition::BoundTransitions;
use crate::tables::jump::{successors, JumpClasses, PrevJump};
use crate::train::counts::EpochCounts;
use crate::train::report::Scored;
use crate::train::{check_agreement, check_viterbi};

/// Cell layout of one sentence
struct Grid {
    classes: JumpClasses,
    l: usize,
    slots: usize,
    width: usize,
}

impl Grid {
    fn new(classes: JumpClasses, l: usize) -> Grid {
        let slots = classes.slots(l);
        Grid {
            classes,
            l,
            slots,
            width: (2 * l + 1) * slots,
        }
    }

    fn state(&self, cell: usize) -> usize {
        cell / self.slots
    }

    fn history(&self, cell: usize) -> Option<PrevJump> {
        Some(self.classes.history(cell % self.slots, self.l))
    }

    /// Cell reached by moving from the state of `cell` to `i`
    fn next(&self, cell: usize, i: usize) -> usize {
        let jump = PrevJump::of(i, self.state(cell), self.l);
        i * self.slots + self.classes.slot(jump, self.l)
    }
}

/// Divide a column by its largest value, returning it
fn rescale_by_max(column: &mut [f64]) -> f64 {
    let best = column.iter().copied().fold(0.0, f64::max);
    if best > 0.0 {
        column.iter_mut().for_each(|x| *x /= best);
    }
    best
}

/// Score one sentence pair on the second-order lattice, and credit its
/// posterior counts when `counts` is given.
///
/// A cell is a state together with the class of the jump that led into
/// it.  With a beam `K`, forward cells whose Viterbi score falls below
/// `1/K` of their column's best are dropped before the column is
/// extended; the likelihood only covers the paths that survive.  The
/// backward pass drops cells the same way using its own max scores, and
/// those cells get no posterior credit.
pub fn run(
    index: usize,
    pair: &SentencePair,
    classes: JumpClasses,
    beam: Option<f64>,
    emissions: &BoundEmissions,
    transitions: &BoundTransitions,
    counts: Option<&mut EpochCounts>,
) -> Result<Scored> {
    let l = pair.source_len();
    let m = pair.target_len();
    let grid = Grid::new(classes, l);
    let width = grid.width;
    let threshold = beam.map_or(0.0, |k| 1.0 / k);
    let mut alpha = vec![0.0; (m + 1) * width];
    let mut delta = vec![0.0; (m + 1) * width];
    let mut back = vec![0; (m + 1) * width];
    let mut scales = vec![1.0; m + 1];
    let mut log_scale = 0.0;
    let mut log_viterbi_scale = 0.0;
    let mut cells = 0;
    let mut kept = 0;
    // the start state, entered by no jump at all
    alpha[0] = 1.0;
    delta[0] = 1.0;

    let mut prune = |alpha: &mut [f64], delta: &mut [f64]| {
        for (a, d) in alpha.iter_mut().zip(delta.iter_mut()) {
            if *a == 0.0 {
                continue;
            }
            cells += 1;
            if *d < threshold {
                *a = 0.0;
                *d = 0.0;
            } else {
                kept += 1;
            }
        }
    };

    for j in 1..=m {
        let previous = (j - 1) * width..j * width;
        prune(&mut alpha[previous.clone()], &mut delta[previous]);
        for x in 0..width {
            let a = alpha[(j - 1) * width + x];
            if a == 0.0 {
                continue;
            }
            let d = delta[(j - 1) * width + x];
            let (i_prev, history) = (grid.state(x), grid.history(x));
            for i in successors(i_prev, l) {
                let w = transitions.prob(j, i, i_prev, history) * emissions.prob(j, i);
                let cell = j * width + grid.next(x, i);
                alpha[cell] += a * w;
                if d * w > delta[cell] {
                    delta[cell] = d * w;
                    back[cell] = x;
                }
            }
        }
        let column = j * width..(j + 1) * width;
        let mass: f64 = alpha[column.clone()].iter().sum();
        if !(mass > 0.0 && mass.is_finite()) {
            return Err(AlignError::Underflow {
                pair: index,
                position: j,
            });
        }
        alpha[column.clone()].iter_mut().for_each(|a| *a /= mass);
        let best = rescale_by_max(&mut delta[column]);
        if best <= 0.0 {
            return Err(AlignError::Underflow {
                pair: index,
                position: j,
            });
        }
        scales[j] = mass;
        log_scale += mass.ln();
        log_viterbi_scale += best.ln();
    }
    let last = m * width;
    prune(&mut alpha[last..], &mut delta[last..]);
    let forward_pruned = kept < cells;

    let eos: Vec<f64> = (0..width)
        .map(|x| {
            if alpha[last + x] > 0.0 {
                transitions.eos(grid.state(x), grid.history(x))
            } else {
                0.0
            }
        })
        .collect();
    let mut total = 0.0;
    let mut best = 0.0;
    let mut best_cell = 0;
    for x in 0..width {
        total += alpha[last + x] * eos[x];
        let score = delta[last + x] * eos[x];
        if score > best {
            best = score;
            best_cell = x;
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

    let mut path = vec![0; m + 1];
    path[m] = best_cell;
    for j in (1..m).rev() {
        path[j] = back[(j + 1) * width + path[j + 1]];
    }
    let alignment = path.iter().map(|&x| grid.state(x)).collect();

    if let Some(counts) = counts {
        let weight = pair.count;
        let mut beta = eos.clone();
        let mut mu = eos;
        rescale_by_max(&mut mu);
        if let Some(tc) = counts.transitions.as_mut() {
            for x in 0..width {
                let posterior = alpha[last + x] * beta[x] / total;
                if posterior > 0.0 {
                    let (i, history) = (grid.state(x), grid.history(x));
                    transitions.add_eos_count(tc, i, history, weight * posterior);
                }
            }
        }
        let mut backward_pruned = false;
        for j in (1..=m).rev() {
            for x in 0..width {
                if beta[x] == 0.0 {
                    continue;
                }
                cells += 1;
                if mu[x] < threshold {
                    beta[x] = 0.0;
                    backward_pruned = true;
                    continue;
                }
                kept += 1;
                let gamma = alpha[j * width + x] * beta[x] / total;
                emissions.add_count(&mut counts.emissions, j, grid.state(x), weight * gamma);
            }
            let mut previous = vec![0.0; width];
            let mut previous_max = vec![0.0; width];
            for x in 0..width {
                let a = alpha[(j - 1) * width + x];
                if a == 0.0 {
                    continue;
                }
                let (i_prev, history) = (grid.state(x), grid.history(x));
                for i in successors(i_prev, l) {
                    let y = grid.next(x, i);
                    if beta[y] == 0.0 {
                        continue;
                    }
                    let w = transitions.prob(j, i, i_prev, history) * emissions.prob(j, i);
                    let flow = w * beta[y] / scales[j];
                    previous[x] += flow;
                    previous_max[x] = f64::max(previous_max[x], w * mu[y]);
                    if let Some(tc) = counts.transitions.as_mut() {
                        let xi = a * flow / total;
                        if xi > 0.0 {
                            transitions.add_count(tc, j, i, i_prev, history, weight * xi);
                        }
                    }
                }
            }
            rescale_by_max(&mut previous_max);
            beta = previous;
            mu = previous_max;
        }
        if !forward_pruned && !backward_pruned {
            check_agreement(index, total, beta[0])?;
        }
    }

    Ok(Scored {
        log_likelihood,
        log_viterbi,
        alignment,
        cells,
        kept,
    })
}
