use crate::corpus::{Vocabulary, WordId};
use std::collections::{BTreeMap, HashMap};
use std::io::prelude::*;

/// Stay probability of a word before any training
pub const INITIAL_STAY: f64 = 0.08;
/// Weight of the uniform prior mixed into the NULL stay probability
pub const NULL_STAY_SMOOTH: f64 = 0.2;
const STAY_FLOOR: f64 = 1e-4;

#[derive(Debug, Clone, Copy, Default)]
struct StayGoCount {
    stay: f64,
    go: f64,
}

impl StayGoCount {
    fn add(&mut self, other: &StayGoCount) {
        self.stay += other.stay;
        self.go += other.go;
    }

    /// Stay estimate, or `None` without counts
    fn estimate(&self) -> Option<f64> {
        let total = self.stay + self.go;
        (total > 0.0).then(|| (self.stay / total).clamp(STAY_FLOOR, 1.0 - STAY_FLOOR))
    }
}

/// Stay/go counts gathered away from the table
#[derive(Debug, Clone, Default)]
pub struct StayGoCounts {
    words: HashMap<WordId, StayGoCount>,
    null: StayGoCount,
}

impl StayGoCounts {
    /// Record a move out of the state of `word`, `None` for NULL states
    pub fn add(&mut self, word: Option<WordId>, stay: bool, weight: f64) {
        let count = match word {
            Some(id) => self.words.entry(id).or_default(),
            None => &mut self.null,
        };
        if stay {
            count.stay += weight;
        } else {
            count.go += weight;
        }
    }

    pub fn merge(&mut self, other: StayGoCounts) {
        for (id, count) in other.words {
            self.words.entry(id).or_default().add(&count);
        }
        self.null.add(&other.null);
    }
}

/// Per-word probability of staying on the same source word
#[derive(Debug, Clone)]
pub struct StayGoTable {
    stay: HashMap<WordId, f64>,
    null_stay: f64,
    counts: StayGoCounts,
}

impl StayGoTable {
    pub fn new() -> StayGoTable {
        StayGoTable {
            stay: HashMap::new(),
            null_stay: INITIAL_STAY,
            counts: StayGoCounts::default(),
        }
    }

    /// Probability of staying on source word `word`
    pub fn stay(&self, word: WordId) -> f64 {
        self.stay.get(&word).copied().unwrap_or(INITIAL_STAY)
    }

    /// Probability of staying in a NULL state of a sentence with `l`
    /// source words
    pub fn null_stay(&self, l: usize) -> f64 {
        (1.0 - NULL_STAY_SMOOTH) * self.null_stay + NULL_STAY_SMOOTH / (l + 2) as f64
    }

    pub fn absorb(&mut self, counts: StayGoCounts) {
        self.counts.merge(counts);
    }

    pub fn normalize(&mut self) {
        let counts = std::mem::take(&mut self.counts);
        for (id, count) in counts.words {
            if let Some(p) = count.estimate() {
                self.stay.insert(id, p);
            }
        }
        if let Some(p) = counts.null.estimate() {
            self.null_stay = p;
        }
    }

    /// Write `name probabilityGo probabilityStay` lines
    pub fn write(&self, w: &mut impl Write, vocab: Option<&Vocabulary>) -> std::io::Result<()> {
        writeln!(w, "NULL {} {}", 1.0 - self.null_stay, self.null_stay)?;
        let sorted: BTreeMap<_, _> = self.stay.iter().collect();
        for (id, p) in sorted {
            let name = vocab.map_or_else(|| id.to_string(), |v| v.name(*id));
            writeln!(w, "{} {} {}", name, 1.0 - p, p)?;
        }
        Ok(())
    }
}

impl Default for StayGoTable {
    fn default() -> Self {
        StayGoTable::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stay_estimates() {
        let mut table = StayGoTable::new();
        assert_eq!(table.stay(3), INITIAL_STAY);
        let mut counts = StayGoCounts::default();
        counts.add(Some(3), true, 1.0);
        counts.add(Some(3), false, 3.0);
        counts.add(None, true, 1.0);
        counts.add(None, false, 1.0);
        table.absorb(counts);
        table.normalize();
        assert_eq!(table.stay(3), 0.25);
        assert_eq!(table.stay(4), INITIAL_STAY);
        assert!((table.null_stay(2) - (0.8 * 0.5 + 0.2 / 4.0)).abs() < 1e-12);
        // nothing pending, nothing changes
        table.normalize();
        assert_eq!(table.stay(3), 0.25);
    }

    #[test]
    fn test_stay_is_floored() {
        let mut table = StayGoTable::new();
        let mut counts = StayGoCounts::default();
        counts.add(Some(1), false, 5.0);
        table.absorb(counts);
        table.normalize();
        assert_eq!(table.stay(1), STAY_FLOOR);
    }

    #[test]
    fn test_write() {
        let mut table = StayGoTable::new();
        let mut counts = StayGoCounts::default();
        counts.add(Some(2), true, 1.0);
        counts.add(Some(2), false, 1.0);
        table.absorb(counts);
        table.normalize();
        let mut vocab = Vocabulary::new();
        vocab.insert(2, "chat");
        let mut out = Vec::new();
        table.write(&mut out, Some(&vocab)).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.lines().any(|l| l == "chat 0.5 0.5"));
    }
}
