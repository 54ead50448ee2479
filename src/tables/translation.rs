use crate::corpus::{TagId, Vocabulary, WordId};
use crate::error::{AlignError, Result};
use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::prelude::*;
use std::io::BufReader;
use std::path::Path;

/// Probability returned for pairs the table knows nothing about
pub const PROB_SMOOTH: f64 = 1e-7;
/// Entries at or below this probability are dropped on normalization
pub const PROB_CUTOFF: f64 = 1e-7;

/// What a translation distribution is conditioned on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SourceKey {
    Word(WordId),
    Tag(TagId),
    /// Past the end of the sentence
    Boundary,
}

impl SourceKey {
    fn encode(&self) -> String {
        match self {
            SourceKey::Word(id) => id.to_string(),
            SourceKey::Tag(tag) => format!("#{}", tag),
            SourceKey::Boundary => "</s>".to_owned(),
        }
    }

    fn decode(s: &str) -> Option<SourceKey> {
        if s == "</s>" {
            Some(SourceKey::Boundary)
        } else if let Some(tag) = s.strip_prefix('#') {
            tag.parse().ok().map(SourceKey::Tag)
        } else {
            s.parse().ok().map(SourceKey::Word)
        }
    }

    fn name(&self, vocab: &Vocabulary) -> String {
        match self {
            SourceKey::Word(id) => vocab.name(*id),
            _ => self.encode(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Entry {
    prob: f64,
    count: f64,
}

/// Pending translation counts gathered away from the table
#[derive(Debug, Clone, Default)]
pub struct TCounts(HashMap<(SourceKey, WordId), f64>);

impl TCounts {
    pub fn add(&mut self, source: SourceKey, target: WordId, weight: f64) {
        *self.0.entry((source, target)).or_insert(0.0) += weight;
    }

    pub fn merge(&mut self, other: TCounts) {
        for (key, count) in other.0 {
            *self.0.entry(key).or_insert(0.0) += count;
        }
    }

    pub fn total(&self) -> f64 {
        self.0.values().sum()
    }

    pub fn get(&self, source: SourceKey, target: WordId) -> f64 {
        self.0.get(&(source, target)).copied().unwrap_or(0.0)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Translation table t(f | e)
#[derive(Debug, Clone)]
pub struct TTable {
    /// Size of the target vocabulary, used to reserve mass for unseen words
    vocab_size: usize,
    rows: HashMap<SourceKey, BTreeMap<WordId, Entry>>,
}

impl TTable {
    pub fn new(vocab_size: usize) -> TTable {
        TTable {
            vocab_size,
            rows: HashMap::new(),
        }
    }

    /// Probability of `target` given `source`, never below the smoothing floor
    pub fn get(&self, source: SourceKey, target: WordId) -> f64 {
        self.rows
            .get(&source)
            .and_then(|row| row.get(&target))
            .map_or(PROB_SMOOTH, |e| e.prob.max(PROB_SMOOTH))
    }

    pub fn add_count(&mut self, source: SourceKey, target: WordId, weight: f64) {
        self.rows
            .entry(source)
            .or_default()
            .entry(target)
            .or_default()
            .count += weight;
    }

    /// Move counts collected elsewhere into the pending counts
    pub fn absorb(&mut self, counts: TCounts) {
        for ((source, target), weight) in counts.0 {
            self.add_count(source, target, weight);
        }
    }

    /// Turn pending counts into probabilities and clear them.  Rows
    /// without pending counts are left alone.
    pub fn normalize(&mut self) {
        let vocab_size = self.vocab_size;
        self.rows.retain(|_, row| {
            if row.values().map(|e| e.count).sum::<f64>() <= 0.0 {
                return !row.is_empty();
            }
            loop {
                let unseen = vocab_size.saturating_sub(row.len()) as f64;
                let reserved = (unseen * PROB_SMOOTH).min(1.0);
                let total: f64 = row.values().map(|e| e.count).sum();
                let before = row.len();
                row.retain(|_, e| {
                    e.prob = e.count * (1.0 - reserved) / total;
                    e.prob > PROB_CUTOFF
                });
                if row.len() == before || row.is_empty() {
                    break;
                }
            }
            for e in row.values_mut() {
                e.count = 0.0;
            }
            !row.is_empty()
        });
    }

    /// Number of stored entries
    pub fn len(&self) -> usize {
        self.rows.values().map(|row| row.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    fn sorted_rows(&self) -> Vec<(&SourceKey, &BTreeMap<WordId, Entry>)> {
        let mut rows: Vec<_> = self.rows.iter().collect();
        rows.sort_by_key(|(k, _)| **k);
        rows
    }

    /// Average entropy in bits of the distributions over source words
    pub fn conditional_entropy(&self) -> f64 {
        let words: Vec<_> = self
            .rows
            .iter()
            .filter(|(k, _)| matches!(k, SourceKey::Word(_)))
            .collect();
        if words.is_empty() {
            return 0.0;
        }
        let total: f64 = words
            .iter()
            .map(|(_, row)| {
                row.values()
                    .filter(|e| e.prob > 0.0)
                    .map(|e| -e.prob * e.prob.log2())
                    .sum::<f64>()
            })
            .sum();
        total / words.len() as f64
    }

    /// Write `target source probability` lines
    pub fn write(&self, w: &mut impl Write) -> std::io::Result<()> {
        for (source, row) in self.sorted_rows() {
            for (target, e) in row {
                writeln!(w, "{} {} {}", target, source.encode(), e.prob)?;
            }
        }
        Ok(())
    }

    /// Same as `write` but with surface forms
    pub fn write_names(
        &self,
        w: &mut impl Write,
        source_vocab: &Vocabulary,
        target_vocab: &Vocabulary,
    ) -> std::io::Result<()> {
        for (source, row) in self.sorted_rows() {
            for (target, e) in row {
                writeln!(
                    w,
                    "{} {} {}",
                    target_vocab.name(*target),
                    source.name(source_vocab),
                    e.prob
                )?;
            }
        }
        Ok(())
    }

    /// Read a table written by `write`
    pub fn read(path: &Path, vocab_size: usize) -> Result<TTable> {
        let fh = File::open(path)
            .map_err(|e| AlignError::io(format!("opening {}", path.display()), e))?;
        let mut table = TTable::new(vocab_size);
        for (n, line) in BufReader::new(fh).lines().enumerate() {
            let line =
                line.map_err(|e| AlignError::io(format!("reading {}", path.display()), e))?;
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.is_empty() {
                continue;
            }
            let parsed = match fields[..] {
                [target, source, prob] => target
                    .parse::<WordId>()
                    .ok()
                    .zip(SourceKey::decode(source))
                    .zip(prob.parse::<f64>().ok()),
                _ => None,
            };
            let ((target, source), prob) = parsed.ok_or_else(|| {
                AlignError::parse(path, n + 1, "expected `target source probability`")
            })?;
            table
                .rows
                .entry(source)
                .or_default()
                .insert(target, Entry { prob, count: 0.0 });
        }
        Ok(table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row_sum(table: &TTable, source: SourceKey) -> f64 {
        table.rows[&source].values().map(|e| e.prob).sum()
    }

    #[test]
    fn test_unseen_is_smoothed() {
        let table = TTable::new(10);
        assert_eq!(table.get(SourceKey::Word(1), 2), PROB_SMOOTH);
    }

    #[test]
    fn test_normalize_reserves_unseen_mass() {
        let mut table = TTable::new(4);
        table.add_count(SourceKey::Word(1), 1, 3.0);
        table.add_count(SourceKey::Word(1), 2, 1.0);
        table.normalize();
        let reserved = 2.0 * PROB_SMOOTH;
        assert!((table.get(SourceKey::Word(1), 1) - 0.75 * (1.0 - reserved)).abs() < 1e-15);
        assert!((row_sum(&table, SourceKey::Word(1)) + reserved - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_normalize_is_idempotent() {
        let mut table = TTable::new(3);
        table.add_count(SourceKey::Word(1), 1, 2.0);
        table.add_count(SourceKey::Tag(4), 1, 1.0);
        table.add_count(SourceKey::Tag(4), 2, 1.0);
        table.normalize();
        let before = table.clone();
        table.normalize();
        for (source, target) in [(SourceKey::Word(1), 1), (SourceKey::Tag(4), 2)] {
            assert_eq!(table.get(source, target), before.get(source, target));
        }
    }

    #[test]
    fn test_normalize_prunes_tiny_entries() {
        let mut table = TTable::new(2);
        table.add_count(SourceKey::Word(1), 1, 1.0);
        table.add_count(SourceKey::Word(1), 2, 1e-9);
        table.normalize();
        assert_eq!(table.len(), 1);
        // the pruned word's mass is reserved again
        assert!((table.get(SourceKey::Word(1), 1) - (1.0 - PROB_SMOOTH)).abs() < 1e-15);
        assert_eq!(table.get(SourceKey::Word(1), 2), PROB_SMOOTH);
    }

    #[test]
    fn test_absorb_merged_counts() {
        let mut a = TCounts::default();
        a.add(SourceKey::Word(1), 1, 0.5);
        let mut b = TCounts::default();
        b.add(SourceKey::Word(1), 1, 0.25);
        b.add(SourceKey::Boundary, 3, 1.0);
        a.merge(b);
        assert_eq!(a.total(), 1.75);
        assert_eq!(a.get(SourceKey::Word(1), 1), 0.75);
        let mut table = TTable::new(2);
        table.absorb(a);
        table.normalize();
        assert!(table.get(SourceKey::Boundary, 3) > 0.99);
    }

    #[test]
    fn test_write_and_read() {
        let mut table = TTable::new(5);
        table.add_count(SourceKey::Word(3), 1, 1.0);
        table.add_count(SourceKey::Tag(2), 4, 1.0);
        table.add_count(SourceKey::Boundary, 4, 1.0);
        table.normalize();
        let mut file = tempfile::NamedTempFile::new().unwrap();
        table.write(&mut file).unwrap();
        file.flush().unwrap();
        let read = TTable::read(file.path(), 5).unwrap();
        assert_eq!(read.len(), 3);
        assert_eq!(read.get(SourceKey::Tag(2), 4), table.get(SourceKey::Tag(2), 4));
        assert_eq!(read.get(SourceKey::Boundary, 4), table.get(SourceKey::Boundary, 4));
    }
}
