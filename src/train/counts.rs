use crate::handlers::emission::EmissionCounts;
use crate::handlers::transition::TransitionCounts;
use crate::train::report::{Alignment, PassStats};

/// Everything one worker gathers during a pass.  Workers never touch
/// the model; their counts are merged in corpus order and handed to
/// the M-step.
#[derive(Debug, Clone, Default)]
pub struct EpochCounts {
    pub emissions: EmissionCounts,
    /// Absent for models without transitions
    pub transitions: Option<TransitionCounts>,
    pub stats: PassStats,
    /// Best alignments, in corpus order, when they are kept for dumping
    pub alignments: Vec<Alignment>,
}

impl EpochCounts {
    pub fn new(transitions: Option<TransitionCounts>) -> EpochCounts {
        EpochCounts {
            transitions,
            ..Default::default()
        }
    }

    /// Fold in the counts of the chunk that follows this one
    pub fn merge(&mut self, other: EpochCounts) {
        self.emissions.merge(other.emissions);
        match (self.transitions.as_mut(), other.transitions) {
            (Some(mine), Some(theirs)) => mine.merge(theirs),
            (None, theirs) => self.transitions = theirs,
            (Some(_), None) => (),
        }
        self.stats.merge(&other.stats);
        self.alignments.extend(other.alignments);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tables::translation::SourceKey;

    #[test]
    fn test_merge_keeps_order() {
        let mut first = EpochCounts::new(None);
        first.emissions.translation.add(SourceKey::Word(1), 2, 0.5);
        first.alignments.push(Alignment {
            source_len: 1,
            links: vec![0, 1],
            log_score: -1.0,
        });
        let mut second = EpochCounts::new(None);
        second.emissions.translation.add(SourceKey::Word(1), 2, 0.25);
        second.alignments.push(Alignment {
            source_len: 2,
            links: vec![0, 2],
            log_score: -2.0,
        });
        first.merge(second);
        assert_eq!(first.emissions.translation.get(SourceKey::Word(1), 2), 0.75);
        assert_eq!(first.alignments[1].source_len, 2);
        assert!(first.transitions.is_none());
    }
}
