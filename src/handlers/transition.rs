use crate::corpus::{SentencePair, TagId, Word};
use crate::error::{AlignError, Result};
use crate::tables::jump::{anchor, legitimate, JumpCounts, JumpTable, PrevJump};
use crate::tables::stay_go::{StayGoCounts, StayGoTable};
use std::collections::HashMap;
use std::io::prelude::*;

/// Weight of the shared table when a context has its own
pub const CONTEXT_SMOOTH: f64 = 0.1;
/// Contexts seen this often or less share the smoothing table
pub const DEFAULT_CONTEXT_CUTOFF: f64 = 10.0;

/// One slot of a transition context
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ContextTag {
    Off,
    Boundary,
    Tag(TagId),
}

impl ContextTag {
    fn of(word: Option<&Word>) -> ContextTag {
        match word.and_then(|w| w.tag) {
            Some(tag) => ContextTag::Tag(tag),
            None => ContextTag::Boundary,
        }
    }
}

/// Tags around the previous alignment and the current target position
pub type Context = [ContextTag; 6];

/// The tags a transition is conditioned on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ContextFeatures {
    /// Tag of the source word before the previous alignment
    pub source_before: bool,
    /// Tag of the source word at the previous alignment
    pub source_at: bool,
    /// Tag of the source word after the previous alignment
    pub source_after: bool,
    /// Tag of the previous target word
    pub target_before: bool,
    /// Tag of the current target word
    pub target_at: bool,
    /// Tag of the next target word
    pub target_after: bool,
}

impl ContextFeatures {
    /// Decode the bit mask used on the command line, most significant
    /// bit first in field order
    pub fn from_mask(mask: u32) -> Result<ContextFeatures> {
        if mask > 63 {
            return Err(AlignError::config(format!("context mask {} out of range", mask)));
        }
        Ok(ContextFeatures {
            source_before: mask & 32 != 0,
            source_at: mask & 16 != 0,
            source_after: mask & 8 != 0,
            target_before: mask & 4 != 0,
            target_at: mask & 2 != 0,
            target_after: mask & 1 != 0,
        })
    }

    pub fn mask(&self) -> u32 {
        self.active()
            .iter()
            .fold(0, |mask, &on| (mask << 1) | on as u32)
    }

    fn active(&self) -> [bool; 6] {
        [
            self.source_before,
            self.source_at,
            self.source_after,
            self.target_before,
            self.target_at,
            self.target_after,
        ]
    }

    pub fn is_empty(&self) -> bool {
        self.mask() == 0
    }

    pub fn uses_source_tags(&self) -> bool {
        self.source_before || self.source_at || self.source_after
    }

    pub fn uses_target_tags(&self) -> bool {
        self.target_before || self.target_at || self.target_after
    }

    /// Context of the move into target position `j` (`m+1` for the end
    /// of sentence) from state `i_prev`
    pub fn context(&self, pair: &SentencePair, j: usize, i_prev: usize) -> Context {
        let l = pair.source_len();
        let m = pair.target_len();
        let i = anchor(i_prev, l);
        let source = |k: usize, edge: bool| {
            if edge {
                ContextTag::Boundary
            } else {
                ContextTag::of(pair.source.get(k))
            }
        };
        let target = |k: usize, edge: bool| {
            if edge {
                ContextTag::Boundary
            } else {
                ContextTag::of(pair.target.get(k))
            }
        };
        let values = [
            source(i.wrapping_sub(1), i <= 1),
            source(i, i == 0),
            source(i + 1, i == l),
            target(j.wrapping_sub(1), j == 1),
            target(j, j == m + 1),
            target(j + 1, j >= m),
        ];
        let mut context = [ContextTag::Off; 6];
        for (slot, (on, value)) in context.iter_mut().zip(self.active().into_iter().zip(values)) {
            if on {
                *slot = value;
            }
        }
        context
    }
}

fn describe(context: &Context) -> String {
    const BITS: [u32; 6] = [32, 16, 8, 4, 2, 1];
    context
        .iter()
        .zip(BITS)
        .filter_map(|(tag, bit)| match tag {
            ContextTag::Off => None,
            ContextTag::Boundary => Some(format!("{}:</s>", bit)),
            ContextTag::Tag(t) => Some(format!("{}:{}", bit, t)),
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// One jump table per frequent tag context plus a shared smoothing table
#[derive(Debug, Clone)]
pub struct TaggedJumps {
    features: ContextFeatures,
    contexts: Vec<Context>,
    index: HashMap<Context, usize>,
    tables: Vec<JumpTable>,
    smoothing: JumpTable,
}

impl TaggedJumps {
    /// Every context starts as a copy of `base`
    pub fn new(features: ContextFeatures, base: &JumpTable, mut contexts: Vec<Context>) -> TaggedJumps {
        contexts.sort();
        contexts.dedup();
        let index = contexts.iter().enumerate().map(|(k, c)| (*c, k)).collect();
        let tables = vec![base.clone(); contexts.len()];
        TaggedJumps {
            features,
            contexts,
            index,
            tables,
            smoothing: base.clone(),
        }
    }

    /// Number of contexts with their own table
    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    pub fn lookup(&self, context: &Context) -> Option<usize> {
        self.index.get(context).copied()
    }
}

/// Transition counts for `Jumps`
#[derive(Debug, Clone)]
pub struct JumpsCounts {
    base: JumpCounts,
    contexts: HashMap<usize, JumpCounts>,
}

impl JumpsCounts {
    pub fn merge(&mut self, other: JumpsCounts) {
        self.base.merge(&other.base);
        for (k, counts) in other.contexts {
            match self.contexts.get_mut(&k) {
                Some(mine) => mine.merge(&counts),
                None => {
                    self.contexts.insert(k, counts);
                }
            }
        }
    }

    /// Mass credited to the plain or smoothing table
    pub fn total(&self) -> f64 {
        self.base.total()
    }
}

/// Jump-based transition probabilities
#[derive(Debug, Clone)]
pub enum Jumps {
    Plain(JumpTable),
    Tagged(TaggedJumps),
}

impl Jumps {
    /// The plain table, or the smoothing table of a tagged one
    pub fn base(&self) -> &JumpTable {
        match self {
            Jumps::Plain(table) => table,
            Jumps::Tagged(tagged) => &tagged.smoothing,
        }
    }

    fn prob_in(
        &self,
        context: Option<usize>,
        i: usize,
        i_prev: usize,
        history: Option<PrevJump>,
        l: usize,
    ) -> f64 {
        match self {
            Jumps::Plain(table) => table.prob(i, i_prev, history, l),
            Jumps::Tagged(tagged) => {
                let smooth = tagged.smoothing.prob(i, i_prev, history, l);
                match context {
                    Some(k) => {
                        (1.0 - CONTEXT_SMOOTH) * tagged.tables[k].prob(i, i_prev, history, l)
                            + CONTEXT_SMOOTH * smooth
                    }
                    None => smooth,
                }
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn count_in(
        &self,
        counts: &mut JumpsCounts,
        context: Option<usize>,
        i: usize,
        i_prev: usize,
        history: Option<PrevJump>,
        l: usize,
        weight: f64,
    ) {
        self.base()
            .count_into(&mut counts.base, i, i_prev, history, l, weight);
        if let (Jumps::Tagged(tagged), Some(k)) = (self, context) {
            let table = &tagged.tables[k];
            let own = counts.contexts.entry(k).or_insert_with(|| table.counts());
            table.count_into(own, i, i_prev, history, l, weight);
        }
    }

    pub fn counts(&self) -> JumpsCounts {
        JumpsCounts {
            base: self.base().counts(),
            contexts: HashMap::new(),
        }
    }

    pub fn absorb(&mut self, counts: &JumpsCounts) {
        match self {
            Jumps::Plain(table) => table.absorb(&counts.base),
            Jumps::Tagged(tagged) => {
                tagged.smoothing.absorb(&counts.base);
                for (&k, c) in &counts.contexts {
                    tagged.tables[k].absorb(c);
                }
            }
        }
    }

    pub fn normalize(&mut self) {
        match self {
            Jumps::Plain(table) => table.normalize(),
            Jumps::Tagged(tagged) => {
                tagged.smoothing.normalize();
                tagged.tables.iter_mut().for_each(|t| t.normalize());
            }
        }
    }

    /// Largest deviation from one over every table
    pub fn max_deviation(&self) -> f64 {
        match self {
            Jumps::Plain(table) => table.max_deviation(),
            Jumps::Tagged(tagged) => tagged
                .tables
                .iter()
                .map(|t| t.max_deviation())
                .fold(tagged.smoothing.max_deviation(), f64::max),
        }
    }

    pub fn write(&self, w: &mut impl Write) -> std::io::Result<()> {
        match self {
            Jumps::Plain(table) => table.write(w),
            Jumps::Tagged(tagged) => {
                writeln!(w, "[smoothing]")?;
                tagged.smoothing.write(w)?;
                for (context, table) in tagged.contexts.iter().zip(&tagged.tables) {
                    writeln!(w, "[context {}]", describe(context))?;
                    table.write(w)?;
                }
                Ok(())
            }
        }
    }
}

/// Counts for every table of a `TransitionHandler`
#[derive(Debug, Clone)]
pub struct TransitionCounts {
    pub jumps: JumpsCounts,
    pub stay_go: StayGoCounts,
}

impl TransitionCounts {
    pub fn merge(&mut self, other: TransitionCounts) {
        self.jumps.merge(other.jumps);
        self.stay_go.merge(other.stay_go);
    }
}

/// How alignment transitions are scored
#[derive(Debug, Clone)]
pub enum TransitionHandler {
    Jumps(Jumps),
    /// Staying on a word is scored separately, every other move by `go`
    StayGo { table: StayGoTable, go: Jumps },
}

impl TransitionHandler {
    pub fn jumps(&self) -> &Jumps {
        match self {
            TransitionHandler::Jumps(jumps) => jumps,
            TransitionHandler::StayGo { go, .. } => go,
        }
    }

    pub fn stay_go(&self) -> Option<&StayGoTable> {
        match self {
            TransitionHandler::Jumps(_) => None,
            TransitionHandler::StayGo { table, .. } => Some(table),
        }
    }

    /// Select the tables used for one sentence pair
    pub fn bind<'a>(&'a self, pair: &'a SentencePair) -> BoundTransitions<'a> {
        let l = pair.source_len();
        let m = pair.target_len();
        let tables = match self.jumps() {
            Jumps::Plain(_) => Vec::new(),
            Jumps::Tagged(tagged) => {
                let mut tables = vec![None; (m + 2) * (l + 1)];
                for j in 1..=m + 1 {
                    for i in 0..=l {
                        let context = tagged.features.context(pair, j, i);
                        tables[j * (l + 1) + i] = tagged.lookup(&context);
                    }
                }
                tables
            }
        };
        BoundTransitions {
            handler: self,
            pair,
            l,
            m,
            tables,
        }
    }

    pub fn counts(&self) -> TransitionCounts {
        TransitionCounts {
            jumps: self.jumps().counts(),
            stay_go: StayGoCounts::default(),
        }
    }

    pub fn absorb(&mut self, counts: TransitionCounts) {
        match self {
            TransitionHandler::Jumps(jumps) => jumps.absorb(&counts.jumps),
            TransitionHandler::StayGo { table, go } => {
                go.absorb(&counts.jumps);
                table.absorb(counts.stay_go);
            }
        }
    }

    pub fn normalize(&mut self) {
        match self {
            TransitionHandler::Jumps(jumps) => jumps.normalize(),
            TransitionHandler::StayGo { table, go } => {
                go.normalize();
                table.normalize();
            }
        }
    }
}

/// Transition probabilities of one sentence pair
#[derive(Debug)]
pub struct BoundTransitions<'a> {
    handler: &'a TransitionHandler,
    pair: &'a SentencePair,
    l: usize,
    m: usize,
    /// Context table for `(j, anchor of i_prev)`, tagged jumps only
    tables: Vec<Option<usize>>,
}

impl BoundTransitions<'_> {
    fn context(&self, j: usize, i_prev: usize) -> Option<usize> {
        if self.tables.is_empty() {
            None
        } else {
            self.tables[j * (self.l + 1) + anchor(i_prev, self.l)]
        }
    }

    fn jump(&self, jumps: &Jumps, j: usize, i: usize, i_prev: usize, history: Option<PrevJump>) -> f64 {
        jumps.prob_in(self.context(j, i_prev), i, i_prev, history, self.l)
    }

    fn stay(&self, table: &StayGoTable, i_prev: usize) -> f64 {
        if i_prev > self.l {
            table.null_stay(self.l)
        } else {
            table.stay(self.pair.source[i_prev].id)
        }
    }

    /// Probability of moving from `i_prev` to `i` when entering target
    /// position `j`.  Position `m+1` with state `2l+1` ends the sentence.
    pub fn prob(&self, j: usize, i: usize, i_prev: usize, history: Option<PrevJump>) -> f64 {
        match self.handler {
            TransitionHandler::Jumps(jumps) => self.jump(jumps, j, i, i_prev, history),
            TransitionHandler::StayGo { table, go } => {
                if i_prev == 0 {
                    return self.jump(go, j, i, i_prev, history);
                }
                let eos = 2 * self.l + 1;
                if i > eos || (i < eos && !legitimate(i, i_prev, self.l)) {
                    return 0.0;
                }
                let stay = self.stay(table, i_prev);
                if i == i_prev {
                    stay
                } else {
                    let excluded = self.jump(go, j, i_prev, i_prev, history);
                    (1.0 - stay) * self.jump(go, j, i, i_prev, history) / (1.0 - excluded)
                }
            }
        }
    }

    /// Probability of ending the sentence from `i_prev`
    pub fn eos(&self, i_prev: usize, history: Option<PrevJump>) -> f64 {
        self.prob(self.m + 1, 2 * self.l + 1, i_prev, history)
    }

    /// Credit the move from `i_prev` to `i` at target position `j`
    pub fn add_count(
        &self,
        counts: &mut TransitionCounts,
        j: usize,
        i: usize,
        i_prev: usize,
        history: Option<PrevJump>,
        weight: f64,
    ) {
        let context = self.context(j, i_prev);
        match self.handler {
            TransitionHandler::Jumps(jumps) => {
                jumps.count_in(&mut counts.jumps, context, i, i_prev, history, self.l, weight)
            }
            TransitionHandler::StayGo { go, .. } => {
                if i_prev == 0 {
                    go.count_in(&mut counts.jumps, context, i, i_prev, history, self.l, weight);
                    return;
                }
                let word = (i_prev <= self.l).then(|| self.pair.source[i_prev].id);
                if i == i_prev {
                    counts.stay_go.add(word, true, weight);
                } else {
                    counts.stay_go.add(word, false, weight);
                    go.count_in(&mut counts.jumps, context, i, i_prev, history, self.l, weight);
                }
            }
        }
    }

    /// Credit ending the sentence from `i_prev`
    pub fn add_eos_count(
        &self,
        counts: &mut TransitionCounts,
        i_prev: usize,
        history: Option<PrevJump>,
        weight: f64,
    ) {
        self.add_count(counts, self.m + 1, 2 * self.l + 1, i_prev, history, weight);
    }
}
