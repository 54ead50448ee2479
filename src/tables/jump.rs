use crate::error::{AlignError, Result};
use std::fs::File;
use std::io::prelude::*;
use std::io::BufReader;
use std::path::Path;

/// Weight of the uniform distribution mixed into every transition
pub const JUMP_SMOOTH: f64 = 0.2;
/// Fixed probability of starting in the NULL state for first-order tables
pub const START_NULL: f64 = 0.2;
/// Largest jump magnitude told apart by the bucketed history
pub const DEFAULT_BUCKET_LIMIT: u8 = 3;

/// Is moving from `i_prev` to `i` allowed at all?  States are `0` (the
/// initial NULL), `1..=l` (source word `i`) and `l+1..=2l` (NULL after
/// source word `i-l`); `2l+1` ends the sentence and is reachable from
/// every state.
pub fn legitimate(i: usize, i_prev: usize, l: usize) -> bool {
    if i > l && i < 2 * l + 1 && i_prev == 0 {
        return false;
    }
    if i == 0 && i_prev > 0 {
        return false;
    }
    if i > l && i_prev != i && i_prev != i - l {
        return false;
    }
    true
}

/// The source position a state is attached to
pub fn anchor(i: usize, l: usize) -> usize {
    if i > l {
        i - l
    } else {
        i
    }
}

/// States reachable from `i_prev`, in increasing order, end of
/// sentence excluded
pub fn successors(i_prev: usize, l: usize) -> impl Iterator<Item = usize> {
    let (first, null) = if i_prev == 0 {
        (0, None)
    } else {
        (1, Some(anchor(i_prev, l) + l))
    };
    (first..=l).chain(null)
}

/// The jump that led into a state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PrevJump {
    /// Still in the initial NULL state
    Start,
    /// Moved into a NULL state
    ToNull,
    /// Moved by this distance between source positions
    Delta(i32),
}

impl PrevJump {
    /// The jump taken when moving from `i_prev` to `i`
    pub fn of(i: usize, i_prev: usize, l: usize) -> PrevJump {
        if i == 0 {
            PrevJump::Start
        } else if i > l {
            PrevJump::ToNull
        } else {
            PrevJump::Delta(i as i32 - anchor(i_prev, l) as i32)
        }
    }
}

/// How much of the previous jump a table conditions on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JumpClasses {
    /// Nothing: a first-order table
    Shared,
    /// The exact previous jump
    Exact,
    /// The previous jump clipped to `-limit..=limit`
    Bucketed(u8),
}

impl JumpClasses {
    /// Number of parameter columns for a corpus with sentences up to `max_len`
    pub fn columns(&self, max_len: usize) -> usize {
        match self {
            JumpClasses::Shared => 1,
            JumpClasses::Exact => 1 + 2 * max_len,
            JumpClasses::Bucketed(k) => 2 + 2 * *k as usize,
        }
    }

    /// Parameter column used after `history`
    pub fn column(&self, history: Option<PrevJump>, max_len: usize) -> usize {
        match (self, history) {
            (JumpClasses::Shared, _) | (_, None) => 0,
            (_, Some(PrevJump::Start)) | (_, Some(PrevJump::ToNull)) => 0,
            (JumpClasses::Exact, Some(PrevJump::Delta(d))) => (d + max_len as i32) as usize,
            (JumpClasses::Bucketed(k), Some(PrevJump::Delta(d))) => {
                let k = *k as i32;
                (1 + d.clamp(-k, k) + k) as usize
            }
        }
    }

    /// Number of distinct histories in a sentence of length `l`
    pub fn slots(&self, l: usize) -> usize {
        match self {
            JumpClasses::Shared => 3,
            JumpClasses::Exact => 2 + 2 * l,
            JumpClasses::Bucketed(k) => 3 + 2 * *k as usize,
        }
    }

    /// Lattice slot of a history in a sentence of length `l`.  Slot 0
    /// is the start, slot 1 a move into NULL.
    pub fn slot(&self, history: PrevJump, l: usize) -> usize {
        match (self, history) {
            (_, PrevJump::Start) => 0,
            (_, PrevJump::ToNull) => 1,
            (JumpClasses::Shared, PrevJump::Delta(_)) => 2,
            (JumpClasses::Exact, PrevJump::Delta(d)) => (2 + d + l as i32 - 1) as usize,
            (JumpClasses::Bucketed(k), PrevJump::Delta(d)) => {
                let k = *k as i32;
                (2 + d.clamp(-k, k) + k) as usize
            }
        }
    }

    /// A history stored in lattice slot `slot`.  Bucketed slots give the
    /// clipped jump, which selects the same column.
    pub fn history(&self, slot: usize, l: usize) -> PrevJump {
        match slot {
            0 => PrevJump::Start,
            1 => PrevJump::ToNull,
            s => {
                let s = s as i32 - 2;
                match self {
                    JumpClasses::Shared => PrevJump::Delta(0),
                    JumpClasses::Exact => PrevJump::Delta(s + 1 - l as i32),
                    JumpClasses::Bucketed(k) => PrevJump::Delta(s - *k as i32),
                }
            }
        }
    }

    /// Add-smoothing constant used on normalization
    fn add_constant(&self) -> f64 {
        match self {
            JumpClasses::Exact => 1e-4,
            _ => 1.0,
        }
    }

    fn encode(&self) -> String {
        match self {
            JumpClasses::Shared => "shared".to_owned(),
            JumpClasses::Exact => "exact".to_owned(),
            JumpClasses::Bucketed(k) => format!("bucketed {}", k),
        }
    }

    fn decode(fields: &[&str]) -> Option<JumpClasses> {
        match fields {
            ["shared"] => Some(JumpClasses::Shared),
            ["exact"] => Some(JumpClasses::Exact),
            ["bucketed", k] => k.parse().ok().map(JumpClasses::Bucketed),
            _ => None,
        }
    }
}

/// Where a transition is stored
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Init(usize),
    Param(usize, usize),
}

#[derive(Debug, Clone)]
struct Column {
    /// `params[0]` is the move to NULL, `params[d + L]` the jump by `d`
    params: Vec<f64>,
    counts: Vec<f64>,
    /// `prefix[x]` sums `params[..x]`
    prefix: Vec<f64>,
}

impl Column {
    fn new(max_len: usize) -> Column {
        Column {
            params: vec![0.0; 2 * max_len + 1],
            counts: vec![0.0; 2 * max_len + 1],
            prefix: vec![0.0; 2 * max_len + 2],
        }
    }

    fn rebuild_prefix(&mut self) {
        for (x, p) in self.params.iter().enumerate() {
            self.prefix[x + 1] = self.prefix[x] + p;
        }
    }

    /// Parameter mass of every outcome available from `anchor`
    fn mass(&self, anchor: usize, l: usize, max_len: usize) -> f64 {
        let lo = max_len + 1 - anchor;
        let hi = max_len + l + 1 - anchor;
        self.params[0] + self.prefix[hi + 1] - self.prefix[lo]
    }

    fn normalize(&mut self, smooth: f64) {
        if self.counts.iter().sum::<f64>() <= 0.0 {
            return;
        }
        let rest: f64 = self.counts[1..].iter().map(|c| c + smooth).sum();
        let empty = (self.counts[0] + smooth) / (rest + self.counts[0] + smooth);
        self.params[0] = empty;
        for (p, c) in self.params[1..].iter_mut().zip(&self.counts[1..]) {
            *p = (1.0 - empty) * (c + smooth) / rest;
        }
        self.counts.iter_mut().for_each(|c| *c = 0.0);
        self.rebuild_prefix();
    }
}

/// Transition counts gathered away from the table, shaped like it
#[derive(Debug, Clone)]
pub struct JumpCounts {
    init: Vec<f64>,
    columns: Vec<Vec<f64>>,
}

impl JumpCounts {
    fn add(&mut self, slot: Slot, weight: f64) {
        match slot {
            Slot::Init(k) => self.init[k] += weight,
            Slot::Param(c, x) => self.columns[c][x] += weight,
        }
    }

    pub fn merge(&mut self, other: &JumpCounts) {
        for (a, b) in self.init.iter_mut().zip(&other.init) {
            *a += b;
        }
        for (ca, cb) in self.columns.iter_mut().zip(&other.columns) {
            for (a, b) in ca.iter_mut().zip(cb) {
                *a += b;
            }
        }
    }

    pub fn total(&self) -> f64 {
        self.init.iter().sum::<f64>() + self.columns.iter().flatten().sum::<f64>()
    }
}

/// Alignment transition table a(i | i_prev, l), optionally conditioned
/// on the previous jump
#[derive(Debug, Clone)]
pub struct JumpTable {
    classes: JumpClasses,
    max_len: usize,
    /// Distribution over `0..=L+1` used when leaving the start state
    init: Vec<f64>,
    init_counts: Vec<f64>,
    init_prefix: Vec<f64>,
    columns: Vec<Column>,
}

impl JumpTable {
    /// An empty table for source sentences up to `max_len` words
    pub fn new(classes: JumpClasses, max_len: usize) -> JumpTable {
        JumpTable {
            classes,
            max_len,
            init: vec![0.0; max_len + 2],
            init_counts: vec![0.0; max_len + 2],
            init_prefix: vec![0.0; max_len + 3],
            columns: vec![Column::new(max_len); classes.columns(max_len)],
        }
    }

    /// Starting point for training
    pub fn uniform(classes: JumpClasses, max_len: usize) -> JumpTable {
        let mut table = JumpTable::new(classes, max_len);
        let start = 1.0 / (max_len + 2) as f64;
        table.init_counts.iter_mut().for_each(|c| *c = start);
        let jump = 0.6 / (2 * max_len) as f64;
        for column in table.columns.iter_mut() {
            column.counts[0] = 0.4;
            column.counts[1..].iter_mut().for_each(|c| *c = jump);
        }
        table.normalize();
        table
    }

    pub fn classes(&self) -> JumpClasses {
        self.classes
    }

    pub fn max_len(&self) -> usize {
        self.max_len
    }

    fn locate(&self, i: usize, i_prev: usize, history: Option<PrevJump>, l: usize) -> Option<Slot> {
        let eos = 2 * l + 1;
        if i > eos || i_prev >= eos || l > self.max_len {
            return None;
        }
        if i < eos && !legitimate(i, i_prev, l) {
            return None;
        }
        let target = if i == eos { l + 1 } else { i };
        if i_prev == 0 {
            return Some(Slot::Init(target));
        }
        let column = self.classes.column(history, self.max_len);
        if i > l && i < eos {
            return Some(Slot::Param(column, 0));
        }
        let jump = target as i64 - anchor(i_prev, l) as i64;
        Some(Slot::Param(column, (jump + self.max_len as i64) as usize))
    }

    /// Probability of moving from `i_prev` to `i` (`2l+1` for the end of
    /// sentence) after `history`.  Illegal moves get zero.
    pub fn prob(&self, i: usize, i_prev: usize, history: Option<PrevJump>, l: usize) -> f64 {
        let raw = match self.locate(i, i_prev, history, l) {
            None => return 0.0,
            Some(Slot::Init(k)) => {
                let mass = self.init_prefix[l + 2];
                if mass > 0.0 {
                    self.init[k] / mass
                } else {
                    0.0
                }
            }
            Some(Slot::Param(c, x)) => {
                let column = &self.columns[c];
                let mass = column.mass(anchor(i_prev, l), l, self.max_len);
                if mass > 0.0 {
                    column.params[x] / mass
                } else {
                    0.0
                }
            }
        };
        (1.0 - JUMP_SMOOTH) * raw + JUMP_SMOOTH / (l + 2) as f64
    }

    pub fn add_count(
        &mut self,
        i: usize,
        i_prev: usize,
        history: Option<PrevJump>,
        l: usize,
        weight: f64,
    ) {
        match self.locate(i, i_prev, history, l) {
            Some(Slot::Init(k)) => self.init_counts[k] += weight,
            Some(Slot::Param(c, x)) => self.columns[c].counts[x] += weight,
            None => (),
        }
    }

    /// Zeroed counts shaped like this table
    pub fn counts(&self) -> JumpCounts {
        JumpCounts {
            init: vec![0.0; self.init.len()],
            columns: vec![vec![0.0; 2 * self.max_len + 1]; self.columns.len()],
        }
    }

    /// Add a transition count to `counts` instead of the table
    pub fn count_into(
        &self,
        counts: &mut JumpCounts,
        i: usize,
        i_prev: usize,
        history: Option<PrevJump>,
        l: usize,
        weight: f64,
    ) {
        if let Some(slot) = self.locate(i, i_prev, history, l) {
            counts.add(slot, weight);
        }
    }

    pub fn absorb(&mut self, counts: &JumpCounts) {
        for (a, b) in self.init_counts.iter_mut().zip(&counts.init) {
            *a += b;
        }
        for (column, cb) in self.columns.iter_mut().zip(&counts.columns) {
            for (a, b) in column.counts.iter_mut().zip(cb) {
                *a += b;
            }
        }
    }

    /// Turn pending counts into parameters.  Parts of the table that got
    /// no counts keep their parameters.
    pub fn normalize(&mut self) {
        let smooth = self.classes.add_constant();
        if self.init_counts.iter().sum::<f64>() > 0.0 {
            match self.classes {
                JumpClasses::Shared => {
                    let rest: f64 = self.init_counts[1..].iter().map(|c| c + smooth).sum();
                    self.init[0] = START_NULL;
                    for (p, c) in self.init[1..].iter_mut().zip(&self.init_counts[1..]) {
                        *p = (1.0 - START_NULL) * (c + smooth) / rest;
                    }
                }
                _ => {
                    let total: f64 = self.init_counts.iter().map(|c| c + smooth).sum();
                    for (p, c) in self.init.iter_mut().zip(&self.init_counts) {
                        *p = (c + smooth) / total;
                    }
                }
            }
            self.init_counts.iter_mut().for_each(|c| *c = 0.0);
            for (k, p) in self.init.iter().enumerate() {
                self.init_prefix[k + 1] = self.init_prefix[k] + p;
            }
        }
        for column in self.columns.iter_mut() {
            column.normalize(smooth);
        }
    }

    /// Largest deviation from one of a distribution over next states,
    /// for sentences of the maximum length
    pub fn max_deviation(&self) -> f64 {
        let l = self.max_len;
        let histories = std::iter::once(None)
            .chain((1 - l as i32..=l as i32).map(|d| Some(PrevJump::Delta(d))));
        let mut worst: f64 = 0.0;
        for history in histories {
            for i_prev in 0..=2 * l {
                let total: f64 = (0..=2 * l + 1)
                    .map(|i| self.prob(i, i_prev, history, l))
                    .sum();
                worst = worst.max((total - 1.0).abs());
            }
        }
        worst
    }

    /// Write the parameters in a line-oriented text format
    pub fn write(&self, w: &mut impl Write) -> std::io::Result<()> {
        writeln!(w, "classes {}", self.classes.encode())?;
        writeln!(w, "max_len {}", self.max_len)?;
        write!(w, "init")?;
        for p in &self.init {
            write!(w, " {}", p)?;
        }
        writeln!(w)?;
        for (c, column) in self.columns.iter().enumerate() {
            write!(w, "column {}", c)?;
            for p in &column.params {
                write!(w, " {}", p)?;
            }
            writeln!(w)?;
        }
        Ok(())
    }

    /// Read the first table of a file written by `write`
    pub fn read(path: &Path) -> Result<JumpTable> {
        let fh = File::open(path)
            .map_err(|e| AlignError::io(format!("opening {}", path.display()), e))?;
        let mut classes = None;
        let mut table: Option<JumpTable> = None;
        for (n, line) in BufReader::new(fh).lines().enumerate() {
            let line =
                line.map_err(|e| AlignError::io(format!("reading {}", path.display()), e))?;
            let bad = |msg: &str| AlignError::parse(path, n + 1, msg);
            let fields: Vec<&str> = line.split_whitespace().collect();
            match fields.split_first() {
                None => continue,
                Some((&"classes", rest)) => {
                    if table.is_some() {
                        break;
                    }
                    classes = Some(JumpClasses::decode(rest).ok_or_else(|| bad("unknown classes"))?);
                }
                Some((&"max_len", [len])) => {
                    let classes = classes.ok_or_else(|| bad("max_len before classes"))?;
                    let len: usize = len.parse().map_err(|_| bad("malformed max_len"))?;
                    if len == 0 {
                        return Err(bad("max_len must be positive"));
                    }
                    table = Some(JumpTable::new(classes, len));
                }
                Some((&"init", values)) => {
                    let t = table.as_mut().ok_or_else(|| bad("init before max_len"))?;
                    if values.len() != t.init.len() {
                        return Err(bad("wrong number of initial probabilities"));
                    }
                    for (p, v) in t.init.iter_mut().zip(values) {
                        *p = v.parse().map_err(|_| bad("malformed probability"))?;
                    }
                    for k in 0..t.init.len() {
                        t.init_prefix[k + 1] = t.init_prefix[k] + t.init[k];
                    }
                }
                Some((&"column", values)) => {
                    let t = table.as_mut().ok_or_else(|| bad("column before max_len"))?;
                    let (c, values) = values.split_first().ok_or_else(|| bad("missing column"))?;
                    let c: usize = c.parse().map_err(|_| bad("malformed column"))?;
                    let column = t.columns.get_mut(c).ok_or_else(|| bad("column out of range"))?;
                    if values.len() != column.params.len() {
                        return Err(bad("wrong number of jump probabilities"));
                    }
                    for (p, v) in column.params.iter_mut().zip(values) {
                        *p = v.parse().map_err(|_| bad("malformed probability"))?;
                    }
                    column.rebuild_prefix();
                }
                Some(_) if line.starts_with('[') => {
                    if table.is_some() {
                        break;
                    }
                }
                Some(_) => return Err(bad("unexpected line")),
            }
        }
        table.ok_or_else(|| AlignError::parse(path, 0, "no alignment table found"))
    }
}
