use crate::error::{AlignError, Result};
use rustfst::prelude::*;
use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io::prelude::*;
use std::io::{BufReader, Lines};
use std::iter::Enumerate;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

pub type WordId = u32;
pub type TagId = u32;

/// Word id of the empty source word every target word may align to
pub const NULL_WORD: WordId = 0;

/// A token of a sentence: surface id and an optional tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Word {
    pub id: WordId,
    pub tag: Option<TagId>,
}

impl Word {
    pub fn new(id: WordId) -> Word {
        Word { id, tag: None }
    }

    pub fn tagged(id: WordId, tag: TagId) -> Word {
        Word { id, tag: Some(tag) }
    }

    pub fn null() -> Word {
        Word::new(NULL_WORD)
    }
}

/// A parallel sentence pair.  Both sides are indexed from 1, position
/// 0 holds the NULL word on the source side and an unused placeholder
/// on the target side.
#[derive(Debug, Clone)]
pub struct SentencePair {
    pub count: f64,
    pub source: Vec<Word>,
    pub target: Vec<Word>,
}

impl SentencePair {
    pub fn new(count: f64, source: Vec<Word>, target: Vec<Word>) -> SentencePair {
        let mut e = Vec::with_capacity(source.len() + 1);
        e.push(Word::null());
        e.extend(source);
        let mut f = Vec::with_capacity(target.len() + 1);
        f.push(Word::null());
        f.extend(target);
        SentencePair {
            count,
            source: e,
            target: f,
        }
    }

    /// Untagged pair from bare word ids
    pub fn from_ids(count: f64, source: &[WordId], target: &[WordId]) -> SentencePair {
        SentencePair::new(
            count,
            source.iter().copied().map(Word::new).collect(),
            target.iter().copied().map(Word::new).collect(),
        )
    }

    /// Number of source words, NULL excluded
    pub fn source_len(&self) -> usize {
        self.source.len() - 1
    }

    pub fn target_len(&self) -> usize {
        self.target.len() - 1
    }
}

/// Configuration parameters for reading a corpus
#[derive(Debug, Clone, Default)]
pub struct Config {
    /// Source tokens are written as `id_tag`
    pub source_tags: bool,
    /// Target tokens are written as `id_tag`
    pub target_tags: bool,
    /// Keep the source tags instead of discarding them after parsing
    pub use_source_tags: bool,
    /// Keep the target tags instead of discarding them after parsing
    pub use_target_tags: bool,
}

/// Training and test sentence pairs, loaded fully in memory
#[derive(Debug)]
pub struct Corpus {
    pub config: Config,
    pub train: Vec<SentencePair>,
    pub test: Vec<SentencePair>,
    max_source_len: usize,
    target_vocab_size: usize,
    occurrences: HashMap<WordId, f64>,
}

impl Corpus {
    pub fn new(config: Config) -> Corpus {
        Corpus {
            config,
            train: Vec::new(),
            test: Vec::new(),
            max_source_len: 0,
            target_vocab_size: 0,
            occurrences: HashMap::new(),
        }
    }

    /// Build a corpus from pairs already in memory
    pub fn from_pairs(
        config: Config,
        train: Vec<SentencePair>,
        test: Vec<SentencePair>,
    ) -> Corpus {
        let mut corpus = Corpus::new(config);
        corpus.train = train;
        corpus.test = test;
        corpus.update_statistics();
        corpus
    }

    /// Read the training pairs
    pub fn load_train(&mut self, path: &Path) -> Result<()> {
        self.train = self.read_pairs(path)?;
        self.update_statistics();
        info!(
            "Read {} training pairs from {}",
            self.train.len(),
            path.display()
        );
        Ok(())
    }

    /// Read the held-out pairs
    pub fn load_test(&mut self, path: &Path) -> Result<()> {
        self.test = self.read_pairs(path)?;
        self.update_statistics();
        info!("Read {} test pairs from {}", self.test.len(), path.display());
        Ok(())
    }

    /// Longest source sentence over both splits
    pub fn max_source_len(&self) -> usize {
        self.max_source_len
    }

    /// Number of distinct target words seen in either split
    pub fn target_vocab_size(&self) -> usize {
        self.target_vocab_size
    }

    /// Weighted number of training occurrences of a source word
    pub fn occurrences(&self) -> &HashMap<WordId, f64> {
        &self.occurrences
    }

    pub fn has_source_tags(&self) -> bool {
        self.config.source_tags && self.config.use_source_tags
    }

    pub fn has_target_tags(&self) -> bool {
        self.config.target_tags && self.config.use_target_tags
    }

    fn update_statistics(&mut self) {
        let pairs = self.train.iter().chain(self.test.iter());
        let mut targets = HashSet::new();
        self.max_source_len = 0;
        for pair in pairs {
            self.max_source_len = self.max_source_len.max(pair.source_len());
            targets.extend(pair.target[1..].iter().map(|w| w.id));
        }
        self.target_vocab_size = targets.len();
        self.occurrences.clear();
        for pair in &self.train {
            for word in &pair.source[1..] {
                *self.occurrences.entry(word.id).or_insert(0.0) += pair.count;
            }
        }
    }

    fn read_pairs(&self, path: &Path) -> Result<Vec<SentencePair>> {
        let open = || {
            File::open(path)
                .map(BufReader::new)
                .map_err(|e| AlignError::io(format!("opening {}", path.display()), e))
        };
        // First pass only sizes the buffer
        let mut lines = 0;
        for line in open()?.lines() {
            line.map_err(|e| AlignError::io(format!("reading {}", path.display()), e))?;
            lines += 1;
        }
        let mut pairs = Vec::with_capacity(lines / 3);
        let mut reader = open()?.lines().enumerate();
        while let Some((n, count_line)) = reader.next() {
            let lineno = n + 1;
            let count_line = count_line
                .map_err(|e| AlignError::io(format!("reading {}", path.display()), e))?;
            if count_line.trim().is_empty() {
                continue;
            }
            let count: f64 = count_line
                .trim()
                .parse()
                .map_err(|_| AlignError::parse(path, lineno, "malformed pair count"))?;
            if !(count > 0.0) {
                return Err(AlignError::parse(path, lineno, "pair count must be positive"));
            }
            let (eline, source) = next_line(&mut reader, path, "source", lineno)?;
            let (fline, target) = next_line(&mut reader, path, "target", eline)?;
            let source = parse_sentence(
                &source,
                self.config.source_tags,
                self.config.use_source_tags,
            )
            .map_err(|msg| AlignError::parse(path, eline, msg))?;
            let target = parse_sentence(
                &target,
                self.config.target_tags,
                self.config.use_target_tags,
            )
            .map_err(|msg| AlignError::parse(path, fline, msg))?;
            if source.is_empty() || target.is_empty() {
                warn!("Skipping pair with an empty side at {}:{}", path.display(), lineno);
                continue;
            }
            pairs.push(SentencePair::new(count, source, target));
        }
        Ok(pairs)
    }
}

fn next_line(
    reader: &mut Enumerate<Lines<BufReader<File>>>,
    path: &Path,
    what: &str,
    after: usize,
) -> Result<(usize, String)> {
    match reader.next() {
        Some((n, line)) => line
            .map(|l| (n + 1, l))
            .map_err(|e| AlignError::io(format!("reading {}", path.display()), e)),
        None => Err(AlignError::parse(path, after, format!("missing {} line", what))),
    }
}

fn parse_sentence(
    line: &str,
    tagged: bool,
    keep_tags: bool,
) -> std::result::Result<Vec<Word>, String> {
    line.split_whitespace()
        .map(|token| parse_token(token, tagged, keep_tags))
        .collect()
}

/// Parse `id` or `id_tag`
pub fn parse_token(
    token: &str,
    tagged: bool,
    keep_tag: bool,
) -> std::result::Result<Word, String> {
    let (id, tag) = if tagged {
        match token.split_once('_') {
            Some((id, tag)) => (id, Some(tag)),
            None => return Err(format!("token {} has no tag", token)),
        }
    } else {
        (token, None)
    };
    let id: WordId = id
        .parse()
        .map_err(|_| format!("malformed word id in {}", token))?;
    if id == NULL_WORD {
        return Err(format!("word id {} is reserved for NULL", NULL_WORD));
    }
    let tag = match tag {
        Some(tag) => Some(
            tag.parse::<TagId>()
                .map_err(|_| format!("malformed tag in {}", token))?,
        ),
        None => None,
    };
    Ok(Word {
        id,
        tag: if keep_tag { tag } else { None },
    })
}

/// Surface forms of one side of the corpus
#[derive(Debug)]
pub struct Vocabulary {
    syms: SymbolTable,
    labels: HashMap<WordId, Label>,
}

impl Vocabulary {
    pub fn new() -> Vocabulary {
        let mut syms = SymbolTable::empty();
        let mut labels = HashMap::new();
        labels.insert(NULL_WORD, syms.add_symbol("NULL"));
        Vocabulary { syms, labels }
    }

    /// Read a vocabulary file of `id surface count` lines
    pub fn load(path: &Path) -> Result<Vocabulary> {
        let fh = File::open(path)
            .map_err(|e| AlignError::io(format!("opening {}", path.display()), e))?;
        let mut vocab = Vocabulary::new();
        for (n, line) in BufReader::new(fh).lines().enumerate() {
            let line =
                line.map_err(|e| AlignError::io(format!("reading {}", path.display()), e))?;
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.is_empty() {
                continue;
            }
            if fields.len() < 2 {
                return Err(AlignError::parse(path, n + 1, "expected `id surface [count]`"));
            }
            let id: WordId = fields[0]
                .parse()
                .map_err(|_| AlignError::parse(path, n + 1, "malformed word id"))?;
            if fields.len() > 2 && fields[2].parse::<f64>().is_err() {
                return Err(AlignError::parse(path, n + 1, "malformed word count"));
            }
            vocab.insert(id, fields[1]);
        }
        Ok(vocab)
    }

    pub fn insert(&mut self, id: WordId, surface: &str) {
        let label = self.syms.add_symbol(surface);
        self.labels.insert(id, label);
    }

    /// Surface form of a word, or its id when it is unknown
    pub fn name(&self, id: WordId) -> String {
        self.labels
            .get(&id)
            .and_then(|&label| self.syms.get_symbol(label))
            .map_or_else(|| id.to_string(), |s| s.to_owned())
    }

    /// Number of words, NULL included
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.len() <= 1
    }
}

impl Default for Vocabulary {
    fn default() -> Self {
        Vocabulary::new()
    }
}

/// Source and target vocabularies
#[derive(Debug, Default)]
pub struct Vocabularies {
    pub source: Vocabulary,
    pub target: Vocabulary,
}

impl Vocabularies {
    pub fn load(source: &Path, target: &Path) -> Result<Vocabularies> {
        Ok(Vocabularies {
            source: Vocabulary::load(source)?,
            target: Vocabulary::load(target)?,
        })
    }

    /// Default vocabulary locations, `e.vcb` and `f.vcb` next to the
    /// training file
    pub fn default_paths(train: &Path) -> (PathBuf, PathBuf) {
        let dir = train.parent().unwrap_or_else(|| Path::new(""));
        (dir.join("e.vcb"), dir.join("f.vcb"))
    }

    /// Vocabularies of a training corpus, read from the given files or
    /// from the default locations.  Missing or malformed files are errors.
    pub fn for_corpus(
        train: &Path,
        source: Option<&Path>,
        target: Option<&Path>,
    ) -> Result<Vocabularies> {
        let (default_source, default_target) = Vocabularies::default_paths(train);
        let source = source.map_or(default_source, Path::to_path_buf);
        let target = target.map_or(default_target, Path::to_path_buf);
        let vocabs = Vocabularies::load(&source, &target)?;
        if vocabs.source.is_empty() || vocabs.target.is_empty() {
            warn!("Empty vocabulary, tables by name will show word ids");
        }
        info!(
            "Read {} source and {} target words",
            vocabs.source.len() - 1,
            vocabs.target.len() - 1
        );
        Ok(vocabs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_corpus(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_parse_tokens() {
        assert_eq!(parse_token("12", false, false), Ok(Word::new(12)));
        assert_eq!(parse_token("12_3", true, true), Ok(Word::tagged(12, 3)));
        assert_eq!(parse_token("12_3", true, false), Ok(Word::new(12)));
        assert!(parse_token("12", true, true).is_err());
        assert!(parse_token("0", false, false).is_err());
        assert!(parse_token("x", false, false).is_err());
    }

    #[test]
    fn test_load_pairs() {
        let file = write_corpus("2\n1 2 3\n4 5\n1\n3\n\n1\n7\n8 9\n");
        let mut corpus = Corpus::new(Config::default());
        corpus.load_train(file.path()).unwrap();
        // the pair with an empty target is skipped
        assert_eq!(corpus.train.len(), 2);
        let pair = &corpus.train[0];
        assert_eq!(pair.count, 2.0);
        assert_eq!(pair.source_len(), 3);
        assert_eq!(pair.target_len(), 2);
        assert_eq!(pair.source[0], Word::null());
        assert_eq!(pair.target[2], Word::new(5));
        assert_eq!(corpus.max_source_len(), 3);
        assert_eq!(corpus.target_vocab_size(), 4);
        assert_eq!(corpus.occurrences()[&1], 2.0);
        assert_eq!(corpus.occurrences()[&7], 1.0);
    }

    #[test]
    fn test_truncated_file() {
        let file = write_corpus("1\n1 2\n");
        let mut corpus = Corpus::new(Config::default());
        match corpus.load_train(file.path()) {
            Err(AlignError::Parse { line, .. }) => assert_eq!(line, 2),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_max_length_covers_test_split() {
        let train = vec![SentencePair::from_ids(1.0, &[1], &[2])];
        let test = vec![SentencePair::from_ids(1.0, &[1, 2, 3, 4], &[2])];
        let corpus = Corpus::from_pairs(Config::default(), train, test);
        assert_eq!(corpus.max_source_len(), 4);
        assert!(!corpus.occurrences().contains_key(&4));
    }

    #[test]
    fn test_vocabulary() {
        let file = write_corpus("1 maison 10\n2 bleue 3\n");
        let vocab = Vocabulary::load(file.path()).unwrap();
        assert_eq!(vocab.name(1), "maison");
        assert_eq!(vocab.name(0), "NULL");
        assert_eq!(vocab.name(42), "42");
        assert_eq!(vocab.len(), 3);
        let bad = write_corpus("1\n");
        assert!(Vocabulary::load(bad.path()).is_err());
        assert!(Vocabulary::load(Path::new("/nonexistent/e.vcb")).is_err());
    }

    #[test]
    fn test_vocabularies_next_to_corpus() {
        let dir = tempfile::TempDir::new().unwrap();
        let train = dir.path().join("train.txt");
        // nothing to read yet
        assert!(matches!(
            Vocabularies::for_corpus(&train, None, None),
            Err(AlignError::Io { .. })
        ));
        std::fs::write(dir.path().join("e.vcb"), "1 maison 2\n").unwrap();
        std::fs::write(dir.path().join("f.vcb"), "garbage\n").unwrap();
        match Vocabularies::for_corpus(&train, None, None) {
            Err(AlignError::Parse { line, .. }) => assert_eq!(line, 1),
            other => panic!("unexpected {:?}", other),
        }
        std::fs::write(dir.path().join("f.vcb"), "5 house 2\n").unwrap();
        let vocabs = Vocabularies::for_corpus(&train, None, None).unwrap();
        assert_eq!(vocabs.source.name(1), "maison");
        assert_eq!(vocabs.target.name(5), "house");
        // explicit paths win over the defaults
        let other = dir.path().join("other.vcb");
        std::fs::write(&other, "5 maison\n").unwrap();
        let vocabs = Vocabularies::for_corpus(&train, None, Some(&other)).unwrap();
        assert_eq!(vocabs.target.name(5), "maison");
        assert!(Vocabularies::for_corpus(&train, Some(&dir.path().join("missing.vcb")), None).is_err());
    }
}
