use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A fine-grained label (e.g. "Foliage") identified by its bit position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Tag(pub u16);

/// A set of tags stored as a bitset.
///
/// Trailing zero words are always trimmed, so two sets with the same members
/// compare (and hash) equal regardless of how they were built.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TagSet {
    words: Vec<u64>,
}

impl TagSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    pub fn set(&mut self, tag: Tag) {
        let (word, bit) = Self::split(tag);
        if self.words.len() <= word {
            self.words.resize(word + 1, 0);
        }
        self.words[word] |= bit;
    }

    pub fn remove(&mut self, tag: Tag) {
        let (word, bit) = Self::split(tag);
        if let Some(w) = self.words.get_mut(word) {
            *w &= !bit;
        }
        while self.words.last() == Some(&0) {
            self.words.pop();
        }
    }

    pub fn is_set(&self, tag: Tag) -> bool {
        let (word, bit) = Self::split(tag);
        self.words.get(word).is_some_and(|w| w & bit != 0)
    }

    /// True if at least one tag is present in both sets.
    pub fn is_any_set(&self, other: &TagSet) -> bool {
        self.words
            .iter()
            .zip(&other.words)
            .any(|(a, b)| a & b != 0)
    }

    pub fn len(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    pub fn clear(&mut self) {
        self.words.clear();
    }

    /// Iterate set tags in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = Tag> + '_ {
        self.words.iter().enumerate().flat_map(|(i, &word)| {
            let mut bits = word;
            std::iter::from_fn(move || {
                if bits == 0 {
                    return None;
                }
                let bit = bits.trailing_zeros();
                bits &= bits - 1;
                Some(Tag((i as u32 * 64 + bit) as u16))
            })
        })
    }

    fn split(tag: Tag) -> (usize, u64) {
        let index = tag.0 as usize;
        (index / 64, 1u64 << (index % 64))
    }
}

impl FromIterator<Tag> for TagSet {
    fn from_iter<I: IntoIterator<Item = Tag>>(iter: I) -> Self {
        let mut set = TagSet::new();
        for tag in iter {
            set.set(tag);
        }
        set
    }
}

impl std::fmt::Display for TagSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{{ ")?;
        for (i, tag) in self.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", tag.0)?;
        }
        write!(f, " }}")
    }
}

/// Maps tag names to bit positions. Only used for naming tags in tools and logs.
#[derive(Debug, Clone, Default)]
pub struct TagRegistry {
    names: Vec<String>,
    by_name: HashMap<String, Tag>,
}

impl TagRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the tag for `name`, registering it on first use.
    pub fn register(&mut self, name: &str) -> Tag {
        if let Some(tag) = self.by_name.get(name) {
            return *tag;
        }
        let tag = Tag(self.names.len() as u16);
        self.names.push(name.to_owned());
        self.by_name.insert(name.to_owned(), tag);
        tag
    }

    pub fn get(&self, name: &str) -> Option<Tag> {
        self.by_name.get(name).copied()
    }

    pub fn name(&self, tag: Tag) -> Option<&str> {
        self.names.get(tag.0 as usize).map(String::as_str)
    }

    /// Render a tag set using registered names, falling back to the bit index.
    pub fn describe(&self, tags: &TagSet) -> String {
        let names: Vec<String> = tags
            .iter()
            .map(|t| match self.name(t) {
                Some(name) => name.to_owned(),
                None => format!("#{}", t.0),
            })
            .collect();
        format!("{{ {} }}", names.join(", "))
    }
}
