use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// A set of capability tags (skills or tools).
///
/// Tags are trimmed and lower-cased on insert so that `"Rust"` and `"rust "`
/// match. Ordering is deterministic, which keeps serialized records stable.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CapabilitySet(BTreeSet<String>);

impl CapabilitySet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, tag: impl AsRef<str>) -> bool {
        let tag = normalize(tag.as_ref());
        if tag.is_empty() {
            return false;
        }
        self.0.insert(tag)
    }

    pub fn with(mut self, tag: impl AsRef<str>) -> Self {
        self.insert(tag);
        self
    }

    pub fn contains(&self, tag: &str) -> bool {
        self.0.contains(&normalize(tag))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    pub fn intersects(&self, other: &CapabilitySet) -> bool {
        // Iterate the smaller side.
        let (small, large) = if self.len() <= other.len() {
            (self, other)
        } else {
            (other, self)
        };
        small.0.iter().any(|t| large.0.contains(t))
    }

    pub fn is_subset_of(&self, other: &CapabilitySet) -> bool {
        self.0.is_subset(&other.0)
    }

    pub fn intersection(&self, other: &CapabilitySet) -> CapabilitySet {
        CapabilitySet(self.0.intersection(&other.0).cloned().collect())
    }

    pub fn union(&self, other: &CapabilitySet) -> CapabilitySet {
        CapabilitySet(self.0.union(&other.0).cloned().collect())
    }

    /// Requirement check used by agent selection: an empty requirement matches
    /// every agent, otherwise at least one tag must be shared.
    pub fn satisfies(&self, required: &CapabilitySet) -> bool {
        required.is_empty() || self.intersects(required)
    }
}

fn normalize(tag: &str) -> String {
    tag.trim().to_lowercase()
}

impl<S: AsRef<str>> FromIterator<S> for CapabilitySet {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        let mut set = CapabilitySet::new();
        for tag in iter {
            set.insert(tag);
        }
        set
    }
}

impl fmt::Display for CapabilitySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tags: Vec<&str> = self.iter().collect();
        write!(f, "[{}]", tags.join(", "))
    }
}
