use std::collections::BTreeSet;
use std::collections::btree_set;

use serde::{Deserialize, Serialize};

/// Sorted set of ids; serializes as a sorted JSON array.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdSet<T: Ord> {
    items: BTreeSet<T>,
}

impl<T: Ord> Default for IdSet<T> {
    fn default() -> Self {
        Self {
            items: BTreeSet::new(),
        }
    }
}

impl<T: Ord> IdSet<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, id: T) -> bool {
        self.items.insert(id)
    }

    pub fn remove(&mut self, id: &T) -> bool {
        self.items.remove(id)
    }

    pub fn contains(&self, id: &T) -> bool {
        self.items.contains(id)
    }

    /// Flips membership and returns whether `id` is now present.
    pub fn toggle(&mut self, id: T) -> bool {
        if self.items.remove(&id) {
            false
        } else {
            self.items.insert(id);
            true
        }
    }

    pub fn extend(&mut self, other: IdSet<T>) {
        self.items.extend(other.items);
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> btree_set::Iter<'_, T> {
        self.items.iter()
    }
}

impl<T: Ord> FromIterator<T> for IdSet<T> {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        Self {
            items: iter.into_iter().collect(),
        }
    }
}

impl<T: Ord> IntoIterator for IdSet<T> {
    type Item = T;
    type IntoIter = btree_set::IntoIter<T>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.into_iter()
    }
}

impl<'a, T: Ord> IntoIterator for &'a IdSet<T> {
    type Item = &'a T;
    type IntoIter = btree_set::Iter<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn toggle_flips_membership() {
        let mut set = IdSet::new();
        assert!(set.toggle("b"));
        assert!(set.contains(&"b"));
        assert!(!set.toggle("b"));
        assert!(set.is_empty());
    }

    #[test]
    fn serialization_is_sorted_regardless_of_insert_order() {
        let mut first = IdSet::new();
        first.insert("c".to_string());
        first.insert("a".to_string());
        let second: IdSet<String> = ["a".to_string(), "c".to_string()].into_iter().collect();

        let encoded = serde_json::to_string(&first).unwrap();
        assert_eq!(encoded, "[\"a\",\"c\"]");
        assert_eq!(encoded, serde_json::to_string(&second).unwrap());

        let decoded: IdSet<String> = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, first);
    }
}
