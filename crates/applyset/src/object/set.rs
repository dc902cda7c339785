//! An insertion-ordered set of object identities.

use indexmap::IndexSet;

use crate::object::ObjMetadata;

/// An ordered, deduplicating collection of [`ObjMetadata`].
///
/// Iteration yields elements in insertion order. The set operations below
/// preserve the order of `self` and append unseen elements of `other`, so
/// plans derived from them stay reproducible.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ObjMetadataSet(IndexSet<ObjMetadata>);

impl ObjMetadataSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts an identity, returning `false` if it was already present.
    pub fn insert(&mut self, id: ObjMetadata) -> bool {
        self.0.insert(id)
    }

    pub fn remove(&mut self, id: &ObjMetadata) -> bool {
        self.0.shift_remove(id)
    }

    pub fn contains(&self, id: &ObjMetadata) -> bool {
        self.0.contains(id)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ObjMetadata> {
        self.0.iter()
    }

    pub fn union(&self, other: &Self) -> Self {
        self.iter().chain(other.iter()).cloned().collect()
    }

    pub fn intersection(&self, other: &Self) -> Self {
        self.iter()
            .filter(|id| other.contains(id))
            .cloned()
            .collect()
    }

    pub fn difference(&self, other: &Self) -> Self {
        self.iter()
            .filter(|id| !other.contains(id))
            .cloned()
            .collect()
    }

    /// Returns the elements sorted by [`ObjMetadata`] ordering.
    pub fn sorted(&self) -> Vec<ObjMetadata> {
        let mut ids: Vec<_> = self.0.iter().cloned().collect();
        ids.sort();
        ids
    }
}

impl FromIterator<ObjMetadata> for ObjMetadataSet {
    fn from_iter<I: IntoIterator<Item = ObjMetadata>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl IntoIterator for ObjMetadataSet {
    type Item = ObjMetadata;
    type IntoIter = indexmap::set::IntoIter<ObjMetadata>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl<'a> IntoIterator for &'a ObjMetadataSet {
    type Item = &'a ObjMetadata;
    type IntoIter = indexmap::set::Iter<'a, ObjMetadata>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

impl Extend<ObjMetadata> for ObjMetadataSet {
    fn extend<I: IntoIterator<Item = ObjMetadata>>(&mut self, iter: I) {
        self.0.extend(iter);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pod(name: &str) -> ObjMetadata {
        ObjMetadata::namespaced("", "Pod", "test", name)
    }

    #[test]
    fn insertion_order_is_preserved() {
        let set: ObjMetadataSet = [pod("c"), pod("a"), pod("b")].into_iter().collect();
        let names: Vec<_> = set.iter().map(|id| id.name.clone()).collect();
        assert_eq!(names, ["c", "a", "b"]);
        assert_eq!(
            set.sorted().iter().map(|id| &id.name).collect::<Vec<_>>(),
            ["a", "b", "c"]
        );
    }

    #[test]
    fn set_algebra() {
        let left: ObjMetadataSet = [pod("a"), pod("b")].into_iter().collect();
        let right: ObjMetadataSet = [pod("b"), pod("c")].into_iter().collect();

        assert_eq!(
            left.union(&right),
            [pod("a"), pod("b"), pod("c")].into_iter().collect()
        );
        assert_eq!(
            left.intersection(&right),
            [pod("b")].into_iter().collect()
        );
        assert_eq!(left.difference(&right), [pod("a")].into_iter().collect());
    }

    #[test]
    fn duplicates_collapse() {
        let mut set = ObjMetadataSet::new();
        assert!(set.insert(pod("a")));
        assert!(!set.insert(pod("a")));
        assert_eq!(set.len(), 1);
    }
}
