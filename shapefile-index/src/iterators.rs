//! Closeable iterators over candidate record locations.

use crate::errors::ShapefileResult;
use crate::fid::RecordLocation;
use crate::quadtree::{CachedSearch, DiskSearch};

/// An iterator holding resources (file handles, locks) that can be released
/// before it is exhausted. `close` is idempotent and a closed iterator
/// yields nothing.
pub trait CloseableIterator: Iterator {
    fn close(&mut self);

    fn is_closed(&self) -> bool;
}

/// Makes any plain iterator closeable.
pub struct CloseableIteratorWrapper<I> {
    inner: Option<I>,
}

impl<I: Iterator> CloseableIteratorWrapper<I> {
    pub fn new(inner: I) -> Self {
        Self { inner: Some(inner) }
    }
}

impl<I: Iterator> Iterator for CloseableIteratorWrapper<I> {
    type Item = I::Item;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.as_mut()?.next()
    }
}

impl<I: Iterator> CloseableIterator for CloseableIteratorWrapper<I> {
    fn close(&mut self) {
        self.inner = None;
    }

    fn is_closed(&self) -> bool {
        self.inner.is_none()
    }
}

/// Candidate locations produced by an index query.
pub enum CandidateIterator {
    /// Lazy walk of the `.qix` file
    Disk(DiskSearch),
    /// Walk of an in-memory tree
    Cached(CachedSearch),
    /// Precomputed locations, e.g. from the identity index
    Wrapped(CloseableIteratorWrapper<std::vec::IntoIter<RecordLocation>>),
}

impl CandidateIterator {
    pub fn from_locations(locations: Vec<RecordLocation>) -> Self {
        CandidateIterator::Wrapped(CloseableIteratorWrapper::new(locations.into_iter()))
    }
}

impl Iterator for CandidateIterator {
    type Item = ShapefileResult<RecordLocation>;

    fn next(&mut self) -> Option<Self::Item> {
        match self {
            CandidateIterator::Disk(search) => search.next(),
            CandidateIterator::Cached(search) => search.next().map(Ok),
            CandidateIterator::Wrapped(wrapper) => wrapper.next().map(Ok),
        }
    }
}

impl CloseableIterator for CandidateIterator {
    fn close(&mut self) {
        match self {
            CandidateIterator::Disk(search) => search.close(),
            CandidateIterator::Cached(search) => search.close(),
            CandidateIterator::Wrapped(wrapper) => wrapper.close(),
        }
    }

    fn is_closed(&self) -> bool {
        match self {
            CandidateIterator::Disk(search) => search.is_closed(),
            CandidateIterator::Cached(search) => search.is_closed(),
            CandidateIterator::Wrapped(wrapper) => wrapper.is_closed(),
        }
    }
}

impl std::fmt::Debug for CandidateIterator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self {
            CandidateIterator::Disk(_) => "Disk",
            CandidateIterator::Cached(_) => "Cached",
            CandidateIterator::Wrapped(_) => "Wrapped",
        };
        f.debug_struct("CandidateIterator")
            .field("kind", &kind)
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wrapper_close_is_idempotent() {
        let mut it = CloseableIteratorWrapper::new(vec![1, 2, 3].into_iter());
        assert_eq!(it.next(), Some(1));
        it.close();
        it.close();
        assert!(it.is_closed());
        assert_eq!(it.next(), None);
    }

    #[test]
    fn test_candidates_from_locations() {
        let locations = vec![RecordLocation::new(1, 64), RecordLocation::new(3, 200)];
        let mut it = CandidateIterator::from_locations(locations.clone());
        assert!(!it.is_closed());
        let first = it.next().unwrap().unwrap();
        assert_eq!(first, locations[0]);
        it.close();
        assert!(it.next().is_none());
    }
}
