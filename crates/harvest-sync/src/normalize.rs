use std::num::NonZeroUsize;

use harvest_core::{alnum_lower, spaced_lower};
use lru::LruCache;

pub const DEFAULT_CACHE_CAPACITY: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NormalizeKind {
    /// Every non-alphanumeric character removed.
    Manufacturer,
    /// Non-alphanumeric runs collapsed to one space.
    Unit,
}

pub fn normalize(input: &str, kind: NormalizeKind) -> String {
    match kind {
        NormalizeKind::Manufacturer => alnum_lower(input),
        NormalizeKind::Unit => spaced_lower(input),
    }
}

/// Bounded memo of normalized strings, owned by one orchestrator.
#[derive(Debug)]
pub struct NormalizationCache {
    entries: LruCache<(NormalizeKind, String), String>,
    hits: u64,
    misses: u64,
}

impl Default for NormalizationCache {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_CAPACITY)
    }
}

impl NormalizationCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: LruCache::new(NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN)),
            hits: 0,
            misses: 0,
        }
    }

    pub fn normalize(&mut self, input: &str, kind: NormalizeKind) -> String {
        let key = (kind, input.to_string());
        if let Some(hit) = self.entries.get(&key) {
            self.hits += 1;
            return hit.clone();
        }
        self.misses += 1;
        let value = normalize(input, kind);
        self.entries.put(key, value.clone());
        value
    }

    pub fn manufacturer(&mut self, input: &str) -> String {
        self.normalize(input, NormalizeKind::Manufacturer)
    }

    pub fn unit(&mut self, input: &str) -> String {
        self.normalize(input, NormalizeKind::Unit)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn hits(&self) -> u64 {
        self.hits
    }

    pub fn misses(&self) -> u64 {
        self.misses
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_normalize_differently() {
        assert_eq!(normalize("  BI-SILQUE, Inc. ", NormalizeKind::Manufacturer), "bisilqueinc");
        assert_eq!(normalize(" Box / 12 ", NormalizeKind::Unit), "box 12");
    }

    #[test]
    fn cache_is_bounded_and_counts_hits() {
        let mut cache = NormalizationCache::new(2);
        cache.manufacturer("Acme");
        cache.manufacturer("Acme");
        cache.unit("Acme");
        cache.unit("EA");
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.hits(), 1);
        assert_eq!(cache.misses(), 3);
    }
}
