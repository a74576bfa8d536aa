use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::cmp::Ordering;
use std::sync::Arc;

pub type CompareFn = dyn Fn(&[u8], &[u8]) -> Ordering + Send + Sync;
pub type Comparator = Arc<CompareFn>;

pub const DEFAULT_COMPARATOR_NAME: &str = "default";

/// Registry of named user comparators.
///
/// Sorted collections persist the name of their comparator; on restart the
/// engine refuses to open a collection whose comparator is no longer
/// registered.
pub struct ComparatorRegistry {
    comparators: DashMap<String, Comparator>,
}

impl ComparatorRegistry {
    pub fn new() -> Self {
        let registry = Self {
            comparators: DashMap::new(),
        };
        registry.register(
            DEFAULT_COMPARATOR_NAME,
            Arc::new(|a: &[u8], b: &[u8]| a.cmp(b)),
        );
        registry
    }

    /// Returns false if the name is already taken.
    pub fn register(&self, name: impl Into<String>, comparator: Comparator) -> bool {
        let name = name.into();
        match self.comparators.entry(name) {
            Entry::Occupied(_) => false,
            Entry::Vacant(v) => {
                v.insert(comparator);
                true
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<Comparator> {
        self.comparators.get(name).map(|c| c.value().clone())
    }
}

impl Default for ComparatorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_comparator_is_bytewise() {
        let registry = ComparatorRegistry::new();
        let cmp = registry.get(DEFAULT_COMPARATOR_NAME).unwrap();
        assert_eq!((*cmp)(b"a", b"b"), Ordering::Less);
        assert_eq!((*cmp)(b"b", b"b"), Ordering::Equal);
    }

    #[test]
    fn register_rejects_duplicates() {
        let registry = ComparatorRegistry::new();
        assert!(registry.register("reverse", Arc::new(|a: &[u8], b: &[u8]| b.cmp(a))));
        assert!(!registry.register("reverse", Arc::new(|a: &[u8], b: &[u8]| b.cmp(a))));
        assert!(registry.get("missing").is_none());
    }
}
