pub mod comparator;

pub use comparator::{Comparator, ComparatorRegistry, DEFAULT_COMPARATOR_NAME};
