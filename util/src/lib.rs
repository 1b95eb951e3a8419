mod id_vec;
pub use id_vec::IdVec;

mod timer;
pub use timer::Timer;

#[derive(thiserror::Error, Debug)]
#[error("Filesystem path is not valid UTF-8")]
pub struct PathEncodingError;

pub type Hasher = std::hash::BuildHasherDefault<rustc_hash::FxHasher>;
pub type HashMap<K, V> = std::collections::HashMap<K, V, Hasher>;
pub type HashSet<T> = std::collections::HashSet<T, Hasher>;

/// Create an empty `HashMap` with room for `cap` entries.
pub fn map_with_capacity<K, V>(cap: usize) -> HashMap<K, V> {
    HashMap::with_capacity_and_hasher(cap, Hasher::default())
}

/// Create an empty `HashSet` with room for `cap` entries.
pub fn set_with_capacity<T>(cap: usize) -> HashSet<T> {
    HashSet::with_capacity_and_hasher(cap, Hasher::default())
}
