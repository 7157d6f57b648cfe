//! Collection types used throughout the engine, with a pluggable
//! hasher so the hot certificate-store / watermark lookups can use a
//! faster, non-cryptographic hash than the libstd default.

#[cfg(feature = "collections_randomstate_twox_hash")]
type RandomState = std::hash::BuildHasherDefault<twox_hash::XxHash64>;

#[cfg(feature = "collections_randomstate_std")]
type RandomState = std::collections::hash_map::RandomState;

/// A `HashMap`, parameterized with this crate's chosen hasher.
pub type HashMap<K, V> = std::collections::HashMap<K, V, RandomState>;

/// A `HashSet`, parameterized with this crate's chosen hasher.
pub type HashSet<K> = std::collections::HashSet<K, RandomState>;

/// An insertion-ordered map, used by the request log so pending
/// client requests are proposed in FIFO order.
pub type OrderedMap<K, V> = linked_hash_map::LinkedHashMap<K, V, RandomState>;

/// Returns a new, empty `HashMap`.
pub fn hash_map<K, V>() -> HashMap<K, V> {
    Default::default()
}

/// Returns a new, empty `HashMap`, with the given initial capacity.
pub fn hash_map_capacity<K, V>(capacity: usize) -> HashMap<K, V> {
    HashMap::with_capacity_and_hasher(capacity, Default::default())
}

/// Returns a new, empty `HashSet`.
pub fn hash_set<K>() -> HashSet<K> {
    Default::default()
}

/// Returns a new, empty `OrderedMap`.
pub fn ordered_map<K, V>() -> OrderedMap<K, V> {
    OrderedMap::default()
}
