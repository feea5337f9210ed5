//! Provides a memory constrained LRU cache.
//!
//! An LRU cache drops the least recently used entry once it is about to grow beyond its memory
//! budget. Each group keeps its locally loaded values in such a cache. The budget is measured in
//! bytes and accounts for the keys and values being stored (see [ByteSize]).
//!
//! Note that the cache itself performs no synchronization at all. A
//! [Group](crate::group::Group) wraps it in a mutex and only ever holds that mutex for a single
//! lookup or insert.
mod lru_cache;

pub use lru_cache::ByteSize;
pub use lru_cache::EvictionListener;
pub use lru_cache::LRUCache;
