//! Provides a consistent hash ring which maps keys to the peers owning them.
//!
//! Each member is placed on the ring several times (as **virtual nodes**) by hashing
//! `replica index + member name`. A key belongs to the member of the first virtual node whose hash
//! is greater or equal to the hash of the key. If the key hashes beyond the last virtual node, it
//! wraps around to the first one.
//!
//! Adding a member only moves the keys which now hit one of its virtual nodes, all other keys
//! stay where they are. There is deliberately no way of removing a member: a changed topology is
//! handled by building a new ring and replacing the old one as a whole (see
//! [HttpPool::set](crate::http::HttpPool::set)).
use fnv::FnvHashMap;

/// Computes the 32 bit hash of the given data.
pub type HashFn = fn(&[u8]) -> u32;

/// Specifies the default number of virtual nodes per member.
pub const DEFAULT_REPLICAS: usize = 50;

/// Maps arbitrary keys onto a set of members.
///
/// # Examples
/// ```
/// # use jwcache::ring::HashRing;
/// let mut ring = HashRing::new(50);
/// ring.add(["http://node-1:8001", "http://node-2:8001", "http://node-3:8001"]);
///
/// // A key is always mapped onto the same member...
/// let owner = ring.get("Tom").unwrap().to_owned();
/// assert_eq!(ring.get("Tom"), Some(owner.as_str()));
///
/// // An empty ring has no owner at all...
/// assert_eq!(HashRing::new(50).get("Tom"), None);
/// ```
pub struct HashRing {
    hash: HashFn,
    replicas: usize,
    keys: Vec<u32>,
    members: FnvHashMap<u32, String>,
}

impl HashRing {
    /// Creates an empty ring which places each member **replicas** times and uses CRC-32 (IEEE)
    /// as hash function.
    pub fn new(replicas: usize) -> Self {
        HashRing::with_hash(replicas, crc32fast::hash)
    }

    /// Creates an empty ring using the given hash function.
    ///
    /// This is mostly used to obtain predictable placements in tests.
    pub fn with_hash(replicas: usize, hash: HashFn) -> Self {
        HashRing {
            hash,
            replicas,
            keys: Vec::new(),
            members: FnvHashMap::default(),
        }
    }

    /// Places the given members on the ring.
    ///
    /// Note that there is no check for duplicates. Adding a member twice only re-computes its
    /// virtual nodes and leaves duplicate hashes behind.
    pub fn add<I, S>(&mut self, members: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for member in members {
            let member = member.as_ref();
            for replica in 0..self.replicas {
                let hash = (self.hash)(format!("{}{}", replica, member).as_bytes());
                self.keys.push(hash);
                let _ = self.members.insert(hash, member.to_owned());
            }
        }

        self.keys.sort_unstable();
    }

    /// Determines the member which owns the given key.
    ///
    /// Returns **None** if no members have been added yet.
    pub fn get(&self, key: &str) -> Option<&str> {
        if self.keys.is_empty() {
            return None;
        }

        let hash = (self.hash)(key.as_bytes());
        let index = self.keys.partition_point(|&virtual_node| virtual_node < hash);

        self.members
            .get(&self.keys[index % self.keys.len()])
            .map(|member| member.as_str())
    }

    /// Determines if no member has been added yet.
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Returns the number of virtual nodes per member.
    pub fn replicas(&self) -> usize {
        self.replicas
    }

    /// Lists all distinct members in alphabetical order.
    pub fn members(&self) -> Vec<&str> {
        let mut result: Vec<&str> = self.members.values().map(|member| member.as_str()).collect();
        result.sort_unstable();
        result.dedup();

        result
    }
}

#[cfg(test)]
mod tests {
    use crate::ring::HashRing;

    /// Uses the decimal value of the given data as hash, so that placements are easy to predict.
    fn numeric_hash(data: &[u8]) -> u32 {
        std::str::from_utf8(data)
            .ok()
            .and_then(|number| number.parse().ok())
            .unwrap_or(0)
    }

    #[test]
    fn keys_are_mapped_to_the_next_virtual_node() {
        let mut ring = HashRing::with_hash(3, numeric_hash);

        // This yields the virtual nodes 2, 4, 6, 12, 14, 16, 22, 24, 26...
        ring.add(["6", "4", "2"]);

        let mut expectations = vec![("2", "2"), ("11", "2"), ("23", "4"), ("27", "2")];
        for (key, member) in &expectations {
            assert_eq!(ring.get(key), Some(*member), "key: {}", key);
        }

        // Adding "8" yields 8, 18 and 28, therefore 27 now maps to "8" instead of wrapping around...
        ring.add(["8"]);
        expectations[3] = ("27", "8");
        for (key, member) in &expectations {
            assert_eq!(ring.get(key), Some(*member), "key: {}", key);
        }
    }

    #[test]
    fn lookups_are_stable() {
        let mut ring = HashRing::new(50);
        ring.add(["a", "b", "c"]);

        for i in 0..100 {
            let key = format!("key-{}", i);
            let first = ring.get(&key).map(|member| member.to_owned());
            assert_eq!(ring.get(&key).map(|member| member.to_owned()), first);
            assert!(first.is_some());
        }
    }

    #[test]
    fn adding_a_member_only_moves_some_keys() {
        let mut ring = HashRing::new(50);
        ring.add(["a", "b", "c"]);

        let keys: Vec<String> = (0..1000).map(|i| format!("key-{}", i)).collect();
        let before: Vec<String> = keys
            .iter()
            .map(|key| ring.get(key).unwrap().to_owned())
            .collect();

        ring.add(["d"]);

        let mut moved = 0;
        for (key, previous_owner) in keys.iter().zip(before.iter()) {
            let owner = ring.get(key).unwrap();
            if owner != previous_owner {
                // Keys only ever move to the new member...
                assert_eq!(owner, "d");
                moved += 1;
            }
        }

        assert!(moved > 0);
        assert!(moved < keys.len() / 2);
    }

    #[test]
    fn ring_layout_is_reported() {
        let mut ring = HashRing::with_hash(3, numeric_hash);
        assert_eq!(ring.is_empty(), true);
        assert_eq!(ring.get("1"), None);

        ring.add(["4", "2"]);
        assert_eq!(ring.is_empty(), false);
        assert_eq!(ring.replicas(), 3);
        assert_eq!(ring.members(), vec!["2", "4"]);
    }
}
