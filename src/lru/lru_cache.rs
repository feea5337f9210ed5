use linked_hash_map::LinkedHashMap;

/// Reports the memory occupied by a cached value.
pub trait ByteSize {
    /// Returns the amount of memory occupied by the value in bytes.
    ///
    /// For byte buffers and strings this is simply their length. Other types should return a
    /// reasonable approximation which covers the "largest" part of an instance.
    fn allocated_size(&self) -> usize;
}

impl ByteSize for String {
    fn allocated_size(&self) -> usize {
        self.len()
    }
}

impl ByteSize for Vec<u8> {
    fn allocated_size(&self) -> usize {
        self.len()
    }
}

/// Represents a callback which is notified about each entry being evicted.
///
/// The callback is invoked synchronously, before the entry is dropped.
pub type EvictionListener<V> = Box<dyn FnMut(&str, &V) + Send>;

/// Keeps key/value pairs within a fixed memory budget.
///
/// Entries are kept in recency order. Once the occupied memory exceeds **max_memory**, the least
/// recently used entries are dropped until everything fits again. An entry occupies the length of
/// its key plus the [allocated size](ByteSize::allocated_size) of its value.
///
/// A **max_memory** of 0 disables the limit completely, so that the cache grows without bounds.
///
/// # Examples
/// ```
/// # use jwcache::lru::LRUCache;
/// # use jwcache::view::ByteView;
/// // Room for 14 bytes, which are two entries like "Tom" => "630"...
/// let mut scores = LRUCache::new(14);
///
/// scores.put("Tom".to_owned(), ByteView::from("630"));
/// scores.put("Sam".to_owned(), ByteView::from("567"));
/// assert_eq!(scores.get("Tom").unwrap().to_string(), "630");
///
/// // "Sam" is now the least recently used entry and makes room for "Jack"...
/// scores.put("Jack".to_owned(), ByteView::from("589"));
/// assert_eq!(scores.contains("Sam"), false);
/// assert_eq!(scores.keys(), vec!["Tom".to_owned(), "Jack".to_owned()]);
///```
pub struct LRUCache<V: ByteSize> {
    allocated_memory: usize,
    max_memory: usize,
    reads: usize,
    hits: usize,
    writes: usize,
    evictions: usize,
    map: LinkedHashMap<String, Entry<V>>,
    on_evicted: Option<EvictionListener<V>>,
}

struct Entry<V: ByteSize> {
    mem_size: usize,
    value: V,
}

impl<V: ByteSize> LRUCache<V> {
    /// Creates a new cache which keeps as many entries as fit into **max_memory** bytes.
    ///
    /// Passing 0 creates an unbounded cache.
    pub fn new(max_memory: usize) -> Self {
        LRUCache {
            allocated_memory: 0,
            max_memory,
            reads: 0,
            hits: 0,
            writes: 0,
            evictions: 0,
            map: LinkedHashMap::new(),
            on_evicted: None,
        }
    }

    /// Creates a new cache which invokes the given listener for each evicted entry.
    ///
    /// Note that the listener is only notified about entries which are dropped to enforce the
    /// memory constraint. Neither [remove](LRUCache::remove) nor [flush](LRUCache::flush) will
    /// invoke it.
    ///
    /// # Examples
    /// ```
    /// # use jwcache::lru::LRUCache;
    /// # use std::sync::{Arc, Mutex};
    /// let evicted = Arc::new(Mutex::new(Vec::new()));
    /// let listener = evicted.clone();
    /// let mut lru = LRUCache::with_eviction_listener(
    ///     10,
    ///     Box::new(move |key: &str, _value: &String| listener.lock().unwrap().push(key.to_owned())),
    /// );
    ///
    /// lru.put("k1".to_owned(), "v1".to_owned());
    /// lru.put("k2".to_owned(), "v2".to_owned());
    /// lru.put("k3".to_owned(), "v3".to_owned());
    ///
    /// assert_eq!(*evicted.lock().unwrap(), vec!["k1".to_owned()]);
    /// ```
    pub fn with_eviction_listener(max_memory: usize, listener: EvictionListener<V>) -> Self {
        let mut cache = LRUCache::new(max_memory);
        cache.on_evicted = Some(listener);
        cache
    }

    /// Stores the given value for the given key.
    ///
    /// If the key is already present, its value is replaced. In both cases the entry becomes the
    /// most recently used one. Afterwards the least recently used entries are evicted until the
    /// cache fits into its memory budget again. Note that an entry which is larger than the whole
    /// budget is evicted right away, leaving an empty cache behind.
    ///
    /// # Examples
    /// ```
    /// # use jwcache::lru::LRUCache;
    /// let mut lru = LRUCache::new(1024);
    ///
    /// lru.put("Tom".to_owned(), "630".to_owned());
    /// lru.put("Tom".to_owned(), "6300".to_owned());
    ///
    /// assert_eq!(lru.get("Tom"), Some(&"6300".to_owned()));
    /// assert_eq!(lru.allocated_memory(), 7);
    ///```
    pub fn put(&mut self, key: String, value: V) {
        let entry = Entry {
            mem_size: key.len() + value.allocated_size(),
            value,
        };

        let added_memory = entry.mem_size;

        // Note that inserting an existing key also moves it to the most recently used position...
        if let Some(stale_entry) = self.map.insert(key, entry) {
            self.allocated_memory -= stale_entry.mem_size;
        }

        self.writes += 1;
        self.allocated_memory += added_memory;

        self.enforce_constraints();
    }

    fn enforce_constraints(&mut self) {
        while self.max_memory != 0 && self.allocated_memory > self.max_memory {
            if !self.evict() {
                return;
            }
        }
    }

    /// Drops the least recently used entry and reports it to the eviction listener.
    ///
    /// Returns **false** if the cache was already empty.
    fn evict(&mut self) -> bool {
        match self.map.pop_front() {
            Some((key, entry)) => {
                self.allocated_memory -= entry.mem_size;
                self.evictions += 1;
                if let Some(listener) = self.on_evicted.as_mut() {
                    listener(&key, &entry.value);
                }

                true
            }
            None => false,
        }
    }

    /// Returns the value which has previously been stored for the given key or **None** if
    /// no value is present.
    ///
    /// A successful lookup marks the entry as most recently used.
    ///
    pub fn get(&mut self, key: &str) -> Option<&V> {
        self.reads += 1;

        match self.map.get_refresh(key) {
            Some(entry) => {
                self.hits += 1;
                Some(&entry.value)
            }
            None => None,
        }
    }

    /// Determines if a value is present for the given key.
    ///
    /// In contrast to [get](LRUCache::get) this neither changes the order of the entries nor the
    /// read metrics.
    pub fn contains(&self, key: &str) -> bool {
        self.map.contains_key(key)
    }

    /// Removes the entry for the given key and returns its value if present.
    ///
    /// Removing an entry never notifies the eviction listener.
    pub fn remove(&mut self, key: &str) -> Option<V> {
        self.writes += 1;

        self.map.remove(key).map(|entry| {
            self.allocated_memory -= entry.mem_size;
            entry.value
        })
    }

    /// Drops all entries and resets all metrics.
    pub fn flush(&mut self) {
        self.map.clear();
        self.allocated_memory = 0;
        self.reads = 0;
        self.writes = 0;
        self.hits = 0;
        self.evictions = 0;
    }

    /// Lists all keys, starting with the least recently used one.
    pub fn keys(&self) -> Vec<String> {
        self.map.keys().cloned().collect()
    }

    /// Returns the number of entries in the cache.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Determines if there are no entries at all.
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Returns the maximal amount of memory to be occupied by this cache (0 = unbounded).
    pub fn max_memory(&self) -> usize {
        self.max_memory
    }

    /// Specifies the maximal amount of memory to be occupied by this cache.
    ///
    /// If the limit shrinks, entries are evicted right away until the cache fits again.
    ///
    /// # Examples
    /// ```
    /// # use jwcache::lru::LRUCache;
    /// let mut lru = LRUCache::new(0);
    /// for key in ["key-a", "key-b", "key-c", "key-d"] {
    ///     lru.put(key.to_owned(), "12".to_owned());
    /// }
    ///
    /// // Each entry occupies 7 bytes, so only the two most recent ones remain...
    /// lru.set_max_memory(14);
    /// assert_eq!(lru.keys(), vec!["key-c".to_owned(), "key-d".to_owned()]);
    /// ```
    pub fn set_max_memory(&mut self, max_memory: usize) {
        self.max_memory = max_memory;
        self.enforce_constraints();
    }

    /// Returns the amount of memory occupied by the keys and values of this cache in bytes.
    pub fn allocated_memory(&self) -> usize {
        self.allocated_memory
    }

    /// Returns the memory utilization in percent (or 0 for an unbounded cache).
    pub fn memory_utilization(&self) -> f32 {
        match self.max_memory {
            0 => 0.,
            max => self.allocated_memory as f32 / max as f32 * 100.,
        }
    }

    /// Returns the share of reads which found a value in percent.
    pub fn hit_rate(&self) -> f32 {
        match self.reads {
            0 => 0.,
            n => self.hits as f32 / n as f32 * 100.,
        }
    }

    /// Counts the lookups since the last flush.
    pub fn reads(&self) -> usize {
        self.reads
    }

    /// Counts the lookups which found a value since the last flush.
    pub fn hits(&self) -> usize {
        self.hits
    }

    /// Counts the inserts and removals since the last flush.
    pub fn writes(&self) -> usize {
        self.writes
    }

    /// Returns the number of entries which were evicted to enforce the memory limit.
    pub fn evictions(&self) -> usize {
        self.evictions
    }
}
