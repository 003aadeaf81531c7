use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::game::common::IGame;
use crate::net::model::InferenceOutputs;

/// Aggregate view over all shards.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CacheInfo {
    pub size: usize,
    pub capacity: usize,
    pub hits: usize,
    pub misses: usize,
    pub evictions: usize,
}

struct ShardInner<Game: IGame> {
    /// fingerprint -> (outputs, recency stamp of the entry)
    map: HashMap<u64, (InferenceOutputs<Game>, u64)>,
    /// (fingerprint, stamp) in touch order. Stale pairs whose stamp no
    /// longer matches the map are skipped at eviction time.
    recency: VecDeque<(u64, u64)>,
    next_stamp: u64,
}

impl<Game: IGame> ShardInner<Game> {
    fn touch(&mut self, key: u64) -> u64 {
        let stamp = self.next_stamp;
        self.next_stamp += 1;
        self.recency.push_back((key, stamp));
        stamp
    }

    /// Drop stale recency pairs once they dominate the deque, so repeated
    /// hits on a hot entry cannot grow it without bound.
    fn compact(&mut self, capacity: usize) {
        if self.recency.len() < capacity.saturating_mul(4).max(64) {
            return;
        }
        self.recency
            .retain(|(key, stamp)| matches!(self.map.get(key), Some((_outputs, s)) if s == stamp));
    }
}

/// One independently locked LRU partition. Short critical sections, no
/// cross-shard coordination.
struct CacheShard<Game: IGame> {
    inner: Mutex<ShardInner<Game>>,
    capacity: usize,
    hits: AtomicUsize,
    misses: AtomicUsize,
    evictions: AtomicUsize,
}

impl<Game: IGame> CacheShard<Game> {
    fn new(capacity: usize) -> Self {
        assert!(capacity > 0);
        Self {
            inner: Mutex::new(ShardInner {
                map: HashMap::new(),
                recency: VecDeque::new(),
                next_stamp: 0,
            }),
            capacity,
            hits: AtomicUsize::new(0),
            misses: AtomicUsize::new(0),
            evictions: AtomicUsize::new(0),
        }
    }

    fn get(&self, key: u64) -> Option<InferenceOutputs<Game>> {
        let mut inner = self.inner.lock().unwrap();
        let Some(outputs) = inner.map.get(&key).map(|(outputs, _stamp)| outputs.clone()) else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        };
        let new_stamp = inner.touch(key);
        inner.map.get_mut(&key).unwrap().1 = new_stamp;
        inner.compact(self.capacity);
        self.hits.fetch_add(1, Ordering::Relaxed);
        Some(outputs)
    }

    fn set(&self, key: u64, outputs: InferenceOutputs<Game>) {
        let mut inner = self.inner.lock().unwrap();
        if inner.map.contains_key(&key) {
            let stamp = inner.touch(key);
            let entry = inner.map.get_mut(&key).unwrap();
            *entry = (outputs, stamp);
            inner.compact(self.capacity);
            return;
        }

        /* Evict the least recently used entries to make room */
        while inner.map.len() >= self.capacity {
            let (key, stamp) = inner.recency.pop_front().unwrap();
            let current = inner.map.get(&key).map(|(_o, s)| *s);
            if current == Some(stamp) {
                inner.map.remove(&key);
                self.evictions.fetch_add(1, Ordering::Relaxed);
            }
        }

        let stamp = inner.touch(key);
        inner.map.insert(key, (outputs, stamp));
        inner.compact(self.capacity);
    }

    fn clear(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.map.clear();
        inner.recency.clear();
    }

    fn info(&self) -> CacheInfo {
        let size = self.inner.lock().unwrap().map.len();
        CacheInfo {
            size,
            capacity: self.capacity,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }
}

/// Fingerprint -> outputs LRU cache, partitioned into independently locked
/// shards to keep contention off the inference hot path. The cache is
/// advisory: a miss is normal and entries are never validated against the
/// full inputs, so the fingerprint must come from a strong 64-bit hash.
pub struct InferenceCache<Game: IGame> {
    shards: Vec<CacheShard<Game>>,
    hits_metric: metrics::Counter,
    misses_metric: metrics::Counter,
}

impl<Game: IGame> InferenceCache<Game> {
    pub fn new(capacity: usize, shards: usize) -> Self {
        assert!(capacity > 0);
        let shards = shards.max(1);
        let shard_capacity = (capacity / shards).max(1);
        Self {
            shards: (0..shards).map(|_| CacheShard::new(shard_capacity)).collect(),
            hits_metric: metrics::counter!("cache.hits"),
            misses_metric: metrics::counter!("cache.misses"),
        }
    }

    pub fn num_shards(&self) -> usize {
        self.shards.len()
    }

    fn shard(&self, key: u64) -> &CacheShard<Game> {
        &self.shards[(key % self.shards.len() as u64) as usize]
    }

    pub fn get(&self, key: u64) -> Option<InferenceOutputs<Game>> {
        let outputs = self.shard(key).get(key);
        match outputs {
            Some(_) => self.hits_metric.increment(1),
            None => self.misses_metric.increment(1),
        }
        outputs
    }

    pub fn set(&self, key: u64, outputs: InferenceOutputs<Game>) {
        self.shard(key).set(key, outputs);
    }

    pub fn clear(&self) {
        for shard in &self.shards {
            shard.clear();
        }
    }

    pub fn info(&self) -> CacheInfo {
        let mut info = CacheInfo::default();
        for shard in &self.shards {
            let shard_info = shard.info();
            info.size += shard_info.size;
            info.capacity += shard_info.capacity;
            info.hits += shard_info.hits;
            info.misses += shard_info.misses;
            info.evictions += shard_info.evictions;
        }
        info
    }
}
