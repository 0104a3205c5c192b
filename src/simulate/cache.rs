//! Set-associative cache model with strict LRU replacement and
//! cycle/energy accounting.
//!
//! The same concrete type serves as L1 and L2; only the construction
//! parameters differ. Under the two-level baseline the L1 owns its child
//! and misses recurse into it; under the eTLB regime both levels stand
//! alone and are driven through [`Cache::access_direct`] once the target
//! way is known.

use super::addr::AddressFields;
use super::{FreeList, SimError};

/// Per-access timing and energy parameters for one cache level.
#[derive(Clone, Copy, Debug)]
pub struct CacheTiming {
    pub access_time: u64,
    pub tag_time: u64,
    pub access_energy: f64,
    pub tag_energy: f64,
}

#[derive(Default, Clone, Debug)]
pub struct CacheStats {
    pub hit: u64,
    pub miss: u64,
    pub cycles: u64,
    pub energy: f64,
}

pub struct Cache {
    fields: AddressFields,
    cache_line: usize,
    associativity: usize,
    n_sets: usize,
    timing: CacheTiming,
    child: Option<Box<Cache>>,

    free: Vec<FreeList>,
    tags: Vec<Vec<u64>>,
    last_access: Vec<Vec<u64>>,
    counter: u64,

    pub stats: CacheStats,
}

impl Cache {
    pub fn new(
        size: usize,
        associativity: usize,
        cache_line: usize,
        timing: CacheTiming,
        child: Option<Box<Cache>>,
    ) -> Result<Self, SimError> {
        if !size.is_power_of_two()
            || !associativity.is_power_of_two()
            || !cache_line.is_power_of_two()
        {
            return Err(SimError::InvalidConfig(format!(
                "cache dimensions must be powers of two (size {size}, \
                 associativity {associativity}, line {cache_line})"
            )));
        }
        if size % (associativity * cache_line) != 0 {
            return Err(SimError::InvalidConfig(format!(
                "cache size {size} is not a multiple of associativity {associativity} \
                 x line {cache_line}"
            )));
        }
        let n_lines = size / cache_line;
        if associativity > n_lines {
            return Err(SimError::InvalidConfig(format!(
                "associativity {associativity} exceeds {n_lines} lines"
            )));
        }
        let n_sets = n_lines / associativity;
        Ok(Cache {
            fields: AddressFields::for_cache(cache_line, n_sets),
            cache_line,
            associativity,
            n_sets,
            timing,
            child,
            free: (0..n_sets).map(|_| (0..associativity).collect()).collect(),
            tags: vec![vec![0; associativity]; n_sets],
            last_access: vec![vec![0; associativity]; n_sets],
            counter: 0,
            stats: CacheStats::default(),
        })
    }

    pub fn n_sets(&self) -> usize {
        self.n_sets
    }

    pub fn associativity(&self) -> usize {
        self.associativity
    }

    pub fn cache_line(&self) -> usize {
        self.cache_line
    }

    /// Monotonic access counter; one tick per [`Cache::access_direct`].
    pub fn counter(&self) -> u64 {
        self.counter
    }

    pub fn child(&self) -> Option<&Cache> {
        self.child.as_deref()
    }

    pub fn set_index(&self, address: u64) -> usize {
        self.fields.set(address)
    }

    pub(super) fn tag_at(&self, set: usize, way: usize) -> u64 {
        self.tags[set][way]
    }

    pub(super) fn set_tag(&mut self, set: usize, way: usize, tag: u64) {
        self.tags[set][way] = tag;
    }

    pub(super) fn has_free(&self, set: usize) -> bool {
        !self.free[set].is_empty()
    }

    #[cfg(test)]
    pub(super) fn is_free(&self, set: usize, way: usize) -> bool {
        self.free[set].contains(&way)
    }

    /// Pops the most recently freed way of `set`.
    pub(super) fn take_free(&mut self, set: usize) -> Result<usize, SimError> {
        self.free[set].pop().ok_or_else(|| {
            SimError::InvariantBroken(format!("no free way in set {set} after eviction"))
        })
    }

    /// Address-driven access for the baseline hierarchy.
    pub fn access(&mut self, address: u64, write: bool, count: bool) -> Result<(), SimError> {
        self.access_opts(address, write, count, count, count)
    }

    pub fn access_opts(
        &mut self,
        address: u64,
        write: bool,
        count: bool,
        count_time: bool,
        count_energy: bool,
    ) -> Result<(), SimError> {
        let set = self.fields.set(address);
        let tag = self.fields.tag(address);

        if count_time {
            self.stats.cycles += self.timing.tag_time;
        }
        if count_energy {
            self.stats.energy += self.timing.tag_energy;
        }

        let resident = (0..self.associativity)
            .find(|&way| !self.free[set].contains(&way) && self.tags[set][way] == tag);

        let way = match resident {
            Some(way) => {
                if count {
                    self.stats.hit += 1;
                }
                way
            }
            None => {
                if count {
                    self.stats.miss += 1;
                }
                if let Some(child) = self.child.as_mut() {
                    child.access_opts(address, write, count, count, count)?;
                }
                if self.free[set].is_empty() {
                    self.evict(set, None, count_energy)?;
                }
                let way = self.take_free(set)?;
                self.tags[set][way] = tag;
                way
            }
        };

        self.access_direct(set, way, write, count_time, count_energy);
        Ok(())
    }

    /// Data-array access to a known way. Writes charge the access energy
    /// twice.
    pub fn access_direct(
        &mut self,
        set: usize,
        way: usize,
        write: bool,
        count_time: bool,
        count_energy: bool,
    ) {
        if count_time {
            self.stats.cycles += self.timing.access_time;
        }
        if count_energy {
            self.stats.energy += self.timing.access_energy;
            if write {
                self.stats.energy += self.timing.access_energy;
            }
        }
        if let Some(pos) = self.free[set].iter().position(|&w| w == way) {
            self.free[set].remove(pos);
        }
        self.counter += 1;
        self.last_access[set][way] = self.counter;
    }

    /// Frees a way of `set` and returns the evicted tag. With `way` given
    /// the eviction is targeted (used for invalidation); otherwise the LRU
    /// occupied way is chosen. Victims are written through to the child
    /// level when one exists.
    pub fn evict(
        &mut self,
        set: usize,
        way: Option<usize>,
        count_energy: bool,
    ) -> Result<u64, SimError> {
        let way = way.unwrap_or_else(|| self.select_victim(set));
        if !self.free[set].contains(&way) {
            self.free[set].push(way);
            let victim = ((self.tags[set][way] << self.fields.set_bits) | set as u64)
                << self.fields.offset_bits;
            if let Some(child) = self.child.as_mut() {
                child.access_opts(victim, true, false, false, count_energy)?;
            }
        }
        if count_energy {
            self.stats.energy += self.timing.tag_energy;
        }
        Ok(self.tags[set][way])
    }

    /// LRU victim among occupied ways; ties go to the lowest way index.
    pub fn select_victim(&self, set: usize) -> usize {
        let mut victim = 0;
        let mut min_access = self.last_access[set][0];
        for (way, &last) in self.last_access[set].iter().enumerate() {
            if !self.free[set].contains(&way) && last < min_access {
                victim = way;
                min_access = last;
            }
        }
        victim
    }

    #[cfg(test)]
    pub(super) fn free_ways(&self, set: usize) -> &[usize] {
        &self.free[set]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TIMING: CacheTiming = CacheTiming {
        access_time: 4,
        tag_time: 1,
        access_energy: 0.0111033,
        tag_energy: 0.000539962,
    };

    fn small_cache(size: usize, associativity: usize) -> Cache {
        Cache::new(size, associativity, 64, TIMING, None).unwrap()
    }

    #[test]
    fn rejects_non_power_of_two_dimensions() {
        assert!(matches!(
            Cache::new(0x8000, 3, 64, TIMING, None),
            Err(SimError::InvalidConfig(_))
        ));
        assert!(matches!(
            Cache::new(0x7000, 8, 64, TIMING, None),
            Err(SimError::InvalidConfig(_))
        ));
        assert!(matches!(
            Cache::new(128, 4, 64, TIMING, None),
            Err(SimError::InvalidConfig(_))
        ));
    }

    #[test]
    fn direct_mapped_round_robin_always_misses() {
        // 4 lines direct-mapped; scanning 5 distinct lines wraps one set and
        // every access in that set conflicts after the first pass.
        let mut cache = small_cache(256, 1);
        let addrs: Vec<u64> = (0..5).map(|i| i * 64).collect();
        for &a in &addrs {
            cache.access(a, false, true).unwrap();
        }
        assert_eq!(cache.stats.miss, 5);
        for _ in 0..3 {
            for &a in &addrs {
                cache.access(a, false, true).unwrap();
            }
        }
        // Lines 1..3 keep hitting; lines 0 and 4 keep evicting each other.
        assert_eq!(cache.stats.hit, 3 * 3);
        assert_eq!(cache.stats.miss, 5 + 3 * 2);
    }

    #[test]
    fn single_set_scan_of_one_extra_tag_never_hits() {
        // One more colliding tag than the set holds: LRU always evicts the
        // line about to be reused.
        let mut cache = small_cache(256, 1);
        let stride = 64 * cache.n_sets() as u64;
        for _ in 0..3 {
            for i in 0..2u64 {
                cache.access(i * stride, false, true).unwrap();
            }
        }
        assert_eq!(cache.stats.hit, 0);
        assert_eq!(cache.stats.miss, 6);
    }

    #[test]
    fn lru_retains_working_set_equal_to_associativity() {
        let mut cache = small_cache(256, 4);
        let stride = 64 * cache.n_sets() as u64;
        let addrs: Vec<u64> = (0..4).map(|i| i as u64 * stride).collect();
        for _ in 0..11 {
            for &a in &addrs {
                cache.access(a, false, true).unwrap();
            }
        }
        assert_eq!(cache.stats.miss, 4);
        assert_eq!(cache.stats.hit, 40);
    }

    #[test]
    fn nine_tags_in_one_set_thrash_under_lru() {
        // 32 KiB 8-way L1 has 64 sets; nine tags striding set*line collide
        // in set 0 and LRU always evicts the tag about to return.
        let mut l1 = Cache::new(0x8000, 8, 64, TIMING, None).unwrap();
        let stride = (l1.n_sets() * 64) as u64;
        for t in 0..9u64 {
            l1.access(t * stride, false, false).unwrap();
        }
        for _ in 0..10 {
            for t in 0..9u64 {
                l1.access(t * stride, false, true).unwrap();
            }
        }
        assert_eq!(l1.stats.miss, 90);
        assert_eq!(l1.stats.hit, 0);
    }

    #[test]
    fn lru_evicts_least_recently_used_way() {
        let mut cache = small_cache(128, 2);
        let stride = 64 * cache.n_sets() as u64;
        cache.access(0, false, true).unwrap();
        cache.access(stride, false, true).unwrap();
        cache.access(0, false, true).unwrap();
        // Set is full; the victim must be the stale `stride` line.
        let set = cache.set_index(0);
        let victim = cache.select_victim(set);
        assert_eq!(cache.tag_at(set, victim), 1);
    }

    #[test]
    fn write_charges_access_energy_twice() {
        let mut cache = small_cache(256, 4);
        cache.access(0x1000, true, true).unwrap();
        let expected = TIMING.tag_energy + 2.0 * TIMING.access_energy;
        assert!((cache.stats.energy - expected).abs() < 1e-12);
        assert_eq!(cache.stats.cycles, TIMING.tag_time + TIMING.access_time);
    }

    #[test]
    fn miss_recurses_into_child_and_writes_back_victims() {
        let l2 = small_cache(512, 1);
        let mut l1 = Cache::new(128, 1, 64, TIMING, Some(Box::new(l2))).unwrap();
        let stride = 64 * l1.n_sets() as u64;
        l1.access(0, false, true).unwrap();
        l1.access(stride, false, true).unwrap();
        // The second miss evicted the first line and wrote it through
        // uncounted, so L2 saw the two demand misses plus one writeback.
        let l2 = l1.child().unwrap();
        assert_eq!(l2.stats.miss, 2);
        assert_eq!(l2.counter(), 3);
    }

    #[test]
    fn free_list_stays_disjoint_from_occupied_ways() {
        let mut cache = small_cache(256, 4);
        let stride = 64 * cache.n_sets() as u64;
        for i in 0..12u64 {
            cache.access(i % 6 * stride, i % 3 == 0, true).unwrap();
        }
        let set = cache.set_index(0);
        let free = cache.free_ways(set);
        for (i, &w) in free.iter().enumerate() {
            assert!(w < cache.associativity());
            assert!(!free[i + 1..].contains(&w));
        }
    }

    #[test]
    fn targeted_evict_is_idempotent() {
        let mut cache = small_cache(256, 4);
        cache.access(0, false, true).unwrap();
        let set = cache.set_index(0);
        // The LIFO free list hands out the highest way first.
        let way = cache.associativity() - 1;
        assert!(!cache.is_free(set, way));
        cache.evict(set, Some(way), false).unwrap();
        cache.evict(set, Some(way), false).unwrap();
        assert_eq!(cache.free_ways(set).len(), cache.associativity());
    }
}
