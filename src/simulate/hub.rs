//! Inclusive page directory backing the eTLB.
//!
//! The Hub mirrors the cache-line table of every resident page that is not
//! currently held by an eTLB entry, and points back at the eTLB entry when
//! one is active. Exactly one of the two copies is authoritative at any
//! time. Because Hub evictions reach back into the eTLB and both caches,
//! the operations that cross structures are implemented on [`Etlb`], which
//! owns all of them; the Hub itself only carries its local state.

use super::addr::{pack_way_set, unpack_set, unpack_way, AddressFields};
use super::cache::Cache;
use super::etlb::Etlb;
use super::{FreeList, LineLoc, SimError};

// ---------------------------------------------------------------------------
// Directory entries
// ---------------------------------------------------------------------------

/// One way of the Hub array: a physical page plus the per-line location
/// table for that page.
pub struct HubEntry {
    pub ptag: u64,
    pub valid: bool,
    pub last_access: u64,
    pub etlb_valid: bool,
    /// Packed (way, set) index of the active eTLB entry, meaningful only
    /// while `etlb_valid` holds.
    pub etlb_ptr: u64,
    /// Reserved for a future split instruction/data cache.
    #[allow(dead_code)]
    pub instr_or_data: bool,
    pub location: Vec<u8>,
    pub way: Vec<usize>,
}

impl HubEntry {
    fn new(lines_per_page: usize) -> Self {
        HubEntry {
            ptag: 0,
            valid: false,
            last_access: 0,
            etlb_valid: false,
            etlb_ptr: 0,
            instr_or_data: true,
            location: vec![LineLoc::Nic as u8; lines_per_page],
            way: vec![0; lines_per_page],
        }
    }
}

// ---------------------------------------------------------------------------
// The directory proper
// ---------------------------------------------------------------------------

pub struct Hub {
    pub(super) fields: AddressFields,
    associativity: usize,
    n_sets: usize,
    pub(super) lines_per_page: usize,
    pub(super) entries: Vec<Vec<HubEntry>>,
    pub(super) free: Vec<FreeList>,
    counter: u64,
    /// Hits by the location of the requested line: NIC, L1I, L1D, L2.
    pub hit: [u64; 4],
    pub miss: u64,
    /// The L2 cache, indexed by Hub pointers rather than addresses.
    pub cache: Cache,
}

impl Hub {
    pub fn new(
        n_entries: usize,
        associativity: usize,
        page_size: usize,
        cache: Cache,
    ) -> Result<Self, SimError> {
        if !n_entries.is_power_of_two()
            || !associativity.is_power_of_two()
            || !page_size.is_power_of_two()
        {
            return Err(SimError::InvalidConfig(format!(
                "hub dimensions must be powers of two (entries {n_entries}, \
                 associativity {associativity}, page {page_size})"
            )));
        }
        if associativity > n_entries {
            return Err(SimError::InvalidConfig(format!(
                "hub associativity {associativity} exceeds {n_entries} entries"
            )));
        }
        let cache_line = cache.cache_line();
        if page_size < cache_line {
            return Err(SimError::InvalidConfig(format!(
                "page size {page_size} smaller than cache line {cache_line}"
            )));
        }
        let n_sets = n_entries / associativity;
        let lines_per_page = page_size / cache_line;
        let entries = (0..n_sets)
            .map(|_| (0..associativity).map(|_| HubEntry::new(lines_per_page)).collect())
            .collect();
        Ok(Hub {
            fields: AddressFields::paged(cache_line, page_size, n_sets),
            associativity,
            n_sets,
            lines_per_page,
            entries,
            free: (0..n_sets).map(|_| (0..associativity).collect()).collect(),
            counter: 0,
            hit: [0; 4],
            miss: 0,
            cache,
        })
    }

    pub fn n_sets(&self) -> usize {
        self.n_sets
    }

    pub fn associativity(&self) -> usize {
        self.associativity
    }

    pub fn set_bits(&self) -> u32 {
        self.fields.set_bits
    }

    pub fn page_size(&self) -> usize {
        self.lines_per_page * self.cache.cache_line()
    }

    /// Composite Hub pointer for the entry at (way, set), as stored in L1
    /// and L2 tag fields.
    pub fn pack_ptr(&self, way: usize, set: usize) -> u64 {
        pack_way_set(way, set, self.fields.set_bits)
    }

    pub(super) fn lookup(&self, set: usize, tag: u64) -> Option<usize> {
        (0..self.associativity)
            .find(|&way| self.entries[set][way].valid && self.entries[set][way].ptag == tag)
    }

    /// Way of `set` whose back-pointer targets the given eTLB entry.
    pub(super) fn find_back_ptr(&self, set: usize, etlb_ptr: u64) -> Option<usize> {
        (0..self.associativity).find(|&way| {
            let entry = &self.entries[set][way];
            entry.valid && entry.etlb_valid && entry.etlb_ptr == etlb_ptr
        })
    }

    /// LRU victim among occupied ways; ties go to the lowest way index.
    pub(super) fn select_victim(&self, set: usize) -> usize {
        let mut victim = 0;
        let mut min_access = self.entries[set][0].last_access;
        for (way, entry) in self.entries[set].iter().enumerate() {
            if !self.free[set].contains(&way) && entry.last_access < min_access {
                victim = way;
                min_access = entry.last_access;
            }
        }
        victim
    }

    pub(super) fn take_free(&mut self, set: usize) -> Result<usize, SimError> {
        self.free[set].pop().ok_or_else(|| {
            SimError::InvariantBroken(format!("no free hub way in set {set} after eviction"))
        })
    }

    pub(super) fn touch(&mut self, set: usize, way: usize) {
        self.counter += 1;
        self.entries[set][way].last_access = self.counter;
    }
}

// ---------------------------------------------------------------------------
// Cross-structure operations rooted at the Hub
// ---------------------------------------------------------------------------

impl Etlb {
    /// Page-directory lookup for a physical address. Returns the (set, way)
    /// of the resolved entry, installing it first on a miss.
    pub(super) fn hub_access(
        &mut self,
        address: u64,
        count: bool,
        count_energy: bool,
    ) -> Result<(usize, usize), SimError> {
        let page_index = self.hub.fields.page_index(address);
        let set = self.hub.fields.set(address);
        let tag = self.hub.fields.tag(address);

        if let Some(way) = self.hub.lookup(set, tag) {
            let loc = LineLoc::try_from(self.hub.entries[set][way].location[page_index])?;
            if count {
                self.hub.hit[loc as usize] += 1;
            }
            self.hub.touch(set, way);
            return Ok((set, way));
        }

        if count {
            self.hub.miss += 1;
        }
        if self.hub.free[set].is_empty() {
            let victim = self.hub.select_victim(set);
            self.hub_evict_entry(set, victim, count_energy)?;
        }
        let way = self.hub.take_free(set)?;
        let entry = &mut self.hub.entries[set][way];
        entry.ptag = tag;
        entry.etlb_valid = false;
        entry.location.fill(LineLoc::Nic as u8);
        entry.valid = true;
        self.hub.touch(set, way);
        Ok((set, way))
    }

    /// Destroys a Hub entry: every line of the victim page is driven out of
    /// the hierarchy (L1 lines demote to L2 and are then flushed, L2 lines
    /// are flushed directly), the active eTLB entry is dropped, and the way
    /// is freed.
    fn hub_evict_entry(
        &mut self,
        set: usize,
        way: usize,
        count_energy: bool,
    ) -> Result<(), SimError> {
        let (ptag, etlb_valid, etlb_ptr) = {
            let entry = &self.hub.entries[set][way];
            (entry.ptag, entry.etlb_valid, entry.etlb_ptr)
        };
        let phys_page = (ptag << self.hub.fields.set_bits) | set as u64;
        debug!("hub evicts page {phys_page:#x} (set {set} way {way})");

        // The authoritative CLT is the eTLB entry's while the back-pointer
        // is live, the Hub entry's own otherwise.
        let active = if etlb_valid {
            let eway = unpack_way(etlb_ptr, self.fields.set_bits);
            let eset = unpack_set(etlb_ptr, self.fields.set_bits);
            let stale = self
                .entries
                .get(eset)
                .and_then(|s| s.get(eway))
                .map_or(true, |e| !e.valid);
            if stale {
                return Err(SimError::InvariantBroken(format!(
                    "hub back-pointer {etlb_ptr:#x} targets no valid eTLB entry"
                )));
            }
            Some((eset, eway))
        } else {
            None
        };
        let virt_page = match active {
            Some((eset, eway)) => {
                let entry = &self.entries[eset][eway];
                (entry.vtag << self.fields.set_bits) | eset as u64
            }
            None => self.tlb.translate_phys(phys_page),
        };

        let l1_sets = self.cache.n_sets() as u64;
        let l2_set = (phys_page as usize) % self.hub.cache.n_sets();
        let page_bits = self.hub.fields.page_bits;
        for i in 0..self.hub.lines_per_page {
            let mut rounds = 0;
            loop {
                let (loc, w) = match active {
                    Some((eset, eway)) => {
                        let entry = &self.entries[eset][eway];
                        (entry.location[i], entry.way[i])
                    }
                    None => {
                        let entry = &self.hub.entries[set][way];
                        (entry.location[i], entry.way[i])
                    }
                };
                match LineLoc::try_from(loc)? {
                    LineLoc::Nic => break,
                    LineLoc::L1Instr | LineLoc::L1Data => {
                        let l1_set = (((virt_page << page_bits) | i as u64) % l1_sets) as usize;
                        self.evict_cache(l1_set, Some(w), count_energy)?;
                    }
                    LineLoc::L2 => {
                        self.hub_evict_cache(l2_set, Some(w), count_energy)?;
                    }
                }
                rounds += 1;
                if rounds > 4 {
                    return Err(SimError::InvariantBroken(format!(
                        "line {i} of page {phys_page:#x} cannot be flushed"
                    )));
                }
            }
        }

        if let Some((eset, eway)) = active {
            self.entries[eset][eway].valid = false;
            if !self.free[eset].contains(&eway) {
                self.free[eset].push(eway);
            }
            self.hub.entries[set][way].etlb_valid = false;
        }
        let entry = &mut self.hub.entries[set][way];
        entry.valid = false;
        if !self.hub.free[set].contains(&way) {
            self.hub.free[set].push(way);
        }
        Ok(())
    }

    /// Evicts one line from L2 back to DRAM, clearing it from whichever CLT
    /// owns the page. `way` picks a specific victim; otherwise LRU decides.
    pub(super) fn hub_evict_cache(
        &mut self,
        set: usize,
        way: Option<usize>,
        count_energy: bool,
    ) -> Result<(), SimError> {
        let way = way.unwrap_or_else(|| self.hub.cache.select_victim(set));
        let hub_ptr = self.hub.cache.tag_at(set, way);
        // The data movement to DRAM itself is not simulated.
        self.hub.cache.access_direct(set, way, false, true, count_energy);

        let hub_set = unpack_set(hub_ptr, self.hub.fields.set_bits);
        let hub_way = unpack_way(hub_ptr, self.hub.fields.set_bits);
        let (valid, etlb_valid, etlb_ptr) = match self
            .hub
            .entries
            .get(hub_set)
            .and_then(|s| s.get(hub_way))
        {
            Some(entry) => (entry.valid, entry.etlb_valid, entry.etlb_ptr),
            None => {
                return Err(SimError::InvariantBroken(format!(
                    "L2 tag {hub_ptr:#x} is not a hub pointer"
                )))
            }
        };
        if !valid {
            return Err(SimError::InvariantBroken(format!(
                "L2 line (set {set}, way {way}) belongs to no resident page"
            )));
        }

        let clt = if etlb_valid {
            let eset = unpack_set(etlb_ptr, self.fields.set_bits);
            let eway = unpack_way(etlb_ptr, self.fields.set_bits);
            let entry = &mut self.entries[eset][eway];
            (&mut entry.location, &entry.way)
        } else {
            let entry = &mut self.hub.entries[hub_set][hub_way];
            (&mut entry.location, &entry.way)
        };
        for i in 0..clt.0.len() {
            if clt.0[i] == LineLoc::L2 as u8 && clt.1[i] == way {
                clt.0[i] = LineLoc::Nic as u8;
            }
        }

        self.hub.cache.evict(set, Some(way), count_energy)?;
        Ok(())
    }
}
