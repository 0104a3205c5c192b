//! Enhanced TLB: the request-handling front of the hierarchy.
//!
//! Each entry maps a virtual page and carries a cache-line table (CLT)
//! giving, per line of the page, where that line currently lives. Hits are
//! served by driving the recorded L1/L2 way directly; misses refill from
//! the Hub, copying its CLT and installing a back-pointer so later
//! evictions at either end can find each other.

use super::addr::{pack_way_set, unpack_set, unpack_way, AddressFields};
use super::cache::Cache;
use super::hub::Hub;
use super::tlb::Tlb;
use super::{FreeList, LineLoc, SimError};
use crate::constants::*;

/// One way of the eTLB array.
pub struct EtlbEntry {
    pub vtag: u64,
    /// Physical page number of the mapped page.
    pub paddr: u64,
    pub last_access: u64,
    pub valid: bool,
    pub location: Vec<u8>,
    pub way: Vec<usize>,
}

impl EtlbEntry {
    fn new(lines_per_page: usize) -> Self {
        EtlbEntry {
            vtag: 0,
            paddr: 0,
            last_access: 0,
            valid: false,
            location: vec![LineLoc::Nic as u8; lines_per_page],
            way: vec![0; lines_per_page],
        }
    }
}

pub struct Etlb {
    pub(super) fields: AddressFields,
    associativity: usize,
    pub(super) entries: Vec<Vec<EtlbEntry>>,
    pub(super) free: Vec<FreeList>,
    counter: u64,
    /// Hits by the location of the requested line: NIC, L1I, L1D, L2.
    pub hit: [u64; 4],
    pub miss: u64,
    /// The L1 cache. Its tags hold Hub pointers, not address tags.
    pub cache: Cache,
    pub hub: Hub,
    pub tlb: Tlb,
}

impl Etlb {
    pub fn new(
        n_lines: usize,
        associativity: usize,
        page_size: usize,
        cache: Cache,
        hub: Hub,
        seed: u64,
    ) -> Result<Self, SimError> {
        if !n_lines.is_power_of_two() || !associativity.is_power_of_two() {
            return Err(SimError::InvalidConfig(format!(
                "eTLB dimensions must be powers of two (entries {n_lines}, \
                 associativity {associativity})"
            )));
        }
        if associativity > n_lines {
            return Err(SimError::InvalidConfig(format!(
                "eTLB associativity {associativity} exceeds {n_lines} entries"
            )));
        }
        let cache_line = cache.cache_line();
        if cache_line != hub.cache.cache_line() {
            return Err(SimError::InvalidConfig(
                "L1 and L2 cache line sizes differ".into(),
            ));
        }
        if page_size != hub.page_size() {
            return Err(SimError::InvalidConfig(
                "eTLB and hub page sizes differ".into(),
            ));
        }
        let n_sets = n_lines / associativity;
        let lines_per_page = page_size / cache_line;
        let fields = AddressFields::paged(cache_line, page_size, n_sets);
        let tlb = Tlb::new(TLB_ENTRIES, fields.tag_bits() + fields.set_bits, seed);
        let entries = (0..n_sets)
            .map(|_| (0..associativity).map(|_| EtlbEntry::new(lines_per_page)).collect())
            .collect();
        Ok(Etlb {
            fields,
            associativity,
            entries,
            free: (0..n_sets).map(|_| (0..associativity).collect()).collect(),
            counter: 0,
            hit: [0; 4],
            miss: 0,
            cache,
            hub,
            tlb,
        })
    }

    /// The configured default hierarchy.
    pub fn default_config(seed: u64) -> Result<Self, SimError> {
        let l1 = Cache::new(L1_SIZE, L1_WAYS, CACHE_LINE, L1_TIMING, None)?;
        let l2 = Cache::new(L2_SIZE, L2_WAYS, CACHE_LINE, L2_TIMING, None)?;
        let hub = Hub::new(HUB_ENTRIES, HUB_WAYS, PAGE_SIZE, l2)?;
        Etlb::new(ETLB_ENTRIES, ETLB_WAYS, PAGE_SIZE, l1, hub, seed)
    }

    pub fn access(&mut self, address: u64, write: bool, count: bool) -> Result<(), SimError> {
        self.access_opts(address, write, count, count, count)
    }

    fn access_opts(
        &mut self,
        address: u64,
        write: bool,
        count: bool,
        count_time: bool,
        count_energy: bool,
    ) -> Result<(), SimError> {
        let page_index = self.fields.page_index(address);
        let set = self.fields.set(address);
        let tag = self.fields.tag(address);

        let resident = (0..self.associativity).find(|&way| {
            let entry = &self.entries[set][way];
            entry.valid && entry.vtag == tag
        });

        let way = match resident {
            Some(way) => {
                let loc = LineLoc::try_from(self.entries[set][way].location[page_index])?;
                if count {
                    self.hit[loc as usize] += 1;
                }
                let line_way = self.entries[set][way].way[page_index];
                let paddr = self.entries[set][way].paddr;
                match loc {
                    LineLoc::Nic => {
                        // DRAM supplies the line (not simulated); it lands
                        // in L1 tagged with the owning page's Hub pointer.
                        let l1_set = self.cache.set_index(address);
                        if !self.cache.has_free(l1_set) {
                            self.evict_cache(l1_set, None, count_energy)?;
                        }
                        let l1_way = self.cache.take_free(l1_set)?;
                        self.cache
                            .access_direct(l1_set, l1_way, write, false, count_energy);
                        let etlb_ptr = pack_way_set(way, set, self.fields.set_bits);
                        let hub_set = (paddr as usize) % self.hub.n_sets();
                        let hub_way =
                            self.hub.find_back_ptr(hub_set, etlb_ptr).ok_or_else(|| {
                                SimError::InvariantBroken(format!(
                                    "no hub entry points at eTLB entry (set {set}, way {way})"
                                ))
                            })?;
                        self.cache
                            .set_tag(l1_set, l1_way, self.hub.pack_ptr(hub_way, hub_set));
                        let entry = &mut self.entries[set][way];
                        entry.location[page_index] = LineLoc::L1Data as u8;
                        entry.way[page_index] = l1_way;
                    }
                    LineLoc::L1Instr | LineLoc::L1Data => {
                        let l1_set = self.cache.set_index(address);
                        self.cache
                            .access_direct(l1_set, line_way, write, count_time, count_energy);
                    }
                    LineLoc::L2 => {
                        let l2_set = (paddr as usize) % self.hub.cache.n_sets();
                        self.hub
                            .cache
                            .access_direct(l2_set, line_way, write, count_time, count_energy);
                        // Exclusive promotion: the only copy moves up to L1.
                        let l1_set = self.cache.set_index(address);
                        if !self.cache.has_free(l1_set) {
                            self.evict_cache(l1_set, None, count_energy)?;
                        }
                        let l1_way = self.cache.take_free(l1_set)?;
                        self.cache
                            .access_direct(l1_set, l1_way, false, false, count_energy);
                        let hub_ptr = self.hub.cache.tag_at(l2_set, line_way);
                        self.cache.set_tag(l1_set, l1_way, hub_ptr);
                        let entry = &mut self.entries[set][way];
                        entry.location[page_index] = LineLoc::L1Data as u8;
                        entry.way[page_index] = l1_way;
                        self.hub.cache.evict(l2_set, Some(line_way), count_energy)?;
                    }
                }
                way
            }
            None => {
                if count {
                    self.miss += 1;
                }
                if self.free[set].is_empty() {
                    self.evict_entry(set, None)?;
                }
                let way = self.take_free(set)?;
                let paddr = self
                    .tlb
                    .translate_virt((tag << self.fields.set_bits) | set as u64);
                {
                    let entry = &mut self.entries[set][way];
                    entry.vtag = tag;
                    entry.paddr = paddr;
                }
                let phys_addr = (((paddr << self.fields.page_bits) | page_index as u64)
                    << self.fields.offset_bits)
                    | self.fields.offset(address);
                let (hub_set, hub_way) = self.hub_access(phys_addr, count, count_energy)?;
                {
                    let hub_entry = &self.hub.entries[hub_set][hub_way];
                    let entry = &mut self.entries[set][way];
                    entry.location.copy_from_slice(&hub_entry.location);
                    entry.way.copy_from_slice(&hub_entry.way);
                    entry.valid = true;
                }
                let hub_entry = &mut self.hub.entries[hub_set][hub_way];
                hub_entry.etlb_valid = true;
                hub_entry.etlb_ptr = pack_way_set(way, set, self.fields.set_bits);
                // Replay against the now-resident entry; the hit path does
                // the placement. Only energy is charged for the refill.
                self.access_opts(address, write, false, false, true)?;
                way
            }
        };

        self.counter += 1;
        self.entries[set][way].last_access = self.counter;
        Ok(())
    }

    /// Frees an eTLB way. The LRU victim's CLT is written back to its Hub
    /// entry first; an unlocatable Hub entry is fatal.
    pub fn evict_entry(&mut self, set: usize, way: Option<usize>) -> Result<usize, SimError> {
        if let Some(way) = way {
            if !self.free[set].contains(&way) {
                self.free[set].push(way);
            }
            return Ok(way);
        }
        let way = self.select_victim(set);
        let etlb_ptr = pack_way_set(way, set, self.fields.set_bits);
        let hub_set = (self.entries[set][way].paddr as usize) % self.hub.n_sets();
        let hub_way = self.hub.find_back_ptr(hub_set, etlb_ptr).ok_or_else(|| {
            SimError::InvariantBroken(format!(
                "evicted eTLB entry (set {set}, way {way}) has no hub entry"
            ))
        })?;
        debug!("eTLB entry (set {set}, way {way}) synced back to hub {hub_set}.{hub_way}");
        {
            let entry = &self.entries[set][way];
            let hub_entry = &mut self.hub.entries[hub_set][hub_way];
            hub_entry.location.copy_from_slice(&entry.location);
            hub_entry.way.copy_from_slice(&entry.way);
            hub_entry.etlb_valid = false;
        }
        self.entries[set][way].valid = false;
        if !self.free[set].contains(&way) {
            self.free[set].push(way);
        }
        Ok(way)
    }

    /// Demotes one L1 line to L2, rewriting the owning CLT. `way` picks a
    /// specific victim; otherwise LRU decides.
    pub fn evict_cache(
        &mut self,
        set: usize,
        way: Option<usize>,
        count_energy: bool,
    ) -> Result<(), SimError> {
        let way = way.unwrap_or_else(|| self.cache.select_victim(set));
        let hub_ptr = self.cache.tag_at(set, way);
        let hub_set = unpack_set(hub_ptr, self.hub.set_bits());
        let hub_way = unpack_way(hub_ptr, self.hub.set_bits());
        let (valid, ptag, etlb_valid, etlb_ptr) =
            match self.hub.entries.get(hub_set).and_then(|s| s.get(hub_way)) {
                Some(entry) => (entry.valid, entry.ptag, entry.etlb_valid, entry.etlb_ptr),
                None => {
                    return Err(SimError::InvariantBroken(format!(
                        "L1 tag {hub_ptr:#x} is not a hub pointer"
                    )))
                }
            };
        if !valid {
            return Err(SimError::InvariantBroken(format!(
                "L1 line (set {set}, way {way}) belongs to no resident page"
            )));
        }

        let phys_page = (ptag << self.hub.set_bits()) | hub_set as u64;
        let l2_set = (phys_page as usize) % self.hub.cache.n_sets();
        if !self.hub.cache.has_free(l2_set) {
            self.hub_evict_cache(l2_set, None, count_energy)?;
        }
        let l2_way = self.hub.cache.take_free(l2_set)?;
        self.hub
            .cache
            .access_direct(l2_set, l2_way, false, false, count_energy);
        self.hub.cache.set_tag(l2_set, l2_way, hub_ptr);

        // Rewrite the owning CLT. Only the line of this page that actually
        // maps to the evicted L1 set may move; a bare way match could alias
        // a sibling line in another set.
        let (virt_page, active) = if etlb_valid {
            let eset = unpack_set(etlb_ptr, self.fields.set_bits);
            let eway = unpack_way(etlb_ptr, self.fields.set_bits);
            let entry = &self.entries[eset][eway];
            (
                (entry.vtag << self.fields.set_bits) | eset as u64,
                Some((eset, eway)),
            )
        } else {
            (self.tlb.translate_phys(phys_page), None)
        };
        let l1_sets = self.cache.n_sets() as u64;
        let page_bits = self.fields.page_bits;
        let clt = match active {
            Some((eset, eway)) => {
                let entry = &mut self.entries[eset][eway];
                (&mut entry.location, &mut entry.way)
            }
            None => {
                let entry = &mut self.hub.entries[hub_set][hub_way];
                (&mut entry.location, &mut entry.way)
            }
        };
        for i in 0..clt.0.len() {
            let line_set = (((virt_page << page_bits) | i as u64) % l1_sets) as usize;
            if clt.0[i] == LineLoc::L1Data as u8 && clt.1[i] == way && line_set == set {
                clt.0[i] = LineLoc::L2 as u8;
                clt.1[i] = l2_way;
            }
        }

        self.cache.evict(set, Some(way), count_energy)?;
        Ok(())
    }

    /// LRU victim among occupied ways; ties go to the lowest way index.
    fn select_victim(&self, set: usize) -> usize {
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

    fn take_free(&mut self, set: usize) -> Result<usize, SimError> {
        self.free[set].pop().ok_or_else(|| {
            SimError::InvariantBroken(format!("no free eTLB way in set {set} after eviction"))
        })
    }
}

#[cfg(test)]
impl Etlb {
    /// Linear audit of every cross-structure invariant: free lists vs
    /// validity, back-pointer uniqueness, CLT truthfulness, and the absence
    /// of dangling cache lines.
    fn audit(&self) {
        use std::collections::{HashMap, HashSet};

        for set in 0..self.entries.len() {
            for way in 0..self.associativity {
                assert_eq!(
                    self.entries[set][way].valid,
                    !self.free[set].contains(&way),
                    "eTLB validity disagrees with free list at ({set}, {way})"
                );
            }
        }
        for set in 0..self.hub.n_sets() {
            for way in 0..self.hub.associativity() {
                assert_eq!(
                    self.hub.entries[set][way].valid,
                    !self.hub.free[set].contains(&way),
                    "hub validity disagrees with free list at ({set}, {way})"
                );
            }
        }

        let mut pointed = HashSet::new();
        for hs in 0..self.hub.n_sets() {
            for hw in 0..self.hub.associativity() {
                let h = &self.hub.entries[hs][hw];
                if h.valid && h.etlb_valid {
                    assert!(pointed.insert(h.etlb_ptr), "duplicate hub back-pointer");
                    let es = unpack_set(h.etlb_ptr, self.fields.set_bits);
                    let ew = unpack_way(h.etlb_ptr, self.fields.set_bits);
                    assert!(self.entries[es][ew].valid, "back-pointer to invalid entry");
                    assert_eq!((self.entries[es][ew].paddr as usize) % self.hub.n_sets(), hs);
                }
            }
        }
        for es in 0..self.entries.len() {
            for ew in 0..self.associativity {
                if self.entries[es][ew].valid {
                    let ptr = pack_way_set(ew, es, self.fields.set_bits);
                    let hs = (self.entries[es][ew].paddr as usize) % self.hub.n_sets();
                    assert!(
                        self.hub.find_back_ptr(hs, ptr).is_some(),
                        "active eTLB entry ({es}, {ew}) unknown to hub"
                    );
                }
            }
        }

        let mut l1_owner: HashMap<(usize, usize), u64> = HashMap::new();
        let mut l2_owner: HashMap<(usize, usize), u64> = HashMap::new();
        for hs in 0..self.hub.n_sets() {
            for hw in 0..self.hub.associativity() {
                let h = &self.hub.entries[hs][hw];
                if !h.valid {
                    continue;
                }
                let hub_ptr = self.hub.pack_ptr(hw, hs);
                let phys_page = (h.ptag << self.hub.set_bits()) | hs as u64;
                let (virt_page, location, ways) = if h.etlb_valid {
                    let es = unpack_set(h.etlb_ptr, self.fields.set_bits);
                    let ew = unpack_way(h.etlb_ptr, self.fields.set_bits);
                    let e = &self.entries[es][ew];
                    (
                        (e.vtag << self.fields.set_bits) | es as u64,
                        &e.location,
                        &e.way,
                    )
                } else {
                    (self.tlb.translate_phys(phys_page), &h.location, &h.way)
                };
                for i in 0..location.len() {
                    match LineLoc::try_from(location[i]).unwrap() {
                        LineLoc::Nic => {}
                        LineLoc::L1Instr | LineLoc::L1Data => {
                            let l1_set = (((virt_page << self.fields.page_bits) | i as u64)
                                % self.cache.n_sets() as u64) as usize;
                            assert!(!self.cache.is_free(l1_set, ways[i]));
                            assert_eq!(
                                self.cache.tag_at(l1_set, ways[i]),
                                hub_ptr,
                                "L1 tag does not point back at the owning page"
                            );
                            assert!(
                                l1_owner.insert((l1_set, ways[i]), hub_ptr).is_none(),
                                "two CLT lines claim L1 ({l1_set}, {})",
                                ways[i]
                            );
                        }
                        LineLoc::L2 => {
                            let l2_set = (phys_page as usize) % self.hub.cache.n_sets();
                            assert!(!self.hub.cache.is_free(l2_set, ways[i]));
                            assert_eq!(self.hub.cache.tag_at(l2_set, ways[i]), hub_ptr);
                            assert!(
                                l2_owner.insert((l2_set, ways[i]), hub_ptr).is_none(),
                                "two CLT lines claim L2 ({l2_set}, {})",
                                ways[i]
                            );
                        }
                    }
                }
            }
        }
        for set in 0..self.cache.n_sets() {
            for way in 0..self.cache.associativity() {
                if !self.cache.is_free(set, way) {
                    assert!(
                        l1_owner.contains_key(&(set, way)),
                        "dangling L1 line at ({set}, {way})"
                    );
                }
            }
        }
        for set in 0..self.hub.cache.n_sets() {
            for way in 0..self.hub.cache.associativity() {
                if !self.hub.cache.is_free(set, way) {
                    assert!(
                        l2_owner.contains_key(&(set, way)),
                        "dangling L2 line at ({set}, {way})"
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeated_line_misses_once_then_hits_l1() {
        let mut etlb = Etlb::default_config(1).unwrap();
        for _ in 0..1000 {
            etlb.access(0x1000, false, true).unwrap();
        }
        assert_eq!(etlb.miss, 1);
        assert_eq!(etlb.hit[LineLoc::L1Data as usize], 999);
        assert_eq!(etlb.hit[LineLoc::Nic as usize], 0);
        assert_eq!(etlb.hub.miss, 1);
        assert_eq!(etlb.hub.hit, [0; 4]);
        etlb.audit();
    }

    #[test]
    fn page_sweep_leaves_every_line_in_l1() {
        let mut etlb = Etlb::default_config(1).unwrap();
        for addr in (0..0x1000u64).step_by(64) {
            etlb.access(addr, false, true).unwrap();
        }
        // First touch misses the whole hierarchy; the other 63 lines hit
        // the entry but still need their DRAM fetch.
        assert_eq!(etlb.miss, 1);
        assert_eq!(etlb.hit[LineLoc::Nic as usize], 63);
        let entry = etlb.entries[0]
            .iter()
            .find(|e| e.valid && e.vtag == 0)
            .expect("page 0 resident");
        assert!(entry
            .location
            .iter()
            .all(|&loc| loc == LineLoc::L1Data as u8));
        etlb.audit();
    }

    #[test]
    fn l1_pressure_demotes_lru_line_and_l2_hit_promotes_it_back() {
        let mut etlb = Etlb::default_config(2).unwrap();
        // Line 0 of pages 0..8 all map to L1 set 0 (8 ways): the ninth
        // install demotes page 0's line to L2.
        for page in 0..9u64 {
            etlb.access(page * 0x1000, false, true).unwrap();
        }
        let l2_hits_before = etlb.hit[LineLoc::L2 as usize];
        etlb.access(0, false, true).unwrap();
        assert_eq!(etlb.hit[LineLoc::L2 as usize], l2_hits_before + 1);
        let entry = etlb.entries[0]
            .iter()
            .find(|e| e.valid && e.vtag == 0)
            .expect("page 0 resident");
        assert_eq!(entry.location[0], LineLoc::L1Data as u8);
        etlb.audit();
    }

    #[test]
    fn evicted_entry_syncs_clt_to_hub_and_reloads_on_return() {
        let mut etlb = Etlb::default_config(5).unwrap();
        // Nine pages colliding in eTLB set 0 (8 ways): page 0 is evicted
        // and its CLT written back to the hub.
        for page in 0..9u64 {
            etlb.access(page * 8 * 0x1000, false, true).unwrap();
        }
        assert_eq!(etlb.hub.hit, [0; 4]);
        etlb.access(0, false, true).unwrap();
        // The return trip misses the eTLB but hits the hub, which still
        // knows the line was demoted to L2 meanwhile.
        assert_eq!(etlb.miss, 10);
        assert_eq!(etlb.hub.hit[LineLoc::L2 as usize], 1);
        let entry = etlb.entries[0]
            .iter()
            .find(|e| e.valid && e.vtag == 0)
            .expect("page 0 resident again");
        assert_eq!(entry.location[0], LineLoc::L1Data as u8);
        etlb.audit();
    }

    #[test]
    fn write_read_and_read_read_agree_on_placement() {
        let mut a = Etlb::default_config(3).unwrap();
        let mut b = Etlb::default_config(3).unwrap();
        a.access(0x2040, true, true).unwrap();
        a.access(0x2040, false, true).unwrap();
        b.access(0x2040, false, true).unwrap();
        b.access(0x2040, false, true).unwrap();
        let ea = a.entries[2].iter().find(|e| e.valid).unwrap();
        let eb = b.entries[2].iter().find(|e| e.valid).unwrap();
        assert_eq!(ea.location, eb.location);
        assert_eq!(ea.way, eb.way);
        a.audit();
        b.audit();
    }

    #[test]
    fn hub_eviction_cascade_leaves_no_dangling_lines() {
        let mut etlb = Etlb::default_config(4).unwrap();
        // More pages than the hub holds: victims with live CLTs must walk
        // their lines out of both cache levels.
        for page in 0..(HUB_ENTRIES as u64 + 1) * 8 {
            etlb.access(page * PAGE_SIZE as u64, false, true).unwrap();
        }
        assert!(etlb.hub.cache.counter() > 0, "cascade never touched L2");
        assert_eq!(etlb.miss + etlb.hit.iter().sum::<u64>(), (HUB_ENTRIES as u64 + 1) * 8);
        etlb.audit();
    }

    #[test]
    fn corrupt_location_code_is_fatal() {
        let mut etlb = Etlb::default_config(6).unwrap();
        etlb.access(0x1000, false, true).unwrap();
        let way = (0..etlb.associativity)
            .find(|&w| etlb.entries[1][w].valid)
            .unwrap();
        etlb.entries[1][way].location[0] = 7;
        assert!(matches!(
            etlb.access(0x1000, false, true),
            Err(SimError::CltCorrupt(7))
        ));
    }

    #[test]
    fn counted_references_split_between_hits_and_misses() {
        let mut etlb = Etlb::default_config(8).unwrap();
        let mut n = 0u64;
        for i in 0..500u64 {
            etlb.access((i % 37) * 0x940, i % 5 == 0, true).unwrap();
            n += 1;
        }
        assert_eq!(etlb.hit.iter().sum::<u64>() + etlb.miss, n);
        etlb.audit();
    }

    #[test]
    fn targeted_entry_evict_frees_without_writeback() {
        let mut etlb = Etlb::default_config(9).unwrap();
        etlb.access(0x1000, false, true).unwrap();
        let way = (0..etlb.associativity)
            .find(|&w| etlb.entries[1][w].valid)
            .unwrap();
        let freed = etlb.evict_entry(1, Some(way)).unwrap();
        assert_eq!(freed, way);
        assert!(etlb.free[1].contains(&way));
    }
}
