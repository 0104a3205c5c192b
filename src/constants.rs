//! Configured defaults for the simulated hierarchy.

use crate::simulate::CacheTiming;

pub const CACHE_LINE: usize = 64;
pub const PAGE_SIZE: usize = 0x1000;

/// L1: 32 KiB, 8-way.
pub const L1_SIZE: usize = 0x8000;
pub const L1_WAYS: usize = 8;

/// L2: 1 MiB, 16-way.
pub const L2_SIZE: usize = 0x100000;
pub const L2_WAYS: usize = 16;

/// Hub: 4096 page entries, 8-way.
pub const HUB_ENTRIES: usize = 0x1000;
pub const HUB_WAYS: usize = 8;

/// eTLB: 64 page entries, 8-way.
pub const ETLB_ENTRIES: usize = 64;
pub const ETLB_WAYS: usize = 8;

pub const TLB_ENTRIES: usize = 512;

pub const L1_TIMING: CacheTiming = CacheTiming {
    access_time: 4,
    tag_time: 1,
    access_energy: 0.0111033,
    tag_energy: 0.000539962,
};

pub const L2_TIMING: CacheTiming = CacheTiming {
    access_time: 7,
    tag_time: 3,
    access_energy: 0.136191,
    tag_energy: 0.00221937,
};

/// The standalone two-level baseline models its L2 slightly differently.
pub const BASELINE_L2_TIMING: CacheTiming = CacheTiming {
    access_time: 8,
    tag_time: 3,
    access_energy: 0.137789,
    tag_energy: 0.00538836,
};
