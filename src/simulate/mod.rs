//! The simulated hierarchy and its trace drivers.
//!
//! `run_etlb` drives the eTLB + Hub organization, `run_baseline` the
//! conventional two-level cache, over the same trace stream. Reports
//! mirror the counters each organization keeps.

use std::io::BufRead;

use anyhow::Context;
use smallvec::SmallVec;

use crate::constants::*;
use crate::trace::{parse_line, TraceFormat};

mod addr;
mod cache;
mod etlb;
mod hub;
mod tlb;

pub use addr::{pack_way_set, unpack_set, unpack_way, AddressFields, ADDRESS_BITS};
pub use cache::{Cache, CacheStats, CacheTiming};
pub use etlb::{Etlb, EtlbEntry};
pub use hub::{Hub, HubEntry};
pub use tlb::Tlb;

/// Free ways of one set, kept as a LIFO stack: the most recently freed way
/// is handed out first.
pub(crate) type FreeList = SmallVec<[usize; 16]>;

/// Fatal simulator inconsistencies. The point of running the simulator is
/// to validate the protocol, so nothing here is coerced or papered over.
#[derive(Debug, thiserror::Error)]
pub enum SimError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("cache-line table corrupt: location code {0} out of range")]
    CltCorrupt(u8),
    #[error("invariant broken: {0}")]
    InvariantBroken(String),
}

/// Location code for one cache-line-sized chunk of a page, as recorded in
/// a CLT. NIC ("not in cache") means the line lives only in DRAM. CLTs
/// store the raw code; decoding rejects anything out of range.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum LineLoc {
    Nic = 0,
    L1Instr = 1,
    L1Data = 2,
    L2 = 3,
}

impl TryFrom<u8> for LineLoc {
    type Error = SimError;

    fn try_from(raw: u8) -> Result<Self, SimError> {
        match raw {
            0 => Ok(LineLoc::Nic),
            1 => Ok(LineLoc::L1Instr),
            2 => Ok(LineLoc::L1Data),
            3 => Ok(LineLoc::L2),
            other => Err(SimError::CltCorrupt(other)),
        }
    }
}

/// Runs the eTLB hierarchy over a trace stream.
///
/// `skip` references are dropped entirely, the next `warmup` are simulated
/// without counting, and at most `n_lines` (unbounded when negative) are
/// simulated counted.
pub fn run_etlb<R: BufRead>(
    input: R,
    format: TraceFormat,
    n_lines: i64,
    skip: u64,
    warmup: u64,
    seed: u64,
) -> anyhow::Result<EtlbReport> {
    let mut etlb = Etlb::default_config(seed)?;
    let mut counted = 0u64;
    for (i, line) in input.lines().enumerate() {
        let line = line?;
        let i = i as u64;
        let parsed =
            parse_line(format, &line).with_context(|| format!("trace line {}", i + 1))?;
        let Some(access) = parsed else { break };
        if i >= skip {
            let count = i >= skip + warmup;
            if count {
                counted += 1;
            }
            etlb.access(access.address, access.write, count)?;
        }
        if n_lines >= 0 && i + 1 == skip + warmup + n_lines as u64 {
            break;
        }
    }
    Ok(EtlbReport::collect(&etlb, counted))
}

/// Runs the conventional two-level hierarchy over a trace stream.
pub fn run_baseline<R: BufRead>(
    input: R,
    format: TraceFormat,
    n_lines: i64,
    skip: u64,
    warmup: u64,
) -> anyhow::Result<CacheReport> {
    let l2 = Cache::new(L2_SIZE, L2_WAYS, CACHE_LINE, BASELINE_L2_TIMING, None)?;
    let mut l1 = Cache::new(L1_SIZE, L1_WAYS, CACHE_LINE, L1_TIMING, Some(Box::new(l2)))?;
    for (i, line) in input.lines().enumerate() {
        let line = line?;
        let i = i as u64;
        let parsed =
            parse_line(format, &line).with_context(|| format!("trace line {}", i + 1))?;
        let Some(access) = parsed else { break };
        if i >= skip {
            l1.access(access.address, access.write, i >= skip + warmup)?;
        }
        if n_lines >= 0 && i + 1 == skip + warmup + n_lines as u64 {
            break;
        }
    }
    Ok(CacheReport::collect(&l1, warmup))
}

#[derive(Debug)]
pub struct EtlbReport {
    pub n: u64,
    pub etlb_hit: [u64; 4],
    pub etlb_miss: u64,
    pub hub_hit: [u64; 4],
    pub hub_miss: u64,
    pub l1: CacheStats,
    pub l2: CacheStats,
}

impl EtlbReport {
    fn collect(etlb: &Etlb, counted: u64) -> Self {
        EtlbReport {
            n: counted,
            etlb_hit: etlb.hit,
            etlb_miss: etlb.miss,
            hub_hit: etlb.hub.hit,
            hub_miss: etlb.hub.miss,
            l1: etlb.cache.stats.clone(),
            l2: etlb.hub.cache.stats.clone(),
        }
    }

    pub fn print(&self) {
        let n = self.n.max(1) as f64;
        let pct = |count: u64| count as f64 / n * 100.0;
        println!("N: {}", self.n);
        println!("ETLB Hit, NIC {}, ({:.3})", self.etlb_hit[0], pct(self.etlb_hit[0]));
        println!("ETLB Hit, L1D {}, ({:.3})", self.etlb_hit[2], pct(self.etlb_hit[2]));
        println!("ETLB Hit, L2  {}, ({:.3})", self.etlb_hit[3], pct(self.etlb_hit[3]));
        println!("ETLB Miss,    {}, ({:.3})", self.etlb_miss, pct(self.etlb_miss));
        println!("Hub Hit, NIC {}, ({:.3})", self.hub_hit[0], pct(self.hub_hit[0]));
        println!("Hub Hit, L1  {}, ({:.3})", self.hub_hit[2], pct(self.hub_hit[2]));
        println!("Hub Hit, L2  {}, ({:.3})", self.hub_hit[3], pct(self.hub_hit[3]));
        println!("Hub Miss,    {}, ({:.3})", self.hub_miss, pct(self.hub_miss));
        print_cache_totals(&self.l1, &self.l2);
    }
}

#[derive(Debug)]
pub struct CacheReport {
    pub n: u64,
    pub l1: CacheStats,
    pub l2: CacheStats,
}

impl CacheReport {
    fn collect(l1: &Cache, warmup: u64) -> Self {
        CacheReport {
            n: l1.counter().saturating_sub(warmup),
            l1: l1.stats.clone(),
            l2: l1.child().map(|c| c.stats.clone()).unwrap_or_default(),
        }
    }

    pub fn print(&self) {
        let n = self.n.max(1) as f64;
        let pct = |count: u64| count as f64 / n * 100.0;
        println!("N: {}", self.n);
        println!("L1 hit:  {} ({:.3})", self.l1.hit, pct(self.l1.hit));
        println!("L1 miss: {} ({:.3})", self.l1.miss, pct(self.l1.miss));
        println!("L2 hit:  {} ({:.3})", self.l2.hit, pct(self.l2.hit));
        println!("L2 miss: {} ({:.3})", self.l2.miss, pct(self.l2.miss));
        print_cache_totals(&self.l1, &self.l2);
    }
}

fn print_cache_totals(l1: &CacheStats, l2: &CacheStats) {
    println!(
        "Time L1: {}, L2: {}, total: {}",
        l1.cycles,
        l2.cycles,
        l1.cycles + l2.cycles
    );
    println!(
        "Energy L1: {:.3}, L2: {:.3}, total: {:.3}",
        l1.energy,
        l2.energy,
        l1.energy + l2.energy
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn baseline_counts_split_cleanly_around_skip_and_warmup() {
        let trace: String = (0..10)
            .map(|i| format!("R {:x}\n", i * 0x40))
            .collect();
        let report = run_baseline(Cursor::new(trace), TraceFormat::Hex, -1, 2, 3).unwrap();
        // 8 references simulated, 5 counted.
        assert_eq!(report.n, 5);
        assert_eq!(report.l1.hit + report.l1.miss, report.n);
    }

    #[test]
    fn hex_stream_stops_at_eof_marker() {
        let trace = "R 1000\nW 1000\n#eof\nR 2000\n";
        let report = run_etlb(Cursor::new(trace), TraceFormat::Hex, -1, 0, 0, 1).unwrap();
        assert_eq!(report.n, 2);
        assert_eq!(report.etlb_hit.iter().sum::<u64>() + report.etlb_miss, 2);
    }

    #[test]
    fn n_lines_bounds_the_counted_stream() {
        let trace: String = (0..100)
            .map(|i| format!("R {:x}\n", i * 0x40))
            .collect();
        let report = run_etlb(Cursor::new(trace), TraceFormat::Hex, 3, 1, 1, 1).unwrap();
        assert_eq!(report.n, 3);
    }

    #[test]
    fn memtrace_lines_use_third_from_last_token() {
        let trace = "0 sim 1 Write 4096 0 0\n0 sim 2 Read 4160 0 0\n";
        let report = run_etlb(Cursor::new(trace), TraceFormat::Memtrace, -1, 0, 0, 1).unwrap();
        assert_eq!(report.n, 2);
        assert_eq!(report.etlb_miss, 1);
    }

    #[test]
    fn malformed_line_aborts_the_run() {
        let trace = "R 1000\nR zzz\n";
        assert!(run_etlb(Cursor::new(trace), TraceFormat::Hex, -1, 0, 0, 1).is_err());
    }

    #[test]
    fn empty_stream_reports_zero_counts() {
        let report = run_etlb(Cursor::new(""), TraceFormat::Hex, -1, 0, 0, 1).unwrap();
        assert_eq!(report.n, 0);
        report.print();
    }
}
