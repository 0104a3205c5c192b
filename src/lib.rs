#[macro_use]
extern crate log;

mod cli;
mod constants;
pub mod simulate;
mod trace;

pub use crate::cli::{Args, ModelChoice};
pub use crate::constants::*;
pub use crate::simulate::{
    run_baseline, run_etlb, Cache, CacheReport, CacheStats, CacheTiming, Etlb, EtlbReport, Hub,
    LineLoc, SimError, Tlb,
};
pub use crate::trace::{parse_line, Access, MalformedTrace, TraceFormat};
