use clap::{Parser, ValueEnum};

use crate::trace::TraceFormat;

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum, Debug)]
#[clap(rename_all = "verbatim")]
pub enum ModelChoice {
    /// eTLB + Hub organization.
    Etlb,
    /// Conventional two-level cache.
    Baseline,
}

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Max references to simulate counted after skip and warmup; -1 means
    /// unbounded.
    #[arg(default_value_t = -1, allow_negative_numbers = true)]
    pub n_lines: i64,

    /// References dropped from the head of the trace without simulating.
    #[arg(default_value_t = 0)]
    pub skip: u64,

    /// References simulated but excluded from counted statistics.
    #[arg(default_value_t = 0)]
    pub warmup: u64,

    #[arg(short, long, value_enum, default_value = "Etlb")]
    pub model: ModelChoice,

    #[arg(short, long, value_enum, default_value = "Hex")]
    pub format: TraceFormat,

    /// Seed for the TLB translation offset.
    #[arg(long, default_value_t = 0)]
    pub seed: u64,

    /// Read the trace from a file instead of standard input.
    #[arg(short, long)]
    pub trace: Option<String>,
}
