#[macro_use]
extern crate log;

use std::fs::File;
use std::io::{self, BufRead, BufReader};

use anyhow::Result;
use clap::Parser;

use etlb_sim::*;

pub fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();
    info!(
        "model {:?}, format {:?}, n_lines {}, skip {}, warmup {}",
        args.model, args.format, args.n_lines, args.skip, args.warmup
    );
    match &args.trace {
        Some(path) => run(BufReader::new(File::open(path)?), &args),
        None => run(io::stdin().lock(), &args),
    }
}

fn run<R: BufRead>(input: R, args: &Args) -> Result<()> {
    match args.model {
        ModelChoice::Etlb => {
            run_etlb(input, args.format, args.n_lines, args.skip, args.warmup, args.seed)?.print()
        }
        ModelChoice::Baseline => {
            run_baseline(input, args.format, args.n_lines, args.skip, args.warmup)?.print()
        }
    }
    Ok(())
}
