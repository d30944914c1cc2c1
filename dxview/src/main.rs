//! Allocate registers for a method written in the textual IR and print the result.

use clap::Parser;
use dxalloc::{ir::parser::parse_method, Config, LinearScanRegisterAllocator, RegisterAllocator};
use std::{fs, io::Read, path::PathBuf, process};

/// Allocate registers for a method and print it with its registers.
#[derive(Parser, Debug)]
#[command(about, long_about = None)]
struct Args {
    /// The method to allocate, or `-` to read it from stdin.
    method: PathBuf,

    /// The lowest VM API level the output must run on. Defaults to `DXALLOC_MIN_API`, or 1.
    #[arg(short = 'a', long)]
    min_api: Option<u32>,

    /// Keep source-level locals alive and print where each one lives.
    #[arg(short, long)]
    debug: bool,

    /// Skip the modes which keep arguments in their incoming registers.
    #[arg(short = 'r', long)]
    no_arg_reuse: bool,

    /// Print the method before allocation too.
    #[arg(short, long)]
    input: bool,
}

fn read_method(path: &PathBuf) -> Result<String, String> {
    if path.to_str() == Some("-") {
        let mut s = String::new();
        std::io::stdin()
            .read_to_string(&mut s)
            .map_err(|e| format!("stdin: {e}"))?;
        Ok(s)
    } else {
        fs::read_to_string(path).map_err(|e| format!("{}: {e}", path.display()))
    }
}

fn run(args: Args) -> Result<(), String> {
    let mut config = Config::from_env().map_err(|e| e.to_string())?;
    if let Some(x) = args.min_api {
        config.min_api_level = x;
    }
    config.debug |= args.debug;
    if args.no_arg_reuse {
        config.allow_argument_reuse = false;
    }

    let mut m = parse_method(&read_method(&args.method)?).map_err(|e| e.to_string())?;
    if args.input {
        println!("{m}");
    }
    let mut ra = LinearScanRegisterAllocator::new(&mut m, config);
    ra.allocate_registers().map_err(|e| e.to_string())?;
    print!("{}", ra.allocated());
    if let Some(mode) = ra.mode() {
        println!("mode: {mode} ({} restarts)", ra.restarts());
    }
    if let Some(moves) = ra.inserted_moves() {
        println!(
            "moves: {} spill, {} remat, {} temporaries",
            moves.spill_moves, moves.rematerializations, moves.temporaries
        );
    }
    if let Some(d) = ra.debug_info() {
        print!("{d}");
    }
    Ok(())
}

fn main() {
    let r = run(Args::parse());
    dxalloc::output_stats();
    if let Err(e) = r {
        eprintln!("{e}");
        process::exit(1);
    }
}
