#![warn(clippy::pedantic)]
use std::io::Write;

use clap::Parser;
use log::{error, info, warn};
use shared_memory_segment::{Limits, Permissions};
use shmtest::{interrupt, parse_size, Prompts, Session, SystemV, Tokens};

/// Exit status when `--limits` cannot read the kernel limits.
const LIMITS_UNAVAILABLE: i32 = 6;
/// Exit status for invalid arguments (`EX_USAGE`).
const USAGE: i32 = 64;

/// Allocates, attaches, then releases a shared memory segment of the size you enter.
#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// Segment size in bytes, skips the first prompt. Negative sizes wrap, `-1` is the largest.
    #[clap(short, long, value_parser = parse_size, allow_hyphen_values = true)]
    size: Option<usize>,
    /// Segment permissions in octal.
    #[clap(short, long, value_parser = parse_mode, default_value = "666")]
    mode: Permissions,
    /// Write the whole segment once attached, so the kernel has to back it.
    ///
    /// The segment is marked for removal first, so it is freed even if the process is killed.
    #[clap(short, long, action)]
    touch: bool,
    /// Print the kernel's shared memory limits and exit.
    #[clap(long, action)]
    limits: bool,
    /// Log level, logs go to stderr.
    #[clap(short, long, value_parser = parse_level, default_value = "Warn")]
    log: log::Level,
    /// Prompt for the segment size.
    #[clap(long, value_parser, default_value = shmtest::SIZE_PROMPT)]
    prompt: String,
    /// Prompt for the signal to release the segment.
    #[clap(long, value_parser, default_value = shmtest::CONTINUE_PROMPT)]
    continue_prompt: String,
}

fn parse_mode(s: &str) -> Result<Permissions, String> {
    match u32::from_str_radix(s.trim_start_matches("0o"), 8) {
        Ok(mode) if mode <= 0o777 => Ok(Permissions::from_mode(mode)),
        _ => Err(format!("{s:?} is not an octal mode between 000 and 777")),
    }
}

fn parse_level(s: &str) -> Result<log::Level, String> {
    s.parse()
        .map_err(|_| format!("{s:?} is not one of Error, Warn, Info, Debug or Trace"))
}

fn print_limits() -> i32 {
    let limits = match Limits::read() {
        Ok(limits) => limits,
        Err(err) => {
            error!("{}", err);
            return LIMITS_UNAVAILABLE;
        }
    };
    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    let res = writeln!(out, "shmmax: {} bytes", limits.max_segment_size)
        .and_then(|()| writeln!(out, "shmall: {} pages", limits.max_total_pages))
        .and_then(|()| writeln!(out, "shmmni: {} segments", limits.max_segments));
    match res {
        Ok(()) => 0,
        Err(err) => {
            error!("Failed to write output: {}", err);
            LIMITS_UNAVAILABLE
        }
    }
}

fn run(args: Args) -> i32 {
    if args.limits {
        return print_limits();
    }
    if let Err(err) = interrupt::install() {
        warn!("Failed to install interrupt handler: {}", err);
    }

    let prompts = Prompts {
        size: args.prompt,
        proceed: args.continue_prompt,
    };
    let session = Session::new(SystemV, prompts)
        .permissions(args.mode)
        .touch(args.touch);

    let stdin = std::io::stdin();
    let mut input = Tokens::new(stdin.lock());
    let stdout = std::io::stdout();
    let mut output = stdout.lock();
    match session.run(&mut input, &mut output, args.size) {
        Ok(report) => {
            info!("released {} bytes on shmid {}", report.size, report.id);
            0
        }
        Err(err) => {
            error!("{}", err);
            err.exit_code()
        }
    }
}

fn main() {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(err) => {
            let _ = err.print();
            std::process::exit(if err.use_stderr() { USAGE } else { 0 });
        }
    };
    if let Err(err) = simple_logger::init_with_level(args.log) {
        eprintln!("Failed to initialize logger: {err}");
    }
    info!("started");
    // Everything holding a segment has been dropped by the time `run` returns.
    std::process::exit(run(args));
}
