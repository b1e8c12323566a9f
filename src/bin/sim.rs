//! Shared-medium access control demo.
//!
//! Spawns N producers and one consumer around a capacity-1 medium lock
//! and a shared record channel, waits for the full exchange, and prints a
//! summary. Build with `--features tracing` and set `RUST_LOG=aether=debug`
//! to watch the contention unfold.
//!
//! # Usage
//!
//! ```sh
//! aether-sim --senders 2 --iters 5 --wait-min 1 --wait-max 5
//! ```

use std::time::Duration;

use aether::runtime::{self, Config};

fn main() {
    aether::trace::init_tracing();

    let args: Vec<String> = std::env::args().collect();
    let config = match parse_args(&args) {
        Ok(config) => config,
        Err(msg) => {
            eprintln!("aether-sim: {msg}");
            print_usage();
            std::process::exit(2);
        }
    };

    eprintln!(
        "aether-sim: starting {} sender(s) x {} iteration(s)",
        config.senders, config.iters
    );

    let report = match runtime::run(config) {
        Ok(report) => report,
        Err(err) => {
            eprintln!("aether-sim: {err}");
            std::process::exit(1);
        }
    };

    eprintln!(
        "aether-sim: delivered {}/{} record(s)",
        report.records.len(),
        report.expected
    );
    for stats in &report.producers {
        eprintln!(
            "aether-sim: sender {} sent {} (timeouts {}, send failures {}, release failures {})",
            stats.id, stats.sent, stats.timeouts, stats.send_failures, stats.release_failures
        );
    }

    if !report.complete() || report.class_mismatches > 0 {
        std::process::exit(1);
    }
}

/// Parses command line arguments on top of the default configuration.
fn parse_args(args: &[String]) -> Result<Config, String> {
    let mut config = Config::default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--senders" | "-s" => {
                config.senders = parse_value(args, &mut i, "--senders")?;
            }
            "--iters" | "-n" => {
                config.iters = parse_value(args, &mut i, "--iters")?;
            }
            "--wait-min" => {
                config.wait_min = Duration::from_secs(parse_value(args, &mut i, "--wait-min")?);
            }
            "--wait-max" => {
                config.wait_max = Duration::from_secs(parse_value(args, &mut i, "--wait-max")?);
            }
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            arg => return Err(format!("unknown argument: {arg}")),
        }
        i += 1;
    }

    Ok(config)
}

fn parse_value<T: std::str::FromStr>(
    args: &[String],
    i: &mut usize,
    flag: &str,
) -> Result<T, String> {
    *i += 1;
    let Some(raw) = args.get(*i) else {
        return Err(format!("missing value for {flag}"));
    };
    raw.parse()
        .map_err(|_| format!("invalid value for {flag}: {raw}"))
}

fn print_usage() {
    eprintln!(
        r#"aether-sim - shared-medium access control demo

USAGE:
    aether-sim [OPTIONS]

OPTIONS:
    -s, --senders <N>     Number of producer tasks (default: 2)
    -n, --iters <N>       Records each producer sends (default: 5)
        --wait-min <SECS> Minimum randomized lock wait (default: 1)
        --wait-max <SECS> Maximum randomized lock wait (default: 5)
    -h, --help            Print this help message

EXAMPLE:
    aether-sim --senders 3 --iters 4 --wait-max 2
"#
    );
}
