//! CLI entrypoint for the heapscope post-mortem tools and launcher.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};

use heapscope_harness::{heapdiff, leaks, profdump, runner, tracedump};

/// Debugging-allocator tooling: run a target under heapscope, then inspect
/// its log, profile and trace streams.
#[derive(Debug, Parser)]
#[command(name = "heapscope")]
#[command(about = "Launcher and post-mortem tools for the heapscope debugging allocator")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Launch a target process under a heapscope options string.
    Run {
        /// Raw option tokens, e.g. "LOGALL OFLOWSIZE=8".
        #[arg(long)]
        options: Option<String>,
        /// Route the log to this file (`%p`, `%n`, ... substitutions apply).
        #[arg(long)]
        log_file: Option<String>,
        /// Enable profiling.
        #[arg(long)]
        prof: bool,
        /// Enable tracing.
        #[arg(long)]
        trace: bool,
        /// List unfreed allocations at exit.
        #[arg(long)]
        show_unfreed: bool,
        /// Target command and its arguments.
        #[arg(trailing_var_arg = true, allow_hyphen_values = true, required = true)]
        command: Vec<String>,
    },
    /// Report unfreed allocations from a heapscope log.
    Leaks {
        /// Log file path.
        log: PathBuf,
        /// Emit JSON instead of the text table.
        #[arg(long)]
        json: bool,
    },
    /// Decode a binary profile stream.
    Prof {
        /// Profile file path.
        file: PathBuf,
        /// Emit JSON instead of the text table.
        #[arg(long)]
        json: bool,
    },
    /// Replay a binary trace stream.
    Trace {
        /// Trace file path.
        file: PathBuf,
        /// Emit JSON instead of the text summary.
        #[arg(long)]
        json: bool,
        /// List every event, not just the summary.
        #[arg(long)]
        events: bool,
    },
    /// Compare the unfreed sets of two logs by call site.
    Diff {
        /// Baseline log file.
        before: PathBuf,
        /// Changed log file.
        after: PathBuf,
        /// Emit JSON instead of the text report.
        #[arg(long)]
        json: bool,
    },
}

fn main() -> ExitCode {
    match run(Cli::parse()) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("heapscope: {err}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<ExitCode, Box<dyn std::error::Error>> {
    match cli.command {
        Command::Run {
            options,
            log_file,
            prof,
            trace,
            show_unfreed,
            command,
        } => {
            let mut spec = runner::LaunchSpec::new(&command[0]);
            for arg in &command[1..] {
                spec = spec.arg(arg);
            }
            if let Some(tokens) = options {
                for token in tokens.split_whitespace() {
                    spec = spec.option(token);
                }
            }
            if let Some(file) = log_file {
                spec = spec.option(format!("LOGFILE={file}"));
            }
            if prof {
                spec = spec.option("PROF");
            }
            if trace {
                spec = spec.option("TRACE");
            }
            if show_unfreed {
                spec = spec.option("SHOWUNFREED");
            }
            let code = runner::launch(&spec)?;
            Ok(ExitCode::from(code.clamp(0, 255) as u8))
        }
        Command::Leaks { log, json } => {
            let report = leaks::check_file(&log)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print!("{}", leaks::render(&report));
            }
            Ok(exit_for(report.leaks.is_empty()))
        }
        Command::Prof { file, json } => {
            let report = profdump::read_file(&file)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print!("{}", profdump::render(&report));
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::Trace { file, json, events } => {
            let report = tracedump::read_file(&file)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print!("{}", tracedump::render(&report, events));
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::Diff { before, after, json } => {
            let report = heapdiff::diff_files(&before, &after)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print!("{}", heapdiff::render(&report));
            }
            Ok(exit_for(
                report.appeared.is_empty() && report.changed.is_empty(),
            ))
        }
    }
}

fn exit_for(clean: bool) -> ExitCode {
    if clean {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}
