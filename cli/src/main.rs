//! nandemu CLI - system-test harness for the NAND device emulator
//!
//! # Usage
//! ```bash
//! nandemu test                      # Deterministic write/read/erase test
//! nandemu stress --seed 7 --ops 64  # Seeded stochastic run vs the mirror
//! nandemu info                      # Geometry and DIB report
//! nandemu wait-check                # Driver wait/timeout behavior check
//! ```

use clap::{Parser, Subcommand, ValueEnum};
use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};

mod commands;

/// nandemu - NAND flash device emulator and access-framework harness
#[derive(Parser)]
#[command(name = "nandemu")]
#[command(version = "1.2.0")]
#[command(about = "Exercise the emulated NAND chip through the access framework")]
#[command(long_about = None)]
struct Cli {
    /// Output format (text, json)
    #[arg(short = 'f', long, default_value = "text", global = true)]
    format: String,

    /// Verbose output (enables debug logging)
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Quiet mode (minimal output)
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Driver surface to exercise
    #[arg(short, long, value_enum, default_value = "jump-table", global = true)]
    driver: DriverKind,

    #[command(subcommand)]
    command: Commands,
}

/// The two driver surfaces the framework can dispatch over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum DriverKind {
    /// Record of four register-level operations
    JumpTable,
    /// Single exec-op instruction interpreter
    ExecOp,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the deterministic write/read/erase system test
    Test {
        /// Number of bytes to store and retrieve
        #[arg(short, long, default_value_t = 300)]
        size: usize,

        /// Device offset to test at (hex or decimal)
        #[arg(short, long, default_value = "0")]
        offset: String,
    },

    /// Run a seeded stochastic test, checking every read against the
    /// mirror oracle
    Stress {
        /// RNG seed
        #[arg(short, long, default_value_t = 1)]
        seed: u64,

        /// Number of operations to run
        #[arg(short, long, default_value_t = 64)]
        ops: usize,

        /// Largest single operation in bytes
        #[arg(long, default_value_t = 1024)]
        max_op_size: usize,
    },

    /// Show device geometry and the registered device information base
    Info,

    /// Check driver wait behavior against a perpetually-busy device
    WaitCheck {
        /// Wait timeout in microseconds
        #[arg(short, long, default_value_t = 1_000_000)]
        timeout_us: u64,
    },
}

fn main() {
    let cli = Cli::parse();

    let mut builder = env_logger::Builder::from_default_env();
    if cli.verbose {
        builder.filter_level(log::LevelFilter::Debug);
    }
    builder.init();

    if !cli.quiet {
        print_banner();
    }

    let result = match &cli.command {
        Commands::Test { size, offset } => commands::test(&cli, *size, offset),
        Commands::Stress {
            seed,
            ops,
            max_op_size,
        } => commands::stress(&cli, *seed, *ops, *max_op_size),
        Commands::Info => commands::info(&cli),
        Commands::WaitCheck { timeout_us } => commands::wait_check(&cli, *timeout_us),
    };

    if let Err(e) = result {
        if !cli.quiet {
            eprintln!("{} {}", "Error:".red().bold(), e);
        }
        std::process::exit(1);
    }
}

fn print_banner() {
    println!(
        "{}",
        "nandemu v1.2.0 - emulated NAND system-test harness".cyan()
    );
}

/// Create a progress bar with nandemu style
pub fn create_progress_bar(total: u64, message: &str) -> ProgressBar {
    let pb = ProgressBar::new(total);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
            .unwrap()
            .progress_chars("█▓▒░"),
    );
    pb.set_message(message.to_string());
    pb
}

/// Parse address string (supports hex 0x prefix)
pub fn parse_address(s: &str) -> Result<u64, String> {
    if s.starts_with("0x") || s.starts_with("0X") {
        u64::from_str_radix(&s[2..], 16).map_err(|e| e.to_string())
    } else {
        s.parse().map_err(|e: std::num::ParseIntError| e.to_string())
    }
}

/// Format bytes as human-readable size
pub fn format_size(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}
