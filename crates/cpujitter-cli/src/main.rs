//! CLI for the cpujitter RNG: conditioned byte generation plus the offline
//! tools (raw-noise recorder, timer divisor estimator, startup self-test).

mod commands;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "cpujitter")]
#[command(about = "CPU execution-timing jitter random number generator")]
#[command(version = cpujitter_core::VERSION)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate conditioned random bytes
    Generate {
        /// Number of bytes
        #[arg(long, default_value = "32")]
        bytes: usize,

        /// Output format
        #[arg(long, default_value = "hex", value_parser = ["hex", "raw"])]
        format: String,

        /// Oversampling rate (0 = default)
        #[arg(long, default_value = "0")]
        osr: u32,

        /// Skip the memory-access workload (lower entropy rate)
        #[arg(long)]
        no_memory: bool,

        /// Write to a file instead of stdout
        #[arg(long)]
        output: Option<String>,
    },

    /// Record raw, unnormalized timing deltas for offline assessment
    Record {
        /// Number of deltas to record
        #[arg(long, default_value = "100000")]
        samples: usize,

        /// Output file, one little-endian u64 per delta
        #[arg(long, default_value = "raw-deltas.bin")]
        output: String,

        /// Oversampling rate used for the collector (0 = default)
        #[arg(long, default_value = "0")]
        osr: u32,

        /// Record with the strided block workload instead of random access
        #[arg(long)]
        blockwise: bool,
    },

    /// Estimate the common divisor of the timer's deltas
    Gcd {
        /// Number of deltas to sample
        #[arg(long, default_value = "1000")]
        samples: usize,
    },

    /// Run the startup self-test and print the acceptance report
    Selftest {
        /// Oversampling rate (0 = default)
        #[arg(long, default_value = "0")]
        osr: u32,

        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },
}

fn main() {
    let cli = Cli::parse();

    match cli.command {
        Commands::Generate {
            bytes,
            format,
            osr,
            no_memory,
            output,
        } => commands::generate::run(bytes, &format, osr, no_memory, output.as_deref()),
        Commands::Record {
            samples,
            output,
            osr,
            blockwise,
        } => commands::record::run(samples, &output, osr, blockwise),
        Commands::Gcd { samples } => commands::gcd::run(samples),
        Commands::Selftest { osr, json } => commands::selftest::run(osr, json),
    }
}
