//! Command-line argument parsing

use clap::{Parser, Subcommand};

/// Default length of a microphone test run
const DEFAULT_MIC_TEST_SECONDS: u64 = 10;

/// Voxlink voice client
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Enable debug logging
    #[arg(long)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// List audio input and output devices
    Devices,

    /// Loop the microphone back to the speakers and show the input level
    MicTest {
        /// Input device name (default: saved or system default)
        #[arg(short, long)]
        input: Option<String>,

        /// Output device name (default: saved or system default)
        #[arg(short, long)]
        output: Option<String>,

        /// How long to run the test
        #[arg(short, long, default_value_t = DEFAULT_MIC_TEST_SECONDS)]
        seconds: u64,
    },
}
