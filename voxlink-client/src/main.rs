//! Voxlink voice client

mod args;

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::time::{Instant, interval};
use tracing::{Level, warn};
use tracing_subscriber::EnvFilter;

use args::{Args, Command};
use voxlink_client::config::JsonConfigStore;
use voxlink_client::session::DeviceSelection;
use voxlink_client::transport::LogReporter;
use voxlink_client::voice::audio::{AudioBackend, AudioDevice, CpalBackend};
use voxlink_client::voice::mic_test::MicTestEngine;

/// How often the mic test prints the input level
const LEVEL_PRINT_INTERVAL: Duration = Duration::from_millis(100);

/// Width of the printed level meter
const METER_WIDTH: usize = 40;

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let log_level = if args.debug { Level::DEBUG } else { Level::INFO };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(log_level.into()))
        .init();

    let backend: Arc<dyn AudioBackend> = Arc::new(CpalBackend::new());

    match args.command {
        Command::Devices => print_devices(backend.as_ref()),
        Command::MicTest {
            input,
            output,
            seconds,
        } => {
            if !run_mic_test(backend, input, output, Duration::from_secs(seconds)).await {
                std::process::exit(1);
            }
        }
    }
}

/// Print both device lists, marking the defaults
fn print_devices(backend: &dyn AudioBackend) {
    print_device_list("Input devices", &backend.list_input_devices());
    println!();
    print_device_list("Output devices", &backend.list_output_devices());
}

fn print_device_list(title: &str, devices: &[AudioDevice]) {
    println!("{}:", title);
    if devices.is_empty() {
        println!("  (none)");
        return;
    }
    for device in devices {
        let marker = if device.is_default { " (default)" } else { "" };
        println!("  {}{}", device.name, marker);
    }
}

/// Run the loopback test, printing a level meter; returns false on failure
async fn run_mic_test(
    backend: Arc<dyn AudioBackend>,
    input: Option<String>,
    output: Option<String>,
    length: Duration,
) -> bool {
    let saved = match JsonConfigStore::open_default() {
        Ok(store) => DeviceSelection::resolve(backend.as_ref(), &store),
        Err(e) => {
            warn!("{}", e);
            DeviceSelection::default()
        }
    };
    let input = input.or(saved.input);
    let output = output.or(saved.output);

    let mut engine = MicTestEngine::new(backend, Arc::new(LogReporter));
    if let Err(e) = engine.start(input.as_deref(), output.as_deref()).await {
        eprintln!("Mic test failed: {}", e);
        return false;
    }

    println!(
        "Testing {} -> {} for {}s (Ctrl+C to stop)",
        input.as_deref().unwrap_or("default"),
        output.as_deref().unwrap_or("default"),
        length.as_secs()
    );

    let deadline = Instant::now() + length;
    let mut ticker = interval(LEVEL_PRINT_INTERVAL);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if !engine.is_running() || Instant::now() >= deadline {
                    break;
                }
                let filled = (engine.level() * METER_WIDTH as f32).round() as usize;
                print!(
                    "\r[{}{}]",
                    "#".repeat(filled),
                    " ".repeat(METER_WIDTH.saturating_sub(filled))
                );
                let _ = std::io::stdout().flush();
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }
    println!();

    let ended_early = !engine.is_running();
    engine.stop().await;
    if ended_early {
        eprintln!("Mic test ended early; see log for details");
    }
    !ended_early
}
