/*!
# Hantek Bridge

Network bridge for Hantek 6xx4-series USB oscilloscopes. The instrument is
brought up over USB and exposed through two TCP sockets:

- a line-oriented control socket (default port 5025) for settings queries
  and changes
- a binary waveform socket (default port 5026) streaming calibrated 4-channel
  captures back to back

## Usage

### Serve (default)
```bash
hantek-bridge serve --bind-addr 0.0.0.0
```

### Serve without hardware
```bash
hantek-bridge serve --simulate
```

### Print capture summaries
```bash
hantek-bridge capture --count 10
```
*/

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Local;
use clap::{ArgAction, Parser, Subcommand};
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

mod config;
mod control_server;
mod controller;
mod device;
mod net;
mod stream_server;

use config::AppConfig;
use control_server::ControlServer;
use controller::AcquisitionController;
use device::{DeviceLink, SimulatedLink, UsbLink};
use stream_server::StreamServer;

#[derive(Parser)]
#[command(name = "hantek-bridge")]
#[command(about = "Serve a Hantek 6xx4 USB oscilloscope over control and waveform sockets")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Configuration file path
    #[arg(short, long, default_value = "hantek-bridge.toml")]
    config: PathBuf,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the control and waveform servers
    Serve {
        /// Bind address for both sockets
        #[arg(short, long)]
        bind_addr: Option<String>,

        /// Control protocol port
        #[arg(long)]
        control_port: Option<u16>,

        /// Waveform stream port
        #[arg(long)]
        waveform_port: Option<u16>,

        /// Use a synthetic instrument instead of USB hardware
        #[arg(long)]
        simulate: bool,
    },

    /// Capture directly and print one JSON summary line per capture
    Capture {
        /// Number of captures
        #[arg(short = 'n', long, default_value = "1")]
        count: u64,

        /// Use a synthetic instrument instead of USB hardware
        #[arg(long)]
        simulate: bool,
    },

    /// Generate configuration file
    Config {
        /// Output path for configuration file
        #[arg(short, long, default_value = "hantek-bridge.toml")]
        output: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Logs go to stderr to keep stdout clean for capture summaries
    let default_level = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
        .init();

    let command = cli.command.unwrap_or(Commands::Serve {
        bind_addr: None,
        control_port: None,
        waveform_port: None,
        simulate: false,
    });

    match command {
        Commands::Serve {
            bind_addr,
            control_port,
            waveform_port,
            simulate,
        } => {
            let mut config = AppConfig::load_or_default(&cli.config)?;
            if let Some(bind_addr) = bind_addr {
                config.server.bind_addr = bind_addr;
            }
            if let Some(port) = control_port {
                config.server.control_port = port;
            }
            if let Some(port) = waveform_port {
                config.server.waveform_port = port;
            }
            config.device.simulate |= simulate;
            run_servers(config).await
        }

        Commands::Capture { count, simulate } => {
            let mut config = AppConfig::load_or_default(&cli.config)?;
            config.device.simulate |= simulate;
            tokio::task::spawn_blocking(move || run_capture(config, count)).await?
        }

        Commands::Config { output } => generate_config_file(output),
    }
}

/// Open the configured device link
fn open_link(config: &AppConfig) -> Result<Box<dyn DeviceLink>> {
    if config.device.simulate {
        info!("🧪 Using simulated instrument");
        return Ok(Box::new(SimulatedLink::synthetic()));
    }

    let link = UsbLink::open(
        config.device.vendor_id,
        config.device.product_id,
        config.device.bulk_timeout(),
    )
    .context("Failed to open instrument")?;
    Ok(Box::new(link))
}

/// Open, bring up and configure the instrument
fn start_controller(config: &AppConfig) -> Result<AcquisitionController> {
    let link = open_link(config)?;
    let controller = AcquisitionController::new(link, config.device.controller_options());
    controller
        .configure(config.acquisition)
        .context("Invalid acquisition settings in configuration")?;
    controller.initialize().context("Instrument bring-up failed")?;
    Ok(controller)
}

/// Run both servers until Ctrl+C
async fn run_servers(config: AppConfig) -> Result<()> {
    info!(
        "🚀 Opening server {}:c{}:w{}",
        config.server.bind_addr, config.server.control_port, config.server.waveform_port
    );

    let controller = {
        let config = config.clone();
        tokio::task::spawn_blocking(move || start_controller(&config)).await??
    };
    let controller = Arc::new(controller);

    let control_listener = net::bind_listener(net::resolve(&config.server.bind_addr, config.server.control_port)?)?;
    let waveform_listener = net::bind_listener(net::resolve(&config.server.bind_addr, config.server.waveform_port)?)?;

    // Set up Ctrl+C handler
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    ctrlc::set_handler(move || {
        info!("🛑 Received Ctrl+C, shutting down...");
        let _ = shutdown_tx.send(true);
    })?;

    let control = tokio::spawn(
        ControlServer::new(control_listener, Arc::clone(&controller)).run(shutdown_rx.clone()),
    );
    let waveform = tokio::spawn(StreamServer::new(waveform_listener, controller).run(shutdown_rx));

    let (control_result, waveform_result) = tokio::join!(control, waveform);
    if let Err(e) = control_result? {
        error!("Control server failed: {}", e);
    }
    if let Err(e) = waveform_result? {
        error!("Waveform server failed: {}", e);
    }

    info!("✅ Server closed");
    Ok(())
}

/// Capture `count` times and print a summary of each capture to stdout
fn run_capture(config: AppConfig, count: u64) -> Result<()> {
    let controller = start_controller(&config)?;

    for index in 0..count {
        let capture = controller
            .acquire()
            .with_context(|| format!("Capture {} failed", index))?;

        let channels: Vec<serde_json::Value> = capture
            .channels
            .iter()
            .map(|channel| {
                let min = channel.samples.iter().copied().min().unwrap_or(0);
                let max = channel.samples.iter().copied().max().unwrap_or(0);
                serde_json::json!({
                    "index": channel.index,
                    "samples": channel.samples.len(),
                    "scale": channel.scale,
                    "offset": channel.offset,
                    "raw_min": channel.raw_value(min),
                    "raw_max": channel.raw_value(max),
                })
            })
            .collect();

        let summary = serde_json::json!({
            "timestamp": Local::now().to_rfc3339(),
            "capture": index,
            "sample_rate_hz": capture.settings.sample_rate_hz,
            "fs_per_sample": capture.settings.femtoseconds_per_sample(),
            "channels": channels,
        });
        println!("{}", summary);
    }

    Ok(())
}

/// Generate a default configuration file
fn generate_config_file(output_path: PathBuf) -> Result<()> {
    let config = AppConfig::new();
    config.save_to_file(&output_path)?;

    println!("✅ Generated configuration file: {}", output_path.display());
    println!("📝 Edit the file to customize settings, then run:");
    println!("   hantek-bridge --config {} serve", output_path.display());

    Ok(())
}
