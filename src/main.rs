//! hidbridge - Intent commands to HID reports
//!
//! Presents a virtual keyboard and mouse to a host and drives it from a
//! line-based TCP command protocol.

mod command;
mod config;
mod hid;
mod network;
mod planner;
mod session;
mod transport;

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use config::{BackendKind, Config, TimingConfig};
use hid::{descriptor, DescriptorLayout, ReportCodec, ReportKind};
use network::{BridgeClient, CommandListener};
use planner::Planner;
use session::SessionManager;

/// hidbridge - virtual HID keyboard and mouse bridge
#[derive(Parser)]
#[command(name = "hidbridge")]
#[command(author = "hidbridge Contributors")]
#[command(version = "0.1.0")]
#[command(about = "Turn high-level input commands into HID keyboard and mouse reports", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the bridge: session loop plus command listener
    Serve {
        /// Transport backend (uinput, bluetooth, uhid, gadget, dry-run)
        #[arg(short, long, value_parser = BackendKind::from_str)]
        backend: Option<BackendKind>,

        /// Port to listen on
        #[arg(short, long)]
        port: Option<u16>,

        /// Address to listen on
        #[arg(long)]
        bind: Option<String>,

        /// Descriptor layout (combo, separate)
        #[arg(short, long, value_parser = parse_layout)]
        layout: Option<DescriptorLayout>,

        /// Timing preset (ios, gadget, fast)
        #[arg(long)]
        profile: Option<String>,
    },

    /// Send commands to a running bridge
    Send {
        /// Bridge host
        #[arg(long)]
        host: Option<String>,

        /// Bridge port
        #[arg(short, long)]
        port: Option<u16>,

        /// Keep retrying the connection for this many seconds
        #[arg(short, long, default_value_t = 0.0)]
        wait: f64,

        /// Command lines, e.g. "TAP 0.5 0.5"
        #[arg(required = true)]
        commands: Vec<String>,
    },

    /// Print the HID report descriptor
    Descriptor {
        /// Descriptor layout (combo, separate)
        #[arg(short, long, value_parser = parse_layout)]
        layout: Option<DescriptorLayout>,

        /// Print the Bluetooth SDP service record instead
        #[arg(long)]
        sdp: bool,
    },

    /// Show current configuration
    Config {
        /// Generate sample configuration
        #[arg(long)]
        generate: bool,

        /// Output path for generated config
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Show which backends can run on this machine
    Info,
}

fn parse_layout(s: &str) -> Result<DescriptorLayout, String> {
    match s.to_ascii_lowercase().as_str() {
        "combo" => Ok(DescriptorLayout::Combo),
        "separate" => Ok(DescriptorLayout::Separate),
        other => Err(format!("unknown layout '{}' (expected combo or separate)", other)),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let config = if let Some(config_path) = &cli.config {
        Config::load(config_path)?
    } else {
        Config::load_default()?
    };

    // Initialize logging
    let level = if cli.verbose || config.general.verbose {
        "debug"
    } else {
        "info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    match cli.command {
        Commands::Serve {
            backend,
            port,
            bind,
            layout,
            profile,
        } => {
            let mut config = config;
            if let Some(backend) = backend {
                config.transport.backend = backend;
            }
            if let Some(port) = port {
                config.listener.port = port;
            }
            if let Some(bind) = bind {
                config.listener.bind_address = bind;
            }
            if let Some(layout) = layout {
                config.hid.layout = layout;
            }
            if let Some(profile) = profile {
                config.timing = TimingConfig::preset(&profile)?;
            }
            run_serve(config).await?;
        }
        Commands::Send {
            host,
            port,
            wait,
            commands,
        } => {
            let host = host.unwrap_or_else(|| config.listener.bind_address.clone());
            let port = port.unwrap_or(config.listener.port);
            run_send(&host, port, wait, &commands).await?;
        }
        Commands::Descriptor { layout, sdp } => {
            print_descriptor(&config, layout.unwrap_or(config.hid.layout), sdp);
        }
        Commands::Config { generate, output } => {
            if generate {
                if let Some(path) = output {
                    config::sample_config().save(&path)?;
                    println!("Configuration written to: {}", path.display());
                } else {
                    println!("{}", config::generate_sample_config()?);
                }
            } else {
                println!("{}", toml::to_string_pretty(&config)?);
            }
        }
        Commands::Info => {
            print_system_info(&config);
        }
    }

    Ok(())
}

/// Run the bridge until Ctrl+C
async fn run_serve(config: Config) -> anyhow::Result<()> {
    config.validate()?;

    let transport = transport::create_transport(&config)?;
    let planner = Planner::new(config.timing.clone(), config.hid.combo_modifier_bits()?);
    let codec = ReportCodec::new(config.hid.layout);

    let (mut manager, handle) = SessionManager::new(
        transport,
        planner,
        codec,
        Duration::from_millis(config.session.reconnect_delay_ms),
    );
    manager
        .open()
        .await
        .with_context(|| format!("Failed to open {} backend", config.transport.backend))?;

    let listener = CommandListener::bind(&config.listener).await?;

    tracing::info!(
        "Starting hidbridge: backend {}, layout {}, listening on {}",
        config.transport.backend,
        config.hid.layout,
        listener.local_addr()?
    );
    println!("Press Ctrl+C to stop.");

    let observer_task = tokio::spawn(log_state_changes(handle.subscribe()));
    let mut session_task = tokio::spawn(manager.run());
    let mut listener_task = tokio::spawn(listener.run(handle.clone()));

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            println!("\nShutting down...");
        }
        result = &mut listener_task => {
            tracing::error!("Command listener stopped: {:?}", result);
        }
        result = &mut session_task => {
            listener_task.abort();
            observer_task.abort();
            return session_exit(result);
        }
    }

    listener_task.abort();
    if let Err(e) = handle.shutdown().await {
        tracing::warn!("Shutdown request failed: {}", e);
    }
    session_task.await??;
    observer_task.abort();
    tracing::info!("hidbridge stopped ({})", handle.state());

    Ok(())
}

/// Session loop ended without a shutdown request
fn session_exit(
    result: Result<Result<(), session::SessionError>, tokio::task::JoinError>,
) -> anyhow::Result<()> {
    result
        .context("Session loop panicked")?
        .context("Session loop failed")?;
    anyhow::bail!("Session loop stopped unexpectedly")
}

/// Log every session state transition
async fn log_state_changes(mut states: tokio::sync::watch::Receiver<session::SessionState>) {
    while states.changed().await.is_ok() {
        let state = states.borrow_and_update().clone();
        tracing::info!("Session {}", state);
    }
}

/// Send command lines to a running bridge
async fn run_send(host: &str, port: u16, wait: f64, commands: &[String]) -> anyhow::Result<()> {
    let wait = Duration::try_from_secs_f64(wait).context("--wait must be a non-negative number")?;
    let mut client = BridgeClient::connect(host, port, wait).await?;

    for line in commands {
        if let Some(reply) = client.send(line).await? {
            println!("{}", reply);
        }
    }

    client.close().await?;
    Ok(())
}

/// Print descriptors in hex, or the SDP record
fn print_descriptor(config: &Config, layout: DescriptorLayout, sdp: bool) {
    if sdp {
        println!(
            "{}",
            descriptor::sdp_record(&config.hid.device_name, descriptor::COMBO, descriptor::SUBCLASS_COMBO)
        );
        return;
    }

    let kinds: &[ReportKind] = if layout.is_multiplexed() {
        &[ReportKind::Keyboard]
    } else {
        &[ReportKind::Keyboard, ReportKind::Mouse]
    };

    for &kind in kinds {
        let bytes = layout.descriptor(kind);
        let label = if layout.is_multiplexed() {
            "combo".to_string()
        } else {
            kind.to_string()
        };
        println!("{} ({} bytes):", label, bytes.len());
        println!("  {}", descriptor::to_hex(bytes));
        for (report_id, bits) in descriptor::input_report_bits(bytes) {
            match report_id {
                Some(id) => println!("  input report {}: {} bytes", id, bits / 8),
                None => println!("  input report: {} bytes", bits / 8),
            }
        }
    }

    let key_a = hid::encode_keyboard_report(0, hid::keycodes::KEY_A, layout.report_id(ReportKind::Keyboard));
    let left_click = hid::encode_mouse_report(
        hid::MouseButtons::LEFT.bits(),
        0,
        0,
        0,
        layout.report_id(ReportKind::Mouse),
    );
    println!("example frames:");
    println!("  key 'a'     {}", descriptor::to_hex(&key_a));
    println!("  left button {}", descriptor::to_hex(&left_click));
}

/// Print backend availability
fn print_system_info(config: &Config) {
    println!("hidbridge System Information");
    println!("============================\n");

    println!("Platform: {}", std::env::consts::OS);
    println!("Configured backend: {}", config.transport.backend);
    println!("Layout: {}\n", config.hid.layout);

    for kind in BackendKind::ALL {
        match transport::availability(kind, config) {
            transport::Availability::Ready(detail) => println!("  {:<10} ready    {}", kind, detail),
            transport::Availability::Missing(detail) => println!("  {:<10} missing  {}", kind, detail),
        }
    }

    #[cfg(target_os = "linux")]
    {
        println!("\nLinux Requirements:");
        println!("  - uinput module must be loaded: sudo modprobe uinput");
        println!("  - uhid module must be loaded: sudo modprobe uhid");
        println!("  - Bluetooth HID needs the input plugin disabled in bluetoothd");
    }

    println!("\nNamed keys: {}", hid::KeyMap::names().collect::<Vec<_>>().join(", "));
    println!("Default Port: {}", config::DEFAULT_PORT);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parsing() {
        let cli = Cli::try_parse_from(["hidbridge", "info"]);
        assert!(cli.is_ok());

        let cli = Cli::try_parse_from([
            "hidbridge", "serve", "--backend", "dry-run", "--layout", "separate", "--port", "6000",
        ])
        .unwrap();
        match cli.command {
            Commands::Serve {
                backend, layout, port, ..
            } => {
                assert_eq!(backend, Some(BackendKind::DryRun));
                assert_eq!(layout, Some(DescriptorLayout::Separate));
                assert_eq!(port, Some(6000));
            }
            _ => panic!("expected serve"),
        }

        assert!(Cli::try_parse_from(["hidbridge", "serve", "--backend", "usb"]).is_err());
        assert!(Cli::try_parse_from(["hidbridge", "send"]).is_err());
    }

    #[tokio::test]
    async fn test_session_exit_is_an_error() {
        let stopped = session_exit(Ok(Ok(()))).unwrap_err();
        assert!(stopped.to_string().contains("stopped unexpectedly"));

        let failed = session_exit(Ok(Err(session::SessionError::Closed))).unwrap_err();
        assert!(failed.to_string().contains("Session loop failed"));

        let join_error = tokio::spawn(async { panic!("boom") }).await.unwrap_err();
        let panicked = session_exit(Err(join_error)).unwrap_err();
        assert!(panicked.to_string().contains("panicked"));
    }

    #[test]
    fn test_send_collects_commands() {
        let cli = Cli::try_parse_from(["hidbridge", "send", "--wait", "2", "PING", "TYPE hi"]).unwrap();
        match cli.command {
            Commands::Send { commands, wait, .. } => {
                assert_eq!(commands, vec!["PING".to_string(), "TYPE hi".to_string()]);
                assert_eq!(wait, 2.0);
            }
            _ => panic!("expected send"),
        }
    }
}
