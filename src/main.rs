//! hap-rs demo - a bridge exposing one dimmable, tunable lightbulb.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use hap_accessory::{types, write_fn, Accessory, AdaptiveLightingController, CharValue};
use hap_core::category::Category;
use hap_core::hap_type;
use hap_discovery::MdnsAdvertiser;
use hap_server::{HapServer, ServerConfig, ServerEvent, DEFAULT_PORT};
use hap_storage::FileStorage;
use tracing::{info, warn};

/// Command-line arguments
struct Args {
    /// Enable debug logging
    debug: bool,
    /// Directory for pairing data
    storage: PathBuf,
    port: u16,
    username: String,
    pincode: String,
}

impl Default for Args {
    fn default() -> Self {
        Self {
            debug: false,
            storage: PathBuf::from("hap-storage"),
            port: DEFAULT_PORT,
            username: "CC:22:3D:E3:CE:30".to_string(),
            pincode: "031-45-154".to_string(),
        }
    }
}

fn parse_args() -> Args {
    let mut args = Args::default();
    let mut iter = std::env::args().skip(1);

    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--debug" | "-d" => {
                args.debug = true;
            }
            "--storage" | "-s" => {
                if let Some(path) = iter.next() {
                    args.storage = PathBuf::from(path);
                }
            }
            "--port" | "-p" => match iter.next().map(|p| p.parse()) {
                Some(Ok(port)) => args.port = port,
                _ => {
                    eprintln!("--port needs a number");
                    std::process::exit(1);
                }
            },
            "--username" | "-u" => {
                if let Some(username) = iter.next() {
                    args.username = username;
                }
            }
            "--pin" => {
                if let Some(pincode) = iter.next() {
                    args.pincode = pincode;
                }
            }
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            _ => {
                eprintln!("Unknown argument: {}", arg);
                print_help();
                std::process::exit(1);
            }
        }
    }

    args
}

fn print_help() {
    println!("hap-rs - HomeKit bridge demo with one lightbulb");
    println!();
    println!("Usage: hap-rs [OPTIONS]");
    println!();
    println!("Options:");
    println!("  -d, --debug            Enable debug logging");
    println!("  -s, --storage DIR      Pairing data directory (default: hap-storage)");
    println!("  -p, --port PORT        TCP port (default: {}, 0 for any)", DEFAULT_PORT);
    println!("  -u, --username ID      Accessory identifier, XX:XX:XX:XX:XX:XX");
    println!("      --pin CODE         Setup code, XXX-XX-XXX (default: 031-45-154)");
    println!("  -h, --help             Show this help message");
}

fn setup_logging(args: &Args) {
    let level = if args.debug {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt()
        .with_target(args.debug)
        .with_max_level(level)
        .init();
}

/// Bridge with a bridged lightbulb supporting adaptive lighting.
fn build_bridge() -> Result<(Arc<Accessory>, Arc<AdaptiveLightingController>)> {
    let bridge = Accessory::new_bridge("hap-rs Bridge");

    let lamp = Accessory::new("Desk Lamp", hap_type::generate("hap-rs:desk-lamp"), Category::Lightbulb);
    let bulb = lamp.add_service(types::lightbulb("Desk Lamp"))?;
    bulb.add_characteristic(types::brightness())?;
    bulb.add_characteristic(types::color_temperature())?;

    if let Some(on) = bulb.characteristic(types::ON) {
        on.on_write(write_fn(|value: CharValue, ctx| async move {
            info!(on = ?value.as_bool(), controller = ?ctx.controller, "Desk lamp switched");
            Ok(None)
        }));
    }

    let adaptive = AdaptiveLightingController::new(Arc::clone(&bulb))?;
    lamp.configure_controller(adaptive.clone())?;
    bridge.add_bridged_accessory(lamp)?;

    Ok((bridge, adaptive))
}

/// Advance an active adaptive lighting transition.
async fn drive_adaptive_lighting(controller: Arc<AdaptiveLightingController>) {
    loop {
        let interval = controller.update_interval().unwrap_or(Duration::from_secs(60));
        tokio::time::sleep(interval).await;
        if let Some(temperature) = controller.tick() {
            info!(mired = temperature, "Adaptive lighting update");
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = parse_args();
    setup_logging(&args);

    let config = ServerConfig::builder(&args.username, &args.pincode)
        .port(args.port)
        .build()
        .context("invalid configuration")?;
    let storage = Arc::new(
        FileStorage::open(&args.storage)
            .with_context(|| format!("cannot open storage at {}", args.storage.display()))?,
    );
    let advertiser = Arc::new(MdnsAdvertiser::new()?);
    let (bridge, adaptive) = build_bridge()?;

    let server = HapServer::start(config, bridge, storage, advertiser).await?;
    let _events = server.subscribe(|event| match event {
        ServerEvent::Paired { controller } => info!(%controller, "Paired with controller"),
        ServerEvent::Unpaired => warn!("All pairings removed"),
        ServerEvent::ConfigurationChanged { version } => info!(version, "Configuration changed"),
        ServerEvent::Listening(_) => {}
    });

    println!("Listening on {}", server.local_addr());
    println!("Setup code: {}", server.pincode());
    println!("Setup URI:  {}", server.setup_uri()?);
    if server.is_paired() {
        println!("Already paired; remove the storage directory to pair again.");
    }

    let ticker = tokio::spawn(drive_adaptive_lighting(adaptive));

    tokio::signal::ctrl_c().await?;
    info!("Ctrl-C received");
    ticker.abort();
    server.shutdown().await?;
    Ok(())
}
