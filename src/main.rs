use color_eyre::eyre::{bail, eyre};
use color_eyre::Result;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use gcbridge::config::{BridgeConfig, SlotConfig, TransportChoice};
use gcbridge::dsu::ports;
use gcbridge::dsu::server::DSU_PORT;
use gcbridge::persistence::ControllerStore;
use gcbridge::session::SessionHandle;

#[tokio::main]
async fn main() -> Result<()> {
    setup()?;

    match parse_args(std::env::args().skip(1))? {
        Invocation::Run(config) => run_bridge(config).await,
        Invocation::SaveController { name, address } => {
            let store = ControllerStore::open_default()?;
            store.add(&address, &name)?;
            println!("Saved '{name}' -> {address}");
            Ok(())
        }
        Invocation::ForgetController { address } => {
            let store = ControllerStore::open_default()?;
            if store.remove(&address)? {
                println!("Removed {address}");
            } else {
                println!("No saved controller with address {address}");
            }
            Ok(())
        }
        Invocation::ListSaved => {
            let store = ControllerStore::open_default()?;
            let saved = store.list()?;
            if saved.is_empty() {
                println!("No saved controllers.");
            } else {
                for controller in saved {
                    println!("{}\t{}", controller.name, controller.address);
                }
            }
            Ok(())
        }
        Invocation::FreePort { port } => {
            if ports::free_orphaned_port(port) {
                println!("Freed port {port}");
            } else {
                println!("Port {port} was not freed (not in use, or not held by a prior instance)");
            }
            Ok(())
        }
        Invocation::Help => {
            print_usage();
            Ok(())
        }
    }
}

async fn run_bridge(config: BridgeConfig) -> Result<()> {
    let session = SessionHandle::start(config).await?;
    info!(
        "bridge running; point the emulator's DSU client at 127.0.0.1:{}",
        session.dsu_port()
    );
    info!("press Ctrl-C to stop");

    tokio::signal::ctrl_c().await?;
    info!("Ctrl-C received");
    session.shutdown().await;
    Ok(())
}

fn setup() -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info")
    }
    setup_logging_env();
    Ok(())
}

fn setup_logging_env() {
    FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .pretty()
        .init();
}

enum Invocation {
    Run(BridgeConfig),
    SaveController { name: String, address: String },
    ForgetController { address: String },
    ListSaved,
    FreePort { port: u16 },
    Help,
}

fn parse_args(args: impl Iterator<Item = String>) -> Result<Invocation> {
    let mut config = BridgeConfig::default();
    let mut slots: Vec<SlotConfig> = Vec::new();
    let mut args = args.peekable();

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--help" | "-h" => return Ok(Invocation::Help),
            "--list-saved" => return Ok(Invocation::ListSaved),
            "--save" => {
                let spec = args
                    .next()
                    .ok_or_else(|| eyre!("--save needs NAME=ADDRESS"))?;
                let (name, address) = spec
                    .split_once('=')
                    .ok_or_else(|| eyre!("--save needs NAME=ADDRESS, got '{spec}'"))?;
                return Ok(Invocation::SaveController {
                    name: name.to_string(),
                    address: address.to_string(),
                });
            }
            "--forget" => {
                let address = args.next().ok_or_else(|| eyre!("--forget needs ADDRESS"))?;
                return Ok(Invocation::ForgetController { address });
            }
            "--free-port" => {
                let port = match args.peek() {
                    Some(value) if !value.starts_with("--") => {
                        let value = args.next().unwrap_or_default();
                        value
                            .parse()
                            .map_err(|_| eyre!("invalid port '{value}'"))?
                    }
                    _ => DSU_PORT,
                };
                return Ok(Invocation::FreePort { port });
            }
            "--slot" => {
                let spec = args
                    .next()
                    .ok_or_else(|| eyre!("--slot needs usb[:INDEX] or ble[:ADDRESS|NAME]"))?;
                let slot = slots.len() as u8;
                slots.push(SlotConfig {
                    slot,
                    choice: parse_slot_spec(&spec)?,
                });
            }
            "--port" => {
                let value = args.next().ok_or_else(|| eyre!("--port needs a value"))?;
                config.dsu_port = value
                    .parse()
                    .map_err(|_| eyre!("invalid port '{value}'"))?;
            }
            "--latency" => config.latency_stats = true,
            "--no-reconnect" => config.auto_reconnect = false,
            other => bail!("unknown argument '{other}' (try --help)"),
        }
    }

    if !slots.is_empty() {
        config.slots = slots;
    }
    Ok(Invocation::Run(config))
}

fn parse_slot_spec(spec: &str) -> Result<TransportChoice> {
    let (kind, rest) = match spec.split_once(':') {
        Some((kind, rest)) => (kind, Some(rest)),
        None => (spec, None),
    };
    match kind {
        "usb" => {
            let device_index = match rest {
                Some(value) => value
                    .parse()
                    .map_err(|_| eyre!("invalid USB device index '{value}'"))?,
                None => 0,
            };
            Ok(TransportChoice::Usb { device_index })
        }
        "ble" => Ok(match rest {
            Some(rest) if is_ble_address(rest) => TransportChoice::Ble {
                address: Some(rest.to_string()),
                saved_name: None,
            },
            Some(rest) => TransportChoice::Ble {
                address: None,
                saved_name: Some(rest.to_string()),
            },
            None => TransportChoice::Ble {
                address: None,
                saved_name: None,
            },
        }),
        other => bail!("unknown transport '{other}' (use usb or ble)"),
    }
}

/// `AA:BB:CC:DD:EE:FF` style; anything else is treated as a saved name.
fn is_ble_address(value: &str) -> bool {
    let groups: Vec<&str> = value.split(':').collect();
    groups.len() == 6
        && groups
            .iter()
            .all(|g| g.len() == 2 && g.chars().all(|c| c.is_ascii_hexdigit()))
}

fn print_usage() {
    println!(
        "gcbridge - NSO GameCube controller to DSU bridge

USAGE:
    gcbridge [OPTIONS]

OPTIONS:
    --slot usb[:INDEX]          Bridge the Nth USB controller (repeatable, max 4 slots)
    --slot ble[:ADDR|NAME]      Bridge a BLE controller by address, saved name,
                                or by scanning (hold the pair button)
    --port PORT                 DSU UDP port (default {DSU_PORT}; falls back to the
                                next free port when taken)
    --latency                   Log input latency stats every 100 reports
    --no-reconnect              Do not re-resolve a slot after disconnect
    --save NAME=ADDRESS         Save a BLE controller under a friendly name
    --forget ADDRESS            Remove a saved controller
    --list-saved                List saved controllers
    --free-port [PORT]          Terminate a stale prior instance holding the port
    --help                      Show this help

With no --slot the bridge runs one USB controller on slot 0."
    );
}
