//! CLI entry point: parses arguments, wires the store/registry/send-queue/
//! protocol engine together, loads producers per slot and runs the
//! dispatcher loop until interrupted.

use std::collections::HashMap;
use std::net::{SocketAddr, UdpSocket};
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use rand::Rng;

use dsuwu_core::producer::ProducerError;
use dsuwu_core::{ClientRegistry, ProducerHost, ProducerSpec, ProtocolEngine, SendQueue, SlotStore};
use dsuwu_producers::{ForwardProducer, ReplayProducer, ReplayTarget, Shape, ShapeProducer};

const T: &str = "dsuwu::main";

/// Default UDP port a DSU server listens on.
const DEFAULT_PORT: u16 = 26760;
/// Slots populated with a demo producer when no `--controllerN-script` is given.
const DEFAULT_DEMO_SLOTS: usize = 5;
/// Send-queue depth, matching the bound used throughout the core crate's own tests.
const SEND_QUEUE_CAPACITY: usize = 64;

#[derive(Parser, Debug)]
#[command(name = "dsuwu", about = "DSU (CemuHook UDP Input) server")]
struct Cli {
    /// UDP port to listen on.
    #[arg(long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Server identifier, hex, at most 8 nibbles. Random if omitted.
    #[arg(long = "server-id")]
    server_id: Option<String>,

    /// Seconds between state updates, or "none"/"null" to only dispatch on change.
    #[arg(long = "update-timeout", default_value = "0.005")]
    update_timeout: String,

    /// Analog stick tolerance, in raw units around center (128), for idle detection.
    #[arg(long = "stick-deadzone", default_value_t = dsuwu_core::store::DEFAULT_STICK_DEADZONE)]
    stick_deadzone: u8,

    #[arg(long = "controller0-script")]
    controller0_script: Option<String>,
    #[arg(long = "controller1-script")]
    controller1_script: Option<String>,
    #[arg(long = "controller2-script")]
    controller2_script: Option<String>,
    #[arg(long = "controller3-script")]
    controller3_script: Option<String>,
    #[arg(long = "controller4-script")]
    controller4_script: Option<String>,

    /// Additional or overriding slot assignments, `SLOT=SPEC`. Repeatable.
    #[arg(long = "controller-script", value_name = "SLOT=SPEC")]
    controller_script: Vec<String>,
}

/// Parses a hex server ID, accepting an optional leading `0x`.
fn parse_server_id(value: &str) -> anyhow::Result<u32> {
    let trimmed = value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")).unwrap_or(value);
    anyhow::ensure!(!trimmed.is_empty(), "server ID cannot be empty");
    anyhow::ensure!(trimmed.len() <= 8, "server ID must be at most 8 hex digits");
    anyhow::ensure!(trimmed.chars().all(|c| c.is_ascii_hexdigit()), "server ID must be hexadecimal");
    Ok(u32::from_str_radix(trimmed, 16)?)
}

/// Parses an update-timeout argument, treating `"none"`/`"null"` as "disabled".
fn parse_update_timeout(value: &str) -> anyhow::Result<Option<f64>> {
    let lowered = value.trim().to_ascii_lowercase();
    if lowered == "none" || lowered == "null" {
        return Ok(None);
    }
    let timeout: f64 = lowered.parse()?;
    anyhow::ensure!(timeout >= 0.0, "update timeout must be non-negative");
    Ok(Some(timeout))
}

/// Builds one slot's [`ProducerSpec`] from a spec string.
///
/// Grammar: `"none"` / `"idle"`, `shape:<circle|square|cross|triangle>`,
/// `replay:<inputs path>[:<motion path>][:all]`,
/// `forward:<host>:<port>:<remote slot>[:<interval ms>]`, or (with the `hid`
/// feature) `hid:<vendor hex>:<product hex>`. A bare string with no `kind:`
/// prefix is treated as a replay input-log path, mirroring how the source
/// project's `--controllerN-script` took a bare path.
fn parse_producer_spec(slot: u8, raw: &str) -> Result<ProducerSpec, ProducerError> {
    let trimmed = raw.trim();
    let lowered = trimmed.to_ascii_lowercase();
    if lowered == "none" {
        return Ok(ProducerSpec::None);
    }
    if lowered == "idle" {
        return Ok(ProducerSpec::Idle);
    }

    let Some((kind, rest)) = trimmed.split_once(':') else {
        return Ok(ProducerSpec::Producer(Box::new(ReplayProducer::new(trimmed, None, ReplayTarget::Assigned))));
    };

    match kind.to_ascii_lowercase().as_str() {
        "shape" => {
            let shape = match rest.to_ascii_lowercase().as_str() {
                "circle" => Shape::Circle,
                "square" => Shape::Square,
                "cross" => Shape::Cross,
                "triangle" => Shape::Triangle,
                other => {
                    return Err(ProducerError::Load {
                        slot,
                        reason: format!("unknown shape '{other}'"),
                    })
                }
            };
            Ok(ProducerSpec::Producer(Box::new(ShapeProducer::new(shape))))
        }
        "replay" => {
            let mut fields = rest.split(':');
            let inputs = fields.next().filter(|s| !s.is_empty()).ok_or_else(|| ProducerError::Load {
                slot,
                reason: "replay requires an input path".into(),
            })?;
            let mut motion: Option<PathBuf> = None;
            let mut target = ReplayTarget::Assigned;
            for field in fields {
                if field.eq_ignore_ascii_case("all") {
                    target = ReplayTarget::All;
                } else if !field.is_empty() {
                    motion = Some(PathBuf::from(field));
                }
            }
            Ok(ProducerSpec::Producer(Box::new(ReplayProducer::new(inputs, motion, target))))
        }
        "forward" => {
            let fields: Vec<&str> = rest.split(':').collect();
            if fields.len() < 3 {
                return Err(ProducerError::Load {
                    slot,
                    reason: "forward requires host:port:remote_slot[:interval_ms]".into(),
                });
            }
            let port: u16 = fields[1].parse().map_err(|_| ProducerError::Load {
                slot,
                reason: "invalid forward port".into(),
            })?;
            let remote_slot: u8 = fields[2].parse().map_err(|_| ProducerError::Load {
                slot,
                reason: "invalid forward remote slot".into(),
            })?;
            let interval_ms: u64 = match fields.get(3) {
                Some(raw) => raw.parse().map_err(|_| ProducerError::Load {
                    slot,
                    reason: "invalid forward interval".into(),
                })?,
                None => 1000,
            };
            let addr: SocketAddr = format!("{}:{}", fields[0], port).parse().map_err(|_| ProducerError::Load {
                slot,
                reason: "invalid forward address".into(),
            })?;
            Ok(ProducerSpec::Producer(Box::new(ForwardProducer::new(addr, remote_slot, Duration::from_millis(interval_ms)))))
        }
        #[cfg(feature = "hid")]
        "hid" => {
            let fields: Vec<&str> = rest.split(':').collect();
            if fields.len() != 2 {
                return Err(ProducerError::Load {
                    slot,
                    reason: "hid requires vendor_id:product_id (hex)".into(),
                });
            }
            let parse_hex = |s: &str| u16::from_str_radix(s.trim_start_matches("0x").trim_start_matches("0X"), 16);
            let vendor_id = parse_hex(fields[0]).map_err(|_| ProducerError::Load {
                slot,
                reason: "invalid hid vendor id".into(),
            })?;
            let product_id = parse_hex(fields[1]).map_err(|_| ProducerError::Load {
                slot,
                reason: "invalid hid product id".into(),
            })?;
            Ok(ProducerSpec::Producer(Box::new(dsuwu_producers::hid::HidProducer::new(vendor_id, product_id))))
        }
        other => Err(ProducerError::Load {
            slot,
            reason: format!("unknown producer kind '{other}'"),
        }),
    }
}

/// Default producer assigned to a slot when nothing was asked for explicitly:
/// slot 0 stays bare, slots 1-4 cycle through the shape demos.
fn default_spec_for_slot(slot: u8) -> &'static str {
    match slot {
        0 => "none",
        1 => "shape:circle",
        2 => "shape:cross",
        3 => "shape:square",
        4 => "shape:triangle",
        _ => "none",
    }
}

fn build_producer_specs(cli: &Cli) -> anyhow::Result<Vec<(u8, ProducerSpec)>> {
    let mut raw_specs: HashMap<u8, String> = HashMap::new();

    let explicit = [
        &cli.controller0_script,
        &cli.controller1_script,
        &cli.controller2_script,
        &cli.controller3_script,
        &cli.controller4_script,
    ];
    for (slot, script) in explicit.into_iter().enumerate() {
        if let Some(script) = script {
            raw_specs.insert(slot as u8, script.clone());
        }
    }

    for entry in &cli.controller_script {
        let (slot_str, spec) = entry.split_once('=').ok_or_else(|| anyhow::anyhow!("--controller-script expects SLOT=SPEC, got '{entry}'"))?;
        let slot: u8 = slot_str.parse().map_err(|_| anyhow::anyhow!("invalid slot in --controller-script '{entry}'"))?;
        raw_specs.insert(slot, spec.to_owned());
    }

    let slot_count = raw_specs
        .keys()
        .copied()
        .map(|s| s as usize + 1)
        .max()
        .unwrap_or(DEFAULT_DEMO_SLOTS)
        .max(DEFAULT_DEMO_SLOTS);

    let mut specs = Vec::with_capacity(slot_count);
    for slot in 0..slot_count as u8 {
        let raw = raw_specs.get(&slot).map(String::as_str).unwrap_or_else(|| default_spec_for_slot(slot));
        match parse_producer_spec(slot, raw) {
            Ok(spec) => specs.push((slot, spec)),
            Err(err) => {
                log::error!(target: T, "{err}, leaving slot {slot} disconnected");
                specs.push((slot, ProducerSpec::None));
            }
        }
    }
    Ok(specs)
}

fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let server_id = match &cli.server_id {
        Some(raw) => parse_server_id(raw)?,
        None => rand::thread_rng().gen(),
    };
    let update_timeout_secs = parse_update_timeout(&cli.update_timeout)?;
    let update_timeout = match update_timeout_secs {
        Some(secs) if secs > 0.0 => Some(Duration::from_secs_f64(secs)),
        _ => None,
    };

    let producer_specs = build_producer_specs(&cli)?;

    let store = Arc::new(SlotStore::new());
    let (host, idle_slots) = ProducerHost::spawn(producer_specs, store.clone());

    let registry = Arc::new(ClientRegistry::new());
    let socket = UdpSocket::bind(("0.0.0.0", cli.port)).map_err(|err| anyhow::anyhow!("failed to bind UDP port {}: {err}", cli.port))?;
    let send_socket = Arc::new(socket.try_clone()?);
    let (send_queue, _sender_handle) = SendQueue::spawn(send_socket, registry.clone(), SEND_QUEUE_CAPACITY);

    let mut engine = ProtocolEngine::new(server_id, cli.stick_deadzone, idle_slots);

    log::info!(target: T, "dsuwu listening on 0.0.0.0:{} (server id 0x{server_id:08X})", cli.port);

    let stop = Arc::new(AtomicBool::new(false));

    dsuwu_core::dispatcher::run(socket, &mut engine, registry, store, send_queue, update_timeout, stop);

    host.stop_and_join();
    Ok(())
}

fn main() {
    simple_logger::SimpleLogger::new().init().unwrap();

    if let Err(err) = run() {
        log::error!(target: T, "{err:#}");
        std::process::exit(1);
    }
}
