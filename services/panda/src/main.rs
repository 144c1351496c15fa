// panda: UDP fan-out server. Reads raw frames off one or more SocketCAN
// buses and serves them to external tools over the Panda protocol.

use std::collections::HashMap;
use std::net::UdpSocket;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use serde::Deserialize;
use tracing::{info, warn};

use canserver_core::{DropPolicyQueue, Frame};
use panda::server::PandaRegistry;

const BROADCAST_TICK: Duration = Duration::from_millis(1000 / 120);
const HEARTBEAT_TICK: Duration = Duration::from_secs(1);
const SOCKET_POLL: Duration = Duration::from_millis(50);

#[derive(Debug, Deserialize)]
struct RawPandaConfig {
    panda_bind: Option<String>,
    buses: Option<Vec<RawBusConfig>>,
}

#[derive(Debug, Deserialize)]
struct RawBusConfig {
    index: u8,
    interface: String,
    bitrate: Option<u32>,
}

struct PandaConfig {
    bind: String,
    buses: Vec<(u8, String, u32)>,
}

fn load_config(path: &std::path::Path) -> Result<PandaConfig, String> {
    let contents = std::fs::read_to_string(path).map_err(|e| format!("reading {}: {e}", path.display()))?;
    let raw: RawPandaConfig = toml::from_str(&contents).map_err(|e| format!("parsing config: {e}"))?;
    let buses = raw
        .buses
        .unwrap_or_default()
        .into_iter()
        .map(|b| (b.index, b.interface, b.bitrate.unwrap_or(500_000)))
        .collect();
    Ok(PandaConfig {
        bind: raw.panda_bind.unwrap_or_else(|| "127.0.0.1:1338".to_owned()),
        buses,
    })
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let mut config_path = std::path::PathBuf::from("panda.toml");
    let mut bind_override = None;
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--panda-bind" {
            bind_override = args.next();
        } else if arg == "--config" {
            if let Some(v) = args.next() {
                config_path = std::path::PathBuf::from(v);
            }
        }
    }

    let mut cfg = match load_config(&config_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("FATAL: {e}");
            std::process::exit(1);
        }
    };
    if let Some(bind) = bind_override {
        cfg.bind = bind;
    }

    info!(version = env!("CARGO_PKG_VERSION"), bind = %cfg.bind, "panda starting");

    let socket = match UdpSocket::bind(&cfg.bind) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("FATAL: failed to bind {}: {e}", cfg.bind);
            std::process::exit(1);
        }
    };
    socket.set_read_timeout(Some(SOCKET_POLL)).expect("set udp read timeout");

    let shutdown = Arc::new(AtomicBool::new(false));
    {
        let shutdown = shutdown.clone();
        if let Err(e) = ctrlc::set_handler(move || shutdown.store(true, Ordering::Relaxed)) {
            eprintln!("FATAL: failed to install signal handler: {e}");
            std::process::exit(1);
        }
    }

    let raw_fifo: Arc<DropPolicyQueue<(u8, Frame)>> = Arc::new(DropPolicyQueue::new(50_000));
    let mut bus_handles = Vec::new();
    for (index, interface, bitrate) in &cfg.buses {
        let interface = interface.clone();
        let index = *index;
        let bitrate = *bitrate;
        let raw_fifo = raw_fifo.clone();
        let shutdown = shutdown.clone();
        bus_handles.push(std::thread::spawn(move || {
            run_bus_reader(&interface, index, bitrate, &raw_fifo, &shutdown);
        }));
    }

    let mut registry = PandaRegistry::new();
    let mut recv_buf = [0u8; 512];
    let mut last_broadcast = Instant::now();
    let mut last_heartbeat = Instant::now();
    let start = Instant::now();

    while !shutdown.load(Ordering::Relaxed) {
        match socket.recv_from(&mut recv_buf) {
            Ok((n, addr)) => {
                let now = start.elapsed().as_secs_f64();
                if let panda::server::DatagramEffect::SendAck =
                    registry.handle_datagram(addr, &recv_buf[..n], now)
                {
                    let ack = panda::protocol::encode_ack();
                    if let Err(e) = socket.send_to(&ack, addr) {
                        warn!(error = %e, "failed to send panda ack");
                    }
                }
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
            Err(ref e) if e.kind() == std::io::ErrorKind::TimedOut => {}
            Err(e) => warn!(error = %e, "panda socket recv error"),
        }

        if last_broadcast.elapsed() >= BROADCAST_TICK {
            last_broadcast = Instant::now();
            let batch = raw_fifo.pop_many(10_000, Duration::from_millis(0));
            let mut by_bus: HashMap<u8, Vec<Frame>> = HashMap::new();
            for (bus, frame) in batch {
                by_bus.entry(bus).or_default().push(frame);
            }
            for (bus, frames) in by_bus {
                let tick = registry.broadcast_tick(bus, &frames);
                for (addr, wire_frames) in tick {
                    for wire in wire_frames {
                        if let Err(e) = socket.send_to(&wire, addr) {
                            warn!(error = %e, %addr, "failed to send wire frame");
                        }
                    }
                }
            }
        }

        if last_heartbeat.elapsed() >= HEARTBEAT_TICK {
            last_heartbeat = Instant::now();
            let now = start.elapsed().as_secs_f64();
            let expired = registry.expire_stale(now);
            for addr in expired {
                info!(%addr, "panda client heartbeat expired");
            }
        }
    }

    for handle in bus_handles {
        let _ = handle.join();
    }
    info!("panda shut down cleanly");
}

fn run_bus_reader(
    interface: &str,
    index: u8,
    bitrate: u32,
    raw_fifo: &DropPolicyQueue<(u8, Frame)>,
    shutdown: &AtomicBool,
) {
    use can_pipeline::reader::FrameSource;

    let mut source = match can_pipeline::reader::SocketCanSource::open(interface, index, bitrate) {
        Ok(s) => s,
        Err(e) => {
            warn!(interface, error = %e, "failed to open bus for panda fan-out");
            return;
        }
    };
    while !shutdown.load(Ordering::Relaxed) {
        if let Ok(Some(frame)) = source.recv() {
            raw_fifo.push((index, frame));
        }
    }
}
