// can-pipeline: ingests a CAN channel, fans it out to decode and archival
// logging, and exits 130 on SIGINT, 1 on config error, 0 on clean shutdown
// (replay EOF).

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::Duration;

use tracing::{error, info};

use can_pipeline::pipeline::{ChannelPipeline, install_shutdown_handler};
use can_pipeline::reader::{FrameSource, ReplaySource, SocketCanSource};

struct Cli {
    config_path: PathBuf,
    channel: String,
    bustype: String,
    test: bool,
}

fn parse_args() -> Result<Cli, String> {
    let mut config_path = PathBuf::from("config.toml");
    let mut channel = "can0".to_owned();
    let mut bustype = "socketcan".to_owned();
    let mut test = false;

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" => config_path = PathBuf::from(args.next().ok_or("--config requires a value")?),
            "--channel" => channel = args.next().ok_or("--channel requires a value")?,
            "--bustype" => bustype = args.next().ok_or("--bustype requires a value")?,
            "--test" => test = true,
            other => return Err(format!("unrecognized argument '{other}'")),
        }
    }
    Ok(Cli {
        config_path,
        channel,
        bustype,
        test,
    })
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = match parse_args() {
        Ok(cli) => cli,
        Err(e) => {
            eprintln!("usage error: {e}");
            std::process::exit(1);
        }
    };

    info!(version = env!("CARGO_PKG_VERSION"), channel = %cli.channel, "can-pipeline starting");

    let cfg = match can_pipeline::config::load_config_from_path(&cli.config_path) {
        Ok(cfg) => {
            info!(bus_name = %cfg.bus_name, dbc_file = %cfg.dbc_file.display(), "config loaded");
            cfg
        }
        Err(e) => {
            eprintln!("FATAL: failed to load config: {e}");
            std::process::exit(1);
        }
    };

    let source: Box<dyn FrameSource> = if cli.test {
        let path = PathBuf::from(format!("test_data/{}_cleaned.asc", cli.channel));
        match ReplaySource::open(&path) {
            Ok(source) => Box::new(source),
            Err(e) => {
                eprintln!("FATAL: failed to open replay file {}: {e}", path.display());
                std::process::exit(1);
            }
        }
    } else if cli.bustype == "socketcan" {
        match SocketCanSource::open(&cli.channel, 0, cfg.bitrate) {
            Ok(source) => Box::new(source),
            Err(e) => {
                eprintln!("FATAL: failed to bring up {}: {e}", cli.channel);
                std::process::exit(1);
            }
        }
    } else {
        eprintln!("FATAL: unsupported bustype '{}'", cli.bustype);
        std::process::exit(1);
    };

    let shutdown = Arc::new(AtomicBool::new(false));
    let interrupted = Arc::new(AtomicBool::new(false));
    if let Err(e) = install_shutdown_handler(shutdown.clone(), interrupted.clone()) {
        eprintln!("FATAL: {e}");
        std::process::exit(1);
    }

    let (_pipeline, handles) = match ChannelPipeline::spawn(cfg, source, shutdown.clone()) {
        Ok(result) => result,
        Err(e) => {
            eprintln!("FATAL: failed to start pipeline: {e}");
            std::process::exit(1);
        }
    };

    for handle in handles {
        if handle.join().is_err() {
            error!("worker thread panicked");
        }
    }

    std::thread::sleep(Duration::from_millis(10));
    if interrupted.load(std::sync::atomic::Ordering::Relaxed) {
        info!("can-pipeline shut down on signal");
        std::process::exit(130);
    }
    info!("can-pipeline shut down cleanly");
}
