//! Frame acquisition: a live SocketCAN interface, or a paced ASC replay file.
//!
//! Both sources implement [`FrameSource`] so the worker loop is identical
//! whichever one backs it — the same shape as the bus-vs-replay split in a
//! synchronous SocketCAN reader, generalized to also pace from a trace file
//! instead of only reading live.

use std::io::{BufRead, BufReader};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use socketcan::{CanSocket, EmbeddedFrame, Frame as SocketCanFrameTrait, Id, Socket};

use canserver_core::{Frame, PipelineError};

use crate::config::PipelineConfig;

const READ_TIMEOUT: Duration = Duration::from_millis(200);
const BATCH_SIZE: usize = 100;

/// One acquired frame, or a signal that the source is exhausted (replay EOF).
pub trait FrameSource: Send {
    fn recv(&mut self) -> Result<Option<Frame>, PipelineError>;
}

/// Live SocketCAN source. `open` fails with `PipelineError::BusUnavailable`
/// if the interface doesn't exist, privileges are missing, or the bitrate
/// can't be applied.
pub struct SocketCanSource {
    channel: u8,
    socket: CanSocket,
}

impl SocketCanSource {
    /// Brings the interface down, applies `bitrate`, and brings it back up
    /// before opening the raw socket, per the `ip link` sequence a SocketCAN
    /// bus is administratively configured with.
    pub fn open(interface: &str, channel: u8, bitrate: u32) -> Result<Self, PipelineError> {
        apply_bitrate(interface, bitrate)?;
        let socket = CanSocket::open(interface)
            .map_err(|e| PipelineError::BusUnavailable(format!("{interface}: {e}")))?;
        socket
            .set_read_timeout(READ_TIMEOUT)
            .map_err(|e| PipelineError::BusUnavailable(format!("{interface}: set_read_timeout: {e}")))?;
        Ok(SocketCanSource { channel, socket })
    }
}

/// Brings `interface` down, sets its bitrate, and brings it back up via `ip
/// link`. Fails with `BusUnavailable` if `ip` is missing or any step is
/// rejected (e.g. insufficient privileges, interface does not exist).
fn apply_bitrate(interface: &str, bitrate: u32) -> Result<(), PipelineError> {
    run_ip(&["link", "set", interface, "down"])?;
    run_ip(&["link", "set", interface, "type", "can", "bitrate", &bitrate.to_string()])?;
    run_ip(&["link", "set", interface, "up"])?;
    Ok(())
}

fn run_ip(args: &[&str]) -> Result<(), PipelineError> {
    let output = std::process::Command::new("ip")
        .args(args)
        .output()
        .map_err(|e| PipelineError::BusUnavailable(format!("ip {}: {e}", args.join(" "))))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(PipelineError::BusUnavailable(format!(
            "ip {}: {}",
            args.join(" "),
            stderr.trim()
        )));
    }
    Ok(())
}

impl FrameSource for SocketCanSource {
    fn recv(&mut self) -> Result<Option<Frame>, PipelineError> {
        match self.socket.read_frame() {
            Ok(frame) => {
                let id = match frame.id() {
                    Id::Standard(id) => id.as_raw() as u32,
                    Id::Extended(id) => id.as_raw(),
                };
                let now = std::time::SystemTime::now()
                    .duration_since(std::time::UNIX_EPOCH)
                    .unwrap_or_default()
                    .as_secs_f64();
                Ok(Some(Frame::new(
                    self.channel,
                    id,
                    frame.is_extended(),
                    true,
                    frame.data(),
                    now,
                )))
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(None),
            Err(ref e) if e.kind() == std::io::ErrorKind::TimedOut => Ok(None),
            Err(e) => {
                tracing::warn!(channel = self.channel, error = %e, "transient bus error");
                Ok(None)
            }
        }
    }
}

/// Replays an ASC trace file, pacing delivery to real wall-clock time
/// relative to the first frame's recorded timestamp.
pub struct ReplaySource {
    lines: std::io::Lines<BufReader<std::fs::File>>,
    start_wall: Option<Instant>,
    first_frame_ts: Option<f64>,
    eof_signaled: bool,
}

impl ReplaySource {
    pub fn open(path: &std::path::Path) -> Result<Self, PipelineError> {
        let file = std::fs::File::open(path)?;
        Ok(ReplaySource {
            lines: BufReader::new(file).lines(),
            start_wall: None,
            first_frame_ts: None,
            eof_signaled: false,
        })
    }
}

impl FrameSource for ReplaySource {
    fn recv(&mut self) -> Result<Option<Frame>, PipelineError> {
        let Some(line) = self.lines.next() else {
            if self.eof_signaled {
                return Ok(None);
            }
            self.eof_signaled = true;
            return Err(PipelineError::ReplayEnd);
        };
        let line = line?;
        let frame = match canserver_core::asc::decode_line(&line) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(error = %e, line = %line, "skipping unparsable replay line");
                return self.recv();
            }
        };

        let start_wall = *self.start_wall.get_or_insert_with(Instant::now);
        let first_ts = *self.first_frame_ts.get_or_insert(frame.timestamp);
        let target = start_wall + Duration::from_secs_f64((frame.timestamp - first_ts).max(0.0));
        let now = Instant::now();
        if target > now {
            std::thread::sleep(target - now);
        }
        Ok(Some(frame))
    }
}

/// Drives a `FrameSource`, pushing batches into `rx_fifo`, counting FPS, and
/// observing the shared shutdown flag.
pub struct Reader {
    source: Box<dyn FrameSource>,
    rx_fifo: Arc<canserver_core::DropPolicyQueue<Frame>>,
    fps: canserver_core::counters::FpsCounter,
    fps_period_s: f64,
}

impl Reader {
    pub fn new(
        source: Box<dyn FrameSource>,
        rx_fifo: Arc<canserver_core::DropPolicyQueue<Frame>>,
        cfg: &PipelineConfig,
    ) -> Self {
        Reader {
            source,
            rx_fifo,
            fps: canserver_core::counters::FpsCounter::new(cfg.bus_name.clone(), cfg.fps_log_period_s),
            fps_period_s: cfg.fps_log_period_s,
        }
    }

    /// Runs until `shutdown` is set or the source signals `ReplayEnd`.
    pub fn run(&mut self, shutdown: &AtomicBool) -> Result<(), PipelineError> {
        let _ = self.fps_period_s;
        let mut batch = Vec::with_capacity(BATCH_SIZE);
        while !shutdown.load(Ordering::Relaxed) {
            match self.source.recv() {
                Ok(Some(frame)) => {
                    let ts = frame.timestamp;
                    batch.push(frame);
                    if batch.len() >= BATCH_SIZE {
                        let n = batch.len() as u64;
                        self.rx_fifo.push_many(std::mem::take(&mut batch));
                        self.fps.count(n, ts);
                    }
                }
                Ok(None) => {
                    if !batch.is_empty() {
                        let n = batch.len() as u64;
                        let last_ts = batch.last().map(|f: &Frame| f.timestamp).unwrap_or(0.0);
                        self.rx_fifo.push_many(std::mem::take(&mut batch));
                        self.fps.count(n, last_ts);
                    }
                }
                Err(PipelineError::ReplayEnd) => {
                    if !batch.is_empty() {
                        self.rx_fifo.push_many(std::mem::take(&mut batch));
                    }
                    return Err(PipelineError::ReplayEnd);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn queue() -> Arc<canserver_core::DropPolicyQueue<Frame>> {
        Arc::new(canserver_core::DropPolicyQueue::new(1000))
    }

    #[test]
    fn open_fails_for_unknown_interface() {
        let err = SocketCanSource::open("not-a-real-can-iface-xyz", 0, 500_000).unwrap_err();
        assert!(matches!(err, PipelineError::BusUnavailable(_)));
    }

    #[test]
    fn replay_source_reads_known_asc_lines() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "1000.000 1 132 Rx d 8 01 02 03 04 05 06 07 08").unwrap();
        writeln!(file, "1000.001 1 200 Rx d 1 03").unwrap();
        let mut source = ReplaySource::open(file.path()).unwrap();

        let f1 = source.recv().unwrap().unwrap();
        assert_eq!(f1.id, 0x132);
        let f2 = source.recv().unwrap().unwrap();
        assert_eq!(f2.id, 0x200);

        let end = source.recv();
        assert!(matches!(end, Err(PipelineError::ReplayEnd)));
    }

    #[test]
    fn replay_source_skips_unparsable_lines() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "garbage line").unwrap();
        writeln!(file, "1000.000 1 132 Rx d 0").unwrap();
        let mut source = ReplaySource::open(file.path()).unwrap();
        let frame = source.recv().unwrap().unwrap();
        assert_eq!(frame.id, 0x132);
    }

    #[test]
    fn reader_batches_into_rx_fifo_until_shutdown() {
        struct CountingSource {
            remaining: u32,
        }
        impl FrameSource for CountingSource {
            fn recv(&mut self) -> Result<Option<Frame>, PipelineError> {
                if self.remaining == 0 {
                    return Err(PipelineError::ReplayEnd);
                }
                self.remaining -= 1;
                Ok(Some(Frame::new(0, 0x1, false, true, &[0], 0.0)))
            }
        }

        let rx_fifo = queue();
        let cfg_toml = r#"
            bus_name = "can0"
            dbc_file = "v.dbc"
            can_filter = ["A"]
        "#;
        let cfg = crate::config::load_config_from_str(cfg_toml).unwrap();
        let mut reader = Reader::new(Box::new(CountingSource { remaining: 5 }), rx_fifo.clone(), &cfg);
        let shutdown = AtomicBool::new(false);
        let result = reader.run(&shutdown);
        assert!(matches!(result, Err(PipelineError::ReplayEnd)));
        assert_eq!(rx_fifo.len(), 5);
    }
}
