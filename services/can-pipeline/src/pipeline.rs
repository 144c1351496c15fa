//! Wires Reader, Fan-out, Decoder and Logger together on three OS threads
//! per channel, coordinated only through `DropPolicyQueue`s and a handful
//! of single-writer atomics (`logging_running`, the shutdown flag).
//!
//! SIGINT is handled once, at process start, by flipping a shared
//! `AtomicBool` that every worker's blocking-with-timeout loop observes —
//! the OS-thread equivalent of masking SIGINT around fork in a
//! process-per-worker design, since threads in one process already share a
//! single signal disposition.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use can_dbc::DecodedRecord;
use canserver_core::{DropPolicyQueue, Frame, PipelineError};

use crate::config::PipelineConfig;
use crate::decoder::Decoder;
use crate::directive::Directive;
use crate::fanout::FanOut;
use crate::logger::Logger;
use crate::reader::FrameSource;

const RX_FIFO_CAPACITY: usize = 10_000;
const DECODE_FIFO_CAPACITY: usize = 10_000;
const LOG_FIFO_CAPACITY: usize = 10_000;
const LOGGER_POP_TIMEOUT: Duration = Duration::from_secs(1);
const LOGGER_POP_MAX: usize = 256;

/// Installs a process-wide SIGINT handler that flips both `shutdown` (so
/// worker loops exit) and `interrupted` (so `main` can distinguish a
/// signal-caused exit, code 130, from a clean replay-EOF shutdown, code 0).
/// Safe to call once per process; a second call is a configuration error
/// upstream, not handled here.
pub fn install_shutdown_handler(shutdown: Arc<AtomicBool>, interrupted: Arc<AtomicBool>) -> Result<(), PipelineError> {
    ctrlc::set_handler(move || {
        tracing::info!("received shutdown signal");
        interrupted.store(true, Ordering::Relaxed);
        shutdown.store(true, Ordering::Relaxed);
    })
    .map_err(|e| PipelineError::Config(format!("failed to install signal handler: {e}")))
}

/// One channel's full pipeline: Reader+Fan-out thread, Decoder thread,
/// Logger thread, wired by the three queues and the shared atomics.
pub struct ChannelPipeline {
    pub directive_tx: mpsc::Sender<Directive>,
}

impl ChannelPipeline {
    /// Spawns the three worker threads. Returns once they are spawned (not
    /// once they finish); join via `shutdown` + `thread::JoinHandle`s kept
    /// by the caller if needed.
    pub fn spawn(
        cfg: PipelineConfig,
        source: Box<dyn FrameSource>,
        shutdown: Arc<AtomicBool>,
    ) -> Result<(Self, Vec<thread::JoinHandle<()>>), PipelineError> {
        let rx_fifo = Arc::new(DropPolicyQueue::<Frame>::new(RX_FIFO_CAPACITY));
        let decode_fifo = Arc::new(DropPolicyQueue::<Frame>::new(DECODE_FIFO_CAPACITY));
        let log_fifo = Arc::new(DropPolicyQueue::<Frame>::new(LOG_FIFO_CAPACITY));
        let logging_running = Arc::new(AtomicBool::new(false));

        let decoder = Decoder::setup(&cfg, decode_fifo.clone())?;
        let logger = Logger::new(&cfg, logging_running.clone());

        let (directive_tx, directive_rx) = mpsc::channel::<Directive>();
        let (decoded_tx, decoded_rx) = mpsc::channel::<DecodedRecord>();

        let mut handles = Vec::with_capacity(3);

        // Reader + Fan-out thread.
        {
            let rx_fifo = rx_fifo.clone();
            let decode_fifo = decode_fifo.clone();
            let log_fifo = log_fifo.clone();
            let logging_running = logging_running.clone();
            let shutdown = shutdown.clone();
            let mut reader = crate::reader::Reader::new(source, rx_fifo.clone(), &cfg);
            handles.push(thread::spawn(move || {
                let reader_shutdown = shutdown.clone();
                let fanout = FanOut::new(rx_fifo, decode_fifo, log_fifo, logging_running);
                let fanout_shutdown = shutdown.clone();
                thread::scope(|s| {
                    s.spawn(|| {
                        if let Err(e) = reader.run(&reader_shutdown) {
                            tracing::info!(error = %e, "reader stopped");
                            reader_shutdown.store(true, Ordering::Relaxed);
                        }
                    });
                    s.spawn(|| {
                        fanout.run(&fanout_shutdown);
                    });
                });
            }));
        }

        // Decoder thread. Decoded records are forwarded to the logger thread
        // (for the gear/flag/auto-signal policies) over `decoded_tx`; the
        // broadcast hub that would also consume them is an external
        // collaborator, not built here.
        {
            let shutdown = shutdown.clone();
            let channel_name = cfg.bus_name.clone();
            handles.push(thread::Builder::new()
                .name(format!("decoder-{channel_name}"))
                .spawn(move || {
                    let mut decoder = decoder;
                    decoder.run(&shutdown, |record| {
                        let _ = decoded_tx.send(record);
                    });
                })
                .expect("spawn decoder thread"));
        }

        // Logger thread.
        {
            let shutdown = shutdown.clone();
            handles.push(thread::Builder::new()
                .name(format!("logger-{}", cfg.bus_name))
                .spawn(move || {
                    let mut logger = logger;
                    // Tracks the decoded-record timeline (wall-clock epoch
                    // seconds when live, a replay trace's own timeline when
                    // replaying) paired with the real instant it was last
                    // observed, so the watchdog tick below can extrapolate
                    // "now" on that same timeline even while the bus is
                    // fully silent and no new record ever arrives.
                    let mut clock: Option<(f64, Instant)> = None;
                    while !shutdown.load(Ordering::Relaxed) {
                        if let Ok(directive) = directive_rx.try_recv() {
                            if let Err(e) = logger.handle_directive(directive, &session_name_now()) {
                                tracing::error!(error = %e, "directive handling failed");
                            }
                        }

                        while let Ok(record) = decoded_rx.try_recv() {
                            clock = Some((record.timestamp, Instant::now()));
                            logger.evaluate_auto_logging_signal(&record);
                            if let Err(e) = logger.observe_decoded(&record, record.timestamp, &session_name_now()) {
                                tracing::error!(error = %e, "logger policy evaluation failed");
                            }
                        }

                        // Ticks every loop iteration off real elapsed time, not
                        // just when a decoded record happens to arrive, so the
                        // 2s silence watchdog still fires when the bus goes
                        // fully quiet.
                        if let Some((last_ts, observed_at)) = clock {
                            let now = last_ts + observed_at.elapsed().as_secs_f64();
                            if let Err(e) = logger.check_gear_watchdog(now) {
                                tracing::error!(error = %e, "gear watchdog check failed");
                            }
                        }

                        let batch = log_fifo.pop_many(LOGGER_POP_MAX, LOGGER_POP_TIMEOUT);
                        if !batch.is_empty() {
                            if let Err(e) = logger.write_batch(&batch) {
                                tracing::error!(error = %e, "logger write failed");
                            }
                        }
                    }
                })
                .expect("spawn logger thread"));
        }

        Ok((ChannelPipeline { directive_tx }, handles))
    }

    pub fn send_directive(&self, directive: Directive) -> Result<(), PipelineError> {
        self.directive_tx
            .send(directive)
            .map_err(|_| PipelineError::Config("logger thread has exited".to_owned()))
    }
}

fn session_name_now() -> String {
    chrono::Local::now().format("%Y-%m-%d_%H.%M.%S").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_name_now_is_parseable_by_chrono_format() {
        let name = session_name_now();
        assert!(chrono::NaiveDateTime::parse_from_str(&name, "%Y-%m-%d_%H.%M.%S").is_ok());
    }
}
