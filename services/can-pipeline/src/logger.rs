//! Archival logger state machine: IDLE/ACTIVE, directive handling, gear- and
//! signal-driven auto start/stop, flag-arming, disk-full gating, and the
//! flagged-rename-on-close contract (I4).

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use can_dbc::DecodedRecord;
use canserver_core::{Frame, PipelineError};

use crate::config::PipelineConfig;
use crate::directive::Directive;

/// Gear-driven auto-stop fires after this many seconds without a gear frame.
const GEAR_WATCHDOG_TIMEOUT_S: f64 = 2.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogState {
    Idle,
    Active,
}

struct LogSession {
    writer: BufWriter<File>,
    path: PathBuf,
    flag_armed: bool,
}

pub struct Logger {
    log_dir: PathBuf,
    channel_name: String,
    state: LogState,
    session: Option<LogSession>,
    auto_flag: bool,
    disk_full_latch: bool,
    restore_auto_log_on_disk_recovery: bool,
    logging_running: Arc<AtomicBool>,

    vehicle_gear_frame_id: Option<u32>,
    vehicle_gear_signal_name: Option<String>,
    vehicle_gear_logging_states: Vec<String>,
    last_driving_seen: Option<f64>,

    auto_logging_frame_id: Option<u32>,
    auto_logging_signal_name: Option<String>,
    auto_logging_on_value: Option<f64>,

    flag_log_frame_id: Option<u32>,
    flag_log_signal_name: Option<String>,
    flag_log_state: Option<String>,
    flag_log_signal_duration: Option<f64>,
    flag_on_since: Option<f64>,
}

impl Logger {
    pub fn new(cfg: &PipelineConfig, logging_running: Arc<AtomicBool>) -> Self {
        Logger {
            log_dir: cfg.log_dir.clone(),
            channel_name: cfg.bus_name.clone(),
            state: LogState::Idle,
            session: None,
            auto_flag: false,
            disk_full_latch: false,
            restore_auto_log_on_disk_recovery: cfg.restore_auto_log_on_disk_recovery,
            logging_running,

            vehicle_gear_frame_id: cfg.vehicle_gear_frame_id,
            vehicle_gear_signal_name: cfg.vehicle_gear_signal_name.clone(),
            vehicle_gear_logging_states: cfg.vehicle_gear_logging_states.clone(),
            last_driving_seen: None,

            auto_logging_frame_id: cfg.auto_logging_frame_id,
            auto_logging_signal_name: cfg.auto_logging_signal_name.clone(),
            auto_logging_on_value: cfg.auto_logging_on_value,

            flag_log_frame_id: cfg.flag_log_frame_id,
            flag_log_signal_name: cfg.flag_log_signal_name.clone(),
            flag_log_state: cfg.flag_log_state.clone(),
            flag_log_signal_duration: cfg.flag_log_signal_duration,
            flag_on_since: None,
        }
    }

    pub fn state(&self) -> LogState {
        self.state
    }

    pub fn is_flag_armed(&self) -> bool {
        self.session.as_ref().is_some_and(|s| s.flag_armed)
    }

    /// Apply a control-plane directive.
    pub fn handle_directive(&mut self, directive: Directive, now_name: &str) -> Result<(), PipelineError> {
        match directive {
            Directive::Start => {
                if self.state == LogState::Idle {
                    if self.disk_full_latch {
                        tracing::info!(channel = %self.channel_name, "refusing start: disk full");
                    } else {
                        self.open_session(now_name)?;
                    }
                }
            }
            Directive::Stop => {
                if self.state == LogState::Active {
                    self.close_session()?;
                }
            }
            Directive::AutoOn => {
                if self.state == LogState::Idle && self.disk_full_latch {
                    // refuse
                } else {
                    self.auto_flag = true;
                }
            }
            Directive::AutoOff => {
                self.auto_flag = false;
            }
            Directive::TimeReset => {
                self.last_driving_seen = None;
                self.flag_on_since = None;
            }
        }
        Ok(())
    }

    /// Observe one decoded record and evaluate the automatic policies
    /// (gear-driven start/stop, flag arming). `now` is the record's own
    /// frame timestamp, not wall-clock.
    pub fn observe_decoded(&mut self, record: &DecodedRecord, now: f64, session_name: &str) -> Result<(), PipelineError> {
        self.evaluate_gear(record, now, session_name)?;
        self.evaluate_flag_arm(record, now);
        Ok(())
    }

    /// Starts on entering a driving gear (if auto-flagged); stops immediately
    /// on leaving one. Silence (no gear frames at all) is the watchdog's job,
    /// not this function's — see `check_gear_watchdog`.
    fn evaluate_gear(&mut self, record: &DecodedRecord, now: f64, session_name: &str) -> Result<(), PipelineError> {
        let (Some(frame_id), Some(signal_name)) = (self.vehicle_gear_frame_id, &self.vehicle_gear_signal_name) else {
            return Ok(());
        };
        if record.frame_id != frame_id {
            return Ok(());
        }
        let Some(decoded) = record.signals.get(signal_name) else {
            return Ok(());
        };
        let is_driving = decoded
            .state
            .as_deref()
            .map(|s| self.vehicle_gear_logging_states.iter().any(|g| g == s))
            .unwrap_or(false);

        if is_driving {
            self.last_driving_seen = Some(now);
            if self.auto_flag && self.state == LogState::Idle && !self.disk_full_latch {
                self.open_session(session_name)?;
            }
        } else if self.state == LogState::Active {
            self.close_session()?;
        }
        Ok(())
    }

    /// Periodic watchdog check, independent of any specific decoded record:
    /// closes an auto-started session if no gear frame has been seen for
    /// `GEAR_WATCHDOG_TIMEOUT_S`. Call this on a steady tick, not just when
    /// a gear frame arrives, so bus silence (not just a parked gear state)
    /// also stops an auto session.
    pub fn check_gear_watchdog(&mut self, now: f64) -> Result<(), PipelineError> {
        if self.vehicle_gear_frame_id.is_none() {
            return Ok(());
        }
        if let Some(last) = self.last_driving_seen {
            if now - last >= GEAR_WATCHDOG_TIMEOUT_S && self.state == LogState::Active {
                self.close_session()?;
            }
        }
        Ok(())
    }

    fn evaluate_flag_arm(&mut self, record: &DecodedRecord, now: f64) {
        let (Some(frame_id), Some(signal_name), Some(target_state), Some(duration)) = (
            self.flag_log_frame_id,
            &self.flag_log_signal_name,
            &self.flag_log_state,
            self.flag_log_signal_duration,
        ) else {
            return;
        };
        if record.frame_id != frame_id {
            return;
        }
        let Some(decoded) = record.signals.get(signal_name) else {
            return;
        };
        let matches = decoded.state.as_deref() == Some(target_state.as_str());
        if matches {
            let on_since = *self.flag_on_since.get_or_insert(now);
            if now - on_since >= duration {
                if let Some(session) = &mut self.session {
                    session.flag_armed = true;
                }
            }
        } else {
            self.flag_on_since = None;
        }
    }

    /// Apply an auto-on/off signal observed on the decoded stream (separate
    /// from gear): `auto_logging_frame_id`/`signal_name`/`on_value`.
    pub fn evaluate_auto_logging_signal(&mut self, record: &DecodedRecord) {
        let (Some(frame_id), Some(signal_name), Some(on_value)) = (
            self.auto_logging_frame_id,
            &self.auto_logging_signal_name,
            self.auto_logging_on_value,
        ) else {
            return;
        };
        if record.frame_id != frame_id {
            return;
        }
        if let Some(decoded) = record.signals.get(signal_name) {
            self.auto_flag = (decoded.value - on_value).abs() < f64::EPSILON;
        }
    }

    /// Report an externally computed disk-usage percentage. Crossing 90%
    /// upward forces ACTIVE -> IDLE and clears the auto flag; crossing back
    /// down clears the latch, restoring the auto flag only if configured to.
    pub fn report_disk_usage_pct(&mut self, pct: f64) -> Result<(), PipelineError> {
        let was_full = self.disk_full_latch;
        let is_full = pct > 90.0;
        if is_full && !was_full {
            self.disk_full_latch = true;
            self.auto_flag = false;
            if self.state == LogState::Active {
                self.close_session()?;
            }
            tracing::info!(channel = %self.channel_name, pct, "disk full: forcing logger idle");
        } else if !is_full && was_full {
            self.disk_full_latch = false;
            if self.restore_auto_log_on_disk_recovery {
                self.auto_flag = true;
            }
            tracing::info!(channel = %self.channel_name, pct, "disk usage recovered");
        }
        Ok(())
    }

    /// Append a batch of raw frames while ACTIVE. A silent no-op while IDLE.
    pub fn write_batch(&mut self, frames: &[Frame]) -> Result<(), PipelineError> {
        let Some(session) = &mut self.session else {
            return Ok(());
        };
        for frame in frames {
            let line = canserver_core::asc::encode_line(frame);
            if let Err(e) = writeln!(session.writer, "{line}") {
                tracing::error!(channel = %self.channel_name, error = %e, "asc append failed");
                drop(std::mem::take(&mut self.session));
                self.state = LogState::Idle;
                return Err(PipelineError::Io(e));
            }
        }
        Ok(())
    }

    fn open_session(&mut self, name: &str) -> Result<(), PipelineError> {
        fs::create_dir_all(&self.log_dir)?;
        let path = self.log_dir.join(format!("{name}_{}.asc", self.channel_name));
        let writer = BufWriter::new(File::create(&path)?);
        self.session = Some(LogSession {
            writer,
            path,
            flag_armed: false,
        });
        self.state = LogState::Active;
        self.logging_running.store(true, Ordering::Relaxed);
        tracing::info!(channel = %self.channel_name, "logger started");
        Ok(())
    }

    fn close_session(&mut self) -> Result<(), PipelineError> {
        let Some(mut session) = self.session.take() else {
            return Ok(());
        };
        session.writer.flush()?;
        self.state = LogState::Idle;
        self.logging_running.store(false, Ordering::Relaxed);
        if session.flag_armed {
            let flagged_dir = self.log_dir.join("flagged");
            fs::create_dir_all(&flagged_dir)?;
            let dest = flagged_dir.join(session.path.file_name().expect("session path has a file name"));
            fs::rename(&session.path, &dest)?;
            tracing::info!(channel = %self.channel_name, path = %dest.display(), "logger stopped (flagged)");
        } else {
            tracing::info!(channel = %self.channel_name, "logger stopped");
        }
        Ok(())
    }

    #[cfg(test)]
    fn session_path(&self) -> Option<&Path> {
        self.session.as_ref().map(|s| s.path.as_path())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn cfg(dir: &Path) -> PipelineConfig {
        crate::config::load_config_from_str(&format!(
            r#"
            bus_name = "can0"
            dbc_file = "v.dbc"
            can_filter = ["A"]
            log_dir = "{}"
            "#,
            dir.display()
        ))
        .unwrap()
    }

    #[test]
    fn start_directive_opens_a_session() {
        let tmp = tempfile::tempdir().unwrap();
        let mut logger = Logger::new(&cfg(tmp.path()), Arc::new(AtomicBool::new(false)));
        logger.handle_directive(Directive::Start, "2024-01-01_00.00.00").unwrap();
        assert_eq!(logger.state(), LogState::Active);
        assert!(logger.session_path().unwrap().exists());
    }

    #[test]
    fn start_is_a_noop_while_already_active() {
        let tmp = tempfile::tempdir().unwrap();
        let mut logger = Logger::new(&cfg(tmp.path()), Arc::new(AtomicBool::new(false)));
        logger.handle_directive(Directive::Start, "2024-01-01_00.00.00").unwrap();
        let path = logger.session_path().unwrap().to_path_buf();
        logger.handle_directive(Directive::Start, "2024-01-01_00.00.01").unwrap();
        assert_eq!(logger.session_path().unwrap(), path);
    }

    #[test]
    fn start_refused_while_disk_full() {
        let tmp = tempfile::tempdir().unwrap();
        let mut logger = Logger::new(&cfg(tmp.path()), Arc::new(AtomicBool::new(false)));
        logger.report_disk_usage_pct(95.0).unwrap();
        logger.handle_directive(Directive::Start, "2024-01-01_00.00.00").unwrap();
        assert_eq!(logger.state(), LogState::Idle);
    }

    #[test]
    fn p6_flagged_stop_renames_into_flagged_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let mut logger = Logger::new(&cfg(tmp.path()), Arc::new(AtomicBool::new(false)));
        logger.handle_directive(Directive::Start, "2024-01-01_00.00.00").unwrap();
        logger.session.as_mut().unwrap().flag_armed = true;
        let original = logger.session_path().unwrap().to_path_buf();
        logger.handle_directive(Directive::Stop, "").unwrap();

        assert!(!original.exists());
        let flagged = tmp.path().join("flagged").join(original.file_name().unwrap());
        assert!(flagged.exists());
    }

    #[test]
    fn disk_full_forces_active_to_idle_and_clears_auto_flag() {
        let tmp = tempfile::tempdir().unwrap();
        let mut logger = Logger::new(&cfg(tmp.path()), Arc::new(AtomicBool::new(false)));
        logger.handle_directive(Directive::AutoOn, "").unwrap();
        logger.handle_directive(Directive::Start, "2024-01-01_00.00.00").unwrap();
        logger.report_disk_usage_pct(95.0).unwrap();
        assert_eq!(logger.state(), LogState::Idle);
        assert!(!logger.auto_flag);
    }

    #[test]
    fn auto_flag_restored_on_recovery_only_when_configured() {
        let tmp = tempfile::tempdir().unwrap();
        let toml = format!(
            r#"
            bus_name = "can0"
            dbc_file = "v.dbc"
            can_filter = ["A"]
            log_dir = "{}"
            restore_auto_log_on_disk_recovery = true
            "#,
            tmp.path().display()
        );
        let cfg = crate::config::load_config_from_str(&toml).unwrap();
        let mut logger = Logger::new(&cfg, Arc::new(AtomicBool::new(false)));
        logger.handle_directive(Directive::AutoOn, "").unwrap();
        logger.report_disk_usage_pct(95.0).unwrap();
        logger.report_disk_usage_pct(50.0).unwrap();
        assert!(logger.auto_flag);
    }

    #[test]
    fn default_does_not_restore_auto_flag_on_recovery() {
        let tmp = tempfile::tempdir().unwrap();
        let mut logger = Logger::new(&cfg(tmp.path()), Arc::new(AtomicBool::new(false)));
        logger.handle_directive(Directive::AutoOn, "").unwrap();
        logger.report_disk_usage_pct(95.0).unwrap();
        logger.report_disk_usage_pct(50.0).unwrap();
        assert!(!logger.auto_flag);
    }

    fn gear_cfg(dir: &Path) -> PipelineConfig {
        crate::config::load_config_from_str(&format!(
            r#"
            bus_name = "can0"
            dbc_file = "v.dbc"
            can_filter = ["A"]
            log_dir = "{}"
            vehicle_gear_frame_id = 512
            vehicle_gear_signal_name = "GearPosition"
            vehicle_gear_logging_states = ["Drive"]
            "#,
            dir.display()
        ))
        .unwrap()
    }

    fn gear_record(state: &str, timestamp: f64) -> DecodedRecord {
        let mut signals = HashMap::new();
        signals.insert(
            "GearPosition".to_owned(),
            can_dbc::DecodedValue {
                value: 0.0,
                state: Some(state.to_owned()),
            },
        );
        DecodedRecord {
            frame_id: 512,
            message_name: "Gear".to_owned(),
            signals,
            timestamp,
        }
    }

    #[test]
    fn gear_driven_auto_start() {
        let tmp = tempfile::tempdir().unwrap();
        let mut logger = Logger::new(&gear_cfg(tmp.path()), Arc::new(AtomicBool::new(false)));
        logger.handle_directive(Directive::AutoOn, "").unwrap();

        let driving = gear_record("Drive", 100.0);
        logger.observe_decoded(&driving, 100.0, "2024-01-01_00.00.00").unwrap();
        assert_eq!(logger.state(), LogState::Active);
    }

    #[test]
    fn leaving_driving_stops_immediately_even_within_watchdog_window() {
        let tmp = tempfile::tempdir().unwrap();
        let mut logger = Logger::new(&gear_cfg(tmp.path()), Arc::new(AtomicBool::new(false)));
        logger.handle_directive(Directive::AutoOn, "").unwrap();

        let driving = gear_record("Drive", 100.0);
        logger.observe_decoded(&driving, 100.0, "2024-01-01_00.00.00").unwrap();
        assert_eq!(logger.state(), LogState::Active);

        // Parked 0.5s later: well under GEAR_WATCHDOG_TIMEOUT_S, but the
        // transition out of a driving gear stops logging right away.
        let parked = gear_record("Park", 100.5);
        logger.observe_decoded(&parked, 100.5, "").unwrap();
        assert_eq!(logger.state(), LogState::Idle);
    }

    #[test]
    fn gear_watchdog_stops_on_silence_with_no_further_gear_frames() {
        let tmp = tempfile::tempdir().unwrap();
        let mut logger = Logger::new(&gear_cfg(tmp.path()), Arc::new(AtomicBool::new(false)));
        logger.handle_directive(Directive::AutoOn, "").unwrap();

        let driving = gear_record("Drive", 100.0);
        logger.observe_decoded(&driving, 100.0, "2024-01-01_00.00.00").unwrap();
        assert_eq!(logger.state(), LogState::Active);

        logger.check_gear_watchdog(101.0).unwrap();
        assert_eq!(logger.state(), LogState::Active);

        logger.check_gear_watchdog(103.0).unwrap();
        assert_eq!(logger.state(), LogState::Idle);
    }

    #[test]
    fn write_batch_is_silent_no_op_while_idle() {
        let tmp = tempfile::tempdir().unwrap();
        let mut logger = Logger::new(&cfg(tmp.path()), Arc::new(AtomicBool::new(false)));
        let frames = vec![Frame::new(0, 0x1, false, true, &[0], 0.0)];
        assert!(logger.write_batch(&frames).is_ok());
    }
}
