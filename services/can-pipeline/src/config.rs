//! Pipeline configuration loading.
//!
//! TOML is the sole config source; no environment variable overrides.
//! Default config path: `config.toml`, overridable by `--config`.

use serde::Deserialize;
use std::path::{Path, PathBuf};

use canserver_core::PipelineError;

// ---------------------------------------------------------------------------
// Config types (validated, defaults applied)
// ---------------------------------------------------------------------------

/// Validated pipeline configuration for one CAN channel.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub bus_name: String,
    pub dbc_file: PathBuf,
    pub decode_interval: f64,
    pub can_filter: Vec<String>,
    pub pican_duo: bool,

    pub vehicle_gear_frame_id: Option<u32>,
    pub vehicle_gear_signal_name: Option<String>,
    pub vehicle_gear_logging_states: Vec<String>,

    pub auto_logging_frame_id: Option<u32>,
    pub auto_logging_signal_name: Option<String>,
    pub auto_logging_on_value: Option<f64>,

    pub flag_log_frame_id: Option<u32>,
    pub flag_log_signal_name: Option<String>,
    pub flag_log_state: Option<String>,
    pub flag_log_signal_duration: Option<f64>,

    pub restore_auto_log_on_disk_recovery: bool,
    pub bitrate: u32,
    pub log_dir: PathBuf,
    pub panda_bind: String,
    pub fps_log_period_s: f64,
}

// ---------------------------------------------------------------------------
// Raw TOML deserialization types (Option for every field)
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
struct RawConfig {
    bus_name: Option<String>,
    dbc_file: Option<String>,
    decode_interval: Option<f64>,
    can_filter: Option<Vec<String>>,
    pican_duo: Option<bool>,

    vehicle_gear_frame_id: Option<u32>,
    vehicle_gear_signal_name: Option<String>,
    vehicle_gear_logging_states: Option<Vec<String>>,

    auto_logging_frame_id: Option<u32>,
    auto_logging_signal_name: Option<String>,
    auto_logging_on_value: Option<f64>,

    flag_log_frame_id: Option<u32>,
    flag_log_signal_name: Option<String>,
    flag_log_state: Option<String>,
    flag_log_signal_duration: Option<f64>,

    restore_auto_log_on_disk_recovery: Option<bool>,
    bitrate: Option<u32>,
    log_dir: Option<String>,
    panda_bind: Option<String>,
    fps_log_period_s: Option<f64>,
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Load pipeline config from a custom path.
pub fn load_config_from_path(path: &Path) -> Result<PipelineConfig, PipelineError> {
    let toml_str = std::fs::read_to_string(path)
        .map_err(|e| PipelineError::Config(format!("reading config file '{}': {}", path.display(), e)))?;
    load_config_from_str(&toml_str)
}

/// Load pipeline config from the default path `config.toml`.
pub fn load_config() -> Result<PipelineConfig, PipelineError> {
    load_config_from_path(Path::new("config.toml"))
}

/// Load pipeline config from a TOML string, applying validation and defaults.
pub fn load_config_from_str(toml_str: &str) -> Result<PipelineConfig, PipelineError> {
    let raw: RawConfig =
        toml::from_str(toml_str).map_err(|e| PipelineError::Config(format!("parsing config: {e}")))?;

    let bus_name = raw
        .bus_name
        .ok_or_else(|| PipelineError::Config("missing required field 'bus_name'".to_owned()))?;

    let dbc_file = raw
        .dbc_file
        .ok_or_else(|| PipelineError::Config("missing required field 'dbc_file'".to_owned()))?;

    let can_filter = raw
        .can_filter
        .ok_or_else(|| PipelineError::Config("missing required field 'can_filter'".to_owned()))?;
    if can_filter.is_empty() {
        return Err(PipelineError::Config(
            "can_filter must list at least one message name".to_owned(),
        ));
    }

    Ok(PipelineConfig {
        bus_name,
        dbc_file: PathBuf::from(dbc_file),
        decode_interval: raw.decode_interval.unwrap_or(0.5),
        can_filter,
        pican_duo: raw.pican_duo.unwrap_or(false),

        vehicle_gear_frame_id: raw.vehicle_gear_frame_id,
        vehicle_gear_signal_name: raw.vehicle_gear_signal_name,
        vehicle_gear_logging_states: raw.vehicle_gear_logging_states.unwrap_or_default(),

        auto_logging_frame_id: raw.auto_logging_frame_id,
        auto_logging_signal_name: raw.auto_logging_signal_name,
        auto_logging_on_value: raw.auto_logging_on_value,

        flag_log_frame_id: raw.flag_log_frame_id,
        flag_log_signal_name: raw.flag_log_signal_name,
        flag_log_state: raw.flag_log_state,
        flag_log_signal_duration: raw.flag_log_signal_duration,

        restore_auto_log_on_disk_recovery: raw.restore_auto_log_on_disk_recovery.unwrap_or(false),
        bitrate: raw.bitrate.unwrap_or(500_000),
        log_dir: PathBuf::from(raw.log_dir.unwrap_or_else(|| "/var/lib/canserver/asc_logs".to_owned())),
        panda_bind: raw.panda_bind.unwrap_or_else(|| "127.0.0.1:1338".to_owned()),
        fps_log_period_s: raw.fps_log_period_s.unwrap_or(60.0),
    })
}
