//! Rate-limited per-frame decoding against a DBC database.
//!
//! Implements the six-step per-frame algorithm: filter membership, rate
//! limiting keyed by last-decoded timestamp, cross-bus sender check, bit
//! decode, and a seen-error set so a single malformed message only logs
//! once.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use can_dbc::{DbcDatabase, DbcError, DecodeFilter, DecodedRecord};
use canserver_core::{DropPolicyQueue, Frame, PipelineError};

use crate::config::PipelineConfig;

const POP_TIMEOUT: Duration = Duration::from_secs(1);
const POP_MAX: usize = 256;

pub struct Decoder {
    db: DbcDatabase,
    filter: DecodeFilter,
    bus_name: String,
    min_interval_s: f64,
    last_decoded: HashMap<u32, f64>,
    seen_errors: HashSet<String>,
    decode_fifo: Arc<DropPolicyQueue<Frame>>,
}

impl Decoder {
    /// Loads the DBC, validates `bus_name`, and builds the admitted-id
    /// filter from `can_filter`. Fails with `ConfigError` (folded into
    /// `PipelineError::Config`) if the filter is empty or names an unknown
    /// message.
    pub fn setup(cfg: &PipelineConfig, decode_fifo: Arc<DropPolicyQueue<Frame>>) -> Result<Self, PipelineError> {
        let db = DbcDatabase::load(&cfg.dbc_file).map_err(to_pipeline_error)?;
        let filter = DecodeFilter::build(&db, &cfg.bus_name, &cfg.can_filter).map_err(to_pipeline_error)?;
        tracing::debug!(bus_name = %cfg.bus_name, filter_size = filter.len(), "decoder setup");
        Ok(Decoder {
            db,
            filter,
            bus_name: cfg.bus_name.clone(),
            min_interval_s: cfg.decode_interval,
            last_decoded: HashMap::new(),
            seen_errors: HashSet::new(),
            decode_fifo,
        })
    }

    /// Decode one frame per the six-step algorithm. Returns `None` for any
    /// discard reason (not filtered, rate-limited, wrong bus, decode error).
    pub fn decode_one(&mut self, frame: &Frame) -> Option<DecodedRecord> {
        if !self.filter.contains(frame.id) {
            return None;
        }
        if let Some(&last) = self.last_decoded.get(&frame.id) {
            if frame.timestamp < last + self.min_interval_s {
                return None;
            }
        }
        self.last_decoded.insert(frame.id, frame.timestamp);

        let msg = self.db.message(frame.id)?;
        if msg.sender != self.bus_name {
            return None;
        }

        match can_dbc::decode_message(msg, frame.payload()) {
            Ok(signals) => Some(DecodedRecord {
                frame_id: frame.id,
                message_name: msg.name.clone(),
                signals,
                timestamp: frame.timestamp,
            }),
            Err(e) => {
                if self.seen_errors.insert(msg.name.clone()) {
                    tracing::warn!(message = %msg.name, error = %e, "decode failure");
                }
                None
            }
        }
    }

    /// Runs until `shutdown` is set, draining `decode_fifo` in batches and
    /// forwarding decoded records to `on_decoded`.
    pub fn run(&mut self, shutdown: &AtomicBool, mut on_decoded: impl FnMut(DecodedRecord)) {
        while !shutdown.load(Ordering::Relaxed) {
            let batch = self.decode_fifo.pop_many(POP_MAX, POP_TIMEOUT);
            for frame in &batch {
                if let Some(record) = self.decode_one(frame) {
                    on_decoded(record);
                }
            }
        }
    }
}

fn to_pipeline_error(e: DbcError) -> PipelineError {
    PipelineError::Config(e.to_string())
}
