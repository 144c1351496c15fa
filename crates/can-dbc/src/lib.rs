//! A thin, read-only wrapper around a parsed DBC database: frame-id lookup,
//! the per-channel admitted-id filter, and the signal bit-extraction math.
//!
//! DBC parsing itself is delegated to `dbc-rs`; this crate only adapts its
//! message/signal model into the shapes the decoder needs (a fast id ->
//! message index, pre-resolved value-description tables, and a bit-level
//! extractor), following the same "extract signal defs once, decode many"
//! split as a DBC-to-MDF4 channel logger.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::Path;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DbcError {
    #[error("failed to read dbc file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse dbc: {0}")]
    Parse(String),
    #[error("include_list must not be empty")]
    EmptyFilter,
    #[error("filter message '{0}' not found in dbc")]
    UnknownMessage(String),
    #[error("bus_name '{0}' does not appear as the sender of any message in the dbc")]
    UnknownSender(String),
}

/// Byte order as declared by a DBC signal's `@0`/`@1` bit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteOrder {
    LittleEndian,
    BigEndian,
}

/// One signal's bit layout and physical-value conversion, plus any VAL_
/// enumeration table resolved at load time.
#[derive(Debug, Clone)]
pub struct SignalSpec {
    pub name: String,
    pub start_bit: u16,
    pub bit_length: u16,
    pub byte_order: ByteOrder,
    pub is_signed: bool,
    pub scale: f64,
    pub offset: f64,
    pub value_descriptions: Option<HashMap<i64, String>>,
}

/// One DBC message: its frame id, symbolic name, single declared sender bus,
/// and its signals.
#[derive(Debug, Clone)]
pub struct MessageDef {
    pub id: u32,
    pub name: String,
    /// A DBC message has exactly one declared sender bus.
    pub sender: String,
    pub signals: Vec<SignalSpec>,
}

/// Read-only index over a parsed DBC: frame id -> message definition.
/// Loaded once at startup, never mutated.
pub struct DbcDatabase {
    by_id: HashMap<u32, MessageDef>,
    by_name: HashMap<String, u32>,
}

impl DbcDatabase {
    /// Parse a DBC file from disk.
    pub fn load(path: &Path) -> Result<Self, DbcError> {
        let contents = std::fs::read_to_string(path).map_err(|source| DbcError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_str(&contents)
    }

    /// Parse DBC contents already in memory.
    pub fn from_str(contents: &str) -> Result<Self, DbcError> {
        let dbc = dbc_rs::Dbc::parse(contents).map_err(|e| DbcError::Parse(e.to_string()))?;

        let mut by_id = HashMap::new();
        let mut by_name = HashMap::new();
        for message in dbc.messages().iter() {
            let id = message.id();
            let name = message.name().to_owned();
            let sender = message.sender().to_owned();
            let signals = message
                .signals()
                .iter()
                .map(|sig| SignalSpec {
                    name: sig.name().to_owned(),
                    start_bit: sig.start_bit(),
                    bit_length: sig.length(),
                    byte_order: match sig.byte_order() {
                        dbc_rs::ByteOrder::LittleEndian => ByteOrder::LittleEndian,
                        dbc_rs::ByteOrder::BigEndian => ByteOrder::BigEndian,
                    },
                    is_signed: !sig.is_unsigned(),
                    scale: sig.factor(),
                    offset: sig.offset(),
                    value_descriptions: dbc.value_descriptions_for_signal(id, sig.name()).map(|vd| {
                        vd.iter()
                            .map(|(value, desc)| (value as i64, desc.to_owned()))
                            .collect()
                    }),
                })
                .collect();
            by_name.insert(name.clone(), id);
            by_id.insert(
                id,
                MessageDef {
                    id,
                    name,
                    sender,
                    signals,
                },
            );
        }

        Ok(DbcDatabase { by_id, by_name })
    }

    pub fn message(&self, id: u32) -> Option<&MessageDef> {
        self.by_id.get(&id)
    }

    pub fn frame_id_for_name(&self, name: &str) -> Option<u32> {
        self.by_name.get(name).copied()
    }

    /// Distinct sender bus names declared across all messages in the database.
    pub fn senders(&self) -> BTreeSet<&str> {
        self.by_id.values().map(|m| m.sender.as_str()).collect()
    }
}

/// The set of frame ids admitted for decode on a channel, built once from a
/// config list of symbolic message names.
#[derive(Debug, Clone)]
pub struct DecodeFilter {
    ids: HashSet<u32>,
}

impl DecodeFilter {
    /// Build the filter as the union of frame ids for each symbolic name in
    /// `include_list`, validating `bus_name` appears as the sender of at
    /// least one message in `db`.
    pub fn build(db: &DbcDatabase, bus_name: &str, include_list: &[String]) -> Result<Self, DbcError> {
        if include_list.is_empty() {
            return Err(DbcError::EmptyFilter);
        }
        if !db.senders().contains(bus_name) {
            return Err(DbcError::UnknownSender(bus_name.to_owned()));
        }
        let mut ids = HashSet::with_capacity(include_list.len());
        for name in include_list {
            let id = db
                .frame_id_for_name(name)
                .ok_or_else(|| DbcError::UnknownMessage(name.clone()))?;
            ids.insert(id);
        }
        Ok(DecodeFilter { ids })
    }

    pub fn contains(&self, id: u32) -> bool {
        self.ids.contains(&id)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

/// A decoded signal: its physical value, plus the matching VAL_ enumerated
/// state name if the DBC declares one for this raw value.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedValue {
    pub value: f64,
    pub state: Option<String>,
}

/// A fully decoded message: one per admitted, rate-limit-passing frame.
#[derive(Debug, Clone)]
pub struct DecodedRecord {
    pub frame_id: u32,
    pub message_name: String,
    pub signals: HashMap<String, DecodedValue>,
    pub timestamp: f64,
}

#[derive(Debug, Error, PartialEq)]
#[error("signal '{signal}' needs {needed_bits} bits from start_bit {start_bit} but payload is only {available_bits} bits")]
pub struct DecodeError {
    pub signal: String,
    pub start_bit: u16,
    pub needed_bits: u16,
    pub available_bits: u16,
}

/// Decode every signal of `msg` out of `payload` (the frame's raw data
/// bytes, `dlc` long). Fails fast on the first signal whose bit range
/// doesn't fit in the payload — real DBC decode raising on malformed data.
pub fn decode_message(msg: &MessageDef, payload: &[u8]) -> Result<HashMap<String, DecodedValue>, DecodeError> {
    let available_bits = (payload.len() * 8) as u16;
    let mut out = HashMap::with_capacity(msg.signals.len());
    for sig in &msg.signals {
        let needed = sig.start_bit + sig.bit_length;
        if needed > available_bits {
            return Err(DecodeError {
                signal: sig.name.clone(),
                start_bit: sig.start_bit,
                needed_bits: sig.bit_length,
                available_bits,
            });
        }
        let raw = extract_signal_raw(payload, sig.start_bit, sig.bit_length, sig.byte_order);
        let value = apply_conversion(raw, sig.is_signed, sig.bit_length, sig.scale, sig.offset);
        let state = sig
            .value_descriptions
            .as_ref()
            .and_then(|table| table.get(&(raw as i64)))
            .cloned();
        out.insert(sig.name.clone(), DecodedValue { value, state });
    }
    Ok(out)
}

/// Extract a raw signal value from CAN frame data.
pub fn extract_signal_raw(data: &[u8], start_bit: u16, bit_length: u16, byte_order: ByteOrder) -> u64 {
    if data.is_empty() || bit_length == 0 || bit_length > 64 {
        return 0;
    }
    match byte_order {
        ByteOrder::LittleEndian => extract_le(data, start_bit, bit_length),
        ByteOrder::BigEndian => extract_be(data, start_bit, bit_length),
    }
}

fn extract_le(data: &[u8], start_bit: u16, bit_length: u16) -> u64 {
    let start_byte = (start_bit / 8) as usize;
    let bit_offset = start_bit % 8;

    let mut value: u64 = 0;
    let bytes_needed = ((bit_offset as usize + bit_length as usize) + 7) / 8;

    for i in 0..bytes_needed.min(8) {
        if start_byte + i < data.len() {
            value |= (data[start_byte + i] as u64) << (i * 8);
        }
    }

    value >>= bit_offset;
    value & mask_for(bit_length)
}

fn extract_be(data: &[u8], start_bit: u16, bit_length: u16) -> u64 {
    // DBC Motorola bit numbering: start_bit is the MSB, counting down through
    // successive bytes.
    let start_byte = (start_bit / 8) as usize;
    let mut current_bit = (start_bit % 8) as i16;
    let mut current_byte = start_byte;
    let mut bits_remaining = bit_length;
    let mut value: u64 = 0;

    while bits_remaining > 0 && current_byte < data.len() {
        let bits_available = current_bit + 1;
        let bits_to_take = bits_available.min(bits_remaining as i16);
        let shift = current_bit + 1 - bits_to_take;
        let mask = ((1u64 << bits_to_take) - 1) as u8;
        let byte_value = (data[current_byte] >> shift) & mask;

        value = (value << bits_to_take) | byte_value as u64;
        bits_remaining -= bits_to_take as u16;
        current_byte += 1;
        current_bit = 7;
    }

    value
}

fn mask_for(bit_length: u16) -> u64 {
    if bit_length >= 64 {
        u64::MAX
    } else {
        (1u64 << bit_length) - 1
    }
}

/// Sign-extend a raw value of `bit_length` bits.
pub fn sign_extend(value: u64, bit_length: u16) -> i64 {
    if bit_length == 0 || bit_length >= 64 {
        return value as i64;
    }
    let sign_bit = 1u64 << (bit_length - 1);
    if value & sign_bit != 0 {
        let mask = !mask_for(bit_length);
        (value | mask) as i64
    } else {
        value as i64
    }
}

/// Apply scale/offset conversion: `physical = raw * scale + offset`.
pub fn apply_conversion(raw: u64, is_signed: bool, bit_length: u16, scale: f64, offset: f64) -> f64 {
    let value = if is_signed {
        sign_extend(raw, bit_length) as f64
    } else {
        raw as f64
    };
    value * scale + offset
}
