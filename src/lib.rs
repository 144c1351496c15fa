//! Core primitives shared by every worker in the CAN telemetry pipeline:
//! the [`Frame`] wire type, the [`queue::DropPolicyQueue`] backpressure
//! primitive, the ASC trace codec, periodic rate counters, and the
//! crate-wide error type.

pub mod asc;
pub mod counters;
pub mod error;
pub mod frame;
pub mod queue;

pub use error::PipelineError;
pub use frame::Frame;
pub use queue::{DropPolicy, DropPolicyQueue};
