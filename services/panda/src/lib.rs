//! panda: UDP fan-out server implementing the Panda handshake/filter
//! protocol for external native tools.

pub mod protocol;
pub mod server;
