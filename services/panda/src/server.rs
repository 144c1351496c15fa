//! `PandaClient` bookkeeping and the broadcast/heartbeat ticks. Kept
//! independent of the actual `UdpSocket` so the admission and dedup logic
//! (P7, P8, S5, S6) can be driven deterministically in tests.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;

use canserver_core::Frame;

use crate::protocol::{ControlMessage, ProtocolVersion, ALL_BUSES};

const HEARTBEAT_TIMEOUT_S: f64 = 10.0;

pub struct PandaClient {
    pub version: ProtocolVersion,
    pub send_all: bool,
    pub filters: HashMap<u8, HashSet<u16>>,
    pub last_seen: f64,
}

impl PandaClient {
    fn new(version: ProtocolVersion, now: f64) -> Self {
        PandaClient {
            version,
            send_all: false,
            filters: HashMap::new(),
            last_seen: now,
        }
    }

    fn add_filter(&mut self, entries: &[(u8, u16)]) {
        for &(bus, id) in entries {
            self.filters.entry(bus).or_default().insert(id);
        }
    }

    fn del_filter(&mut self, entries: &[(u8, u16)]) {
        for &(bus, id) in entries {
            if let Some(set) = self.filters.get_mut(&bus) {
                set.remove(&id);
            }
        }
    }

    fn admits(&self, bus: u8, id: u32) -> bool {
        match self.version {
            ProtocolVersion::V1 => true,
            ProtocolVersion::V2 => {
                if self.send_all {
                    return true;
                }
                let id = id as u16;
                self.filters.get(&ALL_BUSES).is_some_and(|s| s.contains(&id))
                    || self.filters.get(&bus).is_some_and(|s| s.contains(&id))
            }
        }
    }
}

/// Dispatches inbound datagrams to per-address client state and produces
/// outbound wire-frames for the 120 Hz broadcast tick.
#[derive(Default)]
pub struct PandaRegistry {
    clients: HashMap<SocketAddr, PandaClient>,
}

/// What the caller should do in response to a processed datagram.
pub enum DatagramEffect {
    /// Send this ack packet back to the sender.
    SendAck,
    /// No reply needed.
    None,
}

impl PandaRegistry {
    pub fn new() -> Self {
        PandaRegistry::default()
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    pub fn client(&self, addr: SocketAddr) -> Option<&PandaClient> {
        self.clients.get(&addr)
    }

    /// Processes one inbound datagram from `addr` at clock value `now`.
    /// Unparsable datagrams are ignored (§7 `PandaProtocolError`): no panic,
    /// no disconnect.
    pub fn handle_datagram(&mut self, addr: SocketAddr, data: &[u8], now: f64) -> DatagramEffect {
        let Some(msg) = crate::protocol::parse_datagram(data) else {
            return DatagramEffect::None;
        };

        match msg {
            ControlMessage::HelloV1 => {
                self.clients
                    .entry(addr)
                    .and_modify(|c| c.last_seen = now)
                    .or_insert_with(|| PandaClient::new(ProtocolVersion::V1, now));
                DatagramEffect::SendAck
            }
            ControlMessage::HelloV2 => {
                self.clients
                    .entry(addr)
                    .and_modify(|c| c.last_seen = now)
                    .or_insert_with(|| PandaClient::new(ProtocolVersion::V2, now));
                DatagramEffect::SendAck
            }
            ControlMessage::Bye => {
                self.clients.remove(&addr);
                DatagramEffect::None
            }
            ControlMessage::FilterAdd(entries) => {
                if let Some(client) = self.clients.get_mut(&addr) {
                    client.last_seen = now;
                    client.add_filter(&entries);
                }
                DatagramEffect::None
            }
            ControlMessage::FilterDel(entries) => {
                if let Some(client) = self.clients.get_mut(&addr) {
                    client.last_seen = now;
                    client.del_filter(&entries);
                }
                DatagramEffect::None
            }
            ControlMessage::SendAllOn => {
                if let Some(client) = self.clients.get_mut(&addr) {
                    client.last_seen = now;
                    client.send_all = true;
                }
                DatagramEffect::None
            }
            ControlMessage::SendAllOff => {
                if let Some(client) = self.clients.get_mut(&addr) {
                    client.last_seen = now;
                    client.send_all = false;
                    client.filters.clear();
                }
                DatagramEffect::None
            }
        }
    }

    /// Disconnects any client silent for more than 10 s as of `now`.
    pub fn expire_stale(&mut self, now: f64) -> Vec<SocketAddr> {
        let stale: Vec<SocketAddr> = self
            .clients
            .iter()
            .filter(|(_, c)| now - c.last_seen > HEARTBEAT_TIMEOUT_S)
            .map(|(addr, _)| *addr)
            .collect();
        for addr in &stale {
            self.clients.remove(addr);
        }
        stale
    }

    /// One broadcast tick: dedups `frames` (latest per id wins) in
    /// ascending id order, then for every client returns the wire-frames it
    /// admits, in that same ascending order.
    pub fn broadcast_tick(&self, bus: u8, frames: &[Frame]) -> HashMap<SocketAddr, Vec<Vec<u8>>> {
        let mut latest: HashMap<u32, Frame> = HashMap::new();
        for frame in frames {
            latest.insert(frame.id, *frame);
        }
        let mut ids: Vec<u32> = latest.keys().copied().collect();
        ids.sort_unstable();

        let mut out = HashMap::new();
        for (&addr, client) in &self.clients {
            let mut wire_frames = Vec::new();
            for id in &ids {
                let frame = &latest[id];
                if client.admits(bus, frame.id) {
                    wire_frames.push(crate::protocol::encode_wire_frame(bus, frame));
                }
            }
            out.insert(addr, wire_frames);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        format!("192.0.2.5:{port}").parse().unwrap()
    }

    fn frame(id: u32) -> Frame {
        Frame::new(0, id, false, true, &[0], 0.0)
    }

    #[test]
    fn s5_hello_creates_v1_client_and_bye_removes_it() {
        let mut reg = PandaRegistry::new();
        let a = addr(51000);
        let effect = reg.handle_datagram(a, b"hello", 0.0);
        assert!(matches!(effect, DatagramEffect::SendAck));
        assert_eq!(reg.client_count(), 1);
        assert!(matches!(reg.client(a).unwrap().version, ProtocolVersion::V1));

        reg.handle_datagram(a, b"bye", 1.0);
        assert_eq!(reg.client_count(), 0);
    }

    #[test]
    fn s6_filtered_v2_client_admits_only_its_filter() {
        let mut reg = PandaRegistry::new();
        let filtered = addr(1);
        let send_all = addr(2);
        reg.handle_datagram(filtered, b"ehllo", 0.0);
        reg.handle_datagram(filtered, &[0x0F, 0x00, 0x01, 0x32], 0.0);
        reg.handle_datagram(send_all, b"ehllo", 0.0);
        reg.handle_datagram(send_all, &[0x0C], 0.0);

        let frames = vec![frame(0x132), frame(0x200)];
        let tick = reg.broadcast_tick(0, &frames);

        assert_eq!(tick[&filtered].len(), 1);
        assert_eq!(tick[&send_all].len(), 2);
    }

    #[test]
    fn p7_admitted_ids_are_subset_of_filter() {
        let mut reg = PandaRegistry::new();
        let a = addr(1);
        reg.handle_datagram(a, b"ehllo", 0.0);
        reg.handle_datagram(a, &[0x0F, 0x00, 0x01, 0x32, 0x00, 0x02, 0x00], 0.0);

        let frames = vec![frame(0x132), frame(0x200), frame(0x300)];
        let tick = reg.broadcast_tick(0, &frames);
        assert_eq!(tick[&a].len(), 2);
    }

    #[test]
    fn v1_client_receives_everything_unconditionally() {
        let mut reg = PandaRegistry::new();
        let a = addr(1);
        reg.handle_datagram(a, b"hello", 0.0);
        let frames = vec![frame(0x132), frame(0x999)];
        let tick = reg.broadcast_tick(0, &frames);
        assert_eq!(tick[&a].len(), 2);
    }

    #[test]
    fn broadcast_dedups_latest_frame_per_id() {
        let mut reg = PandaRegistry::new();
        let a = addr(1);
        reg.handle_datagram(a, b"hello", 0.0);
        let f1 = Frame::new(0, 0x132, false, true, &[1], 0.0);
        let f2 = Frame::new(0, 0x132, false, true, &[2], 0.1);
        let tick = reg.broadcast_tick(0, &[f1, f2]);
        assert_eq!(tick[&a].len(), 1);
        assert_eq!(tick[&a][0][8], 2);
    }

    #[test]
    fn p8_stale_client_expires_after_10s() {
        let mut reg = PandaRegistry::new();
        let a = addr(1);
        reg.handle_datagram(a, b"hello", 0.0);
        assert!(reg.expire_stale(5.0).is_empty());
        let expired = reg.expire_stale(11.0);
        assert_eq!(expired, vec![a]);
        assert_eq!(reg.client_count(), 0);
    }

    #[test]
    fn unparsable_datagram_does_not_disconnect_client() {
        let mut reg = PandaRegistry::new();
        let a = addr(1);
        reg.handle_datagram(a, b"hello", 0.0);
        reg.handle_datagram(a, &[0xAA], 1.0);
        assert_eq!(reg.client_count(), 1);
    }

    #[test]
    fn send_all_clear_resets_filter_and_send_all() {
        let mut reg = PandaRegistry::new();
        let a = addr(1);
        reg.handle_datagram(a, b"ehllo", 0.0);
        reg.handle_datagram(a, &[0x0C], 0.0);
        reg.handle_datagram(a, &[0x18], 0.0);
        let frames = vec![frame(0x132)];
        let tick = reg.broadcast_tick(0, &frames);
        assert!(tick[&a].is_empty());
    }
}
