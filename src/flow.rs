// src/flow.rs
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::time::{Duration, Instant};

use bytes::BytesMut;
use pnet::packet::ipv4::Ipv4Packet;
use pnet::packet::tcp::TcpPacket;

/// One direction of a TCP connection.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq)]
pub struct ConnectionKey {
    pub src_ip: Ipv4Addr,
    pub dst_ip: Ipv4Addr,
    pub src_port: u16,
    pub dst_port: u16,
}

impl ConnectionKey {
    pub fn from_packets(ip: &Ipv4Packet, tcp: &TcpPacket) -> Self {
        Self {
            src_ip: ip.get_source(),
            dst_ip: ip.get_destination(),
            src_port: tcp.get_source(),
            dst_port: tcp.get_destination(),
        }
    }
}

impl std::fmt::Display for ConnectionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{} -> {}:{}", self.src_ip, self.src_port, self.dst_ip, self.dst_port)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowStatus {
    /// Still collecting the first handshake record.
    Pending,
    /// ClientHello found and rewritten.
    Modified,
    /// Not interceptable; everything passes untouched.
    Passthrough,
}

#[derive(Debug, Clone)]
pub struct FlowState {
    pub status: FlowStatus,
    /// Withheld payload bytes not yet decided on.
    pub pending: BytesMut,
    /// Sequence number of `pending[0]`.
    pub pending_seq: u32,
    pub next_seq: u32,
    pub last_seen: Instant,
}

impl FlowState {
    pub fn new(next_seq: u32, now: Instant) -> Self {
        Self {
            status: FlowStatus::Pending,
            pending: BytesMut::new(),
            pending_seq: next_seq,
            next_seq,
            last_seen: now,
        }
    }

    pub fn is_modified(&self) -> bool {
        self.status == FlowStatus::Modified
    }

    pub fn is_idle(&self, now: Instant, timeout: Duration) -> bool {
        now.saturating_duration_since(self.last_seen) > timeout
    }
}

/// Per-flow state owned by a single packet mutator.
pub struct FlowTable {
    flows: HashMap<ConnectionKey, FlowState>,
    idle_timeout: Duration,
    sweep_interval: Duration,
    max_flows: usize,
    last_sweep: Instant,
}

impl FlowTable {
    pub fn new(idle_timeout: Duration, sweep_interval: Duration, max_flows: usize, now: Instant) -> Self {
        Self {
            flows: HashMap::new(),
            idle_timeout,
            sweep_interval,
            max_flows,
            last_sweep: now,
        }
    }

    pub fn len(&self) -> usize {
        self.flows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }

    pub fn get(&self, key: &ConnectionKey) -> Option<&FlowState> {
        self.flows.get(key)
    }

    pub fn is_full(&self) -> bool {
        self.flows.len() >= self.max_flows
    }

    /// Inserts or replaces. Returns false when the table is full and the
    /// flow was not already tracked.
    pub fn insert(&mut self, key: ConnectionKey, state: FlowState) -> bool {
        if self.is_full() && !self.flows.contains_key(&key) {
            return false;
        }
        self.flows.insert(key, state);
        true
    }

    pub fn remove(&mut self, key: &ConnectionKey) -> Option<FlowState> {
        self.flows.remove(key)
    }

    /// Evicts idle flows when a sweep is due. Returns how many were dropped.
    pub fn maybe_sweep(&mut self, now: Instant) -> usize {
        if now.saturating_duration_since(self.last_sweep) < self.sweep_interval {
            return 0;
        }
        self.last_sweep = now;
        self.evict_idle(now)
    }

    pub fn evict_idle(&mut self, now: Instant) -> usize {
        let before = self.flows.len();
        let timeout = self.idle_timeout;
        self.flows.retain(|_, flow| !flow.is_idle(now, timeout));
        let evicted = before - self.flows.len();
        if evicted > 0 {
            log::debug!("Evicted {} idle flows, {} remain", evicted, self.flows.len());
        }
        evicted
    }
}
