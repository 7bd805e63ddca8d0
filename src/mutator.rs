//! In-path ClientHello rewriting over raw IPv4/TCP packets.

use std::io;
use std::time::Instant;

use log::{debug, info, warn};
use pnet::packet::ip::IpNextHeaderProtocols;
use pnet::packet::ipv4::{Ipv4Flags, Ipv4Packet};
use pnet::packet::tcp::{TcpFlags, TcpPacket};

use crate::config::MutatorConfig;
use crate::device::CaptureDevice;
use crate::error::InjectError;
use crate::flow::{ConnectionKey, FlowState, FlowStatus, FlowTable};
use crate::inject::{build_packet, inject};
use crate::strategy::Strategy;
use crate::tls::{ClientHello, MAX_RECORD_LEN};

/// What happened to one packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Not IPv4/TCP; left to the surrounding stack, nothing written.
    Ignored,
    /// Written back byte for byte.
    PassedThrough,
    /// Sequence number did not match the flow; nothing written.
    Rejected,
    /// Held back until the rest of the ClientHello arrives.
    Withheld,
    /// Re-injected carrying the rewritten ClientHello.
    Rewritten,
    /// Previously withheld bytes sent on unmodified, as one packet.
    Released,
    /// Withheld bytes too large for one packet. Nothing written; the flow
    /// resumes at the first withheld byte so retransmissions go through.
    Rewound,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct MutatorStats {
    pub packets: u64,
    pub rewritten: u64,
    pub rejected: u64,
    pub injection_failures: u64,
}

struct Segment<'a> {
    ip: Ipv4Packet<'a>,
    tcp: TcpPacket<'a>,
    payload: &'a [u8],
}

enum Skip {
    NotTcp,
    Fragment,
}

impl<'a> Segment<'a> {
    fn decode(raw: &'a [u8]) -> Result<Self, Skip> {
        let ip = Ipv4Packet::new(raw).ok_or(Skip::NotTcp)?;
        if ip.get_version() != 4 || ip.get_next_level_protocol() != IpNextHeaderProtocols::Tcp {
            return Err(Skip::NotTcp);
        }
        let header_len = ip.get_header_length() as usize * 4;
        let total_len = ip.get_total_length() as usize;
        if header_len < 20 || total_len < header_len || total_len > raw.len() {
            return Err(Skip::NotTcp);
        }
        if ip.get_fragment_offset() != 0 || ip.get_flags() & Ipv4Flags::MoreFragments != 0 {
            return Err(Skip::Fragment);
        }

        let tcp = TcpPacket::new(&raw[header_len..total_len]).ok_or(Skip::NotTcp)?;
        let tcp_header_len = tcp.get_data_offset() as usize * 4;
        if tcp_header_len < 20 || header_len + tcp_header_len > total_len {
            return Err(Skip::NotTcp);
        }

        Ok(Self {
            ip: Ipv4Packet::new(&raw[..total_len]).ok_or(Skip::NotTcp)?,
            tcp,
            payload: &raw[header_len + tcp_header_len..total_len],
        })
    }
}

pub struct PacketMutator {
    flows: FlowTable,
    strategy: Box<dyn Strategy>,
    max_pending: usize,
    max_record_len: usize,
    stats: MutatorStats,
}

impl PacketMutator {
    pub fn new(flows: FlowTable, strategy: Box<dyn Strategy>, max_pending: usize) -> Self {
        Self {
            flows,
            strategy,
            max_pending,
            max_record_len: MAX_RECORD_LEN,
            stats: MutatorStats::default(),
        }
    }

    pub fn from_config(config: &MutatorConfig, strategy: Box<dyn Strategy>) -> Self {
        let flows = FlowTable::new(
            config.idle_timeout(),
            config.sweep_interval(),
            config.max_flows,
            Instant::now(),
        );
        Self::new(flows, strategy, config.max_pending)
    }

    pub fn flows(&self) -> &FlowTable {
        &self.flows
    }

    pub fn stats(&self) -> MutatorStats {
        self.stats
    }

    /// Reads and handles packets until the device fails.
    pub fn run(&mut self, device: &mut dyn CaptureDevice) -> io::Result<()> {
        info!("Packet mutator running with strategy {}", self.strategy.name());
        loop {
            let packet = device.read_packet()?;
            if let Err(e) = self.process(&packet, Instant::now(), device) {
                self.stats.injection_failures += 1;
                warn!("Packet dropped: {}", e);
            }
        }
    }

    /// Handles one captured packet, writing whatever should go on to the
    /// device. Flow state is only committed once those writes succeeded.
    pub fn process(
        &mut self,
        raw: &[u8],
        now: Instant,
        device: &mut dyn CaptureDevice,
    ) -> Result<Disposition, InjectError> {
        self.stats.packets += 1;
        if self.flows.maybe_sweep(now) > 0 {
            debug!("{:?}", self.stats);
        }

        let seg = match Segment::decode(raw) {
            Ok(seg) => seg,
            Err(Skip::NotTcp) => return Ok(Disposition::Ignored),
            Err(Skip::Fragment) => {
                device.write_packet(raw)?;
                return Ok(Disposition::PassedThrough);
            }
        };

        let key = ConnectionKey::from_packets(&seg.ip, &seg.tcp);
        let flags = seg.tcp.get_flags();
        let seq = seg.tcp.get_sequence();

        if flags & (TcpFlags::RST | TcpFlags::FIN) != 0 {
            device.write_packet(raw)?;
            if self.flows.remove(&key).is_some() {
                debug!("Flow {} closed", key);
            }
            return Ok(Disposition::PassedThrough);
        }

        if flags & TcpFlags::SYN != 0 {
            device.write_packet(raw)?;
            if !self.flows.insert(key, FlowState::new(seq.wrapping_add(1), now)) {
                debug!("Flow table full, not tracking {}", key);
            }
            return Ok(Disposition::PassedThrough);
        }

        if seg.payload.is_empty() {
            device.write_packet(raw)?;
            return Ok(Disposition::PassedThrough);
        }

        let mut flow = match self.flows.get(&key) {
            Some(flow) => flow.clone(),
            None if self.flows.is_full() => {
                device.write_packet(raw)?;
                return Ok(Disposition::PassedThrough);
            }
            // joined mid-stream
            None => FlowState::new(seq, now),
        };

        if seq != flow.next_seq {
            self.stats.rejected += 1;
            warn!("Out of order packet on {}: got {} expected {}", key, seq, flow.next_seq);
            return Ok(Disposition::Rejected);
        }
        flow.next_seq = seq.wrapping_add(seg.payload.len() as u32);
        flow.last_seen = now;

        let disposition = match flow.status {
            FlowStatus::Modified | FlowStatus::Passthrough => {
                device.write_packet(raw)?;
                Disposition::PassedThrough
            }
            FlowStatus::Pending => self.advance_pending(&key, &seg, raw, &mut flow, device)?,
        };

        if disposition == Disposition::Rewritten {
            self.stats.rewritten += 1;
        }
        self.flows.insert(key, flow);
        Ok(disposition)
    }

    fn advance_pending(
        &self,
        key: &ConnectionKey,
        seg: &Segment<'_>,
        raw: &[u8],
        flow: &mut FlowState,
        device: &mut dyn CaptureDevice,
    ) -> Result<Disposition, InjectError> {
        if flow.pending.is_empty() {
            flow.pending_seq = seg.tcp.get_sequence();
        }
        flow.pending.extend_from_slice(seg.payload);

        let err = match ClientHello::parse_record(&flow.pending, self.max_record_len) {
            Ok((mut hello, used)) => {
                let sni = hello.server_name().to_string();
                self.strategy.apply(&mut hello);
                let mut payload = hello.serialize()?.to_vec();
                payload.extend_from_slice(&flow.pending[used..]);

                inject(device, &seg.ip, &seg.tcp, &payload, flow.pending_seq)?;
                info!(
                    "Intercepted ClientHello on {} (SNI {:?}), {} -> {} bytes",
                    key,
                    sni,
                    flow.pending.len(),
                    payload.len()
                );
                flow.pending.clear();
                flow.status = FlowStatus::Modified;
                return Ok(Disposition::Rewritten);
            }
            Err(e) if e.is_incomplete() && flow.pending.len() <= self.max_pending => {
                debug!("Withholding {} bytes on {} until the record completes", flow.pending.len(), key);
                return Ok(Disposition::Withheld);
            }
            Err(e) => e,
        };

        if err.is_incomplete() {
            debug!("Flow {} exceeded {} pending bytes, passing through", key, self.max_pending);
        } else if err.is_foreign_traffic() {
            debug!("Flow {} is not a TLS ClientHello: {}", key, err);
        } else {
            debug!("Flow {} carries a malformed ClientHello: {}", key, err);
        }

        // one write per captured packet: NFQUEUE has a single verdict for it
        let disposition = if flow.pending.len() == seg.payload.len() {
            device.write_packet(raw)?;
            Disposition::PassedThrough
        } else {
            match build_packet(&seg.ip, &seg.tcp, &flow.pending, flow.pending_seq) {
                Ok(packet) => {
                    device.write_packet(&packet)?;
                    Disposition::Released
                }
                Err(InjectError::PacketTooLarge(len)) => {
                    debug!(
                        "Flow {}: {} withheld bytes exceed one packet ({}), rewinding to {}",
                        key,
                        flow.pending.len(),
                        len,
                        flow.pending_seq
                    );
                    flow.next_seq = flow.pending_seq;
                    Disposition::Rewound
                }
                Err(e) => return Err(e),
            }
        };
        flow.pending.clear();
        flow.status = FlowStatus::Passthrough;
        Ok(disposition)
    }
}
