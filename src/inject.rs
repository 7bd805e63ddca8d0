use pnet::packet::ipv4::{self, Ipv4Packet, MutableIpv4Packet};
use pnet::packet::tcp::{self, MutableTcpPacket, TcpPacket};
use pnet::packet::Packet;

use crate::device::CaptureDevice;
use crate::error::InjectError;

/// Rebuilds an IPv4/TCP packet around `payload`.
///
/// Both headers are copied with their options, the sequence number is set,
/// the IPv4 total length follows the new payload and both checksums are
/// recomputed, the TCP one over the pseudo-header.
pub fn build_packet(
    ip: &Ipv4Packet,
    tcp: &TcpPacket,
    payload: &[u8],
    sequence: u32,
) -> Result<Vec<u8>, InjectError> {
    let ip_header_len = ip.get_header_length() as usize * 4;
    if ip_header_len < Ipv4Packet::minimum_packet_size() || ip.packet().len() < ip_header_len {
        return Err(InjectError::Header("IPv4 header length"));
    }
    let tcp_header_len = tcp.get_data_offset() as usize * 4;
    if tcp_header_len < TcpPacket::minimum_packet_size() || tcp.packet().len() < tcp_header_len {
        return Err(InjectError::Header("TCP data offset"));
    }

    let total = ip_header_len + tcp_header_len + payload.len();
    if total > u16::MAX as usize {
        return Err(InjectError::PacketTooLarge(total));
    }

    let mut out = Vec::with_capacity(total);
    out.extend_from_slice(&ip.packet()[..ip_header_len]);
    out.extend_from_slice(&tcp.packet()[..tcp_header_len]);
    out.extend_from_slice(payload);

    let (ip_bytes, tcp_bytes) = out.split_at_mut(ip_header_len);

    let mut tcp_out = MutableTcpPacket::new(tcp_bytes).ok_or(InjectError::Header("TCP header"))?;
    tcp_out.set_sequence(sequence);
    let checksum = tcp::ipv4_checksum(&tcp_out.to_immutable(), &ip.get_source(), &ip.get_destination());
    tcp_out.set_checksum(checksum);

    let mut ip_out = MutableIpv4Packet::new(ip_bytes).ok_or(InjectError::Header("IPv4 header"))?;
    ip_out.set_total_length(total as u16);
    let checksum = ipv4::checksum(&ip_out.to_immutable());
    ip_out.set_checksum(checksum);

    Ok(out)
}

/// Builds the packet and writes it to the device. Returns the bytes written.
pub fn inject(
    device: &mut dyn CaptureDevice,
    ip: &Ipv4Packet,
    tcp: &TcpPacket,
    payload: &[u8],
    sequence: u32,
) -> Result<usize, InjectError> {
    let packet = build_packet(ip, tcp, payload, sequence)?;
    device.write_packet(&packet)?;
    log::debug!("Injected packet ({} bytes, {} payload)", packet.len(), payload.len());
    Ok(packet.len())
}
