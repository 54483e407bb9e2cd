//! IPv4/UDP codec for intercepted DNS traffic.
//!
//! Parses raw IP packets read from the tunnel into [`DnsQueryPacket`]s and
//! rebuilds response packets with swapped addressing and fresh checksums.

use std::net::SocketAddrV4;

use hickory_proto::op::Message;
use hickory_proto::serialize::binary::BinDecodable;
use pnet::packet::ip::IpNextHeaderProtocols;
use pnet::packet::ipv4::{Ipv4Flags, Ipv4Packet, MutableIpv4Packet};
use pnet::packet::udp::{MutableUdpPacket, UdpPacket};

use super::buffer::{BufferPool, ResponsePacket};
use crate::error::{NetworkError, NotDns, Result};

/// IPv4 header size in bytes (without options).
pub const IPV4_HEADER_SIZE: usize = 20;
/// UDP header size in bytes.
pub const UDP_HEADER_SIZE: usize = 8;
/// Largest DNS payload that still fits the 16-bit IPv4 total length.
pub const MAX_DNS_PAYLOAD: usize = u16::MAX as usize - IPV4_HEADER_SIZE - UDP_HEADER_SIZE;

const RESPONSE_TTL: u8 = 64;

/// A DNS query lifted out of an intercepted IPv4/UDP packet.
///
/// Owns everything a worker needs, so the read buffer can be reused as
/// soon as parsing is done.
#[derive(Debug, Clone)]
pub struct DnsQueryPacket {
    pub source: SocketAddrV4,
    pub destination: SocketAddrV4,
    pub identification: u16,
    /// The DNS message bytes exactly as they were on the wire.
    pub dns_payload: Vec<u8>,
    pub message: Message,
    /// First question's name in its ASCII wire form (IDN labels stay
    /// punycode), lowercase and without the trailing dot.
    pub domain: String,
}

/// Parse a raw IP packet into a DNS query.
///
/// Anything that is not an unfragmented IPv4/UDP datagram carrying a DNS
/// message with at least one question yields [`NotDns`].
pub fn parse_query(raw: &[u8]) -> std::result::Result<DnsQueryPacket, NotDns> {
    let ipv4 = Ipv4Packet::new(raw).ok_or(NotDns::NotIpv4)?;
    if ipv4.get_version() != 4 {
        return Err(NotDns::NotIpv4);
    }

    let header_len = usize::from(ipv4.get_header_length()) * 4;
    let total_len = usize::from(ipv4.get_total_length());
    if header_len < IPV4_HEADER_SIZE || total_len < header_len || total_len > raw.len() {
        return Err(NotDns::BadHeader);
    }
    if ipv4.get_next_level_protocol() != IpNextHeaderProtocols::Udp {
        return Err(NotDns::NotUdp);
    }
    if ipv4.get_flags() & Ipv4Flags::MoreFragments != 0 || ipv4.get_fragment_offset() != 0 {
        return Err(NotDns::Fragmented);
    }

    let segment = &raw[header_len..total_len];
    let udp = UdpPacket::new(segment).ok_or(NotDns::BadUdp)?;
    let udp_len = usize::from(udp.get_length());
    if udp_len < UDP_HEADER_SIZE || udp_len > segment.len() {
        return Err(NotDns::BadUdp);
    }

    let dns_payload = &segment[UDP_HEADER_SIZE..udp_len];
    let message = Message::from_bytes(dns_payload).map_err(|_| NotDns::NotDnsMessage)?;
    let domain = {
        let question = message.queries().first().ok_or(NotDns::NoQuestion)?;
        let name = question.name().to_ascii().to_lowercase();
        name.trim_end_matches('.').to_owned()
    };

    Ok(DnsQueryPacket {
        source: SocketAddrV4::new(ipv4.get_source(), udp.get_source()),
        destination: SocketAddrV4::new(ipv4.get_destination(), udp.get_destination()),
        identification: ipv4.get_identification(),
        dns_payload: dns_payload.to_vec(),
        message,
        domain,
    })
}

/// Builder for response packets written back into the tunnel.
///
/// Packets are built in pooled buffers that return to the pool once written.
#[derive(Clone, Default)]
pub struct PacketBuilder {
    buffer_pool: BufferPool,
}

impl PacketBuilder {
    /// Create a new packet builder with the given buffer pool.
    pub const fn new(buffer_pool: BufferPool) -> Self {
        Self { buffer_pool }
    }

    /// Wrap `dns_payload` in an IPv4/UDP packet answering `query`.
    ///
    /// Source and destination addresses and ports are swapped relative to
    /// the query. Lengths and both checksums are computed from scratch.
    pub fn build_response(
        &self,
        query: &DnsQueryPacket,
        dns_payload: &[u8],
    ) -> Result<ResponsePacket> {
        if dns_payload.len() > MAX_DNS_PAYLOAD {
            return Err(NetworkError::PacketConstruction(format!(
                "DNS payload of {} bytes does not fit in an IPv4 packet",
                dns_payload.len()
            ))
            .into());
        }

        let udp_len = UDP_HEADER_SIZE + dns_payload.len();
        let total_len = IPV4_HEADER_SIZE + udp_len;
        let source = *query.destination.ip();
        let destination = *query.source.ip();

        let mut packet = self.buffer_pool.packet(total_len);
        let packet_data = packet.as_mut_slice();

        {
            let mut udp = MutableUdpPacket::new(&mut packet_data[IPV4_HEADER_SIZE..])
                .ok_or_else(|| {
                    NetworkError::PacketConstruction("UDP packet creation failed".into())
                })?;
            udp.set_source(query.destination.port());
            udp.set_destination(query.source.port());
            udp.set_length(u16::try_from(udp_len).map_err(construction_error)?);
            udp.set_payload(dns_payload);
            let checksum = pnet::packet::udp::ipv4_checksum(&udp.to_immutable(), &source, &destination);
            // Zero means "no checksum" on the wire.
            udp.set_checksum(if checksum == 0 { 0xFFFF } else { checksum });
        }

        {
            let mut ipv4 = MutableIpv4Packet::new(packet_data).ok_or_else(|| {
                NetworkError::PacketConstruction("IPv4 packet creation failed".into())
            })?;
            ipv4.set_version(4);
            ipv4.set_header_length(5);
            ipv4.set_total_length(u16::try_from(total_len).map_err(construction_error)?);
            ipv4.set_identification(query.identification);
            ipv4.set_flags(Ipv4Flags::DontFragment);
            ipv4.set_ttl(RESPONSE_TTL);
            ipv4.set_next_level_protocol(IpNextHeaderProtocols::Udp);
            ipv4.set_source(source);
            ipv4.set_destination(destination);
            ipv4.set_checksum(pnet::packet::ipv4::checksum(&ipv4.to_immutable()));
        }

        Ok(packet)
    }
}

fn construction_error(err: std::num::TryFromIntError) -> NetworkError {
    NetworkError::PacketConstruction(err.to_string())
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use hickory_proto::op::{Query, ResponseCode};
    use hickory_proto::rr::{Name, RecordType};
    use hickory_proto::serialize::binary::BinEncodable;
    use pnet::packet::Packet;
    use std::net::Ipv4Addr;
    use std::str::FromStr;

    pub const CLIENT: SocketAddrV4 = SocketAddrV4::new(Ipv4Addr::new(192, 168, 50, 1), 40_000);
    pub const DNS_SERVER: SocketAddrV4 = SocketAddrV4::new(Ipv4Addr::new(192, 168, 50, 5), 53);

    pub fn dns_query(domain: &str, id: u16) -> Vec<u8> {
        let mut query = Query::new();
        query.set_name(Name::from_str(domain).unwrap());
        query.set_query_type(RecordType::A);

        let mut message = Message::new();
        message.set_id(id).set_recursion_desired(true);
        message.add_query(query);
        message.to_bytes().unwrap()
    }

    /// Build an IPv4/UDP packet the way a client behind the tunnel would send it.
    pub fn udp_packet(source: SocketAddrV4, destination: SocketAddrV4, payload: &[u8]) -> Vec<u8> {
        let udp_len = UDP_HEADER_SIZE + payload.len();
        let mut data = vec![0u8; IPV4_HEADER_SIZE + udp_len];
        {
            let mut udp = MutableUdpPacket::new(&mut data[IPV4_HEADER_SIZE..]).unwrap();
            udp.set_source(source.port());
            udp.set_destination(destination.port());
            udp.set_length(udp_len as u16);
            udp.set_payload(payload);
        }
        {
            let mut ipv4 = MutableIpv4Packet::new(&mut data).unwrap();
            ipv4.set_version(4);
            ipv4.set_header_length(5);
            ipv4.set_total_length((IPV4_HEADER_SIZE + udp_len) as u16);
            ipv4.set_identification(0x1234);
            ipv4.set_ttl(64);
            ipv4.set_next_level_protocol(IpNextHeaderProtocols::Udp);
            ipv4.set_source(*source.ip());
            ipv4.set_destination(*destination.ip());
            ipv4.set_checksum(pnet::packet::ipv4::checksum(&ipv4.to_immutable()));
        }
        data
    }

    fn query_packet(domain: &str) -> Vec<u8> {
        udp_packet(CLIENT, DNS_SERVER, &dns_query(domain, 4242))
    }

    #[test]
    fn should_parse_dns_query_packet() {
        let parsed = parse_query(&query_packet("Ads.Example.com")).unwrap();

        assert_eq!(parsed.source, CLIENT);
        assert_eq!(parsed.destination, DNS_SERVER);
        assert_eq!(parsed.identification, 0x1234);
        assert_eq!(parsed.domain, "ads.example.com");
        assert_eq!(parsed.message.id(), 4242);
        assert_eq!(parsed.dns_payload, dns_query("Ads.Example.com", 4242));
    }

    #[test]
    fn should_keep_idn_labels_in_punycode() {
        let parsed = parse_query(&query_packet("xn--bcher-kva.Example.com")).unwrap();
        assert_eq!(parsed.domain, "xn--bcher-kva.example.com");

        let parsed = parse_query(&query_packet("bücher.example.com")).unwrap();
        assert_eq!(parsed.domain, "xn--bcher-kva.example.com");
    }

    #[test]
    fn should_ignore_trailing_bytes_beyond_total_length() {
        let mut raw = query_packet("example.com");
        raw.extend_from_slice(&[0xde, 0xad, 0xbe, 0xef]);

        let parsed = parse_query(&raw).unwrap();
        assert_eq!(parsed.dns_payload, dns_query("example.com", 4242));
    }

    #[test]
    fn should_reject_empty_and_short_packets() {
        assert_eq!(parse_query(&[]).unwrap_err(), NotDns::NotIpv4);
        assert_eq!(parse_query(&[0x45; 10]).unwrap_err(), NotDns::NotIpv4);
    }

    #[test]
    fn should_reject_ipv6_packet() {
        let mut raw = query_packet("example.com");
        raw[0] = 0x60;
        assert_eq!(parse_query(&raw).unwrap_err(), NotDns::NotIpv4);
    }

    #[test]
    fn should_reject_truncated_packet() {
        let raw = query_packet("example.com");
        assert_eq!(parse_query(&raw[..raw.len() - 3]).unwrap_err(), NotDns::BadHeader);
    }

    #[test]
    fn should_reject_non_udp_transport() {
        let mut raw = query_packet("example.com");
        raw[9] = 6; // TCP
        assert_eq!(parse_query(&raw).unwrap_err(), NotDns::NotUdp);
    }

    #[test]
    fn should_reject_fragments() {
        let mut raw = query_packet("example.com");
        {
            let mut ipv4 = MutableIpv4Packet::new(&mut raw).unwrap();
            ipv4.set_flags(Ipv4Flags::MoreFragments);
        }
        assert_eq!(parse_query(&raw).unwrap_err(), NotDns::Fragmented);

        let mut raw = query_packet("example.com");
        {
            let mut ipv4 = MutableIpv4Packet::new(&mut raw).unwrap();
            ipv4.set_fragment_offset(8);
        }
        assert_eq!(parse_query(&raw).unwrap_err(), NotDns::Fragmented);
    }

    #[test]
    fn should_reject_inconsistent_udp_length() {
        let mut raw = query_packet("example.com");
        {
            let mut udp = MutableUdpPacket::new(&mut raw[IPV4_HEADER_SIZE..]).unwrap();
            udp.set_length(4);
        }
        assert_eq!(parse_query(&raw).unwrap_err(), NotDns::BadUdp);
    }

    #[test]
    fn should_reject_non_dns_payload() {
        let raw = udp_packet(CLIENT, DNS_SERVER, b"hello");
        assert_eq!(parse_query(&raw).unwrap_err(), NotDns::NotDnsMessage);
    }

    #[test]
    fn should_reject_message_without_question() {
        let mut message = Message::new();
        message.set_id(1);
        let raw = udp_packet(CLIENT, DNS_SERVER, &message.to_bytes().unwrap());
        assert_eq!(parse_query(&raw).unwrap_err(), NotDns::NoQuestion);
    }

    #[test]
    fn test_build_response_swaps_addressing() {
        let query = parse_query(&query_packet("good.example.com")).unwrap();
        let builder = PacketBuilder::new(BufferPool::new(4));
        let payload: Vec<u8> = (0..20).collect();

        let packet = builder.build_response(&query, &payload).unwrap();
        assert_eq!(packet.len(), IPV4_HEADER_SIZE + UDP_HEADER_SIZE + 20);

        let ipv4 = Ipv4Packet::new(&packet).unwrap();
        assert_eq!(ipv4.get_version(), 4);
        assert_eq!(ipv4.get_header_length(), 5);
        assert_eq!(usize::from(ipv4.get_total_length()), packet.len());
        assert_eq!(ipv4.get_source(), *DNS_SERVER.ip());
        assert_eq!(ipv4.get_destination(), *CLIENT.ip());
        assert_eq!(ipv4.get_checksum(), pnet::packet::ipv4::checksum(&ipv4));

        let udp = UdpPacket::new(ipv4.payload()).unwrap();
        assert_eq!(udp.get_source(), DNS_SERVER.port());
        assert_eq!(udp.get_destination(), CLIENT.port());
        assert_eq!(usize::from(udp.get_length()), UDP_HEADER_SIZE + 20);
        assert_eq!(udp.payload(), payload.as_slice());
        assert_eq!(
            udp.get_checksum(),
            pnet::packet::udp::ipv4_checksum(&udp, DNS_SERVER.ip(), CLIENT.ip())
        );
    }

    #[test]
    fn test_build_response_round_trips_through_parse() {
        let query = parse_query(&query_packet("example.com")).unwrap();
        let mut response = query.message.clone();
        response
            .set_message_type(hickory_proto::op::MessageType::Response)
            .set_response_code(ResponseCode::NoError);
        let bytes = response.to_bytes().unwrap();

        let packet = PacketBuilder::default().build_response(&query, &bytes).unwrap();
        let reparsed = parse_query(&packet).unwrap();

        assert_eq!(reparsed.source, DNS_SERVER);
        assert_eq!(reparsed.destination, CLIENT);
        assert_eq!(reparsed.dns_payload, bytes);
    }

    #[test]
    fn test_build_response_rejects_oversized_payload() {
        let query = parse_query(&query_packet("example.com")).unwrap();
        let payload = vec![0u8; MAX_DNS_PAYLOAD + 1];

        let result = PacketBuilder::default().build_response(&query, &payload);
        assert!(matches!(
            result,
            Err(crate::error::Error::Network(NetworkError::PacketConstruction(_)))
        ));
    }
}
