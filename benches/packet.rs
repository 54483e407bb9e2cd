//! Benchmarks for the packet codec and blocked answers.

use criterion::{Criterion, criterion_group, criterion_main};
use hickory_proto::op::{Message, Query};
use hickory_proto::rr::{Name, RecordType};
use hickory_proto::serialize::binary::BinEncodable;
use pnet::packet::ip::IpNextHeaderProtocols;
use pnet::packet::ipv4::MutableIpv4Packet;
use pnet::packet::udp::MutableUdpPacket;
use std::hint::black_box;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::str::FromStr;

use dnsgate::dns::{Sinkhole, SinkholeAddress};
use dnsgate::network::{BufferPool, PacketBuilder, parse_query};

fn create_query_packet(domain: &str) -> Vec<u8> {
    let mut msg = Message::new();
    msg.set_id(1234).set_recursion_desired(true);
    msg.add_query(Query::query(Name::from_str(domain).unwrap(), RecordType::A));
    let payload = msg.to_bytes().unwrap();

    let source = SocketAddrV4::new(Ipv4Addr::new(192, 168, 50, 1), 40_000);
    let destination = SocketAddrV4::new(Ipv4Addr::new(192, 168, 50, 5), 53);
    let udp_len = 8 + payload.len();
    let mut data = vec![0u8; 20 + udp_len];
    {
        let mut udp = MutableUdpPacket::new(&mut data[20..]).unwrap();
        udp.set_source(source.port());
        udp.set_destination(destination.port());
        udp.set_length(udp_len as u16);
        udp.set_payload(&payload);
    }
    {
        let mut ipv4 = MutableIpv4Packet::new(&mut data).unwrap();
        ipv4.set_version(4);
        ipv4.set_header_length(5);
        ipv4.set_total_length((20 + udp_len) as u16);
        ipv4.set_ttl(64);
        ipv4.set_next_level_protocol(IpNextHeaderProtocols::Udp);
        ipv4.set_source(*source.ip());
        ipv4.set_destination(*destination.ip());
        ipv4.set_checksum(pnet::packet::ipv4::checksum(&ipv4.to_immutable()));
    }
    data
}

fn bench_packet_parsing(c: &mut Criterion) {
    let mut group = c.benchmark_group("packet_parsing");

    let query = create_query_packet("ads.example.com");
    group.bench_function("dns_query", |b| {
        b.iter(|| parse_query(black_box(&query)));
    });

    let garbage = vec![0x60u8; 64];
    group.bench_function("non_ipv4", |b| {
        b.iter(|| parse_query(black_box(&garbage)));
    });

    group.finish();
}

fn bench_packet_building(c: &mut Criterion) {
    let mut group = c.benchmark_group("packet_building");

    let builder = PacketBuilder::new(BufferPool::new(64));
    let query = parse_query(&create_query_packet("good.example.com")).unwrap();
    let reply = vec![0xabu8; 120];

    group.bench_function("upstream_reply", |b| {
        b.iter(|| builder.build_response(black_box(&query), black_box(&reply)));
    });

    let sinkhole = Sinkhole::new(SinkholeAddress::Loopback, 10);
    group.bench_function("blocked_answer", |b| {
        b.iter(|| {
            let answer = sinkhole.blocked_answer_bytes(black_box(&query.message)).unwrap();
            builder.build_response(&query, &answer)
        });
    });

    group.finish();
}

criterion_group!(benches, bench_packet_parsing, bench_packet_building);
criterion_main!(benches);
