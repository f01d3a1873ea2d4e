//! Reads a pcap file and yields `(src_ip, dst_ip, src_port, dst_port, Segment)`
//! tuples, the way [`FlowDemux::process`](reassembly_core::FlowDemux::process)
//! wants them.
//!
//! Grounded in `sequences::pcap::extract_tls_records`'s packet loop: same
//! datalink handling (`PacketData::L2` for Ethernet, `PacketData::L3` for
//! Linux cooked capture), same `etherparse::SlicedPacket` slicing.

use std::net::IpAddr;

use anyhow::{anyhow, bail, Context as _};
use etherparse::{InternetSlice, SlicedPacket, TransportSlice};
use pcap_parser::data::PacketData;
use pcap_parser::{PcapCapture, PcapError};
use reassembly_core::{Segment, TcpFlags};

/// One parsed TCP packet, with its payload owned so it can outlive the
/// pcap file's borrow for the duration it sits in a processing queue.
pub struct OwnedPacket {
    pub src_ip: IpAddr,
    pub dst_ip: IpAddr,
    pub src_port: u16,
    pub dst_port: u16,
    pub ts: f64,
    pub seq: u32,
    pub ack: u32,
    pub flags: TcpFlags,
    pub payload: Vec<u8>,
}

impl OwnedPacket {
    pub fn as_segment(&self) -> Segment<'_> {
        Segment {
            ts: self.ts,
            seq: self.seq,
            ack: self.ack,
            flags: self.flags,
            payload: &self.payload,
        }
    }
}

fn tcp_flags(tcp: &etherparse::TcpHeaderSlice<'_>) -> TcpFlags {
    let mut flags = TcpFlags::empty();
    if tcp.syn() {
        flags |= TcpFlags::SYN;
    }
    if tcp.ack() {
        flags |= TcpFlags::ACK;
    }
    if tcp.fin() {
        flags |= TcpFlags::FIN;
    }
    if tcp.rst() {
        flags |= TcpFlags::RST;
    }
    if tcp.psh() {
        flags |= TcpFlags::PSH;
    }
    flags
}

/// Parses every TCP packet out of a pcap file, in capture order.
pub fn read_packets(file_content: &[u8]) -> anyhow::Result<Vec<OwnedPacket>> {
    let capture = PcapCapture::from_file(file_content).map_err(|err| match err {
        PcapError::Eof => anyhow!("failed reading pcap: EOF"),
        PcapError::ReadError => anyhow!("failed reading pcap: read error"),
        PcapError::Incomplete => anyhow!("failed reading pcap: incomplete"),
        PcapError::HeaderNotRecognized => anyhow!("failed reading pcap: header not recognized"),
        PcapError::NomError(_, kind) | PcapError::OwnedNomError(_, kind) => {
            anyhow!("failed reading pcap: nom error: {:?}", kind)
        }
    })?;
    let datalink_type = capture.header.network;

    let mut packets = Vec::new();
    for (id, pkt) in capture.blocks.into_iter().enumerate() {
        let packet_id = id as u32 + 1;
        if pkt.caplen != pkt.origlen {
            bail!("packet {packet_id} is truncated, cannot process");
        }

        let parsed = match pcap_parser::data::get_packetdata(pkt.data, datalink_type, pkt.caplen as usize) {
            None => bail!("could not parse packet data for packet {packet_id}"),
            Some(PacketData::Unsupported(_)) | Some(PacketData::L4(_, _)) => {
                bail!("unsupported linktype {datalink_type} for packet {packet_id}")
            }
            Some(PacketData::L2(data)) => {
                SlicedPacket::from_ethernet(data).map_err(|err| anyhow!("{err:?}")).with_context(|| format!("packet {packet_id}"))?
            }
            Some(PacketData::L3(_, data)) => {
                SlicedPacket::from_ip(data).map_err(|err| anyhow!("{err:?}")).with_context(|| format!("packet {packet_id}"))?
            }
        };

        let ip = match parsed.ip {
            Some(InternetSlice::Ipv4(inner, _)) => (IpAddr::V4(inner.source_addr()), IpAddr::V4(inner.destination_addr())),
            Some(InternetSlice::Ipv6(inner, _)) => (IpAddr::V6(inner.source_addr()), IpAddr::V6(inner.destination_addr())),
            None => continue,
        };

        let tcp = match parsed.transport {
            Some(TransportSlice::Tcp(inner)) => inner,
            _ => continue,
        };

        let ts = pkt.ts_sec as f64 + (pkt.ts_usec as f64 / 1_000_000.0);
        packets.push(OwnedPacket {
            src_ip: ip.0,
            dst_ip: ip.1,
            src_port: tcp.source_port(),
            dst_port: tcp.destination_port(),
            ts,
            seq: tcp.sequence_number(),
            ack: tcp.acknowledgment_number(),
            flags: tcp_flags(&tcp),
            payload: parsed.payload.to_vec(),
        });
    }

    Ok(packets)
}
