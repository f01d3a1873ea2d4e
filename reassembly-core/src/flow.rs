//! Flow identity and the segment type handed to the reassembler.

use std::net::IpAddr;

use bitflags::bitflags;

bitflags! {
    /// The subset of TCP header flags the reassembly state machine cares about.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct TcpFlags: u8 {
        const SYN = 0b0000_0001;
        const ACK = 0b0000_0010;
        const FIN = 0b0000_0100;
        const RST = 0b0000_1000;
        const PSH = 0b0001_0000;
    }
}

impl TcpFlags {
    /// `true` if this is a bare SYN: no ACK/RST/PSH/FIN set alongside it.
    pub fn is_bare_syn(self) -> bool {
        self.contains(TcpFlags::SYN) && !self.intersects(TcpFlags::ACK | TcpFlags::RST | TcpFlags::PSH | TcpFlags::FIN)
    }
}

/// Four-tuple identifying one direction of a TCP connection.
///
/// Immutable once created (§3): `reversed()` always computes a fresh value,
/// it never mutates `self`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct FlowKey {
    pub src_ip: IpAddr,
    pub src_port: u16,
    pub dst_ip: IpAddr,
    pub dst_port: u16,
}

impl FlowKey {
    pub fn new(src_ip: IpAddr, src_port: u16, dst_ip: IpAddr, dst_port: u16) -> Self {
        Self {
            src_ip,
            src_port,
            dst_ip,
            dst_port,
        }
    }

    /// The four-tuple as seen from the other endpoint.
    pub fn reversed(&self) -> Self {
        Self {
            src_ip: self.dst_ip,
            src_port: self.dst_port,
            dst_ip: self.src_ip,
            dst_port: self.src_port,
        }
    }
}

impl std::fmt::Display for FlowKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}:{} -> {}:{}",
            self.src_ip, self.src_port, self.dst_ip, self.dst_port
        )
    }
}

/// One TCP segment as delivered by the packet source.
///
/// `payload` is borrowed from the capture source for the duration of a
/// single `process()` call; anything the reassembler retains past that
/// call must be copied out (§5 memory discipline).
#[derive(Clone, Copy, Debug)]
pub struct Segment<'a> {
    pub ts: f64,
    pub seq: u32,
    pub ack: u32,
    pub flags: TcpFlags,
    pub payload: &'a [u8],
}

impl<'a> Segment<'a> {
    /// The sequence number one past the last byte of `payload`, modulo 2^32.
    pub fn seq_end(&self) -> u32 {
        self.seq.wrapping_add(self.payload.len() as u32)
    }

    pub fn has_payload(&self) -> bool {
        !self.payload.is_empty()
    }
}

/// An owned copy of the fields of a [`Segment`], used in error values and
/// anywhere a segment must outlive the borrowed capture buffer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OwnedSegment {
    pub ts: ordered_ts::TsBits,
    pub seq: u32,
    pub ack: u32,
    pub flags: TcpFlags,
    pub payload_len: usize,
}

impl<'a> From<&Segment<'a>> for OwnedSegment {
    fn from(seg: &Segment<'a>) -> Self {
        Self {
            ts: ordered_ts::TsBits::from_f64(seg.ts),
            seq: seg.seq,
            ack: seg.ack,
            flags: seg.flags,
            payload_len: seg.payload.len(),
        }
    }
}

/// `f64` timestamps do not implement `Eq`/`Ord`, but error values and the
/// error-log's key both need them. Store the bit pattern instead of
/// reinventing float comparison semantics.
pub mod ordered_ts {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
    pub struct TsBits(u64);

    impl TsBits {
        pub fn from_f64(ts: f64) -> Self {
            Self(ts.to_bits())
        }

        pub fn to_f64(self) -> f64 {
            f64::from_bits(self.0)
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn reversed_swaps_source_and_destination() {
        let key = FlowKey::new("10.0.0.1".parse().unwrap(), 1234, "10.0.0.2".parse().unwrap(), 80);
        let rev = key.reversed();
        assert_eq!(rev.src_ip, key.dst_ip);
        assert_eq!(rev.src_port, key.dst_port);
        assert_eq!(rev.dst_ip, key.src_ip);
        assert_eq!(rev.dst_port, key.src_port);
        assert_eq!(rev.reversed(), key);
    }

    #[test]
    fn bare_syn_detection() {
        assert!(TcpFlags::SYN.is_bare_syn());
        assert!(!(TcpFlags::SYN | TcpFlags::ACK).is_bare_syn());
        assert!(!(TcpFlags::SYN | TcpFlags::PSH).is_bare_syn());
    }

    #[test]
    fn seq_end_wraps() {
        let seg = Segment {
            ts: 0.0,
            seq: u32::MAX - 1,
            ack: 0,
            flags: TcpFlags::empty(),
            payload: &[0, 1, 2],
        };
        assert_eq!(seg.seq_end(), 1);
    }
}
