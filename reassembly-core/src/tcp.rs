//! Per-flow TCP reassembly state machine (spec.md §4.2).
//!
//! Ported byte-for-byte from the `TCPStream` state machine in the original
//! implementation this was distilled from, re-expressed as an exhaustive
//! match over a tagged [`TcpState`] instead of a state-name-to-method
//! dictionary.

use std::collections::HashMap;

use crate::error::{ErrorLog, ReassemblyError};
use crate::flow::{FlowKey, OwnedSegment, Segment, TcpFlags};
use crate::sink::{Event, EventSink, FlowEvent};

/// §3 TcpReassembler state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum TcpState {
    InitSyn,
    InitSynAck,
    InitAck,
    Conn,
    ConnFinish,
    ConnClosed,
}

#[derive(Clone, Debug)]
struct StoredSegment {
    ts: f64,
    payload: Vec<u8>,
}

/// A segment that was still queued in `pending` when [`TcpReassembler::finish`]
/// was called — acknowledged across a retransmission gap and never released.
#[derive(Clone, Debug, PartialEq)]
pub struct PendingSegmentWarning {
    pub ts: f64,
    pub seq_end: u32,
    pub ack: u32,
}

#[derive(Clone, Copy, Debug)]
pub struct TcpReassemblerConfig {
    /// spec.md §7: surface errors to the caller (`true`) or collect them
    /// into this reassembler's [`ErrorLog`] (`false`).
    pub raise_exceptions: bool,
    /// Upper bound on the number of segments concurrently held in
    /// `pending`/`origins`. `usize::MAX` (the default) reproduces the
    /// original's unbounded behavior exactly; a tighter bound is a
    /// defensive addition for adversarial or pathological captures (see
    /// DESIGN.md).
    pub max_pending_segments: usize,
}

impl Default for TcpReassemblerConfig {
    fn default() -> Self {
        Self {
            raise_exceptions: true,
            max_pending_segments: usize::MAX,
        }
    }
}

/// Per-flow TCP reassembly state machine (spec.md §3/§4.2).
pub struct TcpReassembler {
    flow_key: FlowKey,
    state: TcpState,
    cli_next_seq: Option<u32>,
    srv_next_seq: Option<u32>,
    /// Keyed by (seq_end, ack); the payload of a segment not yet released
    /// by a matching cumulative ACK.
    pending: HashMap<(u32, u32), StoredSegment>,
    /// Keyed by (seq, ack) of a segment already recorded in `pending`, used
    /// only to detect retransmissions in O(1).
    origins: HashMap<(u32, u32), u32>,
    sent_buf: Vec<u8>,
    recv_buf: Vec<u8>,
    pair_ts: Option<f64>,
    parent: Box<dyn EventSink>,
    config: TcpReassemblerConfig,
    errors: ErrorLog,
    dropped_for_capacity: usize,
}

impl TcpReassembler {
    pub fn new(flow_key: FlowKey, parent: Box<dyn EventSink>, config: TcpReassemblerConfig) -> Self {
        Self {
            flow_key,
            state: TcpState::InitSyn,
            cli_next_seq: None,
            srv_next_seq: None,
            pending: HashMap::new(),
            origins: HashMap::new(),
            sent_buf: Vec::new(),
            recv_buf: Vec::new(),
            pair_ts: None,
            parent,
            config,
            errors: ErrorLog::new(),
            dropped_for_capacity: 0,
        }
    }

    pub fn flow_key(&self) -> FlowKey {
        self.flow_key
    }

    pub fn errors(&self) -> &ErrorLog {
        &self.errors
    }

    pub fn segments_dropped_for_capacity(&self) -> usize {
        self.dropped_for_capacity
    }

    /// Feed one segment into the state machine.
    pub fn process(&mut self, seg: Segment<'_>, to_server: bool) -> Result<(), ReassemblyError> {
        match self.state {
            TcpState::InitSyn => self.step_init_syn(seg, to_server),
            TcpState::InitSynAck => self.step_init_syn_ack(seg, to_server),
            TcpState::InitAck => self.step_init_ack(seg, to_server),
            TcpState::Conn => self.step_conn(seg, to_server),
            TcpState::ConnFinish => self.step_conn_finish(seg, to_server),
            TcpState::ConnClosed => self.step_conn_closed(seg, to_server),
        }
    }

    /// Flush any final pair, and report segments still queued at shutdown.
    pub fn finish(&mut self) -> Vec<PendingSegmentWarning> {
        if !self.sent_buf.is_empty() || !self.recv_buf.is_empty() {
            self.flush_pair();
        }

        let warnings: Vec<PendingSegmentWarning> = self
            .pending
            .iter()
            .map(|(&(seq_end, ack), stored)| PendingSegmentWarning {
                ts: stored.ts,
                seq_end,
                ack,
            })
            .collect();

        if !warnings.is_empty() {
            tracing::warn!(
                flow = %self.flow_key,
                count = warnings.len(),
                "segments still pending at finish: acknowledged across a retransmission gap"
            );
        }

        warnings
    }

    fn fail(&mut self, seg: &Segment<'_>, ctor: fn(FlowKey, OwnedSegment) -> ReassemblyError) -> Result<(), ReassemblyError> {
        let err = ctor(self.flow_key, OwnedSegment::from(seg));
        if self.config.raise_exceptions {
            Err(err)
        } else {
            self.errors.record(seg.ts, err);
            Ok(())
        }
    }

    // ---- InitSyn ----------------------------------------------------

    fn step_init_syn(&mut self, seg: Segment<'_>, to_server: bool) -> Result<(), ReassemblyError> {
        if seg.flags.contains(TcpFlags::RST) {
            return Ok(());
        }
        if !to_server {
            return self.fail(&seg, |flow, segment| ReassemblyError::InvalidTcpPacketOrder { flow, segment });
        }
        if seg.has_payload() {
            return self.fail(&seg, |flow, segment| ReassemblyError::UnexpectedTcpData { flow, segment });
        }
        self.cli_next_seq = Some(seg.seq);
        self.state = TcpState::InitSynAck;
        Ok(())
    }

    // ---- InitSynAck ---------------------------------------------------

    fn step_init_syn_ack(&mut self, seg: Segment<'_>, to_server: bool) -> Result<(), ReassemblyError> {
        if to_server && seg.flags == TcpFlags::SYN {
            // Client is retransmitting its SYN; the server hasn't replied yet.
            return Ok(());
        }
        if seg.flags.contains(TcpFlags::RST) {
            self.state = TcpState::InitSyn;
            return Ok(());
        }
        if to_server && seg.flags == TcpFlags::ACK {
            // Some captures miss the SYN-ACK/ACK entirely; fast-forward into
            // the InitAck handler on this same segment rather than
            // transitioning through an intermediate state first.
            self.cli_next_seq = Some(seg.seq);
            self.srv_next_seq = Some(seg.ack);
            return self.step_init_ack(seg, to_server);
        }
        if !to_server && seg.flags == TcpFlags::ACK {
            tracing::warn!(flow = %self.flow_key, ts = seg.ts, "server replied with an ACK to a SYN packet");
            return Ok(());
        }
        if to_server && seg.flags.contains(TcpFlags::ACK) && seg.has_payload() {
            tracing::warn!(
                flow = %self.flow_key,
                ts = seg.ts,
                "no SYN-ACK/ACK observed, proceeding straight to data"
            );
            self.cli_next_seq = Some(seg.seq);
            self.srv_next_seq = Some(seg.ack);
            self.state = TcpState::Conn;
            return self.step_conn(seg, to_server);
        }
        if !to_server && seg.flags == (TcpFlags::PSH | TcpFlags::ACK) {
            self.state = TcpState::InitSyn;
            return Ok(());
        }
        if to_server || seg.flags != (TcpFlags::SYN | TcpFlags::ACK) {
            return self.fail(&seg, |flow, segment| ReassemblyError::InvalidTcpPacketOrder { flow, segment });
        }
        if seg.has_payload() {
            return self.fail(&seg, |flow, segment| ReassemblyError::UnexpectedTcpData { flow, segment });
        }
        self.cli_next_seq = Some(seg.ack);
        self.srv_next_seq = Some(seg.seq.wrapping_add(1));
        self.state = TcpState::InitAck;
        Ok(())
    }

    // ---- InitAck --------------------------------------------------------

    fn step_init_ack(&mut self, seg: Segment<'_>, to_server: bool) -> Result<(), ReassemblyError> {
        if to_server && seg.flags == TcpFlags::SYN {
            return Ok(());
        }
        if !to_server && seg.flags == (TcpFlags::SYN | TcpFlags::ACK) {
            return Ok(());
        }
        if !to_server && seg.flags == TcpFlags::RST {
            return Ok(());
        }
        if to_server && seg.flags == TcpFlags::RST {
            return Ok(());
        }
        if !to_server {
            tracing::warn!(flow = %self.flow_key, ts = seg.ts, "server sent data before the handshake ACK");
            return Ok(());
        }
        if seg.flags.contains(TcpFlags::ACK) && seg.has_payload() {
            self.state = TcpState::Conn;
            return self.step_conn(seg, to_server);
        }
        if to_server && seg.flags.contains(TcpFlags::FIN) {
            self.state = TcpState::ConnFinish;
            return Ok(());
        }
        if seg.flags != TcpFlags::ACK {
            return self.fail(&seg, |flow, segment| ReassemblyError::InvalidTcpPacketOrder { flow, segment });
        }
        if Some(seg.seq) != self.cli_next_seq || Some(seg.ack) != self.srv_next_seq {
            return self.fail(&seg, |flow, segment| ReassemblyError::UnknownTcpSequenceNumber { flow, segment });
        }
        if seg.has_payload() {
            return self.fail(&seg, |flow, segment| ReassemblyError::UnexpectedTcpData { flow, segment });
        }
        self.state = TcpState::Conn;
        Ok(())
    }

    // ---- Conn -------------------------------------------------------

    fn step_conn(&mut self, seg: Segment<'_>, to_server: bool) -> Result<(), ReassemblyError> {
        if seg.flags.contains(TcpFlags::ACK) {
            self.ack_release(seg.ack, seg.seq, !to_server);
        }
        if seg.flags.contains(TcpFlags::RST) {
            self.state = TcpState::ConnClosed;
            self.ack_release(seg.ack, seg.seq.wrapping_sub(1), !to_server);
        }

        let seq_end = seg.seq_end();

        if seg.flags.contains(TcpFlags::FIN) {
            self.state = TcpState::ConnFinish;
            if to_server {
                self.cli_next_seq = Some(seq_end.wrapping_add(1));
            } else {
                self.srv_next_seq = Some(seq_end.wrapping_add(1));
            }
        }

        if !seg.has_payload() {
            return Ok(());
        }

        if to_server && !self.recv_buf.is_empty() {
            self.flush_pair();
        }

        let key = (seq_end, seg.ack);
        let origin_key = (seg.seq, seg.ack);
        let existing_len = if let Some(stored) = self.pending.get(&key) {
            Some(stored.payload.len())
        } else if let Some(&orig_end) = self.origins.get(&origin_key) {
            self.pending.get(&(orig_end, seg.ack)).map(|s| s.payload.len())
        } else {
            None
        };

        if let Some(len) = existing_len {
            if len != seg.payload.len() {
                tracing::warn!(
                    flow = %self.flow_key,
                    original_len = len,
                    retransmit_len = seg.payload.len(),
                    "retransmitted segment has a different size than the original"
                );
            } else {
                tracing::debug!(flow = %self.flow_key, "retransmitted segment, same size, ignoring");
            }
        } else if self.pending.len() < self.config.max_pending_segments {
            self.origins.insert(origin_key, seq_end);
            self.pending.insert(
                key,
                StoredSegment {
                    ts: seg.ts,
                    payload: seg.payload.to_vec(),
                },
            );
        } else {
            self.dropped_for_capacity += 1;
            tracing::warn!(
                flow = %self.flow_key,
                "pending segment capacity reached, dropping out-of-order segment"
            );
        }

        Ok(())
    }

    // ---- ConnClosed -------------------------------------------------

    fn step_conn_closed(&mut self, seg: Segment<'_>, to_server: bool) -> Result<(), ReassemblyError> {
        self.step_conn(seg, to_server)?;
        self.ack_release(seg.seq_end(), seg.ack, to_server);
        Ok(())
    }

    // ---- ConnFinish ---------------------------------------------------

    fn step_conn_finish(&mut self, seg: Segment<'_>, to_server: bool) -> Result<(), ReassemblyError> {
        if self.cli_next_seq != Some(seg.ack) && self.srv_next_seq != Some(seg.ack) {
            return self.step_conn(seg, to_server);
        }

        if seg.flags.contains(TcpFlags::ACK) {
            if to_server {
                if self.srv_next_seq != Some(seg.ack) {
                    return self.fail(&seg, |flow, segment| ReassemblyError::InvalidTcpPacketOrder { flow, segment });
                }
                let adjusted = Segment { ack: seg.ack.wrapping_sub(1), ..seg };
                self.step_conn(adjusted, to_server)?;
                self.srv_next_seq = None;
            } else {
                if self.cli_next_seq != Some(seg.ack) {
                    return self.fail(&seg, |flow, segment| ReassemblyError::InvalidTcpPacketOrder { flow, segment });
                }
                let adjusted = Segment { ack: seg.ack.wrapping_sub(1), ..seg };
                self.step_conn(adjusted, to_server)?;
                self.cli_next_seq = None;
            }
        }

        if seg.flags.contains(TcpFlags::FIN) {
            if to_server {
                self.cli_next_seq = Some(seg.seq.wrapping_add(1));
            } else {
                self.srv_next_seq = Some(seg.seq.wrapping_add(1));
            }
        }

        Ok(())
    }

    // ---- shared helpers -----------------------------------------------

    /// Release everything queued under `(seq, ack)`, walking backward
    /// through contiguous segments, and append it to the buffer for
    /// `to_server_of_data`'s direction.
    fn ack_release(&mut self, mut seq: u32, ack: u32, to_server_of_data: bool) {
        let mut released = Vec::new();
        while let Some(stored) = self.pending.remove(&(seq, ack)) {
            let len = stored.payload.len() as u32;
            released.push(stored);
            seq = seq.wrapping_sub(len);
            self.origins.remove(&(seq, ack));
        }
        released.reverse();

        if self.pair_ts.is_none() {
            if let Some(first) = released.first() {
                self.pair_ts = Some(first.ts);
            }
        }

        let buf = if to_server_of_data {
            &mut self.sent_buf
        } else {
            &mut self.recv_buf
        };
        for stored in released {
            buf.extend_from_slice(&stored.payload);
        }
    }

    fn flush_pair(&mut self) {
        let ts = self.pair_ts.take().unwrap_or(0.0);
        let sent = std::mem::take(&mut self.sent_buf);
        let recv = std::mem::take(&mut self.recv_buf);
        self.parent
            .handle(Event::Tcp(FlowEvent::new(self.flow_key, ts, sent, recv)));
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::sink::CollectingSink;
    use pretty_assertions::assert_eq;
    use std::net::Ipv4Addr;

    fn flow() -> FlowKey {
        FlowKey::new(
            std::net::IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
            4000,
            std::net::IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)),
            80,
        )
    }

    fn seg(ts: f64, seq: u32, ack: u32, flags: TcpFlags, payload: &[u8]) -> Segment<'_> {
        Segment { ts, seq, ack, flags, payload }
    }

    struct Harness {
        r: TcpReassembler,
        events: std::rc::Rc<std::cell::RefCell<Vec<Event>>>,
    }

    impl Harness {
        fn new() -> Self {
            let events: std::rc::Rc<std::cell::RefCell<Vec<Event>>> = Default::default();
            let sink_events = events.clone();
            struct Recorder(std::rc::Rc<std::cell::RefCell<Vec<Event>>>);
            impl EventSink for Recorder {
                fn handle(&mut self, event: Event) {
                    self.0.borrow_mut().push(event);
                }
            }
            let r = TcpReassembler::new(flow(), Box::new(Recorder(sink_events)), TcpReassemblerConfig::default());
            Harness { r, events }
        }
    }

    fn handshake(h: &mut Harness) {
        h.r.process(seg(0.0, 1000, 0, TcpFlags::SYN, &[]), true).unwrap();
        h.r.process(seg(0.1, 5000, 1001, TcpFlags::SYN | TcpFlags::ACK, &[]), false).unwrap();
        h.r.process(seg(0.2, 1001, 5001, TcpFlags::ACK, &[]), true).unwrap();
    }

    #[test]
    fn clean_http_get_produces_one_pair() {
        let mut h = Harness::new();
        handshake(&mut h);

        let req = b"GET / HTTP/1.1\r\nHost: x\r\n\r\n";
        h.r.process(seg(1.0, 1001, 5001, TcpFlags::PSH | TcpFlags::ACK, req), true).unwrap();
        h.r.process(seg(1.1, 5001, 1001 + req.len() as u32, TcpFlags::ACK, &[]), false).unwrap();

        let resp = b"HTTP/1.1 200 OK\r\n\r\nhi";
        h.r.process(seg(1.2, 5001, 1001 + req.len() as u32, TcpFlags::PSH | TcpFlags::ACK, resp), false).unwrap();
        h.r.process(seg(1.3, 1001 + req.len() as u32, 5001 + resp.len() as u32, TcpFlags::ACK, &[]), true).unwrap();

        h.r.process(seg(2.0, 5001 + resp.len() as u32, 1001 + req.len() as u32, TcpFlags::FIN | TcpFlags::ACK, &[]), false).unwrap();
        h.r.process(seg(2.1, 1001 + req.len() as u32, 5001 + resp.len() as u32 + 1, TcpFlags::ACK, &[]), true).unwrap();
        h.r.process(seg(2.2, 1001 + req.len() as u32, 5001 + resp.len() as u32 + 1, TcpFlags::FIN | TcpFlags::ACK, &[]), true).unwrap();
        h.r.process(seg(2.3, 5001 + resp.len() as u32 + 1, 1001 + req.len() as u32 + 1, TcpFlags::ACK, &[]), false).unwrap();

        let events = h.events.borrow();
        assert_eq!(events.len(), 1);
        match &events[0] {
            Event::Tcp(ev) => {
                assert_eq!(ev.sent, req);
                assert_eq!(ev.recv, resp);
                assert_eq!(ev.ts(), 1.0);
            }
            _ => panic!("expected tcp event"),
        }
    }

    #[test]
    fn dead_host_returns_to_init_syn() {
        let mut h = Harness::new();
        h.r.process(seg(0.0, 1000, 0, TcpFlags::SYN, &[]), true).unwrap();
        h.r.process(seg(0.1, 0, 0, TcpFlags::RST, &[]), false).unwrap();
        assert_eq!(h.r.state, TcpState::InitSyn);
        // A later SYN on the same four-tuple is accepted as a new connection.
        h.r.process(seg(1.0, 2000, 0, TcpFlags::SYN, &[]), true).unwrap();
        assert_eq!(h.r.state, TcpState::InitSynAck);
    }

    #[test]
    fn out_of_order_segments_reassemble_in_sequence_order() {
        let mut h = Harness::new();
        handshake(&mut h);
        h.r.process(seg(1.0, 1100, 5001, TcpFlags::ACK, &[b'B'; 100]), true).unwrap();
        h.r.process(seg(1.1, 1000, 5001, TcpFlags::ACK, &[b'A'; 100]), true).unwrap();
        h.r.process(seg(1.2, 1200, 5001, TcpFlags::ACK, &[b'C'; 100]), true).unwrap();
        h.r.process(seg(1.3, 5001, 1300, TcpFlags::ACK, &[]), false).unwrap();

        // force a flush by flipping direction
        h.r.process(seg(2.0, 5001, 1300, TcpFlags::PSH | TcpFlags::ACK, b"x"), false).unwrap();
        h.r.process(seg(2.1, 1300, 5002, TcpFlags::PSH | TcpFlags::ACK, b"y"), true).unwrap();

        let events = h.events.borrow();
        assert_eq!(events.len(), 1);
        match &events[0] {
            Event::Tcp(ev) => {
                let mut expected = vec![b'A'; 100];
                expected.extend(vec![b'B'; 100]);
                expected.extend(vec![b'C'; 100]);
                assert_eq!(ev.sent, expected);
            }
            _ => panic!("expected tcp event"),
        }
    }

    #[test]
    fn retransmission_with_same_length_is_idempotent() {
        let mut h = Harness::new();
        handshake(&mut h);
        let req = b"GET / HTTP/1.1\r\n\r\n";
        h.r.process(seg(1.0, 1001, 5001, TcpFlags::PSH | TcpFlags::ACK, req), true).unwrap();
        // exact duplicate
        h.r.process(seg(1.05, 1001, 5001, TcpFlags::PSH | TcpFlags::ACK, req), true).unwrap();
        h.r.process(seg(1.1, 5001, 1001 + req.len() as u32, TcpFlags::ACK, &[]), false).unwrap();
        h.r.process(seg(1.2, 5001, 1001 + req.len() as u32, TcpFlags::PSH | TcpFlags::ACK, b"ok"), false).unwrap();

        let events = h.events.borrow();
        assert_eq!(events.len(), 1);
        match &events[0] {
            Event::Tcp(ev) => assert_eq!(ev.sent, req),
            _ => panic!("expected tcp event"),
        }
    }

    #[test]
    fn finish_flushes_trailing_pair() {
        let mut h = Harness::new();
        handshake(&mut h);
        let req = b"GET /\r\n\r\n";
        h.r.process(seg(1.0, 1001, 5001, TcpFlags::PSH | TcpFlags::ACK, req), true).unwrap();
        h.r.process(seg(1.1, 5001, 1001 + req.len() as u32, TcpFlags::ACK, &[]), false).unwrap();
        let warnings = h.r.finish();
        assert!(warnings.is_empty());
        let events = h.events.borrow();
        assert_eq!(events.len(), 1);
    }
}
