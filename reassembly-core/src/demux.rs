//! Maps segments to flows and owns one [`TcpReassembler`] per flow
//! (spec.md §4.1).

use std::collections::HashMap;
use std::net::IpAddr;

use crate::flow::{FlowKey, Segment, TcpFlags};
use crate::sink::EventSink;
use crate::tcp::{PendingSegmentWarning, TcpReassembler, TcpReassemblerConfig};

/// Produces a fresh handler (an [`EventSink`]) for a newly observed flow,
/// given that flow's identity.
pub type HandlerFactory = Box<dyn Fn(FlowKey) -> Box<dyn EventSink>>;

/// Port-keyed handler registry, fixed before `process()` is first called
/// (spec.md §5).
#[derive(Default)]
pub struct Handlers {
    by_port: HashMap<u16, HandlerFactory>,
    generic: Option<HandlerFactory>,
}

impl Handlers {
    pub fn builder() -> HandlersBuilder {
        HandlersBuilder::default()
    }

    fn select(&self, src_port: u16, dst_port: u16) -> Option<&HandlerFactory> {
        self.by_port
            .get(&dst_port)
            .or_else(|| self.by_port.get(&src_port))
            .or(self.generic.as_ref())
    }
}

#[derive(Default)]
pub struct HandlersBuilder {
    handlers: Handlers,
}

impl HandlersBuilder {
    pub fn port(mut self, port: u16, factory: impl Fn(FlowKey) -> Box<dyn EventSink> + 'static) -> Self {
        self.handlers.by_port.insert(port, Box::new(factory));
        self
    }

    pub fn generic(mut self, factory: impl Fn(FlowKey) -> Box<dyn EventSink> + 'static) -> Self {
        self.handlers.generic = Some(Box::new(factory));
        self
    }

    pub fn build(self) -> Handlers {
        self.handlers
    }
}

/// Diagnostic counters supplementing spec.md §4.1 (see SPEC_FULL.md §4.1).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Stats {
    pub segments_seen: u64,
    pub segments_dropped_unroutable: u64,
    pub flows_created: u64,
}

pub struct FlowDemux {
    handlers: Handlers,
    flows: HashMap<FlowKey, TcpReassembler>,
    reassembler_config: TcpReassemblerConfig,
    stats: Stats,
}

impl FlowDemux {
    pub fn new(handlers: Handlers, reassembler_config: TcpReassemblerConfig) -> Self {
        Self {
            handlers,
            flows: HashMap::new(),
            reassembler_config,
            stats: Stats::default(),
        }
    }

    pub fn stats(&self) -> Stats {
        self.stats
    }

    /// Route one segment to the flow it belongs to, creating a new
    /// reassembler on a bare SYN for an unknown flow.
    pub fn process(&mut self, src_ip: IpAddr, dst_ip: IpAddr, seg: Segment<'_>, src_port: u16, dst_port: u16) {
        self.stats.segments_seen += 1;

        let forward = FlowKey::new(src_ip, src_port, dst_ip, dst_port);
        let reverse = forward.reversed();

        if !self.flows.contains_key(&forward) && seg.flags.is_bare_syn() {
            let factory = self.handlers.select(src_port, dst_port);
            let Some(factory) = factory else {
                tracing::debug!(flow = %forward, "no handler registered for new flow, dropping SYN");
                self.stats.segments_dropped_unroutable += 1;
                return;
            };
            let handler = factory(forward);
            self.flows
                .insert(forward, TcpReassembler::new(forward, handler, self.reassembler_config));
            self.stats.flows_created += 1;
        }

        if let Some(reassembler) = self.flows.get_mut(&forward) {
            if let Err(err) = reassembler.process(seg, true) {
                tracing::error!(flow = %forward, ts = seg.ts, "{err}");
            }
        } else if let Some(reassembler) = self.flows.get_mut(&reverse) {
            if let Err(err) = reassembler.process(seg, false) {
                tracing::error!(flow = %reverse, ts = seg.ts, "{err}");
            }
        } else {
            // Open Question (a): a segment whose flow was never SYN-initiated.
            // Preserved behavior: silently dropped, but counted and logged.
            tracing::debug!(flow = %forward, ts = seg.ts, "segment for unknown flow, dropping");
            self.stats.segments_dropped_unroutable += 1;
        }
    }

    /// Flush every flow's trailing pair and report stragglers.
    pub fn finish(&mut self) -> HashMap<FlowKey, Vec<PendingSegmentWarning>> {
        self.flows
            .iter_mut()
            .filter_map(|(&key, r)| {
                let warnings = r.finish();
                if warnings.is_empty() {
                    None
                } else {
                    Some((key, warnings))
                }
            })
            .collect()
    }

    pub fn flow_count(&self) -> usize {
        self.flows.len()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::sink::CollectingSink;
    use std::net::Ipv4Addr;

    fn ip(n: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(10, 0, 0, n))
    }

    #[test]
    fn unknown_port_without_generic_handler_is_dropped() {
        let handlers = Handlers::builder().port(80, |_flow| Box::new(CollectingSink::default())).build();
        let mut demux = FlowDemux::new(handlers, TcpReassemblerConfig::default());
        let seg = Segment { ts: 0.0, seq: 1, ack: 0, flags: TcpFlags::SYN, payload: &[] };
        demux.process(ip(1), ip(2), seg, 4000, 443);
        assert_eq!(demux.flow_count(), 0);
        assert_eq!(demux.stats().segments_dropped_unroutable, 1);
    }

    #[test]
    fn matching_port_creates_one_reassembler_per_flow() {
        let handlers = Handlers::builder().port(80, |_flow| Box::new(CollectingSink::default())).build();
        let mut demux = FlowDemux::new(handlers, TcpReassemblerConfig::default());
        let syn = Segment { ts: 0.0, seq: 1, ack: 0, flags: TcpFlags::SYN, payload: &[] };
        demux.process(ip(1), ip(2), syn, 4000, 80);
        assert_eq!(demux.flow_count(), 1);
        assert_eq!(demux.stats().flows_created, 1);

        // A second, distinct flow gets its own reassembler.
        let syn2 = Segment { ts: 0.0, seq: 1, ack: 0, flags: TcpFlags::SYN, payload: &[] };
        demux.process(ip(1), ip(2), syn2, 4001, 80);
        assert_eq!(demux.flow_count(), 2);
    }

    #[test]
    fn reverse_traffic_routes_to_existing_flow() {
        let handlers = Handlers::builder().port(80, |_flow| Box::new(CollectingSink::default())).build();
        let mut demux = FlowDemux::new(handlers, TcpReassemblerConfig::default());
        let syn = Segment { ts: 0.0, seq: 1000, ack: 0, flags: TcpFlags::SYN, payload: &[] };
        demux.process(ip(1), ip(2), syn, 4000, 80);

        let synack = Segment { ts: 0.1, seq: 5000, ack: 1001, flags: TcpFlags::SYN | TcpFlags::ACK, payload: &[] };
        // Arrives from the server: src/dst swapped relative to the client's SYN.
        demux.process(ip(2), ip(1), synack, 80, 4000);
        assert_eq!(demux.flow_count(), 1);
    }
}
