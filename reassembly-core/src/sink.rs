//! The "parent" handle from spec.md Design Notes §9: an interface-typed
//! event sink, injected at construction, instead of a mutable parent
//! back-reference walked and rewritten at runtime.

use crate::flow::FlowKey;
use crate::tls::TlsInfo;

/// One reconstructed request/response pair, plus the flow and timestamp of
/// its first unflushed byte (spec.md §3 `pair_ts`).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FlowEvent {
    pub flow: FlowKey,
    /// Timestamp, as bit pattern (see [`crate::flow::ordered_ts`]); use
    /// [`FlowEvent::ts`] to read it back as `f64`.
    ts_bits: crate::flow::ordered_ts::TsBits,
    pub sent: Vec<u8>,
    pub recv: Vec<u8>,
}

impl FlowEvent {
    pub fn new(flow: FlowKey, ts: f64, sent: Vec<u8>, recv: Vec<u8>) -> Self {
        Self {
            flow,
            ts_bits: crate::flow::ordered_ts::TsBits::from_f64(ts),
            sent,
            recv,
        }
    }

    pub fn ts(&self) -> f64 {
        self.ts_bits.to_f64()
    }
}

/// The egress event delivered upward (spec.md §6).
#[derive(Clone, Debug, PartialEq)]
pub enum Event {
    Tcp(FlowEvent),
    Tls(FlowEvent, Box<TlsInfo>),
}

impl Event {
    pub fn flow(&self) -> FlowKey {
        match self {
            Event::Tcp(e) | Event::Tls(e, _) => e.flow,
        }
    }

    pub fn protocol_tag(&self) -> &'static str {
        match self {
            Event::Tcp(_) => "tcp",
            Event::Tls(_, _) => "tls",
        }
    }
}

/// A handler's delivery target. Any component further up the pipeline
/// (another protocol layer, or the final collector) implements this.
pub trait EventSink {
    fn handle(&mut self, event: Event);
}

/// An `EventSink` that simply remembers everything it was given, for tests
/// and for simple offline batch processing.
#[derive(Debug, Default)]
pub struct CollectingSink {
    pub events: Vec<Event>,
}

impl EventSink for CollectingSink {
    fn handle(&mut self, event: Event) {
        self.events.push(event);
    }
}

impl<F: FnMut(Event)> EventSink for F {
    fn handle(&mut self, event: Event) {
        (self)(event)
    }
}
