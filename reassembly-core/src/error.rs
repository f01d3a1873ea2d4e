//! Per-flow, non-fatal error taxonomy (spec.md §7).
//!
//! These mirror the exceptions the original implementation raises inside
//! its TCP state machine: a malformed segment never corrupts state, it is
//! either surfaced to the caller or filed into an [`ErrorLog`] depending on
//! [`TcpReassemblerConfig::raise_exceptions`](crate::tcp::TcpReassemblerConfig).

use std::collections::BTreeMap;

use thiserror::Error;

use crate::flow::{FlowKey, OwnedSegment};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ReassemblyError {
    /// A segment's flags are inconsistent with the current state.
    #[error("invalid TCP packet order on {flow}: {segment:?}")]
    InvalidTcpPacketOrder { flow: FlowKey, segment: OwnedSegment },

    /// A handshake-phase ACK carried a seq/ack that does not match the
    /// numbers captured during the handshake.
    #[error("unknown TCP sequence number on {flow}: {segment:?}")]
    UnknownTcpSequenceNumber { flow: FlowKey, segment: OwnedSegment },

    /// Payload arrived on a segment where the handshake forbids it.
    #[error("unexpected TCP data on {flow}: {segment:?}")]
    UnexpectedTcpData { flow: FlowKey, segment: OwnedSegment },
}

/// Errors collected instead of raised, keyed by timestamp (spec.md §6/§7).
///
/// A `BTreeMap` keyed on the float's bit pattern would silently merge
/// same-timestamp errors if it mapped to a single value, so each entry is a
/// `Vec` — more than one error can legitimately share a timestamp.
#[derive(Debug, Default, Clone)]
pub struct ErrorLog {
    by_timestamp: BTreeMap<crate::flow::ordered_ts::TsBits, Vec<ReassemblyError>>,
}

impl ErrorLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, ts: f64, error: ReassemblyError) {
        self.by_timestamp
            .entry(crate::flow::ordered_ts::TsBits::from_f64(ts))
            .or_default()
            .push(error);
    }

    pub fn is_empty(&self) -> bool {
        self.by_timestamp.is_empty()
    }

    pub fn len(&self) -> usize {
        self.by_timestamp.values().map(Vec::len).sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = (f64, &ReassemblyError)> {
        self.by_timestamp
            .iter()
            .flat_map(|(ts, errs)| errs.iter().map(move |e| (ts.to_f64(), e)))
    }
}
