//! Packet-to-stream reconstruction: TCP reassembly into request/response
//! pairs, TLS record-layer decryption given externally supplied key
//! material, and JA3/JA3S fingerprinting.
//!
//! Capture-file decoding, application-layer parsing above TCP, key material
//! provisioning, and cryptographic primitives are external collaborators,
//! injected here as traits rather than implemented by this crate.

pub mod demux;
pub mod error;
pub mod flow;
pub mod sink;
pub mod tcp;
pub mod tls;

pub use demux::{Handlers, HandlersBuilder, HandlerFactory, FlowDemux, Stats};
pub use error::{ErrorLog, ReassemblyError};
pub use flow::{FlowKey, Segment, TcpFlags};
pub use sink::{CollectingSink, Event, EventSink, FlowEvent};
pub use tcp::{PendingSegmentWarning, TcpReassembler, TcpReassemblerConfig};
pub use tls::{CipherInitError, CipherSuiteInit, DecryptError, RecordDecrypter, SecretStore, TlsInfo, TlsReassembler};
