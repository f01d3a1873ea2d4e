//! TLS record-layer reassembly and decryption (spec.md §4.3): sits above a
//! [`crate::tcp::TcpReassembler`] (consuming its [`Event::Tcp`] pairs) and
//! delivers [`Event::Tls`] pairs of decrypted application data, plus the
//! JA3/JA3S fingerprints derived from the handshake, to its own sink.
//!
//! Grounded in `httpreplay/smegma.py`'s `TLSStream`/`_TLSStream`.

mod fingerprint;
mod handshake;
mod record;

pub use fingerprint::grease;
pub use handshake::{ClientHelloInfo, HandshakeParseError, ServerHelloInfo};
pub use record::{ContentType, RawRecord};

use std::collections::{HashMap, VecDeque};

use thiserror::Error;

use crate::flow::FlowKey;
use crate::sink::{Event, EventSink, FlowEvent};
use record::FrameResult;

/// The six states of the TLS record-layer state machine (spec.md §4.3).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum TlsState {
    Init,
    AwaitClientCcs,
    AwaitServerCcs,
    FirstDecrypt,
    Stream,
    Done,
}

/// JA3/JA3S and the retained handshake messages they were computed from
/// (spec.md §3), matching the original's `TLSInfo`.
#[derive(Clone, Debug, PartialEq)]
pub struct TlsInfo {
    pub ja3: Option<String>,
    pub ja3_params: Option<String>,
    pub ja3s: Option<String>,
    pub ja3s_params: Option<String>,
    pub client_hello: Option<ClientHelloInfo>,
    pub server_hello: Option<ServerHelloInfo>,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CipherInitError {
    #[error("unsupported cipher suite {0:#06x}")]
    UnsupportedCipherSuite(u16),
    #[error("key derivation failed: {0}")]
    KeyDerivation(String),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecryptError {
    #[error("record authentication failed")]
    BadRecordMac,
    #[error("malformed ciphertext")]
    Malformed,
}

/// The externally supplied "record-layer library" from spec.md §1: given
/// the negotiated parameters and a master secret, produce one decrypter per
/// direction. Injected at [`TlsReassembler`] construction rather than
/// implemented here — actual TLS decryption is out of scope.
pub trait CipherSuiteInit {
    /// Returns `(client_write_decrypter, server_write_decrypter)`.
    fn init(
        &self,
        tls_version: u16,
        cipher_suite: u16,
        master_secret: &[u8; 48],
        client_random: &[u8; 32],
        server_random: &[u8; 32],
    ) -> Result<(Box<dyn RecordDecrypter>, Box<dyn RecordDecrypter>), CipherInitError>;
}

/// Decrypts successive records for one direction of one connection.
/// Implementations carry whatever per-direction sequence/nonce state the
/// cipher suite needs.
pub trait RecordDecrypter {
    fn decrypt(&mut self, content_type: ContentType, ciphertext: &[u8]) -> Result<Vec<u8>, DecryptError>;
}

/// Looks up a master secret by whichever identifier the key-provisioning
/// source recorded it under (spec.md §6).
#[derive(Default, Clone)]
pub struct SecretStore {
    by_session_id: HashMap<Vec<u8>, [u8; 48]>,
    by_client_random: HashMap<[u8; 32], [u8; 48]>,
    by_random_pair: HashMap<([u8; 32], [u8; 32]), [u8; 48]>,
}

impl SecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_by_session_id(&mut self, session_id: Vec<u8>, master_secret: [u8; 48]) {
        self.by_session_id.insert(session_id, master_secret);
    }

    pub fn insert_by_client_random(&mut self, client_random: [u8; 32], master_secret: [u8; 48]) {
        self.by_client_random.insert(client_random, master_secret);
    }

    pub fn insert_by_random_pair(&mut self, client_random: [u8; 32], server_random: [u8; 32], master_secret: [u8; 48]) {
        self.by_random_pair.insert((client_random, server_random), master_secret);
    }

    /// Parses the NSS "SSLKEYLOGFILE" format (`CLIENT_RANDOM <hex> <hex>`),
    /// the de facto standard external tooling uses to hand over TLS key
    /// material (SPEC_FULL.md §6). Unrecognized lines are ignored, matching
    /// the format's own forward-compatibility convention (readers must
    /// skip label keywords they don't recognize).
    pub fn from_sslkeylog(contents: &str) -> Self {
        let mut store = Self::new();
        for line in contents.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut parts = line.split_whitespace();
            let Some(label) = parts.next() else { continue };
            if label != "CLIENT_RANDOM" {
                continue;
            }
            let (Some(random_hex), Some(secret_hex)) = (parts.next(), parts.next()) else {
                continue;
            };
            let (Ok(random), Ok(secret)) = (hex_to_array::<32>(random_hex), hex_to_array::<48>(secret_hex)) else {
                continue;
            };
            store.insert_by_client_random(random, secret);
        }
        store
    }

    fn lookup(&self, session_id: &[u8], client_random: &[u8; 32], server_random: &[u8; 32]) -> Option<[u8; 48]> {
        self.by_session_id
            .get(session_id)
            .copied()
            .or_else(|| self.by_client_random.get(client_random).copied())
            .or_else(|| self.by_random_pair.get(&(*client_random, *server_random)).copied())
    }
}

fn hex_to_array<const N: usize>(s: &str) -> Result<[u8; N], ()> {
    if s.len() != N * 2 {
        return Err(());
    }
    let mut out = [0u8; N];
    for (i, chunk) in s.as_bytes().chunks_exact(2).enumerate() {
        let hi = (chunk[0] as char).to_digit(16).ok_or(())?;
        let lo = (chunk[1] as char).to_digit(16).ok_or(())?;
        out[i] = ((hi << 4) | lo) as u8;
    }
    Ok(out)
}

pub struct TlsReassembler {
    flow: FlowKey,
    state: TlsState,
    /// Set once record framing reveals the flow isn't TLS at all; every
    /// subsequent pair is forwarded upward untouched (see SPEC_FULL.md §4.3
    /// for why this is an explicit flag rather than the original's
    /// incidental per-call behavior).
    passthrough: bool,
    raw_sent: Vec<u8>,
    raw_recv: Vec<u8>,
    sent_records: VecDeque<RawRecord>,
    recv_records: VecDeque<RawRecord>,
    client_hello: Option<ClientHelloInfo>,
    server_hello: Option<ServerHelloInfo>,
    sent_decrypter: Option<Box<dyn RecordDecrypter>>,
    recv_decrypter: Option<Box<dyn RecordDecrypter>>,
    cipher_init: Box<dyn CipherSuiteInit>,
    secrets: SecretStore,
    parent: Box<dyn EventSink>,
}

impl TlsReassembler {
    pub fn new(flow: FlowKey, cipher_init: Box<dyn CipherSuiteInit>, secrets: SecretStore, parent: Box<dyn EventSink>) -> Self {
        Self {
            flow,
            state: TlsState::Init,
            passthrough: false,
            raw_sent: Vec::new(),
            raw_recv: Vec::new(),
            sent_records: VecDeque::new(),
            recv_records: VecDeque::new(),
            client_hello: None,
            server_hello: None,
            sent_decrypter: None,
            recv_decrypter: None,
            cipher_init,
            secrets,
            parent,
        }
    }

    fn on_tcp_pair(&mut self, ev: FlowEvent) {
        if self.passthrough {
            self.parent.handle(Event::Tcp(ev));
            return;
        }
        if self.state == TlsState::Done {
            // Spec invariant: once decryption is abandoned, further pairs
            // for this flow are silently discarded.
            return;
        }

        self.raw_sent.extend_from_slice(&ev.sent);
        self.raw_recv.extend_from_slice(&ev.recv);

        match record::frame(&mut self.raw_sent) {
            FrameResult::NotTls => return self.enter_passthrough(ev),
            FrameResult::Records(recs) => self.sent_records.extend(recs),
        }
        match record::frame(&mut self.raw_recv) {
            FrameResult::NotTls => return self.enter_passthrough(ev),
            FrameResult::Records(recs) => self.recv_records.extend(recs),
        }

        let ts = ev.ts();
        while self.step(ts) {}
    }

    fn enter_passthrough(&mut self, ev: FlowEvent) {
        tracing::debug!(flow = %self.flow, "non-TLS traffic on handler registered for TLS, passing through");
        self.passthrough = true;
        self.raw_sent.clear();
        self.raw_recv.clear();
        self.sent_records.clear();
        self.recv_records.clear();
        self.parent.handle(Event::Tcp(ev));
    }

    /// Advances the state machine by one step. Returns `true` if another
    /// step might immediately be possible (more buffered records remain, or
    /// a state transition just happened), `false` if it must wait for more
    /// data.
    fn step(&mut self, ts: f64) -> bool {
        match self.state {
            TlsState::Init => self.step_init(),
            TlsState::AwaitClientCcs => self.step_await_ccs(true),
            TlsState::AwaitServerCcs => self.step_await_ccs(false),
            TlsState::FirstDecrypt => self.step_first_decrypt(),
            TlsState::Stream => self.step_stream(ts),
            TlsState::Done => {
                self.sent_records.clear();
                self.recv_records.clear();
                false
            }
        }
    }

    fn step_init(&mut self) -> bool {
        if self.sent_records.is_empty() || self.recv_records.is_empty() {
            return false;
        }
        let client_rec = self.sent_records.pop_front().expect("checked non-empty above");
        let server_rec = self.recv_records.pop_front().expect("checked non-empty above");
        if client_rec.content_type != ContentType::Handshake || server_rec.content_type != ContentType::Handshake {
            tracing::debug!(flow = %self.flow, "expected a handshake record to open the connection");
            self.state = TlsState::Done;
            return true;
        }

        let client_hello = match handshake::parse_client_hello(&client_rec.payload) {
            Ok(hello) => hello,
            Err(err) => {
                tracing::debug!(flow = %self.flow, %err, "could not parse ClientHello");
                self.state = TlsState::Done;
                return true;
            }
        };
        let server_hello = match handshake::parse_server_hello(&server_rec.payload) {
            Ok(hello) => hello,
            Err(err) => {
                tracing::debug!(flow = %self.flow, %err, "could not parse ServerHello");
                self.state = TlsState::Done;
                return true;
            }
        };

        let Some(master_secret) = self.secrets.lookup(&server_hello.session_id, &client_hello.random, &server_hello.random) else {
            tracing::debug!(flow = %self.flow, "no key material for this connection, giving up on decryption");
            self.client_hello = Some(client_hello);
            self.server_hello = Some(server_hello);
            self.state = TlsState::Done;
            return true;
        };

        match self.cipher_init.init(
            client_hello.version,
            server_hello.cipher_suite,
            &master_secret,
            &client_hello.random,
            &server_hello.random,
        ) {
            Ok((sent_dec, recv_dec)) => {
                self.sent_decrypter = Some(sent_dec);
                self.recv_decrypter = Some(recv_dec);
            }
            Err(err) => {
                tracing::warn!(flow = %self.flow, %err, "cipher suite initialization failed");
                self.client_hello = Some(client_hello);
                self.server_hello = Some(server_hello);
                self.state = TlsState::Done;
                return true;
            }
        }

        self.client_hello = Some(client_hello);
        self.server_hello = Some(server_hello);
        self.state = TlsState::AwaitClientCcs;
        true
    }

    fn step_await_ccs(&mut self, client_side: bool) -> bool {
        let queue = if client_side { &mut self.sent_records } else { &mut self.recv_records };
        while let Some(rec) = queue.pop_front() {
            if rec.content_type == ContentType::ChangeCipherSpec {
                self.state = if client_side { TlsState::AwaitServerCcs } else { TlsState::FirstDecrypt };
                return true;
            }
            // Other handshake traffic (certificates, key exchange) before
            // the ChangeCipherSpec is discarded unread, matching the
            // original: nothing before the session keys are live can be
            // meaningfully decrypted anyway.
        }
        false
    }

    fn step_first_decrypt(&mut self) -> bool {
        if self.sent_records.is_empty() || self.recv_records.is_empty() {
            return false;
        }
        let c = self.sent_records.pop_front().expect("checked non-empty above");
        let s = self.recv_records.pop_front().expect("checked non-empty above");
        // The first post-CCS record on each side is the Finished message;
        // decrypt it only to advance the cipher's internal sequence state,
        // the plaintext itself is discarded.
        if let Some(dec) = self.sent_decrypter.as_mut() {
            if let Err(err) = dec.decrypt(c.content_type, &c.payload) {
                tracing::warn!(flow = %self.flow, %err, "failed to decrypt client Finished message");
            }
        }
        if let Some(dec) = self.recv_decrypter.as_mut() {
            if let Err(err) = dec.decrypt(s.content_type, &s.payload) {
                tracing::warn!(flow = %self.flow, %err, "failed to decrypt server Finished message");
            }
        }
        self.state = TlsState::Stream;
        true
    }

    fn step_stream(&mut self, ts: f64) -> bool {
        if self.sent_records.is_empty() || self.recv_records.is_empty() {
            return false;
        }

        let mut sent = Vec::new();
        while let Some(rec) = self.sent_records.pop_front() {
            match self.sent_decrypter.as_mut().expect("decrypter installed in Init").decrypt(rec.content_type, &rec.payload) {
                Ok(pt) => sent.extend_from_slice(&pt),
                Err(err) => tracing::warn!(flow = %self.flow, %err, "dropping undecryptable client record"),
            }
        }
        let mut recv = Vec::new();
        while let Some(rec) = self.recv_records.pop_front() {
            match self.recv_decrypter.as_mut().expect("decrypter installed in Init").decrypt(rec.content_type, &rec.payload) {
                Ok(pt) => recv.extend_from_slice(&pt),
                Err(err) => tracing::warn!(flow = %self.flow, %err, "dropping undecryptable server record"),
            }
        }

        let (ja3, ja3_params) = self.client_hello.as_ref().map(fingerprint::ja3).map_or((None, None), |(h, p)| (Some(h), Some(p)));
        let (ja3s, ja3s_params) = self.server_hello.as_ref().map(fingerprint::ja3s).map_or((None, None), |(h, p)| (Some(h), Some(p)));
        let info = TlsInfo {
            ja3,
            ja3_params,
            ja3s,
            ja3s_params,
            client_hello: self.client_hello.clone(),
            server_hello: self.server_hello.clone(),
        };

        self.parent.handle(Event::Tls(FlowEvent::new(self.flow, ts, sent, recv), Box::new(info)));
        false
    }
}

impl EventSink for TlsReassembler {
    fn handle(&mut self, event: Event) {
        match event {
            Event::Tcp(ev) => self.on_tcp_pair(ev),
            // A TLS event arriving from below would mean this reassembler
            // was stacked on top of another protocol layer that already
            // produced one; there is no such pipeline in this crate, but
            // forwarding rather than panicking keeps `EventSink` total.
            other @ Event::Tls(..) => self.parent.handle(other),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::sink::CollectingSink;
    use pretty_assertions::assert_eq;
    use std::cell::RefCell;
    use std::net::{IpAddr, Ipv4Addr};
    use std::rc::Rc;

    fn flow() -> FlowKey {
        FlowKey::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), 4000, IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)), 443)
    }

    /// Shares a `CollectingSink` between a `TlsReassembler` under test and
    /// the assertions that follow, since `EventSink` is consumed by value.
    #[derive(Clone, Default)]
    struct SharedSink(Rc<RefCell<CollectingSink>>);

    impl EventSink for SharedSink {
        fn handle(&mut self, event: Event) {
            self.0.borrow_mut().handle(event)
        }
    }

    struct NullDecrypter;
    impl RecordDecrypter for NullDecrypter {
        fn decrypt(&mut self, _content_type: ContentType, ciphertext: &[u8]) -> Result<Vec<u8>, DecryptError> {
            Ok(ciphertext.to_vec())
        }
    }

    struct StubCipherInit;
    impl CipherSuiteInit for StubCipherInit {
        fn init(
            &self,
            _tls_version: u16,
            _cipher_suite: u16,
            _master_secret: &[u8; 48],
            _client_random: &[u8; 32],
            _server_random: &[u8; 32],
        ) -> Result<(Box<dyn RecordDecrypter>, Box<dyn RecordDecrypter>), CipherInitError> {
            Ok((Box::new(NullDecrypter), Box::new(NullDecrypter)))
        }
    }

    fn record_bytes(content_type: u8, version: u16, payload: &[u8]) -> Vec<u8> {
        let mut out = vec![content_type];
        out.extend_from_slice(&version.to_be_bytes());
        out.extend_from_slice(&(payload.len() as u16).to_be_bytes());
        out.extend_from_slice(payload);
        out
    }

    fn client_hello_handshake(cipher_suites: &[u16]) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(&0x0303u16.to_be_bytes());
        body.extend_from_slice(&[7u8; 32]);
        body.push(0);
        body.extend_from_slice(&((cipher_suites.len() * 2) as u16).to_be_bytes());
        for cs in cipher_suites {
            body.extend_from_slice(&cs.to_be_bytes());
        }
        body.push(1);
        body.push(0);
        body.extend_from_slice(&0u16.to_be_bytes()); // empty extensions
        let mut msg = vec![1u8];
        msg.extend_from_slice(&[(body.len() >> 16) as u8, (body.len() >> 8) as u8, body.len() as u8]);
        msg.extend_from_slice(&body);
        msg
    }

    fn server_hello_handshake(cipher_suite: u16) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(&0x0303u16.to_be_bytes());
        body.extend_from_slice(&[9u8; 32]);
        body.push(0);
        body.extend_from_slice(&cipher_suite.to_be_bytes());
        body.push(0);
        body.extend_from_slice(&0u16.to_be_bytes());
        let mut msg = vec![2u8];
        msg.extend_from_slice(&[(body.len() >> 16) as u8, (body.len() >> 8) as u8, body.len() as u8]);
        msg.extend_from_slice(&body);
        msg
    }

    fn build(secrets: SecretStore) -> TlsReassembler {
        TlsReassembler::new(flow(), Box::new(StubCipherInit), secrets, Box::new(CollectingSink::default()))
    }

    #[test]
    fn full_handshake_then_stream_emits_tls_event_with_fingerprints() {
        let mut secrets = SecretStore::new();
        secrets.insert_by_client_random([7u8; 32], [0u8; 48]);
        let sink = SharedSink::default();
        let mut tls = TlsReassembler::new(flow(), Box::new(StubCipherInit), secrets, Box::new(sink.clone()));

        let client_hello_rec = record_bytes(22, 0x0301, &client_hello_handshake(&[0x1301, 0x0a0a]));
        let server_hello_rec = record_bytes(22, 0x0303, &server_hello_handshake(0x1301));
        tls.on_tcp_pair(FlowEvent::new(flow(), 0.0, client_hello_rec, server_hello_rec));

        let client_ccs = record_bytes(20, 0x0303, &[1]);
        let server_ccs = record_bytes(20, 0x0303, &[1]);
        tls.on_tcp_pair(FlowEvent::new(flow(), 0.1, client_ccs, server_ccs));

        let client_finished = record_bytes(22, 0x0303, &[0xaa; 16]);
        let server_finished = record_bytes(22, 0x0303, &[0xbb; 16]);
        tls.on_tcp_pair(FlowEvent::new(flow(), 0.2, client_finished, server_finished));

        let app_data_client = record_bytes(23, 0x0303, b"GET / HTTP/1.1");
        let app_data_server = record_bytes(23, 0x0303, b"HTTP/1.1 200 OK");
        tls.on_tcp_pair(FlowEvent::new(flow(), 0.3, app_data_client, app_data_server));

        assert_eq!(tls.state, TlsState::Stream);

        let events = &sink.0.borrow().events;
        assert_eq!(events.len(), 1);
        let Event::Tls(ev, info) = &events[0] else {
            panic!("expected a Tls event, got {:?}", events[0]);
        };
        assert_eq!(ev.sent, b"GET / HTTP/1.1");
        assert_eq!(ev.recv, b"HTTP/1.1 200 OK");
        assert!(info.ja3.is_some(), "GREASE cipher suite should be stripped, not block fingerprinting");
        assert!(info.ja3s.is_some());
        // The GREASE cipher suite (0x0a0a) must not survive into the JA3 string.
        assert!(!info.ja3_params.as_ref().unwrap().contains("2570"));
    }

    #[test]
    fn stream_waits_for_both_sides_before_emitting() {
        let mut secrets = SecretStore::new();
        secrets.insert_by_client_random([7u8; 32], [0u8; 48]);
        let sink = SharedSink::default();
        let mut tls = TlsReassembler::new(flow(), Box::new(StubCipherInit), secrets, Box::new(sink.clone()));

        let client_hello_rec = record_bytes(22, 0x0301, &client_hello_handshake(&[0x1301]));
        let server_hello_rec = record_bytes(22, 0x0303, &server_hello_handshake(0x1301));
        tls.on_tcp_pair(FlowEvent::new(flow(), 0.0, client_hello_rec, server_hello_rec));

        let client_ccs = record_bytes(20, 0x0303, &[1]);
        let server_ccs = record_bytes(20, 0x0303, &[1]);
        tls.on_tcp_pair(FlowEvent::new(flow(), 0.1, client_ccs, server_ccs));

        let client_finished = record_bytes(22, 0x0303, &[0xaa; 16]);
        let server_finished = record_bytes(22, 0x0303, &[0xbb; 16]);
        tls.on_tcp_pair(FlowEvent::new(flow(), 0.2, client_finished, server_finished));

        assert_eq!(tls.state, TlsState::Stream);

        // Only the client side carries application data in this pair; the
        // server hasn't responded yet. Must not emit a lopsided event.
        let app_data_client = record_bytes(23, 0x0303, b"GET / HTTP/1.1");
        tls.on_tcp_pair(FlowEvent::new(flow(), 0.3, app_data_client, Vec::new()));
        assert!(sink.0.borrow().events.is_empty(), "must wait until both sides have a record");

        // The server's response now arrives in its own pair; both the
        // earlier client record and this server record should be drained
        // together into a single event.
        let app_data_server = record_bytes(23, 0x0303, b"HTTP/1.1 200 OK");
        tls.on_tcp_pair(FlowEvent::new(flow(), 0.4, Vec::new(), app_data_server));

        let events = &sink.0.borrow().events;
        assert_eq!(events.len(), 1);
        let Event::Tls(ev, _info) = &events[0] else {
            panic!("expected a Tls event, got {:?}", events[0]);
        };
        assert_eq!(ev.sent, b"GET / HTTP/1.1");
        assert_eq!(ev.recv, b"HTTP/1.1 200 OK");
    }

    #[test]
    fn missing_key_material_gives_up_without_panicking() {
        let mut tls = build(SecretStore::new());
        let client_hello_rec = record_bytes(22, 0x0301, &client_hello_handshake(&[0x1301]));
        let server_hello_rec = record_bytes(22, 0x0303, &server_hello_handshake(0x1301));
        tls.on_tcp_pair(FlowEvent::new(flow(), 0.0, client_hello_rec, server_hello_rec));
        assert_eq!(tls.state, TlsState::Done);
    }

    #[test]
    fn non_tls_traffic_is_passed_through() {
        let mut tls = build(SecretStore::new());
        tls.on_tcp_pair(FlowEvent::new(flow(), 0.0, b"GET / HTTP/1.1\r\n".to_vec(), b"HTTP/1.1 200 OK\r\n".to_vec()));
        assert!(tls.passthrough);
    }

    #[test]
    fn sslkeylog_parses_client_random_lines() {
        let contents = format!(
            "# comment\nCLIENT_RANDOM {} {}\n",
            "07".repeat(32),
            "00".repeat(48)
        );
        let store = SecretStore::from_sslkeylog(&contents);
        assert_eq!(store.by_client_random.len(), 1);
    }
}
