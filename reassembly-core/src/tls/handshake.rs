//! ClientHello/ServerHello wire parsing (RFC 8446 §4.1.2/§4.1.3), kept as
//! raw, order-preserving field lists rather than a normalized struct, since
//! JA3/JA3S are defined over exactly that raw ordering (spec.md §4.4).
//!
//! Grounded in the original's reliance on `dpkt.ssl.TLSClientHello` /
//! `TLSServerHello` for the same extraction (`httpreplay/smegma.py`).

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HandshakeParseError {
    #[error("handshake message truncated")]
    Truncated,
    #[error("unexpected handshake message type {0}")]
    WrongMessageType(u8),
}

type Result<T> = std::result::Result<T, HandshakeParseError>;

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.buf.len() < self.pos + n {
            return Err(HandshakeParseError::Truncated);
        }
        let s = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(s)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u24(&mut self) -> Result<usize> {
        let b = self.take(3)?;
        Ok(((b[0] as usize) << 16) | ((b[1] as usize) << 8) | b[2] as usize)
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }
}

const HANDSHAKE_CLIENT_HELLO: u8 = 1;
const HANDSHAKE_SERVER_HELLO: u8 = 2;

/// An extension as it appeared on the wire: type and raw body, in order.
pub type RawExtension = (u16, Vec<u8>);

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClientHelloInfo {
    pub version: u16,
    pub random: [u8; 32],
    pub session_id: Vec<u8>,
    pub cipher_suites: Vec<u16>,
    pub compression_methods: Vec<u8>,
    pub extensions: Vec<RawExtension>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServerHelloInfo {
    pub version: u16,
    pub random: [u8; 32],
    pub session_id: Vec<u8>,
    pub cipher_suite: u16,
    pub compression_method: u8,
    pub extensions: Vec<RawExtension>,
}

fn parse_extensions(c: &mut Cursor<'_>) -> Result<Vec<RawExtension>> {
    let mut extensions = Vec::new();
    if c.remaining() == 0 {
        return Ok(extensions);
    }
    let total_len = c.u16()? as usize;
    let end = c.pos + total_len;
    while c.pos < end {
        let ext_type = c.u16()?;
        let ext_len = c.u16()? as usize;
        let body = c.take(ext_len)?.to_vec();
        extensions.push((ext_type, body));
    }
    Ok(extensions)
}

/// Parse the body of a `handshake` record expected to be a ClientHello.
/// `body` is the full handshake message (type + 3-byte length + payload),
/// matching what [`crate::tls::record::RawRecord::payload`] yields for a
/// `Handshake`-typed record.
pub fn parse_client_hello(body: &[u8]) -> Result<ClientHelloInfo> {
    let mut c = Cursor::new(body);
    let msg_type = c.u8()?;
    if msg_type != HANDSHAKE_CLIENT_HELLO {
        return Err(HandshakeParseError::WrongMessageType(msg_type));
    }
    let _len = c.u24()?;

    let version = c.u16()?;
    let random: [u8; 32] = c.take(32)?.try_into().map_err(|_| HandshakeParseError::Truncated)?;

    let session_id_len = c.u8()? as usize;
    let session_id = c.take(session_id_len)?.to_vec();

    let cipher_suites_len = c.u16()? as usize;
    let cipher_suites_bytes = c.take(cipher_suites_len)?;
    let cipher_suites = cipher_suites_bytes
        .chunks_exact(2)
        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
        .collect();

    let compression_methods_len = c.u8()? as usize;
    let compression_methods = c.take(compression_methods_len)?.to_vec();

    let extensions = parse_extensions(&mut c)?;

    Ok(ClientHelloInfo {
        version,
        random,
        session_id,
        cipher_suites,
        compression_methods,
        extensions,
    })
}

/// Parse the body of a `handshake` record expected to be a ServerHello.
pub fn parse_server_hello(body: &[u8]) -> Result<ServerHelloInfo> {
    let mut c = Cursor::new(body);
    let msg_type = c.u8()?;
    if msg_type != HANDSHAKE_SERVER_HELLO {
        return Err(HandshakeParseError::WrongMessageType(msg_type));
    }
    let _len = c.u24()?;

    let version = c.u16()?;
    let random: [u8; 32] = c.take(32)?.try_into().map_err(|_| HandshakeParseError::Truncated)?;

    let session_id_len = c.u8()? as usize;
    let session_id = c.take(session_id_len)?.to_vec();

    let cipher_suite = c.u16()?;
    let compression_method = c.u8()?;

    let extensions = parse_extensions(&mut c)?;

    Ok(ServerHelloInfo {
        version,
        random,
        session_id,
        cipher_suite,
        compression_method,
        extensions,
    })
}
