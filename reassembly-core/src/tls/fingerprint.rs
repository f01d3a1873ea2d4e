//! JA3/JA3S fingerprinting (spec.md §4.4): an MD5 digest of a
//! dash/comma-joined list of handshake parameters, with GREASE values
//! (RFC 8701) stripped first.
//!
//! Grounded in the original's `httpreplay.misc.JA3` helper, which this
//! implementation was distilled from.

use itertools::Itertools;

use super::handshake::{ClientHelloInfo, ServerHelloInfo};

/// Extension type numbers for the two extensions JA3 folds into separate
/// fields rather than the extension list itself.
const EXT_SUPPORTED_GROUPS: u16 = 10;
const EXT_EC_POINT_FORMATS: u16 = 11;

pub mod grease {
    /// `true` if `v` is one of the 16 reserved GREASE values from RFC 8701
    /// §2 (`0x?A?A` with both nibble-pairs equal: `0x0A0A`, `0x1A1A`, ...,
    /// `0xFAFA`).
    pub fn is_grease(v: u16) -> bool {
        let hi = (v >> 8) as u8;
        let lo = (v & 0xff) as u8;
        hi == lo && (hi & 0x0f) == 0x0a
    }
}

fn strip_grease(values: impl IntoIterator<Item = u16>) -> Vec<u16> {
    values.into_iter().filter(|v| !grease::is_grease(*v)).collect()
}

fn extension_body(extensions: &[(u16, Vec<u8>)], ty: u16) -> Option<&[u8]> {
    extensions.iter().find(|(t, _)| *t == ty).map(|(_, data)| data.as_slice())
}

fn u16_list(data: &[u8]) -> Vec<u16> {
    // Supported Groups / elliptic curves: a u16 length prefix, then a list
    // of u16 values (RFC 8446 §4.2.7).
    if data.len() < 2 {
        return Vec::new();
    }
    data[2..].chunks_exact(2).map(|c| u16::from_be_bytes([c[0], c[1]])).collect()
}

fn u8_list(data: &[u8]) -> Vec<u8> {
    // EC point formats: a u8 length prefix, then a list of u8 values.
    if data.is_empty() {
        return Vec::new();
    }
    data[1..].to_vec()
}

fn md5_hex(input: &str) -> String {
    format!("{:x}", md5::compute(input.as_bytes()))
}

/// Returns `(ja3, ja3_params)`: the MD5 digest and the parameter string it
/// was computed over (retained for diagnostics, matching the original
/// tool's practice of logging the raw string alongside the hash).
pub fn ja3(hello: &ClientHelloInfo) -> (String, String) {
    let ciphers = strip_grease(hello.cipher_suites.iter().copied());
    let ext_types = strip_grease(hello.extensions.iter().map(|(t, _)| *t));
    let curves = extension_body(&hello.extensions, EXT_SUPPORTED_GROUPS)
        .map(u16_list)
        .map(strip_grease)
        .unwrap_or_default();
    let point_formats = extension_body(&hello.extensions, EXT_EC_POINT_FORMATS)
        .map(u8_list)
        .unwrap_or_default();

    let params = format!(
        "{},{},{},{},{}",
        hello.version,
        ciphers.iter().join("-"),
        ext_types.iter().join("-"),
        curves.iter().join("-"),
        point_formats.iter().join("-"),
    );
    (md5_hex(&params), params)
}

/// Returns `(ja3s, ja3s_params)` for a ServerHello.
pub fn ja3s(hello: &ServerHelloInfo) -> (String, String) {
    let ext_types = strip_grease(hello.extensions.iter().map(|(t, _)| *t));
    let params = format!(
        "{},{},{}",
        hello.version,
        hello.cipher_suite,
        ext_types.iter().join("-"),
    );
    (md5_hex(&params), params)
}
