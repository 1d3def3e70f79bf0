//! JA3 fingerprint computation from raw ClientHello bytes
//!
//! JA3 serializes five ClientHello fields into
//! `SSLVersion,Ciphers,Extensions,EllipticCurves,EllipticCurvePointFormats`
//! (decimal, `-`-joined, wire order, GREASE removed) and hashes the string
//! with MD5. The lowercase hex digest is an interoperability contract with
//! the consuming origin, so the exact serialization here must not change.

use md5::{Digest, Md5};

use crate::error::Ja3Error;

/// TLS records are at most 16 KiB; anything beyond that is not part of the
/// fingerprint scan window.
pub const MAX_RECORD_LEN: usize = 16384;

/// supported_groups (elliptic_curves) extension
const EXT_SUPPORTED_GROUPS: u16 = 0x000a;
/// ec_point_formats extension
const EXT_EC_POINT_FORMATS: u16 = 0x000b;

/// A computed JA3 fingerprint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ja3Fingerprint {
    /// Lowercase hex MD5 of the canonical string
    pub hash: String,
    /// The canonical `ver,ciphers,extensions,groups,points` string
    pub canonical: String,
}

/// Check for a GREASE value (RFC 8701): both bytes equal and low nibble 0xa.
pub fn is_grease(value: u16) -> bool {
    let hi = (value >> 8) as u8;
    let lo = value as u8;
    hi == lo && (hi & 0x0f) == 0x0a
}

/// Compute the JA3 fingerprint of a raw TLS record carrying a ClientHello.
///
/// `raw` must start with the 5-byte record header. Records that declare more
/// than 16 KiB are scanned only up to the 16 KiB cap; a buffer shorter than
/// the (capped) declared length is a truncation error. Pure and
/// deterministic; never reads past `raw`.
pub fn compute_ja3(raw: &[u8]) -> Result<Ja3Fingerprint, Ja3Error> {
    // record header(5) + handshake header(4) + version(2) + random(32) + session id len(1)
    if raw.len() < 44 {
        return Err(Ja3Error::TooShort(raw.len()));
    }

    // --- TLS record header ---
    if raw[0] != 0x16 {
        return Err(Ja3Error::NotHandshake(raw[0]));
    }

    let declared = u16::from_be_bytes([raw[3], raw[4]]) as usize;
    let scan = declared.min(MAX_RECORD_LEN);
    let payload = &raw[5..];
    if payload.len() < scan {
        return Err(Ja3Error::Truncated {
            declared,
            have: payload.len(),
        });
    }
    let payload = &payload[..scan];

    // --- Handshake header ---
    if payload.len() < 4 {
        return Err(Ja3Error::Malformed("handshake header"));
    }
    if payload[0] != 0x01 {
        return Err(Ja3Error::NotClientHello(payload[0]));
    }

    // Skip handshake type(1) + length(3)
    let ch = &payload[4..];
    if ch.len() < 34 {
        return Err(Ja3Error::Malformed("client hello header"));
    }

    // JA3 field 1: legacy client_version (TLS 1.3 still advertises 0x0303
    // here; supported_versions is deliberately ignored)
    let version = u16::from_be_bytes([ch[0], ch[1]]);
    let mut pos = 34; // version(2) + random(32)

    // Session ID
    if pos >= ch.len() {
        return Err(Ja3Error::Malformed("session id"));
    }
    let session_id_len = ch[pos] as usize;
    pos += 1 + session_id_len;

    // JA3 field 2: cipher suites
    if pos + 2 > ch.len() {
        return Err(Ja3Error::Malformed("cipher suites length"));
    }
    let cipher_suites_len = u16::from_be_bytes([ch[pos], ch[pos + 1]]) as usize;
    pos += 2;
    if pos + cipher_suites_len > ch.len() {
        return Err(Ja3Error::Malformed("cipher suites"));
    }

    let mut ciphers: Vec<u16> = Vec::new();
    let mut i = 0;
    while i + 2 <= cipher_suites_len {
        let cs = u16::from_be_bytes([ch[pos + i], ch[pos + i + 1]]);
        if !is_grease(cs) {
            ciphers.push(cs);
        }
        i += 2;
    }
    pos += cipher_suites_len;

    // Compression methods (skipped)
    if pos >= ch.len() {
        return Err(Ja3Error::Malformed("compression methods"));
    }
    let compression_len = ch[pos] as usize;
    pos += 1 + compression_len;

    // JA3 fields 3/4/5: extensions / supported groups / EC point formats.
    // A ClientHello may legally end here; all three lists stay empty.
    let mut extensions: Vec<u16> = Vec::new();
    let mut groups: Vec<u16> = Vec::new();
    let mut point_formats: Vec<u8> = Vec::new();

    if pos + 2 <= ch.len() {
        let ext_total_len = u16::from_be_bytes([ch[pos], ch[pos + 1]]) as usize;
        pos += 2;
        let ext_end = (pos + ext_total_len).min(ch.len());

        while pos + 4 <= ext_end {
            let ext_type = u16::from_be_bytes([ch[pos], ch[pos + 1]]);
            let ext_data_len = u16::from_be_bytes([ch[pos + 2], ch[pos + 3]]) as usize;
            let data_start = pos + 4;
            let data_end = (data_start + ext_data_len).min(ext_end);

            if !is_grease(ext_type) {
                extensions.push(ext_type);

                let data = &ch[data_start..data_end];
                match ext_type {
                    EXT_SUPPORTED_GROUPS => groups = parse_supported_groups(data),
                    EXT_EC_POINT_FORMATS => point_formats = parse_ec_point_formats(data),
                    _ => {}
                }
            }

            pos = data_start + ext_data_len;
        }
    }

    let canonical = format!(
        "{},{},{},{},{}",
        version,
        join_u16(&ciphers),
        join_u16(&extensions),
        join_u16(&groups),
        point_formats
            .iter()
            .map(|p| p.to_string())
            .collect::<Vec<_>>()
            .join("-"),
    );

    let mut hasher = Md5::new();
    hasher.update(canonical.as_bytes());
    let hash = hex::encode(hasher.finalize());

    Ok(Ja3Fingerprint { hash, canonical })
}

fn join_u16(values: &[u16]) -> String {
    values
        .iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join("-")
}

/// Parse the supported_groups extension body: 2-byte inner length, then
/// 16-bit group ids. GREASE filtered, wire order kept.
fn parse_supported_groups(data: &[u8]) -> Vec<u16> {
    if data.len() < 2 {
        return Vec::new();
    }
    let list_len = u16::from_be_bytes([data[0], data[1]]) as usize;
    let end = (2 + list_len).min(data.len());

    let mut groups = Vec::new();
    let mut i = 2;
    while i + 2 <= end {
        let group = u16::from_be_bytes([data[i], data[i + 1]]);
        if !is_grease(group) {
            groups.push(group);
        }
        i += 2;
    }
    groups
}

/// Parse the ec_point_formats extension body: 1-byte inner length, then
/// single-byte formats in wire order.
fn parse_ec_point_formats(data: &[u8]) -> Vec<u8> {
    if data.is_empty() {
        return Vec::new();
    }
    let list_len = data[0] as usize;
    data[1..].iter().take(list_len).copied().collect()
}
