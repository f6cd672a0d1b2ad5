//! TLS 1.3 ClientHello parser.
//!
//! Operates on the handshake bytes that follow a 5-byte TLS record header
//! already known to carry record type `0x16`. Input is adversarial: every
//! length field is checked against the remaining buffer before use.

use crate::codec::{be16, be32};
use crate::error::ProxyError;

pub const SNI_EXTENSION: u16 = 0x0000;
pub const KEY_SHARE_EXTENSION: u16 = 0x0033;
const SNI_HOST_NAME_TYPE: u8 = 0x00;

/// Result of parsing a ClientHello: the byte range of the SNI hostname
/// within the input buffer, and whether a `key_share` extension was seen
/// (TLS 1.3's tell — TLS 1.2 and earlier ClientHellos never send one).
pub struct ClientHello {
    pub sni_range: std::ops::Range<usize>,
    pub is_tls13: bool,
}

impl ClientHello {
    pub fn sni<'a>(&self, handshake: &'a [u8]) -> &'a [u8] {
        &handshake[self.sni_range.clone()]
    }
}

/// Parse a handshake message, returning the SNI byte range (relative to
/// `handshake`) and the TLS 1.3 flag.
///
/// `handshake` is the full handshake message including its 4-byte header
/// (type + 3-byte length) — i.e. exactly what followed the 5-byte record
/// header on the wire.
pub fn parse_client_hello(handshake: &[u8]) -> Result<ClientHello, ProxyError> {
    if handshake.len() < 4 {
        return Err(ProxyError::MalformedTls("handshake header truncated"));
    }
    let msg_type = handshake[0];
    let declared_len = be32(&handshake[1..4]) as usize;
    if msg_type != 0x01 {
        return Err(ProxyError::MalformedTls("not a ClientHello"));
    }
    if declared_len + 4 != handshake.len() {
        return Err(ProxyError::MalformedTls("handshake length mismatch"));
    }

    let body = &handshake[4..];
    let mut pos = 0usize;

    // legacy_version(2) + random(32)
    take(body, &mut pos, 34, "truncated before random")?;

    // session_id
    let session_id_len = read_u8(body, &mut pos, "truncated session_id length")? as usize;
    take(body, &mut pos, session_id_len, "truncated session_id")?;

    // cipher_suites
    let cipher_suites_len =
        read_u16(body, &mut pos, "truncated cipher_suites length")? as usize;
    take(body, &mut pos, cipher_suites_len, "truncated cipher_suites")?;

    // compression_methods
    let compression_len =
        read_u8(body, &mut pos, "truncated compression_methods length")? as usize;
    take(body, &mut pos, compression_len, "truncated compression_methods")?;

    // extensions
    let extensions_total_len =
        read_u16(body, &mut pos, "truncated extensions length")? as usize;
    if body.len() - pos != extensions_total_len {
        return Err(ProxyError::MalformedTls("extensions length mismatch"));
    }

    let extensions_end = body.len();
    let mut is_tls13 = false;
    let mut sni_range: Option<std::ops::Range<usize>> = None;

    while pos < extensions_end {
        let ext_id = read_u16(body, &mut pos, "truncated extension id")?;
        let ext_len = read_u16(body, &mut pos, "truncated extension length")? as usize;
        let ext_start = pos;
        take(body, &mut pos, ext_len, "extension body overruns buffer")?;
        let ext_body = &body[ext_start..ext_start + ext_len];

        match ext_id {
            SNI_EXTENSION => {
                if ext_body.len() < 3 {
                    return Err(ProxyError::MalformedTls("server_name extension too short"));
                }
                // server_name_list_length(2) + name_type(1) + host_name_length(2) + host_name
                let name_type = ext_body[2];
                if name_type == SNI_HOST_NAME_TYPE {
                    if ext_body.len() < 5 {
                        return Err(ProxyError::MalformedTls("server_name entry too short"));
                    }
                    let name_len = be16(&ext_body[3..5]) as usize;
                    if 5 + name_len > ext_body.len() {
                        return Err(ProxyError::MalformedTls("server_name length overruns extension"));
                    }
                    let abs_start = ext_start + 5;
                    sni_range = Some(abs_start..abs_start + name_len);
                }
            }
            KEY_SHARE_EXTENSION => is_tls13 = true,
            _ => {}
        }
    }

    let sni_range = sni_range.ok_or(ProxyError::MalformedTls("no server_name extension"))?;
    if sni_range.is_empty() {
        return Err(ProxyError::MalformedTls("empty SNI"));
    }

    // sni_range is relative to `body`; callers index into `handshake`, so
    // shift by the 4-byte handshake header.
    let sni_range = (sni_range.start + 4)..(sni_range.end + 4);

    Ok(ClientHello { sni_range, is_tls13 })
}

fn take(body: &[u8], pos: &mut usize, len: usize, msg: &'static str) -> Result<(), ProxyError> {
    if *pos + len > body.len() {
        return Err(ProxyError::MalformedTls(msg));
    }
    *pos += len;
    Ok(())
}

fn read_u8(body: &[u8], pos: &mut usize, msg: &'static str) -> Result<u8, ProxyError> {
    if *pos >= body.len() {
        return Err(ProxyError::MalformedTls(msg));
    }
    let v = body[*pos];
    *pos += 1;
    Ok(v)
}

fn read_u16(body: &[u8], pos: &mut usize, msg: &'static str) -> Result<u16, ProxyError> {
    if *pos + 2 > body.len() {
        return Err(ProxyError::MalformedTls(msg));
    }
    let v = be16(&body[*pos..*pos + 2]);
    *pos += 2;
    Ok(v)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Build a minimal but well-formed ClientHello with a single SNI
    /// extension and, optionally, a key_share extension.
    fn build_client_hello(sni: &str, with_key_share: bool) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(&[0x03, 0x03]); // legacy_version
        body.extend_from_slice(&[0u8; 32]); // random
        body.push(0); // session_id_len
        body.extend_from_slice(&[0x00, 0x02]); // cipher_suites_len
        body.extend_from_slice(&[0x13, 0x01]); // one cipher suite
        body.push(1); // compression_methods_len
        body.push(0);

        let mut extensions = Vec::new();

        // server_name extension
        let mut sni_ext = Vec::new();
        let name_bytes = sni.as_bytes();
        sni_ext.extend_from_slice(&be16_len(3 + name_bytes.len())); // server_name_list_length
        sni_ext.push(0x00); // host_name type
        sni_ext.extend_from_slice(&be16_len(name_bytes.len()));
        sni_ext.extend_from_slice(name_bytes);
        extensions.extend_from_slice(&[0x00, 0x00]); // extension id = server_name
        extensions.extend_from_slice(&be16_len(sni_ext.len()));
        extensions.extend_from_slice(&sni_ext);

        if with_key_share {
            extensions.extend_from_slice(&[0x00, 0x33]);
            extensions.extend_from_slice(&be16_len(2));
            extensions.extend_from_slice(&[0xAB, 0xCD]);
        }

        body.extend_from_slice(&be16_len(extensions.len()));
        body.extend_from_slice(&extensions);

        let mut handshake = Vec::new();
        handshake.push(0x01); // ClientHello
        let len = body.len();
        handshake.push((len >> 16) as u8);
        handshake.push((len >> 8) as u8);
        handshake.push(len as u8);
        handshake.extend_from_slice(&body);
        handshake
    }

    fn be16_len(n: usize) -> [u8; 2] {
        (n as u16).to_be_bytes()
    }

    #[test]
    fn parses_sni_and_tls13_flag() {
        let hs = build_client_hello("example.com", true);
        let parsed = parse_client_hello(&hs).unwrap();
        assert!(parsed.is_tls13);
        assert_eq!(parsed.sni(&hs), b"example.com");
    }

    #[test]
    fn missing_key_share_means_not_tls13() {
        let hs = build_client_hello("example.com", false);
        let parsed = parse_client_hello(&hs).unwrap();
        assert!(!parsed.is_tls13);
    }

    #[test]
    fn rejects_wrong_msg_type() {
        let mut hs = build_client_hello("example.com", true);
        hs[0] = 0x02;
        assert!(matches!(
            parse_client_hello(&hs),
            Err(ProxyError::MalformedTls(_))
        ));
    }

    #[test]
    fn rejects_length_mismatch() {
        let mut hs = build_client_hello("example.com", true);
        let actual_len = hs.len() - 4;
        // Corrupt the declared length so it disagrees with the real size.
        hs[3] = ((actual_len - 1) & 0xff) as u8;
        assert!(matches!(
            parse_client_hello(&hs),
            Err(ProxyError::MalformedTls(_))
        ));
    }

    #[test]
    fn rejects_truncated_extensions() {
        let mut hs = build_client_hello("example.com", true);
        // Truncate the buffer but leave the declared handshake length
        // alone, so the outer length check passes and the inner
        // extensions-length check is what catches the corruption.
        hs.truncate(hs.len() - 1);
        assert!(parse_client_hello(&hs).is_err());
    }
}
