//! Component D: the ClientHello Extractor. Reassembles CRYPTO frames from
//! the first flight of Initial packets and picks enough of the TLS 1.3
//! ClientHello out of them to let the dispatcher route without running a
//! real handshake.

use bytes::Bytes;

use cid::ConnectionId;
use frame::CryptoFrame;

/// States per spec.md §4.D / `tls_chlo_extractor.h`'s `ParseState`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseState {
    Initial,
    ParsedPartialFragment,
    ParsedFullSinglePacketChlo,
    ParsedFullMultiPacketChlo,
    UnrecoverableFailure,
}

/// A ClientHello's fields the dispatcher cares about, once fully parsed.
#[derive(Debug, Clone, Default)]
pub struct ParsedChlo {
    pub sni: Option<String>,
    pub alpn: Vec<String>,
    pub supported_groups: Vec<u16>,
    pub supports_early_data: bool,
    pub is_resumption_attempt: bool,
    pub cert_compression_algos: Vec<u16>,
}

/// TLS record/handshake layer constants this module needs to peek through
/// without a full TLS stack (RFC 8446 §4, §B.3).
const HANDSHAKE_TYPE_CLIENT_HELLO: u8 = 1;
const EXT_SERVER_NAME: u16 = 0;
const EXT_SUPPORTED_GROUPS: u16 = 10;
const EXT_ALPN: u16 = 16;
const EXT_EARLY_DATA: u16 = 42;
const EXT_PRE_SHARED_KEY: u16 = 41;
const EXT_COMPRESS_CERTIFICATE: u16 = 27;

/// Incrementally reassembles CRYPTO-frame bytes and, once enough of the
/// handshake message header is present, parses a ClientHello out of them.
///
/// Mirrors `TlsChloExtractor`: a connection gets exactly one of these, fed
/// frame-by-frame as Initial packets arrive, in CRYPTO-stream order.
pub struct ChloExtractor {
    state: ParseState,
    /// CRYPTO-stream bytes received so far, indexed by absolute offset.
    /// `None` where a gap hasn't been filled yet.
    reassembled: Vec<u8>,
    received: Vec<bool>,
    highest_offset_seen: usize,
    packet_count: usize,
    parsed: Option<ParsedChlo>,
    tls_alert: Option<u8>,
}

impl ChloExtractor {
    pub fn new() -> Self {
        ChloExtractor {
            state: ParseState::Initial,
            reassembled: Vec::new(),
            received: Vec::new(),
            highest_offset_seen: 0,
            packet_count: 0,
            parsed: None,
            tls_alert: None,
        }
    }

    pub fn state(&self) -> ParseState {
        self.state
    }

    pub fn has_parsed_full_chlo(&self) -> bool {
        matches!(
            self.state,
            ParseState::ParsedFullSinglePacketChlo | ParseState::ParsedFullMultiPacketChlo
        )
    }

    pub fn tls_alert(&self) -> Option<u8> {
        self.tls_alert
    }

    pub fn parsed_chlo(&self) -> Option<&ParsedChlo> {
        self.parsed.as_ref()
    }

    /// Feeds one packet's worth of CRYPTO frames into the reassembler. `dst`
    /// is only used to size-check against `MAX_CID_SIZE`-style bounds; the
    /// extractor itself is connection-agnostic.
    pub fn ingest(&mut self, _dst: &ConnectionId, crypto_frames: &[CryptoFrame]) {
        if self.state == ParseState::UnrecoverableFailure || self.has_parsed_full_chlo() {
            return;
        }
        self.packet_count += 1;
        for frame in crypto_frames {
            self.ingest_one(frame);
        }
        self.attempt_to_parse();
    }

    fn ingest_one(&mut self, frame: &CryptoFrame) {
        let start = frame.offset as usize;
        let end = start + frame.data.len();
        if end > self.reassembled.len() {
            self.reassembled.resize(end, 0);
            self.received.resize(end, false);
        }
        self.reassembled[start..end].copy_from_slice(&frame.data);
        for slot in &mut self.received[start..end] {
            *slot = true;
        }
        self.highest_offset_seen = self.highest_offset_seen.max(end);
    }

    fn contiguous_prefix_len(&self) -> usize {
        self.received.iter().take_while(|&&b| b).count()
    }

    /// Mirrors `MaybeAttemptToParseChloLength` + `AttemptToParseFullChlo`:
    /// first checks whether the handshake message header (4 bytes: type +
    /// u24 length) has arrived, then whether the full message has.
    fn attempt_to_parse(&mut self) {
        let available = self.contiguous_prefix_len();
        if available < 4 {
            self.state = ParseState::ParsedPartialFragment;
            return;
        }
        let header = &self.reassembled[..4];
        if header[0] != HANDSHAKE_TYPE_CLIENT_HELLO {
            self.fail(10 /* unexpected_message */);
            return;
        }
        let body_len = (u32::from(header[1]) << 16 | u32::from(header[2]) << 8 | u32::from(header[3])) as usize;
        let total_len = 4 + body_len;
        if available < total_len {
            self.state = ParseState::ParsedPartialFragment;
            return;
        }
        match parse_client_hello(&self.reassembled[4..total_len]) {
            Ok(parsed) => {
                self.parsed = Some(parsed);
                self.state = if self.packet_count <= 1 {
                    ParseState::ParsedFullSinglePacketChlo
                } else {
                    ParseState::ParsedFullMultiPacketChlo
                };
            }
            Err(alert) => self.fail(alert),
        }
    }

    fn fail(&mut self, alert: u8) {
        self.state = ParseState::UnrecoverableFailure;
        self.tls_alert = Some(alert);
    }
}

impl Default for ChloExtractor {
    fn default() -> Self {
        Self::new()
    }
}

/// Parses just the fields the dispatcher consumes out of a ClientHello body
/// (post handshake-header, i.e. starting at `legacy_version`). Returns a TLS
/// alert code on malformed input, mirroring `tls_chlo_extractor.cc`'s
/// `HandleUnrecoverableError`.
fn parse_client_hello(body: &[u8]) -> Result<ParsedChlo, u8> {
    const DECODE_ERROR: u8 = 50;
    let mut buf = body;

    take(&mut buf, 2).ok_or(DECODE_ERROR)?; // legacy_version
    take(&mut buf, 32).ok_or(DECODE_ERROR)?; // random

    let session_id_len = take_u8(&mut buf).ok_or(DECODE_ERROR)? as usize;
    take(&mut buf, session_id_len).ok_or(DECODE_ERROR)?;
    let is_resumption_attempt = session_id_len > 0;

    let cipher_suites_len = take_u16(&mut buf).ok_or(DECODE_ERROR)? as usize;
    take(&mut buf, cipher_suites_len).ok_or(DECODE_ERROR)?;

    let compression_methods_len = take_u8(&mut buf).ok_or(DECODE_ERROR)? as usize;
    take(&mut buf, compression_methods_len).ok_or(DECODE_ERROR)?;

    let mut parsed = ParsedChlo {
        is_resumption_attempt,
        ..Default::default()
    };

    if buf.is_empty() {
        return Ok(parsed);
    }
    let extensions_len = take_u16(&mut buf).ok_or(DECODE_ERROR)? as usize;
    let mut ext_buf = take(&mut buf, extensions_len).ok_or(DECODE_ERROR)?;

    while !ext_buf.is_empty() {
        let ext_type = take_u16(&mut ext_buf).ok_or(DECODE_ERROR)?;
        let ext_len = take_u16(&mut ext_buf).ok_or(DECODE_ERROR)? as usize;
        let mut ext_data = take(&mut ext_buf, ext_len).ok_or(DECODE_ERROR)?;
        match ext_type {
            EXT_SERVER_NAME => parsed.sni = parse_sni(ext_data),
            EXT_ALPN => parsed.alpn = parse_alpn(ext_data).unwrap_or_default(),
            EXT_SUPPORTED_GROUPS => parsed.supported_groups = parse_u16_list(ext_data).unwrap_or_default(),
            EXT_EARLY_DATA => parsed.supports_early_data = true,
            EXT_PRE_SHARED_KEY => parsed.is_resumption_attempt = true,
            EXT_COMPRESS_CERTIFICATE => {
                parsed.cert_compression_algos = parse_u8_len_u16_list(&mut ext_data).unwrap_or_default()
            }
            _ => {}
        }
    }
    Ok(parsed)
}

fn take<'a>(buf: &mut &'a [u8], len: usize) -> Option<&'a [u8]> {
    if buf.len() < len {
        return None;
    }
    let (head, tail) = buf.split_at(len);
    *buf = tail;
    Some(head)
}

fn take_u8(buf: &mut &[u8]) -> Option<u8> {
    let b = *buf.first()?;
    *buf = &buf[1..];
    Some(b)
}

fn take_u16(buf: &mut &[u8]) -> Option<u16> {
    let bytes = take(buf, 2)?;
    Some(u16::from(bytes[0]) << 8 | u16::from(bytes[1]))
}

fn parse_sni(mut ext_data: &[u8]) -> Option<String> {
    let list_len = take_u16(&mut ext_data)? as usize;
    let mut list = take(&mut ext_data, list_len)?;
    while !list.is_empty() {
        let name_type = take_u8(&mut list)?;
        let len = take_u16(&mut list)? as usize;
        let name = take(&mut list, len)?;
        if name_type == 0 {
            return ::std::str::from_utf8(name).ok().map(str::to_owned);
        }
    }
    None
}

fn parse_alpn(mut ext_data: &[u8]) -> Option<Vec<String>> {
    let list_len = take_u16(&mut ext_data)? as usize;
    let mut list = take(&mut ext_data, list_len)?;
    let mut out = Vec::new();
    while !list.is_empty() {
        let len = take_u8(&mut list)? as usize;
        let proto = take(&mut list, len)?;
        out.push(String::from_utf8_lossy(proto).into_owned());
    }
    Some(out)
}

fn parse_u16_list(mut ext_data: &[u8]) -> Option<Vec<u16>> {
    let list_len = take_u16(&mut ext_data)? as usize;
    let mut list = take(&mut ext_data, list_len)?;
    let mut out = Vec::new();
    while list.len() >= 2 {
        out.push(take_u16(&mut list)?);
    }
    Some(out)
}

fn parse_u8_len_u16_list(ext_data: &mut &[u8]) -> Option<Vec<u16>> {
    let list_len = take_u8(ext_data)? as usize;
    let mut list = take(ext_data, list_len)?;
    let mut out = Vec::new();
    while list.len() >= 2 {
        out.push(take_u16(&mut list)?);
    }
    Some(out)
}

/// `Bytes`-based convenience wrapper for callers that already hold CRYPTO
/// frame data as `Bytes` rather than the borrowed-slice form `parse_client_hello`
/// consumes directly.
pub fn crypto_frame_from(offset: u64, data: Bytes) -> CryptoFrame {
    CryptoFrame { offset, data }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_chlo(sni: &str, alpn: &[&str]) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(&[3, 3]); // legacy_version
        body.extend_from_slice(&[0u8; 32]); // random
        body.push(0); // session_id_len
        body.extend_from_slice(&[0, 2]); // cipher_suites_len
        body.extend_from_slice(&[0x13, 0x01]);
        body.push(1); // compression_methods_len
        body.push(0);

        let mut extensions = Vec::new();
        // SNI
        let mut sni_ext = Vec::new();
        let name_len = sni.len() as u16;
        let mut sni_list = Vec::new();
        sni_list.push(0u8); // host_name
        sni_list.extend_from_slice(&name_len.to_be_bytes());
        sni_list.extend_from_slice(sni.as_bytes());
        sni_ext.extend_from_slice(&(sni_list.len() as u16).to_be_bytes());
        sni_ext.extend_from_slice(&sni_list);
        extensions.extend_from_slice(&EXT_SERVER_NAME.to_be_bytes());
        extensions.extend_from_slice(&(sni_ext.len() as u16).to_be_bytes());
        extensions.extend_from_slice(&sni_ext);

        // ALPN
        let mut alpn_list = Vec::new();
        for proto in alpn {
            alpn_list.push(proto.len() as u8);
            alpn_list.extend_from_slice(proto.as_bytes());
        }
        let mut alpn_ext = Vec::new();
        alpn_ext.extend_from_slice(&(alpn_list.len() as u16).to_be_bytes());
        alpn_ext.extend_from_slice(&alpn_list);
        extensions.extend_from_slice(&EXT_ALPN.to_be_bytes());
        extensions.extend_from_slice(&(alpn_ext.len() as u16).to_be_bytes());
        extensions.extend_from_slice(&alpn_ext);

        body.extend_from_slice(&(extensions.len() as u16).to_be_bytes());
        body.extend_from_slice(&extensions);

        let mut msg = Vec::new();
        msg.push(HANDSHAKE_TYPE_CLIENT_HELLO);
        let len = body.len() as u32;
        msg.push((len >> 16) as u8);
        msg.push((len >> 8) as u8);
        msg.push(len as u8);
        msg.extend_from_slice(&body);
        msg
    }

    #[test]
    fn single_packet_chlo_parses_sni_and_alpn() {
        let msg = build_chlo("example.com", &["h3", "h3-29"]);
        let mut extractor = ChloExtractor::new();
        let cid = ConnectionId::new(&[1, 2, 3, 4, 5, 6, 7, 8]);
        let frame = crypto_frame_from(0, Bytes::from(msg));
        extractor.ingest(&cid, &[frame]);
        assert_eq!(extractor.state(), ParseState::ParsedFullSinglePacketChlo);
        let parsed = extractor.parsed_chlo().unwrap();
        assert_eq!(parsed.sni.as_deref(), Some("example.com"));
        assert_eq!(parsed.alpn, vec!["h3".to_string(), "h3-29".to_string()]);
    }

    #[test]
    fn partial_fragment_then_completion_is_multi_packet() {
        let msg = build_chlo("example.com", &["h3"]);
        let mut extractor = ChloExtractor::new();
        let cid = ConnectionId::new(&[1, 2, 3, 4, 5, 6, 7, 8]);

        let half = msg.len() / 2;
        let first = crypto_frame_from(0, Bytes::from(msg[..half].to_vec()));
        extractor.ingest(&cid, &[first]);
        assert_eq!(extractor.state(), ParseState::ParsedPartialFragment);
        assert!(!extractor.has_parsed_full_chlo());

        let second = crypto_frame_from(half as u64, Bytes::from(msg[half..].to_vec()));
        extractor.ingest(&cid, &[second]);
        assert_eq!(extractor.state(), ParseState::ParsedFullMultiPacketChlo);
        assert!(extractor.has_parsed_full_chlo());
    }

    #[test]
    fn reordered_fragments_still_reassemble() {
        let msg = build_chlo("example.com", &["h3"]);
        let mut extractor = ChloExtractor::new();
        let cid = ConnectionId::new(&[1, 2, 3, 4, 5, 6, 7, 8]);

        let third = msg.len() * 2 / 3;
        let second = crypto_frame_from(third as u64, Bytes::from(msg[third..].to_vec()));
        extractor.ingest(&cid, &[second]);
        assert!(!extractor.has_parsed_full_chlo());

        let first = crypto_frame_from(0, Bytes::from(msg[..third].to_vec()));
        extractor.ingest(&cid, &[first]);
        assert!(extractor.has_parsed_full_chlo());
    }

    #[test]
    fn wrong_handshake_type_is_unrecoverable() {
        let mut msg = build_chlo("example.com", &["h3"]);
        msg[0] = 2; // ServerHello type, not ClientHello
        let mut extractor = ChloExtractor::new();
        let cid = ConnectionId::new(&[1, 2, 3, 4, 5, 6, 7, 8]);
        extractor.ingest(&cid, &[crypto_frame_from(0, Bytes::from(msg))]);
        assert_eq!(extractor.state(), ParseState::UnrecoverableFailure);
        assert!(extractor.tls_alert().is_some());
    }
}
