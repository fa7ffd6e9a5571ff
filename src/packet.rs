//! Component B: the Public-Header Parser. Classifies a datagram's outermost
//! header without touching anything that requires a decryption key.

use byteorder::{BigEndian, ByteOrder};
use bytes::{Buf, BufMut, Bytes};

use cid::{decode_nibble_lengths, encode_nibble_lengths, ConnectionId, MAX_CID_SIZE};
use coding::{BufExt, BufMutExt};

/// Minimum size of a UDP datagram carrying a client Initial (the
/// anti-amplification floor, spec.md §4.G step 4).
pub const MIN_INITIAL_SIZE: usize = 1200;

/// Long-header packet type (spec.md §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LongType {
    Initial,
    ZeroRtt,
    Handshake,
    Retry,
}

/// Which of the three wire dialects this spec supports produced a header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    /// Google-QUIC legacy public-flags header.
    LegacyGoogle,
    /// IETF long/short header, nibble-packed connection IDs.
    IetfNibblePacked,
    /// IETF long/short header, one length-prefix byte per connection ID.
    IetfLengthPrefixed,
}

/// Outcome of parsing a number whose wire width varies by header type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketNumber {
    U8(u8),
    U16(u16),
    U32(u32),
    /// Only the legacy dialect uses a 6-byte packet number.
    U48(u64),
}

impl PacketNumber {
    pub fn wire_len(self) -> usize {
        match self {
            PacketNumber::U8(_) => 1,
            PacketNumber::U16(_) => 2,
            PacketNumber::U32(_) => 4,
            PacketNumber::U48(_) => 6,
        }
    }

    fn truncated_bits(self) -> (u64, u32) {
        match self {
            PacketNumber::U8(x) => (u64::from(x), 8),
            PacketNumber::U16(x) => (u64::from(x), 16),
            PacketNumber::U32(x) => (u64::from(x), 32),
            PacketNumber::U48(x) => (x, 48),
        }
    }

    /// Reconstructs the full 62-bit packet number using `last` (the largest
    /// previously received packet number) as the epoch anchor, per spec.md §3.
    pub fn expand(self, last: u64) -> u64 {
        let (truncated, bits) = self.truncated_bits();
        expand_packet_number(truncated, bits, last)
    }

    pub fn encode<B: BufMut>(self, buf: &mut B) {
        match self {
            PacketNumber::U8(x) => buf.write(x),
            PacketNumber::U16(x) => buf.write(x),
            PacketNumber::U32(x) => buf.write(x),
            PacketNumber::U48(x) => {
                let bytes = x.to_be_bytes();
                buf.put_slice(&bytes[2..8]);
            }
        }
    }
}

const MAX_PN: u64 = (1u64 << 62) - 1;

/// Epoch-anchored packet number expansion (spec.md §3 / §8 property 2).
///
/// Chooses the representative in `{n - 2^k, n, n + 2^k}` closest to
/// `expected = last + 1`, clamped to `0..=2^62-1`.
pub fn expand_packet_number(truncated: u64, bits: u32, last: u64) -> u64 {
    let span = 1u64 << bits;
    let mask = span - 1;
    let expected = last.wrapping_add(1);
    let epoch = expected & !mask;

    let candidates = [
        epoch.wrapping_sub(span).wrapping_add(truncated),
        epoch.wrapping_add(truncated),
        epoch.wrapping_add(span).wrapping_add(truncated),
    ];

    let mut best = None;
    for &candidate in &candidates {
        if candidate > MAX_PN {
            continue;
        }
        // Reject undershoots that would require the epoch to go negative;
        // `wrapping_sub` above can produce a huge value instead of a small
        // negative one, which the `> MAX_PN` check above already screens out.
        let distance = if candidate >= expected {
            candidate - expected
        } else {
            expected - candidate
        };
        best = match best {
            None => Some((candidate, distance)),
            Some((_, best_distance)) if distance < best_distance => Some((candidate, distance)),
            other => other,
        };
    }
    best.map(|(value, _)| value).unwrap_or(truncated)
}

/// Encodes `value` against `last` using the shortest wire width that a
/// correctly-implemented peer can unambiguously expand back to `value`.
pub fn truncate_packet_number(value: u64, last: u64) -> PacketNumber {
    let diff = value.wrapping_sub(last.wrapping_add(1)) as i64;
    // RFC 9000 §17.1: need enough bits so 2*diff fits the representable range.
    if diff.abs() < (1i64 << 7) {
        PacketNumber::U8(value as u8)
    } else if diff.abs() < (1i64 << 15) {
        PacketNumber::U16(value as u16)
    } else if diff.abs() < (1i64 << 31) {
        PacketNumber::U32(value as u32)
    } else {
        PacketNumber::U48(value)
    }
}

/// The parsed public/long/short header (spec.md §3 "Parsed Public Header").
#[derive(Debug, Clone)]
pub enum Header {
    Initial {
        dst_cid: ConnectionId,
        src_cid: ConnectionId,
        token: Bytes,
        number: PacketNumber,
    },
    Long {
        ty: LongType,
        dst_cid: ConnectionId,
        src_cid: ConnectionId,
        number: PacketNumber,
    },
    Retry {
        dst_cid: ConnectionId,
        src_cid: ConnectionId,
        orig_dst_cid: Option<ConnectionId>,
        token: Bytes,
    },
    Short {
        dst_cid: ConnectionId,
        number: PacketNumber,
        key_phase: bool,
    },
    VersionNegotiate {
        random: u8,
        src_cid: ConnectionId,
        dst_cid: ConnectionId,
    },
    /// Legacy Google-QUIC public-flags header (spec.md §6). There is only
    /// one connection ID on the wire in this dialect.
    Legacy {
        dst_cid: ConnectionId,
        version: Option<u32>,
        reset: bool,
        diversification_nonce: Option<[u8; 32]>,
        number: PacketNumber,
    },
}

impl Header {
    pub fn dst_cid(&self) -> &ConnectionId {
        match self {
            Header::Initial { dst_cid, .. }
            | Header::Long { dst_cid, .. }
            | Header::Retry { dst_cid, .. }
            | Header::Short { dst_cid, .. }
            | Header::VersionNegotiate { dst_cid, .. }
            | Header::Legacy { dst_cid, .. } => dst_cid,
        }
    }

    pub fn is_long(&self) -> bool {
        !matches!(self, Header::Short { .. })
    }

    pub fn is_initial(&self) -> bool {
        matches!(self, Header::Initial { .. })
    }

    pub fn is_retry(&self) -> bool {
        matches!(self, Header::Retry { .. })
    }

    pub fn is_version_negotiate(&self) -> bool {
        matches!(self, Header::VersionNegotiate { .. })
    }

    /// Writes this header to `buf`. `payload_len` is the length in bytes of
    /// the packet payload that will follow (after the packet number);
    /// headers with a `Length` field (Initial, Long) encode
    /// `payload_len + pn_len` there so a receiver can split coalesced
    /// packets out of the same datagram (RFC 9000 §12.2). Ignored by
    /// variants with no length field.
    pub fn encode<B: BufMut>(&self, buf: &mut B, payload_len: usize) {
        match *self {
            Header::VersionNegotiate {
                random,
                ref src_cid,
                ref dst_cid,
            } => {
                buf.write::<u8>(0x80 | random);
                buf.write::<u32>(0); // version = 0 marks negotiation
                encode_long_cids(buf, dst_cid, src_cid);
            }
            Header::Short {
                ref dst_cid,
                number,
                key_phase,
            } => {
                let ty = 0b0100_0000
                    | if key_phase { 0b0000_0100 } else { 0 }
                    | pn_len_bits(number);
                buf.write::<u8>(ty);
                buf.put_slice(dst_cid);
                number.encode(buf);
            }
            Header::Initial {
                ref dst_cid,
                ref src_cid,
                ref token,
                number,
            } => {
                buf.write::<u8>(0b1100_0000 | pn_len_bits(number));
                buf.write::<u32>(::VERSION);
                encode_long_cids(buf, dst_cid, src_cid);
                buf.write_var(token.len() as u64);
                buf.put_slice(token);
                buf.write_var((number.wire_len() + payload_len) as u64);
                number.encode(buf);
            }
            Header::Long {
                ty,
                ref dst_cid,
                ref src_cid,
                number,
            } => {
                let ty_bits = match ty {
                    LongType::Initial => 0b00,
                    LongType::ZeroRtt => 0b01,
                    LongType::Handshake => 0b10,
                    LongType::Retry => 0b11,
                };
                buf.write::<u8>(0b1100_0000 | (ty_bits << 4) | pn_len_bits(number));
                buf.write::<u32>(::VERSION);
                encode_long_cids(buf, dst_cid, src_cid);
                buf.write_var((number.wire_len() + payload_len) as u64);
                number.encode(buf);
            }
            Header::Retry {
                ref dst_cid,
                ref src_cid,
                ref token,
                ..
            } => {
                buf.write::<u8>(0b1111_0000);
                buf.write::<u32>(::VERSION);
                encode_long_cids(buf, dst_cid, src_cid);
                buf.put_slice(token);
            }
            Header::Legacy {
                ref dst_cid,
                version,
                reset,
                diversification_nonce,
                number,
            } => {
                let mut flags = 0u8;
                if version.is_some() {
                    flags |= 0x01;
                }
                if reset {
                    flags |= 0x02;
                }
                if diversification_nonce.is_some() {
                    flags |= 0x0c;
                }
                flags |= legacy_pn_len_bits(number) << 4;
                flags |= legacy_cid_len_bits(dst_cid.len()) << 6;
                buf.write::<u8>(flags);
                buf.put_slice(dst_cid);
                if let Some(v) = version {
                    buf.write::<u32>(v);
                }
                if let Some(nonce) = diversification_nonce {
                    buf.put_slice(&nonce);
                }
                number.encode(buf);
            }
        }
    }
}

/// Maps a packet-number wire width to the legacy public-flags bits 4-5
/// (spec.md §6: 1/2/4/6-byte packet numbers).
fn legacy_pn_len_bits(number: PacketNumber) -> u8 {
    match number.wire_len() {
        1 => 0b00,
        2 => 0b01,
        4 => 0b10,
        6 => 0b11,
        other => panic!("packet number length {} not representable in legacy dialect", other),
    }
}

/// Maps a connection-ID length to the legacy public-flags bits 6-7
/// (spec.md §6: 0/1/4/8-byte connection ids).
fn legacy_cid_len_bits(len: usize) -> u8 {
    match len {
        0 => 0b00,
        1 => 0b01,
        4 => 0b10,
        8 => 0b11,
        other => panic!("connection id length {} not representable in legacy dialect", other),
    }
}

fn legacy_cid_len_from_bits(bits: u8) -> usize {
    match bits {
        0b00 => 0,
        0b01 => 1,
        0b10 => 4,
        0b11 => 8,
        _ => unreachable!("two-bit field"),
    }
}

fn legacy_pn_len_from_bits(bits: u8) -> usize {
    match bits {
        0b00 => 1,
        0b01 => 2,
        0b10 => 4,
        0b11 => 6,
        _ => unreachable!("two-bit field"),
    }
}

fn pn_len_bits(number: PacketNumber) -> u8 {
    match number {
        PacketNumber::U8(_) => 0b00,
        PacketNumber::U16(_) => 0b01,
        PacketNumber::U32(_) => 0b10,
        PacketNumber::U48(_) => 0b11,
    }
}

fn encode_long_cids<B: BufMut>(buf: &mut B, dst_cid: &ConnectionId, src_cid: &ConnectionId) {
    buf.write::<u8>(dst_cid.len() as u8);
    buf.put_slice(dst_cid);
    buf.write::<u8>(src_cid.len() as u8);
    buf.put_slice(src_cid);
}

/// `NO_ERROR` / `INVALID_PACKET_HEADER` per spec.md §7.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PacketDecodeError {
    InvalidHeader(String),
    UnsupportedVersion {
        source: ConnectionId,
        destination: ConnectionId,
        version: u32,
    },
}

impl ::std::fmt::Display for PacketDecodeError {
    fn fmt(&self, f: &mut ::std::fmt::Formatter) -> ::std::fmt::Result {
        match self {
            PacketDecodeError::InvalidHeader(detail) => write!(f, "invalid packet header: {}", detail),
            PacketDecodeError::UnsupportedVersion { .. } => write!(f, "unsupported version"),
        }
    }
}

fn invalid(detail: &str) -> PacketDecodeError {
    PacketDecodeError::InvalidHeader(detail.into())
}

/// Output of the cheap, pre-decryption classification pass (component B).
///
/// Carries just enough of the header plus the raw remaining bytes for the
/// dispatcher to make a routing decision; full authenticated parsing (the
/// Framer, component C) happens only after a session is found or created.
pub struct PartialDecode {
    header: Header,
    dialect: Dialect,
    rest: Bytes,
    /// Bytes left over after this packet's declared `Length` (long header
    /// only), i.e. a second packet coalesced into the same UDP datagram
    /// (RFC 9000 §12.2). Empty for headers with no length field (short
    /// header, Retry, Version Negotiation), which must be last in a
    /// datagram if present at all.
    remainder: Bytes,
}

impl PartialDecode {
    /// Classifies the first packet in `data` against `expected_cid_len`
    /// (the dispatcher's configured server connection-ID length).
    ///
    /// `dialect` selects which of the recognised connection-ID layouts
    /// (spec.md §4.A) this version uses; the legacy dialect additionally
    /// changes where the packet-number length lives.
    pub fn new(
        mut data: Bytes,
        expected_cid_len: usize,
        allow_short_initial: bool,
        dialect: Dialect,
    ) -> Result<(Self, bool), PacketDecodeError> {
        if data.is_empty() {
            return Err(invalid("zero-length packet"));
        }
        if dialect == Dialect::LegacyGoogle {
            return Self::parse_legacy(data, allow_short_initial);
        }
        let first = data[0];
        let is_long = first & 0x80 != 0;

        if !is_long {
            return Self::parse_short(data, expected_cid_len, allow_short_initial, dialect);
        }

        if data.len() < 5 {
            return Err(invalid("long header truncated before version"));
        }
        let mut cursor = ::std::io::Cursor::new(&data[1..5]);
        let version: u32 = cursor.get().map_err(|_| invalid("version truncated"))?;
        data.advance(5);

        let (dst_cid, src_cid) = match dialect {
            Dialect::IetfNibblePacked => {
                if data.is_empty() {
                    return Err(invalid("missing cid length byte"));
                }
                let (dcil, scil) = decode_nibble_lengths(data[0]);
                data.advance(1);
                read_two_cids(&mut data, dcil, scil)?
            }
            _ => read_length_prefixed_cids(&mut data)?,
        };

        if dst_cid.len() > MAX_CID_SIZE || src_cid.len() > MAX_CID_SIZE {
            return Err(invalid("connection id too long"));
        }

        if version == 0 {
            let header = Header::VersionNegotiate {
                random: first & 0x7f,
                dst_cid,
                src_cid,
            };
            return Ok((
                PartialDecode {
                    header,
                    dialect,
                    rest: data,
                    remainder: Bytes::new(),
                },
                true,
            ));
        }

        if version != ::VERSION {
            return Err(PacketDecodeError::UnsupportedVersion {
                source: src_cid,
                destination: dst_cid,
                version,
            });
        }

        let long_type = (first & 0x30) >> 4;
        match long_type {
            0b11 => {
                // Retry: server never parses the token/tag contents, only
                // enough to recognise the packet and refuse it (spec.md §4.C).
                let header = Header::Retry {
                    dst_cid,
                    src_cid,
                    orig_dst_cid: None,
                    token: data.clone(),
                };
                Ok((
                    PartialDecode {
                        header,
                        dialect,
                        rest: Bytes::new(),
                        remainder: Bytes::new(),
                    },
                    false,
                ))
            }
            0b00 => {
                let token_len = ::std::io::Cursor::new(&data[..])
                    .get_var()
                    .map_err(|_| invalid("initial token length truncated"))?;
                let token_len_bytes = ::coding::var_len(token_len);
                data.advance(token_len_bytes);
                if data.len() < token_len as usize {
                    return Err(invalid("initial token truncated"));
                }
                let token = data.split_to(token_len as usize);
                let pn_len = (first & 0x03) as usize + 1;
                let (number, rest, remainder) = read_length_pn_and_split(&mut data, pn_len)?;
                let header = Header::Initial {
                    dst_cid,
                    src_cid,
                    token,
                    number,
                };
                Ok((
                    PartialDecode {
                        header,
                        dialect,
                        rest,
                        remainder,
                    },
                    false,
                ))
            }
            ty_bits => {
                let ty = match ty_bits {
                    0b01 => LongType::ZeroRtt,
                    0b10 => LongType::Handshake,
                    _ => unreachable!(),
                };
                let pn_len = (first & 0x03) as usize + 1;
                let (number, rest, remainder) = read_length_pn_and_split(&mut data, pn_len)?;
                let header = Header::Long {
                    ty,
                    dst_cid,
                    src_cid,
                    number,
                };
                Ok((
                    PartialDecode {
                        header,
                        dialect,
                        rest,
                        remainder,
                    },
                    false,
                ))
            }
        }
    }

    fn parse_short(
        mut data: Bytes,
        expected_cid_len: usize,
        allow_short_initial: bool,
        dialect: Dialect,
    ) -> Result<(Self, bool), PacketDecodeError> {
        let first = data[0];
        data.advance(1);
        if data.len() < expected_cid_len {
            return Err(invalid("short header shorter than expected connection id"));
        }
        let dst_cid = ConnectionId::new(&data[..expected_cid_len]);
        data.advance(expected_cid_len);
        if dst_cid.len() < MIN_INITIAL_CID_LEN_FOR_SHORT && !allow_short_initial {
            return Err(invalid("destination connection id too short"));
        }
        let pn_len = (first & 0x03) as usize + 1;
        if data.len() < pn_len {
            return Err(invalid("packet number truncated"));
        }
        let number = read_packet_number(&mut data, pn_len)?;
        let key_phase = first & 0b0000_0100 != 0;
        let header = Header::Short {
            dst_cid,
            number,
            key_phase,
        };
        Ok((
            PartialDecode {
                header,
                dialect,
                rest: data,
                remainder: Bytes::new(),
            },
            false,
        ))
    }

    /// Decodes the legacy Google-QUIC public-flags header (spec.md §6):
    ///
    /// ```text
    /// bit 0    version flag   (4-byte version label follows the cid)
    /// bit 1    reset flag
    /// bits 2-3 diversification nonce present (32 bytes, server->client only)
    /// bits 4-5 packet number wire length (1/2/4/6 bytes)
    /// bits 6-7 connection id wire length (0/1/4/8 bytes)
    /// ```
    ///
    /// There is only one connection ID in this dialect, so the only fast-path
    /// consumer (the dispatcher's CID-keyed lookup) always uses it as both
    /// the source and the destination.
    fn parse_legacy(mut data: Bytes, allow_short_initial: bool) -> Result<(Self, bool), PacketDecodeError> {
        let flags = data[0];
        data.advance(1);

        let has_version = flags & 0x01 != 0;
        let reset = flags & 0x02 != 0;
        let nonce_present = flags & 0x0c != 0;
        let cid_len = legacy_cid_len_from_bits((flags & 0xc0) >> 6);
        let pn_len = legacy_pn_len_from_bits((flags & 0x30) >> 4);

        if data.len() < cid_len {
            return Err(invalid("legacy connection id truncated"));
        }
        let dst_cid = ConnectionId::new(&data[..cid_len]);
        data.advance(cid_len);

        if dst_cid.len() < MIN_INITIAL_CID_LEN_FOR_SHORT && !allow_short_initial && !has_version {
            return Err(invalid("destination connection id too short"));
        }

        let version = if has_version {
            if data.len() < 4 {
                return Err(invalid("legacy version truncated"));
            }
            let v = BigEndian::read_u32(&data[..4]);
            data.advance(4);
            Some(v)
        } else {
            None
        };

        let diversification_nonce = if nonce_present {
            if data.len() < 32 {
                return Err(invalid("legacy diversification nonce truncated"));
            }
            let mut nonce = [0u8; 32];
            nonce.copy_from_slice(&data[..32]);
            data.advance(32);
            Some(nonce)
        } else {
            None
        };

        if let Some(0) = version {
            let header = Header::VersionNegotiate {
                random: flags & 0x7f,
                dst_cid,
                src_cid: dst_cid,
            };
            return Ok((
                PartialDecode {
                    header,
                    dialect: Dialect::LegacyGoogle,
                    rest: data,
                    remainder: Bytes::new(),
                },
                true,
            ));
        }

        if let Some(v) = version {
            if v != ::VERSION {
                return Err(PacketDecodeError::UnsupportedVersion {
                    source: ConnectionId::new(&[]),
                    destination: dst_cid,
                    version: v,
                });
            }
        }

        if data.len() < pn_len {
            return Err(invalid("legacy packet number truncated"));
        }
        let number = read_packet_number(&mut data, pn_len)?;

        let header = Header::Legacy {
            dst_cid,
            version,
            reset,
            diversification_nonce,
            number,
        };
        Ok((
            PartialDecode {
                header,
                dialect: Dialect::LegacyGoogle,
                rest: data,
                remainder: Bytes::new(),
            },
            false,
        ))
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    pub fn dst_cid(&self) -> &ConnectionId {
        self.header.dst_cid()
    }

    pub fn has_long_header(&self) -> bool {
        self.header.is_long()
    }

    pub fn is_initial(&self) -> bool {
        self.header.is_initial()
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    /// Bytes after this packet's end, if the datagram coalesced another
    /// packet behind it (RFC 9000 §12.2). Empty for dialects/header kinds
    /// with no `Length` field.
    pub fn remainder(&self) -> Bytes {
        self.remainder.clone()
    }

    /// The raw payload bytes: everything after the header up to (but not
    /// including) any coalesced packet that follows, still encrypted.
    /// Decryption/AEAD removal is an external collaborator (spec.md §1); the
    /// Framer (component C) consumes this once the caller hands it a
    /// cleartext payload.
    pub fn into_payload(self) -> (Header, Bytes) {
        (self.header, self.rest)
    }
}

/// Reads the `Length` varint (packet number + payload byte count), then the
/// packet number itself, then splits the rest of `data` into `(payload,
/// leftover)` at the declared length. `leftover` is any further packet(s)
/// coalesced into the same datagram.
fn read_length_pn_and_split(data: &mut Bytes, pn_len: usize) -> Result<(PacketNumber, Bytes, Bytes), PacketDecodeError> {
    let length = ::std::io::Cursor::new(&data[..])
        .get_var()
        .map_err(|_| invalid("packet length truncated"))?;
    let length_field_bytes = ::coding::var_len(length);
    data.advance(length_field_bytes);
    if (length as usize) < pn_len {
        return Err(invalid("packet length shorter than packet number"));
    }
    if data.len() < pn_len {
        return Err(invalid("packet number truncated"));
    }
    let number = read_packet_number(data, pn_len)?;
    let payload_len = length as usize - pn_len;
    if data.len() < payload_len {
        return Err(invalid("packet payload shorter than declared length"));
    }
    let payload = data.split_to(payload_len);
    Ok((number, payload, data.clone()))
}

const MIN_INITIAL_CID_LEN_FOR_SHORT: usize = 8;

fn read_packet_number(data: &mut Bytes, len: usize) -> Result<PacketNumber, PacketDecodeError> {
    let slice = data.split_to(len);
    Ok(match len {
        1 => PacketNumber::U8(slice[0]),
        2 => PacketNumber::U16(BigEndian::read_u16(&slice)),
        4 => PacketNumber::U32(BigEndian::read_u32(&slice)),
        6 => PacketNumber::U48(BigEndian::read_uint(&slice, 6)),
        _ => return Err(invalid("unsupported packet number length")),
    })
}

fn read_two_cids(
    data: &mut Bytes,
    dcil: usize,
    scil: usize,
) -> Result<(ConnectionId, ConnectionId), PacketDecodeError> {
    if data.len() < dcil + scil {
        return Err(invalid("connection ids truncated"));
    }
    let dst = ConnectionId::new(&data[..dcil]);
    data.advance(dcil);
    let src = ConnectionId::new(&data[..scil]);
    data.advance(scil);
    Ok((dst, src))
}

fn read_length_prefixed_cids(data: &mut Bytes) -> Result<(ConnectionId, ConnectionId), PacketDecodeError> {
    if data.is_empty() {
        return Err(invalid("missing destination cid length"));
    }
    let dcil = data[0] as usize;
    data.advance(1);
    if dcil > MAX_CID_SIZE || data.len() < dcil {
        return Err(invalid("destination connection id invalid"));
    }
    let dst = ConnectionId::new(&data[..dcil]);
    data.advance(dcil);
    if data.is_empty() {
        return Err(invalid("missing source cid length"));
    }
    let scil = data[0] as usize;
    data.advance(1);
    if scil > MAX_CID_SIZE || data.len() < scil {
        return Err(invalid("source connection id invalid"));
    }
    let src = ConnectionId::new(&data[..scil]);
    data.advance(scil);
    Ok((dst, src))
}

/// Encodes a stateless-reset packet body (a short header followed by random
/// padding and, finally, the 16-byte reset token). The caller supplies the
/// token; this crate doesn't decide its size semantics beyond that constant.
pub const RESET_TOKEN_SIZE: usize = 16;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packet_number_epoch_expansion() {
        let last = 0x6afe_2f9du64;
        let truncated = PacketNumber::U16(0xbe9c);
        assert_eq!(truncated.expand(last), 0x6afe_be9c);
    }

    #[test]
    fn packet_number_near_zero_does_not_wrap() {
        let truncated = PacketNumber::U8(0);
        assert_eq!(truncated.expand(0), 1);
    }

    #[test]
    fn truncate_then_expand_roundtrips() {
        for &(value, last) in &[
            (1000u64, 999u64),
            (1 << 30, (1 << 30) - 5),
            (5, 0),
        ] {
            let truncated = truncate_packet_number(value, last);
            assert_eq!(truncated.expand(last), value);
        }
    }

    #[test]
    fn zero_length_datagram_is_invalid_header() {
        let err = PartialDecode::new(Bytes::new(), 8, false, Dialect::IetfLengthPrefixed).unwrap_err();
        assert!(matches!(err, PacketDecodeError::InvalidHeader(_)));
    }

    #[test]
    fn coalesced_initial_packets_split_at_declared_length() {
        use bytes::BytesMut;

        let dst_cid = ConnectionId::new(&[0x11; 8]);
        let src_cid = ConnectionId::new(&[0x22; 8]);
        let first_payload = [0xaa; 40];
        let second_payload = [0xbb; 30];

        let mut buf = BytesMut::new();
        Header::Initial {
            dst_cid,
            src_cid,
            token: Bytes::new(),
            number: PacketNumber::U8(1),
        }.encode(&mut buf, first_payload.len());
        buf.put_slice(&first_payload);
        Header::Initial {
            dst_cid,
            src_cid,
            token: Bytes::new(),
            number: PacketNumber::U8(2),
        }.encode(&mut buf, second_payload.len());
        buf.put_slice(&second_payload);

        let datagram = buf.freeze();
        let (decoded, _) =
            PartialDecode::new(datagram, 8, false, Dialect::IetfLengthPrefixed).unwrap();
        let remainder = decoded.remainder();
        let (_, payload) = decoded.into_payload();
        assert_eq!(&payload[..], &first_payload[..]);

        assert!(!remainder.is_empty());
        let (decoded2, _) =
            PartialDecode::new(remainder, 8, false, Dialect::IetfLengthPrefixed).unwrap();
        let remainder2 = decoded2.remainder();
        let (_, payload2) = decoded2.into_payload();
        assert_eq!(&payload2[..], &second_payload[..]);
        assert!(remainder2.is_empty());
    }

    #[test]
    fn legacy_header_roundtrips() {
        use bytes::BytesMut;

        let dst_cid = ConnectionId::new(&[0x77; 8]);
        let header = Header::Legacy {
            dst_cid,
            version: Some(::VERSION),
            reset: false,
            diversification_nonce: None,
            number: PacketNumber::U32(0x1234_5678),
        };
        let mut buf = BytesMut::new();
        header.encode(&mut buf, 0);

        let (decoded, is_vn) =
            PartialDecode::new(buf.freeze(), 8, false, Dialect::LegacyGoogle).unwrap();
        assert!(!is_vn);
        match decoded.header() {
            Header::Legacy {
                dst_cid: got_cid,
                version,
                reset,
                diversification_nonce,
                number,
            } => {
                assert_eq!(*got_cid, dst_cid);
                assert_eq!(*version, Some(::VERSION));
                assert!(!reset);
                assert!(diversification_nonce.is_none());
                assert_eq!(*number, PacketNumber::U32(0x1234_5678));
            }
            other => panic!("unexpected header {:?}", other),
        }
    }

    #[test]
    fn legacy_version_negotiation_is_recognised() {
        use bytes::BytesMut;

        let dst_cid = ConnectionId::new(&[0x55; 8]);
        let header = Header::Legacy {
            dst_cid,
            version: Some(0),
            reset: false,
            diversification_nonce: None,
            number: PacketNumber::U8(0),
        };
        let mut buf = BytesMut::new();
        header.encode(&mut buf, 0);

        let (decoded, is_vn) =
            PartialDecode::new(buf.freeze(), 8, false, Dialect::LegacyGoogle).unwrap();
        assert!(is_vn);
        assert!(decoded.header().is_version_negotiate());
    }
}
