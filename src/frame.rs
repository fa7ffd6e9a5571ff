//! Component C: the Framer. Turns a decrypted packet payload into a sequence
//! of `Frame`s and back, per spec.md §3/§6.

use std::io::Cursor;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use coding::{self, BufExt, BufMutExt};
use error::{ErrorKind, TransportError};
use packet::Dialect;

macro_rules! frame_types {
    ($($name:ident($val:expr) $(= $doc:expr)?,)*) => {
        #[derive(Debug, Copy, Clone, PartialEq, Eq)]
        pub enum Type {
            $($name,)*
            Stream(StreamInfo),
            Datagram(DatagramInfo),
        }

        impl Type {
            fn base(self) -> Option<u64> {
                match self {
                    $(Type::$name => Some($val),)*
                    _ => None,
                }
            }
        }
    };
}

/// Low three bits of a STREAM frame's type byte (RFC 9000 §19.8).
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct StreamInfo {
    pub fin: bool,
    pub len: bool,
    pub off: bool,
}

/// Low bit of a MESSAGE/DATAGRAM frame's type byte.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct DatagramInfo {
    pub len: bool,
}

frame_types! {
    Padding(0x00),
    Ping(0x01),
    Ack(0x02),
    AckEcn(0x03),
    ResetStream(0x04),
    StopSending(0x05),
    Crypto(0x06),
    NewToken(0x07),
    MaxData(0x10),
    MaxStreamData(0x11),
    MaxStreamsBidi(0x12),
    MaxStreamsUni(0x13),
    DataBlocked(0x14),
    StreamDataBlocked(0x15),
    StreamsBlockedBidi(0x16),
    StreamsBlockedUni(0x17),
    NewConnectionId(0x18),
    RetireConnectionId(0x19),
    PathChallenge(0x1a),
    PathResponse(0x1b),
    ConnectionCloseTransport(0x1c),
    ConnectionCloseApplication(0x1d),
    HandshakeDone(0x1e),
    Message(0x30),
    MessageWithLength(0x31),
    /// Legacy Google-QUIC, single-byte wire codes from a separate numbering
    /// space selected by dialect (spec.md §6); never confused with the IETF
    /// varint codes above since `decode_one` dispatches on dialect first.
    StopWaiting(0x06),
    Goaway(0x03),
}

/// A stream or connection identifier; just a newtype over the raw varint so
/// the wire layer doesn't need to know how the session layer interprets it.
pub type StreamId = u64;
pub type VarInt = u64;

#[derive(Debug, Clone)]
pub enum Frame {
    /// A run of `run_length` consecutive zero bytes, collapsed into one
    /// frame rather than one `Padding` per byte (spec.md §4.C).
    Padding(u64),
    Ping,
    Ack(AckFrame),
    ResetStream {
        id: StreamId,
        error_code: VarInt,
        final_size: VarInt,
    },
    StopSending {
        id: StreamId,
        error_code: VarInt,
    },
    Crypto(CryptoFrame),
    NewToken {
        token: Bytes,
    },
    Stream(StreamFrame),
    MaxData(VarInt),
    MaxStreamData {
        id: StreamId,
        offset: VarInt,
    },
    MaxStreams {
        directionality: Directionality,
        count: VarInt,
    },
    DataBlocked {
        offset: VarInt,
    },
    StreamDataBlocked {
        id: StreamId,
        offset: VarInt,
    },
    StreamsBlocked {
        directionality: Directionality,
        limit: VarInt,
    },
    NewConnectionId {
        sequence: VarInt,
        retire_prior_to: VarInt,
        id: ::cid::ConnectionId,
        reset_token: [u8; 16],
    },
    RetireConnectionId {
        sequence: VarInt,
    },
    PathChallenge {
        token: [u8; 8],
    },
    PathResponse {
        token: [u8; 8],
    },
    ConnectionClose(ConnectionCloseFrame),
    HandshakeDone,
    /// Unreliable, unordered datagram (RFC 9221-style MESSAGE/DATAGRAM
    /// frame, spec.md §3/§6). Always encoded with an explicit length.
    Message {
        data: Bytes,
    },
    /// Legacy Google-QUIC STOP_WAITING; carries the least-unacked packet
    /// number, kept only for dialect compatibility (spec.md §4.C).
    StopWaiting {
        least_unacked: VarInt,
    },
    /// Legacy Google-QUIC GOAWAY.
    Goaway {
        error_code: VarInt,
        last_good_stream_id: StreamId,
        reason: Bytes,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Directionality {
    Bidi,
    Uni,
}

#[derive(Debug, Clone)]
pub struct AckFrame {
    pub largest: VarInt,
    pub delay: VarInt,
    /// Each entry is `(gap, ack_range_length)` after the first range, matching
    /// the wire order; the first range's length is carried separately.
    pub first_ack_range: VarInt,
    pub ranges: Vec<(VarInt, VarInt)>,
    pub ecn: Option<EcnCounts>,
}

#[derive(Debug, Clone, Copy)]
pub struct EcnCounts {
    pub ect0: VarInt,
    pub ect1: VarInt,
    pub ce: VarInt,
}

impl AckFrame {
    /// Iterates the decoded packet-number ranges, largest first, each as an
    /// inclusive `(start, end)` pair.
    pub fn iter_ranges(&self) -> impl Iterator<Item = (u64, u64)> + '_ {
        let mut largest = self.largest;
        let mut first = Some((largest - self.first_ack_range, largest));
        // Only step `largest` past the first range if there's a second range
        // to use it; a single all-covering range (`first_ack_range ==
        // largest`, no further ranges) would otherwise underflow here even
        // though it never needs the result.
        if !self.ranges.is_empty() {
            largest -= self.first_ack_range + 1;
        }
        let mut rest = self.ranges.iter();
        ::std::iter::from_fn(move || {
            if let Some(range) = first.take() {
                return Some(range);
            }
            let (gap, len) = *rest.next()?;
            largest -= gap + 1;
            let end = largest;
            largest -= len;
            let start = largest + 1;
            largest -= 1;
            Some((start, end))
        })
    }
}

#[derive(Debug, Clone)]
pub struct CryptoFrame {
    pub offset: VarInt,
    pub data: Bytes,
}

#[derive(Debug, Clone)]
pub struct StreamFrame {
    pub id: StreamId,
    pub offset: VarInt,
    pub fin: bool,
    pub data: Bytes,
}

#[derive(Debug, Clone)]
pub struct ConnectionCloseFrame {
    pub is_application: bool,
    pub error_code: VarInt,
    /// Only present for the transport variant; `None` for application close.
    pub frame_type: Option<VarInt>,
    pub reason: Bytes,
}

/// Longest CONNECTION_CLOSE reason phrase this crate will emit (spec.md §4.C).
pub const MAX_CLOSE_REASON_LEN: usize = 256;

fn invalid(detail: impl Into<String>) -> TransportError {
    TransportError::new(ErrorKind::InvalidFrameData, detail.into())
}

fn protocol_violation(detail: impl Into<String>) -> TransportError {
    TransportError::new(ErrorKind::IetfQuicProtocolViolation, detail.into())
}

/// Iterates the frames in a decrypted packet payload, enforcing the
/// minimal-varint-encoding rule on frame *type* fields (spec.md §4.C: a
/// non-minimally-encoded frame type is an `IETF_QUIC_PROTOCOL_VIOLATION`,
/// while an unrecognised but minimally-encoded type is `INVALID_FRAME_DATA`).
pub struct Iter {
    buf: Bytes,
    dialect: Dialect,
}

impl Iter {
    pub fn new(payload: Bytes, dialect: Dialect) -> Result<Self, TransportError> {
        if payload.is_empty() {
            return Err(TransportError::new(ErrorKind::MissingPayload, "empty packet payload"));
        }
        Ok(Iter { buf: payload, dialect })
    }

    fn take_len(&mut self, len: usize) -> Result<Bytes, TransportError> {
        if self.buf.len() < len {
            return Err(invalid("frame field truncated"));
        }
        Ok(self.buf.split_to(len))
    }

    fn get_var(&mut self) -> Result<u64, TransportError> {
        let mut cursor = Cursor::new(&self.buf[..]);
        let value = cursor.get_var().map_err(|_| invalid("varint truncated"))?;
        let consumed = cursor.position() as usize;
        self.buf.advance(consumed);
        Ok(value)
    }

    /// Reads a fixed-width big-endian integer. Used by the legacy dialect,
    /// which predates the varint-62 encoding the IETF table above uses.
    fn get<T: coding::Codable>(&mut self) -> Result<T, TransportError> {
        let mut cursor = Cursor::new(&self.buf[..]);
        let value = cursor.get::<T>().map_err(|_| invalid("fixed-width field truncated"))?;
        let consumed = cursor.position() as usize;
        self.buf.advance(consumed);
        Ok(value)
    }

    fn peek_type_varint(&mut self) -> Result<(u64, usize), TransportError> {
        if self.buf.is_empty() {
            return Err(invalid("missing frame type"));
        }
        let mut cursor = Cursor::new(&self.buf[..]);
        let value = cursor.get_var().map_err(|_| invalid("frame type truncated"))?;
        let len = cursor.position() as usize;
        Ok((value, len))
    }
}

impl Iterator for Iter {
    type Item = Result<Frame, TransportError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buf.is_empty() {
            return None;
        }
        Some(self.decode_one())
    }
}

impl Iter {
    fn decode_one(&mut self) -> Result<Frame, TransportError> {
        if self.dialect == Dialect::LegacyGoogle {
            return self.decode_one_legacy();
        }
        let (ty, ty_len) = self.peek_type_varint()?;
        if !coding::is_minimal_encoding(ty, ty_len) {
            return Err(protocol_violation("frame type not minimally encoded"));
        }
        self.buf.advance(ty_len);

        if ty >= 0x08 && ty <= 0x0f {
            return self.decode_stream(ty);
        }

        match ty {
            0x00 => self.decode_padding_run(),
            0x01 => Ok(Frame::Ping),
            0x02 => self.decode_ack(false),
            0x03 => self.decode_ack(true),
            0x04 => self.decode_reset_stream(),
            0x05 => self.decode_stop_sending(),
            0x06 => self.decode_crypto(),
            0x07 => self.decode_new_token(),
            0x10 => Ok(Frame::MaxData(self.get_var()?)),
            0x11 => self.decode_max_stream_data(),
            0x12 => Ok(Frame::MaxStreams {
                directionality: Directionality::Bidi,
                count: self.get_var()?,
            }),
            0x13 => Ok(Frame::MaxStreams {
                directionality: Directionality::Uni,
                count: self.get_var()?,
            }),
            0x14 => Ok(Frame::DataBlocked {
                offset: self.get_var()?,
            }),
            0x15 => self.decode_stream_data_blocked(),
            0x16 => Ok(Frame::StreamsBlocked {
                directionality: Directionality::Bidi,
                limit: self.get_var()?,
            }),
            0x17 => Ok(Frame::StreamsBlocked {
                directionality: Directionality::Uni,
                limit: self.get_var()?,
            }),
            0x18 => self.decode_new_connection_id(),
            0x19 => Ok(Frame::RetireConnectionId {
                sequence: self.get_var()?,
            }),
            0x1a => self.decode_path_token().map(|token| Frame::PathChallenge { token }),
            0x1b => self.decode_path_token().map(|token| Frame::PathResponse { token }),
            0x1c => self.decode_connection_close(false),
            0x1d => self.decode_connection_close(true),
            0x1e => Ok(Frame::HandshakeDone),
            0x30 => {
                let data = self.take_len(self.buf.len())?;
                Ok(Frame::Message { data })
            }
            0x31 => {
                let len = self.get_var()? as usize;
                let data = self.take_len(len)?;
                Ok(Frame::Message { data })
            }
            _ => Err(invalid(format!("unknown frame type 0x{:x}", ty))),
        }
    }

    /// Collapses a run of raw zero bytes (the type byte already consumed by
    /// the caller counts as the first one) into a single `Padding` frame
    /// carrying the run length (spec.md §4.C).
    fn decode_padding_run(&mut self) -> Result<Frame, TransportError> {
        let mut run = 1u64;
        while self.buf.first() == Some(&0) {
            self.buf.advance(1);
            run += 1;
        }
        Ok(Frame::Padding(run))
    }

    /// Legacy Google-QUIC frame decode (spec.md §6): a raw, non-varint type
    /// byte from a numbering space disjoint from the IETF table above. The
    /// top two bits select STREAM/ACK; everything else is an exact byte
    /// match.
    fn decode_one_legacy(&mut self) -> Result<Frame, TransportError> {
        if self.buf.is_empty() {
            return Err(invalid("missing frame type"));
        }
        let first = self.buf[0];
        self.buf.advance(1);

        if first & 0x80 != 0 {
            return self.decode_legacy_stream(first);
        }
        if first & 0x40 != 0 {
            return self.decode_legacy_ack(first);
        }

        match first {
            0x00 => self.decode_padding_run(),
            0x01 => self.decode_legacy_reset_stream(),
            0x02 => self.decode_legacy_connection_close(),
            0x03 => self.decode_legacy_goaway(),
            0x06 => Ok(Frame::StopWaiting {
                least_unacked: self.get::<u64>()?,
            }),
            0x07 => Ok(Frame::Ping),
            _ => Err(invalid(format!("unknown legacy frame type 0x{:x}", first))),
        }
    }

    fn decode_legacy_reset_stream(&mut self) -> Result<Frame, TransportError> {
        Ok(Frame::ResetStream {
            id: u64::from(self.get::<u32>()?),
            final_size: self.get::<u64>()?,
            error_code: u64::from(self.get::<u32>()?),
        })
    }

    fn decode_legacy_goaway(&mut self) -> Result<Frame, TransportError> {
        let error_code = u64::from(self.get::<u32>()?);
        let last_good_stream_id = u64::from(self.get::<u32>()?);
        let reason_len = usize::from(self.get::<u16>()?);
        let reason = self.take_len(reason_len)?;
        Ok(Frame::Goaway {
            error_code,
            last_good_stream_id,
            reason,
        })
    }

    fn decode_legacy_connection_close(&mut self) -> Result<Frame, TransportError> {
        let error_code = u64::from(self.get::<u32>()?);
        let reason_len = usize::from(self.get::<u16>()?);
        let reason = self.take_len(reason_len)?;
        Ok(Frame::ConnectionClose(ConnectionCloseFrame {
            is_application: true,
            error_code,
            frame_type: None,
            reason,
        }))
    }

    /// Legacy ACK: type byte `0x40 | flags`, where bit 0 of `flags` signals
    /// whether any additional ack blocks follow the first one. Distinct wire
    /// shape from the IETF varint-range-list ACK (spec.md §6).
    fn decode_legacy_ack(&mut self, first: u8) -> Result<Frame, TransportError> {
        let has_ack_blocks = first & 0x01 != 0;
        let largest = self.get::<u32>().map(u64::from)?;
        let delay = self.get::<u16>().map(u64::from)?;
        let first_ack_range = self.get::<u16>().map(u64::from)?;
        if first_ack_range > largest {
            return Err(invalid("legacy ack first range exceeds largest acked"));
        }
        let mut ranges = Vec::new();
        if has_ack_blocks {
            let num_blocks = self.get::<u8>()?;
            let mut running = largest
                .checked_sub(first_ack_range)
                .and_then(|v| v.checked_sub(1))
                .ok_or_else(|| invalid("legacy ack range underflow"))?;
            for _ in 0..num_blocks {
                let gap = u64::from(self.get::<u8>()?);
                let len = u64::from(self.get::<u16>()?);
                running = running
                    .checked_sub(gap + 1)
                    .ok_or_else(|| invalid("legacy ack gap underflows past zero"))?;
                running = running
                    .checked_sub(len)
                    .ok_or_else(|| invalid("legacy ack range length underflows past zero"))?;
                ranges.push((gap, len));
                running = match running.checked_sub(1) {
                    Some(v) => v,
                    None => break,
                };
            }
        }
        Ok(Frame::Ack(AckFrame {
            largest,
            delay,
            first_ack_range,
            ranges,
            ecn: None,
        }))
    }

    /// Legacy STREAM: type byte `0x80 | flags`. `flags` bit 0 is FIN, bit 1
    /// is "offset field present", bit 2 is "explicit data-length field
    /// present" (otherwise the frame runs to the end of the packet).
    fn decode_legacy_stream(&mut self, first: u8) -> Result<Frame, TransportError> {
        let fin = first & 0x01 != 0;
        let has_offset = first & 0x02 != 0;
        let has_data_length = first & 0x04 != 0;
        let id = u64::from(self.get::<u32>()?);
        let offset = if has_offset { self.get::<u64>()? } else { 0 };
        let data_len = if has_data_length {
            usize::from(self.get::<u16>()?)
        } else {
            self.buf.len()
        };
        let data = self.take_len(data_len)?;
        Ok(Frame::Stream(StreamFrame { id, offset, fin, data }))
    }

    fn decode_stream(&mut self, ty: u64) -> Result<Frame, TransportError> {
        let off = ty & 0x04 != 0;
        let len = ty & 0x02 != 0;
        let fin = ty & 0x01 != 0;
        let id = self.get_var()?;
        let offset = if off { self.get_var()? } else { 0 };
        let data_len = if len {
            self.get_var()? as usize
        } else {
            self.buf.len()
        };
        let data = self.take_len(data_len)?;
        Ok(Frame::Stream(StreamFrame {
            id,
            offset,
            fin,
            data,
        }))
    }

    fn decode_ack(&mut self, ecn: bool) -> Result<Frame, TransportError> {
        let largest = self.get_var()?;
        let delay = self.get_var()?;
        let range_count = self.get_var()?;
        let first_ack_range = self.get_var()?;
        if first_ack_range > largest {
            return Err(invalid("ack first range exceeds largest acked"));
        }
        let mut ranges = Vec::with_capacity(range_count as usize);
        if range_count > 0 {
            // Mirrors `AckFrame::iter_ranges`'s walk so a frame this decoder
            // accepts can never later underflow there.
            let mut running = largest
                .checked_sub(first_ack_range)
                .and_then(|v| v.checked_sub(1))
                .ok_or_else(|| invalid("ack range underflow"))?;
            for _ in 0..range_count {
                let gap = self.get_var()?;
                let len = self.get_var()?;
                running = running
                    .checked_sub(gap + 1)
                    .ok_or_else(|| invalid("ack gap underflows past zero"))?;
                running = running
                    .checked_sub(len)
                    .ok_or_else(|| invalid("ack range length underflows past zero"))?;
                ranges.push((gap, len));
                running = running
                    .checked_sub(1)
                    .ok_or_else(|| invalid("ack range underflows past zero"))?;
            }
        }
        let ecn = if ecn {
            Some(EcnCounts {
                ect0: self.get_var()?,
                ect1: self.get_var()?,
                ce: self.get_var()?,
            })
        } else {
            None
        };
        Ok(Frame::Ack(AckFrame {
            largest,
            delay,
            first_ack_range,
            ranges,
            ecn,
        }))
    }

    fn decode_reset_stream(&mut self) -> Result<Frame, TransportError> {
        Ok(Frame::ResetStream {
            id: self.get_var()?,
            error_code: self.get_var()?,
            final_size: self.get_var()?,
        })
    }

    fn decode_stop_sending(&mut self) -> Result<Frame, TransportError> {
        Ok(Frame::StopSending {
            id: self.get_var()?,
            error_code: self.get_var()?,
        })
    }

    fn decode_crypto(&mut self) -> Result<Frame, TransportError> {
        let offset = self.get_var()?;
        let len = self.get_var()? as usize;
        let data = self.take_len(len)?;
        Ok(Frame::Crypto(CryptoFrame { offset, data }))
    }

    fn decode_new_token(&mut self) -> Result<Frame, TransportError> {
        let len = self.get_var()? as usize;
        let token = self.take_len(len)?;
        Ok(Frame::NewToken { token })
    }

    fn decode_max_stream_data(&mut self) -> Result<Frame, TransportError> {
        Ok(Frame::MaxStreamData {
            id: self.get_var()?,
            offset: self.get_var()?,
        })
    }

    fn decode_stream_data_blocked(&mut self) -> Result<Frame, TransportError> {
        Ok(Frame::StreamDataBlocked {
            id: self.get_var()?,
            offset: self.get_var()?,
        })
    }

    fn decode_new_connection_id(&mut self) -> Result<Frame, TransportError> {
        let sequence = self.get_var()?;
        let retire_prior_to = self.get_var()?;
        if retire_prior_to > sequence {
            return Err(invalid("new_connection_id retire_prior_to exceeds sequence_number"));
        }
        if self.buf.is_empty() {
            return Err(invalid("new_connection_id missing length byte"));
        }
        let len = self.buf[0] as usize;
        self.buf.advance(1);
        if len == 0 || len > ::cid::MAX_CID_SIZE {
            return Err(invalid("new_connection_id length out of range"));
        }
        let id_bytes = self.take_len(len)?;
        let id = ::cid::ConnectionId::new(&id_bytes);
        let token_bytes = self.take_len(16)?;
        let mut reset_token = [0u8; 16];
        reset_token.copy_from_slice(&token_bytes);
        Ok(Frame::NewConnectionId {
            sequence,
            retire_prior_to,
            id,
            reset_token,
        })
    }

    fn decode_path_token(&mut self) -> Result<[u8; 8], TransportError> {
        let bytes = self.take_len(8)?;
        let mut token = [0u8; 8];
        token.copy_from_slice(&bytes);
        Ok(token)
    }

    fn decode_connection_close(&mut self, is_application: bool) -> Result<Frame, TransportError> {
        let error_code = self.get_var()?;
        let frame_type = if is_application { None } else { Some(self.get_var()?) };
        let reason_len = self.get_var()? as usize;
        let reason = self.take_len(reason_len)?;
        Ok(Frame::ConnectionClose(ConnectionCloseFrame {
            is_application,
            error_code,
            frame_type,
            reason,
        }))
    }
}

/// Serializes `frame` onto `buf`.
pub fn encode(frame: &Frame, buf: &mut BytesMut) {
    match frame {
        Frame::Padding(run_length) => {
            for _ in 0..*run_length {
                buf.put_u8(0);
            }
        }
        Frame::Ping => buf.write_var(0x01),
        Frame::Ack(ack) => encode_ack(ack, buf),
        Frame::ResetStream {
            id,
            error_code,
            final_size,
        } => {
            buf.write_var(0x04);
            buf.write_var(*id);
            buf.write_var(*error_code);
            buf.write_var(*final_size);
        }
        Frame::StopSending { id, error_code } => {
            buf.write_var(0x05);
            buf.write_var(*id);
            buf.write_var(*error_code);
        }
        Frame::Crypto(crypto) => {
            buf.write_var(0x06);
            buf.write_var(crypto.offset);
            buf.write_var(crypto.data.len() as u64);
            buf.put_slice(&crypto.data);
        }
        Frame::NewToken { token } => {
            buf.write_var(0x07);
            buf.write_var(token.len() as u64);
            buf.put_slice(token);
        }
        Frame::Stream(s) => encode_stream(s, buf),
        Frame::MaxData(limit) => {
            buf.write_var(0x10);
            buf.write_var(*limit);
        }
        Frame::MaxStreamData { id, offset } => {
            buf.write_var(0x11);
            buf.write_var(*id);
            buf.write_var(*offset);
        }
        Frame::MaxStreams {
            directionality,
            count,
        } => {
            buf.write_var(if *directionality == Directionality::Bidi {
                0x12
            } else {
                0x13
            });
            buf.write_var(*count);
        }
        Frame::DataBlocked { offset } => {
            buf.write_var(0x14);
            buf.write_var(*offset);
        }
        Frame::StreamDataBlocked { id, offset } => {
            buf.write_var(0x15);
            buf.write_var(*id);
            buf.write_var(*offset);
        }
        Frame::StreamsBlocked {
            directionality,
            limit,
        } => {
            buf.write_var(if *directionality == Directionality::Bidi {
                0x16
            } else {
                0x17
            });
            buf.write_var(*limit);
        }
        Frame::NewConnectionId {
            sequence,
            retire_prior_to,
            id,
            reset_token,
        } => {
            buf.write_var(0x18);
            buf.write_var(*sequence);
            buf.write_var(*retire_prior_to);
            buf.write::<u8>(id.len() as u8);
            buf.put_slice(id);
            buf.put_slice(reset_token);
        }
        Frame::RetireConnectionId { sequence } => {
            buf.write_var(0x19);
            buf.write_var(*sequence);
        }
        Frame::PathChallenge { token } => {
            buf.write_var(0x1a);
            buf.put_slice(token);
        }
        Frame::PathResponse { token } => {
            buf.write_var(0x1b);
            buf.put_slice(token);
        }
        Frame::ConnectionClose(cc) => encode_connection_close(cc, buf),
        Frame::HandshakeDone => buf.write_var(0x1e),
        Frame::Message { data } => {
            buf.write_var(0x31);
            buf.write_var(data.len() as u64);
            buf.put_slice(data);
        }
        Frame::StopWaiting { least_unacked } => {
            // Legacy Google-QUIC wire code; a plain byte, not a varint.
            buf.write::<u8>(0x06);
            buf.write::<u64>(*least_unacked);
        }
        Frame::Goaway {
            error_code,
            last_good_stream_id,
            reason,
        } => {
            buf.write::<u8>(0x03);
            buf.write::<u32>(*error_code as u32);
            buf.write::<u32>(*last_good_stream_id as u32);
            buf.write::<u16>(reason.len() as u16);
            buf.put_slice(reason);
        }
    }
}

fn encode_stream(s: &StreamFrame, buf: &mut BytesMut) {
    let ty = 0x08 | 0x02 /* LEN always present on encode */ | if s.offset != 0 { 0x04 } else { 0 } | if s.fin { 0x01 } else { 0 };
    buf.write_var(ty);
    buf.write_var(s.id);
    if s.offset != 0 {
        buf.write_var(s.offset);
    }
    buf.write_var(s.data.len() as u64);
    buf.put_slice(&s.data);
}

fn encode_ack(ack: &AckFrame, buf: &mut BytesMut) {
    buf.write_var(if ack.ecn.is_some() { 0x03 } else { 0x02 });
    buf.write_var(ack.largest);
    buf.write_var(ack.delay);
    buf.write_var(ack.ranges.len() as u64);
    buf.write_var(ack.first_ack_range);
    for &(gap, len) in &ack.ranges {
        buf.write_var(gap);
        buf.write_var(len);
    }
    if let Some(ecn) = ack.ecn {
        buf.write_var(ecn.ect0);
        buf.write_var(ecn.ect1);
        buf.write_var(ecn.ce);
    }
}

/// Encodes an ACK frame, dropping the oldest (smallest-numbered) gaps first
/// if the full frame would not fit in `max_len` bytes (spec.md §4.C).
pub fn encode_ack_truncated(ack: &AckFrame, buf: &mut BytesMut, max_len: usize) {
    let mut trimmed = ack.clone();
    loop {
        let mut probe = BytesMut::new();
        encode_ack(&trimmed, &mut probe);
        if probe.len() <= max_len || trimmed.ranges.is_empty() {
            buf.unsplit(probe);
            return;
        }
        trimmed.ranges.pop();
    }
}

fn encode_connection_close(cc: &ConnectionCloseFrame, buf: &mut BytesMut) {
    buf.write_var(if cc.is_application { 0x1d } else { 0x1c });
    buf.write_var(cc.error_code);
    if let Some(frame_type) = cc.frame_type {
        buf.write_var(frame_type);
    }
    let reason = if cc.reason.len() > MAX_CLOSE_REASON_LEN {
        cc.reason.slice_to(MAX_CLOSE_REASON_LEN)
    } else {
        cc.reason.clone()
    };
    buf.write_var(reason.len() as u64);
    buf.put_slice(&reason);
}

/// Parses a legacy Google-QUIC `"<digits>:<text>"` close reason into its
/// extracted error code and trailing text, per spec.md §4.C / the original
/// `QuicErrorCodeToString`-adjacent wire convention. Returns the reason
/// unmodified if it doesn't match that shape.
pub fn parse_legacy_close_reason(reason: &[u8]) -> (Option<u64>, &[u8]) {
    let text = match ::std::str::from_utf8(reason) {
        Ok(s) => s,
        Err(_) => return (None, reason),
    };
    match text.find(':') {
        Some(idx) if text[..idx].bytes().all(|b| b.is_ascii_digit()) && idx > 0 => {
            match text[..idx].parse::<u64>() {
                Ok(code) => (Some(code), &reason[idx + 1..]),
                Err(_) => (None, reason),
            }
        }
        _ => (None, reason),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_raw_ping_and_padding_fixture() {
        // A PING frame followed by a run of two zero bytes, collapsed into
        // one PADDING frame carrying the run length, as a byte-for-byte
        // fixture rather than built via `encode`.
        let raw = hex!("01 00 00");
        let frames: Vec<_> = Iter::new(Bytes::from(&raw[..]), Dialect::IetfLengthPrefixed)
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(frames.len(), 2);
        assert!(matches!(frames[0], Frame::Ping));
        assert!(matches!(frames[1], Frame::Padding(2)));
    }

    #[test]
    fn padding_ping_roundtrip() {
        let mut buf = BytesMut::new();
        encode(&Frame::Padding(1), &mut buf);
        encode(&Frame::Ping, &mut buf);
        let frames: Vec<_> = Iter::new(buf.freeze(), Dialect::IetfLengthPrefixed)
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        assert!(matches!(frames[0], Frame::Padding(1)));
        assert!(matches!(frames[1], Frame::Ping));
    }

    #[test]
    fn stream_roundtrip() {
        let frame = Frame::Stream(StreamFrame {
            id: 4,
            offset: 16,
            fin: true,
            data: Bytes::from_static(b"hello"),
        });
        let mut buf = BytesMut::new();
        encode(&frame, &mut buf);
        let decoded: Vec<_> = Iter::new(buf.freeze(), Dialect::IetfLengthPrefixed)
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        match &decoded[0] {
            Frame::Stream(s) => {
                assert_eq!(s.id, 4);
                assert_eq!(s.offset, 16);
                assert!(s.fin);
                assert_eq!(&s.data[..], b"hello");
            }
            other => panic!("unexpected frame {:?}", other),
        }
    }

    #[test]
    fn ack_range_iteration() {
        let ack = AckFrame {
            largest: 100,
            delay: 0,
            first_ack_range: 4, // covers 96..=100
            ranges: vec![(1, 2)], // gap 1, len 2 -> covers one earlier range
            ecn: None,
        };
        let ranges: Vec<_> = ack.iter_ranges().collect();
        assert_eq!(ranges[0], (96, 100));
    }

    #[test]
    fn non_minimal_frame_type_is_protocol_violation() {
        // Encode PING (0x01) using a 2-byte varint instead of the minimal 1-byte form.
        let mut buf = BytesMut::new();
        buf.put_u16_be(0b01 << 14 | 0x01);
        let err = Iter::new(buf.freeze(), Dialect::IetfLengthPrefixed)
            .unwrap()
            .next()
            .unwrap()
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::IetfQuicProtocolViolation);
    }

    #[test]
    fn unknown_frame_type_is_invalid_frame_data() {
        let mut buf = BytesMut::new();
        buf.write_var(0x2f); // not in the recognised set, minimally encoded
        let err = Iter::new(buf.freeze(), Dialect::IetfLengthPrefixed)
            .unwrap()
            .next()
            .unwrap()
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidFrameData);
    }

    #[test]
    fn close_reason_truncated_to_max_len() {
        let reason = Bytes::from(vec![b'x'; MAX_CLOSE_REASON_LEN + 50]);
        let cc = ConnectionCloseFrame {
            is_application: true,
            error_code: 0,
            frame_type: None,
            reason,
        };
        let mut buf = BytesMut::new();
        encode_connection_close(&cc, &mut buf);
        let decoded: Vec<_> = Iter::new(buf.freeze(), Dialect::IetfLengthPrefixed)
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        match &decoded[0] {
            Frame::ConnectionClose(got) => assert_eq!(got.reason.len(), MAX_CLOSE_REASON_LEN),
            other => panic!("unexpected frame {:?}", other),
        }
    }

    #[test]
    fn legacy_close_reason_parses_leading_error_code() {
        let (code, text) = parse_legacy_close_reason(b"42:timeout");
        assert_eq!(code, Some(42));
        assert_eq!(text, b"timeout");
    }

    #[test]
    fn legacy_close_reason_without_digits_is_passthrough() {
        let (code, text) = parse_legacy_close_reason(b"plain reason");
        assert_eq!(code, None);
        assert_eq!(text, b"plain reason");
    }

    #[test]
    fn message_frame_roundtrips() {
        let frame = Frame::Message {
            data: Bytes::from_static(b"unreliable"),
        };
        let mut buf = BytesMut::new();
        encode(&frame, &mut buf);
        let decoded: Vec<_> = Iter::new(buf.freeze(), Dialect::IetfLengthPrefixed)
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        match &decoded[0] {
            Frame::Message { data } => assert_eq!(&data[..], b"unreliable"),
            other => panic!("unexpected frame {:?}", other),
        }
    }

    #[test]
    fn message_frame_without_length_consumes_rest_of_packet() {
        let mut buf = BytesMut::new();
        buf.write_var(0x30);
        buf.put_slice(b"rest");
        let decoded: Vec<_> = Iter::new(buf.freeze(), Dialect::IetfLengthPrefixed)
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        match &decoded[0] {
            Frame::Message { data } => assert_eq!(&data[..], b"rest"),
            other => panic!("unexpected frame {:?}", other),
        }
    }

    #[test]
    fn ack_with_first_range_equal_to_largest_is_accepted() {
        // A single block covering everything from 0 up to `largest`, with no
        // further ranges: must not be rejected even though a naive
        // implementation of the underflow check could trip on it.
        let mut buf = BytesMut::new();
        buf.write_var(0x02); // ACK, no ECN
        buf.write_var(5); // largest
        buf.write_var(0); // delay
        buf.write_var(0); // range_count
        buf.write_var(5); // first_ack_range == largest
        let decoded: Vec<_> = Iter::new(buf.freeze(), Dialect::IetfLengthPrefixed)
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        match &decoded[0] {
            Frame::Ack(ack) => assert_eq!(ack.iter_ranges().collect::<Vec<_>>(), vec![(0, 5)]),
            other => panic!("unexpected frame {:?}", other),
        }
    }

    #[test]
    fn ack_first_range_exceeding_largest_is_rejected() {
        let mut buf = BytesMut::new();
        buf.write_var(0x02);
        buf.write_var(5); // largest
        buf.write_var(0); // delay
        buf.write_var(0); // range_count
        buf.write_var(6); // first_ack_range > largest
        let err = Iter::new(buf.freeze(), Dialect::IetfLengthPrefixed)
            .unwrap()
            .next()
            .unwrap()
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidFrameData);
    }

    #[test]
    fn new_connection_id_with_retire_prior_to_above_sequence_is_rejected() {
        let mut buf = BytesMut::new();
        buf.write_var(0x18);
        buf.write_var(1); // sequence
        buf.write_var(2); // retire_prior_to > sequence
        buf.write::<u8>(8);
        buf.put_slice(&[0u8; 8]);
        buf.put_slice(&[0u8; 16]);
        let err = Iter::new(buf.freeze(), Dialect::IetfLengthPrefixed)
            .unwrap()
            .next()
            .unwrap()
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidFrameData);
    }

    #[test]
    fn legacy_stop_waiting_and_goaway_roundtrip() {
        let mut buf = BytesMut::new();
        encode(&Frame::StopWaiting { least_unacked: 42 }, &mut buf);
        encode(
            &Frame::Goaway {
                error_code: 7,
                last_good_stream_id: 9,
                reason: Bytes::from_static(b"bye"),
            },
            &mut buf,
        );
        let decoded: Vec<_> = Iter::new(buf.freeze(), Dialect::LegacyGoogle)
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        match &decoded[0] {
            Frame::StopWaiting { least_unacked } => assert_eq!(*least_unacked, 42),
            other => panic!("unexpected frame {:?}", other),
        }
        match &decoded[1] {
            Frame::Goaway {
                error_code,
                last_good_stream_id,
                reason,
            } => {
                assert_eq!(*error_code, 7);
                assert_eq!(*last_good_stream_id, 9);
                assert_eq!(&reason[..], b"bye");
            }
            other => panic!("unexpected frame {:?}", other),
        }
    }

    #[test]
    fn legacy_ack_decodes_distinct_bitfield_shape() {
        let mut buf = BytesMut::new();
        buf.write::<u8>(0x40); // ACK, no additional blocks
        buf.write::<u32>(10); // largest
        buf.write::<u16>(0); // delay
        buf.write::<u16>(10); // first_ack_range == largest
        let decoded: Vec<_> = Iter::new(buf.freeze(), Dialect::LegacyGoogle)
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        match &decoded[0] {
            Frame::Ack(ack) => {
                assert_eq!(ack.largest, 10);
                assert_eq!(ack.first_ack_range, 10);
                assert!(ack.ranges.is_empty());
            }
            other => panic!("unexpected frame {:?}", other),
        }
    }

    #[test]
    fn legacy_stream_high_bit_marks_frame_type() {
        let mut buf = BytesMut::new();
        buf.write::<u8>(0x80 | 0x01); // STREAM, FIN set, no explicit offset/length
        buf.write::<u32>(3); // stream id
        buf.put_slice(b"hi");
        let decoded: Vec<_> = Iter::new(buf.freeze(), Dialect::LegacyGoogle)
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        match &decoded[0] {
            Frame::Stream(s) => {
                assert_eq!(s.id, 3);
                assert!(s.fin);
                assert_eq!(&s.data[..], b"hi");
            }
            other => panic!("unexpected frame {:?}", other),
        }
    }
}
