//! Wire-level primitives shared by every other module: fixed-width integer
//! get/put helpers and the QUIC variable-length integer ("varint-62")
//! encoding (RFC 9000 §16).

use byteorder::{BigEndian, ByteOrder};
use bytes::{Buf, BufMut};
use std::io;

/// Extends `bytes::Buf` with QUIC-specific decoders.
pub trait BufExt {
    /// Reads a fixed-width big-endian integer, failing if not enough bytes remain.
    fn get<T: Codable>(&mut self) -> Result<T, UnexpectedEnd>;
    /// Reads a varint-62. Returns `None` on truncation.
    fn get_var(&mut self) -> Result<u64, UnexpectedEnd>;
}

/// Extends `bytes::BufMut` with QUIC-specific encoders.
pub trait BufMutExt {
    /// Writes a fixed-width big-endian integer.
    fn write<T: Codable>(&mut self, value: T);
    /// Writes `value` using the shortest varint-62 encoding that represents it.
    fn write_var(&mut self, value: u64);
}

impl<B: Buf> BufExt for B {
    fn get<T: Codable>(&mut self) -> Result<T, UnexpectedEnd> {
        T::get(self)
    }

    fn get_var(&mut self) -> Result<u64, UnexpectedEnd> {
        if !self.has_remaining() {
            return Err(UnexpectedEnd);
        }
        let mut buf = [0; 8];
        buf[0] = self.bytes()[0];
        let tag = buf[0] >> 6;
        let len = 1usize << tag;
        if self.remaining() < len {
            return Err(UnexpectedEnd);
        }
        self.copy_to_slice(&mut buf[..len]);
        buf[0] &= 0b0011_1111;
        let value = match len {
            1 => u64::from(buf[0]),
            2 => u64::from(BigEndian::read_u16(&buf[..2])),
            4 => u64::from(BigEndian::read_u32(&buf[..4])),
            8 => BigEndian::read_u64(&buf[..8]),
            _ => unreachable!(),
        };
        Ok(value)
    }
}

impl<B: BufMut> BufMutExt for B {
    fn write<T: Codable>(&mut self, value: T) {
        value.put(self)
    }

    fn write_var(&mut self, value: u64) {
        if value <= 63 {
            self.put_u8(value as u8);
        } else if value <= 0x3fff {
            self.put_u16_be(0b01 << 14 | value as u16);
        } else if value <= 0x3fff_ffff {
            self.put_u32_be(0b10 << 30 | value as u32);
        } else if value <= 0x3fff_ffff_ffff_ffff {
            self.put_u64_be(0b11 << 62 | value);
        } else {
            panic!("value too large for varint-62 encoding: {}", value);
        }
    }
}

/// The number of bytes `write_var` would emit for `value`.
pub fn var_len(value: u64) -> usize {
    if value <= 63 {
        1
    } else if value <= 0x3fff {
        2
    } else if value <= 0x3fff_ffff {
        4
    } else if value <= 0x3fff_ffff_ffff_ffff {
        8
    } else {
        panic!("value too large for varint-62 encoding: {}", value);
    }
}

/// Fixed-width wire types `BufExt`/`BufMutExt` can move in and out of a buffer.
pub trait Codable: Sized {
    fn get<B: Buf>(buf: &mut B) -> Result<Self, UnexpectedEnd>;
    fn put<B: BufMut>(self, buf: &mut B);
}

macro_rules! impl_codable {
    ($t:ty, $size:expr, $get:ident, $put:ident) => {
        impl Codable for $t {
            fn get<B: Buf>(buf: &mut B) -> Result<Self, UnexpectedEnd> {
                if buf.remaining() < $size {
                    return Err(UnexpectedEnd);
                }
                Ok(buf.$get())
            }
            fn put<B: BufMut>(self, buf: &mut B) {
                buf.$put(self)
            }
        }
    };
}

impl_codable!(u8, 1, get_u8, put_u8);
impl_codable!(u16, 2, get_u16_be, put_u16_be);
impl_codable!(u32, 4, get_u32_be, put_u32_be);
impl_codable!(u64, 8, get_u64_be, put_u64_be);

/// Signalled whenever a decoder runs out of input bytes mid-field.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct UnexpectedEnd;

impl ::std::fmt::Display for UnexpectedEnd {
    fn fmt(&self, f: &mut ::std::fmt::Formatter) -> ::std::fmt::Result {
        write!(f, "unexpected end of buffer")
    }
}

impl ::std::error::Error for UnexpectedEnd {}

impl From<UnexpectedEnd> for io::Error {
    fn from(_: UnexpectedEnd) -> io::Error {
        io::Error::new(io::ErrorKind::UnexpectedEof, "unexpected end of buffer")
    }
}


/// Whether `value` was encoded in the shortest possible varint-62 form.
///
/// Some callers need this outside of decoding a specific field (for example
/// frame-type minimality checks, which must know both the decoded value and
/// the number of bytes actually consumed).
pub fn is_minimal_encoding(value: u64, encoded_len: usize) -> bool {
    var_len(value) == encoded_len
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::{Buf, BytesMut};

    #[test]
    fn roundtrip_varint() {
        for &v in &[0u64, 1, 63, 64, 0x3fff, 0x4000, 0x3fff_ffff, 0x4000_0000, 0x3fff_ffff_ffff_ffff] {
            let mut buf = Vec::new();
            buf.write_var(v);
            assert_eq!(buf.len(), var_len(v));
            let mut rdr = ::std::io::Cursor::new(buf);
            assert_eq!(rdr.get_var().unwrap(), v);
        }
    }

    #[test]
    fn varint_truncated() {
        let mut buf = Vec::new();
        buf.write_var(0x3fff_ffff);
        buf.truncate(2);
        let mut rdr = ::std::io::Cursor::new(buf);
        assert!(rdr.get_var().is_err());
    }

    #[test]
    fn minimal_encoding_detection() {
        assert!(is_minimal_encoding(37, 1));
        assert!(!is_minimal_encoding(37, 2));
    }

    #[test]
    fn fixed_width_roundtrip() {
        let mut buf = BytesMut::new();
        buf.write::<u32>(0xdead_beef);
        let mut rdr = ::std::io::Cursor::new(buf.to_vec());
        let value: u32 = rdr.get().unwrap();
        assert_eq!(value, 0xdead_beef);
        assert!(!rdr.has_remaining());
    }
}
