//! Wire primitives: unsigned varints, length-prefixed arrays and strings
//!
//! `Reader` is a cursor over a borrowed buffer. It never consumes bytes from
//! the underlying buffer itself; the caller decides how far to advance once a
//! whole step has decoded, which is what makes partial reads replay safe.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::DecodeError;

const MAX_VINT_BYTES: usize = 5;
const MAX_VLONG_BYTES: usize = 10;

/// Cursor over a byte slice
#[derive(Debug)]
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Bytes consumed so far
    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn read_u8(&mut self) -> Result<u8, DecodeError> {
        let byte = *self.buf.get(self.pos).ok_or(DecodeError::Incomplete)?;
        self.pos += 1;
        Ok(byte)
    }

    pub fn read_bool(&mut self) -> Result<bool, DecodeError> {
        Ok(self.read_u8()? != 0)
    }

    pub fn read_u16(&mut self) -> Result<u16, DecodeError> {
        let bytes = self.read_bytes(2)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    pub fn read_i64(&mut self) -> Result<i64, DecodeError> {
        let bytes = self.read_bytes(8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(bytes);
        Ok(i64::from_be_bytes(raw))
    }

    pub fn read_vint(&mut self) -> Result<u32, DecodeError> {
        let mut result: u32 = 0;
        for i in 0..MAX_VINT_BYTES {
            let byte = self.read_u8()?;
            result |= u32::from(byte & 0x7F) << (7 * i);
            if byte & 0x80 == 0 {
                return Ok(result);
            }
        }
        Err(DecodeError::VarIntOverflow)
    }

    pub fn read_vlong(&mut self) -> Result<u64, DecodeError> {
        let mut result: u64 = 0;
        for i in 0..MAX_VLONG_BYTES {
            let byte = self.read_u8()?;
            result |= u64::from(byte & 0x7F) << (7 * i);
            if byte & 0x80 == 0 {
                return Ok(result);
            }
        }
        Err(DecodeError::VarIntOverflow)
    }

    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], DecodeError> {
        if self.remaining() < len {
            return Err(DecodeError::Incomplete);
        }
        let slice = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    /// Length-prefixed byte array
    pub fn read_array(&mut self) -> Result<Bytes, DecodeError> {
        let len = self.read_vint()? as usize;
        Ok(Bytes::copy_from_slice(self.read_bytes(len)?))
    }

    /// Length-prefixed UTF-8 string
    pub fn read_string(&mut self) -> Result<String, DecodeError> {
        let len = self.read_vint()? as usize;
        let bytes = self.read_bytes(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| DecodeError::InvalidUtf8)
    }
}

pub fn write_vint(buf: &mut BytesMut, mut value: u32) {
    while value & !0x7F != 0 {
        buf.put_u8(((value & 0x7F) | 0x80) as u8);
        value >>= 7;
    }
    buf.put_u8(value as u8);
}

pub fn write_vlong(buf: &mut BytesMut, mut value: u64) {
    while value & !0x7F != 0 {
        buf.put_u8(((value & 0x7F) | 0x80) as u8);
        value >>= 7;
    }
    buf.put_u8(value as u8);
}

pub fn write_array(buf: &mut BytesMut, bytes: &[u8]) {
    write_vint(buf, bytes.len() as u32);
    buf.put_slice(bytes);
}

pub fn write_string(buf: &mut BytesMut, value: &str) {
    write_array(buf, value.as_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vint_encoding() {
        let mut buf = BytesMut::new();
        write_vint(&mut buf, 0);
        write_vint(&mut buf, 127);
        write_vint(&mut buf, 128);
        write_vint(&mut buf, 300);
        assert_eq!(&buf[..], &[0x00, 0x7F, 0x80, 0x01, 0xAC, 0x02]);

        let mut reader = Reader::new(&buf);
        assert_eq!(reader.read_vint().unwrap(), 0);
        assert_eq!(reader.read_vint().unwrap(), 127);
        assert_eq!(reader.read_vint().unwrap(), 128);
        assert_eq!(reader.read_vint().unwrap(), 300);
        assert_eq!(reader.remaining(), 0);
    }

    #[test]
    fn test_negative_topology_id_as_vint() {
        let mut buf = BytesMut::new();
        write_vint(&mut buf, -1i32 as u32);
        assert_eq!(buf.len(), 5);

        let mut reader = Reader::new(&buf);
        assert_eq!(reader.read_vint().unwrap() as i32, -1);
    }

    #[test]
    fn test_incomplete_input() {
        let mut reader = Reader::new(&[0x80]);
        assert_eq!(reader.read_vint(), Err(DecodeError::Incomplete));

        let mut reader = Reader::new(&[0x05, b'a', b'b']);
        assert_eq!(reader.read_array(), Err(DecodeError::Incomplete));

        let mut reader = Reader::new(&[0x00]);
        assert_eq!(reader.read_u16(), Err(DecodeError::Incomplete));
    }

    #[test]
    fn test_vint_overflow() {
        let mut reader = Reader::new(&[0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0x01]);
        assert_eq!(reader.read_vint(), Err(DecodeError::VarIntOverflow));
    }

    #[test]
    fn test_string_and_array() {
        let mut buf = BytesMut::new();
        write_string(&mut buf, "default");
        write_array(&mut buf, &[1, 2, 3]);
        buf.put_u16(11222);
        buf.put_i64(-42);

        let mut reader = Reader::new(&buf);
        assert_eq!(reader.read_string().unwrap(), "default");
        assert_eq!(&reader.read_array().unwrap()[..], &[1, 2, 3]);
        assert_eq!(reader.read_u16().unwrap(), 11222);
        assert_eq!(reader.read_i64().unwrap(), -42);
    }

    #[test]
    fn test_invalid_utf8() {
        let mut reader = Reader::new(&[0x02, 0xC3, 0x28]);
        assert_eq!(reader.read_string(), Err(DecodeError::InvalidUtf8));
    }
}
