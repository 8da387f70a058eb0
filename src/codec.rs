//! Self-describing little-endian binary codec (C1).
//!
//! Every encoded buffer starts with a 4-byte total length (inclusive of the
//! header itself). Decoding refuses to read past that length.

use crate::error::{Error, Result};
use byteorder::{ByteOrder, LittleEndian};

/// Growable little-endian write buffer. The first four bytes are reserved
/// for the total length and patched in on [`Encoder::finish`].
pub struct Encoder {
    buf: Vec<u8>,
}

impl Default for Encoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Encoder {
    pub fn new() -> Self {
        let mut buf = Vec::with_capacity(256);
        buf.extend_from_slice(&[0u8; 4]);
        Encoder { buf }
    }

    pub fn write_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub fn write_bool(&mut self, v: bool) {
        self.buf.push(if v { 1 } else { 0 });
    }

    pub fn write_u32(&mut self, v: u32) {
        let mut tmp = [0u8; 4];
        LittleEndian::write_u32(&mut tmp, v);
        self.buf.extend_from_slice(&tmp);
    }

    pub fn write_u64(&mut self, v: u64) {
        let mut tmp = [0u8; 8];
        LittleEndian::write_u64(&mut tmp, v);
        self.buf.extend_from_slice(&tmp);
    }

    pub fn write_i64(&mut self, v: i64) {
        let mut tmp = [0u8; 8];
        LittleEndian::write_i64(&mut tmp, v);
        self.buf.extend_from_slice(&tmp);
    }

    pub fn write_f64(&mut self, v: f64) {
        let mut tmp = [0u8; 8];
        LittleEndian::write_f64(&mut tmp, v);
        self.buf.extend_from_slice(&tmp);
    }

    pub fn write_bytes(&mut self, v: &[u8]) {
        self.write_u32(v.len() as u32);
        self.buf.extend_from_slice(v);
    }

    pub fn write_string(&mut self, v: &str) {
        self.write_bytes(v.as_bytes());
    }

    pub fn write_time_unix_nanos(&mut self, v: i64) {
        self.write_i64(v);
    }

    pub fn write_i64_array(&mut self, v: &[i64]) {
        self.write_u32(v.len() as u32);
        for x in v {
            self.write_i64(*x);
        }
    }

    pub fn write_encodable<T: Encode>(&mut self, v: &T) {
        v.encode(self);
    }

    /// Patch the length header and return the finished buffer.
    pub fn finish(mut self) -> Vec<u8> {
        let len = self.buf.len() as u32;
        LittleEndian::write_u32(&mut self.buf[0..4], len);
        self.buf
    }
}

/// Cursor-style reader over a buffer produced by [`Encoder`]. The 4-byte
/// length header is consumed on construction and used to bound every read.
pub struct Decoder<'a> {
    buf: &'a [u8],
    pos: usize,
    total_len: usize,
}

impl<'a> Decoder<'a> {
    pub fn new(buf: &'a [u8]) -> Result<Self> {
        if buf.len() < 4 {
            return Err(Error::Truncated);
        }
        let total_len = LittleEndian::read_u32(&buf[0..4]) as usize;
        if total_len > buf.len() {
            return Err(Error::Truncated);
        }
        Ok(Decoder {
            buf,
            pos: 4,
            total_len,
        })
    }

    fn need(&self, n: usize) -> Result<()> {
        if self.pos + n > self.total_len {
            return Err(Error::Truncated);
        }
        Ok(())
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        self.need(1)?;
        let v = self.buf[self.pos];
        self.pos += 1;
        Ok(v)
    }

    pub fn read_bool(&mut self) -> Result<bool> {
        Ok(self.read_u8()? != 0)
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        self.need(4)?;
        let v = LittleEndian::read_u32(&self.buf[self.pos..self.pos + 4]);
        self.pos += 4;
        Ok(v)
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        self.need(8)?;
        let v = LittleEndian::read_u64(&self.buf[self.pos..self.pos + 8]);
        self.pos += 8;
        Ok(v)
    }

    pub fn read_i64(&mut self) -> Result<i64> {
        self.need(8)?;
        let v = LittleEndian::read_i64(&self.buf[self.pos..self.pos + 8]);
        self.pos += 8;
        Ok(v)
    }

    pub fn read_f64(&mut self) -> Result<f64> {
        self.need(8)?;
        let v = LittleEndian::read_f64(&self.buf[self.pos..self.pos + 8]);
        self.pos += 8;
        Ok(v)
    }

    pub fn read_bytes(&mut self) -> Result<Vec<u8>> {
        let len = self.read_u32()? as usize;
        self.need(len)?;
        let v = self.buf[self.pos..self.pos + len].to_vec();
        self.pos += len;
        Ok(v)
    }

    pub fn read_string(&mut self) -> Result<String> {
        let bytes = self.read_bytes()?;
        String::from_utf8(bytes).map_err(|e| Error::Unknown(e.to_string()))
    }

    pub fn read_time_unix_nanos(&mut self) -> Result<i64> {
        self.read_i64()
    }

    pub fn read_i64_array(&mut self) -> Result<Vec<i64>> {
        let count = self.read_u32()? as usize;
        let mut out = Vec::with_capacity(count);
        for _ in 0..count {
            out.push(self.read_i64()?);
        }
        Ok(out)
    }

    pub fn read_decodable<T: Decode>(&mut self) -> Result<T> {
        T::decode(self)
    }
}

pub trait Encode {
    fn encode(&self, buf: &mut Encoder);

    fn encode_to_vec(&self) -> Vec<u8> {
        let mut e = Encoder::new();
        self.encode(&mut e);
        e.finish()
    }
}

pub trait Decode: Sized {
    fn decode(buf: &mut Decoder) -> Result<Self>;

    fn decode_from_slice(buf: &[u8]) -> Result<Self> {
        let mut d = Decoder::new(buf)?;
        Self::decode(&mut d)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn primitives_round_trip() {
        let mut e = Encoder::new();
        e.write_u8(7);
        e.write_bool(true);
        e.write_u32(0xDEADBEEF);
        e.write_u64(0x1122334455667788);
        e.write_i64(-42);
        e.write_f64(3.5);
        e.write_string("hello");
        e.write_i64_array(&[1, 2, 3]);
        let buf = e.finish();

        let mut d = Decoder::new(&buf).unwrap();
        assert_eq!(d.read_u8().unwrap(), 7);
        assert!(d.read_bool().unwrap());
        assert_eq!(d.read_u32().unwrap(), 0xDEADBEEF);
        assert_eq!(d.read_u64().unwrap(), 0x1122334455667788);
        assert_eq!(d.read_i64().unwrap(), -42);
        assert_eq!(d.read_f64().unwrap(), 3.5);
        assert_eq!(d.read_string().unwrap(), "hello");
        assert_eq!(d.read_i64_array().unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn truncated_buffer_fails_cleanly() {
        let mut e = Encoder::new();
        e.write_string("longer than the truncation point");
        let mut buf = e.finish();
        buf.truncate(6);
        // length header now lies about available bytes
        let err = Decoder::new(&buf);
        assert!(err.is_err());
    }

    #[test]
    fn short_header_fails() {
        let buf = [0u8, 1, 2];
        assert!(matches!(Decoder::new(&buf), Err(Error::Truncated)));
    }
}
