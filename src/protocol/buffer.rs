//! Framed message I/O (spec §4.1).
//!
//! A message on the wire is `{type: u8, length: u32 big-endian,
//! payload[length-4]}` — the length field counts itself but not the type
//! byte. [`BufferWriter`] accumulates payload bytes and patches the length
//! prefix on [`BufferWriter::end_message`]; [`BufferReader`] exposes typed
//! pops over an already-framed, in-memory payload slice. Pulling bytes off
//! the socket and bounding a [`BufferReader`] to one frame is the job of
//! [`crate::connection::FrameReader`] — this module only knows about
//! already-buffered bytes, the same split the teacher draws between
//! `TagStructReader`/`Writer` (pure parsing) and `reactor.rs::recv`
//! (socket filling).

use byteorder::{BigEndian, ByteOrder};
use bytes::{BufMut, BytesMut};
use uuid::Uuid;

use crate::error::Error;

/// A cursor over one already-length-delimited message payload.
pub struct BufferReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> BufferReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        BufferReader { data, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], Error> {
        if self.remaining() < n {
            return Err(Error::BinaryProtocol(format!(
                "short read: wanted {n} bytes, {} remaining",
                self.remaining()
            )));
        }

        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub fn pop_u8(&mut self) -> Result<u8, Error> {
        Ok(self.take(1)?[0])
    }

    pub fn pop_bool(&mut self) -> Result<bool, Error> {
        Ok(self.pop_u8()? != 0)
    }

    pub fn pop_u16(&mut self) -> Result<u16, Error> {
        Ok(BigEndian::read_u16(self.take(2)?))
    }

    pub fn pop_u32(&mut self) -> Result<u32, Error> {
        Ok(BigEndian::read_u32(self.take(4)?))
    }

    pub fn pop_i32(&mut self) -> Result<i32, Error> {
        Ok(BigEndian::read_i32(self.take(4)?))
    }

    pub fn pop_u64(&mut self) -> Result<u64, Error> {
        Ok(BigEndian::read_u64(self.take(8)?))
    }

    pub fn pop_i64(&mut self) -> Result<i64, Error> {
        Ok(BigEndian::read_i64(self.take(8)?))
    }

    /// Raw sub-slice of exactly `n` bytes, without any length prefix.
    pub fn pop_bytes(&mut self, n: usize) -> Result<&'a [u8], Error> {
        self.take(n)
    }

    /// A `u32`-length-prefixed byte string.
    pub fn pop_len_prefixed_bytes(&mut self) -> Result<&'a [u8], Error> {
        let len = self.pop_u32()? as usize;
        self.take(len)
    }

    /// A `u32`-length-prefixed UTF-8 string.
    pub fn pop_string(&mut self) -> Result<&'a str, Error> {
        let bytes = self.pop_len_prefixed_bytes()?;
        std::str::from_utf8(bytes)
            .map_err(|e| Error::BinaryProtocol(format!("invalid utf-8 in string: {e}")))
    }

    pub fn pop_uuid(&mut self) -> Result<Uuid, Error> {
        let bytes = self.take(16)?;
        Ok(Uuid::from_slice(bytes).expect("slice is exactly 16 bytes"))
    }

    /// A length-prefixed (via explicit `len`) sub-reader, for the
    /// explicit length-prefixed sub-slices descriptors are made of (spec
    /// §4.2) — guarantees the decoder can never read past the bounds it
    /// was handed.
    pub fn sub_reader(&mut self, len: usize) -> Result<BufferReader<'a>, Error> {
        Ok(BufferReader::new(self.take(len)?))
    }

    /// A sub-reader bounded by a leading `u32` length prefix.
    pub fn pop_len_prefixed_reader(&mut self) -> Result<BufferReader<'a>, Error> {
        let len = self.pop_u32()? as usize;
        self.sub_reader(len)
    }
}

/// Accumulates one outgoing framed message at a time.
#[derive(Default)]
pub struct BufferWriter {
    buf: BytesMut,
    /// Offset of the length-prefix field for the in-progress message.
    length_at: Option<usize>,
}

impl BufferWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Writes the type byte and reserves space for the length prefix.
    pub fn begin_message(&mut self, msg_type: u8) {
        debug_assert!(self.length_at.is_none(), "previous message not ended");

        self.buf.put_u8(msg_type);
        self.length_at = Some(self.buf.len());
        self.buf.put_u32(0); // patched in `end_message`
    }

    /// Patches the length prefix written by `begin_message` to cover
    /// everything written since (including the 4-byte length field
    /// itself, per the wire format).
    pub fn end_message(&mut self) {
        let at = self.length_at.take().expect("no message in progress");
        let length = (self.buf.len() - at) as u32;
        BigEndian::write_u32(&mut self.buf[at..at + 4], length);
    }

    pub fn write_u8(&mut self, v: u8) {
        self.buf.put_u8(v);
    }

    pub fn write_bool(&mut self, v: bool) {
        self.buf.put_u8(v as u8);
    }

    pub fn write_u16(&mut self, v: u16) {
        self.buf.put_u16(v);
    }

    pub fn write_u32(&mut self, v: u32) {
        self.buf.put_u32(v);
    }

    pub fn write_i32(&mut self, v: i32) {
        self.buf.put_i32(v);
    }

    pub fn write_u64(&mut self, v: u64) {
        self.buf.put_u64(v);
    }

    pub fn write_i64(&mut self, v: i64) {
        self.buf.put_i64(v);
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.buf.put_slice(bytes);
    }

    pub fn write_len_prefixed_bytes(&mut self, bytes: &[u8]) {
        self.write_u32(bytes.len() as u32);
        self.write_bytes(bytes);
    }

    pub fn write_string(&mut self, s: &str) {
        self.write_len_prefixed_bytes(s.as_bytes());
    }

    pub fn write_uuid(&mut self, id: &Uuid) {
        self.write_bytes(id.as_bytes());
    }

    /// The accumulated bytes, ready to be written to the socket in one
    /// shot.
    pub fn finish(self) -> BytesMut {
        debug_assert!(self.length_at.is_none(), "message not ended");
        self.buf
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_scalars() {
        let mut w = BufferWriter::new();
        w.begin_message(b'Z');
        w.write_u8(7);
        w.write_u32(0xdead_beef);
        w.write_string("hello");
        w.write_bool(true);
        w.end_message();

        let buf = w.finish();
        assert_eq!(buf[0], b'Z');

        let length = BigEndian::read_u32(&buf[1..5]);
        assert_eq!(length as usize, buf.len() - 1);

        let mut r = BufferReader::new(&buf[5..]);
        assert_eq!(r.pop_u8().unwrap(), 7);
        assert_eq!(r.pop_u32().unwrap(), 0xdead_beef);
        assert_eq!(r.pop_string().unwrap(), "hello");
        assert!(r.pop_bool().unwrap());
        assert!(r.is_empty());
    }

    #[test]
    fn short_read_is_a_binary_protocol_error() {
        let mut r = BufferReader::new(&[0, 1]);
        let err = r.pop_u32().unwrap_err();
        assert!(matches!(err, Error::BinaryProtocol(_)));
    }

    #[test]
    fn sub_reader_cannot_escape_its_bound() {
        let data = [1, 2, 3, 4, 5, 6];
        let mut r = BufferReader::new(&data);
        let mut sub = r.sub_reader(3).unwrap();
        assert_eq!(sub.pop_u8().unwrap(), 1);
        assert_eq!(sub.pop_u8().unwrap(), 2);
        assert_eq!(sub.pop_u8().unwrap(), 3);
        assert!(sub.pop_u8().is_err());

        // The outer reader resumes right after the sub-slice.
        assert_eq!(r.pop_u8().unwrap(), 4);
    }

    #[test]
    fn uuid_roundtrip() {
        let id = Uuid::new_v4();
        let mut w = BufferWriter::new();
        w.write_uuid(&id);
        let buf = w.finish();

        let mut r = BufferReader::new(&buf);
        assert_eq!(r.pop_uuid().unwrap(), id);
    }
}
