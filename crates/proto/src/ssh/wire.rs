//! SSH data type encoding (RFC 4251 Section 5).
//!
//! [`Writer`] builds payloads on top of [`bytes::BytesMut`]; [`Reader`] walks a
//! received payload with bounds checks on every field.

use bytes::{BufMut, BytesMut};
use tether_platform::{TetherError, TetherResult};

/// Payload builder.
#[derive(Debug, Default)]
pub struct Writer {
    buf: BytesMut,
}

impl Writer {
    /// Creates an empty writer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts a payload with its message number.
    pub fn message(msg: u8) -> Self {
        let mut w = Self::new();
        w.buf.put_u8(msg);
        w
    }

    /// Appends a byte.
    pub fn u8(mut self, value: u8) -> Self {
        self.buf.put_u8(value);
        self
    }

    /// Appends a boolean.
    pub fn bool(self, value: bool) -> Self {
        self.u8(value as u8)
    }

    /// Appends a big-endian u32.
    pub fn u32(mut self, value: u32) -> Self {
        self.buf.put_u32(value);
        self
    }

    /// Appends a big-endian u64.
    pub fn u64(mut self, value: u64) -> Self {
        self.buf.put_u64(value);
        self
    }

    /// Appends a length-prefixed byte string.
    pub fn bytes(mut self, value: &[u8]) -> Self {
        self.buf.put_u32(value.len() as u32);
        self.buf.put_slice(value);
        self
    }

    /// Appends a length-prefixed UTF-8 string.
    pub fn string(self, value: &str) -> Self {
        self.bytes(value.as_bytes())
    }

    /// Appends a comma-joined name-list.
    pub fn name_list<S: AsRef<str>>(self, names: &[S]) -> Self {
        let joined = names
            .iter()
            .map(|n| n.as_ref())
            .collect::<Vec<_>>()
            .join(",");
        self.string(&joined)
    }

    /// Appends raw bytes with no length prefix.
    pub fn raw(mut self, value: &[u8]) -> Self {
        self.buf.put_slice(value);
        self
    }

    /// Returns the encoded payload.
    pub fn finish(self) -> Vec<u8> {
        self.buf.to_vec()
    }
}

/// Bounds-checked payload reader.
#[derive(Debug, Clone)]
pub struct Reader<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> Reader<'a> {
    /// Wraps a payload.
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, offset: 0 }
    }

    /// Wraps a payload and checks its message number.
    pub fn expect(data: &'a [u8], msg: u8) -> TetherResult<Self> {
        let mut reader = Self::new(data);
        let found = reader.u8()?;
        if found != msg {
            return Err(TetherError::protocol(format!(
                "expected message {}, got {}",
                msg, found
            )));
        }
        Ok(reader)
    }

    fn take(&mut self, len: usize) -> TetherResult<&'a [u8]> {
        if self.data.len() - self.offset < len {
            return Err(TetherError::protocol(format!(
                "message truncated: need {} bytes at offset {}",
                len, self.offset
            )));
        }
        let slice = &self.data[self.offset..self.offset + len];
        self.offset += len;
        Ok(slice)
    }

    /// Reads a byte.
    pub fn u8(&mut self) -> TetherResult<u8> {
        Ok(self.take(1)?[0])
    }

    /// Reads a boolean.
    pub fn bool(&mut self) -> TetherResult<bool> {
        Ok(self.u8()? != 0)
    }

    /// Reads a big-endian u32.
    pub fn u32(&mut self) -> TetherResult<u32> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Reads a big-endian u64.
    pub fn u64(&mut self) -> TetherResult<u64> {
        let hi = self.u32()? as u64;
        let lo = self.u32()? as u64;
        Ok((hi << 32) | lo)
    }

    /// Reads a length-prefixed byte string.
    pub fn bytes(&mut self) -> TetherResult<&'a [u8]> {
        let len = self.u32()? as usize;
        self.take(len)
    }

    /// Reads a length-prefixed string, replacing invalid UTF-8.
    pub fn string(&mut self) -> TetherResult<String> {
        Ok(String::from_utf8_lossy(self.bytes()?).into_owned())
    }

    /// Reads a length-prefixed string that must be valid UTF-8.
    pub fn utf8(&mut self) -> TetherResult<String> {
        String::from_utf8(self.bytes()?.to_vec())
            .map_err(|_| TetherError::protocol("string contains invalid UTF-8"))
    }

    /// Reads a name-list.
    pub fn name_list(&mut self) -> TetherResult<Vec<String>> {
        let joined = self.utf8()?;
        if joined.is_empty() {
            return Ok(Vec::new());
        }
        Ok(joined.split(',').map(str::to_string).collect())
    }

    /// Fixed-size raw bytes.
    pub fn raw(&mut self, len: usize) -> TetherResult<&'a [u8]> {
        self.take(len)
    }

    /// Bytes left unread.
    pub fn remaining(&self) -> usize {
        self.data.len() - self.offset
    }

    /// Unread tail of the payload.
    pub fn rest(&self) -> &'a [u8] {
        &self.data[self.offset..]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_writer_layout() {
        let payload = Writer::message(94).u32(7).string("hi").bool(true).finish();
        assert_eq!(payload, vec![94, 0, 0, 0, 7, 0, 0, 0, 2, b'h', b'i', 1]);
    }

    #[test]
    fn test_reader_fields() {
        let payload = Writer::message(5)
            .string("ssh-userauth")
            .u64(1 << 40)
            .name_list(&["a", "b"])
            .finish();
        let mut r = Reader::expect(&payload, 5).unwrap();
        assert_eq!(r.utf8().unwrap(), "ssh-userauth");
        assert_eq!(r.u64().unwrap(), 1 << 40);
        assert_eq!(r.name_list().unwrap(), vec!["a", "b"]);
        assert_eq!(r.remaining(), 0);
    }

    #[test]
    fn test_reader_truncated_string() {
        let payload = [0u8, 0, 0, 9, b'x'];
        let mut r = Reader::new(&payload);
        assert!(r.bytes().is_err());
    }

    #[test]
    fn test_reader_wrong_message() {
        assert!(Reader::expect(&[6], 5).is_err());
    }

    #[test]
    fn test_empty_name_list() {
        let payload = Writer::new().string("").finish();
        assert!(Reader::new(&payload).name_list().unwrap().is_empty());
    }
}
