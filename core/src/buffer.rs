// Byte-buffer interface for the wire codec (big-endian)
use bytes::{BufMut, BytesMut};

use crate::codec::DecodeError;

/// Positional read access to an encoded frame.
pub trait ReadBuffer {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn get_bytes(&self, start: usize, end: usize) -> Result<&[u8], DecodeError>;

    fn get_byte(&self, pos: usize) -> Result<u8, DecodeError> {
        Ok(self.get_bytes(pos, pos + 1)?[0])
    }

    fn get_int(&self, pos: usize) -> Result<i32, DecodeError> {
        let raw = self.get_bytes(pos, pos + 4)?;
        Ok(i32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]))
    }

    fn get_string(&self, start: usize, end: usize) -> Result<String, DecodeError> {
        let raw = self.get_bytes(start, end)?;
        String::from_utf8(raw.to_vec()).map_err(|e| DecodeError::InvalidUtf8 {
            pos: start + e.utf8_error().valid_up_to(),
        })
    }
}

impl ReadBuffer for [u8] {
    fn len(&self) -> usize {
        <[u8]>::len(self)
    }

    fn get_bytes(&self, start: usize, end: usize) -> Result<&[u8], DecodeError> {
        if start > end || end > <[u8]>::len(self) {
            return Err(DecodeError::Truncated {
                needed: end,
                available: <[u8]>::len(self),
            });
        }
        Ok(&self[start..end])
    }
}

/// Growable, append-only write access used while encoding.
pub trait WriteBuffer {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn append_byte(&mut self, b: u8);

    fn append_int(&mut self, v: i32);

    fn append_bytes(&mut self, bytes: &[u8]);

    /// Overwrites four bytes at `pos`; used to back-patch frame lengths.
    fn set_int(&mut self, pos: usize, v: i32);
}

impl WriteBuffer for Vec<u8> {
    fn len(&self) -> usize {
        Vec::len(self)
    }

    fn append_byte(&mut self, b: u8) {
        self.push(b);
    }

    fn append_int(&mut self, v: i32) {
        self.extend_from_slice(&v.to_be_bytes());
    }

    fn append_bytes(&mut self, bytes: &[u8]) {
        self.extend_from_slice(bytes);
    }

    fn set_int(&mut self, pos: usize, v: i32) {
        self[pos..pos + 4].copy_from_slice(&v.to_be_bytes());
    }
}

impl WriteBuffer for BytesMut {
    fn len(&self) -> usize {
        BytesMut::len(self)
    }

    fn append_byte(&mut self, b: u8) {
        self.put_u8(b);
    }

    fn append_int(&mut self, v: i32) {
        self.put_i32(v);
    }

    fn append_bytes(&mut self, bytes: &[u8]) {
        self.put_slice(bytes);
    }

    fn set_int(&mut self, pos: usize, v: i32) {
        self[pos..pos + 4].copy_from_slice(&v.to_be_bytes());
    }
}
