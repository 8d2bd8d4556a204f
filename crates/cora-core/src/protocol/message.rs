//! Protocol message buffer.
//!
//! A message carries the session number it is routed on, a numeric message
//! type and a big-endian body. Writers append to the body; readers consume it
//! from a read cursor and report truncation as [`Error::Codec`] instead of
//! panicking.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::types::{LgrDate, SessionNo};
use crate::error::{Error, Result};

/// One protocol message.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    session_no: SessionNo,
    message_type: u32,
    body: BytesMut,
    read_pos: usize,
}

impl Message {
    /// Create an empty message.
    pub fn new(session_no: SessionNo, message_type: u32) -> Self {
        Self {
            session_no,
            message_type,
            body: BytesMut::new(),
            read_pos: 0,
        }
    }

    /// Create a command message whose body starts with a transaction number.
    pub fn command(session_no: SessionNo, message_type: u32, tran_no: u32) -> Self {
        let mut msg = Self::new(session_no, message_type);
        msg.add_u4(tran_no);
        msg
    }

    /// Create a message around an existing body.
    pub fn with_body(session_no: SessionNo, message_type: u32, body: &[u8]) -> Self {
        Self {
            session_no,
            message_type,
            body: BytesMut::from(body),
            read_pos: 0,
        }
    }

    pub fn session_no(&self) -> SessionNo {
        self.session_no
    }

    pub fn set_session_no(&mut self, session_no: SessionNo) {
        self.session_no = session_no;
    }

    pub fn message_type(&self) -> u32 {
        self.message_type
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Total body length.
    pub fn len(&self) -> usize {
        self.body.len()
    }

    pub fn is_empty(&self) -> bool {
        self.body.is_empty()
    }

    /// Bytes left to read.
    pub fn remaining(&self) -> usize {
        self.body.len().saturating_sub(self.read_pos)
    }

    /// Move the read cursor back to the start of the body.
    pub fn reset_read(&mut self) {
        self.read_pos = 0;
    }

    /// Peek the leading transaction number without moving the cursor.
    pub fn tran_no(&self) -> Option<u32> {
        let mut head = self.body.get(..4)?;
        Some(head.get_u32())
    }

    // -------------------------------------------------------------------------
    // Writers
    // -------------------------------------------------------------------------

    pub fn add_u1(&mut self, value: u8) {
        self.body.put_u8(value);
    }

    pub fn add_u2(&mut self, value: u16) {
        self.body.put_u16(value);
    }

    pub fn add_u4(&mut self, value: u32) {
        self.body.put_u32(value);
    }

    pub fn add_i1(&mut self, value: i8) {
        self.body.put_i8(value);
    }

    pub fn add_i2(&mut self, value: i16) {
        self.body.put_i16(value);
    }

    pub fn add_i4(&mut self, value: i32) {
        self.body.put_i32(value);
    }

    pub fn add_i8(&mut self, value: i64) {
        self.body.put_i64(value);
    }

    pub fn add_f4(&mut self, value: f32) {
        self.body.put_f32(value);
    }

    pub fn add_f8(&mut self, value: f64) {
        self.body.put_f64(value);
    }

    pub fn add_bool(&mut self, value: bool) {
        self.body.put_u8(u8::from(value));
    }

    /// Append a NUL-terminated UTF-8 string.
    ///
    /// Embedded NUL characters would truncate the string on the far side, so
    /// the string is cut at the first one.
    pub fn add_str(&mut self, value: &str) {
        let bytes = value.as_bytes();
        let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
        self.body.put_slice(&bytes[..end]);
        self.body.put_u8(0);
    }

    /// Append a u32 length prefix followed by the bytes.
    pub fn add_bytes(&mut self, value: &[u8]) {
        self.body.put_u32(value.len() as u32);
        self.body.put_slice(value);
    }

    /// Append bytes without a length prefix.
    pub fn add_raw(&mut self, value: &[u8]) {
        self.body.put_slice(value);
    }

    pub fn add_stamp(&mut self, value: LgrDate) {
        self.add_i8(value.nanos());
    }

    // -------------------------------------------------------------------------
    // Readers
    // -------------------------------------------------------------------------

    fn cursor(&self, need: usize, what: &str) -> Result<&[u8]> {
        let rest = &self.body[self.read_pos.min(self.body.len())..];
        if rest.len() < need {
            return Err(Error::truncated(what));
        }
        Ok(rest)
    }

    pub fn read_u1(&mut self) -> Result<u8> {
        let value = self.cursor(1, "u1")?.get_u8();
        self.read_pos += 1;
        Ok(value)
    }

    pub fn read_u2(&mut self) -> Result<u16> {
        let value = self.cursor(2, "u2")?.get_u16();
        self.read_pos += 2;
        Ok(value)
    }

    pub fn read_u4(&mut self) -> Result<u32> {
        let value = self.cursor(4, "u4")?.get_u32();
        self.read_pos += 4;
        Ok(value)
    }

    pub fn read_i1(&mut self) -> Result<i8> {
        let value = self.cursor(1, "i1")?.get_i8();
        self.read_pos += 1;
        Ok(value)
    }

    pub fn read_i2(&mut self) -> Result<i16> {
        let value = self.cursor(2, "i2")?.get_i16();
        self.read_pos += 2;
        Ok(value)
    }

    pub fn read_i4(&mut self) -> Result<i32> {
        let value = self.cursor(4, "i4")?.get_i32();
        self.read_pos += 4;
        Ok(value)
    }

    pub fn read_i8(&mut self) -> Result<i64> {
        let value = self.cursor(8, "i8")?.get_i64();
        self.read_pos += 8;
        Ok(value)
    }

    pub fn read_f4(&mut self) -> Result<f32> {
        let value = self.cursor(4, "f4")?.get_f32();
        self.read_pos += 4;
        Ok(value)
    }

    pub fn read_f8(&mut self) -> Result<f64> {
        let value = self.cursor(8, "f8")?.get_f64();
        self.read_pos += 8;
        Ok(value)
    }

    pub fn read_bool(&mut self) -> Result<bool> {
        Ok(self.read_u1()? != 0)
    }

    /// Read a NUL-terminated string. Invalid UTF-8 is replaced, not rejected.
    pub fn read_str(&mut self) -> Result<String> {
        let rest = self.cursor(0, "string")?;
        let end = rest
            .iter()
            .position(|b| *b == 0)
            .ok_or_else(|| Error::truncated("string"))?;
        let value = String::from_utf8_lossy(&rest[..end]).into_owned();
        self.read_pos += end + 1;
        Ok(value)
    }

    /// Read a u32 length-prefixed byte string.
    pub fn read_bytes(&mut self) -> Result<Bytes> {
        let start = self.read_pos;
        let len = self.read_u4()? as usize;
        match self.read_raw(len) {
            Ok(bytes) => Ok(bytes),
            Err(e) => {
                self.read_pos = start;
                Err(e)
            }
        }
    }

    /// Read exactly `len` bytes.
    pub fn read_raw(&mut self, len: usize) -> Result<Bytes> {
        let rest = self.cursor(len, "raw bytes")?;
        let value = Bytes::copy_from_slice(&rest[..len]);
        self.read_pos += len;
        Ok(value)
    }

    pub fn read_stamp(&mut self) -> Result<LgrDate> {
        Ok(LgrDate(self.read_i8()?))
    }

    /// Skip `len` bytes.
    pub fn skip(&mut self, len: usize) -> Result<()> {
        self.cursor(len, "skipped bytes")?;
        self.read_pos += len;
        Ok(())
    }
}
