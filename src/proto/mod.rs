//! Shared big-endian wire primitives, used by both the [`kt`] and [`tt`]
//! engines.
//!
//! KT/TT frames are fully binary, so reads and writes go through small free
//! functions operating on a caller-owned `Vec<u8>` buffer (`RequestBuffer`)
//! for writes, and a cursor over already-received bytes (`ResponseCursor`)
//! for reads — buffer reuse, no hidden state.

pub mod kt;
pub mod tt;

use crate::error::{Error, Result};
use crate::pool::PooledSocket;

/// Sentinel expiration meaning "no expiration" on the wire.
pub const NO_EXPIRE: i64 = 0x7FFF_FFFF_FFFF_FFFF;

/// Append-only request buffer; one per in-flight request.
#[derive(Debug, Default)]
pub struct RequestBuffer {
    buf: Vec<u8>,
}

impl RequestBuffer {
    pub fn new() -> Self {
        RequestBuffer { buf: Vec::with_capacity(256) }
    }

    pub fn u8(&mut self, v: u8) -> &mut Self {
        self.buf.push(v);
        self
    }

    pub fn u16(&mut self, v: u16) -> &mut Self {
        self.buf.extend_from_slice(&v.to_be_bytes());
        self
    }

    pub fn u32(&mut self, v: u32) -> &mut Self {
        self.buf.extend_from_slice(&v.to_be_bytes());
        self
    }

    pub fn i64(&mut self, v: i64) -> &mut Self {
        self.buf.extend_from_slice(&v.to_be_bytes());
        self
    }

    /// Writes a double as `u64 integer_part` followed by
    /// `u64 fractional_part * 10^12`. Negative inputs are rejected.
    pub fn f64_pair(&mut self, v: f64) -> Result<&mut Self> {
        if v.is_sign_negative() || v.is_nan() {
            return Err(Error::BadArgument(format!(
                "negative or NaN double {v} is not supported by the wire format"
            )));
        }
        let int_part = v.trunc() as u64;
        let frac_part = ((v.fract()) * 1e12) as u64;
        self.buf.extend_from_slice(&int_part.to_be_bytes());
        self.buf.extend_from_slice(&frac_part.to_be_bytes());
        Ok(self)
    }

    pub fn bytes(&mut self, v: &[u8]) -> &mut Self {
        self.buf.extend_from_slice(v);
        self
    }

    /// `u32 len` followed by `len` bytes — the common key/value framing atom.
    pub fn length_prefixed(&mut self, v: &[u8]) -> &mut Self {
        self.u32(v.len() as u32);
        self.bytes(v)
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.buf
    }
}

/// `write_key`: `u32 klen` then `klen` bytes.
pub fn write_key(buf: &mut RequestBuffer, key: &[u8]) {
    buf.length_prefixed(key);
}

/// `write_key_list`: `u32 count` then repeated `write_key`.
pub fn write_key_list<'a, I: IntoIterator<Item = &'a [u8]>>(buf: &mut RequestBuffer, keys: I) {
    let keys: Vec<&[u8]> = keys.into_iter().collect();
    buf.u32(keys.len() as u32);
    for key in keys {
        write_key(buf, key);
    }
}

/// `write_key_list_with_db`: `u32 count` then repeated
/// `u16 db, u32 klen, klen bytes`.
pub fn write_key_list_with_db<'a, I: IntoIterator<Item = &'a [u8]>>(
    buf: &mut RequestBuffer,
    keys: I,
    db: u16,
) {
    let keys: Vec<&[u8]> = keys.into_iter().collect();
    buf.u32(keys.len() as u32);
    for key in keys {
        buf.u16(db);
        write_key(buf, key);
    }
}

/// `write_kv`: `u32 klen, u32 vlen, klen bytes, vlen bytes`.
pub fn write_kv(buf: &mut RequestBuffer, key: &[u8], value: &[u8]) {
    buf.u32(key.len() as u32);
    buf.u32(value.len() as u32);
    buf.bytes(key);
    buf.bytes(value);
}

/// `write_records_with_db_expire`: `u32 count` then repeated
/// `u16 db, u32 klen, u32 vlen, i64 xt, klen bytes, vlen bytes`.
pub fn write_records_with_db_expire<'a, I>(buf: &mut RequestBuffer, records: I, db: u16, xt: i64)
where
    I: IntoIterator<Item = (&'a [u8], &'a [u8])>,
{
    let records: Vec<(&[u8], &[u8])> = records.into_iter().collect();
    buf.u32(records.len() as u32);
    for (key, value) in records {
        buf.u16(db);
        buf.u32(key.len() as u32);
        buf.u32(value.len() as u32);
        buf.i64(xt);
        buf.bytes(key);
        buf.bytes(value);
    }
}

/// Read cursor over a socket's exact-length reads.
pub struct ResponseCursor<'s> {
    sock: &'s PooledSocket,
}

impl<'s> ResponseCursor<'s> {
    pub fn new(sock: &'s PooledSocket) -> Self {
        ResponseCursor { sock }
    }

    pub fn u8(&mut self) -> Result<u8> {
        let bytes = self.sock.with(|s| s.recv_exact(1))?;
        Ok(bytes[0])
    }

    pub fn u16(&mut self) -> Result<u16> {
        let bytes = self.sock.with(|s| s.recv_exact(2))?;
        Ok(u16::from_be_bytes(bytes.try_into().expect("2 bytes")))
    }

    pub fn u32(&mut self) -> Result<u32> {
        let bytes = self.sock.with(|s| s.recv_exact(4))?;
        Ok(u32::from_be_bytes(bytes.try_into().expect("4 bytes")))
    }

    pub fn i64(&mut self) -> Result<i64> {
        let bytes = self.sock.with(|s| s.recv_exact(8))?;
        Ok(i64::from_be_bytes(bytes.try_into().expect("8 bytes")))
    }

    /// Reads the `u64/u64` double pair written by [`RequestBuffer::f64_pair`].
    pub fn f64_pair(&mut self) -> Result<f64> {
        let bytes = self.sock.with(|s| s.recv_exact(16))?;
        let int_part = u64::from_be_bytes(bytes[..8].try_into().expect("8 bytes"));
        let frac_part = u64::from_be_bytes(bytes[8..].try_into().expect("8 bytes"));
        Ok(int_part as f64 + (frac_part as f64) / 1e12)
    }

    pub fn bytes(&mut self, n: usize) -> Result<Vec<u8>> {
        self.sock.with(|s| s.recv_exact(n))
    }

    /// Reads a `u32 len` prefix followed by `len` bytes.
    pub fn length_prefixed(&mut self) -> Result<Vec<u8>> {
        let len = self.u32()? as usize;
        self.bytes(len)
    }
}

/// Decodes a key according to an engine's `decode_keys` setting.
pub fn decode_key(bytes: Vec<u8>, decode_keys: bool) -> Result<Key> {
    if decode_keys {
        String::from_utf8(bytes)
            .map(Key::Text)
            .map_err(|e| Error::Protocol(format!("invalid utf-8 key: {e}")))
    } else {
        Ok(Key::Bytes(bytes))
    }
}

/// A key returned to the application: text when `decode_keys` is enabled,
/// raw bytes otherwise.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Key {
    Text(String),
    Bytes(Vec<u8>),
}

impl Key {
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Key::Text(s) => s.as_bytes(),
            Key::Bytes(b) => b,
        }
    }
}

impl From<&str> for Key {
    fn from(s: &str) -> Self {
        Key::Text(s.to_owned())
    }
}

impl From<String> for Key {
    fn from(s: String) -> Self {
        Key::Text(s)
    }
}

impl From<Vec<u8>> for Key {
    fn from(b: Vec<u8>) -> Self {
        Key::Bytes(b)
    }
}
