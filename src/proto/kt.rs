//! # KT Engine
//!
//! Purpose: Speak the multi-database, TTL-capable KT wire dialect over a
//! pooled connection.
//!
//! ## Design Principles
//! 1. **Checkout-Send-Decode**: Every operation follows the same shape: check
//!    out a pooled socket, build one request, send it, match and decode one
//!    reply, return the socket to the pool.
//! 2. **Magic-Byte Framing**: Requests and replies are framed by a
//!    per-operation magic byte and flag word rather than a generic command
//!    array, so encoding and decoding stay a fixed-shape read instead of a
//!    variable-length parse.
//! 3. **Pluggable Values**: Key decoding and value encode/decode are each a
//!    swappable [`ValueCodec`], so the wire shape stays fixed while the
//!    in-memory representation doesn't have to.
//! 4. **Opt-Out Pooling**: `connection_pool: false` swaps the shared
//!    [`SocketPool`] for a thread-local one, trading cross-thread reuse for a
//!    connection a caller never has to share.

use std::collections::HashMap;
use std::net::{SocketAddr, ToSocketAddrs};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::pool::{CallerId, PoolConfig, PooledSocket, SocketPool};
use crate::proto::{
    decode_key, write_key_list_with_db, write_records_with_db_expire, Key, RequestBuffer,
    ResponseCursor, NO_EXPIRE,
};
use crate::value::{TextCodec, Value, ValueCodec};

const MAGIC_SET_BULK: u8 = 0xB8;
const MAGIC_GET_BULK: u8 = 0xBA;
const MAGIC_REMOVE_BULK: u8 = 0xB9;
const MAGIC_PLAY_SCRIPT: u8 = 0xB4;
const MAGIC_ERROR: u8 = 0xBF;

const FLAG_NO_REPLY: u32 = 0x01;

/// Configuration for a [`KtEngine`].
#[derive(Clone)]
pub struct KtEngineConfig {
    pub host: String,
    pub port: u16,
    pub decode_keys: bool,
    pub encode_value: std::sync::Arc<dyn ValueCodec>,
    pub decode_value: std::sync::Arc<dyn ValueCodec>,
    pub timeout: Option<Duration>,
    pub connection_pool: bool,
    pub default_db: u16,
}

impl Default for KtEngineConfig {
    fn default() -> Self {
        KtEngineConfig {
            host: "127.0.0.1".to_string(),
            port: 1978,
            decode_keys: true,
            encode_value: std::sync::Arc::new(TextCodec),
            decode_value: std::sync::Arc::new(TextCodec),
            timeout: None,
            connection_pool: true,
            default_db: 0,
        }
    }
}

/// One KT record detail as returned by [`KtEngine::get_bulk_details`]:
/// `(db, key, value, expire_seconds_from_now)`.
pub struct RecordDetail {
    pub db: u16,
    pub key: Key,
    pub value: Value,
    pub xt: i64,
}

/// Client for the KT wire dialect.
pub struct KtEngine {
    pool: SocketPool,
    config: KtEngineConfig,
}

impl KtEngine {
    /// Resolves `host:port` and opens the backing socket pool. When
    /// `connection_pool` is false, the pool is built with
    /// [`SocketPool::new_thread_local`]: each calling thread keeps its own
    /// persistent socket in thread-local storage instead of sharing a pool
    /// of connections across threads.
    pub fn connect(config: KtEngineConfig) -> Result<Self> {
        let addr = resolve_addr(&config.host, config.port)?;
        let pool_config = PoolConfig {
            addr,
            nodelay: true,
            read_timeout: config.timeout,
            write_timeout: config.timeout,
            connect_timeout: config.timeout,
        };
        let pool = if config.connection_pool {
            SocketPool::new(pool_config)
        } else {
            SocketPool::new_thread_local(pool_config)
        };
        Ok(KtEngine { pool, config })
    }

    fn checkout(&self) -> Result<PooledSocket> {
        self.pool.checkout(CallerId::thread_current())
    }

    /// Closes every socket currently held by the engine's pool.
    pub fn close_all(&self) {
        self.pool.close_all();
    }

    /// Reaps idle pooled sockets older than `cutoff`. Expected to be called
    /// periodically by the embedder.
    pub fn close_idle(&self, cutoff: Duration) -> usize {
        self.pool.close_idle(cutoff)
    }

    fn db_or_default(&self, db: Option<u16>) -> u16 {
        db.unwrap_or(self.config.default_db)
    }

    /// Fetches multiple keys. Absent keys are simply missing from the
    /// returned map.
    pub fn get_bulk(
        &self,
        keys: &[&[u8]],
        db: Option<u16>,
        decode_values: Option<bool>,
    ) -> Result<HashMap<Key, Value>> {
        let details = self.get_bulk_details(keys, db, decode_values)?;
        Ok(details
            .into_iter()
            .map(|d| (d.key, d.value))
            .collect())
    }

    /// Like [`Self::get_bulk`] but returns the full per-record tuple
    /// (db echo, key, value, expiration), undiscarded.
    pub fn get_bulk_details(
        &self,
        keys: &[&[u8]],
        db: Option<u16>,
        decode_values: Option<bool>,
    ) -> Result<Vec<RecordDetail>> {
        let db = self.db_or_default(db);
        let decode_values = decode_values.unwrap_or(true);

        let mut req = RequestBuffer::new();
        req.u8(MAGIC_GET_BULK).u32(0);
        write_key_list_with_db(&mut req, keys.iter().copied(), db);

        let sock = self.checkout()?;
        sock.with(|s| s.send_all(req.as_slice()))?;

        let mut cursor = ResponseCursor::new(&sock);
        check_magic(&sock, &mut cursor, MAGIC_GET_BULK)?;

        let count = cursor.u32()?;
        let mut out = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let db_echo = cursor.u16()?;
            let klen = cursor.u32()? as usize;
            let vlen = cursor.u32()? as usize;
            let xt = cursor.i64()?;
            let key_bytes = cursor.bytes(klen)?;
            let value_bytes = cursor.bytes(vlen)?;

            let key = decode_key(key_bytes, self.config.decode_keys)?;
            let value = if decode_values {
                self.config.decode_value.decode(&value_bytes)?
            } else {
                Value::Bytes(value_bytes)
            };
            out.push(RecordDetail { db: db_echo, key, value, xt });
        }
        Ok(out)
    }

    /// Fetches a single key; convenience over [`Self::get_bulk`].
    pub fn get(
        &self,
        key: &[u8],
        db: Option<u16>,
        decode_value: Option<bool>,
    ) -> Result<Option<Value>> {
        let mut map = self.get_bulk(&[key], db, decode_value)?;
        Ok(map.remove(&decode_key(key.to_vec(), self.config.decode_keys)?))
    }

    /// Stores multiple records, returning the number the server accepted.
    pub fn set_bulk(
        &self,
        records: &[(&[u8], &Value)],
        db: Option<u16>,
        xt: Option<i64>,
        no_reply: bool,
        encode_values: Option<bool>,
    ) -> Result<u32> {
        let db = self.db_or_default(db);
        let xt = xt.unwrap_or(NO_EXPIRE);
        let encode_values = encode_values.unwrap_or(true);

        let mut encoded = Vec::with_capacity(records.len());
        for (key, value) in records.iter() {
            let key: &[u8] = *key;
            let value: &Value = *value;
            let bytes = if encode_values {
                self.config.encode_value.encode(value)?
            } else {
                match value {
                    Value::Bytes(b) => b.clone(),
                    Value::Str(s) => s.clone().into_bytes(),
                    other => {
                        return Err(Error::BadArgument(format!(
                            "raw (unencoded) value must be bytes or text, got {other:?}"
                        )))
                    }
                }
            };
            encoded.push((key, bytes));
        }

        let mut req = RequestBuffer::new();
        let flags = if no_reply { FLAG_NO_REPLY } else { 0 };
        req.u8(MAGIC_SET_BULK).u32(flags);
        write_records_with_db_expire(
            &mut req,
            encoded.iter().map(|(k, v)| (*k, v.as_slice())),
            db,
            xt,
        );

        let sock = self.checkout()?;
        sock.with(|s| s.send_all(req.as_slice()))?;

        if no_reply {
            return Ok(encoded.len() as u32);
        }

        let mut cursor = ResponseCursor::new(&sock);
        check_magic(&sock, &mut cursor, MAGIC_SET_BULK)?;
        cursor.u32()
    }

    /// Stores a single record; convenience over [`Self::set_bulk`].
    pub fn set(
        &self,
        key: &[u8],
        value: &Value,
        db: Option<u16>,
        xt: Option<i64>,
        encode_value: Option<bool>,
    ) -> Result<u32> {
        self.set_bulk(&[(key, value)], db, xt, false, encode_value)
    }

    /// Removes multiple keys, returning the number actually removed.
    pub fn remove_bulk(&self, keys: &[&[u8]], db: Option<u16>, no_reply: bool) -> Result<u32> {
        let db = self.db_or_default(db);

        let mut req = RequestBuffer::new();
        let flags = if no_reply { FLAG_NO_REPLY } else { 0 };
        req.u8(MAGIC_REMOVE_BULK).u32(flags);
        write_key_list_with_db(&mut req, keys.iter().copied(), db);

        let sock = self.checkout()?;
        sock.with(|s| s.send_all(req.as_slice()))?;

        if no_reply {
            return Ok(keys.len() as u32);
        }

        let mut cursor = ResponseCursor::new(&sock);
        check_magic(&sock, &mut cursor, MAGIC_REMOVE_BULK)?;
        cursor.u32()
    }

    /// Removes a single key; convenience over [`Self::remove_bulk`].
    pub fn remove(&self, key: &[u8], db: Option<u16>) -> Result<u32> {
        self.remove_bulk(&[key], db, false)
    }

    /// Invokes a server-side Lua script by name, passing a key/value
    /// parameter map and returning the key/value map it produces.
    pub fn play_script(
        &self,
        name: &str,
        params: &[(&[u8], &Value)],
        no_reply: bool,
        encode_values: Option<bool>,
        decode_values: Option<bool>,
    ) -> Result<HashMap<Key, Value>> {
        let encode_values = encode_values.unwrap_or(false);
        let decode_values = decode_values.unwrap_or(false);

        let mut encoded = Vec::with_capacity(params.len());
        for (key, value) in params.iter() {
            let key: &[u8] = *key;
            let value: &Value = *value;
            let bytes = if encode_values {
                self.config.encode_value.encode(value)?
            } else {
                match value {
                    Value::Bytes(b) => b.clone(),
                    Value::Str(s) => s.clone().into_bytes(),
                    other => {
                        return Err(Error::BadArgument(format!(
                            "raw (unencoded) param value must be bytes or text, got {other:?}"
                        )))
                    }
                }
            };
            encoded.push((key, bytes));
        }

        let mut req = RequestBuffer::new();
        let flags = if no_reply { FLAG_NO_REPLY } else { 0 };
        req.u8(MAGIC_PLAY_SCRIPT)
            .u32(flags)
            .u32(name.len() as u32)
            .u32(encoded.len() as u32);
        req.bytes(name.as_bytes());
        for (key, value) in &encoded {
            req.u32(key.len() as u32);
            req.u32(value.len() as u32);
            req.bytes(key);
            req.bytes(value);
        }

        let sock = self.checkout()?;
        sock.with(|s| s.send_all(req.as_slice()))?;

        if no_reply {
            return Ok(HashMap::new());
        }

        let mut cursor = ResponseCursor::new(&sock);
        check_magic(&sock, &mut cursor, MAGIC_PLAY_SCRIPT)?;

        let count = cursor.u32()?;
        let mut out = HashMap::with_capacity(count as usize);
        for _ in 0..count {
            let klen = cursor.u32()? as usize;
            let vlen = cursor.u32()? as usize;
            let key_bytes = cursor.bytes(klen)?;
            let value_bytes = cursor.bytes(vlen)?;

            let key = decode_key(key_bytes, self.config.decode_keys)?;
            let value = if decode_values {
                self.config.decode_value.decode(&value_bytes)?
            } else {
                Value::Bytes(value_bytes)
            };
            out.insert(key, value);
        }
        Ok(out)
    }
}

/// Checks the response's magic byte against `expected`, translating the KT
/// error magic into [`Error::ServerInternal`] and anything else into
/// [`Error::Protocol`]. On either failure the socket is closed conservatively,
/// since a parse anomaly may have left the stream mid-frame.
fn check_magic(sock: &PooledSocket, cursor: &mut ResponseCursor, expected: u8) -> Result<()> {
    let magic = match cursor.u8() {
        Ok(m) => m,
        Err(err) => return Err(err),
    };
    if magic == expected {
        return Ok(());
    }
    sock.with(|s| {
        s.close();
    });
    if magic == MAGIC_ERROR {
        Err(Error::ServerInternal { message: None })
    } else {
        Err(Error::Protocol(format!(
            "unexpected response magic byte 0x{magic:02x}, expected 0x{expected:02x}"
        )))
    }
}

fn resolve_addr(host: &str, port: u16) -> Result<SocketAddr> {
    (host, port)
        .to_socket_addrs()
        .map_err(Error::from_io)?
        .next()
        .ok_or_else(|| Error::BadArgument(format!("could not resolve address {host}:{port}")))
}
