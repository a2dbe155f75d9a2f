//! # TT Engine
//!
//! Purpose: Speak the single-database, status-byte TT wire dialect over a
//! pooled connection.
//!
//! ## Design Principles
//! 1. **Checkout-Send-Decode**: Same `pool.checkout → write request → read
//!    response` shape as [`crate::proto::kt`], applied to a flatter dialect.
//! 2. **Status-Byte Framing**: Every reply starts with one status byte —
//!    `0x00` ok, `0x01` miss, anything else a server-side error — in place of
//!    a per-operation response magic.
//! 3. **Pluggable Values**: Key decoding and value encode/decode are each a
//!    swappable [`ValueCodec`], matching the KT dialect's approach.
//! 4. **Opt-Out Pooling**: `connection_pool: false` swaps the shared
//!    [`SocketPool`] for a thread-local one, the same tradeoff the KT engine
//!    offers.

use std::collections::HashMap;
use std::net::{SocketAddr, ToSocketAddrs};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::pool::{CallerId, PoolConfig, PooledSocket, SocketPool};
use crate::proto::{decode_key, write_key, write_key_list, Key, RequestBuffer, ResponseCursor};
use crate::value::{TextCodec, Value, ValueCodec};

const MAGIC: u8 = 0xC8;

const OP_PUT: u8 = 10;
const OP_PUTKEEP: u8 = 11;
const OP_PUTCAT: u8 = 12;
const OP_PUTSHL: u8 = 13;
const OP_PUTNR: u8 = 18;
const OP_OUT: u8 = 20;
const OP_GET: u8 = 30;
const OP_MGET: u8 = 31;
const OP_VSIZ: u8 = 38;
const OP_ITERINIT: u8 = 50;
const OP_ITERNEXT: u8 = 51;
const OP_FWMKEYS: u8 = 58;
const OP_ADDINT: u8 = 60;
const OP_ADDDOUBLE: u8 = 61;
const OP_EXT: u8 = 68;
const OP_SYNC: u8 = 70;
const OP_OPTIMIZE: u8 = 71;
const OP_VANISH: u8 = 72;
const OP_COPY: u8 = 73;
const OP_RESTORE: u8 = 74;
const OP_SETMST: u8 = 78;
const OP_RNUM: u8 = 80;
const OP_SIZE: u8 = 81;
const OP_STAT: u8 = 88;
const OP_MISC: u8 = 90;

const STATUS_OK: u8 = 0x00;
const STATUS_MISS: u8 = 0x01;

/// `ext`'s two record-lock modes, encoded in its `opts` field. Setting both
/// is rejected with `BadArgument` before any bytes go on the wire.
pub const EXT_LOCK_RECORD: u32 = 0x01;
pub const EXT_LOCK_GLOBAL: u32 = 0x02;
/// `misc`'s "do not update the replication log" bit.
pub const MISC_NO_REPLICATION_LOG: u32 = 0x01;

/// Configuration for a [`TtEngine`], mirroring [`crate::proto::kt::KtEngineConfig`].
#[derive(Clone)]
pub struct TtEngineConfig {
    pub host: String,
    pub port: u16,
    pub decode_keys: bool,
    pub encode_value: std::sync::Arc<dyn ValueCodec>,
    pub decode_value: std::sync::Arc<dyn ValueCodec>,
    pub timeout: Option<Duration>,
    pub connection_pool: bool,
}

impl Default for TtEngineConfig {
    fn default() -> Self {
        TtEngineConfig {
            host: "127.0.0.1".to_string(),
            port: 1978,
            decode_keys: true,
            encode_value: std::sync::Arc::new(TextCodec),
            decode_value: std::sync::Arc::new(TextCodec),
            timeout: None,
            connection_pool: true,
        }
    }
}

/// Client for the TT wire dialect.
pub struct TtEngine {
    pool: SocketPool,
    config: TtEngineConfig,
}

/// Outcome of a status-byte read: ok carries nothing extra, miss means
/// "recoverable not-found/did-not-apply", anything else is a server error.
enum Status {
    Ok,
    Miss,
}

impl TtEngine {
    /// Resolves `host:port` and opens the backing socket pool. When
    /// `connection_pool` is false, the pool is built with
    /// [`SocketPool::new_thread_local`]: each calling thread keeps its own
    /// persistent socket in thread-local storage instead of sharing a pool
    /// of connections across threads.
    pub fn connect(config: TtEngineConfig) -> Result<Self> {
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
        Ok(TtEngine { pool, config })
    }

    fn checkout(&self) -> Result<PooledSocket> {
        self.pool.checkout(CallerId::thread_current())
    }

    pub fn close_all(&self) {
        self.pool.close_all();
    }

    pub fn close_idle(&self, cutoff: Duration) -> usize {
        self.pool.close_idle(cutoff)
    }

    fn encode(&self, value: &Value) -> Result<Vec<u8>> {
        self.config.encode_value.encode(value)
    }

    fn decode(&self, bytes: &[u8]) -> Result<Value> {
        self.config.decode_value.decode(bytes)
    }

    fn decode_key(&self, bytes: Vec<u8>) -> Result<Key> {
        decode_key(bytes, self.config.decode_keys)
    }

    /// Sends a request and reads only the status byte, closing the socket
    /// conservatively on anything but `{0, 1}`.
    fn roundtrip_status(&self, req: &RequestBuffer) -> Result<(PooledSocket, Status)> {
        let sock = self.checkout()?;
        sock.with(|s| s.send_all(req.as_slice()))?;
        let mut cursor = ResponseCursor::new(&sock);
        let status = read_status(&sock, &mut cursor)?;
        Ok((sock, status))
    }

    fn bool_op(&self, req: &RequestBuffer) -> Result<bool> {
        let (_sock, status) = self.roundtrip_status(req)?;
        Ok(matches!(status, Status::Ok))
    }

    /// Inserts, overwriting any existing value.
    pub fn put(&self, key: &[u8], value: &Value) -> Result<bool> {
        let encoded = self.encode(value)?;
        let mut req = RequestBuffer::new();
        req.u8(MAGIC).u8(OP_PUT);
        req.u32(key.len() as u32).u32(encoded.len() as u32);
        req.bytes(key).bytes(&encoded);
        self.bool_op(&req)
    }

    /// Inserts only if `key` is absent.
    pub fn putkeep(&self, key: &[u8], value: &Value) -> Result<bool> {
        let encoded = self.encode(value)?;
        let mut req = RequestBuffer::new();
        req.u8(MAGIC).u8(OP_PUTKEEP);
        req.u32(key.len() as u32).u32(encoded.len() as u32);
        req.bytes(key).bytes(&encoded);
        self.bool_op(&req)
    }

    /// Appends to any existing value, or inserts if absent.
    pub fn putcat(&self, key: &[u8], value: &Value) -> Result<bool> {
        let encoded = self.encode(value)?;
        let mut req = RequestBuffer::new();
        req.u8(MAGIC).u8(OP_PUTCAT);
        req.u32(key.len() as u32).u32(encoded.len() as u32);
        req.bytes(key).bytes(&encoded);
        self.bool_op(&req)
    }

    /// Appends to the value, then truncates it to at most `width` bytes
    /// from the left ("shift left" semantics).
    pub fn putshl(&self, key: &[u8], value: &Value, width: u32) -> Result<bool> {
        let encoded = self.encode(value)?;
        let mut req = RequestBuffer::new();
        req.u8(MAGIC).u8(OP_PUTSHL);
        req.u32(key.len() as u32)
            .u32(encoded.len() as u32)
            .u32(width);
        req.bytes(key).bytes(&encoded);
        self.bool_op(&req)
    }

    /// Inserts without reading a reply; the server's acknowledgment is
    /// never observed, by design.
    pub fn putnr(&self, key: &[u8], value: &Value) -> Result<()> {
        let encoded = self.encode(value)?;
        let mut req = RequestBuffer::new();
        req.u8(MAGIC).u8(OP_PUTNR);
        req.u32(key.len() as u32).u32(encoded.len() as u32);
        req.bytes(key).bytes(&encoded);

        let sock = self.checkout()?;
        sock.with(|s| s.send_all(req.as_slice()))
    }

    /// Removes `key`; `false` if it was already absent.
    pub fn out(&self, key: &[u8]) -> Result<bool> {
        let mut req = RequestBuffer::new();
        req.u8(MAGIC).u8(OP_OUT);
        write_key(&mut req, key);
        self.bool_op(&req)
    }

    /// Fetches `key`'s value, or `None` if absent.
    pub fn get(&self, key: &[u8]) -> Result<Option<Value>> {
        let mut req = RequestBuffer::new();
        req.u8(MAGIC).u8(OP_GET);
        write_key(&mut req, key);

        let (sock, status) = self.roundtrip_status(&req)?;
        match status {
            Status::Miss => Ok(None),
            Status::Ok => {
                let mut cursor = ResponseCursor::new(&sock);
                let bytes = cursor.length_prefixed()?;
                Ok(Some(self.decode(&bytes)?))
            }
        }
    }

    /// Fetches multiple keys; absent keys are simply missing from the map.
    pub fn mget(&self, keys: &[&[u8]]) -> Result<HashMap<Key, Value>> {
        let mut req = RequestBuffer::new();
        req.u8(MAGIC).u8(OP_MGET);
        write_key_list(&mut req, keys.iter().copied());

        let (sock, status) = self.roundtrip_status(&req)?;
        match status {
            Status::Miss => Ok(HashMap::new()),
            Status::Ok => {
                let mut cursor = ResponseCursor::new(&sock);
                let count = cursor.u32()?;
                let mut out = HashMap::with_capacity(count as usize);
                for _ in 0..count {
                    let key_bytes = cursor.length_prefixed()?;
                    let value_bytes = cursor.length_prefixed()?;
                    let key = self.decode_key(key_bytes)?;
                    let value = self.decode(&value_bytes)?;
                    out.insert(key, value);
                }
                Ok(out)
            }
        }
    }

    /// Size in bytes of `key`'s stored value, or `None` if absent.
    pub fn vsiz(&self, key: &[u8]) -> Result<Option<u32>> {
        let mut req = RequestBuffer::new();
        req.u8(MAGIC).u8(OP_VSIZ);
        write_key(&mut req, key);

        let (sock, status) = self.roundtrip_status(&req)?;
        match status {
            Status::Miss => Ok(None),
            Status::Ok => {
                let mut cursor = ResponseCursor::new(&sock);
                Ok(Some(cursor.u32()?))
            }
        }
    }

    /// Resets the server-side cursor to the start of the key space.
    pub fn iterinit(&self) -> Result<()> {
        let mut req = RequestBuffer::new();
        req.u8(MAGIC).u8(OP_ITERINIT);
        self.bool_op(&req).map(|_| ())
    }

    /// Advances the cursor and returns the next key, or `None` once the
    /// server reports miss (end of sequence).
    pub fn iternext(&self) -> Result<Option<Key>> {
        let mut req = RequestBuffer::new();
        req.u8(MAGIC).u8(OP_ITERNEXT);

        let (sock, status) = self.roundtrip_status(&req)?;
        match status {
            Status::Miss => Ok(None),
            Status::Ok => {
                let mut cursor = ResponseCursor::new(&sock);
                let key_bytes = cursor.length_prefixed()?;
                Ok(Some(self.decode_key(key_bytes)?))
            }
        }
    }

    /// A lazy, single-pass, non-restartable iterator over every key,
    /// starting from an implicit `iterinit`. Mutating the database
    /// while iterating is unsupported.
    pub fn iter(&self) -> Result<TtIter<'_>> {
        self.iterinit()?;
        Ok(TtIter { engine: self, done: false })
    }

    /// Keys with the given prefix, at most `max` of them.
    pub fn fwmkeys(&self, prefix: &[u8], max: u32) -> Result<Vec<Key>> {
        let mut req = RequestBuffer::new();
        req.u8(MAGIC).u8(OP_FWMKEYS);
        req.u32(prefix.len() as u32).u32(max);
        req.bytes(prefix);

        let (sock, status) = self.roundtrip_status(&req)?;
        match status {
            Status::Miss => Ok(Vec::new()),
            Status::Ok => {
                let mut cursor = ResponseCursor::new(&sock);
                let count = cursor.u32()?;
                let mut out = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    let key_bytes = cursor.length_prefixed()?;
                    out.push(self.decode_key(key_bytes)?);
                }
                Ok(out)
            }
        }
    }

    /// Atomically adds `delta` to the integer stored at `key` (creating it
    /// as `delta` if absent), returning the new value.
    pub fn addint(&self, key: &[u8], delta: i32) -> Result<i32> {
        let mut req = RequestBuffer::new();
        req.u8(MAGIC).u8(OP_ADDINT);
        req.u32(key.len() as u32);
        req.buf_i32(delta);
        req.bytes(key);

        let (sock, status) = self.roundtrip_status(&req)?;
        match status {
            Status::Miss => Err(Error::ServerInternal {
                message: Some(b"addint on a non-numeric or absent-without-create key".to_vec()),
            }),
            Status::Ok => {
                let mut cursor = ResponseCursor::new(&sock);
                Ok(cursor.u32()? as i32)
            }
        }
    }

    /// Same as [`Self::addint`] but for a floating-point accumulator.
    pub fn adddouble(&self, key: &[u8], delta: f64) -> Result<f64> {
        let mut req = RequestBuffer::new();
        req.u8(MAGIC).u8(OP_ADDDOUBLE);
        req.u32(key.len() as u32);
        req.f64_pair(delta)?;
        req.bytes(key);

        let (sock, status) = self.roundtrip_status(&req)?;
        match status {
            Status::Miss => Err(Error::ServerInternal {
                message: Some(b"adddouble on a non-numeric or absent-without-create key".to_vec()),
            }),
            Status::Ok => {
                let mut cursor = ResponseCursor::new(&sock);
                cursor.f64_pair()
            }
        }
    }

    /// Invokes a server-side extension function. `opts` must not set both
    /// [`EXT_LOCK_RECORD`] and [`EXT_LOCK_GLOBAL`]; violating this returns
    /// `BadArgument` before any bytes are written.
    pub fn ext(&self, name: &str, key: &[u8], value: &[u8], opts: u32) -> Result<Vec<u8>> {
        if opts & EXT_LOCK_RECORD != 0 && opts & EXT_LOCK_GLOBAL != 0 {
            return Err(Error::BadArgument(
                "ext: record-lock and global-lock flags are mutually exclusive".to_string(),
            ));
        }

        let mut req = RequestBuffer::new();
        req.u8(MAGIC).u8(OP_EXT);
        req.u32(name.len() as u32)
            .u32(opts)
            .u32(key.len() as u32)
            .u32(value.len() as u32);
        req.bytes(name.as_bytes()).bytes(key).bytes(value);

        let sock = self.checkout()?;
        sock.with(|s| s.send_all(req.as_slice()))?;

        let mut cursor = ResponseCursor::new(&sock);
        let raw_status = cursor.u8()?;
        let payload = cursor.length_prefixed()?;
        if raw_status == STATUS_OK {
            Ok(payload)
        } else {
            sock.with(|s| {
                s.close();
            });
            Err(Error::Script(String::from_utf8_lossy(&payload).into_owned()))
        }
    }

    /// Flushes any buffered writes to stable storage.
    pub fn sync(&self) -> Result<bool> {
        let mut req = RequestBuffer::new();
        req.u8(MAGIC).u8(OP_SYNC);
        self.bool_op(&req)
    }

    /// Reorganizes on-disk storage; `params` is an opaque, server-defined
    /// tuning string.
    pub fn optimize(&self, params: &[u8]) -> Result<bool> {
        let mut req = RequestBuffer::new();
        req.u8(MAGIC).u8(OP_OPTIMIZE);
        req.length_prefixed(params);
        self.bool_op(&req)
    }

    /// Removes every record.
    pub fn vanish(&self) -> Result<bool> {
        let mut req = RequestBuffer::new();
        req.u8(MAGIC).u8(OP_VANISH);
        self.bool_op(&req)
    }

    /// Copies the database file to `path` on the server's filesystem.
    pub fn copy(&self, path: &str) -> Result<bool> {
        let mut req = RequestBuffer::new();
        req.u8(MAGIC).u8(OP_COPY);
        req.length_prefixed(path.as_bytes());
        self.bool_op(&req)
    }

    /// Restores the database from an update log at `path`, replaying
    /// entries up to `timestamp` (microseconds since epoch), with
    /// replication options `opts`.
    pub fn restore(&self, path: &str, timestamp: i64, opts: u32) -> Result<bool> {
        let mut req = RequestBuffer::new();
        req.u8(MAGIC).u8(OP_RESTORE);
        req.u32(path.len() as u32);
        req.i64(timestamp);
        req.u32(opts);
        req.bytes(path.as_bytes());
        self.bool_op(&req)
    }

    /// Designates the server's replication master.
    pub fn setmst(&self, host: &str, port: u32, timestamp: i64) -> Result<bool> {
        let mut req = RequestBuffer::new();
        req.u8(MAGIC).u8(OP_SETMST);
        req.u32(host.len() as u32);
        req.u32(port);
        req.i64(timestamp);
        req.bytes(host.as_bytes());
        self.bool_op(&req)
    }

    /// Number of records currently stored.
    pub fn rnum(&self) -> Result<i64> {
        let mut req = RequestBuffer::new();
        req.u8(MAGIC).u8(OP_RNUM);
        let (sock, status) = self.roundtrip_status(&req)?;
        expect_ok_then(status, || {
            let mut cursor = ResponseCursor::new(&sock);
            cursor.i64()
        })
    }

    /// Total size in bytes of the database file.
    pub fn size(&self) -> Result<i64> {
        let mut req = RequestBuffer::new();
        req.u8(MAGIC).u8(OP_SIZE);
        let (sock, status) = self.roundtrip_status(&req)?;
        expect_ok_then(status, || {
            let mut cursor = ResponseCursor::new(&sock);
            cursor.i64()
        })
    }

    /// Server status string, server-defined `key\tvalue` lines.
    pub fn stat(&self) -> Result<Vec<u8>> {
        let mut req = RequestBuffer::new();
        req.u8(MAGIC).u8(OP_STAT);
        let (sock, status) = self.roundtrip_status(&req)?;
        expect_ok_then(status, || {
            let mut cursor = ResponseCursor::new(&sock);
            cursor.length_prefixed()
        })
    }

    /// Generic fluent command channel. `opts` bit [`MISC_NO_REPLICATION_LOG`]
    /// suppresses the replication log update for this call.
    pub fn misc(&self, name: &str, args: &[&[u8]], opts: u32) -> Result<Vec<Vec<u8>>> {
        let mut req = RequestBuffer::new();
        req.u8(MAGIC).u8(OP_MISC);
        req.u32(name.len() as u32)
            .u32(opts)
            .u32(args.len() as u32);
        req.bytes(name.as_bytes());
        for arg in args {
            req.length_prefixed(arg);
        }

        let (sock, status) = self.roundtrip_status(&req)?;
        match status {
            Status::Miss => Ok(Vec::new()),
            Status::Ok => {
                let mut cursor = ResponseCursor::new(&sock);
                let count = cursor.u32()?;
                let mut out = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    out.push(cursor.length_prefixed()?);
                }
                Ok(out)
            }
        }
    }

    /// `misc("search", ..., cmd="get")`'s result items are laid out as
    /// `\x00 key \x00 rest`; this preserves that exact split without
    /// interpreting `rest` further.
    pub fn misc_search_get(&self, query_args: &[&[u8]]) -> Result<Vec<(Key, Vec<u8>)>> {
        let items = self.misc("search", query_args, 0)?;
        let mut out = Vec::with_capacity(items.len());
        for item in items {
            if item.is_empty() {
                return Err(Error::Protocol(
                    "misc search/get item shorter than the leading skip byte".to_string(),
                ));
            }
            let rest = &item[1..];
            let split = rest.iter().position(|&b| b == 0).ok_or_else(|| {
                Error::Protocol("misc search/get item missing the key/rest null separator".to_string())
            })?;
            let key = self.decode_key(rest[..split].to_vec())?;
            let tail = rest[split + 1..].to_vec();
            out.push((key, tail));
        }
        Ok(out)
    }
}

/// A lazy, single-pass iterator over every key, driven by repeated
/// `iternext` calls.
pub struct TtIter<'e> {
    engine: &'e TtEngine,
    done: bool,
}

impl<'e> Iterator for TtIter<'e> {
    type Item = Result<Key>;

    fn next(&mut self) -> Option<Result<Key>> {
        if self.done {
            return None;
        }
        match self.engine.iternext() {
            Ok(Some(key)) => Some(Ok(key)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(err) => {
                self.done = true;
                Some(Err(err))
            }
        }
    }
}

fn expect_ok_then<T>(status: Status, f: impl FnOnce() -> Result<T>) -> Result<T> {
    match status {
        Status::Ok => f(),
        Status::Miss => Err(Error::Protocol(
            "unexpected miss status for an always-ok operation".to_string(),
        )),
    }
}

/// Reads the response status byte, closing the socket conservatively on
/// anything outside `{0, 1}`.
fn read_status(sock: &PooledSocket, cursor: &mut ResponseCursor) -> Result<Status> {
    let status = cursor.u8()?;
    match status {
        STATUS_OK => Ok(Status::Ok),
        STATUS_MISS => Ok(Status::Miss),
        other => {
            sock.with(|s| {
                s.close();
            });
            Err(Error::ServerInternal {
                message: Some(vec![other]),
            })
        }
    }
}

fn resolve_addr(host: &str, port: u16) -> Result<SocketAddr> {
    (host, port)
        .to_socket_addrs()
        .map_err(Error::from_io)?
        .next()
        .ok_or_else(|| Error::BadArgument(format!("could not resolve address {host}:{port}")))
}

/// Extension trait adding a plain `i32` write to [`RequestBuffer`], used only
/// by `addint`'s delta field (every other TT/KT integer on the wire is
/// either `u32` length or `i64` timestamp/expiration).
trait WriteI32 {
    fn buf_i32(&mut self, v: i32) -> &mut Self;
}

impl WriteI32 for RequestBuffer {
    fn buf_i32(&mut self, v: i32) -> &mut Self {
        self.u32(v as u32)
    }
}
