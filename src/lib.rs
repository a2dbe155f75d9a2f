//! # ktt-client
//!
//! A synchronous client for the KT and TT binary key/value wire protocols:
//! multi-database TTL cache (KT) and single-database status-byte store (TT),
//! sharing one connection-pooling and error-handling core.
//!
//! Construct an engine, then call its operations directly:
//!
//! ```no_run
//! use ktt_client::proto::kt::{KtEngine, KtEngineConfig};
//! use ktt_client::Value;
//!
//! # fn main() -> ktt_client::Result<()> {
//! let engine = KtEngine::connect(KtEngineConfig::default())?;
//! engine.set(b"k1", &Value::Str("v1".into()), None, None, None)?;
//! assert_eq!(engine.get(b"k1", None, None)?, Some(Value::Str("v1".into())));
//! # Ok(())
//! # }
//! ```

mod error;
mod pool;
pub mod proto;
mod sock;
pub mod varint;
mod value;

pub use error::{Error, Result};
pub use pool::{CallerId, PoolConfig, PooledSocket, SocketPool};
pub use proto::{Key, NO_EXPIRE};
pub use sock::{FramedSocket, SocketOptions};
pub use value::{IdentityCodec, JsonCodec, MsgPackCodec, OpaqueCodec, TextCodec, Value, ValueCodec};
