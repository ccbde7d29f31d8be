//! baseio: codec-driven network I/O
//!
//! A small framework for message-oriented TCP services:
//! - Pluggable wire-protocol codecs (websocket-style frames, lines,
//!   length-prefixed, protobase)
//! - Reusable exchange objects held in per-worker pools
//! - Blocking request/response correlation on top of asynchronous I/O
//! - Hashed and sticky routing across connections
//! - mio and tokio runtimes hosting the codecs
//!
//! Configuration is loaded from CLI arguments or a TOML file.

pub mod balance;
pub mod buffer;
pub mod client;
pub mod codec;
pub mod config;
pub mod connection;
pub mod correlator;
pub mod exchange;
pub mod pool;
pub mod protocols;
pub mod runtime;

pub use balance::{BalanceMode, BalanceRouter, RouteError};
pub use buffer::{Allocator, BufferPool, HeapAllocator};
pub use client::{BlockingClient, ClientError};
pub use codec::{Codec, CodecError, DecodeContext, DecodeState, Limits};
pub use config::{Config, ConfigError, RuntimeType};
pub use connection::ConnectionInfo;
pub use correlator::{CorrelationKey, CorrelationTable, Correlator, Signaller, WaitError};
pub use exchange::{Exchange, ExchangeError, ExchangeKind, FrameKind, Message, ProtobaseExchange};
pub use pool::ExchangePools;
pub use protocols::{build_codec, ProtocolType};
pub use runtime::{EchoHandler, Handler, Submit};
