//! Protocol codecs.
//!
//! - `websocket`: websocket-style frames with text/binary/control kinds
//! - `line`: `\n`-terminated text
//! - `fixed_length`: 4-byte length prefix with ping/pong markers
//! - `protobase`: named, correlated exchanges with text and binary parts
//!
//! Codecs are constructed explicitly with `build_codec`; there is no global
//! registry.

pub mod fixed_length;
pub mod line;
pub mod protobase;
pub mod websocket;

use crate::codec::{Codec, Limits};
use serde::Deserialize;
use std::fmt;
use std::sync::Arc;

/// Wire protocol selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum ProtocolType {
    #[default]
    #[value(name = "websocket")]
    #[serde(rename = "websocket")]
    WebSocket,
    FixedLength,
    Line,
    Protobase,
}

impl ProtocolType {
    /// Protocol id negotiated by connections of this type.
    pub fn protocol_id(self) -> &'static str {
        match self {
            ProtocolType::WebSocket => websocket::PROTOCOL_ID,
            ProtocolType::FixedLength => fixed_length::PROTOCOL_ID,
            ProtocolType::Line => line::PROTOCOL_ID,
            ProtocolType::Protobase => protobase::PROTOCOL_ID,
        }
    }
}

impl fmt::Display for ProtocolType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.protocol_id())
    }
}

/// Construct the codec for `protocol`.
pub fn build_codec(protocol: ProtocolType, limits: Limits) -> Arc<dyn Codec> {
    match protocol {
        ProtocolType::WebSocket => Arc::new(websocket::WebSocketCodec::new(limits)),
        ProtocolType::FixedLength => Arc::new(fixed_length::FixedLengthCodec::new(limits)),
        ProtocolType::Line => Arc::new(line::LineCodec::new(limits)),
        ProtocolType::Protobase => Arc::new(protobase::ProtobaseCodec::new(limits)),
    }
}
