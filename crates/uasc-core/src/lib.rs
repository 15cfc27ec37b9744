//! uasc-core — OPC-UA secure conversation chunking: wire format, chunk
//! security, and message reassembly. Transport and sessions live elsewhere.

pub mod assembler;
pub mod builder;
pub mod chunk_manager;
pub mod chunker;
pub mod config;
pub mod crypto;
pub mod error;
pub mod message;
pub mod node_id;
pub mod sequence;
pub mod token;
pub mod transport;
pub mod wire;

pub use assembler::PacketAssembler;
pub use builder::{
    BuilderEvent, BuilderOptions, DecodedMessage, MessageBuilder, MessageHandler,
    SequenceGapPolicy,
};
pub use chunk_manager::{ChunkHooks, ChunkLayout, ChunkManager};
pub use chunker::{ChunkingOptions, MessageChunker, SecuritySettings};
pub use config::UascConfig;
pub use crypto::{AsymmetricCrypto, DerivedKeys, MessageSecurityMode, SecurityPolicy};
pub use error::ChannelError;
pub use message::{ObjectFactory, RawMessage, RawObjectFactory, UaMessage};
pub use node_id::{ExpandedNodeId, NodeId};
pub use sequence::SequenceNumberGenerator;
pub use token::{SecurityToken, TokenStack};
pub use wire::{ChunkType, MessageType, StatusCode};
