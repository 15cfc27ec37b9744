//! Numeric node ids used as message type discriminators.
//!
//! Every secure message body begins with the expanded node id of its
//! binary encoding object. Only numeric identifiers are ever used for
//! that purpose, so string/guid/opaque identifiers are rejected.

use bytes::BufMut;

use crate::wire::{read_string, read_u16, read_u32, read_u8, write_string, WireError};

const ENCODING_TWO_BYTE: u8 = 0x00;
const ENCODING_FOUR_BYTE: u8 = 0x01;
const ENCODING_NUMERIC: u8 = 0x02;
const FLAG_SERVER_INDEX: u8 = 0x40;
const FLAG_NAMESPACE_URI: u8 = 0x80;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId {
    pub namespace: u16,
    pub identifier: u32,
}

impl NodeId {
    pub const fn numeric(namespace: u16, identifier: u32) -> Self {
        Self {
            namespace,
            identifier,
        }
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ns={};i={}", self.namespace, self.identifier)
    }
}

/// A node id optionally qualified by namespace URI and server index.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ExpandedNodeId {
    pub node_id: NodeId,
    pub namespace_uri: Option<String>,
    pub server_index: u32,
}

impl From<NodeId> for ExpandedNodeId {
    fn from(node_id: NodeId) -> Self {
        Self {
            node_id,
            namespace_uri: None,
            server_index: 0,
        }
    }
}

impl ExpandedNodeId {
    pub fn encode(&self, buf: &mut impl BufMut) {
        let mut flags = 0u8;
        if self.namespace_uri.is_some() {
            flags |= FLAG_NAMESPACE_URI;
        }
        if self.server_index != 0 {
            flags |= FLAG_SERVER_INDEX;
        }

        let NodeId {
            namespace,
            identifier,
        } = self.node_id;
        if namespace == 0 && identifier <= u8::MAX as u32 {
            buf.put_u8(ENCODING_TWO_BYTE | flags);
            buf.put_u8(identifier as u8);
        } else if namespace <= u8::MAX as u16 && identifier <= u16::MAX as u32 {
            buf.put_u8(ENCODING_FOUR_BYTE | flags);
            buf.put_u8(namespace as u8);
            buf.put_u16_le(identifier as u16);
        } else {
            buf.put_u8(ENCODING_NUMERIC | flags);
            buf.put_u16_le(namespace);
            buf.put_u32_le(identifier);
        }

        if let Some(uri) = &self.namespace_uri {
            write_string(buf, Some(uri));
        }
        if self.server_index != 0 {
            buf.put_u32_le(self.server_index);
        }
    }

    pub fn decode(buf: &mut &[u8]) -> Result<Self, WireError> {
        let mask = read_u8(buf)?;
        let node_id = match mask & 0x3f {
            ENCODING_TWO_BYTE => NodeId::numeric(0, read_u8(buf)? as u32),
            ENCODING_FOUR_BYTE => {
                let namespace = read_u8(buf)? as u16;
                NodeId::numeric(namespace, read_u16(buf)? as u32)
            }
            ENCODING_NUMERIC => {
                let namespace = read_u16(buf)?;
                NodeId::numeric(namespace, read_u32(buf)?)
            }
            other => return Err(WireError::UnsupportedNodeIdEncoding(other)),
        };
        let namespace_uri = if mask & FLAG_NAMESPACE_URI != 0 {
            read_string(buf)?
        } else {
            None
        };
        let server_index = if mask & FLAG_SERVER_INDEX != 0 {
            read_u32(buf)?
        } else {
            0
        };
        Ok(Self {
            node_id,
            namespace_uri,
            server_index,
        })
    }
}

impl std::fmt::Display for ExpandedNodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.server_index != 0 {
            write!(f, "svr={};", self.server_index)?;
        }
        match &self.namespace_uri {
            Some(uri) => write!(f, "nsu={uri};i={}", self.node_id.identifier),
            None => write!(f, "{}", self.node_id),
        }
    }
}
