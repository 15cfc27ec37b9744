//! Application messages as seen by the chunking layer.
//!
//! The chunker only needs a message to name its binary encoding id and
//! write its body; the builder only needs a factory that turns an encoding
//! id plus body bytes back into an object. Everything about what the
//! message means lives outside this crate.

use bytes::{BufMut, Bytes, BytesMut};

use crate::node_id::ExpandedNodeId;
use crate::wire::WireError;

/// A typed message that can be carried in OPN/MSG/CLO bodies.
pub trait UaMessage {
    /// Binary encoding id written in front of the body.
    fn type_id(&self) -> ExpandedNodeId;

    /// Size hint for the encoded body.
    fn encoded_len(&self) -> usize {
        0
    }

    fn encode(&self, buf: &mut BytesMut);
}

/// Constructs typed messages from their encoding id.
pub trait ObjectFactory {
    type Object;

    fn has_constructor(&self, type_id: &ExpandedNodeId) -> bool;

    /// Decode the body that follows the type id. `body` is positioned
    /// right after the encoded id.
    fn decode_object(
        &self,
        type_id: &ExpandedNodeId,
        body: &mut &[u8],
    ) -> Result<Self::Object, WireError>;
}

/// Serialize a message as `type id ++ body`, the layout of every secure
/// message body.
pub fn encode_message<M: UaMessage + ?Sized>(message: &M) -> Bytes {
    let mut buf = BytesMut::with_capacity(message.encoded_len() + 8);
    message.type_id().encode(&mut buf);
    message.encode(&mut buf);
    buf.freeze()
}

// ── Raw messages ──────────────────────────────────────────────────────────────

/// A message whose body is kept as opaque bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMessage {
    pub type_id: ExpandedNodeId,
    pub body: Bytes,
}

impl UaMessage for RawMessage {
    fn type_id(&self) -> ExpandedNodeId {
        self.type_id.clone()
    }

    fn encoded_len(&self) -> usize {
        self.body.len()
    }

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_slice(&self.body);
    }
}

/// Factory producing [`RawMessage`]s, optionally restricted to a set of ids.
#[derive(Debug, Clone, Default)]
pub struct RawObjectFactory {
    accepted: Option<Vec<ExpandedNodeId>>,
}

impl RawObjectFactory {
    /// Accept every type id.
    pub fn any() -> Self {
        Self { accepted: None }
    }

    pub fn accepting(ids: impl IntoIterator<Item = ExpandedNodeId>) -> Self {
        Self {
            accepted: Some(ids.into_iter().collect()),
        }
    }
}

impl ObjectFactory for RawObjectFactory {
    type Object = RawMessage;

    fn has_constructor(&self, type_id: &ExpandedNodeId) -> bool {
        self.accepted
            .as_ref()
            .map_or(true, |ids| ids.contains(type_id))
    }

    fn decode_object(
        &self,
        type_id: &ExpandedNodeId,
        body: &mut &[u8],
    ) -> Result<RawMessage, WireError> {
        let bytes = Bytes::copy_from_slice(body);
        *body = &[];
        Ok(RawMessage {
            type_id: type_id.clone(),
            body: bytes,
        })
    }
}
