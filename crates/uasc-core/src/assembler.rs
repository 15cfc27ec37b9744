//! Byte stream → whole chunks.
//!
//! TCP delivers bytes, not chunks. The assembler buffers input until the
//! length announced in a chunk's message header is available, then hands
//! the chunk on. A bad header poisons the stream: the buffer is dropped and
//! the caller is expected to close the connection.

use bytes::{Bytes, BytesMut};
use tracing::trace;

use crate::error::ChannelError;
use crate::wire::{MessageHeader, WireError, MESSAGE_HEADER_SIZE};

#[derive(Debug)]
pub struct PacketAssembler {
    buffer: BytesMut,
    max_chunk_size: usize,
}

impl PacketAssembler {
    /// `max_chunk_size` of zero disables the size check.
    pub fn new(max_chunk_size: usize) -> Self {
        Self {
            buffer: BytesMut::new(),
            max_chunk_size,
        }
    }

    /// Bytes held that do not yet form a whole chunk.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Append `data` and emit every chunk it completes. Returns how many
    /// chunks were emitted.
    pub fn feed(&mut self, data: &[u8], mut sink: impl FnMut(Bytes)) -> Result<usize, ChannelError> {
        self.buffer.extend_from_slice(data);
        let mut emitted = 0;
        while self.buffer.len() >= MESSAGE_HEADER_SIZE {
            let header = match MessageHeader::decode(&self.buffer) {
                Ok(header) => header,
                Err(e) => {
                    self.buffer.clear();
                    return Err(match e {
                        WireError::UnknownMessageType(_) => e.into(),
                        other => ChannelError::MalformedHeader(other),
                    });
                }
            };
            let size = header.message_size as usize;
            if self.max_chunk_size > 0 && size > self.max_chunk_size {
                self.buffer.clear();
                return Err(ChannelError::MessageTooLarge {
                    size,
                    limit: self.max_chunk_size,
                });
            }
            if self.buffer.len() < size {
                break;
            }
            let chunk = self.buffer.split_to(size).freeze();
            trace!(msg_type = %header.message_type, len = size, "chunk framed");
            sink(chunk);
            emitted += 1;
        }
        Ok(emitted)
    }
}
