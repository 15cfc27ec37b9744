//! Streaming chunk encoder.
//!
//! A [`ChunkManager`] is fed the encoded body of one message in arbitrary
//! slices and cuts it into chunks no larger than the negotiated chunk size.
//! Each chunk is laid out as
//!
//! ```text
//! ┌────────┬─────────────────┬──────┬─────────┬───────────┐
//! │ header │ sequence header │ body │ padding │ signature │
//! └────────┴─────────────────┴──────┴─────────┴───────────┘
//!          └──────────────── encrypted ────────────────────┘
//! ```
//!
//! The header bytes, sequence header, signature and ciphertext come from a
//! [`ChunkHooks`] implementation; this module only does the arithmetic and
//! the buffer plumbing.

use bytes::{Bytes, BytesMut};
use tracing::{debug, trace};

use crate::error::ChannelError;
use crate::wire::ChunkType;

// ── Layout ────────────────────────────────────────────────────────────────────

/// Sizes that fix where every region of a chunk lands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ChunkLayout {
    /// Largest chunk that may be put on the wire.
    pub chunk_size: usize,
    /// Message header plus secure channel id plus security header.
    pub header_size: usize,
    pub sequence_header_size: usize,
    /// Zero disables signing.
    pub signature_length: usize,
    /// Zero disables encryption.
    pub plain_block_size: usize,
    pub cipher_block_size: usize,
}

impl ChunkLayout {
    pub fn encrypts(&self) -> bool {
        self.plain_block_size > 0
    }

    pub fn signs(&self) -> bool {
        self.signature_length > 0
    }

    /// Blocks above 256 bytes need a second padding-size byte.
    fn extra_padding(&self) -> usize {
        usize::from(self.plain_block_size > 256)
    }

    pub fn validate(&self) -> Result<(), ChannelError> {
        if (self.plain_block_size == 0) != (self.cipher_block_size == 0) {
            return Err(ChannelError::InvalidLayout(format!(
                "plain block size {} and cipher block size {} must both be set or both be zero",
                self.plain_block_size, self.cipher_block_size
            )));
        }
        self.max_body_size().map(|_| ())
    }

    /// Largest body a single chunk can carry.
    pub fn max_body_size(&self) -> Result<usize, ChannelError> {
        let available = if self.encrypts() {
            let max_blocks = self
                .chunk_size
                .saturating_sub(self.header_size)
                .checked_div(self.cipher_block_size)
                .unwrap_or(0);
            (max_blocks * self.plain_block_size).checked_sub(
                self.sequence_header_size + self.signature_length + 1 + self.extra_padding(),
            )
        } else {
            self.chunk_size.checked_sub(
                self.header_size + self.signature_length + self.sequence_header_size,
            )
        };
        match available {
            Some(n) if n > 0 => Ok(n),
            _ => Err(ChannelError::InvalidLayout(format!(
                "chunk size {} leaves no room for a body ({self:?})",
                self.chunk_size
            ))),
        }
    }

    /// Number of padding bytes (the `N` of the padding region) for a body of
    /// `body_len` bytes. Zero when encryption is off.
    pub fn padding_size(&self, body_len: usize) -> usize {
        if !self.encrypts() {
            return 0;
        }
        let block = self.plain_block_size;
        let used = self.sequence_header_size
            + body_len
            + self.signature_length
            + 1
            + self.extra_padding();
        (block - used % block) % block
    }

    /// Bytes between the header and the signature that follow the body.
    fn padding_region(&self, body_len: usize) -> usize {
        if self.encrypts() {
            1 + self.padding_size(body_len) + self.extra_padding()
        } else {
            0
        }
    }

    /// On-the-wire length of a chunk carrying `body_len` body bytes.
    pub fn chunk_length(&self, body_len: usize) -> usize {
        let region = self.sequence_header_size
            + body_len
            + self.padding_region(body_len)
            + self.signature_length;
        if self.encrypts() {
            self.header_size + region / self.plain_block_size * self.cipher_block_size
        } else {
            self.header_size + region
        }
    }

    /// How many chunks a message of `message_len` bytes is split into.
    pub fn chunk_count(&self, message_len: usize) -> Result<usize, ChannelError> {
        let max_body = self.max_body_size()?;
        Ok(message_len.div_ceil(max_body).max(1))
    }
}

// ── Hooks ─────────────────────────────────────────────────────────────────────

/// Callbacks that fill in the parts of a chunk the manager cannot compute.
pub trait ChunkHooks {
    /// Fill `header` (exactly `header_size` bytes). `chunk_length` is the
    /// final length of the chunk on the wire.
    fn write_header(
        &mut self,
        header: &mut [u8],
        chunk_type: ChunkType,
        chunk_length: usize,
    ) -> Result<(), ChannelError>;

    /// Fill the sequence header. Called once per chunk, in emission order.
    fn write_sequence_header(&mut self, buf: &mut [u8]) -> Result<(), ChannelError>;

    fn sign(&mut self, _data: &[u8]) -> Result<Vec<u8>, ChannelError> {
        Err(crate::crypto::CryptoError::NotConfigured("signing").into())
    }

    fn encrypt(&mut self, _plain: &[u8]) -> Result<Vec<u8>, ChannelError> {
        Err(crate::crypto::CryptoError::NotConfigured("encryption").into())
    }
}

// ── Manager ───────────────────────────────────────────────────────────────────

/// Cuts one message into chunks. Create one per message.
#[derive(Debug)]
pub struct ChunkManager<H> {
    layout: ChunkLayout,
    max_body_size: usize,
    hooks: H,
    /// A full body waiting to learn whether it is the last one.
    pending: Option<Bytes>,
    accumulator: BytesMut,
    chunks_emitted: usize,
    bytes_written: usize,
    finished: bool,
}

impl<H: ChunkHooks> ChunkManager<H> {
    pub fn new(layout: ChunkLayout, hooks: H) -> Result<Self, ChannelError> {
        layout.validate()?;
        let max_body_size = layout.max_body_size()?;
        Ok(Self {
            layout,
            max_body_size,
            hooks,
            pending: None,
            accumulator: BytesMut::with_capacity(max_body_size),
            chunks_emitted: 0,
            bytes_written: 0,
            finished: false,
        })
    }

    pub fn layout(&self) -> &ChunkLayout {
        &self.layout
    }

    pub fn max_body_size(&self) -> usize {
        self.max_body_size
    }

    pub fn chunks_emitted(&self) -> usize {
        self.chunks_emitted
    }

    pub fn bytes_written(&self) -> usize {
        self.bytes_written
    }

    pub fn into_hooks(self) -> H {
        self.hooks
    }

    /// Append body bytes, emitting every chunk known not to be the last.
    pub fn write(
        &mut self,
        mut data: &[u8],
        sink: &mut impl FnMut(Bytes, bool),
    ) -> Result<(), ChannelError> {
        self.ensure_open()?;
        self.bytes_written += data.len();
        while !data.is_empty() {
            if let Some(body) = self.pending.take() {
                self.emit(&body, ChunkType::Intermediate, sink)?;
            }
            let room = self.max_body_size - self.accumulator.len();
            let take = room.min(data.len());
            self.accumulator.extend_from_slice(&data[..take]);
            data = &data[take..];
            if self.accumulator.len() == self.max_body_size {
                self.pending = Some(self.accumulator.split().freeze());
            }
        }
        Ok(())
    }

    /// Emit everything left; the last chunk is marked final.
    pub fn end(&mut self, sink: &mut impl FnMut(Bytes, bool)) -> Result<(), ChannelError> {
        self.finish(ChunkType::Final, sink)
    }

    /// Like [`end`](Self::end), but the last chunk carries the abort type.
    pub fn abort(&mut self, sink: &mut impl FnMut(Bytes, bool)) -> Result<(), ChannelError> {
        self.finish(ChunkType::Abort, sink)
    }

    fn finish(
        &mut self,
        last: ChunkType,
        sink: &mut impl FnMut(Bytes, bool),
    ) -> Result<(), ChannelError> {
        self.ensure_open()?;
        self.finished = true;
        let pending = self.pending.take();
        let rest = self.accumulator.split().freeze();
        match pending {
            Some(body) if rest.is_empty() => self.emit(&body, last, sink),
            Some(body) => {
                self.emit(&body, ChunkType::Intermediate, sink)?;
                self.emit(&rest, last, sink)
            }
            // Covers the zero-length message: one empty final chunk.
            None => self.emit(&rest, last, sink),
        }
    }

    fn ensure_open(&self) -> Result<(), ChannelError> {
        if self.finished {
            return Err(ChannelError::InvalidLayout(
                "chunk manager already finished".into(),
            ));
        }
        Ok(())
    }

    fn emit(
        &mut self,
        body: &[u8],
        chunk_type: ChunkType,
        sink: &mut impl FnMut(Bytes, bool),
    ) -> Result<(), ChannelError> {
        let layout = self.layout;
        let header_size = layout.header_size;
        let seq_end = header_size + layout.sequence_header_size;
        let body_end = seq_end + body.len();
        let padding = layout.padding_size(body.len());
        let padding_end = body_end + layout.padding_region(body.len());
        let plain_len = padding_end + layout.signature_length;
        let chunk_length = layout.chunk_length(body.len());

        let mut buf = BytesMut::zeroed(plain_len);
        self.hooks
            .write_header(&mut buf[..header_size], chunk_type, chunk_length)?;
        self.hooks
            .write_sequence_header(&mut buf[header_size..seq_end])?;
        buf[seq_end..body_end].copy_from_slice(body);

        if layout.encrypts() {
            let fill = (padding & 0xff) as u8;
            buf[body_end..body_end + 1 + padding].fill(fill);
            if layout.extra_padding() == 1 {
                buf[padding_end - 1] = (padding >> 8) as u8;
            }
            trace!(body = body.len(), padding, "padded chunk");
        }

        if layout.signs() {
            let signature = self.hooks.sign(&buf[..padding_end])?;
            if signature.len() != layout.signature_length {
                return Err(crate::crypto::CryptoError::UnexpectedOutputLength {
                    operation: "sign",
                    expected: layout.signature_length,
                    got: signature.len(),
                }
                .into());
            }
            buf[padding_end..].copy_from_slice(&signature);
        }

        if layout.encrypts() {
            let cipher = self.hooks.encrypt(&buf[header_size..])?;
            let expected = chunk_length - header_size;
            if cipher.len() != expected {
                return Err(crate::crypto::CryptoError::UnexpectedOutputLength {
                    operation: "encrypt",
                    expected,
                    got: cipher.len(),
                }
                .into());
            }
            buf.truncate(header_size);
            buf.extend_from_slice(&cipher);
        }

        debug_assert_eq!(buf.len(), chunk_length);
        self.chunks_emitted += 1;
        debug!(
            chunk = self.chunks_emitted,
            len = chunk_length,
            body = body.len(),
            chunk_type = ?chunk_type,
            "chunk emitted"
        );
        sink(buf.freeze(), chunk_type != ChunkType::Intermediate);
        Ok(())
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
