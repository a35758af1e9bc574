//! Length-delimited bincode framing
//!
//! `MessageCodec<D, E>` decodes `D` and encodes `E`, so the two ends of a
//! connection use mirrored aliases: [`ClientCodec`] and [`NodeCodec`].

use crate::messages::{ClientMessage, NodeMessage};
use bytes::{Bytes, BytesMut};
use nebula_core::NebulaError;
use serde::{de::DeserializeOwned, Serialize};
use std::marker::PhantomData;
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

/// Upper bound on one frame; a 32 KiB data frame plus headers fits easily
pub const DEFAULT_MAX_FRAME_LENGTH: usize = 4 * 1024 * 1024;

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed frame: {0}")]
    Malformed(#[from] bincode::Error),

    #[error("Unexpected message: {0}")]
    Unexpected(String),
}

impl From<ProtocolError> for NebulaError {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::Io(e) => NebulaError::Io(e),
            other => NebulaError::Transport(other.to_string()),
        }
    }
}

pub struct MessageCodec<D, E> {
    inner: LengthDelimitedCodec,
    _marker: PhantomData<fn(E) -> D>,
}

/// Client side: sends `ClientMessage`, receives `NodeMessage`
pub type ClientCodec = MessageCodec<NodeMessage, ClientMessage>;

/// Node side: sends `NodeMessage`, receives `ClientMessage`
pub type NodeCodec = MessageCodec<ClientMessage, NodeMessage>;

impl<D, E> MessageCodec<D, E> {
    pub fn new() -> Self {
        Self::with_max_frame_length(DEFAULT_MAX_FRAME_LENGTH)
    }

    pub fn with_max_frame_length(max: usize) -> Self {
        Self {
            inner: LengthDelimitedCodec::builder()
                .max_frame_length(max)
                .new_codec(),
            _marker: PhantomData,
        }
    }
}

impl<D, E> Default for MessageCodec<D, E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<D: DeserializeOwned, E> Decoder for MessageCodec<D, E> {
    type Item = D;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<D>, ProtocolError> {
        match self.inner.decode(src)? {
            Some(frame) => Ok(Some(bincode::deserialize(&frame)?)),
            None => Ok(None),
        }
    }
}

impl<D, E: Serialize> Encoder<E> for MessageCodec<D, E> {
    type Error = ProtocolError;

    fn encode(&mut self, item: E, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        let payload = bincode::serialize(&item)?;
        self.inner.encode(Bytes::from(payload), dst)?;
        Ok(())
    }
}
