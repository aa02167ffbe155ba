//! Message framing, compression and the (de)serialization seam.
//!
//! Payloads are opaque to the engine: a [`Codec`] turns typed messages into
//! bytes and back, everything below it works on byte buffers.

use bytes::{BufMut, Bytes, BytesMut};

use crate::Status;

pub mod compression;
pub mod decode;
pub mod encode;
pub mod frame;
pub mod source;

#[doc(inline)]
pub use self::{
    compression::{CompressionProvider, CompressionRegistry, CompressionRegistryBuilder},
    decode::Streaming,
    encode::{EncodeBody, MessageEncoder},
    frame::{Frame, FrameDecoder, FrameReader, HEADER_SIZE, encode_frame},
    source::{BodySource, ReadResult, ReadSource, TryRead},
};

/// Default maximum size of a received message, in bytes.
pub const DEFAULT_MAX_RECV_MESSAGE_SIZE: usize = 4 * 1024 * 1024;
/// Default maximum size of a sent message, in bytes.
pub const DEFAULT_MAX_SEND_MESSAGE_SIZE: usize = usize::MAX;

/// Trait that knows how to encode and decode gRPC messages.
pub trait Codec {
    /// The encodable message.
    type Encode: Send + 'static;
    /// The decodable message.
    type Decode: Send + 'static;

    /// The encoder that can encode a message.
    type Encoder: Encoder<Item = Self::Encode> + Send + 'static;
    /// The decoder that can decode a message.
    type Decoder: Decoder<Item = Self::Decode> + Send + 'static;

    /// Fetch the encoder.
    fn encoder(&mut self) -> Self::Encoder;
    /// Fetch the decoder.
    fn decoder(&mut self) -> Self::Decoder;
}

/// Encodes gRPC message types.
pub trait Encoder {
    /// The type that is encoded.
    type Item;

    /// Encodes a message into the provided buffer.
    fn encode(&mut self, item: Self::Item, dst: &mut BytesMut) -> Result<(), Status>;
}

/// Decodes gRPC message types.
pub trait Decoder {
    /// The type that is decoded.
    type Item;

    /// Decode a message from the complete, decompressed payload.
    fn decode(&mut self, src: Bytes) -> Result<Self::Item, Status>;
}

impl<E: Encoder + ?Sized> Encoder for Box<E> {
    type Item = E::Item;

    fn encode(&mut self, item: Self::Item, dst: &mut BytesMut) -> Result<(), Status> {
        (**self).encode(item, dst)
    }
}

impl<D: Decoder + ?Sized> Decoder for Box<D> {
    type Item = D::Item;

    fn decode(&mut self, src: Bytes) -> Result<Self::Item, Status> {
        (**self).decode(src)
    }
}

/// A [`Codec`] passing raw payload bytes through unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct BytesCodec;

impl Codec for BytesCodec {
    type Encode = Bytes;
    type Decode = Bytes;
    type Encoder = Self;
    type Decoder = Self;

    fn encoder(&mut self) -> Self::Encoder {
        Self
    }

    fn decoder(&mut self) -> Self::Decoder {
        Self
    }
}

impl Encoder for BytesCodec {
    type Item = Bytes;

    fn encode(&mut self, item: Self::Item, dst: &mut BytesMut) -> Result<(), Status> {
        dst.put(item);
        Ok(())
    }
}

impl Decoder for BytesCodec {
    type Item = Bytes;

    fn decode(&mut self, src: Bytes) -> Result<Self::Item, Status> {
        Ok(src)
    }
}
