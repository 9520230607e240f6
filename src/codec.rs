//! Tokio codecs over [`crate::frame`].
//!
//! [`ClientCodec`] is what a session puts in its `Framed` stream: it yields
//! complete, not yet validated replies and writes pre-framed request bytes.
//! [`ServerCodec`] is the daemon side used by the mock server.

use bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::WireError;
use crate::frame::{self, ClientMessage, RawReply};

#[derive(Debug, Clone, Copy, Default)]
pub struct ClientCodec;

impl Decoder for ClientCodec {
    type Item = RawReply;
    type Error = WireError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        frame::try_decode_reply(src)
    }
}

impl Encoder<Bytes> for ClientCodec {
    type Error = WireError;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.extend_from_slice(&item);
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ServerCodec;

impl Decoder for ServerCodec {
    type Item = ClientMessage;
    type Error = WireError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        frame::try_decode_request(src)
    }
}

impl Encoder<Bytes> for ServerCodec {
    type Error = WireError;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.extend_from_slice(&item);
        Ok(())
    }
}
