use anyhow::{anyhow, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::message::{Message, MessageType, PushNodeState, PushPull};

/// Datagrams carrying more than this are refused before they hit the wire.
pub(crate) const MAX_UDP_PACKET_SIZE: usize = 1400;

/// Type byte plus the part count of a compound datagram.
pub(crate) const COMPOUND_HEADER_OVERHEAD: usize = 2;

/// Length-table cost of each part inside a compound datagram.
pub(crate) const COMPOUND_OVERHEAD: usize = 2;

/// Upper bound on a single state-exchange frame; anything larger is a
/// corrupt or hostile peer.
const MAX_STATE_EXCHANGE_SIZE: usize = 8 * 1024 * 1024;

pub(crate) struct MessageCodec;

impl MessageCodec {
    pub(crate) fn new() -> Self {
        MessageCodec
    }

    fn read_bytes(src: &mut BytesMut, size: usize) -> Result<BytesMut> {
        if src.remaining() < size {
            return Err(anyhow!("buffer underflow: not enough data"));
        }
        Ok(src.split_to(size))
    }

    fn put_length_prefixed<T: Serialize>(value: &T, dst: &mut BytesMut) -> Result<()> {
        let bytes = bincode::serialize(value)?;
        dst.put_u32(bytes.len() as u32);
        dst.extend_from_slice(&bytes);
        Ok(())
    }

    fn read_length_prefixed<T: DeserializeOwned>(src: &mut BytesMut) -> Result<T> {
        let len = Self::read_bytes(src, 4)?.get_u32() as usize;
        let data = Self::read_bytes(src, len)?;
        Ok(bincode::deserialize(&data)?)
    }
}

impl Encoder<Message> for MessageCodec {
    type Error = anyhow::Error;

    /// Encodes a message as a type byte followed by a length-prefixed
    /// bincode payload.
    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.put_u8(item.kind() as u8);
        match &item {
            Message::Ping(p) => Self::put_length_prefixed(p, dst),
            Message::IndirectPing(p) => Self::put_length_prefixed(p, dst),
            Message::Ack(p) => Self::put_length_prefixed(p, dst),
            Message::Suspect(p) => Self::put_length_prefixed(p, dst),
            Message::Alive(p) => Self::put_length_prefixed(p, dst),
            Message::Dead(p) => Self::put_length_prefixed(p, dst),
            Message::PushPull(p) => Self::put_length_prefixed(p, dst),
        }
    }
}

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = anyhow::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.is_empty() {
            return Ok(None);
        }

        let kind = MessageType::from_u8(src.get_u8())?;
        let message = match kind {
            MessageType::Ping => Message::Ping(Self::read_length_prefixed(src)?),
            MessageType::IndirectPing => Message::IndirectPing(Self::read_length_prefixed(src)?),
            MessageType::Ack => Message::Ack(Self::read_length_prefixed(src)?),
            MessageType::Suspect => Message::Suspect(Self::read_length_prefixed(src)?),
            MessageType::Alive => Message::Alive(Self::read_length_prefixed(src)?),
            MessageType::Dead => Message::Dead(Self::read_length_prefixed(src)?),
            MessageType::PushPull => Message::PushPull(Self::read_length_prefixed(src)?),
            MessageType::Compound => {
                return Err(anyhow!("compound messages must be split before decoding"))
            }
        };

        Ok(Some(message))
    }
}

pub(crate) fn encode_message(message: &Message) -> Result<BytesMut> {
    let mut buffer = BytesMut::new();
    MessageCodec::new().encode(message.clone(), &mut buffer)?;
    Ok(buffer)
}

pub(crate) fn decode_message(src: &mut BytesMut) -> Result<Message> {
    MessageCodec::new()
        .decode(src)?
        .ok_or_else(|| anyhow!("empty message buffer"))
}

/// Concatenates already-encoded messages into one datagram with a count
/// and a length table up front.
pub(crate) fn make_compound_message(msgs: &[Bytes]) -> BytesMut {
    let total: usize = msgs.iter().map(|m| m.len()).sum();
    let mut buffer =
        BytesMut::with_capacity(COMPOUND_HEADER_OVERHEAD + COMPOUND_OVERHEAD * msgs.len() + total);

    buffer.put_u8(MessageType::Compound as u8);
    buffer.put_u8(msgs.len() as u8);
    for msg in msgs {
        buffer.put_u16(msg.len() as u16);
    }
    for msg in msgs {
        buffer.extend_from_slice(msg);
    }
    buffer
}

/// Splits a compound datagram back into its parts. Expects the type byte
/// to have been consumed already.
pub(crate) fn split_compound_message(src: &mut BytesMut) -> Result<Vec<BytesMut>> {
    if src.remaining() < 1 {
        return Err(anyhow!("compound message truncated: missing count"));
    }
    let count = src.get_u8() as usize;

    if src.remaining() < count * 2 {
        return Err(anyhow!("compound message truncated: missing length table"));
    }
    let lengths: Vec<usize> = (0..count).map(|_| src.get_u16() as usize).collect();

    let mut parts = Vec::with_capacity(count);
    for len in lengths {
        if src.remaining() < len {
            return Err(anyhow!("compound message truncated: missing part"));
        }
        parts.push(src.split_to(len));
    }
    Ok(parts)
}

/// Writes one length-framed state-exchange message to a stream.
pub(crate) async fn write_push_pull<S>(stream: &mut S, states: Vec<PushNodeState>) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    let buffer = encode_message(&Message::PushPull(PushPull { states }))?;
    stream.write_u32(buffer.len() as u32).await?;
    stream.write_all(&buffer).await?;
    stream.flush().await?;
    Ok(())
}

/// Reads the counterpart of [`write_push_pull`] from a stream.
pub(crate) async fn read_push_pull<S>(stream: &mut S) -> Result<Vec<PushNodeState>>
where
    S: AsyncRead + Unpin,
{
    let len = stream.read_u32().await? as usize;
    if len > MAX_STATE_EXCHANGE_SIZE {
        return Err(anyhow!("state exchange frame too large: {} bytes", len));
    }

    let mut buffer = vec![0u8; len];
    stream.read_exact(&mut buffer).await?;

    match decode_message(&mut BytesMut::from(&buffer[..]))? {
        Message::PushPull(push_pull) => Ok(push_pull.states),
        other => Err(anyhow!(
            "unexpected {} message during state exchange",
            other.kind()
        )),
    }
}
