use std::io;

use prost::Message as ProstMessage;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound on a single payload; larger prefixes are treated as garbage.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

const LEN_PREFIX: usize = 4;

/// Admin message kinds, sent as the byte preceding the admin frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdminKind {
    CapacityRequest = 1,
    Configuration = 2,
    CapacityQuery = 3,
}

impl AdminKind {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(AdminKind::CapacityRequest),
            2 => Some(AdminKind::Configuration),
            3 => Some(AdminKind::CapacityQuery),
            _ => None,
        }
    }
}

/// Reads one length-prefixed payload.
///
/// Returns `Ok(None)` when the stream ends before a full length prefix.
pub async fn read_frame<R>(reader: &mut R) -> io::Result<Option<Vec<u8>>>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; LEN_PREFIX];
    if let Err(err) = reader.read_exact(&mut len_buf).await {
        return match err.kind() {
            io::ErrorKind::UnexpectedEof => Ok(None),
            _ => Err(err),
        };
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame of {len} bytes exceeds limit of {MAX_FRAME_LEN}"),
        ));
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(Some(payload))
}

pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&encode_frame(payload)?).await?;
    writer.flush().await
}

/// Prefixes `payload` with its big-endian length.
pub fn encode_frame(payload: &[u8]) -> io::Result<Vec<u8>> {
    let len = u32::try_from(payload.len())
        .ok()
        .filter(|len| *len as usize <= MAX_FRAME_LEN)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "payload too large"))?;
    let mut framed = Vec::with_capacity(LEN_PREFIX + payload.len());
    framed.extend_from_slice(&len.to_be_bytes());
    framed.extend_from_slice(payload);
    Ok(framed)
}

pub async fn read_message<R, T>(reader: &mut R) -> io::Result<Option<T>>
where
    R: AsyncRead + Unpin,
    T: ProstMessage + Default,
{
    match read_frame(reader).await? {
        Some(payload) => T::decode(payload.as_slice())
            .map(Some)
            .map_err(to_io_error),
        None => Ok(None),
    }
}

pub async fn write_message<W, T>(writer: &mut W, message: &T) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
    T: ProstMessage,
{
    write_frame(writer, &message.encode_to_vec()).await
}

/// Reads `[kind][len][payload]`. End of stream anywhere before the payload
/// yields `Ok(None)`.
pub async fn read_admin_frame<R>(reader: &mut R) -> io::Result<Option<(u8, Vec<u8>)>>
where
    R: AsyncRead + Unpin,
{
    let kind = match reader.read_u8().await {
        Ok(kind) => kind,
        Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err),
    };
    Ok(read_frame(reader).await?.map(|payload| (kind, payload)))
}

pub async fn write_admin_frame<W, T>(writer: &mut W, kind: AdminKind, message: &T) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
    T: ProstMessage,
{
    let mut buf = vec![kind as u8];
    buf.extend_from_slice(&encode_frame(&message.encode_to_vec())?);
    writer.write_all(&buf).await?;
    writer.flush().await
}

/// Peer handshake: the dialer's node id as a raw big-endian i32.
pub async fn write_handshake<W>(writer: &mut W, node_id: i32) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_i32(node_id).await?;
    writer.flush().await
}

pub async fn read_handshake<R>(reader: &mut R) -> io::Result<i32>
where
    R: AsyncRead + Unpin,
{
    reader.read_i32().await
}

fn to_io_error(err: prost::DecodeError) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::{Capacity, Configuration, Message, Response};

    #[tokio::test]
    async fn clean_eof_is_not_an_error() {
        let (writer, mut reader) = tokio::io::duplex(64);
        drop(writer);
        let frame = read_frame(&mut reader).await.expect("read frame");
        assert!(frame.is_none());
    }

    #[tokio::test]
    async fn zero_length_frame_is_an_empty_payload() {
        let (mut writer, mut reader) = tokio::io::duplex(64);
        write_frame(&mut writer, &[]).await.expect("write frame");
        let frame = read_frame(&mut reader).await.expect("read frame");
        assert_eq!(frame, Some(Vec::new()));
    }

    #[tokio::test]
    async fn oversized_prefix_is_rejected() {
        let (mut writer, mut reader) = tokio::io::duplex(64);
        writer
            .write_all(&u32::MAX.to_be_bytes())
            .await
            .expect("write prefix");
        let err = read_frame(&mut reader).await.expect_err("oversized frame");
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn truncated_payload_is_an_error() {
        let (mut writer, mut reader) = tokio::io::duplex(64);
        writer.write_all(&8u32.to_be_bytes()).await.expect("prefix");
        writer.write_all(&[1, 2, 3]).await.expect("partial payload");
        drop(writer);
        let err = read_frame(&mut reader).await.expect_err("truncated frame");
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn admin_frame_carries_kind_and_payload() {
        let (mut writer, mut reader) = tokio::io::duplex(256);
        let config = Configuration::start(2, 1);
        write_admin_frame(&mut writer, AdminKind::Configuration, &config)
            .await
            .expect("write admin frame");

        let (kind, payload) = read_admin_frame(&mut reader)
            .await
            .expect("read admin frame")
            .expect("expected a frame");
        assert_eq!(AdminKind::from_byte(kind), Some(AdminKind::Configuration));
        assert_eq!(Configuration::decode(payload.as_slice()).expect("decode"), config);
    }

    #[tokio::test]
    async fn messages_follow_each_other_on_one_stream() {
        let (mut writer, mut reader) = tokio::io::duplex(256);
        write_message(&mut writer, &Message::sync()).await.expect("envelope");
        write_message(&mut writer, &Capacity::new(3, 7)).await.expect("capacity");

        let envelope: Message = read_message(&mut reader).await.expect("read").expect("envelope");
        assert_eq!(envelope.response(), Response::Yep);
        let capacity: Capacity = read_message(&mut reader).await.expect("read").expect("capacity");
        assert_eq!((capacity.server_id, capacity.server_status), (3, 7));
    }

    #[tokio::test]
    async fn handshake_is_big_endian() {
        let (mut writer, mut reader) = tokio::io::duplex(16);
        write_handshake(&mut writer, 2).await.expect("handshake");
        let mut raw = [0u8; 4];
        reader.read_exact(&mut raw).await.expect("raw bytes");
        assert_eq!(raw, [0, 0, 0, 2]);
    }

    #[test]
    fn unknown_admin_kind() {
        assert_eq!(AdminKind::from_byte(0), None);
        assert_eq!(AdminKind::from_byte(4), None);
    }
}
