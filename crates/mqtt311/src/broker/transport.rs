//! Framed packet I/O over any byte stream.
//!
//! Reads accumulate into a caller-owned buffer so a cancelled read
//! (the engine's select loop drops in-flight reads) never loses
//! partial frames.

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use mqtt311_protocol::packet::Packet;
use mqtt311_protocol::{MqttError, Result};

/// Reads one complete packet, classifying the frame with up to five
/// header bytes before decoding.
///
/// # Errors
/// Fails on malformed bytes, detection overflow, or end of stream.
pub async fn read_packet<S>(stream: &mut S, buf: &mut BytesMut) -> Result<Packet>
where
    S: AsyncRead + Unpin,
{
    loop {
        if let Some((total, _)) = Packet::detect(buf)? {
            if buf.len() >= total {
                let mut frame = buf.split_to(total).freeze();
                return Packet::decode(&mut frame);
            }
        }

        let read = stream.read_buf(buf).await?;
        if read == 0 {
            return Err(MqttError::ClientClosed);
        }
    }
}

/// Encodes and writes one packet, reusing `buf` as scratch space.
///
/// # Errors
/// Fails on illegal field values or a broken stream.
pub async fn write_packet<S>(stream: &mut S, buf: &mut BytesMut, packet: &Packet) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    buf.clear();
    packet.encode(buf)?;
    stream.write_all(buf).await?;
    stream.flush().await?;
    Ok(())
}
