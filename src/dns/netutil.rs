use std::io::{Error, ErrorKind, Result};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub async fn read_packet_length<R: AsyncRead + Unpin>(stream: &mut R) -> Result<u16> {
    let mut len_buffer = [0; 2];
    stream.read_exact(&mut len_buffer).await?;

    Ok(((len_buffer[0] as u16) << 8) | (len_buffer[1] as u16))
}

pub async fn write_packet_length<W: AsyncWrite + Unpin>(stream: &mut W, len: usize) -> Result<()> {
    if len > 0xFFFF {
        return Err(Error::new(
            ErrorKind::InvalidInput,
            format!("message of {} bytes does not fit a length prefix", len),
        ));
    }

    let mut len_buffer = [0; 2];
    len_buffer[0] = (len >> 8) as u8;
    len_buffer[1] = (len & 0xFF) as u8;

    stream.write_all(&len_buffer).await?;

    Ok(())
}

/// Reads one length prefixed message from a stream.
pub async fn read_packet<R: AsyncRead + Unpin>(stream: &mut R) -> Result<Vec<u8>> {
    let len = read_packet_length(stream).await? as usize;

    let mut data = vec![0; len];
    stream.read_exact(&mut data).await?;

    Ok(data)
}

/// Writes one message to a stream, prefixed with its two byte length.
pub async fn write_packet<W: AsyncWrite + Unpin>(stream: &mut W, data: &[u8]) -> Result<()> {
    write_packet_length(stream, data.len()).await?;
    stream.write_all(data).await?;
    stream.flush().await?;

    Ok(())
}
