//! Length-prefixed framing over a byte stream.
//!
//! Every link-stage message is a [`LinkHeader`] followed by exactly
//! `header.size()` body bytes. Sockets hand data back in whatever pieces they
//! like, so all reads go through [`read_exact_accumulating`], which keeps
//! asking for the bytes still missing until it has them all.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use zerocopy::AsBytes;

use spicegate_core::wire::{LinkHeader, WireError, LINK_HEADER_SIZE};

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("i/o: {0}")]
    Io(#[from] io::Error),
    #[error("wire: {0}")]
    Wire(#[from] WireError),
}

impl FrameError {
    /// Whether the peer closed the stream before a full message arrived.
    pub fn is_eof(&self) -> bool {
        matches!(self, FrameError::Io(e) if e.kind() == io::ErrorKind::UnexpectedEof)
    }
}

/// Read exactly `n` bytes.
///
/// Each underlying read is offered only the bytes still pending, so nothing
/// past the requested message is consumed. A read of zero bytes before `n`
/// are in hand is `UnexpectedEof`. `n == 0` returns at once without touching
/// the stream.
pub async fn read_exact_accumulating<R>(reader: &mut R, n: usize) -> Result<Vec<u8>, FrameError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut buf = vec![0u8; n];
    let mut filled = 0;
    while filled < n {
        let read = reader.read(&mut buf[filled..]).await?;
        if read == 0 {
            return Err(FrameError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("stream closed after {filled} of {n} bytes"),
            )));
        }
        filled += read;
    }
    Ok(buf)
}

/// Read one framed message: header, then its body.
pub async fn read_message<R>(reader: &mut R) -> Result<(LinkHeader, Vec<u8>), FrameError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let raw = read_exact_accumulating(reader, LINK_HEADER_SIZE).await?;
    let header = LinkHeader::decode(&raw)?;
    let body = read_exact_accumulating(reader, header.size() as usize).await?;
    tracing::trace!(size = header.size(), "read link message");
    Ok((header, body))
}

/// Write a framed message as a single buffer.
pub async fn write_message<W>(writer: &mut W, header: &LinkHeader, body: &[u8]) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut out = Vec::with_capacity(LINK_HEADER_SIZE + body.len());
    out.extend_from_slice(header.as_bytes());
    out.extend_from_slice(body);
    write_raw(writer, &out).await
}

/// Write unframed bytes (tickets, auth selections, ciphertext).
pub async fn write_raw<W>(writer: &mut W, bytes: &[u8]) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    writer.write_all(bytes).await?;
    writer.flush().await?;
    Ok(())
}
