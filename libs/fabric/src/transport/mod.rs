use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};

pub mod tcp;

pub use self::tcp::{TcpTransport, TcpTransportBuilder, TcpTransportListener};

/// Largest frame accepted from a peer (100MB)
pub const MAX_FRAME_LEN: usize = 100 * 1024 * 1024;

/// Read half of a length-prefixed connection
///
/// Frames carry a 4-byte big-endian length prefix
pub struct FrameReader<R> {
    inner: R,
}

impl<R: AsyncRead + Unpin + Send> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    /// Receive the next frame
    pub async fn receive(&mut self) -> Result<Vec<u8>> {
        let len = self.inner.read_u32().await.map_err(closed_on_eof)? as usize;

        if len > MAX_FRAME_LEN {
            return Err(Error::InvalidFrame(format!(
                "Message too large: {} bytes",
                len
            )));
        }

        let mut buf = vec![0u8; len];
        self.inner.read_exact(&mut buf).await.map_err(closed_on_eof)?;
        Ok(buf)
    }
}

/// Write half of a length-prefixed connection
pub struct FrameWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin + Send> FrameWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    /// Send one frame and flush it
    pub async fn send(&mut self, bytes: &[u8]) -> Result<()> {
        if bytes.len() > MAX_FRAME_LEN {
            return Err(Error::InvalidFrame(format!(
                "Message too large: {} bytes",
                bytes.len()
            )));
        }

        self.inner.write_u32(bytes.len() as u32).await?;
        self.inner.write_all(bytes).await?;
        self.inner.flush().await?;
        Ok(())
    }

    /// Shut down the write direction
    pub async fn close(&mut self) -> Result<()> {
        self.inner.shutdown().await?;
        Ok(())
    }
}

fn closed_on_eof(e: std::io::Error) -> Error {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        Error::ConnectionClosed
    } else {
        e.into()
    }
}
