//! Wire protocol for supervisor/worker exchange over a Unix-domain socket.
//!
//! Each connection carries exactly one request and one response, both UTF-8
//! JSON documents delimited by end-of-stream: the writer half-closes after
//! the document, the reader consumes until EOF. There is no length prefix.

mod types;

pub use types::{Profile, WireError, WireRequest, WireResponse};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};

/// Default upper bound on a single wire document.
pub const DEFAULT_MAX_DOCUMENT_BYTES: usize = 10 * 1024 * 1024; // 10 MB

/// Read one document: everything up to EOF, bounded by `max_bytes`.
pub async fn read_document<R>(reader: &mut R, max_bytes: usize) -> Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut buf = Vec::new();
    let mut limited = reader.take(max_bytes as u64 + 1);
    limited.read_to_end(&mut buf).await?;
    if buf.len() > max_bytes {
        return Err(Error::Protocol(format!(
            "document exceeds {max_bytes} bytes"
        )));
    }
    Ok(buf)
}

/// Write one document and half-close the write side to signal its end.
pub async fn write_document<W>(writer: &mut W, bytes: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(bytes).await?;
    writer.shutdown().await?;
    Ok(())
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn round_trip_over_duplex() {
        let (mut client, mut server) = tokio::io::duplex(1024);

        let payload = br#"{"moduleUrl":"builtin:echo","params":null}"#;
        write_document(&mut client, payload).await.unwrap();

        let read = read_document(&mut server, 1024).await.unwrap();
        assert_eq!(read, payload);
    }

    #[tokio::test]
    async fn oversized_document_rejected() {
        let (mut client, mut server) = tokio::io::duplex(1024);

        write_document(&mut client, &[b'x'; 64]).await.unwrap();

        let err = read_document(&mut server, 16).await.unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[tokio::test]
    async fn empty_stream_reads_empty_document() {
        let (client, mut server) = tokio::io::duplex(64);
        drop(client);

        let read = read_document(&mut server, 64).await.unwrap();
        assert!(read.is_empty());
    }
}
