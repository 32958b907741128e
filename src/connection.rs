use bytes::BytesMut;
use pin_project::pin_project;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt, BufWriter};
use tokio::net::TcpStream;

use crate::parser::{ErrorKind, Status};
use crate::Error;

/// Buffered TCP transport to one backend.
///
/// Writes are coalesced until a request is complete. Replies accumulate in a receive buffer and
/// are handed to a parser until it yields a complete response.
#[pin_project]
pub struct Connection {
    #[pin]
    stream: BufWriter<TcpStream>,
    buf: BytesMut,
    // Bytes of `buf` consumed by the last complete response.
    last_read_n: Option<usize>,
}

impl AsyncWrite for Connection {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context, buf: &[u8]) -> Poll<io::Result<usize>> {
        self.project().stream.poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context) -> Poll<io::Result<()>> {
        self.project().stream.poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context) -> Poll<io::Result<()>> {
        self.project().stream.poll_shutdown(cx)
    }
}

impl Connection {
    /// Opens a TCP connection to `host:port`.
    ///
    /// Any failure here is reported as [`Error::Connect`] so callers can tell a refused or
    /// unreachable backend apart from a broken established connection.
    pub async fn tcp(host: &str, port: u16) -> Result<Connection, Error> {
        let stream = TcpStream::connect((host, port))
            .await
            .map_err(Error::Connect)?;
        stream.set_nodelay(true).map_err(Error::Connect)?;

        Ok(Connection {
            stream: BufWriter::new(stream),
            buf: BytesMut::new(),
            last_read_n: None,
        })
    }

    /// Writes all `parts` as one request and flushes it.
    pub async fn send(&mut self, parts: &[&[u8]]) -> Result<(), Error> {
        for part in parts {
            self.write_all(part).await?;
        }
        self.flush().await?;
        Ok(())
    }

    /// Reads until `parse` recognizes a complete response.
    ///
    /// `parse` returns `Ok(None)` while the buffered data is only a prefix of a response.
    pub async fn receive<R, F>(&mut self, parse: F) -> Result<R, Error>
    where
        F: Fn(&[u8]) -> Result<Option<(usize, R)>, ErrorKind>,
    {
        // If we serviced a previous request, advance our buffer forward.
        if let Some(n) = self.last_read_n.take() {
            let _ = self.buf.split_to(n);
        }

        let mut needs_more_data = false;
        loop {
            if self.buf.is_empty() || needs_more_data {
                self.buf.reserve(1024);
                let n = self.stream.read_buf(&mut self.buf).await?;
                if n == 0 {
                    return Err(Error::Io(io::ErrorKind::UnexpectedEof.into()));
                }
            }

            match parse(&self.buf) {
                Ok(Some((n, response))) => {
                    self.last_read_n = Some(n);
                    return Ok(response);
                }
                Ok(None) => needs_more_data = true,
                // Invalid data not matching the protocol. The stream is out of step with the
                // requests, so nothing buffered can be trusted anymore.
                Err(kind) => {
                    self.buf.clear();
                    return Err(Status::Error(kind).into());
                }
            }
        }
    }
}
