//! Control listener - one JSON request per line, one response line back
//!
//! Each connection gets its own handler. A connection stays open after an
//! error response; it ends when the client closes it. Lines longer than
//! [`MAX_LINE`] are answered with an error and skipped.

use anyhow::{Context, Result};
use cadence_task::{Cadence, Response};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tracing::{debug, info, warn};

/// Longest request line accepted, in bytes
pub const MAX_LINE: usize = 1024 * 1024;

pub struct ControlServer {
    listener: TcpListener,
    cadence: Arc<Cadence>,
}

impl ControlServer {
    pub async fn bind(addr: impl ToSocketAddrs, cadence: Arc<Cadence>) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .context("Failed to bind control listener")?;
        Ok(Self { listener, cadence })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until the future is dropped
    pub async fn serve(self) {
        loop {
            match self.listener.accept().await {
                Ok((stream, peer)) => {
                    debug!(%peer, "Client connected");
                    let cadence = Arc::clone(&self.cadence);
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, cadence).await {
                            warn!(%peer, "Connection ended with error: {}", e);
                        }
                        debug!(%peer, "Client disconnected");
                    });
                }
                Err(e) => warn!("Failed to accept connection: {}", e),
            }
        }
    }
}

async fn handle_connection(stream: TcpStream, cadence: Arc<Cadence>) -> Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();

    loop {
        buf.clear();
        let read = (&mut reader)
            .take(MAX_LINE as u64 + 1)
            .read_until(b'\n', &mut buf)
            .await?;
        if read == 0 {
            return Ok(());
        }

        let response = if buf.len() > MAX_LINE && buf.last() != Some(&b'\n') {
            discard_line(&mut reader).await?;
            Response::malformed(format!("request line exceeds {} bytes", MAX_LINE))
        } else {
            // Undecodable bytes still get an answer
            let line = String::from_utf8_lossy(&buf);
            if line.trim().is_empty() {
                continue;
            }
            cadence.handle_line(&line).await
        };
        if response.is_error() {
            info!("{}", response);
        }
        writer.write_all(format!("{}\n", response).as_bytes()).await?;
        writer.flush().await?;
    }
}

/// Skip input up to and including the next newline
async fn discard_line<R: AsyncBufRead + Unpin>(reader: &mut R) -> std::io::Result<()> {
    loop {
        let (found, used) = {
            let available = reader.fill_buf().await?;
            if available.is_empty() {
                return Ok(());
            }
            match available.iter().position(|b| *b == b'\n') {
                Some(at) => (true, at + 1),
                None => (false, available.len()),
            }
        };
        reader.consume(used);
        if found {
            return Ok(());
        }
    }
}
