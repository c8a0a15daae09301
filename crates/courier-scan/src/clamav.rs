//! ClamAV INSTREAM client.
//!
//! Wire format: the literal preamble `zINSTREAM\0`, then the file as a
//! sequence of chunks each prefixed by a 4-byte big-endian length, closed
//! by a zero-length chunk. The daemon answers one line, terminated by
//! newline or NUL; `OK` means clean, `FOUND` means infected.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::warn;

use courier_core::config::ScannerConfig;

use crate::{ScanOutcome, ScanStatus, VirusScanner};

const PREAMBLE: &[u8] = b"zINSTREAM\0";
const CHUNK_SIZE: usize = 2048;

pub struct ClamAvScanner {
    config: ScannerConfig,
}

impl ClamAvScanner {
    pub fn new(config: ScannerConfig) -> Self {
        Self { config }
    }

    async fn scan_inner(&self, path: &Path) -> std::io::Result<String> {
        let deadline = Duration::from_secs(self.config.timeout_secs);
        let addr = (self.config.host.as_str(), self.config.port);
        let stream = timeout(deadline, TcpStream::connect(addr))
            .await
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "connect timed out"))??;
        let file = tokio::fs::File::open(path).await?;
        timeout(deadline, instream_exchange(stream, file))
            .await
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "scan timed out"))?
    }
}

#[async_trait]
impl VirusScanner for ClamAvScanner {
    async fn scan(&self, path: &Path) -> ScanOutcome {
        if !self.config.enabled {
            return ScanOutcome::new(ScanStatus::Skipped, "Virus scan disabled.");
        }
        match self.scan_inner(path).await {
            Ok(reply) => {
                let reply = reply.trim().to_string();
                ScanOutcome::new(classify_reply(&reply), reply)
            }
            Err(e) => {
                warn!(error = %e, "Virus scan failed");
                if self.config.fail_closed {
                    ScanOutcome::new(ScanStatus::Failed, e.to_string())
                } else {
                    ScanOutcome::new(ScanStatus::Skipped, "Scanner unavailable.")
                }
            }
        }
    }
}

/// Run one INSTREAM exchange over an established connection; returns the
/// daemon's reply. Generic over the transport so tests can drive it with
/// an in-memory duplex stream.
pub async fn instream_exchange<S, F>(mut stream: S, mut file: F) -> std::io::Result<String>
where
    S: AsyncRead + AsyncWrite + Unpin,
    F: AsyncRead + Unpin,
{
    stream.write_all(PREAMBLE).await?;

    let mut buffer = [0u8; CHUNK_SIZE];
    loop {
        let read = file.read(&mut buffer).await?;
        if read == 0 {
            break;
        }
        stream.write_all(&(read as u32).to_be_bytes()).await?;
        stream.write_all(&buffer[..read]).await?;
    }
    stream.write_all(&0u32.to_be_bytes()).await?;
    stream.flush().await?;

    read_reply(&mut stream).await
}

async fn read_reply<S: AsyncRead + Unpin>(stream: &mut S) -> std::io::Result<String> {
    let mut reply = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        let read = stream.read(&mut byte).await?;
        if read == 0 || byte[0] == b'\n' || byte[0] == 0 {
            break;
        }
        reply.push(byte[0]);
    }
    Ok(String::from_utf8_lossy(&reply).into_owned())
}

/// Classify a daemon reply by substring, as clamd's protocol intends.
pub fn classify_reply(reply: &str) -> ScanStatus {
    if reply.contains("OK") {
        ScanStatus::Clean
    } else if reply.contains("FOUND") {
        ScanStatus::Infected
    } else {
        ScanStatus::Failed
    }
}
