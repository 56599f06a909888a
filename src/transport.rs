//! Byte-stream transport to the controller
//!
//! The protocol layer never touches sockets. It sends raw bytes and asks for
//! everything up to the first of a set of markers through [`MarkerReader`],
//! which hands back the exact bytes consumed (marker included) so the caller
//! can tell which marker ended the reply.

use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::Instant;
use tracing::debug;

use crate::protocol::escape;
use crate::{KHIError, Result};

const READ_CHUNK: usize = 512;

/// Raw connection to an AS terminal
#[async_trait]
pub trait Transport: Send {
    async fn send(&mut self, data: &[u8]) -> Result<()>;

    /// Reads whatever is available, waiting at most `timeout` (forever when `None`).
    ///
    /// Returns `KHIError::Timeout` when nothing arrives in time and
    /// `KHIError::Connection` when the peer closed the stream.
    async fn receive(&mut self, buf: &mut [u8], timeout: Option<Duration>) -> Result<usize>;

    async fn close(&mut self) -> Result<()>;
}

/// TCP transport for the controller or K-ROSET
pub struct TcpTransport {
    stream: Option<TcpStream>,
    peer: String,
}

impl TcpTransport {
    pub async fn connect(host: &str, port: u16, timeout: Duration) -> Result<Self> {
        let peer = format!("{}:{}", host, port);
        let stream = tokio::time::timeout(timeout, TcpStream::connect((host, port)))
            .await
            .map_err(|_| KHIError::Connection(format!("Timed out connecting to {}", peer)))?
            .map_err(|e| KHIError::Connection(format!("Failed to connect to {}: {}", peer, e)))?;
        stream.set_nodelay(true)?;

        debug!("Connected to {}", peer);
        Ok(Self {
            stream: Some(stream),
            peer,
        })
    }

    fn stream(&mut self) -> Result<&mut TcpStream> {
        let peer = &self.peer;
        self.stream
            .as_mut()
            .ok_or_else(|| KHIError::Connection(format!("Connection to {} is closed", peer)))
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn send(&mut self, data: &[u8]) -> Result<()> {
        let stream = self.stream()?;
        stream.write_all(data).await?;
        stream.flush().await?;
        Ok(())
    }

    async fn receive(&mut self, buf: &mut [u8], timeout: Option<Duration>) -> Result<usize> {
        let stream = self.stream()?;
        let n = match timeout {
            Some(limit) => tokio::time::timeout(limit, stream.read(buf))
                .await
                .map_err(|_| KHIError::Timeout {
                    waited: limit,
                    expected: "controller reply".to_string(),
                })??,
            None => stream.read(buf).await?,
        };

        if n == 0 {
            let peer = self.peer.clone();
            self.stream = None;
            return Err(KHIError::Connection(format!("{} closed the connection", peer)));
        }
        Ok(n)
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(mut stream) = self.stream.take() {
            stream.shutdown().await?;
            debug!("Disconnected from {}", self.peer);
        }
        Ok(())
    }
}

/// Accumulates bytes from a [`Transport`] until a marker matches
///
/// Bytes read past the end of a matched marker are kept for the next call,
/// so replies are never merged or lost even though reads are chunked.
pub struct MarkerReader {
    transport: Box<dyn Transport>,
    pending: Vec<u8>,
}

impl MarkerReader {
    pub fn new(transport: Box<dyn Transport>) -> Self {
        Self {
            transport,
            pending: Vec::new(),
        }
    }

    pub async fn send(&mut self, data: &[u8]) -> Result<()> {
        debug!("send: {}", escape(data));
        self.transport.send(data).await
    }

    /// Reads until the buffer ends with any of `markers`.
    ///
    /// The returned buffer holds everything consumed, the matched marker included.
    /// `timeout` bounds the whole wait; `None` waits indefinitely.
    pub async fn receive_until(
        &mut self,
        timeout: Option<Duration>,
        markers: &[&[u8]],
    ) -> Result<Vec<u8>> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut buffer = std::mem::take(&mut self.pending);
        let mut scanned = 0;
        let mut chunk = [0u8; READ_CHUNK];

        loop {
            if let Some(end) = match_end(&buffer, scanned, markers) {
                self.pending = buffer.split_off(end);
                debug!("recv: {}", escape(&buffer));
                return Ok(buffer);
            }
            scanned = buffer.len();

            let remaining = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(timeout_error(timeout, markers, &buffer));
                    }
                    Some(deadline - now)
                }
                None => None,
            };

            match self.transport.receive(&mut chunk, remaining).await {
                Ok(n) => buffer.extend_from_slice(&chunk[..n]),
                Err(KHIError::Timeout { .. }) => {
                    return Err(timeout_error(timeout, markers, &buffer));
                }
                Err(e) => return Err(e),
            }
        }
    }

    pub async fn close(&mut self) -> Result<()> {
        self.pending.clear();
        self.transport.close().await
    }
}

/// Earliest buffer length past `scanned` at which the buffer ends with a marker
fn match_end(buffer: &[u8], scanned: usize, markers: &[&[u8]]) -> Option<usize> {
    (scanned + 1..=buffer.len()).find(|&end| {
        markers
            .iter()
            .any(|marker| !marker.is_empty() && buffer[..end].ends_with(marker))
    })
}

fn timeout_error(timeout: Option<Duration>, markers: &[&[u8]], buffer: &[u8]) -> KHIError {
    debug!("timed out with partial reply: {}", escape(buffer));
    let expected = markers
        .iter()
        .map(|m| format!("\"{}\"", escape(m)))
        .collect::<Vec<_>>()
        .join(" | ");
    KHIError::Timeout {
        waited: timeout.unwrap_or_default(),
        expected,
    }
}

#[cfg(test)]
pub(crate) mod mock {
    //! Scripted in-memory controller for protocol tests

    use super::*;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    /// Every frame sent through a [`MockTransport`], in order
    pub type SentLog = Arc<Mutex<Vec<Vec<u8>>>>;

    pub struct MockTransport {
        readable: VecDeque<u8>,
        script: VecDeque<(Vec<u8>, Vec<u8>)>,
        sent: SentLog,
        stall: bool,
    }

    impl MockTransport {
        pub fn new() -> Self {
            Self {
                readable: VecDeque::new(),
                script: VecDeque::new(),
                sent: Arc::new(Mutex::new(Vec::new())),
                stall: false,
            }
        }

        /// Never answers once the script runs dry, like a wedged controller
        pub fn stalling(mut self) -> Self {
            self.stall = true;
            self
        }

        /// Bytes available before anything is sent
        pub fn greeting(mut self, bytes: &[u8]) -> Self {
            self.readable.extend(bytes);
            self
        }

        /// Expects `sent` as the next frame and answers with `reply`
        pub fn expect(mut self, sent: impl AsRef<[u8]>, reply: impl AsRef<[u8]>) -> Self {
            self.script
                .push_back((sent.as_ref().to_vec(), reply.as_ref().to_vec()));
            self
        }

        /// Expects a command line and answers with its echo, `body` and the prompt
        pub fn command(self, line: &str, body: &str) -> Self {
            let reply = format!("{}\r\n{}>", line, body);
            self.expect(format!("{}\n", line), reply)
        }

        pub fn sent_log(&self) -> SentLog {
            Arc::clone(&self.sent)
        }

        /// Sent frames rendered as text
        pub fn render(log: &SentLog) -> Vec<String> {
            log.lock()
                .unwrap()
                .iter()
                .map(|frame| String::from_utf8_lossy(frame).into_owned())
                .collect()
        }
    }

    #[async_trait]
    impl Transport for MockTransport {
        async fn send(&mut self, data: &[u8]) -> Result<()> {
            self.sent.lock().unwrap().push(data.to_vec());
            let (expected, reply) = self
                .script
                .pop_front()
                .unwrap_or_else(|| panic!("unexpected send: {}", escape(data)));
            assert_eq!(
                escape(data),
                escape(&expected),
                "controller received an unexpected frame"
            );
            self.readable.extend(reply);
            Ok(())
        }

        async fn receive(&mut self, buf: &mut [u8], timeout: Option<Duration>) -> Result<usize> {
            if self.readable.is_empty() && self.stall {
                std::future::pending::<()>().await;
            }
            if self.readable.is_empty() {
                return Err(KHIError::Timeout {
                    waited: timeout.unwrap_or_default(),
                    expected: "mock reply".to_string(),
                });
            }
            let n = buf.len().min(self.readable.len());
            for (slot, byte) in buf.iter_mut().zip(self.readable.drain(..n)) {
                *slot = byte;
            }
            Ok(n)
        }

        async fn close(&mut self) -> Result<()> {
            Ok(())
        }
    }
}
