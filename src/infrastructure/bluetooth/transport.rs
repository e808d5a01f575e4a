//! Link abstraction and chunked writes
//!
//! The session engine only talks to a [`UartLink`]; the btleplug backend and
//! the scripted test link both implement it.

use crate::domain::error::SessionError;
use crate::infrastructure::bluetooth::protocol::{frame_command, CHUNK_SIZE};
use async_trait::async_trait;
use tracing::trace;

/// One physical connection to a device exposing a UART style service.
#[async_trait]
pub trait UartLink: Send {
    /// Resolve the service and its TX/RX characteristics.
    async fn discover(&mut self) -> Result<(), SessionError>;

    /// Enable notifications on the RX characteristic.
    async fn subscribe(&mut self) -> Result<(), SessionError>;

    /// A write characteristic is resolved and the link is open.
    fn is_writable(&self) -> bool;

    /// Write one packet and wait for the write to complete.
    async fn write_packet(&mut self, packet: &[u8]) -> Result<(), SessionError>;

    /// Next inbound notification. `None` once the link is gone.
    async fn next_fragment(&mut self) -> Option<Vec<u8>>;

    async fn disconnect(&mut self) -> Result<(), SessionError>;
}

/// Opens links to devices by their advertised name.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Link: UartLink + 'static;

    async fn connect(&self, device: &str) -> Result<Self::Link, SessionError>;
}

/// Splits outbound commands into fixed size packets written strictly in
/// order, each write awaited before the next starts.
#[derive(Debug, Clone, Copy)]
pub struct Chunker {
    chunk_size: usize,
}

impl Default for Chunker {
    fn default() -> Self {
        Self::new(CHUNK_SIZE)
    }
}

impl Chunker {
    pub fn new(chunk_size: usize) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
        }
    }

    /// Frame `text` as a command and write it. Returns the number of writes.
    pub async fn send<L: UartLink + ?Sized>(
        &self,
        link: &mut L,
        text: &str,
    ) -> Result<usize, SessionError> {
        self.send_bytes(link, &frame_command(text)).await
    }

    /// Write raw bytes in chunks. Fails with `NotConnected` before any write
    /// when the link has no write characteristic.
    pub async fn send_bytes<L: UartLink + ?Sized>(
        &self,
        link: &mut L,
        payload: &[u8],
    ) -> Result<usize, SessionError> {
        if !link.is_writable() {
            return Err(SessionError::NotConnected);
        }
        let mut writes = 0;
        for chunk in payload.chunks(self.chunk_size) {
            link.write_packet(chunk).await?;
            writes += 1;
        }
        trace!(bytes = payload.len(), writes, "Command written");
        Ok(writes)
    }
}
