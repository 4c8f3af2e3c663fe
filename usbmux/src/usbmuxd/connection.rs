//! One connection to usbmuxd, speaking whole frames

use std::time::Duration;

use log::{debug, warn};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use super::{
    header::{decode_header, encode_header, Header, MessageType, HEADER_SIZE},
    UsbmuxdAddr,
};
use crate::{ReadWrite, UsbmuxdError};

const READ_CHUNK: usize = 4096;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub header: Header,
    pub payload: Vec<u8>,
}

/// A single connection to the daemon.
///
/// Inbound bytes are buffered until a whole frame is present, so a receive
/// that times out leaves the connection intact. Any send or read failure
/// closes the connection for good.
#[derive(Debug)]
pub struct UsbmuxdConnection {
    socket: Option<Box<dyn ReadWrite>>,
    buffer: Vec<u8>,
    default_timeout: Duration,
}

impl UsbmuxdConnection {
    pub async fn open(addr: &UsbmuxdAddr, default_timeout: Duration) -> Result<Self, UsbmuxdError> {
        let socket = addr.connect().await?;
        debug!("Connected to usbmuxd at {addr}");
        Ok(Self::new(socket, default_timeout))
    }

    pub fn new(socket: Box<dyn ReadWrite>, default_timeout: Duration) -> Self {
        Self {
            socket: Some(socket),
            buffer: Vec::new(),
            default_timeout,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.socket.is_none()
    }

    /// Writes one frame: the header, then the payload if there is one.
    pub async fn send(
        &mut self,
        version: u32,
        message: MessageType,
        tag: u32,
        payload: &[u8],
    ) -> Result<(), UsbmuxdError> {
        let socket = self.socket.as_mut().ok_or(UsbmuxdError::Closed)?;
        let length = u32::try_from(HEADER_SIZE + payload.len()).map_err(|_| {
            UsbmuxdError::MalformedFrame(format!("payload of {} bytes is too large", payload.len()))
        })?;
        let header = encode_header(length, version, message, tag);

        let res = async {
            socket.write_all(&header).await?;
            if !payload.is_empty() {
                socket.write_all(payload).await?;
            }
            socket.flush().await
        }
        .await;

        if let Err(e) = res {
            warn!("Failed to send {message:?} frame, closing connection: {e}");
            self.socket = None;
            return Err(e.into());
        }
        debug!("Sent {message:?} frame with tag {tag} ({length} bytes)");
        Ok(())
    }

    /// Waits for the next whole frame.
    ///
    /// Returns `Ok(None)` if nothing complete arrived within `timeout`.
    /// A missing or zero timeout uses the connection default.
    pub async fn receive(
        &mut self,
        timeout: Option<Duration>,
    ) -> Result<Option<Frame>, UsbmuxdError> {
        let timeout = match timeout {
            Some(t) if !t.is_zero() => t,
            _ => self.default_timeout,
        };
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            if let Some(frame) = self.take_frame()? {
                return Ok(Some(frame));
            }
            let socket = self.socket.as_mut().ok_or(UsbmuxdError::Closed)?;
            self.buffer.reserve(READ_CHUNK);

            match tokio::time::timeout_at(deadline, socket.read_buf(&mut self.buffer)).await {
                Err(_) => return Ok(None),
                Ok(Ok(0)) => {
                    debug!("usbmuxd closed the connection");
                    self.socket = None;
                    return Err(UsbmuxdError::Closed);
                }
                Ok(Ok(_)) => {}
                Ok(Err(e)) => {
                    warn!("Failed to read from usbmuxd, closing connection: {e}");
                    self.socket = None;
                    return Err(e.into());
                }
            }
        }
    }

    fn take_frame(&mut self) -> Result<Option<Frame>, UsbmuxdError> {
        if self.buffer.len() < HEADER_SIZE {
            return Ok(None);
        }
        let header = match decode_header(&self.buffer[..HEADER_SIZE]) {
            Ok(h) => h,
            Err(e) => {
                self.socket = None;
                return Err(e);
            }
        };
        let total = header.length as usize;
        if self.buffer.len() < total {
            return Ok(None);
        }
        let payload = self.buffer[HEADER_SIZE..total].to_vec();
        self.buffer.drain(..total);
        Ok(Some(Frame { header, payload }))
    }

    pub async fn close(&mut self) {
        if let Some(mut socket) = self.socket.take() {
            if let Err(e) = socket.shutdown().await {
                debug!("Error shutting down usbmuxd connection: {e}");
            }
        }
        self.buffer.clear();
    }

    /// Hands over the raw socket along with any bytes already read past the last frame.
    pub(crate) fn into_parts(mut self) -> Option<(Box<dyn ReadWrite>, Vec<u8>)> {
        let socket = self.socket.take()?;
        Some((socket, std::mem::take(&mut self.buffer)))
    }
}
