//! Raw byte tunnels to a TCP port on a device

use std::{
    io,
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};

use log::debug;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};

use crate::{ReadWrite, UsbmuxdError};

/// A connection to a port on a device, proxied by usbmuxd.
///
/// After the connect handshake the daemon passes bytes through verbatim, so
/// there is no framing here.
#[derive(Debug)]
pub struct UsbmuxdTunnel {
    socket: Option<Box<dyn ReadWrite>>,
    /// Bytes that arrived together with the connect acknowledgement.
    pending: Vec<u8>,
    device_id: u32,
    port: u16,
    /// Bound on `recv_timeout` when the caller gives none.
    default_timeout: Duration,
}

impl UsbmuxdTunnel {
    pub(crate) fn new(
        socket: Box<dyn ReadWrite>,
        pending: Vec<u8>,
        device_id: u32,
        port: u16,
        default_timeout: Duration,
    ) -> Self {
        Self {
            socket: Some(socket),
            pending,
            device_id,
            port,
            default_timeout,
        }
    }

    pub fn device_id(&self) -> u32 {
        self.device_id
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn is_closed(&self) -> bool {
        self.socket.is_none()
    }

    /// Writes all of `data`, returning how many bytes were sent.
    ///
    /// A failed write closes the tunnel.
    pub async fn send(&mut self, data: &[u8]) -> Result<usize, UsbmuxdError> {
        let socket = self.socket.as_mut().ok_or(UsbmuxdError::Closed)?;
        let res = async {
            socket.write_all(data).await?;
            socket.flush().await
        }
        .await;

        if let Err(e) = res {
            debug!(
                "Write to device {} port {} failed, closing tunnel: {e}",
                self.device_id, self.port
            );
            self.socket = None;
            return Err(e.into());
        }
        Ok(data.len())
    }

    /// Reads whatever is available into `buf`.
    ///
    /// `Ok(None)` means nothing arrived within the timeout and `Ok(Some(0))`
    /// means the device side closed. A missing or zero timeout uses the
    /// context's default timeout.
    pub async fn recv_timeout(
        &mut self,
        buf: &mut [u8],
        timeout: Option<Duration>,
    ) -> Result<Option<usize>, UsbmuxdError> {
        if self.socket.is_none() && self.pending.is_empty() {
            return Err(UsbmuxdError::Closed);
        }
        let timeout = match timeout {
            Some(t) if !t.is_zero() => t,
            _ => self.default_timeout,
        };
        match tokio::time::timeout(timeout, self.read(buf)).await {
            Ok(res) => Ok(Some(res?)),
            Err(_) => Ok(None),
        }
    }

    /// Closes the tunnel. Closing twice is fine.
    pub async fn disconnect(&mut self) {
        if let Some(mut socket) = self.socket.take() {
            debug!(
                "Closing tunnel to device {} port {}",
                self.device_id, self.port
            );
            if let Err(e) = socket.shutdown().await {
                debug!("Error shutting down tunnel: {e}");
            }
        }
        self.pending.clear();
    }
}

fn closed() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "tunnel is closed")
}

impl AsyncRead for UsbmuxdTunnel {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if !this.pending.is_empty() {
            let n = this.pending.len().min(buf.remaining());
            buf.put_slice(&this.pending[..n]);
            this.pending.drain(..n);
            return Poll::Ready(Ok(()));
        }
        match this.socket.as_mut() {
            Some(socket) => Pin::new(socket).poll_read(cx, buf),
            None => Poll::Ready(Err(closed())),
        }
    }
}

impl AsyncWrite for UsbmuxdTunnel {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut().socket.as_mut() {
            Some(socket) => Pin::new(socket).poll_write(cx, buf),
            None => Poll::Ready(Err(closed())),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut().socket.as_mut() {
            Some(socket) => Pin::new(socket).poll_flush(cx),
            None => Poll::Ready(Ok(())),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut().socket.as_mut() {
            Some(socket) => Pin::new(socket).poll_shutdown(cx),
            None => Poll::Ready(Ok(())),
        }
    }
}
