//! Where usbmuxd lives and how long to wait for it

use std::{
    fmt,
    net::SocketAddr,
    path::PathBuf,
    time::Duration,
};

use log::debug;

use crate::{ReadWrite, UsbmuxdError};

pub const SOCKET_ADDRESS_ENV: &str = "USBMUXD_SOCKET_ADDRESS";

#[cfg(unix)]
pub const DEFAULT_SOCKET_PATH: &str = "/var/run/usbmuxd";
pub const DEFAULT_TCP_PORT: u16 = 27015;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_QUIESCENCE: Duration = Duration::from_millis(100);
const DEFAULT_RECONNECT_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UsbmuxdAddr {
    #[cfg(unix)]
    UnixSocket(PathBuf),
    TcpSocket(SocketAddr),
}

impl UsbmuxdAddr {
    /// Parses `UNIX:/path/to/socket` or `host:port`.
    pub fn parse(value: &str) -> Result<Self, UsbmuxdError> {
        if let Some(path) = value.strip_prefix("UNIX:") {
            #[cfg(unix)]
            return Ok(Self::UnixSocket(PathBuf::from(path)));
            #[cfg(not(unix))]
            return Err(UsbmuxdError::Decode(format!(
                "unix socket {path} is not supported on this platform"
            )));
        }
        value
            .parse::<SocketAddr>()
            .map(Self::TcpSocket)
            .map_err(|e| UsbmuxdError::Decode(format!("invalid usbmuxd address {value:?}: {e}")))
    }

    /// The address from `USBMUXD_SOCKET_ADDRESS`, or the platform default.
    pub fn from_env() -> Result<Self, UsbmuxdError> {
        match std::env::var(SOCKET_ADDRESS_ENV) {
            Ok(value) if !value.is_empty() => {
                debug!("Using usbmuxd address from {SOCKET_ADDRESS_ENV}: {value}");
                Self::parse(&value)
            }
            _ => Ok(Self::default()),
        }
    }

    pub(crate) async fn connect(&self) -> Result<Box<dyn ReadWrite>, UsbmuxdError> {
        let unreachable = |source| UsbmuxdError::DaemonUnreachable {
            addr: self.to_string(),
            source,
        };
        match self {
            #[cfg(unix)]
            Self::UnixSocket(path) => {
                let stream = tokio::net::UnixStream::connect(path)
                    .await
                    .map_err(unreachable)?;
                Ok(Box::new(stream))
            }
            Self::TcpSocket(addr) => {
                let stream = tokio::net::TcpStream::connect(addr)
                    .await
                    .map_err(unreachable)?;
                Ok(Box::new(stream))
            }
        }
    }
}

impl Default for UsbmuxdAddr {
    fn default() -> Self {
        #[cfg(unix)]
        return Self::UnixSocket(PathBuf::from(DEFAULT_SOCKET_PATH));
        #[cfg(not(unix))]
        return Self::TcpSocket(SocketAddr::from((
            std::net::Ipv4Addr::LOCALHOST,
            DEFAULT_TCP_PORT,
        )));
    }
}

impl fmt::Display for UsbmuxdAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            #[cfg(unix)]
            Self::UnixSocket(path) => write!(f, "UNIX:{}", path.display()),
            Self::TcpSocket(addr) => write!(f, "{addr}"),
        }
    }
}

/// Settings shared by every operation of a [`super::UsbmuxdContext`].
#[derive(Debug, Clone)]
pub struct UsbmuxdConfig {
    pub addr: UsbmuxdAddr,
    /// Default bound on waiting for a response frame.
    pub timeout: Duration,
    /// Legacy enumeration treats this much silence as the end of the device list.
    pub quiescence: Duration,
    /// Pause before the event listener reconnects after losing the daemon.
    pub reconnect_interval: Duration,
    pub prog_name: Option<String>,
    pub bundle_id: Option<String>,
}

impl Default for UsbmuxdConfig {
    fn default() -> Self {
        Self {
            addr: UsbmuxdAddr::default(),
            timeout: DEFAULT_TIMEOUT,
            quiescence: DEFAULT_QUIESCENCE,
            reconnect_interval: DEFAULT_RECONNECT_INTERVAL,
            prog_name: current_prog_name(),
            bundle_id: None,
        }
    }
}

impl UsbmuxdConfig {
    pub fn from_env() -> Result<Self, UsbmuxdError> {
        Ok(Self::default().with_addr(UsbmuxdAddr::from_env()?))
    }

    pub fn with_addr(mut self, addr: UsbmuxdAddr) -> Self {
        self.addr = addr;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_quiescence(mut self, quiescence: Duration) -> Self {
        self.quiescence = quiescence;
        self
    }

    pub fn with_reconnect_interval(mut self, interval: Duration) -> Self {
        self.reconnect_interval = interval;
        self
    }

    pub fn with_prog_name(mut self, prog_name: impl Into<String>) -> Self {
        self.prog_name = Some(prog_name.into());
        self
    }

    pub fn with_bundle_id(mut self, bundle_id: impl Into<String>) -> Self {
        self.bundle_id = Some(bundle_id.into());
        self
    }
}

fn current_prog_name() -> Option<String> {
    std::env::current_exe()
        .ok()
        .and_then(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, SocketAddrV4};

    #[test]
    fn parses_tcp_address() {
        let addr = UsbmuxdAddr::parse("127.0.0.1:27015").unwrap();
        assert_eq!(
            addr,
            UsbmuxdAddr::TcpSocket(SocketAddr::V4(SocketAddrV4::new(
                Ipv4Addr::LOCALHOST,
                DEFAULT_TCP_PORT
            )))
        );
    }

    #[cfg(unix)]
    #[test]
    fn parses_unix_address() {
        let addr = UsbmuxdAddr::parse("UNIX:/tmp/usbmuxd").unwrap();
        assert_eq!(addr, UsbmuxdAddr::UnixSocket(PathBuf::from("/tmp/usbmuxd")));
        assert_eq!(addr.to_string(), "UNIX:/tmp/usbmuxd");
    }

    #[test]
    fn rejects_garbage_address() {
        assert!(matches!(
            UsbmuxdAddr::parse("not an address"),
            Err(UsbmuxdError::Decode(_))
        ));
    }
}
