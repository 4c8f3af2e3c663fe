// Jackson Coxson

use crate::usbmuxd::{ResultCode, SubscriptionId};

/// Linux errno values used by [`UsbmuxdError::errno`].
mod errno {
    pub const ENOENT: i32 = 2;
    pub const EIO: i32 = 5;
    pub const ENODEV: i32 = 19;
    pub const EINVAL: i32 = 22;
    pub const EPROTO: i32 = 71;
    pub const EBADMSG: i32 = 74;
    pub const ECONNRESET: i32 = 104;
    pub const ETIMEDOUT: i32 = 110;
    pub const ECONNREFUSED: i32 = 111;
}

#[derive(Debug, thiserror::Error)]
pub enum UsbmuxdError {
    #[error("usbmuxd unreachable at {addr}: {source}")]
    DaemonUnreachable {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("timed out waiting for usbmuxd")]
    Timeout,

    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    #[error("usbmuxd returned {0}")]
    Result(ResultCode),

    #[error("device {0} not found by usbmuxd")]
    BadDevice(u32),

    #[error("device {device} refused connection to port {port}")]
    ConnectionRefused { device: u32, port: u16 },

    #[error("decode error: {0}")]
    Decode(String),

    #[error("no subscription with id {0}")]
    UnknownSubscription(SubscriptionId),

    #[error("response tag {got} does not match request tag {expected}")]
    TagMismatch { expected: u32, got: u32 },

    #[error("connection closed")]
    Closed,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Plist(#[from] plist::Error),
}

impl UsbmuxdError {
    /// Negative POSIX-style error code for this error.
    pub fn errno(&self) -> i32 {
        let code = match self {
            UsbmuxdError::DaemonUnreachable { .. } => errno::ECONNREFUSED,
            UsbmuxdError::Timeout => errno::ETIMEDOUT,
            UsbmuxdError::MalformedFrame(_) | UsbmuxdError::TagMismatch { .. } => errno::EBADMSG,
            UsbmuxdError::Result(code) => match code {
                ResultCode::BadCommand => errno::EINVAL,
                ResultCode::BadDev => errno::ENODEV,
                ResultCode::ConnRefused => errno::ECONNREFUSED,
                _ => errno::EPROTO,
            },
            UsbmuxdError::BadDevice(_) => errno::ENODEV,
            UsbmuxdError::ConnectionRefused { .. } => errno::ECONNREFUSED,
            UsbmuxdError::Decode(_) | UsbmuxdError::Plist(_) => errno::EBADMSG,
            UsbmuxdError::UnknownSubscription(_) => errno::ENOENT,
            UsbmuxdError::Closed => errno::ECONNRESET,
            UsbmuxdError::Io(e) => e.raw_os_error().unwrap_or(errno::EIO),
        };
        -code
    }

    /// The daemon result code carried by this error, if any.
    pub fn result_code(&self) -> Option<ResultCode> {
        match self {
            UsbmuxdError::Result(code) => Some(*code),
            UsbmuxdError::BadDevice(_) => Some(ResultCode::BadDev),
            UsbmuxdError::ConnectionRefused { .. } => Some(ResultCode::ConnRefused),
            _ => None,
        }
    }
}
