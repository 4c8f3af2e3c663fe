//! usbmuxd frame header
//!
//! Every frame starts with four little-endian `u32` fields:
//!
//! ```text
//! +--------+---------+---------+-----+------------------+
//! | length | version | message | tag | payload          |
//! +--------+---------+---------+-----+------------------+
//! ```
//!
//! `length` counts the header itself, so the payload is `length - 16` bytes.

use std::fmt;

use crate::UsbmuxdError;

pub const HEADER_SIZE: usize = 16;

/// Largest frame accepted from the daemon.
pub const MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Result,
    Connect,
    Listen,
    DeviceAdd,
    DeviceRemove,
    DevicePaired,
    Plist,
    /// Reserved or unknown values, kept so they can be logged and skipped.
    Unknown(u32),
}

impl From<u32> for MessageType {
    fn from(value: u32) -> Self {
        match value {
            1 => MessageType::Result,
            2 => MessageType::Connect,
            3 => MessageType::Listen,
            4 => MessageType::DeviceAdd,
            5 => MessageType::DeviceRemove,
            6 => MessageType::DevicePaired,
            8 => MessageType::Plist,
            other => MessageType::Unknown(other),
        }
    }
}

impl From<MessageType> for u32 {
    fn from(value: MessageType) -> Self {
        match value {
            MessageType::Result => 1,
            MessageType::Connect => 2,
            MessageType::Listen => 3,
            MessageType::DeviceAdd => 4,
            MessageType::DeviceRemove => 5,
            MessageType::DevicePaired => 6,
            MessageType::Plist => 8,
            MessageType::Unknown(other) => other,
        }
    }
}

/// Result codes carried by RESULT frames and plist `Result` messages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResultCode {
    Ok,
    BadCommand,
    BadDev,
    ConnRefused,
    BadVersion,
    Unknown(u32),
}

impl From<u32> for ResultCode {
    fn from(value: u32) -> Self {
        match value {
            0 => ResultCode::Ok,
            1 => ResultCode::BadCommand,
            2 => ResultCode::BadDev,
            3 => ResultCode::ConnRefused,
            6 => ResultCode::BadVersion,
            other => ResultCode::Unknown(other),
        }
    }
}

impl From<ResultCode> for u32 {
    fn from(value: ResultCode) -> Self {
        match value {
            ResultCode::Ok => 0,
            ResultCode::BadCommand => 1,
            ResultCode::BadDev => 2,
            ResultCode::ConnRefused => 3,
            ResultCode::BadVersion => 6,
            ResultCode::Unknown(other) => other,
        }
    }
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResultCode::Ok => write!(f, "OK"),
            ResultCode::BadCommand => write!(f, "BADCOMMAND"),
            ResultCode::BadDev => write!(f, "BADDEV"),
            ResultCode::ConnRefused => write!(f, "CONNREFUSED"),
            ResultCode::BadVersion => write!(f, "BADVERSION"),
            ResultCode::Unknown(code) => write!(f, "unknown result {code}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub length: u32,
    pub version: u32,
    pub message: MessageType,
    pub tag: u32,
}

impl Header {
    pub fn payload_len(&self) -> usize {
        self.length as usize - HEADER_SIZE
    }
}

pub fn encode_header(
    length: u32,
    version: u32,
    message: MessageType,
    tag: u32,
) -> [u8; HEADER_SIZE] {
    let mut out = [0u8; HEADER_SIZE];
    out[0..4].copy_from_slice(&length.to_le_bytes());
    out[4..8].copy_from_slice(&version.to_le_bytes());
    out[8..12].copy_from_slice(&u32::from(message).to_le_bytes());
    out[12..16].copy_from_slice(&tag.to_le_bytes());
    out
}

pub fn decode_header(bytes: &[u8]) -> Result<Header, UsbmuxdError> {
    if bytes.len() < HEADER_SIZE {
        return Err(UsbmuxdError::MalformedFrame(format!(
            "header needs {HEADER_SIZE} bytes, got {}",
            bytes.len()
        )));
    }
    let field = |i: usize| u32::from_le_bytes([bytes[i], bytes[i + 1], bytes[i + 2], bytes[i + 3]]);

    let length = field(0);
    if (length as usize) < HEADER_SIZE {
        return Err(UsbmuxdError::MalformedFrame(format!(
            "declared length {length} is shorter than the header"
        )));
    }
    if length > MAX_FRAME_SIZE {
        return Err(UsbmuxdError::MalformedFrame(format!(
            "declared length {length} exceeds {MAX_FRAME_SIZE}"
        )));
    }

    Ok(Header {
        length,
        version: field(4),
        message: MessageType::from(field(8)),
        tag: field(12),
    })
}
