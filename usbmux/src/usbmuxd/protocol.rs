//! Request shaping and reply decoding for both usbmuxd protocol versions
//!
//! The plist protocol sends a dictionary naming the operation in
//! `MessageType`. The legacy binary protocol uses the operation's own message
//! type with a small fixed payload, and answers with RESULT frames.

use log::debug;

use super::{
    connection::Frame,
    device::UsbmuxdDevice,
    header::{MessageType, ResultCode},
};
use crate::UsbmuxdError;

pub const CLIENT_VERSION_STRING: &str = concat!("usbmux-rs ", env!("CARGO_PKG_VERSION"));
pub const LIB_USBMUX_VERSION: u64 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolVersion {
    Binary = 0,
    Plist = 1,
}

impl ProtocolVersion {
    pub fn from_u32(value: u32) -> Self {
        if value == ProtocolVersion::Binary as u32 {
            ProtocolVersion::Binary
        } else {
            ProtocolVersion::Plist
        }
    }
}

/// Bookkeeping fields attached to every plist request.
#[derive(Debug, Clone, Default)]
pub struct ClientInfo {
    pub prog_name: Option<String>,
    pub bundle_id: Option<String>,
}

#[derive(Debug, Clone, Copy)]
pub enum Operation<'a> {
    ListDevices,
    Listen,
    Connect { device_id: u32, port: u16 },
    ReadBuid,
    ReadPairRecord { record_id: &'a str },
    SavePairRecord { record_id: &'a str, device_id: u32, data: &'a [u8] },
    DeletePairRecord { record_id: &'a str },
}

impl Operation<'_> {
    pub fn name(&self) -> &'static str {
        match self {
            Operation::ListDevices => "ListDevices",
            Operation::Listen => "Listen",
            Operation::Connect { .. } => "Connect",
            Operation::ReadBuid => "ReadBUID",
            Operation::ReadPairRecord { .. } => "ReadPairRecord",
            Operation::SavePairRecord { .. } => "SavePairRecord",
            Operation::DeletePairRecord { .. } => "DeletePairRecord",
        }
    }

    /// Whether the operation can be retried over the binary protocol.
    ///
    /// Listing falls back to a listen session drained until quiet.
    pub fn has_legacy_form(&self) -> bool {
        matches!(
            self,
            Operation::ListDevices | Operation::Listen | Operation::Connect { .. }
        )
    }
}

/// A request in the shape the chosen protocol version wants.
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    Plist(plist::Dictionary),
    Binary { message: MessageType, payload: Vec<u8> },
}

impl Request {
    pub fn build(op: &Operation<'_>, version: ProtocolVersion, client: &ClientInfo) -> Self {
        if version == ProtocolVersion::Binary && op.has_legacy_form() {
            return Self::binary(op);
        }

        let mut dict = plist::Dictionary::new();
        dict.insert("ClientVersionString".into(), CLIENT_VERSION_STRING.into());
        dict.insert("MessageType".into(), op.name().into());
        if let Some(prog_name) = &client.prog_name {
            dict.insert("ProgName".into(), prog_name.as_str().into());
        }
        if let Some(bundle_id) = &client.bundle_id {
            dict.insert("BundleID".into(), bundle_id.as_str().into());
        }
        dict.insert("kLibUSBMuxVersion".into(), LIB_USBMUX_VERSION.into());

        match *op {
            Operation::Connect { device_id, port } => {
                dict.insert("DeviceID".into(), (device_id as u64).into());
                dict.insert("PortNumber".into(), (network_order_port(port) as u64).into());
            }
            Operation::ReadPairRecord { record_id } | Operation::DeletePairRecord { record_id } => {
                dict.insert("PairRecordID".into(), record_id.into());
            }
            Operation::SavePairRecord {
                record_id,
                device_id,
                data,
            } => {
                dict.insert("PairRecordID".into(), record_id.into());
                dict.insert("PairRecordData".into(), plist::Value::Data(data.to_vec()));
                if device_id != 0 {
                    dict.insert("DeviceID".into(), (device_id as u64).into());
                }
            }
            Operation::ListDevices | Operation::Listen | Operation::ReadBuid => {}
        }
        Self::Plist(dict)
    }

    fn binary(op: &Operation<'_>) -> Self {
        match *op {
            Operation::Connect { device_id, port } => {
                let mut payload = Vec::with_capacity(8);
                payload.extend_from_slice(&device_id.to_le_bytes());
                payload.extend_from_slice(&port.to_be_bytes());
                payload.extend_from_slice(&0u16.to_le_bytes());
                Self::Binary {
                    message: MessageType::Connect,
                    payload,
                }
            }
            _ => Self::Binary {
                message: MessageType::Listen,
                payload: Vec::new(),
            },
        }
    }

    /// Header version, message type and payload bytes for this request.
    pub fn encode(&self) -> Result<(ProtocolVersion, MessageType, Vec<u8>), UsbmuxdError> {
        match self {
            Request::Plist(dict) => {
                let mut buf = Vec::new();
                plist::Value::Dictionary(dict.clone()).to_writer_xml(&mut buf)?;
                Ok((ProtocolVersion::Plist, MessageType::Plist, buf))
            }
            Request::Binary { message, payload } => {
                Ok((ProtocolVersion::Binary, *message, payload.clone()))
            }
        }
    }
}

/// The port as the daemon reads it: network byte order in a host integer.
fn network_order_port(port: u16) -> u16 {
    u16::from_le_bytes(port.to_be_bytes())
}

/// What the daemon answered.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Code(ResultCode),
    Plist(plist::Dictionary),
}

impl Reply {
    pub fn from_frame(frame: &Frame) -> Result<Self, UsbmuxdError> {
        match frame.header.message {
            MessageType::Result => Ok(Reply::Code(result_payload(&frame.payload)?)),
            MessageType::Plist => {
                let dict: plist::Dictionary = plist::from_bytes(&frame.payload)?;
                if dict.get("MessageType").and_then(|m| m.as_string()) == Some("Result") {
                    return Ok(Reply::Code(result_number(&dict)?));
                }
                Ok(Reply::Plist(dict))
            }
            other => Err(UsbmuxdError::MalformedFrame(format!(
                "unexpected {other:?} frame in reply"
            ))),
        }
    }

    pub fn is_bad_version(&self) -> bool {
        matches!(self, Reply::Code(ResultCode::BadVersion))
    }

    /// Treats the reply as a bare acknowledgement.
    pub fn into_ack(self) -> Result<(), UsbmuxdError> {
        match self {
            Reply::Code(ResultCode::Ok) => Ok(()),
            Reply::Code(code) => Err(UsbmuxdError::Result(code)),
            Reply::Plist(dict) => {
                debug!("Treating plist reply as acknowledgement: {dict:?}");
                Ok(())
            }
        }
    }

    /// Treats the reply as a dictionary carrying operation data.
    pub fn into_plist(self) -> Result<plist::Dictionary, UsbmuxdError> {
        match self {
            Reply::Plist(dict) => Ok(dict),
            Reply::Code(ResultCode::Ok) => Err(UsbmuxdError::Decode(
                "expected a plist reply, got a bare OK".into(),
            )),
            Reply::Code(code) => Err(UsbmuxdError::Result(code)),
        }
    }
}

fn result_payload(payload: &[u8]) -> Result<ResultCode, UsbmuxdError> {
    let bytes: [u8; 4] = payload
        .get(..4)
        .and_then(|b| b.try_into().ok())
        .ok_or_else(|| UsbmuxdError::MalformedFrame("RESULT payload shorter than 4 bytes".into()))?;
    Ok(ResultCode::from(u32::from_le_bytes(bytes)))
}

/// The `Number` of a plist `Result` message.
fn result_number(dict: &plist::Dictionary) -> Result<ResultCode, UsbmuxdError> {
    let number = dict
        .get("Number")
        .and_then(|n| n.as_unsigned_integer())
        .ok_or_else(|| UsbmuxdError::Decode("Result message has no Number".into()))?;
    u32::try_from(number)
        .map(ResultCode::from)
        .map_err(|_| UsbmuxdError::Decode(format!("result code {number} is out of range")))
}

fn device_id_payload(payload: &[u8]) -> Result<u32, UsbmuxdError> {
    let bytes: [u8; 4] = payload
        .get(..4)
        .and_then(|b| b.try_into().ok())
        .ok_or_else(|| UsbmuxdError::Decode("device id payload shorter than 4 bytes".into()))?;
    Ok(u32::from_le_bytes(bytes))
}

/// One message on a listen stream.
#[derive(Debug, Clone, PartialEq)]
pub enum ListenMessage {
    Attached(UsbmuxdDevice),
    Detached(u32),
    Paired(u32),
    Result(ResultCode),
    Other(String),
}

impl ListenMessage {
    pub fn from_frame(frame: &Frame) -> Result<Self, UsbmuxdError> {
        match frame.header.message {
            MessageType::DeviceAdd => {
                Ok(Self::Attached(UsbmuxdDevice::from_binary(&frame.payload)?))
            }
            MessageType::DeviceRemove => Ok(Self::Detached(device_id_payload(&frame.payload)?)),
            MessageType::DevicePaired => Ok(Self::Paired(device_id_payload(&frame.payload)?)),
            MessageType::Result => Ok(Self::Result(result_payload(&frame.payload)?)),
            MessageType::Plist => {
                let dict: plist::Dictionary = plist::from_bytes(&frame.payload)?;
                let kind = dict
                    .get("MessageType")
                    .and_then(|m| m.as_string())
                    .unwrap_or_default();
                let device_id = || {
                    let id = dict
                        .get("DeviceID")
                        .and_then(|d| d.as_unsigned_integer())
                        .ok_or_else(|| {
                            UsbmuxdError::Decode(format!("{kind} message has no DeviceID"))
                        })?;
                    u32::try_from(id).map_err(|_| {
                        UsbmuxdError::Decode(format!("device id {id} is out of range"))
                    })
                };
                match kind {
                    "Attached" => Ok(Self::Attached(UsbmuxdDevice::from_attached(&dict)?)),
                    "Detached" => Ok(Self::Detached(device_id()?)),
                    "Paired" => Ok(Self::Paired(device_id()?)),
                    "Result" => Ok(Self::Result(result_number(&dict)?)),
                    other => Ok(Self::Other(other.to_string())),
                }
            }
            other => Ok(Self::Other(format!("{other:?}"))),
        }
    }
}
