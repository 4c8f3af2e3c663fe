//! Device records as reported by usbmuxd

use std::{
    net::{IpAddr, Ipv4Addr, Ipv6Addr},
    ops::BitOr,
};

use serde::Deserialize;

use crate::UsbmuxdError;

/// Size of a legacy binary device record.
pub const BINARY_RECORD_SIZE: usize = 268;
const SERIAL_FIELD_SIZE: usize = 256;

const AF_INET: u8 = 2;
const AF_INET6_LINUX: u8 = 10;
const AF_INET6_DARWIN: u8 = 30;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Connection {
    Usb,
    /// Raw `sockaddr` bytes of the device's network address.
    Network(Vec<u8>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsbmuxdDevice {
    /// Opaque handle, only meaningful to usbmuxd.
    pub device_id: u32,
    pub product_id: u32,
    pub udid: String,
    pub connection: Connection,
    pub location_id: u32,
}

impl UsbmuxdDevice {
    pub fn is_network(&self) -> bool {
        matches!(self.connection, Connection::Network(_))
    }

    /// The device's IP address, for network-attached devices.
    pub fn network_address(&self) -> Option<IpAddr> {
        let Connection::Network(raw) = &self.connection else {
            return None;
        };
        match *raw.get(1)? {
            AF_INET => {
                let octets: [u8; 4] = raw.get(4..8)?.try_into().ok()?;
                Some(IpAddr::V4(Ipv4Addr::from(octets)))
            }
            AF_INET6_LINUX | AF_INET6_DARWIN => {
                let octets: [u8; 16] = raw.get(8..24)?.try_into().ok()?;
                Some(IpAddr::V6(Ipv6Addr::from(octets)))
            }
            _ => None,
        }
    }

    /// Builds a device from the `Properties` dictionary of an `Attached` message.
    pub(crate) fn from_properties(properties: &plist::Dictionary) -> Result<Self, UsbmuxdError> {
        #[derive(Deserialize)]
        #[serde(rename_all = "PascalCase")]
        struct Properties {
            connection_type: String,
            #[serde(rename = "DeviceID")]
            device_id: u32,
            #[serde(rename = "ProductID")]
            product_id: u32,
            serial_number: String,
            #[serde(default, rename = "LocationID")]
            location_id: u32,
        }

        let props: Properties =
            plist::from_value(&plist::Value::Dictionary(properties.clone())).map_err(|e| {
                UsbmuxdError::Decode(format!("invalid device properties: {e}"))
            })?;

        let connection = match props.connection_type.as_str() {
            "USB" => Connection::Usb,
            "Network" => {
                let address = properties
                    .get("NetworkAddress")
                    .and_then(|v| v.as_data())
                    .ok_or_else(|| {
                        UsbmuxdError::Decode(format!(
                            "network device {} has no NetworkAddress",
                            props.device_id
                        ))
                    })?;
                Connection::Network(address.to_vec())
            }
            other => {
                return Err(UsbmuxdError::Decode(format!(
                    "unknown connection type {other:?}"
                )))
            }
        };

        Ok(Self {
            device_id: props.device_id,
            product_id: props.product_id,
            udid: props.serial_number,
            connection,
            location_id: props.location_id,
        })
    }

    /// Builds a device from an `Attached` message, which wraps the properties.
    pub(crate) fn from_attached(message: &plist::Dictionary) -> Result<Self, UsbmuxdError> {
        let properties = message
            .get("Properties")
            .and_then(|p| p.as_dictionary())
            .ok_or_else(|| UsbmuxdError::Decode("device entry has no Properties".into()))?;
        Self::from_properties(properties)
    }

    /// Parses a legacy DEVICE_ADD payload.
    ///
    /// Layout: `u32 device id | u16 product id | 256 byte serial | u16 pad | u32 location`.
    pub(crate) fn from_binary(payload: &[u8]) -> Result<Self, UsbmuxdError> {
        if payload.len() < BINARY_RECORD_SIZE {
            return Err(UsbmuxdError::Decode(format!(
                "device record needs {BINARY_RECORD_SIZE} bytes, got {}",
                payload.len()
            )));
        }
        let device_id = u32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]);
        let product_id = u16::from_le_bytes([payload[4], payload[5]]) as u32;

        let serial = &payload[6..6 + SERIAL_FIELD_SIZE];
        let end = serial.iter().position(|&b| b == 0).unwrap_or(serial.len());
        let udid = std::str::from_utf8(&serial[..end])
            .map_err(|_| UsbmuxdError::Decode("device serial is not valid UTF-8".into()))?
            .to_string();
        if udid.is_empty() {
            return Err(UsbmuxdError::Decode(format!(
                "device {device_id} has an empty serial"
            )));
        }

        let loc = &payload[264..268];
        let location_id = u32::from_le_bytes([loc[0], loc[1], loc[2], loc[3]]);

        Ok(Self {
            device_id,
            product_id,
            udid,
            connection: Connection::Usb,
            location_id,
        })
    }
}

/// Which devices a lookup may return.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LookupOptions(u32);

impl LookupOptions {
    pub const USBMUX: Self = Self(1 << 1);
    pub const NETWORK: Self = Self(1 << 2);
    /// When a device is reachable both ways, pick the network connection.
    pub const PREFER_NETWORK: Self = Self(1 << 3);

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Neither USB nor network requested means USB only.
    fn normalized(self) -> Self {
        if !self.contains(Self::USBMUX) && !self.contains(Self::NETWORK) {
            self | Self::USBMUX
        } else {
            self
        }
    }
}

impl BitOr for LookupOptions {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Picks a device out of `devices`.
///
/// With no `udid` the first eligible device wins. USB beats network for the
/// same device unless [`LookupOptions::PREFER_NETWORK`] is set.
pub fn select_device<'a>(
    devices: &'a [UsbmuxdDevice],
    udid: Option<&str>,
    options: LookupOptions,
) -> Option<&'a UsbmuxdDevice> {
    let options = options.normalized();
    let prefer_network = options.contains(LookupOptions::PREFER_NETWORK);
    let mut usb = None;
    let mut network = None;

    for device in devices {
        if udid.is_some_and(|u| u != device.udid) {
            continue;
        }
        match device.connection {
            Connection::Usb if options.contains(LookupOptions::USBMUX) => {
                if !prefer_network {
                    return Some(device);
                }
                usb.get_or_insert(device);
            }
            Connection::Network(_) if options.contains(LookupOptions::NETWORK) => {
                if prefer_network {
                    return Some(device);
                }
                network.get_or_insert(device);
            }
            _ => {}
        }
    }
    if prefer_network {
        usb
    } else {
        network
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn usb_device(id: u32, udid: &str) -> UsbmuxdDevice {
        UsbmuxdDevice {
            device_id: id,
            product_id: 0x12a8,
            udid: udid.to_string(),
            connection: Connection::Usb,
            location_id: 0,
        }
    }

    fn network_device(id: u32, udid: &str) -> UsbmuxdDevice {
        let mut addr = vec![0u8; 28];
        addr[0] = 16;
        addr[1] = AF_INET;
        addr[4..8].copy_from_slice(&[192, 168, 1, 20]);
        UsbmuxdDevice {
            device_id: id,
            product_id: 0x12a8,
            udid: udid.to_string(),
            connection: Connection::Network(addr),
            location_id: 0,
        }
    }

    fn properties(pairs: Vec<(&str, plist::Value)>) -> plist::Dictionary {
        let mut dict = plist::Dictionary::new();
        for (k, v) in pairs {
            dict.insert(k.to_string(), v);
        }
        dict
    }

    #[test]
    fn decodes_usb_properties() {
        let props = properties(vec![
            ("ConnectionType", "USB".into()),
            ("DeviceID", 3u64.into()),
            ("ProductID", 4776u64.into()),
            ("SerialNumber", "00008030-001A".into()),
            ("LocationID", 336592896u64.into()),
        ]);
        let device = UsbmuxdDevice::from_properties(&props).unwrap();
        assert_eq!(device.device_id, 3);
        assert_eq!(device.product_id, 4776);
        assert_eq!(device.udid, "00008030-001A");
        assert_eq!(device.connection, Connection::Usb);
        assert_eq!(device.location_id, 336592896);
    }

    #[test]
    fn network_device_needs_an_address() {
        let props = properties(vec![
            ("ConnectionType", "Network".into()),
            ("DeviceID", 9u64.into()),
            ("ProductID", 4776u64.into()),
            ("SerialNumber", "abc".into()),
        ]);
        assert!(matches!(
            UsbmuxdDevice::from_properties(&props),
            Err(UsbmuxdError::Decode(_))
        ));
    }

    #[test]
    fn missing_product_id_is_rejected() {
        let props = properties(vec![
            ("ConnectionType", "USB".into()),
            ("DeviceID", 3u64.into()),
            ("SerialNumber", "abc".into()),
        ]);
        assert!(UsbmuxdDevice::from_properties(&props).is_err());
    }

    #[test]
    fn wrongly_typed_serial_is_rejected() {
        let props = properties(vec![
            ("ConnectionType", "USB".into()),
            ("DeviceID", 3u64.into()),
            ("ProductID", 1u64.into()),
            ("SerialNumber", 12u64.into()),
        ]);
        assert!(UsbmuxdDevice::from_properties(&props).is_err());
    }

    #[test]
    fn decodes_network_address() {
        assert_eq!(
            network_device(1, "x").network_address(),
            Some(IpAddr::V4(Ipv4Addr::new(192, 168, 1, 20)))
        );

        let mut v6 = vec![0u8; 28];
        v6[1] = AF_INET6_DARWIN;
        v6[8..24].copy_from_slice(&Ipv6Addr::LOCALHOST.octets());
        let device = UsbmuxdDevice {
            connection: Connection::Network(v6),
            ..usb_device(2, "y")
        };
        assert_eq!(device.network_address(), Some(IpAddr::V6(Ipv6Addr::LOCALHOST)));
        assert_eq!(usb_device(3, "z").network_address(), None);
    }

    #[test]
    fn decodes_binary_record() {
        let mut payload = vec![0u8; BINARY_RECORD_SIZE];
        payload[0..4].copy_from_slice(&7u32.to_le_bytes());
        payload[4..6].copy_from_slice(&0x12a8u16.to_le_bytes());
        payload[6..12].copy_from_slice(b"serial");
        payload[264..268].copy_from_slice(&0x1400_0000u32.to_le_bytes());

        let device = UsbmuxdDevice::from_binary(&payload).unwrap();
        assert_eq!(device.device_id, 7);
        assert_eq!(device.product_id, 0x12a8);
        assert_eq!(device.udid, "serial");
        assert_eq!(device.location_id, 0x1400_0000);
        assert_eq!(device.connection, Connection::Usb);

        assert!(UsbmuxdDevice::from_binary(&payload[..100]).is_err());
    }

    #[test]
    fn usb_wins_unless_network_preferred() {
        let devices = vec![network_device(1, "same"), usb_device(2, "same")];
        let both = LookupOptions::USBMUX | LookupOptions::NETWORK;

        let picked = select_device(&devices, Some("same"), both).unwrap();
        assert_eq!(picked.device_id, 2);

        let picked =
            select_device(&devices, Some("same"), both | LookupOptions::PREFER_NETWORK).unwrap();
        assert_eq!(picked.device_id, 1);
    }

    #[test]
    fn preferred_kind_falls_back_to_the_other() {
        let devices = vec![usb_device(2, "only-usb")];
        let options =
            LookupOptions::USBMUX | LookupOptions::NETWORK | LookupOptions::PREFER_NETWORK;
        assert_eq!(
            select_device(&devices, Some("only-usb"), options).map(|d| d.device_id),
            Some(2)
        );
    }

    #[test]
    fn excluded_kinds_are_never_returned() {
        let devices = vec![network_device(1, "net")];
        assert!(select_device(&devices, Some("net"), LookupOptions::USBMUX).is_none());
        // empty options default to USB only
        assert!(select_device(&devices, None, LookupOptions::default()).is_none());
        assert!(select_device(&devices, None, LookupOptions::NETWORK).is_some());
    }

    #[test]
    fn unknown_udid_is_not_found() {
        let devices = vec![usb_device(1, "a"), usb_device(2, "b")];
        assert!(select_device(&devices, Some("c"), LookupOptions::USBMUX).is_none());
        assert_eq!(
            select_device(&devices, None, LookupOptions::USBMUX).map(|d| d.device_id),
            Some(1)
        );
    }
}
