//! usbmuxd client
//!
//! Talks to the device multiplexing daemon over its local socket to list
//! attached devices, follow attach/detach events, and open tunnels to TCP
//! ports on a device.
//!
//! All state that lives as long as the client (known devices, subscriptions,
//! the request tag counter and the protocol version) is owned by a
//! [`UsbmuxdContext`]. Clones share that state.

use std::{
    fmt,
    sync::{
        atomic::{AtomicU32, AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
};

use log::{debug, info, warn};

use crate::UsbmuxdError;

pub mod config;
pub mod connection;
pub mod device;
mod events;
pub mod header;
mod pairing;
pub mod protocol;
mod tunnel;

pub use config::{UsbmuxdAddr, UsbmuxdConfig};
pub use connection::{Frame, UsbmuxdConnection};
pub use device::{select_device, Connection, LookupOptions, UsbmuxdDevice};
pub use events::{DeviceEvent, DeviceEventKind, SubscriptionId};
pub use header::{MessageType, ResultCode};
pub use protocol::ProtocolVersion;
pub use tunnel::UsbmuxdTunnel;

use events::{Directory, Registry};
use protocol::{ClientInfo, ListenMessage, Operation, Reply, Request};

#[derive(Clone)]
pub struct UsbmuxdContext {
    inner: Arc<Inner>,
}

struct Inner {
    config: UsbmuxdConfig,
    client: ClientInfo,
    tag: AtomicU32,
    version: AtomicU32,
    next_subscription: AtomicU64,
    next_generation: AtomicU64,
    /// Serializes directory changes with their fan-out. Taken before `directory`.
    registry: Mutex<Registry>,
    directory: Mutex<Directory>,
}

impl Inner {
    fn lock_registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_directory(&self) -> MutexGuard<'_, Directory> {
        self.directory.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        let registry = self.registry.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(listener) = registry.listener.take() {
            listener.abort();
        }
    }
}

impl fmt::Debug for UsbmuxdContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UsbmuxdContext")
            .field("addr", &self.inner.config.addr)
            .field("version", &self.protocol_version())
            .field("listening", &self.is_listening())
            .finish()
    }
}

impl UsbmuxdContext {
    pub fn new(config: UsbmuxdConfig) -> Self {
        let client = ClientInfo {
            prog_name: config.prog_name.clone(),
            bundle_id: config.bundle_id.clone(),
        };
        Self {
            inner: Arc::new(Inner {
                config,
                client,
                tag: AtomicU32::new(0),
                version: AtomicU32::new(ProtocolVersion::Plist as u32),
                next_subscription: AtomicU64::new(0),
                next_generation: AtomicU64::new(0),
                registry: Mutex::new(Registry::default()),
                directory: Mutex::new(Directory::default()),
            }),
        }
    }

    /// A context for the daemon named by `USBMUXD_SOCKET_ADDRESS`, or the default socket.
    pub fn from_env() -> Result<Self, UsbmuxdError> {
        Ok(Self::new(UsbmuxdConfig::from_env()?))
    }

    pub fn config(&self) -> &UsbmuxdConfig {
        &self.inner.config
    }

    /// The protocol version requests are currently sent with.
    pub fn protocol_version(&self) -> ProtocolVersion {
        ProtocolVersion::from_u32(self.inner.version.load(Ordering::SeqCst))
    }

    /// Switches to the binary protocol for the rest of this context's life.
    fn downgrade(&self) {
        let previous = self
            .inner
            .version
            .swap(ProtocolVersion::Binary as u32, Ordering::SeqCst);
        if previous != ProtocolVersion::Binary as u32 {
            info!("usbmuxd does not speak the plist protocol, falling back to binary");
        }
    }

    fn next_tag(&self) -> u32 {
        self.inner.tag.fetch_add(1, Ordering::SeqCst).wrapping_add(1)
    }

    /// Opens a fresh connection to the daemon.
    pub async fn open_connection(&self) -> Result<UsbmuxdConnection, UsbmuxdError> {
        UsbmuxdConnection::open(&self.inner.config.addr, self.inner.config.timeout).await
    }

    /// Sends `op` once at `version` on a new connection and reads the reply.
    async fn exchange(
        &self,
        op: &Operation<'_>,
        version: ProtocolVersion,
    ) -> Result<(UsbmuxdConnection, Reply), UsbmuxdError> {
        let mut conn = self.open_connection().await?;
        let tag = self.next_tag();
        let (header_version, message, payload) =
            Request::build(op, version, &self.inner.client).encode()?;

        debug!("Sending {} request with tag {tag}", op.name());
        conn.send(header_version as u32, message, tag, &payload).await?;

        let frame = match conn.receive(None).await? {
            Some(frame) => frame,
            None => {
                conn.close().await;
                return Err(UsbmuxdError::Timeout);
            }
        };
        if frame.header.tag != tag {
            warn!(
                "Reply to {} carried tag {}, expected {tag}",
                op.name(),
                frame.header.tag
            );
            conn.close().await;
            return Err(UsbmuxdError::TagMismatch {
                expected: tag,
                got: frame.header.tag,
            });
        }
        let reply = Reply::from_frame(&frame)?;
        Ok((conn, reply))
    }

    /// Runs `op`, falling back to the binary protocol once if the daemon
    /// rejects the plist one.
    async fn request(
        &self,
        op: &Operation<'_>,
    ) -> Result<(UsbmuxdConnection, Reply), UsbmuxdError> {
        let version = self.protocol_version();
        let (mut conn, reply) = self.exchange(op, version).await?;

        if reply.is_bad_version() && version == ProtocolVersion::Plist && op.has_legacy_form() {
            conn.close().await;
            self.downgrade();
            return self.exchange(op, ProtocolVersion::Binary).await;
        }
        Ok((conn, reply))
    }

    /// Asks the daemon for every attached device.
    ///
    /// Unless a live listener owns the device directory, the directory is
    /// replaced with the result. A malformed device record fails the whole call.
    pub async fn list_devices(&self) -> Result<Vec<UsbmuxdDevice>, UsbmuxdError> {
        let (mut conn, reply) = self.request(&Operation::ListDevices).await?;

        let res = match reply {
            Reply::Plist(dict) => parse_device_list(&dict),
            Reply::Code(ResultCode::Ok) => self.drain_device_adds(&mut conn).await,
            Reply::Code(code) => Err(UsbmuxdError::Result(code)),
        };
        conn.close().await;
        let devices = res?;

        let mut directory = self.inner.lock_directory();
        if directory.generation.is_none() {
            directory.devices = devices.clone();
        }
        debug!("usbmuxd reports {} device(s)", devices.len());
        Ok(devices)
    }

    /// Collects DEVICE_ADD frames from a legacy listen connection until the
    /// daemon has been quiet for the configured quiescence interval.
    ///
    /// Silence is taken to mean the daemon finished announcing devices.
    async fn drain_device_adds(
        &self,
        conn: &mut UsbmuxdConnection,
    ) -> Result<Vec<UsbmuxdDevice>, UsbmuxdError> {
        let mut devices: Vec<UsbmuxdDevice> = Vec::new();
        while let Some(frame) = conn.receive(Some(self.inner.config.quiescence)).await? {
            match ListenMessage::from_frame(&frame)? {
                ListenMessage::Attached(device) => {
                    devices.retain(|d| d.device_id != device.device_id);
                    devices.push(device);
                }
                ListenMessage::Detached(id) => devices.retain(|d| d.device_id != id),
                other => debug!("Ignoring {other:?} while enumerating devices"),
            }
        }
        Ok(devices)
    }

    /// A copy of the device directory as it stands.
    pub fn devices(&self) -> Vec<UsbmuxdDevice> {
        self.inner.lock_directory().devices.clone()
    }

    /// Looks a device up in the current directory without asking the daemon.
    pub fn find_device(
        &self,
        udid: Option<&str>,
        options: LookupOptions,
    ) -> Option<UsbmuxdDevice> {
        let directory = self.inner.lock_directory();
        select_device(&directory.devices, udid, options).cloned()
    }

    /// Looks a device up. `Ok(None)` means no device matched.
    ///
    /// The daemon is asked afresh unless a listener is keeping the directory
    /// current and has finished receiving the devices attached when it
    /// started.
    pub async fn get_device(
        &self,
        udid: Option<&str>,
        options: LookupOptions,
    ) -> Result<Option<UsbmuxdDevice>, UsbmuxdError> {
        let settled = {
            let directory = self.inner.lock_directory();
            directory.generation.is_some() && directory.primed
        };
        if settled {
            return Ok(self.find_device(udid, options));
        }
        let devices = self.list_devices().await?;
        Ok(select_device(&devices, udid, options).cloned())
    }

    /// Finds a USB device by UDID.
    pub async fn get_device_by_udid(
        &self,
        udid: &str,
    ) -> Result<Option<UsbmuxdDevice>, UsbmuxdError> {
        self.get_device(Some(udid), LookupOptions::USBMUX).await
    }

    /// Opens a tunnel to `port` on the device with handle `device_id`.
    pub async fn connect(
        &self,
        device_id: u32,
        port: u16,
    ) -> Result<UsbmuxdTunnel, UsbmuxdError> {
        let (mut conn, reply) = self.request(&Operation::Connect { device_id, port }).await?;

        if let Err(e) = reply.into_ack() {
            conn.close().await;
            return Err(match e.result_code() {
                Some(ResultCode::BadDev) => UsbmuxdError::BadDevice(device_id),
                Some(ResultCode::ConnRefused) => UsbmuxdError::ConnectionRefused {
                    device: device_id,
                    port,
                },
                _ => e,
            });
        }

        let (socket, pending) = conn.into_parts().ok_or(UsbmuxdError::Closed)?;
        info!("Connected to port {port} on device {device_id}");
        Ok(UsbmuxdTunnel::new(
            socket,
            pending,
            device_id,
            port,
            self.inner.config.timeout,
        ))
    }
}

fn parse_device_list(dict: &plist::Dictionary) -> Result<Vec<UsbmuxdDevice>, UsbmuxdError> {
    let list = dict
        .get("DeviceList")
        .and_then(|l| l.as_array())
        .ok_or_else(|| UsbmuxdError::Decode("ListDevices reply has no DeviceList".into()))?;

    list.iter()
        .map(|entry| {
            entry
                .as_dictionary()
                .ok_or_else(|| UsbmuxdError::Decode("DeviceList entry is not a dictionary".into()))
                .and_then(UsbmuxdDevice::from_attached)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attached(id: u64, serial: &str) -> plist::Value {
        let mut props = plist::Dictionary::new();
        props.insert("ConnectionType".into(), "USB".into());
        props.insert("DeviceID".into(), id.into());
        props.insert("ProductID".into(), 4776u64.into());
        props.insert("SerialNumber".into(), serial.into());

        let mut entry = plist::Dictionary::new();
        entry.insert("MessageType".into(), "Attached".into());
        entry.insert("DeviceID".into(), id.into());
        entry.insert("Properties".into(), plist::Value::Dictionary(props));
        plist::Value::Dictionary(entry)
    }

    #[test]
    fn device_list_parses_every_entry() {
        let mut dict = plist::Dictionary::new();
        dict.insert(
            "DeviceList".into(),
            plist::Value::Array(vec![attached(1, "a"), attached(2, "b")]),
        );
        let devices = parse_device_list(&dict).unwrap();
        assert_eq!(devices.len(), 2);
        assert_eq!(devices[1].udid, "b");
    }

    #[test]
    fn one_bad_entry_fails_the_list() {
        let mut dict = plist::Dictionary::new();
        dict.insert(
            "DeviceList".into(),
            plist::Value::Array(vec![attached(1, "a"), plist::Value::String("junk".into())]),
        );
        assert!(matches!(
            parse_device_list(&dict),
            Err(UsbmuxdError::Decode(_))
        ));
    }

    #[test]
    fn tags_increase() {
        let ctx = UsbmuxdContext::new(UsbmuxdConfig::default());
        let first = ctx.next_tag();
        assert_eq!(ctx.next_tag(), first + 1);
    }

    #[test]
    fn downgrade_is_sticky() {
        let ctx = UsbmuxdContext::new(UsbmuxdConfig::default());
        assert_eq!(ctx.protocol_version(), ProtocolVersion::Plist);
        ctx.downgrade();
        ctx.downgrade();
        assert_eq!(ctx.protocol_version(), ProtocolVersion::Binary);
    }

    #[test]
    fn find_device_reads_the_directory() {
        let ctx = UsbmuxdContext::new(UsbmuxdConfig::default());
        assert!(ctx.find_device(Some("a"), LookupOptions::USBMUX).is_none());

        let device = UsbmuxdDevice {
            device_id: 4,
            product_id: 1,
            udid: "a".into(),
            connection: Connection::Usb,
            location_id: 0,
        };
        ctx.inner.lock_directory().devices.push(device.clone());
        assert_eq!(ctx.find_device(Some("a"), LookupOptions::USBMUX), Some(device));
    }
}
