//! A Rust client for usbmuxd, the host-side daemon that multiplexes
//! connections to attached iOS devices over USB and the network.
//!
//! The entry point is [`usbmuxd::UsbmuxdContext`], which lists devices,
//! delivers live attach/detach/pair events, opens TCP tunnels to ports on a
//! device, and reads or writes pairing records stored by the daemon.

mod error;
pub mod usbmuxd;

use tokio::io::{AsyncRead, AsyncWrite};

pub use error::UsbmuxdError;
pub use usbmuxd::{
    DeviceEvent, DeviceEventKind, LookupOptions, SubscriptionId, UsbmuxdAddr, UsbmuxdConfig,
    UsbmuxdConnection, UsbmuxdContext, UsbmuxdDevice, UsbmuxdTunnel,
};

/// A byte stream the daemon can be reached over.
pub trait ReadWrite: AsyncRead + AsyncWrite + Unpin + Send + Sync + std::fmt::Debug {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send + Sync + std::fmt::Debug> ReadWrite for T {}

/// Sets the process-wide log verbosity for this crate.
///
/// Negative values silence logging entirely, `0` keeps errors only, and every
/// step above that enables the next level up to `4` and beyond for trace.
pub fn set_debug_level(level: i32) {
    let filter = match level {
        i32::MIN..=-1 => log::LevelFilter::Off,
        0 => log::LevelFilter::Error,
        1 => log::LevelFilter::Warn,
        2 => log::LevelFilter::Info,
        3 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    log::set_max_level(filter);
}
