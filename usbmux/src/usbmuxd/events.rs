//! Device event subscriptions and the live listen session behind them
//!
//! The first subscriber starts a background task that keeps a listen
//! connection open and applies every attach/detach/pair message to the
//! device directory before handing it to the subscribers.
//!
//! Two locks are involved. The registry lock is held while the directory is
//! changed and the matching event is fanned out, so a subscriber sees exactly
//! the changes it was told about. The directory lock is only held for the
//! change itself, so callbacks may freely call lookups such as
//! [`UsbmuxdContext::find_device`], [`UsbmuxdContext::devices`],
//! [`UsbmuxdContext::is_listening`] or `get_device`. Callbacks must not call
//! `subscribe` or `unsubscribe`.
//!
//! Each listener task carries a generation number. Only the generation
//! recorded in the directory may change it, so a listener that was stopped
//! but has not yet noticed cannot touch a newer listener's devices.

use std::{
    fmt,
    sync::{atomic::Ordering, Arc, Weak},
    time::Duration,
};

use log::{debug, info, warn};
use tokio::task::JoinHandle;

use super::{
    protocol::{ListenMessage, Operation},
    Inner, UsbmuxdConnection, UsbmuxdContext, UsbmuxdDevice,
};
use crate::UsbmuxdError;

/// How often an idle listener checks whether its context is gone.
const LISTEN_POLL: Duration = Duration::from_secs(1);

type Callback = Arc<dyn Fn(&DeviceEvent) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceEventKind {
    Add,
    Remove,
    Paired,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceEvent {
    pub kind: DeviceEventKind,
    pub device: UsbmuxdDevice,
}

/// Known devices and who keeps them current.
#[derive(Debug, Default)]
pub(crate) struct Directory {
    pub(crate) devices: Vec<UsbmuxdDevice>,
    /// Generation of the listener maintaining `devices`, if one is running.
    pub(crate) generation: Option<u64>,
    /// Set once that listener's stream went quiet after the initial burst of
    /// attach messages.
    pub(crate) primed: bool,
}

impl Directory {
    /// Applies one listen message, returning the event subscribers should see.
    fn apply(&mut self, message: ListenMessage) -> Option<(DeviceEventKind, UsbmuxdDevice)> {
        match message {
            ListenMessage::Attached(device) => {
                if let Some(known) = self
                    .devices
                    .iter_mut()
                    .find(|d| d.device_id == device.device_id)
                {
                    debug!("Device {} attached again, updating record", device.device_id);
                    *known = device;
                    return None;
                }
                info!("Device {} ({}) attached", device.device_id, device.udid);
                self.devices.push(device.clone());
                Some((DeviceEventKind::Add, device))
            }
            ListenMessage::Detached(id) => {
                let Some(pos) = self.devices.iter().position(|d| d.device_id == id) else {
                    debug!("Detach for unknown device {id}");
                    return None;
                };
                let device = self.devices.remove(pos);
                info!("Device {} ({}) detached", device.device_id, device.udid);
                Some((DeviceEventKind::Remove, device))
            }
            ListenMessage::Paired(id) => match self.devices.iter().find(|d| d.device_id == id) {
                Some(device) => Some((DeviceEventKind::Paired, device.clone())),
                None => {
                    debug!("Pair notification for unknown device {id}");
                    None
                }
            },
            ListenMessage::Result(code) => {
                debug!("Result {code} on listen connection");
                None
            }
            ListenMessage::Other(kind) => {
                debug!("Ignoring {kind} message on listen connection");
                None
            }
        }
    }
}

/// Subscribers and the listener task serving them.
#[derive(Default)]
pub(crate) struct Registry {
    subscribers: Vec<(SubscriptionId, Callback)>,
    pub(crate) listener: Option<JoinHandle<()>>,
}

impl Registry {
    fn dispatch(&self, kind: DeviceEventKind, device: &UsbmuxdDevice) {
        let event = DeviceEvent {
            kind,
            device: device.clone(),
        };
        for (_, callback) in &self.subscribers {
            callback(&event);
        }
    }
}

impl Inner {
    /// Applies `message` for listener `generation` and tells every subscriber.
    fn apply(&self, generation: u64, message: ListenMessage) {
        let registry = self.lock_registry();
        let event = {
            let mut directory = self.lock_directory();
            if directory.generation != Some(generation) {
                debug!("Dropping message from stopped listener {generation}");
                return;
            }
            directory.apply(message)
        };
        if let Some((kind, device)) = event {
            registry.dispatch(kind, &device);
        }
    }

    /// Forgets every device, telling subscribers each one is gone.
    fn flush(&self, generation: u64) {
        let registry = self.lock_registry();
        let devices = {
            let mut directory = self.lock_directory();
            if directory.generation != Some(generation) {
                return;
            }
            directory.primed = false;
            std::mem::take(&mut directory.devices)
        };
        for device in &devices {
            registry.dispatch(DeviceEventKind::Remove, device);
        }
    }

    fn mark_primed(&self, generation: u64) {
        let mut directory = self.lock_directory();
        if directory.generation == Some(generation) {
            directory.primed = true;
        }
    }

    fn is_current(&self, generation: u64) -> bool {
        self.lock_directory().generation == Some(generation)
    }
}

impl UsbmuxdContext {
    /// Registers `callback` for device events.
    ///
    /// If the listener is already running, the callback first receives one
    /// `Add` for every known device, before this returns.
    pub async fn subscribe<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&DeviceEvent) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.inner.next_subscription.fetch_add(1, Ordering::SeqCst) + 1);
        let callback: Callback = Arc::new(callback);

        let mut registry = self.inner.lock_registry();
        if registry.listener.is_none() {
            let generation = self.inner.next_generation.fetch_add(1, Ordering::SeqCst) + 1;
            {
                // the listener repopulates the directory from scratch
                let mut directory = self.inner.lock_directory();
                directory.devices.clear();
                directory.generation = Some(generation);
                directory.primed = false;
            }
            let inner = Arc::downgrade(&self.inner);
            registry.listener = Some(tokio::spawn(listen_loop(inner, generation)));
            debug!("Started device listener {generation}");
        } else {
            let devices = self.inner.lock_directory().devices.clone();
            for device in devices {
                callback(&DeviceEvent {
                    kind: DeviceEventKind::Add,
                    device,
                });
            }
        }
        registry.subscribers.push((id, callback));
        id
    }

    /// Removes a subscription, first sending it one `Remove` per known device.
    pub fn unsubscribe(&self, id: SubscriptionId) -> Result<(), UsbmuxdError> {
        let mut registry = self.inner.lock_registry();
        let pos = registry
            .subscribers
            .iter()
            .position(|(s, _)| *s == id)
            .ok_or(UsbmuxdError::UnknownSubscription(id))?;

        let (_, callback) = registry.subscribers.remove(pos);
        let devices = self.inner.lock_directory().devices.clone();
        for device in devices {
            callback(&DeviceEvent {
                kind: DeviceEventKind::Remove,
                device,
            });
        }

        if registry.subscribers.is_empty() {
            if let Some(listener) = registry.listener.take() {
                listener.abort();
                debug!("Stopped device listener");
            }
            let mut directory = self.inner.lock_directory();
            directory.generation = None;
            directory.primed = false;
        }
        Ok(())
    }

    pub fn is_listening(&self) -> bool {
        self.inner.lock_directory().generation.is_some()
    }

    async fn start_listen(&self) -> Result<UsbmuxdConnection, UsbmuxdError> {
        let (conn, reply) = self.request(&Operation::Listen).await?;
        reply.into_ack()?;
        Ok(conn)
    }
}

fn upgrade(inner: &Weak<Inner>) -> Option<UsbmuxdContext> {
    inner.upgrade().map(|inner| UsbmuxdContext { inner })
}

async fn listen_loop(inner: Weak<Inner>, generation: u64) {
    loop {
        let Some(ctx) = upgrade(&inner) else {
            return;
        };
        if !ctx.inner.is_current(generation) {
            return;
        }
        let reconnect = ctx.config().reconnect_interval;
        let quiescence = ctx.config().quiescence;

        match ctx.start_listen().await {
            Ok(conn) => {
                info!("Listening for device events");
                drop(ctx);
                pump(&inner, generation, quiescence, conn).await;
            }
            Err(e) => {
                warn!("Failed to listen to usbmuxd: {e}");
                drop(ctx);
            }
        }

        match inner.upgrade() {
            Some(inner) => inner.flush(generation),
            None => return,
        }
        tokio::time::sleep(reconnect).await;
    }
}

async fn pump(
    inner: &Weak<Inner>,
    generation: u64,
    quiescence: Duration,
    mut conn: UsbmuxdConnection,
) {
    let mut primed = false;
    loop {
        let wait = if primed { LISTEN_POLL } else { quiescence };
        let frame = match conn.receive(Some(wait)).await {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                let Some(inner) = inner.upgrade() else {
                    return;
                };
                if !primed {
                    // the daemon announces attached devices right away
                    inner.mark_primed(generation);
                    primed = true;
                }
                continue;
            }
            Err(e) => {
                warn!("Lost usbmuxd listen connection: {e}");
                return;
            }
        };

        let Some(inner) = inner.upgrade() else {
            return;
        };
        match ListenMessage::from_frame(&frame) {
            Ok(message) => inner.apply(generation, message),
            Err(e) => warn!("Skipping undecodable {:?} frame: {e}", frame.header.message),
        }
    }
}
