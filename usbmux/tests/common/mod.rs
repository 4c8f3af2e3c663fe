#![allow(dead_code)]

//! In-process stand-in for usbmuxd, listening on a Unix socket in a temp dir.

use std::{
    path::PathBuf,
    sync::{Arc, Mutex},
    time::Duration,
};

use tempfile::TempDir;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{UnixListener, UnixStream},
    sync::broadcast,
    task::JoinHandle,
};
use usbmux::{
    usbmuxd::header::{decode_header, encode_header, MessageType, HEADER_SIZE},
    UsbmuxdAddr, UsbmuxdConfig, UsbmuxdContext,
};

#[derive(Debug, Clone)]
pub struct Request {
    pub version: u32,
    pub message: MessageType,
    pub tag: u32,
    pub payload: Vec<u8>,
}

impl Request {
    pub fn plist(&self) -> Option<plist::Dictionary> {
        if self.message != MessageType::Plist {
            return None;
        }
        plist::from_bytes(&self.payload).ok()
    }

    /// The plist `MessageType`, if this is a plist request.
    pub fn operation(&self) -> Option<String> {
        self.plist()?
            .get("MessageType")?
            .as_string()
            .map(str::to_string)
    }
}

pub enum Behavior {
    /// Send these frames, then idle until the client hangs up.
    Reply(Vec<Vec<u8>>),
    /// Send these frames, then echo every byte back.
    Echo(Vec<Vec<u8>>),
    /// Send these frames, then forward everything passed to `push_event`.
    Listen(Vec<Vec<u8>>),
    Hangup,
}

type Responder = Arc<dyn Fn(&Request) -> Behavior + Send + Sync>;

#[derive(Debug, Clone)]
enum Push {
    Frame(Vec<u8>),
    /// Close every open listen stream.
    Hangup,
}

pub struct MockDaemon {
    _dir: TempDir,
    pub path: PathBuf,
    requests: Arc<Mutex<Vec<Request>>>,
    events: broadcast::Sender<Push>,
    task: JoinHandle<()>,
}

impl Drop for MockDaemon {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl MockDaemon {
    pub fn start<F>(responder: F) -> Self
    where
        F: Fn(&Request) -> Behavior + Send + Sync + 'static,
    {
        let _ = env_logger::builder().is_test(true).try_init();
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("usbmuxd");
        let listener = UnixListener::bind(&path).expect("bind mock usbmuxd");
        let requests = Arc::new(Mutex::new(Vec::new()));
        let (events, _) = broadcast::channel(64);
        let responder: Responder = Arc::new(responder);

        let task = {
            let requests = requests.clone();
            let events = events.clone();
            tokio::spawn(async move {
                loop {
                    let Ok((stream, _)) = listener.accept().await else {
                        return;
                    };
                    let rx = events.subscribe();
                    tokio::spawn(serve(stream, responder.clone(), requests.clone(), rx));
                }
            })
        };

        Self {
            _dir: dir,
            path,
            requests,
            events,
            task,
        }
    }

    pub fn config(&self) -> UsbmuxdConfig {
        UsbmuxdConfig::default()
            .with_addr(UsbmuxdAddr::UnixSocket(self.path.clone()))
            .with_timeout(Duration::from_secs(2))
            .with_quiescence(Duration::from_millis(100))
            .with_reconnect_interval(Duration::from_millis(50))
            .with_prog_name("usbmux-tests")
    }

    pub fn context(&self) -> UsbmuxdContext {
        UsbmuxdContext::new(self.config())
    }

    pub fn requests(&self) -> Vec<Request> {
        self.requests.lock().unwrap().clone()
    }

    pub fn push_event(&self, frame: Vec<u8>) {
        let _ = self.events.send(Push::Frame(frame));
    }

    /// Drops every listen connection currently open, as a restarting daemon would.
    pub fn hang_up_listeners(&self) {
        let _ = self.events.send(Push::Hangup);
    }

    pub fn count_requests(&self, pred: impl Fn(&Request) -> bool) -> usize {
        self.requests().iter().filter(|r| pred(r)).count()
    }

    pub async fn wait_for_request(&self, pred: impl Fn(&Request) -> bool) {
        wait_until(|| self.requests().iter().any(&pred)).await;
    }
}

pub async fn wait_until(cond: impl Fn() -> bool) {
    for _ in 0..200 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met in time");
}

async fn serve(
    mut stream: UnixStream,
    responder: Responder,
    requests: Arc<Mutex<Vec<Request>>>,
    mut events: broadcast::Receiver<Push>,
) {
    let mut header = [0u8; HEADER_SIZE];
    if stream.read_exact(&mut header).await.is_err() {
        return;
    }
    let header = decode_header(&header).expect("client header");
    let mut payload = vec![0u8; header.payload_len()];
    if stream.read_exact(&mut payload).await.is_err() {
        return;
    }
    let request = Request {
        version: header.version,
        message: header.message,
        tag: header.tag,
        payload,
    };
    requests.lock().unwrap().push(request.clone());

    let mut buf = [0u8; 1024];
    match responder(&request) {
        Behavior::Hangup => {}
        Behavior::Reply(frames) => {
            for frame in frames {
                if stream.write_all(&frame).await.is_err() {
                    return;
                }
            }
            while let Ok(n) = stream.read(&mut buf).await {
                if n == 0 {
                    break;
                }
            }
        }
        Behavior::Echo(frames) => {
            for frame in frames {
                if stream.write_all(&frame).await.is_err() {
                    return;
                }
            }
            while let Ok(n) = stream.read(&mut buf).await {
                if n == 0 || stream.write_all(&buf[..n]).await.is_err() {
                    break;
                }
            }
        }
        Behavior::Listen(frames) => {
            for frame in frames {
                if stream.write_all(&frame).await.is_err() {
                    return;
                }
            }
            loop {
                tokio::select! {
                    event = events.recv() => match event {
                        Ok(Push::Frame(frame)) => {
                            if stream.write_all(&frame).await.is_err() {
                                break;
                            }
                        }
                        Ok(Push::Hangup) => break,
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                    read = stream.read(&mut buf) => match read {
                        Ok(0) | Err(_) => break,
                        Ok(_) => {}
                    },
                }
            }
        }
    }
}

pub fn frame(version: u32, message: MessageType, tag: u32, payload: &[u8]) -> Vec<u8> {
    let length = (HEADER_SIZE + payload.len()) as u32;
    let mut out = encode_header(length, version, message, tag).to_vec();
    out.extend_from_slice(payload);
    out
}

pub fn dict(pairs: Vec<(&str, plist::Value)>) -> plist::Dictionary {
    let mut dict = plist::Dictionary::new();
    for (k, v) in pairs {
        dict.insert(k.to_string(), v);
    }
    dict
}

pub fn plist_frame(tag: u32, dict: plist::Dictionary) -> Vec<u8> {
    let mut buf = Vec::new();
    plist::Value::Dictionary(dict)
        .to_writer_xml(&mut buf)
        .expect("serialize plist");
    frame(1, MessageType::Plist, tag, &buf)
}

pub fn result_plist(tag: u32, code: u64) -> Vec<u8> {
    plist_frame(
        tag,
        dict(vec![("MessageType", "Result".into()), ("Number", code.into())]),
    )
}

pub fn result_binary(tag: u32, code: u32) -> Vec<u8> {
    frame(0, MessageType::Result, tag, &code.to_le_bytes())
}

pub fn usb_properties(id: u64, udid: &str) -> plist::Dictionary {
    dict(vec![
        ("ConnectionType", "USB".into()),
        ("DeviceID", id.into()),
        ("ProductID", 4776u64.into()),
        ("SerialNumber", udid.into()),
        ("LocationID", 0x1410_0000u64.into()),
    ])
}

pub fn network_properties(id: u64, udid: &str) -> plist::Dictionary {
    let mut addr = vec![0u8; 28];
    addr[0] = 16;
    addr[1] = 2;
    addr[4..8].copy_from_slice(&[10, 0, 0, 7]);
    dict(vec![
        ("ConnectionType", "Network".into()),
        ("DeviceID", id.into()),
        ("ProductID", 4776u64.into()),
        ("SerialNumber", udid.into()),
        ("NetworkAddress", plist::Value::Data(addr)),
    ])
}

pub fn attached_entry(id: u64, properties: plist::Dictionary) -> plist::Value {
    plist::Value::Dictionary(dict(vec![
        ("MessageType", "Attached".into()),
        ("DeviceID", id.into()),
        ("Properties", plist::Value::Dictionary(properties)),
    ]))
}

pub fn attached_event(id: u64, udid: &str) -> Vec<u8> {
    match attached_entry(id, usb_properties(id, udid)) {
        plist::Value::Dictionary(d) => plist_frame(0, d),
        _ => unreachable!(),
    }
}

pub fn detached_event(id: u64) -> Vec<u8> {
    plist_frame(
        0,
        dict(vec![("MessageType", "Detached".into()), ("DeviceID", id.into())]),
    )
}

pub fn device_list(tag: u32, entries: Vec<plist::Value>) -> Vec<u8> {
    plist_frame(tag, dict(vec![("DeviceList", plist::Value::Array(entries))]))
}

pub fn binary_device_remove(id: u32) -> Vec<u8> {
    frame(0, MessageType::DeviceRemove, 0, &id.to_le_bytes())
}

pub fn binary_device_add(id: u32, udid: &str) -> Vec<u8> {
    let mut record = vec![0u8; 268];
    record[0..4].copy_from_slice(&id.to_le_bytes());
    record[4..6].copy_from_slice(&0x12a8u16.to_le_bytes());
    record[6..6 + udid.len()].copy_from_slice(udid.as_bytes());
    frame(0, MessageType::DeviceAdd, 0, &record)
}
