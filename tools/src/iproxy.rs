// Jackson Coxson
// Forwards a local TCP port to a port on a device through usbmuxd

use clap::{Arg, ArgAction, Command};
use log::{debug, info, warn};
use tokio::net::{TcpListener, TcpStream};
use usbmux::{LookupOptions, UsbmuxdContext};

mod common;

#[tokio::main]
async fn main() {
    let matches = common::with_common_args(
        Command::new("iproxy")
            .about("Proxy a local TCP port to a port on a device")
            .arg(
                Arg::new("local_port")
                    .value_name("LOCAL_PORT")
                    .help("Port to listen on locally")
                    .value_parser(clap::value_parser!(u16))
                    .required_unless_present("about")
                    .index(1),
            )
            .arg(
                Arg::new("device_port")
                    .value_name("DEVICE_PORT")
                    .help("Port to connect to on the device")
                    .value_parser(clap::value_parser!(u16))
                    .required_unless_present("about")
                    .index(2),
            )
            .arg(
                Arg::new("udid")
                    .long("udid")
                    .short('u')
                    .value_name("UDID")
                    .help("Target a specific device (default: the first one found)"),
            )
            .arg(
                Arg::new("network")
                    .long("network")
                    .short('n')
                    .help("Also consider network devices")
                    .action(ArgAction::SetTrue),
            )
            .arg(
                Arg::new("prefer_network")
                    .long("prefer-network")
                    .short('p')
                    .help("Prefer a network connection when a device is reachable both ways")
                    .action(ArgAction::SetTrue),
            ),
    )
    .get_matches();

    common::init_logging(&matches);

    if matches.get_flag("about") {
        println!("iproxy - proxy a local port to a device.");
        println!("Reimplementation of libimobiledevice's functionality.");
        println!("Copyright (c) 2025 Jackson Coxson");
        return;
    }

    let (Some(&local_port), Some(&device_port)) = (
        matches.get_one::<u16>("local_port"),
        matches.get_one::<u16>("device_port"),
    ) else {
        eprintln!("Both LOCAL_PORT and DEVICE_PORT are required");
        return;
    };

    let mut options = LookupOptions::USBMUX;
    if matches.get_flag("network") {
        options = options | LookupOptions::NETWORK;
    }
    if matches.get_flag("prefer_network") {
        options = options | LookupOptions::NETWORK | LookupOptions::PREFER_NETWORK;
    }
    let udid = matches.get_one::<String>("udid").cloned();

    let ctx = match common::get_context(&matches, "iproxy") {
        Ok(c) => c,
        Err(e) => {
            eprintln!("{e}");
            return;
        }
    };

    let listener = match TcpListener::bind(("127.0.0.1", local_port)).await {
        Ok(l) => l,
        Err(e) => {
            eprintln!("Failed to bind port {local_port}: {e}");
            return;
        }
    };
    println!("Forwarding 127.0.0.1:{local_port} to device port {device_port}");

    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(s) => s,
            Err(e) => {
                warn!("Failed to accept connection: {e}");
                continue;
            }
        };
        info!("Accepted connection from {peer}");
        let ctx = ctx.clone();
        let udid = udid.clone();
        tokio::spawn(async move {
            if let Err(e) = proxy(&ctx, stream, udid.as_deref(), options, device_port).await {
                eprintln!("Connection from {peer} failed: {e}");
            }
        });
    }
}

async fn proxy(
    ctx: &UsbmuxdContext,
    mut stream: TcpStream,
    udid: Option<&str>,
    options: LookupOptions,
    device_port: u16,
) -> Result<(), String> {
    let device = ctx
        .get_device(udid, options)
        .await
        .map_err(|e| format!("Failed to look up device: {e}"))?
        .ok_or_else(|| match udid {
            Some(u) => format!("No device with UDID {u}"),
            None => "No device attached".to_string(),
        })?;

    let mut tunnel = ctx
        .connect(device.device_id, device_port)
        .await
        .map_err(|e| format!("Failed to connect to device port {device_port}: {e}"))?;
    debug!("Tunnel open to {} port {device_port}", device.udid);

    let res = tokio::io::copy_bidirectional(&mut stream, &mut tunnel).await;
    tunnel.disconnect().await;
    match res {
        Ok((up, down)) => {
            info!("Connection closed after {up} bytes up, {down} bytes down");
            Ok(())
        }
        Err(e) => Err(format!("Proxy error: {e}")),
    }
}
