// Jackson Coxson
// Lists the devices usbmuxd knows about

use clap::{Arg, ArgAction, Command};
use usbmux::{DeviceEventKind, UsbmuxdDevice};

mod common;

fn describe(device: &UsbmuxdDevice) -> String {
    let kind = if device.is_network() { "Network" } else { "USB" };
    format!("{} ({kind})", device.udid)
}

#[tokio::main]
async fn main() {
    let matches = common::with_common_args(
        Command::new("idevice_id")
            .about("List attached devices or watch them come and go")
            .arg(
                Arg::new("network")
                    .long("network")
                    .short('n')
                    .help("Include network devices")
                    .action(ArgAction::SetTrue),
            )
            .arg(
                Arg::new("listen")
                    .long("listen")
                    .short('l')
                    .help("Keep running and print device events")
                    .action(ArgAction::SetTrue),
            ),
    )
    .get_matches();

    common::init_logging(&matches);

    if matches.get_flag("about") {
        println!("idevice_id - list devices attached through usbmuxd.");
        println!("Reimplementation of libimobiledevice's functionality.");
        println!("Copyright (c) 2025 Jackson Coxson");
        return;
    }

    let include_network = matches.get_flag("network");
    let ctx = match common::get_context(&matches, "idevice_id") {
        Ok(c) => c,
        Err(e) => {
            eprintln!("{e}");
            return;
        }
    };

    if !matches.get_flag("listen") {
        match ctx.list_devices().await {
            Ok(devices) => {
                for device in devices
                    .iter()
                    .filter(|d| include_network || !d.is_network())
                {
                    println!("{}", describe(device));
                }
            }
            Err(e) => eprintln!("Failed to list devices: {e}"),
        }
        return;
    }

    let id = ctx
        .subscribe(move |event| {
            if !include_network && event.device.is_network() {
                return;
            }
            let verb = match event.kind {
                DeviceEventKind::Add => "added",
                DeviceEventKind::Remove => "removed",
                DeviceEventKind::Paired => "paired",
            };
            println!("[{verb}] {}", describe(&event.device));
        })
        .await;

    if let Err(e) = tokio::signal::ctrl_c().await {
        eprintln!("Failed to wait for Ctrl-C: {e}");
    }
    if let Err(e) = ctx.unsubscribe(id) {
        eprintln!("Failed to unsubscribe: {e}");
    }
}
