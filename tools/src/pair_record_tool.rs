// Jackson Coxson
// Reads and manages the pairing records usbmuxd stores

use clap::{Arg, Command};

mod common;

#[tokio::main]
async fn main() {
    let matches = common::with_common_args(
        Command::new("pair_record_tool")
            .about("Read, save and delete pairing records held by usbmuxd")
            .subcommand_required(false)
            .subcommand(Command::new("buid").about("Print the system BUID"))
            .subcommand(
                Command::new("read")
                    .about("Print a pairing record")
                    .arg(Arg::new("id").value_name("RECORD_ID").required(true).index(1)),
            )
            .subcommand(
                Command::new("save")
                    .about("Store a pairing record from a file")
                    .arg(Arg::new("id").value_name("RECORD_ID").required(true).index(1))
                    .arg(Arg::new("file").value_name("FILE").required(true).index(2))
                    .arg(
                        Arg::new("device")
                            .long("device")
                            .value_name("DEVICE_ID")
                            .help("Tie the record to this device handle")
                            .value_parser(clap::value_parser!(u32)),
                    ),
            )
            .subcommand(
                Command::new("delete")
                    .about("Delete a pairing record")
                    .arg(Arg::new("id").value_name("RECORD_ID").required(true).index(1)),
            ),
    )
    .get_matches();

    common::init_logging(&matches);

    if matches.get_flag("about") {
        println!("pair_record_tool - manage usbmuxd pairing records.");
        println!("Copyright (c) 2025 Jackson Coxson");
        return;
    }

    let ctx = match common::get_context(&matches, "pair_record_tool") {
        Ok(c) => c,
        Err(e) => {
            eprintln!("{e}");
            return;
        }
    };

    match matches.subcommand() {
        Some(("buid", _)) => match ctx.read_buid().await {
            Ok(buid) => println!("{buid}"),
            Err(e) => eprintln!("Failed to read BUID: {e}"),
        },
        Some(("read", sub)) => {
            let Some(id) = sub.get_one::<String>("id") else {
                return;
            };
            match ctx.read_pair_record(id).await {
                Ok(data) => match plist::from_bytes::<plist::Value>(&data) {
                    Ok(value) => {
                        let mut out = Vec::new();
                        if let Err(e) = value.to_writer_xml(&mut out) {
                            eprintln!("Failed to format record: {e}");
                            return;
                        }
                        println!("{}", String::from_utf8_lossy(&out));
                    }
                    // not a plist, dump it as-is
                    Err(_) => println!("{}", String::from_utf8_lossy(&data)),
                },
                Err(e) => eprintln!("Failed to read pairing record: {e}"),
            }
        }
        Some(("save", sub)) => {
            let id = sub.get_one::<String>("id");
            let file = sub.get_one::<String>("file");
            let (Some(id), Some(file)) = (id, file) else {
                return;
            };
            let data = match tokio::fs::read(file).await {
                Ok(d) => d,
                Err(e) => {
                    eprintln!("Failed to read {file}: {e}");
                    return;
                }
            };
            let device = sub.get_one::<u32>("device").copied().unwrap_or(0);
            match ctx.save_pair_record_with_device(id, device, &data).await {
                Ok(()) => println!("Saved pairing record {id}"),
                Err(e) => eprintln!("Failed to save pairing record: {e}"),
            }
        }
        Some(("delete", sub)) => {
            let Some(id) = sub.get_one::<String>("id") else {
                return;
            };
            match ctx.delete_pair_record(id).await {
                Ok(()) => println!("Deleted pairing record {id}"),
                Err(e) => eprintln!("Failed to delete pairing record: {e}"),
            }
        }
        _ => eprintln!("No subcommand given, see --help"),
    }
}
