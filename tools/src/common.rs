// Jackson Coxson
// Argument handling shared by the usbmux tools

use clap::{Arg, ArgAction, ArgMatches, Command};
use usbmux::{UsbmuxdAddr, UsbmuxdConfig, UsbmuxdContext};

/// Adds `--socket`, `--debug` and `--about` to a tool's command.
pub fn with_common_args(command: Command) -> Command {
    command
        .arg(
            Arg::new("socket")
                .long("socket")
                .value_name("ADDR")
                .help("usbmuxd address, UNIX:/path or HOST:PORT")
                .long_help(
                    "usbmuxd address, UNIX:/path or HOST:PORT. \
                     Overrides USBMUXD_SOCKET_ADDRESS.",
                ),
        )
        .arg(
            Arg::new("debug")
                .long("debug")
                .short('d')
                .help("Enable debug logging")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("about")
                .long("about")
                .help("Show about information")
                .action(ArgAction::SetTrue),
        )
}

pub fn init_logging(matches: &ArgMatches) {
    let mut builder = env_logger::Builder::from_default_env();
    if matches.get_flag("debug") {
        builder.filter_level(log::LevelFilter::Debug);
    }
    builder.init();
}

pub fn get_context(matches: &ArgMatches, prog_name: &str) -> Result<UsbmuxdContext, String> {
    let config = match matches.get_one::<String>("socket") {
        Some(addr) => UsbmuxdConfig::default().with_addr(
            UsbmuxdAddr::parse(addr).map_err(|e| format!("Invalid socket address: {e}"))?,
        ),
        None => UsbmuxdConfig::from_env()
            .map_err(|e| format!("Invalid USBMUXD_SOCKET_ADDRESS: {e}"))?,
    };
    Ok(UsbmuxdContext::new(config.with_prog_name(prog_name)))
}
