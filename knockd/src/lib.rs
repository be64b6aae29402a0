use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::knock_utils::shared::types_and_config::CaptureMode;

pub mod knock_utils;

#[derive(Parser, Debug)]
#[command(version, about = "Port knock listener", long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Attach to an interface and print every knock as `ip,port`
    Serve(ServeArgs),
    /// Print the default configuration as JSON
    DefaultConfig,
}

#[derive(clap::Args, Debug, Clone)]
pub struct ServeArgs {
    /// Path to the JSON configuration file
    #[arg(long, short)]
    pub config: Option<PathBuf>,

    /// Interface to listen on (e.g., eno1), overrides NetworkInterface
    #[arg(long, alias = "iface")]
    pub interface: Option<String>,

    /// Capture mode, overrides CaptureMode
    #[arg(long, value_enum)]
    pub mode: Option<CaptureMode>,

    /// Force generic (SKB) XDP mode
    #[arg(long)]
    pub generic_mode: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serve_args_parse() {
        let args = Args::try_parse_from([
            "knockd",
            "serve",
            "--iface",
            "eth1",
            "--mode",
            "socket",
            "--generic-mode",
        ])
        .unwrap();
        let Command::Serve(serve) = args.command else {
            panic!("expected serve");
        };
        assert_eq!(serve.interface.as_deref(), Some("eth1"));
        assert_eq!(serve.mode, Some(CaptureMode::Socket));
        assert!(serve.generic_mode);
        assert!(serve.config.is_none());
    }

    #[test]
    fn test_unknown_mode_rejected() {
        assert!(Args::try_parse_from(["knockd", "serve", "--mode", "pcap"]).is_err());
    }
}
