use std::fmt::Display;
use std::path::{Path, PathBuf};

use knock_common::KNOCK_RING_BYTE_SIZE;
use serde::{Deserialize, Serialize};

use crate::ServeArgs;

// searched in order when no config path is given
pub const COMMON_CONFIG_LOCATIONS: [&str; 3] = [
    "knockd.json",
    "/etc/knockd/knockd.json",
    "/usr/local/etc/knockd/knockd.json",
];

#[derive(Debug)]
pub struct KnockErrWithMsg {
    pub err: KnockErr,
    pub msg: String,
}

#[derive(Debug, PartialEq)]
pub enum KnockErr {
    Config,
    Socket,
    Capturing,
    Loading,
    Attaching,
    Receiving,
}

impl Display for KnockErrWithMsg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.err, self.msg)
    }
}

impl std::error::Error for KnockErrWithMsg {}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum CaptureMode {
    /// kernel XDP program, knocks arrive through the BPF ring buffer
    Xdp,
    /// AF_PACKET socket, frames are classified in user space
    Socket,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct GivenConfig {
    #[serde(rename = "NetworkInterface")]
    pub network_interface: String,
    #[serde(rename = "CaptureMode")]
    pub capture_mode: CaptureMode,
    #[serde(rename = "BpfObjectPath")]
    pub bpf_object_path: Option<PathBuf>,
    #[serde(rename = "GenericMode")]
    pub generic_mode: bool,
    #[serde(rename = "StrictEtherType")]
    pub strict_ether_type: bool,
    #[serde(rename = "RingByteSize")]
    pub ring_byte_size: usize,
    #[serde(rename = "CaptureThreads")]
    pub capture_threads: usize,
    #[serde(rename = "Debug")]
    pub debug: bool,
}

impl Default for GivenConfig {
    fn default() -> Self {
        Self {
            network_interface: String::new(),
            capture_mode: CaptureMode::Xdp,
            bpf_object_path: None,
            generic_mode: false,
            strict_ether_type: false,
            ring_byte_size: KNOCK_RING_BYTE_SIZE as usize,
            capture_threads: 1,
            debug: false,
        }
    }
}

/// Which frames the walker accepts besides the fixed header checks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KnockFilter {
    pub strict_ether_type: bool,
}

#[derive(Debug, Clone)]
pub struct CaptureConfig {
    pub interface: String,
    pub capture_mode: CaptureMode,
    pub bpf_object_path: Option<PathBuf>,
    pub generic_mode: bool,
    pub filter: KnockFilter,
    pub ring_byte_size: usize,
    pub capture_threads: usize,
    pub debug: bool,
}

impl GivenConfig {
    pub fn validate(&self) -> Result<(), KnockErrWithMsg> {
        if !self.ring_byte_size.is_power_of_two() || self.ring_byte_size < 16 {
            return Err(KnockErrWithMsg {
                err: KnockErr::Config,
                msg: format!(
                    "RingByteSize must be a power of two and at least 16, got {}",
                    self.ring_byte_size
                ),
            });
        }
        if self.capture_threads < 1 {
            return Err(KnockErrWithMsg {
                err: KnockErr::Config,
                msg: String::from("CaptureThreads must be at least 1"),
            });
        }
        Ok(())
    }

    /// CLI arguments take precedence over the file.
    pub fn extract_config(&self, args: &ServeArgs) -> CaptureConfig {
        let interface = match &args.interface {
            Some(iface) => iface.clone(),
            None => self.network_interface.clone(),
        };
        CaptureConfig {
            interface,
            capture_mode: args.mode.unwrap_or(self.capture_mode),
            bpf_object_path: self.bpf_object_path.clone(),
            generic_mode: args.generic_mode || self.generic_mode,
            filter: KnockFilter {
                strict_ether_type: self.strict_ether_type,
            },
            ring_byte_size: self.ring_byte_size,
            capture_threads: self.capture_threads,
            debug: self.debug,
        }
    }
}

/// An explicitly given file has to load, otherwise the common locations are
/// searched and the defaults used when nothing is found.
pub fn load_configuration(config_path: Option<&Path>) -> Result<GivenConfig, KnockErrWithMsg> {
    let path = match config_path {
        Some(path) => Some(path.to_path_buf()),
        None => COMMON_CONFIG_LOCATIONS
            .iter()
            .map(PathBuf::from)
            .find(|loc| loc.is_file()),
    };

    let Some(path) = path else {
        log::warn!(
            "no configuration file found, using defaults. Generate one with: knockd default-config > knockd.json"
        );
        return Ok(GivenConfig::default());
    };

    let raw = std::fs::read_to_string(&path).map_err(|e| KnockErrWithMsg {
        err: KnockErr::Config,
        msg: format!("failed to read config file '{}': {}", path.display(), e),
    })?;
    let config = parse_configuration(&raw)?;
    log::info!("loaded configuration from {}", path.display());
    Ok(config)
}

pub fn parse_configuration(raw: &str) -> Result<GivenConfig, KnockErrWithMsg> {
    let config: GivenConfig = serde_json::from_str(raw).map_err(|e| KnockErrWithMsg {
        err: KnockErr::Config,
        msg: format!("malformed config json: {}", e),
    })?;
    config.validate()?;
    Ok(config)
}
