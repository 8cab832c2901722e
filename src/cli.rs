use crate::config::{AppConfig, TransportKind};
use crate::controller::ControllerKind;
use crate::transport::SendFailurePolicy;
use clap::Parser;
use std::path::PathBuf;

/// Bridge gamepad and keyboard input to an emulated controller.
#[derive(Parser, Debug)]
#[command(name = "padlink", version, about)]
pub struct Cli {
    /// Config file, defaults to <config dir>/padlink/config.toml
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Send frames to a serial adapter
    #[arg(long, value_name = "PATH", conflicts_with = "tcp")]
    pub serial: Option<String>,

    /// Send frames over TCP
    #[arg(long, value_name = "HOST:PORT")]
    pub tcp: Option<String>,

    /// Refresh period in milliseconds
    #[arg(long, value_name = "MS", value_parser = clap::value_parser!(u64).range(1..))]
    pub refresh: Option<u64>,

    /// Axis precision in bits
    #[arg(long, value_name = "BITS", value_parser = clap::value_parser!(u8).range(1..=16))]
    pub precision: Option<u8>,

    /// Emulated controller type
    #[arg(long, value_enum)]
    pub controller: Option<ControllerKind>,

    /// Press this key once after connecting
    #[arg(long, value_name = "KEY")]
    pub keygen: Option<String>,

    /// Validate the setup and exit without running
    #[arg(long)]
    pub check: bool,

    /// Resend the full frame every iteration
    #[arg(long)]
    pub force_updates: bool,

    /// Print status lines for frontends
    #[arg(long)]
    pub status: bool,

    /// What to do when a frame cannot be sent
    #[arg(long, value_enum, value_name = "POLICY")]
    pub on_send_failure: Option<SendFailurePolicy>,

    /// Keep the default scheduling class
    #[arg(long)]
    pub no_priority: bool,

    /// Print the effective configuration as TOML and exit
    #[arg(long)]
    pub dump_config: bool,
}

impl Cli {
    /// Overrides file values with the flags that were given.
    pub fn apply(&self, config: &mut AppConfig) {
        if let Some(path) = &self.serial {
            config.transport.kind = TransportKind::Serial;
            config.transport.target = Some(path.clone());
        }
        if let Some(addr) = &self.tcp {
            config.transport.kind = TransportKind::Tcp;
            config.transport.target = Some(addr.clone());
        }
        if let Some(refresh) = self.refresh {
            config.control.refresh_ms = refresh;
        }
        if let Some(precision) = self.precision {
            config.control.precision_bits = precision;
        }
        if let Some(controller) = self.controller {
            config.control.controller = controller;
        }
        if self.force_updates {
            config.control.force_updates = true;
        }
        if let Some(policy) = self.on_send_failure {
            config.transport.on_send_failure = policy;
        }
        if self.no_priority {
            config.priority.enabled = false;
        }
    }
}
