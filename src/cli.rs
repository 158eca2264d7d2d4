use std::future::Future;
use std::path::PathBuf;

use clap::Parser;
use tokio::signal::unix::{SignalKind, signal};

use crate::config::Backend;
use crate::error::AdapterError;

#[derive(Parser, Debug)]
#[command(name = "remote-blockdev")]
#[command(version)]
#[command(about = "Read a remote disk image as a block device", long_about = None)]
#[command(after_help = "Examples:\n  \
  remote-blockdev openstack auth_url=https://keystone:5000/v3 username=admin password=- \\\n    \
  project_name=demo image=cirros -o cirros.raw\n  \
  remote-blockdev ovirt url=https://engine/ovirt-engine/api username=admin@internal \\\n    \
  password=+pw.txt disk=<uuid> --offset 0 --length 512 | xxd")]
pub struct Cli {
    /// Remote service holding the image
    #[arg(value_enum, value_name = "BACKEND")]
    pub backend: Backend,

    /// Plugin parameters (endpoint_url=, username=, password=, target_id=, ...)
    #[arg(value_name = "KEY=VALUE", value_parser = parse_param)]
    pub params: Vec<(String, String)>,

    /// Print plugin information and exit
    #[arg(long)]
    pub dump_plugin: bool,

    /// First byte to copy
    #[arg(long, default_value_t = 0)]
    pub offset: u64,

    /// Number of bytes to copy (default: up to the end of the device)
    #[arg(long)]
    pub length: Option<u64>,

    /// Bytes requested per read
    #[arg(long, default_value_t = 1024 * 1024, value_parser = clap::value_parser!(u32).range(1..))]
    pub chunk_size: u32,

    /// Write the data here instead of stdout
    #[arg(short = 'o', value_name = "FILE")]
    pub output: Option<PathBuf>,
}

impl Cli {
    /// `(offset, length)` to copy from a device of `size` bytes.
    ///
    /// Without `--length` the copy runs to the end of the device.
    pub fn byte_range(&self, size: u64) -> Result<(u64, u64), AdapterError> {
        let length = self.length.unwrap_or(size.saturating_sub(self.offset));
        match self.offset.checked_add(length) {
            Some(end) if end <= size => Ok((self.offset, length)),
            _ => Err(AdapterError::OutOfRange {
                offset: self.offset,
                count: length,
                size,
            }),
        }
    }
}

/// Resolve with the name of the first SIGINT, SIGTERM or SIGHUP received.
///
/// Handlers are installed before this returns, so a signal arriving any time
/// afterwards is caught instead of ending the process.
pub fn exit_signal() -> std::io::Result<impl Future<Output = &'static str>> {
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sighup = signal(SignalKind::hangup())?;

    Ok(async move {
        tokio::select! {
            _ = sigint.recv() => "SIGINT",
            _ = sigterm.recv() => "SIGTERM",
            _ = sighup.recv() => "SIGHUP",
        }
    })
}

fn parse_param(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .filter(|(key, _)| !key.is_empty())
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .ok_or_else(|| format!("expected KEY=VALUE, got {raw:?}"))
}
