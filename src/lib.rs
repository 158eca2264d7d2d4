//! # remote-blockdev
//!
//! Expose a remotely hosted disk image as a random-access, read-only block device.
//!
//! Two remote services are supported, each offering a different transport:
//!
//! - **OpenStack Glance** only hands out an image as one forward-only download.
//!   Random access is emulated per handle: reads ahead of the current position
//!   discard bytes, reads behind it restart the download from byte 0.
//! - **oVirt imageio** serves arbitrary byte ranges once an image transfer has
//!   been negotiated with the engine. Every read is an independent HTTP Range
//!   request authorized by the transfer's signed ticket.
//!
//! ## Architecture
//!
//! - [`session`]: authenticates, resolves the target and fixes the device size
//! - [`io`]: the [`Transport`] capability and its two implementations
//! - [`adapter`]: the open/close/get_size/can_write/pread surface
//! - [`plugin`]: the callback contract a block-device host drives
//! - [`lifecycle`]: exactly-once release of handles, transfer and login at exit
//!
//! ## Example
//!
//! ```no_run
//! use remote_blockdev::{Backend, Plugin};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let mut plugin = Plugin::new(Backend::Ovirt);
//!     plugin.config("url", "https://engine.example/ovirt-engine/api")?;
//!     plugin.config("username", "admin@internal")?;
//!     plugin.config("password", "+/run/secrets/engine-password")?;
//!     plugin.config("disk", "6f0f3c1e-0d4c-4a7b-9a55-2c1f2b0e2f10")?;
//!
//!     let result = async {
//!         plugin.config_complete().await?;
//!         let handle = plugin.open(true).await?;
//!         let mbr = plugin.pread(handle, 512, 0).await?;
//!         println!("boot signature: {:02x?}", &mbr[510..]);
//!         plugin.close(handle).await
//!     }
//!     .await;
//!
//!     plugin.shutdown().await;
//!     Ok(result?)
//! }
//! ```

pub mod adapter;
pub mod cli;
pub mod config;
pub mod error;
pub mod io;
pub mod lifecycle;
pub mod plugin;
pub mod poll;
pub mod session;

pub use adapter::{HandleId, ReadAdapter};
pub use cli::Cli;
pub use config::{Backend, Config, Params};
pub use error::AdapterError;
pub use io::{RangeFetcher, RangedTransport, SequentialStreamTransport, Transport, TransportCursor};
pub use lifecycle::{LifecycleGuard, ShutdownReport};
pub use plugin::Plugin;
pub use poll::PollPolicy;
pub use session::{Session, SessionManager};
