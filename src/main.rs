//! Main entry point for the remote-blockdev host shell.
//!
//! Configures the plugin from command-line parameters, copies a byte range of
//! the remote device to stdout or a file, and always runs exit cleanup.

use anyhow::{Context, Result};
use clap::Parser;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing_subscriber::EnvFilter;

use remote_blockdev::cli::exit_signal;
use remote_blockdev::{AdapterError, Cli, Plugin};

#[tokio::main]
async fn main() -> Result<()> {
    // Logs go to stderr; stdout may carry image data.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut plugin = Plugin::new(cli.backend);

    if cli.dump_plugin {
        print!("{}", plugin.dump_plugin_info());
        return Ok(());
    }

    let signalled = exit_signal().context("installing signal handlers")?;
    let outcome = tokio::select! {
        result = run(&mut plugin, &cli) => result,
        name = signalled => {
            tracing::warn!(signal = name, "stopping");
            Err(anyhow::anyhow!("interrupted by {name}"))
        }
    };

    // Cleanup runs on every path: success, failure and signals.
    let report = plugin.guard().shutdown().await;
    tracing::debug!(?report, "exit cleanup done");

    outcome.map_err(|e| {
        let code = e.downcast_ref::<AdapterError>().map(AdapterError::errno_name);
        match code {
            Some(code) => e.context(code),
            None => e,
        }
    })
}

/// Configure the plugin and copy the requested range.
///
/// # Arguments
///
/// * `plugin` - The unconfigured plugin
/// * `cli` - Parsed command-line arguments
async fn run(plugin: &mut Plugin, cli: &Cli) -> Result<()> {
    for (key, value) in &cli.params {
        plugin
            .config(key, value)
            .with_context(|| format!("parameter {key}"))?;
    }
    plugin.config_complete().await?;

    let handle = plugin.open(true).await?;
    let size = plugin.get_size(handle)?;
    tracing::info!(size, "device opened");

    // Checked before any output is written.
    let (offset, length) = cli.byte_range(size)?;

    let copied = match &cli.output {
        Some(path) => {
            let mut file = tokio::fs::File::create(path)
                .await
                .with_context(|| format!("creating {}", path.display()))?;
            copy_range(plugin, handle, offset, length, cli.chunk_size, &mut file).await?
        }
        None => {
            let mut stdout = tokio::io::stdout();
            copy_range(plugin, handle, offset, length, cli.chunk_size, &mut stdout).await?
        }
    };

    plugin.close(handle).await?;
    eprintln!("Copied {}", format_size(copied));
    Ok(())
}

/// Copy `length` bytes starting at `offset` into `out`, `chunk` bytes per read.
///
/// # Returns
///
/// The number of bytes written.
async fn copy_range<W: AsyncWrite + Unpin>(
    plugin: &Plugin,
    handle: u64,
    offset: u64,
    length: u64,
    chunk: u32,
    out: &mut W,
) -> Result<u64> {
    let mut done = 0u64;
    while done < length {
        let count = (length - done).min(u64::from(chunk)) as u32;
        let data = plugin.pread(handle, count, offset + done).await?;
        out.write_all(&data).await?;
        done += data.len() as u64;
    }
    out.flush().await?;
    Ok(done)
}

/// Format a byte size into a human-readable string.
///
/// # Examples
///
/// ```ignore
/// assert_eq!(format_size(500), "500 bytes");
/// assert_eq!(format_size(1536), "1.50 KB");
/// ```
fn format_size(size: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if size >= GB {
        format!("{:.2} GB", size as f64 / GB as f64)
    } else if size >= MB {
        format!("{:.2} MB", size as f64 / MB as f64)
    } else if size >= KB {
        format!("{:.2} KB", size as f64 / KB as f64)
    } else {
        format!("{} bytes", size)
    }
}
