//! bpflink CLI entry point.
//!
//! Provides `cat`, `info`, and `unpin` subcommands for working with links
//! pinned in the BPF filesystem.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{debug, info};

use bpflink::config::{load_config, load_default_config, resolve_pin_path, Config};
use bpflink::logging::{self, LoggingGuard};
use bpflink::sys::linux::LinuxKernel;
use bpflink::sys::Kernel;
use bpflink::{load_pinned_iter, Link, RawLink};

/// bpflink: inspect and drive pinned BPF links.
#[derive(Parser)]
#[command(name = "bpflink", version, about)]
struct Cli {
    /// Configuration file (default: ~/.config/bpflink/config.toml).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Subcommand to execute.
    #[command(subcommand)]
    command: Command,
}

/// Available CLI subcommands.
#[derive(Subcommand)]
enum Command {
    /// Run a pinned iterator once and copy its output to stdout.
    Cat {
        /// Pin path, absolute or relative to the bpffs root.
        pin: PathBuf,
        /// Read buffer size in bytes (overrides the config).
        #[arg(long)]
        buffer_size: Option<usize>,
    },
    /// Show kernel metadata for a pinned link.
    Info {
        /// Pin path, absolute or relative to the bpffs root.
        pin: PathBuf,
        /// Print JSON instead of text.
        #[arg(long)]
        json: bool,
    },
    /// Remove a pinned link from the BPF filesystem.
    Unpin {
        /// Pin path, absolute or relative to the bpffs root.
        pin: PathBuf,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => {
            load_config(path).with_context(|| format!("failed to load {}", path.display()))?
        }
        None => load_default_config()?,
    };
    let _logging_guard = init_logging(&config)?;

    let kernel: Arc<dyn Kernel> = Arc::new(LinuxKernel::new());

    match cli.command {
        Command::Cat { pin, buffer_size } => {
            let size = buffer_size.unwrap_or(config.iter.read_buffer_size);
            handle_cat(&kernel, &pin_path(&config, &pin)?, size)
        }
        Command::Info { pin, json } => handle_info(&kernel, &pin_path(&config, &pin)?, json),
        Command::Unpin { pin } => handle_unpin(&kernel, &pin_path(&config, &pin)?),
    }
}

fn init_logging(config: &Config) -> anyhow::Result<Option<LoggingGuard>> {
    match &config.logging.dir {
        Some(dir) => Ok(Some(logging::init_production(dir, &config.logging.level)?)),
        None => {
            logging::init_cli(&config.logging.level);
            Ok(None)
        }
    }
}

fn pin_path(config: &Config, pin: &Path) -> anyhow::Result<PathBuf> {
    if config.bpffs.confine {
        return resolve_pin_path(&config.bpffs.root, pin);
    }
    if pin.is_absolute() {
        Ok(pin.to_path_buf())
    } else {
        Ok(config.bpffs.root.join(pin))
    }
}

/// Open a pinned iterator and stream one full pass to stdout.
fn handle_cat(kernel: &Arc<dyn Kernel>, path: &Path, buffer_size: usize) -> anyhow::Result<()> {
    anyhow::ensure!(buffer_size > 0, "buffer size must be positive");

    let mut iter = load_pinned_iter(kernel, path)
        .with_context(|| format!("failed to load iterator {}", path.display()))?;
    let mut stream = iter.open().context("failed to open iterator")?;

    let stdout = io::stdout();
    let mut out = stdout.lock();
    let mut buf = vec![0u8; buffer_size];
    let mut total: usize = 0;
    loop {
        let n = stream.read(&mut buf).context("failed to read iterator")?;
        if n == 0 {
            break;
        }
        out.write_all(&buf[..n]).context("failed to write output")?;
        total = total.saturating_add(n);
    }
    out.flush().context("failed to flush output")?;

    stream.close().context("failed to close iterator stream")?;
    iter.close().context("failed to close iterator link")?;
    debug!(path = %path.display(), bytes = total, "iterator drained");
    Ok(())
}

/// Print link metadata.
fn handle_info(kernel: &Arc<dyn Kernel>, path: &Path, json: bool) -> anyhow::Result<()> {
    let mut link = RawLink::load_pinned(kernel, path)
        .with_context(|| format!("failed to load link {}", path.display()))?;
    let info = link.info().context("failed to query link info")?;

    if json {
        let value = serde_json::json!({
            "id": info.id,
            "type": info.link_type.to_string(),
            "prog_id": info.prog_id,
            "attach_type": link.attach_type().map(|a| a.to_string()),
            "pinned": path.display().to_string(),
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
    } else {
        println!("id:       {}", info.id);
        println!("type:     {}", info.link_type);
        println!("prog_id:  {}", info.prog_id);
        if let Some(attach) = link.attach_type() {
            println!("attach:   {attach}");
        }
        println!("pinned:   {}", path.display());
    }

    link.close().context("failed to close link")?;
    Ok(())
}

/// Remove the pin; the attachment goes away once nothing else holds it.
fn handle_unpin(kernel: &Arc<dyn Kernel>, path: &Path) -> anyhow::Result<()> {
    let mut link = RawLink::load_pinned(kernel, path)
        .with_context(|| format!("failed to load link {}", path.display()))?;
    link.unpin()
        .with_context(|| format!("failed to unpin {}", path.display()))?;
    link.close().context("failed to close link")?;
    info!(path = %path.display(), "link unpinned");
    Ok(())
}
