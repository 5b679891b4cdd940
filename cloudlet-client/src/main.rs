//! Cloudlet synthesis client: list local overlays, query a server, run a
//! synthesis session.

mod config;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::info;
use tracing_subscriber::EnvFilter;

use cloudlet_core::manifest::OverlaySource;
use cloudlet_core::protocol::SynthesisOptions;
use cloudlet_core::session::{
    fetch_resource_info, SessionConfig, SessionEvent, SynthesisSession,
};
use cloudlet_core::value::Value;

#[derive(Parser, Debug)]
#[command(name = "cloudlet-client", version, about = "VM overlay synthesis client")]
struct Cli {
    /// Server address (host:port). Overrides the config file.
    #[arg(long, global = true)]
    server: Option<String>,
    /// Overlay root directory. Overrides the config file.
    #[arg(long, global = true)]
    overlay_root: Option<PathBuf>,
    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Subcommand, Debug)]
enum CliCommand {
    /// List overlays under the overlay root.
    List,
    /// Query the server's resource info.
    Info,
    /// Synthesize one overlay on the server.
    Run {
        /// Application name, a subdirectory of the overlay root.
        overlay: String,
        /// Ask the server to expose the VM display over VNC.
        #[arg(long)]
        display_vnc: bool,
        /// Ask the server to boot the VM before synthesis completes.
        #[arg(long)]
        early_start: bool,
        /// Ask the server to report synthesis statistics.
        #[arg(long)]
        show_statistics: bool,
    },
}

fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let mut cfg = config::load();
    if let Some(server) = cli.server {
        cfg.server = Some(server);
    }
    if let Some(root) = cli.overlay_root {
        cfg.overlay_root = root;
    }

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        match cli.command {
            CliCommand::List => cmd_list(&cfg),
            CliCommand::Info => cmd_info(&cfg).await,
            CliCommand::Run {
                overlay,
                display_vnc,
                early_start,
                show_statistics,
            } => {
                let options = SynthesisOptions {
                    display_vnc,
                    early_start,
                    show_statistics,
                };
                cmd_run(&cfg, &overlay, options).await
            }
        }
    })
}

async fn resolve_server(cfg: &config::Config) -> Result<SocketAddr> {
    let server = cfg
        .server
        .as_deref()
        .ok_or_else(|| anyhow!("no server configured; pass --server or set CLOUDLET_SERVER"))?;
    tokio::net::lookup_host(server)
        .await
        .with_context(|| format!("cannot resolve {server}"))?
        .next()
        .ok_or_else(|| anyhow!("{server} resolved to no addresses"))
}

fn cmd_list(cfg: &config::Config) -> Result<()> {
    let source = OverlaySource::new(&cfg.overlay_root);
    let overlays = source
        .list()
        .with_context(|| format!("cannot scan {}", source.root().display()))?;
    if overlays.is_empty() {
        println!("no overlays under {}", source.root().display());
        return Ok(());
    }
    for overlay in overlays {
        println!(
            "{:<24} {:>3} segments {:>12} bytes  base {}",
            overlay.app_name(),
            overlay.expected_segments(),
            overlay.total_bytes(),
            overlay.base_vm_sha256(),
        );
    }
    Ok(())
}

async fn cmd_info(cfg: &config::Config) -> Result<()> {
    let addr = resolve_server(cfg).await?;
    let wait = Duration::from_secs(cfg.connect_timeout_secs);
    let info = fetch_resource_info(addr, wait).await?;
    match info {
        Value::Map(fields) => {
            for (key, value) in fields.iter() {
                println!("{key:<24} {value}");
            }
        }
        other => println!("{other}"),
    }
    Ok(())
}

async fn cmd_run(cfg: &config::Config, overlay: &str, options: SynthesisOptions) -> Result<()> {
    let addr = resolve_server(cfg).await?;
    let source = OverlaySource::new(&cfg.overlay_root);
    let manifest = Arc::new(source.find(overlay)?);
    info!(
        app = %manifest.app_name(),
        dir = %manifest.dir().display(),
        segments = manifest.expected_segments(),
        bytes = manifest.total_bytes(),
        "starting synthesis"
    );

    let session_config = SessionConfig {
        connect_timeout: Duration::from_secs(cfg.connect_timeout_secs),
        options,
    };
    let (mut session, mut events) = SynthesisSession::start(addr, manifest, session_config);

    let bar = ProgressBar::new(100);
    bar.set_style(
        ProgressStyle::default_bar()
            .template("{bar:40} {pos:>3}%  {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar()),
    );

    let outcome = loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(SessionEvent::Status(text)) => bar.set_message(text),
                Some(SessionEvent::Progress(percent)) => bar.set_position(u64::from(percent)),
                Some(SessionEvent::Succeeded { app_name }) => break Ok(app_name),
                Some(SessionEvent::Failed { reason }) => break Err(anyhow!(reason)),
                None => break Err(anyhow!("session ended without an outcome")),
            },
            _ = tokio::signal::ctrl_c() => {
                bar.abandon_with_message("interrupted");
                session.close().await;
                bail!("interrupted");
            }
        }
    };
    session.close().await;

    match outcome {
        Ok(app_name) => {
            bar.finish_with_message("synthesis complete");
            println!("synthesis complete: {app_name}");
            Ok(())
        }
        Err(err) => {
            bar.abandon_with_message("failed");
            Err(err.context(format!("synthesis of {overlay} failed")))
        }
    }
}
