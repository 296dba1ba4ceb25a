use anyhow::{Context, Result};
use clap::Parser;
use log::{error, info, LevelFilter};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use vfsd::{ChannelEndpoint, Client, MemFs, Session, Vfs, VfsConfig};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// JSON configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Print the effective configuration and exit
    #[arg(long)]
    print_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logger based on verbose flag
    let log_level = if cli.verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };

    env_logger::Builder::new().filter_level(log_level).init();

    let config = match &cli.config {
        Some(path) => VfsConfig::load(path)?,
        None => VfsConfig::default(),
    };

    if cli.print_config {
        println!("{}", serde_json::to_string_pretty(&config)?);
        return Ok(());
    }

    info!("Starting vfsd...");

    let vfs = Arc::new(Vfs::new(config.clone()));
    for fs in &config.filesystems {
        let endpoint = ChannelEndpoint::spawn(Arc::new(MemFs::new()), config.session_queue);
        vfs.register_fs(fs.clone(), Arc::new(endpoint))
            .with_context(|| format!("Failed to register filesystem {}", fs.name))?;
    }

    if let Some(root) = &config.root {
        vfs.mount("/", &root.fs, root.device, &root.options, false)
            .await
            .with_context(|| format!("Failed to mount {} at /", root.fs))?;
    }

    let session = Session::start(Client::new(vfs.clone()), config.session_queue);
    info!("Session {} ready. Waiting for shutdown signal...", session.id());

    signal::ctrl_c().await?;
    info!("Received shutdown signal");

    session.shutdown().await?;
    if config.root.is_some() {
        if let Err(e) = vfs.unmount("/").await {
            error!("Failed to unmount /: {}", e);
        }
    }

    info!("vfsd terminated");
    Ok(())
}
