//! DriveShare Daemon
//!
//! Shares removable drives and directories over HTTP on the local network.

use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use daemon::config::{default_config_path, Config};
use daemon::{
    DeviceDiscovery, LsblkProvider, MountManager, NtfsSupport, Share, ShareRegistry,
    SystemMountExecutor,
};

/// DriveShare - share removable drives over HTTP on the local network.
#[derive(Parser, Debug)]
#[command(name = "driveshare")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// List removable drives and partitions
    Devices {
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Mount (or reuse) drives and share each on its own port
    Share {
        /// Partition names, e.g. sdb1 or /dev/sdb1
        #[arg(required = true, value_name = "DEVICE")]
        devices: Vec<String>,
    },

    /// Share plain directories
    Serve {
        /// Directories to share
        #[arg(required = true, value_name = "DIR")]
        dirs: Vec<PathBuf>,

        /// Port of the first server (default: configured base port)
        #[arg(long, short)]
        port: Option<u16>,
    },

    /// Check for the NTFS driver, optionally installing it
    CheckNtfs {
        /// Install the driver if it is missing
        #[arg(long)]
        install: bool,
    },

    /// Write the default configuration file (to --config, or the default path)
    InitConfig {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let mut config = match &cli.config {
        Some(config_path) => Config::load(config_path)?,
        None => Config::load_default()?,
    };

    // Apply environment variable overrides
    config.apply_env_overrides();

    // Validate configuration
    config.validate()?;

    // Initialize tracing
    let filter = if cli.verbose {
        "debug"
    } else {
        config.daemon.log_level.as_str()
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    if let Some(config_path) = &cli.config {
        tracing::debug!("Using config file: {:?}", config_path);
    }

    match cli.command {
        Commands::Devices { json } => list_devices(json)?,
        Commands::Share { devices } => share_devices(config, &devices).await?,
        Commands::Serve { dirs, port } => serve_dirs(config, &dirs, port).await?,
        Commands::CheckNtfs { install } => {
            let support = NtfsSupport::from_config(&config.mount);
            if support.check() {
                println!("NTFS support available ({})", support.driver());
            } else if install {
                println!("NTFS support not found. Installing {}...", support.driver());
                support
                    .install()
                    .with_context(|| format!("Please install {} manually", support.driver()))?;
                println!("Installed {}", support.driver());
            } else {
                println!("NTFS support not found (missing {})", support.driver());
                println!("Run: driveshare-daemon check-ntfs --install");
                std::process::exit(1);
            }
        }
        Commands::InitConfig { force } => {
            let path = cli.config.clone().unwrap_or_else(default_config_path);
            write_default_config(&path, force)?;
            println!("Wrote default configuration to {}", path.display());
        }
    }

    Ok(())
}

fn write_default_config(path: &std::path::Path, force: bool) -> anyhow::Result<()> {
    if path.exists() && !force {
        anyhow::bail!("{} already exists (use --force to overwrite)", path.display());
    }
    Config::default().save(path)
}

fn list_devices(json: bool) -> anyhow::Result<()> {
    let drives = DeviceDiscovery::new(LsblkProvider::new()).list_candidates();

    if json {
        println!("{}", serde_json::to_string_pretty(&drives)?);
        return Ok(());
    }

    if drives.is_empty() {
        println!("No USB drives detected!");
        println!("Make sure your USB drive is properly connected and has valid partitions.");
        return Ok(());
    }

    println!("Available USB drives and partitions:");
    for (i, drive) in drives.iter().enumerate() {
        println!("{:>2}. {}", i + 1, drive.display_line());
    }
    Ok(())
}

fn new_registry(config: &Config) -> ShareRegistry<SystemMountExecutor> {
    let executor = SystemMountExecutor::new(config.mount.use_sudo);
    let mounts = MountManager::from_config(executor, &config.mount);
    ShareRegistry::new(config.server.clone(), mounts)
}

async fn share_devices(config: Config, devices: &[String]) -> anyhow::Result<()> {
    let support = NtfsSupport::from_config(&config.mount);
    if !support.check() {
        if config.mount.install_ntfs_driver {
            println!("NTFS support not found. Installing...");
            support.install().with_context(|| {
                format!("Failed to install NTFS support. Please install {} manually", support.driver())
            })?;
        } else {
            tracing::warn!(driver = %support.driver(), "NTFS driver not found; NTFS drives may fail to mount");
        }
    }

    println!(
        "You can share up to {} drives simultaneously",
        config.server.max_servers
    );

    let mut registry = new_registry(&config);
    for device in devices {
        match registry.share_device(device).await {
            Ok(share) => print_share(device, &share),
            Err(e) => eprintln!("Failed to share {}: {}", device, e),
        }
    }

    run_until_signal(registry).await
}

async fn serve_dirs(config: Config, dirs: &[PathBuf], port: Option<u16>) -> anyhow::Result<()> {
    let mut registry = new_registry(&config);
    if let Some(port) = port {
        registry = registry.with_base_port(port);
    }

    for dir in dirs {
        let root = std::fs::canonicalize(dir)
            .with_context(|| format!("Cannot share {}", dir.display()))?;
        match registry.share_directory(&root).await {
            Ok(share) => print_share(&dir.display().to_string(), &share),
            Err(e) => eprintln!("Failed to share {}: {}", dir.display(), e),
        }
    }

    run_until_signal(registry).await
}

async fn run_until_signal(mut registry: ShareRegistry<SystemMountExecutor>) -> anyhow::Result<()> {
    if registry.servers().is_empty() {
        registry.shutdown().await;
        anyhow::bail!("Nothing is being shared");
    }

    println!(
        "\nCurrently sharing {} location(s). Press Ctrl+C to stop all servers.",
        registry.servers().len()
    );

    let signal = wait_for_shutdown_signal().await;

    println!("\nShutting down...");
    registry.shutdown().await;
    signal
}

fn print_share(name: &str, share: &Share) {
    let host = display_host(share.addr);
    println!("Sharing {} from {}", name, share.root.display());
    if let Some(mount) = &share.mount {
        if !mount.owned() {
            println!("  Using existing mount point: {}", mount.mount_point().display());
        }
    }
    println!("  Local:   http://localhost:{}/", share.addr.port());
    println!("  Network: http://{}:{}/", host, share.addr.port());
}

/// Address other devices on the LAN should use to reach `addr`.
fn display_host(addr: SocketAddr) -> IpAddr {
    if addr.ip().is_unspecified() {
        local_ip()
    } else {
        addr.ip()
    }
}

/// Best guess at this machine's LAN address.
///
/// Connecting a UDP socket only selects a route; nothing is sent.
fn local_ip() -> IpAddr {
    UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))
        .and_then(|socket| {
            socket.connect((Ipv4Addr::new(8, 8, 8, 8), 80))?;
            socket.local_addr()
        })
        .map(|addr| addr.ip())
        .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST))
}

/// Wait for a shutdown signal (SIGTERM or SIGINT).
async fn wait_for_shutdown_signal() -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm =
        signal(SignalKind::terminate()).context("Failed to register SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to register SIGINT handler")?;

    tokio::select! {
        _ = sigterm.recv() => {
            tracing::info!("Received SIGTERM");
        }
        _ = sigint.recv() => {
            tracing::info!("Received SIGINT");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_debug_assert() {
        // Verify the CLI structure is valid
        Cli::command().debug_assert();
    }

    #[test]
    fn test_devices_command() {
        let cli = Cli::try_parse_from(["driveshare", "devices", "--json"]).unwrap();
        match cli.command {
            Commands::Devices { json } => assert!(json),
            _ => panic!("Expected Devices command"),
        }
    }

    #[test]
    fn test_share_requires_device() {
        assert!(Cli::try_parse_from(["driveshare", "share"]).is_err());

        let cli = Cli::try_parse_from(["driveshare", "share", "sdb1", "/dev/sdc1"]).unwrap();
        match cli.command {
            Commands::Share { devices } => assert_eq!(devices, vec!["sdb1", "/dev/sdc1"]),
            _ => panic!("Expected Share command"),
        }
    }

    #[test]
    fn test_serve_with_port() {
        let cli = Cli::try_parse_from(["driveshare", "serve", "/srv/a", "/srv/b", "--port", "9000"])
            .unwrap();
        match cli.command {
            Commands::Serve { dirs, port } => {
                assert_eq!(dirs, vec![PathBuf::from("/srv/a"), PathBuf::from("/srv/b")]);
                assert_eq!(port, Some(9000));
            }
            _ => panic!("Expected Serve command"),
        }
    }

    #[test]
    fn test_check_ntfs_command() {
        let cli = Cli::try_parse_from(["driveshare", "check-ntfs", "--install"]).unwrap();
        assert!(matches!(cli.command, Commands::CheckNtfs { install: true }));
    }

    #[test]
    fn test_init_config_command() {
        let cli = Cli::try_parse_from(["driveshare", "-c", "/tmp/d.toml", "init-config"]).unwrap();
        assert!(matches!(cli.command, Commands::InitConfig { force: false }));
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/d.toml")));
    }

    #[test]
    fn test_write_default_config_refuses_to_overwrite() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let path = temp_dir.path().join("driveshare").join("config.toml");

        write_default_config(&path, false).unwrap();
        assert_eq!(Config::load(&path).unwrap(), Config::default());

        std::fs::write(&path, "[server]\nbase_port = 9000\n").unwrap();
        assert!(write_default_config(&path, false).is_err());
        assert_eq!(Config::load(&path).unwrap().server.base_port, 9000);

        write_default_config(&path, true).unwrap();
        assert_eq!(Config::load(&path).unwrap().server.base_port, 8000);
    }

    #[test]
    fn test_global_flags() {
        let cli = Cli::try_parse_from(["driveshare", "-v", "--config", "/tmp/c.toml", "devices"])
            .unwrap();
        assert!(cli.verbose);
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/c.toml")));
    }

    #[test]
    fn test_display_host() {
        let addr: SocketAddr = "192.168.1.5:8000".parse().unwrap();
        assert_eq!(display_host(addr), addr.ip());

        let any: SocketAddr = "0.0.0.0:8000".parse().unwrap();
        assert!(!display_host(any).is_unspecified());
    }
}
