//! userspacefs CLI
//!
//! Mounts a local directory through the userspacefs stack. Useful on its own
//! and as a smoke test for the kernel transport and the share fallback.

mod error;

use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;

use clap::Parser;
use tracing::info;
use userspacefs::config::ConfigFile;
use userspacefs::fs::{FileSystem, LocalFileSystem};
use userspacefs::fuse::{FsFactory, TransportOptions};
use userspacefs::mount::{ListenAddress, MountOptions, Orchestrator};

use crate::error::CliError;

#[derive(Debug, Parser)]
#[command(name = "userspacefs")]
#[command(version = userspacefs::VERSION)]
#[command(about = "Mount a directory as a user-space filesystem", long_about = None)]
struct Cli {
    /// Directory to serve
    source: PathBuf,

    /// Where to mount it (not needed with --smb-no-mount)
    mountpoint: Option<PathBuf>,

    /// Keep filesystem server in foreground
    #[arg(short, long)]
    foreground: bool,

    /// Show log messages, use twice for maximum verbosity
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Force mounting via SMB
    #[arg(short, long)]
    smb: bool,

    /// Export filesystem via SMB but don't mount it
    #[arg(short = 'n', long)]
    smb_no_mount: bool,

    /// Address the SMB service listens on, append colon to specify port
    #[arg(short = 'l', long, value_name = "HOST[:PORT]")]
    smb_listen_address: Option<ListenAddress>,

    /// FUSE options, e.g. -o uid=1000,allow_other
    #[arg(short = 'o', value_name = "OPT[,OPT...]")]
    options: Vec<String>,

    /// Volume name (defaults to the source directory name)
    #[arg(long)]
    name: Option<String>,

    /// Configuration file
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,
}

/// Effective settings after merging the command line over the config file.
#[derive(Debug)]
struct Settings {
    display_name: String,
    foreground: bool,
    smb: bool,
    smb_no_mount: bool,
    listen_address: ListenAddress,
    transport_options: TransportOptions,
}

impl Settings {
    fn resolve(cli: &Cli, config: &ConfigFile) -> Self {
        let mount = &config.mount;

        let mut transport_options = TransportOptions::new();
        for list in &cli.options {
            transport_options.extend_from_str(list);
        }
        transport_options.merge_defaults(&config.fuse);

        Self {
            display_name: cli
                .name
                .clone()
                .or_else(|| mount.name.clone())
                .unwrap_or_else(|| default_display_name(&cli.source)),
            foreground: cli.foreground || mount.foreground.unwrap_or(false),
            smb: cli.smb || mount.smb.unwrap_or(false),
            smb_no_mount: cli.smb_no_mount || mount.smb_no_mount.unwrap_or(false),
            listen_address: cli
                .smb_listen_address
                .clone()
                .or_else(|| mount.listen_address.clone())
                .unwrap_or_default(),
            transport_options,
        }
    }

    fn mount_options(&self) -> MountOptions {
        MountOptions::new()
            .with_foreground(self.foreground)
            .with_force_fallback(self.smb)
            .with_fallback_no_mount(self.smb_no_mount)
            .with_listen_address(self.listen_address.clone())
            .with_transport_options(self.transport_options.clone())
    }
}

fn default_display_name(source: &Path) -> String {
    source
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "userspacefs".to_string())
}

fn local_factory(root: PathBuf) -> FsFactory {
    Arc::new(move || Ok(Arc::new(LocalFileSystem::new(root.clone())?) as Arc<dyn FileSystem>))
}

fn run(cli: Cli) -> Result<i32, CliError> {
    let config = match &cli.config {
        Some(path) => ConfigFile::load(path)?,
        None => ConfigFile::load_default()?,
    };
    let settings = Settings::resolve(&cli, &config);

    // Fail before daemonizing if the directory cannot be served.
    let source = std::path::absolute(&cli.source)
        .and_then(|path| LocalFileSystem::new(path).map(|fs| fs.root().to_path_buf()))
        .map_err(|source| CliError::Source {
            path: cli.source.clone(),
            source,
        })?;

    userspacefs::logging::init(settings.foreground, cli.verbose, &settings.display_name)?;
    info!(
        version = userspacefs::VERSION,
        source = %source.display(),
        name = %settings.display_name,
        "Starting userspacefs"
    );

    let status = Orchestrator::new().mount_and_run(
        &settings.display_name,
        local_factory(source),
        cli.mountpoint.as_deref(),
        settings.mount_options(),
    )?;
    Ok(status)
}

fn main() {
    let cli = Cli::parse();
    match run(cli) {
        Ok(status) => process::exit(status),
        Err(e) => {
            tracing::error!(error = %e, "userspacefs failed");
            eprintln!("Error: {}", e);
            process::exit(e.exit_code());
        }
    }
}
