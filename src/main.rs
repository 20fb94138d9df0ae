//! system-builder - Debian system image builder.
//!
//! Bootstraps a Debian root with debootstrap, provisions it with puppet and
//! assembles it into bootable artifacts:
//! - raw disk with a squashfs root behind an ext3 boot partition
//! - raw disk with FAT32 boot and ext3 root partitions
//! - ISO images, plain or squashfs based
//! - live-boot disk

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;
use tracing_subscriber::EnvFilter;

use system_builder::commands::{self, build::BuildSelection, show::ShowTarget};
use system_builder::config::{self, Config};
use system_builder::process::{self, HostExecutor};
use system_builder::project::{ArtifactKind, BoxProject};
use system_builder::target::{Architecture, BuildTarget, Release};

#[derive(Parser)]
#[command(name = "system-builder")]
#[command(about = "Debian system image builder")]
#[command(
    after_help = "QUICK START:\n  system-builder preflight  Check host tools\n  system-builder build      Build disk, iso and upgrade\n  system-builder dist       Collect the release into DIST\n  system-builder clean      Remove build artifacts"
)]
struct Cli {
    /// Box name, used in release names
    #[arg(long, global = true, default_value = "box")]
    name: String,

    /// Debian release (lenny ... bookworm, stable)
    #[arg(long, global = true, default_value = "stable")]
    release: Release,

    /// Architecture (i386, amd64, arm64, armhf)
    #[arg(long, global = true, default_value = "amd64")]
    arch: Architecture,

    /// Mirror used instead of DEBIAN_MIRROR / the archive
    #[arg(long, global = true)]
    mirror: Option<String>,

    /// Root directory (default: build/root)
    #[arg(long, global = true)]
    root: Option<PathBuf>,

    /// Puppet manifest file or directory (default: current directory)
    #[arg(long, global = true)]
    manifest: Option<PathBuf>,

    /// Keep build/ and dist/ per box name
    #[arg(long, global = true)]
    named: bool,

    /// Keep build/ and dist/ per box name and architecture
    #[arg(long, global = true)]
    multi_arch: bool,

    /// Debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build artifacts (default: disk-squashfs, iso-squashfs and upgrade)
    Build {
        #[command(subcommand)]
        what: Option<BuildWhat>,

        /// Disk image size in MB
        #[arg(long)]
        size_mb: Option<u64>,
    },

    /// Rerun the configure and clean phases on an existing root
    Configure,

    /// Rerun the clean phase on an existing root
    Cleanup,

    /// Create the upgrade bundle and latest.yml
    Upgrade,

    /// Collect the release artifacts (default target: DIST or ~/dist/<name>)
    Dist {
        #[arg(long)]
        target: Option<PathBuf>,
    },

    /// Export a raw disk with qemu-img
    Convert {
        /// qemu-img output format (vmdk, qcow2, vdi, ...)
        #[arg(short, long)]
        format: String,

        /// Disk artifact to convert
        #[arg(long, default_value = "disk-squashfs")]
        artifact: ArtifactKind,

        /// Output file (default: artifact file with the format as extension)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Link build/ and dist/ into WORKING_DIR
    Setup,

    /// Remove the root, build files and dist content
    Clean,

    /// Show information
    Show {
        #[command(subcommand)]
        what: ShowWhat,
    },

    /// Run preflight checks (verify host tools before build)
    Preflight {
        /// Fail if any checks fail (exit code 1)
        #[arg(long)]
        strict: bool,
    },
}

#[derive(Subcommand)]
enum BuildWhat {
    /// Raw disk, FAT32 boot and ext3 root partitions
    Disk,
    /// Raw disk, ext3 boot partition holding the root squashfs
    DiskSquashfs,
    /// ISO holding the whole root
    Iso,
    /// ISO holding kernel, initrd and the root squashfs
    IsoSquashfs,
    /// Raw disk booting with live-boot
    Live,
    /// disk-squashfs, iso-squashfs and the upgrade bundle
    All,
}

#[derive(Subcommand)]
enum ShowWhat {
    /// Show current configuration
    Config,
    /// Show root, artifacts and last release
    Status,
}

fn env_filter(verbose: bool) -> EnvFilter {
    if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    }
}

/// Env files first, so a RUST_LOG set in them takes effect.
fn init_tracing(verbose: bool) {
    // .env and ~/.system_builder.env
    let loaded = config::load_env_files();
    tracing_subscriber::fmt()
        .with_env_filter(env_filter(verbose))
        .with_target(false)
        .init();
    for path in loaded {
        debug!("Loaded {}", path.display());
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    process::install_interrupt_handler()?;

    let config = Config::from_env();

    let mut target = BuildTarget::new(cli.release, cli.arch)
        .with_default_mirror(config.default_mirror())
        .with_proxy(config.apt_proxy.clone());
    target.mirror = cli.mirror;

    let mut project = BoxProject::new(cli.name, target, config, Arc::new(HostExecutor::new()))
        .with_named_mode(cli.named || cli.multi_arch)
        .with_multi_architecture(cli.multi_arch);
    if let Some(root) = cli.root {
        project = project.with_root(root);
    }
    if let Some(manifest) = cli.manifest {
        project = project.with_manifest(manifest);
    }

    match cli.command {
        Commands::Build { what, size_mb } => {
            let selection = match what {
                None | Some(BuildWhat::All) => BuildSelection::All,
                Some(BuildWhat::Disk) => BuildSelection::Artifact(ArtifactKind::Disk),
                Some(BuildWhat::DiskSquashfs) => {
                    BuildSelection::Artifact(ArtifactKind::DiskSquashfs)
                }
                Some(BuildWhat::Iso) => BuildSelection::Artifact(ArtifactKind::Iso),
                Some(BuildWhat::IsoSquashfs) => BuildSelection::Artifact(ArtifactKind::IsoSquashfs),
                Some(BuildWhat::Live) => BuildSelection::Artifact(ArtifactKind::Live),
            };
            let project = project.with_size_mb(size_mb);
            commands::cmd_build(&project, selection)?;
        }

        Commands::Configure => commands::cmd_configure(&project)?,

        Commands::Cleanup => commands::cmd_cleanup(&project)?,

        Commands::Upgrade => commands::cmd_upgrade(&project)?,

        Commands::Dist { target } => commands::cmd_dist(&project, target)?,

        Commands::Convert {
            format,
            artifact,
            output,
        } => commands::cmd_convert(&project, artifact, &format, output)?,

        Commands::Setup => commands::cmd_setup(&project)?,

        Commands::Clean => commands::cmd_clean(&project)?,

        Commands::Show { what } => {
            let show_target = match what {
                ShowWhat::Config => ShowTarget::Config,
                ShowWhat::Status => ShowTarget::Status,
            };
            commands::cmd_show(&project, show_target)?;
        }

        Commands::Preflight { strict } => commands::cmd_preflight(&project, strict)?,
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn rust_log_from_env_file_reaches_filter() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(".env"), "RUST_LOG=system_builder=trace\n").unwrap();
        std::env::remove_var("RUST_LOG");
        std::env::set_current_dir(dir.path()).unwrap();

        let loaded = config::load_env_files();

        assert!(loaded.iter().any(|p| p.ends_with(".env")));
        assert_eq!(env_filter(false).to_string(), "system_builder=trace");
        assert_eq!(env_filter(true).to_string(), "debug");
    }
}
