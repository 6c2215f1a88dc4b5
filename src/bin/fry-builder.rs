//! Fry IoT image builder CLI
//!
//! # Usage
//!
//! ```bash
//! # Show the resolved plan for a profile
//! fry-builder --profile x86-64 plan
//!
//! # Full build (also resumes an interrupted one)
//! PROFILE=rpi4 fry-builder build
//!
//! # Rootfs only, exported as a tarball
//! fry-builder --profile mt7621-router rootfs --archive
//!
//! # Stage progress
//! fry-builder --profile x86-64 status
//! ```

mod workflows;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use fry_builder::BuildError;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "fry-builder")]
#[command(author, version, about = "Fry IoT Debian image builder", long_about = None)]
pub(crate) struct Cli {
    /// Project root holding base-config.toml and profiles/
    #[arg(long, global = true, env = "FRY_ROOT")]
    root: Option<PathBuf>,

    /// Device profile to build
    #[arg(short, long, global = true, env = "PROFILE")]
    profile: Option<String>,

    /// Write images here instead of output/<profile>-<arch>
    #[arg(long, global = true, env = "FRY_OUTPUT_DIR")]
    output_dir: Option<PathBuf>,

    /// Override the image size (e.g. 2G, 1536M)
    #[arg(long, global = true, env = "FRY_IMAGE_SIZE")]
    image_size: Option<String>,

    /// Verbose output (-v info, -vv debug, -vvv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
pub(crate) enum Commands {
    /// Generate the configuration overlay only
    Configure,

    /// Build the installed rootfs with services injected
    Rootfs {
        /// Also export the rootfs as a .tar.zst archive
        #[arg(long)]
        archive: bool,
    },

    /// Run every stage, reusing completed ones
    Build {
        /// Skip the host tool check
        #[arg(long)]
        no_preflight: bool,
    },

    /// Compress the assembled image and write checksums
    Compress,

    /// Validate the finished image
    Validate {
        /// Boot the image in an emulator as part of validation
        #[arg(long)]
        smoke_test: bool,
    },

    /// Remove the work tree (cache and output stay)
    Clean,

    /// Remove the work tree and every file the build published
    Reset,

    /// Show stage progress
    Status,

    /// List available profiles
    Profiles,

    /// Print the resolved build plan as JSON
    Plan,

    /// Build every profile in parallel
    BuildAll,

    /// Check the host for the tools the plan needs
    Preflight,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match workflows::dispatch(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {:#}", err);
            if let Some(build_err) = err.chain().find_map(|e| e.downcast_ref::<BuildError>()) {
                eprintln!("hint: {}", build_err.remediation());
            }
            ExitCode::FAILURE
        }
    }
}

fn init_logging(verbose: u8) {
    let filter = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}
