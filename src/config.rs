//! CLI arguments and server configuration defaults.

use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

pub const SCRATCH_DIR: &str = "temp";
pub const COMPLETED_DIR: &str = "completed";
pub const SPILL_SUFFIX: &str = ".part";
pub const MAX_CHUNK_SIZE: u64 = 16 * 1024 * 1024;
pub const DEFAULT_DATA_DIR: &str = ".haulbay";
pub const DEFAULT_SESSION_IDLE_TTL_SECS: u64 = 24 * 60 * 60;
pub const SESSION_SWEEP_INTERVAL_SECS: u64 = 900;

/// Runtime policy for the transfer core, derived from [`Args`].
#[derive(Debug)]
pub struct TransferConfig {
    pub max_chunk_size: u64,
    pub finish_overwrite: bool,
    pub session_idle_ttl: Duration,
    pub deploy_artifact: Option<String>,
    pub deploy_dir: Option<PathBuf>,
}

/// CLI arguments and environment configuration for the server.
#[derive(Parser, Debug)]
#[command(name = "haulbay", version, about = "Haulbay transfer server")]
pub struct Args {
    #[arg(
        short = 'd',
        long,
        env = "HAULBAY_DATA_DIR",
        default_value = DEFAULT_DATA_DIR,
        help = "Data directory for spill files and completed artifacts"
    )]
    pub data_dir: String,
    #[arg(
        short = 'b',
        long,
        env = "HAULBAY_BIND",
        default_value = "0.0.0.0",
        help = "Bind address"
    )]
    pub host: String,
    #[arg(
        short = 'p',
        long,
        env = "HAULBAY_PORT",
        default_value_t = 5050,
        help = "HTTP port"
    )]
    pub port: u16,
    #[arg(
        long,
        env = "HAULBAY_MAX_CHUNK_SIZE",
        default_value_t = MAX_CHUNK_SIZE,
        help = "Max size of a single uploaded chunk in bytes (0 to disable)"
    )]
    pub max_chunk_size: u64,
    #[arg(
        long,
        env = "HAULBAY_FINISH_OVERWRITE",
        default_value_t = true,
        action = clap::ArgAction::Set,
        help = "Whether finish may overwrite an existing destination file"
    )]
    pub finish_overwrite: bool,
    #[arg(
        long,
        env = "HAULBAY_SESSION_TTL_SECS",
        default_value_t = DEFAULT_SESSION_IDLE_TTL_SECS,
        help = "Idle upload session expiration in seconds (0 to disable)"
    )]
    pub session_ttl_secs: u64,
    #[arg(
        long,
        env = "HAULBAY_DEPLOY_ARTIFACT",
        help = "Artifact name routed to the deploy directory on finish"
    )]
    pub deploy_artifact: Option<String>,
    #[arg(
        long,
        env = "HAULBAY_DEPLOY_DIR",
        help = "Directory receiving the deploy artifact"
    )]
    pub deploy_dir: Option<String>,
}
