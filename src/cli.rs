//! CLI argument parsing.
//!
//! Flags only override the loaded config; all policy lives in the library.
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// Root CLI entrypoint.
#[derive(Parser, Debug)]
#[command(
    name = "assetpatch",
    version,
    about = "Verify installed assets against a manifest and apply bsdiff fixes",
    after_help = "Commands:\n  check --root <dir>   Classify files and show what would be patched\n  fix --root <dir>     Download patches and bring every file to its fixed state\n  generate <original> <fixed> <out> --base-url <url>\n                       Write .bsdiff patches and manifest.json for a fixed tree\n  hash <file>...       Print the SHA-256 used in manifests\n  config               Print a default config.json\n\nExamples:\n  assetpatch check --root ~/.steam/steam/steamapps/common/GarrysMod --manifest https://example.com/manifest.json\n  assetpatch fix --root ./game --manifest ./manifest.json --branch x86-64",
    subcommand_required = true,
    arg_required_else_help = true
)]
pub struct RootArgs {
    /// Path to config.json (defaults to the user config directory)
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Emit debug logging to stderr
    #[arg(long, short, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Classify files and report pending work without writing anything
    Check(RunArgs),
    /// Download and apply patches until every file is fixed
    Fix(RunArgs),
    /// Diff an original tree against a fixed tree into patches + manifest.json
    Generate(GenerateArgs),
    /// Print the SHA-256 of files the way manifests spell it
    Hash(HashArgs),
    /// Print a default config.json
    Config,
}

/// Inputs shared by `check` and `fix`.
#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    /// Installation root that manifest paths are relative to
    #[arg(long, value_name = "DIR")]
    pub root: PathBuf,

    /// Manifest URL or local path (repeat for mirrors)
    #[arg(long, value_name = "URL|PATH")]
    pub manifest: Vec<String>,

    /// Manifest platform key (linux, macos, windows)
    #[arg(long)]
    pub platform: Option<String>,

    /// Manifest branch key
    #[arg(long)]
    pub branch: Option<String>,

    /// Directory for cached patch payloads
    #[arg(long, value_name = "DIR")]
    pub cache_dir: Option<PathBuf>,

    /// Hashing threads (0 = one per CPU)
    #[arg(long)]
    pub jobs: Option<usize>,

    /// Concurrent downloads
    #[arg(long)]
    pub download_jobs: Option<usize>,

    /// Network timeout in seconds
    #[arg(long, value_name = "SECS")]
    pub timeout: Option<u64>,

    /// Emit the run report as JSON
    #[arg(long)]
    pub json: bool,
}

/// Inputs for `generate`.
#[derive(Args, Debug)]
pub struct GenerateArgs {
    /// Tree as originally shipped
    #[arg(value_name = "ORIGINAL")]
    pub original: PathBuf,

    /// Same tree after the fix
    #[arg(value_name = "FIXED")]
    pub fixed: PathBuf,

    /// Output directory for patches and manifest.json
    #[arg(value_name = "OUT")]
    pub out: PathBuf,

    /// URL the output directory will be served from
    #[arg(long, value_name = "URL")]
    pub base_url: String,

    /// Manifest platform key (defaults to the config / running OS)
    #[arg(long)]
    pub platform: Option<String>,

    /// Manifest branch key
    #[arg(long)]
    pub branch: Option<String>,

    /// Diff threads (0 = one per CPU)
    #[arg(long)]
    pub jobs: Option<usize>,
}

#[derive(Args, Debug)]
pub struct HashArgs {
    /// Files to hash; missing files hash as empty content
    #[arg(required = true, value_name = "FILE")]
    pub paths: Vec<PathBuf>,
}
