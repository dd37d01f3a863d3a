use anyhow::{anyhow, Context, Result};
use assetpatch::checksum::hash_file;
use assetpatch::config::{self, Config};
use assetpatch::engine::{Engine, EngineOptions, RunMode};
use assetpatch::fetch::{fetch_from_mirrors, FetchError, UrlFetcher};
use assetpatch::generate::{generate, GenerateOptions};
use assetpatch::manifest::Manifest;
use assetpatch::report::render_text;
use clap::Parser;
use std::path::Path;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

mod cli;

use cli::{Command, GenerateArgs, HashArgs, RootArgs, RunArgs};

/// Exit status when the manifest itself cannot be downloaded.
const EXIT_NETWORK: u8 = 4;

fn main() -> ExitCode {
    let args = RootArgs::parse();
    init_tracing(args.verbose);

    match dispatch(args) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

fn dispatch(args: RootArgs) -> Result<ExitCode> {
    match args.command {
        Command::Check(run) => cmd_run(args.config.as_deref(), run, RunMode::Check),
        Command::Fix(run) => cmd_run(args.config.as_deref(), run, RunMode::Fix),
        Command::Generate(trees) => cmd_generate(args.config.as_deref(), trees),
        Command::Hash(hash) => cmd_hash(hash),
        Command::Config => {
            println!("{}", config::config_stub()?);
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn cmd_hash(args: HashArgs) -> Result<ExitCode> {
    for path in &args.paths {
        let hash = hash_file(path).with_context(|| format!("hash {}", path.display()))?;
        println!("SHA256 for {}:\n\t{hash}", path.display());
    }
    Ok(ExitCode::SUCCESS)
}

fn cmd_generate(config_path: Option<&Path>, args: GenerateArgs) -> Result<ExitCode> {
    let mut config = config::resolve_config(config_path)?;
    if let Some(platform) = args.platform {
        config.platform = Some(platform);
    }
    if let Some(branch) = args.branch {
        config.branch = branch;
    }
    if let Some(jobs) = args.jobs {
        config.jobs = jobs;
    }
    config::validate_config(&config).context("invalid configuration")?;

    let options = GenerateOptions {
        platform: config.platform(),
        branch: config.branch.clone(),
        base_url: args.base_url,
        threads: config.hash_threads(),
    };
    let summary = generate(&args.original, &args.fixed, &args.out, &options)
        .with_context(|| format!("generate patches into {}", args.out.display()))?;

    for path in &summary.patched {
        println!("\tPatch: {path}");
    }
    for path in &summary.deleted {
        println!("\tDelete: {path}");
    }
    println!(
        "Generated {} patch(es) and {} delete record(s) for {}/{}; {} file(s) unchanged.",
        summary.patched.len(),
        summary.deleted.len(),
        options.platform,
        options.branch,
        summary.unchanged
    );
    println!("Manifest: {}", summary.manifest_path.display());
    println!(
        "Upload the contents of {} to {}.",
        args.out.display(),
        options.base_url
    );
    Ok(ExitCode::SUCCESS)
}

fn cmd_run(config_path: Option<&Path>, args: RunArgs, mode: RunMode) -> Result<ExitCode> {
    let mut config = config::resolve_config(config_path)?;
    apply_overrides(&mut config, &args);
    config::validate_config(&config).context("invalid configuration")?;

    let sources = if args.manifest.is_empty() {
        config.manifest_urls.clone()
    } else {
        args.manifest.clone()
    };
    if sources.is_empty() {
        return Err(anyhow!(
            "no manifest configured; pass --manifest or set manifest_urls in config.json"
        ));
    }

    let fetcher = UrlFetcher::new(config.timeout());
    let bytes = match load_manifest(&sources, &fetcher, config.retries)? {
        Ok(bytes) => bytes,
        Err(err) => {
            eprintln!("error: failed to download manifest: {err}");
            eprintln!("Check your internet connection and try again.");
            return Ok(ExitCode::from(EXIT_NETWORK));
        }
    };
    let manifest = Manifest::from_slice(&bytes).context("parse manifest")?;
    let platform = config.platform();
    let scope = manifest
        .scope(&platform, &config.branch)
        .context("select manifest scope")?;

    let root = args.root.as_path();
    if !root.is_dir() {
        return Err(anyhow!("root {} is not a directory", root.display()));
    }
    let cache_dir = config.cache_dir();
    tracing::debug!(
        root = %root.display(),
        cache = %cache_dir.display(),
        platform = %platform,
        branch = %config.branch,
        files = scope.len(),
        "starting run"
    );

    let engine = Engine::new(EngineOptions::from_config(&config, mode), &fetcher)
        .context("build worker pools")?;
    let report = engine.run(scope, root, &cache_dir);

    if args.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&report).context("serialize run report")?
        );
    } else {
        print!("{}", render_text(&report));
    }
    Ok(ExitCode::from(report.outcome.exit_code()))
}

fn apply_overrides(config: &mut Config, args: &RunArgs) {
    if let Some(platform) = &args.platform {
        config.platform = Some(platform.clone());
    }
    if let Some(branch) = &args.branch {
        config.branch = branch.clone();
    }
    if let Some(cache_dir) = &args.cache_dir {
        config.cache_dir = Some(cache_dir.clone());
    }
    if let Some(jobs) = args.jobs {
        config.jobs = jobs;
    }
    if let Some(download_jobs) = args.download_jobs {
        config.download_jobs = download_jobs;
    }
    if let Some(timeout) = args.timeout {
        config.timeout_secs = timeout;
    }
}

/// Read a local manifest path, or download from the URL mirrors.
///
/// The outer error covers local I/O; the inner one is a network failure.
fn load_manifest(
    sources: &[String],
    fetcher: &UrlFetcher,
    attempts: u32,
) -> Result<Result<Vec<u8>, FetchError>> {
    if let [single] = sources {
        if !single.contains("://") {
            let bytes =
                std::fs::read(single).with_context(|| format!("read manifest {single}"))?;
            return Ok(Ok(bytes));
        }
    }
    if let Some(local) = sources.iter().find(|source| !source.contains("://")) {
        return Err(anyhow!(
            "manifest mirror {local:?} must be a URL when several sources are given"
        ));
    }
    Ok(fetch_from_mirrors(fetcher, sources, attempts))
}
