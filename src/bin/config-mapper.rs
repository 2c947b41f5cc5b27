// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

use config_mapper::{
    config::Configuration,
    index::Index,
    install::{capture_all, install_all, SystemInstaller},
    items::{Direction, SyncReport, Synchronizer},
    path::resolve_absolute,
    repo::{Git2Repository, RepositoryActions},
};

use anyhow::{anyhow, bail, Result};
use clap::{Parser, Subcommand};
use indicatif::ProgressBar;
use std::{
    fs,
    path::{Path, PathBuf},
    process::exit,
    time::{SystemTime, UNIX_EPOCH},
};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Debug, Clone, Parser)]
#[command(
    about,
    override_usage = "config-mapper [options] <command>",
    subcommand_help_heading = "Commands",
    version
)]
struct Cli {
    /// Path to configuration file.
    #[arg(short, long, global = true, value_name = "path")]
    pub config: Option<String>,

    /// Show debug output.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

impl Cli {
    async fn run(self, config: Configuration, path: PathBuf) -> Result<()> {
        match self.command {
            Command::Init(opts) => run_init(opts, config).await,
            Command::Save(opts) => run_save(opts, config, path),
            Command::Load(opts) => run_load(opts, config),
        }
    }
}

#[derive(Debug, Clone, Subcommand)]
enum Command {
    /// Clone storage repository into storage location.
    #[command(override_usage = "config-mapper init [options]")]
    Init(InitOptions),

    /// Copy configured items from the system into storage.
    #[command(override_usage = "config-mapper save [options]")]
    Save(SaveOptions),

    /// Copy configured items from storage onto the system.
    #[command(override_usage = "config-mapper load [options]")]
    Load(LoadOptions),
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct InitOptions {
    /// Clone from this URL instead of the configured repository.
    #[arg(short, long, value_name = "url")]
    pub url: Option<String>,
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct SaveOptions {
    /// Pull storage before saving, then commit and push it afterwards.
    #[arg(short, long)]
    pub push: bool,

    /// Commit message to use instead of current Unix timestamp.
    #[arg(short, long, requires = "push", value_name = "message")]
    pub message: Option<String>,

    /// Leave index untouched, so no orphans are removed.
    #[arg(long)]
    pub disable_index_update: bool,

    /// Record installed packages into the configuration file.
    #[arg(long)]
    pub packages: bool,

    /// Package managers to leave out of package capture.
    #[arg(short, long, requires = "packages", num_args = 1.., value_name = "manager")]
    pub exclude_managers: Vec<String>,
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct LoadOptions {
    /// Pull remote changes into storage before loading.
    #[arg(long)]
    pub pull: bool,

    /// Install configured packages after loading.
    #[arg(short, long)]
    pub packages: bool,

    /// Package managers to leave out of installation.
    #[arg(short, long, requires = "packages", num_args = 1.., value_name = "manager")]
    pub exclude_managers: Vec<String>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let config = Configuration::locate(cli.config.as_deref())
        .and_then(|path| Ok((Configuration::load(&path)?, path)));
    let level = config
        .as_ref()
        .ok()
        .map(|(config, _)| config.logging.level.clone());

    let layer = fmt::layer()
        .compact()
        .with_target(false)
        .with_timer(false)
        .without_time();
    tracing_subscriber::registry()
        .with(layer)
        .with(log_filter(cli.verbose, level.as_deref()))
        .init();

    let result = match config {
        Ok((config, path)) => cli.run(config, path).await,
        Err(error) => Err(error.into()),
    };

    if let Err(error) = result {
        error!("{error:?}");
        exit(1);
    }

    exit(0)
}

fn log_filter(verbose: bool, level: Option<&str>) -> EnvFilter {
    if verbose {
        return EnvFilter::new("debug");
    }

    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level.unwrap_or("info")))
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

async fn run_init(opts: InitOptions, config: Configuration) -> Result<()> {
    let url = opts.url.unwrap_or(config.storage.git.repository.clone());
    if url.is_empty() {
        bail!("no storage repository configured, set storage.git.repository");
    }

    let root = resolve_absolute(&config.storage.location)?;
    if root.join(".git").exists() {
        warn!("storage already initialized at {:?}", root.display());
        return Ok(());
    }

    let strategies = config.storage.git.credential_strategies();
    let bar = ProgressBar::no_length();
    tokio::task::spawn_blocking(move || {
        Git2Repository::clone_remote(url, root, strategies, bar).map(|_| ())
    })
    .await??;
    info!("storage initialized");

    Ok(())
}

fn run_save(opts: SaveOptions, mut config: Configuration, path: PathBuf) -> Result<()> {
    let root = storage_root(&config)?;
    let mut sync = Synchronizer::new(&config.storage.location, Index::load(&root)?)?
        .with_index_updates(!opts.disable_index_update);
    sync.add_items(config.items.clone());

    if !opts.push {
        let outcome = finish(&sync.run(Direction::Save)?);
        return outcome.and(capture_packages(&opts, &mut config, &path));
    }

    let mut sync = sync.with_repository(open_repository(&config, &root)?);
    // INVARIANT: Pull before writing storage so the push afterwards fast-forwards.
    sync.refresh()?;
    let outcome = finish(&sync.run(Direction::Save)?);
    let outcome = outcome.and(capture_packages(&opts, &mut config, &path));
    sync.publish(opts.message.unwrap_or_else(unix_timestamp))?;

    outcome
}

fn capture_packages(opts: &SaveOptions, config: &mut Configuration, path: &Path) -> Result<()> {
    if !opts.packages {
        return Ok(());
    }

    let packages = &mut config.package_managers;
    let outcome = capture_all(
        &SystemInstaller,
        &packages.installation_order,
        &mut packages.packages,
        &opts.exclude_managers,
    );
    if let Err(error) = &outcome {
        error!("{error}");
    }

    config.save(path)?;
    info!("packages recorded in {:?}", path.display());

    Ok(outcome?)
}

fn run_load(opts: LoadOptions, config: Configuration) -> Result<()> {
    let root = storage_root(&config)?;
    let mut sync = Synchronizer::new(&config.storage.location, Index::load(&root)?)?;
    sync.add_items(config.items.clone());

    let report = if opts.pull {
        load_with(sync.with_repository(open_repository(&config, &root)?), true)?
    } else {
        load_with(sync, false)?
    };

    let mut outcome = finish(&report);
    if opts.packages {
        let packages = &config.package_managers;
        if let Err(error) = install_all(
            &SystemInstaller,
            &packages.installation_order,
            &packages.packages,
            &opts.exclude_managers,
        ) {
            error!("{error}");
            outcome = outcome.and(Err(error.into()));
        }
    }

    outcome
}

fn load_with<R: RepositoryActions>(
    mut sync: Synchronizer<Index, R>,
    pull: bool,
) -> Result<SyncReport> {
    if pull {
        sync.refresh()?;
    }

    Ok(sync.run(Direction::Load)?)
}

fn finish(report: &SyncReport) -> Result<()> {
    info!("{report}");
    if report.is_success() {
        Ok(())
    } else {
        Err(anyhow!(
            "{} failure(s) during {}",
            report.failure_count(),
            report.direction
        ))
    }
}

fn storage_root(config: &Configuration) -> Result<std::path::PathBuf> {
    let root = resolve_absolute(&config.storage.location)?;
    fs::create_dir_all(&root)?;
    Ok(root)
}

fn open_repository(config: &Configuration, root: &Path) -> Result<Git2Repository> {
    let git = &config.storage.git;
    let repository = Git2Repository::open(root, git.credential_strategies())?;
    Ok(match git.author() {
        Some((name, email)) => repository.with_signature(name, email),
        None => repository,
    })
}

fn unix_timestamp() -> String {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or_default()
        .to_string()
}
