// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Package installation through OS package managers.
//!
//! Packages are listed per package manager in the configuration, and installed
//! manager by manager in the configured installation order. This runs
//! independently of item synchronization.
//!
//! The reverse direction is __capture__: ask each package manager which
//! packages were explicitly installed, so the listing can be written back into
//! the configuration.

use std::{
    collections::BTreeMap,
    ffi::OsString,
    fmt::{Display, Formatter, Result as FmtResult},
    io,
    path::PathBuf,
    process::{Command, Stdio},
    str::FromStr,
};
use tracing::{debug, error, info, instrument, warn};

/// Layer of indirection for package installation.
pub trait PackageInstaller {
    /// Install packages through target package manager.
    fn install(&self, manager: &str, packages: &[String]) -> Result<()>;

    /// List packages explicitly installed through target package manager.
    fn list_installed(&self, manager: &str) -> Result<Vec<String>>;
}

/// Supported package managers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PackageManager {
    Brew,
    Apt,
    Nala,
    Cargo,
    Npm,
    Pip,
    Go,
}

impl PackageManager {
    /// Executable that must be on `PATH` for the manager to work.
    pub fn executable(&self) -> &'static str {
        match self {
            Self::Brew => "brew",
            Self::Apt => "apt-get",
            Self::Nala => "nala",
            Self::Cargo => "cargo",
            Self::Npm => "npm",
            Self::Pip => "pip",
            Self::Go => "go",
        }
    }

    /// Program and arguments that install target packages.
    pub fn command_line(&self, packages: &[String]) -> (&'static str, Vec<String>) {
        let (program, args): (&str, &[&str]) = match self {
            Self::Brew => ("brew", &["install"]),
            Self::Apt => ("sudo", &["apt-get", "install", "-y"]),
            Self::Nala => ("sudo", &["nala", "install", "-y"]),
            Self::Cargo => ("cargo", &["install"]),
            Self::Npm => ("npm", &["install", "--global"]),
            Self::Pip => ("pip", &["install", "--user"]),
            Self::Go => ("go", &["install"]),
        };

        let args = args
            .iter()
            .map(ToString::to_string)
            .chain(packages.iter().cloned())
            .collect();
        (program, args)
    }

    /// Program and arguments that list explicitly installed packages.
    ///
    /// Returns `None` if the manager cannot report such a listing.
    pub fn list_command_line(&self) -> Option<(&'static str, &'static [&'static str])> {
        match self {
            Self::Brew => Some(("brew", &["leaves", "--installed-on-request"])),
            Self::Apt | Self::Nala => Some(("apt-mark", &["showmanual"])),
            Self::Cargo => Some(("cargo", &["install", "--list"])),
            Self::Npm | Self::Pip | Self::Go => None,
        }
    }

    /// Extract package names from output of listing command.
    pub fn parse_listing(&self, output: &str) -> Vec<String> {
        match self {
            // Crate lines look like `ripgrep v14.1.0:`, binaries are indented below.
            Self::Cargo => output
                .lines()
                .filter(|line| !line.starts_with(char::is_whitespace))
                .filter_map(|line| line.split_whitespace().next())
                .map(ToString::to_string)
                .collect(),
            _ => output
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty())
                .map(ToString::to_string)
                .collect(),
        }
    }
}

impl FromStr for PackageManager {
    type Err = InstallError;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        match name {
            "brew" | "homebrew" => Ok(Self::Brew),
            "apt" | "apt-get" => Ok(Self::Apt),
            "nala" => Ok(Self::Nala),
            "cargo" => Ok(Self::Cargo),
            "npm" => Ok(Self::Npm),
            "pip" => Ok(Self::Pip),
            "go" => Ok(Self::Go),
            _ => Err(InstallError::UnknownManager {
                manager: name.to_owned(),
            }),
        }
    }
}

impl Display for PackageManager {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        match self {
            Self::Brew => fmt.write_str("brew"),
            Self::Apt => fmt.write_str("apt"),
            Self::Nala => fmt.write_str("nala"),
            Self::Cargo => fmt.write_str("cargo"),
            Self::Npm => fmt.write_str("npm"),
            Self::Pip => fmt.write_str("pip"),
            Self::Go => fmt.write_str("go"),
        }
    }
}

/// Package installation through the system's package managers.
#[derive(Debug, Default, Clone)]
pub struct SystemInstaller;

impl PackageInstaller for SystemInstaller {
    #[instrument(skip(self, packages), level = "debug")]
    fn install(&self, manager: &str, packages: &[String]) -> Result<()> {
        let kind: PackageManager = manager.parse()?;
        if packages.is_empty() {
            info!("{kind}: nothing to do");
            return Ok(());
        }

        let executable = kind.executable();
        let found = find_executable(executable).ok_or_else(|| InstallError::MissingExecutable {
            manager: kind.to_string(),
            executable: executable.to_owned(),
        })?;
        debug!("{kind} found at {:?}", found.display());

        let (program, args) = kind.command_line(packages);
        info!("{kind}: install {}", packages.join(" "));
        let status = Command::new(program)
            .args(&args)
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .status()
            .map_err(|err| InstallError::Spawn {
                source: err,
                manager: kind.to_string(),
            })?;

        if !status.success() {
            return Err(InstallError::CommandFailed {
                manager: kind.to_string(),
                code: status.code(),
            });
        }

        Ok(())
    }

    #[instrument(skip(self), level = "debug")]
    fn list_installed(&self, manager: &str) -> Result<Vec<String>> {
        let kind: PackageManager = manager.parse()?;
        let (program, args) = kind
            .list_command_line()
            .ok_or_else(|| InstallError::CaptureUnsupported {
                manager: kind.to_string(),
            })?;

        let executable = kind.executable();
        find_executable(executable).ok_or_else(|| InstallError::MissingExecutable {
            manager: kind.to_string(),
            executable: executable.to_owned(),
        })?;

        let output = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stderr(Stdio::inherit())
            .output()
            .map_err(|err| InstallError::Spawn {
                source: err,
                manager: kind.to_string(),
            })?;

        if !output.status.success() {
            return Err(InstallError::CommandFailed {
                manager: kind.to_string(),
                code: output.status.code(),
            });
        }

        Ok(kind.parse_listing(&String::from_utf8_lossy(&output.stdout)))
    }
}

/// Install packages of every manager in installation order.
///
/// Managers in `excluded`, and managers with no packages listed, are skipped.
/// A failing manager does not stop the managers after it.
///
/// # Errors
///
/// - Return [`InstallError::Partial`] listing every manager that failed.
pub fn install_all(
    installer: &impl PackageInstaller,
    order: &[String],
    packages: &BTreeMap<String, Vec<String>>,
    excluded: &[String],
) -> Result<()> {
    for manager in packages.keys().filter(|name| !order.contains(*name)) {
        warn!("packages of {manager:?} are ignored, it is not in the installation order");
    }

    let mut failures = Vec::new();
    for manager in order {
        if excluded.contains(manager) {
            info!("skip excluded package manager {manager:?}");
            continue;
        }

        let Some(list) = packages.get(manager).filter(|list| !list.is_empty()) else {
            debug!("no packages listed for {manager:?}");
            continue;
        };

        match installer.install(manager, list) {
            Ok(()) => info!("{manager}: packages installed"),
            Err(err) => {
                error!("{manager}: {err}");
                failures.push(err);
            }
        }
    }

    if failures.is_empty() {
        Ok(())
    } else {
        Err(InstallError::Partial { failures })
    }
}

/// Replace package listing of every manager in installation order with what
/// is currently installed.
///
/// Managers in `excluded`, and managers that cannot list their packages, keep
/// their configured listing. A failing manager does not stop the managers after
/// it.
///
/// # Errors
///
/// - Return [`InstallError::Partial`] listing every manager that failed.
pub fn capture_all(
    installer: &impl PackageInstaller,
    order: &[String],
    packages: &mut BTreeMap<String, Vec<String>>,
    excluded: &[String],
) -> Result<()> {
    let mut failures = Vec::new();
    for manager in order {
        if excluded.contains(manager) {
            info!("skip excluded package manager {manager:?}");
            continue;
        }

        match installer.list_installed(manager) {
            Ok(list) => {
                info!("{manager}: captured {} packages", list.len());
                packages.insert(manager.clone(), list);
            }
            Err(InstallError::CaptureUnsupported { .. }) => {
                warn!("{manager} cannot list installed packages, keep configured listing");
            }
            Err(err) => {
                error!("{manager}: {err}");
                failures.push(err);
            }
        }
    }

    if failures.is_empty() {
        Ok(())
    } else {
        Err(InstallError::Partial { failures })
    }
}

fn find_executable(name: &str) -> Option<PathBuf> {
    let paths = std::env::var_os("PATH")?;
    std::env::split_paths(&paths).find_map(|dir| {
        let mut candidate = dir.join(name);
        if candidate.is_file() {
            return Some(candidate);
        }

        if cfg!(windows) {
            let mut file_name = OsString::from(name);
            file_name.push(".exe");
            candidate.set_file_name(file_name);
            if candidate.is_file() {
                return Some(candidate);
            }
        }

        None
    })
}

/// Package installation error types.
#[derive(Debug, thiserror::Error)]
pub enum InstallError {
    /// Package manager is not supported.
    #[error("unknown package manager {manager:?}")]
    UnknownManager { manager: String },

    /// Package manager executable is not on `PATH`.
    #[error("{manager} is not available, {executable:?} not found on PATH")]
    MissingExecutable { manager: String, executable: String },

    /// Package manager process cannot be started.
    #[error("failed to run {manager}")]
    Spawn {
        #[source]
        source: io::Error,
        manager: String,
    },

    /// Package manager cannot list explicitly installed packages.
    #[error("{manager} cannot list installed packages")]
    CaptureUnsupported { manager: String },

    /// Package manager exited unsuccessfully.
    #[error("{manager} failed with exit code {code:?}")]
    CommandFailed { manager: String, code: Option<i32> },

    /// Some package managers failed.
    #[error("{} package manager(s) failed", failures.len())]
    Partial { failures: Vec<InstallError> },
}

/// Friendly result alias :3
pub type Result<T, E = InstallError> = std::result::Result<T, E>;
