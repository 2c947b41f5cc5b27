// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Configuration layout.
//!
//! Specify the layout of the configuration file to simplify the process of
//! serialization and deserialization.
//!
//! # Locating the Configuration File
//!
//! The configuration file is looked up in the following order:
//!
//! 1. Path given on the command line.
//! 2. Path in the `CONFIG_MAPPER_CFG` environment variable.
//! 3. `~/.config-mapper.toml`.
//!
//! # General Layout
//!
//! ```toml
//! [storage]
//! location = "~/.local/share/config-mapper"
//!
//! [storage.git]
//! repository = "git@example.org:me/dotfiles.git"
//!
//! [[items]]
//! name = "neovim"
//! linux = "$LOCATION/nvim:~/.config/nvim"
//! darwin = { local = "~/.config/nvim", remote = "nvim" }
//!
//! [package_managers]
//! installation_order = ["apt", "brew"]
//!
//! [package_managers.packages]
//! apt = ["ripgrep"]
//! ```

use crate::{
    items::Item,
    path::{default_config_path, default_storage_dir, resolve_absolute, PathError},
    repo::CredentialStrategy,
};

use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fmt::{Display, Error as FmtError, Formatter, Result as FmtResult},
    fs, io,
    path::{Path, PathBuf},
    str::FromStr,
};
use tracing::{debug, instrument};

/// Environment variable that overrides the default configuration path.
pub const CONFIG_PATH_ENV: &str = "CONFIG_MAPPER_CFG";

/// Complete configuration file.
#[derive(Default, Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
pub struct Configuration {
    /// Where and how items are stored.
    #[serde(default)]
    pub storage: Storage,

    /// Logging settings.
    #[serde(default)]
    pub logging: Logging,

    /// Items to synchronize, in processing order.
    #[serde(default)]
    pub items: Vec<Item>,

    /// Packages to install per package manager.
    #[serde(default)]
    pub package_managers: PackageManagers,
}

impl Configuration {
    /// Load configuration file at target path.
    ///
    /// # Errors
    ///
    /// - Return [`ConfigError::Read`] if file cannot be read.
    /// - Return any parsing error of [`Configuration::from_str`].
    #[instrument(skip(path), level = "debug")]
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        debug!("load configuration from {:?}", path.as_ref().display());
        let data = fs::read_to_string(path.as_ref()).map_err(|err| ConfigError::Read {
            source: err,
            path: path.as_ref().to_path_buf(),
        })?;

        data.parse()
    }

    /// Write configuration file to target path.
    ///
    /// # Errors
    ///
    /// - Return [`ConfigError::Serialize`] if configuration cannot be
    ///   serialized.
    /// - Return [`ConfigError::Write`] if file cannot be written.
    #[instrument(skip(self, path), level = "debug")]
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        debug!("save configuration to {:?}", path.as_ref().display());
        let data = toml::ser::to_string_pretty(self)?;
        fs::write(path.as_ref(), data).map_err(|err| ConfigError::Write {
            source: err,
            path: path.as_ref().to_path_buf(),
        })
    }

    /// Determine which configuration file to use.
    ///
    /// # Errors
    ///
    /// - Return [`ConfigError::Path`] if chosen path cannot be resolved.
    pub fn locate(flag: Option<&str>) -> Result<PathBuf> {
        if let Some(path) = flag {
            return Ok(resolve_absolute(path)?);
        }

        match std::env::var(CONFIG_PATH_ENV) {
            Ok(path) if !path.is_empty() => Ok(resolve_absolute(path)?),
            _ => Ok(default_config_path()?),
        }
    }
}

impl FromStr for Configuration {
    type Err = ConfigError;

    fn from_str(data: &str) -> Result<Self, Self::Err> {
        let mut config: Configuration =
            toml::de::from_str(data).map_err(ConfigError::Deserialize)?;

        // INVARIANT: Perform shell expansion on SSH private key paths.
        for ssh in &mut config.storage.git.ssh_auth {
            ssh.private_key = shellexpand::full(ssh.private_key.as_str())
                .map_err(ConfigError::ShellExpansion)?
                .into_owned();
        }

        Ok(config)
    }
}

impl Display for Configuration {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        fmt.write_str(
            toml::ser::to_string_pretty(self)
                .map_err(ConfigError::Serialize)?
                .as_str(),
        )
    }
}

/// Storage settings.
#[derive(Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
pub struct Storage {
    /// Storage root. Goes through path resolution before use.
    #[serde(default = "default_location")]
    pub location: String,

    /// Git repository backing the storage root.
    #[serde(default)]
    pub git: GitSettings,
}

impl Default for Storage {
    fn default() -> Self {
        Self {
            location: default_location(),
            git: GitSettings::default(),
        }
    }
}

fn default_location() -> String {
    default_storage_dir().to_string_lossy().into_owned()
}

/// Git settings of storage repository.
#[derive(Default, Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
pub struct GitSettings {
    /// Remote URL to clone storage from.
    #[serde(default)]
    pub repository: String,

    /// Commit author name.
    pub name: Option<String>,

    /// Commit author email.
    pub email: Option<String>,

    /// Plain username and password credentials.
    pub basic_auth: Option<BasicAuth>,

    /// SSH keys to try in order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ssh_auth: Vec<SshAuth>,
}

impl GitSettings {
    /// Credential strategies to try in order.
    ///
    /// SSH keys come first, then basic auth, then default credentials.
    pub fn credential_strategies(&self) -> Vec<CredentialStrategy> {
        let mut strategies = self
            .ssh_auth
            .iter()
            .map(|ssh| CredentialStrategy::SshKey {
                private_key: PathBuf::from(&ssh.private_key),
                passphrase: ssh.passphrase.clone().filter(|phrase| !phrase.is_empty()),
            })
            .collect::<Vec<_>>();

        if let Some(basic) = &self.basic_auth {
            strategies.push(CredentialStrategy::Basic {
                username: basic.username.clone(),
                password: basic.password.clone(),
            });
        }

        strategies.push(CredentialStrategy::Default);
        strategies
    }

    /// Commit author, if both name and email are set.
    pub fn author(&self) -> Option<(&str, &str)> {
        Some((self.name.as_deref()?, self.email.as_deref()?))
    }
}

/// Username and password credentials.
#[derive(Default, Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
pub struct BasicAuth {
    pub username: String,
    pub password: String,
}

/// SSH key credentials.
#[derive(Default, Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
pub struct SshAuth {
    /// Path to private key file.
    pub private_key: String,

    /// Passphrase of private key. Empty means none.
    pub passphrase: Option<String>,
}

/// Logging settings.
#[derive(Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
pub struct Logging {
    /// Filter directive used when `RUST_LOG` is not set.
    #[serde(default = "default_level")]
    pub level: String,
}

impl Default for Logging {
    fn default() -> Self {
        Self {
            level: default_level(),
        }
    }
}

fn default_level() -> String {
    "info".into()
}

/// Package manager settings.
#[derive(Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
pub struct PackageManagers {
    /// Order in which package managers run.
    #[serde(default = "default_installation_order")]
    pub installation_order: Vec<String>,

    /// Packages listed per package manager.
    #[serde(default)]
    pub packages: BTreeMap<String, Vec<String>>,
}

impl Default for PackageManagers {
    fn default() -> Self {
        Self {
            installation_order: default_installation_order(),
            packages: BTreeMap::new(),
        }
    }
}

fn default_installation_order() -> Vec<String> {
    vec!["apt".into(), "brew".into()]
}

/// Configuration error types.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read configuration file.
    #[error("failed to read configuration file {:?}", path.display())]
    Read {
        #[source]
        source: io::Error,
        path: PathBuf,
    },

    /// Failed to write configuration file.
    #[error("failed to write configuration file {:?}", path.display())]
    Write {
        #[source]
        source: io::Error,
        path: PathBuf,
    },

    /// Failed to determine configuration file path.
    #[error(transparent)]
    Path(#[from] PathError),

    /// Failed to deserialize configuration.
    #[error(transparent)]
    Deserialize(#[from] toml::de::Error),

    /// Failed to serialize configuration.
    #[error(transparent)]
    Serialize(#[from] toml::ser::Error),

    /// Failed to perform shell expansion on configuration.
    #[error(transparent)]
    ShellExpansion(#[from] shellexpand::LookupError<std::env::VarError>),
}

impl From<ConfigError> for FmtError {
    fn from(_: ConfigError) -> Self {
        FmtError
    }
}

/// Friendly result alias :3
pub type Result<T, E = ConfigError> = std::result::Result<T, E>;
