// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Per-platform item location selection.
//!
//! An item can live in different places depending on the operating system,
//! e.g., `~/.config/Code` on Linux versus `~/Library/Application Support/Code`
//! on macOS. Each item carries a lookup of platform identifiers to
//! [`Location`] records, and the current platform picks which one applies.
//!
//! # Selection Rules
//!
//! 1. The platform identifier must be recognized, see [`Platform`]. Anything
//!    else is [`SelectError::UnsupportedPlatform`].
//! 2. The record under the platform key is used. When no such key exists, the
//!    `universal` record is used instead.
//! 3. A missing or empty record means the item does not apply to this
//!    platform. That is [`Resolution::NotApplicable`], not an error.
//! 4. Otherwise the record is resolved into a [`PathPair`] through the
//!    [`path`](crate::path) resolver.

use crate::path::{resolve_absolute, split_source_destination, PathError, LOCATION_PLACEHOLDER};

use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fmt::{Display, Formatter, Result as FmtResult},
    path::{Path, PathBuf},
    str::FromStr,
};

/// Lookup key of the fallback record used by every platform.
pub const UNIVERSAL_KEY: &str = "universal";

/// Recognized platforms.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Platform {
    Linux,
    Darwin,
    Windows,
}

impl Platform {
    /// Platform this binary was compiled for.
    ///
    /// # Errors
    ///
    /// - Return [`SelectError::UnsupportedPlatform`] if the target operating
    ///   system is not recognized.
    pub fn current() -> Result<Self> {
        std::env::consts::OS.parse()
    }

    /// Lookup keys of the platform in an item's location records.
    pub fn keys(&self) -> &'static [&'static str] {
        match self {
            Self::Linux => &["linux"],
            Self::Darwin => &["darwin", "macos"],
            Self::Windows => &["windows"],
        }
    }
}

impl FromStr for Platform {
    type Err = SelectError;

    fn from_str(platform: &str) -> Result<Self, Self::Err> {
        match platform {
            "linux" => Ok(Self::Linux),
            "darwin" | "macos" => Ok(Self::Darwin),
            "windows" => Ok(Self::Windows),
            _ => Err(SelectError::UnsupportedPlatform {
                platform: platform.to_owned(),
            }),
        }
    }
}

impl Display for Platform {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        fmt.write_str(self.keys()[0])
    }
}

/// Location record of an item for one platform.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum Location {
    /// Single `"storage-path:system-path"` string.
    ///
    /// The storage side usually starts with `$LOCATION`.
    Combined(String),

    /// Explicit pair of system path and storage-relative path.
    Pair {
        /// Path on the user's system.
        #[serde(default)]
        local: String,

        /// Path relative to the storage root.
        #[serde(default)]
        remote: String,
    },
}

impl Location {
    /// Check if record is blank, i.e., item does not apply.
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Combined(raw) => raw.trim().is_empty(),
            Self::Pair { local, remote } => local.trim().is_empty() && remote.trim().is_empty(),
        }
    }

    /// Resolve record into absolute storage and system paths.
    ///
    /// # Errors
    ///
    /// - Return [`PathError::MalformedLocation`] if one half of the record
    ///   is missing.
    /// - Return any other [`PathError`] raised by path resolution.
    pub fn resolve(&self, storage_root: impl AsRef<Path>) -> Result<PathPair, PathError> {
        let storage_root = storage_root.as_ref();
        match self {
            Self::Combined(raw) => {
                let (storage, system) = split_source_destination(raw, storage_root)?;
                Ok(PathPair { storage, system })
            }
            Self::Pair { local, remote } => {
                if local.is_empty() || remote.is_empty() {
                    return Err(PathError::MalformedLocation {
                        location: format!("local = {local:?}, remote = {remote:?}"),
                    });
                }

                let root = storage_root.to_string_lossy();
                let storage = if remote.contains(LOCATION_PLACEHOLDER) {
                    remote.replacen(LOCATION_PLACEHOLDER, root.as_ref(), 1)
                } else {
                    format!("{root}/{remote}")
                };

                Ok(PathPair {
                    storage: resolve_absolute(storage)?,
                    system: resolve_absolute(local)?,
                })
            }
        }
    }
}

impl From<&str> for Location {
    fn from(raw: &str) -> Self {
        Self::Combined(raw.to_owned())
    }
}

/// Location records of one item keyed by platform identifier.
///
/// Unknown keys are kept as-is, so adding a platform does not require a
/// schema change.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(transparent)]
pub struct ItemLocations(BTreeMap<String, Location>);

impl ItemLocations {
    /// Construct empty location lookup.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add location record under platform key.
    pub fn with(mut self, key: impl Into<String>, location: impl Into<Location>) -> Self {
        self.0.insert(key.into(), location.into());
        self
    }

    /// Record that applies to target platform, with universal fallback.
    pub fn for_platform(&self, platform: Platform) -> Option<&Location> {
        platform
            .keys()
            .iter()
            .find_map(|key| self.0.get(*key))
            .or_else(|| self.0.get(UNIVERSAL_KEY))
    }
}

/// Absolute storage and system paths of one item.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PathPair {
    /// Path inside the storage root.
    pub storage: PathBuf,

    /// Path on the user's system.
    pub system: PathBuf,
}

/// Outcome of selecting an item's location for a platform.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Resolution {
    /// Item applies to the platform.
    Applicable(PathPair),

    /// Item has no location for the platform and should be skipped.
    NotApplicable,
}

/// Select and resolve item location for target platform.
///
/// # Errors
///
/// - Return [`SelectError::UnsupportedPlatform`] if `platform` is not
///   recognized.
/// - Return [`SelectError::Path`] if selected record cannot be resolved.
pub fn select_for_platform(
    locations: &ItemLocations,
    storage_root: impl AsRef<Path>,
    platform: impl AsRef<str>,
) -> Result<Resolution> {
    let platform: Platform = platform.as_ref().parse()?;
    match locations.for_platform(platform) {
        Some(location) if !location.is_empty() => {
            Ok(Resolution::Applicable(location.resolve(storage_root)?))
        }
        _ => Ok(Resolution::NotApplicable),
    }
}

/// Location selection error types.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum SelectError {
    /// Platform identifier is not recognized.
    #[error("unsupported platform {platform:?}")]
    UnsupportedPlatform { platform: String },

    /// Selected location record cannot be resolved.
    #[error(transparent)]
    Path(#[from] PathError),
}

/// Friendly result alias :3
pub type Result<T, E = SelectError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use sealed_test::prelude::*;
    use simple_test_case::test_case;

    #[test_case("linux", Platform::Linux; "linux")]
    #[test_case("darwin", Platform::Darwin; "darwin")]
    #[test_case("macos", Platform::Darwin; "macos alias")]
    #[test_case("windows", Platform::Windows; "windows")]
    #[test]
    fn parse_recognized_platform(raw: &str, expect: Platform) {
        assert_eq!(raw.parse::<Platform>(), Ok(expect));
    }

    #[cfg(any(target_os = "linux", target_os = "macos"))]
    #[test]
    fn current_platform_round_trips_through_display() -> anyhow::Result<()> {
        let current = Platform::current()?;
        assert_eq!(current.to_string().parse::<Platform>(), Ok(current));
        Ok(())
    }

    #[sealed_test(env = [("HOME", "/home/u")])]
    fn select_combined_location() -> anyhow::Result<()> {
        let locations = ItemLocations::new()
            .with("linux", "$LOCATION/nvim:~/.config/nvim")
            .with("darwin", "$LOCATION/nvim:~/Library/nvim");

        let result = select_for_platform(&locations, "/store", "linux")?;
        let expect = Resolution::Applicable(PathPair {
            storage: "/store/nvim".into(),
            system: "/home/u/.config/nvim".into(),
        });
        assert_eq!(result, expect);

        let result = select_for_platform(&locations, "/store", "darwin")?;
        let expect = Resolution::Applicable(PathPair {
            storage: "/store/nvim".into(),
            system: "/home/u/Library/nvim".into(),
        });
        assert_eq!(result, expect);

        Ok(())
    }

    #[sealed_test(env = [("HOME", "/home/u")])]
    fn select_pair_location() -> anyhow::Result<()> {
        let locations = ItemLocations::new().with(
            "linux",
            Location::Pair {
                local: "~/.gitconfig".into(),
                remote: "git/config".into(),
            },
        );

        let result = select_for_platform(&locations, "/store", "linux")?;
        let expect = Resolution::Applicable(PathPair {
            storage: "/store/git/config".into(),
            system: "/home/u/.gitconfig".into(),
        });
        assert_eq!(result, expect);

        Ok(())
    }

    #[test]
    fn select_falls_back_to_universal() -> anyhow::Result<()> {
        let locations = ItemLocations::new().with("universal", "$LOCATION/hosts:/etc/hosts");

        let result = select_for_platform(&locations, "/store", "windows")?;
        let expect = Resolution::Applicable(PathPair {
            storage: "/store/hosts".into(),
            system: "/etc/hosts".into(),
        });
        assert_eq!(result, expect);

        Ok(())
    }

    #[test]
    fn select_empty_location_is_not_applicable() -> anyhow::Result<()> {
        let locations = ItemLocations::new()
            .with("linux", "")
            .with("universal", "$LOCATION/hosts:/etc/hosts")
            .with("darwin", "$LOCATION/a:/b");

        // Explicitly blank record does not fall back to universal.
        assert_eq!(
            select_for_platform(&locations, "/store", "linux")?,
            Resolution::NotApplicable
        );

        let locations = ItemLocations::new().with("darwin", "$LOCATION/a:/b");
        assert_eq!(
            select_for_platform(&locations, "/store", "linux")?,
            Resolution::NotApplicable
        );

        Ok(())
    }

    #[test]
    fn select_unsupported_platform() {
        let locations = ItemLocations::new().with("linux", "$LOCATION/a:/b");
        let result = select_for_platform(&locations, "/store", "plan9");
        assert_eq!(
            result,
            Err(SelectError::UnsupportedPlatform {
                platform: "plan9".into()
            })
        );
    }

    #[test]
    fn select_malformed_location() {
        let locations = ItemLocations::new().with("linux", "/only/one/segment");
        let result = select_for_platform(&locations, "/store", "linux");
        assert!(matches!(
            result,
            Err(SelectError::Path(PathError::MalformedLocation { .. }))
        ));

        let locations = ItemLocations::new().with(
            "linux",
            Location::Pair {
                local: "/etc/hosts".into(),
                remote: String::new(),
            },
        );
        let result = select_for_platform(&locations, "/store", "linux");
        assert!(matches!(
            result,
            Err(SelectError::Path(PathError::MalformedLocation { .. }))
        ));
    }
}
