// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Path resolution utilities.
//!
//! Item locations are written by hand in the configuration file, so they can
//! contain `~`, environment variable references, and the `$LOCATION`
//! placeholder for the storage root. Everything in here turns those strings
//! into absolute, lexically clean paths.
//!
//! Resolution is purely lexical. Nothing is checked against the file system,
//! so a resolved path may or may not exist.

use std::{
    env::VarError,
    path::{Path, PathBuf},
};

/// Placeholder that expands to the storage root in the source segment of a
/// location string.
pub const LOCATION_PLACEHOLDER: &str = "$LOCATION";

/// Determine absolute path to user's home directory.
///
/// Does not check if the path returned actually exists.
///
/// # Errors
///
/// - Return [`PathError::HomeDirUnavailable`] if home directory path cannot
///   be determined.
pub fn home_dir() -> Result<PathBuf> {
    dirs::home_dir().ok_or(PathError::HomeDirUnavailable)
}

/// Default storage root when the configuration does not name one.
pub fn default_storage_dir() -> PathBuf {
    std::env::temp_dir().join("config-mapper")
}

/// Default absolute path to the configuration file, `~/.config-mapper.toml`.
///
/// # Errors
///
/// - Return [`PathError::HomeDirUnavailable`] if home directory path cannot
///   be determined.
pub fn default_config_path() -> Result<PathBuf> {
    Ok(home_dir()?.join(".config-mapper.toml"))
}

/// Resolve raw path string into absolute clean path.
///
/// The first `~` is replaced with the home directory. Every `/` separated
/// segment that contains a `$` is expanded as an environment variable
/// reference (`$VAR` or `${VAR}`). The result is always rooted, and goes
/// through [`clean`].
///
/// # Errors
///
/// - Return [`PathError::HomeDirUnavailable`] if `raw` contains `~` and the
///   home directory cannot be determined.
/// - Return [`PathError::InvalidEnvironmentVariable`] if a referenced
///   variable is unset or empty.
pub fn resolve_absolute(raw: impl AsRef<str>) -> Result<PathBuf> {
    let raw = raw.as_ref();
    let expanded = if raw.contains('~') {
        raw.replacen('~', home_dir()?.to_string_lossy().as_ref(), 1)
    } else {
        raw.to_owned()
    };

    let mut resolved = String::with_capacity(expanded.len());
    for segment in expanded.split('/') {
        resolved.push('/');
        if segment.contains('$') {
            resolved.push_str(&expand_segment(segment)?);
        } else {
            resolved.push_str(segment);
        }
    }

    Ok(clean(&resolved))
}

/// Split `"source:destination"` location string into resolved path pair.
///
/// Splits on the first `:`. The [`LOCATION_PLACEHOLDER`] in the source
/// segment is replaced by `storage_root` before both segments go through
/// [`resolve_absolute`].
///
/// # Errors
///
/// - Return [`PathError::MalformedLocation`] if either segment is missing.
/// - Return any error of [`resolve_absolute`].
pub fn split_source_destination(
    raw: impl AsRef<str>,
    storage_root: impl AsRef<Path>,
) -> Result<(PathBuf, PathBuf)> {
    let raw = raw.as_ref();
    let (source, destination) = raw
        .split_once(':')
        .filter(|(source, destination)| !source.is_empty() && !destination.is_empty())
        .ok_or_else(|| PathError::MalformedLocation {
            location: raw.to_owned(),
        })?;

    let source = source.replacen(
        LOCATION_PLACEHOLDER,
        storage_root.as_ref().to_string_lossy().as_ref(),
        1,
    );

    Ok((resolve_absolute(source)?, resolve_absolute(destination)?))
}

/// Lexically clean a `/` separated path.
///
/// Collapses repeated separators, drops `.` segments, and resolves `..`
/// against the preceding segment. A `..` at the root of a rooted path is
/// dropped. An empty result becomes `.` for relative input.
pub fn clean(path: &str) -> PathBuf {
    let rooted = path.starts_with('/');
    let mut parts: Vec<&str> = Vec::new();

    for segment in path.split('/') {
        match segment {
            "" | "." => continue,
            ".." => {
                if parts.last().is_some_and(|last| *last != "..") {
                    parts.pop();
                } else if !rooted {
                    parts.push("..");
                }
            }
            _ => parts.push(segment),
        }
    }

    let joined = parts.join("/");
    if rooted {
        PathBuf::from(format!("/{joined}"))
    } else if joined.is_empty() {
        PathBuf::from(".")
    } else {
        PathBuf::from(joined)
    }
}

fn expand_segment(segment: &str) -> Result<String> {
    shellexpand::env_with_context(segment, |name: &str| match std::env::var(name) {
        Ok(value) if !value.is_empty() => Ok(Some(value)),
        Ok(_) => Err(VarError::NotPresent),
        Err(error) => Err(error),
    })
    .map(|expanded| expanded.into_owned())
    .map_err(|error| PathError::InvalidEnvironmentVariable {
        segment: segment.to_owned(),
        var_name: error.var_name,
    })
}

/// Path resolution error types.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum PathError {
    /// No way to determine user's home directory.
    #[error("cannot determine absolute path to user's home directory")]
    HomeDirUnavailable,

    /// Path segment references unset or empty environment variable.
    #[error("invalid environment variable {var_name:?} in path segment {segment:?}")]
    InvalidEnvironmentVariable { segment: String, var_name: String },

    /// Location string is not formatted as "source:destination".
    #[error("location {location:?} must be formatted as \"source:destination\"")]
    MalformedLocation { location: String },
}

/// Friendly result alias :3
pub type Result<T, E = PathError> = std::result::Result<T, E>;
