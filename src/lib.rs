// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Keep configuration files in sync between machines.
//!
//! Configured __items__ (files or directories) are mirrored between their
//! place on the system and a __storage root__, which is usually a Git
//! repository. Saving copies items into storage, and loading copies them back
//! onto the system. Each item can live in a different place per platform.
//!
//! # See Also
//!
//! 1. [`items::Synchronizer`]
//! 2. [`config::Configuration`]

pub mod config;
pub mod copy;
pub mod index;
pub mod install;
pub mod items;
pub mod path;
pub mod platform;
pub mod repo;
