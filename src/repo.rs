// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Version control of the storage root.
//!
//! The storage root is a regular Git repository with a working tree. Saving
//! stages and commits everything in it, then pushes the current branch to
//! `origin`. Loading can fetch and fast-forward the current branch first.
//!
//! # Authentication
//!
//! Remote operations try a list of [`CredentialStrategy`] in order. A strategy
//! is only abandoned when the remote rejects its credentials. Any other error
//! stops the operation right away. The last strategy is usually
//! [`CredentialStrategy::Default`], which asks the SSH agent, Git credential
//! helpers, and finally the user through an interactive prompt.

use auth_git2::{GitAuthenticator, Prompter};
use git2::{
    build::{CheckoutBuilder, RepoBuilder},
    Commit, Config, ErrorClass, ErrorCode, FetchOptions, IndexAddOption, PushOptions,
    RemoteCallbacks, Repository, Signature,
};
use indicatif::{ProgressBar, ProgressStyle};
use inquire::{Password, Text};
use std::{
    fmt::{Display, Formatter, Result as FmtResult},
    path::{Path, PathBuf},
    time,
};
use tracing::{debug, info, instrument, warn};

/// Name of the remote that storage is published to.
pub const REMOTE_NAME: &str = "origin";

/// Layer of indirection for storage version control.
pub trait RepositoryActions {
    /// Stage every change in the working tree, and commit it.
    ///
    /// Does nothing if the staged tree matches the current commit.
    fn stage_and_commit(&self, message: &str) -> Result<()>;

    /// Push current branch to remote.
    fn push(&self) -> Result<()>;

    /// Fetch remote, and fast-forward current branch to it.
    fn pull(&self) -> Result<()>;

    /// Fetch remote, and report whether its branch moved.
    fn fetch_has_changes(&self) -> Result<bool>;
}

/// One way of answering a remote's request for credentials.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CredentialStrategy {
    /// Private SSH key file with optional passphrase.
    SshKey {
        private_key: PathBuf,
        passphrase: Option<String>,
    },

    /// Plain username and password.
    Basic { username: String, password: String },

    /// SSH agent, credential helpers, then interactive prompt.
    Default,
}

impl CredentialStrategy {
    fn authenticator(&self, prompter: IndicatifPrompter) -> GitAuthenticator {
        match self {
            Self::SshKey {
                private_key,
                passphrase,
            } => GitAuthenticator::new_empty()
                .add_ssh_key_from_file(private_key.clone(), passphrase.clone()),
            Self::Basic { username, password } => GitAuthenticator::new_empty()
                .add_plaintext_credentials("*", username.clone(), password.clone()),
            Self::Default => GitAuthenticator::default().set_prompter(prompter),
        }
    }
}

impl Display for CredentialStrategy {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        match self {
            Self::SshKey { private_key, .. } => {
                write!(fmt, "ssh key {:?}", private_key.display())
            }
            Self::Basic { username, .. } => write!(fmt, "basic auth as {username:?}"),
            Self::Default => fmt.write_str("default credentials"),
        }
    }
}

/// Storage repository through libgit2.
pub struct Git2Repository {
    repository: Repository,
    strategies: Vec<CredentialStrategy>,
    signature: Option<(String, String)>,
    prompter: IndicatifPrompter,
}

impl Git2Repository {
    /// Open existing repository at target path.
    ///
    /// An empty strategy list falls back to [`CredentialStrategy::Default`].
    ///
    /// # Errors
    ///
    /// - Return [`RepoError::Git2`] if path is not a repository.
    #[instrument(skip(path, strategies), level = "debug")]
    pub fn open(path: impl AsRef<Path>, strategies: Vec<CredentialStrategy>) -> Result<Self> {
        debug!("open storage repository: {:?}", path.as_ref().display());
        let repository = Repository::open(path.as_ref())?;

        Ok(Self {
            repository,
            strategies: or_default(strategies),
            signature: None,
            prompter: IndicatifPrompter::new(ProgressBar::hidden()),
        })
    }

    /// Clone remote repository into target path.
    ///
    /// The progress of the clone is displayed through a progress bar. If any
    /// credentials must be prompted for, the progress bar is suspended for
    /// user input.
    ///
    /// # Errors
    ///
    /// - Return [`RepoError::Authentication`] if every strategy is rejected.
    /// - Return [`RepoError::Git2`] if libgit2 operations fail.
    /// - Return [`RepoError::IndicatifStyleTemplate`] if the progress bar
    ///   style is invalid.
    #[instrument(skip(url, path, strategies, bar), level = "debug")]
    pub fn clone_remote(
        url: impl AsRef<str>,
        path: impl AsRef<Path>,
        strategies: Vec<CredentialStrategy>,
        bar: ProgressBar,
    ) -> Result<Self> {
        let style = ProgressStyle::with_template(
            "{elapsed_precise:.green}  {msg:<50}  [{wide_bar:.yellow/blue}]",
        )?
        .progress_chars("-Cco.");
        bar.set_style(style);
        bar.set_message(url.as_ref().to_string());
        bar.enable_steady_tick(time::Duration::from_millis(100));

        info!("clone {:?} into {:?}", url.as_ref(), path.as_ref().display());
        let strategies = or_default(strategies);
        let prompter = IndicatifPrompter::new(bar.clone());
        let config = Config::open_default()?;

        let repository = with_strategies(&strategies, &prompter, |authenticator| {
            let mut throttle = time::Instant::now();
            let mut callbacks = RemoteCallbacks::new();
            callbacks.credentials(authenticator.credentials(&config));
            callbacks.transfer_progress(|progress| {
                if throttle.elapsed() > time::Duration::from_millis(10) {
                    throttle = time::Instant::now();
                    bar.set_length(progress.total_objects() as u64);
                    bar.set_position(progress.received_objects() as u64);
                }
                true
            });

            let mut options = FetchOptions::new();
            options.remote_callbacks(callbacks);
            let mut builder = RepoBuilder::new();
            builder.fetch_options(options);
            let cloned = builder.clone(url.as_ref(), path.as_ref());
            cloned
        })?;
        bar.finish_and_clear();

        Ok(Self {
            repository,
            strategies,
            signature: None,
            prompter: IndicatifPrompter::new(ProgressBar::hidden()),
        })
    }

    /// Commit as target author instead of Git configuration's identity.
    pub fn with_signature(mut self, name: impl Into<String>, email: impl Into<String>) -> Self {
        self.signature = Some((name.into(), email.into()));
        self
    }

    fn signature(&self) -> Result<Signature<'static>> {
        match &self.signature {
            Some((name, email)) => Ok(Signature::now(name, email)?),
            None => Ok(self.repository.signature()?),
        }
    }

    fn current_branch(&self) -> Result<String> {
        let head = self.repository.find_reference("HEAD")?;
        head.symbolic_target()
            .and_then(|target| target.strip_prefix("refs/heads/"))
            .map(ToOwned::to_owned)
            .ok_or(RepoError::DetachedHead)
    }

    fn head_commit(&self) -> Option<Commit<'_>> {
        self.repository
            .head()
            .ok()
            .and_then(|head| head.peel_to_commit().ok())
    }

    fn fetch_branch(&self, branch: &str) -> Result<()> {
        let refspec = format!("refs/heads/{branch}:refs/remotes/{REMOTE_NAME}/{branch}");
        let config = self.repository.config()?;

        with_strategies(&self.strategies, &self.prompter, |authenticator| {
            let mut callbacks = RemoteCallbacks::new();
            callbacks.credentials(authenticator.credentials(&config));

            let mut options = FetchOptions::new();
            options.remote_callbacks(callbacks);
            let mut remote = self.repository.find_remote(REMOTE_NAME)?;
            remote.fetch(&[refspec.as_str()], Some(&mut options), None)
        })
    }
}

impl std::fmt::Debug for Git2Repository {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        fmt.debug_struct("Git2Repository")
            .field("path", &self.repository.path())
            .field("strategies", &self.strategies)
            .finish()
    }
}

impl RepositoryActions for Git2Repository {
    #[instrument(skip(self, message), level = "debug")]
    fn stage_and_commit(&self, message: &str) -> Result<()> {
        let mut index = self.repository.index()?;
        index.add_all(["*"].iter(), IndexAddOption::DEFAULT, None)?;
        index.update_all(["*"].iter(), None)?;
        index.write()?;
        let tree_oid = index.write_tree()?;

        // INVARIANT: Never create empty commits.
        let parent = self.head_commit();
        let unchanged = match &parent {
            Some(parent) => parent.tree_id() == tree_oid,
            None => index.is_empty(),
        };
        if unchanged {
            info!("no storage changes to commit");
            return Ok(());
        }

        let tree = self.repository.find_tree(tree_oid)?;
        let signature = self.signature()?;
        let parents = parent.iter().collect::<Vec<_>>();
        let oid = self.repository.commit(
            Some("HEAD"),
            &signature,
            &signature,
            message,
            &tree,
            &parents,
        )?;
        info!("committed storage changes as {oid}");

        Ok(())
    }

    #[instrument(skip(self), level = "debug")]
    fn push(&self) -> Result<()> {
        let branch = self.current_branch()?;
        let refspec = format!("refs/heads/{branch}:refs/heads/{branch}");
        let config = self.repository.config()?;

        with_strategies(&self.strategies, &self.prompter, |authenticator| {
            let mut callbacks = RemoteCallbacks::new();
            callbacks.credentials(authenticator.credentials(&config));
            callbacks.push_update_reference(|refname, status| match status {
                Some(message) => Err(git2::Error::from_str(&format!(
                    "remote rejected {refname}: {message}"
                ))),
                None => Ok(()),
            });

            let mut options = PushOptions::new();
            options.remote_callbacks(callbacks);
            let mut remote = self.repository.find_remote(REMOTE_NAME)?;
            remote.push(&[refspec.as_str()], Some(&mut options))
        })?;
        info!("pushed {branch} to {REMOTE_NAME}");

        Ok(())
    }

    #[instrument(skip(self), level = "debug")]
    fn pull(&self) -> Result<()> {
        let branch = self.current_branch()?;
        self.fetch_branch(&branch)?;

        let tracking = format!("refs/remotes/{REMOTE_NAME}/{branch}");
        let remote_oid = self.repository.refname_to_id(&tracking)?;
        let remote_commit = self.repository.find_annotated_commit(remote_oid)?;
        let (analysis, _) = self.repository.merge_analysis(&[&remote_commit])?;

        if analysis.is_up_to_date() {
            debug!("{branch} already up to date");
            return Ok(());
        }

        if !(analysis.is_fast_forward() || analysis.is_unborn()) {
            return Err(RepoError::Diverged { branch });
        }

        let refname = format!("refs/heads/{branch}");
        match self.repository.find_reference(&refname) {
            Ok(mut reference) => {
                reference.set_target(remote_oid, "fast-forward")?;
            }
            Err(_) => {
                self.repository
                    .reference(&refname, remote_oid, true, "fast-forward")?;
            }
        }
        self.repository.set_head(&refname)?;

        let mut checkout = CheckoutBuilder::new();
        checkout.force();
        self.repository.checkout_head(Some(&mut checkout))?;
        info!("fast-forwarded {branch} to {remote_oid}");

        Ok(())
    }

    #[instrument(skip(self), level = "debug")]
    fn fetch_has_changes(&self) -> Result<bool> {
        let branch = self.current_branch()?;
        let tracking = format!("refs/remotes/{REMOTE_NAME}/{branch}");

        let before = self.repository.refname_to_id(&tracking).ok();
        self.fetch_branch(&branch)?;
        let after = self.repository.refname_to_id(&tracking).ok();
        debug!("{tracking}: {before:?} -> {after:?}");

        Ok(before != after)
    }
}

fn or_default(strategies: Vec<CredentialStrategy>) -> Vec<CredentialStrategy> {
    if strategies.is_empty() {
        vec![CredentialStrategy::Default]
    } else {
        strategies
    }
}

fn is_auth_error(error: &git2::Error) -> bool {
    error.code() == ErrorCode::Auth || error.class() == ErrorClass::Ssh
}

fn with_strategies<T>(
    strategies: &[CredentialStrategy],
    prompter: &IndicatifPrompter,
    mut operation: impl FnMut(&GitAuthenticator) -> Result<T, git2::Error>,
) -> Result<T> {
    let mut rejected = None;
    for strategy in strategies {
        debug!("authenticate with {strategy}");
        let authenticator = strategy.authenticator(prompter.clone());
        match operation(&authenticator) {
            Ok(value) => return Ok(value),
            Err(error) if is_auth_error(&error) => {
                warn!("{strategy} rejected: {error}");
                rejected = Some(error);
            }
            Err(error) => return Err(error.into()),
        }
    }

    Err(match rejected {
        Some(source) => RepoError::Authentication { source },
        None => RepoError::NoCredentialStrategy,
    })
}

/// Git2 authentication prompter for progress bar.
#[derive(Debug, Clone)]
pub struct IndicatifPrompter {
    bar: ProgressBar,
}

impl IndicatifPrompter {
    /// Construct new progress bar authenticator.
    pub fn new(bar: ProgressBar) -> Self {
        Self { bar }
    }
}

impl Prompter for IndicatifPrompter {
    #[instrument(skip(self, url, _config), level = "debug")]
    fn prompt_username_password(
        &mut self,
        url: &str,
        _config: &git2::Config,
    ) -> Option<(String, String)> {
        info!("authentication required at {url}");
        self.bar.suspend(|| {
            let username = Text::new("username").prompt().ok()?;
            let password = Password::new("password")
                .without_confirmation()
                .prompt()
                .ok()?;
            Some((username, password))
        })
    }

    #[instrument(skip(self, username, url, _config), level = "debug")]
    fn prompt_password(
        &mut self,
        username: &str,
        url: &str,
        _config: &git2::Config,
    ) -> Option<String> {
        info!("authentication required at {url} for user {username}");
        self.bar.suspend(|| {
            Password::new("password")
                .without_confirmation()
                .prompt()
                .ok()
        })
    }

    #[instrument(skip(self, ssh_key_path, _config), level = "debug")]
    fn prompt_ssh_key_passphrase(
        &mut self,
        ssh_key_path: &Path,
        _config: &git2::Config,
    ) -> Option<String> {
        info!(
            "passphrase required for ssh key at {}",
            ssh_key_path.display()
        );
        self.bar.suspend(|| {
            Password::new("passphrase")
                .without_confirmation()
                .prompt()
                .ok()
        })
    }
}

/// Repository error types.
#[derive(Debug, thiserror::Error)]
pub enum RepoError {
    /// Every credential strategy was rejected by the remote.
    #[error("remote rejected every credential strategy")]
    Authentication {
        #[source]
        source: git2::Error,
    },

    /// No credential strategy to try.
    #[error("no credential strategy available")]
    NoCredentialStrategy,

    /// HEAD does not point at a branch.
    #[error("HEAD of storage repository is not on a branch")]
    DetachedHead,

    /// Local branch has commits the remote lacks, so it cannot fast-forward.
    #[error("branch {branch:?} diverged from remote, cannot fast-forward")]
    Diverged { branch: String },

    /// Style template cannot be set for progress bars.
    #[error(transparent)]
    IndicatifStyleTemplate(#[from] indicatif::style::TemplateError),

    /// Operations from libgit2 fail.
    #[error(transparent)]
    Git2(#[from] git2::Error),
}

/// Friendly result alias :3
pub type Result<T, E = RepoError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::fs;
    use tempfile::tempdir;

    fn commit_count(repository: &Repository) -> anyhow::Result<usize> {
        let mut walk = repository.revwalk()?;
        walk.push_head()?;
        Ok(walk.count())
    }

    #[test]
    fn stage_and_commit_skips_unchanged_tree() -> anyhow::Result<()> {
        let dir = tempdir()?;
        Repository::init(dir.path())?;
        let repo = Git2Repository::open(dir.path(), Vec::new())?.with_signature("Jo", "jo@x.org");

        // Empty working tree has nothing to commit.
        repo.stage_and_commit("nothing")?;
        assert!(repo.head_commit().is_none());

        fs::write(dir.path().join("rc"), "a")?;
        repo.stage_and_commit("add rc")?;
        repo.stage_and_commit("add rc again")?;
        assert_eq!(commit_count(&repo.repository)?, 1);

        let head = repo.head_commit().map(|c| c.message().map(ToOwned::to_owned));
        assert_eq!(head, Some(Some("add rc".to_string())));

        Ok(())
    }

    #[test]
    fn stage_and_commit_records_deletions() -> anyhow::Result<()> {
        let dir = tempdir()?;
        Repository::init(dir.path())?;
        let repo = Git2Repository::open(dir.path(), Vec::new())?.with_signature("Jo", "jo@x.org");

        fs::write(dir.path().join("a"), "a")?;
        fs::write(dir.path().join("b"), "b")?;
        repo.stage_and_commit("add a and b")?;
        fs::remove_file(dir.path().join("b"))?;
        repo.stage_and_commit("remove b")?;

        let tree = repo.head_commit().map(|c| c.tree()).transpose()?;
        let names = tree
            .iter()
            .flat_map(|tree| tree.iter())
            .filter_map(|entry| entry.name().map(ToOwned::to_owned))
            .collect::<Vec<_>>();
        assert_eq!(names, vec!["a".to_string()]);

        Ok(())
    }

    #[test]
    fn push_without_remote_fails() -> anyhow::Result<()> {
        let dir = tempdir()?;
        Repository::init(dir.path())?;
        let repo = Git2Repository::open(dir.path(), Vec::new())?.with_signature("Jo", "jo@x.org");
        fs::write(dir.path().join("a"), "a")?;
        repo.stage_and_commit("add a")?;

        assert!(matches!(repo.push(), Err(RepoError::Git2(_))));

        Ok(())
    }

    #[test]
    fn with_strategies_moves_on_after_rejection() {
        let strategies = vec![
            CredentialStrategy::Basic {
                username: "a".into(),
                password: "b".into(),
            },
            CredentialStrategy::Default,
        ];
        let prompter = IndicatifPrompter::new(ProgressBar::hidden());

        let mut attempts = 0;
        let result = with_strategies(&strategies, &prompter, |_| {
            attempts += 1;
            if attempts == 1 {
                Err(git2::Error::new(ErrorCode::Auth, ErrorClass::Http, "denied"))
            } else {
                Ok(attempts)
            }
        });
        assert!(matches!(result, Ok(2)));
    }

    #[test]
    fn with_strategies_stops_on_other_errors() {
        let strategies = vec![CredentialStrategy::Default, CredentialStrategy::Default];
        let prompter = IndicatifPrompter::new(ProgressBar::hidden());

        let mut attempts = 0;
        let result: Result<()> = with_strategies(&strategies, &prompter, |_| {
            attempts += 1;
            Err(git2::Error::from_str("network down"))
        });
        assert!(matches!(result, Err(RepoError::Git2(_))));
        assert_eq!(attempts, 1);
    }

    #[test]
    fn with_strategies_reports_final_rejection() {
        let strategies = vec![CredentialStrategy::Default];
        let prompter = IndicatifPrompter::new(ProgressBar::hidden());

        let result: Result<()> = with_strategies(&strategies, &prompter, |_| {
            Err(git2::Error::new(ErrorCode::Auth, ErrorClass::Ssh, "denied"))
        });
        assert!(matches!(result, Err(RepoError::Authentication { .. })));
    }
}
