//! Versioned snapshot store.
//!
//! The data directory is a git working copy synchronised with an optional
//! remote. Every write-side git operation (clone, pull, commit, push) runs
//! under one mutex per store, since concurrent git commands on one working
//! tree corrupt the index.
//!
//! Commits are made one path at a time with a message derived from the path:
//!
//! | Path | Message |
//! |------|---------|
//! | `snapshot/<env>/<host>/<app>.json` | `<app>, deployed to <env> env (<host>).` / `removed from` |
//! | `config/path/...` | `Search path added.` / `modified.` / `removed.` |
//! | anything else | `Configuration change detected.` |

use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::sync::{Mutex, MutexGuard};

use anyhow::{anyhow, bail, Context, Result};
use tracing::{debug, info, warn};

use crate::catalog::{SEARCH_PATH_DIR, SNAPSHOT_DIR};
use crate::config::StoreConfig;

/// Identity recorded on commits and merges.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Committer {
    pub name: String,
    pub email: String,
}

/// How a working-tree path differs from `HEAD`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Untracked,
    Modified,
    Missing,
}

/// Working-tree changes, as paths relative to the store root.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PendingChanges {
    pub untracked: Vec<String>,
    pub modified: Vec<String>,
    pub missing: Vec<String>,
}

impl PendingChanges {
    pub fn is_empty(&self) -> bool {
        self.untracked.is_empty() && self.modified.is_empty() && self.missing.is_empty()
    }

    pub fn len(&self) -> usize {
        self.untracked.len() + self.modified.len() + self.missing.len()
    }

    /// Untracked, then modified, then missing.
    pub fn ordered(&self) -> impl Iterator<Item = (ChangeKind, &str)> {
        let untracked = self.untracked.iter().map(|p| (ChangeKind::Untracked, p.as_str()));
        let modified = self.modified.iter().map(|p| (ChangeKind::Modified, p.as_str()));
        let missing = self.missing.iter().map(|p| (ChangeKind::Missing, p.as_str()));
        untracked.chain(modified).chain(missing)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    NoRemote,
    /// Nothing has been committed yet.
    NothingToPush,
    Pushed,
    /// The remote has diverged; local commits stay until the next pull
    /// merges the remote tip.
    Rejected,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitSummary {
    pub messages: Vec<String>,
    pub push: PushOutcome,
}

/// Commit message for one changed path (`/`-separated, relative to root).
pub fn commit_message(kind: ChangeKind, path: &str) -> String {
    let parts: Vec<&str> = path.split('/').collect();
    if parts.len() == 4 && parts[0] == SNAPSHOT_DIR {
        let app = parts[3].strip_suffix(".json").unwrap_or(parts[3]);
        let verb = match kind {
            ChangeKind::Missing => "removed from",
            ChangeKind::Untracked | ChangeKind::Modified => "deployed to",
        };
        return format!("{}, {} {} env ({}).", app, verb, parts[1], parts[2]);
    }
    if path.starts_with(&format!("{}/", SEARCH_PATH_DIR)) {
        return match kind {
            ChangeKind::Untracked => "Search path added.",
            ChangeKind::Modified => "Search path modified.",
            ChangeKind::Missing => "Search path removed.",
        }
        .to_string();
    }
    "Configuration change detected.".to_string()
}

/// Parse `git status --porcelain -z` output.
fn parse_porcelain(out: &str) -> PendingChanges {
    let mut changes = PendingChanges::default();
    let mut entries = out.split('\0').filter(|e| !e.is_empty());
    while let Some(entry) = entries.next() {
        if entry.len() < 4 {
            continue;
        }
        let (status, path) = entry.split_at(3);
        let status = status.as_bytes();
        let (x, y) = (status[0], status[1]);
        if x == b'R' || x == b'C' {
            // Renames carry their original path as the next entry.
            entries.next();
        }
        let path = path.to_string();
        if x == b'?' {
            changes.untracked.push(path);
        } else if x == b'D' || y == b'D' {
            changes.missing.push(path);
        } else {
            changes.modified.push(path);
        }
    }
    changes
}

fn is_non_fast_forward(stderr: &str) -> bool {
    ["non-fast-forward", "[rejected]", "fetch first", "Updates were rejected"]
        .iter()
        .any(|marker| stderr.contains(marker))
}

/// Non-interactive git with untranslated messages, so stderr can be matched.
fn git_command(dir: &Path, args: &[&str]) -> Command {
    let mut command = Command::new("git");
    command
        .args(args)
        .current_dir(dir)
        .env("GIT_TERMINAL_PROMPT", "0")
        .env("LC_ALL", "C");
    command
}

pub struct SnapshotStore {
    root: PathBuf,
    remote: Option<String>,
    branch: String,
    committer: Committer,
    lock: Mutex<()>,
}

impl SnapshotStore {
    pub fn new(root: impl Into<PathBuf>, remote: Option<String>, branch: impl Into<String>, committer: Committer) -> Self {
        Self {
            root: root.into(),
            remote: remote.filter(|r| !r.trim().is_empty()),
            branch: branch.into(),
            committer,
            lock: Mutex::new(()),
        }
    }

    pub fn from_config(config: &StoreConfig, data_dir: &Path) -> Self {
        Self::new(
            data_dir,
            config.remote.clone(),
            config.branch.clone(),
            Committer {
                name: config.committer_name.clone(),
                email: config.committer_email.clone(),
            },
        )
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn has_remote(&self) -> bool {
        self.remote.is_some()
    }

    fn guard(&self) -> Result<MutexGuard<'_, ()>> {
        self.lock
            .lock()
            .map_err(|_| anyhow!("snapshot store lock poisoned"))
    }

    fn command(&self, dir: &Path, args: &[&str]) -> Result<Output> {
        git_command(dir, args)
            .output()
            .with_context(|| format!("Failed to execute 'git {}'. Is git installed?", args.join(" ")))
    }

    fn git(&self, args: &[&str]) -> Result<String> {
        self.run(args, args[0])
    }

    fn run(&self, args: &[&str], subcommand: &str) -> Result<String> {
        let output = self.command(&self.root, args)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!("git {} failed: {}", subcommand, stderr.trim());
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Run git with the committer identity configured for this invocation.
    fn git_as_committer(&self, args: &[&str]) -> Result<String> {
        let name = format!("user.name={}", self.committer.name);
        let email = format!("user.email={}", self.committer.email);
        let mut full = vec!["-c", name.as_str(), "-c", email.as_str(), "-c", "commit.gpgsign=false"];
        full.extend_from_slice(args);
        self.run(&full, args[0])
    }

    fn ref_exists(&self, reference: &str) -> Result<bool> {
        let output = self.command(&self.root, &["rev-parse", "--verify", "--quiet", reference])?;
        Ok(output.status.success())
    }

    fn remote_ref(&self) -> String {
        format!("refs/remotes/origin/{}", self.branch)
    }

    /// Clone (or init without a remote) when the working copy is absent,
    /// otherwise pull.
    pub fn ensure_initialized(&self) -> Result<()> {
        let _guard = self.guard()?;
        if self.root.join(".git").exists() {
            self.pull_locked()?;
            return Ok(());
        }

        match &self.remote {
            Some(url) => {
                let parent = self.root.parent().unwrap_or(Path::new("."));
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create directory {}", parent.display()))?;
                let dest = self.root.to_string_lossy();
                info!(remote = %url, dest = %dest, "Cloning snapshot repository");
                let output = self.command(parent, &["clone", url.as_str(), dest.as_ref()])?;
                if !output.status.success() {
                    let stderr = String::from_utf8_lossy(&output.stderr);
                    bail!("git clone failed: {}", stderr.trim());
                }
                if self.ref_exists(&self.remote_ref())? {
                    let remote_branch = format!("origin/{}", self.branch);
                    self.git(&["checkout", "-q", "-B", &self.branch, &remote_branch])?;
                } else {
                    self.git(&["symbolic-ref", "HEAD", &format!("refs/heads/{}", self.branch)])?;
                }
            }
            None => {
                std::fs::create_dir_all(&self.root)
                    .with_context(|| format!("Failed to create directory {}", self.root.display()))?;
                info!(dest = %self.root.display(), "Initialising local snapshot repository");
                self.git(&["init", "-q"])?;
                self.git(&["symbolic-ref", "HEAD", &format!("refs/heads/{}", self.branch)])?;
            }
        }
        Ok(())
    }

    /// Fetch and, when the remote tip is not part of local history, merge
    /// it. Returns whether remote content was applied.
    pub fn pull(&self) -> Result<bool> {
        let _guard = self.guard()?;
        self.pull_locked()
    }

    fn pull_locked(&self) -> Result<bool> {
        if self.remote.is_none() {
            return Ok(false);
        }
        self.git(&["fetch", "-q", "origin"])?;
        if !self.ref_exists(&self.remote_ref())? {
            debug!(branch = %self.branch, "remote branch does not exist yet");
            return Ok(false);
        }

        let remote_branch = format!("origin/{}", self.branch);
        if self.ref_exists("HEAD")? {
            let output = self.command(&self.root, &["merge-base", "--is-ancestor", &remote_branch, "HEAD"])?;
            match output.status.code() {
                Some(0) => return Ok(false),
                Some(1) => {}
                _ => {
                    let stderr = String::from_utf8_lossy(&output.stderr);
                    bail!("git merge-base failed: {}", stderr.trim());
                }
            }
        }

        info!(remote = %remote_branch, "Merging remote changes");
        self.git_as_committer(&["merge", "-q", "--no-edit", &remote_branch])?;
        Ok(true)
    }

    /// Untracked, modified and missing paths in the working tree.
    pub fn pending_changes(&self) -> Result<PendingChanges> {
        let _guard = self.guard()?;
        self.pending_changes_locked()
    }

    fn pending_changes_locked(&self) -> Result<PendingChanges> {
        let out = self.git(&["status", "--porcelain", "-z", "--untracked-files=all"])?;
        Ok(parse_porcelain(&out))
    }

    /// Commit every pending path separately, then push when a remote is
    /// configured. A non-fast-forward rejection is not an error.
    pub fn commit_pending_changes(&self) -> Result<CommitSummary> {
        let _guard = self.guard()?;
        let changes = self.pending_changes_locked()?;

        let mut messages = Vec::with_capacity(changes.len());
        for (kind, path) in changes.ordered() {
            let message = commit_message(kind, path);
            // Application names may contain glob characters.
            self.run(&["--literal-pathspecs", "add", "-A", "--", path], "add")?;
            self.git_as_committer(&["commit", "-q", "-m", &message])?;
            info!(path, message = %message, "Committed change");
            messages.push(message);
        }

        let push = match &self.remote {
            Some(url) if self.ref_exists("HEAD")? => self.push_locked(url)?,
            Some(_) => PushOutcome::NothingToPush,
            None => PushOutcome::NoRemote,
        };
        Ok(CommitSummary { messages, push })
    }

    fn push_locked(&self, url: &str) -> Result<PushOutcome> {
        if self.command(&self.root, &["remote", "get-url", "origin"])?.status.success() {
            self.git(&["remote", "set-url", "origin", url])?;
        } else {
            self.git(&["remote", "add", "origin", url])?;
        }
        self.git(&["config", &format!("branch.{}.remote", self.branch), "origin"])?;
        self.git(&[
            "config",
            &format!("branch.{}.merge", self.branch),
            &format!("refs/heads/{}", self.branch),
        ])?;

        let refspec = format!("HEAD:refs/heads/{}", self.branch);
        let output = self.command(&self.root, &["push", "-q", "origin", &refspec])?;
        if output.status.success() {
            debug!(branch = %self.branch, "pushed");
            return Ok(PushOutcome::Pushed);
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        if is_non_fast_forward(&stderr) {
            warn!(
                branch = %self.branch,
                "Push rejected as non-fast-forward; local commits kept until the next pull"
            );
            return Ok(PushOutcome::Rejected);
        }
        bail!("git push failed: {}", stderr.trim())
    }
}
