//! Workspace checkpoints for rolling back a failed work phase.
//!
//! A checkpoint records `HEAD`, a `git stash create` snapshot of tracked
//! changes and the set of untracked files. Rollback resets to `HEAD`,
//! re-applies the snapshot and deletes only untracked files created after
//! the checkpoint. Directories that are not git work trees cannot be
//! checkpointed.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use tracing::{debug, info, warn};

/// Identity for the dangling snapshot commit only.
const SNAPSHOT_IDENTITY: [&str; 4] = [
    "-c",
    "user.name=phaserun",
    "-c",
    "user.email=phaserun@localhost",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Checkpoint {
    Git {
        head: Option<String>,
        snapshot: Option<String>,
        untracked: BTreeSet<String>,
    },
    /// Not a git work tree.
    Unavailable,
}

/// A task's working directory.
#[derive(Debug, Clone)]
pub struct Workspace {
    root: PathBuf,
}

impl Workspace {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    async fn git(&self, args: &[&str]) -> Result<String> {
        let output = tokio::process::Command::new("git")
            .current_dir(&self.root)
            .args(args)
            .output()
            .await
            .with_context(|| format!("Failed to run git {}", args.first().unwrap_or(&"")))?;
        if !output.status.success() {
            bail!(
                "git {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    pub async fn is_git(&self) -> bool {
        self.git(&["rev-parse", "--is-inside-work-tree"])
            .await
            .is_ok_and(|out| out == "true")
    }

    async fn untracked(&self) -> Result<BTreeSet<String>> {
        let out = self
            .git(&["ls-files", "--others", "--exclude-standard"])
            .await?;
        Ok(out.lines().map(str::to_string).collect())
    }

    /// Records the current state of the workspace.
    pub async fn checkpoint(&self) -> Result<Checkpoint> {
        if !self.is_git().await {
            debug!(workspace = %self.root.display(), "Workspace is not a git work tree");
            return Ok(Checkpoint::Unavailable);
        }
        let head = self.git(&["rev-parse", "HEAD"]).await.ok();
        let snapshot = match head {
            Some(_) => {
                let mut args = SNAPSHOT_IDENTITY.to_vec();
                args.extend(["stash", "create", "phaserun checkpoint"]);
                let sha = self.git(&args).await.context("Failed to snapshot workspace")?;
                (!sha.is_empty()).then_some(sha)
            }
            None => None,
        };
        let untracked = self.untracked().await?;
        debug!(?head, ?snapshot, untracked = untracked.len(), "Workspace checkpoint taken");
        Ok(Checkpoint::Git {
            head,
            snapshot,
            untracked,
        })
    }

    /// Restores `checkpoint`. Returns false when it cannot be restored.
    pub async fn rollback(&self, checkpoint: &Checkpoint) -> Result<bool> {
        let Checkpoint::Git {
            head,
            snapshot,
            untracked,
        } = checkpoint
        else {
            warn!(workspace = %self.root.display(), "Workspace is not a git work tree; rollback unavailable");
            return Ok(false);
        };

        if let Some(head) = head {
            self.git(&["reset", "--hard", "--quiet", head]).await?;
        }
        for path in self.untracked().await?.difference(untracked) {
            let full = self.root.join(path);
            if let Err(e) = tokio::fs::remove_file(&full).await {
                warn!(path = %full.display(), "Failed to remove file created by the work phase: {}", e);
            }
        }
        if let Some(snapshot) = snapshot {
            self.git(&["stash", "apply", "--quiet", snapshot])
                .await
                .context("Failed to re-apply workspace snapshot")?;
        }
        info!(workspace = %self.root.display(), "Workspace rolled back to checkpoint");
        Ok(true)
    }

    /// Files that differ from the checkpoint, relative to the workspace.
    pub async fn changed_files(&self, checkpoint: &Checkpoint) -> Vec<String> {
        let Checkpoint::Git {
            head,
            snapshot,
            untracked,
        } = checkpoint
        else {
            return Vec::new();
        };

        let mut changed = BTreeSet::new();
        if let Some(base) = snapshot.as_ref().or(head.as_ref()) {
            match self.git(&["diff", "--name-only", base]).await {
                Ok(out) => changed.extend(out.lines().map(str::to_string)),
                Err(e) => warn!("Failed to diff workspace: {:#}", e),
            }
        }
        if let Ok(now) = self.untracked().await {
            changed.extend(now.difference(untracked).cloned());
        }
        changed.into_iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn git(dir: &Path, args: &[&str]) {
        let status = std::process::Command::new("git")
            .current_dir(dir)
            .args(["-c", "user.name=test", "-c", "user.email=test@example.com"])
            .args(args)
            .output()
            .unwrap()
            .status;
        assert!(status.success(), "git {args:?} failed");
    }

    fn repo() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        git(dir.path(), &["init", "-q"]);
        fs::write(dir.path().join("tracked.txt"), "original\n").unwrap();
        git(dir.path(), &["add", "."]);
        git(dir.path(), &["commit", "-q", "-m", "init"]);
        dir
    }

    #[tokio::test]
    async fn test_rollback_restores_checkpoint() {
        let dir = repo();
        let root = dir.path();
        fs::write(root.join("tracked.txt"), "edited before\n").unwrap();
        fs::write(root.join("notes.txt"), "mine\n").unwrap();

        let ws = Workspace::new(root);
        let checkpoint = ws.checkpoint().await.unwrap();
        assert!(matches!(checkpoint, Checkpoint::Git { .. }));

        fs::write(root.join("tracked.txt"), "broken by work\n").unwrap();
        fs::write(root.join("new.rs"), "fn main() {}\n").unwrap();
        assert_eq!(
            ws.changed_files(&checkpoint).await,
            vec!["new.rs".to_string(), "tracked.txt".to_string()]
        );

        assert!(ws.rollback(&checkpoint).await.unwrap());
        assert_eq!(
            fs::read_to_string(root.join("tracked.txt")).unwrap(),
            "edited before\n"
        );
        assert!(root.join("notes.txt").exists());
        assert!(!root.join("new.rs").exists());
    }

    #[tokio::test]
    async fn test_clean_tree_rollback() {
        let dir = repo();
        let ws = Workspace::new(dir.path());
        let checkpoint = ws.checkpoint().await.unwrap();
        fs::write(dir.path().join("tracked.txt"), "changed\n").unwrap();
        assert!(ws.rollback(&checkpoint).await.unwrap());
        assert_eq!(
            fs::read_to_string(dir.path().join("tracked.txt")).unwrap(),
            "original\n"
        );
    }

    #[tokio::test]
    async fn test_plain_directory_cannot_roll_back() {
        let dir = tempfile::tempdir().unwrap();
        let ws = Workspace::new(dir.path());
        let checkpoint = ws.checkpoint().await.unwrap();
        assert_eq!(checkpoint, Checkpoint::Unavailable);
        assert!(!ws.rollback(&checkpoint).await.unwrap());
        assert!(ws.changed_files(&checkpoint).await.is_empty());
    }
}
