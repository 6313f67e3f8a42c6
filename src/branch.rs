//! Run branch and per-iteration checkpoints
//!
//! A run works on its own branch `<prefix>/<run_id>`, created from HEAD. Each
//! iteration's changes live inside a [`BranchTransaction`]: committed as one
//! commit when they verify, reset away otherwise.

use crate::git_ops::{self, RepoLock};
use anyhow::{bail, Context, Result};
use git2::Oid;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

#[derive(Debug)]
pub struct RunBranch {
    repo_root: PathBuf,
    name: String,
    base: Oid,
    commits: Vec<String>,
    _lock: RepoLock,
}

impl RunBranch {
    /// Lock the repository, check the tree is clean and switch to a fresh
    /// run branch.
    pub fn start(repo_root: &Path, prefix: &str, run_id: &str) -> Result<Self> {
        let lock = RepoLock::acquire(repo_root)?;
        let status = git_ops::current_status(repo_root)
            .with_context(|| format!("{} is not a usable git repository", repo_root.display()))?;
        if !status.is_clean() {
            let mut dirty: Vec<&str> = status
                .staged
                .iter()
                .chain(&status.modified)
                .chain(&status.untracked)
                .map(String::as_str)
                .collect();
            dirty.dedup();
            bail!(
                "Working tree has uncommitted changes ({}); commit or stash them first",
                dirty.join(", ")
            );
        }

        let base = git_ops::head_oid(repo_root)?;
        let name = git_ops::run_branch_name(prefix, run_id);
        git_ops::create_and_checkout_branch(repo_root, &name)?;
        info!("Working on branch {} (from {})", name, base);

        Ok(Self {
            repo_root: repo_root.to_path_buf(),
            name,
            base,
            commits: Vec::new(),
            _lock: lock,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn base(&self) -> Oid {
        self.base
    }

    /// Commits made by successful iterations, oldest first.
    pub fn commits(&self) -> &[String] {
        &self.commits
    }

    pub fn repo_root(&self) -> &Path {
        &self.repo_root
    }

    /// Checkpoint the current commit for `iteration`. The returned
    /// transaction borrows the branch, so only one can be open at a time.
    pub fn begin(&mut self, iteration: usize) -> Result<BranchTransaction<'_>> {
        let checkpoint = git_ops::head_oid(&self.repo_root)?;
        let untracked = git_ops::current_status(&self.repo_root)?
            .untracked
            .into_iter()
            .collect();
        Ok(BranchTransaction {
            branch: self,
            iteration,
            checkpoint,
            untracked_before: untracked,
            finished: false,
        })
    }
}

#[derive(Debug)]
pub struct BranchTransaction<'a> {
    branch: &'a mut RunBranch,
    iteration: usize,
    checkpoint: Oid,
    untracked_before: BTreeSet<String>,
    finished: bool,
}

impl BranchTransaction<'_> {
    /// Commit the iteration started from; `discard` resets to it.
    pub fn checkpoint(&self) -> Oid {
        self.checkpoint
    }

    /// Stage everything and record one commit for this iteration.
    pub fn commit(mut self) -> Result<String> {
        let root = self.branch.repo_root.clone();
        git_ops::stage_all(&root)?;
        let sha = git_ops::commit(&root, &format!("fixloop: iteration {}", self.iteration))?;
        info!("Committed iteration {} as {}", self.iteration, sha);
        self.branch.commits.push(sha.clone());
        self.finished = true;
        Ok(sha)
    }

    /// Reset to the checkpoint and delete files this iteration created.
    pub fn discard(mut self) -> Result<()> {
        self.finished = true;
        self.rollback()
    }

    fn rollback(&self) -> Result<()> {
        let root = &self.branch.repo_root;
        git_ops::hard_reset(root, self.checkpoint)?;
        let removed = git_ops::remove_untracked(root, &self.untracked_before)?;
        info!(
            "Discarded iteration {} ({} untracked files removed)",
            self.iteration,
            removed.len()
        );
        Ok(())
    }
}

impl Drop for BranchTransaction<'_> {
    fn drop(&mut self) {
        if !self.finished {
            if let Err(err) = self.rollback() {
                warn!("Failed to discard iteration {}: {:#}", self.iteration, err);
            }
        }
    }
}
