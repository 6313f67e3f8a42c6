//! Git operations for the run branch
//!
//! Branch, stage, commit and reset through libgit2, plus the advisory lock
//! that keeps two runs off the same working tree.

use anyhow::{Context, Result};
use fs2::FileExt;
use git2::{build::CheckoutBuilder, IndexAddOption, Oid, Repository, ResetType, Signature, StatusOptions};
use std::collections::BTreeSet;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

const LOCK_FILE: &str = "fixloop.lock";

/// Status of the working directory
#[derive(Debug, Clone, Default)]
pub struct GitStatus {
    pub branch: String,
    pub staged: Vec<String>,
    pub modified: Vec<String>,
    pub untracked: Vec<String>,
}

impl GitStatus {
    pub fn is_clean(&self) -> bool {
        self.staged.is_empty() && self.modified.is_empty() && self.untracked.is_empty()
    }
}

/// Get the current git status (ignored files excluded)
pub fn current_status(repo_path: &Path) -> Result<GitStatus> {
    let repo = Repository::open(repo_path)?;

    let head = repo.head().context("Failed to get HEAD")?;
    let branch = head.shorthand().unwrap_or("detached").to_string();

    let mut status = GitStatus {
        branch,
        ..Default::default()
    };

    let mut opts = StatusOptions::new();
    opts.include_untracked(true)
        .recurse_untracked_dirs(true)
        .include_ignored(false);
    let statuses = repo.statuses(Some(&mut opts))?;

    for entry in statuses.iter() {
        let path = entry.path().unwrap_or("").to_string();
        let s = entry.status();

        if s.is_index_new() || s.is_index_modified() || s.is_index_deleted() {
            status.staged.push(path.clone());
        }
        if s.is_wt_modified() || s.is_wt_deleted() {
            status.modified.push(path.clone());
        }
        if s.is_wt_new() {
            status.untracked.push(path);
        }
    }

    Ok(status)
}

pub fn head_oid(repo_path: &Path) -> Result<Oid> {
    let repo = Repository::open(repo_path)?;
    let commit = repo
        .head()
        .context("Failed to get HEAD")?
        .peel_to_commit()
        .context("HEAD does not point at a commit")?;
    Ok(commit.id())
}

/// Create a new branch from current HEAD
pub fn create_branch(repo_path: &Path, name: &str) -> Result<()> {
    let repo = Repository::open(repo_path)?;
    let head = repo.head()?;
    let commit = head.peel_to_commit()?;

    repo.branch(name, &commit, false)
        .context(format!("Failed to create branch '{}'", name))?;

    Ok(())
}

/// Checkout an existing branch
pub fn checkout_branch(repo_path: &Path, name: &str) -> Result<()> {
    let repo = Repository::open(repo_path)?;

    let (object, reference) = repo
        .revparse_ext(name)
        .context(format!("Branch '{}' not found", name))?;

    repo.checkout_tree(&object, None)?;

    match reference {
        Some(r) => repo.set_head(r.name().unwrap_or("HEAD"))?,
        None => repo.set_head_detached(object.id())?,
    }

    Ok(())
}

/// Create branch and checkout in one step
pub fn create_and_checkout_branch(repo_path: &Path, name: &str) -> Result<()> {
    create_branch(repo_path, name)?;
    checkout_branch(repo_path, name)?;
    Ok(())
}

/// `<prefix>/<run_id>`, with the prefix slugified the way git likes it.
pub fn run_branch_name(prefix: &str, run_id: &str) -> String {
    let slug: String = prefix
        .to_lowercase()
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '/' || c == '_' {
                c
            } else {
                '-'
            }
        })
        .collect::<String>()
        .split('/')
        .map(|part| part.trim_matches('-'))
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join("/");
    let slug = if slug.is_empty() {
        "fixloop".to_string()
    } else {
        slug
    };
    format!("{}/{}", slug, run_id)
}

/// Stage every change in the working tree, deletions included.
pub fn stage_all(repo_path: &Path) -> Result<()> {
    let repo = Repository::open(repo_path)?;
    let mut index = repo.index()?;

    index.add_all(["*"].iter(), IndexAddOption::DEFAULT, None)?;
    index.update_all(["*"].iter(), None)?;
    index.write()?;

    Ok(())
}

/// Commit staged changes on HEAD
pub fn commit(repo_path: &Path, message: &str) -> Result<String> {
    let repo = Repository::open(repo_path)?;
    let mut index = repo.index()?;

    let tree_id = index.write_tree()?;
    let tree = repo.find_tree(tree_id)?;

    let head = repo.head()?;
    let parent = head.peel_to_commit()?;

    // Get author info from git config
    let config = repo.config()?;
    let name = config
        .get_string("user.name")
        .unwrap_or_else(|_| "fixloop".to_string());
    let email = config
        .get_string("user.email")
        .unwrap_or_else(|_| "fixloop@local".to_string());

    let sig = Signature::now(&name, &email)?;

    let oid = repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &[&parent])?;

    Ok(oid.to_string())
}

/// Hard-reset the index and working tree to `oid`.
pub fn hard_reset(repo_path: &Path, oid: Oid) -> Result<()> {
    let repo = Repository::open(repo_path)?;
    let object = repo
        .find_object(oid, None)
        .context(format!("Commit {} not found", oid))?;
    let mut checkout = CheckoutBuilder::new();
    checkout.force();
    repo.reset(&object, ResetType::Hard, Some(&mut checkout))
        .context(format!("Failed to reset to {}", oid))?;
    Ok(())
}

/// Delete untracked (non-ignored) files not listed in `keep`, and the
/// directories they leave empty.
pub fn remove_untracked(repo_path: &Path, keep: &BTreeSet<String>) -> Result<Vec<PathBuf>> {
    let status = current_status(repo_path)?;
    let root = repo_path
        .canonicalize()
        .context("Failed to resolve repository root")?;
    let mut removed = Vec::new();
    for rel in status.untracked.into_iter().filter(|p| !keep.contains(p)) {
        let path = root.join(&rel);
        if path.is_dir() {
            fs::remove_dir_all(&path)
                .with_context(|| format!("Failed to remove {}", path.display()))?;
        } else if path.exists() {
            fs::remove_file(&path)
                .with_context(|| format!("Failed to remove {}", path.display()))?;
        }
        let mut parent = path.parent();
        while let Some(dir) = parent {
            if dir == root.as_path() || fs::remove_dir(dir).is_err() {
                break;
            }
            parent = dir.parent();
        }
        removed.push(PathBuf::from(rel));
    }
    Ok(removed)
}

/// Add `entry` to `.git/info/exclude` unless already present.
pub fn ensure_excluded(repo_path: &Path, entry: &str) -> Result<()> {
    let repo = Repository::open(repo_path)?;
    let exclude_path = repo.path().join("info").join("exclude");
    if let Some(parent) = exclude_path.parent() {
        fs::create_dir_all(parent)?;
    }
    let existing = fs::read_to_string(&exclude_path).unwrap_or_default();
    if existing.lines().any(|line| line.trim() == entry) {
        return Ok(());
    }
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&exclude_path)?;
    if !existing.is_empty() && !existing.ends_with('\n') {
        writeln!(file)?;
    }
    writeln!(file, "{}", entry)?;
    Ok(())
}

/// Exclusive advisory lock on `.git/fixloop.lock`, released on drop.
#[derive(Debug)]
pub struct RepoLock {
    file: fs::File,
    path: PathBuf,
}

impl RepoLock {
    pub fn acquire(repo_path: &Path) -> Result<Self> {
        let repo = Repository::open(repo_path)?;
        let path = repo.path().join(LOCK_FILE);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .with_context(|| format!("Failed to open {}", path.display()))?;
        FileExt::try_lock_exclusive(&file).with_context(|| {
            format!(
                "Another fixloop run holds {}; refusing to share the working tree",
                path.display()
            )
        })?;
        Ok(Self { file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RepoLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::init_repo;
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_branch_commit_and_reset_cycle() {
        let root = tempdir().unwrap();
        init_repo(root.path(), &[("a.txt", "one\n"), ("b.txt", "two\n")]);

        create_and_checkout_branch(root.path(), "fixloop/run-1").unwrap();
        assert_eq!(current_status(root.path()).unwrap().branch, "fixloop/run-1");
        let before = head_oid(root.path()).unwrap();

        fs::write(root.path().join("a.txt"), "uno\n").unwrap();
        fs::remove_file(root.path().join("b.txt")).unwrap();
        fs::write(root.path().join("c.txt"), "tres\n").unwrap();
        stage_all(root.path()).unwrap();
        commit(root.path(), "fixloop: iteration 1").unwrap();
        assert!(current_status(root.path()).unwrap().is_clean());

        hard_reset(root.path(), before).unwrap();
        remove_untracked(root.path(), &BTreeSet::new()).unwrap();
        assert_eq!(fs::read_to_string(root.path().join("a.txt")).unwrap(), "one\n");
        assert!(root.path().join("b.txt").exists());
        assert!(!root.path().join("c.txt").exists());
    }

    #[test]
    fn test_remove_untracked_cleans_new_dirs() {
        let root = tempdir().unwrap();
        init_repo(root.path(), &[("a.txt", "one\n")]);
        fs::create_dir_all(root.path().join("new/deep")).unwrap();
        fs::write(root.path().join("new/deep/x.py"), "x = 1\n").unwrap();

        remove_untracked(root.path(), &BTreeSet::new()).unwrap();
        assert!(!root.path().join("new").exists());
        assert!(current_status(root.path()).unwrap().is_clean());
    }

    #[test]
    fn test_run_branch_name() {
        assert_eq!(run_branch_name("FixLoop", "abc"), "fixloop/abc");
        assert_eq!(run_branch_name("ci fixes/", "r1"), "ci-fixes/r1");
        assert_eq!(run_branch_name("", "r1"), "fixloop/r1");
    }

    #[test]
    fn test_repo_lock_is_exclusive() {
        let root = tempdir().unwrap();
        init_repo(root.path(), &[("a.txt", "one\n")]);
        let lock = RepoLock::acquire(root.path()).unwrap();
        assert!(lock.path().ends_with("fixloop.lock"));
        assert!(RepoLock::acquire(root.path()).is_err());
        drop(lock);
        assert!(RepoLock::acquire(root.path()).is_ok());
    }

    #[test]
    fn test_ensure_excluded_is_idempotent() {
        let root = tempdir().unwrap();
        init_repo(root.path(), &[("a.txt", "one\n")]);
        ensure_excluded(root.path(), "/.fixloop/").unwrap();
        ensure_excluded(root.path(), "/.fixloop/").unwrap();
        let exclude = fs::read_to_string(root.path().join(".git/info/exclude")).unwrap();
        assert_eq!(exclude.matches("/.fixloop/").count(), 1);
    }
}
